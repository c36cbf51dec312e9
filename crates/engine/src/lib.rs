//! Flotilla reconciliation engine: record lifecycle, scheduling, status.
//!
//! One profile fans out into one deployment record per matched cluster;
//! each record carries an independent per-feature status state machine.
//! Records reconcile in parallel across clusters, serialized per record by
//! an in-memory lease; the record is mutated only by its lease holder.

#![forbid(unsafe_code)]

use std::sync::Mutex;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tracing::debug;

use flotilla_core::{DeploymentRecord, FeatureState, RecordKey, SyncMode};
use flotilla_inventory::ClusterCapability;
use flotilla_transport::RetryPolicy;

pub mod reconciler;
pub mod store;

pub use reconciler::{
    CancelHandle, CleanupController, LifecycleManager, MatchOutcome, OrphanReport, PassSummary,
    Reconciler, StaticSelector, StatusReporter, TransportSelector,
};
pub use store::{MemStore, RecordStore};

/// Engine tunables, environment-driven with code defaults.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Continuous mode re-runs drivers after this long even without a spec
    /// change, to catch external drift.
    pub drift_interval: Duration,
    pub retry: RetryPolicy,
    pub lease_ttl: Duration,
    pub workers: usize,
    /// Status commit attempts on optimistic-concurrency conflicts.
    pub status_attempts: u32,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let drift_secs = std::env::var("FLOTILLA_DRIFT_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(300);
        let lease_secs = std::env::var("FLOTILLA_LEASE_TTL_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(120);
        let workers = std::env::var("FLOTILLA_WORKERS")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(8);
        Self {
            drift_interval: Duration::from_secs(drift_secs),
            retry: RetryPolicy::from_env(),
            lease_ttl: Duration::from_secs(lease_secs),
            workers: workers.max(1),
            status_attempts: 4,
        }
    }

    /// Tight budgets, no sleeps; handy in tests.
    pub fn for_tests() -> Self {
        Self {
            drift_interval: Duration::from_secs(300),
            retry: RetryPolicy::immediate(3),
            lease_ttl: Duration::from_secs(120),
            workers: 4,
            status_attempts: 3,
        }
    }
}

/// Pause is a hard stop: while blocked, no mutating calls and no status
/// transitions for that record, Removed included. Reads and matching still
/// proceed elsewhere.
pub fn is_blocked(cluster: &dyn ClusterCapability) -> bool {
    cluster.paused()
}

/// Per-record lease guaranteeing at most one in-flight reconciliation per
/// (profile, cluster) pair, with a TTL guarding against abandoned holders.
pub struct LeaseMap {
    inner: Mutex<FxHashMap<RecordKey, Instant>>,
    ttl: Duration,
}

impl LeaseMap {
    pub fn new(ttl: Duration) -> Self {
        Self { inner: Mutex::new(FxHashMap::default()), ttl }
    }

    pub fn try_acquire(&self, key: &RecordKey) -> bool {
        let mut map = self.inner.lock().unwrap();
        let now = Instant::now();
        match map.get(key) {
            Some(held) if now.duration_since(*held) < self.ttl => false,
            _ => {
                map.insert(key.clone(), now);
                true
            }
        }
    }

    pub fn release(&self, key: &RecordKey) {
        self.inner.lock().unwrap().remove(key);
    }
}

/// Decide whether this pass must act on a record.
///
/// Once: a single provisioning pass per record lifetime, tracked by the
/// processed marker. Continuous: act when the spec generation moved past
/// what any feature observed, when any feature is still pending, in flight
/// or staged, or when the drift-check interval elapsed. A Failed feature is
/// a resting state: permanent errors are not re-attempted until the spec
/// generation moves or the next drift window opens.
pub fn should_reconcile(record: &DeploymentRecord, now_ts: i64, drift_interval: Duration) -> bool {
    if record.finalizing {
        return false;
    }
    match record.sync_mode {
        SyncMode::Once => !record.processed_once,
        SyncMode::Continuous => {
            let unsettled = record.status.values().any(|s| {
                s.is_staged()
                    || matches!(s.state, FeatureState::Pending | FeatureState::Provisioning)
            });
            if unsettled {
                return true;
            }
            if record
                .status
                .values()
                .any(|s| s.observed_generation < record.profile_generation)
            {
                return true;
            }
            // Only Provisioned features have state worth re-asserting; a
            // Failed feature's stale timestamp must not hold the check due.
            let oldest = record
                .status
                .values()
                .filter(|s| s.state == FeatureState::Provisioned)
                .map(|s| s.last_applied_ts)
                .min();
            let due = match oldest {
                Some(ts) => now_ts.saturating_sub(ts) >= drift_interval.as_secs() as i64,
                None => false,
            };
            if due {
                debug!(record = %record.key, "drift check due");
            }
            due
        }
    }
}
