//! In-memory collaborators for tests: a recording cluster client, a
//! recording chart engine, and a staging store with a hand-cranked agent.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value as Json;

use flotilla_core::{ClusterId, DeliveryError, DeliveryResult, FeatureId};

use crate::{object_ref, AgentReport, ChartEngine, ChartSource, ClusterClient, ObjectRef, StagedSet, StagingStore};
use flotilla_core::HelmChartSpec;

#[derive(Default)]
struct FailPlan {
    // key -> (error, remaining failures; u32::MAX = always)
    map: HashMap<String, (DeliveryError, u32)>,
}

impl FailPlan {
    fn check(&mut self, key: &str) -> Option<DeliveryError> {
        if let Some((err, remaining)) = self.map.get_mut(key) {
            if *remaining == u32::MAX {
                return Some(err.clone());
            }
            if *remaining > 0 {
                *remaining -= 1;
                return Some(err.clone());
            }
        }
        None
    }
}

#[derive(Default)]
struct ClientState {
    objects: BTreeMap<(String, String), Json>,
    fail_apply: FailPlan,
    fail_delete: FailPlan,
    apply_calls: u64,
    delete_calls: u64,
    get_calls: u64,
}

/// Fake remote cluster: holds applied objects in memory, records call
/// counts, and injects failures per object key.
#[derive(Clone, Default)]
pub struct RecordingClient {
    state: Arc<Mutex<ClientState>>,
}

impl RecordingClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_apply(&self, key: &str, err: DeliveryError) {
        self.state.lock().unwrap().fail_apply.map.insert(key.to_string(), (err, u32::MAX));
    }

    /// Fail the first `n` applies for this key, then succeed.
    pub fn fail_apply_n(&self, key: &str, err: DeliveryError, n: u32) {
        self.state.lock().unwrap().fail_apply.map.insert(key.to_string(), (err, n));
    }

    pub fn fail_delete(&self, key: &str, err: DeliveryError) {
        self.state.lock().unwrap().fail_delete.map.insert(key.to_string(), (err, u32::MAX));
    }

    /// Object present on any cluster.
    pub fn has(&self, key: &str) -> bool {
        self.state.lock().unwrap().objects.keys().any(|(_, k)| k == key)
    }

    pub fn has_on(&self, cluster: &ClusterId, key: &str) -> bool {
        self.state.lock().unwrap().objects.contains_key(&(cluster.to_string(), key.to_string()))
    }

    /// Drop an object behind the engine's back (external drift).
    pub fn drift_remove(&self, cluster: &ClusterId, key: &str) {
        self.state.lock().unwrap().objects.remove(&(cluster.to_string(), key.to_string()));
    }

    pub fn apply_calls(&self) -> u64 {
        self.state.lock().unwrap().apply_calls
    }

    pub fn mutation_calls(&self) -> u64 {
        let s = self.state.lock().unwrap();
        s.apply_calls + s.delete_calls
    }
}

#[async_trait]
impl ClusterClient for RecordingClient {
    async fn get(&self, cluster: &ClusterId, object: &ObjectRef) -> DeliveryResult<Option<Json>> {
        let mut s = self.state.lock().unwrap();
        s.get_calls += 1;
        Ok(s.objects.get(&(cluster.to_string(), object.key())).cloned())
    }

    async fn apply(&self, cluster: &ClusterId, object: &Json) -> DeliveryResult<()> {
        let r = object_ref(object)?;
        let mut s = self.state.lock().unwrap();
        s.apply_calls += 1;
        if let Some(err) = s.fail_apply.check(&r.key()) {
            return Err(err);
        }
        s.objects.insert((cluster.to_string(), r.key()), object.clone());
        Ok(())
    }

    async fn delete(&self, cluster: &ClusterId, object: &ObjectRef) -> DeliveryResult<()> {
        let mut s = self.state.lock().unwrap();
        s.delete_calls += 1;
        if let Some(err) = s.fail_delete.check(&object.key()) {
            return Err(err);
        }
        match s.objects.remove(&(cluster.to_string(), object.key())) {
            Some(_) => Ok(()),
            None => Err(DeliveryError::NotFound(format!("no object {}", object.key()))),
        }
    }
}

/// A release as the fake chart engine sees it after install/upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledRelease {
    pub version: String,
    pub source: ChartSource,
    pub values: Option<String>,
}

#[derive(Default)]
struct ChartState {
    releases: BTreeMap<(String, String), InstalledRelease>,
    calls: Vec<String>,
    fail: FailPlan,
}

/// Fake chart engine: records install/upgrade/uninstall per release.
#[derive(Clone, Default)]
pub struct RecordingChartEngine {
    state: Arc<Mutex<ChartState>>,
}

impl RecordingChartEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_release(&self, release_key: &str, err: DeliveryError) {
        self.state.lock().unwrap().fail.map.insert(release_key.to_string(), (err, u32::MAX));
    }

    pub fn fail_release_n(&self, release_key: &str, err: DeliveryError, n: u32) {
        self.state.lock().unwrap().fail.map.insert(release_key.to_string(), (err, n));
    }

    pub fn release(&self, cluster: &ClusterId, release_key: &str) -> Option<InstalledRelease> {
        self.state.lock().unwrap().releases.get(&(cluster.to_string(), release_key.to_string())).cloned()
    }

    /// Chronological list like "install repo/chart/ns/name".
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().unwrap().calls.len()
    }
}

#[async_trait]
impl ChartEngine for RecordingChartEngine {
    async fn install(&self, cluster: &ClusterId, source: ChartSource, chart: &HelmChartSpec) -> DeliveryResult<()> {
        let key = chart.release_key();
        let mut s = self.state.lock().unwrap();
        s.calls.push(format!("install {}", key));
        if let Some(err) = s.fail.check(&key) {
            return Err(err);
        }
        s.releases.insert(
            (cluster.to_string(), key),
            InstalledRelease { version: chart.chart_version.clone(), source, values: chart.values.clone() },
        );
        Ok(())
    }

    async fn upgrade(&self, cluster: &ClusterId, source: ChartSource, chart: &HelmChartSpec) -> DeliveryResult<()> {
        let key = chart.release_key();
        let mut s = self.state.lock().unwrap();
        s.calls.push(format!("upgrade {}", key));
        if let Some(err) = s.fail.check(&key) {
            return Err(err);
        }
        let entry = s
            .releases
            .get_mut(&(cluster.to_string(), key.clone()))
            .ok_or_else(|| DeliveryError::Chart(format!("release not installed: {}", key)))?;
        entry.version = chart.chart_version.clone();
        entry.source = source;
        // Helm keeps previously supplied values unless explicitly changed.
        if chart.values.is_some() {
            entry.values = chart.values.clone();
        }
        Ok(())
    }

    async fn uninstall(&self, cluster: &ClusterId, release_namespace: &str, release_name: &str) -> DeliveryResult<()> {
        let mut s = self.state.lock().unwrap();
        s.calls.push(format!("uninstall {}/{}", release_namespace, release_name));
        let before = s.releases.len();
        s.releases.retain(|(c, k), _| {
            !(c == &cluster.to_string() && k.ends_with(&format!("/{}/{}", release_namespace, release_name)))
        });
        if s.releases.len() == before {
            return Err(DeliveryError::NotFound(format!("no release {}/{}", release_namespace, release_name)));
        }
        Ok(())
    }
}

#[derive(Default)]
struct StagingState {
    staged: HashMap<(ClusterId, FeatureId), StagedSet>,
    reports: HashMap<(ClusterId, FeatureId), AgentReport>,
}

/// In-memory staging store; tests play the agent by calling
/// `agent_complete`/`agent_fail`.
#[derive(Clone, Default)]
pub struct MemStaging {
    state: Arc<Mutex<StagingState>>,
}

impl MemStaging {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn staged_actions(&self, cluster: &ClusterId, feature: FeatureId) -> Option<Vec<crate::DeliveryAction>> {
        self.state
            .lock()
            .unwrap()
            .staged
            .get(&(cluster.clone(), feature))
            .map(|s| s.actions.clone())
    }

    /// Pretend the in-cluster agent fetched and applied the staged set.
    pub fn agent_complete(&self, cluster: &ClusterId, feature: FeatureId) {
        let mut s = self.state.lock().unwrap();
        if let Some(set) = s.staged.get(&(cluster.clone(), feature)) {
            let report = AgentReport { fingerprint: set.fingerprint.clone(), success: true, error: None };
            s.reports.insert((cluster.clone(), feature), report);
        }
    }

    pub fn agent_fail(&self, cluster: &ClusterId, feature: FeatureId, error: &str) {
        let mut s = self.state.lock().unwrap();
        if let Some(set) = s.staged.get(&(cluster.clone(), feature)) {
            let report = AgentReport {
                fingerprint: set.fingerprint.clone(),
                success: false,
                error: Some(error.to_string()),
            };
            s.reports.insert((cluster.clone(), feature), report);
        }
    }
}

#[async_trait]
impl StagingStore for MemStaging {
    async fn put(&self, set: StagedSet) -> DeliveryResult<()> {
        let mut s = self.state.lock().unwrap();
        s.staged.insert((set.cluster.clone(), set.feature), set);
        Ok(())
    }

    async fn latest_report(&self, cluster: &ClusterId, feature: FeatureId) -> DeliveryResult<Option<AgentReport>> {
        Ok(self.state.lock().unwrap().reports.get(&(cluster.clone(), feature)).cloned())
    }

    async fn clear(&self, cluster: &ClusterId, feature: FeatureId) -> DeliveryResult<()> {
        let mut s = self.state.lock().unwrap();
        s.staged.remove(&(cluster.clone(), feature));
        s.reports.remove(&(cluster.clone(), feature));
        Ok(())
    }
}
