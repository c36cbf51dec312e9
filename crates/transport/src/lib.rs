//! Flotilla delivery transports: direct push and agent-pull staging.
//!
//! Feature drivers compute actions without knowing how they reach the
//! cluster; the `Transport` chosen per cluster decides. Push applies
//! synchronously through a `ClusterClient`; Pull serializes the action set
//! into the management plane for an in-cluster agent to fetch, and the
//! feature stays Provisioning until the agent's completion report shows up.

#![forbid(unsafe_code)]

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use flotilla_core::{hex, ClusterId, DeliveryError, DeliveryResult, FeatureId, HelmChartSpec};

pub mod helm_cli;
pub mod kube_client;
pub mod mock;

/// Reference to one object on a target cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct ObjectRef {
    pub group: String,
    pub version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectRef {
    /// Stable artifact key used by the resources driver.
    pub fn key(&self) -> String {
        let gv = if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        };
        format!("{}/{}/{}/{}", gv, self.kind, self.namespace.as_deref().unwrap_or(""), self.name)
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Extract the target reference from a rendered object.
pub fn object_ref(obj: &Json) -> DeliveryResult<ObjectRef> {
    let api_version = obj
        .get("apiVersion")
        .and_then(|v| v.as_str())
        .ok_or_else(|| DeliveryError::Validation("object missing apiVersion".into()))?;
    let kind = obj
        .get("kind")
        .and_then(|v| v.as_str())
        .ok_or_else(|| DeliveryError::Validation("object missing kind".into()))?;
    let name = obj
        .get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| DeliveryError::Validation("object missing metadata.name".into()))?;
    let namespace = obj
        .get("metadata")
        .and_then(|m| m.get("namespace"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let (group, version) = match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    };
    Ok(ObjectRef { group, version, kind: kind.to_string(), namespace, name: name.to_string() })
}

/// One step of a delivery plan, already ordered by the driver
/// (removals first, then upgrades, then installs).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeliveryAction {
    Apply { object: Json },
    Delete { object: ObjectRef },
    HelmInstall(HelmChartSpec),
    HelmUpgrade(HelmChartSpec),
    HelmUninstall { release_namespace: String, release_name: String },
}

impl DeliveryAction {
    pub fn describe(&self) -> String {
        match self {
            DeliveryAction::Apply { object } => match object_ref(object) {
                Ok(r) => format!("apply {}", r),
                Err(_) => "apply <invalid>".into(),
            },
            DeliveryAction::Delete { object } => format!("delete {}", object),
            DeliveryAction::HelmInstall(c) => format!("helm install {}", c.release_key()),
            DeliveryAction::HelmUpgrade(c) => format!("helm upgrade {}", c.release_key()),
            DeliveryAction::HelmUninstall { release_namespace, release_name } => {
                format!("helm uninstall {}/{}", release_namespace, release_name)
            }
        }
    }
}

/// Outcome of one delivery attempt.
///
/// `completed` holds indices into the submitted action slice that were
/// applied before any failure; partial progress is preserved, never rolled
/// back. `staged` means the set was handed to a pull agent and nothing has
/// been applied yet.
#[derive(Debug, Clone, Default)]
pub struct DeliveryReport {
    pub completed: Vec<usize>,
    pub staged: bool,
    pub error: Option<DeliveryError>,
}

impl DeliveryReport {
    pub fn all(n: usize) -> Self {
        Self { completed: (0..n).collect(), staged: false, error: None }
    }
}

/// Delivery strategy, chosen per cluster at reconciliation time and
/// invisible to the drivers' diff logic.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver the ordered action set for one feature. `fingerprint` is the
    /// digest of the desired set, used to correlate pull completions.
    async fn deliver(
        &self,
        cluster: &ClusterId,
        feature: FeatureId,
        fingerprint: &str,
        actions: &[DeliveryAction],
    ) -> DeliveryResult<DeliveryReport>;

    /// Whether a previously staged set with this fingerprint has been
    /// applied by the agent. Push delivery is synchronous, so `true`.
    async fn completion(
        &self,
        cluster: &ClusterId,
        feature: FeatureId,
        fingerprint: &str,
    ) -> DeliveryResult<bool>;
}

/// Object-level operations against one target cluster.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get(&self, cluster: &ClusterId, object: &ObjectRef) -> DeliveryResult<Option<Json>>;
    async fn apply(&self, cluster: &ClusterId, object: &Json) -> DeliveryResult<()>;
    /// Deleting an absent object is idempotent success.
    async fn delete(&self, cluster: &ClusterId, object: &ObjectRef) -> DeliveryResult<()>;
}

/// Where a chart is resolved from; `oci://` repository URLs select the
/// registry pull path instead of a classic index fetch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChartSource {
    Repository,
    Oci,
}

pub fn chart_source(spec: &HelmChartSpec) -> ChartSource {
    if spec.is_oci() {
        ChartSource::Oci
    } else {
        ChartSource::Repository
    }
}

/// Chart operations, consumed as a black box. Install and Upgrade carry the
/// full spec (release name/namespace preserved, new version supplied);
/// Uninstall needs only the release coordinates. Install is ensure-present
/// (`upgrade --install` semantics): installing over an existing release
/// converges it instead of failing.
#[async_trait]
pub trait ChartEngine: Send + Sync {
    async fn install(&self, cluster: &ClusterId, source: ChartSource, chart: &HelmChartSpec) -> DeliveryResult<()>;
    async fn upgrade(&self, cluster: &ClusterId, source: ChartSource, chart: &HelmChartSpec) -> DeliveryResult<()>;
    /// Uninstalling an absent release is idempotent success.
    async fn uninstall(&self, cluster: &ClusterId, release_namespace: &str, release_name: &str) -> DeliveryResult<()>;
}

/// Bounded exponential backoff for transient failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base: Duration,
}

impl RetryPolicy {
    pub fn from_env() -> Self {
        let attempts = std::env::var("FLOTILLA_RETRY_ATTEMPTS")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(4);
        let base_ms = std::env::var("FLOTILLA_RETRY_BASE_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(200);
        Self { attempts: attempts.max(1), base: Duration::from_millis(base_ms) }
    }

    /// No sleeps, single-shot heavy retries; handy in tests.
    pub fn immediate(attempts: u32) -> Self {
        Self { attempts: attempts.max(1), base: Duration::ZERO }
    }
}

/// Run `f`, retrying transient errors with doubling backoff up to the
/// attempt budget. Permanent errors return immediately.
pub async fn retry_transient<T, F, Fut>(policy: &RetryPolicy, mut f: F) -> DeliveryResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = DeliveryResult<T>>,
{
    let mut delay = policy.base;
    let mut last = None;
    for attempt in 1..=policy.attempts {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() => {
                debug!(attempt, error = %e, "transient failure; backing off");
                metrics::counter!("transport_retries", 1u64);
                last = Some(e);
                if attempt < policy.attempts && !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
            }
            Err(e) => return Err(e),
        }
    }
    Err(last.unwrap_or_else(|| DeliveryError::Connectivity("retry budget exhausted".into())))
}

/// Direct remote mutation: every action applies synchronously from the
/// reconciler's perspective.
pub struct PushTransport<C, H> {
    client: C,
    charts: H,
    retry: RetryPolicy,
}

impl<C: ClusterClient, H: ChartEngine> PushTransport<C, H> {
    pub fn new(client: C, charts: H, retry: RetryPolicy) -> Self {
        Self { client, charts, retry }
    }

    async fn run_one(&self, cluster: &ClusterId, action: &DeliveryAction) -> DeliveryResult<()> {
        match action {
            DeliveryAction::Apply { object } => {
                retry_transient(&self.retry, || self.client.apply(cluster, object)).await
            }
            DeliveryAction::Delete { object } => {
                match retry_transient(&self.retry, || self.client.delete(cluster, object)).await {
                    Err(DeliveryError::NotFound(_)) => Ok(()),
                    other => other,
                }
            }
            DeliveryAction::HelmInstall(c) => {
                let source = chart_source(c);
                retry_transient(&self.retry, || self.charts.install(cluster, source, c)).await
            }
            DeliveryAction::HelmUpgrade(c) => {
                let source = chart_source(c);
                retry_transient(&self.retry, || self.charts.upgrade(cluster, source, c)).await
            }
            DeliveryAction::HelmUninstall { release_namespace, release_name } => {
                match retry_transient(&self.retry, || {
                    self.charts.uninstall(cluster, release_namespace, release_name)
                })
                .await
                {
                    Err(DeliveryError::NotFound(_)) => Ok(()),
                    other => other,
                }
            }
        }
    }
}

#[async_trait]
impl<C: ClusterClient, H: ChartEngine> Transport for PushTransport<C, H> {
    async fn deliver(
        &self,
        cluster: &ClusterId,
        feature: FeatureId,
        _fingerprint: &str,
        actions: &[DeliveryAction],
    ) -> DeliveryResult<DeliveryReport> {
        let t0 = std::time::Instant::now();
        let mut report = DeliveryReport::default();
        for (i, action) in actions.iter().enumerate() {
            match self.run_one(cluster, action).await {
                Ok(()) => report.completed.push(i),
                Err(e) => {
                    warn!(cluster = %cluster, feature = %feature, action = %action.describe(), error = %e, "delivery failed");
                    metrics::counter!("deliver_err", 1u64);
                    report.error = Some(e);
                    break;
                }
            }
        }
        metrics::histogram!("deliver_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        metrics::counter!("deliver_actions", report.completed.len() as u64);
        Ok(report)
    }

    async fn completion(&self, _cluster: &ClusterId, _feature: FeatureId, _fingerprint: &str) -> DeliveryResult<bool> {
        Ok(true)
    }
}

/// An action set staged in the management plane for the pull agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedSet {
    pub cluster: ClusterId,
    pub feature: FeatureId,
    pub fingerprint: String,
    pub actions: Vec<DeliveryAction>,
    pub staged_at: i64,
}

/// Completion report written back by the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentReport {
    pub fingerprint: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Management-plane storage for staged sets and agent reports.
#[async_trait]
pub trait StagingStore: Send + Sync {
    async fn put(&self, set: StagedSet) -> DeliveryResult<()>;
    async fn latest_report(&self, cluster: &ClusterId, feature: FeatureId) -> DeliveryResult<Option<AgentReport>>;
    /// Drop the staged set once cleanup no longer needs it.
    async fn clear(&self, cluster: &ClusterId, feature: FeatureId) -> DeliveryResult<()>;
}

/// Staged delivery: serialize the action set, let the in-cluster agent
/// fetch and apply it, then observe its completion report.
pub struct PullTransport<S> {
    store: S,
}

impl<S: StagingStore> PullTransport<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: StagingStore> Transport for PullTransport<S> {
    async fn deliver(
        &self,
        cluster: &ClusterId,
        feature: FeatureId,
        fingerprint: &str,
        actions: &[DeliveryAction],
    ) -> DeliveryResult<DeliveryReport> {
        let set = StagedSet {
            cluster: cluster.clone(),
            feature,
            fingerprint: fingerprint.to_string(),
            actions: actions.to_vec(),
            staged_at: chrono::Utc::now().timestamp(),
        };
        self.store.put(set).await?;
        metrics::counter!("deliver_staged", 1u64);
        debug!(cluster = %cluster, feature = %feature, count = actions.len(), "action set staged for agent");
        Ok(DeliveryReport { completed: Vec::new(), staged: true, error: None })
    }

    async fn completion(&self, cluster: &ClusterId, feature: FeatureId, fingerprint: &str) -> DeliveryResult<bool> {
        match self.store.latest_report(cluster, feature).await? {
            Some(r) if r.fingerprint == fingerprint => {
                if r.success {
                    Ok(true)
                } else {
                    Err(DeliveryError::Validation(
                        r.error.unwrap_or_else(|| "agent reported failure".into()),
                    ))
                }
            }
            _ => Ok(false),
        }
    }
}

/// Digest of a serialized action set; lets agents and tests correlate
/// staged payloads without shipping the full object graph.
pub fn actions_digest(actions: &[DeliveryAction]) -> String {
    let mut h = Sha256::new();
    for a in actions {
        // Serialization of our own enum cannot fail.
        let bytes = serde_json::to_vec(a).unwrap_or_default();
        h.update(&bytes);
        h.update([0]);
    }
    hex(&h.finalize())
}
