//! Flotilla core types: profiles, cluster identity, deployment records.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Which inventory variant a cluster identity refers to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ClusterKind {
    /// Full cluster object registered in the management plane.
    Managed,
    /// Lightweight cluster registration (no machinery beyond a kubeconfig).
    Lite,
}

impl ClusterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterKind::Managed => "managed",
            ClusterKind::Lite => "lite",
        }
    }
}

/// Stable (kind, namespace, name) identity of a target cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClusterId {
    pub kind: ClusterKind,
    pub namespace: String,
    pub name: String,
}

impl ClusterId {
    pub fn new(kind: ClusterKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { kind, namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind.as_str(), self.namespace, self.name)
    }
}

/// How actions reach a cluster: direct remote mutation, or staged for an
/// in-cluster agent to fetch. A per-cluster property, never global.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum TransportMode {
    #[default]
    Push,
    Pull,
}

/// Reconciliation cadence for a profile.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Apply once; later passes are no-ops for the same record.
    Once,
    /// Re-reconcile on spec changes and on the periodic drift check.
    #[default]
    Continuous,
}

/// Desired action for a chart entry in the profile.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum HelmChartAction {
    #[default]
    Install,
    Uninstall,
}

/// One Helm release the profile wants managed on each matched cluster.
///
/// Identity for diffing is (repository_name, chart_name, release_namespace,
/// release_name); version, values and action are the mutable fields that
/// drive upgrade/removal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HelmChartSpec {
    pub repository_url: String,
    pub repository_name: String,
    pub chart_name: String,
    pub chart_version: String,
    pub release_name: String,
    pub release_namespace: String,
    /// Inline values YAML; participates in the digest so value edits drive
    /// an Upgrade. Upgrades keep previous values unless this changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<String>,
    #[serde(default)]
    pub action: HelmChartAction,
}

impl HelmChartSpec {
    /// Stable artifact key used to diff releases across passes.
    pub fn release_key(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.repository_name, self.chart_name, self.release_namespace, self.release_name
        )
    }

    /// Content digest over the mutable fields (URL, version, values).
    pub fn digest(&self) -> String {
        let mut h = Sha256::new();
        h.update(self.repository_url.as_bytes());
        h.update([0]);
        h.update(self.chart_version.as_bytes());
        h.update([0]);
        if let Some(v) = &self.values {
            h.update(v.as_bytes());
        }
        hex(&h.finalize())
    }

    /// Charts hosted in OCI registries resolve through a registry pull
    /// instead of a classic repository index fetch.
    pub fn is_oci(&self) -> bool {
        self.repository_url.starts_with("oci://")
    }
}

/// Reference to an external object holding raw manifest text, resolved
/// lazily by the renderer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct PolicyRef {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for PolicyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Label query selecting clusters from the inventory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Selector {
    /// Every entry must be present with an equal value.
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
    /// Every listed key must be present (any value).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_exists: Vec<String>,
}

impl Selector {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels.iter().all(|(k, v)| labels.get(k) == Some(v))
            && self.match_exists.iter().all(|k| labels.contains_key(k))
    }
}

/// Declarative description of target clusters and desired artifacts.
/// Owned externally; the engine only reads it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ProfileSpec {
    #[serde(default)]
    pub selector: Selector,
    #[serde(default)]
    pub sync_mode: SyncMode,
    #[serde(default)]
    pub helm_charts: Vec<HelmChartSpec>,
    #[serde(default)]
    pub policy_refs: Vec<PolicyRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Profile {
    pub name: String,
    /// Bumped by the owner on every spec edit.
    pub generation: u64,
    pub spec: ProfileSpec,
}

/// Deployable artifact categories tracked independently per record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FeatureId {
    Helm,
    Resources,
}

impl FeatureId {
    pub const ALL: [FeatureId; 2] = [FeatureId::Helm, FeatureId::Resources];

    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureId::Helm => "helm",
            FeatureId::Resources => "resources",
        }
    }
}

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum FeatureState {
    #[default]
    Pending,
    Provisioning,
    Provisioned,
    Failed,
    Removed,
}

impl FeatureState {
    /// Status moves only forward, except Provisioned/Failed may re-enter
    /// Provisioning on the next pass. Removed is terminal for the record.
    /// Pending may settle straight to Provisioned when the desired set is
    /// empty and there is nothing to deliver.
    pub fn can_transition(self, next: FeatureState) -> bool {
        use FeatureState::*;
        if self == next {
            return true;
        }
        match self {
            Pending => matches!(next, Provisioning | Provisioned | Removed),
            Provisioning => matches!(next, Provisioned | Failed | Removed),
            Provisioned | Failed => matches!(next, Provisioning | Removed),
            Removed => false,
        }
    }
}

/// Ordered map from artifact key to content digest: the last successfully
/// applied artifact set for one feature. The fingerprint is a hash over it;
/// the map itself is what drivers diff against.
pub type AppliedSet = BTreeMap<String, String>;

/// Content fingerprint of an applied set, for cheap drift comparison.
pub fn fingerprint(applied: &AppliedSet) -> String {
    let mut h = Sha256::new();
    for (k, v) in applied {
        h.update(k.as_bytes());
        h.update([0]);
        h.update(v.as_bytes());
        h.update([0]);
    }
    hex(&h.finalize())
}

/// Lowercase hex of a digest; shared by every content-hash site.
pub fn hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

/// Per-feature provisioning status, the sole observable contract other
/// tooling depends on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct FeatureStatus {
    pub state: FeatureState,
    /// First error encountered on the last failing pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Fingerprint of the last successfully applied artifact set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub applied: AppliedSet,
    /// Pull mode: fingerprint of the action set staged for the agent,
    /// cleared once the completion report is observed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staged_fingerprint: Option<String>,
    /// Profile generation this status was computed from.
    #[serde(default)]
    pub observed_generation: u64,
    /// Unix seconds of the last successful apply; drives the drift check.
    #[serde(default)]
    pub last_applied_ts: i64,
}

impl FeatureStatus {
    pub fn pending() -> Self {
        Self::default()
    }

    /// Staged for a pull agent, completion not yet observed.
    pub fn is_staged(&self) -> bool {
        self.staged_fingerprint.is_some()
    }
}

/// Key of a deployment record: one per matched (profile, cluster) pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordKey {
    pub profile: String,
    pub cluster: ClusterId,
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.profile, self.cluster)
    }
}

/// Per-(profile, cluster) execution and status record. Owned by the profile:
/// deleted when the profile goes away or the cluster drops out of the match
/// set, and only after cleanup drove every feature to Removed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentRecord {
    pub key: RecordKey,
    pub uid: String,
    /// Spec snapshot taken at the last reconciliation trigger.
    pub spec: ProfileSpec,
    pub profile_generation: u64,
    pub sync_mode: SyncMode,
    /// Optimistic-concurrency token owned by the record store.
    pub revision: u64,
    /// Once mode: set after the single provisioning pass ran.
    pub processed_once: bool,
    /// Deletion in progress; cleanup not yet complete.
    pub finalizing: bool,
    pub created_at: i64,
    pub status: BTreeMap<FeatureId, FeatureStatus>,
}

impl DeploymentRecord {
    pub fn new(profile: &Profile, cluster: ClusterId) -> Self {
        let mut status = BTreeMap::new();
        for f in FeatureId::ALL {
            status.insert(f, FeatureStatus::pending());
        }
        Self {
            key: RecordKey { profile: profile.name.clone(), cluster },
            uid: uuid::Uuid::new_v4().to_string(),
            spec: profile.spec.clone(),
            profile_generation: profile.generation,
            sync_mode: profile.spec.sync_mode,
            revision: 0,
            processed_once: false,
            finalizing: false,
            created_at: chrono::Utc::now().timestamp(),
            status,
        }
    }

    pub fn feature(&self, id: FeatureId) -> &FeatureStatus {
        // Every record is created with all features present.
        self.status.get(&id).expect("feature status present")
    }

    /// True once every feature reached Removed (cleanup finished).
    pub fn fully_removed(&self) -> bool {
        self.status.values().all(|s| s.state == FeatureState::Removed)
    }
}

/// Failure taxonomy shared by transports, drivers and the engine.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("connectivity: {0}")]
    Connectivity(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("render: {0}")]
    Render(String),
    #[error("chart: {0}")]
    Chart(String),
    #[error("validation: {0}")]
    Validation(String),
}

impl DeliveryError {
    /// Transient failures are retried with bounded backoff; permanent ones
    /// go straight to Failed until the desired spec changes.
    pub fn is_transient(&self) -> bool {
        matches!(self, DeliveryError::Connectivity(_) | DeliveryError::Conflict(_))
    }
}

pub type DeliveryResult<T> = Result<T, DeliveryError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn chart(version: &str) -> HelmChartSpec {
        HelmChartSpec {
            repository_url: "https://charts.example.com".into(),
            repository_name: "example".into(),
            chart_name: "vault".into(),
            chart_version: version.into(),
            release_name: "vault".into(),
            release_namespace: "vault".into(),
            values: None,
            action: HelmChartAction::Install,
        }
    }

    #[test]
    fn release_key_ignores_version() {
        assert_eq!(chart("1.6.0").release_key(), chart("1.5.0").release_key());
    }

    #[test]
    fn digest_tracks_version_and_values() {
        assert_ne!(chart("1.6.0").digest(), chart("1.5.0").digest());
        let mut with_values = chart("1.6.0");
        with_values.values = Some("replicas: 3".into());
        assert_ne!(chart("1.6.0").digest(), with_values.digest());
        assert_eq!(chart("1.6.0").digest(), chart("1.6.0").digest());
    }

    #[test]
    fn oci_scheme_detected() {
        let mut c = chart("1.6.0");
        assert!(!c.is_oci());
        c.repository_url = "oci://registry-1.docker.io/bitnamicharts".into();
        assert!(c.is_oci());
    }

    #[test]
    fn fingerprint_is_order_independent_and_content_sensitive() {
        let mut a = AppliedSet::new();
        a.insert("x".into(), "1".into());
        a.insert("y".into(), "2".into());
        let mut b = AppliedSet::new();
        b.insert("y".into(), "2".into());
        b.insert("x".into(), "1".into());
        assert_eq!(fingerprint(&a), fingerprint(&b));
        b.insert("y".into(), "3".into());
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn selector_matching() {
        let mut sel = Selector::default();
        sel.match_labels.insert("env".into(), "fv".into());
        sel.match_exists.push("region".into());

        let mut labels = BTreeMap::new();
        labels.insert("env".into(), "fv".into());
        assert!(!sel.matches(&labels));
        labels.insert("region".into(), "eu".into());
        assert!(sel.matches(&labels));
        labels.insert("env".into(), "prod".into());
        assert!(!sel.matches(&labels));
    }

    #[test]
    fn state_machine_is_forward_only() {
        use FeatureState::*;
        assert!(Pending.can_transition(Provisioning));
        // Empty desired set: nothing to deliver, settles directly.
        assert!(Pending.can_transition(Provisioned));
        assert!(Provisioning.can_transition(Provisioned));
        assert!(Provisioning.can_transition(Failed));
        assert!(Provisioned.can_transition(Provisioning));
        assert!(Failed.can_transition(Provisioning));
        assert!(Provisioned.can_transition(Removed));
        assert!(!Removed.can_transition(Provisioning));
        assert!(!Provisioned.can_transition(Pending));
        assert!(!Failed.can_transition(Provisioned));
    }

    #[test]
    fn new_record_starts_all_pending() {
        let profile = Profile { name: "p".into(), generation: 1, spec: ProfileSpec::default() };
        let rec = DeploymentRecord::new(&profile, ClusterId::new(ClusterKind::Managed, "default", "c1"));
        assert_eq!(rec.status.len(), FeatureId::ALL.len());
        assert!(rec.status.values().all(|s| s.state == FeatureState::Pending));
        assert!(!rec.fully_removed());
    }

    #[test]
    fn error_classification() {
        assert!(DeliveryError::Connectivity("timeout".into()).is_transient());
        assert!(DeliveryError::Conflict("rv changed".into()).is_transient());
        assert!(!DeliveryError::Render("bad yaml".into()).is_transient());
        assert!(!DeliveryError::Chart("no such chart".into()).is_transient());
        assert!(!DeliveryError::Validation("missing name".into()).is_transient());
    }
}
