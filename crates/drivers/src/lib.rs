//! Flotilla feature drivers: diff desired artifacts against the last
//! applied set and execute the resulting plan through a transport.
//!
//! Every driver obeys the same discipline: removals first (to free
//! resource-name conflicts before re-creating), then upgrades, then
//! installs; partial progress is preserved per artifact, never rolled back;
//! transient failures were already retried by the transport, permanent ones
//! fail the feature until the spec changes.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value as Json;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use flotilla_core::{
    fingerprint, AppliedSet, ClusterId, DeliveryResult, FeatureId, FeatureState, FeatureStatus,
    PolicyRef, ProfileSpec,
};
use flotilla_transport::{DeliveryAction, Transport};

pub mod helm;
pub mod resources;

pub use helm::HelmDriver;
pub use resources::ResourcesDriver;

/// Resolves a policy reference into an ordered list of rendered objects.
/// Failures are permanent (a broken manifest does not fix itself).
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, policy: &PolicyRef) -> DeliveryResult<Vec<Json>>;
}

/// One artifact the spec currently wants, with the actions to take for
/// each diff outcome.
#[derive(Debug, Clone)]
pub struct DesiredEntry {
    pub key: String,
    pub digest: String,
    /// Issued when the key is absent from the last applied set.
    pub fresh: DeliveryAction,
    /// Issued when the key is present but the digest changed.
    pub update: DeliveryAction,
    /// Issued when the spec explicitly asks for removal.
    pub removal: DeliveryAction,
    pub explicit_remove: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepEffect {
    Set(String),
    Remove,
}

#[derive(Debug, Clone)]
pub struct PlanStep {
    pub key: String,
    pub action: DeliveryAction,
    pub effect: StepEffect,
}

/// Ordered action plan plus the applied set the plan converges to.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub steps: Vec<PlanStep>,
    pub desired: AppliedSet,
}

/// Diff desired entries against the last applied set.
///
/// `orphan_removal` derives the removal action for a key that is only known
/// from the applied set (present there, absent from the spec). An explicit
/// Uninstall for a key that was never applied is an idempotent no-op.
///
/// `refresh` re-asserts entries whose digest already matches, to restore
/// state changed behind the engine's back; install actions are
/// ensure-present, so re-issuing them is safe.
pub fn plan(
    entries: &[DesiredEntry],
    last: &AppliedSet,
    orphan_removal: &(dyn Fn(&str) -> Option<DeliveryAction> + Sync),
    refresh: bool,
) -> Plan {
    let mut desired = AppliedSet::new();
    let mut known: BTreeMap<&str, &DesiredEntry> = BTreeMap::new();
    for e in entries {
        known.insert(e.key.as_str(), e);
        if !e.explicit_remove {
            desired.insert(e.key.clone(), e.digest.clone());
        }
    }

    let mut removals: Vec<PlanStep> = Vec::new();
    let mut upgrades: Vec<PlanStep> = Vec::new();
    let mut installs: Vec<PlanStep> = Vec::new();

    for (key, _) in last.iter() {
        match known.get(key.as_str()) {
            Some(e) if e.explicit_remove => removals.push(PlanStep {
                key: key.clone(),
                action: e.removal.clone(),
                effect: StepEffect::Remove,
            }),
            Some(_) => {}
            None => match orphan_removal(key) {
                Some(action) => removals.push(PlanStep {
                    key: key.clone(),
                    action,
                    effect: StepEffect::Remove,
                }),
                None => warn!(key = %key, "cannot derive removal for applied artifact; leaving in place"),
            },
        }
    }

    for e in entries.iter().filter(|e| !e.explicit_remove) {
        match last.get(&e.key) {
            None => installs.push(PlanStep {
                key: e.key.clone(),
                action: e.fresh.clone(),
                effect: StepEffect::Set(e.digest.clone()),
            }),
            Some(prev) if prev != &e.digest => upgrades.push(PlanStep {
                key: e.key.clone(),
                action: e.update.clone(),
                effect: StepEffect::Set(e.digest.clone()),
            }),
            Some(_) if refresh => installs.push(PlanStep {
                key: e.key.clone(),
                action: e.fresh.clone(),
                effect: StepEffect::Set(e.digest.clone()),
            }),
            Some(_) => {}
        }
    }

    // Deterministic order within each phase.
    removals.sort_by(|a, b| a.key.cmp(&b.key));
    upgrades.sort_by(|a, b| a.key.cmp(&b.key));
    installs.sort_by(|a, b| a.key.cmp(&b.key));

    let mut steps = removals;
    steps.extend(upgrades);
    steps.extend(installs);
    Plan { steps, desired }
}

/// Common contract over the per-kind drivers.
#[async_trait]
pub trait FeatureDriver: Send + Sync {
    fn feature(&self) -> FeatureId;

    /// Drive the feature toward the spec's desired set. `refresh` forces
    /// re-delivery of artifacts whose digest already matches (periodic
    /// drift correction).
    async fn reconcile(
        &self,
        cluster: &ClusterId,
        spec: &ProfileSpec,
        generation: u64,
        prior: &FeatureStatus,
        transport: &dyn Transport,
        refresh: bool,
    ) -> FeatureStatus;

    /// Full uninstall of the last applied set (cleanup path).
    async fn teardown(
        &self,
        cluster: &ClusterId,
        generation: u64,
        prior: &FeatureStatus,
        transport: &dyn Transport,
    ) -> FeatureStatus;
}

pub(crate) fn settle(status: &mut FeatureStatus, next: FeatureState) {
    if status.state.can_transition(next) {
        status.state = next;
    } else {
        warn!(from = ?status.state, to = ?next, "suppressing invalid feature transition");
    }
}

/// Execute a plan for one feature and fold the outcome into a fresh status.
pub(crate) async fn run_plan(
    feature: FeatureId,
    cluster: &ClusterId,
    generation: u64,
    entries: &[DesiredEntry],
    orphan_removal: &(dyn Fn(&str) -> Option<DeliveryAction> + Sync),
    prior: &FeatureStatus,
    transport: &dyn Transport,
    teardown: bool,
    refresh: bool,
) -> FeatureStatus {
    let t0 = std::time::Instant::now();
    let mut status = prior.clone();
    status.observed_generation = generation;

    let p = plan(entries, &prior.applied, orphan_removal, refresh);
    let target_fp = fingerprint(&p.desired);
    let final_state = if teardown { FeatureState::Removed } else { FeatureState::Provisioned };

    // A set staged for a pull agent stays Provisioning until its report
    // shows up; a spec change in the meantime simply restages below.
    if let Some(staged_fp) = prior.staged_fingerprint.clone() {
        if staged_fp == target_fp {
            match transport.completion(cluster, feature, &staged_fp).await {
                Ok(true) => {
                    status.applied = p.desired;
                    status.fingerprint = Some(target_fp);
                    status.staged_fingerprint = None;
                    status.error = None;
                    status.last_applied_ts = chrono::Utc::now().timestamp();
                    settle(&mut status, final_state);
                    metrics::counter!("driver_pull_completed", 1u64);
                    return status;
                }
                Ok(false) => {
                    settle(&mut status, FeatureState::Provisioning);
                    return status;
                }
                Err(e) => {
                    status.staged_fingerprint = None;
                    status.error = Some(e.to_string());
                    settle(&mut status, FeatureState::Failed);
                    return status;
                }
            }
        }
    }

    if p.steps.is_empty() {
        // Nothing to do: no transport calls, status settles without churn.
        // The timestamp still moves so the drift check has a baseline.
        status.fingerprint = Some(target_fp);
        status.error = None;
        status.staged_fingerprint = None;
        status.last_applied_ts = chrono::Utc::now().timestamp();
        settle(&mut status, final_state);
        return status;
    }

    settle(&mut status, FeatureState::Provisioning);
    debug!(cluster = %cluster, feature = %feature, steps = p.steps.len(), "executing plan");
    metrics::counter!("driver_plans", 1u64);

    let actions: Vec<DeliveryAction> = p.steps.iter().map(|s| s.action.clone()).collect();
    match transport.deliver(cluster, feature, &target_fp, &actions).await {
        Ok(report) if report.staged => {
            status.staged_fingerprint = Some(target_fp);
            status.error = None;
        }
        Ok(report) => {
            for idx in &report.completed {
                let step = &p.steps[*idx];
                match &step.effect {
                    StepEffect::Set(digest) => {
                        status.applied.insert(step.key.clone(), digest.clone());
                    }
                    StepEffect::Remove => {
                        status.applied.remove(&step.key);
                    }
                }
            }
            status.fingerprint = Some(fingerprint(&status.applied));
            status.staged_fingerprint = None;
            match report.error {
                Some(e) => {
                    metrics::counter!("driver_failed", 1u64);
                    status.error = Some(e.to_string());
                    settle(&mut status, FeatureState::Failed);
                }
                None => {
                    status.error = None;
                    status.last_applied_ts = chrono::Utc::now().timestamp();
                    settle(&mut status, final_state);
                }
            }
        }
        Err(e) => {
            metrics::counter!("driver_failed", 1u64);
            status.error = Some(e.to_string());
            settle(&mut status, FeatureState::Failed);
        }
    }
    metrics::histogram!("driver_reconcile_ms", t0.elapsed().as_secs_f64() * 1000.0);
    status
}

pub(crate) fn content_digest(v: &Json) -> String {
    let mut h = Sha256::new();
    h.update(v.to_string().as_bytes());
    flotilla_core::hex(&h.finalize())
}

/// Static renderer for tests and file-backed profiles: policy refs resolve
/// to pre-registered object lists.
pub mod render {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use serde_json::Value as Json;

    use flotilla_core::{DeliveryError, DeliveryResult, PolicyRef};

    use super::Renderer;

    #[derive(Clone, Default)]
    pub struct StaticRenderer {
        map: Arc<Mutex<HashMap<String, DeliveryResult<Vec<Json>>>>>,
    }

    impl StaticRenderer {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert(&self, policy: &PolicyRef, objects: Vec<Json>) {
            self.map.lock().unwrap().insert(policy.to_string(), Ok(objects));
        }

        pub fn fail(&self, policy: &PolicyRef, message: &str) {
            self.map
                .lock()
                .unwrap()
                .insert(policy.to_string(), Err(DeliveryError::Render(message.to_string())));
        }

        pub fn remove(&self, policy: &PolicyRef) {
            self.map.lock().unwrap().remove(&policy.to_string());
        }
    }

    #[async_trait]
    impl Renderer for StaticRenderer {
        async fn render(&self, policy: &PolicyRef) -> DeliveryResult<Vec<Json>> {
            match self.map.lock().unwrap().get(&policy.to_string()) {
                Some(res) => res.clone(),
                None => Err(DeliveryError::Render(format!("referenced object not found: {}", policy))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_core::{HelmChartAction, HelmChartSpec};

    fn chart(name: &str, version: &str, action: HelmChartAction) -> HelmChartSpec {
        HelmChartSpec {
            repository_url: "https://charts.example.com".into(),
            repository_name: "example".into(),
            chart_name: name.into(),
            chart_version: version.into(),
            release_name: name.into(),
            release_namespace: name.into(),
            values: None,
            action,
        }
    }

    fn entry(c: &HelmChartSpec) -> DesiredEntry {
        DesiredEntry {
            key: c.release_key(),
            digest: c.digest(),
            fresh: DeliveryAction::HelmInstall(c.clone()),
            update: DeliveryAction::HelmUpgrade(c.clone()),
            removal: DeliveryAction::HelmUninstall {
                release_namespace: c.release_namespace.clone(),
                release_name: c.release_name.clone(),
            },
            explicit_remove: c.action == HelmChartAction::Uninstall,
        }
    }

    fn removal_stub(_key: &str) -> Option<DeliveryAction> {
        Some(DeliveryAction::HelmUninstall { release_namespace: "x".into(), release_name: "x".into() })
    }

    #[test]
    fn fresh_desired_set_installs_everything() {
        let a = chart("a", "1.0.0", HelmChartAction::Install);
        let b = chart("b", "1.0.0", HelmChartAction::Install);
        let p = plan(&[entry(&a), entry(&b)], &AppliedSet::new(), &removal_stub, false);
        assert_eq!(p.steps.len(), 2);
        assert!(p.steps.iter().all(|s| matches!(s.action, DeliveryAction::HelmInstall(_))));
        assert_eq!(p.desired.len(), 2);
    }

    #[test]
    fn digest_change_upgrades_only_the_touched_artifact() {
        let a_old = chart("a", "1.6.0", HelmChartAction::Install);
        let b = chart("b", "1.0.0", HelmChartAction::Install);
        let mut last = AppliedSet::new();
        last.insert(a_old.release_key(), a_old.digest());
        last.insert(b.release_key(), b.digest());

        let a_new = chart("a", "1.5.0", HelmChartAction::Install);
        let p = plan(&[entry(&a_new), entry(&b)], &last, &removal_stub, false);
        assert_eq!(p.steps.len(), 1);
        assert_eq!(p.steps[0].key, a_new.release_key());
        assert!(matches!(p.steps[0].action, DeliveryAction::HelmUpgrade(_)));
    }

    #[test]
    fn removals_run_before_upgrades_and_installs() {
        let gone = chart("gone", "1.0.0", HelmChartAction::Install);
        let up = chart("up", "1.0.0", HelmChartAction::Install);
        let mut last = AppliedSet::new();
        last.insert(gone.release_key(), gone.digest());
        last.insert(up.release_key(), "stale-digest".into());

        let fresh = chart("fresh", "1.0.0", HelmChartAction::Install);
        let p = plan(&[entry(&up), entry(&fresh)], &last, &removal_stub, false);
        assert_eq!(p.steps.len(), 3);
        assert!(matches!(p.steps[0].action, DeliveryAction::HelmUninstall { .. }));
        assert!(matches!(p.steps[1].action, DeliveryAction::HelmUpgrade(_)));
        assert!(matches!(p.steps[2].action, DeliveryAction::HelmInstall(_)));
    }

    #[test]
    fn explicit_uninstall_of_applied_artifact_is_planned() {
        let c = chart("a", "1.0.0", HelmChartAction::Uninstall);
        let mut last = AppliedSet::new();
        last.insert(c.release_key(), c.digest());
        let p = plan(&[entry(&c)], &last, &removal_stub, false);
        assert_eq!(p.steps.len(), 1);
        assert_eq!(p.steps[0].effect, StepEffect::Remove);
        assert!(p.desired.is_empty());
    }

    #[test]
    fn explicit_uninstall_of_never_applied_artifact_is_noop() {
        let c = chart("a", "1.0.0", HelmChartAction::Uninstall);
        let p = plan(&[entry(&c)], &AppliedSet::new(), &removal_stub, false);
        assert!(p.steps.is_empty());
        assert!(p.desired.is_empty());
    }

    #[test]
    fn unchanged_set_plans_nothing() {
        let a = chart("a", "1.0.0", HelmChartAction::Install);
        let mut last = AppliedSet::new();
        last.insert(a.release_key(), a.digest());
        let p = plan(&[entry(&a)], &last, &removal_stub, false);
        assert!(p.steps.is_empty());
        assert_eq!(p.desired, last);
    }

    #[test]
    fn refresh_reasserts_unchanged_artifacts() {
        let a = chart("a", "1.0.0", HelmChartAction::Install);
        let mut last = AppliedSet::new();
        last.insert(a.release_key(), a.digest());
        let p = plan(&[entry(&a)], &last, &removal_stub, true);
        assert_eq!(p.steps.len(), 1);
        assert!(matches!(p.steps[0].action, DeliveryAction::HelmInstall(_)));
        assert_eq!(p.steps[0].effect, StepEffect::Set(a.digest()));
    }
}
