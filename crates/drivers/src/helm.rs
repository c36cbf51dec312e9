//! Helm feature driver: version-driven install, upgrade and uninstall of
//! chart releases, classic and OCI repositories alike.

use async_trait::async_trait;
use tracing::warn;

use flotilla_core::{ClusterId, FeatureId, FeatureStatus, HelmChartAction, ProfileSpec};
use flotilla_transport::{DeliveryAction, Transport};

use crate::{run_plan, DesiredEntry, FeatureDriver};

pub struct HelmDriver;

impl HelmDriver {
    pub fn new() -> Self {
        Self
    }
}

impl Default for HelmDriver {
    fn default() -> Self {
        Self::new()
    }
}

fn entries(spec: &ProfileSpec) -> Vec<DesiredEntry> {
    let mut out = Vec::with_capacity(spec.helm_charts.len());
    for chart in &spec.helm_charts {
        out.push(DesiredEntry {
            key: chart.release_key(),
            digest: chart.digest(),
            fresh: DeliveryAction::HelmInstall(chart.clone()),
            update: DeliveryAction::HelmUpgrade(chart.clone()),
            removal: DeliveryAction::HelmUninstall {
                release_namespace: chart.release_namespace.clone(),
                release_name: chart.release_name.clone(),
            },
            explicit_remove: chart.action == HelmChartAction::Uninstall,
        });
    }
    out
}

/// Release keys are `repositoryName/chartName/releaseNamespace/releaseName`;
/// uninstall only needs the last two coordinates.
fn removal_for_key(key: &str) -> Option<DeliveryAction> {
    let parts: Vec<&str> = key.split('/').collect();
    if parts.len() != 4 {
        warn!(key = %key, "unexpected helm artifact key shape");
        return None;
    }
    Some(DeliveryAction::HelmUninstall {
        release_namespace: parts[2].to_string(),
        release_name: parts[3].to_string(),
    })
}

#[async_trait]
impl FeatureDriver for HelmDriver {
    fn feature(&self) -> FeatureId {
        FeatureId::Helm
    }

    async fn reconcile(
        &self,
        cluster: &ClusterId,
        spec: &ProfileSpec,
        generation: u64,
        prior: &FeatureStatus,
        transport: &dyn Transport,
        refresh: bool,
    ) -> FeatureStatus {
        let desired = entries(spec);
        run_plan(FeatureId::Helm, cluster, generation, &desired, &removal_for_key, prior, transport, false, refresh).await
    }

    async fn teardown(
        &self,
        cluster: &ClusterId,
        generation: u64,
        prior: &FeatureStatus,
        transport: &dyn Transport,
    ) -> FeatureStatus {
        run_plan(FeatureId::Helm, cluster, generation, &[], &removal_for_key, prior, transport, true, false).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_core::{ClusterKind, DeliveryError, FeatureState, HelmChartSpec};
    use flotilla_transport::mock::{RecordingChartEngine, RecordingClient};
    use flotilla_transport::{ChartSource, PushTransport, RetryPolicy};

    fn cluster() -> ClusterId {
        ClusterId::new(ClusterKind::Managed, "default", "c1")
    }

    fn vault(version: &str, url: &str) -> HelmChartSpec {
        HelmChartSpec {
            repository_url: url.into(),
            repository_name: "oci-vault".into(),
            chart_name: "vault".into(),
            chart_version: version.into(),
            release_name: "vault".into(),
            release_namespace: "vault".into(),
            values: None,
            action: HelmChartAction::Install,
        }
    }

    fn spec(charts: Vec<HelmChartSpec>) -> ProfileSpec {
        ProfileSpec { helm_charts: charts, ..Default::default() }
    }

    fn push(engine: &RecordingChartEngine) -> PushTransport<RecordingClient, RecordingChartEngine> {
        PushTransport::new(RecordingClient::new(), engine.clone(), RetryPolicy::immediate(3))
    }

    #[tokio::test]
    async fn version_change_issues_single_upgrade() {
        let engine = RecordingChartEngine::new();
        let transport = push(&engine);
        let driver = HelmDriver::new();
        let c = cluster();

        let s1 = spec(vec![vault("1.6.0", "https://charts.example.com")]);
        let st1 = driver.reconcile(&c, &s1, 1, &FeatureStatus::pending(), &transport, false).await;
        assert_eq!(st1.state, FeatureState::Provisioned);
        assert_eq!(engine.calls(), vec!["install oci-vault/vault/vault/vault"]);

        // Downgrade is just an upgrade call with the older version.
        let s2 = spec(vec![vault("1.5.0", "https://charts.example.com")]);
        let st2 = driver.reconcile(&c, &s2, 2, &st1, &transport, false).await;
        assert_eq!(st2.state, FeatureState::Provisioned);
        assert_eq!(engine.call_count(), 2);
        assert_eq!(engine.calls()[1], "upgrade oci-vault/vault/vault/vault");
        let rel = engine.release(&c, "oci-vault/vault/vault/vault").unwrap();
        assert_eq!(rel.version, "1.5.0");
        assert_ne!(st1.fingerprint, st2.fingerprint);
    }

    #[tokio::test]
    async fn oci_repository_selects_registry_pull_path() {
        let engine = RecordingChartEngine::new();
        let transport = push(&engine);
        let driver = HelmDriver::new();
        let c = cluster();

        let s = spec(vec![vault("1.6.0", "oci://registry-1.docker.io/bitnamicharts")]);
        let st = driver.reconcile(&c, &s, 1, &FeatureStatus::pending(), &transport, false).await;
        assert_eq!(st.state, FeatureState::Provisioned);
        let rel = engine.release(&c, "oci-vault/vault/vault/vault").unwrap();
        assert_eq!(rel.source, ChartSource::Oci);
    }

    #[tokio::test]
    async fn chart_error_is_permanent_failure() {
        let engine = RecordingChartEngine::new();
        engine.fail_release("oci-vault/vault/vault/vault", DeliveryError::Chart("no such chart".into()));
        let transport = push(&engine);
        let driver = HelmDriver::new();

        let s = spec(vec![vault("1.6.0", "https://charts.example.com")]);
        let st = driver.reconcile(&cluster(), &s, 1, &FeatureStatus::pending(), &transport, false).await;
        assert_eq!(st.state, FeatureState::Failed);
        assert!(st.error.as_deref().unwrap().contains("no such chart"));
        assert!(st.applied.is_empty());
    }

    #[tokio::test]
    async fn transient_registry_error_is_retried_to_success() {
        let engine = RecordingChartEngine::new();
        engine.fail_release_n(
            "oci-vault/vault/vault/vault",
            DeliveryError::Connectivity("registry timeout".into()),
            2,
        );
        let transport = push(&engine);
        let driver = HelmDriver::new();

        let s = spec(vec![vault("1.6.0", "https://charts.example.com")]);
        let st = driver.reconcile(&cluster(), &s, 1, &FeatureStatus::pending(), &transport, false).await;
        assert_eq!(st.state, FeatureState::Provisioned);
        assert!(st.error.is_none());
    }

    #[tokio::test]
    async fn reconcile_runs_on_a_spawned_worker() {
        let engine = RecordingChartEngine::new();
        let transport = push(&engine);
        let driver = HelmDriver::new();

        // The engine runs drivers from a multi-threaded worker pool, so the
        // reconcile future has to cross a spawn boundary.
        let st = tokio::spawn(async move {
            let s = spec(vec![vault("1.6.0", "https://charts.example.com")]);
            driver
                .reconcile(&cluster(), &s, 1, &FeatureStatus::pending(), &transport, false)
                .await
        })
        .await
        .unwrap();
        assert_eq!(st.state, FeatureState::Provisioned);
        assert_eq!(engine.call_count(), 1);
    }

    #[tokio::test]
    async fn teardown_uninstalls_last_applied() {
        let engine = RecordingChartEngine::new();
        let transport = push(&engine);
        let driver = HelmDriver::new();
        let c = cluster();

        let s = spec(vec![vault("1.6.0", "https://charts.example.com")]);
        let st = driver.reconcile(&c, &s, 1, &FeatureStatus::pending(), &transport, false).await;
        assert!(engine.release(&c, "oci-vault/vault/vault/vault").is_some());

        let st2 = driver.teardown(&c, 1, &st, &transport).await;
        assert_eq!(st2.state, FeatureState::Removed);
        assert!(st2.applied.is_empty());
        assert!(engine.release(&c, "oci-vault/vault/vault/vault").is_none());
    }
}
