//! Raw-resources feature driver: policy refs are rendered into object
//! lists, then applied or deleted object by object.

use async_trait::async_trait;
use tracing::warn;

use flotilla_core::{ClusterId, FeatureId, FeatureState, FeatureStatus, ProfileSpec};
use flotilla_transport::{object_ref, DeliveryAction, ObjectRef, Transport};

use crate::{content_digest, run_plan, settle, DesiredEntry, FeatureDriver, Renderer};

pub struct ResourcesDriver<R> {
    renderer: R,
}

impl<R: Renderer> ResourcesDriver<R> {
    pub fn new(renderer: R) -> Self {
        Self { renderer }
    }

    async fn desired(&self, spec: &ProfileSpec) -> Result<Vec<DesiredEntry>, flotilla_core::DeliveryError> {
        let mut out = Vec::new();
        for policy in &spec.policy_refs {
            let objects = self.renderer.render(policy).await?;
            for obj in objects {
                let r = object_ref(&obj)?;
                out.push(DesiredEntry {
                    key: r.key(),
                    digest: content_digest(&obj),
                    fresh: DeliveryAction::Apply { object: obj.clone() },
                    update: DeliveryAction::Apply { object: obj },
                    removal: DeliveryAction::Delete { object: r },
                    explicit_remove: false,
                });
            }
        }
        Ok(out)
    }
}

/// Object keys are `group/version/Kind/namespace/name` (namespace empty for
/// cluster-scoped kinds); a delete action is fully derivable from the key.
fn removal_for_key(key: &str) -> Option<DeliveryAction> {
    let segs: Vec<&str> = key.split('/').collect();
    let (group, version, kind, ns, name) = match segs.len() {
        4 => (String::new(), segs[0], segs[1], segs[2], segs[3]),
        5 => (segs[0].to_string(), segs[1], segs[2], segs[3], segs[4]),
        _ => {
            warn!(key = %key, "unexpected resource artifact key shape");
            return None;
        }
    };
    Some(DeliveryAction::Delete {
        object: ObjectRef {
            group,
            version: version.to_string(),
            kind: kind.to_string(),
            namespace: if ns.is_empty() { None } else { Some(ns.to_string()) },
            name: name.to_string(),
        },
    })
}

#[async_trait]
impl<R: Renderer> FeatureDriver for ResourcesDriver<R> {
    fn feature(&self) -> FeatureId {
        FeatureId::Resources
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
        let desired = match self.desired(spec).await {
            Ok(d) => d,
            Err(e) => {
                // Render and shape failures are permanent; no retry until
                // the referenced content changes.
                let mut status = prior.clone();
                status.observed_generation = generation;
                status.error = Some(e.to_string());
                settle(&mut status, FeatureState::Failed);
                metrics::counter!("driver_render_err", 1u64);
                return status;
            }
        };
        run_plan(FeatureId::Resources, cluster, generation, &desired, &removal_for_key, prior, transport, false, refresh).await
    }

    async fn teardown(
        &self,
        cluster: &ClusterId,
        generation: u64,
        prior: &FeatureStatus,
        transport: &dyn Transport,
    ) -> FeatureStatus {
        run_plan(FeatureId::Resources, cluster, generation, &[], &removal_for_key, prior, transport, true, false).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::StaticRenderer;
    use flotilla_core::{ClusterKind, DeliveryError, PolicyRef};
    use serde_json::Value as Json;
    use flotilla_transport::mock::{RecordingChartEngine, RecordingClient};
    use flotilla_transport::{PushTransport, RetryPolicy};

    fn cluster() -> ClusterId {
        ClusterId::new(ClusterKind::Managed, "default", "c1")
    }

    fn policy(name: &str) -> PolicyRef {
        PolicyRef { kind: "ConfigMap".into(), namespace: "default".into(), name: name.into() }
    }

    fn namespace_obj(name: &str) -> Json {
        serde_json::json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": { "name": name, "labels": { "name": "fv" } }
        })
    }

    fn cm_obj(name: &str, value: &str) -> Json {
        serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": name, "namespace": "app" },
            "data": { "k": value }
        })
    }

    fn spec(policies: Vec<PolicyRef>) -> ProfileSpec {
        ProfileSpec { policy_refs: policies, ..Default::default() }
    }

    fn push(client: &RecordingClient) -> PushTransport<RecordingClient, RecordingChartEngine> {
        PushTransport::new(client.clone(), RecordingChartEngine::new(), RetryPolicy::immediate(3))
    }

    #[tokio::test]
    async fn rendered_objects_are_applied_then_removed_when_dereferenced() {
        let renderer = StaticRenderer::new();
        renderer.insert(&policy("ns"), vec![namespace_obj("dev")]);
        let client = RecordingClient::new();
        let transport = push(&client);
        let driver = ResourcesDriver::new(renderer.clone());
        let c = cluster();

        let st1 = driver.reconcile(&c, &spec(vec![policy("ns")]), 1, &FeatureStatus::pending(), &transport, false).await;
        assert_eq!(st1.state, FeatureState::Provisioned);
        assert!(client.has_on(&c, "v1/Namespace//dev"));

        // Profile no longer references the policy: object gets deleted.
        let st2 = driver.reconcile(&c, &spec(vec![]), 2, &st1, &transport, false).await;
        assert_eq!(st2.state, FeatureState::Provisioned);
        assert!(!client.has_on(&c, "v1/Namespace//dev"));
        assert!(st2.applied.is_empty());
    }

    #[tokio::test]
    async fn empty_desired_set_settles_without_transport_calls() {
        let client = RecordingClient::new();
        let transport = push(&client);
        let driver = ResourcesDriver::new(StaticRenderer::new());

        let st = driver
            .reconcile(&cluster(), &spec(vec![]), 1, &FeatureStatus::pending(), &transport, false)
            .await;
        assert_eq!(st.state, FeatureState::Provisioned);
        assert!(st.last_applied_ts > 0);
        assert_eq!(client.mutation_calls(), 0);
    }

    #[tokio::test]
    async fn render_failure_is_permanent() {
        let renderer = StaticRenderer::new();
        renderer.fail(&policy("broken"), "unparsable manifest");
        let client = RecordingClient::new();
        let transport = push(&client);
        let driver = ResourcesDriver::new(renderer);

        let st = driver
            .reconcile(&cluster(), &spec(vec![policy("broken")]), 1, &FeatureStatus::pending(), &transport, false)
            .await;
        assert_eq!(st.state, FeatureState::Failed);
        assert!(st.error.as_deref().unwrap().contains("unparsable manifest"));
        assert_eq!(client.mutation_calls(), 0);
    }

    #[tokio::test]
    async fn partial_failure_preserves_applied_artifacts() {
        let renderer = StaticRenderer::new();
        renderer.insert(&policy("cms"), vec![cm_obj("a", "1"), cm_obj("b", "1")]);
        let client = RecordingClient::new();
        client.fail_apply("v1/ConfigMap/app/b", DeliveryError::Validation("denied".into()));
        let transport = push(&client);
        let driver = ResourcesDriver::new(renderer.clone());
        let c = cluster();

        let st = driver.reconcile(&c, &spec(vec![policy("cms")]), 1, &FeatureStatus::pending(), &transport, false).await;
        assert_eq!(st.state, FeatureState::Failed);
        assert!(client.has_on(&c, "v1/ConfigMap/app/a"));
        assert!(st.applied.contains_key("v1/ConfigMap/app/a"));
        assert!(!st.applied.contains_key("v1/ConfigMap/app/b"));

        // Next pass after the denial is lifted converges without
        // re-applying the artifact that already succeeded.
        client.fail_apply_n("v1/ConfigMap/app/b", DeliveryError::Validation("denied".into()), 0);
        let calls_before = client.apply_calls();
        let st2 = driver.reconcile(&c, &spec(vec![policy("cms")]), 1, &st, &transport, false).await;
        assert_eq!(st2.state, FeatureState::Provisioned);
        assert_eq!(client.apply_calls(), calls_before + 1);
    }

    #[tokio::test]
    async fn content_change_reapplies_only_changed_object() {
        let renderer = StaticRenderer::new();
        renderer.insert(&policy("cms"), vec![cm_obj("a", "1"), cm_obj("b", "1")]);
        let client = RecordingClient::new();
        let transport = push(&client);
        let driver = ResourcesDriver::new(renderer.clone());
        let c = cluster();

        let st1 = driver.reconcile(&c, &spec(vec![policy("cms")]), 1, &FeatureStatus::pending(), &transport, false).await;
        assert_eq!(st1.state, FeatureState::Provisioned);
        let calls = client.apply_calls();

        renderer.insert(&policy("cms"), vec![cm_obj("a", "1"), cm_obj("b", "2")]);
        let st2 = driver.reconcile(&c, &spec(vec![policy("cms")]), 2, &st1, &transport, false).await;
        assert_eq!(st2.state, FeatureState::Provisioned);
        assert_eq!(client.apply_calls(), calls + 1);
        assert_ne!(st1.fingerprint, st2.fingerprint);
    }

    #[tokio::test]
    async fn refresh_restores_externally_removed_object() {
        let renderer = StaticRenderer::new();
        renderer.insert(&policy("ns"), vec![namespace_obj("dev")]);
        let client = RecordingClient::new();
        let transport = push(&client);
        let driver = ResourcesDriver::new(renderer.clone());
        let c = cluster();

        let st1 = driver.reconcile(&c, &spec(vec![policy("ns")]), 1, &FeatureStatus::pending(), &transport, false).await;
        client.drift_remove(&c, "v1/Namespace//dev");

        // A plain pass sees no digest change and leaves the drift alone.
        let st2 = driver.reconcile(&c, &spec(vec![policy("ns")]), 1, &st1, &transport, false).await;
        assert!(!client.has_on(&c, "v1/Namespace//dev"));

        // A refresh pass re-asserts the full desired set.
        let st3 = driver.reconcile(&c, &spec(vec![policy("ns")]), 1, &st2, &transport, true).await;
        assert_eq!(st3.state, FeatureState::Provisioned);
        assert!(client.has_on(&c, "v1/Namespace//dev"));
        assert_eq!(st2.fingerprint, st3.fingerprint);
    }
}
