//! Kube-backed transport collaborators: SSA push client and ConfigMap
//! staging for pull clusters.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams},
    core::{DynamicObject, GroupVersionKind, ObjectMeta},
    discovery::{Discovery, Scope},
    Client,
};
use serde_json::Value as Json;
use tracing::{debug, warn};

use flotilla_core::{ClusterId, DeliveryError, DeliveryResult, FeatureId};

use crate::{object_ref, AgentReport, ClusterClient, ObjectRef, StagedSet, StagingStore};

const FIELD_MANAGER: &str = "flotilla";

fn map_kube_err(e: kube::Error) -> DeliveryError {
    match e {
        kube::Error::Api(ae) => match ae.code {
            404 => DeliveryError::NotFound(ae.message),
            409 => DeliveryError::Conflict(ae.message),
            400 | 422 => DeliveryError::Validation(ae.message),
            _ => DeliveryError::Connectivity(ae.message),
        },
        other => DeliveryError::Connectivity(other.to_string()),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> DeliveryResult<(kube::core::ApiResource, bool)> {
    let discovery = Discovery::new(client)
        .run()
        .await
        .map_err(|e| DeliveryError::Connectivity(e.to_string()))?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(DeliveryError::NotFound(format!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind)))
}

/// Direct client for one target cluster. The engine constructs one per
/// cluster at reconciliation time; the identity argument is for logging.
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Client from the ambient kubeconfig/context.
    pub async fn connect_default() -> DeliveryResult<Self> {
        let client = Client::try_default().await.map_err(map_kube_err)?;
        Ok(Self { client })
    }

    async fn dynamic_api(&self, r: &ObjectRef) -> DeliveryResult<Api<DynamicObject>> {
        let gvk = GroupVersionKind {
            group: r.group.clone(),
            version: r.version.clone(),
            kind: r.kind.clone(),
        };
        let (ar, namespaced) = find_api_resource(self.client.clone(), &gvk).await?;
        if namespaced {
            match r.namespace.as_deref() {
                Some(ns) => Ok(Api::namespaced_with(self.client.clone(), ns, &ar)),
                None => Err(DeliveryError::Validation("namespace required for namespaced kind".into())),
            }
        } else {
            Ok(Api::all_with(self.client.clone(), &ar))
        }
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get(&self, cluster: &ClusterId, object: &ObjectRef) -> DeliveryResult<Option<Json>> {
        let api = self.dynamic_api(object).await?;
        match api.get_opt(&object.name).await.map_err(map_kube_err)? {
            Some(obj) => {
                debug!(cluster = %cluster, object = %object, "remote get ok");
                Ok(Some(serde_json::to_value(&obj).map_err(|e| DeliveryError::Validation(e.to_string()))?))
            }
            None => Ok(None),
        }
    }

    async fn apply(&self, cluster: &ClusterId, object: &Json) -> DeliveryResult<()> {
        let r = object_ref(object)?;
        let api = self.dynamic_api(&r).await?;
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(&r.name, &pp, &Patch::Apply(object)).await.map_err(map_kube_err)?;
        debug!(cluster = %cluster, object = %r, "remote apply ok");
        Ok(())
    }

    async fn delete(&self, cluster: &ClusterId, object: &ObjectRef) -> DeliveryResult<()> {
        let api = self.dynamic_api(object).await?;
        match api.delete(&object.name, &DeleteParams::default()).await {
            Ok(_) => {
                debug!(cluster = %cluster, object = %object, "remote delete ok");
                Ok(())
            }
            Err(e) => Err(map_kube_err(e)),
        }
    }
}

fn staged_name(cluster: &ClusterId, feature: FeatureId) -> String {
    format!("flotilla-staged-{}-{}-{}", feature, cluster.namespace, cluster.name)
}

fn report_name(cluster: &ClusterId, feature: FeatureId) -> String {
    format!("flotilla-report-{}-{}-{}", feature, cluster.namespace, cluster.name)
}

/// Staging store backed by ConfigMaps in the management plane. The agent
/// running inside the pull cluster fetches the staged set and writes its
/// completion report next to it.
pub struct KubeStagingStore {
    client: Client,
    namespace: String,
}

impl KubeStagingStore {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self { client, namespace: namespace.into() }
    }

    fn api(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

#[async_trait]
impl StagingStore for KubeStagingStore {
    async fn put(&self, set: StagedSet) -> DeliveryResult<()> {
        let name = staged_name(&set.cluster, set.feature);
        let actions = serde_yaml::to_string(&set.actions)
            .map_err(|e| DeliveryError::Validation(format!("serializing staged actions: {}", e)))?;
        let mut data = BTreeMap::new();
        data.insert("fingerprint".to_string(), set.fingerprint.clone());
        data.insert("stagedAt".to_string(), set.staged_at.to_string());
        data.insert("actions".to_string(), actions);
        let cm = ConfigMap {
            metadata: ObjectMeta { name: Some(name.clone()), namespace: Some(self.namespace.clone()), ..Default::default() },
            data: Some(data),
            ..Default::default()
        };
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        self.api().patch(&name, &pp, &Patch::Apply(&cm)).await.map_err(map_kube_err)?;
        debug!(cluster = %set.cluster, feature = %set.feature, "staged set written");
        Ok(())
    }

    async fn latest_report(&self, cluster: &ClusterId, feature: FeatureId) -> DeliveryResult<Option<AgentReport>> {
        let name = report_name(cluster, feature);
        let cm = match self.api().get_opt(&name).await.map_err(map_kube_err)? {
            Some(cm) => cm,
            None => return Ok(None),
        };
        let data = cm.data.unwrap_or_default();
        let fingerprint = match data.get("fingerprint") {
            Some(fp) => fp.clone(),
            None => {
                warn!(cluster = %cluster, feature = %feature, "agent report missing fingerprint");
                return Ok(None);
            }
        };
        let success = data.get("success").map(|s| s == "true").unwrap_or(false);
        let error = data.get("error").cloned();
        Ok(Some(AgentReport { fingerprint, success, error }))
    }

    async fn clear(&self, cluster: &ClusterId, feature: FeatureId) -> DeliveryResult<()> {
        for name in [staged_name(cluster, feature), report_name(cluster, feature)] {
            match self.api().delete(&name, &DeleteParams::default()).await {
                Ok(_) => {}
                Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(e) => return Err(map_kube_err(e)),
            }
        }
        Ok(())
    }
}
