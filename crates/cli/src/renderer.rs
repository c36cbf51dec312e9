//! Policy renderer backed by the management cluster: ConfigMaps and
//! Secrets hold raw manifest YAML, one or more documents per data entry.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::{api::Api, Client};
use serde::Deserialize;
use serde_json::Value as Json;
use tracing::debug;

use flotilla_core::{DeliveryError, DeliveryResult, PolicyRef};
use flotilla_drivers::Renderer;

pub struct KubeRenderer {
    client: Client,
}

impl KubeRenderer {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn map_get_err(e: kube::Error) -> DeliveryError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => DeliveryError::Render(ae.message),
        other => DeliveryError::Connectivity(other.to_string()),
    }
}

/// Data entries are read in key order so the rendered object list is
/// deterministic across passes.
fn parse_docs(out: &mut Vec<Json>, text: &str, origin: &PolicyRef) -> DeliveryResult<()> {
    for doc in serde_yaml::Deserializer::from_str(text) {
        let value = serde_yaml::Value::deserialize(doc)
            .map_err(|e| DeliveryError::Render(format!("parsing manifest from {}: {}", origin, e)))?;
        if value.is_null() {
            continue;
        }
        let json = serde_json::to_value(&value)
            .map_err(|e| DeliveryError::Render(format!("converting manifest from {}: {}", origin, e)))?;
        out.push(json);
    }
    Ok(())
}

#[async_trait]
impl Renderer for KubeRenderer {
    async fn render(&self, policy: &PolicyRef) -> DeliveryResult<Vec<Json>> {
        let mut out = Vec::new();
        match policy.kind.as_str() {
            "ConfigMap" => {
                let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &policy.namespace);
                let cm = api
                    .get_opt(&policy.name)
                    .await
                    .map_err(map_get_err)?
                    .ok_or_else(|| {
                        DeliveryError::Render(format!("referenced object not found: {}", policy))
                    })?;
                for (_, text) in cm.data.unwrap_or_default() {
                    parse_docs(&mut out, &text, policy)?;
                }
            }
            "Secret" => {
                let api: Api<Secret> = Api::namespaced(self.client.clone(), &policy.namespace);
                let secret = api
                    .get_opt(&policy.name)
                    .await
                    .map_err(map_get_err)?
                    .ok_or_else(|| {
                        DeliveryError::Render(format!("referenced object not found: {}", policy))
                    })?;
                for (_, bytes) in secret.data.unwrap_or_default() {
                    let text = String::from_utf8(bytes.0).map_err(|e| {
                        DeliveryError::Render(format!("non-utf8 manifest in {}: {}", policy, e))
                    })?;
                    parse_docs(&mut out, &text, policy)?;
                }
            }
            other => {
                return Err(DeliveryError::Validation(format!(
                    "unsupported policy kind: {}",
                    other
                )))
            }
        }
        debug!(policy = %policy, objects = out.len(), "policy rendered");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> PolicyRef {
        PolicyRef { kind: "ConfigMap".into(), namespace: "default".into(), name: "p".into() }
    }

    #[test]
    fn multi_document_yaml_splits_into_objects() {
        let text = "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: a\n---\napiVersion: v1\nkind: Namespace\nmetadata:\n  name: b\n";
        let mut out = Vec::new();
        parse_docs(&mut out, text, &policy()).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[1]["metadata"]["name"], "b");
    }

    #[test]
    fn empty_documents_are_skipped() {
        let mut out = Vec::new();
        parse_docs(&mut out, "---\n---\n", &policy()).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn broken_yaml_is_a_render_error() {
        let mut out = Vec::new();
        let err = parse_docs(&mut out, "kind: [unclosed", &policy()).unwrap_err();
        assert!(matches!(err, DeliveryError::Render(_)));
    }
}
