//! Chart engine shelling out to the `helm` binary.
//!
//! Install runs `helm upgrade --install`, so it is ensure-present as the
//! `ChartEngine` contract requires. Per-cluster credentials come from
//! kubeconfig files laid out under one directory, named
//! `<namespace>_<name>.yaml`; without a directory every call uses the
//! ambient kubeconfig.

use std::path::PathBuf;

use tokio::process::Command;
use tracing::debug;

use async_trait::async_trait;

use flotilla_core::{ClusterId, DeliveryError, DeliveryResult, HelmChartSpec};

use crate::{ChartEngine, ChartSource};

pub struct HelmCliEngine {
    helm_bin: String,
    kubeconfig_dir: Option<PathBuf>,
}

impl HelmCliEngine {
    pub fn new(kubeconfig_dir: Option<PathBuf>) -> Self {
        let helm_bin = std::env::var("FLOTILLA_HELM_BIN").unwrap_or_else(|_| "helm".to_string());
        Self { helm_bin, kubeconfig_dir }
    }

    fn kubeconfig_args(&self, cluster: &ClusterId) -> Vec<String> {
        match &self.kubeconfig_dir {
            Some(dir) => {
                let path = dir.join(format!("{}_{}.yaml", cluster.namespace, cluster.name));
                vec!["--kubeconfig".to_string(), path.to_string_lossy().into_owned()]
            }
            None => Vec::new(),
        }
    }

    async fn run(&self, args: Vec<String>) -> DeliveryResult<()> {
        debug!(helm = %self.helm_bin, args = ?args, "invoking helm");
        let out = Command::new(&self.helm_bin)
            .args(&args)
            .output()
            .await
            .map_err(|e| DeliveryError::Connectivity(format!("spawning helm: {}", e)))?;
        if out.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
        Err(classify(&stderr))
    }

    async fn converge(
        &self,
        cluster: &ClusterId,
        source: ChartSource,
        chart: &HelmChartSpec,
    ) -> DeliveryResult<()> {
        let chart_ref = match source {
            ChartSource::Oci => format!(
                "{}/{}",
                chart.repository_url.trim_end_matches('/'),
                chart.chart_name
            ),
            ChartSource::Repository => chart.chart_name.clone(),
        };
        let mut args = vec![
            "upgrade".to_string(),
            "--install".to_string(),
            chart.release_name.clone(),
            chart_ref,
            "--namespace".to_string(),
            chart.release_namespace.clone(),
            "--create-namespace".to_string(),
            "--version".to_string(),
            chart.chart_version.clone(),
        ];
        if source == ChartSource::Repository {
            args.push("--repo".to_string());
            args.push(chart.repository_url.clone());
        }
        args.extend(self.kubeconfig_args(cluster));

        let values_path = match &chart.values {
            Some(values) => {
                let path = std::env::temp_dir()
                    .join(format!("flotilla-values-{}.yaml", uuid::Uuid::new_v4()));
                tokio::fs::write(&path, values)
                    .await
                    .map_err(|e| DeliveryError::Chart(format!("writing values file: {}", e)))?;
                args.push("--values".to_string());
                args.push(path.to_string_lossy().into_owned());
                Some(path)
            }
            None => None,
        };

        let result = self.run(args).await;
        if let Some(path) = values_path {
            let _ = tokio::fs::remove_file(path).await;
        }
        result
    }
}

/// Helm folds every failure into exit code 1, so the category has to come
/// from the message.
fn classify(stderr: &str) -> DeliveryError {
    let lower = stderr.to_lowercase();
    if lower.contains("not found") {
        DeliveryError::NotFound(stderr.to_string())
    } else if lower.contains("connection refused")
        || lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("temporary failure")
    {
        DeliveryError::Connectivity(stderr.to_string())
    } else {
        DeliveryError::Chart(stderr.to_string())
    }
}

#[async_trait]
impl ChartEngine for HelmCliEngine {
    async fn install(&self, cluster: &ClusterId, source: ChartSource, chart: &HelmChartSpec) -> DeliveryResult<()> {
        self.converge(cluster, source, chart).await
    }

    async fn upgrade(&self, cluster: &ClusterId, source: ChartSource, chart: &HelmChartSpec) -> DeliveryResult<()> {
        self.converge(cluster, source, chart).await
    }

    async fn uninstall(&self, cluster: &ClusterId, release_namespace: &str, release_name: &str) -> DeliveryResult<()> {
        let mut args = vec![
            "uninstall".to_string(),
            release_name.to_string(),
            "--namespace".to_string(),
            release_namespace.to_string(),
        ];
        args.extend(self.kubeconfig_args(cluster));
        self.run(args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stderr_classification() {
        assert!(matches!(classify("Error: release: not found"), DeliveryError::NotFound(_)));
        assert!(matches!(
            classify("Error: Get \"https://...\": dial tcp: connection refused"),
            DeliveryError::Connectivity(_)
        ));
        assert!(matches!(
            classify("Error: chart \"vault\" version \"9.9.9\" has no deployable charts"),
            DeliveryError::Chart(_)
        ));
    }
}
