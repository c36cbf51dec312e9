use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use tokio::signal;
use tracing::{error, info, warn};

use flotilla_core::{ClusterKind, DeploymentRecord, Profile};
use flotilla_drivers::{FeatureDriver, HelmDriver, ResourcesDriver};
use flotilla_engine::{
    EngineConfig, MemStore, OrphanReport, PassSummary, Reconciler, RecordStore, StaticSelector,
};
use flotilla_inventory::{
    match_clusters, spawn_ingest, start_cluster_watcher, ClusterDelta, ClusterDeltaKind,
    ClusterEntry, InventoryBuilder, InventoryHandle, InventorySnapshot,
};
use flotilla_transport::helm_cli::HelmCliEngine;
use flotilla_transport::kube_client::{KubeClusterClient, KubeStagingStore};
use flotilla_transport::{PullTransport, PushTransport, RetryPolicy};

mod renderer;
use renderer::KubeRenderer;

#[derive(Parser, Debug)]
#[command(name = "flotillactl", version, about = "Flotilla fleet reconciler")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the reconciliation loop against the management cluster
    Run {
        /// Profile YAML file (multi-document) or a directory of them
        #[arg(long = "profiles")]
        profiles: PathBuf,
        /// GVK key of the full cluster registrations
        #[arg(long = "cluster-gvk", default_value = "fleet.flotilla.io/v1alpha1/ManagedCluster")]
        cluster_gvk: String,
        /// GVK key of the lightweight cluster registrations
        #[arg(long = "lite-gvk", default_value = "fleet.flotilla.io/v1alpha1/LiteCluster")]
        lite_gvk: String,
        /// Namespace to watch for cluster objects (default: all)
        #[arg(long = "ns")]
        namespace: Option<String>,
        /// Seconds between periodic passes
        #[arg(long = "interval", default_value_t = 30)]
        interval: u64,
        /// Namespace holding pull-mode staging ConfigMaps
        #[arg(long = "staging-ns", default_value = "flotilla-system")]
        staging_ns: String,
        /// Directory of per-cluster kubeconfigs for helm (<ns>_<name>.yaml)
        #[arg(long = "kubeconfig-dir")]
        kubeconfig_dir: Option<PathBuf>,
    },
    /// Run a single pass and print the resulting records
    Reconcile {
        #[arg(long = "profiles")]
        profiles: PathBuf,
        /// Inventory YAML file; omitted, clusters are discovered by watching
        #[arg(long = "inventory")]
        inventory: Option<PathBuf>,
        #[arg(long = "cluster-gvk", default_value = "fleet.flotilla.io/v1alpha1/ManagedCluster")]
        cluster_gvk: String,
        #[arg(long = "ns")]
        namespace: Option<String>,
        #[arg(long = "staging-ns", default_value = "flotilla-system")]
        staging_ns: String,
        #[arg(long = "kubeconfig-dir")]
        kubeconfig_dir: Option<PathBuf>,
    },
    /// Resolve profile selectors against an inventory file, touching nothing
    Validate {
        #[arg(long = "profiles")]
        profiles: PathBuf,
        #[arg(long = "inventory")]
        inventory: PathBuf,
    },
    /// Tear down one profile's workloads and drop its records
    Delete {
        /// Profile name
        profile: String,
        #[arg(long = "profiles")]
        profiles: PathBuf,
        #[arg(long = "inventory")]
        inventory: Option<PathBuf>,
        #[arg(long = "cluster-gvk", default_value = "fleet.flotilla.io/v1alpha1/ManagedCluster")]
        cluster_gvk: String,
        #[arg(long = "ns")]
        namespace: Option<String>,
        #[arg(long = "staging-ns", default_value = "flotilla-system")]
        staging_ns: String,
        #[arg(long = "kubeconfig-dir")]
        kubeconfig_dir: Option<PathBuf>,
    },
}

fn init_tracing() {
    let env = std::env::var("FLOTILLA_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("FLOTILLA_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid FLOTILLA_METRICS_ADDR; expected host:port");
        }
    }
}

/// A profile file holds one or more YAML documents; a directory holds one
/// file per profile. Output is sorted by name for deterministic passes.
fn load_profiles(path: &Path) -> Result<Vec<Profile>> {
    let mut out = Vec::new();
    if path.is_dir() {
        let mut files: Vec<PathBuf> = std::fs::read_dir(path)
            .with_context(|| format!("reading profile directory {}", path.display()))?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                matches!(p.extension().and_then(|e| e.to_str()), Some("yaml") | Some("yml"))
            })
            .collect();
        files.sort();
        for file in files {
            append_profiles(&mut out, &file)?;
        }
    } else {
        append_profiles(&mut out, path)?;
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

fn append_profiles(out: &mut Vec<Profile>, file: &Path) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("reading profile file {}", file.display()))?;
    for doc in serde_yaml::Deserializer::from_str(&text) {
        let profile = Profile::deserialize(doc)
            .with_context(|| format!("parsing profile in {}", file.display()))?;
        out.push(profile);
    }
    Ok(())
}

/// Inventory file: a YAML list of cluster entries.
fn load_inventory(path: &Path) -> Result<Arc<InventorySnapshot>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading inventory file {}", path.display()))?;
    let entries: Vec<ClusterEntry> = serde_yaml::from_str(&text)
        .with_context(|| format!("parsing inventory in {}", path.display()))?;
    let mut builder = InventoryBuilder::new();
    builder.apply(
        entries
            .into_iter()
            .map(|e| ClusterDelta {
                id: e.id().clone(),
                kind: ClusterDeltaKind::Upserted,
                entry: Some(e),
            })
            .collect(),
    );
    Ok(builder.freeze())
}

async fn build_reconciler(
    staging_ns: &str,
    kubeconfig_dir: Option<PathBuf>,
) -> Result<Arc<Reconciler>> {
    let client = kube::Client::try_default().await.context("connecting to management cluster")?;
    let store: Arc<dyn RecordStore> = Arc::new(MemStore::new());
    let push = PushTransport::new(
        KubeClusterClient::new(client.clone()),
        HelmCliEngine::new(kubeconfig_dir),
        RetryPolicy::from_env(),
    );
    let pull = PullTransport::new(KubeStagingStore::new(client.clone(), staging_ns));
    let selector = Arc::new(StaticSelector::new(Arc::new(push), Arc::new(pull)));
    let drivers: Vec<Arc<dyn FeatureDriver>> = vec![
        Arc::new(HelmDriver::new()),
        Arc::new(ResourcesDriver::new(KubeRenderer::new(client))),
    ];
    Ok(Arc::new(Reconciler::new(store, drivers, selector, EngineConfig::from_env())))
}

fn queue_cap() -> usize {
    std::env::var("FLOTILLA_QUEUE_CAP").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(1024)
}

fn spawn_watchers(
    gvks: Vec<(String, ClusterKind)>,
    namespace: Option<String>,
) -> InventoryHandle {
    let (delta_tx, handle) = spawn_ingest(queue_cap());
    for (gvk, kind) in gvks {
        let tx = delta_tx.clone();
        let ns = namespace.clone();
        tokio::spawn(async move {
            if let Err(e) = start_cluster_watcher(&gvk, ns.as_deref(), kind, tx).await {
                error!(gvk = %gvk, error = ?e, "cluster watcher failed");
            }
        });
    }
    handle
}

/// Wait for the first non-empty snapshot so a one-shot pass sees clusters.
async fn wait_first_epoch(handle: &InventoryHandle) {
    let wait_secs =
        std::env::var("FLOTILLA_WAIT_SECS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(8);
    let mut rx = handle.subscribe_epoch();
    let deadline = Instant::now() + Duration::from_secs(wait_secs);
    while *rx.borrow() == 0 {
        let now = Instant::now();
        if now >= deadline {
            warn!("no inventory snapshot within {}s; proceeding with what we have", wait_secs);
            break;
        }
        let rem = deadline.duration_since(now).min(Duration::from_secs(2));
        if tokio::time::timeout(rem, rx.changed()).await.is_err() {
            break;
        }
    }
}

fn print_summary(summary: &PassSummary) {
    println!(
        "reconciled={} blocked={} skipped={} failed={} cleaned={}",
        summary.reconciled, summary.blocked, summary.skipped, summary.failed, summary.cleaned
    );
    print_orphans(&summary.orphans);
}

fn print_orphans(orphans: &[OrphanReport]) {
    for o in orphans {
        eprintln!("orphaned: {} feature={} error={}", o.key, o.feature, o.error);
    }
}

fn print_records(records: &[DeploymentRecord], output: Output) -> Result<()> {
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(records)?),
        Output::Human => {
            println!("{:<40} {:<10} {:<13} GEN  ERROR", "RECORD", "FEATURE", "STATE");
            for rec in records {
                for (feature, status) in &rec.status {
                    println!(
                        "{:<40} {:<10} {:<13} {:<4} {}",
                        rec.key.to_string(),
                        feature.to_string(),
                        format!("{:?}", status.state),
                        status.observed_generation,
                        status.error.as_deref().unwrap_or("-")
                    );
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            profiles,
            cluster_gvk,
            lite_gvk,
            namespace,
            interval,
            staging_ns,
            kubeconfig_dir,
        } => {
            let reconciler = build_reconciler(&staging_ns, kubeconfig_dir).await?;
            let handle = spawn_watchers(
                vec![(cluster_gvk, ClusterKind::Managed), (lite_gvk, ClusterKind::Lite)],
                namespace,
            );

            let loaded = load_profiles(&profiles)?;
            info!(profiles = loaded.len(), "profiles loaded");
            let shared = Arc::new(RwLock::new(loaded));

            // Re-read profile files on the pass period so edits land
            // without a restart.
            tokio::spawn({
                let shared = shared.clone();
                let path = profiles.clone();
                async move {
                    let mut ticker = tokio::time::interval(Duration::from_secs(interval));
                    loop {
                        ticker.tick().await;
                        match load_profiles(&path) {
                            Ok(p) => *shared.write().unwrap() = p,
                            Err(e) => warn!(error = %e, "profile reload failed; keeping previous set"),
                        }
                    }
                }
            });

            let loop_handle =
                reconciler.spawn_loop(shared, handle, Duration::from_secs(interval));
            info!("flotilla running; Ctrl-C to stop");
            signal::ctrl_c().await?;
            loop_handle.cancel();
            info!("shutdown complete");
        }
        Commands::Reconcile {
            profiles,
            inventory,
            cluster_gvk,
            namespace,
            staging_ns,
            kubeconfig_dir,
        } => {
            let reconciler = build_reconciler(&staging_ns, kubeconfig_dir).await?;
            let snap = match inventory {
                Some(path) => load_inventory(&path)?,
                None => {
                    let handle = spawn_watchers(
                        vec![(cluster_gvk, ClusterKind::Managed)],
                        namespace,
                    );
                    wait_first_epoch(&handle).await;
                    handle.current()
                }
            };
            let loaded = load_profiles(&profiles)?;
            info!(profiles = loaded.len(), clusters = snap.clusters.len(), "single pass");
            let summary = reconciler.pass(&loaded, &snap).await;
            print_summary(&summary);
            let records = reconciler.store().list(None).await?;
            print_records(&records, cli.output)?;
        }
        Commands::Validate { profiles, inventory } => {
            let snap = load_inventory(&inventory)?;
            let loaded = load_profiles(&profiles)?;
            for profile in &loaded {
                let matched = match_clusters(&profile.spec.selector, &snap);
                match cli.output {
                    Output::Human => {
                        println!("{} ({} clusters)", profile.name, matched.len());
                        for c in &matched {
                            println!("  {}", c);
                        }
                    }
                    Output::Json => {
                        #[derive(serde::Serialize)]
                        struct Row<'a> {
                            profile: &'a str,
                            clusters: Vec<String>,
                        }
                        let row = Row {
                            profile: &profile.name,
                            clusters: matched.iter().map(|c| c.to_string()).collect(),
                        };
                        println!("{}", serde_json::to_string_pretty(&row)?);
                    }
                }
            }
        }
        Commands::Delete {
            profile,
            profiles,
            inventory,
            cluster_gvk,
            namespace,
            staging_ns,
            kubeconfig_dir,
        } => {
            let reconciler = build_reconciler(&staging_ns, kubeconfig_dir).await?;
            let snap = match inventory {
                Some(path) => load_inventory(&path)?,
                None => {
                    let handle = spawn_watchers(
                        vec![(cluster_gvk, ClusterKind::Managed)],
                        namespace,
                    );
                    wait_first_epoch(&handle).await;
                    handle.current()
                }
            };
            // The store is per-process, so records for the doomed profile
            // have to be materialized by a pass over the remaining ones
            // before cleanup can route their teardown.
            let mut loaded = load_profiles(&profiles)?;
            let Some(pos) = loaded.iter().position(|p| p.name == profile) else {
                anyhow::bail!("profile not found in {}: {}", profiles.display(), profile);
            };
            let doomed = loaded.remove(pos);
            reconciler.pass(&[doomed], &snap).await;
            let orphans = reconciler.delete_profile(&profile, &snap).await?;
            print_orphans(&orphans);
            info!(profile = %profile, "profile deleted");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn multi_document_profile_file_loads_sorted() {
        let mut file = tempfile::NamedTempFile::with_suffix(".yaml").unwrap();
        write!(
            file,
            "name: zeta\ngeneration: 1\nspec: {{}}\n---\nname: alpha\ngeneration: 2\nspec:\n  sync_mode: Once\n"
        )
        .unwrap();
        let profiles = load_profiles(file.path()).unwrap();
        assert_eq!(profiles.len(), 2);
        assert_eq!(profiles[0].name, "alpha");
        assert_eq!(profiles[0].spec.sync_mode, flotilla_core::SyncMode::Once);
        assert_eq!(profiles[1].name, "zeta");
    }

    #[test]
    fn inventory_file_round_trips_entries() {
        let entries = vec![flotilla_inventory::ClusterEntry::Managed(
            flotilla_inventory::ManagedCluster {
                id: flotilla_core::ClusterId::new(ClusterKind::Managed, "default", "c1"),
                paused: false,
                labels: [("env".to_string(), "fv".to_string())].into_iter().collect(),
                transport: flotilla_core::TransportMode::Push,
            },
        )];
        let mut file = tempfile::NamedTempFile::with_suffix(".yaml").unwrap();
        write!(file, "{}", serde_yaml::to_string(&entries).unwrap()).unwrap();
        let snap = load_inventory(file.path()).unwrap();
        assert_eq!(snap.clusters.len(), 1);
        assert_eq!(snap.clusters[0].id().name, "c1");
    }
}
