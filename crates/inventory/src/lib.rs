//! Flotilla inventory: cluster snapshots, capability variants, matching.
//!
//! The inventory is published as an immutable snapshot behind an `ArcSwap`;
//! a small ingest loop coalesces cluster deltas (from a kube watcher or from
//! files) and swaps fresh snapshots for readers. Reconciliation passes take
//! one snapshot and never observe mid-pass mutation.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use arc_swap::ArcSwap;
use futures::TryStreamExt;
use kube::{
    api::Api,
    core::{DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use flotilla_core::{ClusterId, ClusterKind, Selector, TransportMode};

/// Annotation selecting pull delivery for a cluster.
pub const TRANSPORT_ANNOTATION: &str = "flotilla.io/transport";

/// Capability surface the engine needs from any cluster variant.
pub trait ClusterCapability {
    fn id(&self) -> &ClusterId;
    fn paused(&self) -> bool;
    fn labels(&self) -> &BTreeMap<String, String>;
    fn transport(&self) -> TransportMode;
}

/// Full cluster object registered in the management plane.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManagedCluster {
    pub id: ClusterId,
    pub paused: bool,
    pub labels: BTreeMap<String, String>,
    pub transport: TransportMode,
}

/// Lightweight registration: just a kubeconfig reference plus labels.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LiteCluster {
    pub id: ClusterId,
    pub paused: bool,
    pub labels: BTreeMap<String, String>,
    pub transport: TransportMode,
    /// Name of the secret holding the kubeconfig for this cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig_secret: Option<String>,
}

impl ClusterCapability for ManagedCluster {
    fn id(&self) -> &ClusterId {
        &self.id
    }
    fn paused(&self) -> bool {
        self.paused
    }
    fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }
    fn transport(&self) -> TransportMode {
        self.transport
    }
}

impl ClusterCapability for LiteCluster {
    fn id(&self) -> &ClusterId {
        &self.id
    }
    fn paused(&self) -> bool {
        self.paused
    }
    fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }
    fn transport(&self) -> TransportMode {
        self.transport
    }
}

/// The two inventory variants, treated uniformly through the trait.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ClusterEntry {
    Managed(ManagedCluster),
    Lite(LiteCluster),
}

impl ClusterEntry {
    pub fn capability(&self) -> &dyn ClusterCapability {
        match self {
            ClusterEntry::Managed(c) => c,
            ClusterEntry::Lite(c) => c,
        }
    }

    pub fn id(&self) -> &ClusterId {
        self.capability().id()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ClusterDeltaKind {
    Upserted,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct ClusterDelta {
    pub id: ClusterId,
    pub kind: ClusterDeltaKind,
    /// Present for upserts, absent for deletions.
    pub entry: Option<ClusterEntry>,
}

/// Immutable inventory snapshot; items sorted by identity for deterministic
/// downstream iteration.
#[derive(Debug, Clone, Default)]
pub struct InventorySnapshot {
    pub epoch: u64,
    pub clusters: Vec<ClusterEntry>,
}

impl InventorySnapshot {
    pub fn get(&self, id: &ClusterId) -> Option<&ClusterEntry> {
        self.clusters.iter().find(|c| c.id() == id)
    }
}

/// Resolve a profile selector against a snapshot. Pure, deterministic:
/// output sorted by cluster identity. Pause does not affect matching.
pub fn match_clusters(selector: &Selector, snap: &InventorySnapshot) -> Vec<ClusterId> {
    let mut out: Vec<ClusterId> = snap
        .clusters
        .iter()
        .filter(|c| selector.matches(c.capability().labels()))
        .map(|c| c.id().clone())
        .collect();
    out.sort();
    out.dedup();
    out
}

/// Coalescing queue keyed by cluster identity, FIFO order, fixed capacity.
struct Coalescer {
    map: FxHashMap<ClusterId, ClusterDelta>,
    order: VecDeque<ClusterId>,
    cap: usize,
    dropped: u64,
}

impl Coalescer {
    fn with_capacity(cap: usize) -> Self {
        Self { map: FxHashMap::default(), order: VecDeque::new(), cap, dropped: 0 }
    }

    fn push(&mut self, d: ClusterDelta) {
        let id = d.id.clone();
        if !self.map.contains_key(&id) {
            if self.order.len() >= self.cap {
                if let Some(old) = self.order.pop_front() {
                    self.map.remove(&old);
                    self.dropped += 1;
                    metrics::counter!("inventory_deltas_dropped", 1u64);
                }
            }
            self.order.push_back(id.clone());
        }
        self.map.insert(id, d);
    }

    fn drain_ready(&mut self) -> Vec<ClusterDelta> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(id) = self.order.pop_front() {
            if let Some(d) = self.map.remove(&id) {
                out.push(d);
            }
        }
        out
    }
}

/// Builds inventory snapshots from delta batches.
pub struct InventoryBuilder {
    epoch: u64,
    clusters: FxHashMap<ClusterId, ClusterEntry>,
}

impl InventoryBuilder {
    pub fn new() -> Self {
        Self { epoch: 0, clusters: FxHashMap::default() }
    }

    pub fn apply(&mut self, batch: Vec<ClusterDelta>) {
        for d in batch {
            match d.kind {
                ClusterDeltaKind::Upserted => {
                    if let Some(entry) = d.entry {
                        self.clusters.insert(d.id, entry);
                    }
                }
                ClusterDeltaKind::Deleted => {
                    self.clusters.remove(&d.id);
                }
            }
        }
        self.epoch = self.epoch.saturating_add(1);
    }

    pub fn freeze(&self) -> Arc<InventorySnapshot> {
        let mut clusters: Vec<ClusterEntry> = self.clusters.values().cloned().collect();
        clusters.sort_by(|a, b| a.id().cmp(b.id()));
        Arc::new(InventorySnapshot { epoch: self.epoch, clusters })
    }
}

impl Default for InventoryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Read handle: current snapshot plus an epoch channel to await refreshes.
pub struct InventoryHandle {
    snap: Arc<ArcSwap<InventorySnapshot>>,
    epoch_rx: watch::Receiver<u64>,
}

impl InventoryHandle {
    pub fn current(&self) -> Arc<InventorySnapshot> {
        self.snap.load_full()
    }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.epoch_rx.clone()
    }
}

/// Spawn the ingest loop: consume deltas, coalesce, swap snapshots.
pub fn spawn_ingest(cap: usize) -> (mpsc::Sender<ClusterDelta>, InventoryHandle) {
    let (tx, mut rx) = mpsc::channel::<ClusterDelta>(cap);
    let snap = Arc::new(ArcSwap::from_pointee(InventorySnapshot::default()));
    let (epoch_tx, epoch_rx) = watch::channel(0u64);
    let snap_clone = Arc::clone(&snap);

    tokio::spawn(async move {
        let mut coalescer = Coalescer::with_capacity(cap);
        let mut builder = InventoryBuilder::new();
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(50));
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(d) => coalescer.push(d),
                        None => {
                            debug!("delta channel closed; draining and exiting inventory ingest");
                            let batch = coalescer.drain_ready();
                            if !batch.is_empty() {
                                builder.apply(batch);
                                publish(&builder, &snap_clone, &epoch_tx);
                            }
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    let batch = coalescer.drain_ready();
                    if !batch.is_empty() {
                        builder.apply(batch);
                        publish(&builder, &snap_clone, &epoch_tx);
                    }
                }
            }
        }
        info!("inventory ingest stopped");
    });

    (tx, InventoryHandle { snap, epoch_rx })
}

fn publish(builder: &InventoryBuilder, snap: &ArcSwap<InventorySnapshot>, epoch_tx: &watch::Sender<u64>) {
    let next = builder.freeze();
    let epoch = next.epoch;
    metrics::counter!("inventory_snapshots_published", 1u64);
    snap.store(next);
    let _ = epoch_tx.send(epoch);
}

fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind {
            group: String::new(),
            version: version.to_string(),
            kind: kind.to_string(),
        }),
        [group, version, kind] => Ok(GroupVersionKind {
            group: (*group).to_string(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(kube::core::ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

fn entry_from(obj: &DynamicObject, cluster_kind: ClusterKind) -> Result<ClusterEntry> {
    let ns = obj.metadata.namespace.clone().unwrap_or_default();
    let name = obj
        .metadata
        .name
        .clone()
        .ok_or_else(|| anyhow!("cluster object missing metadata.name"))?;
    let id = ClusterId::new(cluster_kind, ns, name);

    let labels: BTreeMap<String, String> = obj
        .metadata
        .labels
        .clone()
        .map(|m| m.into_iter().collect())
        .unwrap_or_default();
    let transport = match obj
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(TRANSPORT_ANNOTATION))
        .map(|s| s.as_str())
    {
        Some("pull") => TransportMode::Pull,
        _ => TransportMode::Push,
    };

    let raw = serde_json::to_value(obj).context("serializing cluster object")?;
    let paused = raw
        .get("spec")
        .and_then(|s| s.get("paused"))
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    Ok(match cluster_kind {
        ClusterKind::Managed => ClusterEntry::Managed(ManagedCluster { id, paused, labels, transport }),
        ClusterKind::Lite => {
            let kubeconfig_secret = raw
                .get("spec")
                .and_then(|s| s.get("kubeconfigSecret"))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
            ClusterEntry::Lite(LiteCluster { id, paused, labels, transport, kubeconfig_secret })
        }
    })
}

/// Start list+watch for cluster objects of one GVK and feed coalesced deltas
/// into the ingest channel. Runs until the stream ends or errors.
pub async fn start_cluster_watcher(
    gvk_key: &str,
    namespace: Option<&str>,
    cluster_kind: ClusterKind,
    delta_tx: mpsc::Sender<ClusterDelta>,
) -> Result<()> {
    let client = Client::try_default().await?;
    let gvk = parse_gvk_key(gvk_key)?;
    let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;

    let api: Api<DynamicObject> = if namespaced {
        match namespace {
            Some(ns) => Api::namespaced_with(client.clone(), ns, &ar),
            None => Api::all_with(client.clone(), &ar),
        }
    } else {
        Api::all_with(client.clone(), &ar)
    };

    let cfg = watcher::Config::default();
    let stream = watcher::watcher(api, cfg);
    futures::pin_mut!(stream);
    info!(gvk = %gvk_key, ns = ?namespace, kind = cluster_kind.as_str(), "cluster watcher started");
    while let Some(ev) = stream.try_next().await? {
        match ev {
            Event::Applied(o) => {
                let entry = entry_from(&o, cluster_kind)?;
                let d = ClusterDelta {
                    id: entry.id().clone(),
                    kind: ClusterDeltaKind::Upserted,
                    entry: Some(entry),
                };
                let _ = delta_tx.send(d).await;
            }
            Event::Deleted(o) => {
                let entry = entry_from(&o, cluster_kind)?;
                let d = ClusterDelta {
                    id: entry.id().clone(),
                    kind: ClusterDeltaKind::Deleted,
                    entry: None,
                };
                let _ = delta_tx.send(d).await;
            }
            Event::Restarted(list) => {
                debug!(count = list.len(), "cluster watch restart");
                for o in list.iter() {
                    let entry = entry_from(o, cluster_kind)?;
                    let d = ClusterDelta {
                        id: entry.id().clone(),
                        kind: ClusterDeltaKind::Upserted,
                        entry: Some(entry),
                    };
                    let _ = delta_tx.send(d).await;
                }
            }
        }
    }
    warn!("cluster watcher stream ended");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn managed(name: &str, labels: &[(&str, &str)], paused: bool) -> ClusterEntry {
        ClusterEntry::Managed(ManagedCluster {
            id: ClusterId::new(ClusterKind::Managed, "default", name),
            paused,
            labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            transport: TransportMode::Push,
        })
    }

    fn lite(name: &str, labels: &[(&str, &str)]) -> ClusterEntry {
        ClusterEntry::Lite(LiteCluster {
            id: ClusterId::new(ClusterKind::Lite, "default", name),
            paused: false,
            labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            transport: TransportMode::Pull,
            kubeconfig_secret: None,
        })
    }

    fn snap(clusters: Vec<ClusterEntry>) -> InventorySnapshot {
        let mut b = InventoryBuilder::new();
        let batch = clusters
            .into_iter()
            .map(|c| ClusterDelta { id: c.id().clone(), kind: ClusterDeltaKind::Upserted, entry: Some(c) })
            .collect();
        b.apply(batch);
        (*b.freeze()).clone()
    }

    #[test]
    fn matcher_is_deterministic_and_sorted() {
        let s = snap(vec![
            managed("zeta", &[("env", "fv")], false),
            lite("alpha", &[("env", "fv")]),
            managed("beta", &[("env", "prod")], false),
        ]);
        let mut sel = Selector::default();
        sel.match_labels.insert("env".into(), "fv".into());

        let m1 = match_clusters(&sel, &s);
        let m2 = match_clusters(&sel, &s);
        assert_eq!(m1, m2);
        assert_eq!(m1.len(), 2);
        // Managed sorts before Lite; within a kind, by namespace/name.
        assert_eq!(m1[0].name, "zeta");
        assert_eq!(m1[1].name, "alpha");
    }

    #[test]
    fn matcher_ignores_pause() {
        let s = snap(vec![managed("c1", &[("env", "fv")], true)]);
        let mut sel = Selector::default();
        sel.match_labels.insert("env".into(), "fv".into());
        assert_eq!(match_clusters(&sel, &s).len(), 1);
    }

    #[test]
    fn builder_upsert_and_delete() {
        let mut b = InventoryBuilder::new();
        let c = managed("c1", &[], false);
        b.apply(vec![ClusterDelta { id: c.id().clone(), kind: ClusterDeltaKind::Upserted, entry: Some(c.clone()) }]);
        let s1 = b.freeze();
        assert_eq!(s1.epoch, 1);
        assert_eq!(s1.clusters.len(), 1);

        b.apply(vec![ClusterDelta { id: c.id().clone(), kind: ClusterDeltaKind::Deleted, entry: None }]);
        let s2 = b.freeze();
        assert_eq!(s2.epoch, 2);
        assert!(s2.clusters.is_empty());
    }

    #[test]
    fn both_variants_expose_capabilities() {
        let m = managed("c1", &[("a", "b")], true);
        let l = lite("c2", &[("a", "b")]);
        assert!(m.capability().paused());
        assert!(!l.capability().paused());
        assert_eq!(m.capability().transport(), TransportMode::Push);
        assert_eq!(l.capability().transport(), TransportMode::Pull);
        assert_eq!(m.capability().labels().get("a").map(String::as_str), Some("b"));
    }
}
