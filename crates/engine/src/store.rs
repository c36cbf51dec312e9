//! Deployment-record storage with optimistic concurrency.
//!
//! The store owns the revision counter: every successful update bumps it,
//! and an update carrying a stale revision fails with Conflict so the
//! caller can re-read and merge (single-writer discipline per feature).

use std::sync::Mutex;

use async_trait::async_trait;
use rustc_hash::FxHashMap;

use flotilla_core::{DeliveryError, DeliveryResult, DeploymentRecord, RecordKey};

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// All records, optionally narrowed to one owning profile.
    async fn list(&self, profile: Option<&str>) -> DeliveryResult<Vec<DeploymentRecord>>;

    async fn get(&self, key: &RecordKey) -> DeliveryResult<Option<DeploymentRecord>>;

    /// Fails with Conflict when a record for the key already exists.
    async fn create(&self, record: DeploymentRecord) -> DeliveryResult<DeploymentRecord>;

    /// Conditional write: fails with Conflict unless `record.revision`
    /// matches the stored revision. Returns the stored record (bumped).
    async fn update(&self, record: DeploymentRecord) -> DeliveryResult<DeploymentRecord>;

    async fn delete(&self, key: &RecordKey) -> DeliveryResult<()>;
}

/// In-memory store; the backing map is the only shared mutable state and
/// every access holds the lock for the whole read-modify-write.
#[derive(Default)]
pub struct MemStore {
    records: Mutex<FxHashMap<RecordKey, DeploymentRecord>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemStore {
    async fn list(&self, profile: Option<&str>) -> DeliveryResult<Vec<DeploymentRecord>> {
        let map = self.records.lock().unwrap();
        let mut out: Vec<DeploymentRecord> = map
            .values()
            .filter(|r| profile.map(|p| r.key.profile == p).unwrap_or(true))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    async fn get(&self, key: &RecordKey) -> DeliveryResult<Option<DeploymentRecord>> {
        Ok(self.records.lock().unwrap().get(key).cloned())
    }

    async fn create(&self, mut record: DeploymentRecord) -> DeliveryResult<DeploymentRecord> {
        let mut map = self.records.lock().unwrap();
        if map.contains_key(&record.key) {
            return Err(DeliveryError::Conflict(format!("record exists: {}", record.key)));
        }
        record.revision = 1;
        map.insert(record.key.clone(), record.clone());
        metrics::counter!("record_created", 1u64);
        Ok(record)
    }

    async fn update(&self, mut record: DeploymentRecord) -> DeliveryResult<DeploymentRecord> {
        let mut map = self.records.lock().unwrap();
        let stored = map
            .get(&record.key)
            .ok_or_else(|| DeliveryError::NotFound(format!("no record: {}", record.key)))?;
        if stored.revision != record.revision {
            return Err(DeliveryError::Conflict(format!(
                "record {} changed (rv {} -> {})",
                record.key, record.revision, stored.revision
            )));
        }
        record.revision += 1;
        map.insert(record.key.clone(), record.clone());
        Ok(record)
    }

    async fn delete(&self, key: &RecordKey) -> DeliveryResult<()> {
        let mut map = self.records.lock().unwrap();
        match map.remove(key) {
            Some(_) => {
                metrics::counter!("record_deleted", 1u64);
                Ok(())
            }
            None => Err(DeliveryError::NotFound(format!("no record: {}", key))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_core::{ClusterId, ClusterKind, Profile, ProfileSpec};

    fn record(profile: &str, cluster: &str) -> DeploymentRecord {
        let p = Profile { name: profile.into(), generation: 1, spec: ProfileSpec::default() };
        DeploymentRecord::new(&p, ClusterId::new(ClusterKind::Managed, "default", cluster))
    }

    #[tokio::test]
    async fn create_then_duplicate_conflicts() {
        let store = MemStore::new();
        let r = store.create(record("p", "c1")).await.unwrap();
        assert_eq!(r.revision, 1);
        let err = store.create(record("p", "c1")).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Conflict(_)));
    }

    #[tokio::test]
    async fn stale_update_conflicts() {
        let store = MemStore::new();
        let r = store.create(record("p", "c1")).await.unwrap();

        let mut fresh = r.clone();
        fresh.processed_once = true;
        let fresh = store.update(fresh).await.unwrap();
        assert_eq!(fresh.revision, 2);

        // Writer still holding revision 1 loses.
        let mut stale = r;
        stale.finalizing = true;
        let err = store.update(stale).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Conflict(_)));
    }

    #[tokio::test]
    async fn list_filters_by_profile_and_sorts() {
        let store = MemStore::new();
        store.create(record("b", "c2")).await.unwrap();
        store.create(record("b", "c1")).await.unwrap();
        store.create(record("a", "c1")).await.unwrap();

        let all = store.list(None).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].key.profile, "a");

        let b = store.list(Some("b")).await.unwrap();
        assert_eq!(b.len(), 2);
        assert_eq!(b[0].key.cluster.name, "c1");
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let store = MemStore::new();
        let r = record("p", "c1");
        assert!(matches!(store.delete(&r.key).await.unwrap_err(), DeliveryError::NotFound(_)));
    }
}
