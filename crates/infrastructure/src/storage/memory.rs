use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use draftwork_domain::{now_millis, Collection, StoredRecord};
use draftwork_errors::RuntimeResult;
use tokio::sync::RwLock;
use tracing::debug;

use super::StorageBackend;

type EntryKey = (Collection, String);

struct MemoryEntry {
    record: StoredRecord,
    last_access: AtomicU64,
}

/// Hot tier. Holds uncompressed records, bounded by entry count with
/// least-recently-accessed eviction.
pub struct MemoryCache {
    entries: RwLock<HashMap<EntryKey, MemoryEntry>>,
    max_entries: usize,
    clock: AtomicU64,
}

impl MemoryCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries: max_entries.max(1),
            clock: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub async fn insert(&self, collection: Collection, record: StoredRecord) {
        let key = (collection, record.key.clone());
        let access = self.tick();
        let mut entries = self.entries.write().await;

        if !entries.contains_key(&key) && entries.len() >= self.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_access.load(Ordering::Relaxed))
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                debug!("Evicting {}:{} from memory tier", oldest.0, oldest.1);
                entries.remove(&oldest);
            }
        }

        entries.insert(
            key,
            MemoryEntry {
                record,
                last_access: AtomicU64::new(access),
            },
        );
    }

    /// Live records only. An expired hit is dropped and reported as a miss.
    pub async fn lookup(&self, collection: Collection, key: &str) -> Option<StoredRecord> {
        let lookup_key = (collection, key.to_string());
        {
            let entries = self.entries.read().await;
            match entries.get(&lookup_key) {
                Some(entry) if !entry.record.is_expired() => {
                    entry.last_access.store(self.tick(), Ordering::Relaxed);
                    return Some(entry.record.clone());
                }
                Some(_) => {}
                None => return None,
            }
        }

        let mut entries = self.entries.write().await;
        if matches!(entries.get(&lookup_key), Some(entry) if entry.record.is_expired()) {
            entries.remove(&lookup_key);
        }
        None
    }

    pub async fn remove(&self, collection: Collection, key: &str) -> bool {
        self.entries
            .write()
            .await
            .remove(&(collection, key.to_string()))
            .is_some()
    }

    pub async fn clear_collection(&self, collection: Collection) {
        self.entries.write().await.retain(|(c, _), _| *c != collection);
    }

    pub async fn clear_all(&self) {
        self.entries.write().await.clear();
    }

    pub async fn prune_expired(&self, now_ms: i64) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.record.is_expired_at(now_ms));
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_entries
    }
}

#[async_trait]
impl StorageBackend for MemoryCache {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn health_check(&self) -> RuntimeResult<()> {
        Ok(())
    }

    async fn put(&self, collection: Collection, record: StoredRecord) -> RuntimeResult<()> {
        self.insert(collection, record).await;
        Ok(())
    }

    async fn get(&self, collection: Collection, key: &str) -> RuntimeResult<Option<StoredRecord>> {
        Ok(self.lookup(collection, key).await)
    }

    async fn delete(&self, collection: Collection, key: &str) -> RuntimeResult<bool> {
        Ok(self.remove(collection, key).await)
    }

    async fn list(&self, collection: Collection) -> RuntimeResult<Vec<StoredRecord>> {
        let now = now_millis();
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .filter(|((c, _), entry)| *c == collection && !entry.record.is_expired_at(now))
            .map(|(_, entry)| entry.record.clone())
            .collect())
    }

    async fn clear(&self, collection: Collection) -> RuntimeResult<()> {
        self.clear_collection(collection).await;
        Ok(())
    }

    async fn delete_expired(&self, now_ms: i64) -> RuntimeResult<usize> {
        Ok(self.prune_expired(now_ms).await)
    }
}
