use std::collections::HashMap;

use async_trait::async_trait;
use draftwork_domain::{Collection, StoredRecord};
use draftwork_errors::RuntimeResult;
use tokio::sync::RwLock;

use super::StorageBackend;

/// Ephemeral store that lives as long as the storage instance. Never fails,
/// which is what makes it the fallback tier.
#[derive(Default)]
pub struct SessionBackend {
    collections: RwLock<HashMap<Collection, HashMap<String, StoredRecord>>>,
}

impl SessionBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.collections.read().await.values().map(HashMap::len).sum()
    }
}

#[async_trait]
impl StorageBackend for SessionBackend {
    fn name(&self) -> &'static str {
        "session"
    }

    async fn health_check(&self) -> RuntimeResult<()> {
        Ok(())
    }

    async fn put(&self, collection: Collection, record: StoredRecord) -> RuntimeResult<()> {
        self.collections
            .write()
            .await
            .entry(collection)
            .or_default()
            .insert(record.key.clone(), record);
        Ok(())
    }

    async fn get(&self, collection: Collection, key: &str) -> RuntimeResult<Option<StoredRecord>> {
        Ok(self
            .collections
            .read()
            .await
            .get(&collection)
            .and_then(|records| records.get(key))
            .cloned())
    }

    async fn delete(&self, collection: Collection, key: &str) -> RuntimeResult<bool> {
        Ok(self
            .collections
            .write()
            .await
            .get_mut(&collection)
            .map(|records| records.remove(key).is_some())
            .unwrap_or(false))
    }

    async fn list(&self, collection: Collection) -> RuntimeResult<Vec<StoredRecord>> {
        Ok(self
            .collections
            .read()
            .await
            .get(&collection)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn clear(&self, collection: Collection) -> RuntimeResult<()> {
        self.collections.write().await.remove(&collection);
        Ok(())
    }

    async fn delete_expired(&self, now_ms: i64) -> RuntimeResult<usize> {
        let mut collections = self.collections.write().await;
        let mut removed = 0;
        for records in collections.values_mut() {
            let before = records.len();
            records.retain(|_, record| !record.is_expired_at(now_ms));
            removed += before - records.len();
        }
        Ok(removed)
    }
}
