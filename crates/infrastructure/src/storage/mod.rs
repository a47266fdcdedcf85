//! Tiered storage: a hot in-memory tier in front of a durable SQLite store,
//! with an always-available session store as fallback.

pub mod memory;
pub mod metrics;
pub mod session;
pub mod sqlite;
pub mod tiered;

use std::time::Duration;

use async_trait::async_trait;
use draftwork_domain::{Collection, StoredRecord};
use draftwork_errors::RuntimeResult;

pub use memory::MemoryCache;
pub use metrics::StorageMetrics;
pub use session::SessionBackend;
pub use sqlite::SqliteBackend;
pub use tiered::TieredStorage;

/// A place records can live. Implementations store records as given and
/// never compress or decompress on their own.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Cheap probe used once at startup.
    async fn health_check(&self) -> RuntimeResult<()>;

    /// Insert or replace by key.
    async fn put(&self, collection: Collection, record: StoredRecord) -> RuntimeResult<()>;

    async fn get(&self, collection: Collection, key: &str) -> RuntimeResult<Option<StoredRecord>>;

    /// `true` if something was removed.
    async fn delete(&self, collection: Collection, key: &str) -> RuntimeResult<bool>;

    async fn list(&self, collection: Collection) -> RuntimeResult<Vec<StoredRecord>>;

    async fn clear(&self, collection: Collection) -> RuntimeResult<()>;

    /// Removes every record whose expiry is at or before `now_ms`, across
    /// all collections.
    async fn delete_expired(&self, now_ms: i64) -> RuntimeResult<usize>;

    async fn close(&self) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PutOptions {
    pub collection: Collection,
    pub expiry: Option<Duration>,
}

impl PutOptions {
    pub fn in_collection(collection: Collection) -> Self {
        Self {
            collection,
            expiry: None,
        }
    }

    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.expiry = Some(expiry);
        self
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheOptions {
    /// Falls back to `storage.default_cache_ttl`
    pub expiry: Option<Duration>,
}

impl CacheOptions {
    pub fn expiring_in(expiry: Duration) -> Self {
        Self {
            expiry: Some(expiry),
        }
    }
}
