use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use draftwork_config::{CircuitBreakerConfig, StorageConfig};
use draftwork_domain::{Collection, StoredRecord};
use draftwork_errors::{RuntimeError, RuntimeResult};
use draftwork_infrastructure::{
    CacheOptions, CircuitBreaker, PutOptions, SessionBackend, SqliteBackend, StorageBackend,
    TieredStorage,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

fn quick_breaker() -> Arc<CircuitBreaker> {
    Arc::new(CircuitBreaker::new(
        "storage.durable",
        CircuitBreakerConfig {
            max_retries: 0,
            call_timeout: Duration::from_secs(2),
            ..Default::default()
        },
    ))
}

fn session_only_config() -> StorageConfig {
    StorageConfig {
        durable_enabled: false,
        ..Default::default()
    }
}

async fn sqlite_storage() -> (tempfile::TempDir, Arc<SqliteBackend>, TieredStorage) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("draftwork.db").display());
    let backend = Arc::new(SqliteBackend::connect(&url, 2).await.unwrap());
    let storage =
        TieredStorage::new(StorageConfig::default(), quick_breaker()).with_durable(backend.clone());
    assert!(storage.init().await);
    (dir, backend, storage)
}

/// Accepts the health probe, then fails every operation.
#[derive(Default)]
struct FailingBackend {
    calls: AtomicUsize,
    healthy: bool,
}

impl FailingBackend {
    fn reachable() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            healthy: true,
        }
    }

    fn fail(&self) -> RuntimeError {
        self.calls.fetch_add(1, Ordering::SeqCst);
        RuntimeError::storage("disk I/O error")
    }
}

#[async_trait]
impl StorageBackend for FailingBackend {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn health_check(&self) -> RuntimeResult<()> {
        if self.healthy {
            Ok(())
        } else {
            Err(RuntimeError::storage("unable to open database file"))
        }
    }

    async fn put(&self, _collection: Collection, _record: StoredRecord) -> RuntimeResult<()> {
        Err(self.fail())
    }

    async fn get(&self, _collection: Collection, _key: &str) -> RuntimeResult<Option<StoredRecord>> {
        Err(self.fail())
    }

    async fn delete(&self, _collection: Collection, _key: &str) -> RuntimeResult<bool> {
        Err(self.fail())
    }

    async fn list(&self, _collection: Collection) -> RuntimeResult<Vec<StoredRecord>> {
        Err(self.fail())
    }

    async fn clear(&self, _collection: Collection) -> RuntimeResult<()> {
        Err(self.fail())
    }

    async fn delete_expired(&self, _now_ms: i64) -> RuntimeResult<usize> {
        Err(self.fail())
    }
}

/// Healthy store whose writes can be switched off, like a disk that fills
/// up and is later freed.
#[derive(Default)]
struct FlakyBackend {
    inner: SessionBackend,
    reject_writes: AtomicBool,
}

impl FlakyBackend {
    fn set_rejecting(&self, rejecting: bool) {
        self.reject_writes.store(rejecting, Ordering::SeqCst);
    }

    fn check_write(&self) -> RuntimeResult<()> {
        if self.reject_writes.load(Ordering::SeqCst) {
            Err(RuntimeError::storage("database or disk is full"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StorageBackend for FlakyBackend {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn health_check(&self) -> RuntimeResult<()> {
        Ok(())
    }

    async fn put(&self, collection: Collection, record: StoredRecord) -> RuntimeResult<()> {
        self.check_write()?;
        self.inner.put(collection, record).await
    }

    async fn get(&self, collection: Collection, key: &str) -> RuntimeResult<Option<StoredRecord>> {
        self.inner.get(collection, key).await
    }

    async fn delete(&self, collection: Collection, key: &str) -> RuntimeResult<bool> {
        self.check_write()?;
        self.inner.delete(collection, key).await
    }

    async fn list(&self, collection: Collection) -> RuntimeResult<Vec<StoredRecord>> {
        self.inner.list(collection).await
    }

    async fn clear(&self, collection: Collection) -> RuntimeResult<()> {
        self.check_write()?;
        self.inner.clear(collection).await
    }

    async fn delete_expired(&self, now_ms: i64) -> RuntimeResult<usize> {
        self.inner.delete_expired(now_ms).await
    }
}

async fn flaky_storage() -> (Arc<FlakyBackend>, TieredStorage) {
    let flaky = Arc::new(FlakyBackend::default());
    let storage =
        TieredStorage::new(StorageConfig::default(), quick_breaker()).with_durable(flaky.clone());
    assert!(storage.init().await);
    (flaky, storage)
}

fn contents(documents: &[draftwork_domain::StoredDocument]) -> Vec<&str> {
    documents.iter().map(|doc| doc.content.as_str()).collect()
}

#[tokio::test]
async fn small_document_round_trip_is_not_compressed() {
    let (_dir, backend, storage) = sqlite_storage().await;
    let content = "a".repeat(100);

    assert!(
        storage
            .put("document_1", &content, json!({"name": "cv.txt"}), PutOptions::default())
            .await
    );

    let raw = backend
        .get(Collection::Documents, "document_1")
        .await
        .unwrap()
        .unwrap();
    assert!(!raw.compressed);

    storage.clear_memory().await;
    let doc = storage.get("document_1").await.unwrap();
    assert_eq!(doc.content, content);
    assert_eq!(doc.metadata["name"], "cv.txt");
}

#[tokio::test]
async fn large_document_is_compressed_and_restored() {
    let (_dir, backend, storage) = sqlite_storage().await;
    let content = "Led a team of five engineers building storage systems. ".repeat(400);
    assert!(content.len() > 20 * 1024);

    assert!(storage.put("document_2", &content, json!({}), PutOptions::default()).await);

    let raw = backend
        .get(Collection::Documents, "document_2")
        .await
        .unwrap()
        .unwrap();
    assert!(raw.compressed);
    assert!(raw.payload.len() < content.len());
    assert_eq!(raw.original_size, content.len());

    // force the read through the durable tier
    storage.clear_memory().await;
    let doc = storage.get("document_2").await.unwrap();
    assert_eq!(doc.content, content);

    let metrics = storage.metrics().await;
    assert!(metrics.compression_ratio < 1.0);
    assert!(metrics.durable_available);
    assert_eq!(metrics.errors, 0);
}

#[tokio::test]
async fn expired_entries_read_as_absent() {
    let storage = TieredStorage::new(session_only_config(), quick_breaker());
    assert!(!storage.init().await);

    let options = PutOptions::default().with_expiry(Duration::from_millis(100));
    assert!(storage.put("document_tmp", "short lived", json!({}), options).await);
    assert!(storage.get("document_tmp").await.is_some());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(storage.get("document_tmp").await.is_none());

    // also absent after the hot tier is gone
    storage.clear_memory().await;
    assert!(storage.get("document_tmp").await.is_none());
    assert!(storage.metrics().await.cache_misses >= 2);
}

#[tokio::test]
async fn writes_fall_back_to_session_when_durable_fails() {
    let failing = Arc::new(FailingBackend::reachable());
    let storage = TieredStorage::new(StorageConfig::default(), quick_breaker())
        .with_durable(failing.clone());
    assert!(storage.init().await);

    assert!(
        storage
            .put("jd_42", "Rust engineer", json!({"source": "wizard"}), PutOptions::default())
            .await
    );
    assert!(storage.metrics().await.errors >= 1);
    assert!(failing.calls.load(Ordering::SeqCst) >= 1);

    storage.clear_memory().await;
    let doc = storage.get("jd_42").await.expect("served from session tier");
    assert_eq!(doc.content, "Rust engineer");
    assert_eq!(doc.metadata["source"], "wizard");
}

#[tokio::test]
async fn unavailable_durable_backend_falls_back_permanently() {
    let broken = Arc::new(FailingBackend::default());
    let storage =
        TieredStorage::new(StorageConfig::default(), quick_breaker()).with_durable(broken.clone());

    assert!(!storage.init().await);
    // idempotent
    assert!(!storage.init().await);

    assert!(storage.put("document_9", "body", json!({}), PutOptions::default()).await);
    storage.clear_memory().await;
    assert_eq!(storage.get("document_9").await.unwrap().content, "body");

    let metrics = storage.metrics().await;
    assert!(!metrics.durable_available);
    assert_eq!(metrics.errors, 1);
    // the backend is never touched after the failed probe
    assert_eq!(broken.calls.load(Ordering::SeqCst), 0);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct WizardDraft {
    title: String,
    skills: Vec<String>,
}

#[tokio::test]
async fn cache_and_settings_are_typed() {
    let (_dir, _backend, storage) = sqlite_storage().await;
    let draft = WizardDraft {
        title: "Backend Engineer".to_string(),
        skills: vec!["rust".to_string(), "sqlx".to_string()],
    };

    assert!(storage.set_cache("draft_1", &draft, CacheOptions::default()).await);
    storage.clear_memory().await;
    assert_eq!(storage.get_cache::<WizardDraft>("draft_1").await, Some(draft));

    // wrong shape reads as absent
    assert_eq!(storage.get_cache::<Vec<u32>>("draft_1").await, None);

    assert!(storage.set_setting("theme", "dark").await);
    assert_eq!(storage.get_setting::<String>("theme").await.as_deref(), Some("dark"));
    assert!(storage.get("theme").await.is_none());
}

#[tokio::test]
async fn list_clear_and_delete() {
    let (_dir, _backend, storage) = sqlite_storage().await;
    let generated = PutOptions::in_collection(Collection::GeneratedRecords);

    for i in 0..3 {
        assert!(storage.put(&format!("jd_{i}"), "text", json!({"i": i}), generated).await);
    }
    assert_eq!(storage.list_all(Collection::GeneratedRecords).await.len(), 3);
    assert!(storage.list_all(Collection::Documents).await.is_empty());

    assert!(storage.delete_from(Collection::GeneratedRecords, "jd_0").await);
    assert!(!storage.delete_from(Collection::GeneratedRecords, "jd_0").await);
    assert_eq!(storage.list_all(Collection::GeneratedRecords).await.len(), 2);

    assert!(storage.clear(Collection::GeneratedRecords).await);
    assert!(storage.list_all(Collection::GeneratedRecords).await.is_empty());
    assert!(storage.get_from(Collection::GeneratedRecords, "jd_1").await.is_none());

    let metrics = storage.metrics().await;
    assert_eq!(metrics.writes, 3);
    assert_eq!(metrics.deletes, 2);
}

#[tokio::test]
async fn sweep_removes_expired_rows() {
    let (_dir, backend, storage) = sqlite_storage().await;
    let short = CacheOptions::expiring_in(Duration::from_millis(50));
    assert!(storage.set_cache("k1", &1, short).await);
    assert!(storage.set_cache("k2", &2, CacheOptions::default()).await);

    tokio::time::sleep(Duration::from_millis(100)).await;
    // memory copy plus durable row
    assert_eq!(storage.sweep_expired().await, 2);
    assert!(backend.get(Collection::Cache, "k1").await.unwrap().is_none());
    assert!(backend.get(Collection::Cache, "k2").await.unwrap().is_some());
}

#[tokio::test]
async fn maintenance_starts_and_stops() {
    let config = StorageConfig {
        durable_enabled: false,
        memory_prune_interval: Duration::from_millis(20),
        sweep_interval: Duration::from_millis(20),
        ..Default::default()
    };
    let storage = Arc::new(TieredStorage::new(config, quick_breaker()));
    storage.init().await;

    let options = PutOptions::default().with_expiry(Duration::from_millis(10));
    assert!(storage.put("document_x", "gone soon", json!({}), options).await);

    storage.start_maintenance().await;
    storage.start_maintenance().await;
    tokio::time::sleep(Duration::from_millis(120)).await;
    storage.shutdown().await;

    // the loops already dropped it; nothing left to sweep
    assert_eq!(storage.sweep_expired().await, 0);
}

#[tokio::test]
async fn fallback_write_is_not_shadowed_by_older_durable_copy() {
    let (flaky, storage) = flaky_storage().await;
    let generated = PutOptions::in_collection(Collection::GeneratedRecords);

    assert!(storage.put("jd_1", "v1", json!({}), generated).await);
    flaky.set_rejecting(true);
    assert!(storage.put("jd_1", "v2", json!({}), generated).await);

    storage.clear_memory().await;
    let doc = storage.get_from(Collection::GeneratedRecords, "jd_1").await.unwrap();
    assert_eq!(doc.content, "v2");
    let listed = storage.list_all(Collection::GeneratedRecords).await;
    assert_eq!(contents(&listed), vec!["v2"]);

    // once the durable tier takes writes again its copy is current
    flaky.set_rejecting(false);
    assert!(storage.put("jd_1", "v3", json!({}), generated).await);
    storage.clear_memory().await;
    let doc = storage.get_from(Collection::GeneratedRecords, "jd_1").await.unwrap();
    assert_eq!(doc.content, "v3");
    let listed = storage.list_all(Collection::GeneratedRecords).await;
    assert_eq!(contents(&listed), vec!["v3"]);
}

#[tokio::test]
async fn failed_durable_delete_does_not_resurrect_the_record() {
    let (flaky, storage) = flaky_storage().await;

    assert!(storage.put("document_7", "resume", json!({}), PutOptions::default()).await);
    flaky.set_rejecting(true);
    storage.delete("document_7").await;
    assert!(storage.metrics().await.errors >= 1);

    storage.clear_memory().await;
    assert!(storage.get("document_7").await.is_none());
    assert!(storage.list_all(Collection::Documents).await.is_empty());

    // a later write under the same key is visible again
    flaky.set_rejecting(false);
    assert!(storage.put("document_7", "resume v2", json!({}), PutOptions::default()).await);
    storage.clear_memory().await;
    assert_eq!(storage.get("document_7").await.unwrap().content, "resume v2");
}

#[tokio::test]
async fn failed_durable_clear_hides_existing_rows() {
    let (flaky, storage) = flaky_storage().await;
    for i in 0..2 {
        assert!(storage.put(&format!("document_{i}"), "body", json!({}), PutOptions::default()).await);
    }

    flaky.set_rejecting(true);
    assert!(!storage.clear(Collection::Documents).await);
    storage.clear_memory().await;
    assert!(storage.list_all(Collection::Documents).await.is_empty());
    assert!(storage.get("document_0").await.is_none());
}

#[tokio::test]
async fn hot_tier_holds_exactly_what_was_persisted() {
    let (flaky, storage) = flaky_storage().await;

    assert!(storage.put("document_3", "first", json!({}), PutOptions::default()).await);
    flaky.set_rejecting(true);
    assert!(storage.put("document_3", "second", json!({}), PutOptions::default()).await);

    // served from memory and from the tiers alike
    assert_eq!(storage.get("document_3").await.unwrap().content, "second");
    storage.clear_memory().await;
    assert_eq!(storage.get("document_3").await.unwrap().content, "second");
}
