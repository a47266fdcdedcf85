use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use draftwork_config::{StorageConfig, DURABLE_STORAGE_SERVICE};
use draftwork_domain::{now_millis, Collection, StoredDocument, StoredRecord};
use draftwork_errors::RuntimeResult;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{oneshot, Mutex, OnceCell, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use super::metrics::MetricsRecorder;
use super::{
    CacheOptions, MemoryCache, PutOptions, SessionBackend, SqliteBackend, StorageBackend,
    StorageMetrics,
};
use crate::circuit_breaker::{CallContext, CallPriority, CircuitBreaker};
use crate::circuit_registry::CircuitBreakerRegistry;
use crate::compression::{decompress, CompressionPolicy};

/// Durable deletes and clears that failed. A durable copy written at or
/// before the recorded time is treated as gone.
#[derive(Default)]
struct Tombstones {
    keys: HashMap<Collection, HashMap<String, i64>>,
    collections: HashMap<Collection, i64>,
}

impl Tombstones {
    fn hides(&self, collection: Collection, record: &StoredRecord) -> bool {
        let buried_key = self
            .keys
            .get(&collection)
            .and_then(|keys| keys.get(&record.key))
            .is_some_and(|at| record.timestamp <= *at);
        let buried_collection = self
            .collections
            .get(&collection)
            .is_some_and(|at| record.timestamp <= *at);
        buried_key || buried_collection
    }

    fn bury(&mut self, collection: Collection, key: &str, at: i64) {
        self.keys
            .entry(collection)
            .or_default()
            .insert(key.to_string(), at);
    }

    fn unbury(&mut self, collection: Collection, key: &str) {
        if let Some(keys) = self.keys.get_mut(&collection) {
            keys.remove(key);
        }
    }

    fn bury_collection(&mut self, collection: Collection, at: i64) {
        self.collections.insert(collection, at);
    }

    fn unbury_collection(&mut self, collection: Collection) {
        self.collections.remove(&collection);
        self.keys.remove(&collection);
    }
}

struct MaintenanceHandle {
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Storage facade over memory, durable and session tiers.
///
/// Public operations never fail: problems are logged, counted in
/// [`StorageMetrics::errors`] and surface as `false` / `None`.
pub struct TieredStorage {
    config: StorageConfig,
    policy: CompressionPolicy,
    memory: Arc<MemoryCache>,
    session: Arc<SessionBackend>,
    injected: Option<Arc<dyn StorageBackend>>,
    durable: OnceCell<Option<Arc<dyn StorageBackend>>>,
    breaker: Arc<CircuitBreaker>,
    tombstones: RwLock<Tombstones>,
    metrics: MetricsRecorder,
    maintenance: Mutex<Option<MaintenanceHandle>>,
}

impl TieredStorage {
    pub fn new(config: StorageConfig, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            policy: CompressionPolicy::from(&config),
            memory: Arc::new(MemoryCache::new(config.memory_cache_max_entries)),
            session: Arc::new(SessionBackend::new()),
            injected: None,
            durable: OnceCell::new(),
            breaker,
            tombstones: RwLock::new(Tombstones::default()),
            metrics: MetricsRecorder::default(),
            maintenance: Mutex::new(None),
            config,
        }
    }

    /// Uses the registry's `storage.durable` breaker.
    pub async fn from_registry(config: StorageConfig, registry: &CircuitBreakerRegistry) -> Self {
        let breaker = registry.get_or_create(DURABLE_STORAGE_SERVICE).await;
        Self::new(config, breaker)
    }

    /// Replace the configured SQLite store with `backend`.
    pub fn with_durable(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.injected = Some(backend);
        self
    }

    /// Opens the durable tier once. Returns whether it is available; when it
    /// is not, the session tier serves for the rest of this instance's life.
    pub async fn init(&self) -> bool {
        self.durable().await.is_some()
    }

    async fn durable(&self) -> Option<&Arc<dyn StorageBackend>> {
        self.durable
            .get_or_init(|| self.open_durable())
            .await
            .as_ref()
    }

    async fn open_durable(&self) -> Option<Arc<dyn StorageBackend>> {
        let candidate: RuntimeResult<Arc<dyn StorageBackend>> = match &self.injected {
            Some(backend) => backend.health_check().await.map(|_| Arc::clone(backend)),
            None if !self.config.durable_enabled => {
                info!("Durable storage disabled, using session storage");
                return None;
            }
            None => SqliteBackend::connect(&self.config.database_url, self.config.max_connections)
                .await
                .map(|backend| Arc::new(backend) as Arc<dyn StorageBackend>),
        };

        match candidate {
            Ok(backend) => {
                info!("Durable storage backend '{}' ready", backend.name());
                Some(backend)
            }
            Err(e) => {
                warn!("持久化存储不可用，回退到会话存储: {}", e);
                self.metrics.record_error().await;
                None
            }
        }
    }

    fn durable_available(&self) -> bool {
        matches!(self.durable.get(), Some(Some(_)))
    }

    #[instrument(skip(self, content, metadata), fields(collection = %options.collection))]
    pub async fn put(
        &self,
        id: &str,
        content: &str,
        metadata: serde_json::Value,
        options: PutOptions,
    ) -> bool {
        let started = Instant::now();
        let collection = options.collection;
        let expires_at = options
            .expiry
            .map(|ttl| now_millis() + ttl.as_millis() as i64);

        let plain =
            StoredRecord::new(id, content.as_bytes().to_vec(), metadata).with_expiry(expires_at);
        let record = self.encode(plain.clone()).await;
        let stored_bytes = record.stored_size();

        let mut accepted = false;
        if let Some(durable) = self.durable().await {
            let context = CallContext::new(format!("put {collection}"))
                .with_priority(CallPriority::Low);
            let result = self
                .breaker
                .execute(
                    || {
                        let durable = Arc::clone(durable);
                        let record = record.clone();
                        async move { durable.put(collection, record).await }
                    },
                    context,
                )
                .await;
            match result {
                Ok(()) => {
                    accepted = true;
                    self.tombstones.write().await.unbury(collection, id);
                    // an older fallback copy would shadow this write
                    if let Err(e) = self.session.delete(collection, id).await {
                        debug!("Could not drop session copy of {}: {}", id, e);
                    }
                }
                Err(e) => {
                    warn!("Durable write of {} failed, using session storage: {}", id, e);
                    self.metrics.record_error().await;
                }
            }
        }

        if !accepted {
            match self.session.put(collection, record).await {
                Ok(()) => accepted = true,
                Err(e) => {
                    error!("Session write of {} failed: {}", id, e);
                    self.metrics.record_error().await;
                }
            }
        }

        if accepted {
            self.memory.insert(collection, plain).await;
        }
        self.metrics.record_write(started.elapsed(), stored_bytes).await;
        debug!("Stored {} ({} bytes)", id, stored_bytes);
        accepted
    }

    pub async fn get(&self, id: &str) -> Option<StoredDocument> {
        self.get_from(Collection::Documents, id).await
    }

    #[instrument(skip(self))]
    pub async fn get_from(&self, collection: Collection, id: &str) -> Option<StoredDocument> {
        let started = Instant::now();
        let found = self.lookup(collection, id).await;
        self.metrics
            .record_read(started.elapsed(), found.is_some())
            .await;
        match &found {
            Some(_) => debug!("Storage HIT: {}:{}", collection, id),
            None => debug!("Storage MISS: {}:{}", collection, id),
        }
        found.map(to_document)
    }

    /// Memory first. Otherwise the newer of the durable and session copies
    /// wins; ties go to the session copy, which only exists when a later
    /// durable write failed.
    async fn lookup(&self, collection: Collection, id: &str) -> Option<StoredRecord> {
        if let Some(record) = self.memory.lookup(collection, id).await {
            return Some(record);
        }

        let durable_hit = match self.durable().await {
            Some(durable) => self
                .fetch_durable(collection, id, durable)
                .await
                .map(|record| (record, Arc::clone(durable))),
            None => None,
        };

        let session_hit = match self.session.get(collection, id).await {
            Ok(found) => found,
            Err(e) => {
                error!("Session read of {} failed: {}", id, e);
                self.metrics.record_error().await;
                None
            }
        };

        let (record, origin) = match (durable_hit, session_hit) {
            (Some((durable_record, durable)), Some(session_record)) => {
                if durable_record.timestamp > session_record.timestamp {
                    (durable_record, durable)
                } else {
                    (session_record, self.session_origin())
                }
            }
            (Some((record, durable)), None) => (record, durable),
            (None, Some(record)) => (record, self.session_origin()),
            (None, None) => return None,
        };
        self.accept(collection, record, origin).await
    }

    async fn fetch_durable(
        &self,
        collection: Collection,
        id: &str,
        durable: &Arc<dyn StorageBackend>,
    ) -> Option<StoredRecord> {
        let context = CallContext::new(format!("get {collection}"));
        let fetched = self
            .breaker
            .execute(
                || {
                    let durable = Arc::clone(durable);
                    let key = id.to_string();
                    async move { durable.get(collection, &key).await }
                },
                context,
            )
            .await;
        match fetched {
            Ok(Some(record)) => {
                if self.tombstones.read().await.hides(collection, &record) {
                    debug!("Durable copy of {}:{} was deleted", collection, id);
                    return None;
                }
                Some(record)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Durable read of {} failed: {}", id, e);
                self.metrics.record_error().await;
                None
            }
        }
    }

    fn session_origin(&self) -> Arc<dyn StorageBackend> {
        self.session.clone()
    }

    /// Expired records are misses and get removed from `origin` in the
    /// background. Live ones are decompressed and promoted to memory.
    async fn accept(
        &self,
        collection: Collection,
        record: StoredRecord,
        origin: Arc<dyn StorageBackend>,
    ) -> Option<StoredRecord> {
        if record.is_expired() {
            debug!("Dropping expired {}:{}", collection, record.key);
            let key = record.key;
            tokio::spawn(async move {
                if let Err(e) = origin.delete(collection, &key).await {
                    debug!("Background delete of {} failed: {}", key, e);
                }
            });
            return None;
        }

        match decode(record) {
            Ok(record) => {
                self.memory.insert(collection, record.clone()).await;
                Some(record)
            }
            Err(e) => {
                error!("Stored payload could not be decoded: {}", e);
                self.metrics.record_error().await;
                None
            }
        }
    }

    async fn encode(&self, mut record: StoredRecord) -> StoredRecord {
        if !self.policy.should_compress(record.payload.len()) {
            return record;
        }
        match self.policy.compress(&record.payload) {
            Ok(packed) => {
                self.metrics
                    .record_compression(record.payload.len(), packed.len())
                    .await;
                record.payload = packed;
                record.compressed = true;
                record
            }
            Err(e) => {
                warn!("压缩失败，按原文存储: {}", e);
                self.metrics.record_error().await;
                record
            }
        }
    }

    pub async fn delete(&self, id: &str) -> bool {
        self.delete_from(Collection::Documents, id).await
    }

    #[instrument(skip(self))]
    pub async fn delete_from(&self, collection: Collection, id: &str) -> bool {
        let mut removed = self.memory.remove(collection, id).await;

        if let Some(durable) = self.durable().await {
            let context = CallContext::new(format!("delete {collection}"))
                .with_priority(CallPriority::Low);
            let result = self
                .breaker
                .execute(
                    || {
                        let durable = Arc::clone(durable);
                        let key = id.to_string();
                        async move { durable.delete(collection, &key).await }
                    },
                    context,
                )
                .await;
            match result {
                Ok(hit) => {
                    removed |= hit;
                    self.tombstones.write().await.unbury(collection, id);
                }
                Err(e) => {
                    warn!("Durable delete of {} failed: {}", id, e);
                    self.metrics.record_error().await;
                    self.tombstones
                        .write()
                        .await
                        .bury(collection, id, now_millis());
                }
            }
        }

        match self.session.delete(collection, id).await {
            Ok(hit) => removed |= hit,
            Err(e) => {
                error!("Session delete of {} failed: {}", id, e);
                self.metrics.record_error().await;
            }
        }

        self.metrics.record_delete().await;
        removed
    }

    /// JSON-encodes `value` into the cache collection.
    pub async fn set_cache<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        options: CacheOptions,
    ) -> bool {
        let content = match serde_json::to_string(value) {
            Ok(content) => content,
            Err(e) => {
                warn!("Cache value for {} is not serializable: {}", key, e);
                self.metrics.record_error().await;
                return false;
            }
        };
        let put = PutOptions {
            collection: Collection::Cache,
            expiry: options.expiry.or(self.config.default_cache_ttl),
        };
        self.put(key, &content, serde_json::json!({ "kind": "cache" }), put)
            .await
    }

    pub async fn get_cache<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_json(Collection::Cache, key).await
    }

    pub async fn set_setting<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> bool {
        let content = match serde_json::to_string(value) {
            Ok(content) => content,
            Err(e) => {
                warn!("Setting {} is not serializable: {}", key, e);
                self.metrics.record_error().await;
                return false;
            }
        };
        self.put(
            key,
            &content,
            serde_json::json!({ "kind": "setting" }),
            PutOptions::in_collection(Collection::Settings),
        )
        .await
    }

    pub async fn get_setting<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_json(Collection::Settings, key).await
    }

    async fn get_json<T: DeserializeOwned>(&self, collection: Collection, key: &str) -> Option<T> {
        let document = self.get_from(collection, key).await?;
        match serde_json::from_str(&document.content) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("{}:{} does not hold the expected shape: {}", collection, key, e);
                None
            }
        }
    }

    /// Live records of `collection`, newest first.
    pub async fn list_all(&self, collection: Collection) -> Vec<StoredDocument> {
        let mut merged: HashMap<String, StoredRecord> = HashMap::new();

        match self.session.list(collection).await {
            Ok(records) => merged.extend(records.into_iter().map(|r| (r.key.clone(), r))),
            Err(e) => {
                error!("Session list of {} failed: {}", collection, e);
                self.metrics.record_error().await;
            }
        }

        if let Some(durable) = self.durable().await {
            let context = CallContext::new(format!("list {collection}"));
            let listed = self
                .breaker
                .execute(
                    || {
                        let durable = Arc::clone(durable);
                        async move { durable.list(collection).await }
                    },
                    context,
                )
                .await;
            match listed {
                Ok(records) => {
                    let tombstones = self.tombstones.read().await;
                    for record in records {
                        if tombstones.hides(collection, &record) {
                            continue;
                        }
                        let newer = merged
                            .get(&record.key)
                            .map_or(true, |session| record.timestamp > session.timestamp);
                        if newer {
                            merged.insert(record.key.clone(), record);
                        }
                    }
                }
                Err(e) => {
                    warn!("Durable list of {} failed: {}", collection, e);
                    self.metrics.record_error().await;
                }
            }
        }

        let now = now_millis();
        let mut documents = Vec::with_capacity(merged.len());
        for record in merged.into_values() {
            if record.is_expired_at(now) {
                continue;
            }
            match decode(record) {
                Ok(record) => documents.push(to_document(record)),
                Err(e) => {
                    warn!("Skipping undecodable record in {}: {}", collection, e);
                    self.metrics.record_error().await;
                }
            }
        }
        documents.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));
        documents
    }

    /// Empties `collection` in every tier. `false` if the durable tier
    /// could not be cleared.
    pub async fn clear(&self, collection: Collection) -> bool {
        self.memory.clear_collection(collection).await;
        let mut ok = true;

        if let Err(e) = self.session.clear(collection).await {
            error!("Session clear of {} failed: {}", collection, e);
            self.metrics.record_error().await;
            ok = false;
        }

        if let Some(durable) = self.durable().await {
            let context =
                CallContext::new(format!("clear {collection}")).with_priority(CallPriority::Low);
            let result = self
                .breaker
                .execute(
                    || {
                        let durable = Arc::clone(durable);
                        async move { durable.clear(collection).await }
                    },
                    context,
                )
                .await;
            match result {
                Ok(()) => self.tombstones.write().await.unbury_collection(collection),
                Err(e) => {
                    warn!("Durable clear of {} failed: {}", collection, e);
                    self.metrics.record_error().await;
                    self.tombstones
                        .write()
                        .await
                        .bury_collection(collection, now_millis());
                    ok = false;
                }
            }
        }

        info!("Cleared collection {}", collection);
        ok
    }

    /// Drops the hot tier only. Persisted copies are untouched.
    pub async fn clear_memory(&self) {
        self.memory.clear_all().await;
    }

    pub async fn metrics(&self) -> StorageMetrics {
        self.metrics.snapshot(self.durable_available()).await
    }

    pub async fn prune_memory(&self) -> usize {
        let removed = self.memory.prune_expired(now_millis()).await;
        if removed > 0 {
            debug!("Pruned {} expired entries from memory", removed);
        }
        removed
    }

    /// Deletes expired records from every tier.
    pub async fn sweep_expired(&self) -> usize {
        let now = now_millis();
        let mut removed = self.memory.prune_expired(now).await;

        if let Some(durable) = self.durable().await {
            let context = CallContext::new("sweep expired").with_priority(CallPriority::Low);
            let result = self
                .breaker
                .execute(
                    || {
                        let durable = Arc::clone(durable);
                        async move { durable.delete_expired(now).await }
                    },
                    context,
                )
                .await;
            match result {
                Ok(count) => removed += count,
                Err(e) => {
                    warn!("Durable expiry sweep failed: {}", e);
                    self.metrics.record_error().await;
                }
            }
        }

        match self.session.delete_expired(now).await {
            Ok(count) => removed += count,
            Err(e) => {
                error!("Session expiry sweep failed: {}", e);
                self.metrics.record_error().await;
            }
        }

        info!("Expiry sweep removed {} records", removed);
        removed
    }

    /// Starts the durable sweep and memory prune loops. No-op if running.
    pub async fn start_maintenance(self: &Arc<Self>) {
        let mut slot = self.maintenance.lock().await;
        if slot.is_some() {
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let storage = Arc::clone(self);
        let sweep_every = self.config.sweep_interval;
        let prune_every = self.config.memory_prune_interval;

        let handle = tokio::spawn(async move {
            let mut sweep = interval(sweep_every);
            let mut prune = interval(prune_every);
            sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
            prune.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // both intervals fire immediately on the first tick
            sweep.tick().await;
            prune.tick().await;

            loop {
                tokio::select! {
                    _ = sweep.tick() => {
                        storage.sweep_expired().await;
                    }
                    _ = prune.tick() => {
                        storage.prune_memory().await;
                    }
                    _ = &mut shutdown_rx => {
                        info!("Storage maintenance shutdown requested");
                        break;
                    }
                }
            }
        });

        *slot = Some(MaintenanceHandle {
            shutdown_tx,
            handle,
        });
        info!(
            "Storage maintenance started (sweep every {:?}, prune every {:?})",
            sweep_every, prune_every
        );
    }

    /// Stops maintenance and closes the durable tier.
    pub async fn shutdown(&self) {
        if let Some(maintenance) = self.maintenance.lock().await.take() {
            let _ = maintenance.shutdown_tx.send(());
            if let Err(e) = maintenance.handle.await {
                warn!("Error waiting for storage maintenance to stop: {}", e);
            }
        }
        if let Some(Some(durable)) = self.durable.get() {
            durable.close().await;
        }
        info!("Storage shut down");
    }
}

fn decode(record: StoredRecord) -> RuntimeResult<StoredRecord> {
    if !record.compressed {
        return Ok(record);
    }
    let payload = decompress(&record.payload)?;
    Ok(StoredRecord {
        payload,
        compressed: false,
        ..record
    })
}

fn to_document(record: StoredRecord) -> StoredDocument {
    let content = match String::from_utf8(record.payload) {
        Ok(content) => content,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    };
    StoredDocument {
        id: record.key,
        content,
        metadata: record.metadata,
        timestamp: record.timestamp,
        expires_at: record.expires_at,
    }
}
