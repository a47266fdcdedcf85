use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use draftwork_domain::{Collection, StoredRecord};
use draftwork_errors::{RuntimeError, RuntimeResult};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, instrument};

use super::StorageBackend;

/// Durable tier on an embedded SQLite database. One table per collection.
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// 打开（必要时创建）嵌入式数据库并执行迁移
    pub async fn connect(database_url: &str, max_connections: u32) -> RuntimeResult<Self> {
        debug!("Opening SQLite storage at: {}", database_url);

        let in_memory = database_url.contains(":memory:");
        if !in_memory {
            ensure_parent_dir(database_url).await?;
        }

        let mut connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true);
        if !in_memory {
            connect_options = connect_options.journal_mode(SqliteJournalMode::Wal);
        }

        // every connection to :memory: is a separate database
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new()
                .max_connections(max_connections.max(1))
                .min_connections(1)
        };

        let pool = pool_options.connect_with(connect_options).await?;
        Self::run_migrations(&pool).await?;

        info!("SQLite storage ready at {}", database_url);
        Ok(Self { pool })
    }

    /// 创建存储表
    pub async fn run_migrations(pool: &SqlitePool) -> RuntimeResult<()> {
        debug!("Running SQLite storage migrations");

        for collection in Collection::ALL {
            let ddl = format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    key TEXT PRIMARY KEY,
                    payload BLOB NOT NULL,
                    metadata TEXT NOT NULL DEFAULT '{{}}',
                    timestamp INTEGER NOT NULL,
                    expires_at INTEGER,
                    compressed INTEGER NOT NULL DEFAULT 0,
                    original_size INTEGER NOT NULL DEFAULT 0
                )
                "#,
                table = collection.table_name()
            );
            sqlx::query(&ddl).execute(pool).await?;
        }

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_cache_expires_at ON cache(expires_at)")
            .execute(pool)
            .await?;

        debug!("SQLite storage migrations completed");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn row_to_record(row: &SqliteRow) -> RuntimeResult<StoredRecord> {
        let metadata: String = row.try_get("metadata")?;
        let original_size: i64 = row.try_get("original_size")?;
        Ok(StoredRecord {
            key: row.try_get("key")?,
            payload: row.try_get("payload")?,
            metadata: serde_json::from_str(&metadata)?,
            timestamp: row.try_get("timestamp")?,
            expires_at: row.try_get("expires_at")?,
            compressed: row.try_get("compressed")?,
            original_size: usize::try_from(original_size).unwrap_or_default(),
        })
    }
}

async fn ensure_parent_dir(database_url: &str) -> RuntimeResult<()> {
    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:");
    let path = path.split('?').next().unwrap_or(path);
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                RuntimeError::storage(format!("无法创建数据目录 {}: {e}", parent.display()))
            })?;
        }
    }
    Ok(())
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn health_check(&self) -> RuntimeResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    #[instrument(skip(self, record), fields(key = %record.key))]
    async fn put(&self, collection: Collection, record: StoredRecord) -> RuntimeResult<()> {
        let sql = format!(
            r#"
            INSERT INTO {} (key, payload, metadata, timestamp, expires_at, compressed, original_size)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                payload = excluded.payload,
                metadata = excluded.metadata,
                timestamp = excluded.timestamp,
                expires_at = excluded.expires_at,
                compressed = excluded.compressed,
                original_size = excluded.original_size
            "#,
            collection.table_name()
        );
        let metadata = serde_json::to_string(&record.metadata)?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(&sql)
            .bind(&record.key)
            .bind(&record.payload)
            .bind(metadata)
            .bind(record.timestamp)
            .bind(record.expires_at)
            .bind(record.compressed)
            .bind(record.original_size as i64)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, collection: Collection, key: &str) -> RuntimeResult<Option<StoredRecord>> {
        let sql = format!(
            "SELECT key, payload, metadata, timestamp, expires_at, compressed, original_size FROM {} WHERE key = ?",
            collection.table_name()
        );
        let row = sqlx::query(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn delete(&self, collection: Collection, key: &str) -> RuntimeResult<bool> {
        let sql = format!("DELETE FROM {} WHERE key = ?", collection.table_name());
        let result = sqlx::query(&sql).bind(key).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self, collection: Collection) -> RuntimeResult<Vec<StoredRecord>> {
        let sql = format!(
            "SELECT key, payload, metadata, timestamp, expires_at, compressed, original_size FROM {} ORDER BY timestamp DESC",
            collection.table_name()
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_record).collect()
    }

    async fn clear(&self, collection: Collection) -> RuntimeResult<()> {
        let sql = format!("DELETE FROM {}", collection.table_name());
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn delete_expired(&self, now_ms: i64) -> RuntimeResult<usize> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0u64;
        for collection in Collection::ALL {
            let sql = format!(
                "DELETE FROM {} WHERE expires_at IS NOT NULL AND expires_at <= ?",
                collection.table_name()
            );
            removed += sqlx::query(&sql)
                .bind(now_ms)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(removed as usize)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
