use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Logical record families persisted by the tiered storage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    #[default]
    Documents,
    GeneratedRecords,
    Cache,
    Settings,
}

impl Collection {
    pub const ALL: [Collection; 4] = [
        Collection::Documents,
        Collection::GeneratedRecords,
        Collection::Cache,
        Collection::Settings,
    ];

    /// Durable table backing the collection.
    pub fn table_name(&self) -> &'static str {
        match self {
            Collection::Documents => "documents",
            Collection::GeneratedRecords => "generated_records",
            Collection::Cache => "cache",
            Collection::Settings => "settings",
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.table_name())
    }
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// What a backend actually holds. `payload` is compressed when
/// `compressed` is set; `original_size` is the uncompressed length.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub key: String,
    pub payload: Vec<u8>,
    pub metadata: serde_json::Value,
    /// Milliseconds since the epoch.
    pub timestamp: i64,
    pub expires_at: Option<i64>,
    pub compressed: bool,
    pub original_size: usize,
}

impl StoredRecord {
    pub fn new(key: impl Into<String>, payload: Vec<u8>, metadata: serde_json::Value) -> Self {
        let original_size = payload.len();
        Self {
            key: key.into(),
            payload,
            metadata,
            timestamp: now_millis(),
            expires_at: None,
            compressed: false,
            original_size,
        }
    }

    pub fn with_expiry(mut self, expires_at: Option<i64>) -> Self {
        self.expires_at = expires_at;
        self
    }

    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        matches!(self.expires_at, Some(at) if at <= now_ms)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_millis())
    }

    pub fn stored_size(&self) -> usize {
        self.payload.len()
    }
}

/// Caller-facing view of a record, content already decompressed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub id: String,
    pub content: String,
    pub metadata: serde_json::Value,
    pub timestamp: i64,
    pub expires_at: Option<i64>,
}
