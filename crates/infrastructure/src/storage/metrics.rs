use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Snapshot returned by `TieredStorage::metrics`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageMetrics {
    pub reads: u64,
    pub writes: u64,
    pub deletes: u64,
    pub errors: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Stored bytes over original bytes for compressed writes; 1.0 when
    /// nothing has been compressed
    pub compression_ratio: f64,
    pub avg_read_ms: f64,
    pub avg_write_ms: f64,
    pub total_size_bytes: u64,
    pub durable_available: bool,
}

impl StorageMetrics {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            0.0
        } else {
            self.cache_hits as f64 / lookups as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    reads: u64,
    writes: u64,
    deletes: u64,
    errors: u64,
    cache_hits: u64,
    cache_misses: u64,
    compressed_original_bytes: u64,
    compressed_stored_bytes: u64,
    total_read_ms: f64,
    total_write_ms: f64,
    total_size_bytes: u64,
}

#[derive(Debug, Default)]
pub(crate) struct MetricsRecorder {
    counters: RwLock<Counters>,
}

impl MetricsRecorder {
    pub(crate) async fn record_read(&self, elapsed: Duration, hit: bool) {
        let mut c = self.counters.write().await;
        c.reads += 1;
        c.total_read_ms += elapsed.as_secs_f64() * 1000.0;
        if hit {
            c.cache_hits += 1;
        } else {
            c.cache_misses += 1;
        }
    }

    pub(crate) async fn record_write(&self, elapsed: Duration, stored_bytes: usize) {
        let mut c = self.counters.write().await;
        c.writes += 1;
        c.total_write_ms += elapsed.as_secs_f64() * 1000.0;
        c.total_size_bytes += stored_bytes as u64;
    }

    pub(crate) async fn record_compression(&self, original: usize, stored: usize) {
        let mut c = self.counters.write().await;
        c.compressed_original_bytes += original as u64;
        c.compressed_stored_bytes += stored as u64;
    }

    pub(crate) async fn record_delete(&self) {
        self.counters.write().await.deletes += 1;
    }

    pub(crate) async fn record_error(&self) {
        self.counters.write().await.errors += 1;
    }

    pub(crate) async fn snapshot(&self, durable_available: bool) -> StorageMetrics {
        let c = self.counters.read().await;
        StorageMetrics {
            reads: c.reads,
            writes: c.writes,
            deletes: c.deletes,
            errors: c.errors,
            cache_hits: c.cache_hits,
            cache_misses: c.cache_misses,
            compression_ratio: crate::compression::compression_ratio(
                c.compressed_original_bytes as usize,
                c.compressed_stored_bytes as usize,
            ),
            avg_read_ms: average(c.total_read_ms, c.reads),
            avg_write_ms: average(c.total_write_ms, c.writes),
            total_size_bytes: c.total_size_bytes,
            durable_available,
        }
    }
}

fn average(total: f64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        total / count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_metrics_snapshot() {
        let recorder = MetricsRecorder::default();
        recorder.record_read(Duration::from_millis(2), true).await;
        recorder.record_read(Duration::from_millis(4), false).await;
        recorder.record_write(Duration::from_millis(10), 100).await;
        recorder.record_compression(1000, 250).await;
        recorder.record_error().await;

        let m = recorder.snapshot(false).await;
        assert_eq!(m.reads, 2);
        assert_eq!(m.cache_hits, 1);
        assert_eq!(m.cache_misses, 1);
        assert_eq!(m.hit_rate(), 0.5);
        assert!((m.avg_read_ms - 3.0).abs() < 1e-9);
        assert_eq!(m.total_size_bytes, 100);
        assert_eq!(m.compression_ratio, 0.25);
        assert_eq!(m.errors, 1);
        assert!(!m.durable_available);
    }
}
