//! Payload compression and in-memory size estimation for the storage tiers.

use std::io::{Read, Write};

use draftwork_config::StorageConfig;
use draftwork_errors::{RuntimeError, RuntimeResult};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

/// Fixed per-string bookkeeping (pointer, length, capacity).
pub const STRING_OVERHEAD_BYTES: usize = 24;
const SCALAR_BYTES: usize = 8;
const CONTAINER_OVERHEAD_BYTES: usize = 24;

pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

/// Estimated in-memory footprint of a string.
pub fn estimate_size(value: &str) -> usize {
    value.len() + STRING_OVERHEAD_BYTES
}

pub fn estimate_value_size(value: &serde_json::Value) -> usize {
    use serde_json::Value;

    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) => SCALAR_BYTES,
        Value::String(s) => estimate_size(s),
        Value::Array(items) => {
            CONTAINER_OVERHEAD_BYTES + items.iter().map(estimate_value_size).sum::<usize>()
        }
        Value::Object(map) => {
            CONTAINER_OVERHEAD_BYTES
                + map
                    .iter()
                    .map(|(k, v)| estimate_size(k) + estimate_value_size(v))
                    .sum::<usize>()
        }
    }
}

pub fn compress(data: &[u8]) -> RuntimeResult<Vec<u8>> {
    compress_with_level(data, DEFAULT_COMPRESSION_LEVEL)
}

pub fn compress_with_level(data: &[u8], level: u32) -> RuntimeResult<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(data.len() / 2), Compression::new(level));
    encoder
        .write_all(data)
        .map_err(|e| RuntimeError::Compression(format!("压缩失败: {e}")))?;
    encoder
        .finish()
        .map_err(|e| RuntimeError::Compression(format!("压缩失败: {e}")))
}

pub fn decompress(data: &[u8]) -> RuntimeResult<Vec<u8>> {
    let mut decoder = DeflateDecoder::new(data);
    let mut out = Vec::with_capacity(data.len() * 2);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| RuntimeError::Compression(format!("解压失败: {e}")))?;
    Ok(out)
}

/// Stored size over original size; 1.0 for empty input.
pub fn compression_ratio(original: usize, stored: usize) -> f64 {
    if original == 0 {
        1.0
    } else {
        stored as f64 / original as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionPolicy {
    pub threshold_bytes: usize,
    pub level: u32,
}

impl Default for CompressionPolicy {
    fn default() -> Self {
        Self {
            threshold_bytes: 10 * 1024,
            level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

impl From<&StorageConfig> for CompressionPolicy {
    fn from(config: &StorageConfig) -> Self {
        Self {
            threshold_bytes: config.compression_threshold_bytes,
            level: config.compression_level,
        }
    }
}

impl CompressionPolicy {
    /// Strictly larger than the threshold.
    pub fn should_compress(&self, len: usize) -> bool {
        len > self.threshold_bytes
    }

    pub fn compress(&self, data: &[u8]) -> RuntimeResult<Vec<u8>> {
        compress_with_level(data, self.level)
    }
}
