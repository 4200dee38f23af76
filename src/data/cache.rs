use anyhow::{Context, Result};
use polars::prelude::*;
use serde::Deserialize;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::kv::KvStore;
use super::OhlcvFrame;

const NAMESPACE: &str = "ohlcv_cache";

const DEFAULT_MAX_BYTES: u64 = 1_000_000_000;
const DEFAULT_TTL_SECONDS: u64 = 3_600;

/// Byte budget and TTL for the OHLCV cache.
#[derive(Debug, Clone, Copy)]
pub struct CacheLimits {
    pub max_bytes: u64,
    pub ttl: Duration,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_BYTES,
            ttl: Duration::from_secs(DEFAULT_TTL_SECONDS),
        }
    }
}

#[derive(Deserialize)]
struct CacheLimitsFile {
    #[serde(default)]
    max_cache_bytes: Option<u64>,
    #[serde(default)]
    ttl_seconds: Option<u64>,
}

impl CacheLimits {
    /// Load limits from a YAML file; a missing or unreadable file falls back
    /// to the defaults with a warning.
    pub fn from_yaml_file(path: &Path) -> Self {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    "OHLCV cache config not found ({e}), using defaults"
                );
                return Self::default();
            }
        };
        match serde_yaml::from_str::<CacheLimitsFile>(&text) {
            Ok(file) => Self {
                max_bytes: file.max_cache_bytes.unwrap_or(DEFAULT_MAX_BYTES),
                ttl: Duration::from_secs(file.ttl_seconds.unwrap_or(DEFAULT_TTL_SECONDS)),
            },
            Err(e) => {
                tracing::warn!("Error loading OHLCV cache config: {e}, using defaults");
                Self::default()
            }
        }
    }
}

/// Usage-bounded, TTL'd store of compressed OHLCV frames keyed by
/// `(hash_id, ticker)`.
///
/// The cache is advisory: every failure is logged and swallowed. Admission is
/// refused once the byte budget is reached; entries are only evicted in bulk,
/// per hash, so invalidation of a backtest is atomic.
pub struct OhlcvCache {
    kv: Arc<dyn KvStore>,
    limits: CacheLimits,
}

impl OhlcvCache {
    pub fn new(kv: Arc<dyn KvStore>, limits: CacheLimits) -> Self {
        Self { kv, limits }
    }

    fn data_key(hash_id: &str, ticker: &str) -> String {
        format!("{NAMESPACE}:{hash_id}:{ticker}")
    }

    fn size_key(hash_id: &str, ticker: &str) -> String {
        format!("{NAMESPACE}:size:{hash_id}:{ticker}")
    }

    fn usage_key() -> String {
        format!("{NAMESPACE}:usage:total_bytes")
    }

    /// Current total of serialized bytes held, per the usage counter.
    pub fn current_usage(&self) -> u64 {
        self.kv
            .get(&Self::usage_key())
            .and_then(|raw| String::from_utf8(raw).ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(0)
    }

    fn update_usage(&self, delta_bytes: i64) {
        let current = self.current_usage() as i64;
        let new_total = (current + delta_bytes).max(0);
        self.kv.set(
            &Self::usage_key(),
            new_total.to_string().into_bytes(),
            self.limits.ttl,
        );
    }

    fn recorded_size(&self, hash_id: &str, ticker: &str) -> u64 {
        self.kv
            .get(&Self::size_key(hash_id, ticker))
            .and_then(|raw| String::from_utf8(raw).ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(0)
    }

    /// Cache a frame. Refuses admission (without evicting) when the budget
    /// would be exceeded; all errors are non-fatal.
    pub fn store(&self, hash_id: &str, ticker: &str, frame: &OhlcvFrame) {
        if frame.is_empty() {
            return;
        }

        let serialized = match serialize_frame(frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Error caching OHLCV for {hash_id}:{ticker}: {e}");
                return;
            }
        };
        let size_bytes = serialized.len() as u64;

        let current_usage = self.current_usage();
        if current_usage + size_bytes > self.limits.max_bytes {
            tracing::warn!(
                "OHLCV cache full: {} > {}. Skipping cache for {hash_id}:{ticker}",
                current_usage + size_bytes,
                self.limits.max_bytes
            );
            return;
        }

        if self
            .kv
            .set(&Self::data_key(hash_id, ticker), serialized, self.limits.ttl)
        {
            self.kv.set(
                &Self::size_key(hash_id, ticker),
                size_bytes.to_string().into_bytes(),
                self.limits.ttl,
            );
            self.update_usage(size_bytes as i64);
            tracing::debug!("Cached OHLCV for {hash_id}:{ticker} ({size_bytes} bytes)");
        } else {
            tracing::warn!("Failed to cache OHLCV for {hash_id}:{ticker}");
        }
    }

    pub fn load(&self, hash_id: &str, ticker: &str) -> Option<OhlcvFrame> {
        let data = self.kv.get(&Self::data_key(hash_id, ticker))?;
        match deserialize_frame(&data) {
            Ok(frame) => {
                tracing::debug!("Loaded OHLCV from cache for {hash_id}:{ticker}");
                Some(frame)
            }
            Err(e) => {
                tracing::warn!("Error loading OHLCV from cache for {hash_id}:{ticker}: {e}");
                None
            }
        }
    }

    /// Drop every entry for a hash and subtract the exact freed bytes from
    /// the usage counter.
    pub fn clear_for_hash(&self, hash_id: &str) {
        let data_prefix = format!("{NAMESPACE}:{hash_id}:");
        let size_prefix = format!("{NAMESPACE}:size:{hash_id}:");
        let data_keys = self.kv.keys_with_prefix(&data_prefix);
        let size_keys = self.kv.keys_with_prefix(&size_prefix);

        if data_keys.is_empty() && size_keys.is_empty() {
            return;
        }

        let mut total_freed: u64 = 0;
        for key in &data_keys {
            if let Some(ticker) = key.strip_prefix(&data_prefix) {
                total_freed += self.recorded_size(hash_id, ticker);
            }
            self.kv.delete(key);
        }
        for key in &size_keys {
            self.kv.delete(key);
        }

        if total_freed > 0 {
            self.update_usage(-(total_freed as i64));
        }

        tracing::info!(
            "Cleared {} cached OHLCV entries for hash {hash_id}",
            data_keys.len() + size_keys.len()
        );
    }
}

/// Encode a frame as zstd-compressed Parquet bytes.
fn serialize_frame(frame: &OhlcvFrame) -> Result<Vec<u8>> {
    let mut df = frame.to_dataframe()?;
    let mut buf = Vec::new();
    ParquetWriter::new(&mut buf)
        .with_compression(ParquetCompression::Zstd(None))
        .finish(&mut df)
        .context("failed to encode OHLCV frame")?;
    Ok(buf)
}

fn deserialize_frame(bytes: &[u8]) -> Result<OhlcvFrame> {
    let df = ParquetReader::new(Cursor::new(bytes))
        .finish()
        .context("failed to decode OHLCV frame")?;
    OhlcvFrame::from_dataframe(&df)
}
