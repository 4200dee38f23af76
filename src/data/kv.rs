use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Byte-valued key/value store with per-key TTL, shaped after the Redis
/// surface the cache needs: get/set/delete plus prefix listing.
///
/// Operations never raise past this boundary; failures are reported through
/// the boolean returns and logged by callers.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Vec<u8>>;
    fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> bool;
    fn delete(&self, key: &str) -> bool;
    fn keys_with_prefix(&self, prefix: &str) -> Vec<String>;
}

struct KvEntry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// In-memory `KvStore` with lazy expiry.
#[derive(Default)]
pub struct MemoryKv {
    entries: DashMap<String, KvEntry>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > Instant::now() {
                return Some(entry.value.clone());
            }
        }
        // Expired entries are dropped on first read past their deadline.
        self.entries
            .remove_if(key, |_, e| e.expires_at <= Instant::now());
        None
    }

    fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> bool {
        self.entries.insert(
            key.to_string(),
            KvEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        true
    }

    fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.expires_at > now && e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        keys
    }
}
