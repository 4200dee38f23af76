use dashmap::DashMap;
use serde_json::Value;
use std::time::{Duration, Instant};

const NAMESPACE: &str = "queue";

/// At-least-once durable queue: a FIFO list of item ids per queue plus a
/// `(queue, item_id) -> JSON` data map.
///
/// Enqueueing an id that is already pending is an upsert: the data is
/// replaced and the TTL refreshed, but the queue still holds one logical
/// item. Consumers remove items with `dequeue`; the backtest core itself only
/// enqueues and peeks.
pub trait QueueBroker: Send + Sync {
    fn enqueue(&self, queue: &str, item_id: &str, data: &Value, ttl: Duration) -> bool;
    /// Up to `count` pending item ids in FIFO order, without removing them.
    fn peek(&self, queue: &str, count: usize) -> Vec<String>;
    fn get_data(&self, queue: &str, item_id: &str) -> Option<Value>;
    /// Pop the oldest pending item and its data.
    fn dequeue(&self, queue: &str) -> Option<(String, Value)>;
    fn size(&self, queue: &str) -> usize;
}

struct ItemEntry {
    data: Value,
    expires_at: Instant,
}

/// In-memory broker with lazy TTL expiry.
#[derive(Default)]
pub struct MemoryBroker {
    lists: DashMap<String, Vec<String>>,
    items: DashMap<String, ItemEntry>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue_key(queue: &str) -> String {
        format!("{NAMESPACE}:{queue}")
    }

    fn item_key(queue: &str, item_id: &str) -> String {
        format!("{NAMESPACE}:{queue}:{item_id}")
    }

    /// Drop ids whose data entry has expired, returning the live ids.
    fn purge_expired(&self, queue: &str) -> Vec<String> {
        let queue_key = Self::queue_key(queue);
        let now = Instant::now();
        let Some(mut ids) = self.lists.get_mut(&queue_key) else {
            return Vec::new();
        };
        ids.retain(|id| {
            let item_key = Self::item_key(queue, id);
            let live = self
                .items
                .get(&item_key)
                .is_some_and(|e| e.expires_at > now);
            if !live {
                self.items.remove(&item_key);
            }
            live
        });
        ids.clone()
    }
}

impl QueueBroker for MemoryBroker {
    fn enqueue(&self, queue: &str, item_id: &str, data: &Value, ttl: Duration) -> bool {
        let queue_key = Self::queue_key(queue);
        let item_key = Self::item_key(queue, item_id);
        let mut ids = self.lists.entry(queue_key).or_default();
        if !ids.iter().any(|id| id == item_id) {
            ids.push(item_id.to_string());
        }
        self.items.insert(
            item_key,
            ItemEntry {
                data: data.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
        true
    }

    fn peek(&self, queue: &str, count: usize) -> Vec<String> {
        let mut ids = self.purge_expired(queue);
        ids.truncate(count);
        ids
    }

    fn get_data(&self, queue: &str, item_id: &str) -> Option<Value> {
        let entry = self.items.get(&Self::item_key(queue, item_id))?;
        (entry.expires_at > Instant::now()).then(|| entry.data.clone())
    }

    fn dequeue(&self, queue: &str) -> Option<(String, Value)> {
        loop {
            let id = {
                let mut ids = self.lists.get_mut(&Self::queue_key(queue))?;
                if ids.is_empty() {
                    return None;
                }
                ids.remove(0)
            };
            let item_key = Self::item_key(queue, &id);
            if let Some((_, entry)) = self.items.remove(&item_key) {
                if entry.expires_at > Instant::now() {
                    return Some((id, entry.data));
                }
            }
            // Expired while pending; fall through to the next id.
        }
    }

    fn size(&self, queue: &str) -> usize {
        self.purge_expired(queue).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn enqueue_and_peek_fifo_order() {
        let broker = MemoryBroker::new();
        broker.enqueue("trades", "a", &json!({"n": 1}), TTL);
        broker.enqueue("trades", "b", &json!({"n": 2}), TTL);
        broker.enqueue("trades", "c", &json!({"n": 3}), TTL);
        assert_eq!(broker.peek("trades", 2), vec!["a", "b"]);
        assert_eq!(broker.size("trades"), 3);
    }

    #[test]
    fn enqueue_same_id_is_idempotent_with_latest_payload() {
        let broker = MemoryBroker::new();
        broker.enqueue("trades", "a", &json!({"v": 1}), TTL);
        broker.enqueue("trades", "a", &json!({"v": 2}), TTL);
        assert_eq!(broker.size("trades"), 1);
        assert_eq!(broker.get_data("trades", "a"), Some(json!({"v": 2})));
    }

    #[test]
    fn get_data_missing_is_none() {
        let broker = MemoryBroker::new();
        assert_eq!(broker.get_data("trades", "nope"), None);
    }

    #[test]
    fn dequeue_pops_oldest() {
        let broker = MemoryBroker::new();
        broker.enqueue("trades", "a", &json!(1), TTL);
        broker.enqueue("trades", "b", &json!(2), TTL);
        let (id, data) = broker.dequeue("trades").unwrap();
        assert_eq!(id, "a");
        assert_eq!(data, json!(1));
        assert_eq!(broker.size("trades"), 1);
    }

    #[test]
    fn dequeue_empty_is_none() {
        let broker = MemoryBroker::new();
        assert!(broker.dequeue("trades").is_none());
    }

    #[test]
    fn expired_items_are_purged() {
        let broker = MemoryBroker::new();
        broker.enqueue("trades", "a", &json!(1), Duration::from_millis(0));
        broker.enqueue("trades", "b", &json!(2), TTL);
        assert_eq!(broker.peek("trades", 10), vec!["b"]);
        assert_eq!(broker.size("trades"), 1);
        assert_eq!(broker.get_data("trades", "a"), None);
    }

    #[test]
    fn queues_are_isolated() {
        let broker = MemoryBroker::new();
        broker.enqueue("trades", "a", &json!(1), TTL);
        broker.enqueue("metrics", "a", &json!(2), TTL);
        assert_eq!(broker.get_data("trades", "a"), Some(json!(1)));
        assert_eq!(broker.get_data("metrics", "a"), Some(json!(2)));
        assert_eq!(broker.size("trades"), 1);
        assert_eq!(broker.size("metrics"), 1);
    }
}
