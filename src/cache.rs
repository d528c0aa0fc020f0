use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tracing::{debug, info};

use crate::clock::Clock;

/// Cached entry with insertion timestamp
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    inserted_at: DateTime<Utc>,
}

/// In-memory map with a fixed TTL.
///
/// Expired entries no longer block `insert_if_absent` and are dropped by
/// `purge_expired` or when their key is written again.
pub struct TtlCache<K, V> {
    entries: Mutex<HashMap<K, CacheEntry<V>>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + std::fmt::Debug,
    V: PartialEq,
{
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            clock,
        }
    }

    fn is_live(&self, entry: &CacheEntry<V>, now: DateTime<Utc>) -> bool {
        now - entry.inserted_at < self.ttl
    }

    /// Insert only if no live entry exists for the key.
    /// Returns true when the value was stored.
    pub fn insert_if_absent(&self, key: K, value: V) -> bool {
        let now = self.clock.now();
        let mut entries = self.entries.lock();

        if let Some(existing) = entries.get(&key) {
            if self.is_live(existing, now) {
                return false;
            }
        }

        entries.insert(key, CacheEntry { value, inserted_at: now });
        true
    }

    /// Remove the entry only while it still holds `value`.
    /// Returns true when an entry was removed.
    pub fn remove_if_eq(&self, key: &K, value: &V) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.value == *value => {
                entries.remove(key);
                true
            }
            Some(_) => {
                debug!("Entry for {:?} was replaced, left in place", key);
                false
            }
            None => false,
        }
    }

    /// Cleanup expired entries
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.lock();

        let before = entries.len();
        entries.retain(|_, entry| now - entry.inserted_at < self.ttl);
        let purged = before - entries.len();

        if purged > 0 {
            info!("🧹 Purged {} expired cache entries", purged);
        }
        purged
    }
}
