//! Size-bounded TTL cache.
//!
//! Expiry is lazy: entries are dropped when a `get` finds them stale.
//! When full, the oldest *inserted* entry is evicted — reads do not
//! refresh position, only re-insertion does. An expired entry keeps
//! occupying its slot until a read or an eviction removes it.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::time::Duration;

use tokio::time::Instant;

struct Entry<V> {
    value: V,
    inserted_at: Instant,
    seq: u64,
}

pub struct TtlCache<K, V> {
    entries: HashMap<K, Entry<V>>,
    // Insertion order as (key, seq). Re-insertion appends a fresh pair and
    // leaves the old one behind as a tombstone, skipped during eviction and
    // swept out whenever the queue outgrows twice the capacity.
    order: VecDeque<(K, u64)>,
    seq: u64,
    max_size: usize,
    ttl: Duration,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            seq: 0,
            max_size: max_size.max(1),
            ttl,
        }
    }

    pub fn get(&mut self, key: &K) -> Option<V> {
        let expired = match self.entries.get(key) {
            Some(entry) => entry.inserted_at.elapsed() >= self.ttl,
            None => return None,
        };
        if expired {
            self.entries.remove(key);
            return None;
        }
        self.entries.get(key).map(|entry| entry.value.clone())
    }

    pub fn insert(&mut self, key: K, value: V) {
        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_size {
            self.evict_oldest();
        }
        let seq = self.seq;
        self.seq += 1;
        self.entries.insert(
            key.clone(),
            Entry {
                value,
                inserted_at: Instant::now(),
                seq,
            },
        );
        self.order.push_back((key, seq));
        if self.order.len() > self.max_size.saturating_mul(2) {
            self.sweep();
        }
    }

    /// Drop tombstoned pairs so the queue stays proportional to the map.
    fn sweep(&mut self) {
        let entries = &self.entries;
        self.order
            .retain(|(key, seq)| entries.get(key).is_some_and(|entry| entry.seq == *seq));
    }

    fn evict_oldest(&mut self) {
        while let Some((key, seq)) = self.order.pop_front() {
            let live = self
                .entries
                .get(&key)
                .is_some_and(|entry| entry.seq == seq);
            if live {
                self.entries.remove(&key);
                return;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
