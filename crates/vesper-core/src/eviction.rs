//! Eviction policies and the LRU/LFU candidate caches.
//!
//! Both caches keep a hash index from key to its position in an ordered
//! structure so `touch` reweights in O(log n) and `pop` returns the
//! victim in O(log n). The keyspace updates the active cache on every
//! successful read and write; `volatile-*` policies only track keys that
//! currently carry a TTL.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::str::FromStr;

/// How the keyspace frees memory when the configured limit is reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Refuse writes that would exceed the memory limit.
    #[default]
    NoEviction,
    /// Evict the least-recently-used key.
    AllKeysLru,
    /// Evict the least-recently-used key among keys with a TTL.
    VolatileLru,
    /// Evict the key with the smallest access count.
    AllKeysLfu,
    /// Evict the smallest-count key among keys with a TTL.
    VolatileLfu,
    /// Evict the key with the soonest expiry.
    VolatileTtl,
    /// Evict a uniformly random key.
    AllKeysRandom,
    /// Evict a uniformly random key among keys with a TTL.
    VolatileRandom,
}

impl EvictionPolicy {
    /// Whether this policy restricts candidates to keys with a TTL.
    pub fn is_volatile(&self) -> bool {
        matches!(
            self,
            EvictionPolicy::VolatileLru
                | EvictionPolicy::VolatileLfu
                | EvictionPolicy::VolatileTtl
                | EvictionPolicy::VolatileRandom
        )
    }

    /// Whether this policy needs the LRU cache maintained.
    pub fn uses_lru(&self) -> bool {
        matches!(self, EvictionPolicy::AllKeysLru | EvictionPolicy::VolatileLru)
    }

    /// Whether this policy needs the LFU cache maintained.
    pub fn uses_lfu(&self) -> bool {
        matches!(self, EvictionPolicy::AllKeysLfu | EvictionPolicy::VolatileLfu)
    }
}

impl FromStr for EvictionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "noeviction" => Ok(EvictionPolicy::NoEviction),
            "allkeys-lru" => Ok(EvictionPolicy::AllKeysLru),
            "volatile-lru" => Ok(EvictionPolicy::VolatileLru),
            "allkeys-lfu" => Ok(EvictionPolicy::AllKeysLfu),
            "volatile-lfu" => Ok(EvictionPolicy::VolatileLfu),
            "volatile-ttl" => Ok(EvictionPolicy::VolatileTtl),
            "allkeys-random" => Ok(EvictionPolicy::AllKeysRandom),
            "volatile-random" => Ok(EvictionPolicy::VolatileRandom),
            other => Err(format!(
                "unknown eviction policy '{other}'. valid options: noeviction, \
                 allkeys-lru, volatile-lru, allkeys-lfu, volatile-lfu, \
                 volatile-ttl, allkeys-random, volatile-random"
            )),
        }
    }
}

/// LRU candidate cache: members ordered by last-access time.
///
/// A logical clock stamps every touch; the `order` map keyed by stamp
/// yields the least-recently-touched key first. Stamps are unique, so no
/// key appears twice.
#[derive(Debug, Default)]
pub struct LruCache {
    stamps: HashMap<String, u64>,
    order: BTreeMap<u64, String>,
    clock: u64,
}

impl LruCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an access, moving the key to the most-recent position.
    pub fn touch(&mut self, key: &str) {
        if let Some(old) = self.stamps.get(key) {
            self.order.remove(old);
        }
        self.clock += 1;
        self.stamps.insert(key.to_owned(), self.clock);
        self.order.insert(self.clock, key.to_owned());
    }

    /// Drops a key from the cache. Returns `true` if it was tracked.
    pub fn remove(&mut self, key: &str) -> bool {
        match self.stamps.remove(key) {
            Some(stamp) => {
                self.order.remove(&stamp);
                true
            }
            None => false,
        }
    }

    /// Removes and returns the least-recently-touched key.
    pub fn pop(&mut self) -> Option<String> {
        let (&stamp, _) = self.order.iter().next()?;
        let key = self.order.remove(&stamp)?;
        self.stamps.remove(&key);
        Some(key)
    }

    pub fn len(&self) -> usize {
        self.stamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stamps.is_empty()
    }

    pub fn clear(&mut self) {
        self.stamps.clear();
        self.order.clear();
    }
}

/// LFU candidate cache: members ordered by access count, ties broken by
/// oldest access time.
#[derive(Debug, Default)]
pub struct LfuCache {
    index: HashMap<String, (u64, u64)>,
    order: BTreeSet<(u64, u64, String)>,
    clock: u64,
}

impl LfuCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an access, incrementing the key's counter.
    pub fn touch(&mut self, key: &str) {
        self.clock += 1;
        let (count, stamp) = match self.index.get(key) {
            Some(&(count, stamp)) => {
                self.order.remove(&(count, stamp, key.to_owned()));
                (count + 1, self.clock)
            }
            None => (1, self.clock),
        };
        self.index.insert(key.to_owned(), (count, stamp));
        self.order.insert((count, stamp, key.to_owned()));
    }

    /// Drops a key from the cache. Returns `true` if it was tracked.
    pub fn remove(&mut self, key: &str) -> bool {
        match self.index.remove(key) {
            Some((count, stamp)) => {
                self.order.remove(&(count, stamp, key.to_owned()));
                true
            }
            None => false,
        }
    }

    /// Removes and returns the key with the smallest access count,
    /// breaking ties by oldest last access.
    pub fn pop(&mut self) -> Option<String> {
        let entry = self.order.iter().next()?.clone();
        self.order.remove(&entry);
        let (_, _, key) = entry;
        self.index.remove(&key);
        Some(key)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn clear(&mut self) {
        self.index.clear();
        self.order.clear();
    }
}
