//! The keyspace: vesper's core key-value store.
//!
//! Every key owns a reader/writer lock; readers overlap, writers are
//! exclusive, and locking an absent key fails instead of blocking. A
//! global creation mutex serializes first-time insertion so two writers
//! cannot race an empty entry into existence. Lock acquisition hands out
//! RAII guards, so a cancelled handler releases its locks on every exit
//! path.
//!
//! Alongside the entry map the keyspace maintains: an index of keys that
//! carry a TTL (consumed by the reaper), the LRU/LFU eviction caches
//! (touched on every successful read and write under the active policy),
//! and incremental memory accounting driving the eviction loop.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use rand::seq::IteratorRandom;
use tokio::sync::{Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::warn;

use crate::error::KeyspaceError;
use crate::eviction::{EvictionPolicy, LfuCache, LruCache};
use crate::time;
use crate::types::Value;

/// Fixed per-entry overhead charged to memory accounting: map slot, the
/// lock, and the Arc bookkeeping around the entry.
pub const ENTRY_OVERHEAD: usize = 64;

/// Maximum victims the eviction loop will attempt to free for a single
/// reservation before giving up. Bounds the work done under write
/// pressure when most candidates are lock-contended.
const MAX_EVICTION_ATTEMPTS: usize = 16;

/// A single entry: the typed value plus its expiry deadline.
/// `expires_at_ms` of 0 means no expiry.
#[derive(Debug, Clone)]
pub(crate) struct Entry {
    pub(crate) value: Value,
    pub(crate) expires_at_ms: u64,
}

impl Entry {
    fn is_expired(&self) -> bool {
        time::is_expired(self.expires_at_ms)
    }
}

/// Read lock on a single key. Dropping the guard releases the lock.
#[derive(Debug)]
pub struct KeyReadGuard {
    key: String,
    guard: OwnedRwLockReadGuard<Entry>,
}

impl KeyReadGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The typed value. Access was already recorded at lock time.
    pub fn value(&self) -> &Value {
        &self.guard.value
    }

    /// Remaining TTL in milliseconds, or `None` for no expiry.
    pub fn remaining_ttl_ms(&self) -> Option<u64> {
        time::remaining_ms(self.guard.expires_at_ms)
    }
}

/// Write lock on a single key. Mutations go through [`Keyspace::set_value`],
/// [`Keyspace::update_value`], and [`Keyspace::set_expiry`] so memory
/// accounting and the TTL index stay consistent.
#[derive(Debug)]
pub struct KeyWriteGuard {
    key: String,
    guard: OwnedRwLockWriteGuard<Entry>,
}

impl KeyWriteGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &Value {
        &self.guard.value
    }

    pub fn remaining_ttl_ms(&self) -> Option<u64> {
        time::remaining_ms(self.guard.expires_at_ms)
    }
}

/// One exported (key, value, remaining-ttl) triple. `remaining_ttl_ms`
/// is -1 for entries with no expiry.
#[derive(Debug, Clone, PartialEq)]
pub struct StateEntry {
    pub key: String,
    pub value: Value,
    pub remaining_ttl_ms: i64,
}

/// Keyspace configuration.
#[derive(Debug, Clone, Default)]
pub struct KeyspaceConfig {
    /// Maximum estimated memory in bytes. `None` means unlimited.
    pub max_memory: Option<usize>,
    /// What to do when the limit is reached.
    pub eviction_policy: EvictionPolicy,
}

/// Aggregated statistics, all tracked incrementally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyspaceStats {
    pub key_count: usize,
    pub used_bytes: usize,
    pub keys_with_expiry: usize,
    pub keys_expired: u64,
    pub keys_evicted: u64,
}

/// The core key-value store. Cheap to share via `Arc`.
pub struct Keyspace {
    entries: DashMap<String, Arc<RwLock<Entry>>, ahash::RandomState>,
    /// Serializes first-time key creation.
    creation_lock: Mutex<()>,
    /// Keys that currently carry an expiry deadline.
    expiring: StdMutex<HashSet<String>>,
    lru: StdMutex<LruCache>,
    lfu: StdMutex<LfuCache>,
    config: KeyspaceConfig,
    used_bytes: AtomicUsize,
    expired_total: AtomicU64,
    evicted_total: AtomicU64,
    /// Set while `get_state` exports a consistent copy.
    pub state_copy_in_progress: AtomicBool,
    /// Set by callers mutating state in bulk (restore paths).
    pub state_mutation_in_progress: AtomicBool,
}

impl Keyspace {
    /// Creates an empty keyspace with no memory limit.
    pub fn new() -> Self {
        Self::with_config(KeyspaceConfig::default())
    }

    pub fn with_config(config: KeyspaceConfig) -> Self {
        Self {
            entries: DashMap::with_hasher(ahash::RandomState::new()),
            creation_lock: Mutex::new(()),
            expiring: StdMutex::new(HashSet::new()),
            lru: StdMutex::new(LruCache::new()),
            lfu: StdMutex::new(LfuCache::new()),
            config,
            used_bytes: AtomicUsize::new(0),
            expired_total: AtomicU64::new(0),
            evicted_total: AtomicU64::new(0),
            state_copy_in_progress: AtomicBool::new(false),
            state_mutation_in_progress: AtomicBool::new(false),
        }
    }

    fn entry_size(key: &str, value: &Value) -> usize {
        ENTRY_OVERHEAD + key.len() + value.estimated_size()
    }

    fn lock_of(&self, key: &str) -> Option<Arc<RwLock<Entry>>> {
        self.entries.get(key).map(|e| Arc::clone(e.value()))
    }

    /// Returns `true` if the key is present and not logically expired.
    /// Expired entries are removed lazily here.
    pub async fn key_exists(&self, key: &str) -> bool {
        let Some(lock) = self.lock_of(key) else {
            return false;
        };
        let expired = lock.read().await.is_expired();
        if expired {
            self.remove_entry(key, true);
            return false;
        }
        true
    }

    /// Acquires the creation lock and returns the key write-locked. If
    /// the key already exists its lock is taken (and the creation lock
    /// released); otherwise an empty entry is inserted, write-locked
    /// before it becomes visible, and the creation lock released.
    ///
    /// Fails with `OutOfMemory` when a new entry cannot be reserved.
    pub async fn create_key_and_lock(&self, key: &str) -> Result<KeyWriteGuard, KeyspaceError> {
        let created = self.creation_lock.lock().await;

        if let Some(lock) = self.lock_of(key) {
            drop(created);
            let mut guard = lock.write_owned().await;
            if guard.is_expired() {
                // expired under us — reset to a fresh empty entry
                let old = Self::entry_size(key, &guard.value);
                self.shrink_used(old);
                self.grow_used(Self::entry_size(key, &Value::Str(Bytes::new())));
                self.untrack_expiry(key);
                guard.value = Value::Str(Bytes::new());
                guard.expires_at_ms = time::NO_EXPIRY;
            }
            self.note_access(key, guard.expires_at_ms != time::NO_EXPIRY);
            return Ok(KeyWriteGuard {
                key: key.to_owned(),
                guard,
            });
        }

        let empty = Value::Str(Bytes::new());
        self.reserve(Self::entry_size(key, &empty))?;

        let lock = Arc::new(RwLock::new(Entry {
            value: empty,
            expires_at_ms: time::NO_EXPIRY,
        }));
        // lock before publishing so no reader can observe the entry unlocked
        let guard = Arc::clone(&lock)
            .try_write_owned()
            .expect("freshly created lock is uncontended");
        self.grow_used(Self::entry_size(key, &guard.value));
        self.entries.insert(key.to_owned(), lock);
        drop(created);

        self.note_access(key, false);
        Ok(KeyWriteGuard {
            key: key.to_owned(),
            guard,
        })
    }

    /// Write-locks an existing key. Fails with `NotFound` if the key is
    /// absent or expired.
    pub async fn key_lock(&self, key: &str) -> Result<KeyWriteGuard, KeyspaceError> {
        let lock = self.lock_of(key).ok_or(KeyspaceError::NotFound)?;
        let guard = lock.write_owned().await;
        if guard.is_expired() {
            drop(guard);
            self.remove_entry(key, true);
            return Err(KeyspaceError::NotFound);
        }
        self.note_access(key, guard.expires_at_ms != time::NO_EXPIRY);
        Ok(KeyWriteGuard {
            key: key.to_owned(),
            guard,
        })
    }

    /// Read-locks an existing key. Fails with `NotFound` if the key is
    /// absent or expired.
    pub async fn key_rlock(&self, key: &str) -> Result<KeyReadGuard, KeyspaceError> {
        let lock = self.lock_of(key).ok_or(KeyspaceError::NotFound)?;
        let guard = lock.read_owned().await;
        if guard.is_expired() {
            drop(guard);
            self.remove_entry(key, true);
            return Err(KeyspaceError::NotFound);
        }
        self.note_access(key, guard.expires_at_ms != time::NO_EXPIRY);
        Ok(KeyReadGuard {
            key: key.to_owned(),
            guard,
        })
    }

    /// Replaces the value under a held write lock. The memory delta is
    /// reserved (evicting if the policy allows) before the swap.
    pub fn set_value(&self, guard: &mut KeyWriteGuard, value: Value) -> Result<(), KeyspaceError> {
        let old = Self::entry_size(&guard.key, &guard.guard.value);
        let new = Self::entry_size(&guard.key, &value);
        if new > old {
            self.reserve(new - old)?;
        }
        guard.guard.value = value;
        self.shrink_used(old);
        self.grow_used(new);
        self.note_access(&guard.key, guard.guard.expires_at_ms != time::NO_EXPIRY);
        Ok(())
    }

    /// Mutates the value in place under a held write lock, adjusting
    /// memory accounting by the observed size delta afterwards. Growth
    /// beyond the limit triggers a best-effort eviction pass.
    pub fn update_value<T>(
        &self,
        guard: &mut KeyWriteGuard,
        f: impl FnOnce(&mut Value) -> T,
    ) -> T {
        let old = Self::entry_size(&guard.key, &guard.guard.value);
        let result = f(&mut guard.guard.value);
        let new = Self::entry_size(&guard.key, &guard.guard.value);
        self.shrink_used(old);
        self.grow_used(new);
        if new > old {
            // post-hoc pressure relief; the locked key itself is skipped
            let _ = self.reserve(0);
        }
        self.note_access(&guard.key, guard.guard.expires_at_ms != time::NO_EXPIRY);
        result
    }

    /// Sets the expiry deadline (monotonic ms; 0 clears it). Updates the
    /// TTL index unless `touch_only`, which only rewrites the deadline
    /// field for a key already indexed.
    pub fn set_expiry(&self, guard: &mut KeyWriteGuard, deadline_ms: u64, touch_only: bool) {
        let had = guard.guard.expires_at_ms != time::NO_EXPIRY;
        guard.guard.expires_at_ms = deadline_ms;
        if touch_only {
            return;
        }
        let has = deadline_ms != time::NO_EXPIRY;
        match (had, has) {
            (_, true) => self.track_expiry(&guard.key),
            (true, false) => self.untrack_expiry(&guard.key),
            (false, false) => {}
        }
        // volatile policies track only TTL-carrying keys
        if self.config.eviction_policy.is_volatile() {
            if has {
                self.note_access(&guard.key, true);
            } else {
                self.forget_key(&guard.key);
            }
        }
    }

    /// Convenience for handlers: expiry as a TTL from now.
    pub fn set_ttl(&self, guard: &mut KeyWriteGuard, ttl: Option<Duration>) {
        self.set_expiry(guard, time::expiry_from_duration(ttl), false);
    }

    /// Deletes a key: write-locks it, then removes it from the map, the
    /// TTL index, and the eviction caches. Returns `true` if the key
    /// existed and was live.
    pub async fn delete_key(&self, key: &str) -> bool {
        let Some(lock) = self.lock_of(key) else {
            return false;
        };
        let guard = lock.write_owned().await;
        let was_live = !guard.is_expired();
        drop(guard);
        self.remove_entry(key, !was_live);
        was_live
    }

    /// Non-blocking delete used by eviction and the reaper. Returns
    /// `None` on lock contention or a missing key, `Some(false)` when
    /// `only_if_expired` blocked a live key, `Some(true)` after removal.
    fn try_delete_key(&self, key: &str, only_if_expired: bool) -> Option<bool> {
        let lock = self.lock_of(key)?;
        let guard = lock.try_write_owned().ok()?;
        let expired = guard.is_expired();
        if only_if_expired && !expired {
            return Some(false);
        }
        drop(guard);
        self.remove_entry(key, expired);
        Some(true)
    }

    /// Removes the entry and all index/cache references. `expired`
    /// attributes the removal to the expiry counters.
    fn remove_entry(&self, key: &str, expired: bool) {
        if let Some((_, lock)) = self.entries.remove(key) {
            // no other guard can be pending here on the expiry/evict
            // paths (the caller just held the write lock); on the
            // delete path a racing locker sees NotFound afterwards
            let size = match lock.try_read() {
                Ok(entry) => Self::entry_size(key, &entry.value),
                Err(_) => ENTRY_OVERHEAD + key.len(),
            };
            self.shrink_used(size);
            if expired {
                self.expired_total.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.untrack_expiry(key);
        self.forget_key(key);
    }

    /// Exports all live (key, value, remaining-ttl) triples. Sets the
    /// state-copy flag for the duration and read-locks each key, so the
    /// export is consistent per key and excludes in-flight writers.
    pub async fn get_state(&self) -> Vec<StateEntry> {
        self.state_copy_in_progress.store(true, Ordering::SeqCst);

        let locks: Vec<(String, Arc<RwLock<Entry>>)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        let mut state = Vec::with_capacity(locks.len());
        for (key, lock) in locks {
            let entry = lock.read().await;
            if entry.is_expired() {
                continue;
            }
            let remaining_ttl_ms = match time::remaining_ms(entry.expires_at_ms) {
                Some(ms) => ms.min(i64::MAX as u64) as i64,
                None => -1,
            };
            state.push(StateEntry {
                key,
                value: entry.value.clone(),
                remaining_ttl_ms,
            });
        }

        self.state_copy_in_progress.store(false, Ordering::SeqCst);
        state
    }

    /// Restores an entry during recovery, bypassing the memory limit.
    /// `remaining_ttl` of `None` means no expiry.
    pub fn restore(&self, key: String, value: Value, remaining_ttl: Option<Duration>) {
        let deadline = time::expiry_from_duration(remaining_ttl);
        let size = Self::entry_size(&key, &value);

        if let Some(existing) = self.entries.get(&key) {
            if let Ok(mut entry) = existing.try_write() {
                self.shrink_used(Self::entry_size(&key, &entry.value));
                entry.value = value;
                entry.expires_at_ms = deadline;
                self.grow_used(size);
                drop(entry);
                if deadline != time::NO_EXPIRY {
                    self.track_expiry(&key);
                } else {
                    self.untrack_expiry(&key);
                }
                return;
            }
        }

        self.entries.insert(
            key.clone(),
            Arc::new(RwLock::new(Entry {
                value,
                expires_at_ms: deadline,
            })),
        );
        self.grow_used(size);
        if deadline != time::NO_EXPIRY {
            self.track_expiry(&key);
        }
    }

    /// Removes every key. Used when installing a replicated snapshot.
    pub fn clear(&self) {
        self.entries.clear();
        self.expiring.lock().expect("expiry index poisoned").clear();
        self.lru.lock().expect("lru cache poisoned").clear();
        self.lfu.lock().expect("lfu cache poisoned").clear();
        self.used_bytes.store(0, Ordering::Relaxed);
    }

    /// One reaper pass: scans the TTL index and deletes every key whose
    /// deadline has passed, skipping keys under lock contention.
    /// Returns the number of keys removed.
    pub fn remove_expired(&self) -> usize {
        let candidates: Vec<String> = {
            let index = self.expiring.lock().expect("expiry index poisoned");
            index.iter().cloned().collect()
        };

        let mut removed = 0;
        for key in candidates {
            let deadline = match self.lock_of(&key) {
                Some(lock) => match lock.try_read() {
                    Ok(entry) => entry.expires_at_ms,
                    Err(_) => continue,
                },
                None => {
                    // entry gone but still indexed — heal the index
                    self.untrack_expiry(&key);
                    continue;
                }
            };
            if !time::is_expired(deadline) {
                continue;
            }
            if self.try_delete_key(&key, true) == Some(true) {
                removed += 1;
            }
        }
        removed
    }

    /// Number of keys currently in the map (including not-yet-reaped
    /// expired entries).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> KeyspaceStats {
        KeyspaceStats {
            key_count: self.entries.len(),
            used_bytes: self.used_bytes.load(Ordering::Relaxed),
            keys_with_expiry: self.expiring.lock().expect("expiry index poisoned").len(),
            keys_expired: self.expired_total.load(Ordering::Relaxed),
            keys_evicted: self.evicted_total.load(Ordering::Relaxed),
        }
    }

    // -- eviction machinery --

    /// Checks that `estimated_increase` more bytes fit under the limit,
    /// running the eviction loop when they don't. `noeviction` refuses
    /// the write with `OutOfMemory` instead of evicting.
    pub fn reserve(&self, estimated_increase: usize) -> Result<(), KeyspaceError> {
        let Some(limit) = self.config.max_memory else {
            return Ok(());
        };

        let mut attempts = 0;
        while self.used_bytes.load(Ordering::Relaxed) + estimated_increase > limit {
            if self.config.eviction_policy == EvictionPolicy::NoEviction {
                return Err(KeyspaceError::OutOfMemory);
            }
            if attempts >= MAX_EVICTION_ATTEMPTS {
                warn!(attempts, "eviction loop gave up under contention");
                return Err(KeyspaceError::OutOfMemory);
            }
            attempts += 1;

            let Some(victim) = self.pick_victim() else {
                return Err(KeyspaceError::OutOfMemory);
            };
            if self.try_delete_key(&victim, false) == Some(true) {
                self.evicted_total.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Selects the next eviction victim under the configured policy.
    fn pick_victim(&self) -> Option<String> {
        use EvictionPolicy::*;
        match self.config.eviction_policy {
            NoEviction => None,
            AllKeysLru | VolatileLru => self.lru.lock().expect("lru cache poisoned").pop(),
            AllKeysLfu | VolatileLfu => self.lfu.lock().expect("lfu cache poisoned").pop(),
            VolatileTtl => self.soonest_expiring(),
            AllKeysRandom => {
                let mut rng = rand::rng();
                self.entries
                    .iter()
                    .map(|e| e.key().clone())
                    .choose(&mut rng)
            }
            VolatileRandom => {
                let mut rng = rand::rng();
                let index = self.expiring.lock().expect("expiry index poisoned");
                index.iter().choose(&mut rng).cloned()
            }
        }
    }

    /// The TTL-indexed key with the soonest deadline. O(n) over keys
    /// with a TTL; contended keys are skipped.
    fn soonest_expiring(&self) -> Option<String> {
        let candidates: Vec<String> = {
            let index = self.expiring.lock().expect("expiry index poisoned");
            index.iter().cloned().collect()
        };
        let mut best: Option<(u64, String)> = None;
        for key in candidates {
            let Some(lock) = self.lock_of(&key) else {
                continue;
            };
            let Ok(entry) = lock.try_read() else {
                continue;
            };
            let deadline = entry.expires_at_ms;
            if deadline == time::NO_EXPIRY {
                continue;
            }
            if best.as_ref().is_none_or(|(d, _)| deadline < *d) {
                best = Some((deadline, key));
            }
        }
        best.map(|(_, key)| key)
    }

    /// Records an access in the cache the active policy maintains.
    fn note_access(&self, key: &str, has_ttl: bool) {
        let policy = self.config.eviction_policy;
        if policy.is_volatile() && !has_ttl {
            return;
        }
        if policy.uses_lru() {
            self.lru.lock().expect("lru cache poisoned").touch(key);
        }
        if policy.uses_lfu() {
            self.lfu.lock().expect("lfu cache poisoned").touch(key);
        }
    }

    /// Drops a key from both eviction caches.
    fn forget_key(&self, key: &str) {
        self.lru.lock().expect("lru cache poisoned").remove(key);
        self.lfu.lock().expect("lfu cache poisoned").remove(key);
    }

    fn track_expiry(&self, key: &str) {
        self.expiring
            .lock()
            .expect("expiry index poisoned")
            .insert(key.to_owned());
    }

    fn untrack_expiry(&self, key: &str) {
        self.expiring
            .lock()
            .expect("expiry index poisoned")
            .remove(key);
    }

    fn grow_used(&self, bytes: usize) {
        self.used_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn shrink_used(&self, bytes: usize) {
        let _ = self
            .used_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                Some(used.saturating_sub(bytes))
            });
    }
}

impl Default for Keyspace {
    fn default() -> Self {
        Self::new()
    }
}
