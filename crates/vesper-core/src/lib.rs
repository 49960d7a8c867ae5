//! vesper-core: the keyspace execution engine.
//!
//! Owns the typed values, the per-key-locked concurrent keyspace, the
//! sorted-set algebra, TTL tracking and the reaper, and the LRU/LFU
//! eviction caches. Everything above this crate (dispatcher, durability,
//! replication) consumes the keyspace through the guard-based lock API.

pub mod error;
pub mod eviction;
pub mod keyspace;
pub mod reaper;
pub mod time;
pub mod types;

pub use error::{KeyspaceError, ScoreError};
pub use eviction::{EvictionPolicy, LfuCache, LruCache};
pub use keyspace::{
    KeyReadGuard, KeyWriteGuard, Keyspace, KeyspaceConfig, KeyspaceStats, StateEntry,
};
pub use types::sorted_set::{
    difference, format_score, intersect, parse_score, union, Aggregate, SortedSet, WeightedSet,
    ZAddFlags,
};
pub use types::Value;
