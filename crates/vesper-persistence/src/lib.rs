//! vesper-persistence: durability for the keyspace.
//!
//! The AOF engine (preamble + append log + rewrite), the snapshot
//! engine, and the binary format helpers they share. Both consume the
//! keyspace purely as exported [`vesper_core::StateEntry`] triples — the
//! server orchestrates state export and replay.

pub mod aof;
pub mod format;
pub mod record;
pub mod snapshot;

pub use aof::{AofEngine, FsyncPolicy};
pub use format::FormatError;
