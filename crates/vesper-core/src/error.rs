//! Error types for the core engine.

use thiserror::Error;

/// Errors returned by keyspace operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyspaceError {
    /// The key does not exist (or has logically expired). Lock acquisition
    /// on a missing key fails rather than blocks.
    #[error("ERR no such key")]
    NotFound,

    /// The operation was attempted on a key holding a value of the wrong
    /// type. For example, running a sorted-set command against a string key.
    #[error("WRONGTYPE Operation against a key holding the wrong type of value")]
    WrongType,

    /// Memory limit reached and the eviction policy could not free enough
    /// space (or is `noeviction`).
    #[error("OOM command not allowed when used memory > 'maxmemory'")]
    OutOfMemory,
}

/// Errors from sorted-set score parsing and arithmetic.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScoreError {
    /// The input could not be parsed as a float or `+inf`/`-inf`.
    #[error("ERR value is not a valid float")]
    NotAFloat,

    /// Score arithmetic produced NaN (e.g. `+inf` incremented by `-inf`).
    #[error("ERR resulting score is not a number (NaN)")]
    NotANumber,
}
