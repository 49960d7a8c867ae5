//! Periodic expiry sweep over the TTL index.
//!
//! The reaper is eventually consistent: a key may be observed live for up
//! to one interval after its deadline. Lazy expiry on access covers the
//! gap for keys that are actually read.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::keyspace::Keyspace;

/// Runs the reaper until the task is aborted. Each tick scans the TTL
/// index and deletes keys whose deadline has passed, skipping keys under
/// lock contention.
pub async fn run(keyspace: Arc<Keyspace>, interval: Duration) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        let removed = keyspace.remove_expired();
        if removed > 0 {
            debug!(removed, "reaped expired keys");
        }
    }
}
