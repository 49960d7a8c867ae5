//! TCP server: restore, background tasks, and the accept loop.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{error, info, warn};
use vesper_persistence::{aof, snapshot};

use crate::commands::admin;
use crate::config::ServerConfig;
use crate::connection;
use crate::dispatch;
use crate::state::{ExecContext, ServerState};
use crate::tls;

/// Builds the server state, restores persisted data, spawns the
/// background tasks, and runs the accept loop until a fatal listener
/// error.
pub async fn run(config: ServerConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let acceptor = if config.tls || config.mtls {
        Some(tls::build_acceptor(&config)?)
    } else {
        None
    };

    let state = ServerState::new(config.clone())?;
    restore(&state).await;

    tokio::spawn(vesper_core::reaper::run(
        Arc::clone(&state.keyspace),
        config.eviction_interval,
    ));

    if config.snapshot_enabled && !config.cluster {
        tokio::spawn(snapshot_loop(Arc::clone(&state), config.snapshot_interval));
    }

    let listener = TcpListener::bind((config.bind_addr.as_str(), config.port)).await?;
    info!(
        addr = %config.bind_addr,
        port = config.port,
        tls = config.tls || config.mtls,
        cluster = config.cluster,
        "vesper listening"
    );

    loop {
        let (stream, peer) = listener.accept().await?;
        let state = Arc::clone(&state);
        match acceptor.clone() {
            Some(acceptor) => {
                tokio::spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            if let Err(e) = connection::handle(tls_stream, state).await {
                                error!("connection error from {peer}: {e}");
                            }
                        }
                        Err(e) => warn!("TLS handshake failed from {peer}: {e}"),
                    }
                });
            }
            None => {
                tokio::spawn(async move {
                    if let Err(e) = connection::handle(stream, state).await {
                        error!("connection error from {peer}: {e}");
                    }
                });
            }
        }
    }
}

/// Restores the keyspace from the AOF (preamble, then logged commands
/// replayed with durability disabled) or, failing that, from the newest
/// snapshot. Restore problems are logged; the server starts empty.
pub(crate) async fn restore(state: &Arc<ServerState>) {
    if state.is_in_cluster() {
        return;
    }
    state
        .keyspace
        .state_mutation_in_progress
        .store(true, Ordering::SeqCst);
    restore_inner(state).await;
    state
        .keyspace
        .state_mutation_in_progress
        .store(false, Ordering::SeqCst);
}

async fn restore_inner(state: &Arc<ServerState>) {
    let config = &state.config;
    let now = vesper_core::time::unix_ms();

    if config.restore_aof && config.aof_enabled {
        match aof::read_preamble(&config.data_dir, now) {
            Ok(entries) => {
                let count = entries.len();
                for entry in entries {
                    let ttl = (entry.remaining_ttl_ms >= 0)
                        .then(|| Duration::from_millis(entry.remaining_ttl_ms as u64));
                    state.keyspace.restore(entry.key, entry.value, ttl);
                }
                info!(keys = count, "restored aof preamble");
            }
            Err(e) => error!("aof preamble restore failed: {e}"),
        }
        match aof::read_log(&config.data_dir) {
            Ok(commands) => {
                let count = commands.len();
                let ctx = ExecContext::internal(Arc::clone(state));
                for command in commands {
                    dispatch::replay_command(&ctx, &command).await;
                }
                info!(commands = count, "replayed aof log");
            }
            Err(e) => error!("aof log replay failed: {e}"),
        }
        return;
    }

    if config.restore_snapshot {
        let latest = match snapshot::latest_snapshot(&config.data_dir) {
            Ok(Some(path)) => path,
            Ok(None) => return,
            Err(e) => {
                error!("snapshot discovery failed: {e}");
                return;
            }
        };
        match snapshot::read_snapshot(&latest, now) {
            Ok((captured, entries)) => {
                let count = entries.len();
                for entry in entries {
                    let ttl = (entry.remaining_ttl_ms >= 0)
                        .then(|| Duration::from_millis(entry.remaining_ttl_ms as u64));
                    state.keyspace.restore(entry.key, entry.value, ttl);
                }
                state.latest_snapshot_ms.store(captured, Ordering::SeqCst);
                info!(keys = count, snapshot = %latest.display(), "restored snapshot");
            }
            Err(e) => error!("snapshot restore failed: {e}"),
        }
    }
}

/// Periodic snapshot task for standalone mode.
async fn snapshot_loop(state: Arc<ServerState>, interval: Duration) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // skip the immediate first tick
    tick.tick().await;
    loop {
        tick.tick().await;
        if let Err(e) = admin::take_snapshot(Arc::clone(&state)).await {
            warn!("periodic snapshot failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::execute_handler;
    use vesper_persistence::FsyncPolicy;

    fn aof_config(dir: &std::path::Path) -> ServerConfig {
        ServerConfig {
            data_dir: dir.to_path_buf(),
            aof_enabled: true,
            restore_aof: true,
            aof_fsync: FsyncPolicy::Always,
            ..ServerConfig::default()
        }
    }

    async fn run_cmd(ctx: &ExecContext, tokens: &[&str]) {
        execute_handler(ctx, tokens.iter().map(|s| s.to_string()).collect())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn aof_replay_rebuilds_keyspace() {
        let dir = tempfile::tempdir().unwrap();

        // first life: write through the dispatcher so commands hit the log
        {
            let state = ServerState::new(aof_config(dir.path())).unwrap();
            let ctx = ExecContext {
                suppress_log: false,
                ..ExecContext::internal(Arc::clone(&state))
            };
            let tokens: Vec<String> = ["set", "greeting", "hello"]
                .iter()
                .map(|s| s.to_string())
                .collect();
            let reply = dispatch::dispatch(&ctx, tokens).await;
            assert_eq!(&reply[..], b"+OK\r\n");
            let tokens: Vec<String> = ["zadd", "board", "1", "a", "2", "b"]
                .iter()
                .map(|s| s.to_string())
                .collect();
            dispatch::dispatch(&ctx, tokens).await;

            // let the writer task drain the queue
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        // second life: restore from the log
        let state = ServerState::new(aof_config(dir.path())).unwrap();
        restore(&state).await;
        let ctx = ExecContext::internal(Arc::clone(&state));

        let reply = execute_handler(
            &ctx,
            vec!["get".to_string(), "greeting".to_string()],
        )
        .await
        .unwrap();
        assert_eq!(reply, vesper_protocol::Frame::bulk("hello"));

        let reply = execute_handler(&ctx, vec!["zcard".to_string(), "board".to_string()])
            .await
            .unwrap();
        assert_eq!(reply, vesper_protocol::Frame::Integer(2));
    }

    #[tokio::test]
    async fn rewrite_then_restore_round_trip() {
        let dir = tempfile::tempdir().unwrap();

        {
            let state = ServerState::new(aof_config(dir.path())).unwrap();
            let ctx = ExecContext::internal(Arc::clone(&state));
            run_cmd(&ctx, &["set", "a", "1"]).await;
            run_cmd(&ctx, &["zadd", "z", "5", "m"]).await;

            admin::rewrite_aof(Arc::clone(&state)).await.unwrap();
        }

        let state = ServerState::new(aof_config(dir.path())).unwrap();
        restore(&state).await;
        let ctx = ExecContext::internal(Arc::clone(&state));

        let reply = execute_handler(&ctx, vec!["get".to_string(), "a".to_string()])
            .await
            .unwrap();
        assert_eq!(reply, vesper_protocol::Frame::bulk("1"));
        let reply = execute_handler(
            &ctx,
            vec!["zscore".to_string(), "z".to_string(), "m".to_string()],
        )
        .await
        .unwrap();
        assert_eq!(reply, vesper_protocol::Frame::bulk("5"));
    }

    #[tokio::test]
    async fn snapshot_restore_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            data_dir: dir.path().to_path_buf(),
            snapshot_enabled: true,
            restore_snapshot: true,
            ..ServerConfig::default()
        };

        {
            let state = ServerState::new(config.clone()).unwrap();
            let ctx = ExecContext::internal(Arc::clone(&state));
            run_cmd(&ctx, &["set", "k", "persisted"]).await;
            admin::take_snapshot(Arc::clone(&state)).await.unwrap();
        }

        let state = ServerState::new(config).unwrap();
        restore(&state).await;
        let ctx = ExecContext::internal(Arc::clone(&state));
        let reply = execute_handler(&ctx, vec!["get".to_string(), "k".to_string()])
            .await
            .unwrap();
        assert_eq!(reply, vesper_protocol::Frame::bulk("persisted"));
        assert!(state.latest_snapshot_ms.load(Ordering::SeqCst) > 0);
    }
}
