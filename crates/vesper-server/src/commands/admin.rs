//! Server management commands: snapshotting and AOF rewrite.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::error;
use vesper_persistence::snapshot;
use vesper_protocol::Frame;

use crate::dispatch::{Category, CommandError, CommandSpec, HandlerFuture};
use crate::state::{ExecContext, ServerState};

use super::no_keys;

/// Takes one snapshot: through the Raft FSM in cluster mode, to a
/// `snapshot.<ts>` file in standalone mode. Gated by the
/// `snapshot_in_progress` flag so runs never overlap.
pub(crate) async fn take_snapshot(state: Arc<ServerState>) -> Result<(), CommandError> {
    if state.snapshot_in_progress.swap(true, Ordering::SeqCst) {
        return Err(CommandError::Transient("snapshot already in progress".into()));
    }

    let result = async {
        let now = vesper_core::time::unix_ms();
        if let Some(cluster) = state.cluster.get() {
            cluster
                .take_snapshot()
                .await
                .map_err(|e| CommandError::Fatal(format!("snapshot failed: {e}")))?;
        } else {
            let entries = state.keyspace.get_state().await;
            snapshot::write_snapshot(&state.config.data_dir, now, &entries)
                .map_err(|e| CommandError::Fatal(format!("snapshot failed: {e}")))?;
        }
        state.latest_snapshot_ms.store(now, Ordering::SeqCst);
        Ok(())
    }
    .await;

    state.snapshot_in_progress.store(false, Ordering::SeqCst);
    result
}

/// Rewrites the AOF: fresh preamble from current state, truncated log.
pub(crate) async fn rewrite_aof(state: Arc<ServerState>) -> Result<(), CommandError> {
    let Some(aof) = &state.aof else {
        return Err(CommandError::Fatal("aof is not enabled".into()));
    };
    let entries = state.keyspace.get_state().await;
    aof.rewrite_log(vesper_core::time::unix_ms(), &entries)
        .await
        .map_err(|e| CommandError::Fatal(format!("aof rewrite failed: {e}")))
}

fn bgsave(ctx: ExecContext, args: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        if args.len() != 1 {
            return Err(CommandError::WrongArgs);
        }
        if ctx.state.snapshot_in_progress.load(Ordering::SeqCst) {
            return Err(CommandError::Transient("snapshot already in progress".into()));
        }
        let state = Arc::clone(&ctx.state);
        tokio::spawn(async move {
            if let Err(e) = take_snapshot(state).await {
                error!("background snapshot failed: {e}");
            }
        });
        Ok(Frame::ok())
    })
}

fn lastsave(ctx: ExecContext, args: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        if args.len() != 1 {
            return Err(CommandError::WrongArgs);
        }
        Ok(Frame::Integer(
            ctx.state.latest_snapshot_ms.load(Ordering::SeqCst),
        ))
    })
}

fn bgrewriteaof(ctx: ExecContext, args: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        if args.len() != 1 {
            return Err(CommandError::WrongArgs);
        }
        if ctx.state.aof.is_none() {
            return Err(CommandError::Fatal("aof is not enabled".into()));
        }
        if ctx.state.aof_rewrite_in_progress.load(Ordering::SeqCst) {
            return Err(CommandError::Transient("aof rewrite already in progress".into()));
        }
        let state = Arc::clone(&ctx.state);
        tokio::spawn(async move {
            if let Err(e) = rewrite_aof(state).await {
                error!("background aof rewrite failed: {e}");
            }
        });
        Ok(Frame::ok())
    })
}

pub fn commands() -> Vec<CommandSpec> {
    vec![
        CommandSpec {
            name: "bgsave",
            categories: &[Category::Admin, Category::Slow, Category::Dangerous],
            description: "(BGSAVE) Trigger a background snapshot.",
            synchronized: false,
            extract_keys: no_keys,
            handler: bgsave,
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "lastsave",
            categories: &[Category::Admin, Category::Fast, Category::Dangerous],
            description: "(LASTSAVE) Unix milliseconds of the latest snapshot.",
            synchronized: false,
            extract_keys: no_keys,
            handler: lastsave,
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "bgrewriteaof",
            categories: &[Category::Admin, Category::Slow, Category::Dangerous],
            description: "(BGREWRITEAOF) Rewrite the append log behind a fresh preamble.",
            synchronized: false,
            extract_keys: no_keys,
            handler: bgrewriteaof,
            subcommands: Vec::new(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::dispatch::execute_handler;
    use bytes::Bytes;
    use vesper_core::Value;

    fn ctx_with_dir(dir: &std::path::Path) -> ExecContext {
        let config = ServerConfig {
            data_dir: dir.to_path_buf(),
            ..ServerConfig::default()
        };
        ExecContext::internal(ServerState::new(config).unwrap())
    }

    async fn run(ctx: &ExecContext, tokens: &[&str]) -> Result<Frame, CommandError> {
        execute_handler(ctx, tokens.iter().map(|s| s.to_string()).collect()).await
    }

    #[tokio::test]
    async fn take_snapshot_writes_file_and_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_with_dir(dir.path());
        {
            let mut guard = ctx.state.keyspace.create_key_and_lock("k").await.unwrap();
            ctx.state
                .keyspace
                .set_value(&mut guard, Value::Str(Bytes::from("v")))
                .unwrap();
        }

        take_snapshot(Arc::clone(&ctx.state)).await.unwrap();

        let latest = snapshot::latest_snapshot(dir.path()).unwrap().unwrap();
        let (_, entries) = snapshot::read_snapshot(&latest, vesper_core::time::unix_ms()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, "k");

        match run(&ctx, &["lastsave"]).await.unwrap() {
            Frame::Integer(ms) => assert!(ms > 0),
            other => panic!("expected integer, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn bgsave_replies_ok() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_with_dir(dir.path());
        assert_eq!(run(&ctx, &["bgsave"]).await.unwrap(), Frame::ok());
    }

    #[tokio::test]
    async fn bgrewriteaof_requires_aof() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_with_dir(dir.path());
        let err = run(&ctx, &["bgrewriteaof"]).await.unwrap_err();
        assert!(matches!(err, CommandError::Fatal(_)));
    }
}
