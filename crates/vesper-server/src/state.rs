//! Shared server state and per-command execution context.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use vesper_cluster::{
    ApplyRequest, ApplyResponse, BoxFuture, ClusterNode, CommandExecutor, KeyState,
    KeyspaceSnapshot, RequestKind,
};
use vesper_core::{Keyspace, KeyspaceConfig, StateEntry};
use vesper_persistence::{AofEngine, FormatError};

use crate::acl::{AccessControl, AllowAll, ConnInfo};
use crate::config::ServerConfig;
use crate::dispatch;
use crate::pubsub::PubSubManager;

/// Everything a command handler can reach: the keyspace, durability
/// engines, pub/sub, ACL, and the background-task gate flags.
pub struct ServerState {
    pub config: ServerConfig,
    pub keyspace: Arc<Keyspace>,
    pub pubsub: Arc<PubSubManager>,
    pub acl: Arc<dyn AccessControl>,
    /// Standalone durability; `None` in cluster mode or when disabled.
    pub aof: Option<AofEngine>,
    /// Replication; set once after construction in cluster mode.
    pub cluster: OnceLock<ClusterNode>,

    pub snapshot_in_progress: AtomicBool,
    pub aof_rewrite_in_progress: Arc<AtomicBool>,
    pub latest_snapshot_ms: AtomicI64,
    conn_counter: AtomicU64,
}

impl ServerState {
    /// Builds the state from config: keyspace with the eviction policy,
    /// the AOF engine when enabled, and (in cluster mode) the Raft node
    /// wired back into the dispatcher.
    pub fn new(config: ServerConfig) -> Result<Arc<Self>, FormatError> {
        let keyspace = Arc::new(Keyspace::with_config(KeyspaceConfig {
            max_memory: config.max_memory,
            eviction_policy: config.eviction_policy,
        }));

        let aof_rewrite_in_progress = Arc::new(AtomicBool::new(false));
        let aof = if config.aof_enabled && !config.cluster {
            Some(AofEngine::start(
                &config.data_dir,
                config.aof_fsync,
                Arc::clone(&aof_rewrite_in_progress),
            )?)
        } else {
            None
        };

        let cluster_mode = config.cluster;
        let state = Arc::new(Self {
            config,
            keyspace,
            pubsub: Arc::new(PubSubManager::new()),
            acl: Arc::new(AllowAll),
            aof,
            cluster: OnceLock::new(),
            snapshot_in_progress: AtomicBool::new(false),
            aof_rewrite_in_progress,
            latest_snapshot_ms: AtomicI64::new(0),
            conn_counter: AtomicU64::new(0),
        });

        if cluster_mode {
            let node = ClusterNode::new(Arc::new(DispatchExecutor {
                state: Arc::clone(&state),
            }));
            let _ = state.cluster.set(node);
        }

        Ok(state)
    }

    /// Allocates the next connection id.
    pub fn next_conn_id(&self) -> u64 {
        self.conn_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn is_in_cluster(&self) -> bool {
        self.cluster.get().is_some()
    }
}

/// Handle for one client connection: its id, the outbound message
/// queue (responses and pub/sub deliveries share it), and the
/// forwarder tasks feeding subscribed messages into that queue.
pub struct ConnHandle {
    pub id: u64,
    outbound: mpsc::Sender<Bytes>,
    forwarders: StdMutex<HashMap<String, AbortHandle>>,
}

impl ConnHandle {
    pub fn new(id: u64, outbound: mpsc::Sender<Bytes>) -> Self {
        Self {
            id,
            outbound,
            forwarders: StdMutex::new(HashMap::new()),
        }
    }

    /// Queues bytes for delivery to the client.
    pub async fn push(&self, bytes: Bytes) {
        let _ = self.outbound.send(bytes).await;
    }

    pub fn outbound(&self) -> mpsc::Sender<Bytes> {
        self.outbound.clone()
    }

    /// Tracks a subscription forwarder so unsubscribe and connection
    /// teardown can stop it. An existing forwarder for the same name is
    /// replaced and aborted.
    pub fn register_forwarder(&self, name: String, handle: AbortHandle) {
        let mut forwarders = self.forwarders.lock().expect("forwarders poisoned");
        if let Some(old) = forwarders.insert(name, handle) {
            old.abort();
        }
    }

    /// Stops the forwarder for one subscription. Returns whether it
    /// existed.
    pub fn remove_forwarder(&self, name: &str) -> bool {
        let mut forwarders = self.forwarders.lock().expect("forwarders poisoned");
        match forwarders.remove(name) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Names of this connection's active subscriptions.
    pub fn subscription_names(&self) -> Vec<String> {
        self.forwarders
            .lock()
            .expect("forwarders poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Aborts every forwarder. Called on connection teardown.
    pub fn shutdown(&self) {
        let mut forwarders = self.forwarders.lock().expect("forwarders poisoned");
        for (_, handle) in forwarders.drain() {
            handle.abort();
        }
    }
}

impl Drop for ConnHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Context handed to every command handler: shared server state plus
/// the issuing connection (absent for internal callers).
#[derive(Clone)]
pub struct ExecContext {
    pub state: Arc<ServerState>,
    pub conn: Option<Arc<ConnHandle>>,
    /// True on replay/apply paths: skip durability side-effects.
    pub suppress_log: bool,
}

impl ExecContext {
    pub fn for_conn(state: Arc<ServerState>, conn: Arc<ConnHandle>) -> Self {
        Self {
            state,
            conn: Some(conn),
            suppress_log: false,
        }
    }

    /// Context for internal callers: AOF replay and the Raft apply path.
    pub fn internal(state: Arc<ServerState>) -> Self {
        Self {
            state,
            conn: None,
            suppress_log: true,
        }
    }

    pub fn conn_info(&self) -> ConnInfo {
        ConnInfo {
            id: self.conn.as_ref().map(|c| c.id).unwrap_or(0),
            user: None,
        }
    }
}

/// Bridges the Raft state machine onto the dispatcher: committed
/// entries run through the same handlers the TCP path uses, and
/// snapshots flow through the keyspace's state export/import.
pub struct DispatchExecutor {
    pub state: Arc<ServerState>,
}

impl CommandExecutor for DispatchExecutor {
    fn apply<'a>(&'a self, request: &'a ApplyRequest) -> BoxFuture<'a, ApplyResponse> {
        Box::pin(async move {
            match request.kind {
                RequestKind::DeleteKey => {
                    self.state.keyspace.delete_key(&request.key).await;
                    ApplyResponse::ok(b"+OK\r\n".to_vec())
                }
                RequestKind::Command => {
                    let ctx = ExecContext::internal(Arc::clone(&self.state));
                    match dispatch::execute_handler(&ctx, request.cmd.clone()).await {
                        Ok(frame) => ApplyResponse::ok(frame.to_bytes()),
                        Err(e) => ApplyResponse::err(e.to_string()),
                    }
                }
            }
        })
    }

    fn export_state(&self) -> BoxFuture<'_, KeyspaceSnapshot> {
        Box::pin(async move {
            let state = self.state.keyspace.get_state().await;
            KeyspaceSnapshot {
                state: state.iter().map(KeyState::from_entry).collect(),
                latest_snapshot_ms: self.state.latest_snapshot_ms.load(Ordering::SeqCst),
            }
        })
    }

    fn import_state(&self, snapshot: KeyspaceSnapshot) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.state
                .keyspace
                .state_mutation_in_progress
                .store(true, Ordering::SeqCst);
            self.state.keyspace.clear();
            for key_state in snapshot.state {
                let StateEntry {
                    key,
                    value,
                    remaining_ttl_ms,
                } = key_state.into_entry();
                let ttl = (remaining_ttl_ms >= 0)
                    .then(|| Duration::from_millis(remaining_ttl_ms as u64));
                if matches!(ttl, Some(d) if d.is_zero()) {
                    continue;
                }
                self.state.keyspace.restore(key, value, ttl);
            }
            self.state
                .latest_snapshot_ms
                .store(snapshot.latest_snapshot_ms, Ordering::SeqCst);
            self.state
                .keyspace
                .state_mutation_in_progress
                .store(false, Ordering::SeqCst);
        })
    }
}
