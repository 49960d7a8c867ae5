//! vesper-cluster: Raft replication for the keyspace.
//!
//! Log storage, the state machine that applies committed commands
//! through the shared dispatcher, serializable apply request/response
//! types, and length-prefixed transport framing for peer RPCs.

pub mod apply;
pub mod raft;
pub mod transport;

pub use apply::{
    ApplyRequest, ApplyResponse, BoxFuture, CommandExecutor, KeyState, KeyspaceSnapshot,
    RequestKind, SnapshotValue,
};
pub use raft::{ClusterNode, Storage, TypeConfig};
