//! Replicated request/response types and the executor boundary.
//!
//! Committed log entries are applied by re-invoking the same command
//! handlers the TCP path uses. The state machine stays transport-free by
//! calling through [`CommandExecutor`] — the server implements it on top
//! of its dispatcher and keyspace.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use vesper_core::{SortedSet, StateEntry, Value};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What a replicated log entry asks the state machine to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    /// Run a command through the shared dispatcher path.
    #[serde(rename = "command")]
    Command,
    /// Remove a key from the keyspace.
    #[serde(rename = "delete-key")]
    DeleteKey,
}

/// A request replicated through the Raft log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyRequest {
    pub kind: RequestKind,
    /// Identity of the server that accepted the client command.
    pub server_id: String,
    /// Connection id on the accepting server, for per-connection context.
    pub conn_id: u64,
    /// Target key for `DeleteKey` requests; empty for commands.
    pub key: String,
    /// The raw command tokens for `Command` requests.
    pub cmd: Vec<String>,
}

impl ApplyRequest {
    pub fn command(server_id: impl Into<String>, conn_id: u64, cmd: Vec<String>) -> Self {
        Self {
            kind: RequestKind::Command,
            server_id: server_id.into(),
            conn_id,
            key: String::new(),
            cmd,
        }
    }

    pub fn delete_key(server_id: impl Into<String>, conn_id: u64, key: impl Into<String>) -> Self {
        Self {
            kind: RequestKind::DeleteKey,
            server_id: server_id.into(),
            conn_id,
            key: key.into(),
            cmd: Vec::new(),
        }
    }
}

/// Result of applying one request: the handler's RESP bytes, or an
/// error message destined for a `-...` reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResponse {
    pub response: Option<Vec<u8>>,
    pub error: Option<String>,
}

impl ApplyResponse {
    pub fn ok(bytes: Vec<u8>) -> Self {
        Self {
            response: Some(bytes),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            response: None,
            error: Some(message.into()),
        }
    }
}

/// The state machine's window into the server: apply a committed
/// request, and export/import full keyspace state for snapshots.
pub trait CommandExecutor: Send + Sync + 'static {
    /// Applies one committed request through the shared handler path.
    fn apply<'a>(&'a self, request: &'a ApplyRequest) -> BoxFuture<'a, ApplyResponse>;

    /// Captures the full keyspace under the state-copy guard.
    fn export_state(&self) -> BoxFuture<'_, KeyspaceSnapshot>;

    /// Clears the keyspace and re-inserts every non-expired entry.
    fn import_state(&self, snapshot: KeyspaceSnapshot) -> BoxFuture<'_, ()>;
}

/// JSON-serializable image of the keyspace carried in Raft snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyspaceSnapshot {
    pub state: Vec<KeyState>,
    pub latest_snapshot_ms: i64,
}

/// One keyspace entry in serializable form. `remaining_ttl_ms` is -1
/// for entries with no expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyState {
    pub key: String,
    pub value: SnapshotValue,
    pub remaining_ttl_ms: i64,
}

/// Serde-friendly mirror of [`vesper_core::Value`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SnapshotValue {
    Str(Vec<u8>),
    Int(i64),
    Float(f64),
    List(Vec<Vec<u8>>),
    Set(Vec<String>),
    Hash(Vec<(String, Vec<u8>)>),
    SortedSet(Vec<(f64, String)>),
}

impl From<&Value> for SnapshotValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::Str(b) => SnapshotValue::Str(b.to_vec()),
            Value::Int(n) => SnapshotValue::Int(*n),
            Value::Float(f) => SnapshotValue::Float(*f),
            Value::List(items) => SnapshotValue::List(items.iter().map(|b| b.to_vec()).collect()),
            Value::Set(members) => {
                let mut members: Vec<String> = members.iter().cloned().collect();
                members.sort();
                SnapshotValue::Set(members)
            }
            Value::Hash(fields) => {
                let mut fields: Vec<(String, Vec<u8>)> = fields
                    .iter()
                    .map(|(f, v)| (f.clone(), v.to_vec()))
                    .collect();
                fields.sort();
                SnapshotValue::Hash(fields)
            }
            Value::SortedSet(ss) => SnapshotValue::SortedSet(ss.to_pairs()),
        }
    }
}

impl From<SnapshotValue> for Value {
    fn from(value: SnapshotValue) -> Self {
        match value {
            SnapshotValue::Str(b) => Value::Str(b.into()),
            SnapshotValue::Int(n) => Value::Int(n),
            SnapshotValue::Float(f) => Value::Float(f),
            SnapshotValue::List(items) => {
                Value::List(items.into_iter().map(Into::into).collect())
            }
            SnapshotValue::Set(members) => Value::Set(members.into_iter().collect()),
            SnapshotValue::Hash(fields) => Value::Hash(
                fields
                    .into_iter()
                    .map(|(f, v)| (f, v.into()))
                    .collect(),
            ),
            SnapshotValue::SortedSet(pairs) => {
                Value::SortedSet(Box::new(SortedSet::from_members(pairs)))
            }
        }
    }
}

impl KeyState {
    pub fn from_entry(entry: &StateEntry) -> Self {
        Self {
            key: entry.key.clone(),
            value: SnapshotValue::from(&entry.value),
            remaining_ttl_ms: entry.remaining_ttl_ms,
        }
    }

    pub fn into_entry(self) -> StateEntry {
        StateEntry {
            key: self.key,
            value: self.value.into(),
            remaining_ttl_ms: self.remaining_ttl_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn request_kind_wire_names() {
        let cmd = ApplyRequest::command("node-1", 7, vec!["SET".into(), "k".into(), "v".into()]);
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("\"command\""));

        let del = ApplyRequest::delete_key("node-1", 7, "k");
        let json = serde_json::to_string(&del).unwrap();
        assert!(json.contains("\"delete-key\""));
    }

    #[test]
    fn apply_request_round_trip() {
        let req = ApplyRequest::command("srv", 42, vec!["ZADD".into(), "z".into()]);
        let json = serde_json::to_vec(&req).unwrap();
        let decoded: ApplyRequest = serde_json::from_slice(&json).unwrap();
        assert_eq!(req, decoded);
    }

    #[test]
    fn snapshot_value_round_trip() {
        let original = Value::SortedSet(Box::new(SortedSet::from_members([
            (1.5, "a".to_owned()),
            (2.5, "b".to_owned()),
        ])));
        let snap = SnapshotValue::from(&original);
        let back: Value = snap.into();
        assert_eq!(original, back);
    }

    #[test]
    fn key_state_round_trip_through_json() {
        let entry = StateEntry {
            key: "k".into(),
            value: Value::Str(Bytes::from("hello")),
            remaining_ttl_ms: 9000,
        };
        let state = KeyState::from_entry(&entry);
        let json = serde_json::to_vec(&state).unwrap();
        let decoded: KeyState = serde_json::from_slice(&json).unwrap();
        assert_eq!(decoded.into_entry(), entry);
    }

    #[test]
    fn apply_response_constructors() {
        assert_eq!(
            ApplyResponse::ok(b"+OK\r\n".to_vec()).response,
            Some(b"+OK\r\n".to_vec())
        );
        assert_eq!(
            ApplyResponse::err("boom").error.as_deref(),
            Some("boom")
        );
    }
}
