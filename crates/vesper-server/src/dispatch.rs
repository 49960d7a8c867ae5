//! Command dispatch: registry lookup, ACL authorization, and routing
//! of synchronized writes through Raft (cluster) or the AOF queue
//! (standalone).
//!
//! A [`CommandSpec`] carries everything the dispatcher needs: the name,
//! ACL category set, a description, whether successful execution must
//! be replicated or logged, a key-extraction function, the handler, and
//! any subcommands nesting the same shape.

use std::future::Future;
use std::pin::Pin;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tracing::error;
use vesper_cluster::ApplyRequest;
use vesper_core::{KeyspaceError, ScoreError};
use vesper_protocol::Frame;

use crate::commands;
use crate::state::ExecContext;

/// ACL category tags attached to each command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Read,
    Write,
    Fast,
    Slow,
    Generic,
    SortedSet,
    Connection,
    Admin,
    PubSub,
    Dangerous,
}

/// Errors surfaced to clients, each serialized as a single-line RESP
/// error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Shape or arity of the command is wrong.
    #[error("ERR wrong number of arguments")]
    WrongArgs,

    /// Value at the key is not the type the command expects.
    #[error("ERR value is of the wrong type")]
    WrongType,

    /// Key absent where the command required presence.
    #[error("ERR no such key")]
    NotFound,

    /// A score, integer, or range endpoint failed to parse.
    #[error("ERR {0}")]
    Parse(String),

    /// Mutually exclusive flags.
    #[error("ERR {0}")]
    Conflict(String),

    /// Rank indices outside the sorted set.
    #[error("ERR indices out of bounds")]
    OutOfRange,

    /// ACL refusal.
    #[error("NOPERM {0}")]
    PolicyDenied(String),

    /// Snapshot or rewrite already in progress.
    #[error("ERR {0}")]
    Transient(String),

    /// IO or replication failure.
    #[error("ERR {0}")]
    Fatal(String),

    /// Memory limit reached under `noeviction`.
    #[error("OOM command not allowed when used memory > 'maxmemory'")]
    OutOfMemory,

    #[error("ERR unknown command '{0}'")]
    UnknownCommand(String),

    #[error("ERR unknown subcommand '{1}' for '{0}'")]
    UnknownSubcommand(String, String),
}

impl From<KeyspaceError> for CommandError {
    fn from(e: KeyspaceError) -> Self {
        match e {
            KeyspaceError::NotFound => CommandError::NotFound,
            KeyspaceError::WrongType => CommandError::WrongType,
            KeyspaceError::OutOfMemory => CommandError::OutOfMemory,
        }
    }
}

impl From<ScoreError> for CommandError {
    fn from(e: ScoreError) -> Self {
        match e {
            ScoreError::NotAFloat => CommandError::Parse("value is not a valid float".into()),
            ScoreError::NotANumber => {
                CommandError::Parse("resulting score is not a number (NaN)".into())
            }
        }
    }
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Frame, CommandError>> + Send>>;

/// A command handler. Receives the execution context and the raw
/// command tokens (name included).
pub type Handler = fn(ExecContext, Vec<String>) -> HandlerFuture;

/// Produces the set of keys a command touches, for ACL checks.
pub type KeyExtractor = fn(&[String]) -> Result<Vec<String>, CommandError>;

/// One dispatchable command (or subcommand).
#[derive(Debug)]
pub struct CommandSpec {
    pub name: &'static str,
    pub categories: &'static [Category],
    pub description: &'static str,
    /// Whether successful execution must be replicated (cluster) or
    /// logged (standalone) before acknowledgment.
    pub synchronized: bool,
    pub extract_keys: KeyExtractor,
    pub handler: Handler,
    pub subcommands: Vec<CommandSpec>,
}

/// Resolves a token list to its command spec, selecting a subcommand
/// by the second token when the parent defines any.
pub fn resolve(tokens: &[String]) -> Result<&'static CommandSpec, CommandError> {
    let name = tokens.first().ok_or(CommandError::WrongArgs)?;
    let spec = commands::registry()
        .iter()
        .find(|c| c.name.eq_ignore_ascii_case(name))
        .ok_or_else(|| CommandError::UnknownCommand(name.clone()))?;

    if spec.subcommands.is_empty() {
        return Ok(spec);
    }
    let sub_name = tokens
        .get(1)
        .ok_or_else(|| CommandError::UnknownSubcommand(spec.name.into(), String::new()))?;
    spec.subcommands
        .iter()
        .find(|s| s.name.eq_ignore_ascii_case(sub_name))
        .ok_or_else(|| CommandError::UnknownSubcommand(spec.name.into(), sub_name.clone()))
}

/// Resolves and runs the handler for `tokens`, without ACL or
/// durability routing. Shared by the dispatcher, the Raft apply path,
/// and AOF replay.
pub async fn execute_handler(
    ctx: &ExecContext,
    tokens: Vec<String>,
) -> Result<Frame, CommandError> {
    let spec = resolve(&tokens)?;
    (spec.handler)(ctx.clone(), tokens).await
}

/// Full dispatch for one client command: resolve, extract keys,
/// authorize, execute (routing synchronized writes through Raft or the
/// AOF queue), and serialize the reply.
pub async fn dispatch(ctx: &ExecContext, tokens: Vec<String>) -> Vec<u8> {
    match dispatch_inner(ctx, tokens).await {
        Ok(bytes) => bytes,
        Err(e) => Frame::Error(e.to_string()).to_bytes(),
    }
}

async fn dispatch_inner(
    ctx: &ExecContext,
    tokens: Vec<String>,
) -> Result<Vec<u8>, CommandError> {
    let spec = resolve(&tokens)?;

    let keys = (spec.extract_keys)(&tokens)?;
    ctx.state
        .acl
        .authorize(&ctx.conn_info(), spec.name, spec.categories, &keys)
        .map_err(|denied| CommandError::PolicyDenied(denied.reason))?;

    // cluster mode: a synchronized write is committed through the Raft
    // log and answered with the state machine's response
    if spec.synchronized && !ctx.suppress_log {
        if let Some(cluster) = ctx.state.cluster.get() {
            let request = ApplyRequest::command(
                ctx.state.config.server_id.clone(),
                ctx.conn_info().id,
                tokens,
            );
            let response = cluster
                .client_write(request)
                .await
                .map_err(|e| CommandError::Fatal(format!("replication failed: {e}")))?;
            if let Some(message) = response.error {
                return Ok(Frame::Error(message).to_bytes());
            }
            return Ok(response.response.unwrap_or_default());
        }
    }

    let frame = (spec.handler)(ctx.clone(), tokens.clone()).await?;

    // standalone: log the successful synchronized command for replay
    if spec.synchronized && !ctx.suppress_log {
        if let Some(aof) = &ctx.state.aof {
            aof.queue_command(encode_command(&tokens)).await;
        }
    }

    Ok(frame.to_bytes())
}

/// Encodes command tokens as a RESP multi-bulk array — the raw wire
/// form stored in the append log and replayed through the dispatcher.
pub fn encode_command(tokens: &[String]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'*');
    buf.put_slice(tokens.len().to_string().as_bytes());
    buf.put_slice(b"\r\n");
    for token in tokens {
        buf.put_u8(b'$');
        buf.put_slice(token.len().to_string().as_bytes());
        buf.put_slice(b"\r\n");
        buf.put_slice(token.as_bytes());
        buf.put_slice(b"\r\n");
    }
    buf.freeze()
}

/// Decodes a logged command back into tokens. Used by AOF replay.
pub fn decode_command(payload: &[u8]) -> Option<Vec<String>> {
    let (frame, _) = vesper_protocol::parse_frame(payload).ok().flatten()?;
    frame_to_tokens(frame)
}

/// Converts a request frame (array of bulk/simple strings) to tokens.
pub fn frame_to_tokens(frame: Frame) -> Option<Vec<String>> {
    let Frame::Array(items) = frame else {
        return None;
    };
    let mut tokens = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Frame::Bulk(b) => tokens.push(String::from_utf8(b.to_vec()).ok()?),
            Frame::Simple(s) => tokens.push(s),
            _ => return None,
        }
    }
    Some(tokens)
}

/// Replays every logged command through the standard execution path
/// with durability side-effects disabled.
pub async fn replay_command(ctx: &ExecContext, payload: &[u8]) {
    let Some(tokens) = decode_command(payload) else {
        error!("skipping undecodable aof record");
        return;
    };
    if let Err(e) = execute_handler(ctx, tokens).await {
        error!("aof replay command failed: {e}");
    }
}
