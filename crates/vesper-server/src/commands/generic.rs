//! Generic key and string commands: SET/GET, deletion, existence,
//! expiry management, TYPE, and the integer counters.

use std::time::Duration;

use bytes::Bytes;
use vesper_core::{KeyspaceError, Keyspace, KeyWriteGuard, Value};
use vesper_protocol::Frame;

use crate::dispatch::{Category, CommandError, CommandSpec, HandlerFuture};
use crate::state::ExecContext;

use super::{first_key, trailing_keys};

/// Write-locks an existing key or creates it under the creation lock.
/// The `existed` flag tells the caller whether the value is fresh.
pub(crate) async fn lock_or_create(
    keyspace: &Keyspace,
    key: &str,
) -> Result<(KeyWriteGuard, bool), CommandError> {
    if keyspace.key_exists(key).await {
        match keyspace.key_lock(key).await {
            Ok(guard) => return Ok((guard, true)),
            Err(KeyspaceError::NotFound) => {} // expired between exists and lock
            Err(e) => return Err(e.into()),
        }
    }
    let guard = keyspace.create_key_and_lock(key).await?;
    Ok((guard, false))
}

fn set(ctx: ExecContext, args: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        if args.len() != 3 && args.len() != 5 {
            return Err(CommandError::WrongArgs);
        }
        let key = &args[1];
        let value = Value::adapt(Bytes::from(args[2].clone().into_bytes()));

        let ttl = if args.len() == 5 {
            let amount: u64 = args[4]
                .parse()
                .map_err(|_| CommandError::Parse("value is not an integer or out of range".into()))?;
            match args[3].to_ascii_uppercase().as_str() {
                "EX" => Some(Duration::from_secs(amount)),
                "PX" => Some(Duration::from_millis(amount)),
                other => {
                    return Err(CommandError::Parse(format!("unknown SET option '{other}'")));
                }
            }
        } else {
            None
        };

        let keyspace = &ctx.state.keyspace;
        let mut guard = keyspace.create_key_and_lock(key).await?;
        keyspace.set_value(&mut guard, value)?;
        keyspace.set_ttl(&mut guard, ttl);
        Ok(Frame::ok())
    })
}

fn get(ctx: ExecContext, args: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        if args.len() != 2 {
            return Err(CommandError::WrongArgs);
        }
        let guard = match ctx.state.keyspace.key_rlock(&args[1]).await {
            Ok(guard) => guard,
            Err(KeyspaceError::NotFound) => return Ok(Frame::Null),
            Err(e) => return Err(e.into()),
        };
        match guard.value() {
            Value::Str(b) => Ok(Frame::Bulk(b.clone())),
            Value::Int(n) => Ok(Frame::bulk(n.to_string())),
            Value::Float(f) => Ok(Frame::bulk(vesper_core::format_score(*f))),
            _ => Err(CommandError::WrongType),
        }
    })
}

fn del(ctx: ExecContext, args: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        if args.len() < 2 {
            return Err(CommandError::WrongArgs);
        }
        let mut removed = 0;
        for key in &args[1..] {
            if ctx.state.keyspace.delete_key(key).await {
                removed += 1;
            }
        }
        Ok(Frame::Integer(removed))
    })
}

fn exists(ctx: ExecContext, args: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        if args.len() < 2 {
            return Err(CommandError::WrongArgs);
        }
        let mut present = 0;
        for key in &args[1..] {
            if ctx.state.keyspace.key_exists(key).await {
                present += 1;
            }
        }
        Ok(Frame::Integer(present))
    })
}

/// EXPIRE and PEXPIRE share everything but the time unit.
fn apply_expiry(ctx: ExecContext, args: Vec<String>, unit_ms: u64) -> HandlerFuture {
    Box::pin(async move {
        if args.len() != 3 {
            return Err(CommandError::WrongArgs);
        }
        let amount: u64 = args[2]
            .parse()
            .map_err(|_| CommandError::Parse("value is not an integer or out of range".into()))?;

        let mut guard = match ctx.state.keyspace.key_lock(&args[1]).await {
            Ok(guard) => guard,
            Err(KeyspaceError::NotFound) => return Ok(Frame::Integer(0)),
            Err(e) => return Err(e.into()),
        };
        let deadline = vesper_core::time::now_ms().saturating_add(amount.saturating_mul(unit_ms));
        ctx.state.keyspace.set_expiry(&mut guard, deadline, false);
        Ok(Frame::Integer(1))
    })
}

fn expire(ctx: ExecContext, args: Vec<String>) -> HandlerFuture {
    apply_expiry(ctx, args, 1000)
}

fn pexpire(ctx: ExecContext, args: Vec<String>) -> HandlerFuture {
    apply_expiry(ctx, args, 1)
}

fn persist(ctx: ExecContext, args: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        if args.len() != 2 {
            return Err(CommandError::WrongArgs);
        }
        let mut guard = match ctx.state.keyspace.key_lock(&args[1]).await {
            Ok(guard) => guard,
            Err(KeyspaceError::NotFound) => return Ok(Frame::Integer(0)),
            Err(e) => return Err(e.into()),
        };
        if guard.remaining_ttl_ms().is_none() {
            return Ok(Frame::Integer(0));
        }
        ctx.state.keyspace.set_expiry(&mut guard, 0, false);
        Ok(Frame::Integer(1))
    })
}

/// TTL and PTTL share everything but the reported unit.
fn report_ttl(ctx: ExecContext, args: Vec<String>, in_seconds: bool) -> HandlerFuture {
    Box::pin(async move {
        if args.len() != 2 {
            return Err(CommandError::WrongArgs);
        }
        let guard = match ctx.state.keyspace.key_rlock(&args[1]).await {
            Ok(guard) => guard,
            Err(KeyspaceError::NotFound) => return Ok(Frame::Integer(-2)),
            Err(e) => return Err(e.into()),
        };
        match guard.remaining_ttl_ms() {
            None => Ok(Frame::Integer(-1)),
            Some(ms) if in_seconds => Ok(Frame::Integer((ms / 1000) as i64)),
            Some(ms) => Ok(Frame::Integer(ms as i64)),
        }
    })
}

fn ttl(ctx: ExecContext, args: Vec<String>) -> HandlerFuture {
    report_ttl(ctx, args, true)
}

fn pttl(ctx: ExecContext, args: Vec<String>) -> HandlerFuture {
    report_ttl(ctx, args, false)
}

fn type_of(ctx: ExecContext, args: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        if args.len() != 2 {
            return Err(CommandError::WrongArgs);
        }
        match ctx.state.keyspace.key_rlock(&args[1]).await {
            Ok(guard) => Ok(Frame::Simple(guard.value().type_name().into())),
            Err(KeyspaceError::NotFound) => Ok(Frame::Simple("none".into())),
            Err(e) => Err(e.into()),
        }
    })
}

/// INCR and DECR share the counter path.
fn add_to_counter(ctx: ExecContext, args: Vec<String>, delta: i64) -> HandlerFuture {
    Box::pin(async move {
        if args.len() != 2 {
            return Err(CommandError::WrongArgs);
        }
        let keyspace = &ctx.state.keyspace;
        let (mut guard, existed) = lock_or_create(keyspace, &args[1]).await?;

        if !existed {
            keyspace.set_value(&mut guard, Value::Int(delta))?;
            return Ok(Frame::Integer(delta));
        }
        let current = match guard.value() {
            Value::Int(n) => *n,
            _ => return Err(CommandError::WrongType),
        };
        let next = current
            .checked_add(delta)
            .ok_or_else(|| CommandError::Parse("increment or decrement would overflow".into()))?;
        keyspace.set_value(&mut guard, Value::Int(next))?;
        Ok(Frame::Integer(next))
    })
}

fn incr(ctx: ExecContext, args: Vec<String>) -> HandlerFuture {
    add_to_counter(ctx, args, 1)
}

fn decr(ctx: ExecContext, args: Vec<String>) -> HandlerFuture {
    add_to_counter(ctx, args, -1)
}

pub fn commands() -> Vec<CommandSpec> {
    vec![
        CommandSpec {
            name: "set",
            categories: &[Category::Generic, Category::Write, Category::Fast],
            description: "(SET key value [EX seconds | PX milliseconds]) Store a value at key, \
                          adapting numeric payloads to integer or float types.",
            synchronized: true,
            extract_keys: first_key,
            handler: set,
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "get",
            categories: &[Category::Generic, Category::Read, Category::Fast],
            description: "(GET key) Fetch the scalar value at key, or nil.",
            synchronized: false,
            extract_keys: first_key,
            handler: get,
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "del",
            categories: &[Category::Generic, Category::Write, Category::Fast],
            description: "(DEL key [key ...]) Remove keys; returns how many existed.",
            synchronized: true,
            extract_keys: trailing_keys,
            handler: del,
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "exists",
            categories: &[Category::Generic, Category::Read, Category::Fast],
            description: "(EXISTS key [key ...]) Count how many of the keys are present.",
            synchronized: false,
            extract_keys: trailing_keys,
            handler: exists,
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "expire",
            categories: &[Category::Generic, Category::Write, Category::Fast],
            description: "(EXPIRE key seconds) Set a key's TTL in seconds.",
            synchronized: true,
            extract_keys: first_key,
            handler: expire,
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "pexpire",
            categories: &[Category::Generic, Category::Write, Category::Fast],
            description: "(PEXPIRE key milliseconds) Set a key's TTL in milliseconds.",
            synchronized: true,
            extract_keys: first_key,
            handler: pexpire,
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "persist",
            categories: &[Category::Generic, Category::Write, Category::Fast],
            description: "(PERSIST key) Remove a key's TTL.",
            synchronized: true,
            extract_keys: first_key,
            handler: persist,
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "ttl",
            categories: &[Category::Generic, Category::Read, Category::Fast],
            description: "(TTL key) Remaining TTL in seconds; -1 without expiry, -2 if absent.",
            synchronized: false,
            extract_keys: first_key,
            handler: ttl,
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "pttl",
            categories: &[Category::Generic, Category::Read, Category::Fast],
            description: "(PTTL key) Remaining TTL in milliseconds; -1 without expiry, -2 if absent.",
            synchronized: false,
            extract_keys: first_key,
            handler: pttl,
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "type",
            categories: &[Category::Generic, Category::Read, Category::Fast],
            description: "(TYPE key) Type name of the value at key, or none.",
            synchronized: false,
            extract_keys: first_key,
            handler: type_of,
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "incr",
            categories: &[Category::Generic, Category::Write, Category::Fast],
            description: "(INCR key) Increment the integer at key by one, creating it at 1.",
            synchronized: true,
            extract_keys: first_key,
            handler: incr,
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "decr",
            categories: &[Category::Generic, Category::Write, Category::Fast],
            description: "(DECR key) Decrement the integer at key by one, creating it at -1.",
            synchronized: true,
            extract_keys: first_key,
            handler: decr,
            subcommands: Vec::new(),
        },
    ]
}
