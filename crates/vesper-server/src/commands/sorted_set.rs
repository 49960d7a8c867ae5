//! Sorted-set commands: add/update with policy flags, score/lex/rank
//! range queries, set algebra with weights and aggregation, bounded
//! pops, and range removals.

use vesper_core::{
    difference, format_score, intersect, parse_score, union, Aggregate, KeyWriteGuard,
    Keyspace, KeyspaceError, SortedSet, Value, WeightedSet, ZAddFlags,
};
use vesper_protocol::Frame;

use crate::dispatch::{Category, CommandError, CommandSpec, HandlerFuture};
use crate::state::ExecContext;

use super::generic::lock_or_create;
use super::{first_key, member_array, parse_int};

/// Runs `f` against the sorted set at `key` under a read lock.
/// `Ok(None)` when the key is absent; `WrongType` when it holds
/// something else.
async fn read_set<T>(
    keyspace: &Keyspace,
    key: &str,
    f: impl FnOnce(&SortedSet) -> T,
) -> Result<Option<T>, CommandError> {
    let guard = match keyspace.key_rlock(key).await {
        Ok(guard) => guard,
        Err(KeyspaceError::NotFound) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match guard.value() {
        Value::SortedSet(ss) => Ok(Some(f(ss))),
        _ => Err(CommandError::WrongType),
    }
}

/// Runs `f` against the sorted set at `key` under its write lock.
async fn write_set<T>(
    keyspace: &Keyspace,
    key: &str,
    f: impl FnOnce(&mut SortedSet) -> T,
) -> Result<Option<T>, CommandError> {
    let mut guard = match keyspace.key_lock(key).await {
        Ok(guard) => guard,
        Err(KeyspaceError::NotFound) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if !matches!(guard.value(), Value::SortedSet(_)) {
        return Err(CommandError::WrongType);
    }
    let out = mutate_set(keyspace, &mut guard, f);
    Ok(Some(out))
}

/// In-place mutation through the keyspace so memory accounting and
/// eviction bookkeeping stay correct.
fn mutate_set<T>(
    keyspace: &Keyspace,
    guard: &mut KeyWriteGuard,
    f: impl FnOnce(&mut SortedSet) -> T,
) -> T {
    keyspace.update_value(guard, |value| {
        let Value::SortedSet(ss) = value else {
            unreachable!("type verified before mutation");
        };
        f(ss)
    })
}

/// Write-locks `key` as a sorted set, creating an empty one when the
/// key is absent. `WrongType` when an existing value is not a zset.
async fn lock_set_or_create(
    keyspace: &Keyspace,
    key: &str,
) -> Result<(KeyWriteGuard, bool), CommandError> {
    let (mut guard, existed) = lock_or_create(keyspace, key).await?;
    if existed {
        if !matches!(guard.value(), Value::SortedSet(_)) {
            return Err(CommandError::WrongType);
        }
    } else {
        keyspace.set_value(&mut guard, Value::SortedSet(Box::default()))?;
    }
    Ok((guard, existed))
}

/// Replaces whatever lives at `dest` with `result`, returning its
/// cardinality.
async fn store_result(
    keyspace: &Keyspace,
    dest: &str,
    result: SortedSet,
) -> Result<i64, CommandError> {
    let cardinality = result.len() as i64;
    let mut guard = keyspace.create_key_and_lock(dest).await?;
    keyspace.set_value(&mut guard, Value::SortedSet(Box::new(result)))?;
    Ok(cardinality)
}

/// Deletes `key` when the (possibly just-emptied) sorted set under
/// `guard` has no members left.
async fn drop_if_empty(keyspace: &Keyspace, guard: KeyWriteGuard, key: &str) {
    let empty = matches!(guard.value(), Value::SortedSet(ss) if ss.is_empty());
    drop(guard);
    if empty {
        keyspace.delete_key(key).await;
    }
}

// ---------------------------------------------------------------------------
// ZADD / ZINCRBY
// ---------------------------------------------------------------------------

struct ZAddArgs {
    key: String,
    flags: ZAddFlags,
    incr: bool,
    members: Vec<(f64, String)>,
}

fn parse_zadd(args: &[String]) -> Result<ZAddArgs, CommandError> {
    if args.len() < 4 {
        return Err(CommandError::WrongArgs);
    }
    let key = args[1].clone();
    let mut flags = ZAddFlags::default();
    let mut incr = false;

    let mut idx = 2;
    while let Some(token) = args.get(idx) {
        match token.to_ascii_lowercase().as_str() {
            "nx" => flags.nx = true,
            "xx" => flags.xx = true,
            "gt" => flags.gt = true,
            "lt" => flags.lt = true,
            "ch" => flags.ch = true,
            "incr" => incr = true,
            _ => break,
        }
        idx += 1;
    }
    flags
        .validate()
        .map_err(|msg| CommandError::Conflict(msg.into()))?;

    let rest = &args[idx..];
    if rest.is_empty() || rest.len() % 2 != 0 {
        return Err(CommandError::Parse(
            "score/member pairs must be float/string".into(),
        ));
    }
    let mut members = Vec::with_capacity(rest.len() / 2);
    for pair in rest.chunks(2) {
        members.push((parse_score(&pair[0])?, pair[1].clone()));
    }
    if incr && members.len() > 1 {
        return Err(CommandError::Conflict(
            "cannot pass more than one score/member pair when INCR flag is provided".into(),
        ));
    }
    Ok(ZAddArgs {
        key,
        flags,
        incr,
        members,
    })
}

fn zadd(ctx: ExecContext, args: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        let parsed = parse_zadd(&args)?;
        let keyspace = &ctx.state.keyspace;
        let (mut guard, _) = lock_set_or_create(keyspace, &parsed.key).await?;

        if parsed.incr {
            let (delta, member) = &parsed.members[0];
            let result = mutate_set(keyspace, &mut guard, |ss| {
                ss.incr_by(member, *delta, &parsed.flags)
            });
            let result = match result {
                Ok(score) => score,
                Err(e) => {
                    drop_if_empty(keyspace, guard, &parsed.key).await;
                    return Err(e.into());
                }
            };
            drop_if_empty(keyspace, guard, &parsed.key).await;
            return Ok(match result {
                Some(score) => Frame::Simple(format_score(score)),
                None => Frame::Null,
            });
        }

        let (added, updated) = mutate_set(keyspace, &mut guard, |ss| {
            ss.add_or_update(&parsed.members, &parsed.flags)
        });
        drop_if_empty(keyspace, guard, &parsed.key).await;

        let count = if parsed.flags.ch {
            added + updated
        } else {
            added
        };
        Ok(Frame::Integer(count as i64))
    })
}

fn zincrby(ctx: ExecContext, args: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        if args.len() != 4 {
            return Err(CommandError::WrongArgs);
        }
        let delta = parse_score(&args[2])?;
        let member = args[3].clone();

        let keyspace = &ctx.state.keyspace;
        let (mut guard, _) = lock_set_or_create(keyspace, &args[1]).await?;
        let result = mutate_set(keyspace, &mut guard, |ss| {
            ss.incr_by(&member, delta, &ZAddFlags::default())
        })?;
        // no policy flags, so the increment always applies
        Ok(result
            .map(|score| Frame::Simple(format_score(score)))
            .unwrap_or(Frame::Null))
    })
}

// ---------------------------------------------------------------------------
// reads: ZCARD / ZCOUNT / ZSCORE / ZMSCORE / ZLEXCOUNT / ZRANDMEMBER
// ---------------------------------------------------------------------------

fn zcard(ctx: ExecContext, args: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        if args.len() != 2 {
            return Err(CommandError::WrongArgs);
        }
        let len = read_set(&ctx.state.keyspace, &args[1], |ss| ss.len()).await?;
        Ok(Frame::Integer(len.unwrap_or(0) as i64))
    })
}

fn zcount(ctx: ExecContext, args: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        if args.len() != 4 {
            return Err(CommandError::WrongArgs);
        }
        let min = parse_score(&args[2])?;
        let max = parse_score(&args[3])?;
        let count =
            read_set(&ctx.state.keyspace, &args[1], |ss| ss.count_in_score_range(min, max))
                .await?;
        Ok(Frame::Integer(count.unwrap_or(0) as i64))
    })
}

fn zscore(ctx: ExecContext, args: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        if args.len() != 3 {
            return Err(CommandError::WrongArgs);
        }
        let score = read_set(&ctx.state.keyspace, &args[1], |ss| ss.score(&args[2])).await?;
        Ok(match score.flatten() {
            Some(score) => Frame::bulk(format_score(score)),
            None => Frame::Null,
        })
    })
}

fn zmscore(ctx: ExecContext, args: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        if args.len() < 3 {
            return Err(CommandError::WrongArgs);
        }
        let members = args[2..].to_vec();
        let scores = read_set(&ctx.state.keyspace, &args[1], |ss| {
            members.iter().map(|m| ss.score(m)).collect::<Vec<_>>()
        })
        .await?
        .unwrap_or_else(|| vec![None; members.len()]);

        Ok(Frame::Array(
            scores
                .into_iter()
                .map(|s| match s {
                    Some(score) => Frame::bulk(format_score(score)),
                    None => Frame::Null,
                })
                .collect(),
        ))
    })
}

fn zlexcount(ctx: ExecContext, args: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        if args.len() != 4 {
            return Err(CommandError::WrongArgs);
        }
        let count = read_set(&ctx.state.keyspace, &args[1], |ss| {
            ss.lex_count(&args[2], &args[3])
        })
        .await?;
        Ok(Frame::Integer(count.unwrap_or(0) as i64))
    })
}

fn zrandmember(ctx: ExecContext, args: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        if args.len() > 4 {
            return Err(CommandError::WrongArgs);
        }
        let keyspace = &ctx.state.keyspace;
        match args.len() {
            2 => {
                let member =
                    read_set(keyspace, &args[1], |ss| ss.random_members(1)).await?;
                Ok(match member.and_then(|mut m| m.pop()) {
                    Some((member, _)) => Frame::bulk(member),
                    None => Frame::Null,
                })
            }
            _ => {
                let count = parse_int(&args[2])?;
                let withscores = match args.get(3) {
                    Some(opt) if opt.eq_ignore_ascii_case("withscores") => true,
                    Some(_) => {
                        return Err(CommandError::Parse("last option must be WITHSCORES".into()));
                    }
                    None => false,
                };
                let members = read_set(keyspace, &args[1], |ss| ss.random_members(count))
                    .await?
                    .unwrap_or_default();
                Ok(member_array(members, withscores))
            }
        }
    })
}

// ---------------------------------------------------------------------------
// ZRANK / ZREVRANK
// ---------------------------------------------------------------------------

fn rank_reply(ctx: ExecContext, args: Vec<String>, reversed: bool) -> HandlerFuture {
    Box::pin(async move {
        if args.len() < 3 || args.len() > 4 {
            return Err(CommandError::WrongArgs);
        }
        let withscore = match args.get(3) {
            Some(opt) if opt.eq_ignore_ascii_case("withscore") => true,
            Some(_) => return Err(CommandError::Parse("last option must be WITHSCORE".into())),
            None => false,
        };
        let member = args[2].clone();

        let found = read_set(&ctx.state.keyspace, &args[1], |ss| {
            let rank = if reversed {
                ss.rev_rank(&member)
            } else {
                ss.rank(&member)
            };
            rank.map(|r| (r, ss.score(&member).unwrap_or_default()))
        })
        .await?;

        Ok(match found.flatten() {
            Some((rank, score)) if withscore => Frame::Array(vec![
                Frame::Integer(rank as i64),
                Frame::bulk(format_score(score)),
            ]),
            Some((rank, _)) => Frame::Integer(rank as i64),
            None => Frame::Null,
        })
    })
}

fn zrank(ctx: ExecContext, args: Vec<String>) -> HandlerFuture {
    rank_reply(ctx, args, false)
}

fn zrevrank(ctx: ExecContext, args: Vec<String>) -> HandlerFuture {
    rank_reply(ctx, args, true)
}

// ---------------------------------------------------------------------------
// ZREM and range removals
// ---------------------------------------------------------------------------

fn zrem(ctx: ExecContext, args: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        if args.len() < 3 {
            return Err(CommandError::WrongArgs);
        }
        let members = args[2..].to_vec();
        let removed = write_set(&ctx.state.keyspace, &args[1], |ss| {
            members.iter().filter(|m| ss.remove(m)).count()
        })
        .await?;
        Ok(Frame::Integer(removed.unwrap_or(0) as i64))
    })
}

fn zremrangebyscore(ctx: ExecContext, args: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        if args.len() != 4 {
            return Err(CommandError::WrongArgs);
        }
        let min = parse_score(&args[2])?;
        let max = parse_score(&args[3])?;
        let removed = write_set(&ctx.state.keyspace, &args[1], |ss| {
            ss.remove_range_by_score(min, max)
        })
        .await?;
        Ok(Frame::Integer(removed.unwrap_or(0) as i64))
    })
}

fn zremrangebyrank(ctx: ExecContext, args: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        if args.len() != 4 {
            return Err(CommandError::WrongArgs);
        }
        let start = parse_int(&args[2])?;
        let stop = parse_int(&args[3])?;
        let removed = write_set(&ctx.state.keyspace, &args[1], |ss| {
            ss.remove_range_by_rank(start, stop)
        })
        .await?;
        match removed {
            None => Ok(Frame::Integer(0)),
            Some(Some(count)) => Ok(Frame::Integer(count as i64)),
            Some(None) => Err(CommandError::OutOfRange),
        }
    })
}

fn zremrangebylex(ctx: ExecContext, args: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        if args.len() != 4 {
            return Err(CommandError::WrongArgs);
        }
        let removed = write_set(&ctx.state.keyspace, &args[1], |ss| {
            ss.remove_range_by_lex(&args[2], &args[3])
        })
        .await?;
        Ok(Frame::Integer(removed.unwrap_or(0) as i64))
    })
}

// ---------------------------------------------------------------------------
// pops
// ---------------------------------------------------------------------------

fn pop_reply(ctx: ExecContext, args: Vec<String>, max: bool) -> HandlerFuture {
    Box::pin(async move {
        if args.len() > 3 {
            return Err(CommandError::WrongArgs);
        }
        let count = match args.get(2) {
            Some(raw) => {
                let n = parse_int(raw)?;
                if n < 0 {
                    return Err(CommandError::Parse("count must be a positive integer".into()));
                }
                n as usize
            }
            None => 1,
        };
        let popped = write_set(&ctx.state.keyspace, &args[1], |ss| {
            if max {
                ss.pop_max(count)
            } else {
                ss.pop_min(count)
            }
        })
        .await?
        .unwrap_or_default();
        Ok(member_array(popped, true))
    })
}

fn zpopmin(ctx: ExecContext, args: Vec<String>) -> HandlerFuture {
    pop_reply(ctx, args, false)
}

fn zpopmax(ctx: ExecContext, args: Vec<String>) -> HandlerFuture {
    pop_reply(ctx, args, true)
}

fn zmpop(ctx: ExecContext, args: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        let (keys, max, count) = parse_zmpop(&args)?;
        for key in keys {
            let popped = write_set(&ctx.state.keyspace, &key, |ss| {
                if max {
                    ss.pop_max(count)
                } else {
                    ss.pop_min(count)
                }
            })
            .await?;
            if let Some(popped) = popped {
                if !popped.is_empty() {
                    return Ok(member_array(popped, true));
                }
            }
        }
        Ok(Frame::Array(Vec::new()))
    })
}

/// ZMPOP key [key ...] <MIN|MAX> [COUNT count] — keys run until the
/// policy token.
fn parse_zmpop(args: &[String]) -> Result<(Vec<String>, bool, usize), CommandError> {
    let mut keys = Vec::new();
    let mut idx = 1;
    let max = loop {
        let Some(token) = args.get(idx) else {
            return Err(CommandError::WrongArgs);
        };
        match token.to_ascii_lowercase().as_str() {
            "min" => break false,
            "max" => break true,
            _ => keys.push(token.clone()),
        }
        idx += 1;
    };
    if keys.is_empty() {
        return Err(CommandError::WrongArgs);
    }

    let mut count = 1usize;
    idx += 1;
    if let Some(token) = args.get(idx) {
        if !token.eq_ignore_ascii_case("count") {
            return Err(CommandError::Parse(format!("invalid option '{token}'")));
        }
        let raw = args.get(idx + 1).ok_or(CommandError::WrongArgs)?;
        let parsed = parse_int(raw)?;
        if parsed <= 0 {
            return Err(CommandError::Parse("count must be a positive integer".into()));
        }
        count = parsed as usize;
    }
    Ok((keys, max, count))
}

// ---------------------------------------------------------------------------
// range queries
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct RangeOptions {
    by_score: bool,
    by_lex: bool,
    rev: bool,
    limit: Option<(usize, i64)>,
    withscores: bool,
}

fn parse_range_options(rest: &[String]) -> Result<RangeOptions, CommandError> {
    let mut opts = RangeOptions::default();
    let mut idx = 0;
    while idx < rest.len() {
        match rest[idx].to_ascii_lowercase().as_str() {
            "byscore" => opts.by_score = true,
            "bylex" => opts.by_lex = true,
            "rev" => opts.rev = true,
            "withscores" => opts.withscores = true,
            "limit" => {
                let offset = rest
                    .get(idx + 1)
                    .ok_or_else(|| {
                        CommandError::Parse(
                            "limit should contain offset and count as integers".into(),
                        )
                    })
                    .and_then(|raw| parse_int(raw))?;
                if offset < 0 {
                    return Err(CommandError::Parse("limit offset must be >= 0".into()));
                }
                let count = rest
                    .get(idx + 2)
                    .ok_or_else(|| {
                        CommandError::Parse(
                            "limit should contain offset and count as integers".into(),
                        )
                    })
                    .and_then(|raw| parse_int(raw))?;
                opts.limit = Some((offset as usize, count));
                idx += 2;
            }
            other => return Err(CommandError::Parse(format!("invalid option '{other}'"))),
        }
        idx += 1;
    }
    if opts.by_score && opts.by_lex {
        return Err(CommandError::Conflict(
            "BYSCORE and BYLEX are mutually exclusive".into(),
        ));
    }
    Ok(opts)
}

/// Evaluates a range query: by rank (default), by score, or by lex,
/// then applies REV and LIMIT.
fn select_range(
    ss: &SortedSet,
    start: &str,
    stop: &str,
    opts: RangeOptions,
) -> Result<Vec<(String, f64)>, CommandError> {
    let mut members = if opts.by_score {
        ss.range_by_score(parse_score(start)?, parse_score(stop)?)
    } else if opts.by_lex {
        ss.range_by_lex(start, stop)
    } else {
        ss.range_by_rank(parse_int(start)?, parse_int(stop)?)
    };
    if opts.rev {
        members.reverse();
    }
    if let Some((offset, count)) = opts.limit {
        if offset > members.len() {
            return Ok(Vec::new());
        }
        let trimmed = members.into_iter().skip(offset);
        members = if count < 0 {
            trimmed.collect()
        } else {
            trimmed.take(count as usize).collect()
        };
    }
    Ok(members)
}

fn zrange(ctx: ExecContext, args: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        if args.len() < 4 {
            return Err(CommandError::WrongArgs);
        }
        let opts = parse_range_options(&args[4..])?;
        let members = read_set(&ctx.state.keyspace, &args[1], |ss| {
            select_range(ss, &args[2], &args[3], opts)
        })
        .await?
        .transpose()?
        .unwrap_or_default();
        Ok(member_array(members, opts.withscores))
    })
}

fn zrangestore(ctx: ExecContext, args: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        if args.len() < 5 {
            return Err(CommandError::WrongArgs);
        }
        let opts = parse_range_options(&args[5..])?;
        let keyspace = &ctx.state.keyspace;

        let Some(members) = read_set(keyspace, &args[2], |ss| {
            select_range(ss, &args[3], &args[4], opts)
        })
        .await?
        .transpose()?
        else {
            return Ok(Frame::Integer(0));
        };

        let result = SortedSet::from_members(members.into_iter().map(|(m, s)| (s, m)));
        let cardinality = store_result(keyspace, &args[1], result).await?;
        Ok(Frame::Integer(cardinality))
    })
}

// ---------------------------------------------------------------------------
// set algebra
// ---------------------------------------------------------------------------

struct AlgebraArgs {
    keys: Vec<String>,
    weights: Vec<f64>,
    aggregate: Aggregate,
    withscores: bool,
}

/// Parses `numkeys key [key ...] [WEIGHTS w ...] [AGGREGATE SUM|MIN|MAX]
/// [WITHSCORES]` starting at `numkeys_idx`.
fn parse_algebra(args: &[String], numkeys_idx: usize) -> Result<AlgebraArgs, CommandError> {
    let numkeys = parse_int(args.get(numkeys_idx).ok_or(CommandError::WrongArgs)?)?;
    if numkeys <= 0 {
        return Err(CommandError::Parse("at least 1 input key is needed".into()));
    }
    let numkeys = numkeys as usize;
    let first = numkeys_idx + 1;
    if args.len() < first + numkeys {
        return Err(CommandError::WrongArgs);
    }
    let keys = args[first..first + numkeys].to_vec();

    let mut weights = vec![1.0; numkeys];
    let mut aggregate = Aggregate::default();
    let mut withscores = false;
    let mut idx = first + numkeys;
    while idx < args.len() {
        match args[idx].to_ascii_lowercase().as_str() {
            "weights" => {
                if args.len() < idx + 1 + numkeys {
                    return Err(CommandError::WrongArgs);
                }
                for (slot, raw) in weights.iter_mut().zip(&args[idx + 1..idx + 1 + numkeys]) {
                    *slot = parse_score(raw)?;
                }
                idx += numkeys;
            }
            "aggregate" => {
                let raw = args.get(idx + 1).ok_or(CommandError::WrongArgs)?;
                aggregate = raw
                    .parse()
                    .map_err(|_| CommandError::Parse(format!("invalid aggregate '{raw}'")))?;
                idx += 1;
            }
            "withscores" => withscores = true,
            other => return Err(CommandError::Parse(format!("invalid option '{other}'"))),
        }
        idx += 1;
    }
    Ok(AlgebraArgs {
        keys,
        weights,
        aggregate,
        withscores,
    })
}

/// Read-locks every input set and computes the union. Missing keys are
/// skipped.
async fn gather_union(ctx: &ExecContext, parsed: &AlgebraArgs) -> Result<SortedSet, CommandError> {
    let keyspace = &ctx.state.keyspace;
    let mut guards = Vec::with_capacity(parsed.keys.len());
    for key in &parsed.keys {
        match keyspace.key_rlock(key).await {
            Ok(guard) => guards.push(Some(guard)),
            Err(KeyspaceError::NotFound) => guards.push(None),
            Err(e) => return Err(e.into()),
        }
    }

    let mut inputs = Vec::new();
    for (guard, weight) in guards.iter().zip(&parsed.weights) {
        if let Some(guard) = guard {
            match guard.value() {
                Value::SortedSet(ss) => inputs.push(WeightedSet {
                    set: ss,
                    weight: *weight,
                }),
                _ => return Err(CommandError::WrongType),
            }
        }
    }
    Ok(union(parsed.aggregate, &inputs))
}

/// Read-locks every input set and computes the intersection. A missing
/// key empties the result.
async fn gather_intersection(
    ctx: &ExecContext,
    parsed: &AlgebraArgs,
) -> Result<SortedSet, CommandError> {
    let keyspace = &ctx.state.keyspace;
    let mut guards = Vec::with_capacity(parsed.keys.len());
    for key in &parsed.keys {
        match keyspace.key_rlock(key).await {
            Ok(guard) => guards.push(guard),
            Err(KeyspaceError::NotFound) => return Ok(SortedSet::new()),
            Err(e) => return Err(e.into()),
        }
    }

    let mut inputs = Vec::new();
    for (guard, weight) in guards.iter().zip(&parsed.weights) {
        match guard.value() {
            Value::SortedSet(ss) => inputs.push(WeightedSet {
                set: ss,
                weight: *weight,
            }),
            _ => return Err(CommandError::WrongType),
        }
    }
    Ok(intersect(parsed.aggregate, &inputs))
}

fn zunion(ctx: ExecContext, args: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        let parsed = parse_algebra(&args, 1)?;
        let result = gather_union(&ctx, &parsed).await?;
        Ok(member_array(result.range_by_rank(0, -1), parsed.withscores))
    })
}

fn zunionstore(ctx: ExecContext, args: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        if args.len() < 4 {
            return Err(CommandError::WrongArgs);
        }
        let parsed = parse_algebra(&args, 2)?;
        let result = gather_union(&ctx, &parsed).await?;
        let cardinality = store_result(&ctx.state.keyspace, &args[1], result).await?;
        Ok(Frame::Integer(cardinality))
    })
}

fn zinter(ctx: ExecContext, args: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        let parsed = parse_algebra(&args, 1)?;
        let result = gather_intersection(&ctx, &parsed).await?;
        Ok(member_array(result.range_by_rank(0, -1), parsed.withscores))
    })
}

fn zinterstore(ctx: ExecContext, args: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        if args.len() < 4 {
            return Err(CommandError::WrongArgs);
        }
        let parsed = parse_algebra(&args, 2)?;
        let result = gather_intersection(&ctx, &parsed).await?;
        let cardinality = store_result(&ctx.state.keyspace, &args[1], result).await?;
        Ok(Frame::Integer(cardinality))
    })
}

/// Parses `numkeys key [key ...] [WITHSCORES]` for ZDIFF/ZDIFFSTORE.
fn parse_diff(args: &[String], numkeys_idx: usize) -> Result<(Vec<String>, bool), CommandError> {
    let numkeys = parse_int(args.get(numkeys_idx).ok_or(CommandError::WrongArgs)?)?;
    if numkeys <= 0 {
        return Err(CommandError::Parse("at least 1 input key is needed".into()));
    }
    let numkeys = numkeys as usize;
    let first = numkeys_idx + 1;
    if args.len() < first + numkeys {
        return Err(CommandError::WrongArgs);
    }
    let keys = args[first..first + numkeys].to_vec();

    let mut withscores = false;
    for token in &args[first + numkeys..] {
        if token.eq_ignore_ascii_case("withscores") {
            withscores = true;
        } else {
            return Err(CommandError::Parse(format!("invalid option '{token}'")));
        }
    }
    Ok((keys, withscores))
}

/// Read-locks the base and the subtracted sets and computes the
/// difference. `None` when the base set is absent.
async fn gather_difference(
    ctx: &ExecContext,
    keys: &[String],
) -> Result<Option<SortedSet>, CommandError> {
    let keyspace = &ctx.state.keyspace;
    let base_guard = match keyspace.key_rlock(&keys[0]).await {
        Ok(guard) => guard,
        Err(KeyspaceError::NotFound) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let Value::SortedSet(base) = base_guard.value() else {
        return Err(CommandError::WrongType);
    };

    let mut other_guards = Vec::new();
    for key in &keys[1..] {
        match keyspace.key_rlock(key).await {
            Ok(guard) => other_guards.push(guard),
            Err(KeyspaceError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }
    }
    let mut others = Vec::with_capacity(other_guards.len());
    for guard in &other_guards {
        match guard.value() {
            Value::SortedSet(ss) => others.push(&**ss),
            _ => return Err(CommandError::WrongType),
        }
    }
    Ok(Some(difference(base, &others)))
}

fn zdiff(ctx: ExecContext, args: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        let (keys, withscores) = parse_diff(&args, 1)?;
        let result = gather_difference(&ctx, &keys).await?.unwrap_or_default();
        Ok(member_array(result.range_by_rank(0, -1), withscores))
    })
}

fn zdiffstore(ctx: ExecContext, args: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        if args.len() < 4 {
            return Err(CommandError::WrongArgs);
        }
        let (keys, _) = parse_diff(&args, 2)?;
        let Some(result) = gather_difference(&ctx, &keys).await? else {
            return Ok(Frame::Integer(0));
        };
        let cardinality = store_result(&ctx.state.keyspace, &args[1], result).await?;
        Ok(Frame::Integer(cardinality))
    })
}

// ---------------------------------------------------------------------------
// key extractors
// ---------------------------------------------------------------------------

fn numkeys_keys_at(cmd: &[String], numkeys_idx: usize) -> Result<Vec<String>, CommandError> {
    let numkeys = parse_int(cmd.get(numkeys_idx).ok_or(CommandError::WrongArgs)?)?;
    if numkeys <= 0 {
        return Err(CommandError::Parse("at least 1 input key is needed".into()));
    }
    let first = numkeys_idx + 1;
    let end = first + numkeys as usize;
    if cmd.len() < end {
        return Err(CommandError::WrongArgs);
    }
    Ok(cmd[first..end].to_vec())
}

fn algebra_keys(cmd: &[String]) -> Result<Vec<String>, CommandError> {
    numkeys_keys_at(cmd, 1)
}

fn algebra_store_keys(cmd: &[String]) -> Result<Vec<String>, CommandError> {
    let mut keys = vec![cmd.get(1).ok_or(CommandError::WrongArgs)?.clone()];
    keys.extend(numkeys_keys_at(cmd, 2)?);
    Ok(keys)
}

fn zmpop_keys(cmd: &[String]) -> Result<Vec<String>, CommandError> {
    parse_zmpop(cmd).map(|(keys, _, _)| keys)
}

fn source_dest_keys(cmd: &[String]) -> Result<Vec<String>, CommandError> {
    if cmd.len() < 3 {
        return Err(CommandError::WrongArgs);
    }
    Ok(vec![cmd[1].clone(), cmd[2].clone()])
}

pub fn commands() -> Vec<CommandSpec> {
    vec![
        CommandSpec {
            name: "zadd",
            categories: &[Category::SortedSet, Category::Write, Category::Fast],
            description: "(ZADD key [NX | XX] [GT | LT] [CH] [INCR] score member [score member \
                          ...]) Add members with scores, honoring the update-policy flags. NX \
                          only adds new members; XX only updates existing ones; GT/LT replace \
                          only on strictly greater/less scores; CH counts updates as changes; \
                          INCR increments a single member and returns the resulting score.",
            synchronized: true,
            extract_keys: first_key,
            handler: zadd,
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "zcard",
            categories: &[Category::SortedSet, Category::Read, Category::Slow],
            description: "(ZCARD key) Cardinality of the sorted set; 0 when the key is absent.",
            synchronized: false,
            extract_keys: first_key,
            handler: zcard,
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "zcount",
            categories: &[Category::SortedSet, Category::Read, Category::Slow],
            description: "(ZCOUNT key min max) Number of members with min <= score <= max.",
            synchronized: false,
            extract_keys: first_key,
            handler: zcount,
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "zdiff",
            categories: &[Category::SortedSet, Category::Read, Category::Slow],
            description: "(ZDIFF numkeys key [key ...] [WITHSCORES]) Members of the first set \
                          absent from all the others, with the first set's scores.",
            synchronized: false,
            extract_keys: algebra_keys,
            handler: zdiff,
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "zdiffstore",
            categories: &[Category::SortedSet, Category::Write, Category::Slow],
            description: "(ZDIFFSTORE destination numkeys key [key ...]) Store the difference \
                          at destination and return its cardinality.",
            synchronized: true,
            extract_keys: algebra_store_keys,
            handler: zdiffstore,
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "zincrby",
            categories: &[Category::SortedSet, Category::Write, Category::Fast],
            description: "(ZINCRBY key increment member) Increment the member's score, \
                          creating the member (and key) as needed.",
            synchronized: true,
            extract_keys: first_key,
            handler: zincrby,
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "zinter",
            categories: &[Category::SortedSet, Category::Read, Category::Slow],
            description: "(ZINTER numkeys key [key ...] [WEIGHTS weight [weight ...]] \
                          [AGGREGATE SUM|MIN|MAX] [WITHSCORES]) Intersection of the input \
                          sets with weighted, aggregated scores.",
            synchronized: false,
            extract_keys: algebra_keys,
            handler: zinter,
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "zinterstore",
            categories: &[Category::SortedSet, Category::Write, Category::Slow],
            description: "(ZINTERSTORE destination numkeys key [key ...] [WEIGHTS ...] \
                          [AGGREGATE ...]) Store the intersection at destination and return \
                          its cardinality.",
            synchronized: true,
            extract_keys: algebra_store_keys,
            handler: zinterstore,
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "zlexcount",
            categories: &[Category::SortedSet, Category::Read, Category::Slow],
            description: "(ZLEXCOUNT key min max) Members in the lexicographic range; 0 \
                          unless every member shares one score.",
            synchronized: false,
            extract_keys: first_key,
            handler: zlexcount,
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "zmpop",
            categories: &[Category::SortedSet, Category::Write, Category::Slow],
            description: "(ZMPOP key [key ...] <MIN|MAX> [COUNT count]) Pop from the first \
                          non-empty sorted set among the keys, in key order.",
            synchronized: true,
            extract_keys: zmpop_keys,
            handler: zmpop,
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "zmscore",
            categories: &[Category::SortedSet, Category::Read, Category::Fast],
            description: "(ZMSCORE key member [member ...]) Scores of the members; nil for \
                          members not in the set.",
            synchronized: false,
            extract_keys: first_key,
            handler: zmscore,
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "zpopmax",
            categories: &[Category::SortedSet, Category::Write, Category::Slow],
            description: "(ZPOPMAX key [count]) Remove and return up to count highest-scored \
                          members.",
            synchronized: true,
            extract_keys: first_key,
            handler: zpopmax,
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "zpopmin",
            categories: &[Category::SortedSet, Category::Write, Category::Slow],
            description: "(ZPOPMIN key [count]) Remove and return up to count lowest-scored \
                          members.",
            synchronized: true,
            extract_keys: first_key,
            handler: zpopmin,
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "zrandmember",
            categories: &[Category::SortedSet, Category::Read, Category::Slow],
            description: "(ZRANDMEMBER key [count [WITHSCORES]]) Random members; negative \
                          count allows repeats.",
            synchronized: false,
            extract_keys: first_key,
            handler: zrandmember,
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "zrank",
            categories: &[Category::SortedSet, Category::Read, Category::Slow],
            description: "(ZRANK key member [WITHSCORE]) 0-based rank by ascending score.",
            synchronized: false,
            extract_keys: first_key,
            handler: zrank,
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "zrevrank",
            categories: &[Category::SortedSet, Category::Read, Category::Slow],
            description: "(ZREVRANK key member [WITHSCORE]) 0-based rank by descending score.",
            synchronized: false,
            extract_keys: first_key,
            handler: zrevrank,
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "zrem",
            categories: &[Category::SortedSet, Category::Write, Category::Fast],
            description: "(ZREM key member [member ...]) Remove members; returns how many \
                          were removed.",
            synchronized: true,
            extract_keys: first_key,
            handler: zrem,
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "zremrangebylex",
            categories: &[Category::SortedSet, Category::Write, Category::Slow],
            description: "(ZREMRANGEBYLEX key min max) Remove members in the lexicographic \
                          range; a no-op unless all scores are equal.",
            synchronized: true,
            extract_keys: first_key,
            handler: zremrangebylex,
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "zremrangebyrank",
            categories: &[Category::SortedSet, Category::Write, Category::Slow],
            description: "(ZREMRANGEBYRANK key start stop) Remove members by rank range; \
                          negative indices count from the tail.",
            synchronized: true,
            extract_keys: first_key,
            handler: zremrangebyrank,
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "zremrangebyscore",
            categories: &[Category::SortedSet, Category::Write, Category::Slow],
            description: "(ZREMRANGEBYSCORE key min max) Remove members with min <= score <= \
                          max.",
            synchronized: true,
            extract_keys: first_key,
            handler: zremrangebyscore,
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "zrange",
            categories: &[Category::SortedSet, Category::Read, Category::Slow],
            description: "(ZRANGE key start stop [BYSCORE | BYLEX] [REV] [LIMIT offset count] \
                          [WITHSCORES]) Range of members by rank, score, or lexicographic \
                          order.",
            synchronized: false,
            extract_keys: first_key,
            handler: zrange,
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "zrangestore",
            categories: &[Category::SortedSet, Category::Write, Category::Slow],
            description: "(ZRANGESTORE destination source start stop [BYSCORE | BYLEX] [REV] \
                          [LIMIT offset count]) Store the selected range at destination.",
            synchronized: true,
            extract_keys: source_dest_keys,
            handler: zrangestore,
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "zscore",
            categories: &[Category::SortedSet, Category::Read, Category::Fast],
            description: "(ZSCORE key member) The member's score, or nil.",
            synchronized: false,
            extract_keys: first_key,
            handler: zscore,
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "zunion",
            categories: &[Category::SortedSet, Category::Read, Category::Slow],
            description: "(ZUNION numkeys key [key ...] [WEIGHTS weight [weight ...]] \
                          [AGGREGATE SUM|MIN|MAX] [WITHSCORES]) Union of the input sets with \
                          weighted, aggregated scores.",
            synchronized: false,
            extract_keys: algebra_keys,
            handler: zunion,
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "zunionstore",
            categories: &[Category::SortedSet, Category::Write, Category::Slow],
            description: "(ZUNIONSTORE destination numkeys key [key ...] [WEIGHTS ...] \
                          [AGGREGATE ...]) Store the union at destination and return its \
                          cardinality.",
            synchronized: true,
            extract_keys: algebra_store_keys,
            handler: zunionstore,
            subcommands: Vec::new(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::dispatch::execute_handler;
    use crate::state::ServerState;

    fn ctx() -> ExecContext {
        ExecContext::internal(ServerState::new(ServerConfig::default()).unwrap())
    }

    async fn run(ctx: &ExecContext, tokens: &[&str]) -> Result<Frame, CommandError> {
        execute_handler(ctx, tokens.iter().map(|s| s.to_string()).collect()).await
    }

    fn flat(members: &[(&str, &str)]) -> Frame {
        let mut items = Vec::new();
        for (member, score) in members {
            items.push(Frame::bulk(member.to_string()));
            items.push(Frame::Simple(score.to_string()));
        }
        Frame::Array(items)
    }

    #[tokio::test]
    async fn zadd_then_zrange_withscores() {
        let ctx = ctx();
        assert_eq!(
            run(&ctx, &["zadd", "k", "1", "a", "2", "b", "3", "c"])
                .await
                .unwrap(),
            Frame::Integer(3)
        );
        assert_eq!(
            run(&ctx, &["zrange", "k", "0", "-1", "WITHSCORES"])
                .await
                .unwrap(),
            flat(&[("a", "1"), ("b", "2"), ("c", "3")])
        );
    }

    #[tokio::test]
    async fn zadd_xx_ch_updates_only_existing() {
        let ctx = ctx();
        run(&ctx, &["zadd", "k", "1", "a", "2", "b", "3", "c"])
            .await
            .unwrap();
        // only "a" is updated; "d" is rejected by XX
        assert_eq!(
            run(&ctx, &["zadd", "k", "XX", "CH", "5", "a", "6", "d"])
                .await
                .unwrap(),
            Frame::Integer(1)
        );
        assert_eq!(
            run(&ctx, &["zscore", "k", "a"]).await.unwrap(),
            Frame::bulk("5")
        );
        assert_eq!(run(&ctx, &["zscore", "k", "d"]).await.unwrap(), Frame::Null);
    }

    #[tokio::test]
    async fn zincrby_adds_delta() {
        let ctx = ctx();
        run(&ctx, &["zadd", "k", "5", "a"]).await.unwrap();
        assert_eq!(
            run(&ctx, &["zincrby", "k", "2.5", "a"]).await.unwrap(),
            Frame::Simple("7.5".into())
        );
        // creates key and member from scratch
        assert_eq!(
            run(&ctx, &["zincrby", "fresh", "3", "m"]).await.unwrap(),
            Frame::Simple("3".into())
        );
    }

    #[tokio::test]
    async fn zadd_incr_single_pair_only() {
        let ctx = ctx();
        let err = run(&ctx, &["zadd", "k", "INCR", "1", "a", "2", "b"])
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Conflict(_)));
    }

    #[tokio::test]
    async fn zadd_nx_gt_rejected() {
        let ctx = ctx();
        let err = run(&ctx, &["zadd", "k", "NX", "GT", "1", "a"])
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Conflict(_)));
    }

    #[tokio::test]
    async fn zadd_incr_returns_score_or_nil() {
        let ctx = ctx();
        run(&ctx, &["zadd", "k", "5", "a"]).await.unwrap();
        assert_eq!(
            run(&ctx, &["zadd", "k", "INCR", "2", "a"]).await.unwrap(),
            Frame::Simple("7".into())
        );
        // NX blocks the increment of an existing member
        assert_eq!(
            run(&ctx, &["zadd", "k", "NX", "INCR", "2", "a"])
                .await
                .unwrap(),
            Frame::Null
        );
    }

    #[tokio::test]
    async fn zadd_xx_on_missing_key_leaves_no_key() {
        let ctx = ctx();
        assert_eq!(
            run(&ctx, &["zadd", "ghost", "XX", "1", "a"]).await.unwrap(),
            Frame::Integer(0)
        );
        assert_eq!(
            run(&ctx, &["exists", "ghost"]).await.unwrap(),
            Frame::Integer(0)
        );
    }

    #[tokio::test]
    async fn zadd_same_pair_twice_returns_zero() {
        let ctx = ctx();
        assert_eq!(
            run(&ctx, &["zadd", "k", "5", "m"]).await.unwrap(),
            Frame::Integer(1)
        );
        assert_eq!(
            run(&ctx, &["zadd", "k", "5", "m"]).await.unwrap(),
            Frame::Integer(0)
        );
        assert_eq!(
            run(&ctx, &["zadd", "k", "CH", "5", "m"]).await.unwrap(),
            Frame::Integer(0)
        );
    }

    #[tokio::test]
    async fn zadd_against_string_is_wrong_type() {
        let ctx = ctx();
        run(&ctx, &["set", "s", "text"]).await.unwrap();
        let err = run(&ctx, &["zadd", "s", "1", "a"]).await.unwrap_err();
        assert_eq!(err, CommandError::WrongType);
    }

    #[tokio::test]
    async fn zcard_counts_members() {
        let ctx = ctx();
        assert_eq!(run(&ctx, &["zcard", "nope"]).await.unwrap(), Frame::Integer(0));
        run(&ctx, &["zadd", "k", "1", "a", "2", "b"]).await.unwrap();
        assert_eq!(run(&ctx, &["zcard", "k"]).await.unwrap(), Frame::Integer(2));
    }

    #[tokio::test]
    async fn zcount_with_infinities() {
        let ctx = ctx();
        run(&ctx, &["zadd", "k", "1", "a", "2", "b", "3", "c"])
            .await
            .unwrap();
        assert_eq!(
            run(&ctx, &["zcount", "k", "-inf", "+inf"]).await.unwrap(),
            Frame::Integer(3)
        );
        assert_eq!(
            run(&ctx, &["zcount", "k", "2", "3"]).await.unwrap(),
            Frame::Integer(2)
        );
    }

    #[tokio::test]
    async fn zrange_byscore_and_limit() {
        let ctx = ctx();
        run(&ctx, &["zadd", "k", "1", "a", "2", "b", "3", "c", "4", "d"])
            .await
            .unwrap();
        assert_eq!(
            run(&ctx, &["zrange", "k", "2", "3", "BYSCORE"]).await.unwrap(),
            Frame::Array(vec![Frame::bulk("b"), Frame::bulk("c")])
        );
        assert_eq!(
            run(&ctx, &["zrange", "k", "1", "4", "BYSCORE", "LIMIT", "1", "2"])
                .await
                .unwrap(),
            Frame::Array(vec![Frame::bulk("b"), Frame::bulk("c")])
        );
        // count of -1 runs through the end
        assert_eq!(
            run(&ctx, &["zrange", "k", "1", "4", "BYSCORE", "LIMIT", "2", "-1"])
                .await
                .unwrap(),
            Frame::Array(vec![Frame::bulk("c"), Frame::bulk("d")])
        );
    }

    #[tokio::test]
    async fn zrange_offset_past_cardinality_is_empty() {
        let ctx = ctx();
        run(&ctx, &["zadd", "k", "1", "a"]).await.unwrap();
        assert_eq!(
            run(&ctx, &["zrange", "k", "0", "-1", "LIMIT", "10", "5"])
                .await
                .unwrap(),
            Frame::Array(vec![])
        );
    }

    #[tokio::test]
    async fn zrange_rev_reverses() {
        let ctx = ctx();
        run(&ctx, &["zadd", "k", "1", "a", "2", "b"]).await.unwrap();
        assert_eq!(
            run(&ctx, &["zrange", "k", "0", "-1", "REV"]).await.unwrap(),
            Frame::Array(vec![Frame::bulk("b"), Frame::bulk("a")])
        );
    }

    #[tokio::test]
    async fn zrange_bylex_requires_uniform_scores() {
        let ctx = ctx();
        run(&ctx, &["zadd", "u", "0", "apple", "0", "banana", "0", "cherry"])
            .await
            .unwrap();
        assert_eq!(
            run(&ctx, &["zrange", "u", "apple", "banana", "BYLEX"])
                .await
                .unwrap(),
            Frame::Array(vec![Frame::bulk("apple"), Frame::bulk("banana")])
        );

        run(&ctx, &["zadd", "mixed", "0", "a", "1", "b"]).await.unwrap();
        assert_eq!(
            run(&ctx, &["zrange", "mixed", "a", "z", "BYLEX"]).await.unwrap(),
            Frame::Array(vec![])
        );
    }

    #[tokio::test]
    async fn zrangestore_stores_selection() {
        let ctx = ctx();
        run(&ctx, &["zadd", "src", "1", "a", "2", "b", "3", "c"])
            .await
            .unwrap();
        assert_eq!(
            run(&ctx, &["zrangestore", "dst", "src", "0", "1"]).await.unwrap(),
            Frame::Integer(2)
        );
        assert_eq!(
            run(&ctx, &["zrange", "dst", "0", "-1", "WITHSCORES"])
                .await
                .unwrap(),
            flat(&[("a", "1"), ("b", "2")])
        );
    }

    #[tokio::test]
    async fn zrank_and_zrevrank() {
        let ctx = ctx();
        run(&ctx, &["zadd", "k", "1", "a", "2", "b", "3", "c"])
            .await
            .unwrap();
        assert_eq!(run(&ctx, &["zrank", "k", "a"]).await.unwrap(), Frame::Integer(0));
        assert_eq!(
            run(&ctx, &["zrevrank", "k", "a"]).await.unwrap(),
            Frame::Integer(2)
        );
        assert_eq!(run(&ctx, &["zrank", "k", "zz"]).await.unwrap(), Frame::Null);
        assert_eq!(
            run(&ctx, &["zrank", "k", "b", "WITHSCORE"]).await.unwrap(),
            Frame::Array(vec![Frame::Integer(1), Frame::bulk("2")])
        );
    }

    #[tokio::test]
    async fn zrem_counts_removed() {
        let ctx = ctx();
        run(&ctx, &["zadd", "k", "1", "a", "2", "b", "3", "c"])
            .await
            .unwrap();
        assert_eq!(
            run(&ctx, &["zrem", "k", "a", "c", "ghost"]).await.unwrap(),
            Frame::Integer(2)
        );
        assert_eq!(run(&ctx, &["zcard", "k"]).await.unwrap(), Frame::Integer(1));
        assert_eq!(
            run(&ctx, &["zrem", "missing", "x"]).await.unwrap(),
            Frame::Integer(0)
        );
    }

    #[tokio::test]
    async fn zremrangebyscore_inclusive() {
        let ctx = ctx();
        run(&ctx, &["zadd", "k", "1", "a", "2", "b", "3", "c"])
            .await
            .unwrap();
        assert_eq!(
            run(&ctx, &["zremrangebyscore", "k", "1", "2"]).await.unwrap(),
            Frame::Integer(2)
        );
        assert_eq!(run(&ctx, &["zcard", "k"]).await.unwrap(), Frame::Integer(1));
    }

    #[tokio::test]
    async fn zremrangebyrank_negative_indices_and_bounds() {
        let ctx = ctx();
        run(&ctx, &["zadd", "k", "1", "a", "2", "b", "3", "c"])
            .await
            .unwrap();
        assert_eq!(
            run(&ctx, &["zremrangebyrank", "k", "-2", "-1"]).await.unwrap(),
            Frame::Integer(2)
        );
        // still out of range after mapping
        let err = run(&ctx, &["zremrangebyrank", "k", "0", "5"])
            .await
            .unwrap_err();
        assert_eq!(err, CommandError::OutOfRange);
    }

    #[tokio::test]
    async fn zremrangebylex_uniform_only() {
        let ctx = ctx();
        run(&ctx, &["zadd", "u", "0", "a", "0", "b", "0", "c"])
            .await
            .unwrap();
        assert_eq!(
            run(&ctx, &["zremrangebylex", "u", "a", "b"]).await.unwrap(),
            Frame::Integer(2)
        );

        run(&ctx, &["zadd", "mixed", "0", "a", "1", "b"]).await.unwrap();
        assert_eq!(
            run(&ctx, &["zremrangebylex", "mixed", "a", "z"]).await.unwrap(),
            Frame::Integer(0)
        );
    }

    #[tokio::test]
    async fn zpop_both_ends() {
        let ctx = ctx();
        run(&ctx, &["zadd", "k", "1", "a", "2", "b", "3", "c"])
            .await
            .unwrap();
        assert_eq!(
            run(&ctx, &["zpopmin", "k"]).await.unwrap(),
            flat(&[("a", "1")])
        );
        assert_eq!(
            run(&ctx, &["zpopmax", "k", "2"]).await.unwrap(),
            flat(&[("c", "3"), ("b", "2")])
        );
        assert_eq!(
            run(&ctx, &["zpopmin", "missing"]).await.unwrap(),
            Frame::Array(vec![])
        );
    }

    #[tokio::test]
    async fn zmpop_pops_first_non_empty() {
        let ctx = ctx();
        run(&ctx, &["zadd", "b", "1", "x", "2", "y"]).await.unwrap();
        assert_eq!(
            run(&ctx, &["zmpop", "a", "b", "MIN", "COUNT", "2"]).await.unwrap(),
            flat(&[("x", "1"), ("y", "2")])
        );
        assert_eq!(
            run(&ctx, &["zmpop", "a", "b", "MAX"]).await.unwrap(),
            Frame::Array(vec![])
        );
    }

    #[tokio::test]
    async fn zmscore_mixes_hits_and_misses() {
        let ctx = ctx();
        run(&ctx, &["zadd", "k", "1.5", "a"]).await.unwrap();
        assert_eq!(
            run(&ctx, &["zmscore", "k", "a", "nope"]).await.unwrap(),
            Frame::Array(vec![Frame::bulk("1.5"), Frame::Null])
        );
    }

    #[tokio::test]
    async fn zlexcount_uniform_only() {
        let ctx = ctx();
        run(&ctx, &["zadd", "u", "0", "a", "0", "b", "0", "c"])
            .await
            .unwrap();
        assert_eq!(
            run(&ctx, &["zlexcount", "u", "a", "b"]).await.unwrap(),
            Frame::Integer(2)
        );
    }

    #[tokio::test]
    async fn zrandmember_shapes() {
        let ctx = ctx();
        assert_eq!(
            run(&ctx, &["zrandmember", "none"]).await.unwrap(),
            Frame::Null
        );
        run(&ctx, &["zadd", "k", "1", "a", "2", "b"]).await.unwrap();
        match run(&ctx, &["zrandmember", "k"]).await.unwrap() {
            Frame::Bulk(_) => {}
            other => panic!("expected bulk member, got {other:?}"),
        }
        match run(&ctx, &["zrandmember", "k", "-5"]).await.unwrap() {
            Frame::Array(items) => assert_eq!(items.len(), 5),
            other => panic!("expected array, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn zunionstore_weights_and_max_aggregate() {
        let ctx = ctx();
        run(&ctx, &["zadd", "a", "1", "x", "2", "y"]).await.unwrap();
        run(&ctx, &["zadd", "b", "3", "y", "4", "z"]).await.unwrap();

        assert_eq!(
            run(
                &ctx,
                &["zunionstore", "d", "2", "a", "b", "WEIGHTS", "2", "1", "AGGREGATE", "MAX"]
            )
            .await
            .unwrap(),
            Frame::Integer(3)
        );
        assert_eq!(
            run(&ctx, &["zrange", "d", "0", "-1", "WITHSCORES"]).await.unwrap(),
            flat(&[("x", "2"), ("y", "4"), ("z", "4")])
        );
    }

    #[tokio::test]
    async fn store_cardinality_matches_zcard() {
        let ctx = ctx();
        run(&ctx, &["zadd", "a", "1", "x", "2", "y"]).await.unwrap();
        run(&ctx, &["zadd", "b", "3", "y", "4", "z"]).await.unwrap();

        let stored = run(&ctx, &["zunionstore", "dest", "2", "a", "b"]).await.unwrap();
        let card = run(&ctx, &["zcard", "dest"]).await.unwrap();
        assert_eq!(stored, card);
    }

    #[tokio::test]
    async fn zinter_and_zinterstore() {
        let ctx = ctx();
        run(&ctx, &["zadd", "a", "1", "x", "2", "y"]).await.unwrap();
        run(&ctx, &["zadd", "b", "3", "y", "4", "z"]).await.unwrap();

        assert_eq!(
            run(&ctx, &["zinter", "2", "a", "b", "WITHSCORES"]).await.unwrap(),
            flat(&[("y", "5")])
        );
        assert_eq!(
            run(&ctx, &["zinterstore", "d", "2", "a", "b"]).await.unwrap(),
            Frame::Integer(1)
        );
        // a missing input empties the intersection
        assert_eq!(
            run(&ctx, &["zinter", "2", "a", "ghost"]).await.unwrap(),
            Frame::Array(vec![])
        );
    }

    #[tokio::test]
    async fn zdiff_and_zdiffstore() {
        let ctx = ctx();
        run(&ctx, &["zadd", "base", "1", "a", "2", "b", "3", "c"])
            .await
            .unwrap();
        run(&ctx, &["zadd", "sub", "99", "b"]).await.unwrap();

        assert_eq!(
            run(&ctx, &["zdiff", "2", "base", "sub", "WITHSCORES"]).await.unwrap(),
            flat(&[("a", "1"), ("c", "3")])
        );
        assert_eq!(
            run(&ctx, &["zdiffstore", "d", "2", "base", "sub"]).await.unwrap(),
            Frame::Integer(2)
        );
        // missing base yields 0 without touching the destination
        assert_eq!(
            run(&ctx, &["zdiffstore", "d2", "2", "ghost", "sub"]).await.unwrap(),
            Frame::Integer(0)
        );
        assert_eq!(run(&ctx, &["exists", "d2"]).await.unwrap(), Frame::Integer(0));
    }

    #[tokio::test]
    async fn zunion_skips_missing_inputs() {
        let ctx = ctx();
        run(&ctx, &["zadd", "a", "1", "x"]).await.unwrap();
        assert_eq!(
            run(&ctx, &["zunion", "2", "a", "ghost", "WITHSCORES"]).await.unwrap(),
            flat(&[("x", "1")])
        );
    }

    #[tokio::test]
    async fn zscore_formats() {
        let ctx = ctx();
        run(&ctx, &["zadd", "k", "+inf", "top", "3", "mid"]).await.unwrap();
        assert_eq!(
            run(&ctx, &["zscore", "k", "top"]).await.unwrap(),
            Frame::bulk("inf")
        );
        assert_eq!(
            run(&ctx, &["zscore", "k", "mid"]).await.unwrap(),
            Frame::bulk("3")
        );
        assert_eq!(run(&ctx, &["zscore", "k", "no"]).await.unwrap(), Frame::Null);
    }

    #[tokio::test]
    async fn score_parse_errors_are_reported() {
        let ctx = ctx();
        let err = run(&ctx, &["zadd", "k", "ten", "a"]).await.unwrap_err();
        assert!(matches!(err, CommandError::Parse(_)));
    }
}
