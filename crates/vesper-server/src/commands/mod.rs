//! Command handler modules and the dispatch registry.

use std::sync::OnceLock;

use vesper_protocol::Frame;

use crate::dispatch::{CommandError, CommandSpec};

pub mod admin;
pub mod connection;
pub mod generic;
pub mod pubsub;
pub mod sorted_set;

static REGISTRY: OnceLock<Vec<CommandSpec>> = OnceLock::new();

/// All commands the server dispatches, assembled once at first use.
pub fn registry() -> &'static [CommandSpec] {
    REGISTRY.get_or_init(|| {
        let mut commands = connection::commands();
        commands.extend(generic::commands());
        commands.extend(sorted_set::commands());
        commands.extend(admin::commands());
        commands.extend(pubsub::commands());
        commands
    })
}

// -- key extractors shared across modules --

/// Commands that touch no keys.
pub(crate) fn no_keys(_cmd: &[String]) -> Result<Vec<String>, CommandError> {
    Ok(Vec::new())
}

/// Single key in argument position 1.
pub(crate) fn first_key(cmd: &[String]) -> Result<Vec<String>, CommandError> {
    match cmd.get(1) {
        Some(key) => Ok(vec![key.clone()]),
        None => Err(CommandError::WrongArgs),
    }
}

/// Every trailing argument is a key (DEL, EXISTS).
pub(crate) fn trailing_keys(cmd: &[String]) -> Result<Vec<String>, CommandError> {
    if cmd.len() < 2 {
        return Err(CommandError::WrongArgs);
    }
    Ok(cmd[1..].to_vec())
}

// -- argument and reply helpers --

pub(crate) fn parse_int(input: &str) -> Result<i64, CommandError> {
    input
        .parse()
        .map_err(|_| CommandError::Parse("value is not an integer or out of range".into()))
}

/// Flat member/score reply array: members as bulk strings, each
/// followed by its score when `withscores` is set.
pub(crate) fn member_array(members: Vec<(String, f64)>, withscores: bool) -> Frame {
    let mut items = Vec::with_capacity(members.len() * if withscores { 2 } else { 1 });
    for (member, score) in members {
        items.push(Frame::bulk(member));
        if withscores {
            items.push(Frame::Simple(vesper_core::format_score(score)));
        }
    }
    Frame::Array(items)
}
