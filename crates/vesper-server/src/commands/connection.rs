//! Connection-level commands.

use vesper_protocol::Frame;

use crate::dispatch::{Category, CommandError, CommandSpec, HandlerFuture};
use crate::state::ExecContext;

use super::no_keys;

fn ping(_ctx: ExecContext, args: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        match args.len() {
            1 => Ok(Frame::Simple("PONG".into())),
            2 => Ok(Frame::bulk(args[1].clone())),
            _ => Err(CommandError::WrongArgs),
        }
    })
}

pub fn commands() -> Vec<CommandSpec> {
    vec![CommandSpec {
        name: "ping",
        categories: &[Category::Connection, Category::Fast],
        description: "(PING [message]) Ping the server; echoes the message when one is given.",
        synchronized: false,
        extract_keys: no_keys,
        handler: ping,
        subcommands: Vec::new(),
    }]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::state::ServerState;

    #[tokio::test]
    async fn ping_pongs() {
        let state = ServerState::new(ServerConfig::default()).unwrap();
        let ctx = ExecContext::internal(state);

        let reply = ping(ctx.clone(), vec!["ping".into()]).await.unwrap();
        assert_eq!(reply, Frame::Simple("PONG".into()));

        let reply = ping(ctx, vec!["ping".into(), "hi".into()]).await.unwrap();
        assert_eq!(reply, Frame::bulk("hi"));
    }
}
