//! Pub/sub commands. Handlers register subscriptions on the issuing
//! connection; a forwarder task per subscription feeds delivered
//! messages into the connection's outbound queue.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::broadcast;
use vesper_protocol::Frame;

use crate::dispatch::{Category, CommandError, CommandSpec, HandlerFuture};
use crate::pubsub::PubMessage;
use crate::state::{ConnHandle, ExecContext};

use super::no_keys;

/// Spawns the task that forwards broadcast deliveries to the client.
fn spawn_forwarder(
    conn: Arc<ConnHandle>,
    name: String,
    mut rx: broadcast::Receiver<PubMessage>,
    pattern: bool,
) {
    let outbound = conn.outbound();
    let handle = tokio::spawn(async move {
        while let Ok(msg) = rx.recv().await {
            let frame = if pattern {
                Frame::Array(vec![
                    Frame::bulk("pmessage"),
                    Frame::bulk(msg.pattern.as_deref().unwrap_or_default().to_owned()),
                    Frame::bulk(msg.channel.to_string()),
                    Frame::Bulk(msg.data),
                ])
            } else {
                Frame::Array(vec![
                    Frame::bulk("message"),
                    Frame::bulk(msg.channel.to_string()),
                    Frame::Bulk(msg.data),
                ])
            };
            if outbound.send(Bytes::from(frame.to_bytes())).await.is_err() {
                break;
            }
        }
    })
    .abort_handle();
    conn.register_forwarder(name, handle);
}

fn require_conn(ctx: &ExecContext) -> Result<Arc<ConnHandle>, CommandError> {
    ctx.conn
        .clone()
        .ok_or_else(|| CommandError::Fatal("no connection for subscription".into()))
}

fn subscribe(ctx: ExecContext, args: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        if args.len() < 2 {
            return Err(CommandError::WrongArgs);
        }
        let conn = require_conn(&ctx)?;

        let mut confirmations = Vec::new();
        for (i, channel) in args[1..].iter().enumerate() {
            let rx = ctx.state.pubsub.subscribe(channel);
            spawn_forwarder(Arc::clone(&conn), channel.clone(), rx, false);
            confirmations.push(Frame::Array(vec![
                Frame::bulk("subscribe"),
                Frame::bulk(channel.clone()),
                Frame::Integer(i as i64 + 1),
            ]));
        }
        Ok(single_or_array(confirmations))
    })
}

fn psubscribe(ctx: ExecContext, args: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        if args.len() < 2 {
            return Err(CommandError::WrongArgs);
        }
        let conn = require_conn(&ctx)?;

        let mut confirmations = Vec::new();
        for (i, pattern) in args[1..].iter().enumerate() {
            let rx = ctx
                .state
                .pubsub
                .psubscribe(pattern)
                .ok_or_else(|| CommandError::Parse("pattern too long".into()))?;
            spawn_forwarder(Arc::clone(&conn), pattern.clone(), rx, true);
            confirmations.push(Frame::Array(vec![
                Frame::bulk("psubscribe"),
                Frame::bulk(pattern.clone()),
                Frame::Integer(i as i64 + 1),
            ]));
        }
        Ok(single_or_array(confirmations))
    })
}

fn unsubscribe(ctx: ExecContext, args: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        let conn = require_conn(&ctx)?;
        let channels = if args.len() > 1 {
            args[1..].to_vec()
        } else {
            conn.subscription_names()
        };

        let mut confirmations = Vec::new();
        for channel in channels {
            if conn.remove_forwarder(&channel) {
                ctx.state.pubsub.unsubscribe(&channel);
            }
            confirmations.push(Frame::Array(vec![
                Frame::bulk("unsubscribe"),
                Frame::bulk(channel),
            ]));
        }
        Ok(single_or_array(confirmations))
    })
}

fn publish(ctx: ExecContext, args: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        if args.len() != 3 {
            return Err(CommandError::WrongArgs);
        }
        let delivered = ctx
            .state
            .pubsub
            .publish(&args[1], Bytes::from(args[2].clone().into_bytes()));
        Ok(Frame::Integer(delivered as i64))
    })
}

/// PUBSUB CHANNELS [pattern] — subcommand of PUBSUB.
fn pubsub_channels(ctx: ExecContext, args: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        if args.len() > 3 {
            return Err(CommandError::WrongArgs);
        }
        let mut names = ctx.state.pubsub.channel_names(args.get(2).map(|s| s.as_str()));
        names.sort();
        Ok(Frame::Array(names.into_iter().map(Frame::bulk).collect()))
    })
}

fn pubsub_parent(_ctx: ExecContext, _args: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        // never reached: dispatch resolves a subcommand first
        Err(CommandError::WrongArgs)
    })
}

fn single_or_array(mut frames: Vec<Frame>) -> Frame {
    if frames.len() == 1 {
        frames.remove(0)
    } else {
        Frame::Array(frames)
    }
}

pub fn commands() -> Vec<CommandSpec> {
    vec![
        CommandSpec {
            name: "subscribe",
            categories: &[Category::PubSub, Category::Connection],
            description: "(SUBSCRIBE channel [channel ...]) Subscribe the connection to \
                          channels.",
            synchronized: false,
            extract_keys: no_keys,
            handler: subscribe,
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "psubscribe",
            categories: &[Category::PubSub, Category::Connection],
            description: "(PSUBSCRIBE pattern [pattern ...]) Subscribe the connection to \
                          channel patterns.",
            synchronized: false,
            extract_keys: no_keys,
            handler: psubscribe,
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "unsubscribe",
            categories: &[Category::PubSub, Category::Connection],
            description: "(UNSUBSCRIBE [channel ...]) Drop the given subscriptions, or all \
                          of them.",
            synchronized: false,
            extract_keys: no_keys,
            handler: unsubscribe,
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "publish",
            categories: &[Category::PubSub, Category::Fast],
            description: "(PUBLISH channel message) Publish to a channel; returns the \
                          receiver count.",
            synchronized: false,
            extract_keys: no_keys,
            handler: publish,
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "pubsub",
            categories: &[Category::PubSub, Category::Slow],
            description: "(PUBSUB CHANNELS [pattern]) Introspect pub/sub state.",
            synchronized: false,
            extract_keys: no_keys,
            handler: pubsub_parent,
            subcommands: vec![CommandSpec {
                name: "channels",
                categories: &[Category::PubSub, Category::Slow],
                description: "(PUBSUB CHANNELS [pattern]) Active channels, optionally \
                              filtered by a glob pattern.",
                synchronized: false,
                extract_keys: no_keys,
                handler: pubsub_channels,
                subcommands: Vec::new(),
            }],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::dispatch::execute_handler;
    use crate::state::ServerState;
    use tokio::sync::mpsc;

    fn conn_ctx() -> (ExecContext, mpsc::Receiver<Bytes>) {
        let state = ServerState::new(ServerConfig::default()).unwrap();
        let (tx, rx) = mpsc::channel(16);
        let conn = Arc::new(ConnHandle::new(state.next_conn_id(), tx));
        (ExecContext::for_conn(state, conn), rx)
    }

    async fn run(ctx: &ExecContext, tokens: &[&str]) -> Result<Frame, CommandError> {
        execute_handler(ctx, tokens.iter().map(|s| s.to_string()).collect()).await
    }

    #[tokio::test]
    async fn subscribe_then_publish_delivers() {
        let (ctx, mut rx) = conn_ctx();
        run(&ctx, &["subscribe", "news"]).await.unwrap();

        assert_eq!(
            run(&ctx, &["publish", "news", "hello"]).await.unwrap(),
            Frame::Integer(1)
        );

        let delivered = rx.recv().await.unwrap();
        let (frame, _) = vesper_protocol::parse_frame(&delivered).unwrap().unwrap();
        assert_eq!(
            frame,
            Frame::Array(vec![
                Frame::bulk("message"),
                Frame::bulk("news"),
                Frame::bulk("hello"),
            ])
        );
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let (ctx, mut rx) = conn_ctx();
        run(&ctx, &["subscribe", "c"]).await.unwrap();
        run(&ctx, &["unsubscribe", "c"]).await.unwrap();

        assert_eq!(
            run(&ctx, &["publish", "c", "x"]).await.unwrap(),
            Frame::Integer(0)
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn pattern_subscription_delivers_pmessage() {
        let (ctx, mut rx) = conn_ctx();
        run(&ctx, &["psubscribe", "logs.*"]).await.unwrap();
        run(&ctx, &["publish", "logs.app", "boom"]).await.unwrap();

        let delivered = rx.recv().await.unwrap();
        let (frame, _) = vesper_protocol::parse_frame(&delivered).unwrap().unwrap();
        assert_eq!(
            frame,
            Frame::Array(vec![
                Frame::bulk("pmessage"),
                Frame::bulk("logs.*"),
                Frame::bulk("logs.app"),
                Frame::bulk("boom"),
            ])
        );
    }

    #[tokio::test]
    async fn pubsub_channels_lists_active() {
        let (ctx, _rx) = conn_ctx();
        run(&ctx, &["subscribe", "a", "b"]).await.unwrap();

        assert_eq!(
            run(&ctx, &["pubsub", "channels"]).await.unwrap(),
            Frame::Array(vec![Frame::bulk("a"), Frame::bulk("b")])
        );
    }

    #[tokio::test]
    async fn publish_without_connection_context_works() {
        let state = ServerState::new(ServerConfig::default()).unwrap();
        let ctx = ExecContext::internal(state);
        assert_eq!(
            run(&ctx, &["publish", "anywhere", "msg"]).await.unwrap(),
            Frame::Integer(0)
        );
    }
}
