//! Per-connection handler.
//!
//! Reads RESP requests (multi-bulk or inline) from the stream, routes
//! them through the dispatcher, and writes responses back in 1024-byte
//! chunks. Pub/sub deliveries arrive on the connection's outbound
//! queue and interleave with command replies.

use std::io;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use vesper_protocol::{parse_request, Frame};

use crate::dispatch::{self, frame_to_tokens};
use crate::state::{ConnHandle, ExecContext, ServerState};

/// Initial read buffer capacity.
const BUF_CAPACITY: usize = 4096;

/// Maximum read buffer size before the client is disconnected. Bounds
/// what a slow or malicious client can pin with incomplete frames.
const MAX_BUF_SIZE: usize = 64 * 1024 * 1024;

/// Responses larger than this are written in chunks of this size.
const CHUNK_SIZE: usize = 1024;

/// Outbound queue depth per connection (replies + pub/sub deliveries).
const OUTBOUND_CAPACITY: usize = 64;

/// Drives a single client connection to completion.
pub async fn handle<S>(stream: S, state: Arc<ServerState>) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Bytes>(OUTBOUND_CAPACITY);
    let conn = Arc::new(ConnHandle::new(state.next_conn_id(), outbound_tx));
    let ctx = ExecContext::for_conn(state, Arc::clone(&conn));

    let mut buf = BytesMut::with_capacity(BUF_CAPACITY);

    loop {
        tokio::select! {
            delivered = outbound_rx.recv() => {
                if let Some(bytes) = delivered {
                    write_chunked(&mut writer, &bytes).await?;
                }
            }
            read = reader.read_buf(&mut buf) => {
                match read {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        conn.shutdown();
                        return Err(e);
                    }
                }
                if buf.len() > MAX_BUF_SIZE {
                    let err = Frame::Error("ERR max buffer size exceeded, closing connection".into());
                    let _ = write_chunked(&mut writer, &err.to_bytes()).await;
                    break;
                }

                // drain every complete request the buffer holds (pipelining)
                loop {
                    match parse_request(&buf) {
                        Ok(Some((frame, consumed))) => {
                            let _ = buf.split_to(consumed);
                            let Some(tokens) = frame_to_tokens(frame) else {
                                let err = Frame::Error("ERR invalid command".into());
                                write_chunked(&mut writer, &err.to_bytes()).await?;
                                continue;
                            };
                            if tokens.is_empty() {
                                continue; // blank inline line
                            }
                            let response = dispatch::dispatch(&ctx, tokens).await;
                            if !response.is_empty() {
                                write_chunked(&mut writer, &response).await?;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            let err = Frame::Error(format!("ERR protocol error: {e}"));
                            let _ = write_chunked(&mut writer, &err.to_bytes()).await;
                            conn.shutdown();
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    conn.shutdown();
    Ok(())
}

/// Writes a response, splitting anything larger than `CHUNK_SIZE` into
/// 1024-byte writes.
async fn write_chunked<W>(writer: &mut W, bytes: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    for chunk in bytes.chunks(CHUNK_SIZE) {
        writer.write_all(chunk).await?;
    }
    writer.flush().await
}
