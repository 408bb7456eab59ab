//! TCP transport layer for the RPC server.
//!
//! Handles TCP connections with newline-delimited JSON framing.
//! Each connection is handled in its own task; connection tasks are tracked
//! so shutdown can cancel them and wait for them to finish.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::codec::{self, EncodeError};
use super::methods::{METHOD_NAMES, MethodHandler};
use super::protocol::CallResponse;

/// Largest message accepted on a connection, excluding the delimiter.
pub const MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// Manages the TCP transport layer.
pub struct Transport {
    /// Taken by `listen` and dropped when it stops accepting.
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    handler: Arc<MethodHandler>,
    tracker: TaskTracker,
}

impl Transport {
    /// Bind the listening socket.
    pub async fn bind(bind_addr: SocketAddr, handler: Arc<MethodHandler>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener: Mutex::new(Some(listener)),
            local_addr,
            handler,
            tracker: TaskTracker::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until `shutdown` is cancelled, then close the
    /// listener and cancel and wait for every connection task.
    pub async fn listen(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let listener = self
            .listener
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .context("RPC server listener already closed")?;
        info!(addr = %self.local_addr, methods = ?METHOD_NAMES, "RPC server listening");

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            debug!(peer = %peer_addr, "Client connected");
                            let handler = self.handler.clone();
                            let cancel = shutdown.child_token();
                            let span = info_span!("connection", peer = %peer_addr);
                            self.tracker.spawn(
                                async move {
                                    tokio::select! {
                                        result = handle_connection(stream, handler) => {
                                            if let Err(e) = result {
                                                debug!(error = %e, "Connection error");
                                            }
                                        }
                                        _ = cancel.cancelled() => {
                                            debug!("Connection cancelled by shutdown");
                                        }
                                    }
                                    debug!("Client disconnected");
                                }
                                .instrument(span),
                            );
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("RPC server shutting down");
                    break;
                }
            }
        }

        drop(listener);
        self.tracker.close();
        self.tracker.wait().await;
        info!("RPC server stopped");

        Ok(())
    }
}

/// Handle a single client connection.
async fn handle_connection(stream: TcpStream, handler: Arc<MethodHandler>) -> anyhow::Result<()> {
    let (reader, writer) = stream.into_split();
    serve_messages(reader, writer, &handler, MAX_MESSAGE_BYTES).await
}

/// Answer each message on the stream until the peer closes it.
///
/// Message-level problems become error responses; only I/O failures on the
/// stream itself end the loop early. A message longer than `max_len` is
/// answered with an error and ends the connection, since the rest of it
/// cannot be told apart from the next message.
pub(crate) async fn serve_messages<R, W>(
    reader: R,
    mut writer: W,
    handler: &MethodHandler,
    max_len: usize,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();

    loop {
        line.clear();
        let bytes_read = (&mut reader)
            .take(max_len as u64 + 1)
            .read_until(codec::DELIMITER, &mut line)
            .await?;

        if bytes_read == 0 {
            // EOF - client disconnected
            break;
        }

        if line.len() > max_len && line.last() != Some(&codec::DELIMITER) {
            warn!(limit = max_len, "Message too large, closing connection");
            let response =
                CallResponse::invalid_message(format!("message exceeds {} bytes", max_len));
            writer.write_all(&codec::encode(&response)?).await?;
            writer.flush().await?;
            break;
        }

        if line.trim_ascii().is_empty() {
            continue;
        }

        let response = handler.handle_message(&line).await;
        let bytes = encode_reply(&response, &response.request_id)?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
    }

    Ok(())
}

/// Encode a reply, substituting a plain error response if the reply itself
/// cannot be encoded.
fn encode_reply<T: Serialize>(reply: &T, request_id: &str) -> Result<Vec<u8>, EncodeError> {
    codec::encode(reply).or_else(|e| {
        warn!(request_id = %request_id, error = %e, "Replacing unencodable response");
        codec::encode(&CallResponse::error(request_id, format!("server error: {}", e)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::protocol::{CallResponse, Status};
    use tokio::io::AsyncReadExt;

    async fn exchange(input: &[u8]) -> Vec<CallResponse> {
        exchange_limited(input, MAX_MESSAGE_BYTES).await
    }

    async fn exchange_limited(input: &[u8], max_len: usize) -> Vec<CallResponse> {
        let handler = MethodHandler::new();
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let (mut client_read, mut client_write) = tokio::io::split(client);

        client_write.write_all(input).await.unwrap();
        client_write.shutdown().await.unwrap();

        serve_messages(server_read, server_write, &handler, max_len)
            .await
            .unwrap();

        let mut out = Vec::new();
        client_read.read_to_end(&mut out).await.unwrap();
        out.split(|b| *b == codec::DELIMITER)
            .filter(|l| !l.is_empty())
            .map(|l| codec::decode(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_one_response_per_message() {
        let responses = exchange(
            b"{\"request_id\":\"1\",\"method\":\"add\",\"params\":[1,2]}\n\
              {\"request_id\":\"2\",\"method\":\"echo\",\"params\":{\"message\":\"hi\"}}\n",
        )
        .await;

        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].request_id, "1");
        assert_eq!(responses[0].result, Some(serde_json::json!(3)));
        assert_eq!(responses[1].result, Some(serde_json::json!("Echo: hi")));
    }

    #[tokio::test]
    async fn test_malformed_message_keeps_connection_open() {
        let responses = exchange(
            b"garbage\n\n{\"request_id\":\"after\",\"method\":\"get_time\"}\n",
        )
        .await;

        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].request_id, "unknown");
        assert_eq!(responses[0].status, Status::Error);
        assert_eq!(responses[1].request_id, "after");
        assert_eq!(responses[1].status, Status::Ok);
    }

    #[tokio::test]
    async fn test_unterminated_final_message_is_answered() {
        let responses = exchange(b"{\"request_id\":\"x\",\"method\":\"add\",\"params\":[2,2]}").await;

        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].result, Some(serde_json::json!(4)));
    }

    #[tokio::test]
    async fn test_oversized_message_answered_then_closed() {
        let responses = exchange_limited(
            b"{\"request_id\":\"1\",\"method\":\"add\",\"params\":[1,2]}\n\
              {\"request_id\":\"2\",\"method\":\"echo\",\"params\":[\"far too long for the limit\"]}\n\
              {\"request_id\":\"3\",\"method\":\"get_time\"}\n",
            56,
        )
        .await;

        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].result, Some(serde_json::json!(3)));
        assert_eq!(responses[1].request_id, "unknown");
        assert!(responses[1].error.as_deref().unwrap().contains("exceeds 56 bytes"));
    }

    struct Unencodable;

    impl Serialize for Unencodable {
        fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("unsupported value"))
        }
    }

    #[test]
    fn test_unencodable_reply_becomes_error_response() {
        let bytes = encode_reply(&Unencodable, "r7").unwrap();
        let response: CallResponse = codec::decode(&bytes).unwrap();

        assert_eq!(response.request_id, "r7");
        assert_eq!(response.status, Status::Error);
        assert!(response.error.unwrap().starts_with("server error:"));
    }
}
