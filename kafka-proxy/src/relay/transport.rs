//! TCP transport for remote clients.
//!
//! Each accepted socket is registered with the relay as one connection. A
//! writer task drains the frames the relay queues for it while the reader
//! loop handles acks, pull requests and view requests. When the socket
//! closes the connection is unregistered and its outstanding tickets are
//! redelivered.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::relay::connection::ConnectionHandle;
use crate::relay::protocol::{self, ClientFrame, ServerFrame};
use crate::relay::ProxyRelay;

/// How long a closing connection may keep flushing queued frames
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

/// Accept remote clients until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    relay: ProxyRelay,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    info!("Relay transport listening on {}", listener.local_addr()?);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Relay transport shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((socket, addr)) => {
                    let relay = relay.clone();
                    tokio::spawn(handle_connection(socket, addr, relay));
                }
                Err(e) => {
                    warn!("Error accepting connection: {}", e);
                }
            }
        }
    }

    Ok(())
}

async fn handle_connection(
    socket: TcpStream,
    addr: SocketAddr,
    relay: ProxyRelay,
) {
    if relay.is_closed() {
        return;
    }

    let (mut writer, mut reader) = Framed::new(socket, protocol::codec()).split();
    let ConnectionHandle {
        id,
        mut frames,
        replies,
    } = relay.connect();
    info!(connection_id = %id, "Accepted remote client from {}", addr);

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            let bytes = match protocol::encode(&frame) {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!(connection_id = %id, "Failed to encode frame: {}", e);
                    continue;
                }
            };
            if let Err(e) = writer.send(bytes).await {
                warn!(connection_id = %id, "Failed to write to client: {}", e);
                break;
            }
        }
    });

    let relay_closed = relay.closed_signal();
    loop {
        let frame = tokio::select! {
            _ = relay_closed.cancelled() => break,
            frame = reader.next() => frame,
        };
        let frame = match frame {
            None => break,
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                warn!(connection_id = %id, "Error reading frame: {}", e);
                break;
            }
        };

        let reply = match protocol::decode::<ClientFrame>(&frame) {
            Ok(ClientFrame::Ack { ticket_id }) => match relay.acknowledge(id, ticket_id) {
                Ok(()) => None,
                Err(rejection) => Some(ServerFrame::Error {
                    message: format!("ack for ticket {ticket_id} rejected: {rejection}"),
                }),
            },
            Ok(ClientFrame::PullRequest { max_records }) => Some(ServerFrame::PullResponse {
                records: relay.pull(id, max_records),
            }),
            Ok(ClientFrame::ViewRequest { message_id }) => {
                let (record, reason) = match relay.lookup(message_id) {
                    Ok(record) => (Some(record), None),
                    Err(e) => (None, Some(e.to_string())),
                };
                Some(ServerFrame::ViewResponse {
                    message_id,
                    record,
                    reason,
                })
            }
            Err(e) => {
                debug!(connection_id = %id, "Malformed client frame: {}", e);
                Some(ServerFrame::Error {
                    message: format!("malformed frame: {e}"),
                })
            }
        };

        if let Some(reply) = reply {
            if replies.send(reply).await.is_err() {
                break;
            }
        }
    }

    relay.disconnect(id);
    drop(replies);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer_task).await.is_err() {
        debug!(connection_id = %id, "Writer did not drain before timeout");
    }
    info!(connection_id = %id, "Remote client from {} closed", addr);
}
