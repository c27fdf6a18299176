//! Per-connection WebSocket session: the socket write half as a
//! [`FrameSink`] and the read loop that feeds frames to the hub.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use relay_hub::{Connection, ConnectionKind, DisconnectReason, FrameSink, Hub, TransportError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::frames::{self, FrameOutcome};

/// Write half of an axum WebSocket.
pub struct WsSink {
    tx: SplitSink<WebSocket, Message>,
}

impl WsSink {
    /// Wrap a socket write half.
    pub fn new(tx: SplitSink<WebSocket, Message>) -> Self {
        Self { tx }
    }
}

fn write_error(e: axum::Error) -> TransportError {
    TransportError::Write(e.to_string())
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.tx.send(Message::Text(text.into())).await.map_err(write_error)
    }

    async fn send_ping(&mut self) -> Result<(), TransportError> {
        self.tx
            .send(Message::Ping(Vec::new().into()))
            .await
            .map_err(write_error)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx.close().await.map_err(write_error)
    }
}

/// Drive `conn` until its socket closes, the hub closes it, or `shutdown`
/// fires. Every inbound frame (pongs included) refreshes liveness.
pub async fn read_loop(
    hub: &Hub,
    conn: &Arc<Connection>,
    mut stream: SplitStream<WebSocket>,
    ping_interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ping = tokio::time::interval(ping_interval);
    let _ = ping.tick().await;

    let reason = loop {
        tokio::select! {
            () = conn.closed() => break None,
            () = shutdown.cancelled() => break Some(DisconnectReason::Closed),
            _ = ping.tick() => {
                if let Err(e) = conn.ping().await {
                    debug!(conn_id = conn.id(), error = %e, "ping failed");
                    break Some(DisconnectReason::WriteError);
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    hub.touch(conn);
                    handle_text(hub, conn, text.as_str()).await;
                }
                Some(Ok(Message::Binary(data))) => {
                    hub.touch(conn);
                    match std::str::from_utf8(&data) {
                        Ok(text) => handle_text(hub, conn, text).await,
                        Err(_) => debug!(conn_id = conn.id(), len = data.len(), "non-UTF8 binary frame"),
                    }
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => hub.touch(conn),
                Some(Ok(Message::Close(_))) | None => break Some(DisconnectReason::Closed),
                Some(Err(e)) => {
                    debug!(conn_id = conn.id(), error = %e, "socket read failed");
                    break Some(DisconnectReason::ReadError);
                }
            }
        }
    };

    match reason {
        Some(reason) => {
            let _ = hub.connection_lost(conn, reason).await;
        }
        None => info!(conn_id = conn.id(), kind = %conn.kind(), "connection closed by hub"),
    }
    conn.close_sink().await;
}

async fn handle_text(hub: &Hub, conn: &Arc<Connection>, text: &str) {
    let outcome = match conn.kind() {
        ConnectionKind::Bot => frames::handle_bot_frame(hub, conn, text).await,
        ConnectionKind::Worker => frames::handle_worker_frame(hub, conn, text).await,
        ConnectionKind::Observer => FrameOutcome::Ignored,
    };
    trace!(conn_id = conn.id(), ?outcome, "frame handled");
}
