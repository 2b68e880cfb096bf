//! Data-plane connections.
//!
//! # Frame Handling Invariants
//!
//! - Strict 1:1 mapping: one WS binary message = one sealed frame
//! - No buffering, no message combining/splitting
//! - Each `write()` = exactly one `ws.send(Binary(...))`

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use crate::error::PortalError;

/// Upper bound on the close handshake.
pub(crate) const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// A connection carrying sealed frames between the two peers.
///
/// Implemented by the direct WebSocket and by the rendezvous relay, so the
/// transfer protocol runs unchanged over either.
#[async_trait]
pub trait Conn: Send {
    /// Send one sealed frame.
    async fn write(&mut self, frame: Vec<u8>) -> Result<(), PortalError>;

    /// Receive one sealed frame.
    async fn read(&mut self) -> Result<Vec<u8>, PortalError>;

    /// Close the connection. Best effort.
    async fn close(&mut self);
}

/// Peer-to-peer WebSocket.
pub struct DirectConn<S> {
    ws: WebSocketStream<S>,
    // First frame, already read while the connection was being probed.
    pending: Option<Vec<u8>>,
}

impl<S> std::fmt::Debug for DirectConn<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectConn")
            .field("pending", &self.pending.as_ref().map(Vec::len))
            .finish()
    }
}

impl<S> DirectConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an established WebSocket.
    pub fn new(ws: WebSocketStream<S>) -> Self {
        Self { ws, pending: None }
    }

    /// Wrap a WebSocket whose first frame was already read.
    pub fn with_pending(ws: WebSocketStream<S>, first: Vec<u8>) -> Self {
        Self {
            ws,
            pending: Some(first),
        }
    }
}

/// Next binary frame on `ws`, skipping control and text frames.
pub(crate) async fn next_binary<S>(ws: &mut WebSocketStream<S>) -> Result<Vec<u8>, PortalError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match ws.next().await {
            Some(Ok(WsMessage::Binary(data))) => return Ok(data),
            Some(Ok(WsMessage::Close(_))) | None => {
                return Err(PortalError::Connectivity("peer closed the connection".into()))
            }
            Some(Ok(_)) => continue, // Ping, Pong, Text
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

#[async_trait]
impl<S> Conn for DirectConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn write(&mut self, frame: Vec<u8>) -> Result<(), PortalError> {
        self.ws.send(WsMessage::Binary(frame)).await?;
        Ok(())
    }

    async fn read(&mut self) -> Result<Vec<u8>, PortalError> {
        if let Some(frame) = self.pending.take() {
            return Ok(frame);
        }
        next_binary(&mut self.ws).await
    }

    async fn close(&mut self) {
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, self.ws.close(None)).await;
    }
}
