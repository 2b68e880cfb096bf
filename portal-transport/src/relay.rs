//! Relay connection.
//!
//! Once the rendezvous server answered `relay-ready`, the control WebSocket
//! becomes a dumb pipe: binary frames are forwarded verbatim to the other
//! peer. The server can still interject a text frame (`peer-gone`, `error`),
//! which ends the relay.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::debug;
use portal_core::{ProtocolError, RendezvousMessage};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::conn::{Conn, CLOSE_TIMEOUT};
use crate::error::PortalError;

/// Control-plane WebSocket to the rendezvous server.
pub type ControlStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Data-plane connection forwarded by the rendezvous server.
pub struct RelayConn {
    ws: ControlStream,
}

impl std::fmt::Debug for RelayConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConn").finish_non_exhaustive()
    }
}

impl RelayConn {
    /// Wrap a control connection the server has switched to relay mode.
    pub fn new(ws: ControlStream) -> Self {
        Self { ws }
    }
}

/// Map a server text frame that arrived while relaying to an error.
fn interjection(text: &str) -> PortalError {
    match RendezvousMessage::from_json(text) {
        Ok(RendezvousMessage::PeerGone {}) => {
            PortalError::Connectivity("peer left the relay".into())
        }
        Ok(RendezvousMessage::Error { message }) => PortalError::Rendezvous(message),
        Ok(other) => PortalError::Protocol(ProtocolError::UnexpectedMessage {
            expected: "relayed frame",
            got: other.kind(),
        }),
        Err(e) => e.into(),
    }
}

#[async_trait]
impl Conn for RelayConn {
    async fn write(&mut self, frame: Vec<u8>) -> Result<(), PortalError> {
        self.ws.send(WsMessage::Binary(frame)).await?;
        Ok(())
    }

    async fn read(&mut self) -> Result<Vec<u8>, PortalError> {
        loop {
            match self.ws.next().await {
                Some(Ok(WsMessage::Binary(data))) => return Ok(data),
                Some(Ok(WsMessage::Text(text))) => {
                    debug!("relay interjection: {}", text);
                    return Err(interjection(&text));
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    return Err(PortalError::Connectivity("relay connection closed".into()))
                }
                Some(Ok(_)) => continue, // Ping, Pong
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    async fn close(&mut self) {
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, self.ws.close(None)).await;
    }
}
