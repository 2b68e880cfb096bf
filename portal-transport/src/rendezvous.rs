//! Rendezvous session.
//!
//! Drives the control plane with the rendezvous server:
//!
//! ```text
//! sender                      server                      receiver
//!   ── sender.bind ───────────▶  │
//!   ◀── bound(channel) ────────  │
//!   ── sender.establish ──────▶  │
//!   │                            │  ◀────── receiver.establish ──
//!   ◀── approve ──────────────   │
//!   ── sender.pake ───────────▶  ── sender.pake ───────────────▶
//!   ◀── receiver.pake ──────────  ◀────────────── receiver.pake ──
//!   ◀── salt ─────────────────   ── salt ─────────────────────▶
//!   ── sender.info (sealed) ──▶  ── sender.info ───────────────▶
//!   ◀── receiver.info ─────────  ◀──────── receiver.info (sealed)
//! ```
//!
//! `bind` is skipped when the sender brings its own password. PAKE bytes are
//! opaque to the server. Connection metadata is sealed under
//! the session key, so the first wrong-password symptom is a sealed info
//! message that fails to open on both sides.

use std::net::IpAddr;

use futures_util::{SinkExt, StreamExt};
use log::{debug, info};
use portal_core::{
    derive_session_key, ConnectionInfo, CryptoChannel, PakeExchange, Password, ProtocolError,
    RendezvousMessage, Role,
};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream};

use crate::config::PortalConfig;
use crate::error::PortalError;
use crate::relay::ControlStream;

/// Sender endpoint on the rendezvous server.
pub const SENDER_PATH: &str = "/establish-sender";

/// Receiver endpoint on the rendezvous server.
pub const RECEIVER_PATH: &str = "/establish-receiver";

/// Control-plane session with the rendezvous server.
pub struct RendezvousSession {
    ws: ControlStream,
    role: Role,
}

impl std::fmt::Debug for RendezvousSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RendezvousSession")
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

fn unexpected(expected: &'static str, got: &RendezvousMessage) -> PortalError {
    PortalError::Protocol(ProtocolError::UnexpectedMessage {
        expected,
        got: got.kind(),
    })
}

/// Start the PAKE off the I/O path.
fn spawn_pake<P>(password: &Password, role: Role) -> JoinHandle<Result<P, ProtocolError>>
where
    P: PakeExchange + 'static,
{
    let password = password.clone();
    tokio::task::spawn_blocking(move || P::init(&password, role))
}

async fn join_pake<P>(handle: JoinHandle<Result<P, ProtocolError>>) -> Result<P, PortalError> {
    let exchange = handle
        .await
        .map_err(|e| ProtocolError::Pake(format!("init task failed: {}", e)))??;
    Ok(exchange)
}

impl RendezvousSession {
    /// Dial the rendezvous endpoint for `role`.
    pub async fn connect(config: &PortalConfig, role: Role) -> Result<Self, PortalError> {
        let url = config.endpoint(match role {
            Role::Sender => SENDER_PATH,
            Role::Receiver => RECEIVER_PATH,
        });

        let (ws, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| PortalError::Connectivity(format!("rendezvous unreachable: {}", e)))?;
        info!("connected to rendezvous server at {}", url);

        Ok(Self { ws, role })
    }

    /// Role this session was opened for.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Local IP of the control connection.
    ///
    /// This is the interface the peer is most likely to reach us on.
    pub fn local_ip(&self) -> Option<IpAddr> {
        match self.ws.get_ref() {
            MaybeTlsStream::Plain(stream) => stream.local_addr().ok().map(|addr| addr.ip()),
            _ => None,
        }
    }

    /// Hand the control connection over to the negotiator.
    pub fn into_inner(self) -> ControlStream {
        self.ws
    }

    async fn send(&mut self, msg: &RendezvousMessage) -> Result<(), PortalError> {
        debug!("rendezvous -> {}", msg.kind());
        self.ws.send(WsMessage::Text(msg.to_json()?)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<RendezvousMessage, PortalError> {
        loop {
            match self.ws.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    let msg = RendezvousMessage::from_json(&text)?;
                    debug!("rendezvous <- {}", msg.kind());
                    return match msg {
                        RendezvousMessage::Error { message } => Err(PortalError::Rendezvous(message)),
                        RendezvousMessage::PeerGone {} => {
                            Err(PortalError::Connectivity("peer left the rendezvous".into()))
                        }
                        other => Ok(other),
                    };
                }
                Some(Ok(WsMessage::Binary(_))) => {
                    return Err(PortalError::Protocol(ProtocolError::Malformed(
                        "binary frame on the control channel".into(),
                    )))
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    return Err(PortalError::Connectivity("rendezvous connection closed".into()))
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// Ask the server for a free channel id to build the password on.
    pub async fn bind(&mut self) -> Result<u32, PortalError> {
        self.send(&RendezvousMessage::SenderBind {}).await?;
        match self.recv().await? {
            RendezvousMessage::Bound { channel } => {
                debug!("bound to channel {}", channel);
                Ok(channel)
            }
            other => Err(unexpected("portal.v1.rendezvous.bound", &other)),
        }
    }

    async fn recv_salt(&mut self) -> Result<Vec<u8>, PortalError> {
        match self.recv().await? {
            RendezvousMessage::Salt { salt } => Ok(salt),
            other => Err(unexpected("portal.v1.rendezvous.salt", &other)),
        }
    }

    /// Run the sender half of the rendezvous.
    ///
    /// Returns the sealed channel (already used for the metadata exchange)
    /// and the receiver's connection info.
    pub async fn establish_sender<P>(
        &mut self,
        password: &Password,
        local: &ConnectionInfo,
    ) -> Result<(CryptoChannel, ConnectionInfo), PortalError>
    where
        P: PakeExchange + 'static,
    {
        let pake = spawn_pake::<P>(password, Role::Sender);

        self.send(&RendezvousMessage::SenderEstablish {
            password_hash: password.channel_hash(),
        })
        .await?;

        match self.recv().await? {
            RendezvousMessage::Approve {} => info!("receiver joined"),
            other => return Err(unexpected("portal.v1.rendezvous.approve", &other)),
        }

        let mut pake = join_pake(pake).await?;
        self.send(&RendezvousMessage::SenderPake {
            bytes: pake.bytes().to_vec(),
        })
        .await?;

        let peer_bytes = match self.recv().await? {
            RendezvousMessage::ReceiverPake { bytes } => bytes,
            other => return Err(unexpected("portal.v1.receiver.pake", &other)),
        };
        pake.update(&peer_bytes)?;

        let salt = self.recv_salt().await?;
        let key = derive_session_key(pake.shared_secret()?, &salt)?;
        let channel = CryptoChannel::for_role(key, Role::Sender);

        self.exchange_info(channel, local).await
    }

    /// Run the receiver half of the rendezvous.
    pub async fn establish_receiver<P>(
        &mut self,
        password: &Password,
        local: &ConnectionInfo,
    ) -> Result<(CryptoChannel, ConnectionInfo), PortalError>
    where
        P: PakeExchange + 'static,
    {
        let pake = spawn_pake::<P>(password, Role::Receiver);

        self.send(&RendezvousMessage::ReceiverEstablish {
            password_hash: password.channel_hash(),
        })
        .await?;

        let peer_bytes = match self.recv().await? {
            RendezvousMessage::SenderPake { bytes } => bytes,
            other => return Err(unexpected("portal.v1.sender.pake", &other)),
        };

        let mut pake = join_pake(pake).await?;
        pake.update(&peer_bytes)?;
        self.send(&RendezvousMessage::ReceiverPake {
            bytes: pake.bytes().to_vec(),
        })
        .await?;

        let salt = self.recv_salt().await?;
        let key = derive_session_key(pake.shared_secret()?, &salt)?;
        let channel = CryptoChannel::for_role(key, Role::Receiver);

        self.exchange_info(channel, local).await
    }

    /// Both sides send their sealed info before reading the peer's, so a
    /// password mismatch fails on both ends.
    async fn exchange_info(
        &mut self,
        mut channel: CryptoChannel,
        local: &ConnectionInfo,
    ) -> Result<(CryptoChannel, ConnectionInfo), PortalError> {
        let sealed = channel.encrypt(&local.to_bytes()?)?;
        let outbound = match self.role {
            Role::Sender => RendezvousMessage::SenderInfo { sealed },
            Role::Receiver => RendezvousMessage::ReceiverInfo { sealed },
        };
        self.send(&outbound).await?;

        let sealed = match (self.role, self.recv().await?) {
            (Role::Sender, RendezvousMessage::ReceiverInfo { sealed }) => sealed,
            (Role::Receiver, RendezvousMessage::SenderInfo { sealed }) => sealed,
            (Role::Sender, other) => return Err(unexpected("portal.v1.receiver.info", &other)),
            (Role::Receiver, other) => return Err(unexpected("portal.v1.sender.info", &other)),
        };
        let peer = ConnectionInfo::from_bytes(&channel.decrypt(&sealed)?)?;
        debug!("peer connection info: {:?}", peer.addr);

        Ok((channel, peer))
    }
}
