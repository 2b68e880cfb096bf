//! Connection negotiation.
//!
//! Races a direct WebSocket between the peers against the rendezvous relay
//! and hands exactly one connection to the transfer protocol.
//!
//! - Receiver: dials the sender's advertised address. On failure it sends
//!   `relay-request` over the control connection.
//! - Sender: accepts on its listener. A probe only counts once the upgrade
//!   finished and the peer's first frame arrived, so a dial the receiver gave
//!   up on can never win.
//! - Both: wait on the control connection for `relay-ready`.
//!
//! Direct is polled first. The losing branch is dropped with its sockets.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use portal_core::{ConnectionInfo, RendezvousMessage};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{accept_async, connect_async, MaybeTlsStream};

use crate::config::PortalConfig;
use crate::conn::{next_binary, Conn, DirectConn};
use crate::error::PortalError;
use crate::event::ConnectionKind;
use crate::relay::{ControlStream, RelayConn};
use crate::rendezvous::RendezvousSession;

/// Path the receiver dials on the sender's listener.
pub const DIRECT_PATH: &str = "/portal";

type ControlSink = SplitSink<ControlStream, WsMessage>;
type ControlRx = SplitStream<ControlStream>;

/// Result of a race.
#[derive(Debug)]
pub(crate) enum Winner<D, R> {
    Direct(D),
    Relay(R),
}

/// Race `direct` against `relay` until one succeeds or `deadline` passes.
///
/// A branch that fails is disabled and the other keeps running. When both
/// failed, the last error is returned.
pub(crate) async fn race<D, R, FD, FR>(
    direct: FD,
    relay: FR,
    deadline: Duration,
) -> Result<Winner<D, R>, PortalError>
where
    FD: Future<Output = Result<D, PortalError>>,
    FR: Future<Output = Result<R, PortalError>>,
{
    tokio::pin!(direct);
    tokio::pin!(relay);
    let sleep = tokio::time::sleep(deadline);
    tokio::pin!(sleep);

    let mut direct_live = true;
    let mut relay_live = true;

    loop {
        tokio::select! {
            biased;

            result = &mut direct, if direct_live => match result {
                Ok(conn) => return Ok(Winner::Direct(conn)),
                Err(e) => {
                    warn!("direct connection failed: {}", e);
                    direct_live = false;
                    if !relay_live {
                        return Err(e);
                    }
                }
            },
            result = &mut relay, if relay_live => match result {
                Ok(conn) => return Ok(Winner::Relay(conn)),
                Err(e) => {
                    warn!("relay unavailable: {}", e);
                    relay_live = false;
                    if !direct_live {
                        return Err(e);
                    }
                }
            },
            _ = &mut sleep => return Err(PortalError::ConnectionTimeout),
        }
    }
}

/// Wait on the control connection until the server switched it to relay mode.
async fn await_relay_ready(stream: &mut ControlRx) -> Result<(), PortalError> {
    loop {
        let text = match stream.next().await {
            Some(Ok(WsMessage::Text(text))) => text,
            Some(Ok(WsMessage::Close(_))) | None => {
                return Err(PortalError::Connectivity("rendezvous connection closed".into()))
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        };
        match RendezvousMessage::from_json(&text)? {
            RendezvousMessage::RelayReady {} => return Ok(()),
            RendezvousMessage::PeerGone {} => {
                return Err(PortalError::Connectivity("peer left the rendezvous".into()))
            }
            RendezvousMessage::Error { message } => return Err(PortalError::Rendezvous(message)),
            other => debug!("ignoring {} while negotiating", other.kind()),
        }
    }
}

/// Accept probes until one delivers its first frame.
async fn accept_direct(
    listener: &TcpListener,
    probe_timeout: Duration,
) -> Result<DirectConn<TcpStream>, PortalError> {
    loop {
        let (stream, addr) = listener
            .accept()
            .await
            .map_err(|e| PortalError::Connectivity(format!("accept failed: {}", e)))?;
        debug!("direct probe from {}", addr);

        let probe = async {
            let mut ws = accept_async(stream).await?;
            let first = next_binary(&mut ws).await?;
            Ok::<_, PortalError>(DirectConn::with_pending(ws, first))
        };
        match tokio::time::timeout(probe_timeout, probe).await {
            Ok(Ok(conn)) => return Ok(conn),
            Ok(Err(e)) => warn!("dropping direct probe from {}: {}", addr, e),
            Err(_) => warn!("dropping direct probe from {}: timed out", addr),
        }
    }
}

/// Dial the sender. Any failure turns into a relay request.
async fn dial_direct(
    addr: Option<SocketAddr>,
    config: &PortalConfig,
    sink: &mut ControlSink,
) -> Result<DirectConn<MaybeTlsStream<TcpStream>>, PortalError> {
    let attempt = match addr.filter(|_| config.direct) {
        Some(addr) => {
            let url = format!("ws://{}{}", addr, DIRECT_PATH);
            debug!("dialing {}", url);
            match tokio::time::timeout(config.direct_dial_timeout, connect_async(url.as_str())).await {
                Ok(Ok((ws, _response))) => Ok(DirectConn::new(ws)),
                Ok(Err(e)) => Err(PortalError::from(e)),
                Err(_) => Err(PortalError::Connectivity(format!("dial {} timed out", addr))),
            }
        }
        None => Err(PortalError::Connectivity("no direct address to dial".into())),
    };

    if attempt.is_err() {
        info!("direct connection unavailable, requesting relay");
        let request = RendezvousMessage::RelayRequest {}.to_json()?;
        sink.send(WsMessage::Text(request)).await?;
    }
    attempt
}

fn into_relay(sink: ControlSink, stream: ControlRx) -> Result<RelayConn, PortalError> {
    let ws = sink
        .reunite(stream)
        .map_err(|e| PortalError::Connectivity(format!("control connection split: {}", e)))?;
    Ok(RelayConn::new(ws))
}

/// Negotiate the data-plane connection on the sender side.
///
/// `listener` is `None` when direct connections are disabled.
pub async fn negotiate_sender(
    control: RendezvousSession,
    listener: Option<TcpListener>,
    config: &PortalConfig,
) -> Result<(Box<dyn Conn>, ConnectionKind), PortalError> {
    let (sink, mut stream) = control.into_inner().split();

    let winner = {
        let direct = async {
            match &listener {
                Some(listener) => accept_direct(listener, config.direct_dial_timeout).await,
                None => std::future::pending().await,
            }
        };
        let relay = await_relay_ready(&mut stream);
        race(direct, relay, config.negotiation_timeout).await?
    };

    finish(winner, sink, stream)
}

/// Negotiate the data-plane connection on the receiver side.
pub async fn negotiate_receiver(
    control: RendezvousSession,
    peer: &ConnectionInfo,
    config: &PortalConfig,
) -> Result<(Box<dyn Conn>, ConnectionKind), PortalError> {
    let (mut sink, mut stream) = control.into_inner().split();

    let winner = {
        let direct = dial_direct(peer.addr, config, &mut sink);
        let relay = await_relay_ready(&mut stream);
        race(direct, relay, config.negotiation_timeout).await?
    };

    finish(winner, sink, stream)
}

fn finish<D>(
    winner: Winner<D, ()>,
    sink: ControlSink,
    stream: ControlRx,
) -> Result<(Box<dyn Conn>, ConnectionKind), PortalError>
where
    D: Conn + 'static,
{
    match winner {
        Winner::Direct(conn) => {
            info!("direct connection established");
            // Dropping the control halves closes the rendezvous connection.
            Ok((Box::new(conn), ConnectionKind::Direct))
        }
        Winner::Relay(()) => {
            info!("relaying through the rendezvous server");
            Ok((Box::new(into_relay(sink, stream)?), ConnectionKind::Relay))
        }
    }
}
