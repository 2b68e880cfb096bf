//! UI events.
//!
//! Events go out on a bounded channel with `try_send`. A slow or absent
//! consumer loses events; it never stalls the transfer.

use std::fmt;

use log::debug;
use tokio::sync::mpsc;

/// Which data-plane path won the negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// Peer-to-peer WebSocket.
    Direct,
    /// Frames forwarded by the rendezvous server.
    Relay,
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => f.write_str("direct"),
            Self::Relay => f.write_str("relay"),
        }
    }
}

/// Progress of one session, for whoever renders it.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Connected to the rendezvous server.
    Ready,
    /// Password the receiver has to type.
    Password(String),
    /// Payload metadata.
    FileInfo {
        /// Payload name.
        name: String,
        /// Payload size in bytes.
        size: u64,
    },
    /// Data-plane connection is up.
    Connected(ConnectionKind),
    /// Fraction of the payload transferred, `0.0..=1.0`.
    Progress(f64),
    /// The session failed.
    Error(String),
    /// The session finished.
    Done,
}

/// Sending half of the event channel. A no-op when nobody listens.
#[derive(Debug, Clone, Default)]
pub(crate) struct EventSink {
    tx: Option<mpsc::Sender<SessionEvent>>,
}

impl EventSink {
    pub(crate) fn new(tx: mpsc::Sender<SessionEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        if let Some(tx) = &self.tx {
            if let Err(e) = tx.try_send(event) {
                debug!("event dropped: {}", e);
            }
        }
    }
}
