//! Transport configuration.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Rendezvous server used when none is configured.
pub const DEFAULT_RENDEZVOUS_URL: &str = "ws://127.0.0.1:8080";

/// Upper bound on the whole direct-vs-relay race.
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on one direct dial (and on one inbound probe).
pub const DEFAULT_DIRECT_DIAL_TIMEOUT: Duration = Duration::from_secs(3);

/// Payload bytes per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Configuration shared by [`Sender`](crate::Sender) and
/// [`Receiver`](crate::Receiver).
#[derive(Debug, Clone)]
pub struct PortalConfig {
    /// Rendezvous server base URL (e.g. "ws://relay.example:8080").
    pub rendezvous_url: String,
    /// Deadline for producing a data-plane connection.
    pub negotiation_timeout: Duration,
    /// Deadline for a single direct dial.
    pub direct_dial_timeout: Duration,
    /// Where the sender listens for direct connections.
    pub listen_addr: SocketAddr,
    /// Address the sender advertises instead of the detected one.
    pub advertise_addr: Option<SocketAddr>,
    /// Payload bytes per chunk.
    pub chunk_size: usize,
    /// Try a direct connection before falling back to the relay.
    pub direct: bool,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self::new(DEFAULT_RENDEZVOUS_URL)
    }
}

impl PortalConfig {
    /// Create a configuration for the given rendezvous server.
    pub fn new(rendezvous_url: impl Into<String>) -> Self {
        Self {
            rendezvous_url: rendezvous_url.into(),
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            direct_dial_timeout: DEFAULT_DIRECT_DIAL_TIMEOUT,
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            advertise_addr: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            direct: true,
        }
    }

    /// Set the negotiation deadline.
    pub fn with_negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = timeout;
        self
    }

    /// Set the direct dial deadline.
    pub fn with_direct_dial_timeout(mut self, timeout: Duration) -> Self {
        self.direct_dial_timeout = timeout;
        self
    }

    /// Set the sender's listen address.
    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    /// Advertise `addr` to the receiver instead of the detected address.
    pub fn with_advertise_addr(mut self, addr: SocketAddr) -> Self {
        self.advertise_addr = Some(addr);
        self
    }

    /// Set the chunk size. Zero is treated as one.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Skip the direct attempt and always relay.
    pub fn relay_only(mut self) -> Self {
        self.direct = false;
        self
    }

    pub(crate) fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.rendezvous_url.trim_end_matches('/'), path)
    }
}
