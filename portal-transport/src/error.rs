//! Transport errors.

use portal_core::ProtocolError;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Errors surfaced to the caller of a transfer.
///
/// All of them are terminal. The session that produced one has already
/// released its sockets and keys.
#[derive(Debug, Error)]
pub enum PortalError {
    /// Rendezvous unreachable, dial or listen failure, peer or socket lost.
    #[error("connectivity error: {0}")]
    Connectivity(String),

    /// Unexpected message, malformed envelope, version mismatch.
    #[error("protocol error: {0}")]
    Protocol(ProtocolError),

    /// A sealed frame did not open.
    #[error("authentication failed: wrong password or corrupted session")]
    Authentication,

    /// Payload length disagrees with the declared total.
    #[error("integrity error: declared {declared} bytes, got {actual}")]
    Integrity {
        /// Size announced by the sender.
        declared: u64,
        /// Bytes actually seen.
        actual: u64,
    },

    /// Neither a direct nor a relay connection came up in time.
    #[error("connection negotiation timed out")]
    ConnectionTimeout,

    /// The rendezvous server rejected the session.
    #[error("rendezvous server error: {0}")]
    Rendezvous(String),

    /// Password does not have the expected shape.
    #[error("invalid password: {0}")]
    InvalidPassword(&'static str),

    /// Reading the payload or writing the received bytes failed.
    #[error("payload error: {0}")]
    Preparation(String),
}

impl From<ProtocolError> for PortalError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Authentication => Self::Authentication,
            ProtocolError::Integrity { declared, actual } => Self::Integrity { declared, actual },
            ProtocolError::InvalidPassword(reason) => Self::InvalidPassword(reason),
            other => Self::Protocol(other),
        }
    }
}

impl From<tungstenite::Error> for PortalError {
    fn from(e: tungstenite::Error) -> Self {
        Self::Connectivity(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_errors_are_routed() {
        assert!(matches!(
            PortalError::from(ProtocolError::Authentication),
            PortalError::Authentication
        ));
        assert!(matches!(
            PortalError::from(ProtocolError::Integrity { declared: 10, actual: 7 }),
            PortalError::Integrity { declared: 10, actual: 7 }
        ));
        assert!(matches!(
            PortalError::from(ProtocolError::InvalidPassword("too few segments")),
            PortalError::InvalidPassword("too few segments")
        ));
        assert!(matches!(
            PortalError::from(ProtocolError::UnsupportedVersion(2)),
            PortalError::Protocol(ProtocolError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn test_authentication_message_is_user_facing() {
        assert!(PortalError::Authentication.to_string().contains("wrong password"));
    }
}
