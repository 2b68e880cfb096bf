//! Protocol errors.
//!
//! All errors are terminal. There is no recovery.
//! When an error occurs, the transfer must be failed and keys dropped.

use thiserror::Error;

/// All possible protocol errors.
///
/// Each variant causes immediate termination of the session that raised it.
/// No error is "recoverable" or "retryable".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Received (or attempted to send) a message not allowed in the current state.
    #[error("unexpected message: expected {expected}, got {got}")]
    UnexpectedMessage {
        /// Message type the state machine was waiting for.
        expected: &'static str,
        /// Message type that actually arrived.
        got: &'static str,
    },

    /// Envelope could not be parsed, or carried an unknown type.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// AEAD tag, nonce direction or nonce sequence did not verify.
    #[error("authentication failed")]
    Authentication,

    /// Payload length disagrees with the declared total.
    #[error("payload integrity violated: declared {declared} bytes, got {actual}")]
    Integrity {
        /// Size announced in the sender handshake.
        declared: u64,
        /// Bytes actually observed.
        actual: u64,
    },

    /// Peer speaks a different protocol version.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u32),

    /// The PAKE primitive rejected its input or was driven out of order.
    #[error("key exchange failed: {0}")]
    Pake(String),

    /// Password does not have the expected shape.
    #[error("invalid password: {0}")]
    InvalidPassword(&'static str),

    /// Send counter ran out of nonces.
    #[error("nonce space exhausted")]
    NonceExhausted,

    /// Session has already closed or failed.
    #[error("session terminated")]
    SessionTerminated,
}
