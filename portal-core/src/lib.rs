//! Portal Protocol Core
//!
//! Password-authenticated file transfer, minus the network.
//!
//! This crate provides:
//! - A PAKE adapter over SPAKE2 (Ed25519)
//! - Session key derivation from the PAKE secret and a server salt
//! - A sealed channel (ChaCha20-Poly1305, direction-tagged counter nonces)
//! - Control-plane and data-plane message envelopes
//! - The transfer state machine with hard failure semantics
//! - Password and progress helpers used by the collaborators
//!
//! # Invariants
//!
//! - Any protocol violation terminates the transfer
//! - Any authentication failure terminates the transfer
//! - A nonce is never reused under the same key
//! - Key material and passwords are zeroized on drop
//! - No retries, no recovery, no partial acceptance

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

pub mod crypt;
pub mod error;
pub mod kdf;
pub mod message;
pub mod pake;
pub mod password;
pub mod progress;
pub mod state;

pub use crypt::{CryptoChannel, Direction};
pub use error::ProtocolError;
pub use kdf::{derive_session_key, SessionKey};
pub use message::{ConnectionInfo, RendezvousMessage, TransferMessage, PROTOCOL_VERSION};
pub use pake::{PakeExchange, Role, Spake2Exchange};
pub use password::{hash_channel, Password};
pub use progress::{should_emit, ProgressState};
pub use state::{TransferSession, TransferState};
