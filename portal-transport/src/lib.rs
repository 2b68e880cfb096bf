//! Portal Transport
//!
//! Async transport library for Portal file transfers.
//!
//! This crate wraps `portal-core` and drives a transfer end to end:
//! rendezvous and PAKE over the control plane, the direct-vs-relay race,
//! and the sealed transfer protocol over whichever connection won.
//!
//! # Hard Failures
//!
//! Every error is terminal for the session that raised it. The only fallback
//! is the designed one: a receiver that cannot dial the sender directly asks
//! the rendezvous server to relay.
//!
//! - **One outcome**: `Sender::send` and `Receiver::receive` return exactly one
//!   `TransferOutcome` or one `PortalError`.
//! - **Release on exit**: sockets are closed and key material zeroized on
//!   every exit path, by drop if nothing else.
//! - **Best-effort events**: UI events are `try_send` on a bounded channel and
//!   never slow the transfer down.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

pub mod archive;
pub mod config;
pub mod conn;
pub mod error;
pub mod event;
pub mod negotiate;
pub mod relay;
pub mod rendezvous;
pub mod session;
pub mod transfer;

pub use config::PortalConfig;
pub use conn::{Conn, DirectConn};
pub use error::PortalError;
pub use event::{ConnectionKind, SessionEvent};
pub use negotiate::{negotiate_receiver, negotiate_sender};
pub use relay::RelayConn;
pub use rendezvous::RendezvousSession;
pub use session::{Payload, Receiver, Sender, TransferOutcome};
pub use transfer::TransferProtocol;

pub use portal_core::Password;
