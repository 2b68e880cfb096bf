//! Transfer state machine.
//!
//! States: AWAITING_HANDSHAKE → READY → TRANSFERRING → AWAITING_CLOSE → CLOSED
//!
//! Message order, seen from the wire:
//! ```text
//! receiver  ── receiver.handshake{version} ──▶  sender
//! receiver  ◀── sender.handshake{name,size} ──  sender     READY
//! receiver  ── receiver.request-payload ────▶  sender     TRANSFERRING
//! receiver  ◀── sender.payload-chunk × N ─────  sender
//! receiver  ◀── sender.payload-end ───────────  sender     AWAITING_CLOSE
//! receiver  ── receiver.closing ────────────▶  sender
//! receiver  ◀── sender.closing ───────────────  sender     CLOSED
//! ```
//!
//! Both peers run the same machine and feed it every message they send and
//! every message they receive. Any violation transitions to FAILED.
//! No retries. No recovery.

use crate::error::ProtocolError;
use crate::message::{TransferMessage, PROTOCOL_VERSION};
use crate::pake::Role;

/// Transfer state enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Version and payload metadata not yet exchanged.
    AwaitingHandshake,
    /// Handshake complete, payload not requested yet.
    Ready,
    /// Payload chunks in flight.
    Transferring,
    /// Payload complete, close messages pending.
    AwaitingClose,
    /// Transfer finished. Final state.
    Closed,
    /// Transfer failed. Final state.
    Failed,
}

/// One side of a transfer.
///
/// Holds no keys and does no I/O; the driver calls [`on_send`] before
/// sealing a message and [`on_receive`] after opening one.
///
/// [`on_send`]: TransferSession::on_send
/// [`on_receive`]: TransferSession::on_receive
#[derive(Debug)]
pub struct TransferSession {
    role: Role,
    state: TransferState,
    // First message of a two-message step already seen.
    half_step: bool,
    declared: Option<u64>,
    transferred: u64,
}

impl TransferSession {
    /// Create the sender side.
    pub fn new_sender() -> Self {
        Self::new(Role::Sender)
    }

    /// Create the receiver side.
    pub fn new_receiver() -> Self {
        Self::new(Role::Receiver)
    }

    fn new(role: Role) -> Self {
        Self {
            role,
            state: TransferState::AwaitingHandshake,
            half_step: false,
            declared: None,
            transferred: 0,
        }
    }

    /// Get current state.
    pub fn state(&self) -> TransferState {
        self.state
    }

    /// Get role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Payload size announced in the sender handshake.
    pub fn declared_size(&self) -> Option<u64> {
        self.declared
    }

    /// Payload bytes seen so far.
    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    /// True once the session reached `Closed` or `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, TransferState::Closed | TransferState::Failed)
    }

    /// Validate a message this side is about to send.
    pub fn on_send(&mut self, msg: &TransferMessage) -> Result<(), ProtocolError> {
        let from_sender = self.role == Role::Sender;
        self.step(from_sender, msg)
    }

    /// Validate a message this side just received.
    pub fn on_receive(&mut self, msg: &TransferMessage) -> Result<(), ProtocolError> {
        let from_sender = self.role == Role::Receiver;
        self.step(from_sender, msg)
    }

    /// Fail the session. Used for errors outside the state machine
    /// (decryption, I/O).
    pub fn fail(&mut self) {
        if self.state != TransferState::Closed {
            self.state = TransferState::Failed;
        }
    }

    fn step(&mut self, from_sender: bool, msg: &TransferMessage) -> Result<(), ProtocolError> {
        if self.is_terminal() {
            return Err(ProtocolError::SessionTerminated);
        }

        let result = self.transition(from_sender, msg);
        if result.is_err() {
            self.state = TransferState::Failed;
        }
        result
    }

    fn transition(&mut self, from_sender: bool, msg: &TransferMessage) -> Result<(), ProtocolError> {
        use TransferMessage as M;
        use TransferState as S;

        match (self.state, self.half_step, from_sender, msg) {
            (S::AwaitingHandshake, false, false, M::ReceiverHandshake { version }) => {
                if *version != PROTOCOL_VERSION {
                    return Err(ProtocolError::UnsupportedVersion(*version));
                }
                self.half_step = true;
            }
            (S::AwaitingHandshake, true, true, M::SenderHandshake { size, .. }) => {
                self.declared = Some(*size);
                self.half_step = false;
                self.state = S::Ready;
            }
            (S::Ready, _, false, M::RequestPayload {}) => {
                self.state = S::Transferring;
            }
            (S::Transferring, _, true, M::PayloadChunk { data }) => {
                let declared = self.declared.unwrap_or(0);
                let actual = self.transferred.saturating_add(data.len() as u64);
                if actual > declared {
                    return Err(ProtocolError::Integrity { declared, actual });
                }
                self.transferred = actual;
            }
            (S::Transferring, _, true, M::PayloadEnd {}) => {
                let declared = self.declared.unwrap_or(0);
                if self.transferred != declared {
                    return Err(ProtocolError::Integrity {
                        declared,
                        actual: self.transferred,
                    });
                }
                self.state = S::AwaitingClose;
            }
            (S::AwaitingClose, false, false, M::ReceiverClosing {}) => {
                self.half_step = true;
            }
            (S::AwaitingClose, true, true, M::SenderClosing {}) => {
                self.half_step = false;
                self.state = S::Closed;
            }
            _ => {
                return Err(ProtocolError::UnexpectedMessage {
                    expected: self.expected(),
                    got: msg.kind(),
                })
            }
        }
        Ok(())
    }

    fn expected(&self) -> &'static str {
        match (self.state, self.half_step) {
            (TransferState::AwaitingHandshake, false) => "portal.v1.receiver.handshake",
            (TransferState::AwaitingHandshake, true) => "portal.v1.sender.handshake",
            (TransferState::Ready, _) => "portal.v1.receiver.request-payload",
            (TransferState::Transferring, _) => "portal.v1.sender.payload-chunk",
            (TransferState::AwaitingClose, false) => "portal.v1.receiver.closing",
            (TransferState::AwaitingClose, true) => "portal.v1.sender.closing",
            (TransferState::Closed, _) | (TransferState::Failed, _) => "nothing",
        }
    }
}
