//! PAKE adapter.
//!
//! This module wraps the `spake2` crate behind a four-call capability set:
//! init, bytes, update, shared secret. The curve math stays inside `spake2`.
//!
//! # Properties
//!
//! - The sender is SPAKE2 side A, the receiver side B
//! - Exactly one message per side
//! - A wrong password is NOT detected here: both sides still get a secret,
//!   the secrets just differ. Detection happens at the first sealed frame.
//! - The secret is zeroized on drop

use spake2::{Ed25519Group, Identity, Password as SpakePassword, Spake2};
use zeroize::Zeroizing;

use crate::error::ProtocolError;
use crate::password::Password;

const SENDER_IDENTITY: &[u8] = b"portal-sender";
const RECEIVER_IDENTITY: &[u8] = b"portal-receiver";

/// Role in the transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Offers the payload. Generates the password.
    Sender,
    /// Fetches the payload. Types the password.
    Receiver,
}

/// Capability set of an opaque password-authenticated key exchange.
pub trait PakeExchange: Send + Sized {
    /// Start the exchange. May be CPU-heavy; run it off the I/O path.
    fn init(password: &Password, role: Role) -> Result<Self, ProtocolError>;

    /// Local exchange bytes to hand to the peer.
    fn bytes(&self) -> &[u8];

    /// Absorb the peer's exchange bytes. Callable once.
    fn update(&mut self, peer_bytes: &[u8]) -> Result<(), ProtocolError>;

    /// Shared secret. Only available after `update`.
    fn shared_secret(&self) -> Result<&[u8], ProtocolError>;
}

/// SPAKE2 over Ed25519.
pub struct Spake2Exchange {
    role: Role,
    state: Option<Spake2<Ed25519Group>>,
    outbound: Vec<u8>,
    secret: Option<Zeroizing<Vec<u8>>>,
}

impl std::fmt::Debug for Spake2Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Spake2Exchange")
            .field("role", &self.role)
            .field("finished", &self.secret.is_some())
            .finish()
    }
}

impl Spake2Exchange {
    /// Role this exchange was started with.
    pub fn role(&self) -> Role {
        self.role
    }
}

impl PakeExchange for Spake2Exchange {
    fn init(password: &Password, role: Role) -> Result<Self, ProtocolError> {
        let pw = SpakePassword::new(password.as_str().as_bytes());
        let id_a = Identity::new(SENDER_IDENTITY);
        let id_b = Identity::new(RECEIVER_IDENTITY);

        let (state, outbound) = match role {
            Role::Sender => Spake2::<Ed25519Group>::start_a(&pw, &id_a, &id_b),
            Role::Receiver => Spake2::<Ed25519Group>::start_b(&pw, &id_a, &id_b),
        };

        Ok(Self {
            role,
            state: Some(state),
            outbound,
            secret: None,
        })
    }

    fn bytes(&self) -> &[u8] {
        &self.outbound
    }

    fn update(&mut self, peer_bytes: &[u8]) -> Result<(), ProtocolError> {
        let state = self
            .state
            .take()
            .ok_or_else(|| ProtocolError::Pake("exchange already finished".into()))?;

        let secret = state
            .finish(peer_bytes)
            .map_err(|e| ProtocolError::Pake(format!("{:?}", e)))?;

        self.secret = Some(Zeroizing::new(secret));
        Ok(())
    }

    fn shared_secret(&self) -> Result<&[u8], ProtocolError> {
        self.secret
            .as_ref()
            .map(|s| s.as_slice())
            .ok_or_else(|| ProtocolError::Pake("exchange not finished".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(sender_pw: &str, receiver_pw: &str) -> (Vec<u8>, Vec<u8>) {
        let mut sender =
            Spake2Exchange::init(&Password::parse(sender_pw).unwrap(), Role::Sender).unwrap();
        let mut receiver =
            Spake2Exchange::init(&Password::parse(receiver_pw).unwrap(), Role::Receiver).unwrap();

        let to_receiver = sender.bytes().to_vec();
        let to_sender = receiver.bytes().to_vec();
        receiver.update(&to_receiver).unwrap();
        sender.update(&to_sender).unwrap();

        (
            sender.shared_secret().unwrap().to_vec(),
            receiver.shared_secret().unwrap().to_vec(),
        )
    }

    #[test]
    fn test_same_password_same_secret() {
        let (a, b) = run("correct-horse-battery", "correct-horse-battery");
        assert_eq!(a, b);
        assert!(!a.is_empty());
    }

    #[test]
    fn test_different_password_different_secret() {
        let (a, b) = run("correct-horse-battery", "correct-horse-staple");
        assert_ne!(a, b);
    }

    #[test]
    fn test_fresh_exchange_each_time() {
        let (a, _) = run("42-tiger-lamp-orbit", "42-tiger-lamp-orbit");
        let (b, _) = run("42-tiger-lamp-orbit", "42-tiger-lamp-orbit");
        assert_ne!(a, b);
    }

    #[test]
    fn test_secret_before_update_fails() {
        let pw = Password::parse("correct-horse-battery").unwrap();
        let exchange = Spake2Exchange::init(&pw, Role::Sender).unwrap();
        assert!(exchange.shared_secret().is_err());
    }

    #[test]
    fn test_double_update_fails() {
        let pw = Password::parse("correct-horse-battery").unwrap();
        let mut sender = Spake2Exchange::init(&pw, Role::Sender).unwrap();
        let receiver = Spake2Exchange::init(&pw, Role::Receiver).unwrap();
        sender.update(receiver.bytes()).unwrap();
        assert!(sender.update(receiver.bytes()).is_err());
    }

    #[test]
    fn test_garbage_peer_bytes_rejected() {
        let pw = Password::parse("correct-horse-battery").unwrap();
        let mut sender = Spake2Exchange::init(&pw, Role::Sender).unwrap();
        assert!(matches!(sender.update(&[1, 2, 3]), Err(ProtocolError::Pake(_))));
    }
}
