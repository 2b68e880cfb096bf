//! Sealed channel.
//!
//! Wire format of one sealed frame:
//! ```text
//! +------------------+------------------+------------------------------+
//! | DIRECTION (4B BE)| COUNTER (8B BE)  | CIPHERTEXT || TAG (16B)     |
//! +------------------+------------------+------------------------------+
//! ```
//!
//! The first 12 bytes are the ChaCha20-Poly1305 nonce. Each side seals with
//! its own direction tag and a strictly increasing counter, so both peers can
//! share one key without ever reusing a nonce. The receiving side only accepts
//! the peer's direction tag and the next expected counter.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};

use crate::error::ProtocolError;
use crate::kdf::SessionKey;
use crate::pake::Role;

/// Nonce length (direction + counter).
pub const NONCE_SIZE: usize = 12;

/// Poly1305 tag length.
pub const TAG_SIZE: usize = 16;

/// Which way a frame travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Frames sealed by the sender.
    SenderToReceiver,
    /// Frames sealed by the receiver.
    ReceiverToSender,
}

impl Direction {
    fn tag(self) -> u32 {
        match self {
            Direction::SenderToReceiver => 0x5345_4e44, // "SEND"
            Direction::ReceiverToSender => 0x5245_4356, // "RECV"
        }
    }

    fn reverse(self) -> Self {
        match self {
            Direction::SenderToReceiver => Direction::ReceiverToSender,
            Direction::ReceiverToSender => Direction::SenderToReceiver,
        }
    }
}

impl From<Role> for Direction {
    fn from(role: Role) -> Self {
        match role {
            Role::Sender => Direction::SenderToReceiver,
            Role::Receiver => Direction::ReceiverToSender,
        }
    }
}

/// Authenticated encryption bound to one session key.
///
/// Does not implement `Clone`: duplicating the channel would duplicate the
/// send counter and with it every future nonce.
pub struct CryptoChannel {
    key: SessionKey,
    outbound: Direction,
    send_counter: u64,
    recv_counter: u64,
}

impl std::fmt::Debug for CryptoChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoChannel")
            .field("outbound", &self.outbound)
            .field("send_counter", &self.send_counter)
            .field("recv_counter", &self.recv_counter)
            .finish()
    }
}

impl CryptoChannel {
    /// Build a channel that seals in `outbound` direction.
    pub fn new(key: SessionKey, outbound: Direction) -> Self {
        Self {
            key,
            outbound,
            send_counter: 0,
            recv_counter: 0,
        }
    }

    /// Build the channel for the given protocol role.
    pub fn for_role(key: SessionKey, role: Role) -> Self {
        Self::new(key, Direction::from(role))
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(self.key.as_bytes()))
    }

    fn nonce(direction: Direction, counter: u64) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..4].copy_from_slice(&direction.tag().to_be_bytes());
        nonce[4..].copy_from_slice(&counter.to_be_bytes());
        nonce
    }

    /// Seal `plaintext` into a self-describing frame.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let counter = self.send_counter;
        self.send_counter = counter.checked_add(1).ok_or(ProtocolError::NonceExhausted)?;

        let nonce = Self::nonce(self.outbound, counter);
        let ciphertext = self
            .cipher()
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| ProtocolError::Authentication)?;

        let mut frame = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        frame.extend_from_slice(&nonce);
        frame.extend_from_slice(&ciphertext);
        Ok(frame)
    }

    /// Open a frame sealed by the peer.
    ///
    /// # Errors
    ///
    /// `Authentication` if the frame is truncated, carries our own direction,
    /// is out of sequence, or its tag does not verify.
    pub fn decrypt(&mut self, frame: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        if frame.len() < NONCE_SIZE + TAG_SIZE {
            return Err(ProtocolError::Authentication);
        }

        let expected = Self::nonce(self.outbound.reverse(), self.recv_counter);
        if frame[..NONCE_SIZE] != expected {
            return Err(ProtocolError::Authentication);
        }

        let plaintext = self
            .cipher()
            .decrypt(Nonce::from_slice(&frame[..NONCE_SIZE]), &frame[NONCE_SIZE..])
            .map_err(|_| ProtocolError::Authentication)?;

        self.recv_counter += 1;
        Ok(plaintext)
    }

    /// Direction this channel seals in.
    pub fn outbound(&self) -> Direction {
        self.outbound
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(key: [u8; 32]) -> (CryptoChannel, CryptoChannel) {
        (
            CryptoChannel::for_role(SessionKey::from_bytes(key), Role::Sender),
            CryptoChannel::for_role(SessionKey::from_bytes(key), Role::Receiver),
        )
    }

    #[test]
    fn test_roundtrip_sizes() {
        let (mut sender, mut receiver) = pair([3u8; 32]);
        for len in [0usize, 1, 10, 4096, 1 << 20] {
            let plaintext: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let sealed = sender.encrypt(&plaintext).unwrap();
            assert_eq!(sealed.len(), NONCE_SIZE + len + TAG_SIZE);
            assert_eq!(receiver.decrypt(&sealed).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_both_directions() {
        let (mut sender, mut receiver) = pair([9u8; 32]);
        let a = receiver.encrypt(b"request").unwrap();
        assert_eq!(sender.decrypt(&a).unwrap(), b"request");
        let b = sender.encrypt(b"response").unwrap();
        assert_eq!(receiver.decrypt(&b).unwrap(), b"response");
    }

    #[test]
    fn test_nonces_never_repeat() {
        let (mut sender, _) = pair([1u8; 32]);
        let first = sender.encrypt(b"same").unwrap();
        let second = sender.encrypt(b"same").unwrap();
        assert_ne!(first[..NONCE_SIZE], second[..NONCE_SIZE]);
        assert_ne!(first, second);
    }

    #[test]
    fn test_wrong_key_fails() {
        let mut sender = CryptoChannel::for_role(SessionKey::from_bytes([1u8; 32]), Role::Sender);
        let mut receiver =
            CryptoChannel::for_role(SessionKey::from_bytes([2u8; 32]), Role::Receiver);
        let sealed = sender.encrypt(b"hello").unwrap();
        assert_eq!(receiver.decrypt(&sealed), Err(ProtocolError::Authentication));
    }

    #[test]
    fn test_tampered_frame_fails() {
        let (mut sender, mut receiver) = pair([4u8; 32]);
        let mut sealed = sender.encrypt(b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert_eq!(receiver.decrypt(&sealed), Err(ProtocolError::Authentication));
    }

    #[test]
    fn test_replay_rejected() {
        let (mut sender, mut receiver) = pair([5u8; 32]);
        let sealed = sender.encrypt(b"once").unwrap();
        receiver.decrypt(&sealed).unwrap();
        assert_eq!(receiver.decrypt(&sealed), Err(ProtocolError::Authentication));
    }

    #[test]
    fn test_reflection_rejected() {
        let (mut sender, _) = pair([6u8; 32]);
        let sealed = sender.encrypt(b"mirror").unwrap();
        assert_eq!(sender.decrypt(&sealed), Err(ProtocolError::Authentication));
    }

    #[test]
    fn test_truncated_frame_fails() {
        let (_, mut receiver) = pair([7u8; 32]);
        assert_eq!(receiver.decrypt(&[0u8; 20]), Err(ProtocolError::Authentication));
    }
}
