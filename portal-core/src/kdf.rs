//! Session key derivation.
//!
//! `SessionKey = HKDF-SHA256(salt, pake_secret, "portal v1 session key")`
//!
//! The salt is issued by the rendezvous server once per session, so two
//! sessions never share a key even if the same password is reused.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::ProtocolError;

/// Session key length in bytes.
pub const KEY_SIZE: usize = 32;

/// HKDF info label. Changing it changes every derived key.
const KDF_INFO: &[u8] = b"portal v1 session key";

/// Symmetric key for one transfer. Zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; KEY_SIZE]);

impl SessionKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Derive the session key from the PAKE shared secret and the server salt.
pub fn derive_session_key(shared_secret: &[u8], salt: &[u8]) -> Result<SessionKey, ProtocolError> {
    if shared_secret.is_empty() {
        return Err(ProtocolError::Pake("empty shared secret".into()));
    }
    if salt.is_empty() {
        return Err(ProtocolError::Pake("empty salt".into()));
    }

    let hkdf = Hkdf::<Sha256>::new(Some(salt), shared_secret);
    let mut key = [0u8; KEY_SIZE];
    hkdf.expand(KDF_INFO, &mut key)
        .map_err(|_| ProtocolError::Pake("key derivation failed".into()))?;

    Ok(SessionKey(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivation_is_deterministic() {
        let a = derive_session_key(b"shared secret", &[7u8; 32]).unwrap();
        let b = derive_session_key(b"shared secret", &[7u8; 32]).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_salt_changes_key() {
        let a = derive_session_key(b"shared secret", &[1u8; 32]).unwrap();
        let b = derive_session_key(b"shared secret", &[2u8; 32]).unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_secret_changes_key() {
        let a = derive_session_key(b"secret one", &[1u8; 32]).unwrap();
        let b = derive_session_key(b"secret two", &[1u8; 32]).unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_empty_inputs_rejected() {
        assert!(derive_session_key(&[], &[1u8; 32]).is_err());
        assert!(derive_session_key(b"secret", &[]).is_err());
    }

    #[test]
    fn test_debug_redacts() {
        let key = SessionKey::from_bytes([0xAB; KEY_SIZE]);
        assert_eq!(format!("{:?}", key), "SessionKey(..)");
    }
}
