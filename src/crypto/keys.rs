//! X25519 key pairs and shared secrets.
//!
//! Key pairs are stored as raw bytes so they can be persisted alongside ratchet
//! state. The private half is zeroized on drop and never printed.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Length of X25519 public keys, private keys and shared secrets.
pub const KEY_LENGTH: usize = 32;

/// An X25519 key pair.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KeyPair {
    public: [u8; KEY_LENGTH],
    private: [u8; KEY_LENGTH],
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Don't expose private key in debug output
        f.debug_struct("KeyPair")
            .field("public", &hex::encode(self.public))
            .field("private", &"[REDACTED]")
            .finish()
    }
}

impl KeyPair {
    /// Generate a fresh key pair from the OS entropy source.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut private = [0u8; KEY_LENGTH];
        OsRng
            .try_fill_bytes(&mut private)
            .map_err(|e| CryptoError::Entropy(e.to_string()))?;

        let pair = Self::from_private(private);
        private.zeroize();
        Ok(pair)
    }

    /// Rebuild a key pair from its private scalar.
    pub fn from_private(private: [u8; KEY_LENGTH]) -> Self {
        let secret = StaticSecret::from(private);
        let public = PublicKey::from(&secret);
        Self {
            public: public.to_bytes(),
            private,
        }
    }

    /// The public half.
    pub fn public_key(&self) -> &[u8; KEY_LENGTH] {
        &self.public
    }

    /// The private half. Callers must not send this anywhere.
    pub fn private_key(&self) -> &[u8; KEY_LENGTH] {
        &self.private
    }

    /// X25519 with the peer's public key.
    ///
    /// Rejects low-order peer keys, which would yield an all-zero secret.
    pub fn shared_secret(&self, peer_public: &[u8; KEY_LENGTH]) -> Result<[u8; KEY_LENGTH], CryptoError> {
        let secret = StaticSecret::from(self.private);
        let shared = secret.diffie_hellman(&PublicKey::from(*peer_public));

        if !shared.was_contributory() {
            return Err(CryptoError::InvalidPublicKey);
        }

        Ok(*shared.as_bytes())
    }
}

/// Copy a 32-byte key out of a slice, checking its length.
pub fn public_key_from_slice(bytes: &[u8]) -> Result<[u8; KEY_LENGTH], CryptoError> {
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength {
            expected: KEY_LENGTH,
            got: bytes.len(),
        })
}
