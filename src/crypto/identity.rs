//! Compact routing identifiers derived from user handles.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Length of an identity hash on the wire.
pub const IDENTITY_HASH_LENGTH: usize = 16;

/// First 16 bytes of SHA-256 over a user handle.
///
/// Routing only; two handles colliding here is not a security boundary.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityHash([u8; IDENTITY_HASH_LENGTH]);

impl IdentityHash {
    /// Hash a user handle.
    pub fn from_handle(handle: impl AsRef<[u8]>) -> Self {
        let digest = Sha256::digest(handle.as_ref());
        let mut bytes = [0u8; IDENTITY_HASH_LENGTH];
        bytes.copy_from_slice(&digest[..IDENTITY_HASH_LENGTH]);
        Self(bytes)
    }

    /// Wrap raw bytes.
    pub const fn from_bytes(bytes: [u8; IDENTITY_HASH_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Parse from a slice of exactly 16 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Self)
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8; IDENTITY_HASH_LENGTH] {
        &self.0
    }
}

impl fmt::Display for IdentityHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for IdentityHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityHash({})", hex::encode(self.0))
    }
}
