//! Cryptographic primitives.
//!
//! This module provides:
//! - Key generation and shared secrets (X25519)
//! - Key derivation (HKDF-SHA512)
//! - Authenticated encryption (AES-256-GCM)
//! - Message authentication (HMAC-SHA256)
//! - Identity hashes for routing

pub mod identity;
pub mod kdf;
pub mod keys;
pub mod mac;
pub mod symmetric;

pub use identity::{IdentityHash, IDENTITY_HASH_LENGTH};
pub use kdf::{derive, derive_pair, ZERO_SALT};
pub use keys::{public_key_from_slice, KeyPair, KEY_LENGTH};
pub use mac::MAC_LENGTH;
pub use symmetric::{open, random_nonce, seal, NONCE_LENGTH};
