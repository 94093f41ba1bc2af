//! AES-256-GCM authenticated encryption.
//!
//! Callers supply the nonce. The `*_prefixed` helpers generate a random nonce
//! and carry it in front of the ciphertext: `nonce (12 bytes) || ciphertext`.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::CryptoError;

/// AES-GCM nonce size.
pub const NONCE_LENGTH: usize = 12;

/// AES-GCM authentication tag size.
pub const TAG_LENGTH: usize = 16;

/// AES-256 key size.
pub const CIPHER_KEY_LENGTH: usize = 32;

/// Fresh random nonce from the OS entropy source.
pub fn random_nonce() -> Result<[u8; NONCE_LENGTH], CryptoError> {
    let mut nonce = [0u8; NONCE_LENGTH];
    OsRng
        .try_fill_bytes(&mut nonce)
        .map_err(|e| CryptoError::Entropy(e.to_string()))?;
    Ok(nonce)
}

fn cipher(key: &[u8]) -> Result<Aes256Gcm, CryptoError> {
    Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength {
        expected: CIPHER_KEY_LENGTH,
        got: key.len(),
    })
}

/// Encrypt `plaintext` under `key` with the given nonce. The tag is appended.
pub fn seal(key: &[u8], plaintext: &[u8], nonce: &[u8; NONCE_LENGTH]) -> Result<Vec<u8>, CryptoError> {
    cipher(key)?
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)
}

/// Decrypt and verify `ciphertext` (including its tag).
pub fn open(key: &[u8], ciphertext: &[u8], nonce: &[u8; NONCE_LENGTH]) -> Result<Vec<u8>, CryptoError> {
    let cipher = cipher(key)?;

    if ciphertext.len() < TAG_LENGTH {
        return Err(CryptoError::CiphertextTooShort(ciphertext.len()));
    }

    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::AuthenticationFailed)
}

/// Encrypt under a random nonce, returning `nonce || ciphertext`.
pub fn seal_prefixed(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let nonce = random_nonce()?;
    let ciphertext = seal(key, plaintext, &nonce)?;

    let mut result = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
    result.extend_from_slice(&nonce);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Decrypt data produced by [`seal_prefixed`].
pub fn open_prefixed(key: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    // Minimum: 12 (nonce) + 16 (auth tag)
    if data.len() < NONCE_LENGTH + TAG_LENGTH {
        return Err(CryptoError::CiphertextTooShort(data.len()));
    }

    let (nonce, ciphertext) = data.split_at(NONCE_LENGTH);
    let mut nonce_bytes = [0u8; NONCE_LENGTH];
    nonce_bytes.copy_from_slice(nonce);

    open(key, ciphertext, &nonce_bytes)
}
