//! HKDF-SHA512 key derivation.

use hkdf::Hkdf;
use sha2::Sha512;
use zeroize::Zeroize;

use crate::error::CryptoError;

/// SHA-512 output length; also the length of the all-zero salt.
pub const HASH_LENGTH: usize = 64;

/// Largest output HKDF-SHA512 can produce (255 blocks).
pub const MAX_OUTPUT_LENGTH: usize = 255 * HASH_LENGTH;

/// All-zero salt used for message and authentication keys.
pub const ZERO_SALT: [u8; HASH_LENGTH] = [0u8; HASH_LENGTH];

/// Extract-then-expand `length` bytes from `input_key`.
///
/// A missing salt behaves exactly like [`ZERO_SALT`].
pub fn derive(
    input_key: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    length: usize,
) -> Result<Vec<u8>, CryptoError> {
    if length > MAX_OUTPUT_LENGTH {
        return Err(CryptoError::KeyDerivation(length));
    }

    let hk = Hkdf::<Sha512>::new(salt, input_key);
    let mut okm = vec![0u8; length];
    hk.expand(info, &mut okm)
        .map_err(|_| CryptoError::KeyDerivation(length))?;
    Ok(okm)
}

/// Derive 64 bytes and split them into two 32-byte keys.
pub fn derive_pair(
    input_key: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let hk = Hkdf::<Sha512>::new(salt, input_key);
    let mut okm = [0u8; 64];
    hk.expand(info, &mut okm)
        .map_err(|_| CryptoError::KeyDerivation(okm.len()))?;

    let mut first = [0u8; 32];
    let mut second = [0u8; 32];
    first.copy_from_slice(&okm[..32]);
    second.copy_from_slice(&okm[32..]);
    okm.zeroize();

    Ok((first, second))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic() {
        let a = derive(b"input", Some(b"salt"), b"Chain", 64).unwrap();
        let b = derive(b"input", Some(b"salt"), b"Chain", 64).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_info_separates_outputs() {
        let a = derive(b"input", None, b"Chain", 32).unwrap();
        let b = derive(b"input", None, b"Ratchet", 32).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_missing_salt_equals_zero_salt() {
        let none = derive(b"input", None, b"", 64).unwrap();
        let zero = derive(b"input", Some(&ZERO_SALT), b"", 64).unwrap();
        assert_eq!(none, zero);
    }

    #[test]
    fn test_pair_matches_derive() {
        let full = derive(b"root", Some(b"dh"), b"Ratchet", 64).unwrap();
        let (first, second) = derive_pair(b"root", Some(b"dh"), b"Ratchet").unwrap();
        assert_eq!(&full[..32], &first);
        assert_eq!(&full[32..], &second);
    }

    #[test]
    fn test_length_limit() {
        assert!(derive(b"input", None, b"", MAX_OUTPUT_LENGTH).is_ok());
        assert_eq!(
            derive(b"input", None, b"", MAX_OUTPUT_LENGTH + 1),
            Err(CryptoError::KeyDerivation(MAX_OUTPUT_LENGTH + 1))
        );
    }
}
