//! HMAC-SHA256 message authentication with constant-time verification.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 tag size.
pub const MAC_LENGTH: usize = 32;

/// Compute the tag of `data` under `key`.
pub fn compute(key: &[u8], data: &[u8]) -> Result<[u8; MAC_LENGTH], CryptoError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| {
        CryptoError::InvalidKeyLength {
            expected: MAC_LENGTH,
            got: key.len(),
        }
    })?;
    mac.update(data);

    let tag = mac.finalize().into_bytes();
    let mut out = [0u8; MAC_LENGTH];
    out.copy_from_slice(&tag);
    Ok(out)
}

/// Check `expected` against the tag of `data`, in constant time.
pub fn verify(key: &[u8], data: &[u8], expected: &[u8]) -> Result<(), CryptoError> {
    let actual = compute(key, data)?;

    if bool::from(actual.as_slice().ct_eq(expected)) {
        Ok(())
    } else {
        Err(CryptoError::AuthenticationFailed)
    }
}
