//! Symmetric chain ratchet.
//!
//! Each message uses a unique key derived from the chain, and the chain
//! advances after each use. Keys for indices skipped by out-of-order delivery
//! are buffered until their message arrives, bounded by `max_skip`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::crypto::{kdf, mac, symmetric, ZERO_SALT};
use crate::error::CryptoError;

/// HKDF label for chain advancement.
const LABEL_CHAIN: &[u8] = b"Chain";

/// Output of [`ChainRatchet::encrypt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainCiphertext {
    /// `nonce || ciphertext`.
    pub ciphertext: Vec<u8>,
    /// HMAC-SHA256 over `ciphertext`.
    pub mac: [u8; mac::MAC_LENGTH],
    /// Index of the message on this chain.
    pub index: i64,
}

/// One direction of a conversation between two DH cycles.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainRatchet {
    peer_public_key: [u8; 32],
    root_key: [u8; 32],
    chain_key: Option<[u8; 32]>,
    skipped_keys: BTreeMap<i64, [u8; 32]>,
    max_skip: usize,
    last_consumed_index: i64,
    encrypted: bool,
}

impl std::fmt::Debug for ChainRatchet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainRatchet")
            .field("peer_public_key", &hex::encode(self.peer_public_key))
            .field("last_consumed_index", &self.last_consumed_index)
            .field("skipped", &self.skipped_keys.len())
            .field("encrypted", &self.encrypted)
            .finish_non_exhaustive()
    }
}

impl Drop for ChainRatchet {
    fn drop(&mut self) {
        self.root_key.zeroize();
        self.chain_key.zeroize();
        for key in self.skipped_keys.values_mut() {
            key.zeroize();
        }
    }
}

impl ChainRatchet {
    /// Start a chain from `root_key`. The chain key is derived on first use.
    pub fn new(peer_public_key: [u8; 32], root_key: [u8; 32], max_skip: usize) -> Self {
        Self {
            peer_public_key,
            root_key,
            chain_key: None,
            skipped_keys: BTreeMap::new(),
            max_skip,
            last_consumed_index: -1,
            encrypted: false,
        }
    }

    /// Public key of the peer this chain was created for.
    pub fn peer_public_key(&self) -> &[u8; 32] {
        &self.peer_public_key
    }

    /// Highest index consumed so far, `-1` before the first message.
    pub fn last_consumed_index(&self) -> i64 {
        self.last_consumed_index
    }

    /// Number of messages consumed on this chain.
    pub fn consumed_count(&self) -> u64 {
        u64::try_from(self.last_consumed_index + 1).unwrap_or(0)
    }

    /// True once this chain has encrypted a message. Such a chain only sends.
    pub fn has_encrypted(&self) -> bool {
        self.encrypted
    }

    /// Number of buffered keys for skipped indices.
    pub fn skipped_count(&self) -> usize {
        self.skipped_keys.len()
    }

    /// Derive the next message key and chain key without committing them.
    fn next_keys(&self) -> Result<([u8; 32], [u8; 32]), CryptoError> {
        let input = self.chain_key.as_ref().unwrap_or(&self.root_key);
        kdf::derive_pair(input, None, LABEL_CHAIN)
    }

    /// Advance the chain and return the next message key.
    pub fn advance(&mut self) -> Result<[u8; 32], CryptoError> {
        let (message_key, chain_key) = self.next_keys()?;
        self.chain_key = Some(chain_key);
        Ok(message_key)
    }

    /// Encrypt the next message on this chain.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<ChainCiphertext, CryptoError> {
        let (mut message_key, chain_key) = self.next_keys()?;
        let index = self.last_consumed_index + 1;

        let sealed = seal_with_key(&message_key, plaintext);
        message_key.zeroize();
        let (ciphertext, mac) = sealed?;

        self.chain_key = Some(chain_key);
        self.last_consumed_index = index;
        self.encrypted = true;

        Ok(ChainCiphertext {
            ciphertext,
            mac,
            index,
        })
    }

    /// Decrypt the message at `index`.
    ///
    /// A key buffered for a skipped index is used and then forgotten. An
    /// index past the next expected one first derives and buffers the keys
    /// for every index in between, evicting the oldest buffered keys once
    /// more than `max_skip` are held.
    ///
    /// # Arguments
    ///
    /// * `ciphertext` - `nonce || AES-GCM ciphertext` as produced by [`encrypt`](Self::encrypt)
    /// * `mac` - HMAC-SHA256 tag over `ciphertext`
    /// * `index` - Position of the message on this chain
    ///
    /// # Returns
    ///
    /// The plaintext. The chain then counts `index` as consumed.
    ///
    /// # Errors
    ///
    /// * [`CryptoError::AlreadyProcessed`] for an index already consumed
    ///   and not buffered
    /// * [`CryptoError::TooManySkipped`] when the gap exceeds `max_skip`
    /// * [`CryptoError::AuthenticationFailed`] when the MAC or AEAD tag fails
    ///
    /// On any error the chain is left exactly as it was.
    pub fn decrypt(&mut self, ciphertext: &[u8], mac: &[u8], index: i64) -> Result<Vec<u8>, CryptoError> {
        if let Some(key) = self.skipped_keys.get(&index) {
            let plaintext = open_with_key(key, ciphertext, mac)?;
            if let Some(mut key) = self.skipped_keys.remove(&index) {
                key.zeroize();
            }
            return Ok(plaintext);
        }

        if index < 0 {
            return Err(CryptoError::InvalidIndex(index));
        }

        let next = self.last_consumed_index + 1;
        if index < next {
            return Err(CryptoError::AlreadyProcessed(index));
        }

        let gap = (index - next) as u64;
        if gap > self.max_skip as u64 {
            return Err(CryptoError::TooManySkipped {
                max: self.max_skip,
                requested: usize::try_from(gap).unwrap_or(usize::MAX),
            });
        }

        let mut staged = self.clone();
        for skipped in next..index {
            let key = staged.advance()?;
            staged.store_skipped(skipped, key);
        }

        let mut message_key = staged.advance()?;
        staged.last_consumed_index = index;

        let opened = open_with_key(&message_key, ciphertext, mac);
        message_key.zeroize();
        let plaintext = opened?;

        *self = staged;
        Ok(plaintext)
    }

    fn store_skipped(&mut self, index: i64, key: [u8; 32]) {
        self.skipped_keys.insert(index, key);

        while self.skipped_keys.len() > self.max_skip {
            match self.skipped_keys.pop_first() {
                Some((_, mut evicted)) => evicted.zeroize(),
                None => break,
            }
        }
    }
}

/// Split a message key into encryption and authentication keys.
fn message_subkeys(message_key: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    kdf::derive_pair(message_key, Some(&ZERO_SALT), b"")
}

fn seal_with_key(
    message_key: &[u8; 32],
    plaintext: &[u8],
) -> Result<(Vec<u8>, [u8; mac::MAC_LENGTH]), CryptoError> {
    let (mut enc_key, mut auth_key) = message_subkeys(message_key)?;
    let result = seal_with_subkeys(&enc_key, &auth_key, plaintext);
    enc_key.zeroize();
    auth_key.zeroize();
    result
}

fn seal_with_subkeys(
    enc_key: &[u8; 32],
    auth_key: &[u8; 32],
    plaintext: &[u8],
) -> Result<(Vec<u8>, [u8; mac::MAC_LENGTH]), CryptoError> {
    let nonce = symmetric::random_nonce()?;
    let sealed = symmetric::seal(enc_key, plaintext, &nonce)?;

    let mut data = Vec::with_capacity(nonce.len() + sealed.len());
    data.extend_from_slice(&nonce);
    data.extend_from_slice(&sealed);

    let tag = mac::compute(auth_key, &data)?;
    Ok((data, tag))
}

fn open_with_key(message_key: &[u8; 32], data: &[u8], tag: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < symmetric::NONCE_LENGTH + symmetric::TAG_LENGTH {
        return Err(CryptoError::CiphertextTooShort(data.len()));
    }

    let (mut enc_key, mut auth_key) = message_subkeys(message_key)?;

    let result = mac::verify(&auth_key, data, tag).and_then(|()| {
        let (nonce, ciphertext) = data.split_at(symmetric::NONCE_LENGTH);
        let mut nonce_bytes = [0u8; symmetric::NONCE_LENGTH];
        nonce_bytes.copy_from_slice(nonce);
        symmetric::open(&enc_key, ciphertext, &nonce_bytes)
    });

    enc_key.zeroize();
    auth_key.zeroize();
    result
}
