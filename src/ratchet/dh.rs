//! Diffie-Hellman session ratchet.
//!
//! A [`SessionRatchet`] owns one key pair and the current [`ChainRatchet`].
//! Every DH cycle mixes a fresh shared secret into the root key, retires the
//! current chain into a bounded history and starts a new one. Retired chains
//! stay available for messages that were in flight when the cycle happened.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use super::chain::ChainRatchet;
use crate::config::RatchetConfig;
use crate::crypto::{kdf, KeyPair};
use crate::error::{ClientError, CryptoError, Result};

/// HKDF label for root key cycling.
const LABEL_RATCHET: &[u8] = b"Ratchet";

/// Which way the conversation last moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// We sent last, or we own the initial chain.
    Sending,
    /// We received last, or the peer owns the initial chain.
    Receiving,
}

impl Direction {
    /// Starting direction for a new contact.
    ///
    /// Both sides compute this from the same two account keys and reach
    /// opposite answers, so only one of them ever encrypts on the initial
    /// chain. The smaller key sends first.
    pub fn initial(own_public_key: &[u8; 32], peer_public_key: &[u8; 32]) -> Self {
        if own_public_key < peer_public_key {
            Direction::Sending
        } else {
            Direction::Receiving
        }
    }
}

/// DH ratchet state for one contact.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRatchet {
    key_pair: KeyPair,
    root_key: [u8; 32],
    child_key: [u8; 32],
    current: ChainRatchet,
    previous: VecDeque<ChainRatchet>,
    previous_limit: usize,
    max_skip: usize,
    ratchet_index: u64,
    direction: Direction,
    prev_chain_count: u64,
}

impl std::fmt::Debug for SessionRatchet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRatchet")
            .field("public_key", &hex::encode(self.key_pair.public_key()))
            .field("current", &self.current)
            .field("previous", &self.previous.len())
            .field("ratchet_index", &self.ratchet_index)
            .field("direction", &self.direction)
            .finish_non_exhaustive()
    }
}

impl Drop for SessionRatchet {
    fn drop(&mut self) {
        self.root_key.zeroize();
        self.child_key.zeroize();
    }
}

impl SessionRatchet {
    /// Start a ratchet with a peer.
    ///
    /// The root key is the X25519 shared secret between `key_pair` and
    /// `peer_public_key`.
    pub fn new(
        key_pair: KeyPair,
        peer_public_key: [u8; 32],
        direction: Direction,
        config: &RatchetConfig,
    ) -> std::result::Result<Self, CryptoError> {
        let root_key = key_pair.shared_secret(&peer_public_key)?;
        let current = ChainRatchet::new(peer_public_key, root_key, config.max_skip);

        Ok(Self {
            key_pair,
            root_key,
            child_key: [0u8; 32],
            current,
            previous: VecDeque::with_capacity(config.previous_chain_limit),
            previous_limit: config.previous_chain_limit,
            max_skip: config.max_skip,
            ratchet_index: 0,
            direction,
            prev_chain_count: 0,
        })
    }

    /// Our current public key, carried in every outgoing message header.
    pub fn public_key(&self) -> &[u8; 32] {
        self.key_pair.public_key()
    }

    /// Number of DH cycles performed.
    pub fn ratchet_index(&self) -> u64 {
        self.ratchet_index
    }

    /// Current direction.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Messages consumed on the most recently retired chain.
    pub fn prev_chain_count(&self) -> u64 {
        self.prev_chain_count
    }

    /// The active chain.
    pub fn current(&self) -> &ChainRatchet {
        &self.current
    }

    /// Mutable access to the active chain.
    pub fn current_mut(&mut self) -> &mut ChainRatchet {
        &mut self.current
    }

    /// Number of retired chains held.
    pub fn previous_len(&self) -> usize {
        self.previous.len()
    }

    /// True if the active chain belongs to `public_key`.
    pub fn is_current(&self, public_key: &[u8; 32]) -> bool {
        self.current.peer_public_key() == public_key
    }

    /// Newest retired chain belonging to `public_key`.
    pub fn find_previous(&self, public_key: &[u8; 32]) -> Option<&ChainRatchet> {
        self.previous
            .iter()
            .rev()
            .find(|chain| chain.peer_public_key() == public_key)
    }

    /// Retired chains belonging to `public_key`, newest first.
    pub fn previous_matching_mut<'a>(
        &'a mut self,
        public_key: &'a [u8; 32],
    ) -> impl Iterator<Item = &'a mut ChainRatchet> + 'a {
        self.previous
            .iter_mut()
            .rev()
            .filter(move |chain| chain.peer_public_key() == public_key)
    }

    /// Perform one DH cycle.
    ///
    /// Mixes the X25519 secret between our current key pair and the peer key
    /// into the root key through HKDF-SHA512 (salt = the shared secret, label
    /// `"Ratchet"`). The first half of the output becomes the new root key
    /// and seeds a fresh chain. The active chain is retired into the bounded
    /// history, dropping the oldest retired chain when the history is full.
    ///
    /// # Arguments
    ///
    /// * `new_peer` - Peer key to cycle onto, or `None` to reuse the active
    ///   chain's peer (the sending side of a direction flip)
    ///
    /// # Returns
    ///
    /// `Ok(())` with `ratchet_index` incremented and `prev_chain_count` set
    /// to the number of messages the retired chain consumed.
    ///
    /// # Errors
    ///
    /// [`CryptoError::InvalidPublicKey`] for a low-order peer key, or a
    /// derivation error. Nothing changes on error.
    pub fn rk_cycle(&mut self, new_peer: Option<[u8; 32]>) -> std::result::Result<(), CryptoError> {
        let peer = new_peer.unwrap_or(*self.current.peer_public_key());

        let mut dh = self.key_pair.shared_secret(&peer)?;
        let derived = kdf::derive_pair(&self.root_key, Some(&dh), LABEL_RATCHET);
        dh.zeroize();
        let (root_key, child_key) = derived?;

        let fresh = ChainRatchet::new(peer, root_key, self.max_skip);
        let retired = std::mem::replace(&mut self.current, fresh);
        self.prev_chain_count = retired.consumed_count();

        self.previous.push_back(retired);
        while self.previous.len() > self.previous_limit {
            self.previous.pop_front();
        }

        self.root_key = root_key;
        self.child_key = child_key;
        self.ratchet_index += 1;
        Ok(())
    }

    /// Switch to sending before an encrypt.
    ///
    /// When the last message went the other way, a fresh key pair is generated
    /// and one DH cycle is performed against the current peer.
    pub fn prepare_send(&mut self) -> std::result::Result<(), CryptoError> {
        if self.direction == Direction::Sending {
            return Ok(());
        }

        let mut staged = self.clone();
        staged.key_pair = KeyPair::generate()?;
        staged.direction = Direction::Sending;
        staged.rk_cycle(None)?;

        *self = staged;
        Ok(())
    }

    /// Cycle onto a peer key not seen before and switch to receiving.
    pub fn ratchet_to_peer(&mut self, peer_public_key: [u8; 32]) -> std::result::Result<(), CryptoError> {
        self.rk_cycle(Some(peer_public_key))?;
        self.direction = Direction::Receiving;
        Ok(())
    }

    /// Serialize the full state, including retired chains and skipped keys.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| ClientError::Serialization(e.to_string()))
    }

    /// Restore state written by [`to_bytes`](Self::to_bytes).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| ClientError::Serialization(e.to_string()))
    }
}
