//! Ratchet-encrypted messages and their wire encodings.
//!
//! A message body on the wire is
//! `public_key (32) || index (8, BE) || nonce || ciphertext || mac (32)`.
//! The server prefixes the sender's identity hash when it delivers a body,
//! and batches are a sequence of `length (8, BE) || sender || body` entries.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::crypto::{IdentityHash, IDENTITY_HASH_LENGTH, KEY_LENGTH, MAC_LENGTH};
use crate::error::{ClientError, CryptoError, ProtocolError, Result};
use crate::ratchet::SessionRatchet;

/// Length of the batch entry prefix.
pub const LENGTH_PREFIX: usize = 8;

const INDEX_LENGTH: usize = 8;

/// Smallest structurally valid body: key, index and MAC.
pub const MIN_BODY_LENGTH: usize = KEY_LENGTH + INDEX_LENGTH + MAC_LENGTH;

/// Routing and ratchet metadata for one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Sender's ratchet public key at encryption time.
    pub public_key: [u8; KEY_LENGTH],
    /// Index on the sender's chain.
    pub index: i64,
    /// Messages on the sender's previous chain. Local only; zero on decode.
    pub prev_chain_count: u64,
}

/// One message, encrypted or decrypted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecureMessage {
    /// Who wrote the message.
    pub sender: IdentityHash,
    /// Who the message is for.
    pub receiver: IdentityHash,
    /// Ratchet header.
    pub header: MessageHeader,
    /// `nonce || ciphertext`, empty until encrypted.
    pub ciphertext: Vec<u8>,
    /// HMAC-SHA256 over `ciphertext`.
    pub mac: [u8; MAC_LENGTH],
    /// Plaintext, present before encryption and after a successful decrypt.
    pub plaintext: Option<Vec<u8>>,
}

impl SecureMessage {
    /// A plaintext message ready to be encrypted.
    pub fn new_plain(sender: IdentityHash, receiver: IdentityHash, plaintext: impl Into<Vec<u8>>) -> Self {
        Self {
            sender,
            receiver,
            header: MessageHeader {
                public_key: [0u8; KEY_LENGTH],
                index: 0,
                prev_chain_count: 0,
            },
            ciphertext: Vec::new(),
            mac: [0u8; MAC_LENGTH],
            plaintext: Some(plaintext.into()),
        }
    }

    /// Plaintext as a byte slice, if known.
    pub fn text(&self) -> Option<&[u8]> {
        self.plaintext.as_deref()
    }

    /// Encrypt the plaintext on the ratchet's sending chain.
    ///
    /// Switches the ratchet to sending first, performing a DH cycle if the
    /// last message went the other way.
    pub fn encrypt(&mut self, ratchet: &mut SessionRatchet) -> Result<()> {
        let plaintext = self
            .plaintext
            .as_deref()
            .ok_or(ClientError::EmptyInput("plaintext"))?;

        ratchet.prepare_send()?;
        let out = ratchet.current_mut().encrypt(plaintext)?;

        self.ciphertext = out.ciphertext;
        self.mac = out.mac;
        self.header = MessageHeader {
            public_key: *ratchet.public_key(),
            index: out.index,
            prev_chain_count: ratchet.prev_chain_count(),
        };
        Ok(())
    }

    /// Decrypt with whichever chain the header's key selects.
    ///
    /// Candidates are the current chain and the retired chains for the same
    /// key, newest first. Chains we have encrypted on are passed over: after
    /// a send cycle our sending chain carries the same peer key as the
    /// receiving chain it retired, and the peer's late messages belong to the
    /// retired one. Every remaining candidate is tried after any error,
    /// `AlreadyProcessed` included. A key matching no chain at all triggers a
    /// DH cycle onto that key; the cycle is kept only if the message then
    /// decrypts.
    ///
    /// When every candidate fails, a replay (`AlreadyProcessed`) is reported
    /// ahead of other errors. A key that selects only our own sending chains
    /// yields `OwnSendingChain`.
    pub fn decrypt(&mut self, ratchet: &mut SessionRatchet) -> Result<()> {
        let public_key = self.header.public_key;
        let index = self.header.index;

        let mut first_error: Option<CryptoError> = None;
        let mut replayed = false;
        let mut record = |err: CryptoError| {
            if matches!(err, CryptoError::AlreadyProcessed(_)) {
                replayed = true;
            }
            first_error.get_or_insert(err);
        };

        let mut matched = false;
        let mut own_sending = false;

        if ratchet.is_current(&public_key) {
            matched = true;
            let chain = ratchet.current_mut();
            if chain.has_encrypted() {
                own_sending = true;
            } else {
                match chain.decrypt(&self.ciphertext, &self.mac, index) {
                    Ok(plaintext) => {
                        self.plaintext = Some(plaintext);
                        return Ok(());
                    }
                    Err(err) => record(err),
                }
            }
        }

        for chain in ratchet.previous_matching_mut(&public_key) {
            matched = true;
            if chain.has_encrypted() {
                own_sending = true;
                continue;
            }
            match chain.decrypt(&self.ciphertext, &self.mac, index) {
                Ok(plaintext) => {
                    self.plaintext = Some(plaintext);
                    return Ok(());
                }
                Err(err) => record(err),
            }
        }

        if !matched {
            debug!(
                peer_key = %hex::encode(public_key),
                "New peer ratchet key, performing DH cycle"
            );

            let mut staged = ratchet.clone();
            staged.ratchet_to_peer(public_key)?;
            let plaintext = staged
                .current_mut()
                .decrypt(&self.ciphertext, &self.mac, index)?;

            *ratchet = staged;
            self.plaintext = Some(plaintext);
            return Ok(());
        }

        if replayed {
            return Err(CryptoError::AlreadyProcessed(index).into());
        }
        let err = match first_error {
            Some(err) => err,
            None if own_sending => CryptoError::OwnSendingChain(index),
            None => CryptoError::AuthenticationFailed,
        };
        Err(err.into())
    }

    /// Encode the body: key, index, ciphertext and MAC.
    pub fn to_body(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(MIN_BODY_LENGTH + self.ciphertext.len());
        body.extend_from_slice(&self.header.public_key);
        body.extend_from_slice(&self.header.index.to_be_bytes());
        body.extend_from_slice(&self.ciphertext);
        body.extend_from_slice(&self.mac);
        body
    }

    /// Payload of a `SendMessage` packet: `receiver || body`.
    pub fn to_send_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(IDENTITY_HASH_LENGTH + MIN_BODY_LENGTH + self.ciphertext.len());
        payload.extend_from_slice(self.receiver.as_bytes());
        payload.extend_from_slice(&self.to_body());
        payload
    }

    /// Payload of a `PushMessage` packet: `sender || body`.
    pub fn to_push_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(IDENTITY_HASH_LENGTH + MIN_BODY_LENGTH + self.ciphertext.len());
        payload.extend_from_slice(self.sender.as_bytes());
        payload.extend_from_slice(&self.to_body());
        payload
    }

    /// Parse a body written by [`to_body`](Self::to_body).
    pub fn parse_body(
        sender: IdentityHash,
        receiver: IdentityHash,
        body: &[u8],
    ) -> std::result::Result<Self, ProtocolError> {
        if body.len() < MIN_BODY_LENGTH {
            return Err(ProtocolError::MalformedMessage(format!(
                "body too short: {} bytes",
                body.len()
            )));
        }

        let (public_key, rest) = body.split_at(KEY_LENGTH);
        let (index, rest) = rest.split_at(INDEX_LENGTH);
        let (ciphertext, mac) = rest.split_at(rest.len() - MAC_LENGTH);

        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(public_key);
        let mut index_bytes = [0u8; INDEX_LENGTH];
        index_bytes.copy_from_slice(index);
        let mut mac_bytes = [0u8; MAC_LENGTH];
        mac_bytes.copy_from_slice(mac);

        Ok(Self {
            sender,
            receiver,
            header: MessageHeader {
                public_key: key,
                index: i64::from_be_bytes(index_bytes),
                prev_chain_count: 0,
            },
            ciphertext: ciphertext.to_vec(),
            mac: mac_bytes,
            plaintext: None,
        })
    }

    /// Parse a server-delivered `sender || body`, addressed to `receiver`.
    pub fn parse_delivered(receiver: IdentityHash, data: &[u8]) -> std::result::Result<Self, ProtocolError> {
        if data.len() < IDENTITY_HASH_LENGTH {
            return Err(ProtocolError::MalformedMessage(format!(
                "missing sender: {} bytes",
                data.len()
            )));
        }

        let (sender, body) = data.split_at(IDENTITY_HASH_LENGTH);
        let sender = IdentityHash::from_slice(sender).ok_or_else(|| {
            ProtocolError::MalformedMessage("invalid sender identity".to_string())
        })?;

        Self::parse_body(sender, receiver, body)
    }
}

/// Messages parsed from a `RequestMessages` response.
#[derive(Debug, Default)]
pub struct ParsedBatch {
    /// Well-formed messages with their position in the batch.
    pub messages: Vec<(usize, SecureMessage)>,
    /// Malformed or truncated entries by position.
    pub failures: Vec<(usize, ProtocolError)>,
}

/// Parse a batch of `length (8, BE) || sender || body` entries.
///
/// A truncated entry ends parsing and is reported at its position.
pub fn parse_batch(receiver: IdentityHash, data: &[u8]) -> ParsedBatch {
    let mut batch = ParsedBatch::default();
    let mut offset = 0;
    let mut position = 0;

    while offset < data.len() {
        let remaining = &data[offset..];
        if remaining.len() < LENGTH_PREFIX {
            batch.failures.push((
                position,
                ProtocolError::MalformedMessage("truncated length prefix".to_string()),
            ));
            break;
        }

        let mut prefix = [0u8; LENGTH_PREFIX];
        prefix.copy_from_slice(&remaining[..LENGTH_PREFIX]);
        let entry_len = usize::try_from(u64::from_be_bytes(prefix)).unwrap_or(usize::MAX);

        let entry_data = &remaining[LENGTH_PREFIX..];
        if entry_data.len() < entry_len {
            batch.failures.push((
                position,
                ProtocolError::MalformedMessage(format!(
                    "truncated entry: need {} bytes, have {}",
                    entry_len,
                    entry_data.len()
                )),
            ));
            break;
        }

        match SecureMessage::parse_delivered(receiver, &entry_data[..entry_len]) {
            Ok(message) => batch.messages.push((position, message)),
            Err(err) => batch.failures.push((position, err)),
        }

        offset += LENGTH_PREFIX + entry_len;
        position += 1;
    }

    batch
}

/// Encode one batch entry; the inverse of what [`parse_batch`] consumes.
pub fn encode_batch_entry(sender: &IdentityHash, body: &[u8]) -> Vec<u8> {
    let entry_len = (IDENTITY_HASH_LENGTH + body.len()) as u64;

    let mut entry = Vec::with_capacity(LENGTH_PREFIX + IDENTITY_HASH_LENGTH + body.len());
    entry.extend_from_slice(&entry_len.to_be_bytes());
    entry.extend_from_slice(sender.as_bytes());
    entry.extend_from_slice(body);
    entry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RatchetConfig;
    use crate::crypto::KeyPair;
    use crate::ratchet::Direction;

    struct Peer {
        id: IdentityHash,
        ratchet: SessionRatchet,
    }

    fn peers() -> (Peer, Peer) {
        peers_with(Direction::Sending, Direction::Receiving)
    }

    fn peers_with(alice_direction: Direction, bob_direction: Direction) -> (Peer, Peer) {
        let alice_keys = KeyPair::generate().unwrap();
        let bob_keys = KeyPair::generate().unwrap();
        let config = RatchetConfig::default();

        let alice = Peer {
            id: IdentityHash::from_handle("alice"),
            ratchet: SessionRatchet::new(
                alice_keys.clone(),
                *bob_keys.public_key(),
                alice_direction,
                &config,
            )
            .unwrap(),
        };
        let bob = Peer {
            id: IdentityHash::from_handle("bob"),
            ratchet: SessionRatchet::new(
                bob_keys,
                *alice_keys.public_key(),
                bob_direction,
                &config,
            )
            .unwrap(),
        };
        (alice, bob)
    }

    fn send(from: &mut Peer, to: &Peer, text: &str) -> SecureMessage {
        let mut message = SecureMessage::new_plain(from.id, to.id, text.as_bytes());
        message.encrypt(&mut from.ratchet).unwrap();
        message
    }

    /// What the receiver sees after the message went over the wire.
    fn deliver(message: &SecureMessage) -> SecureMessage {
        SecureMessage::parse_delivered(message.receiver, &message.to_push_payload()).unwrap()
    }

    fn receive(to: &mut Peer, message: &SecureMessage) -> Result<Vec<u8>> {
        let mut incoming = deliver(message);
        incoming.decrypt(&mut to.ratchet)?;
        Ok(incoming.plaintext.unwrap_or_default())
    }

    #[test]
    fn test_round_trip_in_order() {
        let (mut alice, mut bob) = peers();

        for i in 0..3 {
            let text = format!("hello {}", i);
            let message = send(&mut alice, &bob, &text);
            assert_eq!(message.header.index, i);
            assert_eq!(receive(&mut bob, &message).unwrap(), text.as_bytes());
        }

        assert_eq!(alice.ratchet.ratchet_index(), 0);
        assert_eq!(bob.ratchet.ratchet_index(), 0);
    }

    #[test]
    fn test_direction_flip_and_late_message() {
        let (mut alice, mut bob) = peers();

        let first = send(&mut alice, &bob, "first");
        let late = send(&mut alice, &bob, "late");
        assert_eq!(receive(&mut bob, &first).unwrap(), b"first");

        // Bob replies: exactly one DH cycle, now sending.
        let reply = send(&mut bob, &alice, "reply");
        assert_eq!(bob.ratchet.ratchet_index(), 1);
        assert_eq!(bob.ratchet.direction(), Direction::Sending);
        assert_eq!(reply.header.prev_chain_count, 1);

        let second_reply = send(&mut bob, &alice, "second reply");
        assert_eq!(bob.ratchet.ratchet_index(), 1);

        assert_eq!(receive(&mut alice, &reply).unwrap(), b"reply");
        assert_eq!(alice.ratchet.direction(), Direction::Receiving);
        assert_eq!(alice.ratchet.ratchet_index(), 1);
        assert_eq!(receive(&mut alice, &second_reply).unwrap(), b"second reply");

        // The message Alice sent before the flip still decrypts on Bob's side.
        assert_eq!(receive(&mut bob, &late).unwrap(), b"late");

        // And the conversation keeps going in both directions.
        let answer = send(&mut alice, &bob, "answer");
        assert_eq!(alice.ratchet.ratchet_index(), 2);
        assert_eq!(receive(&mut bob, &answer).unwrap(), b"answer");
        assert_eq!(bob.ratchet.direction(), Direction::Receiving);
    }

    #[test]
    fn test_replay_is_duplicate() {
        let (mut alice, mut bob) = peers();
        let message = send(&mut alice, &bob, "once");

        receive(&mut bob, &message).unwrap();
        let err = receive(&mut bob, &message).unwrap_err();
        assert!(err.is_duplicate());
    }

    #[test]
    fn test_replay_of_late_message_is_duplicate() {
        let (mut alice, mut bob) = peers();

        let first = send(&mut alice, &bob, "first");
        let late = send(&mut alice, &bob, "late");
        receive(&mut bob, &first).unwrap();
        let reply = send(&mut bob, &alice, "reply");
        receive(&mut alice, &reply).unwrap();

        receive(&mut bob, &late).unwrap();
        let err = receive(&mut bob, &late).unwrap_err();
        assert!(err.is_duplicate());
    }

    #[test]
    fn test_garbage_from_unknown_key_does_not_cycle() {
        let (mut alice, mut bob) = peers();
        let mut message = send(&mut alice, &bob, "hi");

        let stranger = KeyPair::generate().unwrap();
        message.header.public_key = *stranger.public_key();

        let err = receive(&mut bob, &message).unwrap_err();
        assert!(matches!(
            err,
            ClientError::Crypto(CryptoError::AuthenticationFailed)
        ));
        assert_eq!(bob.ratchet.ratchet_index(), 0);
        assert_eq!(bob.ratchet.direction(), Direction::Receiving);
    }

    #[test]
    fn test_both_sides_sending_on_one_root_is_not_a_duplicate() {
        let (mut alice, mut bob) = peers_with(Direction::Sending, Direction::Sending);

        let from_alice = send(&mut alice, &bob, "hi bob");
        let from_bob = send(&mut bob, &alice, "hi alice");
        assert_eq!(from_alice.header.index, from_bob.header.index);

        let err = receive(&mut bob, &from_alice).unwrap_err();
        assert!(!err.is_duplicate());
        assert!(matches!(
            err,
            ClientError::Crypto(CryptoError::OwnSendingChain(0))
        ));

        let err = receive(&mut alice, &from_bob).unwrap_err();
        assert!(!err.is_duplicate());
    }

    #[test]
    fn test_initial_directions_let_both_sides_send_first() {
        let alice_keys = KeyPair::generate().unwrap();
        let bob_keys = KeyPair::generate().unwrap();
        let config = RatchetConfig::default();
        let start = |own: &KeyPair, peer: &KeyPair| {
            let direction = Direction::initial(own.public_key(), peer.public_key());
            SessionRatchet::new(own.clone(), *peer.public_key(), direction, &config).unwrap()
        };

        let mut alice = Peer {
            id: IdentityHash::from_handle("alice"),
            ratchet: start(&alice_keys, &bob_keys),
        };
        let mut bob = Peer {
            id: IdentityHash::from_handle("bob"),
            ratchet: start(&bob_keys, &alice_keys),
        };
        assert_ne!(alice.ratchet.direction(), bob.ratchet.direction());

        let from_alice = send(&mut alice, &bob, "hi bob");
        let from_bob = send(&mut bob, &alice, "hi alice");

        assert_eq!(receive(&mut bob, &from_alice).unwrap(), b"hi bob");
        assert_eq!(receive(&mut alice, &from_bob).unwrap(), b"hi alice");

        let next = send(&mut bob, &alice, "again");
        assert_eq!(receive(&mut alice, &next).unwrap(), b"again");
    }

    #[test]
    fn test_encrypt_without_plaintext() {
        let (mut alice, _) = peers();
        let mut message = SecureMessage::new_plain(alice.id, alice.id, "x");
        message.plaintext = None;

        let err = message.encrypt(&mut alice.ratchet).unwrap_err();
        assert!(matches!(err, ClientError::EmptyInput("plaintext")));
    }

    #[test]
    fn test_body_layout() {
        let (mut alice, bob) = peers();
        let message = send(&mut alice, &bob, "layout");
        let body = message.to_body();

        assert_eq!(&body[..32], alice.ratchet.public_key());
        assert_eq!(&body[32..40], &0i64.to_be_bytes());
        assert_eq!(&body[body.len() - 32..], &message.mac);

        let send_payload = message.to_send_payload();
        assert_eq!(&send_payload[..16], bob.id.as_bytes());
        assert_eq!(&send_payload[16..], body.as_slice());

        let parsed = SecureMessage::parse_body(alice.id, bob.id, &body).unwrap();
        assert_eq!(parsed.header.public_key, message.header.public_key);
        assert_eq!(parsed.ciphertext, message.ciphertext);
        assert_eq!(parsed.header.prev_chain_count, 0);
        assert!(parsed.plaintext.is_none());
    }

    #[test]
    fn test_short_body_rejected() {
        let id = IdentityHash::from_handle("x");
        let result = SecureMessage::parse_body(id, id, &[0u8; MIN_BODY_LENGTH - 1]);
        assert!(matches!(result, Err(ProtocolError::MalformedMessage(_))));

        let result = SecureMessage::parse_delivered(id, &[0u8; 10]);
        assert!(matches!(result, Err(ProtocolError::MalformedMessage(_))));
    }

    #[test]
    fn test_parse_batch_reports_positions() {
        let (mut alice, bob) = peers();
        let one = send(&mut alice, &bob, "one");
        let two = send(&mut alice, &bob, "two");

        let mut data = encode_batch_entry(&alice.id, &one.to_body());
        data.extend(encode_batch_entry(&alice.id, &[1, 2, 3]));
        data.extend(encode_batch_entry(&alice.id, &two.to_body()));

        let batch = parse_batch(bob.id, &data);
        let positions: Vec<_> = batch.messages.iter().map(|(i, _)| *i).collect();
        assert_eq!(positions, vec![0, 2]);
        assert_eq!(batch.failures.len(), 1);
        assert_eq!(batch.failures[0].0, 1);

        let (_, first) = &batch.messages[0];
        assert_eq!(first.sender, alice.id);
        assert_eq!(first.receiver, bob.id);
    }

    #[test]
    fn test_parse_batch_stops_at_truncation() {
        let (mut alice, bob) = peers();
        let one = send(&mut alice, &bob, "one");
        let two = send(&mut alice, &bob, "two");

        let mut data = encode_batch_entry(&alice.id, &one.to_body());
        let second = encode_batch_entry(&alice.id, &two.to_body());
        data.extend_from_slice(&second[..second.len() - 5]);

        let batch = parse_batch(bob.id, &data);
        assert_eq!(batch.messages.len(), 1);
        assert_eq!(batch.failures.len(), 1);
        assert_eq!(batch.failures[0].0, 1);
    }

    #[test]
    fn test_parse_empty_batch() {
        let batch = parse_batch(IdentityHash::from_handle("bob"), &[]);
        assert!(batch.messages.is_empty());
        assert!(batch.failures.is_empty());
    }
}
