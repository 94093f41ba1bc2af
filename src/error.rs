//! Error types.
//!
//! Errors are grouped by where they originate: the cryptographic engine, the
//! wire protocol, the transport, and the persistent store. [`ClientError`]
//! wraps all of them for the session façade.

use std::time::Duration;

use thiserror::Error;

use crate::crypto::IdentityHash;
use crate::protocol::PacketType;

/// Errors raised by key agreement, key derivation, the AEAD and the ratchets.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// MAC or AEAD tag did not verify.
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// Too many message keys would have to be skipped.
    #[error("Too many skipped messages (max: {max}, requested: {requested})")]
    TooManySkipped {
        /// Maximum allowed skipped messages.
        max: usize,
        /// Number of messages the call would have skipped.
        requested: usize,
    },

    /// The message index was already consumed on this chain.
    #[error("Message index already processed: {0}")]
    AlreadyProcessed(i64),

    /// The header selects only chains we have encrypted on, so the message
    /// cannot be ours to read.
    #[error("Message index {0} addresses one of our own sending chains")]
    OwnSendingChain(i64),

    /// Negative or otherwise unusable message index.
    #[error("Invalid message index: {0}")]
    InvalidIndex(i64),

    /// A key had the wrong length.
    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength {
        /// Expected key length in bytes.
        expected: usize,
        /// Actual key length in bytes.
        got: usize,
    },

    /// Peer public key is a low-order point.
    #[error("Invalid peer public key")]
    InvalidPublicKey,

    /// Requested more output than HKDF can produce.
    #[error("Key derivation failed for {0} bytes")]
    KeyDerivation(usize),

    /// The AEAD refused to encrypt (plaintext too long).
    #[error("Encryption failed")]
    EncryptionFailed,

    /// Ciphertext too short to contain a nonce and tag.
    #[error("Ciphertext too short: {0} bytes")]
    CiphertextTooShort(usize),

    /// The operating system entropy source failed.
    #[error("Entropy source failed: {0}")]
    Entropy(String),
}

/// Errors in frame or payload structure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame shorter than the fixed header.
    #[error("Frame too short: {0} bytes")]
    FrameTooShort(usize),

    /// Frame or payload larger than the configured limit.
    #[error("Frame too large: {len} bytes (max: {max})")]
    FrameTooLarge {
        /// Observed length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Unknown packet type byte.
    #[error("Unknown packet type: {0}")]
    UnknownPacketType(u8),

    /// Protocol version mismatch.
    #[error("Protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch {
        /// Expected protocol version.
        expected: u8,
        /// Received protocol version.
        got: u8,
    },

    /// The first frame after connecting was not a handshake.
    #[error("Expected handshake, got {0:?}")]
    UnexpectedHandshake(PacketType),

    /// The server answered with an `Error` frame.
    #[error("Server error: {0}")]
    Server(String),

    /// A message body or batch entry could not be parsed.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// A response payload had an unexpected shape.
    #[error("Malformed {what} response: expected {expected} bytes, got {got}")]
    MalformedResponse {
        /// Which response was being parsed.
        what: &'static str,
        /// Expected payload length.
        expected: usize,
        /// Actual payload length.
        got: usize,
    },
}

/// Connection-level failures.
#[derive(Error, Debug)]
pub enum TransportError {
    /// All connection attempts failed.
    #[error("Failed to connect after {attempts} attempts: {last_error}")]
    ConnectFailed {
        /// Number of attempts made.
        attempts: u32,
        /// Error from the final attempt.
        last_error: String,
    },

    /// No response arrived in time.
    #[error("Timed out after {0:?} waiting for response")]
    Timeout(Duration),

    /// The connection dropped while a request was outstanding.
    #[error("Connection closed")]
    ConnectionClosed,

    /// An authenticated packet was requested before login completed.
    #[error("Not authenticated")]
    NotAuthenticated,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures reported by a [`Store`](crate::store::Store) implementation.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Backend-specific failure.
    #[error("Store backend error: {0}")]
    Backend(String),

    /// Stored data could not be decoded.
    #[error("Corrupt stored data: {0}")]
    Corrupt(String),
}

/// Top-level error for session operations.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Cryptographic failure.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Protocol failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Persistent store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// No contact with this identity.
    #[error("Contact not found: {0}")]
    ContactNotFound(IdentityHash),

    /// A required input was empty.
    #[error("{0} cannot be empty")]
    EmptyInput(&'static str),

    /// Ratchet state could not be (de)serialized.
    #[error("Serialization failed: {0}")]
    Serialization(String),
}

impl ClientError {
    /// True for the replay signal that callers treat as idempotent success.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, ClientError::Crypto(CryptoError::AlreadyProcessed(_)))
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::Transport(TransportError::Io(err))
    }
}

/// Crate-wide result alias.
pub type Result<T, E = ClientError> = std::result::Result<T, E>;
