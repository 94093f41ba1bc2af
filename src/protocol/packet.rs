//! Packet types and the binary frame layout.
//!
//! ```text
//! length (8, BE) | version (1) | type (1) | correlation id (16)
//!                | [auth id (16) | auth token (32)] | payload
//! ```
//!
//! The length covers everything after itself. The auth block is present on
//! client frames whose type requires authentication and never on server
//! frames.

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;

use crate::config::PROTOCOL_VERSION;
use crate::crypto::{IdentityHash, IDENTITY_HASH_LENGTH};
use crate::error::{CryptoError, ProtocolError};

/// Length of the frame length prefix.
pub const LENGTH_PREFIX_LEN: usize = 8;

/// Length of a correlation id.
pub const CORRELATION_ID_LEN: usize = 16;

/// Length of an auth token.
pub const AUTH_TOKEN_LEN: usize = 32;

/// Version, type and correlation id.
pub const BASE_HEADER_LEN: usize = 1 + 1 + CORRELATION_ID_LEN;

/// Largest header: base header plus auth block.
pub const MAX_HEADER_LEN: usize = BASE_HEADER_LEN + IDENTITY_HASH_LENGTH + AUTH_TOKEN_LEN;

/// Packet type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Generic acknowledgement.
    Ack = 0,
    /// Server-side failure; payload is a UTF-8 reason.
    Error = 1,
    /// First frame the server sends on a new connection.
    Handshake = 2,
    /// Log in with an encrypted password.
    Login = 3,
    /// Create an account.
    Signup = 4,
    /// End the authenticated session.
    Logout = 5,
    /// Fetch the server key used to seal the password.
    KeyLookup = 6,
    /// Send a message to a contact.
    SendMessage = 7,
    /// Server push of a message for us.
    PushMessage = 8,
    /// Fetch queued messages.
    RequestMessages = 9,
    /// Fetch a contact's account public key.
    PublicKeyLookup = 10,
}

impl PacketType {
    /// Decode a type byte.
    pub fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        Ok(match byte {
            0 => PacketType::Ack,
            1 => PacketType::Error,
            2 => PacketType::Handshake,
            3 => PacketType::Login,
            4 => PacketType::Signup,
            5 => PacketType::Logout,
            6 => PacketType::KeyLookup,
            7 => PacketType::SendMessage,
            8 => PacketType::PushMessage,
            9 => PacketType::RequestMessages,
            10 => PacketType::PublicKeyLookup,
            other => return Err(ProtocolError::UnknownPacketType(other)),
        })
    }

    /// Type byte on the wire.
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Whether client frames of this type carry the auth block.
    pub fn requires_auth(self) -> bool {
        !matches!(
            self,
            PacketType::KeyLookup | PacketType::Login | PacketType::Signup
        )
    }
}

/// Random id matching a response to its request.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationId([u8; CORRELATION_ID_LEN]);

impl CorrelationId {
    /// Fresh random id.
    pub fn random() -> Result<Self, CryptoError> {
        let mut bytes = [0u8; CORRELATION_ID_LEN];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| CryptoError::Entropy(e.to_string()))?;
        Ok(Self(bytes))
    }

    /// Wrap raw bytes.
    pub const fn from_bytes(bytes: [u8; CORRELATION_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8; CORRELATION_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CorrelationId({})", hex::encode(self.0))
    }
}

/// Session token issued by the server on login or signup.
#[derive(Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AuthToken([u8; AUTH_TOKEN_LEN]);

impl AuthToken {
    /// Wrap raw bytes.
    pub const fn from_bytes(bytes: [u8; AUTH_TOKEN_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a login or signup response payload.
    pub fn from_payload(payload: &[u8]) -> Result<Self, ProtocolError> {
        payload
            .try_into()
            .map(Self)
            .map_err(|_| ProtocolError::MalformedResponse {
                what: "auth token",
                expected: AUTH_TOKEN_LEN,
                got: payload.len(),
            })
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8; AUTH_TOKEN_LEN] {
        &self.0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken([REDACTED])")
    }
}

/// Auth block attached to authenticated client frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Credentials {
    /// Our identity hash.
    pub id: IdentityHash,
    /// Token issued at login.
    pub token: AuthToken,
}

/// Which side wrote a frame; decides whether an auth block may be present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOrigin {
    /// Client to server.
    Client,
    /// Server to client.
    Server,
}

/// One protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Protocol version.
    pub version: u8,
    /// Packet type.
    pub packet_type: PacketType,
    /// Correlation id, echoed by the server in its response.
    pub correlation_id: CorrelationId,
    /// Auth block, client frames only.
    pub auth: Option<Credentials>,
    /// Type-specific payload.
    pub payload: Vec<u8>,
}

impl Packet {
    /// A packet without auth block at the current protocol version.
    pub fn new(packet_type: PacketType, correlation_id: CorrelationId, payload: Vec<u8>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            packet_type,
            correlation_id,
            auth: None,
            payload,
        }
    }

    /// Attach an auth block.
    pub fn with_auth(mut self, credentials: Credentials) -> Self {
        self.auth = Some(credentials);
        self
    }

    /// Payload as lossy UTF-8, for `Error` frames.
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Encoded length without the length prefix.
    pub fn body_len(&self) -> usize {
        let auth = if self.auth.is_some() {
            IDENTITY_HASH_LENGTH + AUTH_TOKEN_LEN
        } else {
            0
        };
        BASE_HEADER_LEN + auth + self.payload.len()
    }

    /// Encode the full frame, length prefix included.
    pub fn encode(&self) -> Vec<u8> {
        let body_len = self.body_len();
        let mut frame = Vec::with_capacity(LENGTH_PREFIX_LEN + body_len);

        frame.extend_from_slice(&(body_len as u64).to_be_bytes());
        frame.push(self.version);
        frame.push(self.packet_type.as_byte());
        frame.extend_from_slice(self.correlation_id.as_bytes());
        if let Some(auth) = &self.auth {
            frame.extend_from_slice(auth.id.as_bytes());
            frame.extend_from_slice(auth.token.as_bytes());
        }
        frame.extend_from_slice(&self.payload);
        frame
    }

    /// Decode a frame body (everything after the length prefix).
    pub fn decode(body: &[u8], origin: FrameOrigin) -> Result<Self, ProtocolError> {
        if body.len() < BASE_HEADER_LEN {
            return Err(ProtocolError::FrameTooShort(body.len()));
        }

        let version = body[0];
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: version,
            });
        }

        let packet_type = PacketType::from_byte(body[1])?;

        let mut id = [0u8; CORRELATION_ID_LEN];
        id.copy_from_slice(&body[2..BASE_HEADER_LEN]);
        let correlation_id = CorrelationId::from_bytes(id);

        let mut rest = &body[BASE_HEADER_LEN..];
        let mut auth = None;

        if origin == FrameOrigin::Client && packet_type.requires_auth() {
            if rest.len() < IDENTITY_HASH_LENGTH + AUTH_TOKEN_LEN {
                return Err(ProtocolError::FrameTooShort(body.len()));
            }

            let (auth_id, after_id) = rest.split_at(IDENTITY_HASH_LENGTH);
            let (token, payload) = after_id.split_at(AUTH_TOKEN_LEN);

            let mut id_bytes = [0u8; IDENTITY_HASH_LENGTH];
            id_bytes.copy_from_slice(auth_id);
            let mut token_bytes = [0u8; AUTH_TOKEN_LEN];
            token_bytes.copy_from_slice(token);

            auth = Some(Credentials {
                id: IdentityHash::from_bytes(id_bytes),
                token: AuthToken::from_bytes(token_bytes),
            });
            rest = payload;
        }

        Ok(Self {
            version,
            packet_type,
            correlation_id,
            auth,
            payload: rest.to_vec(),
        })
    }
}
