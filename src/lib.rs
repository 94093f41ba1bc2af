//! # Sealtalk - end-to-end encrypted messaging client
//!
//! Sealtalk talks to a relay server over a framed TCP protocol. The server
//! routes opaque message bodies by identity hash; only the two endpoints can
//! read them.
//!
//! ## Overview
//!
//! - Each account has one X25519 key pair, registered with the server at signup
//! - Each contact gets a two-level ratchet: a Diffie-Hellman ratchet that
//!   rotates our key pair whenever the conversation direction flips, and a
//!   symmetric chain per DH epoch that derives one key per message
//! - Messages are sealed with AES-256-GCM and authenticated with HMAC-SHA256
//! - Out-of-order delivery is tolerated up to a skip limit; replays are
//!   reported as duplicates
//! - Requests carry a random correlation id; a single reader task routes
//!   responses to their callers and everything else to push handlers
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use sealtalk::config::ClientConfig;
//! use sealtalk::session::{MessageFilter, Session};
//! use sealtalk::store::MemoryStore;
//!
//! # async fn run() -> sealtalk::Result<()> {
//! let session = Session::connect(
//!     ClientConfig::for_server("127.0.0.1:4011"),
//!     Arc::new(MemoryStore::new()),
//! )
//! .await?;
//!
//! session.login("alice", b"correct horse").await?;
//! session.listen_incoming();
//!
//! let bob = session.add_contact("bob").await?;
//! session.send_message(&bob, b"hello bob").await?;
//!
//! let report = session.request_messages(MessageFilter::from_contact(bob)).await?;
//! for message in report.received {
//!     println!("{:?}", message.text());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`crypto`]: X25519 keys, HKDF, AES-GCM, HMAC and identity hashes
//! - [`ratchet`]: Symmetric chain and DH session ratchets
//! - [`message`]: Message bodies, headers and batches
//! - [`protocol`]: Packet framing
//! - [`transport`]: Correlated request/response over TCP
//! - [`store`]: Persistence contract
//! - [`session`]: The client façade

pub mod config;
pub mod crypto;
pub mod error;
pub mod message;
pub mod protocol;
pub mod ratchet;
pub mod session;
pub mod store;
pub mod transport;

pub use config::{ClientConfig, RatchetConfig, TransportConfig, PROTOCOL_VERSION};
pub use crypto::{IdentityHash, KeyPair};
pub use error::{ClientError, CryptoError, ProtocolError, Result, StoreError, TransportError};
pub use message::SecureMessage;
pub use session::{BatchReport, MessageFilter, Session};
pub use store::{MemoryStore, Store};
