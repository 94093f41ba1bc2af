//! Request/response transport with push dispatch.
//!
//! [`RequestTransport`] is the seam the session talks to; [`Connection`] is
//! the TCP implementation.

mod backoff;
mod connection;

pub use backoff::{connect_with_backoff, Backoff};
pub use connection::Connection;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::{Credentials, Packet, PacketType};

/// Callback for unsolicited packets of one type.
///
/// Runs on the connection's reader task, so it must not block.
pub type PushHandler = Arc<dyn Fn(Packet) + Send + Sync>;

/// Correlated request/response messaging with the server.
#[async_trait]
pub trait RequestTransport: Send + Sync {
    /// Send a request and wait for the response with the same correlation id.
    ///
    /// An `Error` response becomes `ProtocolError::Server`.
    async fn send_receive(&self, packet_type: PacketType, payload: Vec<u8>) -> Result<Packet>;

    /// Send without waiting for a response.
    async fn send(&self, packet_type: PacketType, payload: Vec<u8>) -> Result<()>;

    /// Install or replace the handler for unsolicited packets of `packet_type`.
    fn register_push_handler(&self, packet_type: PacketType, handler: PushHandler);

    /// Set or clear the auth block attached to authenticated requests.
    fn set_credentials(&self, credentials: Option<Credentials>);
}
