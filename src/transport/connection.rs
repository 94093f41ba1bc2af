//! TCP connection to the relay server.
//!
//! One reader task owns the read half and routes every incoming frame: a
//! frame whose correlation id has a waiter completes that waiter, anything
//! else goes to the push handler registered for its type. Writers serialize
//! on an async lock held only while a frame is written. Reconnecting runs
//! under a separate lock, and callers that find a reconnect in progress wait
//! for it no longer than the request timeout.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use super::backoff::connect_with_backoff;
use super::{PushHandler, RequestTransport};
use crate::config::TransportConfig;
use crate::error::{ClientError, ProtocolError, Result, TransportError};
use crate::protocol::{
    read_frame, write_frame, CorrelationId, Credentials, FrameOrigin, Packet, PacketType,
};

#[derive(Default)]
struct State {
    pending: HashMap<CorrelationId, oneshot::Sender<Packet>>,
    handlers: HashMap<PacketType, PushHandler>,
    credentials: Option<Credentials>,
    connected: bool,
    generation: u64,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn dispatch(&self, packet: Packet) {
        let (waiter, handler) = {
            let mut state = self.lock();
            match state.pending.remove(&packet.correlation_id) {
                Some(waiter) => (Some(waiter), None),
                None => (None, state.handlers.get(&packet.packet_type).cloned()),
            }
        };

        if let Some(waiter) = waiter {
            if waiter.send(packet).is_err() {
                debug!("Response arrived after its caller gave up");
            }
            return;
        }

        if let Some(handler) = handler {
            handler(packet);
            return;
        }

        if packet.packet_type == PacketType::Error {
            warn!(
                correlation_id = %packet.correlation_id,
                reason = %packet.payload_text(),
                "Unhandled server error"
            );
        } else {
            debug!(
                packet_type = ?packet.packet_type,
                correlation_id = %packet.correlation_id,
                "Unhandled packet"
            );
        }
    }

    /// Mark the connection of `generation` as gone and fail its waiters.
    fn disconnect(&self, generation: u64) {
        let pending = {
            let mut state = self.lock();
            if state.generation != generation {
                return;
            }
            state.connected = false;
            std::mem::take(&mut state.pending)
        };

        if !pending.is_empty() {
            warn!(
                outstanding = pending.len(),
                "Connection lost with requests outstanding"
            );
        }
    }
}

async fn read_loop(read_half: OwnedReadHalf, shared: Arc<Shared>, max_frame_len: usize, generation: u64) {
    let mut reader = BufReader::new(read_half);

    loop {
        let body = match read_frame(&mut reader, max_frame_len).await {
            Ok(body) => body,
            Err(ClientError::Protocol(err)) => {
                warn!(error = %err, "Dropping frame");
                continue;
            }
            Err(err) => {
                info!(error = %err, "Connection closed");
                break;
            }
        };

        match Packet::decode(&body, FrameOrigin::Server) {
            Ok(packet) => shared.dispatch(packet),
            Err(err) => warn!(error = %err, len = body.len(), "Failed to parse frame"),
        }
    }

    shared.disconnect(generation);
}

/// A correlated connection to the server.
///
/// Reconnects with backoff on the next request after the link drops.
pub struct Connection {
    config: TransportConfig,
    shared: Arc<Shared>,
    writer: AsyncMutex<Option<OwnedWriteHalf>>,
    reconnect: AsyncMutex<()>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Connect, read the server handshake and start the reader task.
    pub async fn connect(config: TransportConfig) -> Result<Self> {
        let conn = Self {
            config,
            shared: Arc::new(Shared::default()),
            writer: AsyncMutex::new(None),
            reconnect: AsyncMutex::new(()),
            reader_task: Mutex::new(None),
        };

        conn.establish().await?;
        Ok(conn)
    }

    /// Whether the reader task currently has a live connection.
    pub fn is_connected(&self) -> bool {
        self.shared.lock().connected
    }

    /// Number of requests waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Shut down the write half and stop the reader task.
    pub async fn close(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        if let Some(mut stream) = writer.take() {
            use tokio::io::AsyncWriteExt;
            stream.shutdown().await?;
        }
        self.stop_reader();
        Ok(())
    }

    fn stop_reader(&self) {
        let task = self
            .reader_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }

        let pending = {
            let mut state = self.shared.lock();
            state.connected = false;
            state.generation += 1;
            std::mem::take(&mut state.pending)
        };
        drop(pending);
    }

    /// Dial, read the handshake and swap in the new halves.
    ///
    /// The writer lock is taken only to install the write half.
    async fn establish(&self) -> Result<()> {
        let addr = self.config.server_addr.clone();
        let max_frame_len = self.config.max_frame_len();

        let mut stream = connect_with_backoff(&self.config.backoff(), || TcpStream::connect(addr.clone())).await?;

        let wait = self.config.request_timeout();
        let body = timeout(wait, read_frame(&mut stream, max_frame_len))
            .await
            .map_err(|_| TransportError::Timeout(wait))??;
        let handshake = Packet::decode(&body, FrameOrigin::Server)?;
        if handshake.packet_type != PacketType::Handshake {
            return Err(ProtocolError::UnexpectedHandshake(handshake.packet_type).into());
        }

        // Waiters from an earlier connection will never see a response.
        self.stop_reader();

        let (read_half, write_half) = stream.into_split();
        *self.writer.lock().await = Some(write_half);

        let generation = {
            let mut state = self.shared.lock();
            state.connected = true;
            state.generation
        };

        let task = tokio::spawn(read_loop(
            read_half,
            Arc::clone(&self.shared),
            max_frame_len,
            generation,
        ));
        *self
            .reader_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(task);

        info!(server = %addr, "Connected");
        Ok(())
    }

    async fn is_linked(&self) -> bool {
        let connected = self.shared.lock().connected;
        connected && self.writer.lock().await.is_some()
    }

    async fn ensure_connected(&self) -> Result<()> {
        if self.is_linked().await {
            return Ok(());
        }

        let wait = self.config.request_timeout();
        let _reconnecting = timeout(wait, self.reconnect.lock()).await.map_err(|_| {
            debug!("Gave up waiting for a reconnect in progress");
            TransportError::Timeout(wait)
        })?;

        // Another caller may have finished reconnecting while we waited.
        if self.is_linked().await {
            return Ok(());
        }

        info!(server = %self.config.server_addr, "Reconnecting");
        self.establish().await
    }

    async fn write(&self, packet: &Packet) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            return Err(TransportError::ConnectionClosed.into());
        };

        if let Err(err) = write_frame(stream, packet).await {
            *writer = None;
            return Err(err);
        }
        Ok(())
    }

    /// Build a packet, attaching credentials where the type needs them.
    ///
    /// Fails before touching the socket.
    fn build(&self, packet_type: PacketType, payload: Vec<u8>) -> Result<Packet> {
        if payload.len() > self.config.max_payload_len {
            return Err(ProtocolError::FrameTooLarge {
                len: payload.len(),
                max: self.config.max_payload_len,
            }
            .into());
        }

        let packet = Packet::new(packet_type, CorrelationId::random()?, payload);
        if !packet_type.requires_auth() {
            return Ok(packet);
        }

        let credentials = self.shared.lock().credentials;
        match credentials {
            Some(credentials) => Ok(packet.with_auth(credentials)),
            None => Err(TransportError::NotAuthenticated.into()),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Ok(mut task) = self.reader_task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

#[async_trait]
impl RequestTransport for Connection {
    #[instrument(skip(self, payload), fields(len = payload.len()))]
    async fn send_receive(&self, packet_type: PacketType, payload: Vec<u8>) -> Result<Packet> {
        let packet = self.build(packet_type, payload)?;
        let id = packet.correlation_id;
        let (tx, rx) = oneshot::channel();

        self.ensure_connected().await?;

        self.shared.lock().pending.insert(id, tx);
        if let Err(err) = self.write(&packet).await {
            self.shared.lock().pending.remove(&id);
            return Err(err);
        }

        let wait = self.config.request_timeout();
        let response = match timeout(wait, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(TransportError::ConnectionClosed.into()),
            Err(_) => {
                self.shared.lock().pending.remove(&id);
                warn!(correlation_id = %id, "Request timed out");
                return Err(TransportError::Timeout(wait).into());
            }
        };

        if response.packet_type == PacketType::Error {
            return Err(ProtocolError::Server(response.payload_text()).into());
        }
        Ok(response)
    }

    async fn send(&self, packet_type: PacketType, payload: Vec<u8>) -> Result<()> {
        let packet = self.build(packet_type, payload)?;

        self.ensure_connected().await?;
        self.write(&packet).await
    }

    fn register_push_handler(&self, packet_type: PacketType, handler: PushHandler) {
        self.shared.lock().handlers.insert(packet_type, handler);
    }

    fn set_credentials(&self, credentials: Option<Credentials>) {
        self.shared.lock().credentials = credentials;
    }
}
