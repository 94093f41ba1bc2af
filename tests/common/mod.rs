//! Shared helpers for integration tests.
//!
//! [`MockRelay`] is a small in-process relay server speaking the wire
//! protocol: it hands out a server key, registers accounts, issues tokens,
//! pushes messages to connected recipients and queues them for offline ones.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::RngCore;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use sealtalk::config::{ClientConfig, TransportConfig};
use sealtalk::crypto::{symmetric, IdentityHash, IDENTITY_HASH_LENGTH, KEY_LENGTH, NONCE_LENGTH};
use sealtalk::message::encode_batch_entry;
use sealtalk::protocol::{
    read_frame, write_frame, CorrelationId, FrameOrigin, Packet, PacketType, MAX_HEADER_LEN,
};

/// Largest frame the mock server reads.
pub const MAX_FRAME: usize = MAX_HEADER_LEN + 1024 * 1024;

/// Install a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Transport settings with short timings for tests.
pub fn transport_config(addr: SocketAddr) -> TransportConfig {
    TransportConfig::new(addr.to_string())
        .with_backoff(3, 20)
        .with_request_timeout_ms(2000)
}

/// Accept one client and send it the handshake.
pub async fn accept_client(listener: &TcpListener) -> (BufReader<OwnedReadHalf>, OwnedWriteHalf) {
    let (stream, _) = listener.accept().await.unwrap();
    let (read_half, mut write_half) = stream.into_split();

    let handshake = Packet::new(
        PacketType::Handshake,
        CorrelationId::random().unwrap(),
        Vec::new(),
    );
    write_frame(&mut write_half, &handshake).await.unwrap();

    (BufReader::new(read_half), write_half)
}

/// Read and decode one client frame.
pub async fn read_request(reader: &mut BufReader<OwnedReadHalf>) -> Packet {
    let body = read_frame(reader, MAX_FRAME).await.unwrap();
    Packet::decode(&body, FrameOrigin::Client).unwrap()
}

/// Read and discard frames until the client goes away.
pub async fn drain(reader: &mut BufReader<OwnedReadHalf>) {
    while read_frame(reader, MAX_FRAME).await.is_ok() {}
}

/// Poll `condition` until it holds or a second passes.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

struct Account {
    public_key: [u8; KEY_LENGTH],
    password: Vec<u8>,
}

#[derive(Default)]
struct RelayState {
    accounts: HashMap<IdentityHash, Account>,
    tokens: HashMap<IdentityHash, [u8; 32]>,
    online: HashMap<IdentityHash, (u64, mpsc::UnboundedSender<Vec<u8>>)>,
    mailbox: HashMap<IdentityHash, Vec<(IdentityHash, Vec<u8>)>>,
}

/// In-process relay server.
pub struct MockRelay {
    addr: SocketAddr,
    state: Arc<Mutex<RelayState>>,
    task: JoinHandle<()>,
}

impl MockRelay {
    /// Bind to an ephemeral port and start accepting.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(RelayState::default()));

        let mut server_key = [0u8; KEY_LENGTH];
        rand::thread_rng().fill_bytes(&mut server_key);

        let shared = Arc::clone(&state);
        let task = tokio::spawn(async move {
            let mut next_conn = 0u64;
            while let Ok((stream, _)) = listener.accept().await {
                next_conn += 1;
                tokio::spawn(serve(stream, next_conn, server_key, Arc::clone(&shared)));
            }
        });

        Self { addr, state, task }
    }

    /// Listening address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Client config pointing at this relay.
    pub fn config(&self) -> ClientConfig {
        ClientConfig {
            transport: transport_config(self.addr),
            ..Default::default()
        }
    }

    /// Messages waiting for `id`.
    pub fn queued(&self, id: &IdentityHash) -> usize {
        self.state
            .lock()
            .unwrap()
            .mailbox
            .get(id)
            .map_or(0, Vec::len)
    }

    /// Whether `id` has a logged-in connection.
    pub fn is_online(&self, id: &IdentityHash) -> bool {
        self.state.lock().unwrap().online.contains_key(id)
    }

    /// Queue a raw body for `receiver` as if `sender` had sent it.
    pub fn enqueue(&self, receiver: IdentityHash, sender: IdentityHash, body: Vec<u8>) {
        self.state
            .lock()
            .unwrap()
            .mailbox
            .entry(receiver)
            .or_default()
            .push((sender, body));
    }
}

impl Drop for MockRelay {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(stream: TcpStream, conn: u64, server_key: [u8; KEY_LENGTH], state: Arc<Mutex<RelayState>>) {
    let (read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if write_half.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    let handshake = Packet::new(PacketType::Handshake, CorrelationId::random().unwrap(), Vec::new());
    let _ = tx.send(handshake.encode());

    let mut reader = BufReader::new(read_half);
    let mut me = None;

    while let Ok(body) = read_frame(&mut reader, MAX_FRAME).await {
        let Ok(packet) = Packet::decode(&body, FrameOrigin::Client) else {
            continue;
        };

        if let Some(frame) = handle(&state, &server_key, conn, &tx, &mut me, packet) {
            if tx.send(frame).is_err() {
                break;
            }
        }
    }

    if let Some(id) = me {
        let mut state = state.lock().unwrap();
        if state.online.get(&id).map(|(owner, _)| *owner) == Some(conn) {
            state.online.remove(&id);
        }
    }
}

fn handle(
    state: &Mutex<RelayState>,
    server_key: &[u8; KEY_LENGTH],
    conn: u64,
    tx: &mpsc::UnboundedSender<Vec<u8>>,
    me: &mut Option<IdentityHash>,
    packet: Packet,
) -> Option<Vec<u8>> {
    let id = packet.correlation_id;
    let ack = |payload: Vec<u8>| Some(Packet::new(PacketType::Ack, id, payload).encode());
    let error = |reason: &str| Some(Packet::new(PacketType::Error, id, reason.as_bytes().to_vec()).encode());

    let mut state = state.lock().unwrap();

    if packet.packet_type.requires_auth() {
        let authorized = packet.auth.is_some_and(|auth| {
            state.tokens.get(&auth.id) == Some(auth.token.as_bytes())
        });
        if !authorized {
            return error("not authenticated");
        }
    }

    let payload = &packet.payload;
    match packet.packet_type {
        PacketType::KeyLookup => ack(server_key.to_vec()),

        PacketType::Login | PacketType::Signup => {
            let signup = packet.packet_type == PacketType::Signup;
            let key_len = if signup { KEY_LENGTH } else { 0 };
            if payload.len() < IDENTITY_HASH_LENGTH + key_len + NONCE_LENGTH {
                return error("malformed login");
            }

            let user = IdentityHash::from_slice(&payload[..IDENTITY_HASH_LENGTH]).unwrap();
            let rest = &payload[IDENTITY_HASH_LENGTH..];
            let (public_key, sealed) = rest.split_at(key_len);
            let Ok(password) = symmetric::open_prefixed(server_key, sealed) else {
                return error("bad password encryption");
            };

            if signup {
                if state.accounts.contains_key(&user) {
                    return error("user already exists");
                }
                state.accounts.insert(
                    user,
                    Account {
                        public_key: public_key.try_into().unwrap(),
                        password,
                    },
                );
            } else if state.accounts.get(&user).map(|a| &a.password) != Some(&password) {
                return error("invalid credentials");
            }

            let mut token = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut token);
            state.tokens.insert(user, token);
            state.online.insert(user, (conn, tx.clone()));
            *me = Some(user);
            ack(token.to_vec())
        }

        PacketType::Logout => {
            if let Some(user) = me.take() {
                state.online.remove(&user);
                state.tokens.remove(&user);
            }
            None
        }

        PacketType::PublicKeyLookup => {
            let user = IdentityHash::from_slice(payload)?;
            match state.accounts.get(&user) {
                Some(account) => ack(account.public_key.to_vec()),
                None => error("user not found"),
            }
        }

        PacketType::SendMessage => {
            if payload.len() < IDENTITY_HASH_LENGTH {
                return error("malformed message");
            }
            let sender = packet.auth?.id;
            let receiver = IdentityHash::from_slice(&payload[..IDENTITY_HASH_LENGTH]).unwrap();
            let body = payload[IDENTITY_HASH_LENGTH..].to_vec();

            let mut push_payload = sender.as_bytes().to_vec();
            push_payload.extend_from_slice(&body);
            let push = Packet::new(PacketType::PushMessage, CorrelationId::random().unwrap(), push_payload);

            let delivered = state
                .online
                .get(&receiver)
                .is_some_and(|(_, peer)| peer.send(push.encode()).is_ok());
            if !delivered {
                state.mailbox.entry(receiver).or_default().push((sender, body));
            }
            ack(Vec::new())
        }

        PacketType::RequestMessages => {
            let user = packet.auth?.id;
            let from = if payload.len() >= IDENTITY_HASH_LENGTH {
                IdentityHash::from_slice(&payload[..IDENTITY_HASH_LENGTH])
            } else {
                None
            };

            let queued = state.mailbox.remove(&user).unwrap_or_default();
            let (matching, kept): (Vec<_>, Vec<_>) = queued
                .into_iter()
                .partition(|(sender, _)| from.map_or(true, |from| *sender == from));
            if !kept.is_empty() {
                state.mailbox.insert(user, kept);
            }

            let batch = matching
                .iter()
                .flat_map(|(sender, body)| encode_batch_entry(sender, body))
                .collect();
            ack(batch)
        }

        other => error(&format!("unsupported packet type {:?}", other)),
    }
}
