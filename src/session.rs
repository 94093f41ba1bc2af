//! Client session.
//!
//! [`Session`] composes the transport, the store and one ratchet per contact
//! into the operations a UI needs: account login and signup, contact
//! management, sending, polling and push delivery of messages.
//!
//! Each contact's ratchet sits behind its own async lock, so encryption and
//! decryption for one contact are serialized while different contacts proceed
//! independently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, Mutex as AsyncMutex, RwLock as AsyncRwLock};
use tracing::{debug, info, instrument, warn};

use crate::config::ClientConfig;
use crate::crypto::{public_key_from_slice, symmetric, IdentityHash, KeyPair, KEY_LENGTH};
use crate::error::{ClientError, ProtocolError, Result, TransportError};
use crate::message::{parse_batch, SecureMessage};
use crate::protocol::{AuthToken, Credentials, Packet, PacketType};
use crate::ratchet::{Direction, SessionRatchet};
use crate::store::{SavedLogin, Store, StoredMessage};
use crate::transport::{Connection, RequestTransport};

/// Callback for every message decrypted by the session.
pub type MessageListener = Arc<dyn Fn(&SecureMessage) + Send + Sync>;

/// Which queued messages to fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageFilter {
    /// Only messages from this contact.
    pub contact: Option<IdentityHash>,
    /// Only messages newer than this timestamp (microseconds).
    pub since: Option<i64>,
}

impl MessageFilter {
    /// Messages from one contact.
    pub fn from_contact(contact: IdentityHash) -> Self {
        Self {
            contact: Some(contact),
            since: None,
        }
    }

    /// Restrict to messages newer than `since`.
    pub fn since(mut self, since: i64) -> Self {
        self.since = Some(since);
        self
    }

    /// Encode as `[contact] || [timestamp (8, BE)]`; empty when unset.
    pub fn encode(&self) -> Vec<u8> {
        match (self.contact, self.since) {
            (None, None) => Vec::new(),
            (None, Some(since)) => since.to_be_bytes().to_vec(),
            (Some(contact), since) => {
                let mut payload = contact.as_bytes().to_vec();
                payload.extend_from_slice(&since.unwrap_or(0).to_be_bytes());
                payload
            }
        }
    }
}

/// Outcome of processing a batch of queued messages.
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Messages decrypted, in batch order.
    pub received: Vec<SecureMessage>,
    /// Entries already processed earlier.
    pub duplicates: usize,
    /// Entries that could not be parsed or decrypted, by batch position.
    pub failures: Vec<(usize, ClientError)>,
}

struct Contact {
    id: IdentityHash,
    ratchet: SessionRatchet,
}

struct SessionInner {
    config: ClientConfig,
    transport: Arc<dyn RequestTransport>,
    store: Arc<dyn Store>,
    key_pair: KeyPair,
    identity: RwLock<Option<IdentityHash>>,
    contacts: AsyncRwLock<HashMap<IdentityHash, Arc<AsyncMutex<Contact>>>>,
    listener: RwLock<Option<MessageListener>>,
    last_polled: AtomicI64,
}

/// A client session. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Connect to the configured server and open a session on `store`.
    pub async fn connect(config: ClientConfig, store: Arc<dyn Store>) -> Result<Self> {
        let transport = Arc::new(Connection::connect(config.transport.clone()).await?);
        Self::open(config, transport, store).await
    }

    /// Open a session over an existing transport.
    ///
    /// Loads the account key pair (generating and saving one on first use)
    /// and every stored contact.
    pub async fn open(
        config: ClientConfig,
        transport: Arc<dyn RequestTransport>,
        store: Arc<dyn Store>,
    ) -> Result<Self> {
        let key_pair = match store.load_key_pair().await? {
            Some(key_pair) => key_pair,
            None => {
                let key_pair = KeyPair::generate()?;
                store.save_key_pair(&key_pair).await?;
                info!(
                    public_key = %hex::encode(key_pair.public_key()),
                    "Generated account key pair"
                );
                key_pair
            }
        };

        let mut contacts = HashMap::new();
        for row in store.load_contacts().await? {
            match SessionRatchet::from_bytes(&row.ratchet_state) {
                Ok(ratchet) => {
                    contacts.insert(
                        row.id,
                        Arc::new(AsyncMutex::new(Contact {
                            id: row.id,
                            ratchet,
                        })),
                    );
                }
                Err(err) => warn!(contact = %row.id, error = %err, "Skipping unreadable contact"),
            }
        }
        debug!(contacts = contacts.len(), "Loaded contacts");

        Ok(Self {
            inner: Arc::new(SessionInner {
                config,
                transport,
                store,
                key_pair,
                identity: RwLock::new(None),
                contacts: AsyncRwLock::new(contacts),
                listener: RwLock::new(None),
                last_polled: AtomicI64::new(0),
            }),
        })
    }

    /// Our identity, once logged in.
    pub fn identity(&self) -> Option<IdentityHash> {
        *self
            .inner
            .identity
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Account public key.
    pub fn public_key(&self) -> &[u8; KEY_LENGTH] {
        self.inner.key_pair.public_key()
    }

    /// Time of the last successful poll, in microseconds since the epoch.
    pub fn last_polled(&self) -> i64 {
        self.inner.last_polled.load(Ordering::Relaxed)
    }

    fn set_identity(&self, identity: Option<IdentityHash>) {
        *self
            .inner
            .identity
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = identity;
    }

    fn require_identity(&self) -> Result<IdentityHash> {
        self.identity()
            .ok_or_else(|| TransportError::NotAuthenticated.into())
    }

    /// Log in. Polls queued messages afterwards; a failed poll is only logged.
    #[instrument(skip(self, password))]
    pub async fn login(&self, handle: &str, password: &[u8]) -> Result<()> {
        self.authenticate(PacketType::Login, handle, password).await?;

        if let Err(err) = self.request_messages(MessageFilter::default()).await {
            warn!(error = %err, "Failed to request messages after login");
        }
        Ok(())
    }

    /// Create an account bound to our account public key.
    #[instrument(skip(self, password))]
    pub async fn signup(&self, handle: &str, password: &[u8]) -> Result<()> {
        self.authenticate(PacketType::Signup, handle, password).await
    }

    async fn authenticate(&self, packet_type: PacketType, handle: &str, password: &[u8]) -> Result<()> {
        if handle.is_empty() {
            return Err(ClientError::EmptyInput("user id"));
        }
        if password.is_empty() {
            return Err(ClientError::EmptyInput("password"));
        }

        let id = IdentityHash::from_handle(handle);

        let response = self
            .inner
            .transport
            .send_receive(PacketType::KeyLookup, id.as_bytes().to_vec())
            .await?;
        if response.payload.len() != KEY_LENGTH {
            return Err(ProtocolError::MalformedResponse {
                what: "server key",
                expected: KEY_LENGTH,
                got: response.payload.len(),
            }
            .into());
        }

        let sealed = symmetric::seal_prefixed(&response.payload, password)?;

        let mut payload = id.as_bytes().to_vec();
        if packet_type == PacketType::Signup {
            payload.extend_from_slice(self.public_key());
        }
        payload.extend_from_slice(&sealed);

        let response = self.inner.transport.send_receive(packet_type, payload).await?;
        let credentials = Credentials {
            id,
            token: AuthToken::from_payload(&response.payload)?,
        };

        self.inner.transport.set_credentials(Some(credentials));
        self.set_identity(Some(id));
        self.inner
            .store
            .save_credentials(&SavedLogin {
                handle: handle.to_string(),
                credentials,
            })
            .await?;

        info!(identity = %id, "Authenticated");
        Ok(())
    }

    /// Reuse the last saved login without contacting the server.
    pub async fn resume(&self) -> Result<Option<IdentityHash>> {
        let Some(login) = self.inner.store.load_credentials().await? else {
            return Ok(None);
        };

        self.inner.transport.set_credentials(Some(login.credentials));
        self.set_identity(Some(login.credentials.id));
        debug!(identity = %login.credentials.id, "Resumed saved login");
        Ok(Some(login.credentials.id))
    }

    /// Tell the server we are leaving and forget the credentials.
    pub async fn logout(&self) -> Result<()> {
        if let Err(err) = self.inner.transport.send(PacketType::Logout, Vec::new()).await {
            warn!(error = %err, "Logout notification failed");
        }

        self.inner.transport.set_credentials(None);
        self.set_identity(None);
        Ok(())
    }

    /// Identities of all contacts, sorted.
    pub async fn contact_ids(&self) -> Vec<IdentityHash> {
        let mut ids: Vec<_> = self.inner.contacts.read().await.keys().copied().collect();
        ids.sort();
        ids
    }

    async fn contact(&self, id: &IdentityHash) -> Option<Arc<AsyncMutex<Contact>>> {
        self.inner.contacts.read().await.get(id).cloned()
    }

    /// Add a contact by handle. Adding an existing contact is a no-op.
    pub async fn add_contact(&self, handle: &str) -> Result<IdentityHash> {
        if handle.is_empty() {
            return Err(ClientError::EmptyInput("contact id"));
        }

        let id = IdentityHash::from_handle(handle);
        self.add_contact_by_hash(id).await?;
        Ok(id)
    }

    /// Add a contact by identity hash, fetching its public key from the server.
    ///
    /// The starting direction comes from comparing the two account keys, so
    /// it is the same whichever side adds the other first.
    pub async fn add_contact_by_hash(&self, id: IdentityHash) -> Result<()> {
        if self.inner.contacts.read().await.contains_key(&id) {
            return Ok(());
        }

        let response = self
            .inner
            .transport
            .send_receive(PacketType::PublicKeyLookup, id.as_bytes().to_vec())
            .await?;
        let peer_key = public_key_from_slice(&response.payload).map_err(|_| {
            ProtocolError::MalformedResponse {
                what: "public key",
                expected: KEY_LENGTH,
                got: response.payload.len(),
            }
        })?;

        let direction = Direction::initial(self.inner.key_pair.public_key(), &peer_key);
        let ratchet = SessionRatchet::new(
            self.inner.key_pair.clone(),
            peer_key,
            direction,
            &self.inner.config.ratchet,
        )?;
        let state = ratchet.to_bytes()?;

        {
            let mut contacts = self.inner.contacts.write().await;
            if contacts.contains_key(&id) {
                return Ok(());
            }
            contacts.insert(id, Arc::new(AsyncMutex::new(Contact { id, ratchet })));
        }

        self.inner.store.save_contact(&id, &state).await?;
        info!(contact = %id, ?direction, "Contact added");
        Ok(())
    }

    /// Forget a contact and its ratchet.
    pub async fn remove_contact(&self, id: &IdentityHash) -> Result<()> {
        let removed = self.inner.contacts.write().await.remove(id);
        if removed.is_none() {
            return Err(ClientError::ContactNotFound(*id));
        }

        self.inner.store.remove_contact(id).await?;
        info!(contact = %id, "Contact removed");
        Ok(())
    }

    /// Stored messages exchanged with a contact.
    pub async fn chat_history(&self, contact: &IdentityHash) -> Result<Vec<StoredMessage>> {
        if self.contact(contact).await.is_none() {
            return Err(ClientError::ContactNotFound(*contact));
        }
        Ok(self.inner.store.load_messages(contact).await?)
    }

    /// Encrypt and send a message to a contact.
    ///
    /// The advanced ratchet is saved before the message goes out, so a failed
    /// send never causes a message key to be reused.
    pub async fn send_message(&self, contact: &IdentityHash, plaintext: &[u8]) -> Result<SecureMessage> {
        if plaintext.is_empty() {
            return Err(ClientError::EmptyInput("message"));
        }
        let me = self.require_identity()?;

        let entry = self
            .contact(contact)
            .await
            .ok_or(ClientError::ContactNotFound(*contact))?;
        let mut entry = entry.lock().await;

        let mut message = SecureMessage::new_plain(me, *contact, plaintext);
        message.encrypt(&mut entry.ratchet)?;
        self.inner
            .store
            .save_contact(contact, &entry.ratchet.to_bytes()?)
            .await?;

        self.inner
            .transport
            .send_receive(PacketType::SendMessage, message.to_send_payload())
            .await?;

        self.inner
            .store
            .save_message(entry.ratchet.ratchet_index(), &message)
            .await?;
        debug!(
            contact = %contact,
            index = message.header.index,
            ratchet_index = entry.ratchet.ratchet_index(),
            "Message sent"
        );
        Ok(message)
    }

    /// Fetch and decrypt queued messages.
    ///
    /// Sends a `RequestMessages` packet and processes the returned batch in
    /// order. Entries whose sender is our own identity are server echoes and
    /// are skipped. Senders we do not know yet are added as contacts before
    /// their message is decrypted. Each decrypted message is stored, its
    /// contact's ratchet saved, and the message listener called.
    ///
    /// # Arguments
    ///
    /// * `filter` - Restricts the batch to one contact and/or to messages
    ///   newer than a timestamp; [`MessageFilter::default`] fetches everything
    ///
    /// # Returns
    ///
    /// A [`BatchReport`] with the decrypted messages, the number of replays
    /// counted as duplicates, and per-entry failures keyed by batch position.
    /// [`last_polled`](Self::last_polled) is updated once the server answers.
    ///
    /// # Errors
    ///
    /// Only failures of the request itself: [`TransportError::NotAuthenticated`]
    /// before login, or a transport or server error. A malformed or
    /// undecryptable entry never fails the whole call.
    pub async fn request_messages(&self, filter: MessageFilter) -> Result<BatchReport> {
        let me = self.require_identity()?;

        let response = self
            .inner
            .transport
            .send_receive(PacketType::RequestMessages, filter.encode())
            .await?;
        self.inner.last_polled.store(now_micros(), Ordering::Relaxed);

        let batch = parse_batch(me, &response.payload);
        let mut report = BatchReport {
            failures: batch
                .failures
                .into_iter()
                .map(|(position, err)| (position, err.into()))
                .collect(),
            ..Default::default()
        };

        for (position, message) in batch.messages {
            if message.sender == me {
                debug!(position, "Skipping own message echoed by the server");
                continue;
            }

            match self.handle_incoming(message).await {
                Ok(message) => report.received.push(message),
                Err(err) if err.is_duplicate() => report.duplicates += 1,
                Err(err) => {
                    warn!(position, error = %err, "Failed to process queued message");
                    report.failures.push((position, err));
                }
            }
        }
        report.failures.sort_by_key(|(position, _)| *position);

        debug!(
            received = report.received.len(),
            duplicates = report.duplicates,
            failed = report.failures.len(),
            "Processed message batch"
        );
        Ok(report)
    }

    /// Decrypt, store and announce one incoming message.
    ///
    /// Unknown senders become contacts.
    async fn handle_incoming(&self, mut message: SecureMessage) -> Result<SecureMessage> {
        let sender = message.sender;

        let entry = match self.contact(&sender).await {
            Some(entry) => entry,
            None => {
                self.add_contact_by_hash(sender).await?;
                self.contact(&sender)
                    .await
                    .ok_or(ClientError::ContactNotFound(sender))?
            }
        };

        {
            let mut entry = entry.lock().await;
            message.decrypt(&mut entry.ratchet)?;

            self.inner
                .store
                .save_message(entry.ratchet.ratchet_index(), &message)
                .await?;
            self.inner
                .store
                .save_contact(&entry.id, &entry.ratchet.to_bytes()?)
                .await?;
        }

        let listener = self
            .inner
            .listener
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(listener) = listener {
            listener(&message);
        }

        Ok(message)
    }

    /// Install the callback invoked for every decrypted incoming message.
    pub fn set_message_listener(&self, listener: MessageListener) {
        *self
            .inner
            .listener
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(listener);
    }

    /// Start handling server pushes.
    ///
    /// Pushes are queued by the transport's reader and processed in arrival
    /// order on a background task, which ends once the session is dropped.
    /// Must be called from within a tokio runtime.
    pub fn listen_incoming(&self) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Packet>();

        self.inner.transport.register_push_handler(
            PacketType::PushMessage,
            Arc::new(move |packet| {
                if tx.send(packet).is_err() {
                    debug!("Push worker gone, dropping message");
                }
            }),
        );

        let weak: Weak<SessionInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                Session { inner }.handle_push(packet).await;
            }
        });
    }

    async fn handle_push(&self, packet: Packet) {
        let Some(me) = self.identity() else {
            warn!("Push received before login, dropping");
            return;
        };

        let message = match SecureMessage::parse_delivered(me, &packet.payload) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "Failed to parse pushed message");
                return;
            }
        };

        if message.sender == me {
            debug!("Skipping own message echoed by the server");
            return;
        }

        match self.handle_incoming(message).await {
            Ok(message) => debug!(contact = %message.sender, "Pushed message received"),
            Err(err) if err.is_duplicate() => debug!("Duplicate pushed message"),
            Err(err) => warn!(error = %err, "Failed to handle pushed message"),
        }
    }
}

fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_micros()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
