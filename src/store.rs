//! Persistent storage contract.
//!
//! The session persists its account key pair, one serialized ratchet per
//! contact, every sent or received message and the last login. Backends
//! implement [`Store`]; [`MemoryStore`] keeps everything in process.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::crypto::{IdentityHash, KeyPair};
use crate::error::StoreError;
use crate::message::SecureMessage;
use crate::protocol::Credentials;

/// A contact row: identity and serialized ratchet state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredContact {
    /// Contact identity.
    pub id: IdentityHash,
    /// Output of `SessionRatchet::to_bytes`.
    pub ratchet_state: Vec<u8>,
}

/// A message row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// DH cycle count of the contact's ratchet when the message was stored.
    pub ratchet_index: u64,
    /// The message, with plaintext.
    pub message: SecureMessage,
}

/// The last successful login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedLogin {
    /// Handle the user logged in with.
    pub handle: String,
    /// Identity hash and server token.
    pub credentials: Credentials,
}

/// Storage backend used by the session.
#[async_trait]
pub trait Store: Send + Sync {
    /// The account key pair, if one was saved.
    async fn load_key_pair(&self) -> Result<Option<KeyPair>, StoreError>;

    /// Save the account key pair.
    async fn save_key_pair(&self, key_pair: &KeyPair) -> Result<(), StoreError>;

    /// Every saved contact.
    async fn load_contacts(&self) -> Result<Vec<StoredContact>, StoreError>;

    /// Insert or replace a contact's ratchet state.
    async fn save_contact(&self, id: &IdentityHash, ratchet_state: &[u8]) -> Result<(), StoreError>;

    /// Delete a contact. Its messages stay.
    async fn remove_contact(&self, id: &IdentityHash) -> Result<(), StoreError>;

    /// Append a message.
    async fn save_message(&self, ratchet_index: u64, message: &SecureMessage) -> Result<(), StoreError>;

    /// Messages sent to or received from `contact`, oldest first.
    async fn load_messages(&self, contact: &IdentityHash) -> Result<Vec<StoredMessage>, StoreError>;

    /// The last saved login.
    async fn load_credentials(&self) -> Result<Option<SavedLogin>, StoreError>;

    /// Remember a login.
    async fn save_credentials(&self, login: &SavedLogin) -> Result<(), StoreError>;
}

#[derive(Default)]
struct Tables {
    key_pair: Option<KeyPair>,
    contacts: BTreeMap<IdentityHash, Vec<u8>>,
    messages: Vec<StoredMessage>,
    login: Option<SavedLogin>,
}

/// In-process [`Store`].
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Backend("store lock poisoned".to_string()))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn load_key_pair(&self) -> Result<Option<KeyPair>, StoreError> {
        Ok(self.tables()?.key_pair.clone())
    }

    async fn save_key_pair(&self, key_pair: &KeyPair) -> Result<(), StoreError> {
        self.tables()?.key_pair = Some(key_pair.clone());
        Ok(())
    }

    async fn load_contacts(&self) -> Result<Vec<StoredContact>, StoreError> {
        Ok(self
            .tables()?
            .contacts
            .iter()
            .map(|(id, state)| StoredContact {
                id: *id,
                ratchet_state: state.clone(),
            })
            .collect())
    }

    async fn save_contact(&self, id: &IdentityHash, ratchet_state: &[u8]) -> Result<(), StoreError> {
        self.tables()?.contacts.insert(*id, ratchet_state.to_vec());
        Ok(())
    }

    async fn remove_contact(&self, id: &IdentityHash) -> Result<(), StoreError> {
        self.tables()?.contacts.remove(id);
        Ok(())
    }

    async fn save_message(&self, ratchet_index: u64, message: &SecureMessage) -> Result<(), StoreError> {
        self.tables()?.messages.push(StoredMessage {
            ratchet_index,
            message: message.clone(),
        });
        Ok(())
    }

    async fn load_messages(&self, contact: &IdentityHash) -> Result<Vec<StoredMessage>, StoreError> {
        Ok(self
            .tables()?
            .messages
            .iter()
            .filter(|row| &row.message.sender == contact || &row.message.receiver == contact)
            .cloned()
            .collect())
    }

    async fn load_credentials(&self) -> Result<Option<SavedLogin>, StoreError> {
        Ok(self.tables()?.login.clone())
    }

    async fn save_credentials(&self, login: &SavedLogin) -> Result<(), StoreError> {
        self.tables()?.login = Some(login.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::AuthToken;

    #[tokio::test]
    async fn test_key_pair_persisted() {
        let store = MemoryStore::new();
        assert!(store.load_key_pair().await.unwrap().is_none());

        let pair = KeyPair::generate().unwrap();
        store.save_key_pair(&pair).await.unwrap();
        assert_eq!(store.load_key_pair().await.unwrap(), Some(pair));
    }

    #[tokio::test]
    async fn test_contacts_replace_and_remove() {
        let store = MemoryStore::new();
        let bob = IdentityHash::from_handle("bob");

        store.save_contact(&bob, &[1, 2, 3]).await.unwrap();
        store.save_contact(&bob, &[4, 5]).await.unwrap();

        let contacts = store.load_contacts().await.unwrap();
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].ratchet_state, vec![4, 5]);

        store.remove_contact(&bob).await.unwrap();
        assert!(store.load_contacts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_messages_filtered_by_contact() {
        let store = MemoryStore::new();
        let alice = IdentityHash::from_handle("alice");
        let bob = IdentityHash::from_handle("bob");
        let carol = IdentityHash::from_handle("carol");

        store
            .save_message(0, &SecureMessage::new_plain(alice, bob, "to bob"))
            .await
            .unwrap();
        store
            .save_message(0, &SecureMessage::new_plain(carol, alice, "from carol"))
            .await
            .unwrap();
        store
            .save_message(1, &SecureMessage::new_plain(bob, alice, "from bob"))
            .await
            .unwrap();

        let with_bob = store.load_messages(&bob).await.unwrap();
        let texts: Vec<_> = with_bob.iter().map(|row| row.message.text().unwrap()).collect();
        assert_eq!(texts, vec![&b"to bob"[..], &b"from bob"[..]]);
        assert_eq!(with_bob[1].ratchet_index, 1);
    }

    #[tokio::test]
    async fn test_credentials() {
        let store = MemoryStore::new();
        let login = SavedLogin {
            handle: "alice".to_string(),
            credentials: Credentials {
                id: IdentityHash::from_handle("alice"),
                token: AuthToken::from_bytes([1u8; 32]),
            },
        };

        store.save_credentials(&login).await.unwrap();
        assert_eq!(store.load_credentials().await.unwrap(), Some(login));
    }
}
