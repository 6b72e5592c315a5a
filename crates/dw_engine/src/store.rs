//! Storage boundaries.
//!
//! The engine does not own a storage engine. The embedding application
//! supplies these three collaborators (in production an encrypted local
//! store; in tests the in-memory implementations below):
//!
//! - [`KeyStore`] — opaque serialized identity records. The engine hands
//!   over bytes that already contain secret material; encrypting them at
//!   rest is the store's job.
//! - [`PlaintextCache`] — plaintexts this device sent or successfully
//!   decrypted, kept so a `decrypt_recovery_request` can be answered.
//!   Purely a recovery aid; revoked messages are removed.
//! - [`ResyncLedger`] — durable timestamps of sent recovery requests, so
//!   the cooldown survives a page reload.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::Result;

// ── Traits ───────────────────────────────────────────────────────────────────

#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn load_identity(&self, user_id: &str, device_id: &str) -> Result<Option<Vec<u8>>>;
    async fn store_identity(&self, user_id: &str, device_id: &str, record: &[u8]) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedMessage {
    pub plaintext: Vec<u8>,
    pub content_type: String,
}

#[async_trait]
pub trait PlaintextCache: Send + Sync {
    async fn put(&self, room_id: &str, message_id: &str, message: CachedMessage) -> Result<()>;
    async fn get(&self, room_id: &str, message_id: &str) -> Result<Option<CachedMessage>>;
    /// Revoked messages must stop being recoverable.
    async fn remove(&self, room_id: &str, message_id: &str) -> Result<()>;
}

#[async_trait]
pub trait ResyncLedger: Send + Sync {
    async fn last_attempt(&self, key: &str) -> Result<Option<DateTime<Utc>>>;
    async fn record_attempt(&self, key: &str, at: DateTime<Utc>) -> Result<()>;
}

// ── In-memory implementations ────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryKeyStore {
    records: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn load_identity(&self, user_id: &str, device_id: &str) -> Result<Option<Vec<u8>>> {
        let records = self.records.lock().await;
        Ok(records.get(&(user_id.to_owned(), device_id.to_owned())).cloned())
    }

    async fn store_identity(&self, user_id: &str, device_id: &str, record: &[u8]) -> Result<()> {
        let mut records = self.records.lock().await;
        records.insert((user_id.to_owned(), device_id.to_owned()), record.to_vec());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryPlaintextCache {
    messages: Mutex<HashMap<(String, String), CachedMessage>>,
}

impl MemoryPlaintextCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PlaintextCache for MemoryPlaintextCache {
    async fn put(&self, room_id: &str, message_id: &str, message: CachedMessage) -> Result<()> {
        let mut messages = self.messages.lock().await;
        messages.insert((room_id.to_owned(), message_id.to_owned()), message);
        Ok(())
    }

    async fn get(&self, room_id: &str, message_id: &str) -> Result<Option<CachedMessage>> {
        let messages = self.messages.lock().await;
        Ok(messages.get(&(room_id.to_owned(), message_id.to_owned())).cloned())
    }

    async fn remove(&self, room_id: &str, message_id: &str) -> Result<()> {
        let mut messages = self.messages.lock().await;
        messages.remove(&(room_id.to_owned(), message_id.to_owned()));
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryResyncLedger {
    attempts: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl MemoryResyncLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResyncLedger for MemoryResyncLedger {
    async fn last_attempt(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        let attempts = self.attempts.lock().await;
        Ok(attempts.get(key).copied())
    }

    async fn record_attempt(&self, key: &str, at: DateTime<Utc>) -> Result<()> {
        let mut attempts = self.attempts.lock().await;
        attempts.insert(key.to_owned(), at);
        Ok(())
    }
}
