//! Decrypt-recovery: when a message fails to decrypt and its author is
//! online, ask that author to re-encrypt it for us under a fresh session.
//!
//! Requester state machine per message: Unsent → Pending → Resolved,
//! TimedOut, or suppressed by Cooldown. Pending entries live here in
//! memory; attempts are also written to the durable resync ledger so the
//! cooldown survives a restart. Unsolicited recovery payloads (nothing
//! Pending for that message) are dropped by the caller via [`RecoveryTracker::is_pending`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use dw_proto::address::DeviceAddress;

// ── Keys ─────────────────────────────────────────────────────────────────────

/// Canonical identity of one recovery attempt. `from_device_id` is the
/// author device when the failing envelope named one; `None` lets any of
/// the author's devices answer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecoveryKey {
    pub room_id: String,
    pub from_user_id: String,
    pub message_id: String,
    pub from_device_id: Option<String>,
}

impl RecoveryKey {
    pub fn new(
        room_id: impl Into<String>,
        from_user_id: impl Into<String>,
        message_id: impl Into<String>,
        from_device_id: Option<String>,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            from_user_id: from_user_id.into(),
            message_id: message_id.into(),
            from_device_id,
        }
    }

    /// Stable string form used as the durable ledger key.
    pub fn ledger_key(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.room_id,
            self.from_user_id,
            self.message_id,
            self.from_device_id.as_deref().unwrap_or("*")
        )
    }

    /// The device to address the request to, when the envelope named one.
    pub fn author_device(&self) -> Option<DeviceAddress> {
        self.from_device_id
            .as_ref()
            .map(|device_id| DeviceAddress::new(&self.from_user_id, device_id))
    }
}

// ── Decisions ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    /// Send the request, record the attempt, arm the timeout.
    Send,
    /// Our own message, or a malformed key. Never sent.
    Invalid,
    /// The author has no online device; nothing would answer.
    Offline,
    /// Already pending, or attempted within the cooldown window.
    Cooldown,
}

// ── Tracker ──────────────────────────────────────────────────────────────────

struct PendingRecovery {
    requested_at: DateTime<Utc>,
    /// Guards the armed timeout against firing on a later re-request.
    generation: u64,
}

#[derive(Default)]
pub struct RecoveryTracker {
    pending: HashMap<RecoveryKey, PendingRecovery>,
    next_generation: u64,
}

impl RecoveryTracker {
    /// Decide whether a failed decrypt becomes a request. `last_attempt`
    /// comes from the durable ledger; `now` is passed in so the window is
    /// testable.
    pub fn evaluate(
        &self,
        key: &RecoveryKey,
        local_user_id: &str,
        author_online: bool,
        last_attempt: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        cooldown: chrono::Duration,
    ) -> RecoveryDecision {
        if key.from_user_id == local_user_id
            || key.room_id.is_empty()
            || key.message_id.is_empty()
        {
            return RecoveryDecision::Invalid;
        }
        if !author_online {
            return RecoveryDecision::Offline;
        }
        if self.pending.contains_key(key) {
            return RecoveryDecision::Cooldown;
        }
        if let Some(at) = last_attempt {
            if now - at < cooldown {
                return RecoveryDecision::Cooldown;
            }
        }
        RecoveryDecision::Send
    }

    /// Mark a request in flight. Returns the generation the caller hands to
    /// [`RecoveryTracker::expire`] when the timeout fires.
    pub fn begin(&mut self, key: RecoveryKey, now: DateTime<Utc>) -> u64 {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.pending.insert(
            key,
            PendingRecovery {
                requested_at: now,
                generation,
            },
        );
        generation
    }

    pub fn is_pending(&self, key: &RecoveryKey) -> bool {
        self.pending.contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// The payload arrived and decrypted. Returns false for unsolicited
    /// payloads, which the caller drops.
    pub fn resolve(&mut self, key: &RecoveryKey) -> bool {
        self.pending.remove(key).is_some()
    }

    /// The timeout fired. Only discards the entry the timeout was armed
    /// for; a re-request after resolve gets a fresh generation and is
    /// untouched by the stale timer.
    pub fn expire(&mut self, key: &RecoveryKey, generation: u64) -> bool {
        match self.pending.get(key) {
            Some(entry) if entry.generation == generation => {
                self.pending.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn requested_at(&self, key: &RecoveryKey) -> Option<DateTime<Utc>> {
        self.pending.get(key).map(|entry| entry.requested_at)
    }
}
