//! Job types and cancellation plumbing for the two serialization queues.
//!
//! Both queues are single-consumer: one worker drains sends, one drains
//! decrypts, so every ratchet mutation on this device is serialized and a
//! DH step triggered by message N can never race message N+1. Tokens
//! cancel queued-but-not-started work only — a job that has begun runs to
//! completion, since no ratchet mutation is safely abandonable halfway.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use dw_proto::address::DeviceAddress;
use dw_proto::frames::{Frame, UpdateMode};

// ── Cancellation ─────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-room cancel tokens. Leaving a room flips its token so queued work
/// for it is dropped by the workers before it starts; work for other rooms
/// is untouched.
#[derive(Default)]
pub struct JobBoard {
    rooms: Mutex<HashMap<String, CancelToken>>,
}

impl JobBoard {
    pub async fn token_for(&self, room_id: &str) -> CancelToken {
        self.rooms
            .lock()
            .await
            .entry(room_id.to_owned())
            .or_default()
            .clone()
    }

    /// Cancel everything queued for a room and install a fresh token for
    /// work enqueued afterwards.
    pub async fn cancel_room(&self, room_id: &str) {
        let mut rooms = self.rooms.lock().await;
        if let Some(previous) = rooms.insert(room_id.to_owned(), CancelToken::new()) {
            previous.cancel();
        }
    }
}

// ── Jobs ─────────────────────────────────────────────────────────────────────

pub enum SendJob {
    Message {
        room_id: String,
        message_id: String,
        plaintext: Vec<u8>,
        content_type: String,
        to_users: Vec<String>,
        cancel: CancelToken,
    },
    Update {
        mode: UpdateMode,
        room_id: String,
        message_id: String,
        /// `None` for revoke; edits carry the replacement content.
        plaintext: Option<Vec<u8>>,
        content_type: Option<String>,
        to_users: Vec<String>,
        cancel: CancelToken,
    },
    /// Answer a peer's decrypt-recovery request. Never room-cancelled:
    /// it repairs the requester's history, not our current view.
    Recovery {
        room_id: String,
        message_id: String,
        requester_user_id: String,
        requester_device_id: Option<String>,
    },
}

impl SendJob {
    pub fn room_id(&self) -> &str {
        match self {
            SendJob::Message { room_id, .. }
            | SendJob::Update { room_id, .. }
            | SendJob::Recovery { room_id, .. } => room_id,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            SendJob::Message { cancel, .. } | SendJob::Update { cancel, .. } => {
                cancel.is_cancelled()
            }
            SendJob::Recovery { .. } => false,
        }
    }
}

pub struct DecryptJob {
    pub from: DeviceAddress,
    pub frame: Frame,
    pub cancel: CancelToken,
}
