//! Events the engine emits toward the UI layer.
//!
//! The engine never renders anything; it reports crypto-layer outcomes on an
//! unbounded channel and the embedding UI decides what a "failed" or
//! "parked" message looks like. Events are `Clone` so tests can assert on
//! them after the fact.

use dw_proto::address::DeviceAddress;
use dw_proto::frames::UpdateMode;

use crate::error::ErrorKind;

#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A pairwise session reached `Established` (handshake ack, or first
    /// successful inbound decrypt).
    SessionEstablished {
        peer: DeviceAddress,
        session_version: u32,
    },

    MessageSent {
        room_id: String,
        message_id: String,
    },

    /// The send ran and failed; the ratchet may already have advanced, so
    /// the engine will not silently retry. The UI offers a fresh send.
    SendFailed {
        room_id: String,
        message_id: String,
        kind: ErrorKind,
    },

    /// The send could not start because `waiting_on` has no published keys
    /// and no session. It is retried automatically once a session with that
    /// user materialises.
    SendParked {
        room_id: String,
        message_id: String,
        waiting_on: String,
    },

    MessageDecrypted {
        room_id: String,
        message_id: String,
        from: DeviceAddress,
        content_type: String,
        plaintext: Vec<u8>,
    },

    /// Decrypt failed; `kind` distinguishes "tampered" from "key miss" so
    /// the UI can phrase it (and the engine may have queued a recovery
    /// request for the key-miss case).
    MessageFailed {
        room_id: String,
        message_id: String,
        from: DeviceAddress,
        kind: ErrorKind,
    },

    /// A recipient device confirmed it decrypted one of our messages.
    MessageAcked {
        room_id: String,
        message_id: String,
        by: DeviceAddress,
    },

    /// Edit (with replacement plaintext) or revoke of an earlier message.
    MessageUpdated {
        room_id: String,
        message_id: String,
        mode: UpdateMode,
        from: DeviceAddress,
        plaintext: Option<Vec<u8>>,
        content_type: Option<String>,
    },

    /// A peer announced new device keys; cached knowledge of that user is
    /// stale and the next send refetches bundles. Surface for "safety
    /// number changed" UI.
    PeerKeysChanged { user_id: String },

    IdentityRotated {
        /// True when the identity/signing pairs changed too, not only the
        /// signed prekey — the safety number changes with it.
        identity_replaced: bool,
    },

    RecoveryRequested {
        room_id: String,
        message_id: String,
        from_user_id: String,
    },
    RecoveryResolved {
        room_id: String,
        message_id: String,
    },
    RecoveryTimedOut {
        room_id: String,
        message_id: String,
    },
}
