//! dw_engine — Duskwire client session engine
//!
//! The stateful layer between the crypto primitives ([`dw_crypto`]) and the
//! embedding application: per-device identity with rotation, the X3DH /
//! Double Ratchet session arena, the multi-recipient envelope codec, and
//! the serialized decrypt/send pipelines with decrypt recovery.
//!
//! The engine owns no sockets and renders no UI. The transport pushes raw
//! frames in via [`Messenger::handle_frame`] and takes outbound frames from
//! a [`FrameSink`]; outcomes stream out as [`EngineEvent`]s.
//!
//! # Module layout
//! - `identity`  — device identity record, prekey pools, rotation schedule
//! - `session`   — slot arena: bootstrap, versioning, Pending/Established
//! - `envelope`  — encrypt-for-recipients / decrypt with session resolution
//! - `handshake` — `dr_handshake` init/ack protocol handler
//! - `recovery`  — decrypt-recovery request state machine
//! - `pipeline`  — job types, cancel tokens, per-room job board
//! - `client`    — the [`Messenger`] façade wiring it all together
//! - `directory` — prekey-bundle HTTP client + in-memory test double
//! - `presence`  — who is online, per device
//! - `store`     — persistence seams (key store, plaintext cache, ledger)

pub mod client;
pub mod config;
pub mod directory;
pub mod envelope;
pub mod error;
pub mod events;
pub mod handshake;
pub mod identity;
pub mod pipeline;
pub mod presence;
pub mod recovery;
pub mod session;
pub mod store;

pub use client::{FrameSink, Messenger};
pub use config::EngineConfig;
pub use directory::{Directory, HttpDirectory, MemoryDirectory};
pub use error::{EngineError, ErrorKind, Result};
pub use events::EngineEvent;
pub use identity::Identity;
pub use session::SessionStatus;
pub use store::{
    CachedMessage, KeyStore, MemoryKeyStore, MemoryPlaintextCache, MemoryResyncLedger,
    PlaintextCache, ResyncLedger,
};
