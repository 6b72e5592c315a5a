//! dw_proto — Wire types, envelopes, and serialisation for the Duskwire client
//!
//! Everything here is JSON on the wire: the peer end is a browser client, so
//! field names are camelCase and binary material travels as base64url. Types
//! are versioned to allow future format changes without breaking compatibility.
//!
//! # Modules
//! - `address`  — `user:device` addressing for multi-device fan-out
//! - `envelope` — multi-recipient cipher envelope and per-device wrapped keys
//! - `frames`   — tagged union of WebSocket frames (unknown types rejected)
//! - `codec`    — plaintext padding to fixed-size buckets
//! - `api`      — HTTP request/response bodies for the key directory
//! - `error`    — unified error type

pub mod address;
pub mod api;
pub mod codec;
pub mod envelope;
pub mod error;
pub mod frames;

pub use address::DeviceAddress;
pub use envelope::{CipherEnvelope, WrappedKey};
pub use error::ProtoError;
pub use frames::Frame;
