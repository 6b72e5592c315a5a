//! Engine error taxonomy.
//!
//! The categories carry RETRY SEMANTICS, not just blame: `Network` is safe
//! to repeat verbatim; `Decrypt` is not (a desynced ratchet goes through the
//! recovery protocol, never through a retry loop); `Authenticity` and
//! `Integrity` end the operation outright. `dw_crypto`'s errors are
//! classified into these categories at each call site — a signature failure
//! means different things during bundle verification and during envelope
//! decryption, so there is deliberately no blanket `From<CryptoError>`.

use thiserror::Error;

use dw_proto::address::DeviceAddress;
use dw_proto::error::ProtoError;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Identity or session persistence unavailable. Fatal for the operation:
    /// the engine never falls back to ephemeral keys.
    #[error("storage failure: {0}")]
    Storage(String),

    /// Signature/consumed-key violation while establishing trust (bundle
    /// verification, one-time prekey reuse). Nothing gets established.
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// Envelope signature mismatch. The message is undecryptable; plaintext
    /// from such an envelope is never surfaced.
    #[error("authenticity failure: {0}")]
    Authenticity(String),

    /// Key or session-state miss. Triggers the recovery flow; the message is
    /// shown as failed rather than as garbled plaintext.
    #[error("unable to decrypt: {0}")]
    Decrypt(String),

    /// The recipient has no usable session yet; the send is parked until a
    /// handshake or bundle makes one.
    #[error("no usable session with {peer} yet")]
    SessionPending { peer: DeviceAddress },

    #[error("network failure: {0}")]
    Network(String),

    /// Malformed or unexpected wire data.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// The taxonomy category alone — `Copy`, so events can carry it after the
/// error itself was consumed or logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Storage,
    Integrity,
    Authenticity,
    Decrypt,
    SessionPending,
    Network,
    Protocol,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Storage(_) => ErrorKind::Storage,
            EngineError::Integrity(_) => ErrorKind::Integrity,
            EngineError::Authenticity(_) => ErrorKind::Authenticity,
            EngineError::Decrypt(_) => ErrorKind::Decrypt,
            EngineError::SessionPending { .. } => ErrorKind::SessionPending,
            EngineError::Network(_) => ErrorKind::Network,
            EngineError::Protocol(_) => ErrorKind::Protocol,
        }
    }
}

impl From<ProtoError> for EngineError {
    fn from(e: ProtoError) -> Self {
        EngineError::Protocol(e.to_string())
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        EngineError::Network(e.to_string())
    }
}
