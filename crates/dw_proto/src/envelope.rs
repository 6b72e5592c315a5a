//! Multi-recipient cipher envelope — what the relay server sees.
//!
//! The server is a DUMB RELAY: it stores and forwards this structure without
//! ever holding a key that opens it. The plaintext is encrypted ONCE under a
//! random content key; that content key is then wrapped separately for every
//! recipient device under that device's current ratchet-derived message key.
//!
//! The envelope is immutable once constructed — an edit or revoke replaces
//! the whole envelope via a `message_update` frame, never patches it.
//!
//! Authenticity: the sender signs a canonical JSON payload of the ciphertext
//! and all metadata (wrapped keys included, so ratchet headers cannot be
//! spliced) with its Ed25519 signing key. Receivers verify before touching
//! any ratchet state.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};

use dw_crypto::error::CryptoError;
use dw_crypto::keys::{self, Jwk, SigningKeyPair};
use dw_crypto::x3dh::PreKeyMessage;

use crate::address::DeviceAddress;
use crate::error::ProtoError;

/// Current envelope format version.
pub const ENVELOPE_VERSION: u8 = 1;

/// Scheme tag carried on every envelope; doubles as the AEAD associated data
/// for the content encryption.
pub const ENCRYPTION_SCHEME: &str = "dw.dr.v1";

/// On-wire envelope. Field names are camelCase for the browser peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CipherEnvelope {
    pub version: u8,

    /// AES-256-GCM ciphertext (+tag) of the padded plaintext, base64url.
    pub ciphertext: String,

    /// 12-byte content IV, base64url.
    pub message_iv: String,

    /// Exactly one entry per intended recipient device, keyed
    /// `"userId:deviceId"`. A receiver that finds no entry for itself was
    /// not an intended recipient.
    pub wrapped_keys: BTreeMap<DeviceAddress, WrappedKey>,

    /// Sender's X25519 identity agreement key.
    pub sender_identity_key_jwk: Jwk,

    /// Sender's Ed25519 signing key — verifies `signature`.
    pub sender_signing_key_jwk: Jwk,

    /// Ed25519 signature over [`CipherEnvelope::signing_payload`], base64url.
    pub signature: String,

    pub sender_device_id: String,

    /// MIME-ish content tag (`"text/plain"`, `"application/json"`, ...).
    pub content_type: String,

    /// Always [`ENCRYPTION_SCHEME`] for this version.
    pub encryption_scheme: String,
}

/// Per-recipient-device wrap of the content key, plus the Double Ratchet
/// header the receiving chain needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WrappedKey {
    /// IV for the content-key wrap, base64url.
    pub iv: String,

    /// Content key encrypted under this device's ratchet message key, base64url.
    pub wrapped_key: String,

    /// Sender's current DH ratchet public key. Schema-optional for older
    /// peers that only attach it on epoch changes; absent means "same chain
    /// as the last message you saw from me".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ratchet_dh_public_key_jwk: Option<Jwk>,

    /// Position in the sender's current sending chain.
    pub message_number: u64,

    /// Length of the sender's previous sending chain, so the receiver knows
    /// how many skipped keys to archive on a DH ratchet step.
    pub previous_chain_length: u64,

    /// Bumped on every re-bootstrap; stale versions never decrypt.
    pub session_version: u32,

    /// X3DH bootstrap material; present while the sender's session for this
    /// device is freshly bootstrapped and unconfirmed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_key_message: Option<PreKeyMessage>,
}

impl CipherEnvelope {
    /// Canonical signing payload: every field except `signature`, serialised
    /// as JSON with alphabetically ordered keys (serde_json's default map is
    /// sorted; this workspace does not enable `preserve_order`).
    ///
    /// Both ends MUST build the identical byte sequence, so the wrapped-keys
    /// map goes through `serde_json::to_value` where struct fields also land
    /// in sorted-key objects.
    pub fn signing_payload(&self) -> Result<Vec<u8>, ProtoError> {
        let payload = serde_json::json!({
            "ciphertext": self.ciphertext,
            "contentType": self.content_type,
            "encryptionScheme": self.encryption_scheme,
            "messageIv": self.message_iv,
            "senderDeviceId": self.sender_device_id,
            "senderIdentityKeyJwk": self.sender_identity_key_jwk,
            "senderSigningKeyJwk": self.sender_signing_key_jwk,
            "version": self.version,
            "wrappedKeys": self.wrapped_keys,
        });
        Ok(serde_json::to_vec(&payload)?)
    }

    /// Sign the canonical payload and store the signature on the envelope.
    pub fn sign_with(&mut self, signing: &SigningKeyPair) -> Result<(), ProtoError> {
        let payload = self.signing_payload()?;
        self.signature = URL_SAFE_NO_PAD.encode(signing.sign(&payload));
        Ok(())
    }

    /// Verify `signature` against the envelope's own signing key.
    ///
    /// This proves internal consistency (nothing between the sender and us
    /// altered ciphertext or metadata). Whether the signing key actually
    /// belongs to the claimed sender is the engine's trust decision.
    pub fn verify_signature(&self) -> Result<(), CryptoError> {
        let key = self.sender_signing_key_jwk.to_ed25519()?;
        let payload = self
            .signing_payload()
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let sig = URL_SAFE_NO_PAD.decode(&self.signature)?;
        keys::verify_detached(&key, &payload, &sig)
    }

    pub fn wrapped_key_for(&self, addr: &DeviceAddress) -> Option<&WrappedKey> {
        self.wrapped_keys.get(addr)
    }

    pub fn sender_address(&self, sender_user_id: &str) -> DeviceAddress {
        DeviceAddress::new(sender_user_id, self.sender_device_id.clone())
    }
}
