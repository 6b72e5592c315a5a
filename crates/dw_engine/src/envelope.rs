//! Envelope assembly and the single-device decrypt path.
//!
//! Encryption is fan-out: one content key encrypts the padded payload once,
//! then each recipient device gets that key wrapped under its own ratchet
//! message key. The Ed25519 signature covers the ciphertext AND every
//! wrapped key, so ratchet headers cannot be spliced between envelopes.
//!
//! Decryption verifies that signature before touching any session or prekey
//! state, then resolves the session (answering an embedded X3DH bootstrap
//! if one is attached), steps the receiving chain, and unwraps inward.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use zeroize::{Zeroize, Zeroizing};

use dw_crypto::aead;
use dw_crypto::keys::Jwk;
use dw_crypto::x3dh;
use dw_crypto::CryptoError;
use dw_proto::address::DeviceAddress;
use dw_proto::codec::{self, PaddingMode};
use dw_proto::envelope::{CipherEnvelope, WrappedKey, ENCRYPTION_SCHEME, ENVELOPE_VERSION};

use crate::error::{EngineError, Result};
use crate::identity::Identity;
use crate::session::SessionEngine;

// ── Encrypt ──────────────────────────────────────────────────────────────────

/// Build one signed envelope addressed to every device in `recipients`.
///
/// Every recipient must have a session (Pending counts); a failure for any
/// of them aborts the whole envelope. Chains already advanced for earlier
/// recipients stay advanced — the receivers' skipped-key caches absorb the
/// gap on the next successful send.
pub fn encrypt_for_recipients(
    sessions: &mut SessionEngine,
    local: &Identity,
    recipients: &[DeviceAddress],
    plaintext: &[u8],
    content_type: &str,
    padding: PaddingMode,
) -> Result<CipherEnvelope> {
    if recipients.is_empty() {
        return Err(EngineError::Protocol("encrypt with no recipient devices".into()));
    }

    let content_key = Zeroizing::new(aead::generate_key());
    let padded = Zeroizing::new(codec::pad_plaintext(plaintext, padding));
    let (message_iv, ciphertext) = aead::encrypt(&content_key, &padded, ENCRYPTION_SCHEME.as_bytes())
        .map_err(|e| EngineError::Protocol(format!("content encrypt: {e}")))?;

    let mut wrapped_keys = std::collections::BTreeMap::new();
    for recipient in recipients {
        let mut step = sessions.advance_sending(recipient)?;
        let (wrap_iv, wrapped) = aead::wrap_key(&step.advance.message_key, &content_key)
            .map_err(|e| EngineError::Protocol(format!("key wrap for {recipient}: {e}")))?;
        step.advance.message_key.zeroize();

        wrapped_keys.insert(
            recipient.clone(),
            WrappedKey {
                iv: URL_SAFE_NO_PAD.encode(wrap_iv),
                wrapped_key: URL_SAFE_NO_PAD.encode(&wrapped),
                ratchet_dh_public_key_jwk: Some(Jwk::from_x25519(&step.advance.ratchet_pub)),
                message_number: step.advance.message_number,
                previous_chain_length: step.advance.previous_chain_length,
                session_version: step.session_version,
                pre_key_message: step.pre_key_message,
            },
        );
    }

    let mut envelope = CipherEnvelope {
        version: ENVELOPE_VERSION,
        ciphertext: URL_SAFE_NO_PAD.encode(&ciphertext),
        message_iv: URL_SAFE_NO_PAD.encode(message_iv),
        wrapped_keys,
        sender_identity_key_jwk: local.identity_jwk(),
        sender_signing_key_jwk: local.signing_jwk(),
        signature: String::new(),
        sender_device_id: local.device_id.clone(),
        content_type: content_type.to_owned(),
        encryption_scheme: ENCRYPTION_SCHEME.to_owned(),
    };
    envelope.sign_with(local.signing())?;
    Ok(envelope)
}

// ── Decrypt ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct DecryptOutcome {
    pub plaintext: Vec<u8>,
    pub content_type: String,
    /// Present when this decrypt moved a session to Established: either the
    /// first proof that a bootstrap we initiated landed, or a fresh
    /// responder install.
    pub established: Option<(DeviceAddress, u32)>,
}

/// Decrypt the wrapped key addressed to `local_address` and then the content.
///
/// Order matters: the signature is checked before any state mutation, so a
/// forged envelope can neither consume a one-time prekey nor step a ratchet.
pub fn decrypt_envelope(
    sessions: &mut SessionEngine,
    local: &mut Identity,
    local_address: &DeviceAddress,
    from: &DeviceAddress,
    envelope: &CipherEnvelope,
) -> Result<DecryptOutcome> {
    let wrapped = envelope
        .wrapped_key_for(local_address)
        .ok_or_else(|| EngineError::Decrypt(format!("no wrapped key for {local_address}")))?;

    envelope
        .verify_signature()
        .map_err(|e| EngineError::Authenticity(format!("envelope from {from}: {e}")))?;

    let newly_installed = resolve_session(sessions, local, from, wrapped, envelope)?;

    let ratchet_pub = match &wrapped.ratchet_dh_public_key_jwk {
        Some(jwk) => jwk
            .to_x25519()
            .map_err(|e| EngineError::Decrypt(format!("ratchet key from {from}: {e}")))?,
        // Schema-optional; fall back to the last pinned key for the session.
        None => sessions
            .slot(from)
            .and_then(|slot| slot.session.remote_ratchet_pub())
            .ok_or_else(|| {
                EngineError::Decrypt(format!("no ratchet key on wire or pinned for {from}"))
            })?,
    };

    let slot = sessions
        .slot_mut(from)
        .ok_or_else(|| EngineError::Decrypt(format!("no session for {from}")))?;
    let mut message_key = slot
        .session
        .advance_receiving_chain(&ratchet_pub, wrapped.message_number, wrapped.previous_chain_length)
        .map_err(|e| classify_ratchet_error(from, e))?;

    let wrap_iv = decode_field(&wrapped.iv, "wrappedKeys.iv")?;
    let wrapped_bytes = decode_field(&wrapped.wrapped_key, "wrappedKeys.wrappedKey")?;
    let unwrapped = aead::unwrap_key(&message_key, &wrap_iv, &wrapped_bytes);
    message_key.zeroize();
    let content_key = Zeroizing::new(
        unwrapped.map_err(|e| EngineError::Decrypt(format!("content key unwrap from {from}: {e}")))?,
    );

    let message_iv = decode_field(&envelope.message_iv, "messageIv")?;
    let ciphertext = decode_field(&envelope.ciphertext, "ciphertext")?;
    let padded = aead::decrypt(&content_key, &message_iv, &ciphertext, ENCRYPTION_SCHEME.as_bytes())
        .map_err(|e| EngineError::Decrypt(format!("content decrypt from {from}: {e}")))?;
    let plaintext =
        codec::unpad_plaintext(&padded).map_err(|e| EngineError::Decrypt(e.to_string()))?;

    let established = newly_installed
        .map(|version| (from.clone(), version))
        .or_else(|| sessions.mark_established(from).map(|version| (from.clone(), version)));

    Ok(DecryptOutcome {
        plaintext,
        content_type: envelope.content_type.clone(),
        established,
    })
}

/// Make sure a session exists that can decrypt `wrapped`, answering the
/// embedded X3DH bootstrap when one is attached. Returns the version of a
/// session this call installed, if any.
fn resolve_session(
    sessions: &mut SessionEngine,
    local: &mut Identity,
    from: &DeviceAddress,
    wrapped: &WrappedKey,
    envelope: &CipherEnvelope,
) -> Result<Option<u32>> {
    let Some(pre_key_message) = &wrapped.pre_key_message else {
        // No bootstrap material: the slot must already exist at this version.
        return match sessions.slot(from) {
            None => Err(EngineError::Decrypt(format!("no session for {from}"))),
            Some(slot) if slot.session.session_version != wrapped.session_version => {
                Err(EngineError::Decrypt(format!(
                    "wrapped key version {} does not match session version {} for {from}",
                    wrapped.session_version, slot.session.session_version
                )))
            }
            Some(_) => Ok(None),
        };
    };

    // The bootstrap identity must be the identity that signed the envelope;
    // the signature check already bound that one to the content.
    if pre_key_message.identity_key_jwk != envelope.sender_identity_key_jwk {
        return Err(EngineError::Integrity(format!(
            "prekey message identity does not match envelope sender for {from}"
        )));
    }

    let ephemeral = pre_key_message
        .ephemeral_key_jwk
        .key_bytes()
        .map_err(|e| EngineError::Decrypt(format!("ephemeral key from {from}: {e}")))?;

    match sessions.slot(from) {
        // A redelivered or reordered copy of a bootstrap already answered:
        // the existing session decrypts it, nothing to install.
        Some(slot)
            if slot.session.session_version == wrapped.session_version
                && slot.responded_ephemeral == Some(ephemeral) =>
        {
            return Ok(None);
        }
        // Older than what we hold: the sender has reset since, or this is a
        // replay. Never tear an established session down for it.
        Some(slot) if wrapped.session_version < slot.session.session_version => {
            return Err(EngineError::Decrypt(format!(
                "stale session version {} for {from} (holding {})",
                wrapped.session_version, slot.session.session_version
            )));
        }
        // Newer version, a different same-version bootstrap, or a crossed
        // bootstrap racing the one we initiated: answer it and replace the
        // slot. Recovery re-converges whatever the replaced slot owed.
        _ => {}
    }

    let (spk_secret, era_identity) = local
        .responder_keys(pre_key_message.signed_pre_key_id)
        .ok_or_else(|| {
            EngineError::Decrypt(format!(
                "signed prekey {} is no longer held",
                pre_key_message.signed_pre_key_id
            ))
        })?;

    let opk_secret = match pre_key_message.one_time_pre_key_id {
        Some(id) => Some(local.take_one_time_pre_key(id).ok_or_else(|| {
            EngineError::Integrity(format!("one-time prekey {id} consumed or unknown"))
        })?),
        None => None,
    };

    let root_key = x3dh::respond(&era_identity, &spk_secret, opk_secret.as_ref(), pre_key_message)
        .map_err(|e| EngineError::Decrypt(format!("bootstrap from {from}: {e}")))?;

    sessions.install_responder(from, wrapped.session_version, root_key, &spk_secret, ephemeral);
    Ok(Some(wrapped.session_version))
}

fn classify_ratchet_error(from: &DeviceAddress, err: CryptoError) -> EngineError {
    match err {
        CryptoError::MessageKeyMissing(n) => EngineError::Decrypt(format!(
            "message key {n} from {from} already consumed or evicted"
        )),
        other => EngineError::Decrypt(format!("ratchet step for {from}: {other}")),
    }
}

fn decode_field(value: &str, field: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|e| EngineError::Decrypt(format!("{field}: {e}")))
}
