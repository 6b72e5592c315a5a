//! Realtime frame union — everything that travels the device-to-device
//! channel (a relay-fanned WebSocket in production, an in-memory pump in
//! tests).
//!
//! Frames are JSON objects discriminated by a `type` field. Parsing is
//! strict: a frame whose `type` we do not recognise is REJECTED, not
//! skipped, so a newer peer cannot silently downgrade us — the caller
//! decides whether rejection is fatal or merely logged.
//!
//! The sending device's identity is NOT trusted from the frame body; the
//! transport layer authenticates the connection and hands the engine a
//! verified [`DeviceAddress`] alongside every inbound frame. Body fields
//! like `fromUserId` exist for routing and UI attribution only.

use serde::{Deserialize, Serialize};

use dw_crypto::keys::Jwk;

use crate::address::DeviceAddress;
use crate::envelope::CipherEnvelope;
use crate::error::ProtoError;

/// Handshake direction marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeStep {
    /// "I have bootstrapped a fresh session toward you."
    Init,
    /// "Seen; my return session is live."
    Ack,
}

/// What a `message_update` does to the original message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    Edit,
    Revoke,
}

/// Recovery request verb. An enum so an unrecognised action fails parsing
/// instead of being mistaken for a resync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Resync,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Broadcast after identity rotation: "my device keys changed, refetch
    /// my bundle before you next encrypt to me."
    #[serde(rename_all = "camelCase")]
    KeyAnnounce {
        public_key_jwk: Jwk,
        signing_public_key_jwk: Jwk,
    },

    /// Session bootstrap notification (init) and its confirmation (ack).
    #[serde(rename_all = "camelCase")]
    DrHandshake {
        step: HandshakeStep,
        #[serde(skip_serializing_if = "Option::is_none")]
        ratchet_dh_public_key_jwk: Option<Jwk>,
        identity_public_key_jwk: Jwk,
        identity_signing_public_key_jwk: Jwk,
        session_version: u32,
    },

    /// An encrypted room message. The envelope's fields sit flattened at the
    /// frame's top level, exactly as the relay stores them.
    #[serde(rename_all = "camelCase")]
    Ciphertext {
        room_id: String,
        message_id: String,
        from_user_id: String,
        #[serde(flatten)]
        envelope: CipherEnvelope,
    },

    /// Receipt: "I decrypted `messageId` successfully." `fromUserId` names
    /// the message AUTHOR (it identifies the message, together with room and
    /// id); the acking device is whoever the transport says sent the frame.
    #[serde(rename_all = "camelCase")]
    DecryptAck {
        room_id: String,
        message_id: String,
        from_user_id: String,
    },

    /// "I could not decrypt `messageId` — reset our session and resend it."
    #[serde(rename_all = "camelCase")]
    DecryptRecoveryRequest {
        room_id: String,
        message_id: String,
        from_user_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        from_device_id: Option<String>,
        to_user_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        to_device_id: Option<String>,
        action: RecoveryAction,
    },

    /// Re-encrypted copy of a message answering a recovery request,
    /// addressed only to the requesting device(s).
    #[serde(rename_all = "camelCase")]
    DecryptRecoveryPayload {
        room_id: String,
        message_id: String,
        from_user_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        from_device_id: Option<String>,
        to_user_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        to_device_id: Option<String>,
        #[serde(flatten)]
        envelope: CipherEnvelope,
    },

    /// Edit or revoke of an earlier message. Edits carry a replacement
    /// envelope; revokes carry none.
    #[serde(rename_all = "camelCase")]
    MessageUpdate {
        mode: UpdateMode,
        room_id: String,
        message_id: String,
        from_user_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        envelope: Option<CipherEnvelope>,
    },
}

const KNOWN_FRAME_TYPES: &[&str] = &[
    "key_announce",
    "dr_handshake",
    "ciphertext",
    "decrypt_ack",
    "decrypt_recovery_request",
    "decrypt_recovery_payload",
    "message_update",
];

impl Frame {
    /// Parse a raw frame, distinguishing "we don't speak this frame type"
    /// from "this frame type is broken".
    pub fn parse(raw: &str) -> Result<Frame, ProtoError> {
        let value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| ProtoError::MalformedFrame(e.to_string()))?;
        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| ProtoError::MalformedFrame("missing `type` discriminant".into()))?;
        if !KNOWN_FRAME_TYPES.contains(&kind) {
            return Err(ProtoError::UnknownFrame(kind.to_owned()));
        }
        serde_json::from_value(value).map_err(|e| ProtoError::MalformedFrame(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, ProtoError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Wire discriminant, for log fields.
    pub fn frame_type(&self) -> &'static str {
        match self {
            Frame::KeyAnnounce { .. } => "key_announce",
            Frame::DrHandshake { .. } => "dr_handshake",
            Frame::Ciphertext { .. } => "ciphertext",
            Frame::DecryptAck { .. } => "decrypt_ack",
            Frame::DecryptRecoveryRequest { .. } => "decrypt_recovery_request",
            Frame::DecryptRecoveryPayload { .. } => "decrypt_recovery_payload",
            Frame::MessageUpdate { .. } => "message_update",
        }
    }
}

/// A frame bound for a specific device, as handed to the transport.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub to: DeviceAddress,
    pub frame: Frame,
}

#[cfg(test)]
mod tests {
    use super::*;
    use dw_crypto::keys::{IdentityKeyPair, SigningKeyPair};

    #[test]
    fn handshake_roundtrip() {
        let identity = IdentityKeyPair::generate();
        let signing = SigningKeyPair::generate();
        let frame = Frame::DrHandshake {
            step: HandshakeStep::Init,
            ratchet_dh_public_key_jwk: Some(identity.public_jwk()),
            identity_public_key_jwk: identity.public_jwk(),
            identity_signing_public_key_jwk: signing.public_jwk(),
            session_version: 3,
        };
        let raw = frame.encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["type"], "dr_handshake");
        assert_eq!(value["step"], "init");
        assert_eq!(value["sessionVersion"], 3);

        match Frame::parse(&raw).unwrap() {
            Frame::DrHandshake { step, session_version, .. } => {
                assert_eq!(step, HandshakeStep::Init);
                assert_eq!(session_version, 3);
            }
            other => panic!("wrong frame: {}", other.frame_type()),
        }
    }

    #[test]
    fn ciphertext_frame_flattens_envelope() {
        use crate::envelope::{CipherEnvelope, ENCRYPTION_SCHEME, ENVELOPE_VERSION};
        use std::collections::BTreeMap;

        let identity = IdentityKeyPair::generate();
        let signing = SigningKeyPair::generate();
        let mut env = CipherEnvelope {
            version: ENVELOPE_VERSION,
            ciphertext: "Y2lwaGVy".into(),
            message_iv: "bm9uY2U".into(),
            wrapped_keys: BTreeMap::new(),
            sender_identity_key_jwk: identity.public_jwk(),
            sender_signing_key_jwk: signing.public_jwk(),
            signature: String::new(),
            sender_device_id: "alice-web".into(),
            content_type: "text/plain".into(),
            encryption_scheme: ENCRYPTION_SCHEME.into(),
        };
        env.sign_with(&signing).unwrap();

        let frame = Frame::Ciphertext {
            room_id: "r1".into(),
            message_id: "m1".into(),
            from_user_id: "alice".into(),
            envelope: env,
        };
        let raw = frame.encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        // Envelope fields live at the frame's top level, not nested.
        assert_eq!(value["type"], "ciphertext");
        assert_eq!(value["roomId"], "r1");
        assert_eq!(value["encryptionScheme"], ENCRYPTION_SCHEME);
        assert!(value.get("envelope").is_none());

        match Frame::parse(&raw).unwrap() {
            Frame::Ciphertext { envelope, .. } => envelope.verify_signature().unwrap(),
            other => panic!("wrong frame: {}", other.frame_type()),
        }
    }

    #[test]
    fn unknown_frame_type_is_rejected() {
        let raw = r#"{"type":"group_call_offer","roomId":"r1"}"#;
        match Frame::parse(raw) {
            Err(ProtoError::UnknownFrame(kind)) => assert_eq!(kind, "group_call_offer"),
            other => panic!("expected UnknownFrame, got {other:?}"),
        }
    }

    #[test]
    fn missing_discriminant_is_malformed() {
        assert!(matches!(
            Frame::parse(r#"{"roomId":"r1"}"#),
            Err(ProtoError::MalformedFrame(_))
        ));
    }

    #[test]
    fn broken_known_frame_is_malformed_not_unknown() {
        // Known type, missing required fields.
        assert!(matches!(
            Frame::parse(r#"{"type":"decrypt_ack","roomId":"r1"}"#),
            Err(ProtoError::MalformedFrame(_))
        ));
    }

    #[test]
    fn revoke_update_omits_envelope() {
        let frame = Frame::MessageUpdate {
            mode: UpdateMode::Revoke,
            room_id: "r1".into(),
            message_id: "m1".into(),
            from_user_id: "alice".into(),
            envelope: None,
        };
        let value: serde_json::Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(value["mode"], "revoke");
        assert!(value.get("envelope").is_none());
    }

    #[test]
    fn recovery_request_action_literal() {
        let frame = Frame::DecryptRecoveryRequest {
            room_id: "r1".into(),
            message_id: "m1".into(),
            from_user_id: "bob".into(),
            from_device_id: Some("phone".into()),
            to_user_id: "alice".into(),
            to_device_id: None,
            action: RecoveryAction::Resync,
        };
        let value: serde_json::Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(value["action"], "resync");
        assert!(value.get("toDeviceId").is_none());
    }
}
