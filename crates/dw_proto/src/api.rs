//! Key-directory request/response types. These map directly to JSON bodies
//! on the wire; field names are camelCase for the browser peer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dw_crypto::keys::Jwk;
use dw_crypto::x3dh::DeviceKeyBundle;

// ── Publishing ───────────────────────────────────────────────────────────────

/// Upload a device's public key material after enrolment or rotation.
///
/// The upload is a full replacement of whatever the directory held for this
/// device: static material (identity, signing, signed prekey) plus the
/// device's entire unconsumed one-time pool. The directory keeps its own
/// record of ids it has already handed out and never hands one out twice,
/// even if a re-upload lists it again.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishBundleRequest {
    pub user_id: String,
    pub device_id: String,
    pub identity_key_jwk: Jwk,
    pub signing_key_jwk: Jwk,
    pub signed_pre_key_id: u32,
    pub signed_pre_key_jwk: Jwk,
    /// Ed25519 signature over the SPK public bytes, base64url.
    pub signed_pre_key_signature: String,
    pub one_time_pre_keys: Vec<OneTimePreKeyUpload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OneTimePreKeyUpload {
    pub id: u32,
    pub jwk: Jwk,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishBundleResponse {
    pub published_at: DateTime<Utc>,
    /// One-time prekeys remaining in the pool AFTER this upload.
    pub one_time_pre_keys_remaining: u32,
}

// ── Fetching ─────────────────────────────────────────────────────────────────

/// All bundles for a user, one per enrolled device. Each bundle carries AT
/// MOST one one-time prekey, which the directory deletes on hand-out; a
/// drained pool yields bundles with no one-time prekey rather than an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserBundlesResponse {
    pub user_id: String,
    pub bundles: Vec<DeviceKeyBundle>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OneTimePreKeyCountResponse {
    pub device_id: String,
    pub remaining: u32,
}

// ── Common ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use dw_crypto::keys::{IdentityKeyPair, SigningKeyPair};
    use dw_crypto::x3dh;

    #[test]
    fn publish_request_wire_shape() {
        let identity = IdentityKeyPair::generate();
        let signing = SigningKeyPair::generate();
        let (_, spk_pub, spk_sig) = x3dh::generate_signed_prekey(&signing);
        let req = PublishBundleRequest {
            user_id: "alice".into(),
            device_id: "web-1".into(),
            identity_key_jwk: identity.public_jwk(),
            signing_key_jwk: signing.public_jwk(),
            signed_pre_key_id: 7,
            signed_pre_key_jwk: Jwk::from_x25519(&spk_pub),
            signed_pre_key_signature: base64::Engine::encode(
                &base64::engine::general_purpose::URL_SAFE_NO_PAD,
                spk_sig,
            ),
            one_time_pre_keys: vec![],
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["signedPreKeyId"], 7);
        assert!(value.get("identityKeyJwk").is_some());
        assert!(value.get("oneTimePreKeys").is_some());
    }
}
