//! X3DH asynchronous key agreement.
//!
//! References:
//!   - Signal X3DH spec: <https://signal.org/docs/specifications/x3dh/>
//!   - RFC 7748 (X25519): <https://datatracker.ietf.org/doc/html/rfc7748>
//!   - RFC 5869 (HKDF):  <https://datatracker.ietf.org/doc/html/rfc5869>
//!
//! Protocol:
//!   The initiator fetches the peer device's published key bundle:
//!     IK_B  (X25519 identity agreement key)
//!     SPK_B (signed prekey, X25519) + Ed25519 signature over SPK_B
//!     OPK_B (optional one-time prekey, X25519; server hands out each at most once)
//!
//!   The initiator generates ONE ephemeral keypair EK_A.
//!
//!   DH calculations (using the single EK_A throughout):
//!     DH1 = DH(IK_A, SPK_B)   — mutual authentication
//!     DH2 = DH(EK_A, IK_B)    — forward secrecy
//!     DH3 = DH(EK_A, SPK_B)   — replay protection
//!     DH4 = DH(EK_A, OPK_B)   — one-time forward secrecy [optional]
//!
//!   SK = HKDF(salt=0, ikm = 0xFF*32 || DH1 || DH2 || DH3 [|| DH4], info="dw-x3dh-v1")
//!
//! Non-negotiable:
//!   - The SPK signature MUST verify before any DH is computed.
//!   - The initiator embeds (IK_A, EK_A, spk id, opk id?) in the first
//!     wrapped keys as a `PreKeyMessage`; the responder reconstructs the
//!     same DH set and derives SK.
//!   - SK feeds the Double Ratchet as the initial root key.

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroize;

use crate::{
    error::CryptoError,
    kdf,
    keys::{self, IdentityKeyPair, Jwk, SigningKeyPair},
};

// ── Prekey bundle ────────────────────────────────────────────────────────────

/// Published per device via the directory service, consumed by initiators.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceKeyBundle {
    pub user_id: String,
    pub device_id: String,
    /// X25519 identity agreement key
    pub identity_key_jwk: Jwk,
    /// Ed25519 signing key — verifies the SPK signature and later envelopes
    pub signing_key_jwk: Jwk,
    pub signed_pre_key_id: u32,
    pub signed_pre_key_jwk: Jwk,
    /// Ed25519 signature over the raw SPK public bytes (base64url)
    pub signed_pre_key_signature: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub one_time_pre_key_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub one_time_pre_key_jwk: Option<Jwk>,
}

impl DeviceKeyBundle {
    /// Verify the SPK signature against the bundle's own signing key.
    /// A bundle that fails here must never reach a DH computation.
    pub fn verify(&self) -> Result<(), CryptoError> {
        use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
        let signing = self.signing_key_jwk.to_ed25519()?;
        let spk_raw = self.signed_pre_key_jwk.key_bytes()?;
        let sig = URL_SAFE_NO_PAD.decode(&self.signed_pre_key_signature)?;
        keys::verify_detached(&signing, &spk_raw, &sig)
    }
}

/// Generate a signed prekey: an X25519 keypair with the public half signed
/// by the device's Ed25519 signing key.
pub fn generate_signed_prekey(signing: &SigningKeyPair) -> (StaticSecret, X25519Public, Vec<u8>) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = X25519Public::from(&secret);
    let sig = signing.sign(public.as_bytes());
    (secret, public, sig)
}

/// Generate a batch of one-time prekeys (X25519).
pub fn generate_one_time_prekeys(count: usize) -> Vec<(StaticSecret, X25519Public)> {
    (0..count)
        .map(|_| {
            let s = StaticSecret::random_from_rng(OsRng);
            let p = X25519Public::from(&s);
            (s, p)
        })
        .collect()
}

// ── PreKey message ───────────────────────────────────────────────────────────

/// Embedded in the wrapped keys of a fresh session's first message(s) so the
/// responder can derive the same SK.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyMessage {
    /// Initiator's X25519 identity agreement key
    pub identity_key_jwk: Jwk,
    /// Initiator's ephemeral X25519 public key
    pub ephemeral_key_jwk: Jwk,
    /// Which of the responder's signed prekeys was used
    pub signed_pre_key_id: u32,
    /// Which one-time prekey was consumed (`None` if the bundle had none)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub one_time_pre_key_id: Option<u32>,
}

// ── Initiator ────────────────────────────────────────────────────────────────

/// Result of the initiator side: the root key plus the prekey message the
/// responder needs, plus the SPK that seeds the remote ratchet key.
pub struct InitiateOutcome {
    /// 32-byte shared key → feeds into the Double Ratchet as initial root key
    pub root_key: [u8; 32],
    pub pre_key_message: PreKeyMessage,
    /// The responder's SPK — becomes the initiator's first remote ratchet key
    pub remote_spk: X25519Public,
}

/// Initiate a session toward one remote device.
///
/// Steps:
///   1. Verify the SPK signature (bundle rejected otherwise).
///   2. Generate ONE ephemeral X25519 keypair EK_A.
///   3. Compute DH1..DH4.
///   4. Derive SK via HKDF.
pub fn initiate(
    local_identity: &IdentityKeyPair,
    bundle: &DeviceKeyBundle,
) -> Result<InitiateOutcome, CryptoError> {
    // ── 1. Verify SPK signature ──────────────────────────────────────────
    bundle.verify()?;

    let ik_b = bundle.identity_key_jwk.to_x25519()?;
    let spk_b = bundle.signed_pre_key_jwk.to_x25519()?;

    // ── 2. Generate ephemeral key ────────────────────────────────────────
    let ek_a = StaticSecret::random_from_rng(OsRng);
    let ek_a_pub = X25519Public::from(&ek_a);

    // ── 3. DH calculations (single EK for all) ───────────────────────────
    let dh1 = local_identity.diffie_hellman(&spk_b); // IK_A × SPK_B
    let dh2 = ek_a.diffie_hellman(&ik_b);            // EK_A × IK_B
    let dh3 = ek_a.diffie_hellman(&spk_b);           // EK_A × SPK_B

    let mut ikm = vec![0xFFu8; 32]; // domain separation pad
    ikm.extend_from_slice(dh1.as_bytes());
    ikm.extend_from_slice(dh2.as_bytes());
    ikm.extend_from_slice(dh3.as_bytes());

    let mut opk_id_out = None;
    if let Some(ref opk_jwk) = bundle.one_time_pre_key_jwk {
        let opk_b = opk_jwk.to_x25519()?;
        let dh4 = ek_a.diffie_hellman(&opk_b); // EK_A × OPK_B
        ikm.extend_from_slice(dh4.as_bytes());
        opk_id_out = bundle.one_time_pre_key_id;
    }

    // ── 4. Derive SK ─────────────────────────────────────────────────────
    let mut sk = [0u8; 32];
    kdf::hkdf_expand(&ikm, Some(&[0u8; 32]), b"dw-x3dh-v1", &mut sk)?;
    ikm.zeroize();

    Ok(InitiateOutcome {
        root_key: sk,
        pre_key_message: PreKeyMessage {
            identity_key_jwk: local_identity.public_jwk(),
            ephemeral_key_jwk: Jwk::from_x25519(&ek_a_pub),
            signed_pre_key_id: bundle.signed_pre_key_id,
            one_time_pre_key_id: opk_id_out,
        },
        remote_spk: spk_b,
    })
}

// ── Responder ────────────────────────────────────────────────────────────────

/// Reconstruct SK from an embedded prekey message.
///
/// `local_identity`  — this device's X25519 identity pair
/// `spk_secret`      — the referenced signed-prekey secret (active or retired)
/// `opk_secret`      — the consumed one-time prekey secret, if one was used
pub fn respond(
    local_identity: &IdentityKeyPair,
    spk_secret: &StaticSecret,
    opk_secret: Option<&StaticSecret>,
    message: &PreKeyMessage,
) -> Result<[u8; 32], CryptoError> {
    let ik_a = message.identity_key_jwk.to_x25519()?;
    let ek_a = message.ephemeral_key_jwk.to_x25519()?;

    // Mirror the initiator's DH order exactly (commutative pairings):
    //   DH1 = IK_A × SPK_B   →  here: SPK_B × IK_A
    //   DH2 = EK_A × IK_B    →  here: IK_B × EK_A
    //   DH3 = EK_A × SPK_B   →  here: SPK_B × EK_A
    let dh1 = spk_secret.diffie_hellman(&ik_a);
    let dh2 = local_identity.diffie_hellman(&ek_a);
    let dh3 = spk_secret.diffie_hellman(&ek_a);

    let mut ikm = vec![0xFFu8; 32];
    ikm.extend_from_slice(dh1.as_bytes());
    ikm.extend_from_slice(dh2.as_bytes());
    ikm.extend_from_slice(dh3.as_bytes());

    if let Some(opk) = opk_secret {
        let dh4 = opk.diffie_hellman(&ek_a);
        ikm.extend_from_slice(dh4.as_bytes());
    }

    let mut sk = [0u8; 32];
    kdf::hkdf_expand(&ikm, Some(&[0u8; 32]), b"dw-x3dh-v1", &mut sk)?;
    ikm.zeroize();

    Ok(sk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

    fn bundle_for(
        identity: &IdentityKeyPair,
        signing: &SigningKeyPair,
        spk_pub: &X25519Public,
        spk_sig: &[u8],
        opk: Option<(u32, &X25519Public)>,
    ) -> DeviceKeyBundle {
        DeviceKeyBundle {
            user_id: "bob".into(),
            device_id: "bob-dev-1".into(),
            identity_key_jwk: identity.public_jwk(),
            signing_key_jwk: signing.public_jwk(),
            signed_pre_key_id: 1,
            signed_pre_key_jwk: Jwk::from_x25519(spk_pub),
            signed_pre_key_signature: URL_SAFE_NO_PAD.encode(spk_sig),
            one_time_pre_key_id: opk.map(|(id, _)| id),
            one_time_pre_key_jwk: opk.map(|(_, pk)| Jwk::from_x25519(pk)),
        }
    }

    #[test]
    fn roundtrip_without_opk() {
        let alice_ik = IdentityKeyPair::generate();
        let bob_ik = IdentityKeyPair::generate();
        let bob_signing = SigningKeyPair::generate();
        let (bob_spk_secret, bob_spk_pub, bob_spk_sig) = generate_signed_prekey(&bob_signing);

        let bundle = bundle_for(&bob_ik, &bob_signing, &bob_spk_pub, &bob_spk_sig, None);

        let outcome = initiate(&alice_ik, &bundle).unwrap();
        let bob_sk = respond(&bob_ik, &bob_spk_secret, None, &outcome.pre_key_message).unwrap();

        assert_eq!(outcome.root_key, bob_sk, "both sides must derive the same SK");
        assert_eq!(outcome.remote_spk, bob_spk_pub);
        assert!(outcome.pre_key_message.one_time_pre_key_id.is_none());
    }

    #[test]
    fn roundtrip_with_opk() {
        let alice_ik = IdentityKeyPair::generate();
        let bob_ik = IdentityKeyPair::generate();
        let bob_signing = SigningKeyPair::generate();
        let (bob_spk_secret, bob_spk_pub, bob_spk_sig) = generate_signed_prekey(&bob_signing);
        let opks = generate_one_time_prekeys(1);
        let (ref opk_secret, ref opk_pub) = opks[0];

        let bundle = bundle_for(
            &bob_ik,
            &bob_signing,
            &bob_spk_pub,
            &bob_spk_sig,
            Some((7, opk_pub)),
        );

        let outcome = initiate(&alice_ik, &bundle).unwrap();
        let bob_sk = respond(
            &bob_ik,
            &bob_spk_secret,
            Some(opk_secret),
            &outcome.pre_key_message,
        )
        .unwrap();

        assert_eq!(outcome.root_key, bob_sk);
        assert_eq!(outcome.pre_key_message.one_time_pre_key_id, Some(7));
    }

    #[test]
    fn rejects_invalid_spk_signature() {
        let alice_ik = IdentityKeyPair::generate();
        let bob_ik = IdentityKeyPair::generate();
        let bob_signing = SigningKeyPair::generate();
        let evil_signing = SigningKeyPair::generate();

        let (_spk_secret, spk_pub, _good_sig) = generate_signed_prekey(&bob_signing);
        // Sign the SPK with the wrong key, but claim it's bob's
        let evil_sig = evil_signing.sign(spk_pub.as_bytes());

        let bundle = bundle_for(&bob_ik, &bob_signing, &spk_pub, &evil_sig, None);

        assert!(
            initiate(&alice_ik, &bundle).is_err(),
            "must reject an SPK signed by the wrong identity"
        );
    }

    #[test]
    fn distinct_opk_changes_the_key() {
        let alice_ik = IdentityKeyPair::generate();
        let bob_ik = IdentityKeyPair::generate();
        let bob_signing = SigningKeyPair::generate();
        let (_spk_secret, spk_pub, spk_sig) = generate_signed_prekey(&bob_signing);
        let opks = generate_one_time_prekeys(2);

        let with = |opk: &X25519Public, id| {
            let bundle = bundle_for(&bob_ik, &bob_signing, &spk_pub, &spk_sig, Some((id, opk)));
            initiate(&alice_ik, &bundle).unwrap().root_key
        };

        assert_ne!(with(&opks[0].1, 0), with(&opks[1].1, 1));
    }
}
