//! Key material types.
//!
//! Each device holds two long-term pairs:
//!   - `IdentityKeyPair`  — X25519, participates in X3DH key agreement.
//!   - `SigningKeyPair`   — Ed25519, signs prekey bundles and envelopes.
//!
//! Public halves travel as OKP JWKs (`{"kty":"OKP","crv":...,"x":...}`)
//! because the peer end of the wire is a browser using WebCrypto exports.
//!
//! Secret halves are zeroized on drop and leave the process only through
//! the engine's serialized identity record (stored opaquely by the caller's
//! encrypted store).

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, SharedSecret, StaticSecret};
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

// ── JWK encoding ─────────────────────────────────────────────────────────────

pub const JWK_KTY_OKP: &str = "OKP";
pub const JWK_CRV_X25519: &str = "X25519";
pub const JWK_CRV_ED25519: &str = "Ed25519";

/// Minimal OKP JSON Web Key: exactly what WebCrypto exports for raw
/// Curve25519 public keys. Private-half fields (`d`) are never represented.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    pub crv: String,
    /// base64url (unpadded) raw 32-byte public key
    pub x: String,
}

impl Jwk {
    pub fn from_x25519(key: &X25519Public) -> Self {
        Self {
            kty: JWK_KTY_OKP.into(),
            crv: JWK_CRV_X25519.into(),
            x: URL_SAFE_NO_PAD.encode(key.as_bytes()),
        }
    }

    pub fn from_ed25519(key: &VerifyingKey) -> Self {
        Self {
            kty: JWK_KTY_OKP.into(),
            crv: JWK_CRV_ED25519.into(),
            x: URL_SAFE_NO_PAD.encode(key.as_bytes()),
        }
    }

    /// Decode the `x` member into raw key bytes (curve checked by caller).
    pub fn key_bytes(&self) -> Result<[u8; 32], CryptoError> {
        let bytes = URL_SAFE_NO_PAD.decode(&self.x)?;
        bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey(format!("JWK x must be 32 bytes, got {}", bytes.len())))
    }

    pub fn to_x25519(&self) -> Result<X25519Public, CryptoError> {
        if self.kty != JWK_KTY_OKP || self.crv != JWK_CRV_X25519 {
            return Err(CryptoError::InvalidKey(format!(
                "expected OKP/X25519 JWK, got {}/{}",
                self.kty, self.crv
            )));
        }
        Ok(X25519Public::from(self.key_bytes()?))
    }

    pub fn to_ed25519(&self) -> Result<VerifyingKey, CryptoError> {
        if self.kty != JWK_KTY_OKP || self.crv != JWK_CRV_ED25519 {
            return Err(CryptoError::InvalidKey(format!(
                "expected OKP/Ed25519 JWK, got {}/{}",
                self.kty, self.crv
            )));
        }
        VerifyingKey::from_bytes(&self.key_bytes()?)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }
}

// ── Identity agreement keypair (X25519) ──────────────────────────────────────

/// Long-term X25519 identity key. Drop clears memory via ZeroizeOnDrop.
#[derive(ZeroizeOnDrop)]
pub struct IdentityKeyPair {
    #[zeroize(skip)]
    public: X25519Public,
    secret: [u8; 32],
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        Self {
            public: X25519Public::from(&secret),
            secret: secret.to_bytes(),
        }
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        let secret = StaticSecret::from(*bytes);
        Self {
            public: X25519Public::from(&secret),
            secret: secret.to_bytes(),
        }
    }

    pub fn public(&self) -> X25519Public {
        self.public
    }

    pub fn public_jwk(&self) -> Jwk {
        Jwk::from_x25519(&self.public)
    }

    pub fn diffie_hellman(&self, peer: &X25519Public) -> SharedSecret {
        StaticSecret::from(self.secret).diffie_hellman(peer)
    }

    /// Raw secret bytes — only for the serialized identity record.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.secret
    }
}

// ── Signing keypair (Ed25519) ────────────────────────────────────────────────

/// Long-term Ed25519 signing key. Drop clears memory via ZeroizeOnDrop.
#[derive(ZeroizeOnDrop)]
pub struct SigningKeyPair {
    #[zeroize(skip)]
    verifying: VerifyingKey,
    secret: [u8; 32],
}

impl SigningKeyPair {
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        Self {
            verifying: signing.verifying_key(),
            secret: signing.to_bytes(),
        }
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(bytes);
        Self {
            verifying: signing.verifying_key(),
            secret: *bytes,
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.verifying
    }

    pub fn public_jwk(&self) -> Jwk {
        Jwk::from_ed25519(&self.verifying)
    }

    /// Sign arbitrary bytes; returns the 64-byte raw Ed25519 signature.
    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        SigningKey::from_bytes(&self.secret).sign(msg).to_bytes().to_vec()
    }

    /// Raw secret bytes — only for the serialized identity record.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.secret
    }
}

/// Verify a detached Ed25519 signature made by any verifying key.
pub fn verify_detached(key: &VerifyingKey, msg: &[u8], sig: &[u8]) -> Result<(), CryptoError> {
    let sig = Signature::from_bytes(
        sig.try_into()
            .map_err(|_| CryptoError::InvalidKey("signature must be 64 bytes".into()))?,
    );
    key.verify(msg, &sig)
        .map_err(|_| CryptoError::SignatureVerification)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jwk_roundtrip_x25519() {
        let pair = IdentityKeyPair::generate();
        let jwk = pair.public_jwk();
        assert_eq!(jwk.crv, JWK_CRV_X25519);
        assert_eq!(jwk.to_x25519().unwrap(), pair.public());
    }

    #[test]
    fn jwk_roundtrip_ed25519() {
        let pair = SigningKeyPair::generate();
        let jwk = pair.public_jwk();
        assert_eq!(jwk.to_ed25519().unwrap(), pair.verifying_key());
    }

    #[test]
    fn jwk_rejects_curve_mismatch() {
        let pair = SigningKeyPair::generate();
        let jwk = pair.public_jwk();
        assert!(jwk.to_x25519().is_err(), "Ed25519 JWK must not decode as X25519");
    }

    #[test]
    fn sign_and_verify() {
        let pair = SigningKeyPair::generate();
        let sig = pair.sign(b"hello");
        verify_detached(&pair.verifying_key(), b"hello", &sig).unwrap();
        assert!(verify_detached(&pair.verifying_key(), b"tampered", &sig).is_err());
    }

    #[test]
    fn identity_from_bytes_is_stable() {
        let a = IdentityKeyPair::generate();
        let b = IdentityKeyPair::from_bytes(&a.to_bytes());
        assert_eq!(a.public(), b.public());
    }
}
