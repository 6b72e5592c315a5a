//! Authenticated Encryption with Associated Data
//!
//! Uses AES-256-GCM throughout (the browser peer relies on WebCrypto, where
//! AES-GCM is the only universally hardware-backed AEAD).
//! Key size: 32 bytes.  IV: 12 bytes (random, carried alongside the
//! ciphertext rather than prepended — the envelope has explicit IV fields).
//! Tag: 16 bytes, appended to the ciphertext.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng as AeadOsRng, Payload},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use zeroize::Zeroizing;

use crate::error::CryptoError;

pub const IV_LEN: usize = 12;
pub const KEY_LEN: usize = 32;

/// Fresh random 32-byte content key.
pub fn generate_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

/// Encrypt `plaintext` with a 32-byte key. Returns (iv, ciphertext+tag).
/// `aad` — additional associated data (authenticated but not encrypted).
pub fn encrypt(
    key: &[u8; 32],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<([u8; IV_LEN], Vec<u8>), CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::AeadEncrypt)?;
    let nonce = Aes256Gcm::generate_nonce(&mut AeadOsRng);

    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::AeadEncrypt)?;

    Ok((nonce.into(), ciphertext))
}

/// Decrypt ciphertext+tag with an explicit 12-byte IV.
pub fn decrypt(
    key: &[u8; 32],
    iv: &[u8],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if iv.len() != IV_LEN {
        return Err(CryptoError::AeadDecrypt);
    }
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::AeadDecrypt)?;
    let nonce = Nonce::from_slice(iv);

    let plaintext = cipher
        .decrypt(nonce, Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::AeadDecrypt)?;

    Ok(Zeroizing::new(plaintext))
}

/// Wrap a 32-byte content key under a ratchet-derived message key.
/// Returns (iv, wrapped key bytes).
pub fn wrap_key(
    wrapping_key: &[u8; 32],
    key_to_wrap: &[u8; 32],
) -> Result<([u8; IV_LEN], Vec<u8>), CryptoError> {
    encrypt(wrapping_key, key_to_wrap, b"dw-key-wrap")
}

/// Unwrap a content key. Fails on tag mismatch or wrong length.
pub fn unwrap_key(
    wrapping_key: &[u8; 32],
    iv: &[u8],
    wrapped: &[u8],
) -> Result<[u8; 32], CryptoError> {
    let plaintext = decrypt(wrapping_key, iv, wrapped, b"dw-key-wrap")?;
    if plaintext.len() != KEY_LEN {
        return Err(CryptoError::InvalidKey("unwrapped key wrong length".into()));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&plaintext);
    Ok(out)
}
