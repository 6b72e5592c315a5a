//! dw_crypto — Duskwire client cryptographic primitives
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - Public APIs hand out opaque key types; raw secret bytes leave only
//!   through the engine's serialized identity record.
//!
//! # Module layout
//! - `keys`    — X25519 identity + Ed25519 signing pairs, OKP JWK encoding
//! - `x3dh`    — X3DH asynchronous key agreement (SPK verification, prekey messages)
//! - `ratchet` — full Double Ratchet with DH ratchet steps + skipped message keys
//! - `aead`    — AES-256-GCM encrypt/decrypt and content-key wrapping
//! - `kdf`     — HKDF root-key mixing / HMAC chain steps
//! - `hash`    — BLAKE3 utilities (message IDs, safety numbers)
//! - `error`   — unified error type

pub mod aead;
pub mod error;
pub mod hash;
pub mod kdf;
pub mod keys;
pub mod ratchet;
pub mod x3dh;

pub use error::CryptoError;
