//! Per-device identity material: long-term pairs, the active signed prekey,
//! the one-time prekey pool, and bounded rotation history.
//!
//! Rotation discipline: exactly one ACTIVE signed prekey at any time. A
//! rotation retires the outgoing material into a newest-first history so
//! bootstraps that referenced the old prekey ids keep working for a while;
//! the history is truncated to `identity_history_cap`, and anything that
//! falls off the end is gone — messages bootstrapped against evicted
//! material are not decryptable anymore, which is the documented price of
//! bounded retention.
//!
//! Secrets leave this module only inside the serialized record handed to
//! the [`KeyStore`](crate::store::KeyStore); the store is expected to
//! encrypt it at rest. In memory everything zeroizes on drop.

use std::collections::HashMap;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroizing;

use dw_crypto::hash;
use dw_crypto::keys::{IdentityKeyPair, Jwk, SigningKeyPair};
use dw_crypto::x3dh;
use dw_proto::address::DeviceAddress;
use dw_proto::api::{OneTimePreKeyUpload, PublishBundleRequest};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::store::KeyStore;

/// Device ids are opaque to the protocol; enrolment mints one of these.
pub fn fresh_device_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ── Active material ──────────────────────────────────────────────────────────

/// The active signed prekey: X25519 pair plus the Ed25519 signature over the
/// public half.
pub struct SignedPreKey {
    pub key_id: u32,
    secret: StaticSecret,
    pub public: X25519Public,
    pub signature: Vec<u8>,
}

impl SignedPreKey {
    fn generate(key_id: u32, signing: &SigningKeyPair) -> Self {
        let (secret, public, signature) = x3dh::generate_signed_prekey(signing);
        Self {
            key_id,
            secret,
            public,
            signature,
        }
    }

    pub(crate) fn secret(&self) -> &StaticSecret {
        &self.secret
    }
}

/// One rotation's worth of retired secrets, kept only to answer bootstraps
/// that referenced them.
struct RetiredKeys {
    signed_pre_key_id: u32,
    spk_secret: StaticSecret,
    identity: IdentityKeyPair,
    signing: SigningKeyPair,
    retired_at: DateTime<Utc>,
}

/// Everything one device holds. Mutated only by rotation and one-time-prekey
/// consumption.
pub struct Identity {
    pub user_id: String,
    pub device_id: String,

    identity: IdentityKeyPair,
    signing: SigningKeyPair,
    spk: SignedPreKey,
    opk_secrets: HashMap<u32, StaticSecret>,

    /// Newest-first; bounded by `identity_history_cap`.
    history: Vec<RetiredKeys>,

    next_key_id: u32,
    rotation_count: u32,
    created_at: DateTime<Utc>,
    last_rotated_at: DateTime<Utc>,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

impl Identity {
    pub fn generate(user_id: &str, device_id: &str, opk_pool_size: usize) -> Self {
        let signing = SigningKeyPair::generate();
        let spk = SignedPreKey::generate(1, &signing);
        let mut identity = Self {
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
            identity: IdentityKeyPair::generate(),
            signing,
            spk,
            opk_secrets: HashMap::new(),
            history: Vec::new(),
            next_key_id: 2,
            rotation_count: 0,
            created_at: Utc::now(),
            last_rotated_at: Utc::now(),
        };
        identity.top_up_opks(opk_pool_size);
        identity
    }

    pub fn address(&self) -> DeviceAddress {
        DeviceAddress::new(&self.user_id, &self.device_id)
    }

    pub fn identity_jwk(&self) -> Jwk {
        self.identity.public_jwk()
    }

    pub fn signing_jwk(&self) -> Jwk {
        self.signing.public_jwk()
    }

    pub(crate) fn agreement(&self) -> &IdentityKeyPair {
        &self.identity
    }

    pub(crate) fn signing(&self) -> &SigningKeyPair {
        &self.signing
    }

    pub fn signed_pre_key(&self) -> &SignedPreKey {
        &self.spk
    }

    pub fn one_time_pre_key_count(&self) -> usize {
        self.opk_secrets.len()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// 60-digit grouped fingerprint over our and the peer's identity keys.
    /// Order-independent, so both ends render the same string.
    pub fn safety_number_with(&self, peer_identity: &Jwk) -> Result<String> {
        let theirs = peer_identity
            .key_bytes()
            .map_err(|e| EngineError::Protocol(format!("peer identity key: {e}")))?;
        Ok(hash::safety_number(
            self.identity.public().as_bytes(),
            &theirs,
        ))
    }

    // ── Bootstrap support ────────────────────────────────────────────────

    /// The X25519 material needed to answer a bootstrap that referenced
    /// `signed_pre_key_id`: the prekey secret plus the identity pair that
    /// was active ALONGSIDE it (they rotate together, so a historical
    /// prekey must pair with its historical identity). Owned clones, since
    /// the caller goes on to mutate this identity.
    pub(crate) fn responder_keys(
        &self,
        signed_pre_key_id: u32,
    ) -> Option<(StaticSecret, IdentityKeyPair)> {
        if self.spk.key_id == signed_pre_key_id {
            return Some((
                self.spk.secret.clone(),
                IdentityKeyPair::from_bytes(&self.identity.to_bytes()),
            ));
        }
        self.history
            .iter()
            .find(|r| r.signed_pre_key_id == signed_pre_key_id)
            .map(|r| {
                (
                    r.spk_secret.clone(),
                    IdentityKeyPair::from_bytes(&r.identity.to_bytes()),
                )
            })
    }

    /// Consume a one-time prekey. `None` means the id is unknown or already
    /// used — the caller treats both as an integrity violation.
    pub(crate) fn take_one_time_pre_key(&mut self, key_id: u32) -> Option<StaticSecret> {
        self.opk_secrets.remove(&key_id)
    }

    // ── Rotation ─────────────────────────────────────────────────────────

    /// Rotate when the material is older than `rotation_max_age`.
    ///
    /// Every rotation replaces the signed prekey and tops the one-time pool
    /// back up; every `identity_refresh_every`-th rotation also replaces
    /// the identity and signing pairs. Returns whether anything rotated so
    /// the caller can re-publish the bundle and announce the change.
    pub fn rotate_if_needed(&mut self, now: DateTime<Utc>, cfg: &EngineConfig) -> RotationOutcome {
        if now - self.last_rotated_at < cfg.rotation_max_age {
            return RotationOutcome {
                rotated: false,
                identity_replaced: false,
            };
        }

        self.rotation_count += 1;
        let replace_identity =
            cfg.identity_refresh_every > 0 && self.rotation_count % cfg.identity_refresh_every == 0;

        let new_spk = SignedPreKey::generate(self.allocate_key_id(), &self.signing);
        let old_spk = std::mem::replace(&mut self.spk, new_spk);

        let (old_identity, old_signing) = if replace_identity {
            // The new prekey must be signed by the NEW signing key.
            let new_signing = SigningKeyPair::generate();
            self.spk = SignedPreKey::generate(self.spk.key_id, &new_signing);
            (
                std::mem::replace(&mut self.identity, IdentityKeyPair::generate()),
                std::mem::replace(&mut self.signing, new_signing),
            )
        } else {
            // Identity unchanged; snapshot copies so the history entry is
            // self-contained either way.
            (
                IdentityKeyPair::from_bytes(&self.identity.to_bytes()),
                SigningKeyPair::from_bytes(&self.signing.to_bytes()),
            )
        };

        self.history.insert(
            0,
            RetiredKeys {
                signed_pre_key_id: old_spk.key_id,
                spk_secret: old_spk.secret.clone(),
                identity: old_identity,
                signing: old_signing,
                retired_at: now,
            },
        );
        self.history.truncate(cfg.identity_history_cap);

        self.top_up_opks(cfg.opk_pool_size);
        self.last_rotated_at = now;

        tracing::info!(
            target: "dw_engine",
            event = "identity_rotated",
            device_id = %self.device_id,
            rotation = self.rotation_count,
            identity_replaced = replace_identity,
            signed_pre_key_id = self.spk.key_id,
            history_len = self.history.len()
        );

        RotationOutcome {
            rotated: true,
            identity_replaced: replace_identity,
        }
    }

    fn allocate_key_id(&mut self) -> u32 {
        let id = self.next_key_id;
        self.next_key_id += 1;
        id
    }

    fn top_up_opks(&mut self, pool_size: usize) {
        while self.opk_secrets.len() < pool_size {
            let id = self.allocate_key_id();
            let (secret, _public) = x3dh::generate_one_time_prekeys(1).remove(0);
            self.opk_secrets.insert(id, secret);
        }
    }

    // ── Publication ──────────────────────────────────────────────────────

    /// Everything the directory needs: the current static material plus the
    /// full unconsumed one-time pool (sorted by id; the directory replaces
    /// its stored pool minus anything already handed out).
    pub fn bundle_upload(&self) -> PublishBundleRequest {
        let mut one_time_pre_keys: Vec<OneTimePreKeyUpload> = self
            .opk_secrets
            .iter()
            .map(|(id, secret)| OneTimePreKeyUpload {
                id: *id,
                jwk: Jwk::from_x25519(&X25519Public::from(secret)),
            })
            .collect();
        one_time_pre_keys.sort_by_key(|k| k.id);

        PublishBundleRequest {
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            identity_key_jwk: self.identity_jwk(),
            signing_key_jwk: self.signing_jwk(),
            signed_pre_key_id: self.spk.key_id,
            signed_pre_key_jwk: Jwk::from_x25519(&self.spk.public),
            signed_pre_key_signature: URL_SAFE_NO_PAD.encode(&self.spk.signature),
            one_time_pre_keys,
        }
    }

    // ── Serialization ────────────────────────────────────────────────────

    pub fn to_record_bytes(&self) -> Result<Vec<u8>> {
        let record = IdentityRecord {
            version: 1,
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            identity_secret: encode_secret(&self.identity.to_bytes()),
            signing_secret: encode_secret(&self.signing.to_bytes()),
            signed_pre_key: SignedPreKeyRecord {
                key_id: self.spk.key_id,
                secret: encode_secret(&self.spk.secret.to_bytes()),
                signature: URL_SAFE_NO_PAD.encode(&self.spk.signature),
            },
            one_time_pre_keys: self
                .opk_secrets
                .iter()
                .map(|(id, secret)| OneTimePreKeyRecord {
                    key_id: *id,
                    secret: encode_secret(&secret.to_bytes()),
                })
                .collect(),
            history: self
                .history
                .iter()
                .map(|r| RetiredRecord {
                    signed_pre_key_id: r.signed_pre_key_id,
                    spk_secret: encode_secret(&r.spk_secret.to_bytes()),
                    identity_secret: encode_secret(&r.identity.to_bytes()),
                    signing_secret: encode_secret(&r.signing.to_bytes()),
                    retired_at: r.retired_at,
                })
                .collect(),
            next_key_id: self.next_key_id,
            rotation_count: self.rotation_count,
            created_at: self.created_at,
            last_rotated_at: self.last_rotated_at,
        };
        serde_json::to_vec(&record).map_err(|e| EngineError::Storage(e.to_string()))
    }

    pub fn from_record_bytes(bytes: &[u8]) -> Result<Self> {
        let record: IdentityRecord =
            serde_json::from_slice(bytes).map_err(|e| EngineError::Storage(e.to_string()))?;

        let signing = SigningKeyPair::from_bytes(&decode_secret(&record.signing_secret)?);
        let spk_secret = StaticSecret::from(decode_secret(&record.signed_pre_key.secret)?);
        let spk = SignedPreKey {
            key_id: record.signed_pre_key.key_id,
            public: X25519Public::from(&spk_secret),
            secret: spk_secret,
            signature: URL_SAFE_NO_PAD
                .decode(&record.signed_pre_key.signature)
                .map_err(|e| EngineError::Storage(e.to_string()))?,
        };

        let mut opk_secrets = HashMap::new();
        for opk in &record.one_time_pre_keys {
            opk_secrets.insert(opk.key_id, StaticSecret::from(decode_secret(&opk.secret)?));
        }

        let mut history = Vec::with_capacity(record.history.len());
        for r in &record.history {
            history.push(RetiredKeys {
                signed_pre_key_id: r.signed_pre_key_id,
                spk_secret: StaticSecret::from(decode_secret(&r.spk_secret)?),
                identity: IdentityKeyPair::from_bytes(&decode_secret(&r.identity_secret)?),
                signing: SigningKeyPair::from_bytes(&decode_secret(&r.signing_secret)?),
                retired_at: r.retired_at,
            });
        }

        Ok(Self {
            user_id: record.user_id,
            device_id: record.device_id,
            identity: IdentityKeyPair::from_bytes(&decode_secret(&record.identity_secret)?),
            signing,
            spk,
            opk_secrets,
            history,
            next_key_id: record.next_key_id,
            rotation_count: record.rotation_count,
            created_at: record.created_at,
            last_rotated_at: record.last_rotated_at,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RotationOutcome {
    pub rotated: bool,
    pub identity_replaced: bool,
}

/// Test-only: the fetched-bundle view of this identity, optionally carrying
/// its lowest-id one-time prekey the way the directory would hand it out.
#[cfg(test)]
pub(crate) fn test_bundle(
    identity: &Identity,
    with_one_time: bool,
) -> dw_crypto::x3dh::DeviceKeyBundle {
    let upload = identity.bundle_upload();
    let one_time = if with_one_time {
        upload.one_time_pre_keys.first().cloned()
    } else {
        None
    };
    dw_crypto::x3dh::DeviceKeyBundle {
        user_id: upload.user_id,
        device_id: upload.device_id,
        identity_key_jwk: upload.identity_key_jwk,
        signing_key_jwk: upload.signing_key_jwk,
        signed_pre_key_id: upload.signed_pre_key_id,
        signed_pre_key_jwk: upload.signed_pre_key_jwk,
        signed_pre_key_signature: upload.signed_pre_key_signature,
        one_time_pre_key_id: one_time.as_ref().map(|opk| opk.id),
        one_time_pre_key_jwk: one_time.map(|opk| opk.jwk),
    }
}

// ── Stored record shape ──────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityRecord {
    version: u8,
    user_id: String,
    device_id: String,
    identity_secret: String,
    signing_secret: String,
    signed_pre_key: SignedPreKeyRecord,
    one_time_pre_keys: Vec<OneTimePreKeyRecord>,
    history: Vec<RetiredRecord>,
    next_key_id: u32,
    rotation_count: u32,
    created_at: DateTime<Utc>,
    last_rotated_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignedPreKeyRecord {
    key_id: u32,
    secret: String,
    signature: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OneTimePreKeyRecord {
    key_id: u32,
    secret: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetiredRecord {
    signed_pre_key_id: u32,
    spk_secret: String,
    identity_secret: String,
    signing_secret: String,
    retired_at: DateTime<Utc>,
}

fn encode_secret(bytes: &[u8; 32]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

fn decode_secret(encoded: &str) -> Result<[u8; 32]> {
    let bytes = Zeroizing::new(
        URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| EngineError::Storage(format!("corrupt secret in record: {e}")))?,
    );
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| EngineError::Storage("corrupt secret in record: wrong length".into()))
}

// ── Load-or-create with bounded retries ──────────────────────────────────────

/// Idempotent identity initialization: load the stored record, or generate
/// and persist a fresh one. Each attempt is bounded by
/// `identity_init_timeout`; storage failures and timeouts are retried
/// `identity_init_retries` times with capped exponential backoff. Without an
/// identity the device can neither send nor decrypt, so the final failure is
/// surfaced as `Storage` and the caller stops.
pub async fn load_or_create(store: &dyn KeyStore, cfg: &EngineConfig) -> Result<Identity> {
    let mut delay = std::time::Duration::from_millis(500);
    let mut last_err: Option<EngineError> = None;

    for attempt in 0..=cfg.identity_init_retries {
        if attempt > 0 {
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(std::time::Duration::from_secs(4));
        }

        match tokio::time::timeout(cfg.identity_init_timeout, try_load_or_create(store, cfg)).await
        {
            Ok(Ok(identity)) => {
                tracing::info!(
                    target: "dw_engine",
                    event = "identity_ready",
                    device_id = %identity.device_id,
                    attempt,
                    signed_pre_key_id = identity.spk.key_id,
                    one_time_pre_keys = identity.one_time_pre_key_count()
                );
                return Ok(identity);
            }
            Ok(Err(err @ EngineError::Storage(_))) => {
                tracing::warn!(
                    target: "dw_engine",
                    event = "identity_init_retry",
                    attempt,
                    error = %err
                );
                last_err = Some(err);
            }
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                tracing::warn!(
                    target: "dw_engine",
                    event = "identity_init_timeout",
                    attempt,
                    timeout_secs = cfg.identity_init_timeout.as_secs()
                );
                last_err = Some(EngineError::Storage("identity initialisation timed out".into()));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| EngineError::Storage("identity initialisation failed".into())))
}

async fn try_load_or_create(store: &dyn KeyStore, cfg: &EngineConfig) -> Result<Identity> {
    if let Some(bytes) = store.load_identity(&cfg.user_id, &cfg.device_id).await? {
        return Identity::from_record_bytes(&bytes);
    }
    let identity = Identity::generate(&cfg.user_id, &cfg.device_id, cfg.opk_pool_size);
    store
        .store_identity(&cfg.user_id, &cfg.device_id, &identity.to_record_bytes()?)
        .await?;
    tracing::info!(
        target: "dw_engine",
        event = "identity_created",
        device_id = %cfg.device_id
    );
    Ok(identity)
}
