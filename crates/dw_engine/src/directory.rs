//! Key-directory client: publishes our device bundle and fetches peers'.
//!
//! The directory is the engine's only networked dependency, so it sits
//! behind a trait. [`HttpDirectory`] talks to the real service;
//! [`MemoryDirectory`] is a test double that reproduces the server's
//! one-time-prekey handout rules (each id leaves the pool exactly once,
//! even across re-uploads).

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;

use dw_crypto::x3dh::DeviceKeyBundle;
use dw_proto::api::{
    ErrorResponse, OneTimePreKeyUpload, PublishBundleRequest, PublishBundleResponse,
    UserBundlesResponse,
};

use crate::error::{EngineError, Result};

#[async_trait]
pub trait Directory: Send + Sync {
    /// Replace the directory's copy of our device bundle, one-time pool
    /// included.
    async fn publish_bundle(&self, request: &PublishBundleRequest) -> Result<()>;

    /// All device bundles for a user. Each carries at most one one-time
    /// prekey, which the directory forgets on hand-out; an empty vec means
    /// the user has no enrolled devices (yet).
    async fn fetch_user_bundles(&self, user_id: &str) -> Result<Vec<DeviceKeyBundle>>;
}

// ── HTTP client ──────────────────────────────────────────────────────────────

pub struct HttpDirectory {
    client: reqwest::Client,
    base_url: String,
    auth_token: String,
}

impl HttpDirectory {
    pub fn new(base_url: impl Into<String>, auth_token: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .build()
            .map_err(|e| EngineError::Network(e.to_string()))?;
        let base_url: String = base_url.into();
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            auth_token: auth_token.into(),
        })
    }
}

/// Extract a short error code from a directory error body, falling back to
/// the HTTP status when the body is HTML or unparseable. Directory errors
/// look like `{ "error": "...", "code": "..." }`.
fn directory_error(status: reqwest::StatusCode, body: &str) -> EngineError {
    if let Ok(parsed) = serde_json::from_str::<ErrorResponse>(body) {
        return EngineError::Network(format!("directory: {} (HTTP {})", parsed.code, status.as_u16()));
    }
    EngineError::Network(format!("directory: HTTP {}", status.as_u16()))
}

#[async_trait]
impl Directory for HttpDirectory {
    async fn publish_bundle(&self, request: &PublishBundleRequest) -> Result<()> {
        let response = self
            .client
            .put(format!("{}/prekey-bundle", self.base_url))
            .bearer_auth(&self.auth_token)
            .json(request)
            .send()
            .await
            .map_err(|e| EngineError::Network(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| EngineError::Network(e.to_string()))?;
        if !status.is_success() {
            return Err(directory_error(status, &body));
        }

        let parsed: PublishBundleResponse = serde_json::from_str(&body)
            .map_err(|e| EngineError::Protocol(format!("publish response: {e}")))?;
        tracing::debug!(
            target: "dw_engine",
            event = "bundle_published",
            device_id = %request.device_id,
            one_time_pre_keys_remaining = parsed.one_time_pre_keys_remaining
        );
        Ok(())
    }

    async fn fetch_user_bundles(&self, user_id: &str) -> Result<Vec<DeviceKeyBundle>> {
        let response = self
            .client
            .get(format!("{}/prekey-bundle/{}", self.base_url, user_id))
            .bearer_auth(&self.auth_token)
            .send()
            .await
            .map_err(|e| EngineError::Network(e.to_string()))?;

        let status = response.status();
        // A user with no published devices is a normal state, not a failure.
        if status.as_u16() == 404 {
            return Ok(Vec::new());
        }
        let body = response
            .text()
            .await
            .map_err(|e| EngineError::Network(e.to_string()))?;
        if !status.is_success() {
            return Err(directory_error(status, &body));
        }

        let parsed: UserBundlesResponse = serde_json::from_str(&body)
            .map_err(|e| EngineError::Protocol(format!("bundles response: {e}")))?;
        Ok(parsed.bundles)
    }
}

// ── In-memory double ─────────────────────────────────────────────────────────

struct StoredBundle {
    request: PublishBundleRequest,
    /// Hand-out order follows upload order.
    available: VecDeque<OneTimePreKeyUpload>,
    /// Ids this directory has already given out; survives re-uploads.
    consumed: HashSet<u32>,
}

#[derive(Default)]
pub struct MemoryDirectory {
    inner: Mutex<HashMap<String, BTreeMap<String, StoredBundle>>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn remaining_one_time_pre_keys(&self, user_id: &str, device_id: &str) -> usize {
        let directory = self.inner.lock().await;
        directory
            .get(user_id)
            .and_then(|devices| devices.get(device_id))
            .map(|stored| stored.available.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn publish_bundle(&self, request: &PublishBundleRequest) -> Result<()> {
        let mut directory = self.inner.lock().await;
        let devices = directory.entry(request.user_id.clone()).or_default();

        let consumed = devices
            .remove(&request.device_id)
            .map(|stored| stored.consumed)
            .unwrap_or_default();
        let available = request
            .one_time_pre_keys
            .iter()
            .filter(|opk| !consumed.contains(&opk.id))
            .cloned()
            .collect();

        devices.insert(
            request.device_id.clone(),
            StoredBundle {
                request: request.clone(),
                available,
                consumed,
            },
        );
        Ok(())
    }

    async fn fetch_user_bundles(&self, user_id: &str) -> Result<Vec<DeviceKeyBundle>> {
        let mut directory = self.inner.lock().await;
        let Some(devices) = directory.get_mut(user_id) else {
            return Ok(Vec::new());
        };

        let mut bundles = Vec::with_capacity(devices.len());
        for stored in devices.values_mut() {
            let one_time = stored.available.pop_front();
            if let Some(opk) = &one_time {
                stored.consumed.insert(opk.id);
            }
            let request = &stored.request;
            bundles.push(DeviceKeyBundle {
                user_id: request.user_id.clone(),
                device_id: request.device_id.clone(),
                identity_key_jwk: request.identity_key_jwk.clone(),
                signing_key_jwk: request.signing_key_jwk.clone(),
                signed_pre_key_id: request.signed_pre_key_id,
                signed_pre_key_jwk: request.signed_pre_key_jwk.clone(),
                signed_pre_key_signature: request.signed_pre_key_signature.clone(),
                one_time_pre_key_id: one_time.as_ref().map(|opk| opk.id),
                one_time_pre_key_jwk: one_time.map(|opk| opk.jwk),
            });
        }
        Ok(bundles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    #[tokio::test]
    async fn each_fetch_consumes_one_prekey_per_device() {
        let directory = MemoryDirectory::new();
        let identity = Identity::generate("bob", "bob-web", 2);
        directory.publish_bundle(&identity.bundle_upload()).await.unwrap();

        let first = directory.fetch_user_bundles("bob").await.unwrap();
        assert_eq!(first.len(), 1);
        let first_opk = first[0].one_time_pre_key_id.unwrap();

        let second = directory.fetch_user_bundles("bob").await.unwrap();
        let second_opk = second[0].one_time_pre_key_id.unwrap();
        assert_ne!(first_opk, second_opk, "prekeys are handed out once");

        // Pool of two is now dry; the bundle still comes back, without one.
        let third = directory.fetch_user_bundles("bob").await.unwrap();
        assert!(third[0].one_time_pre_key_id.is_none());
    }

    #[tokio::test]
    async fn re_upload_never_resurrects_a_consumed_prekey() {
        let directory = MemoryDirectory::new();
        let identity = Identity::generate("bob", "bob-web", 2);
        directory.publish_bundle(&identity.bundle_upload()).await.unwrap();

        let handed_out = directory.fetch_user_bundles("bob").await.unwrap()[0]
            .one_time_pre_key_id
            .unwrap();

        // Device republishes its full pool — it does not know what the
        // directory already handed out.
        directory.publish_bundle(&identity.bundle_upload()).await.unwrap();
        assert_eq!(directory.remaining_one_time_pre_keys("bob", "bob-web").await, 1);

        let next = directory.fetch_user_bundles("bob").await.unwrap()[0]
            .one_time_pre_key_id
            .unwrap();
        assert_ne!(next, handed_out);
    }

    #[tokio::test]
    async fn unknown_user_yields_no_bundles() {
        let directory = MemoryDirectory::new();
        assert!(directory.fetch_user_bundles("nobody").await.unwrap().is_empty());
    }
}
