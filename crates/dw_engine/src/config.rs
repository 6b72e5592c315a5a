//! Engine tuning knobs. Every duration that drives a state machine lives
//! here so tests can shrink them under a paused clock.

use std::time::Duration;

use dw_proto::codec::PaddingMode;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub user_id: String,
    pub device_id: String,

    /// Rotate the signed prekey once the identity is this old.
    pub rotation_max_age: chrono::Duration,
    /// Retired identity/prekey material kept for late-arriving bootstraps.
    pub identity_history_cap: usize,
    /// Every Nth rotation also replaces the identity and signing pairs, not
    /// just the signed prekey.
    pub identity_refresh_every: u32,
    /// One-time prekeys kept published per device.
    pub opk_pool_size: usize,

    /// Skipped-message-key cache bound per session.
    pub max_skipped_keys: u64,
    /// Traffic shaping applied to outgoing plaintext.
    pub padding: PaddingMode,

    /// Identity load/create attempt budget: per-attempt timeout plus the
    /// number of retries after the first failure.
    pub identity_init_timeout: Duration,
    pub identity_init_retries: u32,

    /// How long a recovery request waits for its payload before the entry
    /// is discarded.
    pub recovery_timeout: Duration,
    /// Duplicate recovery requests for the same message are suppressed for
    /// this long.
    pub recovery_cooldown: chrono::Duration,
}

impl EngineConfig {
    pub fn new(user_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
            rotation_max_age: chrono::Duration::days(7),
            identity_history_cap: 4,
            identity_refresh_every: 4,
            opk_pool_size: 32,
            max_skipped_keys: 256,
            padding: PaddingMode::Buckets,
            identity_init_timeout: Duration::from_secs(10),
            identity_init_retries: 2,
            recovery_timeout: Duration::from_secs(20),
            recovery_cooldown: chrono::Duration::minutes(2),
        }
    }

    pub fn local_address(&self) -> dw_proto::address::DeviceAddress {
        dw_proto::address::DeviceAddress::new(&self.user_id, &self.device_id)
    }
}
