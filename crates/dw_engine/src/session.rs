//! The per-device session table: one Double Ratchet slot per remote device,
//! plus the bootstrap bookkeeping that gets a slot from Pending to
//! Established.
//!
//! An initiator slot is Pending until the peer's first ciphertext proves the
//! bootstrap landed; while Pending, every outgoing wrapped key re-attaches
//! the prekey message so the first few messages tolerate reordering. A
//! responder slot is Established the moment X3DH completes, but it cannot
//! send until the initiator's first message seeds the sending chain.

use std::collections::HashMap;

use x25519_dalek::StaticSecret;

use dw_crypto::keys::IdentityKeyPair;
use dw_crypto::ratchet::{RatchetSession, SendAdvance};
use dw_crypto::x3dh::{self, DeviceKeyBundle, PreKeyMessage};
use dw_proto::address::DeviceAddress;

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// We initiated and have not yet decrypted anything from the peer.
    Pending,
    Established,
}

pub struct SessionSlot {
    pub session: RatchetSession,
    pub status: SessionStatus,
    pub initiated_by_us: bool,
    /// Attached to every outgoing wrapped key while Pending.
    pub pending_pre_key: Option<PreKeyMessage>,
    /// Responder slots remember the ephemeral that bootstrapped them, so a
    /// redelivered or out-of-order bootstrap for the SAME session is
    /// recognised instead of rebuilt.
    pub responded_ephemeral: Option<[u8; 32]>,
}

/// One message's worth of sending-side material.
#[derive(Debug)]
pub struct SendStep {
    pub advance: SendAdvance,
    pub session_version: u32,
    pub pre_key_message: Option<PreKeyMessage>,
}

pub struct SessionEngine {
    slots: HashMap<DeviceAddress, SessionSlot>,
    max_skip: u64,
}

impl SessionEngine {
    pub fn new(max_skip: u64) -> Self {
        Self {
            slots: HashMap::new(),
            max_skip,
        }
    }

    pub fn slot(&self, address: &DeviceAddress) -> Option<&SessionSlot> {
        self.slots.get(address)
    }

    pub fn slot_mut(&mut self, address: &DeviceAddress) -> Option<&mut SessionSlot> {
        self.slots.get_mut(address)
    }

    pub fn status(&self, address: &DeviceAddress) -> Option<SessionStatus> {
        self.slots.get(address).map(|slot| slot.status)
    }

    /// Devices of `user_id` we hold any session for, device-id order.
    pub fn devices_for_user(&self, user_id: &str) -> Vec<DeviceAddress> {
        let mut devices: Vec<DeviceAddress> = self
            .slots
            .keys()
            .filter(|address| address.user_id == user_id)
            .cloned()
            .collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        devices
    }

    /// Every device we hold any slot for, in (user, device) order. Key
    /// rotation announces to all of them.
    pub fn all_peers(&self) -> Vec<DeviceAddress> {
        let mut devices: Vec<DeviceAddress> = self.slots.keys().cloned().collect();
        devices.sort_by(|a, b| {
            a.user_id
                .cmp(&b.user_id)
                .then_with(|| a.device_id.cmp(&b.device_id))
        });
        devices
    }

    /// The version a NEW session toward this device would get: one past the
    /// current slot, so stale wrapped keys are recognisable after a reset.
    pub fn next_version(&self, address: &DeviceAddress) -> u32 {
        self.slots
            .get(address)
            .map(|slot| slot.session.session_version + 1)
            .unwrap_or(1)
    }

    // ── Bootstrap ────────────────────────────────────────────────────────

    /// Run X3DH against a fetched bundle and install a Pending initiator
    /// slot, replacing (and version-bumping past) whatever was there.
    pub fn bootstrap_initiator(
        &mut self,
        local_identity: &IdentityKeyPair,
        address: &DeviceAddress,
        bundle: &DeviceKeyBundle,
    ) -> Result<u32> {
        let outcome = x3dh::initiate(local_identity, bundle)
            .map_err(|e| EngineError::Integrity(format!("bundle for {address}: {e}")))?;

        let version = self.next_version(address);
        let session =
            RatchetSession::init_initiator(version, outcome.root_key, &outcome.remote_spk, self.max_skip);
        self.slots.insert(
            address.clone(),
            SessionSlot {
                session,
                status: SessionStatus::Pending,
                initiated_by_us: true,
                pending_pre_key: Some(outcome.pre_key_message),
                responded_ephemeral: None,
            },
        );

        tracing::info!(
            target: "dw_engine",
            event = "session_bootstrap",
            peer = %address,
            session_version = version,
            used_one_time_pre_key = bundle.one_time_pre_key_id.is_some()
        );
        Ok(version)
    }

    /// Install the responder side of a completed X3DH. The slot is
    /// Established immediately; sending still waits for the initiator's
    /// first message to seed the chain.
    pub fn install_responder(
        &mut self,
        address: &DeviceAddress,
        session_version: u32,
        root_key: [u8; 32],
        spk_secret: &StaticSecret,
        ephemeral: [u8; 32],
    ) {
        let session =
            RatchetSession::init_responder(session_version, root_key, spk_secret, self.max_skip);
        self.slots.insert(
            address.clone(),
            SessionSlot {
                session,
                status: SessionStatus::Established,
                initiated_by_us: false,
                pending_pre_key: None,
                responded_ephemeral: Some(ephemeral),
            },
        );
        tracing::info!(
            target: "dw_engine",
            event = "session_responded",
            peer = %address,
            session_version
        );
    }

    /// First successful decrypt on a Pending slot: the bootstrap landed, so
    /// stop re-attaching the prekey message. Returns the session version
    /// when this call did the transition.
    pub fn mark_established(&mut self, address: &DeviceAddress) -> Option<u32> {
        let slot = self.slots.get_mut(address)?;
        if slot.status == SessionStatus::Established {
            return None;
        }
        slot.status = SessionStatus::Established;
        slot.pending_pre_key = None;
        Some(slot.session.session_version)
    }

    pub fn remove(&mut self, address: &DeviceAddress) -> Option<SessionSlot> {
        self.slots.remove(address)
    }

    // ── Sending ──────────────────────────────────────────────────────────

    /// One sending-chain step toward a device. No slot, or a responder slot
    /// that has not received yet, blocks the send as session-pending rather
    /// than failing it.
    pub fn advance_sending(&mut self, address: &DeviceAddress) -> Result<SendStep> {
        let slot = self
            .slots
            .get_mut(address)
            .ok_or_else(|| EngineError::SessionPending {
                peer: address.clone(),
            })?;

        let advance = slot.session.advance_sending_chain().map_err(|e| match e {
            dw_crypto::CryptoError::SessionNotInitialised => EngineError::SessionPending {
                peer: address.clone(),
            },
            other => EngineError::Protocol(format!("ratchet advance for {address}: {other}")),
        })?;

        Ok(SendStep {
            session_version: slot.session.session_version,
            pre_key_message: slot.pending_pre_key.clone(),
            advance,
        })
    }
}
