//! `dr_handshake` frames: an explicit init/ack exchange that confirms a
//! bootstrapped session without waiting for the first content message.
//!
//! The init side is driven by the client (it may need a directory fetch to
//! answer one); this module owns the frame construction and the ack
//! transition, which is deliberately pure: an ack either flips our Pending
//! initiator slot to Established or is ignored. Acks never create state.

use dw_crypto::keys::Jwk;
use dw_proto::address::DeviceAddress;
use dw_proto::frames::{Frame, HandshakeStep};
use x25519_dalek::PublicKey as X25519Public;

use crate::identity::Identity;
use crate::session::{SessionEngine, SessionStatus};

pub fn build_init(local: &Identity, session_version: u32) -> Frame {
    Frame::DrHandshake {
        step: HandshakeStep::Init,
        // Lazy initiator: no ratchet pair exists until the first send.
        ratchet_dh_public_key_jwk: None,
        identity_public_key_jwk: local.identity_jwk(),
        identity_signing_public_key_jwk: local.signing_jwk(),
        session_version,
    }
}

pub fn build_ack(local: &Identity, ratchet_pub: Option<X25519Public>, session_version: u32) -> Frame {
    Frame::DrHandshake {
        step: HandshakeStep::Ack,
        ratchet_dh_public_key_jwk: ratchet_pub.as_ref().map(Jwk::from_x25519),
        identity_public_key_jwk: local.identity_jwk(),
        identity_signing_public_key_jwk: local.signing_jwk(),
        session_version,
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum AckOutcome {
    /// Our Pending initiator slot for this peer is now Established.
    Established(u32),
    /// No matching pending bootstrap; dropped without touching state.
    Ignored,
}

/// Apply an incoming ack. Only the exact pending bootstrap it answers is
/// affected: wrong version, wrong role, or no slot at all are all ignored
/// (late acks after a reset are routine, not errors).
pub fn on_ack(sessions: &mut SessionEngine, from: &DeviceAddress, session_version: u32) -> AckOutcome {
    let Some(slot) = sessions.slot(from) else {
        return AckOutcome::Ignored;
    };
    if !slot.initiated_by_us
        || slot.status != SessionStatus::Pending
        || slot.session.session_version != session_version
    {
        return AckOutcome::Ignored;
    }

    match sessions.mark_established(from) {
        Some(version) => {
            tracing::info!(
                target: "dw_engine",
                event = "handshake_ack_applied",
                peer = %from,
                session_version = version
            );
            AckOutcome::Established(version)
        }
        None => AckOutcome::Ignored,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::test_bundle;

    fn pending_pair() -> (Identity, SessionEngine, DeviceAddress) {
        let alice = Identity::generate("alice", "alice-web", 4);
        let bob = Identity::generate("bob", "bob-web", 4);
        let bob_addr = bob.address();
        let mut sessions = SessionEngine::new(64);
        sessions
            .bootstrap_initiator(alice.agreement(), &bob_addr, &test_bundle(&bob, true))
            .unwrap();
        (alice, sessions, bob_addr)
    }

    #[test]
    fn ack_establishes_the_pending_bootstrap() {
        let (_alice, mut sessions, bob_addr) = pending_pair();
        assert_eq!(on_ack(&mut sessions, &bob_addr, 1), AckOutcome::Established(1));
        assert_eq!(sessions.status(&bob_addr), Some(SessionStatus::Established));
        // A second ack for the same version has nothing left to do.
        assert_eq!(on_ack(&mut sessions, &bob_addr, 1), AckOutcome::Ignored);
    }

    #[test]
    fn wrong_version_ack_is_ignored() {
        let (_alice, mut sessions, bob_addr) = pending_pair();
        assert_eq!(on_ack(&mut sessions, &bob_addr, 7), AckOutcome::Ignored);
        assert_eq!(sessions.status(&bob_addr), Some(SessionStatus::Pending));
    }

    #[test]
    fn ack_from_unknown_peer_is_ignored() {
        let (_alice, mut sessions, _) = pending_pair();
        let stranger = DeviceAddress::new("mallory", "web");
        assert_eq!(on_ack(&mut sessions, &stranger, 1), AckOutcome::Ignored);
    }

    #[test]
    fn init_frame_shape() {
        let alice = Identity::generate("alice", "alice-web", 4);
        let frame = build_init(&alice, 3);
        match frame {
            Frame::DrHandshake {
                step,
                ratchet_dh_public_key_jwk,
                session_version,
                ..
            } => {
                assert_eq!(step, HandshakeStep::Init);
                assert!(ratchet_dh_public_key_jwk.is_none());
                assert_eq!(session_version, 3);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
