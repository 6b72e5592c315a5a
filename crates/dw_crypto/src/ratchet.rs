//! Double Ratchet session state.
//!
//! References:
//!   - Signal Double Ratchet spec: <https://signal.org/docs/specifications/doubleratchet/>
//!
//! State separation (non-negotiable):
//!   RK  — root key (updated on every DH ratchet step)
//!   CKs — sending chain key (updated per message)
//!   CKr — receiving chain key (updated per message)
//!   MK  — message key (derived from CK, used once, then DELETED)
//!
//! DH ratchet discipline:
//!   The local ratchet keypair is generated lazily, on the first send of a
//!   chain epoch. Every send carries the current ratchet public key; when the
//!   receiving side observes a remote key that differs from the last known
//!   one, it archives the old chain's remaining message keys (up to the
//!   advertised previous chain length), mixes the DH output into the root
//!   key, and retires its own sending chain so the next send opens a fresh
//!   epoch.
//!
//! Forward secrecy: old chain keys and message keys are deleted.
//! Post-compromise security: each DH ratchet step restores secrecy.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, SharedSecret, StaticSecret};
use zeroize::Zeroize;

use crate::{error::CryptoError, kdf};

/// Default bound for the skipped-message-key cache. Limits memory and
/// prevents DoS via huge counter jumps.
pub const DEFAULT_MAX_SKIP: u64 = 256;

fn default_max_skip() -> u64 {
    DEFAULT_MAX_SKIP
}

// ── Internal key material ────────────────────────────────────────────────────

/// Local DH ratchet keypair. One per sending epoch.
#[derive(Serialize, Deserialize)]
struct RatchetPair {
    secret: [u8; 32],
    #[serde(with = "pub_key_serde")]
    public: X25519Public,
}

impl RatchetPair {
    fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        Self {
            public: X25519Public::from(&secret),
            secret: secret.to_bytes(),
        }
    }

    fn from_secret(secret: &StaticSecret) -> Self {
        Self {
            public: X25519Public::from(secret),
            secret: secret.to_bytes(),
        }
    }

    fn diffie_hellman(&self, peer: &X25519Public) -> SharedSecret {
        StaticSecret::from(self.secret).diffie_hellman(peer)
    }
}

impl Drop for RatchetPair {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

/// A symmetric chain: key plus the next message number to derive.
#[derive(Serialize, Deserialize)]
struct Chain {
    key: [u8; 32],
    n: u64,
}

impl Chain {
    fn fresh(key: [u8; 32]) -> Self {
        Self { key, n: 0 }
    }
}

/// A message key archived for out-of-order delivery. `chain` is the base64
/// remote ratchet public key the chain belonged to.
#[derive(Serialize, Deserialize)]
struct SkippedKey {
    chain: String,
    n: u64,
    mk: [u8; 32],
}

// ── Send metadata ────────────────────────────────────────────────────────────

/// Everything a wrapped key needs after one sending-chain step.
#[derive(Debug)]
pub struct SendAdvance {
    /// Used once to wrap this message's content key, then discarded.
    pub message_key: [u8; 32],
    pub message_number: u64,
    pub previous_chain_length: u64,
    /// Current local ratchet public key; carried on every message so any
    /// message of a fresh epoch can trigger the receiver's DH step.
    pub ratchet_pub: X25519Public,
}

// ── Session state ────────────────────────────────────────────────────────────

/// Complete Double Ratchet session state for one remote device.
/// Serialized opaquely into the caller's encrypted store.
#[derive(Serialize, Deserialize)]
pub struct RatchetSession {
    /// Bumped on every re-bootstrap (recovery reset); stale versions are
    /// rejected at the envelope layer.
    pub session_version: u32,

    root_key: [u8; 32],

    /// Lazily generated on the first send of each epoch; `None` right after
    /// a receiving DH step retired it.
    local_ratchet: Option<RatchetPair>,
    /// Peer's last observed DH ratchet public key.
    #[serde(with = "option_pub_key_serde")]
    remote_ratchet_pub: Option<X25519Public>,

    send: Option<Chain>,
    recv: Option<Chain>,
    /// Length of the retired sending chain, advertised as `pn`.
    prev_send_len: u64,

    /// Out-of-order message keys, insertion-ordered so the oldest entry is
    /// evicted first when the cache overflows.
    skipped: Vec<SkippedKey>,
    #[serde(default = "default_max_skip")]
    max_skip: u64,
}

impl Drop for RatchetSession {
    fn drop(&mut self) {
        self.root_key.zeroize();
        if let Some(chain) = self.send.as_mut() {
            chain.key.zeroize();
        }
        if let Some(chain) = self.recv.as_mut() {
            chain.key.zeroize();
        }
        for entry in self.skipped.iter_mut() {
            entry.mk.zeroize();
        }
    }
}

impl RatchetSession {
    /// Initiator construction: root key from X3DH, the responder's SPK as
    /// the first remote ratchet key. The first send performs the first DH
    /// ratchet step.
    pub fn init_initiator(
        session_version: u32,
        root_key: [u8; 32],
        remote_spk: &X25519Public,
        max_skip: u64,
    ) -> Self {
        Self {
            session_version,
            root_key,
            local_ratchet: None,
            remote_ratchet_pub: Some(*remote_spk),
            send: None,
            recv: None,
            prev_send_len: 0,
            skipped: Vec::new(),
            max_skip,
        }
    }

    /// Responder construction: root key from X3DH, the local SPK secret as
    /// the implicit first ratchet pair. No chains exist until the
    /// initiator's first message arrives.
    pub fn init_responder(
        session_version: u32,
        root_key: [u8; 32],
        spk_secret: &StaticSecret,
        max_skip: u64,
    ) -> Self {
        Self {
            session_version,
            root_key,
            local_ratchet: Some(RatchetPair::from_secret(spk_secret)),
            remote_ratchet_pub: None,
            send: None,
            recv: None,
            prev_send_len: 0,
            skipped: Vec::new(),
            max_skip,
        }
    }

    // ── Sending ──────────────────────────────────────────────────────────

    /// Advance the sending chain by one message.
    ///
    /// Opens a fresh epoch first when needed: generates a new ratchet
    /// keypair, mixes DH(local, remote) into the root key and derives the
    /// new chain. Returns the one-time message key plus header metadata.
    pub fn advance_sending_chain(&mut self) -> Result<SendAdvance, CryptoError> {
        if self.send.is_none() {
            let remote = self
                .remote_ratchet_pub
                .ok_or(CryptoError::SessionNotInitialised)?;
            let pair = RatchetPair::generate();
            let dh = pair.diffie_hellman(&remote);
            let (new_root, ck) = kdf::kdf_root(&self.root_key, dh.as_bytes())?;
            self.root_key = new_root;
            self.local_ratchet = Some(pair);
            self.send = Some(Chain::fresh(ck));
        }

        let ratchet_pub = match self.local_ratchet.as_ref() {
            Some(pair) => pair.public,
            None => return Err(CryptoError::SessionNotInitialised),
        };
        let chain = match self.send.as_mut() {
            Some(chain) => chain,
            None => return Err(CryptoError::SessionNotInitialised),
        };

        let (next_ck, mk) = kdf::kdf_chain(&chain.key)?;
        chain.key = next_ck;
        let message_number = chain.n;
        chain.n += 1;

        Ok(SendAdvance {
            message_key: mk,
            message_number,
            previous_chain_length: self.prev_send_len,
            ratchet_pub,
        })
    }

    // ── Receiving ────────────────────────────────────────────────────────

    /// Derive the message key for a received message.
    ///
    /// Handles three cases:
    ///   1. Skipped message, cached earlier (single use — entry is removed)
    ///   2. New remote ratchet key → DH ratchet step, then derive
    ///   3. Message within the current receiving chain (skipping forward
    ///      archives the intermediate keys)
    ///
    /// A message number behind the counter that is absent from the cache is
    /// a replay or duplicate and fails with `MessageKeyMissing`.
    pub fn advance_receiving_chain(
        &mut self,
        remote_pub: &X25519Public,
        n: u64,
        pn: u64,
    ) -> Result<[u8; 32], CryptoError> {
        let chain_tag = URL_SAFE_NO_PAD.encode(remote_pub.as_bytes());

        // Case 1: consult the skipped-key cache first
        if let Some(mk) = self.take_skipped(&chain_tag, n) {
            return Ok(mk);
        }

        // Case 2: DH ratchet needed?
        let changed = match self.remote_ratchet_pub {
            Some(ref current) => current.as_bytes() != remote_pub.as_bytes(),
            None => true,
        };
        if changed {
            // Archive what remains of the old receiving chain
            if self.recv.is_some() {
                self.skip_recv_to(pn)?;
            }

            let local = self
                .local_ratchet
                .take()
                .ok_or(CryptoError::SessionNotInitialised)?;
            let dh = local.diffie_hellman(remote_pub);
            let (new_root, ck) = kdf::kdf_root(&self.root_key, dh.as_bytes())?;
            self.root_key = new_root;
            self.remote_ratchet_pub = Some(*remote_pub);
            self.recv = Some(Chain::fresh(ck));

            // Retire the sending chain; the next send opens a fresh epoch
            self.prev_send_len = self.send.as_ref().map_or(0, |c| c.n);
            if let Some(chain) = self.send.as_mut() {
                chain.key.zeroize();
            }
            self.send = None;
        }

        let current_n = self
            .recv
            .as_ref()
            .map(|c| c.n)
            .ok_or(CryptoError::SessionNotInitialised)?;
        if n < current_n {
            // Behind the counter and not cached: already consumed
            return Err(CryptoError::MessageKeyMissing(n));
        }

        // Case 3: archive intermediate keys, then derive
        self.skip_recv_to(n)?;
        let chain = match self.recv.as_mut() {
            Some(chain) => chain,
            None => return Err(CryptoError::SessionNotInitialised),
        };
        let (next_ck, mk) = kdf::kdf_chain(&chain.key)?;
        chain.key = next_ck;
        chain.n += 1;

        Ok(mk)
    }

    // ── Internal ─────────────────────────────────────────────────────────

    /// Archive message keys from the current receiving position up to (but
    /// not including) `until`, bounding the cache by evicting the oldest.
    fn skip_recv_to(&mut self, until: u64) -> Result<(), CryptoError> {
        let chain_tag = match self.remote_ratchet_pub {
            Some(ref key) => URL_SAFE_NO_PAD.encode(key.as_bytes()),
            None => return Ok(()),
        };
        let chain = match self.recv.as_mut() {
            Some(chain) => chain,
            None => return Ok(()),
        };
        if until <= chain.n {
            return Ok(());
        }
        let gap = until - chain.n;
        if gap > self.max_skip {
            return Err(CryptoError::RatchetStep(format!(
                "too many skipped messages ({gap} > {})",
                self.max_skip
            )));
        }

        while chain.n < until {
            let (next_ck, mk) = kdf::kdf_chain(&chain.key)?;
            chain.key = next_ck;
            self.skipped.push(SkippedKey {
                chain: chain_tag.clone(),
                n: chain.n,
                mk,
            });
            chain.n += 1;
        }

        while self.skipped.len() > self.max_skip as usize {
            let mut evicted = self.skipped.remove(0);
            evicted.mk.zeroize();
        }

        Ok(())
    }

    /// Consume a cached skipped key. Single use: the entry is removed.
    fn take_skipped(&mut self, chain_tag: &str, n: u64) -> Option<[u8; 32]> {
        let idx = self
            .skipped
            .iter()
            .position(|e| e.n == n && e.chain == chain_tag)?;
        let entry = self.skipped.remove(idx);
        Some(entry.mk)
    }

    // ── Accessors ────────────────────────────────────────────────────────

    /// Current local ratchet public key, if an epoch has started.
    pub fn current_ratchet_pub(&self) -> Option<X25519Public> {
        self.local_ratchet.as_ref().map(|p| p.public)
    }

    pub fn remote_ratchet_pub(&self) -> Option<X25519Public> {
        self.remote_ratchet_pub
    }

    pub fn sending_chain_length(&self) -> u64 {
        self.send.as_ref().map_or(0, |c| c.n)
    }

    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }
}

// ── Serde helpers for X25519Public ───────────────────────────────────────────

mod pub_key_serde {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use x25519_dalek::PublicKey as X25519Public;

    pub fn serialize<S>(key: &X25519Public, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&URL_SAFE_NO_PAD.encode(key.as_bytes()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<X25519Public, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = URL_SAFE_NO_PAD
            .decode(&s)
            .map_err(serde::de::Error::custom)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))?;
        Ok(X25519Public::from(arr))
    }
}

mod option_pub_key_serde {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use x25519_dalek::PublicKey as X25519Public;

    pub fn serialize<S>(key: &Option<X25519Public>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match key {
            Some(k) => serializer.serialize_some(&URL_SAFE_NO_PAD.encode(k.as_bytes())),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<X25519Public>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<String> = Option::deserialize(deserializer)?;
        match opt {
            None => Ok(None),
            Some(s) => {
                let bytes = URL_SAFE_NO_PAD
                    .decode(&s)
                    .map_err(serde::de::Error::custom)?;
                let arr: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| serde::de::Error::custom("expected 32 bytes"))?;
                Ok(Some(X25519Public::from(arr)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Fresh initiator/responder pair sharing a root key, as if X3DH just ran.
    fn session_pair() -> (RatchetSession, RatchetSession) {
        let root = [42u8; 32];
        let spk_secret = StaticSecret::random_from_rng(OsRng);
        let spk_pub = X25519Public::from(&spk_secret);
        let alice = RatchetSession::init_initiator(1, root, &spk_pub, DEFAULT_MAX_SKIP);
        let bob = RatchetSession::init_responder(1, root, &spk_secret, DEFAULT_MAX_SKIP);
        (alice, bob)
    }

    fn deliver(from: &mut RatchetSession, to: &mut RatchetSession) -> ([u8; 32], [u8; 32]) {
        let adv = from.advance_sending_chain().unwrap();
        let mk = to
            .advance_receiving_chain(&adv.ratchet_pub, adv.message_number, adv.previous_chain_length)
            .unwrap();
        (adv.message_key, mk)
    }

    #[test]
    fn ping_pong_with_dh_steps() {
        let (mut alice, mut bob) = session_pair();

        for i in 0..3 {
            let (sent, received) = deliver(&mut alice, &mut bob);
            assert_eq!(sent, received, "alice→bob message {i}");
        }
        for i in 0..2 {
            let (sent, received) = deliver(&mut bob, &mut alice);
            assert_eq!(sent, received, "bob→alice message {i}");
        }
        // Third epoch
        let (sent, received) = deliver(&mut alice, &mut bob);
        assert_eq!(sent, received);
    }

    #[test]
    fn message_numbers_strictly_increase_within_a_chain() {
        let (mut alice, _) = session_pair();
        let mut last = None;
        for _ in 0..5 {
            let adv = alice.advance_sending_chain().unwrap();
            if let Some(prev) = last {
                assert_eq!(adv.message_number, prev + 1);
            }
            last = Some(adv.message_number);
        }
        assert_eq!(alice.sending_chain_length(), 5);
    }

    #[test]
    fn out_of_order_within_a_chain() {
        let (mut alice, mut bob) = session_pair();

        let a0 = alice.advance_sending_chain().unwrap();
        let a1 = alice.advance_sending_chain().unwrap();
        let a2 = alice.advance_sending_chain().unwrap();

        // Delivered 1, 0, 2
        let mk1 = bob
            .advance_receiving_chain(&a1.ratchet_pub, a1.message_number, a1.previous_chain_length)
            .unwrap();
        assert_eq!(mk1, a1.message_key);

        let mk0 = bob
            .advance_receiving_chain(&a0.ratchet_pub, a0.message_number, a0.previous_chain_length)
            .unwrap();
        assert_eq!(mk0, a0.message_key);

        let mk2 = bob
            .advance_receiving_chain(&a2.ratchet_pub, a2.message_number, a2.previous_chain_length)
            .unwrap();
        assert_eq!(mk2, a2.message_key);
    }

    #[test]
    fn skipped_keys_survive_a_dh_step() {
        let (mut alice, mut bob) = session_pair();

        let a0 = alice.advance_sending_chain().unwrap();
        let a1 = alice.advance_sending_chain().unwrap();

        // Bob sees only message 1 for now
        let mk1 = bob
            .advance_receiving_chain(&a1.ratchet_pub, a1.message_number, a1.previous_chain_length)
            .unwrap();
        assert_eq!(mk1, a1.message_key);

        // A full round trip ratchets both sides forward
        let (sent, received) = deliver(&mut bob, &mut alice);
        assert_eq!(sent, received);
        let (sent, received) = deliver(&mut alice, &mut bob);
        assert_eq!(sent, received);

        // The old chain's skipped key is still there, exactly once
        let mk0 = bob
            .advance_receiving_chain(&a0.ratchet_pub, a0.message_number, a0.previous_chain_length)
            .unwrap();
        assert_eq!(mk0, a0.message_key);
    }

    #[test]
    fn replayed_message_number_is_rejected() {
        let (mut alice, mut bob) = session_pair();

        let a0 = alice.advance_sending_chain().unwrap();
        bob.advance_receiving_chain(&a0.ratchet_pub, a0.message_number, a0.previous_chain_length)
            .unwrap();

        let err = bob
            .advance_receiving_chain(&a0.ratchet_pub, a0.message_number, a0.previous_chain_length)
            .unwrap_err();
        assert!(
            matches!(err, CryptoError::MessageKeyMissing(0)),
            "replay must fail, got {err:?}"
        );
    }

    #[test]
    fn skipped_key_is_single_use() {
        let (mut alice, mut bob) = session_pair();

        let a0 = alice.advance_sending_chain().unwrap();
        let a1 = alice.advance_sending_chain().unwrap();

        // 0 lands in the cache while 1 is processed
        bob.advance_receiving_chain(&a1.ratchet_pub, a1.message_number, a1.previous_chain_length)
            .unwrap();
        bob.advance_receiving_chain(&a0.ratchet_pub, a0.message_number, a0.previous_chain_length)
            .unwrap();
        assert_eq!(bob.skipped_count(), 0);

        let err = bob
            .advance_receiving_chain(&a0.ratchet_pub, a0.message_number, a0.previous_chain_length)
            .unwrap_err();
        assert!(matches!(err, CryptoError::MessageKeyMissing(0)));
    }

    #[test]
    fn counter_jump_beyond_cap_fails() {
        let root = [9u8; 32];
        let spk_secret = StaticSecret::random_from_rng(OsRng);
        let spk_pub = X25519Public::from(&spk_secret);
        let mut alice = RatchetSession::init_initiator(1, root, &spk_pub, 4);
        let mut bob = RatchetSession::init_responder(1, root, &spk_secret, 4);

        let mut last = None;
        for _ in 0..7 {
            last = Some(alice.advance_sending_chain().unwrap());
        }
        let a6 = last.unwrap();
        let err = bob
            .advance_receiving_chain(&a6.ratchet_pub, a6.message_number, a6.previous_chain_length)
            .unwrap_err();
        assert!(matches!(err, CryptoError::RatchetStep(_)));
    }

    #[test]
    fn cache_evicts_oldest_first() {
        let root = [5u8; 32];
        let spk_secret = StaticSecret::random_from_rng(OsRng);
        let spk_pub = X25519Public::from(&spk_secret);
        let mut alice = RatchetSession::init_initiator(1, root, &spk_pub, 3);
        let mut bob = RatchetSession::init_responder(1, root, &spk_secret, 3);

        let sends: Vec<_> = (0..8)
            .map(|_| alice.advance_sending_chain().unwrap())
            .collect();

        // Receive 3 (archives 0,1,2), then 7 (archives 4,5,6 and evicts 0,1,2)
        bob.advance_receiving_chain(&sends[3].ratchet_pub, 3, 0).unwrap();
        bob.advance_receiving_chain(&sends[7].ratchet_pub, 7, 0).unwrap();
        assert_eq!(bob.skipped_count(), 3);

        let err = bob
            .advance_receiving_chain(&sends[0].ratchet_pub, 0, 0)
            .unwrap_err();
        assert!(matches!(err, CryptoError::MessageKeyMissing(0)), "0 was evicted");

        let mk5 = bob
            .advance_receiving_chain(&sends[5].ratchet_pub, 5, 0)
            .unwrap();
        assert_eq!(mk5, sends[5].message_key);
    }

    #[test]
    fn responder_cannot_send_before_first_receive() {
        let root = [1u8; 32];
        let spk_secret = StaticSecret::random_from_rng(OsRng);
        let mut bob = RatchetSession::init_responder(1, root, &spk_secret, DEFAULT_MAX_SKIP);
        assert!(bob.advance_sending_chain().is_err());
    }

    #[test]
    fn session_state_survives_serde() {
        let (mut alice, mut bob) = session_pair();
        deliver(&mut alice, &mut bob);
        deliver(&mut bob, &mut alice);

        let json = serde_json::to_string(&alice).unwrap();
        let mut restored: RatchetSession = serde_json::from_str(&json).unwrap();

        let (sent, received) = deliver(&mut restored, &mut bob);
        assert_eq!(sent, received, "restored session must keep ratcheting");
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Under any interleaving of turns, both ends derive identical
            /// message keys for every delivered message.
            #[test]
            fn interleaved_turns_agree(turns in proptest::collection::vec(any::<bool>(), 1..40)) {
                let (mut alice, mut bob) = session_pair();

                // Bob cannot speak before he has heard from alice once.
                let (sent, received) = deliver(&mut alice, &mut bob);
                prop_assert_eq!(sent, received);
                let mut bob_heard = true;

                for alice_turn in turns {
                    if alice_turn {
                        let (sent, received) = deliver(&mut alice, &mut bob);
                        prop_assert_eq!(sent, received);
                        bob_heard = true;
                    } else if bob_heard {
                        let (sent, received) = deliver(&mut bob, &mut alice);
                        prop_assert_eq!(sent, received);
                    }
                }
            }
        }
    }
}
