//! The engine façade. [`Messenger`] owns the device identity, the session
//! arena and the two pipeline workers, routes inbound frames, and reports
//! every outcome as an [`EngineEvent`].
//!
//! Locking discipline: all ratchet-bearing state (`Core`) sits behind one
//! async mutex. Workers take the lock only around synchronous session
//! mutation; directory fetches and transport deliveries happen outside it,
//! so a slow network call never stalls the other pipeline.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc, Mutex};

use dw_crypto::keys::Jwk;
use dw_crypto::x3dh::DeviceKeyBundle;
use dw_proto::address::DeviceAddress;
use dw_proto::envelope::CipherEnvelope;
use dw_proto::frames::{Frame, HandshakeStep, OutboundFrame, RecoveryAction, UpdateMode};

use crate::config::EngineConfig;
use crate::directory::Directory;
use crate::envelope::{decrypt_envelope, encrypt_for_recipients};
use crate::error::{EngineError, ErrorKind, Result};
use crate::events::EngineEvent;
use crate::handshake::{self, AckOutcome};
use crate::identity::{self, Identity};
use crate::pipeline::{CancelToken, DecryptJob, JobBoard, SendJob};
use crate::presence::PresenceMap;
use crate::recovery::{RecoveryDecision, RecoveryKey, RecoveryTracker};
use crate::session::{SessionEngine, SessionStatus};
use crate::store::{CachedMessage, KeyStore, PlaintextCache, ResyncLedger};

/// Capacity of the event broadcast channel. A UI that lags this far behind
/// misses events rather than backpressuring the crypto pipelines.
const EVENT_CHANNEL_CAPACITY: usize = 256;

// ── Transport seam ───────────────────────────────────────────────────────────

/// Outbound half of the transport. The engine hands over one frame per
/// recipient device; the embedding layer owns the socket, reconnects and
/// authentication.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn deliver(&self, to: &DeviceAddress, frame: &Frame) -> Result<()>;
}

// ── Shared state ─────────────────────────────────────────────────────────────

/// What we have learned about a peer user, first-use trusted and refreshed
/// on `key_announce` or a bundle fetch.
#[derive(Default)]
struct PeerRecord {
    identity_key_jwk: Option<Jwk>,
    signing_key_jwk: Option<Jwk>,
    /// Set on `key_announce`; the next send refetches bundles and
    /// re-bootstraps every device of this user.
    needs_refresh: bool,
}

/// Everything the pipelines mutate, behind [`Inner::core`].
struct Core {
    identity: Identity,
    sessions: SessionEngine,
    presence: PresenceMap,
    recovery: RecoveryTracker,
    peers: HashMap<String, PeerRecord>,
    /// Sends waiting on a user with no addressable device yet, keyed by
    /// that user. Drained back into the send queue when a session, bundle
    /// or presence for the user materialises.
    parked: HashMap<String, Vec<SendJob>>,
}

struct Inner {
    cfg: EngineConfig,
    local_address: DeviceAddress,
    core: Mutex<Core>,
    key_store: Arc<dyn KeyStore>,
    plaintext_cache: Arc<dyn PlaintextCache>,
    resync_ledger: Arc<dyn ResyncLedger>,
    directory: Arc<dyn Directory>,
    sink: Arc<dyn FrameSink>,
    events: broadcast::Sender<EngineEvent>,
    send_tx: mpsc::UnboundedSender<SendJob>,
    decrypt_tx: mpsc::UnboundedSender<DecryptJob>,
    board: JobBoard,
}

// ── Façade ───────────────────────────────────────────────────────────────────

/// Handle to a running engine. Cheap to clone; dropping every clone stops
/// accepting work (the workers drain and park on their closed channels).
#[derive(Clone)]
pub struct Messenger {
    inner: Arc<Inner>,
}

impl Messenger {
    /// Load or create the device identity, publish its bundle, and spawn
    /// the pipeline workers.
    ///
    /// Publishing is part of startup on purpose: an identity the directory
    /// has never seen cannot be bootstrapped against, so failing fast beats
    /// running a device nobody can message.
    pub async fn start(
        cfg: EngineConfig,
        key_store: Arc<dyn KeyStore>,
        plaintext_cache: Arc<dyn PlaintextCache>,
        resync_ledger: Arc<dyn ResyncLedger>,
        directory: Arc<dyn Directory>,
        sink: Arc<dyn FrameSink>,
    ) -> Result<Self> {
        let mut identity = identity::load_or_create(key_store.as_ref(), &cfg).await?;

        // Catch up on a rotation that came due while the device was off.
        let rotation = identity.rotate_if_needed(Utc::now(), &cfg);
        if rotation.rotated {
            let record = identity.to_record_bytes()?;
            key_store
                .store_identity(&cfg.user_id, &cfg.device_id, &record)
                .await?;
        }
        directory.publish_bundle(&identity.bundle_upload()).await?;

        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let (decrypt_tx, decrypt_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let local_address = cfg.local_address();
        let max_skip = cfg.max_skipped_keys;
        let inner = Arc::new(Inner {
            cfg,
            local_address,
            core: Mutex::new(Core {
                identity,
                sessions: SessionEngine::new(max_skip),
                presence: PresenceMap::default(),
                recovery: RecoveryTracker::default(),
                peers: HashMap::new(),
                parked: HashMap::new(),
            }),
            key_store,
            plaintext_cache,
            resync_ledger,
            directory,
            sink,
            events,
            send_tx,
            decrypt_tx,
            board: JobBoard::default(),
        });

        let send_worker = Arc::clone(&inner);
        tokio::spawn(async move {
            let mut rx = send_rx;
            while let Some(job) = rx.recv().await {
                send_worker.process_send(job).await;
            }
        });
        let decrypt_worker = Arc::clone(&inner);
        tokio::spawn(async move {
            let mut rx = decrypt_rx;
            while let Some(job) = rx.recv().await {
                decrypt_worker.process_decrypt(job).await;
            }
        });

        if rotation.rotated {
            tracing::info!(
                target: "dw_engine",
                event = "startup_rotation",
                identity_replaced = rotation.identity_replaced,
            );
        }
        tracing::info!(
            target: "dw_engine",
            event = "engine_started",
            address = %inner.local_address,
        );
        Ok(Self { inner })
    }

    /// Subscribe to engine events. Late subscribers miss earlier events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    pub fn local_address(&self) -> DeviceAddress {
        self.inner.local_address.clone()
    }

    /// Queue a message to every device of `to_users` (our own sibling
    /// devices are included automatically). Returns the message id the
    /// outcome events will carry.
    pub async fn send_message(
        &self,
        room_id: &str,
        to_users: &[String],
        plaintext: Vec<u8>,
        content_type: &str,
    ) -> Result<String> {
        let message_id = dw_crypto::hash::message_id(
            &self.inner.cfg.user_id,
            room_id,
            &plaintext,
            Utc::now().timestamp_millis(),
        );
        let cancel = self.inner.board.token_for(room_id).await;
        let job = SendJob::Message {
            room_id: room_id.to_owned(),
            message_id: message_id.clone(),
            plaintext,
            content_type: content_type.to_owned(),
            to_users: to_users.to_vec(),
            cancel,
        };
        self.inner.enqueue_send(job)?;
        tracing::debug!(
            target: "dw_engine",
            event = "send_queued",
            room_id,
            message_id = %message_id,
        );
        Ok(message_id)
    }

    /// Queue a re-encrypted replacement for an earlier message.
    pub async fn edit_message(
        &self,
        room_id: &str,
        message_id: &str,
        to_users: &[String],
        plaintext: Vec<u8>,
        content_type: &str,
    ) -> Result<()> {
        let cancel = self.inner.board.token_for(room_id).await;
        self.inner.enqueue_send(SendJob::Update {
            mode: UpdateMode::Edit,
            room_id: room_id.to_owned(),
            message_id: message_id.to_owned(),
            plaintext: Some(plaintext),
            content_type: Some(content_type.to_owned()),
            to_users: to_users.to_vec(),
            cancel,
        })
    }

    /// Queue a revocation. Carries no content, so it needs no session; it
    /// also drops the message from our own plaintext cache, after which the
    /// message can no longer be served to recovery requests.
    pub async fn revoke_message(
        &self,
        room_id: &str,
        message_id: &str,
        to_users: &[String],
    ) -> Result<()> {
        let cancel = self.inner.board.token_for(room_id).await;
        self.inner.enqueue_send(SendJob::Update {
            mode: UpdateMode::Revoke,
            room_id: room_id.to_owned(),
            message_id: message_id.to_owned(),
            plaintext: None,
            content_type: None,
            to_users: to_users.to_vec(),
            cancel,
        })
    }

    /// Feed one raw frame from the transport. `from` is the
    /// transport-authenticated origin; body claims never override it.
    /// Malformed frames are logged and dropped, never fatal.
    pub async fn handle_frame(&self, from: DeviceAddress, raw: &str) {
        let frame = match Frame::parse(raw) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(
                    target: "dw_engine",
                    event = "frame_rejected",
                    from = %from,
                    error = %err,
                );
                return;
            }
        };
        self.inner.route_frame(from, frame).await;
    }

    /// Transport-level presence change. Coming online releases sends parked
    /// on that user.
    pub async fn note_presence(&self, address: &DeviceAddress, online: bool) {
        {
            let mut core = self.inner.core.lock().await;
            core.presence.note(address, online);
        }
        if online {
            self.inner.release_parked(&address.user_id).await;
        }
    }

    /// Drop queued (not yet started) work for a room. Jobs already
    /// mid-flight run to completion; recovery answers are never dropped.
    pub async fn leave_room(&self, room_id: &str) {
        self.inner.board.cancel_room(room_id).await;
        tracing::debug!(target: "dw_engine", event = "room_cancelled", room_id);
    }

    /// Rotate the signed prekey (and, on cadence, the identity pairs) if
    /// the configured age has passed. Persists and republishes before
    /// announcing to every device we hold a session with. Returns whether a
    /// rotation happened.
    pub async fn rotate_if_due(&self) -> Result<bool> {
        let (rotation, record, upload, announce, targets) = {
            let mut core = self.inner.core.lock().await;
            let rotation = core.identity.rotate_if_needed(Utc::now(), &self.inner.cfg);
            if !rotation.rotated {
                return Ok(false);
            }
            let record = core.identity.to_record_bytes()?;
            let upload = core.identity.bundle_upload();
            let announce = Frame::KeyAnnounce {
                public_key_jwk: core.identity.identity_jwk(),
                signing_public_key_jwk: core.identity.signing_jwk(),
            };
            (rotation, record, upload, announce, core.sessions.all_peers())
        };

        self.inner
            .key_store
            .store_identity(&self.inner.cfg.user_id, &self.inner.cfg.device_id, &record)
            .await?;
        // If this publish fails the identity is already persisted; the
        // caller recovers with [`Messenger::republish_bundle`].
        self.inner.directory.publish_bundle(&upload).await?;

        for device in &targets {
            if let Err(err) = self.inner.sink.deliver(device, &announce).await {
                tracing::warn!(
                    target: "dw_engine",
                    event = "key_announce_failed",
                    to = %device,
                    error = %err,
                );
            }
        }
        self.inner.emit(EngineEvent::IdentityRotated {
            identity_replaced: rotation.identity_replaced,
        });
        tracing::info!(
            target: "dw_engine",
            event = "identity_rotated",
            identity_replaced = rotation.identity_replaced,
            announced_to = targets.len(),
        );
        Ok(true)
    }

    /// Push the current bundle to the directory again, e.g. after a
    /// publish failure inside [`Messenger::rotate_if_due`].
    pub async fn republish_bundle(&self) -> Result<()> {
        let upload = {
            let core = self.inner.core.lock().await;
            core.identity.bundle_upload()
        };
        self.inner.directory.publish_bundle(&upload).await
    }

    /// The 60-digit fingerprint for out-of-band verification against
    /// `user_id`. Needs that user's identity key, learned from a bundle
    /// fetch, a `key_announce` or a received envelope.
    pub async fn safety_number(&self, user_id: &str) -> Result<String> {
        let core = self.inner.core.lock().await;
        let peer = core
            .peers
            .get(user_id)
            .and_then(|record| record.identity_key_jwk.clone())
            .ok_or_else(|| {
                EngineError::Protocol(format!("no identity key recorded for {user_id}"))
            })?;
        core.identity.safety_number_with(&peer)
    }

    /// The keys we have pinned for `user_id`, identity then signing. For a
    /// "verify this contact" screen next to the safety number.
    pub async fn peer_keys(&self, user_id: &str) -> Option<(Jwk, Jwk)> {
        let core = self.inner.core.lock().await;
        let record = core.peers.get(user_id)?;
        record
            .identity_key_jwk
            .clone()
            .zip(record.signing_key_jwk.clone())
    }

    /// Session state toward one device, if any.
    pub async fn session_status(&self, peer: &DeviceAddress) -> Option<SessionStatus> {
        self.inner.core.lock().await.sessions.status(peer)
    }
}

// ── Frame routing ────────────────────────────────────────────────────────────

impl Inner {
    fn emit(&self, event: EngineEvent) {
        // Err just means nobody is subscribed right now.
        let _ = self.events.send(event);
    }

    fn enqueue_send(&self, job: SendJob) -> Result<()> {
        self.send_tx
            .send(job)
            .map_err(|_| EngineError::Protocol("send pipeline is gone".into()))
    }

    async fn route_frame(self: &Arc<Self>, from: DeviceAddress, frame: Frame) {
        tracing::trace!(
            target: "dw_engine",
            event = "frame_received",
            from = %from,
            frame_type = frame.frame_type(),
        );
        {
            // Any frame from a device is proof it is online.
            let mut core = self.core.lock().await;
            core.presence.note(&from, true);
        }

        match frame {
            Frame::KeyAnnounce {
                public_key_jwk,
                signing_public_key_jwk,
            } => {
                self.on_key_announce(from, public_key_jwk, signing_public_key_jwk)
                    .await;
            }
            Frame::DecryptAck {
                room_id,
                message_id,
                ..
            } => {
                self.emit(EngineEvent::MessageAcked {
                    room_id,
                    message_id,
                    by: from,
                });
            }
            Frame::DecryptRecoveryRequest {
                room_id,
                message_id,
                to_user_id,
                to_device_id,
                action: RecoveryAction::Resync,
                ..
            } => {
                self.on_recovery_request(from, room_id, message_id, to_user_id, to_device_id)
                    .await;
            }
            // Everything that can mutate a ratchet goes through the decrypt
            // pipeline so chain steps stay serialized.
            session_mutating @ (Frame::Ciphertext { .. }
            | Frame::DrHandshake { .. }
            | Frame::DecryptRecoveryPayload { .. }
            | Frame::MessageUpdate { .. }) => {
                let cancel = match frame_room(&session_mutating) {
                    Some(room_id) => self.board.token_for(room_id).await,
                    None => CancelToken::new(),
                };
                let job = DecryptJob {
                    from,
                    frame: session_mutating,
                    cancel,
                };
                if self.decrypt_tx.send(job).is_err() {
                    tracing::error!(target: "dw_engine", event = "decrypt_pipeline_gone");
                }
            }
        }
    }

    async fn on_key_announce(self: &Arc<Self>, from: DeviceAddress, identity: Jwk, signing: Jwk) {
        let changed = {
            let mut core = self.core.lock().await;
            let record = core.peers.entry(from.user_id.clone()).or_default();
            let changed = record.identity_key_jwk.as_ref() != Some(&identity);
            record.identity_key_jwk = Some(identity);
            record.signing_key_jwk = Some(signing);
            record.needs_refresh = true;
            changed
        };
        tracing::info!(
            target: "dw_engine",
            event = "peer_keys_announced",
            from = %from,
            changed,
        );
        if changed {
            self.emit(EngineEvent::PeerKeysChanged {
                user_id: from.user_id.clone(),
            });
        }
        self.release_parked(&from.user_id).await;
    }

    /// A peer could not decrypt one of our messages and asks for it again.
    /// Validation only; the actual answer runs on the send pipeline because
    /// it re-encrypts.
    async fn on_recovery_request(
        self: &Arc<Self>,
        from: DeviceAddress,
        room_id: String,
        message_id: String,
        to_user_id: String,
        to_device_id: Option<String>,
    ) {
        if to_user_id != self.cfg.user_id {
            tracing::warn!(
                target: "dw_engine",
                event = "recovery_request_misrouted",
                from = %from,
                to_user_id,
            );
            return;
        }
        if let Some(device) = &to_device_id {
            // Addressed to a sibling device of ours; not our request.
            if device != &self.cfg.device_id {
                return;
            }
        }
        tracing::info!(
            target: "dw_engine",
            event = "recovery_request_received",
            from = %from,
            room_id,
            message_id = %message_id,
        );
        let job = SendJob::Recovery {
            room_id,
            message_id,
            requester_user_id: from.user_id,
            requester_device_id: Some(from.device_id),
        };
        if self.enqueue_send(job).is_err() {
            tracing::error!(target: "dw_engine", event = "send_pipeline_gone");
        }
    }

    // ── Decrypt pipeline ─────────────────────────────────────────────────

    async fn process_decrypt(self: &Arc<Self>, job: DecryptJob) {
        if job.cancel.is_cancelled() {
            tracing::debug!(
                target: "dw_engine",
                event = "decrypt_job_dropped",
                from = %job.from,
            );
            return;
        }
        match job.frame {
            Frame::Ciphertext {
                room_id,
                message_id,
                from_user_id,
                envelope,
            } => {
                self.decrypt_ciphertext(job.from, room_id, message_id, from_user_id, envelope)
                    .await;
            }
            Frame::DrHandshake {
                step: HandshakeStep::Init,
                identity_public_key_jwk,
                identity_signing_public_key_jwk,
                session_version,
                ..
            } => {
                self.on_handshake_init(
                    job.from,
                    identity_public_key_jwk,
                    identity_signing_public_key_jwk,
                    session_version,
                )
                .await;
            }
            Frame::DrHandshake {
                step: HandshakeStep::Ack,
                session_version,
                ..
            } => {
                self.on_handshake_ack(job.from, session_version).await;
            }
            Frame::DecryptRecoveryPayload {
                room_id,
                message_id,
                to_user_id,
                to_device_id,
                envelope,
                ..
            } => {
                self.on_recovery_payload(
                    job.from,
                    room_id,
                    message_id,
                    to_user_id,
                    to_device_id,
                    envelope,
                )
                .await;
            }
            Frame::MessageUpdate {
                mode,
                room_id,
                message_id,
                envelope,
                ..
            } => {
                self.on_message_update(job.from, mode, room_id, message_id, envelope)
                    .await;
            }
            other => {
                tracing::warn!(
                    target: "dw_engine",
                    event = "unexpected_decrypt_job",
                    frame_type = other.frame_type(),
                );
            }
        }
    }

    async fn decrypt_ciphertext(
        self: &Arc<Self>,
        transport_from: DeviceAddress,
        room_id: String,
        message_id: String,
        from_user_id: String,
        envelope: CipherEnvelope,
    ) {
        // The signed device id names the sending device; the user id comes
        // from the authenticated transport, not the frame body.
        let sender = envelope.sender_address(&transport_from.user_id);
        if from_user_id != transport_from.user_id {
            tracing::warn!(
                target: "dw_engine",
                event = "sender_attribution_mismatch",
                claimed = %from_user_id,
                transport = %transport_from,
            );
        }

        let (outcome, keys_changed, record) = {
            let mut guard = self.core.lock().await;
            let core = &mut *guard;
            let keys_changed = note_sender_keys(core, &sender.user_id, &envelope);
            let outcome = decrypt_envelope(
                &mut core.sessions,
                &mut core.identity,
                &self.local_address,
                &sender,
                &envelope,
            );
            // A fresh responder install may have consumed a one-time
            // prekey; persist so a restart cannot re-offer it.
            let record = match &outcome {
                Ok(o) if o.established.is_some() => core.identity.to_record_bytes().ok(),
                _ => None,
            };
            (outcome, keys_changed, record)
        };

        if keys_changed {
            self.emit(EngineEvent::PeerKeysChanged {
                user_id: sender.user_id.clone(),
            });
        }
        if let Some(record) = record {
            if let Err(err) = self
                .key_store
                .store_identity(&self.cfg.user_id, &self.cfg.device_id, &record)
                .await
            {
                tracing::error!(
                    target: "dw_engine",
                    event = "identity_persist_failed",
                    error = %err,
                );
            }
        }

        match outcome {
            Ok(outcome) => {
                if let Some((peer, session_version)) = outcome.established {
                    self.emit(EngineEvent::SessionEstablished {
                        peer,
                        session_version,
                    });
                }
                let cached = CachedMessage {
                    plaintext: outcome.plaintext.clone(),
                    content_type: outcome.content_type.clone(),
                };
                if let Err(err) = self.plaintext_cache.put(&room_id, &message_id, cached).await {
                    tracing::warn!(
                        target: "dw_engine",
                        event = "plaintext_cache_put_failed",
                        error = %err,
                    );
                }
                tracing::info!(
                    target: "dw_engine",
                    event = "message_decrypted",
                    from = %sender,
                    room_id,
                    message_id = %message_id,
                );
                // Ack only after a successful decrypt; the author's UI uses
                // it as the delivered marker.
                let ack = Frame::DecryptAck {
                    room_id: room_id.clone(),
                    message_id: message_id.clone(),
                    from_user_id: sender.user_id.clone(),
                };
                if let Err(err) = self.sink.deliver(&sender, &ack).await {
                    tracing::warn!(
                        target: "dw_engine",
                        event = "ack_deliver_failed",
                        to = %sender,
                        error = %err,
                    );
                }
                self.emit(EngineEvent::MessageDecrypted {
                    room_id,
                    message_id,
                    from: sender.clone(),
                    content_type: outcome.content_type,
                    plaintext: outcome.plaintext,
                });
                self.release_parked(&sender.user_id).await;
            }
            Err(err) => {
                tracing::error!(
                    target: "dw_engine",
                    event = "decrypt_failed",
                    from = %sender,
                    room_id,
                    message_id = %message_id,
                    kind = ?err.kind(),
                    error = %err,
                );
                self.emit(EngineEvent::MessageFailed {
                    room_id: room_id.clone(),
                    message_id: message_id.clone(),
                    from: sender.clone(),
                    kind: err.kind(),
                });
                // Only a key/state miss is worth a resync; tampered or
                // misaddressed envelopes would fail again identically.
                if err.kind() == ErrorKind::Decrypt {
                    self.maybe_request_recovery(room_id, message_id, sender).await;
                }
            }
        }
    }

    /// Ask the author's device to re-encrypt a message we failed to
    /// decrypt, if the tracker allows it, and arm the payload timeout.
    async fn maybe_request_recovery(
        self: &Arc<Self>,
        room_id: String,
        message_id: String,
        author: DeviceAddress,
    ) {
        let key = RecoveryKey::new(
            &room_id,
            &author.user_id,
            &message_id,
            Some(author.device_id.clone()),
        );
        let ledger_key = key.ledger_key();
        let last_attempt = match self.resync_ledger.last_attempt(&ledger_key).await {
            Ok(at) => at,
            Err(err) => {
                tracing::warn!(
                    target: "dw_engine",
                    event = "resync_ledger_read_failed",
                    error = %err,
                );
                None
            }
        };

        let now = Utc::now();
        let generation = {
            let mut core = self.core.lock().await;
            let author_online = core.presence.is_user_online(&author.user_id);
            let decision = core.recovery.evaluate(
                &key,
                &self.cfg.user_id,
                author_online,
                last_attempt,
                now,
                self.cfg.recovery_cooldown,
            );
            match decision {
                RecoveryDecision::Send => core.recovery.begin(key.clone(), now),
                suppressed => {
                    tracing::debug!(
                        target: "dw_engine",
                        event = "recovery_suppressed",
                        reason = ?suppressed,
                        room_id = %key.room_id,
                        message_id = %key.message_id,
                    );
                    return;
                }
            }
        };

        let request = Frame::DecryptRecoveryRequest {
            room_id: room_id.clone(),
            message_id: message_id.clone(),
            from_user_id: self.cfg.user_id.clone(),
            from_device_id: Some(self.cfg.device_id.clone()),
            to_user_id: author.user_id.clone(),
            to_device_id: Some(author.device_id.clone()),
            action: RecoveryAction::Resync,
        };
        if let Err(err) = self.sink.deliver(&author, &request).await {
            // Entry stays pending; the timeout below cleans it up.
            tracing::warn!(
                target: "dw_engine",
                event = "recovery_request_deliver_failed",
                to = %author,
                error = %err,
            );
        }
        if let Err(err) = self.resync_ledger.record_attempt(&ledger_key, now).await {
            tracing::warn!(
                target: "dw_engine",
                event = "resync_ledger_write_failed",
                error = %err,
            );
        }
        tracing::info!(
            target: "dw_engine",
            event = "recovery_requested",
            room_id,
            message_id = %message_id,
            author = %author,
        );
        self.emit(EngineEvent::RecoveryRequested {
            room_id: room_id.clone(),
            message_id: message_id.clone(),
            from_user_id: author.user_id.clone(),
        });

        let timeout = self.cfg.recovery_timeout;
        let timer = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let expired = {
                let mut core = timer.core.lock().await;
                core.recovery.expire(&key, generation)
            };
            if expired {
                tracing::info!(
                    target: "dw_engine",
                    event = "recovery_timed_out",
                    room_id = %key.room_id,
                    message_id = %key.message_id,
                );
                timer.emit(EngineEvent::RecoveryTimedOut {
                    room_id: key.room_id.clone(),
                    message_id: key.message_id.clone(),
                });
            }
        });
    }

    /// A re-encrypted message answering one of our recovery requests. Only
    /// a request we actually have pending may reset our session state;
    /// unsolicited payloads are dropped before any crypto runs.
    async fn on_recovery_payload(
        self: &Arc<Self>,
        transport_from: DeviceAddress,
        room_id: String,
        message_id: String,
        to_user_id: String,
        to_device_id: Option<String>,
        envelope: CipherEnvelope,
    ) {
        if to_user_id != self.cfg.user_id {
            return;
        }
        if let Some(device) = &to_device_id {
            if device != &self.cfg.device_id {
                return;
            }
        }
        let author = envelope.sender_address(&transport_from.user_id);
        // The answering device may differ from the one the failing envelope
        // named, so fall back to the wildcard key.
        let exact = RecoveryKey::new(
            &room_id,
            &author.user_id,
            &message_id,
            Some(author.device_id.clone()),
        );
        let wildcard = RecoveryKey::new(&room_id, &author.user_id, &message_id, None);

        let (outcome, record) = {
            let mut guard = self.core.lock().await;
            let core = &mut *guard;
            let armed = if core.recovery.is_pending(&exact) {
                Some(exact)
            } else if core.recovery.is_pending(&wildcard) {
                Some(wildcard)
            } else {
                None
            };
            let Some(key) = armed else {
                drop(guard);
                tracing::warn!(
                    target: "dw_engine",
                    event = "recovery_payload_unsolicited",
                    from = %author,
                    room_id,
                    message_id = %message_id,
                );
                return;
            };
            let outcome = decrypt_envelope(
                &mut core.sessions,
                &mut core.identity,
                &self.local_address,
                &author,
                &envelope,
            );
            let record = match &outcome {
                Ok(o) => {
                    core.recovery.resolve(&key);
                    if o.established.is_some() {
                        core.identity.to_record_bytes().ok()
                    } else {
                        None
                    }
                }
                // Keep the entry pending; the author may answer again from
                // another device before the timeout fires.
                Err(_) => None,
            };
            (outcome, record)
        };

        if let Some(record) = record {
            if let Err(err) = self
                .key_store
                .store_identity(&self.cfg.user_id, &self.cfg.device_id, &record)
                .await
            {
                tracing::error!(
                    target: "dw_engine",
                    event = "identity_persist_failed",
                    error = %err,
                );
            }
        }

        match outcome {
            Ok(outcome) => {
                if let Some((peer, session_version)) = outcome.established {
                    self.emit(EngineEvent::SessionEstablished {
                        peer,
                        session_version,
                    });
                }
                let cached = CachedMessage {
                    plaintext: outcome.plaintext.clone(),
                    content_type: outcome.content_type.clone(),
                };
                if let Err(err) = self.plaintext_cache.put(&room_id, &message_id, cached).await {
                    tracing::warn!(
                        target: "dw_engine",
                        event = "plaintext_cache_put_failed",
                        error = %err,
                    );
                }
                tracing::info!(
                    target: "dw_engine",
                    event = "recovery_resolved",
                    from = %author,
                    room_id,
                    message_id = %message_id,
                );
                self.emit(EngineEvent::RecoveryResolved {
                    room_id: room_id.clone(),
                    message_id: message_id.clone(),
                });
                self.emit(EngineEvent::MessageDecrypted {
                    room_id,
                    message_id,
                    from: author.clone(),
                    content_type: outcome.content_type,
                    plaintext: outcome.plaintext,
                });
                self.release_parked(&author.user_id).await;
            }
            Err(err) => {
                tracing::error!(
                    target: "dw_engine",
                    event = "recovery_payload_failed",
                    from = %author,
                    room_id,
                    message_id = %message_id,
                    error = %err,
                );
                self.emit(EngineEvent::MessageFailed {
                    room_id,
                    message_id,
                    from: author,
                    kind: err.kind(),
                });
            }
        }
    }

    /// `dr_handshake init`: record the announced keys, make sure we hold a
    /// session for the return direction, and always ack.
    async fn on_handshake_init(
        self: &Arc<Self>,
        from: DeviceAddress,
        identity_jwk: Jwk,
        signing_jwk: Jwk,
        session_version: u32,
    ) {
        tracing::info!(
            target: "dw_engine",
            event = "handshake_init_received",
            from = %from,
            session_version,
        );
        let (keys_changed, have_slot) = {
            let mut core = self.core.lock().await;
            let record = core.peers.entry(from.user_id.clone()).or_default();
            let changed = record.identity_key_jwk.as_ref() != Some(&identity_jwk);
            record.identity_key_jwk = Some(identity_jwk);
            record.signing_key_jwk = Some(signing_jwk);
            (changed, core.sessions.slot(&from).is_some())
        };
        if keys_changed {
            self.emit(EngineEvent::PeerKeysChanged {
                user_id: from.user_id.clone(),
            });
        }

        // Pre-establish the return direction so our first send needs no
        // bundle fetch. Best effort only; the ack below never depends on it.
        let mut our_init: Option<Frame> = None;
        if !have_slot {
            match self.directory.fetch_user_bundles(&from.user_id).await {
                Ok(bundles) => {
                    let mut guard = self.core.lock().await;
                    let core = &mut *guard;
                    if core.sessions.slot(&from).is_none() {
                        if let Some(bundle) =
                            bundles.iter().find(|b| b.device_id == from.device_id)
                        {
                            match core.sessions.bootstrap_initiator(
                                core.identity.agreement(),
                                &from,
                                bundle,
                            ) {
                                Ok(version) => {
                                    our_init =
                                        Some(handshake::build_init(&core.identity, version));
                                }
                                Err(err) => {
                                    tracing::warn!(
                                        target: "dw_engine",
                                        event = "bootstrap_rejected",
                                        peer = %from,
                                        error = %err,
                                    );
                                }
                            }
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        target: "dw_engine",
                        event = "bundle_fetch_failed",
                        user_id = %from.user_id,
                        error = %err,
                    );
                }
            }
        }

        let ack = {
            let core = self.core.lock().await;
            let ratchet_pub = core
                .sessions
                .slot(&from)
                .and_then(|slot| slot.session.current_ratchet_pub());
            handshake::build_ack(&core.identity, ratchet_pub, session_version)
        };
        if let Err(err) = self.sink.deliver(&from, &ack).await {
            tracing::warn!(
                target: "dw_engine",
                event = "handshake_ack_deliver_failed",
                to = %from,
                error = %err,
            );
        }
        if let Some(init) = our_init {
            if let Err(err) = self.sink.deliver(&from, &init).await {
                tracing::warn!(
                    target: "dw_engine",
                    event = "handshake_init_deliver_failed",
                    to = %from,
                    error = %err,
                );
            }
        }
        self.release_parked(&from.user_id).await;
    }

    async fn on_handshake_ack(self: &Arc<Self>, from: DeviceAddress, session_version: u32) {
        let applied = {
            let mut core = self.core.lock().await;
            handshake::on_ack(&mut core.sessions, &from, session_version)
        };
        match applied {
            AckOutcome::Established(session_version) => {
                self.emit(EngineEvent::SessionEstablished {
                    peer: from.clone(),
                    session_version,
                });
                self.release_parked(&from.user_id).await;
            }
            AckOutcome::Ignored => {
                tracing::debug!(
                    target: "dw_engine",
                    event = "handshake_ack_ignored",
                    from = %from,
                    session_version,
                );
            }
        }
    }

    async fn on_message_update(
        self: &Arc<Self>,
        transport_from: DeviceAddress,
        mode: UpdateMode,
        room_id: String,
        message_id: String,
        envelope: Option<CipherEnvelope>,
    ) {
        match (mode, envelope) {
            (UpdateMode::Revoke, _) => {
                if let Err(err) = self.plaintext_cache.remove(&room_id, &message_id).await {
                    tracing::warn!(
                        target: "dw_engine",
                        event = "plaintext_cache_remove_failed",
                        error = %err,
                    );
                }
                tracing::info!(
                    target: "dw_engine",
                    event = "message_revoked",
                    from = %transport_from,
                    room_id,
                    message_id = %message_id,
                );
                self.emit(EngineEvent::MessageUpdated {
                    room_id,
                    message_id,
                    mode: UpdateMode::Revoke,
                    from: transport_from,
                    plaintext: None,
                    content_type: None,
                });
            }
            (UpdateMode::Edit, Some(envelope)) => {
                let sender = envelope.sender_address(&transport_from.user_id);
                let (outcome, keys_changed, record) = {
                    let mut guard = self.core.lock().await;
                    let core = &mut *guard;
                    let keys_changed = note_sender_keys(core, &sender.user_id, &envelope);
                    let outcome = decrypt_envelope(
                        &mut core.sessions,
                        &mut core.identity,
                        &self.local_address,
                        &sender,
                        &envelope,
                    );
                    let record = match &outcome {
                        Ok(o) if o.established.is_some() => core.identity.to_record_bytes().ok(),
                        _ => None,
                    };
                    (outcome, keys_changed, record)
                };
                if keys_changed {
                    self.emit(EngineEvent::PeerKeysChanged {
                        user_id: sender.user_id.clone(),
                    });
                }
                if let Some(record) = record {
                    if let Err(err) = self
                        .key_store
                        .store_identity(&self.cfg.user_id, &self.cfg.device_id, &record)
                        .await
                    {
                        tracing::error!(
                            target: "dw_engine",
                            event = "identity_persist_failed",
                            error = %err,
                        );
                    }
                }
                match outcome {
                    Ok(outcome) => {
                        if let Some((peer, session_version)) = outcome.established {
                            self.emit(EngineEvent::SessionEstablished {
                                peer,
                                session_version,
                            });
                        }
                        let cached = CachedMessage {
                            plaintext: outcome.plaintext.clone(),
                            content_type: outcome.content_type.clone(),
                        };
                        if let Err(err) =
                            self.plaintext_cache.put(&room_id, &message_id, cached).await
                        {
                            tracing::warn!(
                                target: "dw_engine",
                                event = "plaintext_cache_put_failed",
                                error = %err,
                            );
                        }
                        self.emit(EngineEvent::MessageUpdated {
                            room_id,
                            message_id,
                            mode: UpdateMode::Edit,
                            from: sender,
                            plaintext: Some(outcome.plaintext),
                            content_type: Some(outcome.content_type),
                        });
                    }
                    // Edits never trigger recovery: the original stays in
                    // history and a resync of the edit would race further
                    // edits of the same message.
                    Err(err) => {
                        tracing::error!(
                            target: "dw_engine",
                            event = "edit_decrypt_failed",
                            from = %sender,
                            room_id,
                            message_id = %message_id,
                            error = %err,
                        );
                        self.emit(EngineEvent::MessageFailed {
                            room_id,
                            message_id,
                            from: sender,
                            kind: err.kind(),
                        });
                    }
                }
            }
            (UpdateMode::Edit, None) => {
                tracing::warn!(
                    target: "dw_engine",
                    event = "edit_without_envelope",
                    from = %transport_from,
                    message_id = %message_id,
                );
            }
        }
    }

    // ── Send pipeline ────────────────────────────────────────────────────

    async fn process_send(self: &Arc<Self>, job: SendJob) {
        if job.is_cancelled() {
            tracing::debug!(
                target: "dw_engine",
                event = "send_job_dropped",
                room_id = job.room_id(),
            );
            return;
        }
        match job {
            SendJob::Message {
                room_id,
                message_id,
                plaintext,
                content_type,
                to_users,
                cancel,
            } => {
                self.send_content(room_id, message_id, plaintext, content_type, to_users, cancel)
                    .await;
            }
            SendJob::Update {
                mode,
                room_id,
                message_id,
                plaintext,
                content_type,
                to_users,
                cancel,
            } => {
                self.send_update(mode, room_id, message_id, plaintext, content_type, to_users, cancel)
                    .await;
            }
            SendJob::Recovery {
                room_id,
                message_id,
                requester_user_id,
                requester_device_id,
            } => {
                self.answer_recovery(room_id, message_id, requester_user_id, requester_device_id)
                    .await;
            }
        }
    }

    async fn send_content(
        self: &Arc<Self>,
        room_id: String,
        message_id: String,
        plaintext: Vec<u8>,
        content_type: String,
        to_users: Vec<String>,
        cancel: CancelToken,
    ) {
        match self.resolve_and_encrypt(&to_users, &plaintext, &content_type).await {
            Ok(resolved) => {
                self.announce_handshakes(resolved.handshake_inits).await;
                let frame = Frame::Ciphertext {
                    room_id: room_id.clone(),
                    message_id: message_id.clone(),
                    from_user_id: self.cfg.user_id.clone(),
                    envelope: resolved.envelope,
                };
                match self.deliver_to_all(&resolved.recipients, &frame).await {
                    Ok(()) => {
                        let cached = CachedMessage {
                            plaintext,
                            content_type,
                        };
                        if let Err(err) =
                            self.plaintext_cache.put(&room_id, &message_id, cached).await
                        {
                            tracing::warn!(
                                target: "dw_engine",
                                event = "plaintext_cache_put_failed",
                                error = %err,
                            );
                        }
                        tracing::info!(
                            target: "dw_engine",
                            event = "message_sent",
                            room_id,
                            message_id = %message_id,
                            recipients = resolved.recipients.len(),
                        );
                        self.emit(EngineEvent::MessageSent {
                            room_id,
                            message_id,
                        });
                    }
                    // Every recipient chain already advanced; retrying
                    // would re-encrypt with fresh state, so surface it and
                    // let the user send again.
                    Err(err) => {
                        self.emit(EngineEvent::SendFailed {
                            room_id,
                            message_id,
                            kind: err.kind(),
                        });
                    }
                }
            }
            Err(ResolveError::Park { waiting_on }) => {
                tracing::info!(
                    target: "dw_engine",
                    event = "send_parked",
                    room_id,
                    message_id = %message_id,
                    waiting_on = %waiting_on,
                );
                let job = SendJob::Message {
                    room_id: room_id.clone(),
                    message_id: message_id.clone(),
                    plaintext,
                    content_type,
                    to_users,
                    cancel,
                };
                self.park_job(job, &waiting_on).await;
                self.emit(EngineEvent::SendParked {
                    room_id,
                    message_id,
                    waiting_on,
                });
            }
            Err(ResolveError::Fail(err)) => {
                tracing::error!(
                    target: "dw_engine",
                    event = "send_failed",
                    room_id,
                    message_id = %message_id,
                    kind = ?err.kind(),
                    error = %err,
                );
                self.emit(EngineEvent::SendFailed {
                    room_id,
                    message_id,
                    kind: err.kind(),
                });
            }
        }
    }

    async fn send_update(
        self: &Arc<Self>,
        mode: UpdateMode,
        room_id: String,
        message_id: String,
        plaintext: Option<Vec<u8>>,
        content_type: Option<String>,
        to_users: Vec<String>,
        cancel: CancelToken,
    ) {
        match mode {
            UpdateMode::Edit => {
                let (Some(body), Some(ct)) = (plaintext, content_type) else {
                    tracing::warn!(
                        target: "dw_engine",
                        event = "edit_without_content",
                        message_id = %message_id,
                    );
                    return;
                };
                match self.resolve_and_encrypt(&to_users, &body, &ct).await {
                    Ok(resolved) => {
                        self.announce_handshakes(resolved.handshake_inits).await;
                        let frame = Frame::MessageUpdate {
                            mode: UpdateMode::Edit,
                            room_id: room_id.clone(),
                            message_id: message_id.clone(),
                            from_user_id: self.cfg.user_id.clone(),
                            envelope: Some(resolved.envelope),
                        };
                        match self.deliver_to_all(&resolved.recipients, &frame).await {
                            Ok(()) => {
                                let cached = CachedMessage {
                                    plaintext: body,
                                    content_type: ct,
                                };
                                if let Err(err) = self
                                    .plaintext_cache
                                    .put(&room_id, &message_id, cached)
                                    .await
                                {
                                    tracing::warn!(
                                        target: "dw_engine",
                                        event = "plaintext_cache_put_failed",
                                        error = %err,
                                    );
                                }
                                tracing::info!(
                                    target: "dw_engine",
                                    event = "edit_sent",
                                    room_id,
                                    message_id = %message_id,
                                );
                                self.emit(EngineEvent::MessageSent {
                                    room_id,
                                    message_id,
                                });
                            }
                            Err(err) => {
                                self.emit(EngineEvent::SendFailed {
                                    room_id,
                                    message_id,
                                    kind: err.kind(),
                                });
                            }
                        }
                    }
                    Err(ResolveError::Park { waiting_on }) => {
                        let job = SendJob::Update {
                            mode: UpdateMode::Edit,
                            room_id: room_id.clone(),
                            message_id: message_id.clone(),
                            plaintext: Some(body),
                            content_type: Some(ct),
                            to_users,
                            cancel,
                        };
                        self.park_job(job, &waiting_on).await;
                        self.emit(EngineEvent::SendParked {
                            room_id,
                            message_id,
                            waiting_on,
                        });
                    }
                    Err(ResolveError::Fail(err)) => {
                        self.emit(EngineEvent::SendFailed {
                            room_id,
                            message_id,
                            kind: err.kind(),
                        });
                    }
                }
            }
            // A revoke carries no content, so it is deliverable to any
            // device we know of without a session and drops the local
            // plaintext whether or not delivery succeeds everywhere.
            UpdateMode::Revoke => {
                let recipients = {
                    let core = self.core.lock().await;
                    let mut devices = Vec::new();
                    for user in &to_users {
                        devices.extend(
                            core.sessions
                                .devices_for_user(user)
                                .into_iter()
                                .filter(|d| d != &self.local_address),
                        );
                    }
                    devices.extend(
                        core.sessions
                            .devices_for_user(&self.cfg.user_id)
                            .into_iter()
                            .filter(|d| d != &self.local_address),
                    );
                    devices.sort();
                    devices.dedup();
                    devices
                };
                if let Err(err) = self.plaintext_cache.remove(&room_id, &message_id).await {
                    tracing::warn!(
                        target: "dw_engine",
                        event = "plaintext_cache_remove_failed",
                        error = %err,
                    );
                }
                let frame = Frame::MessageUpdate {
                    mode: UpdateMode::Revoke,
                    room_id: room_id.clone(),
                    message_id: message_id.clone(),
                    from_user_id: self.cfg.user_id.clone(),
                    envelope: None,
                };
                match self.deliver_to_all(&recipients, &frame).await {
                    Ok(()) => {
                        tracing::info!(
                            target: "dw_engine",
                            event = "revoke_sent",
                            room_id,
                            message_id = %message_id,
                        );
                        self.emit(EngineEvent::MessageSent {
                            room_id,
                            message_id,
                        });
                    }
                    Err(err) => {
                        self.emit(EngineEvent::SendFailed {
                            room_id,
                            message_id,
                            kind: err.kind(),
                        });
                    }
                }
            }
        }
    }

    /// Serve a recovery request: re-derive the plaintext from our cache,
    /// force a fresh bootstrap toward the requester's device(s) and answer
    /// with a payload addressed only to them. Silence on a cache miss is
    /// deliberate; the requester's entry times out.
    async fn answer_recovery(
        self: &Arc<Self>,
        room_id: String,
        message_id: String,
        requester_user_id: String,
        requester_device_id: Option<String>,
    ) {
        let cached = match self.plaintext_cache.get(&room_id, &message_id).await {
            Ok(Some(cached)) => cached,
            Ok(None) => {
                tracing::info!(
                    target: "dw_engine",
                    event = "recovery_no_plaintext",
                    room_id,
                    message_id = %message_id,
                );
                return;
            }
            Err(err) => {
                tracing::error!(
                    target: "dw_engine",
                    event = "plaintext_cache_read_failed",
                    error = %err,
                );
                return;
            }
        };

        // The requester could not decrypt, so whatever session state the
        // pair had is suspect. Re-bootstrapping from a fresh bundle is the
        // one legitimate mid-conversation reset.
        let bundles = match self.directory.fetch_user_bundles(&requester_user_id).await {
            Ok(bundles) => bundles,
            Err(err) => {
                tracing::error!(
                    target: "dw_engine",
                    event = "bundle_fetch_failed",
                    user_id = %requester_user_id,
                    error = %err,
                );
                return;
            }
        };

        let (frame, recipients) = {
            let mut guard = self.core.lock().await;
            let core = &mut *guard;
            let mut recipients = Vec::new();
            for bundle in &bundles {
                if let Some(device) = &requester_device_id {
                    if &bundle.device_id != device {
                        continue;
                    }
                }
                let address = DeviceAddress::new(&bundle.user_id, &bundle.device_id);
                if address == self.local_address {
                    continue;
                }
                match core
                    .sessions
                    .bootstrap_initiator(core.identity.agreement(), &address, bundle)
                {
                    Ok(_) => recipients.push(address),
                    Err(err) => {
                        tracing::warn!(
                            target: "dw_engine",
                            event = "bootstrap_rejected",
                            peer = %address,
                            error = %err,
                        );
                    }
                }
            }
            if recipients.is_empty() {
                drop(guard);
                tracing::warn!(
                    target: "dw_engine",
                    event = "recovery_no_requester_device",
                    user_id = %requester_user_id,
                );
                return;
            }
            let envelope = match encrypt_for_recipients(
                &mut core.sessions,
                &core.identity,
                &recipients,
                &cached.plaintext,
                &cached.content_type,
                self.cfg.padding,
            ) {
                Ok(envelope) => envelope,
                Err(err) => {
                    drop(guard);
                    tracing::error!(
                        target: "dw_engine",
                        event = "recovery_encrypt_failed",
                        error = %err,
                    );
                    return;
                }
            };
            let frame = Frame::DecryptRecoveryPayload {
                room_id: room_id.clone(),
                message_id: message_id.clone(),
                from_user_id: self.cfg.user_id.clone(),
                from_device_id: Some(self.cfg.device_id.clone()),
                to_user_id: requester_user_id.clone(),
                to_device_id: requester_device_id.clone(),
                envelope,
            };
            (frame, recipients)
        };

        for device in &recipients {
            if let Err(err) = self.sink.deliver(device, &frame).await {
                tracing::warn!(
                    target: "dw_engine",
                    event = "recovery_payload_deliver_failed",
                    to = %device,
                    error = %err,
                );
            }
        }
        tracing::info!(
            target: "dw_engine",
            event = "recovery_answered",
            room_id,
            message_id = %message_id,
            requester = %requester_user_id,
            devices = recipients.len(),
        );
    }

    // ── Recipient resolution ─────────────────────────────────────────────

    /// Make sure every target user has bootstrapped sessions, then build
    /// the envelope. Bundle fetches happen before the state lock is taken.
    async fn resolve_and_encrypt(
        &self,
        to_users: &[String],
        plaintext: &[u8],
        content_type: &str,
    ) -> std::result::Result<ResolvedSend, ResolveError> {
        // Sibling devices of our own user receive everything we send.
        let mut users: Vec<String> = to_users.to_vec();
        if !users.iter().any(|u| u == &self.cfg.user_id) {
            users.push(self.cfg.user_id.clone());
        }
        users.sort();
        users.dedup();

        let fetch_users: Vec<String> = {
            let core = self.core.lock().await;
            users
                .iter()
                .filter(|user| {
                    let needs_refresh = core
                        .peers
                        .get(user.as_str())
                        .map(|record| record.needs_refresh)
                        .unwrap_or(false);
                    let has_device = core
                        .sessions
                        .devices_for_user(user.as_str())
                        .iter()
                        .any(|d| d != &self.local_address);
                    needs_refresh || !has_device
                })
                .cloned()
                .collect()
        };

        let mut fetched: Vec<(String, Vec<DeviceKeyBundle>)> = Vec::new();
        for user in &fetch_users {
            match self.directory.fetch_user_bundles(user).await {
                Ok(bundles) => fetched.push((user.clone(), bundles)),
                // No session state has been touched yet, so a network
                // failure here is cleanly retryable by the caller.
                Err(err) => return Err(ResolveError::Fail(err)),
            }
        }

        let mut guard = self.core.lock().await;
        let core = &mut *guard;
        let mut handshake_inits = Vec::new();
        for (user, bundles) in &fetched {
            let refresh = core
                .peers
                .get(user)
                .map(|record| record.needs_refresh)
                .unwrap_or(false);
            for bundle in bundles {
                let address = DeviceAddress::new(&bundle.user_id, &bundle.device_id);
                if address == self.local_address {
                    continue;
                }
                if !refresh && core.sessions.slot(&address).is_some() {
                    continue;
                }
                match core
                    .sessions
                    .bootstrap_initiator(core.identity.agreement(), &address, bundle)
                {
                    Ok(version) => handshake_inits.push(OutboundFrame {
                        to: address,
                        frame: handshake::build_init(&core.identity, version),
                    }),
                    // One bad bundle must not block the other devices.
                    Err(err) => {
                        tracing::warn!(
                            target: "dw_engine",
                            event = "bootstrap_rejected",
                            peer = %address,
                            error = %err,
                        );
                    }
                }
            }
            if let Some(bundle) = bundles.first() {
                let record = core.peers.entry(user.clone()).or_default();
                record.identity_key_jwk = Some(bundle.identity_key_jwk.clone());
                record.signing_key_jwk = Some(bundle.signing_key_jwk.clone());
            }
            if let Some(record) = core.peers.get_mut(user) {
                record.needs_refresh = false;
            }
        }

        let mut recipients: Vec<DeviceAddress> = Vec::new();
        let mut missing: Option<String> = None;
        for user in &users {
            let devices: Vec<DeviceAddress> = core
                .sessions
                .devices_for_user(user)
                .into_iter()
                .filter(|d| d != &self.local_address)
                .collect();
            if devices.is_empty() && user != &self.cfg.user_id {
                // Not enrolled yet. The send proceeds for everyone else;
                // only a send with no recipients at all parks.
                tracing::warn!(
                    target: "dw_engine",
                    event = "recipient_has_no_devices",
                    user_id = %user,
                );
                missing.get_or_insert_with(|| user.clone());
            }
            recipients.extend(devices);
        }
        if recipients.is_empty() {
            let waiting_on = missing.unwrap_or_else(|| self.cfg.user_id.clone());
            return Err(ResolveError::Park { waiting_on });
        }

        match encrypt_for_recipients(
            &mut core.sessions,
            &core.identity,
            &recipients,
            plaintext,
            content_type,
            self.cfg.padding,
        ) {
            Ok(envelope) => Ok(ResolvedSend {
                envelope,
                recipients,
                handshake_inits,
            }),
            Err(EngineError::SessionPending { peer }) => Err(ResolveError::Park {
                waiting_on: peer.user_id,
            }),
            Err(err) => Err(ResolveError::Fail(err)),
        }
    }

    // ── Helpers ──────────────────────────────────────────────────────────

    async fn park_job(&self, job: SendJob, waiting_on: &str) {
        let mut core = self.core.lock().await;
        core.parked.entry(waiting_on.to_owned()).or_default().push(job);
    }

    /// Re-enqueue sends parked on `user_id`. Called whenever a session,
    /// bundle or presence for that user shows up.
    async fn release_parked(&self, user_id: &str) {
        let jobs = {
            let mut core = self.core.lock().await;
            core.parked.remove(user_id).unwrap_or_default()
        };
        for job in jobs {
            if job.is_cancelled() {
                continue;
            }
            tracing::info!(
                target: "dw_engine",
                event = "send_unparked",
                room_id = job.room_id(),
                user_id,
            );
            if self.send_tx.send(job).is_err() {
                return;
            }
        }
    }

    async fn announce_handshakes(&self, inits: Vec<OutboundFrame>) {
        for init in inits {
            if let Err(err) = self.sink.deliver(&init.to, &init.frame).await {
                tracing::warn!(
                    target: "dw_engine",
                    event = "handshake_init_deliver_failed",
                    to = %init.to,
                    error = %err,
                );
            }
        }
    }

    /// Deliver one frame to every device, attempting all of them before
    /// reporting. Partial delivery is a network failure: the skipped-key
    /// cache absorbs the gap for devices that missed this message.
    async fn deliver_to_all(&self, recipients: &[DeviceAddress], frame: &Frame) -> Result<()> {
        let mut failed = 0usize;
        for device in recipients {
            if let Err(err) = self.sink.deliver(device, frame).await {
                failed += 1;
                tracing::error!(
                    target: "dw_engine",
                    event = "frame_deliver_failed",
                    to = %device,
                    frame_type = frame.frame_type(),
                    error = %err,
                );
            }
        }
        if failed > 0 {
            return Err(EngineError::Network(format!(
                "{failed} of {} deliveries failed",
                recipients.len()
            )));
        }
        Ok(())
    }
}

/// TOFU bookkeeping for an envelope's self-attested sender keys. Returns
/// whether the identity key changed from the recorded one.
fn note_sender_keys(core: &mut Core, user_id: &str, envelope: &CipherEnvelope) -> bool {
    let record = core.peers.entry(user_id.to_owned()).or_default();
    let changed = record
        .identity_key_jwk
        .as_ref()
        .is_some_and(|known| known != &envelope.sender_identity_key_jwk);
    if record.identity_key_jwk.is_none() || changed {
        record.identity_key_jwk = Some(envelope.sender_identity_key_jwk.clone());
        record.signing_key_jwk = Some(envelope.sender_signing_key_jwk.clone());
    }
    changed
}

fn frame_room(frame: &Frame) -> Option<&str> {
    match frame {
        Frame::Ciphertext { room_id, .. }
        | Frame::DecryptRecoveryPayload { room_id, .. }
        | Frame::MessageUpdate { room_id, .. } => Some(room_id),
        _ => None,
    }
}

struct ResolvedSend {
    envelope: CipherEnvelope,
    recipients: Vec<DeviceAddress>,
    /// One `dr_handshake init` per freshly bootstrapped device, sent ahead
    /// of the ciphertext so the peer can surface "secure channel ready".
    handshake_inits: Vec<OutboundFrame>,
}

enum ResolveError {
    /// No addressable recipient yet; the job waits on `waiting_on`.
    Park { waiting_on: String },
    Fail(EngineError),
}
