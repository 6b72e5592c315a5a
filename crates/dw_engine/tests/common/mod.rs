//! Shared harness: full engines wired through an in-process frame router,
//! so tests exercise the same paths a WebSocket transport would drive.

// Each test binary compiles this module; not all of them use every helper.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};

use dw_engine::{
    EngineConfig, EngineError, EngineEvent, FrameSink, MemoryDirectory, MemoryKeyStore,
    MemoryPlaintextCache, MemoryResyncLedger, Messenger, Result,
};
use dw_proto::address::DeviceAddress;
use dw_proto::frames::{Frame, OutboundFrame};

static TRACING: Once = Once::new();

/// Structured logging for test runs, on request: `RUST_LOG=dw_engine=debug`.
fn init_tracing() {
    TRACING.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "dw_engine=warn".into()),
            )
            .with_test_writer()
            .init();
    });
}

/// In-process stand-in for the message server: looks up the target engine
/// by device address and feeds it the encoded frame. Unregistered targets
/// swallow frames the way a server queues for an offline device.
pub struct Router {
    engines: Mutex<HashMap<DeviceAddress, Messenger>>,
    /// Deliveries to these addresses fail with a network error instead.
    broken: Mutex<HashSet<DeviceAddress>>,
    /// Ciphertext frames to these addresses are buffered until
    /// [`Router::release_held`], for out-of-order delivery tests.
    holding: Mutex<HashSet<DeviceAddress>>,
    held: Mutex<Vec<(DeviceAddress, DeviceAddress, Frame)>>,
    log: Mutex<Vec<OutboundFrame>>,
}

impl Router {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            engines: Mutex::new(HashMap::new()),
            broken: Mutex::new(HashSet::new()),
            holding: Mutex::new(HashSet::new()),
            held: Mutex::new(Vec::new()),
            log: Mutex::new(Vec::new()),
        })
    }

    pub async fn register(&self, engine: &Messenger) {
        self.engines
            .lock()
            .await
            .insert(engine.local_address(), engine.clone());
    }

    /// Frames to this address vanish from now on.
    pub async fn disconnect(&self, address: &DeviceAddress) {
        self.engines.lock().await.remove(address);
    }

    /// Frames to this address fail loudly from now on.
    pub async fn break_link(&self, address: DeviceAddress) {
        self.broken.lock().await.insert(address);
    }

    pub async fn hold_ciphertexts_to(&self, address: DeviceAddress) {
        self.holding.lock().await.insert(address);
    }

    /// Let new ciphertexts through again without touching the buffer.
    pub async fn stop_holding(&self) {
        self.holding.lock().await.clear();
    }

    /// Stop holding and deliver everything buffered, in buffer order.
    pub async fn release_held(&self) {
        self.holding.lock().await.clear();
        let held = std::mem::take(&mut *self.held.lock().await);
        for (from, to, frame) in held {
            let _ = self.route(from, &to, &frame).await;
        }
    }

    pub async fn sent_frames(&self) -> Vec<OutboundFrame> {
        self.log.lock().await.clone()
    }

    async fn route(&self, from: DeviceAddress, to: &DeviceAddress, frame: &Frame) -> Result<()> {
        if self.broken.lock().await.contains(to) {
            return Err(EngineError::Network(format!("link to {to} is down")));
        }
        if matches!(frame, Frame::Ciphertext { .. }) && self.holding.lock().await.contains(to) {
            self.held
                .lock()
                .await
                .push((from, to.clone(), frame.clone()));
            return Ok(());
        }
        self.log.lock().await.push(OutboundFrame {
            to: to.clone(),
            frame: frame.clone(),
        });
        let target = self.engines.lock().await.get(to).cloned();
        if let Some(engine) = target {
            let raw = frame.encode()?;
            engine.handle_frame(from, &raw).await;
        }
        Ok(())
    }
}

struct Wire {
    router: Arc<Router>,
    from: DeviceAddress,
}

#[async_trait]
impl FrameSink for Wire {
    async fn deliver(&self, to: &DeviceAddress, frame: &Frame) -> Result<()> {
        self.router.route(self.from.clone(), to, frame).await
    }
}

/// A running engine plus its backing stores, kept apart so a test can
/// restart the device against the same persistence.
pub struct TestDevice {
    pub engine: Messenger,
    pub key_store: Arc<MemoryKeyStore>,
    pub plaintext_cache: Arc<MemoryPlaintextCache>,
    pub resync_ledger: Arc<MemoryResyncLedger>,
    cfg: EngineConfig,
    router: Arc<Router>,
    directory: Arc<MemoryDirectory>,
}

pub async fn spawn_device(
    router: &Arc<Router>,
    directory: &Arc<MemoryDirectory>,
    user: &str,
    device: &str,
) -> TestDevice {
    spawn_device_with(router, directory, EngineConfig::new(user, device)).await
}

pub async fn spawn_device_with(
    router: &Arc<Router>,
    directory: &Arc<MemoryDirectory>,
    cfg: EngineConfig,
) -> TestDevice {
    let key_store = Arc::new(MemoryKeyStore::new());
    let plaintext_cache = Arc::new(MemoryPlaintextCache::new());
    let resync_ledger = Arc::new(MemoryResyncLedger::new());
    let engine = start(
        router,
        directory,
        &cfg,
        &key_store,
        &plaintext_cache,
        &resync_ledger,
    )
    .await;
    TestDevice {
        engine,
        key_store,
        plaintext_cache,
        resync_ledger,
        cfg,
        router: Arc::clone(router),
        directory: Arc::clone(directory),
    }
}

impl TestDevice {
    pub fn address(&self) -> DeviceAddress {
        self.engine.local_address()
    }

    /// Simulate a process restart: same stores, fresh engine. Sessions are
    /// memory-only, so they are gone; the identity record survives.
    pub async fn restart(&mut self) {
        self.engine = start(
            &self.router,
            &self.directory,
            &self.cfg,
            &self.key_store,
            &self.plaintext_cache,
            &self.resync_ledger,
        )
        .await;
    }
}

async fn start(
    router: &Arc<Router>,
    directory: &Arc<MemoryDirectory>,
    cfg: &EngineConfig,
    key_store: &Arc<MemoryKeyStore>,
    plaintext_cache: &Arc<MemoryPlaintextCache>,
    resync_ledger: &Arc<MemoryResyncLedger>,
) -> Messenger {
    init_tracing();
    let wire = Arc::new(Wire {
        router: Arc::clone(router),
        from: cfg.local_address(),
    });
    let engine = Messenger::start(
        cfg.clone(),
        Arc::clone(key_store) as Arc<dyn dw_engine::KeyStore>,
        Arc::clone(plaintext_cache) as Arc<dyn dw_engine::PlaintextCache>,
        Arc::clone(resync_ledger) as Arc<dyn dw_engine::ResyncLedger>,
        Arc::clone(directory) as Arc<dyn dw_engine::Directory>,
        wire,
    )
    .await
    .expect("engine start");
    router.register(&engine).await;
    engine
}

/// Receive events until `pick` accepts one. The 30 s budget outlasts every
/// engine timer, which matters under a paused clock where the runtime
/// fast-forwards to whichever timer is nearest.
pub async fn wait_for<T>(
    events: &mut broadcast::Receiver<EngineEvent>,
    mut pick: impl FnMut(EngineEvent) -> Option<T>,
) -> T {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if let Some(value) = pick(event) {
                return value;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Wait until this side reports its session with `peer` established.
pub async fn wait_established(
    events: &mut broadcast::Receiver<EngineEvent>,
    peer: &DeviceAddress,
) -> u32 {
    let peer = peer.clone();
    wait_for(events, move |event| match event {
        EngineEvent::SessionEstablished {
            peer: p,
            session_version,
        } if p == peer => Some(session_version),
        _ => None,
    })
    .await
}
