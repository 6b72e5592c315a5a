//! Key rotation end to end: the announce reaches session peers, the safety
//! number moves, and the next inbound send re-bootstraps on fresh keys.

mod common;

use std::sync::Arc;

use common::{spawn_device, spawn_device_with, wait_established, wait_for, Router};
use dw_engine::{EngineConfig, EngineEvent, MemoryDirectory};

#[tokio::test]
async fn rotation_reannounces_and_reestablishes_sessions() {
    let router = Router::new();
    let directory = Arc::new(MemoryDirectory::new());
    // Alice rotates whenever asked, replacing the identity pair every time.
    let mut cfg = EngineConfig::new("alice", "alice-web");
    cfg.rotation_max_age = chrono::Duration::zero();
    cfg.identity_refresh_every = 1;
    let alice = spawn_device_with(&router, &directory, cfg).await;
    let bob = spawn_device(&router, &directory, "bob", "bob-web").await;
    let mut alice_events = alice.engine.subscribe();
    let mut bob_events = bob.engine.subscribe();

    // First contact pins Alice's identity key at Bob's side.
    alice
        .engine
        .send_message("room-1", &["bob".to_owned()], b"hi".to_vec(), "text/plain")
        .await
        .unwrap();
    wait_for(&mut bob_events, |event| match event {
        EngineEvent::MessageDecrypted { .. } => Some(()),
        _ => None,
    })
    .await;
    let version = wait_established(&mut alice_events, &bob.address()).await;
    assert_eq!(version, 1);
    let sn_before = bob.engine.safety_number("alice").await.unwrap();

    let rotated = alice.engine.rotate_if_due().await.unwrap();
    assert!(rotated);
    let replaced = wait_for(&mut alice_events, |event| match event {
        EngineEvent::IdentityRotated { identity_replaced } => Some(identity_replaced),
        _ => None,
    })
    .await;
    assert!(replaced);

    // The key_announce lands on every device Alice holds a session with.
    let changed_user = wait_for(&mut bob_events, |event| match event {
        EngineEvent::PeerKeysChanged { user_id } => Some(user_id),
        _ => None,
    })
    .await;
    assert_eq!(changed_user, "alice");
    let sn_after = bob.engine.safety_number("alice").await.unwrap();
    assert_ne!(sn_before, sn_after);

    // The announce marked Alice stale, so Bob's next send refetches her
    // bundle and bootstraps a replacement session on the new keys.
    let m2 = bob
        .engine
        .send_message("room-1", &["alice".to_owned()], b"new you".to_vec(), "text/plain")
        .await
        .unwrap();
    // Alice answers the embedded bootstrap before surfacing the plaintext,
    // so the establishment event comes first on her stream.
    let version = wait_established(&mut alice_events, &bob.address()).await;
    assert_eq!(version, 2);
    let (decrypted_id, plaintext) = wait_for(&mut alice_events, |event| match event {
        EngineEvent::MessageDecrypted {
            message_id,
            plaintext,
            ..
        } => Some((message_id, plaintext)),
        _ => None,
    })
    .await;
    assert_eq!(decrypted_id, m2);
    assert_eq!(plaintext, b"new you");

    // Bob's side confirms on the same bumped version via the handshake ack.
    let version = wait_established(&mut bob_events, &alice.address()).await;
    assert_eq!(version, 2);
}
