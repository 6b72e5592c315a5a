//! Decrypt-recovery round trips: a restarted device resyncs a missed
//! message from the author's cache, and an unanswered request times out
//! into a cooldown instead of hammering the author.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{spawn_device, wait_established, wait_for, Router};
use dw_engine::{EngineEvent, ErrorKind, MemoryDirectory};
use dw_proto::frames::Frame;

#[tokio::test]
async fn restart_device_recovers_via_resync() {
    let router = Router::new();
    let directory = Arc::new(MemoryDirectory::new());
    let alice = spawn_device(&router, &directory, "alice", "alice-web").await;
    let mut bob = spawn_device(&router, &directory, "bob", "bob-web").await;
    let mut alice_events = alice.engine.subscribe();
    let mut bob_events = bob.engine.subscribe();

    // Establish the pair with a normal first message.
    alice
        .engine
        .send_message("room-1", &["bob".to_owned()], b"before".to_vec(), "text/plain")
        .await
        .unwrap();
    wait_for(&mut bob_events, |event| match event {
        EngineEvent::MessageDecrypted { .. } => Some(()),
        _ => None,
    })
    .await;
    wait_established(&mut alice_events, &bob.address()).await;

    // Bob's process dies and comes back: identity survives in the key
    // store, ratchet state does not.
    bob.restart().await;
    let mut bob_events = bob.engine.subscribe();

    // Alice still holds her established session, so this envelope carries
    // no bootstrap material and the restarted Bob cannot decrypt it.
    let m2 = alice
        .engine
        .send_message("room-1", &["bob".to_owned()], b"missed you".to_vec(), "text/plain")
        .await
        .unwrap();

    let kind = wait_for(&mut bob_events, |event| match event {
        EngineEvent::MessageFailed {
            message_id, kind, ..
        } if message_id == m2 => Some(kind),
        _ => None,
    })
    .await;
    assert_eq!(kind, ErrorKind::Decrypt);

    // The author is online (her frame just arrived), so a recovery request
    // goes out instead of a silent loss.
    let requested_from = wait_for(&mut bob_events, |event| match event {
        EngineEvent::RecoveryRequested {
            message_id,
            from_user_id,
            ..
        } if message_id == m2 => Some(from_user_id),
        _ => None,
    })
    .await;
    assert_eq!(requested_from, "alice");

    // Alice re-encrypts from her plaintext cache over a fresh bootstrap;
    // the pending request arms Bob to accept the session reset.
    wait_for(&mut bob_events, |event| match event {
        EngineEvent::RecoveryResolved { message_id, .. } if message_id == m2 => Some(()),
        _ => None,
    })
    .await;
    let plaintext = wait_for(&mut bob_events, |event| match event {
        EngineEvent::MessageDecrypted {
            message_id,
            plaintext,
            ..
        } if message_id == m2 => Some(plaintext),
        _ => None,
    })
    .await;
    assert_eq!(plaintext, b"missed you");

    // The replacement session carries the conversation from here.
    let m3 = alice
        .engine
        .send_message("room-1", &["bob".to_owned()], b"and this one?".to_vec(), "text/plain")
        .await
        .unwrap();
    let plaintext = wait_for(&mut bob_events, |event| match event {
        EngineEvent::MessageDecrypted {
            message_id,
            plaintext,
            ..
        } if message_id == m3 => Some(plaintext),
        _ => None,
    })
    .await;
    assert_eq!(plaintext, b"and this one?");

    let reply = bob
        .engine
        .send_message("room-1", &["alice".to_owned()], b"got it now".to_vec(), "text/plain")
        .await
        .unwrap();
    let plaintext = wait_for(&mut alice_events, |event| match event {
        EngineEvent::MessageDecrypted {
            message_id,
            plaintext,
            ..
        } if message_id == reply => Some(plaintext),
        _ => None,
    })
    .await;
    assert_eq!(plaintext, b"got it now");
}

#[tokio::test(start_paused = true)]
async fn unanswered_request_times_out_then_cooldown_suppresses_repeat() {
    let router = Router::new();
    let directory = Arc::new(MemoryDirectory::new());
    let alice = spawn_device(&router, &directory, "alice", "alice-web").await;
    let mut bob = spawn_device(&router, &directory, "bob", "bob-web").await;
    let mut bob_events = bob.engine.subscribe();

    alice
        .engine
        .send_message("room-1", &["bob".to_owned()], b"first".to_vec(), "text/plain")
        .await
        .unwrap();
    wait_for(&mut bob_events, |event| match event {
        EngineEvent::MessageDecrypted { .. } => Some(()),
        _ => None,
    })
    .await;

    // Bob loses his sessions; Alice drops off the network right after
    // sending, so his recovery request will never be answered.
    bob.restart().await;
    let mut bob_events = bob.engine.subscribe();
    let m2 = alice
        .engine
        .send_message("room-1", &["bob".to_owned()], b"second".to_vec(), "text/plain")
        .await
        .unwrap();
    router.disconnect(&alice.address()).await;

    wait_for(&mut bob_events, |event| match event {
        EngineEvent::MessageFailed { message_id, .. } if message_id == m2 => Some(()),
        _ => None,
    })
    .await;
    wait_for(&mut bob_events, |event| match event {
        EngineEvent::RecoveryRequested { message_id, .. } if message_id == m2 => Some(()),
        _ => None,
    })
    .await;

    // Nothing answers; the paused clock fast-forwards through the pending
    // window and the request expires.
    wait_for(&mut bob_events, |event| match event {
        EngineEvent::RecoveryTimedOut { message_id, .. } if message_id == m2 => Some(()),
        _ => None,
    })
    .await;

    // The server redelivers the same ciphertext. It still fails, but the
    // attempt ledger keeps the wall-clock cooldown and no second request
    // goes out.
    let raw = router
        .sent_frames()
        .await
        .iter()
        .find_map(|out| match &out.frame {
            frame @ Frame::Ciphertext { message_id, .. } if *message_id == m2 => {
                Some(frame.encode().unwrap())
            }
            _ => None,
        })
        .expect("m2 ciphertext on the wire");
    bob.engine.handle_frame(alice.address(), &raw).await;

    wait_for(&mut bob_events, |event| match event {
        EngineEvent::MessageFailed { message_id, .. } if message_id == m2 => Some(()),
        _ => None,
    })
    .await;
    // Let the suppressed decision settle before counting wire traffic.
    tokio::time::sleep(Duration::from_secs(1)).await;

    let requests = router
        .sent_frames()
        .await
        .iter()
        .filter(|out| matches!(out.frame, Frame::DecryptRecoveryRequest { .. }))
        .count();
    assert_eq!(requests, 1);
}
