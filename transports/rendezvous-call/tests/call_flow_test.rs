//! Call flow integration tests
//!
//! Two or more parties negotiating through an in-process relay, plus one
//! end-to-end pass over a real WebSocket relay.
//!
//! # Running Tests
//!
//! ```bash
//! cargo test --test call_flow_test -- --nocapture
//! ```

mod harness;

use harness::{init_logging, start_websocket_relay, wait_for_state, CallHarness};
use rendezvous_call::{
    CallState, ClientConfig, DrainPlayback, Error, LinkState, MessageKind, Severity,
    SignalingClient, SilentMicrophone,
};
use std::time::Duration;

const STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// ICE and DTLS between two local peers take longer than a signaling step
const MEDIA_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Outbound and inbound calls
// ============================================================================

#[tokio::test]
async fn test_both_parties_reach_connected() {
    init_logging();

    let harness = CallHarness::new();
    let alice_mic = SilentMicrophone::new();
    let bob_mic = SilentMicrophone::new();
    let alice = harness.ready_client("alice", &alice_mic).await.unwrap();
    let bob = harness.ready_client("bob", &bob_mic).await.unwrap();

    alice.place_call("bob").await.unwrap();

    wait_for_state(&bob, |s| *s == CallState::Connected, STEP_TIMEOUT)
        .await
        .unwrap();
    wait_for_state(&alice, |s| *s == CallState::Connected, STEP_TIMEOUT)
        .await
        .unwrap();

    assert_eq!(alice_mic.audit().active(), 1);
    assert_eq!(bob_mic.audit().active(), 1);

    alice.shutdown().await;
    bob.shutdown().await;
    assert_eq!(alice_mic.audit().active(), 0);
    assert_eq!(bob_mic.audit().active(), 0);
}

#[tokio::test]
async fn test_offer_in_ready_yields_single_answer_to_sender() {
    init_logging();

    let harness = CallHarness::new();
    let bob_mic = SilentMicrophone::new();
    let bob = harness.ready_client("bob", &bob_mic).await.unwrap();
    let mut alice = harness.scripted_party("alice").await.unwrap();

    alice.offer("bob").await.unwrap();
    wait_for_state(&bob, |s| *s == CallState::Connected, STEP_TIMEOUT)
        .await
        .unwrap();

    let messages = alice.collect_messages(Duration::from_millis(500)).await;
    let answers: Vec<_> = messages
        .iter()
        .filter(|m| m.kind() == MessageKind::Answer)
        .collect();
    assert_eq!(answers.len(), 1, "expected exactly one answer: {:?}", messages);
    assert_eq!(answers[0].from(), "bob");
    assert_eq!(answers[0].to(), "alice");

    // Everything bob sent was addressed to the caller.
    assert!(messages.iter().all(|m| m.to() == "alice" && m.from() == "bob"));

    // Bob captured exactly once for the whole exchange.
    assert_eq!(bob_mic.audit().acquired(), 1);

    bob.shutdown().await;
}

#[tokio::test]
async fn test_second_caller_is_refused_while_connected() {
    init_logging();

    let harness = CallHarness::new();
    let bob_mic = SilentMicrophone::new();
    let bob = harness.ready_client("bob", &bob_mic).await.unwrap();
    let mut alice = harness.scripted_party("alice").await.unwrap();
    let mut carol = harness.scripted_party("carol").await.unwrap();

    alice.offer("bob").await.unwrap();
    wait_for_state(&bob, |s| *s == CallState::Connected, STEP_TIMEOUT)
        .await
        .unwrap();

    carol.offer("bob").await.unwrap();
    let replies = carol.collect_messages(Duration::from_millis(500)).await;
    assert!(
        replies.iter().all(|m| m.kind() != MessageKind::Answer),
        "busy party answered a second caller: {:?}",
        replies
    );
    assert_eq!(bob.state(), CallState::Connected);

    bob.shutdown().await;
}

#[tokio::test]
async fn test_busy_party_takes_new_caller_after_end_call() {
    init_logging();

    let harness = CallHarness::new();
    let bob_mic = SilentMicrophone::new();
    let bob = harness.ready_client("bob", &bob_mic).await.unwrap();
    let mut alice = harness.scripted_party("alice").await.unwrap();
    let mut carol = harness.scripted_party("carol").await.unwrap();

    alice.offer("bob").await.unwrap();
    wait_for_state(&bob, |s| *s == CallState::Connected, STEP_TIMEOUT)
        .await
        .unwrap();

    // Still busy with alice even though she never follows up.
    carol.offer("bob").await.unwrap();
    let replies = carol.collect_messages(Duration::from_millis(300)).await;
    assert!(replies.iter().all(|m| m.kind() != MessageKind::Answer));

    bob.end_call().await.unwrap();
    bob.initialize("bob").await.unwrap();

    let mut dave = harness.scripted_party("dave").await.unwrap();
    dave.offer("bob").await.unwrap();
    wait_for_state(&bob, |s| *s == CallState::Connected, STEP_TIMEOUT)
        .await
        .unwrap();
    let replies = dave.collect_messages(Duration::from_millis(500)).await;
    assert_eq!(
        replies
            .iter()
            .filter(|m| m.kind() == MessageKind::Answer)
            .count(),
        1
    );

    bob.shutdown().await;
}

// ============================================================================
// Remote audio
// ============================================================================

#[tokio::test]
async fn test_remote_audio_reaches_playback() {
    init_logging();

    let harness = CallHarness::new();
    let alice_mic = SilentMicrophone::new();
    let bob_mic = SilentMicrophone::new();
    let bob_speaker = DrainPlayback::new();
    let alice = harness.ready_client("alice", &alice_mic).await.unwrap();
    let bob = harness
        .ready_client_with_playback("bob", &bob_mic, &bob_speaker)
        .await
        .unwrap();

    alice.place_call("bob").await.unwrap();
    wait_for_state(&bob, |s| *s == CallState::Connected, STEP_TIMEOUT)
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + MEDIA_TIMEOUT;
    while bob_speaker.tracks_started() < 1 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "no remote track reached playback"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(bob.state(), CallState::Connected);

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn test_denied_playback_is_recoverable() {
    init_logging();

    let harness = CallHarness::new();
    let alice_mic = SilentMicrophone::new();
    let bob_mic = SilentMicrophone::new();
    let bob_speaker = DrainPlayback::new();
    bob_speaker.deny_permission(true);
    let alice = harness.ready_client("alice", &alice_mic).await.unwrap();
    let bob = harness
        .ready_client_with_playback("bob", &bob_mic, &bob_speaker)
        .await
        .unwrap();
    let mut notices = bob.notices();

    alice.place_call("bob").await.unwrap();
    wait_for_state(&bob, |s| *s == CallState::Connected, STEP_TIMEOUT)
        .await
        .unwrap();

    let notice = tokio::time::timeout(MEDIA_TIMEOUT, async {
        loop {
            let notice = notices.recv().await.unwrap();
            if notice.severity != Severity::Warning {
                return notice;
            }
        }
    })
    .await
    .expect("no playback notice");

    assert_eq!(notice.severity, Severity::Recoverable);
    assert_eq!(bob.state(), CallState::Connected);
    assert_eq!(bob_speaker.tracks_started(), 0);

    alice.shutdown().await;
    bob.shutdown().await;
}

// ============================================================================
// Rejected and ignored input
// ============================================================================

#[tokio::test]
async fn test_invalid_targets_are_rejected_without_state_change() {
    init_logging();

    let harness = CallHarness::new();
    let mic = SilentMicrophone::new();
    let alice = harness.ready_client("alice", &mic).await.unwrap();
    let acquired = mic.audit().acquired();

    for target in ["alice", ""] {
        let err = alice.place_call(target).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTarget(_)), "got {:?}", err);
        assert_eq!(alice.state(), CallState::Ready);
    }
    assert_eq!(mic.audit().acquired(), acquired);
    assert!(harness.hub().is_connected("alice"));

    alice.shutdown().await;
}

#[tokio::test]
async fn test_stray_candidate_is_ignored_quietly() {
    init_logging();

    let harness = CallHarness::new();
    let mic = SilentMicrophone::new();
    let bob = harness.ready_client("bob", &mic).await.unwrap();
    let mut notices = bob.notices();

    let stray = serde_json::json!({
        "type": "ice-candidate",
        "to": "bob",
        "data": {
            "candidate": "candidate:1 1 udp 2130706431 192.0.2.1 50000 typ host",
            "sdpMid": "0",
            "sdpMLineIndex": 0
        }
    });
    harness.hub().route("mallory", &stray.to_string());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(bob.state(), CallState::Ready);
    assert!(notices.try_recv().is_err());

    bob.shutdown().await;
}

#[tokio::test]
async fn test_frames_for_someone_else_are_ignored() {
    init_logging();

    let harness = CallHarness::new();
    let mic = SilentMicrophone::new();
    let bob = harness.ready_client("bob", &mic).await.unwrap();

    harness.hub().route("alice", "not json at all");
    harness.hub().route(
        "alice",
        &serde_json::json!({ "type": "hangup", "to": "bob", "data": {} }).to_string(),
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(bob.state(), CallState::Ready);
    assert_eq!(bob.link_state(), LinkState::Open);

    bob.shutdown().await;
}

// ============================================================================
// Teardown
// ============================================================================

#[tokio::test]
async fn test_end_call_releases_everything() {
    init_logging();

    let harness = CallHarness::new();
    let mic = SilentMicrophone::new();
    let alice = harness.ready_client("alice", &mic).await.unwrap();

    // Nobody answers; the call stays outstanding.
    alice.place_call("bob").await.unwrap();
    assert_eq!(alice.state(), CallState::Calling);

    let report = alice.end_call().await.unwrap();
    assert_eq!(report.tracks_released, 1);
    assert!(report.peer_closed);
    assert!(report.link_closed);

    assert_eq!(alice.state(), CallState::Idle);
    assert_eq!(alice.link_state(), LinkState::Closed);
    assert_eq!(mic.audit().active(), 0);
    assert!(!harness.hub().is_connected("alice"));

    // Ending again has nothing left to release.
    let again = alice.end_call().await.unwrap();
    assert!(again.is_empty());
}

#[tokio::test]
async fn test_end_call_then_initialize_again() {
    init_logging();

    let harness = CallHarness::new();
    let mic = SilentMicrophone::new();
    let alice = harness.ready_client("alice", &mic).await.unwrap();

    alice.end_call().await.unwrap();
    alice.initialize("alice").await.unwrap();
    assert_eq!(alice.state(), CallState::Ready);
    assert_eq!(mic.audit().acquired(), 2);
    assert_eq!(mic.audit().active(), 1);

    alice.shutdown().await;
}

#[tokio::test]
async fn test_dropping_client_releases_resources() {
    init_logging();

    let harness = CallHarness::new();
    let mic = SilentMicrophone::new();
    let alice = harness.ready_client("alice", &mic).await.unwrap();
    drop(alice);

    let deadline = tokio::time::Instant::now() + STEP_TIMEOUT;
    while mic.audit().active() > 0 || harness.hub().is_connected("alice") {
        assert!(tokio::time::Instant::now() < deadline, "resources still held");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ============================================================================
// WebSocket relay
// ============================================================================

#[tokio::test]
async fn test_call_over_websocket_relay() {
    init_logging();

    let (hub, relay) = start_websocket_relay().await.unwrap();
    let config = ClientConfig::with_signaling_url(relay.url());

    let alice = SignalingClient::builder(config.clone()).build().unwrap();
    let bob = SignalingClient::builder(config).build().unwrap();

    alice.initialize("alice").await.unwrap();
    bob.initialize("bob").await.unwrap();

    // Registration on the relay happens on its side of the handshake.
    let deadline = tokio::time::Instant::now() + STEP_TIMEOUT;
    while !(hub.is_connected("alice") && hub.is_connected("bob")) {
        assert!(tokio::time::Instant::now() < deadline, "clients never registered");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    alice.place_call("bob").await.unwrap();
    wait_for_state(&bob, |s| *s == CallState::Connected, STEP_TIMEOUT)
        .await
        .unwrap();
    wait_for_state(&alice, |s| *s == CallState::Connected, STEP_TIMEOUT)
        .await
        .unwrap();

    alice.shutdown().await;
    bob.shutdown().await;
    relay.shutdown().await;
}
