mod common;

use chat_relay_service::services::PersistError;
use chat_relay_service::websocket::{SessionError, SessionState};
use common::{connect, connect_broken, harness, SinkEvent};
use std::time::Duration;

#[tokio::test]
async fn test_room_message_reaches_participants_only() {
    let h = harness(16, &[("alice", "R1"), ("bob", "R1"), ("carol", "R2")]).await;
    let mut alice = connect(&h.relay, "alice", "Alice").await;
    let mut bob = connect(&h.relay, "bob", "Bob").await;
    let mut carol = connect(&h.relay, "carol", "Carol").await;

    alice.send_chat("R1", "hi");

    for client in [&mut alice, &mut bob] {
        let frame = client.next_frame().await;
        assert_eq!(frame["id"], "M1");
        assert_eq!(frame["roomId"], "R1");
        assert_eq!(frame["senderId"], "alice");
        assert_eq!(frame["username"], "Alice");
        assert_eq!(frame["content"], "hi");
        assert!(frame["timestamp"].is_string());
    }

    carol.assert_silent(Duration::from_millis(200)).await;
    alice.assert_silent(Duration::from_millis(50)).await;
    bob.assert_silent(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_sender_identity_comes_from_principal() {
    let h = harness(16, &[("alice", "R1"), ("bob", "R1")]).await;
    let alice = connect(&h.relay, "alice", "Alice").await;
    let mut bob = connect(&h.relay, "bob", "Bob").await;

    alice.send_text(r#"{"roomId":"R1","content":"hey","senderId":"bob","username":"Bob"}"#);

    let frame = bob.next_frame().await;
    assert_eq!(frame["senderId"], "alice");
    assert_eq!(frame["username"], "Alice");
    assert_eq!(h.messages.stored()[0].sender_id, "alice");
}

#[tokio::test]
async fn test_frames_arrive_in_order() {
    let h = harness(64, &[("alice", "R1"), ("bob", "R1")]).await;
    let alice = connect(&h.relay, "alice", "Alice").await;
    let mut bob = connect(&h.relay, "bob", "Bob").await;

    for i in 0..10 {
        alice.send_chat("R1", &format!("msg-{i}"));
    }

    for i in 0..10 {
        let frame = bob.next_frame().await;
        assert_eq!(frame["content"], format!("msg-{i}"));
        assert_eq!(frame["id"], format!("M{}", i + 1));
    }
}

#[tokio::test]
async fn test_sender_need_not_be_room_member() {
    let h = harness(16, &[("alice", "R1"), ("carol", "R2")]).await;
    let mut alice = connect(&h.relay, "alice", "Alice").await;
    let mut carol = connect(&h.relay, "carol", "Carol").await;

    alice.send_chat("R2", "knock knock");

    let frame = carol.next_frame().await;
    assert_eq!(frame["content"], "knock knock");
    alice.assert_silent(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_malformed_frame_terminates_session() {
    let h = harness(16, &[("alice", "R1"), ("bob", "R1")]).await;
    let mut alice = connect(&h.relay, "alice", "Alice").await;
    let _bob = connect(&h.relay, "bob", "Bob").await;

    alice.send_text("not json");

    assert_eq!(alice.next_event().await, SinkEvent::Closed);
    let result = alice.finished().await;
    assert!(matches!(result, Err(SessionError::Decode(_))));

    let registry = h.relay.registry();
    assert!(registry.get("alice").is_none());
    assert!(registry.get("bob").is_some());

    let participants = h.relay.membership().participants_of("R1");
    assert!(!participants.contains("alice"));
    assert!(participants.contains("bob"));
}

#[tokio::test]
async fn test_client_close_cleans_up() {
    let h = harness(16, &[("alice", "R1")]).await;
    let alice = connect(&h.relay, "alice", "Alice").await;
    assert_eq!(h.relay.registry().len(), 1);

    alice.send_close();
    let session_result = alice.finished().await;

    assert!(session_result.is_ok());
    assert!(h.relay.registry().is_empty());
    assert_eq!(h.relay.membership().room_count(), 0);
}

#[tokio::test]
async fn test_persist_failure_terminates_session_without_publishing() {
    let h = harness(16, &[("alice", "R1"), ("bob", "R1")]).await;
    let mut alice = connect(&h.relay, "alice", "Alice").await;
    let mut bob = connect(&h.relay, "bob", "Bob").await;

    h.messages.fail_writes(true);
    alice.send_chat("R1", "lost");

    assert_eq!(alice.next_event().await, SinkEvent::Closed);
    assert!(matches!(
        alice.finished().await,
        Err(SessionError::Persistence(_))
    ));
    bob.assert_silent(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_slow_persist_times_out_and_closes_session() {
    let h = harness(16, &[("alice", "R1"), ("bob", "R1")]).await;
    let mut alice = connect(&h.relay, "alice", "Alice").await;
    let mut bob = connect(&h.relay, "bob", "Bob").await;

    // longer than the harness persist timeout of 1s
    h.messages.delay_writes(Duration::from_millis(1_500));
    alice.send_chat("R1", "too slow");

    assert_eq!(alice.next_event().await, SinkEvent::Closed);
    assert!(matches!(
        alice.finished().await,
        Err(SessionError::Persistence(PersistError::Timeout))
    ));
    assert!(h.relay.registry().get("alice").is_none());
    assert!(!h.relay.membership().participants_of("R1").contains("alice"));
    bob.assert_silent(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_write_error_closes_session_and_leaves_rooms() {
    let h = harness(16, &[("alice", "R1"), ("bob", "R1")]).await;
    let alice = connect_broken(&h.relay, "alice", "Alice").await;
    let mut bob = connect(&h.relay, "bob", "Bob").await;

    bob.send_chat("R1", "can you hear me");
    assert_eq!(bob.next_frame().await["content"], "can you hear me");

    assert!(matches!(
        alice.finished().await,
        Err(SessionError::Transport(_))
    ));
    assert!(h.relay.registry().get("alice").is_none());
    let participants = h.relay.membership().participants_of("R1");
    assert!(!participants.contains("alice"));
    assert!(participants.contains("bob"));
}

#[tokio::test]
async fn test_new_connection_replaces_old_session() {
    let h = harness(16, &[("alice", "R1"), ("bob", "R1")]).await;
    let mut first = connect(&h.relay, "alice", "Alice").await;
    let mut second = connect(&h.relay, "alice", "Alice").await;
    let bob = connect(&h.relay, "bob", "Bob").await;

    assert_eq!(first.next_event().await, SinkEvent::Closed);
    let first_id = first.session_id;
    assert!(first.finished().await.is_ok());

    let current = h.relay.registry().get("alice").unwrap();
    assert_eq!(current.session_id(), second.session_id);
    assert_ne!(current.session_id(), first_id);
    assert_eq!(current.state(), SessionState::Active);

    // the old session's cleanup must not have evicted the new one from R1
    assert!(h.relay.membership().participants_of("R1").contains("alice"));

    bob.send_chat("R1", "still there?");
    let frame = second.next_frame().await;
    assert_eq!(frame["content"], "still there?");
}

#[tokio::test]
async fn test_join_room_takes_effect_for_live_session() {
    let h = harness(16, &[("alice", "R1")]).await;
    let alice = connect(&h.relay, "alice", "Alice").await;
    let mut dave = connect(&h.relay, "dave", "Dave").await;

    h.relay.join_room("R1", "dave").await.unwrap();
    alice.send_chat("R1", "welcome");

    let frame = dave.next_frame().await;
    assert_eq!(frame["content"], "welcome");
}

#[tokio::test]
async fn test_fanout_counters_track_deliveries() {
    let h = harness(16, &[("alice", "R1"), ("bob", "R1")]).await;
    let mut alice = connect(&h.relay, "alice", "Alice").await;
    let mut bob = connect(&h.relay, "bob", "Bob").await;

    alice.send_chat("R1", "one");
    alice.next_frame().await;
    bob.next_frame().await;

    assert_eq!(h.relay.stats().delivered(), 2);
    assert_eq!(h.relay.stats().dropped(), 0);
}
