//! Stream client lifecycle against a scripted transport.
//!
//! Time is paused, so backoff delays are measured exactly.

mod common;

use std::time::Duration;

use common::{
    completed, connected, marker, output, resource_status, scripted_client, text, Script,
    ScriptedConnector,
};
use runlens_client::{Frame, StreamVariant};
use runlens_types::{ConnectionStatus, StreamMessage};
use serde_json::json;

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test(start_paused = true)]
async fn test_backoff_schedule_and_terminal_error() {
    let connector = ScriptedConnector::default();
    let client = scripted_client(&connector, StreamVariant::Output);
    let mut state = client.subscribe_state();

    assert!(client.start());
    let final_state = state
        .wait_for(|s| s.error.is_some())
        .await
        .unwrap()
        .clone();

    // One initial attempt plus five retries.
    assert_eq!(connector.connect_count(), 6);
    assert_eq!(connector.gaps_secs(), vec![1, 2, 4, 8, 10]);
    let error = final_state.error.unwrap();
    assert!(
        error.starts_with("Connection lost after 5 reconnect attempts:"),
        "unexpected error: {error}"
    );

    settle().await;
    assert!(!client.is_running());
    assert_eq!(client.state().connection.status, ConnectionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_acknowledged_connection_resets_attempts() {
    let connector = ScriptedConnector::new([
        Script::Refuse("down".into()),
        Script::Refuse("down".into()),
        Script::Frames(vec![connected(), output("hello", 1)]),
    ]);
    let client = scripted_client(&connector, StreamVariant::Output);
    let mut state = client.subscribe_state();

    client.start();
    state.wait_for(|s| s.error.is_some()).await.unwrap();

    let gaps = connector.gaps_secs();
    assert_eq!(&gaps[..4], &[1, 2, 1, 2]);
    // Three connects before the ack, six after it.
    assert_eq!(connector.connect_count(), 9);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_attempt_is_published() {
    let connector = ScriptedConnector::new([Script::Refuse("down".into())]);
    let client = scripted_client(&connector, StreamVariant::Output);
    let mut state = client.subscribe_state();

    client.start();
    let seen = state
        .wait_for(|s| s.connection.reconnect_attempt == 1)
        .await
        .unwrap()
        .clone();
    assert_eq!(seen.connection.last_error.as_deref(), Some("Connection closed: down"));
    client.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_start_while_running_is_suppressed() {
    let connector = ScriptedConnector::new([Script::FramesThenHold(vec![connected()])]);
    let client = scripted_client(&connector, StreamVariant::Output);

    assert!(client.start());
    assert!(!client.start());
    settle().await;
    assert!(!client.clone().start());

    assert_eq!(connector.connect_count(), 1);
    assert!(client.state().connected());
    assert_eq!(connector.tokens(), vec![Some("secret".to_string())]);
    client.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_dispose_cancels_pending_reconnect() {
    let connector = ScriptedConnector::new([Script::Refuse("down".into())]);
    let client = scripted_client(&connector, StreamVariant::Output);
    let mut state = client.subscribe_state();

    client.start();
    state
        .wait_for(|s| s.connection.reconnect_attempt == 1)
        .await
        .unwrap();

    let handle = client.clone();
    client.dispose().await;
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(connector.connect_count(), 1);
    assert!(!handle.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_inactive_task_is_not_reconnected() {
    let connector = ScriptedConnector::new([Script::Frames(vec![connected()])]);
    let client = scripted_client(&connector, StreamVariant::Output);

    client.start();
    settle().await;
    // Session ended abnormally; a reconnect is pending.
    assert_eq!(client.state().connection.reconnect_attempt, 1);

    client.set_task_active(false);
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(connector.connect_count(), 1);
    assert!(!client.is_running());
    assert!(client.state().error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_events_held_until_acknowledged() {
    let connector = ScriptedConnector::new([Script::FramesThenHold(vec![
        output("early", 1),
        marker("planning", "begin", 2),
    ])]);
    let client = scripted_client(&connector, StreamVariant::Output);

    client.start();
    settle().await;

    assert!(client.events().await.is_empty());
    assert_eq!(client.state().connection.status, ConnectionStatus::Connecting);
    client.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_held_events_flushed_in_order_after_ack() {
    let connector = ScriptedConnector::new([Script::Frames(vec![
        output("early", 1),
        connected(),
        output("late", 2),
        completed(),
    ])]);
    let client = scripted_client(&connector, StreamVariant::Output);
    let mut state = client.subscribe_state();

    client.start();
    state.wait_for(|s| s.completed).await.unwrap();
    settle().await;

    let kinds: Vec<_> = client
        .events()
        .await
        .into_iter()
        .map(|e| match e.message {
            StreamMessage::Output(line) => line.line,
            other => other.kind().to_string(),
        })
        .collect();
    assert_eq!(kinds, vec!["early", "late", "completed"]);
    assert!(!client.is_running());
    assert_eq!(connector.connect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_completion_before_ack_reconnects() {
    let connector = ScriptedConnector::new([
        Script::Frames(vec![output("early", 1), completed()]),
        Script::Frames(vec![
            connected(),
            output("early", 1),
            output("late", 2),
            completed(),
        ]),
    ]);
    let client = scripted_client(&connector, StreamVariant::Output);
    let mut state = client.subscribe_state();

    client.start();
    let done = state.wait_for(|s| s.completed).await.unwrap().clone();
    assert!(done.error.is_none());
    assert_eq!(connector.connect_count(), 2);
    assert_eq!(connector.gaps_secs(), vec![1]);

    let lines: Vec<_> = client
        .events()
        .await
        .into_iter()
        .map(|e| match e.message {
            StreamMessage::Output(line) => line.line,
            other => other.kind().to_string(),
        })
        .collect();
    assert_eq!(lines, vec!["early", "late", "completed"]);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_and_unknown_frames_dropped() {
    let connector = ScriptedConnector::new([Script::Frames(vec![
        connected(),
        Frame::Text("{not json".to_string()),
        text(json!({"type": "heartbeat", "seq": 9})),
        output("kept", 1),
        completed(),
    ])]);
    let client = scripted_client(&connector, StreamVariant::Output);
    let mut state = client.subscribe_state();

    client.start();
    state.wait_for(|s| s.completed).await.unwrap();

    let events = client.events().await;
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].message.kind(), "output");
    assert_eq!(events[1].message.kind(), "completed");
}

#[tokio::test(start_paused = true)]
async fn test_output_variant_ignores_resource_updates() {
    let frames = vec![
        connected(),
        resource_status("aws_s3_bucket.logs", "applying"),
        output("applying", 1),
        completed(),
    ];

    let connector = ScriptedConnector::new([Script::Frames(frames.clone())]);
    let client = scripted_client(&connector, StreamVariant::Output);
    let mut state = client.subscribe_state();
    client.start();
    state.wait_for(|s| s.completed).await.unwrap();
    let kinds: Vec<_> = client.events().await.iter().map(|e| e.message.kind()).collect();
    assert_eq!(kinds, vec!["output", "completed"]);

    let connector = ScriptedConnector::new([Script::Frames(frames)]);
    let client = scripted_client(&connector, StreamVariant::Apply);
    let mut state = client.subscribe_state();
    client.start();
    state.wait_for(|s| s.completed).await.unwrap();
    let kinds: Vec<_> = client.events().await.iter().map(|e| e.message.kind()).collect();
    assert_eq!(kinds, vec!["resource_status_update", "output", "completed"]);
}

#[tokio::test(start_paused = true)]
async fn test_replayed_history_is_deduplicated() {
    let connector = ScriptedConnector::new([
        Script::Frames(vec![connected(), output("one", 1), output("two", 2)]),
        Script::Frames(vec![
            connected(),
            output("one", 1),
            output("two", 2),
            output("three", 3),
            completed(),
        ]),
    ]);
    let client = scripted_client(&connector, StreamVariant::Output);
    let mut state = client.subscribe_state();

    client.start();
    state.wait_for(|s| s.completed).await.unwrap();

    let events = client.events().await;
    let lines: Vec<_> = events
        .iter()
        .filter_map(|e| match &e.message {
            StreamMessage::Output(line) => Some((line.line.as_str(), e.connection)),
            _ => None,
        })
        .collect();
    assert_eq!(lines, vec![("one", 1), ("two", 1), ("three", 2)]);
    assert_eq!(connector.gaps_secs(), vec![1]);
}

#[tokio::test(start_paused = true)]
async fn test_cursor_reads_incrementally() {
    let connector = ScriptedConnector::new([Script::Frames(vec![
        connected(),
        output("a", 1),
        output("b", 2),
        completed(),
    ])]);
    let client = scripted_client(&connector, StreamVariant::Output);
    let mut cursor = client.cursor();

    client.start();
    let mut seen = Vec::new();
    while seen.len() < 3 {
        seen.extend(cursor.next_batch().await.into_iter().map(|e| e.seq));
    }
    assert_eq!(seen, vec![0, 1, 2]);
    assert!(cursor.try_next_batch().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_restart_after_terminal_error_clears_it() {
    let connector = ScriptedConnector::new([
        Script::Refuse("down".into()),
        Script::Refuse("down".into()),
        Script::Refuse("down".into()),
        Script::Refuse("down".into()),
        Script::Refuse("down".into()),
        Script::Refuse("down".into()),
        Script::FramesThenHold(vec![connected()]),
    ]);
    let client = scripted_client(&connector, StreamVariant::Output);
    let mut state = client.subscribe_state();

    client.start();
    state.wait_for(|s| s.error.is_some()).await.unwrap();
    settle().await;

    assert!(client.start());
    let now = state.wait_for(|s| s.connected()).await.unwrap().clone();
    assert!(now.error.is_none());
    assert_eq!(now.connection.reconnect_attempt, 0);
    client.stop().await;
}
