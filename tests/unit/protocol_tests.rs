//! Unit tests for the stdio wire protocol.
//!
//! Covers:
//! - every child event type decodes to its `InboundEvent`
//! - optional payload fields fall back to defaults
//! - blank lines and unknown types are skipped, not errors
//! - malformed JSON and ill-typed payloads return `AppError::Decode`

use stdio_bridge::bridge::protocol::{decode_line, ChatMessage, InboundEvent};
use stdio_bridge::AppError;

#[test]
fn message_event_decodes_all_fields() {
    let line = r#"{"type":"message","data":{"channel_id":"C1","sender_id":"U1","sender_name":"Bob","content":"hi","message_id":"M1","is_dm":true}}"#;

    let event = decode_line(line).expect("decode").expect("event");

    assert_eq!(
        event,
        InboundEvent::Message(ChatMessage {
            channel_id: "C1".into(),
            sender_id: "U1".into(),
            sender_name: "Bob".into(),
            content: "hi".into(),
            message_id: "M1".into(),
            is_dm: true,
            is_group_dm: false,
            timestamp: None,
        })
    );
}

#[test]
fn message_event_carries_group_dm_and_timestamp() {
    let line = r#"{"type":"message","data":{"channel_id":"C9","sender_id":"U2","content":"yo","is_group_dm":true,"timestamp":"2024-05-01T10:00:00.000Z"}}"#;

    let Some(InboundEvent::Message(msg)) = decode_line(line).expect("decode") else {
        panic!("expected a message event");
    };

    assert!(msg.is_group_dm);
    assert!(!msg.is_dm);
    assert_eq!(msg.timestamp.as_deref(), Some("2024-05-01T10:00:00.000Z"));
    assert_eq!(msg.sender_name, "", "missing sender_name defaults to empty");
}

#[test]
fn ready_event_decodes_identity() {
    let line = r#"{"type":"ready","data":{"user_id":"B1","username":"bridge-bot"}}"#;

    assert_eq!(
        decode_line(line).expect("decode"),
        Some(InboundEvent::Ready {
            user_id: "B1".into(),
            username: "bridge-bot".into(),
        })
    );
}

#[test]
fn error_event_decodes_message() {
    let line = r#"{"type":"error","data":{"message":"login failed"}}"#;

    assert_eq!(
        decode_line(line).expect("decode"),
        Some(InboundEvent::Error {
            message: "login failed".into(),
        })
    );
}

#[test]
fn payloadless_events_decode() {
    assert_eq!(
        decode_line(r#"{"type":"starting"}"#).expect("starting"),
        Some(InboundEvent::Starting)
    );
    assert_eq!(
        decode_line(r#"{"type":"pong"}"#).expect("pong"),
        Some(InboundEvent::Pong)
    );
    assert_eq!(
        decode_line(r#"{"type":"disconnected","data":null}"#).expect("disconnected"),
        Some(InboundEvent::Disconnected)
    );
}

#[test]
fn sent_event_decodes_acknowledgement() {
    let line = r#"{"type":"sent","data":{"channel_id":"C1","success":false}}"#;

    assert_eq!(
        decode_line(line).expect("decode"),
        Some(InboundEvent::Sent {
            channel_id: "C1".into(),
            success: false,
        })
    );
}

#[test]
fn blank_line_is_skipped() {
    assert_eq!(decode_line("").expect("empty"), None);
    assert_eq!(decode_line("   \t").expect("whitespace"), None);
}

#[test]
fn unknown_type_is_skipped() {
    let line = r#"{"type":"typing","data":{"channel_id":"C1"}}"#;
    assert_eq!(decode_line(line).expect("decode"), None);
}

#[test]
fn malformed_json_returns_decode_error() {
    match decode_line("{not json") {
        Err(AppError::Decode(msg)) => assert!(msg.contains("malformed json"), "got: {msg}"),
        other => panic!("expected Err(AppError::Decode), got: {other:?}"),
    }
}

#[test]
fn missing_type_returns_decode_error() {
    let result = decode_line(r#"{"data":{"content":"hi"}}"#);
    assert!(matches!(result, Err(AppError::Decode(_))), "got: {result:?}");
}

#[test]
fn ill_typed_payload_returns_decode_error() {
    let line = r#"{"type":"message","data":{"channel_id":42}}"#;

    match decode_line(line) {
        Err(AppError::Decode(msg)) => {
            assert!(msg.contains("invalid `message` payload"), "got: {msg}");
        }
        other => panic!("expected Err(AppError::Decode), got: {other:?}"),
    }
}
