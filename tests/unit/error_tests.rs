//! Unit tests for `AppError` display, kinds, and conversions.

use tensorwatch::{AppError, ErrorKind};

#[test]
fn display_prefixes_match_variant() {
    let cases = [
        (AppError::Config("x".into()), "config: x"),
        (AppError::Protocol("x".into()), "protocol: x"),
        (AppError::NotFound("x".into()), "not found: x"),
        (AppError::InvalidState("x".into()), "invalid state: x"),
        (AppError::InvalidParam("x".into()), "invalid param: x"),
        (AppError::LimitExceeded("x".into()), "limit exceeded: x"),
        (AppError::CommandInProgress("x".into()), "command in progress: x"),
        (AppError::CommandTimeout("x".into()), "command timeout: x"),
        (AppError::CommandRejected("x".into()), "command rejected: x"),
        (AppError::SessionClosed("x".into()), "session closed: x"),
        (AppError::Fatal("x".into()), "fatal: x"),
        (AppError::Ipc("x".into()), "ipc: x"),
        (AppError::Io("x".into()), "io: x"),
    ];
    for (err, expected) in cases {
        assert_eq!(err.to_string(), expected);
    }
}

#[test]
fn error_message_has_no_trailing_period() {
    let err = AppError::CommandTimeout("command 3 (pause) not acknowledged".into());
    assert!(!err.to_string().ends_with('.'));
}

#[test]
fn kind_matches_variant() {
    assert_eq!(AppError::NotFound(String::new()).kind(), ErrorKind::NotFound);
    assert_eq!(
        AppError::CommandInProgress(String::new()).kind(),
        ErrorKind::CommandInProgress
    );
    assert_eq!(AppError::SessionClosed(String::new()).kind(), ErrorKind::SessionClosed);
    assert_eq!(AppError::Fatal(String::new()).kind(), ErrorKind::Fatal);
}

#[test]
fn kind_serializes_snake_case() {
    let json = serde_json::to_string(&ErrorKind::CommandInProgress).expect("serialize");
    assert_eq!(json, "\"command_in_progress\"");
    let back: ErrorKind = serde_json::from_str("\"not_found\"").expect("deserialize");
    assert_eq!(back, ErrorKind::NotFound);
}

#[test]
fn frame_local_errors_are_protocol_not_found_and_invalid_state() {
    assert!(AppError::Protocol(String::new()).is_frame_local());
    assert!(AppError::NotFound(String::new()).is_frame_local());
    assert!(AppError::InvalidState(String::new()).is_frame_local());
    assert!(!AppError::Fatal(String::new()).is_frame_local());
    assert!(!AppError::Io(String::new()).is_frame_local());
}

#[test]
fn serde_json_error_converts_to_protocol() {
    let json_err = serde_json::from_str::<serde_json::Value>("{").expect_err("bad json");
    let err = AppError::from(json_err);
    assert!(matches!(err, AppError::Protocol(ref msg) if msg.starts_with("malformed json")));
}

#[test]
fn io_error_converts_to_io() {
    let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe gone");
    let err = AppError::from(io);
    assert_eq!(err, AppError::Io("pipe gone".into()));
}
