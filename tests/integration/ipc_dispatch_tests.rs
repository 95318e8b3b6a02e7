//! IPC command routing, exercised through `dispatch_command` without a socket.

use std::sync::Arc;

use tensorwatch::errors::ErrorKind;
use tensorwatch::ipc::server::{dispatch_command, IpcContext, IpcRequest};
use tensorwatch::models::watchpoint::Condition;
use tensorwatch::orchestrator::session_manager::SessionManager;

use super::test_helpers::{connect, connect_running, manager, test_config};

const TOKEN: &str = "s3cret";

fn context(manager: &Arc<SessionManager>, auth_token: Option<&str>) -> IpcContext {
    IpcContext {
        manager: Arc::clone(manager),
        auth_token: auth_token.map(str::to_owned),
    }
}

fn request(command: &str) -> IpcRequest {
    IpcRequest {
        command: command.into(),
        auth_token: Some(TOKEN.into()),
        ..IpcRequest::default()
    }
}

fn for_session(command: &str, session: &str) -> IpcRequest {
    IpcRequest {
        session: Some(session.into()),
        ..request(command)
    }
}

#[tokio::test]
async fn wrong_or_missing_token_is_unauthorized() {
    let mgr = manager(test_config());
    let ctx = context(&mgr, Some(TOKEN));

    for auth_token in [None, Some("guess".to_owned())] {
        let req = IpcRequest {
            auth_token,
            ..request("list")
        };
        let resp = dispatch_command(&req, &ctx).await;
        assert!(!resp.ok);
        let err = resp.error.expect("error");
        assert_eq!(err.kind, ErrorKind::Ipc);
        assert_eq!(err.message, "unauthorized");
    }
}

#[tokio::test]
async fn list_returns_every_session() {
    let mgr = manager(test_config());
    let (handle, _remote) = connect(&mgr);
    let ctx = context(&mgr, Some(TOKEN));

    let resp = dispatch_command(&request("list"), &ctx).await;
    assert!(resp.ok, "{resp:?}");
    let data = resp.data.expect("data");
    let sessions = data.as_array().expect("array");
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["session_id"], handle.id());
    assert_eq!(sessions[0]["state"], "waiting_connect");
}

#[tokio::test]
async fn missing_token_config_accepts_any_request() {
    let mgr = manager(test_config());
    let ctx = context(&mgr, None);
    let req = IpcRequest {
        command: "list".into(),
        ..IpcRequest::default()
    };
    assert!(dispatch_command(&req, &ctx).await.ok);
}

#[tokio::test]
async fn parameter_errors_are_typed() {
    let mgr = manager(test_config());
    let (handle, _remote) = connect_running(&mgr).await;
    let ctx = context(&mgr, Some(TOKEN));

    let cases = [
        (request("status"), ErrorKind::InvalidParam),
        (for_session("status", "no-such-session"), ErrorKind::NotFound),
        (for_session("tensor", handle.id()), ErrorKind::InvalidParam),
        (for_session("graph", handle.id()), ErrorKind::InvalidParam),
        (for_session("rewind", handle.id()), ErrorKind::InvalidParam),
        (for_session("unwatch", handle.id()), ErrorKind::InvalidParam),
        (for_session("continue", handle.id()), ErrorKind::InvalidState),
        (for_session("compare", handle.id()), ErrorKind::InvalidParam),
        (for_session("recheck", handle.id()), ErrorKind::InvalidState),
    ];
    for (req, kind) in cases {
        let resp = dispatch_command(&req, &ctx).await;
        assert!(!resp.ok, "{} should fail", req.command);
        assert_eq!(resp.error.expect("error").kind, kind, "{}", req.command);
    }
}

#[tokio::test]
async fn pause_before_handshake_is_invalid_state() {
    let mgr = manager(test_config());
    let (handle, _remote) = connect(&mgr);
    let ctx = context(&mgr, Some(TOKEN));

    let resp = dispatch_command(&for_session("pause", handle.id()), &ctx).await;
    assert_eq!(resp.error.expect("error").kind, ErrorKind::InvalidState);
}

#[tokio::test]
async fn watch_round_trip_returns_watchpoint_id() {
    let mgr = manager(test_config());
    let (handle, mut remote) = connect_running(&mgr).await;
    let ctx = context(&mgr, Some(TOKEN));

    let req = IpcRequest {
        patterns: Some(vec!["conv1/**".into()]),
        condition: Some(Condition::HasInf),
        ..for_session("watch", handle.id())
    };
    let watch = tokio::spawn(async move { dispatch_command(&req, &ctx).await });
    let command_id = remote.recv_command_id().await;
    remote.ack(command_id).await;

    let resp = watch.await.expect("join");
    assert!(resp.ok, "{resp:?}");
    let data = resp.data.expect("data");
    assert_eq!(data["command_id"], command_id);
    assert_eq!(data["watchpoint_id"], 1);
}

#[tokio::test]
async fn status_and_close_through_ipc() {
    let mgr = manager(test_config());
    let (handle, _remote) = connect_running(&mgr).await;
    let ctx = context(&mgr, Some(TOKEN));

    let status = dispatch_command(&for_session("status", handle.id()), &ctx).await;
    assert!(status.ok);
    assert_eq!(status.data.expect("data")["state"], "running");

    let closed = dispatch_command(&for_session("close", handle.id()), &ctx).await;
    assert!(closed.ok, "{closed:?}");
    let again = dispatch_command(&for_session("status", handle.id()), &ctx).await;
    assert_eq!(again.error.expect("error").kind, ErrorKind::NotFound);
}
