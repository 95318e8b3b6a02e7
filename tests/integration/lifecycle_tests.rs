//! Session lifecycle: expiry, disconnect, reconnect, limits, and collection.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use tensorwatch::api::{self, TensorQuery, TensorView};
use tensorwatch::models::session::SessionState;
use tensorwatch::models::watchpoint::Condition;
use tensorwatch::stream::frames::OutboundFrame;
use tensorwatch::AppError;

use super::test_helpers::{connect, connect_running, manager, test_config, wait_until, RECV_TIMEOUT};

fn terminated(s: &tensorwatch::orchestrator::session::SessionSnapshot) -> bool {
    s.status.state == SessionState::Terminated
}

#[tokio::test]
async fn silent_process_expires_and_releases_buffers() {
    let mut config = test_config();
    config.timeouts.heartbeat_timeout_ms = 150;
    let mgr = manager(config);
    let (handle, mut remote) = connect_running(&mgr).await;
    remote.tensor("fc/weight", 1, &[1.0, 2.0]).await;

    let snapshot = wait_until(&handle, terminated).await;
    let reason = snapshot.status.terminated_reason.clone().expect("reason");
    assert!(reason.contains("no heartbeat"), "{reason}");

    let query = TensorQuery {
        device: None,
        node: "fc/weight".into(),
        output_index: 0,
        step: 1,
    };
    let view = api::get_tensor(&mgr, handle.id(), &query).expect("stats kept");
    assert!(matches!(view, TensorView::PartiallyEvicted { .. }));

    assert!(matches!(handle.pause().await, Err(AppError::SessionClosed(_))));
    assert!(matches!(handle.clear_hits().await, Err(AppError::SessionClosed(_))));
}

#[tokio::test]
async fn disconnect_terminates_but_keeps_data_readable() {
    let mgr = manager(test_config());
    let (handle, mut remote) = connect_running(&mgr).await;
    remote.tensor("fc/weight", 1, &[1.0]).await;
    remote.step_end(1).await;
    wait_until(&handle, |s| s.graphs.history(1).len() == 1).await;
    drop(remote);

    wait_until(&handle, terminated).await;
    let status = api::session_status(&mgr, handle.id()).expect("still listed");
    assert!(status.terminated_at.is_some());
    assert_eq!(api::get_history(&mgr, handle.id(), 1).expect("history").len(), 1);
}

#[tokio::test]
async fn reconnect_token_carries_watchpoints_to_new_session() {
    let mgr = manager(test_config());
    let (first, mut remote) = connect_running(&mgr).await;

    let watch = {
        let first = Arc::clone(&first);
        tokio::spawn(async move {
            first
                .set_watchpoint(vec!["conv1/*".into()], Condition::HasNan, true)
                .await
        })
    };
    let command_id = remote.recv_command_id().await;
    remote.ack(command_id).await;
    let watchpoint_id = watch.await.expect("join").expect("installed");
    let token = first.reconnect_token().to_owned();
    drop(remote);

    wait_until(&first, terminated).await;
    tokio::time::timeout(RECV_TIMEOUT, async {
        while mgr.ledger().len() != 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("registry deposited");

    let (second, mut remote) = connect(&mgr);
    let (session_id, new_token) = remote.handshake(Some(token.clone())).await;
    assert_eq!(session_id, second.id());
    assert_ne!(new_token, token, "every session gets a fresh token");

    let frame = remote.recv().await;
    let OutboundFrame::WatchpointSet {
        command_id: None,
        id,
        patterns,
        ..
    } = frame
    else {
        panic!("expected untracked watchpoint_set, got {frame:?}");
    };
    assert_eq!(id, watchpoint_id);
    assert_eq!(patterns, vec!["conv1/*".to_owned()]);

    let snapshot = wait_until(&second, |s| s.status.state == SessionState::Running).await;
    assert_eq!(snapshot.watchpoints.len(), 1);
    assert!(mgr.ledger().is_empty(), "deposit is claimed once");
}

#[tokio::test]
async fn unknown_reconnect_token_starts_empty() {
    let mgr = manager(test_config());
    let (handle, mut remote) = connect(&mgr);
    remote.handshake(Some("never-issued".into())).await;

    let snapshot = wait_until(&handle, |s| s.status.state == SessionState::Running).await;
    assert!(snapshot.watchpoints.is_empty());
}

#[tokio::test]
async fn session_limit_counts_live_sessions() {
    let mut config = test_config();
    config.max_sessions = 1;
    let mgr = manager(config);
    let (first, _remote) = connect(&mgr);

    let (spare, _peer) = tokio::io::duplex(1024);
    let (source, sink) = tokio::io::split(spare);
    assert!(matches!(mgr.attach(source, sink), Err(AppError::LimitExceeded(_))));

    first.close();
    wait_until(&first, terminated).await;
    assert_eq!(mgr.live_count(), 0);
    let (_second, _remote) = connect(&mgr);
    assert_eq!(mgr.list().len(), 2, "terminated session stays listed until collected");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_attach_respects_the_session_limit() {
    let mut config = test_config();
    config.max_sessions = 1;
    let mgr = manager(config);

    let attempts: Vec<_> = (0..8)
        .map(|_| {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move {
                let (local, peer) = tokio::io::duplex(1024);
                let (source, sink) = tokio::io::split(local);
                (mgr.attach(source, sink).is_ok(), peer)
            })
        })
        .collect();

    let mut peers = Vec::new();
    let mut attached = 0;
    for attempt in attempts {
        let (ok, peer) = attempt.await.expect("join");
        attached += usize::from(ok);
        peers.push(peer);
    }
    assert_eq!(attached, 1);
    assert_eq!(mgr.live_count(), 1);
}

#[tokio::test]
async fn close_fails_waiters_and_removes_the_session() {
    let mgr = manager(test_config());
    let (handle, mut remote) = connect_running(&mgr).await;

    let pause = {
        let handle = Arc::clone(&handle);
        tokio::spawn(async move { handle.pause().await })
    };
    remote.recv_command_id().await;

    api::close_session(&mgr, handle.id()).expect("closed");
    let result = pause.await.expect("join");
    assert!(matches!(result, Err(AppError::SessionClosed(_))));

    assert!(matches!(mgr.get(handle.id()), Err(AppError::NotFound(_))));
    assert!(matches!(
        api::close_session(&mgr, handle.id()),
        Err(AppError::NotFound(_))
    ));
    handle.join().await;
    assert_eq!(handle.status().state, SessionState::Terminated);
}

#[tokio::test]
async fn terminated_sessions_are_collected_after_retention() {
    let mut config = test_config();
    config.session.terminated_retention_seconds = 0;
    let mgr = manager(config);
    let (handle, _remote) = connect_running(&mgr).await;
    let (live, _live_remote) = connect_running(&mgr).await;

    handle.close();
    handle.join().await;

    let collected = mgr.collect_terminated(Utc::now() + chrono::Duration::seconds(1));
    assert_eq!(collected, vec![handle.id().to_owned()]);
    assert!(matches!(mgr.get(handle.id()), Err(AppError::NotFound(_))));
    assert!(mgr.get(live.id()).is_ok());
}

#[tokio::test]
async fn retention_window_keeps_recent_terminations() {
    let mgr = manager(test_config());
    let (handle, _remote) = connect_running(&mgr).await;
    handle.close();
    handle.join().await;

    assert!(mgr.collect_terminated(Utc::now()).is_empty());
    assert!(mgr.get(handle.id()).is_ok());
}

#[tokio::test]
async fn repeated_garbage_desynchronizes_the_session() {
    let mut config = test_config();
    config.session.max_consecutive_protocol_errors = 3;
    let mgr = manager(config);
    let (handle, mut remote) = connect_running(&mgr).await;

    for _ in 0..3 {
        remote.send_raw("%%%").await;
    }
    let snapshot = wait_until(&handle, terminated).await;
    let reason = snapshot.status.terminated_reason.clone().expect("reason");
    assert!(reason.contains("consecutive protocol errors"), "{reason}");
}

#[tokio::test]
async fn shutdown_closes_every_session() {
    let mgr = manager(test_config());
    let (first, _r1) = connect_running(&mgr).await;
    let (second, _r2) = connect_running(&mgr).await;
    assert_eq!(mgr.live_count(), 2);

    tokio::time::timeout(RECV_TIMEOUT, mgr.shutdown())
        .await
        .expect("shutdown completes");
    assert!(mgr.list().is_empty());
    assert_eq!(first.status().state, SessionState::Terminated);
    assert_eq!(second.status().state, SessionState::Terminated);
}
