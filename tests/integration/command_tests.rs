//! Command round trips against a live session worker.
//!
//! Each test plays the training process: it reads the command frame off the
//! stream and acknowledges, rejects, or ignores it.

use std::sync::Arc;

use tensorwatch::models::command::{AckStatus, ControlAction};
use tensorwatch::models::graph::NodeKey;
use tensorwatch::models::session::{PauseReason, SessionState};
use tensorwatch::models::watchpoint::Condition;
use tensorwatch::orchestrator::control::SessionHandle;
use tensorwatch::stream::frames::{InboundFrame, OutboundFrame};
use tensorwatch::AppError;

use super::test_helpers::{connect_running, manager, test_config, wait_until, Remote};

async fn pause_acked(handle: &Arc<SessionHandle>, remote: &mut Remote) {
    let pause = {
        let handle = Arc::clone(handle);
        tokio::spawn(async move { handle.pause().await })
    };
    let command_id = remote.recv_command_id().await;
    remote.ack(command_id).await;
    pause.await.expect("join").expect("paused");
}

#[tokio::test]
async fn second_command_waits_for_first_ack() {
    let mgr = manager(test_config());
    let (handle, mut remote) = connect_running(&mgr).await;

    let first = {
        let handle = Arc::clone(&handle);
        tokio::spawn(async move { handle.pause().await })
    };
    let command_id = remote.recv_command_id().await;

    let second = handle.pause().await;
    assert!(matches!(second, Err(AppError::CommandInProgress(_))));
    let snapshot = wait_until(&handle, |s| s.status.command_pending.is_some()).await;
    let pending = snapshot.status.command_pending.clone().expect("pending");
    assert_eq!(pending.command_id, command_id);
    assert_eq!(pending.action, Some(ControlAction::Pause));

    remote.ack(command_id).await;
    first.await.expect("join").expect("paused");
    let snapshot = wait_until(&handle, |s| s.status.state == SessionState::Paused).await;
    let status = &snapshot.status;
    assert_eq!(status.pause_reason, Some(PauseReason::Requested));
    assert!(status.command_pending.is_none());
}

#[tokio::test]
async fn unacknowledged_command_times_out_and_heartbeat_clears_degraded() {
    let mut config = test_config();
    config.timeouts.command_ack_timeout_ms = 100;
    let mgr = manager(config);
    let (handle, mut remote) = connect_running(&mgr).await;

    let pause = {
        let handle = Arc::clone(&handle);
        tokio::spawn(async move { handle.pause().await })
    };
    remote.recv_command_id().await;
    let result = pause.await.expect("join");
    assert!(matches!(result, Err(AppError::CommandTimeout(_))));

    let snapshot = wait_until(&handle, |s| s.status.degraded).await;
    assert_eq!(snapshot.status.state, SessionState::Running, "state is unchanged");

    remote.heartbeat(1).await;
    wait_until(&handle, |s| !s.status.degraded).await;
}

#[tokio::test]
async fn rejected_command_reports_remote_reason() {
    let mgr = manager(test_config());
    let (handle, mut remote) = connect_running(&mgr).await;

    let pause = {
        let handle = Arc::clone(&handle);
        tokio::spawn(async move { handle.pause().await })
    };
    let command_id = remote.recv_command_id().await;
    remote
        .send(&InboundFrame::CommandAck {
            command_id,
            status: AckStatus::Rejected,
            message: Some("optimizer step in flight".into()),
        })
        .await;

    let result = pause.await.expect("join");
    assert_eq!(
        result,
        Err(AppError::CommandRejected("optimizer step in flight".into()))
    );
    assert_eq!(handle.status().state, SessionState::Running);
}

#[tokio::test]
async fn commands_invalid_for_state_fail_without_frames() {
    let mgr = manager(test_config());
    let (handle, _remote) = connect_running(&mgr).await;

    assert!(matches!(handle.continue_().await, Err(AppError::InvalidState(_))));
    assert!(matches!(
        handle.step_to_next_node(Some("conv1/weight".into()), None).await,
        Err(AppError::InvalidState(_))
    ));
    assert!(handle.status().command_pending.is_none());
}

#[tokio::test]
async fn step_to_next_node_runs_until_target_executes() {
    let mgr = manager(test_config());
    let (handle, mut remote) = connect_running(&mgr).await;
    pause_acked(&handle, &mut remote).await;

    let step = {
        let handle = Arc::clone(&handle);
        tokio::spawn(async move {
            handle
                .step_to_next_node(Some("conv1/weight".into()), None)
                .await
        })
    };
    let OutboundFrame::ControlCommand { command_id, action } = remote.recv().await else {
        panic!("expected control command");
    };
    assert_eq!(
        action,
        ControlAction::StepTo {
            device_id: "dev0".into(),
            node: "conv1/bias".into(),
        }
    );
    remote.ack(command_id).await;
    step.await.expect("join").expect("stepping");
    wait_until(&handle, |s| s.status.state == SessionState::Running).await;

    remote.tensor("conv1/weight", 1, &[1.0]).await;
    remote.tensor("conv1/bias", 1, &[1.0]).await;
    assert!(matches!(
        remote.recv().await,
        OutboundFrame::ControlCommand {
            action: ControlAction::Pause,
            ..
        }
    ));
    let snapshot = wait_until(&handle, |s| s.status.state == SessionState::Paused).await;
    assert_eq!(
        snapshot.status.pause_reason,
        Some(PauseReason::ReachedNode {
            node: NodeKey::new("dev0", "conv1/bias"),
        })
    );
}

#[tokio::test]
async fn watchpoint_toggle_and_remove_are_mirrored() {
    let mgr = manager(test_config());
    let (handle, mut remote) = connect_running(&mgr).await;

    let set = {
        let handle = Arc::clone(&handle);
        tokio::spawn(async move {
            handle
                .set_watchpoint(vec!["fc/*".into()], Condition::HasNan, true)
                .await
        })
    };
    let command_id = remote.recv_command_id().await;
    remote.ack(command_id).await;
    let id = set.await.expect("join").expect("installed");

    let toggle = {
        let handle = Arc::clone(&handle);
        tokio::spawn(async move { handle.toggle_watchpoint(id, false).await })
    };
    let frame = remote.recv().await;
    let OutboundFrame::WatchpointSet {
        command_id: Some(command_id),
        id: mirrored,
        enabled,
        ..
    } = frame
    else {
        panic!("expected watchpoint_set, got {frame:?}");
    };
    assert_eq!(mirrored, id);
    assert!(!enabled);
    remote.ack(command_id).await;
    toggle.await.expect("join").expect("toggled");
    wait_until(&handle, |s| s.watchpoints.iter().all(|w| !w.enabled)).await;

    let remove = {
        let handle = Arc::clone(&handle);
        tokio::spawn(async move { handle.remove_watchpoint(id).await })
    };
    let frame = remote.recv().await;
    let OutboundFrame::WatchpointClear {
        command_id: Some(command_id),
        id: cleared,
    } = frame
    else {
        panic!("expected watchpoint_clear, got {frame:?}");
    };
    assert_eq!(cleared, id);
    remote.ack(command_id).await;
    remove.await.expect("join").expect("removed");
    wait_until(&handle, |s| s.watchpoints.is_empty()).await;

    assert!(matches!(
        handle.remove_watchpoint(id).await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn terminate_ends_the_session() {
    let mgr = manager(test_config());
    let (handle, mut remote) = connect_running(&mgr).await;

    let terminate = {
        let handle = Arc::clone(&handle);
        tokio::spawn(async move { handle.terminate().await })
    };
    let OutboundFrame::ControlCommand { command_id, action } = remote.recv().await else {
        panic!("expected control command");
    };
    assert_eq!(action, ControlAction::Terminate);
    remote.ack(command_id).await;
    terminate.await.expect("join").expect("terminated");

    let snapshot = wait_until(&handle, |s| s.status.state == SessionState::Terminated).await;
    assert!(snapshot.status.terminated_at.is_some());
    assert!(matches!(handle.pause().await, Err(AppError::SessionClosed(_))));
}
