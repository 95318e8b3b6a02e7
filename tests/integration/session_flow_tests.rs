//! End-to-end data flow: frames in over the stream, polling reads out.

use std::sync::Arc;

use tensorwatch::api::{self, TensorQuery, TensorView};
use tensorwatch::models::command::ControlAction;
use tensorwatch::models::session::{PauseReason, SessionState};
use tensorwatch::models::watchpoint::Condition;
use tensorwatch::orchestrator::control::SessionHandle;
use tensorwatch::stream::frames::OutboundFrame;
use tensorwatch::AppError;

use super::test_helpers::{connect_running, manager, test_config, wait_until, Remote};

fn query(node: &str, step: u64) -> TensorQuery {
    TensorQuery {
        device: None,
        node: node.into(),
        output_index: 0,
        step,
    }
}

#[tokio::test]
async fn nan_in_watched_scope_pauses_and_reports_hit() {
    let mgr = manager(test_config());
    let (handle, mut remote) = connect_running(&mgr).await;

    let watch = {
        let handle = Arc::clone(&handle);
        tokio::spawn(async move {
            handle
                .set_watchpoint(vec!["conv1/*".into()], Condition::HasNan, true)
                .await
        })
    };
    let command_id = remote.recv_command_id().await;
    remote.ack(command_id).await;
    let watchpoint_id = watch.await.expect("join").expect("installed");

    remote.tensor("conv1/weight", 1, &[0.5, 1.5]).await;
    remote.step_end(1).await;
    remote.tensor("conv1/weight", 3, &[1.0, f32::NAN]).await;
    remote.tensor("fc/weight", 3, &[f32::NAN]).await;
    remote.step_end(3).await;

    assert!(matches!(
        remote.recv().await,
        OutboundFrame::ControlCommand {
            action: ControlAction::Pause,
            ..
        }
    ));
    let snapshot = wait_until(&handle, |s| s.status.state == SessionState::Paused).await;
    assert_eq!(snapshot.status.current_step, 3);

    let hits = api::list_hits(&mgr, handle.id(), Some(3)).expect("hits");
    assert_eq!(hits.len(), 1, "fc/weight is outside conv1/*");
    assert_eq!(hits[0].watchpoint_id, watchpoint_id);
    assert_eq!(hits[0].node_name(), "conv1/weight");
    assert!(api::list_hits(&mgr, handle.id(), Some(1)).expect("hits").is_empty());

    let status = api::session_status(&mgr, handle.id()).expect("status");
    assert!(matches!(
        status.pause_reason,
        Some(PauseReason::WatchpointHit { ref hits }) if hits.len() == 1
    ));

    let resume = {
        let handle = Arc::clone(&handle);
        tokio::spawn(async move { handle.continue_().await })
    };
    let command_id = remote.recv_command_id().await;
    remote.ack(command_id).await;
    resume.await.expect("join").expect("resumed");
    wait_until(&handle, |s| s.status.state == SessionState::Running).await;
}

#[tokio::test]
async fn evicted_tensor_keeps_statistics() {
    let mut config = test_config();
    config.cache.tensor_cache_byte_budget = 32;
    let mgr = manager(config);
    let (handle, mut remote) = connect_running(&mgr).await;

    for step in 1..=5 {
        remote.tensor("fc/weight", step, &[1.0, 2.0, 3.0, 4.0]).await;
        remote.step_end(step).await;
    }
    wait_until(&handle, |s| s.graphs.history(5).len() == 1).await;

    let evicted = api::get_tensor(&mgr, handle.id(), &query("fc/weight", 1)).expect("record");
    let TensorView::PartiallyEvicted { statistics, shape, .. } = evicted else {
        panic!("step 1 should be evicted, got {evicted:?}");
    };
    assert_eq!(shape, vec![4]);
    assert_eq!(statistics.max, Some(4.0));
    assert_eq!(statistics.count, 4);

    let recent = api::get_tensor(&mgr, handle.id(), &query("fc/weight", 5)).expect("record");
    assert!(matches!(recent, TensorView::Full { ref record } if record.buffer.is_some()));

    let stats = api::get_tensor_stats(&mgr, handle.id(), &query("fc/weight", 1)).expect("stats");
    assert_eq!(stats, statistics);
}

#[tokio::test]
async fn graph_and_history_are_readable() {
    let mgr = manager(test_config());
    let (handle, mut remote) = connect_running(&mgr).await;

    remote.tensor("fc/weight", 1, &[1.0]).await;
    remote.tensor("conv1/weight", 1, &[1.0]).await;
    remote.step_end(1).await;
    wait_until(&handle, |s| s.graphs.history(1).len() == 2).await;

    let graph = api::get_graph(&mgr, handle.id(), "dev0").expect("graph");
    assert_eq!(graph.nodes.len(), 3);

    let history = api::get_history(&mgr, handle.id(), 1).expect("history");
    let order: Vec<&str> = history.iter().map(|e| e.node.name.as_str()).collect();
    assert_eq!(order, ["fc/weight", "conv1/weight"]);

    assert!(matches!(
        api::get_graph(&mgr, handle.id(), "dev9"),
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        api::get_tensor(&mgr, handle.id(), &query("fc/weight", 99)),
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        api::session_status(&mgr, "no-such-session"),
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn malformed_lines_are_skipped() {
    let mgr = manager(test_config());
    let (handle, mut remote) = connect_running(&mgr).await;

    remote.send_raw("this is not json").await;
    remote.send_raw(r#"{"type":"unknown_frame"}"#).await;
    remote.tensor("fc/weight", 2, &[3.0]).await;
    remote.step_end(2).await;

    let snapshot = wait_until(&handle, |s| s.graphs.history(2).len() == 1).await;
    assert_eq!(snapshot.status.state, SessionState::Running);
    assert_eq!(snapshot.status.current_step, 2);
}

#[tokio::test]
async fn clear_hits_empties_the_hit_log() {
    let mgr = manager(test_config());
    let (handle, mut remote) = connect_running(&mgr).await;

    let watch = {
        let handle = Arc::clone(&handle);
        tokio::spawn(async move {
            handle
                .set_watchpoint(vec!["**".into()], Condition::HasInf, true)
                .await
        })
    };
    let command_id = remote.recv_command_id().await;
    remote.ack(command_id).await;
    watch.await.expect("join").expect("installed");

    remote.tensor("fc/weight", 1, &[f32::INFINITY]).await;
    remote.step_end(1).await;
    wait_until(&handle, |s| !s.hits.is_empty()).await;

    api::clear_hits(&mgr, handle.id()).await.expect("cleared");
    wait_until(&handle, |s| s.hits.is_empty()).await;
    assert!(api::list_hits(&mgr, handle.id(), None).expect("hits").is_empty());
}

async fn pause_acked(handle: &Arc<SessionHandle>, remote: &mut Remote) {
    let pause = {
        let handle = Arc::clone(handle);
        tokio::spawn(async move { handle.pause().await })
    };
    let command_id = remote.recv_command_id().await;
    remote.ack(command_id).await;
    pause.await.expect("join").expect("paused");
    wait_until(handle, |s| s.status.state == SessionState::Paused).await;
}

#[tokio::test]
async fn paused_tensor_compares_with_previous_step() {
    let mgr = manager(test_config());
    let (handle, mut remote) = connect_running(&mgr).await;

    remote.tensor("fc/weight", 1, &[1.0, 2.0, 3.0]).await;
    remote.step_end(1).await;
    remote.tensor("fc/weight", 2, &[1.0, 3.0, 6.0]).await;
    remote.step_end(2).await;
    wait_until(&handle, |s| s.graphs.history(2).len() == 1).await;

    assert!(matches!(
        api::compare_tensor(&mgr, handle.id(), &query("fc/weight", 2), 0.0),
        Err(AppError::InvalidState(_))
    ));

    pause_acked(&handle, &mut remote).await;
    let comparison =
        api::compare_tensor(&mgr, handle.id(), &query("fc/weight", 2), 0.0).expect("comparison");
    assert_eq!(comparison.previous_step, 1);
    assert_eq!(comparison.current.max, Some(6.0));
    assert_eq!(comparison.previous.max, Some(3.0));
    assert_eq!(comparison.diff.min, Some(0.0));
    assert_eq!(comparison.diff.max, Some(3.0));
    assert_eq!(comparison.diff.zero_count, 1);

    assert!(matches!(
        api::compare_tensor(&mgr, handle.id(), &query("fc/weight", 1), 0.0),
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        api::compare_tensor(&mgr, handle.id(), &query("fc/weight", 2), 2.0),
        Err(AppError::InvalidParam(_))
    ));
}

#[tokio::test]
async fn recheck_reports_hits_for_tensors_already_received() {
    let mgr = manager(test_config());
    let (handle, mut remote) = connect_running(&mgr).await;

    remote.tensor("conv1/bias", 4, &[f32::INFINITY]).await;
    remote.step_end(4).await;
    wait_until(&handle, |s| s.graphs.history(4).len() == 1).await;
    pause_acked(&handle, &mut remote).await;

    let watch = {
        let handle = Arc::clone(&handle);
        tokio::spawn(async move {
            handle
                .set_watchpoint(vec!["conv1/*".into()], Condition::HasInf, true)
                .await
        })
    };
    let command_id = remote.recv_command_id().await;
    remote.ack(command_id).await;
    let watchpoint_id = watch.await.expect("join").expect("installed");

    let hits = api::recheck(&mgr, handle.id()).await.expect("recheck");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].watchpoint_id, watchpoint_id);
    assert_eq!(hits[0].node_name(), "conv1/bias");

    wait_until(&handle, |s| s.hits.contains_key(&4)).await;
    assert_eq!(api::list_hits(&mgr, handle.id(), Some(4)).expect("hits"), hits);
}
