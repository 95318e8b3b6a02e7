//! Session worker task.
//!
//! One worker per session is the sole writer of its [`SessionCore`]. It drains
//! the reader's events, the control channel, the heartbeat monitor, and the
//! pending-command deadline in a single `select!` loop, flushes outbound
//! frames to the writer, and publishes a fresh [`SessionSnapshot`] after every
//! iteration. The worker never awaits the writer, so a slow dashboard or a
//! stalled outbound link cannot backpressure ingestion.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

use crate::config::GlobalConfig;
use crate::models::command::Command;
use crate::models::session::{SessionEvent, SessionState};
use crate::models::watchpoint::WatchpointHit;
use crate::orchestrator::control::SessionHandle;
use crate::orchestrator::heartbeat::{HeartbeatExpired, HeartbeatMonitor, HeartbeatMonitorHandle};
use crate::orchestrator::session::{CommandReply, SessionCore, SessionSnapshot};
use crate::orchestrator::session_manager::ReconnectLedger;
use crate::stream::frames::{InboundFrame, OutboundFrame};
use crate::stream::reader::{run_reader, StreamEvent};
use crate::stream::writer::run_writer;
use crate::Result;

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const OUTBOUND_CHANNEL_CAPACITY: usize = 256;
const CONTROL_CHANNEL_CAPACITY: usize = 16;

/// Request from a [`SessionHandle`] to its worker.
#[derive(Debug)]
pub(crate) enum ControlRequest {
    /// Issue an operator command and reply once it resolves.
    Issue {
        /// Command to issue.
        command: Command,
        /// Resolution channel.
        reply: CommandReply,
    },
    /// Re-evaluate watchpoints against the paused step.
    Recheck {
        /// Hits of the paused step after the recheck.
        reply: oneshot::Sender<Result<Vec<WatchpointHit>>>,
    },
    /// Drop every committed and buffered watchpoint hit.
    ClearHits {
        /// Completion channel.
        reply: oneshot::Sender<()>,
    },
}

struct WorkerContext {
    snapshot: Arc<ArcSwap<SessionSnapshot>>,
    control_rx: mpsc::Receiver<ControlRequest>,
    event_rx: mpsc::Receiver<StreamEvent>,
    heartbeat_rx: mpsc::Receiver<HeartbeatExpired>,
    frame_tx: mpsc::Sender<OutboundFrame>,
    ledger: Arc<ReconnectLedger>,
    cancel: CancellationToken,
    reader_cancel: CancellationToken,
}

/// Spawn the reader, writer, heartbeat monitor, and worker of a new session.
pub(crate) fn spawn_session<R, W>(
    mut core: SessionCore,
    config: &GlobalConfig,
    source: R,
    sink: W,
    ledger: Arc<ReconnectLedger>,
    cancel: CancellationToken,
) -> SessionHandle
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let session_id = core.session_id().to_owned();
    let reconnect_token = core.reconnect_token().to_owned();

    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (frame_tx, frame_rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
    let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
    let (heartbeat_tx, heartbeat_rx) = mpsc::channel(1);
    let reader_cancel = cancel.child_token();

    tokio::spawn(
        run_reader(
            session_id.clone(),
            source,
            config.stream.max_frame_bytes,
            event_tx,
            reader_cancel.clone(),
        )
        .instrument(info_span!("stream_reader", session_id = session_id.as_str())),
    );

    let writer_session = session_id.clone();
    let writer_cancel = cancel.child_token();
    tokio::spawn(
        async move {
            if let Err(err) = run_writer(writer_session, sink, frame_rx, writer_cancel).await {
                warn!(%err, "stream writer stopped");
            }
        }
        .instrument(info_span!("stream_writer", session_id = session_id.as_str())),
    );

    let monitor = HeartbeatMonitor::new(
        session_id.clone(),
        config.heartbeat_timeout(),
        heartbeat_tx,
        reader_cancel.clone(),
    )
    .spawn();

    let snapshot = Arc::new(ArcSwap::from_pointee(core.snapshot()));
    let ctx = WorkerContext {
        snapshot: Arc::clone(&snapshot),
        control_rx,
        event_rx,
        heartbeat_rx,
        frame_tx,
        ledger,
        cancel: cancel.clone(),
        reader_cancel,
    };
    let worker = tokio::spawn(
        run_worker(core, ctx, monitor)
            .instrument(info_span!("session_worker", session_id = session_id.as_str())),
    );

    SessionHandle::new(
        session_id,
        reconnect_token,
        snapshot,
        control_tx,
        cancel,
        worker,
    )
}

async fn run_worker(mut core: SessionCore, mut ctx: WorkerContext, monitor: HeartbeatMonitorHandle) {
    loop {
        let deadline = core.pending_deadline();
        tokio::select! {
            biased;

            () = ctx.cancel.cancelled() => {
                core.terminate(SessionEvent::Closed, "closed by operator");
            }

            Some(expired) = ctx.heartbeat_rx.recv() => {
                core.terminate(
                    SessionEvent::HeartbeatExpired,
                    format!("no heartbeat within {:?}", expired.timeout),
                );
            }

            () = wait_until(deadline) => core.expire_pending(),

            request = ctx.control_rx.recv() => match request {
                Some(ControlRequest::Issue { command, reply }) => core.issue(command, reply),
                Some(ControlRequest::Recheck { reply }) => {
                    let _ = reply.send(core.recheck());
                }
                Some(ControlRequest::ClearHits { reply }) => {
                    core.clear_hits();
                    let _ = reply.send(());
                }
                None => core.terminate(SessionEvent::Closed, "session handle dropped"),
            },

            event = ctx.event_rx.recv() => match event {
                Some(StreamEvent::Frame(frame)) => {
                    monitor.reset();
                    ingest(&mut core, frame, &ctx.ledger);
                }
                Some(StreamEvent::Malformed(reason)) => core.record_malformed(&reason),
                Some(StreamEvent::Closed { reason }) => {
                    core.terminate(SessionEvent::Disconnected, reason);
                }
                None => core.terminate(SessionEvent::Disconnected, "stream reader stopped"),
            },
        }

        flush(&mut core, &ctx.frame_tx);
        ctx.snapshot.store(Arc::new(core.snapshot()));
        if !core.state().is_live() {
            break;
        }
    }

    ctx.ledger
        .deposit(core.reconnect_token(), core.watchpoints().watchpoints());
    ctx.reader_cancel.cancel();
    monitor.await_completion().await;
    debug!("session worker exited");
}

fn ingest(core: &mut SessionCore, frame: InboundFrame, ledger: &ReconnectLedger) {
    let handshake_token = match &frame {
        InboundFrame::Metadata {
            reconnect_token: Some(token),
            ..
        } if core.state() == SessionState::WaitingConnect => Some(token.clone()),
        _ => None,
    };
    core.ingest(frame);
    if let Some(token) = handshake_token {
        if core.state() == SessionState::ReceivingMetadata {
            match ledger.take(&token) {
                Some(watchpoints) => core.inherit_watchpoints(watchpoints),
                None => debug!("reconnect token not recognised"),
            }
        }
    }
}

fn flush(core: &mut SessionCore, frame_tx: &mpsc::Sender<OutboundFrame>) {
    for frame in core.take_outbound() {
        if let Err(err) = frame_tx.try_send(frame) {
            warn!(%err, "outbound frame dropped");
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
