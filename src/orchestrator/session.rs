//! Authoritative per-session state.
//!
//! [`SessionCore`] is owned by exactly one worker task and mutated
//! synchronously, in frame order: graph cache, then tensor cache, then
//! watchpoint engine, then the state machine. Readers never touch it; they
//! see [`SessionSnapshot`]s the worker publishes after every step.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::graph::{GraphCache, GraphView};
use crate::cache::tensor::{TensorCache, TensorCacheView};
use crate::config::GlobalConfig;
use crate::models::command::{AckStatus, Command, CommandId, CommandOutcome, ControlAction};
use crate::models::graph::{NodeDef, NodeKey};
use crate::models::session::{
    Device, PauseReason, PendingCommandInfo, SessionEvent, SessionId, SessionState,
    SessionStatus, Transition,
};
use crate::models::tensor::{TensorKey, TensorRecord};
use crate::models::watchpoint::{Watchpoint, WatchpointHit, WatchpointId};
use crate::models::DeviceId;
use crate::stream::frames::{InboundFrame, OutboundFrame, TensorChunk};
use crate::stream::reassembly::{ChunkOutcome, Reassembler};
use crate::watchpoint::engine::{HitLog, WatchpointEngine};
use crate::{AppError, Result};

/// Reply channel of an operator command.
pub type CommandReply = oneshot::Sender<Result<CommandOutcome>>;

/// Everything a dashboard reader can see of one session.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    /// Status summary.
    pub status: SessionStatus,
    /// Graphs and sealed execution history.
    pub graphs: GraphView,
    /// Tensor records as of the last sealed step or eviction.
    pub tensors: TensorCacheView,
    /// Committed watchpoint hits.
    pub hits: HitLog,
    /// Registered watchpoints.
    pub watchpoints: Vec<Watchpoint>,
}

/// What an acknowledged command changes locally.
#[derive(Debug)]
enum Effect {
    Control(ControlAction),
    Install(Watchpoint),
    Remove(WatchpointId),
    Toggle { id: WatchpointId, enabled: bool },
}

#[derive(Debug)]
struct PendingCommand {
    info: PendingCommandInfo,
    effect: Effect,
    deadline: Instant,
    reply: CommandReply,
}

/// Per-session state machine with its caches.
#[derive(Debug)]
pub struct SessionCore {
    session_id: SessionId,
    reconnect_token: String,
    config: Arc<GlobalConfig>,
    state: SessionState,
    current_step: u64,
    devices: Vec<Device>,
    graph_version: Option<u64>,
    awaiting_graphs: BTreeSet<DeviceId>,
    graphs: GraphCache,
    tensors: TensorCache,
    watchpoints: WatchpointEngine,
    reassembler: Reassembler,
    pending: Option<PendingCommand>,
    next_command_id: CommandId,
    degraded: bool,
    pause_reason: Option<PauseReason>,
    run_target: Option<NodeKey>,
    consecutive_errors: u32,
    outbox: Vec<OutboundFrame>,
    views_dirty: bool,
    graph_view: GraphView,
    tensor_view: TensorCacheView,
    created_at: DateTime<Utc>,
    terminated_at: Option<DateTime<Utc>>,
    terminated_reason: Option<String>,
}

impl SessionCore {
    /// Create a session waiting for its handshake.
    #[must_use]
    pub fn new(session_id: SessionId, reconnect_token: String, config: Arc<GlobalConfig>) -> Self {
        Self {
            tensors: TensorCache::new(config.cache.tensor_cache_byte_budget),
            watchpoints: WatchpointEngine::new(config.session.max_watchpoints_per_session),
            reassembler: Reassembler::with_max_record_bytes(config.cache.tensor_cache_byte_budget),
            session_id,
            reconnect_token,
            config,
            state: SessionState::WaitingConnect,
            current_step: 0,
            devices: Vec::new(),
            graph_version: None,
            awaiting_graphs: BTreeSet::new(),
            graphs: GraphCache::new(),
            pending: None,
            next_command_id: 1,
            degraded: false,
            pause_reason: None,
            run_target: None,
            consecutive_errors: 0,
            outbox: Vec::new(),
            views_dirty: true,
            graph_view: GraphView::default(),
            tensor_view: TensorCacheView::default(),
            created_at: Utc::now(),
            terminated_at: None,
            terminated_reason: None,
        }
    }

    /// Session identifier.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Token a reconnecting process presents to inherit watchpoints.
    #[must_use]
    pub fn reconnect_token(&self) -> &str {
        &self.reconnect_token
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Highest step observed.
    #[must_use]
    pub fn current_step(&self) -> u64 {
        self.current_step
    }

    /// Graph cache, read-only.
    #[must_use]
    pub fn graphs(&self) -> &GraphCache {
        &self.graphs
    }

    /// Tensor cache, read-only.
    #[must_use]
    pub fn tensors(&self) -> &TensorCache {
        &self.tensors
    }

    /// Watchpoint engine, read-only.
    #[must_use]
    pub fn watchpoints(&self) -> &WatchpointEngine {
        &self.watchpoints
    }

    /// Deadline of the command awaiting acknowledgement.
    #[must_use]
    pub fn pending_deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|p| p.deadline)
    }

    /// Frames queued for the training process since the last call.
    pub fn take_outbound(&mut self) -> Vec<OutboundFrame> {
        std::mem::take(&mut self.outbox)
    }

    // ── Ingestion ────────────────────────────────────────────────────────────

    /// Apply one inbound frame.
    ///
    /// Frame-local failures are logged and the frame is dropped. Too many
    /// consecutive protocol errors terminate the session as corrupt.
    pub fn ingest(&mut self, frame: InboundFrame) {
        if !self.state.is_live() {
            debug!(session_id = self.session_id, frame = frame.kind(), "frame after termination ignored");
            return;
        }
        let kind = frame.kind();
        match self.handle_frame(frame) {
            Ok(()) => self.consecutive_errors = 0,
            Err(e) => self.frame_failed(kind, e),
        }
    }

    /// Account for a line the reader could not decode.
    pub fn record_malformed(&mut self, reason: &str) {
        if self.state.is_live() {
            self.frame_failed("malformed", AppError::Protocol(reason.to_owned()));
        }
    }

    fn frame_failed(&mut self, kind: &str, error: AppError) {
        match error {
            AppError::Fatal(reason) => self.terminate(SessionEvent::Fatal, reason),
            AppError::Protocol(_) => {
                self.consecutive_errors += 1;
                warn!(
                    session_id = self.session_id,
                    frame = kind,
                    error = %error,
                    consecutive = self.consecutive_errors,
                    "dropping frame"
                );
                let limit = self.config.session.max_consecutive_protocol_errors;
                if self.consecutive_errors >= limit {
                    self.terminate(
                        SessionEvent::Fatal,
                        format!("stream desynchronized: {limit} consecutive protocol errors"),
                    );
                }
            }
            other => {
                warn!(session_id = self.session_id, frame = kind, error = %other, "dropping frame");
            }
        }
    }

    fn handle_frame(&mut self, frame: InboundFrame) -> Result<()> {
        match frame {
            InboundFrame::Heartbeat { step, device_id } => self.on_heartbeat(step, &device_id),
            InboundFrame::Metadata {
                devices,
                graph_version,
                ..
            } => self.on_metadata(devices, graph_version),
            InboundFrame::GraphDef {
                device_id,
                nodes,
                incremental,
            } => self.on_graph_def(&device_id, nodes, incremental),
            InboundFrame::TensorChunk(chunk) => self.on_tensor_chunk(&chunk),
            InboundFrame::StepEnd { step } => self.on_step_end(step),
            InboundFrame::CommandAck {
                command_id,
                status,
                message,
            } => {
                self.on_command_ack(command_id, status, message);
                Ok(())
            }
        }
    }

    fn on_heartbeat(&mut self, step: u64, device_id: &str) -> Result<()> {
        if !self.devices.is_empty() && !self.has_device(device_id) {
            return Err(AppError::Protocol(format!(
                "heartbeat from unknown device {device_id}"
            )));
        }
        self.ack_implicitly();
        self.fire(SessionEvent::Heartbeat);
        if self.degraded {
            info!(session_id = self.session_id, "heartbeat reconciled degraded session");
            self.degraded = false;
        }
        if self.state != SessionState::WaitingConnect {
            self.advance_step(step);
        }
        Ok(())
    }

    fn on_metadata(&mut self, devices: Vec<Device>, graph_version: u64) -> Result<()> {
        if self.state == SessionState::WaitingConnect {
            validate_devices(&devices)?;
            self.fire(SessionEvent::Handshake);
            self.awaiting_graphs = devices.iter().map(|d| d.device_id.clone()).collect();
            info!(
                session_id = self.session_id,
                devices = devices.len(),
                graph_version,
                "handshake accepted"
            );
            self.devices = devices;
            self.graph_version = Some(graph_version);
            self.outbox.push(OutboundFrame::Welcome {
                session_id: self.session_id.clone(),
                reconnect_token: self.reconnect_token.clone(),
            });
            return Ok(());
        }

        if !same_devices(&self.devices, &devices) {
            return Err(AppError::Protocol(
                "device set changed after handshake".into(),
            ));
        }
        if self.graph_version == Some(graph_version) {
            debug!(session_id = self.session_id, graph_version, "metadata repeat ignored");
            return Ok(());
        }
        if !self.fire(SessionEvent::MetadataReload) {
            return Err(AppError::InvalidState(format!(
                "metadata reload rejected in {:?}",
                self.state
            )));
        }
        info!(session_id = self.session_id, graph_version, "graph reload announced");
        self.graph_version = Some(graph_version);
        self.awaiting_graphs = self.devices.iter().map(|d| d.device_id.clone()).collect();
        self.pause_reason = None;
        self.run_target = None;
        Ok(())
    }

    fn on_graph_def(&mut self, device_id: &str, nodes: Vec<NodeDef>, incremental: bool) -> Result<()> {
        if self.state == SessionState::WaitingConnect {
            return Err(AppError::InvalidState("graph definition before metadata".into()));
        }
        if !self.has_device(device_id) {
            return Err(AppError::Protocol(format!(
                "graph for unknown device {device_id}"
            )));
        }
        let version = self.graphs.load_graph(
            device_id,
            nodes,
            incremental,
            self.graph_version.unwrap_or_default(),
        );
        info!(
            session_id = self.session_id,
            device = device_id,
            version = version.id,
            nodes = version.nodes().len(),
            incremental,
            "graph loaded"
        );
        self.views_dirty = true;
        if self.state == SessionState::ReceivingMetadata {
            self.awaiting_graphs.remove(device_id);
            if self.awaiting_graphs.is_empty() {
                self.fire(SessionEvent::GraphsComplete);
            }
        }
        Ok(())
    }

    fn on_tensor_chunk(&mut self, chunk: &TensorChunk) -> Result<()> {
        if !matches!(self.state, SessionState::Running | SessionState::Paused) {
            return Err(AppError::InvalidState(format!(
                "tensor chunk for {} in {:?}",
                chunk.node, self.state
            )));
        }
        let device = match &chunk.device_id {
            Some(device) => device.clone(),
            None => self
                .graphs
                .resolve_device(&chunk.node)
                .map_err(unknown_reference)?,
        };
        let node = self
            .graphs
            .get_node(&device, &chunk.node)
            .map_err(unknown_reference)?;
        if !node.outputs.is_empty() && chunk.output_index as usize >= node.outputs.len() {
            return Err(AppError::Protocol(format!(
                "output {} out of range for {} ({} outputs)",
                chunk.output_index,
                chunk.node,
                node.outputs.len()
            )));
        }

        self.fire(SessionEvent::TensorData);
        self.advance_step(chunk.step);
        // Hits of steps below the current one are already cleared.
        let late = chunk.step < self.current_step;
        self.graphs
            .record_executed(chunk.step, NodeKey::new(device.clone(), chunk.node.clone()))?;

        let key = TensorKey {
            device,
            node: chunk.node.clone(),
            output_index: chunk.output_index,
            step: chunk.step,
        };
        match self.reassembler.accept(&key, chunk) {
            Err(e) => {
                self.watchpoints.discard_pending(&key);
                return Err(e);
            }
            Ok(ChunkOutcome::Partial { stats }) => {
                debug!(tensor = %key, seq = chunk.seq, "chunk buffered");
                if !late {
                    self.watchpoints.evaluate_partial(&key, &stats);
                }
            }
            Ok(ChunkOutcome::Duplicate) => {}
            Ok(ChunkOutcome::Complete(record)) => self.on_record_complete(record, late),
        }
        Ok(())
    }

    fn on_record_complete(&mut self, record: TensorRecord, late: bool) {
        let key = record.key.clone();
        if late {
            debug!(tensor = %key, current_step = self.current_step, "late tensor cached without evaluation");
        } else {
            let hits = self.watchpoints.evaluate(&record);
            debug!(tensor = %key, hits = hits.len(), "tensor complete");
        }
        self.tensors.put(record);

        let protected = self.protected_steps();
        if !self.tensors.tick(&protected).is_empty() {
            self.views_dirty = true;
        }

        let reached = !late
            && self
                .run_target
                .as_ref()
                .is_some_and(|t| t.device == key.device && t.name == key.node);
        if reached {
            let target = self.run_target.take();
            if self.fire(SessionEvent::TargetReached) {
                if let Some(node) = target {
                    info!(session_id = self.session_id, node = %node, "step target reached");
                    self.pause_reason = Some(PauseReason::ReachedNode { node });
                }
                self.send_untracked(ControlAction::Pause);
            }
        }
    }

    fn on_step_end(&mut self, step: u64) -> Result<()> {
        if self.state == SessionState::WaitingConnect {
            return Err(AppError::InvalidState("step end before metadata".into()));
        }
        self.ack_implicitly();
        self.advance_step(step);
        for key in self.reassembler.abandon_through(step) {
            warn!(session_id = self.session_id, tensor = %key, "incomplete tensor abandoned at step end");
            self.watchpoints.discard_pending(&key);
        }

        let hits = self.watchpoints.finalize_step(step);
        let before = self.state;
        let accepted = self.fire(SessionEvent::StepEnd {
            hit: !hits.is_empty(),
        });
        if accepted && before == SessionState::Running && self.state == SessionState::Paused {
            info!(session_id = self.session_id, step, hits = hits.len(), "watchpoint hit, pausing");
            self.pause_reason = Some(PauseReason::WatchpointHit { hits });
            self.send_untracked(ControlAction::Pause);
        }

        if let Some(limit) = self.config.cache.stats_step_limit {
            self.tensors.prune_stats(limit);
            if let Some(oldest) = self.tensors.oldest_step() {
                self.graphs.prune_history_before(oldest);
            }
        }
        self.views_dirty = true;
        Ok(())
    }

    fn advance_step(&mut self, step: u64) {
        if step > self.current_step {
            self.current_step = step;
            self.watchpoints.clear_hits_before(step);
        }
    }

    fn protected_steps(&self) -> BTreeSet<u64> {
        let mut steps = self.watchpoints.hit_steps();
        if self.state == SessionState::Paused {
            steps.insert(self.current_step);
        }
        steps
    }

    // ── Commands ─────────────────────────────────────────────────────────────

    /// Validate `command`, send it, and hold `reply` until it is acknowledged.
    ///
    /// Rejections (`CommandInProgress`, `InvalidState`, `SessionClosed`, ...)
    /// are sent on `reply` immediately.
    pub fn issue(&mut self, command: Command, reply: CommandReply) {
        let command_id = self.next_command_id;
        let description = command.label().to_owned();
        match self.prepare_command(command_id, command) {
            Ok((effect, frame)) => {
                self.next_command_id += 1;
                let action = match &effect {
                    Effect::Control(action) => Some(action.clone()),
                    _ => None,
                };
                info!(session_id = self.session_id, command_id, command = description, "command sent");
                self.outbox.push(frame);
                self.pending = Some(PendingCommand {
                    info: PendingCommandInfo {
                        command_id,
                        description,
                        action,
                    },
                    effect,
                    deadline: Instant::now() + self.config.command_ack_timeout(),
                    reply,
                });
            }
            Err(e) => {
                debug!(session_id = self.session_id, command = description, error = %e, "command refused");
                let _ = reply.send(Err(e));
            }
        }
    }

    fn prepare_command(
        &mut self,
        command_id: CommandId,
        command: Command,
    ) -> Result<(Effect, OutboundFrame)> {
        if !self.state.is_live() {
            return Err(AppError::SessionClosed(format!(
                "session {} is terminated",
                self.session_id
            )));
        }
        if let Some(pending) = &self.pending {
            return Err(AppError::CommandInProgress(format!(
                "command {} ({}) awaiting acknowledgement",
                pending.info.command_id, pending.info.description
            )));
        }
        let loading = matches!(
            self.state,
            SessionState::WaitingConnect | SessionState::ReceivingMetadata
        );
        if loading && command != Command::Terminate {
            return Err(AppError::InvalidState(
                "only terminate is accepted while metadata loads".into(),
            ));
        }

        let control = |action: ControlAction| {
            let frame = OutboundFrame::ControlCommand {
                command_id,
                action: action.clone(),
            };
            (Effect::Control(action), frame)
        };

        match command {
            Command::Continue => {
                self.require(SessionState::Paused, "continue")?;
                Ok(control(ControlAction::Continue))
            }
            Command::Pause => {
                self.require(SessionState::Running, "pause")?;
                Ok(control(ControlAction::Pause))
            }
            Command::StepToNextNode { node, device_id } => {
                self.require(SessionState::Paused, "step_to_next_node")?;
                let target = self.resolve_step_target(node, device_id)?;
                Ok(control(ControlAction::StepTo {
                    device_id: target.device,
                    node: target.name,
                }))
            }
            Command::SetWatchpoint {
                patterns,
                condition,
                enabled,
            } => {
                let watchpoint = self.watchpoints.prepare(patterns, condition, enabled)?;
                let frame = OutboundFrame::watchpoint_set(Some(command_id), &watchpoint);
                Ok((Effect::Install(watchpoint), frame))
            }
            Command::RemoveWatchpoint { id } => {
                self.watchpoints.get(id)?;
                let frame = OutboundFrame::WatchpointClear {
                    command_id: Some(command_id),
                    id,
                };
                Ok((Effect::Remove(id), frame))
            }
            Command::ToggleWatchpoint { id, enabled } => {
                let mut watchpoint = self.watchpoints.get(id)?.clone();
                watchpoint.enabled = enabled;
                let frame = OutboundFrame::watchpoint_set(Some(command_id), &watchpoint);
                Ok((Effect::Toggle { id, enabled }, frame))
            }
            Command::Terminate => Ok(control(ControlAction::Terminate)),
        }
    }

    fn require(&self, state: SessionState, command: &str) -> Result<()> {
        if self.state == state {
            Ok(())
        } else {
            Err(AppError::InvalidState(format!(
                "{command} requires {state:?}, session is {:?}",
                self.state
            )))
        }
    }

    /// Node after the reference node in the current step.
    ///
    /// Without an explicit reference the last node executed in the current
    /// step is used. Past the last node the target wraps to the first node of
    /// the device's graph, which runs at the start of the next step.
    fn resolve_step_target(&self, node: Option<String>, device: Option<DeviceId>) -> Result<NodeKey> {
        let as_param = |e: AppError| match e {
            AppError::Protocol(msg) => AppError::InvalidParam(msg),
            other => other,
        };
        let reference = match (node, device) {
            (Some(name), Some(device)) => NodeKey::new(device, name),
            (Some(name), None) => {
                NodeKey::new(self.graphs.resolve_device(&name).map_err(as_param)?, name)
            }
            (None, _) => self.graphs.last_executed(self.current_step).ok_or_else(|| {
                AppError::InvalidParam(format!(
                    "no node executed in step {}; name a reference node",
                    self.current_step
                ))
            })?,
        };

        let next = match self.graphs.next_node_after(self.current_step, &reference)? {
            Some(next) => next,
            None => self
                .graphs
                .graph(&reference.device)?
                .nodes()
                .first()
                .cloned()
                .ok_or_else(|| {
                    AppError::InvalidParam(format!("graph of {} is empty", reference.device))
                })?,
        };
        Ok(NodeKey::new(next.device.clone(), next.name.clone()))
    }

    fn on_command_ack(&mut self, command_id: CommandId, status: AckStatus, message: Option<String>) {
        let matches = self
            .pending
            .as_ref()
            .is_some_and(|p| p.info.command_id == command_id);
        if !matches {
            debug!(session_id = self.session_id, command_id, "ack for unknown or expired command");
            return;
        }
        let Some(pending) = self.pending.take() else {
            return;
        };
        match status {
            AckStatus::Ok => self.complete(pending),
            AckStatus::Rejected => {
                let reason = message.unwrap_or_else(|| "rejected by training process".into());
                warn!(session_id = self.session_id, command_id, reason = reason.as_str(), "command rejected");
                let _ = pending.reply.send(Err(AppError::CommandRejected(reason)));
            }
        }
    }

    fn ack_implicitly(&mut self) {
        if let Some(pending) = self.pending.take() {
            debug!(
                session_id = self.session_id,
                command_id = pending.info.command_id,
                "command acknowledged implicitly"
            );
            self.complete(pending);
        }
    }

    fn complete(&mut self, pending: PendingCommand) {
        let command_id = pending.info.command_id;
        let outcome = CommandOutcome {
            command_id,
            watchpoint_id: None,
        };
        let result = match pending.effect {
            Effect::Control(action) => {
                self.apply_control(action);
                Ok(outcome)
            }
            Effect::Install(watchpoint) => {
                let id = watchpoint.id;
                self.watchpoints.install(watchpoint).map(|()| CommandOutcome {
                    watchpoint_id: Some(id),
                    ..outcome
                })
            }
            Effect::Remove(id) => self.watchpoints.unregister(id).map(|_| outcome),
            Effect::Toggle { id, enabled } => {
                self.watchpoints.toggle(id, enabled).map(|_| outcome)
            }
        };
        info!(session_id = self.session_id, command_id, ok = result.is_ok(), "command acknowledged");
        let _ = pending.reply.send(result);
    }

    fn apply_control(&mut self, action: ControlAction) {
        match action {
            ControlAction::Continue => {
                if self.fire(SessionEvent::ResumeAcked) {
                    self.pause_reason = None;
                    self.run_target = None;
                }
            }
            ControlAction::StepTo { device_id, node } => {
                if self.fire(SessionEvent::ResumeAcked) {
                    self.pause_reason = None;
                    self.run_target = Some(NodeKey::new(device_id, node));
                }
            }
            ControlAction::Pause => {
                let before = self.state;
                if self.fire(SessionEvent::PauseAcked) && before == SessionState::Running {
                    self.pause_reason = Some(PauseReason::Requested);
                }
            }
            ControlAction::Terminate => {
                self.terminate(SessionEvent::TerminateAcked, "terminated by operator");
            }
        }
    }

    /// Fail the pending command if its deadline has passed.
    ///
    /// The session keeps its prior observable state but is marked degraded
    /// until the next heartbeat.
    pub fn expire_pending(&mut self) {
        let expired = self
            .pending
            .as_ref()
            .is_some_and(|p| p.deadline <= Instant::now());
        if !expired {
            return;
        }
        if let Some(pending) = self.pending.take() {
            let timeout = self.config.command_ack_timeout();
            warn!(
                session_id = self.session_id,
                command_id = pending.info.command_id,
                ?timeout,
                "command timed out, session degraded"
            );
            self.degraded = true;
            let _ = pending.reply.send(Err(AppError::CommandTimeout(format!(
                "command {} ({}) not acknowledged within {timeout:?}",
                pending.info.command_id, pending.info.description
            ))));
        }
    }

    fn send_untracked(&mut self, action: ControlAction) {
        let command_id = self.next_command_id;
        self.next_command_id += 1;
        self.outbox
            .push(OutboundFrame::ControlCommand { command_id, action });
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Re-install watchpoints inherited through a reconnect token and mirror
    /// them to the training process.
    pub fn inherit_watchpoints(&mut self, watchpoints: Vec<Watchpoint>) {
        self.watchpoints.restore(watchpoints);
        for watchpoint in self.watchpoints.watchpoints() {
            self.outbox
                .push(OutboundFrame::watchpoint_set(None, &watchpoint));
        }
        info!(
            session_id = self.session_id,
            count = self.watchpoints.watchpoints().len(),
            "watchpoints inherited"
        );
    }

    /// Re-evaluate every watchpoint against the cached records of the paused
    /// step, so a watchpoint added while paused sees tensors that already
    /// arrived.
    ///
    /// Evaluation runs locally on retained statistics and needs no round trip
    /// to the training process; evicted buffers do not matter.
    ///
    /// # Errors
    ///
    /// - `AppError::SessionClosed` once terminated.
    /// - `AppError::InvalidState` unless the session is `PAUSED`.
    /// - `AppError::CommandInProgress` while a command awaits acknowledgement.
    pub fn recheck(&mut self) -> Result<Vec<WatchpointHit>> {
        if !self.state.is_live() {
            return Err(AppError::SessionClosed(format!(
                "session {} is terminated",
                self.session_id
            )));
        }
        self.require(SessionState::Paused, "recheck")?;
        if let Some(pending) = &self.pending {
            return Err(AppError::CommandInProgress(format!(
                "command {} ({}) awaiting acknowledgement",
                pending.info.command_id, pending.info.description
            )));
        }
        let step = self.current_step;
        let slab = self.tensors.view().step(step).cloned().unwrap_or_default();
        let hits = self
            .watchpoints
            .recheck(step, slab.records().map(Arc::as_ref));
        info!(session_id = self.session_id, step, hits = hits.len(), "watchpoints rechecked");
        if !hits.is_empty() {
            self.pause_reason = Some(PauseReason::WatchpointHit { hits: hits.clone() });
        }
        Ok(hits)
    }

    /// Drop every recorded hit on operator request.
    pub fn clear_hits(&mut self) {
        self.watchpoints.clear_hits();
        info!(session_id = self.session_id, "watchpoint hits cleared");
    }

    /// Move to `TERMINATED`; waiters get `SessionClosed`.
    ///
    /// Heartbeat expiry also releases full tensor buffers.
    pub fn terminate(&mut self, event: SessionEvent, reason: impl Into<String>) {
        if !self.state.is_live() {
            return;
        }
        let reason = reason.into();
        self.fire(event);
        info!(session_id = self.session_id, reason = reason.as_str(), "session terminated");
        if let Some(pending) = self.pending.take() {
            let _ = pending.reply.send(Err(AppError::SessionClosed(format!(
                "session {} terminated: {reason}",
                self.session_id
            ))));
        }
        self.reassembler.clear();
        if event == SessionEvent::HeartbeatExpired {
            self.tensors.release_buffers();
        }
        self.run_target = None;
        self.terminated_reason = Some(reason);
        self.terminated_at = Some(Utc::now());
        self.views_dirty = true;
    }

    fn fire(&mut self, event: SessionEvent) -> bool {
        match self.state.on(event) {
            Transition::Accept(next) => {
                if next != self.state {
                    debug!(session_id = self.session_id, from = ?self.state, to = ?next, "state transition");
                    self.state = next;
                    self.views_dirty = true;
                }
                true
            }
            Transition::Reject => {
                debug!(session_id = self.session_id, state = ?self.state, ?event, "event rejected");
                false
            }
        }
    }

    fn has_device(&self, device_id: &str) -> bool {
        self.devices.iter().any(|d| d.device_id == device_id)
    }

    // ── Views ────────────────────────────────────────────────────────────────

    /// Status summary.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            session_id: self.session_id.clone(),
            state: self.state,
            current_step: self.current_step,
            devices: self.devices.clone(),
            degraded: self.degraded,
            command_pending: self.pending.as_ref().map(|p| p.info.clone()),
            pause_reason: self.pause_reason.clone(),
            terminated_reason: self.terminated_reason.clone(),
            created_at: self.created_at,
            terminated_at: self.terminated_at,
        }
    }

    /// Snapshot for publication, refreshing cache views when a step was
    /// sealed, buffers were evicted, or the state changed.
    pub fn snapshot(&mut self) -> SessionSnapshot {
        if self.views_dirty {
            self.graph_view = self.graphs.view();
            self.tensor_view = self.tensors.view();
            self.views_dirty = false;
        }
        SessionSnapshot {
            status: self.status(),
            graphs: self.graph_view.clone(),
            tensors: self.tensor_view.clone(),
            hits: self.watchpoints.hit_log(),
            watchpoints: self.watchpoints.watchpoints(),
        }
    }
}

fn validate_devices(devices: &[Device]) -> Result<()> {
    if devices.is_empty() {
        return Err(AppError::Protocol("metadata lists no devices".into()));
    }
    let unique: BTreeSet<&str> = devices.iter().map(|d| d.device_id.as_str()).collect();
    if unique.len() != devices.len() {
        return Err(AppError::Protocol("metadata lists a device twice".into()));
    }
    Ok(())
}

fn same_devices(current: &[Device], announced: &[Device]) -> bool {
    let lhs: BTreeSet<(&str, u32)> = current.iter().map(|d| (d.device_id.as_str(), d.rank)).collect();
    let rhs: BTreeSet<(&str, u32)> = announced.iter().map(|d| (d.device_id.as_str(), d.rank)).collect();
    lhs == rhs
}

fn unknown_reference(error: AppError) -> AppError {
    match error {
        AppError::NotFound(msg) => AppError::Protocol(msg),
        other => other,
    }
}
