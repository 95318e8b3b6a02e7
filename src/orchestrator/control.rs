//! Control Operator: the caller-facing handle of one session.
//!
//! Each operation sends exactly one request to the session worker and waits
//! for its resolution. Waiting blocks only the issuing caller; the worker
//! keeps draining the stream while a command is outstanding.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::models::command::{Command, CommandOutcome};
use crate::models::session::{SessionId, SessionStatus};
use crate::models::watchpoint::{Condition, WatchpointHit, WatchpointId};
use crate::models::DeviceId;
use crate::orchestrator::session::SessionSnapshot;
use crate::orchestrator::worker::ControlRequest;
use crate::{AppError, Result};

/// Shared handle to a running (or terminated, not yet collected) session.
#[derive(Debug)]
pub struct SessionHandle {
    session_id: SessionId,
    reconnect_token: String,
    snapshot: Arc<ArcSwap<SessionSnapshot>>,
    control_tx: mpsc::Sender<ControlRequest>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SessionHandle {
    pub(crate) fn new(
        session_id: SessionId,
        reconnect_token: String,
        snapshot: Arc<ArcSwap<SessionSnapshot>>,
        control_tx: mpsc::Sender<ControlRequest>,
        cancel: CancellationToken,
        worker: JoinHandle<()>,
    ) -> Self {
        Self {
            session_id,
            reconnect_token,
            snapshot,
            control_tx,
            cancel,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Session identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.session_id
    }

    /// Token a reconnecting process presents to inherit watchpoints.
    #[must_use]
    pub fn reconnect_token(&self) -> &str {
        &self.reconnect_token
    }

    /// Latest published snapshot. Never blocks the worker.
    #[must_use]
    pub fn snapshot(&self) -> Arc<SessionSnapshot> {
        self.snapshot.load_full()
    }

    /// Latest published status.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.snapshot.load().status.clone()
    }

    /// Issue one command and wait until it is acknowledged, rejected, or
    /// times out.
    ///
    /// # Errors
    ///
    /// - `AppError::CommandInProgress` if another command is outstanding.
    /// - `AppError::InvalidState` if the session state does not accept it.
    /// - `AppError::CommandTimeout` / `AppError::CommandRejected` from the
    ///   remote side.
    /// - `AppError::SessionClosed` if the session is (or becomes) terminated.
    pub async fn issue(&self, command: Command) -> Result<CommandOutcome> {
        let label = command.label();
        let (reply, outcome) = oneshot::channel();
        self.control_tx
            .send(ControlRequest::Issue { command, reply })
            .await
            .map_err(|_| self.closed())?;
        let result = outcome.await.map_err(|_| self.closed())?;
        debug!(session_id = self.session_id, command = label, ok = result.is_ok(), "command resolved");
        result
    }

    /// Resume a paused run.
    ///
    /// # Errors
    ///
    /// See [`issue`](Self::issue).
    pub async fn continue_(&self) -> Result<()> {
        self.issue(Command::Continue).await.map(|_| ())
    }

    /// Pause a running process.
    ///
    /// # Errors
    ///
    /// See [`issue`](Self::issue).
    pub async fn pause(&self) -> Result<()> {
        self.issue(Command::Pause).await.map(|_| ())
    }

    /// Run until the node after `node` (or after the last executed node)
    /// has produced its output, then pause.
    ///
    /// # Errors
    ///
    /// See [`issue`](Self::issue). `AppError::InvalidParam` when no reference
    /// node can be resolved.
    pub async fn step_to_next_node(
        &self,
        node: Option<String>,
        device_id: Option<DeviceId>,
    ) -> Result<()> {
        self.issue(Command::StepToNextNode { node, device_id })
            .await
            .map(|_| ())
    }

    /// Register a watchpoint; returns its id once the remote has it.
    ///
    /// # Errors
    ///
    /// See [`issue`](Self::issue). `AppError::LimitExceeded` when the session
    /// is full, `AppError::InvalidParam` for bad patterns or conditions.
    pub async fn set_watchpoint(
        &self,
        patterns: Vec<String>,
        condition: Condition,
        enabled: bool,
    ) -> Result<WatchpointId> {
        let outcome = self
            .issue(Command::SetWatchpoint {
                patterns,
                condition,
                enabled,
            })
            .await?;
        outcome
            .watchpoint_id
            .ok_or_else(|| AppError::Protocol("watchpoint id missing from outcome".into()))
    }

    /// Remove a watchpoint.
    ///
    /// # Errors
    ///
    /// See [`issue`](Self::issue). `AppError::NotFound` for an unknown id.
    pub async fn remove_watchpoint(&self, id: WatchpointId) -> Result<()> {
        self.issue(Command::RemoveWatchpoint { id }).await.map(|_| ())
    }

    /// Enable or disable a watchpoint.
    ///
    /// # Errors
    ///
    /// See [`issue`](Self::issue). `AppError::NotFound` for an unknown id.
    pub async fn toggle_watchpoint(&self, id: WatchpointId, enabled: bool) -> Result<()> {
        self.issue(Command::ToggleWatchpoint { id, enabled })
            .await
            .map(|_| ())
    }

    /// Ask the training process to stop.
    ///
    /// # Errors
    ///
    /// See [`issue`](Self::issue).
    pub async fn terminate(&self) -> Result<()> {
        self.issue(Command::Terminate).await.map(|_| ())
    }

    /// Re-evaluate every watchpoint against the tensors of the paused step.
    ///
    /// Returns the step's hits after the recheck.
    ///
    /// # Errors
    ///
    /// - `AppError::InvalidState` unless the session is paused.
    /// - `AppError::CommandInProgress` while a command awaits acknowledgement.
    /// - `AppError::SessionClosed` if the worker has exited.
    pub async fn recheck(&self) -> Result<Vec<WatchpointHit>> {
        let (reply, done) = oneshot::channel();
        self.control_tx
            .send(ControlRequest::Recheck { reply })
            .await
            .map_err(|_| self.closed())?;
        done.await.map_err(|_| self.closed())?
    }

    /// Drop every recorded watchpoint hit.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionClosed` if the worker has exited.
    pub async fn clear_hits(&self) -> Result<()> {
        let (reply, done) = oneshot::channel();
        self.control_tx
            .send(ControlRequest::ClearHits { reply })
            .await
            .map_err(|_| self.closed())?;
        done.await.map_err(|_| self.closed())
    }

    /// Cancel the session's tasks. Outstanding waiters fail with
    /// `SessionClosed`.
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            info!(session_id = self.session_id, "closing session");
            self.cancel.cancel();
        }
    }

    /// Wait for the worker to exit.
    pub async fn join(&self) {
        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }

    fn closed(&self) -> AppError {
        AppError::SessionClosed(format!("session {} is closed", self.session_id))
    }
}
