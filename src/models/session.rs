//! Session state machine and status views.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::command::{CommandId, ControlAction};
use super::graph::NodeKey;
use super::watchpoint::WatchpointHit;
use super::DeviceId;

/// Session identifier.
pub type SessionId = String;

/// Lifecycle state of a debugged run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Connected, no handshake yet.
    WaitingConnect,
    /// Graph and device topology being loaded.
    ReceivingMetadata,
    /// Remote process executing; ingestion and evaluation active.
    Running,
    /// Halted on a watchpoint hit or operator request.
    Paused,
    /// Disconnected or closed; caches read-only.
    Terminated,
}

/// Inputs to the session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// First `Metadata` frame of a connection.
    Handshake,
    /// `Metadata` announcing a new graph version.
    MetadataReload,
    /// Every device named in the metadata has a graph.
    GraphsComplete,
    /// Liveness signal.
    Heartbeat,
    /// Tensor chunk for a known graph.
    TensorData,
    /// `StepEnd`; `hit` is set when any enabled watchpoint hit during the step.
    StepEnd {
        /// Whether the ended step recorded hits.
        hit: bool,
    },
    /// A `step_to` target node finished executing.
    TargetReached,
    /// Remote acknowledged a pause.
    PauseAcked,
    /// Remote acknowledged a continue or step-to.
    ResumeAcked,
    /// Remote acknowledged a terminate.
    TerminateAcked,
    /// Transport closed or failed.
    Disconnected,
    /// No heartbeat within the configured timeout.
    HeartbeatExpired,
    /// Explicit close by the operator or shutdown.
    Closed,
    /// Unrecoverable stream corruption.
    Fatal,
}

/// Outcome of feeding an event to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Event accepted; the session moves to (or stays in) this state.
    Accept(SessionState),
    /// Event rejected; the session stays where it was.
    Reject,
}

impl SessionState {
    /// Total transition function over every `(state, event)` pair.
    #[must_use]
    pub fn on(self, event: SessionEvent) -> Transition {
        use SessionEvent as E;
        use SessionState as S;

        match (self, event) {
            (S::Terminated, _) => Transition::Reject,
            (
                _,
                E::Disconnected | E::HeartbeatExpired | E::Closed | E::Fatal | E::TerminateAcked,
            ) => Transition::Accept(S::Terminated),

            (S::WaitingConnect, E::Handshake) => Transition::Accept(S::ReceivingMetadata),
            (S::WaitingConnect, E::Heartbeat) => Transition::Accept(S::WaitingConnect),
            (S::WaitingConnect, _) => Transition::Reject,

            (S::ReceivingMetadata, E::MetadataReload) => {
                Transition::Accept(S::ReceivingMetadata)
            }
            (S::ReceivingMetadata, E::GraphsComplete) => Transition::Accept(S::Running),
            (S::ReceivingMetadata, E::Heartbeat) => Transition::Accept(S::ReceivingMetadata),
            (S::ReceivingMetadata, _) => Transition::Reject,

            (S::Running | S::Paused, E::MetadataReload) => {
                Transition::Accept(S::ReceivingMetadata)
            }
            (S::Running, E::StepEnd { hit: true } | E::TargetReached | E::PauseAcked) => {
                Transition::Accept(S::Paused)
            }
            (S::Running, E::StepEnd { hit: false } | E::Heartbeat | E::TensorData) => {
                Transition::Accept(S::Running)
            }
            (S::Paused, E::ResumeAcked) => Transition::Accept(S::Running),
            (S::Paused, E::Heartbeat | E::TensorData | E::PauseAcked) => {
                Transition::Accept(S::Paused)
            }
            (S::Running, E::ResumeAcked) => Transition::Accept(S::Running),
            (S::Running | S::Paused, E::Handshake | E::GraphsComplete)
            | (S::Paused, E::StepEnd { .. } | E::TargetReached) => Transition::Reject,
        }
    }

    /// Whether the session can still change.
    #[must_use]
    pub fn is_live(self) -> bool {
        self != Self::Terminated
    }
}

/// A compute unit participating in the run. Immutable after handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Device {
    /// Device identifier.
    pub device_id: DeviceId,
    /// Rank within the distributed job.
    pub rank: u32,
}

/// Why the session is paused.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum PauseReason {
    /// Watchpoints fired during the step that just ended; all hits listed.
    WatchpointHit {
        /// Every hit of the ended step.
        hits: Vec<WatchpointHit>,
    },
    /// Operator pause.
    Requested,
    /// A `step_to` target executed.
    ReachedNode {
        /// Target that executed.
        node: NodeKey,
    },
}

/// Control command awaiting acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingCommandInfo {
    /// Outbound command identifier.
    pub command_id: CommandId,
    /// Short description of the command.
    pub description: String,
    /// Control action, when the command is a run-control command.
    pub action: Option<ControlAction>,
}

/// Dashboard view of one session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionStatus {
    /// Session identifier.
    pub session_id: SessionId,
    /// Current state.
    pub state: SessionState,
    /// Highest step observed.
    pub current_step: u64,
    /// Devices announced at handshake.
    pub devices: Vec<Device>,
    /// Set after a command timeout until the next heartbeat reconciles.
    pub degraded: bool,
    /// Command awaiting acknowledgement, if any.
    pub command_pending: Option<PendingCommandInfo>,
    /// Why the session is paused, when it is.
    pub pause_reason: Option<PauseReason>,
    /// Why the session terminated, when it did.
    pub terminated_reason: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Termination time.
    pub terminated_at: Option<DateTime<Utc>>,
}
