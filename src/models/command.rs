//! Operator commands and their outbound control actions.

use serde::{Deserialize, Serialize};

use super::watchpoint::{Condition, WatchpointId};
use super::DeviceId;

/// Identifier correlating an outbound command with its acknowledgement.
pub type CommandId = u64;

/// Run-control action sent to the training process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlAction {
    /// Resume execution.
    Continue,
    /// Halt at the next opportunity.
    Pause,
    /// Resume and halt once `node` has executed.
    StepTo {
        /// Device of the target node.
        device_id: DeviceId,
        /// Device-local target node name.
        node: String,
    },
    /// Stop training and disconnect.
    Terminate,
}

/// Operator command accepted by `issue_command`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Resume a paused run.
    Continue,
    /// Pause a running run.
    Pause,
    /// Run until the node after `node` executes.
    ///
    /// When `node` is omitted the last node executed in the current step is used.
    StepToNextNode {
        /// Reference node.
        #[serde(default)]
        node: Option<String>,
        /// Device of the reference node; inferred when unambiguous.
        #[serde(default)]
        device_id: Option<DeviceId>,
    },
    /// Register a watchpoint.
    SetWatchpoint {
        /// Glob patterns over node names.
        patterns: Vec<String>,
        /// Condition to evaluate.
        condition: Condition,
        /// Initial enabled flag.
        #[serde(default = "default_true")]
        enabled: bool,
    },
    /// Remove a watchpoint.
    RemoveWatchpoint {
        /// Watchpoint to remove.
        id: WatchpointId,
    },
    /// Enable or disable a watchpoint.
    ToggleWatchpoint {
        /// Watchpoint to toggle.
        id: WatchpointId,
        /// New enabled flag.
        enabled: bool,
    },
    /// Terminate the training process; the only command accepted while metadata loads.
    Terminate,
}

fn default_true() -> bool {
    true
}

impl Command {
    /// Short label for logs and status views.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::Pause => "pause",
            Self::StepToNextNode { .. } => "step_to_next_node",
            Self::SetWatchpoint { .. } => "set_watchpoint",
            Self::RemoveWatchpoint { .. } => "remove_watchpoint",
            Self::ToggleWatchpoint { .. } => "toggle_watchpoint",
            Self::Terminate => "terminate",
        }
    }
}

/// Acknowledgement status reported by the training process.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    /// Command applied.
    Ok,
    /// Command refused.
    Rejected,
}

/// Successful result of an acknowledged command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandOutcome {
    /// Outbound command identifier.
    pub command_id: CommandId,
    /// Watchpoint created by `SetWatchpoint`.
    pub watchpoint_id: Option<WatchpointId>,
}
