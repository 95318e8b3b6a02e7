//! Wire frames exchanged with the training process.
//!
//! Every frame is one JSON object per line, discriminated by `type`.
//!
//! | Direction | `type`            | Payload                                           |
//! |-----------|-------------------|---------------------------------------------------|
//! | inbound   | `heartbeat`       | `step`, `device_id`                               |
//! | inbound   | `metadata`        | `devices[]`, `graph_version`, `reconnect_token?`  |
//! | inbound   | `graph_def`       | `device_id`, `nodes[]`, `incremental?`            |
//! | inbound   | `tensor_chunk`    | `node`, `output_index`, `step`, `seq`, ...        |
//! | inbound   | `step_end`        | `step`                                            |
//! | inbound   | `command_ack`     | `command_id`, `status`, `message?`                |
//! | outbound  | `welcome`         | `session_id`, `reconnect_token`                   |
//! | outbound  | `control_command` | `command_id`, `action`                            |
//! | outbound  | `watchpoint_set`  | `id`, `patterns[]`, `condition`, `enabled`        |
//! | outbound  | `watchpoint_clear`| `id`                                              |

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::models::command::{AckStatus, CommandId, ControlAction};
use crate::models::graph::NodeDef;
use crate::models::session::Device;
use crate::models::tensor::DType;
use crate::models::watchpoint::{Condition, Watchpoint, WatchpointId};
use crate::models::DeviceId;
use crate::{AppError, Result};

/// One piece of a tensor payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TensorChunk {
    /// Device holding the node; resolved from the graphs when absent.
    #[serde(default)]
    pub device_id: Option<DeviceId>,
    /// Producing node's local name.
    pub node: String,
    /// Output slot.
    pub output_index: u32,
    /// Training step.
    pub step: u64,
    /// Zero-based chunk sequence number.
    pub seq: u32,
    /// Total chunks of this tensor.
    pub total_seqs: u32,
    /// Element type.
    pub dtype: DType,
    /// Full tensor shape.
    #[serde(default)]
    pub shape: Vec<u64>,
    /// Little-endian element bytes of this chunk.
    #[serde(with = "crate::models::base64_bytes")]
    pub bytes: Bytes,
}

/// Frame sent by the training process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    /// Liveness and implicit step advance.
    Heartbeat {
        /// Step the device is executing.
        step: u64,
        /// Reporting device.
        device_id: DeviceId,
    },
    /// Device topology, sent once per graph (re)load.
    Metadata {
        /// Participating devices.
        devices: Vec<Device>,
        /// Remote graph version label.
        graph_version: u64,
        /// Token of a previous session whose watchpoints should carry over.
        #[serde(default)]
        reconnect_token: Option<String>,
    },
    /// Graph definition for one device.
    GraphDef {
        /// Owning device.
        device_id: DeviceId,
        /// Node definitions in declaration order.
        nodes: Vec<NodeDef>,
        /// Merge into the current version instead of replacing it.
        #[serde(default)]
        incremental: bool,
    },
    /// Piece of a tensor value.
    TensorChunk(TensorChunk),
    /// All tensors of `step` have been emitted.
    StepEnd {
        /// Completed step.
        step: u64,
    },
    /// Acknowledgement of an outbound command.
    CommandAck {
        /// Acknowledged command.
        command_id: CommandId,
        /// Outcome reported by the remote.
        status: AckStatus,
        /// Optional detail, typically the rejection reason.
        #[serde(default)]
        message: Option<String>,
    },
}

impl InboundFrame {
    /// Frame type name for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Heartbeat { .. } => "heartbeat",
            Self::Metadata { .. } => "metadata",
            Self::GraphDef { .. } => "graph_def",
            Self::TensorChunk(_) => "tensor_chunk",
            Self::StepEnd { .. } => "step_end",
            Self::CommandAck { .. } => "command_ack",
        }
    }
}

/// Frame sent to the training process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    /// Handshake reply.
    Welcome {
        /// Assigned session.
        session_id: String,
        /// Token to present when reconnecting.
        reconnect_token: String,
    },
    /// Run-control command.
    ControlCommand {
        /// Correlation id echoed by `CommandAck`.
        command_id: CommandId,
        /// Requested action.
        #[serde(flatten)]
        action: ControlAction,
    },
    /// Install or update a watchpoint on the remote side.
    WatchpointSet {
        /// Correlation id when an operator command is waiting on this frame.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command_id: Option<CommandId>,
        /// Watchpoint id.
        id: WatchpointId,
        /// Node-name patterns.
        patterns: Vec<String>,
        /// Condition.
        condition: Condition,
        /// Enabled flag.
        enabled: bool,
    },
    /// Remove a watchpoint on the remote side.
    WatchpointClear {
        /// Correlation id when an operator command is waiting on this frame.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command_id: Option<CommandId>,
        /// Watchpoint id.
        id: WatchpointId,
    },
}

impl OutboundFrame {
    /// `WatchpointSet` mirroring `watchpoint`.
    #[must_use]
    pub fn watchpoint_set(command_id: Option<CommandId>, watchpoint: &Watchpoint) -> Self {
        Self::WatchpointSet {
            command_id,
            id: watchpoint.id,
            patterns: watchpoint.patterns.clone(),
            condition: watchpoint.condition.clone(),
            enabled: watchpoint.enabled,
        }
    }

    /// Serialise to a single JSON line without the trailing newline.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if serialisation fails.
    pub fn to_line(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| AppError::Protocol(format!("failed to serialise outbound frame: {e}")))
    }
}

/// Parse one NDJSON line.
///
/// Returns `Ok(None)` for blank lines.
///
/// # Errors
///
/// Returns `AppError::Protocol` when the line is not a valid frame.
pub fn parse_inbound_line(line: &str) -> Result<Option<InboundFrame>> {
    if line.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(line)
        .map(Some)
        .map_err(|e| AppError::Protocol(format!("malformed frame: {e}")))
}
