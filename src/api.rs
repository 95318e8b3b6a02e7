//! Local polling API consumed by dashboards and `tensorwatch-ctl`.
//!
//! Reads are served from the session's latest published snapshot and never
//! wait on its worker. Commands wait for acknowledgement.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cache::graph::GraphView;
use crate::cache::tensor::TensorLookup;
use crate::models::command::{Command, CommandOutcome};
use crate::models::graph::{GraphSnapshot, HistoryEntry};
use crate::models::session::{SessionState, SessionStatus};
use crate::models::tensor::{diff_statistics, DType, Statistics, TensorKey, TensorRecord};
use crate::models::watchpoint::{Watchpoint, WatchpointHit};
use crate::models::DeviceId;
use crate::orchestrator::session_manager::SessionManager;
use crate::{AppError, Result};

/// Address of one tensor record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TensorQuery {
    /// Device holding the node; resolved from the graphs when absent.
    #[serde(default)]
    pub device: Option<DeviceId>,
    /// Device-local node name.
    pub node: String,
    /// Output slot.
    #[serde(default)]
    pub output_index: u32,
    /// Training step.
    pub step: u64,
}

/// A tensor as the dashboard sees it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "availability", rename_all = "snake_case")]
pub enum TensorView {
    /// Full record including its buffer.
    Full {
        /// The record.
        record: TensorRecord,
    },
    /// Buffer reclaimed under memory pressure; only statistics remain.
    PartiallyEvicted {
        /// Record identity.
        key: TensorKey,
        /// Element type.
        dtype: DType,
        /// Dimensions.
        shape: Vec<u64>,
        /// Pre-eviction statistics.
        statistics: Statistics,
    },
}

impl TensorView {
    /// Statistics of the tensor, whichever form it is in.
    #[must_use]
    pub fn statistics(&self) -> &Statistics {
        match self {
            Self::Full { record } => &record.statistics,
            Self::PartiallyEvicted { statistics, .. } => statistics,
        }
    }
}

impl From<TensorLookup> for TensorView {
    fn from(lookup: TensorLookup) -> Self {
        match lookup {
            TensorLookup::Full(record) => Self::Full {
                record: (*record).clone(),
            },
            TensorLookup::PartiallyEvicted(record) => Self::PartiallyEvicted {
                key: record.key.clone(),
                dtype: record.dtype,
                shape: record.shape.clone(),
                statistics: record.statistics,
            },
        }
    }
}

/// Graph of `device` in `session`.
///
/// # Errors
///
/// Returns `AppError::NotFound` for an unknown session or device.
pub fn get_graph(manager: &SessionManager, session: &str, device: &str) -> Result<GraphSnapshot> {
    manager.get(session)?.snapshot().graphs.snapshot(device)
}

/// Tensor record, distinguishing evicted buffers from missing records.
///
/// # Errors
///
/// - `AppError::NotFound` for an unknown session or record.
/// - `AppError::Protocol` when the node name is ambiguous across devices.
pub fn get_tensor(manager: &SessionManager, session: &str, query: &TensorQuery) -> Result<TensorView> {
    let snapshot = manager.get(session)?.snapshot();
    let key = resolve_key(&snapshot.graphs, query)?;
    snapshot.tensors.get(&key).map(TensorView::from)
}

/// Statistics of a tensor record; available after eviction.
///
/// # Errors
///
/// See [`get_tensor`].
pub fn get_tensor_stats(
    manager: &SessionManager,
    session: &str,
    query: &TensorQuery,
) -> Result<Statistics> {
    let snapshot = manager.get(session)?.snapshot();
    let key = resolve_key(&snapshot.graphs, query)?;
    snapshot.tensors.get_stats(&key)
}

/// A tensor compared with the same output at its previous cached step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TensorComparison {
    /// Record compared.
    pub key: TensorKey,
    /// Step of the record it was compared against.
    pub previous_step: u64,
    /// Fraction of the largest difference treated as zero.
    pub tolerance: f64,
    /// Statistics of the compared record.
    pub current: Statistics,
    /// Statistics of the previous record.
    pub previous: Statistics,
    /// Statistics of `current - previous` after applying the tolerance.
    pub diff: Statistics,
}

/// Compare a tensor of the paused run with the same output at the latest
/// earlier cached step.
///
/// Both records need their full buffers; the two most recent steps always
/// keep them.
///
/// # Errors
///
/// - `AppError::NotFound` for an unknown session or record, when no
///   earlier record exists, or when either buffer was evicted.
/// - `AppError::InvalidState` unless the session is paused.
/// - `AppError::InvalidParam` for mismatched dtype or shape, or a tolerance
///   outside `[0, 1]`.
pub fn compare_tensor(
    manager: &SessionManager,
    session: &str,
    query: &TensorQuery,
    tolerance: f64,
) -> Result<TensorComparison> {
    let snapshot = manager.get(session)?.snapshot();
    if snapshot.status.state != SessionState::Paused {
        return Err(AppError::InvalidState(format!(
            "tensors can be compared only while paused, session is {:?}",
            snapshot.status.state
        )));
    }
    let key = resolve_key(&snapshot.graphs, query)?;
    let current = Arc::clone(snapshot.tensors.get(&key)?.record());
    let previous = snapshot
        .tensors
        .previous(&key)
        .cloned()
        .ok_or_else(|| AppError::NotFound(format!("no earlier record of {key}")))?;
    if current.dtype != previous.dtype || current.shape != previous.shape {
        return Err(AppError::InvalidParam(format!(
            "{key} changed from {:?}{:?} to {:?}{:?}",
            previous.dtype, previous.shape, current.dtype, current.shape
        )));
    }
    let evicted = |record: &TensorRecord| AppError::NotFound(format!("buffer of {} was evicted", record.key));
    let current_bytes = current.buffer.as_ref().ok_or_else(|| evicted(&current))?;
    let previous_bytes = previous.buffer.as_ref().ok_or_else(|| evicted(&previous))?;
    let diff = diff_statistics(current.dtype, current_bytes, previous_bytes, tolerance)?;
    Ok(TensorComparison {
        key,
        previous_step: previous.key.step,
        tolerance,
        current: current.statistics,
        previous: previous.statistics,
        diff,
    })
}

fn resolve_key(graphs: &GraphView, query: &TensorQuery) -> Result<TensorKey> {
    let device = match &query.device {
        Some(device) => device.clone(),
        None => graphs.resolve_device(&query.node)?,
    };
    Ok(TensorKey {
        device,
        node: query.node.clone(),
        output_index: query.output_index,
        step: query.step,
    })
}

/// Committed hits of `step`, or of every retained step when `None`.
///
/// # Errors
///
/// Returns `AppError::NotFound` for an unknown session.
pub fn list_hits(manager: &SessionManager, session: &str, step: Option<u64>) -> Result<Vec<WatchpointHit>> {
    let snapshot = manager.get(session)?.snapshot();
    let hits = match step {
        Some(step) => snapshot
            .hits
            .get(&step)
            .map(|log| log.as_ref().clone())
            .unwrap_or_default(),
        None => snapshot
            .hits
            .values()
            .flat_map(|log| log.iter().cloned())
            .collect(),
    };
    Ok(hits)
}

/// Registered watchpoints.
///
/// # Errors
///
/// Returns `AppError::NotFound` for an unknown session.
pub fn list_watchpoints(manager: &SessionManager, session: &str) -> Result<Vec<Watchpoint>> {
    Ok(manager.get(session)?.snapshot().watchpoints.clone())
}

/// Realised execution order of `step`.
///
/// # Errors
///
/// Returns `AppError::NotFound` for an unknown session.
pub fn get_history(manager: &SessionManager, session: &str, step: u64) -> Result<Vec<HistoryEntry>> {
    Ok(manager.get(session)?.snapshot().graphs.history(step))
}

/// Issue a command and wait for its resolution.
///
/// # Errors
///
/// Returns the command's typed failure; see
/// [`SessionHandle::issue`](crate::orchestrator::control::SessionHandle::issue).
pub async fn issue_command(
    manager: &SessionManager,
    session: &str,
    command: Command,
) -> Result<CommandOutcome> {
    manager.get(session)?.issue(command).await
}

/// Re-evaluate every watchpoint against the paused step's tensors.
///
/// # Errors
///
/// See [`SessionHandle::recheck`](crate::orchestrator::control::SessionHandle::recheck);
/// `AppError::NotFound` for an unknown session.
pub async fn recheck(manager: &SessionManager, session: &str) -> Result<Vec<WatchpointHit>> {
    manager.get(session)?.recheck().await
}

/// Drop every recorded hit of a session.
///
/// # Errors
///
/// `AppError::NotFound` for an unknown session, `AppError::SessionClosed`
/// once it terminated.
pub async fn clear_hits(manager: &SessionManager, session: &str) -> Result<()> {
    manager.get(session)?.clear_hits().await
}

/// Status of one session.
///
/// # Errors
///
/// Returns `AppError::NotFound` for an unknown session.
pub fn session_status(manager: &SessionManager, session: &str) -> Result<SessionStatus> {
    Ok(manager.get(session)?.status())
}

/// Status of every session.
#[must_use]
pub fn list_sessions(manager: &SessionManager) -> Vec<SessionStatus> {
    manager.list()
}

/// Close a session and remove it immediately.
///
/// # Errors
///
/// Returns `AppError::NotFound` for an unknown session.
pub fn close_session(manager: &SessionManager, session: &str) -> Result<()> {
    manager.close_session(session)
}
