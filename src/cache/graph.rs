//! Per-device graph storage and per-step execution history.
//!
//! Graph versions are immutable once loaded and shared through `Arc`, so a
//! published [`GraphView`] stays valid while the worker loads newer versions.
//! History is keyed by step; each step remembers the graph versions that were
//! active when its entries were recorded.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::models::graph::{
    GraphNode, GraphSnapshot, GraphVersion, GraphVersionId, HistoryEntry, NodeDef, NodeKey,
};
use crate::models::DeviceId;
use crate::{AppError, Result};

/// Realised execution order of one step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepHistory {
    entries: Vec<HistoryEntry>,
    seen: HashSet<NodeKey>,
    versions: BTreeMap<DeviceId, Arc<GraphVersion>>,
}

impl StepHistory {
    /// Entries in execution order.
    #[must_use]
    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    /// Graph version active on `device` when this step recorded it.
    #[must_use]
    pub fn version_for(&self, device: &str) -> Option<&Arc<GraphVersion>> {
        self.versions.get(device)
    }
}

/// Read-only view of the graph cache, cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct GraphView {
    graphs: BTreeMap<DeviceId, Arc<GraphVersion>>,
    history: BTreeMap<u64, Arc<StepHistory>>,
}

impl GraphView {
    /// Current graph for `device`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no graph is loaded for `device`.
    pub fn graph(&self, device: &str) -> Result<Arc<GraphVersion>> {
        self.graphs
            .get(device)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("no graph for device {device}")))
    }

    /// Serializable snapshot of `device`'s graph.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no graph is loaded for `device`.
    pub fn snapshot(&self, device: &str) -> Result<GraphSnapshot> {
        self.graph(device).map(|version| version.to_snapshot())
    }

    /// Execution history of `step`; empty when nothing ran.
    #[must_use]
    pub fn history(&self, step: u64) -> Vec<HistoryEntry> {
        self.history
            .get(&step)
            .map(|h| h.entries.clone())
            .unwrap_or_default()
    }

    /// Resolve the single device holding `name`.
    ///
    /// # Errors
    ///
    /// - `AppError::NotFound` if no device holds the node.
    /// - `AppError::Protocol` if several devices hold it.
    pub fn resolve_device(&self, name: &str) -> Result<DeviceId> {
        let mut holders = self
            .graphs
            .iter()
            .filter(|(_, version)| version.contains(name))
            .map(|(device, _)| device);
        match (holders.next(), holders.next()) {
            (Some(device), None) => Ok(device.clone()),
            (None, _) => Err(AppError::NotFound(format!("node {name} not found"))),
            (Some(_), Some(_)) => Err(AppError::Protocol(format!(
                "node {name} is ambiguous across devices"
            ))),
        }
    }

    /// Devices with a loaded graph.
    pub fn devices(&self) -> impl Iterator<Item = &DeviceId> {
        self.graphs.keys()
    }
}

/// Graph cache owned by one session worker.
#[derive(Debug, Default)]
pub struct GraphCache {
    view: GraphView,
    next_version: GraphVersionId,
}

impl GraphCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a full or incremental graph definition for `device`.
    ///
    /// An incremental load merges `nodes` into the current version (a node
    /// with an existing name replaces it). Either way a new version is created.
    pub fn load_graph(
        &mut self,
        device: &str,
        nodes: Vec<NodeDef>,
        incremental: bool,
        remote_version: u64,
    ) -> Arc<GraphVersion> {
        self.next_version += 1;
        let fresh = nodes
            .into_iter()
            .map(|def| Arc::new(GraphNode::from_def(device, def)));
        let merged: Vec<Arc<GraphNode>> = match self.view.graphs.get(device) {
            Some(current) if incremental => {
                current.nodes().iter().cloned().chain(fresh).collect()
            }
            _ => fresh.collect(),
        };
        let version = Arc::new(GraphVersion::new(
            self.next_version,
            device.to_owned(),
            remote_version,
            merged,
        ));
        self.view
            .graphs
            .insert(device.to_owned(), Arc::clone(&version));
        version
    }

    /// Current graph version of `device`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no graph is loaded for `device`.
    pub fn graph(&self, device: &str) -> Result<Arc<GraphVersion>> {
        self.view.graph(device)
    }

    /// Look up a node on a device.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the device or node is unknown.
    pub fn get_node(&self, device: &str, name: &str) -> Result<Arc<GraphNode>> {
        self.view
            .graph(device)?
            .node(name)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("node {name} not found on {device}")))
    }

    /// Resolve the single device holding `name`.
    ///
    /// # Errors
    ///
    /// See [`GraphView::resolve_device`].
    pub fn resolve_device(&self, name: &str) -> Result<DeviceId> {
        self.view.resolve_device(name)
    }

    /// Record that `node` executed during `step`.
    ///
    /// Returns `false` when the node was already recorded for the step.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the node is absent from its device's
    /// current graph.
    pub fn record_executed(&mut self, step: u64, node: NodeKey) -> Result<bool> {
        let version = self.view.graphs.get(&node.device).cloned().ok_or_else(|| {
            AppError::Protocol(format!("no graph for device {}", node.device))
        })?;
        if !version.contains(&node.name) {
            return Err(AppError::Protocol(format!(
                "node {} absent from graph version {}",
                node, version.id
            )));
        }

        let history = Arc::make_mut(self.view.history.entry(step).or_default());
        if history.seen.contains(&node) {
            return Ok(false);
        }
        history
            .versions
            .entry(node.device.clone())
            .or_insert_with(|| Arc::clone(&version));
        history.seen.insert(node.clone());
        history.entries.push(HistoryEntry {
            node,
            version: version.id,
        });
        Ok(true)
    }

    /// Node names executed in `step`, in execution order.
    #[must_use]
    pub fn history_for(&self, step: u64) -> Vec<NodeKey> {
        self.view
            .history
            .get(&step)
            .map(|h| h.entries.iter().map(|e| e.node.clone()).collect())
            .unwrap_or_default()
    }

    /// Last node executed in `step`.
    #[must_use]
    pub fn last_executed(&self, step: u64) -> Option<NodeKey> {
        self.view
            .history
            .get(&step)
            .and_then(|h| h.entries.last())
            .map(|e| e.node.clone())
    }

    /// Node executed after `node` in `step`.
    ///
    /// Falls back to graph declaration order on `node`'s device when the
    /// history has no successor. Returns `Ok(None)` when `node` is last.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if `node` is not in its device's graph.
    pub fn next_node_after(&self, step: u64, node: &NodeKey) -> Result<Option<Arc<GraphNode>>> {
        let version = self.view.graph(&node.device)?;
        let position = version.position(&node.name).ok_or_else(|| {
            AppError::NotFound(format!("node {} not found on {}", node.name, node.device))
        })?;

        if let Some(history) = self.view.history.get(&step) {
            let successor = history
                .entries
                .iter()
                .skip_while(|entry| entry.node != *node)
                .nth(1);
            if let Some(entry) = successor {
                if let Ok(found) = self.get_node(&entry.node.device, &entry.node.name) {
                    return Ok(Some(found));
                }
            }
        }

        Ok(version.nodes().get(position + 1).cloned())
    }

    /// Drop history of steps below `step`.
    pub fn prune_history_before(&mut self, step: u64) {
        self.view.history = self.view.history.split_off(&step);
    }

    /// Read-only view for publication.
    #[must_use]
    pub fn view(&self) -> GraphView {
        self.view.clone()
    }
}
