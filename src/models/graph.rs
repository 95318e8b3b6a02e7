//! Computation graph model: nodes, tensor specs, and graph versions.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::tensor::DType;
use super::DeviceId;

/// Monotonic per-device graph version assigned by the graph cache.
pub type GraphVersionId = u64;

/// Enumerated node category.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Trainable weight.
    Parameter,
    /// Constant value baked into the graph.
    Constant,
    /// Graph input (dataset batch, labels).
    Input,
    /// Gradient produced by the backward pass.
    Gradient,
    /// Any other computation.
    Operator,
}

/// Name, dtype, and shape of a tensor flowing along a graph edge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TensorSpec {
    /// Tensor name (`<node>:<slot>` for outputs, producer reference for inputs).
    pub name: String,
    /// Element type.
    pub dtype: DType,
    /// Dimensions; empty for scalars.
    #[serde(default)]
    pub shape: Vec<u64>,
}

/// Wire form of a node inside a `GraphDef` frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeDef {
    /// Scoped hierarchical name (`/`-separated).
    pub name: String,
    /// Node category.
    pub kind: NodeKind,
    /// Operator type string reported by the framework (`Conv2D`, `MatMul`, ...).
    pub op_type: String,
    /// Consumed tensors.
    #[serde(default)]
    pub inputs: Vec<TensorSpec>,
    /// Produced tensors, indexed by output slot.
    #[serde(default)]
    pub outputs: Vec<TensorSpec>,
}

/// A node of a loaded graph version. Never mutated after load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GraphNode {
    /// Scoped hierarchical name, unique within its device.
    pub name: String,
    /// Node category.
    pub kind: NodeKind,
    /// Operator type string.
    pub op_type: String,
    /// Consumed tensors.
    pub inputs: Vec<TensorSpec>,
    /// Produced tensors.
    pub outputs: Vec<TensorSpec>,
    /// Device holding this node.
    pub device: DeviceId,
}

impl GraphNode {
    /// Bind a wire definition to its device.
    #[must_use]
    pub fn from_def(device: &str, def: NodeDef) -> Self {
        Self {
            name: def.name,
            kind: def.kind,
            op_type: def.op_type,
            inputs: def.inputs,
            outputs: def.outputs,
            device: device.to_owned(),
        }
    }

    /// Enclosing scope of the node (`a/b/c` → `a/b`).
    #[must_use]
    pub fn scope(&self) -> Option<&str> {
        self.name.rsplit_once('/').map(|(scope, _)| scope)
    }
}

/// Immutable snapshot of one device's graph at one version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphVersion {
    /// Version identifier, increasing per device.
    pub id: GraphVersionId,
    /// Owning device.
    pub device: DeviceId,
    /// Remote-side graph version label from the `Metadata` frame.
    pub remote_version: u64,
    nodes: Vec<Arc<GraphNode>>,
    index: HashMap<String, usize>,
}

impl GraphVersion {
    /// Build a version from nodes in declaration order.
    ///
    /// Later duplicates of a name replace earlier ones in place.
    #[must_use]
    pub fn new(
        id: GraphVersionId,
        device: DeviceId,
        remote_version: u64,
        nodes: impl IntoIterator<Item = Arc<GraphNode>>,
    ) -> Self {
        let mut ordered: Vec<Arc<GraphNode>> = Vec::new();
        let mut index = HashMap::new();
        for node in nodes {
            if let Some(&pos) = index.get(&node.name) {
                ordered[pos] = node;
            } else {
                index.insert(node.name.clone(), ordered.len());
                ordered.push(node);
            }
        }
        Self {
            id,
            device,
            remote_version,
            nodes: ordered,
            index,
        }
    }

    /// Look up a node by local name.
    #[must_use]
    pub fn node(&self, name: &str) -> Option<&Arc<GraphNode>> {
        self.index.get(name).map(|&pos| &self.nodes[pos])
    }

    /// Whether the version contains `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Nodes in declaration order.
    #[must_use]
    pub fn nodes(&self) -> &[Arc<GraphNode>] {
        &self.nodes
    }

    /// Declaration position of `name`.
    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Serializable view for the dashboard.
    #[must_use]
    pub fn to_snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            device: self.device.clone(),
            version: self.id,
            remote_version: self.remote_version,
            nodes: self.nodes.iter().map(|node| (**node).clone()).collect(),
        }
    }
}

/// Serializable graph view returned by `get_graph`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GraphSnapshot {
    /// Device the graph belongs to.
    pub device: DeviceId,
    /// Local version identifier.
    pub version: GraphVersionId,
    /// Remote-side version label.
    pub remote_version: u64,
    /// Nodes in declaration order.
    pub nodes: Vec<GraphNode>,
}

/// Device-qualified node identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey {
    /// Device holding the node.
    pub device: DeviceId,
    /// Device-local node name.
    pub name: String,
}

impl NodeKey {
    /// Construct a key.
    #[must_use]
    pub fn new(device: impl Into<DeviceId>, name: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for NodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.device, self.name)
    }
}

/// One executed node in a step's history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    /// Node that ran.
    pub node: NodeKey,
    /// Graph version active on the node's device when it ran.
    pub version: GraphVersionId,
}
