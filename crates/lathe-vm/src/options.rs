use lathe_core::Device;
use lathe_graph::NodeId;
use serde::{Deserialize, Serialize};

/// Tape machine knobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmOptions {
    /// Devices to hold contexts for in addition to the ones the program uses.
    pub devices: Vec<Device>,
    /// Bind a copy of every executed node's value onto the graph.
    pub trace: bool,
    /// When tracing, only bind these nodes. Empty means all.
    pub watch: Vec<NodeId>,
    /// Bind the value of every node that has a gradient, so value and
    /// gradient can be read together.
    pub bind_dual_values: bool,
}

impl VmOptions {
    pub fn traced() -> Self {
        Self {
            trace: true,
            ..Self::default()
        }
    }

    pub fn watching(nodes: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            trace: true,
            watch: nodes.into_iter().collect(),
            ..Self::default()
        }
    }
}
