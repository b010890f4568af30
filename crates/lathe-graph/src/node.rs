use std::fmt;

use lathe_core::{DType, Shape, Tensor};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::op::OpRef;

/// Stable index of a node inside its owning [`Graph`](crate::Graph).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// What kind of vertex a node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Leaf whose value is bound from outside before each run.
    Input,
    /// Leaf carrying a fixed value.
    Constant,
    /// Result of applying an operation to operands.
    Op,
}

/// A vertex of the computation graph.
///
/// Structure (operation, operands, type, shape) is fixed at creation. The value
/// and gradient slots are rewritten by each execution pass.
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) name: Option<String>,
    pub(crate) kind: NodeKind,
    pub(crate) op: Option<OpRef>,
    pub(crate) operands: SmallVec<[NodeId; 2]>,
    pub(crate) dtype: DType,
    pub(crate) shape: Shape,
    pub(crate) value: Option<Tensor>,
    pub(crate) grad: Option<Tensor>,
    /// Nodes this node is the gradient of, one entry per request.
    pub(crate) deriv_of: SmallVec<[NodeId; 1]>,
    /// Gradient node of this node, once differentiated.
    pub(crate) derivative: Option<NodeId>,
}

impl Node {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// The operation, or `None` for inputs.
    pub fn op(&self) -> Option<&OpRef> {
        self.op.as_ref()
    }

    pub fn operands(&self) -> &[NodeId] {
        &self.operands
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn value(&self) -> Option<&Tensor> {
        self.value.as_ref()
    }

    pub fn grad(&self) -> Option<&Tensor> {
        self.grad.as_ref()
    }

    pub fn deriv_of(&self) -> &[NodeId] {
        &self.deriv_of
    }

    pub fn derivative(&self) -> Option<NodeId> {
        self.derivative
    }

    pub fn is_input(&self) -> bool {
        self.kind == NodeKind::Input
    }

    pub fn is_constant(&self) -> bool {
        self.kind == NodeKind::Constant
    }

    pub fn is_leaf(&self) -> bool {
        self.operands.is_empty()
    }

    /// Whether the node is a binding or observe statement rather than a value.
    pub fn is_statement(&self) -> bool {
        self.op.as_ref().is_some_and(|op| op.is_statement())
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)?;
        if let Some(name) = &self.name {
            write!(f, " ({name})")?;
        }
        match (&self.op, self.kind) {
            (_, NodeKind::Input) => write!(f, " = input")?,
            (Some(op), _) => {
                write!(f, " = {op}")?;
                if !self.operands.is_empty() {
                    write!(f, "(")?;
                    for (i, o) in self.operands.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{o}")?;
                    }
                    write!(f, ")")?;
                }
            }
            (None, _) => {}
        }
        write!(f, " :: {}{}", self.dtype, self.shape)
    }
}
