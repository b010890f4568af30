use lathe_core::{CoreError, DType};

use crate::NodeId;

/// Errors raised while building or querying a graph.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("graph is not acyclic: cycle through {0}")]
    Cycle(NodeId),

    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    #[error("{op} expects {expected} operand(s), got {got}")]
    Arity {
        op: String,
        expected: String,
        got: usize,
    },

    #[error("shape mismatch in {op}: {detail}")]
    ShapeMismatch { op: String, detail: String },

    #[error("cannot unify operand types of {op}: expected {expected}, got {got}")]
    TypeUnification {
        op: String,
        expected: DType,
        got: DType,
    },

    #[error("{op} is not defined for {dtype} operands")]
    UnsupportedType { op: String, dtype: DType },

    #[error("{op} has no symbolic derivative")]
    NotDifferentiable { op: String },

    #[error("only input nodes accept bound values; {0} is derived")]
    NotAnInput(NodeId),

    #[error("bad value for {node}: {source}")]
    Bind {
        node: NodeId,
        #[source]
        source: CoreError,
    },

    #[error(transparent)]
    Core(#[from] CoreError),
}
