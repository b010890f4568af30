use lathe_core::{DType, Shape};
use lathe_graph::{GraphError, NodeId};

/// Errors raised by dependency analysis and differentiation.
#[derive(Debug, thiserror::Error)]
pub enum AutogradError {
    #[error("node list is not in topological order: {node} precedes its operand {operand}")]
    Topology { node: NodeId, operand: NodeId },

    #[error("{target} is disconnected from every output; no gradient reaches it")]
    DisconnectedGradient { target: NodeId },

    #[error("expected one seed gradient per output, got {outputs} outputs and {seeds} seeds")]
    SeedCount { outputs: usize, seeds: usize },

    #[error("seed {seed} ({seed_dtype}{seed_shape}) does not fit output {output} ({dtype}{shape})")]
    SeedLayout {
        seed: NodeId,
        seed_dtype: DType,
        seed_shape: Shape,
        output: NodeId,
        dtype: DType,
        shape: Shape,
    },

    #[error("cost {0} must be a scalar")]
    NonScalarCost(NodeId),

    #[error("{node} ({op}) lies on a gradient path but has no symbolic derivative")]
    NotDifferentiable { node: NodeId, op: String },

    #[error(transparent)]
    Graph(#[from] GraphError),
}
