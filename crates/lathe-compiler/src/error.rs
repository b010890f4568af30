use lathe_core::{DType, Shape};
use lathe_graph::{GraphError, NodeId};

/// Errors raised while compiling a graph.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("nothing to compile: no fetch nodes given")]
    NoFetches,

    #[error("{0} is declared as a program input but is not an input node")]
    NotAnInput(NodeId),

    #[error("fetch {fetch} depends on input {input}, which is not bound by the program")]
    UnboundInput { fetch: NodeId, input: NodeId },

    #[error("cannot resolve the type or shape of {node}: {source}")]
    Unresolved {
        node: NodeId,
        #[source]
        source: GraphError,
    },

    #[error("{node} declares {declared_dtype}{declared_shape} but its operands give {dtype}{shape}")]
    LayoutConflict {
        node: NodeId,
        declared_dtype: DType,
        declared_shape: Shape,
        dtype: DType,
        shape: Shape,
    },

    #[error("{node} has no register")]
    UnresolvedRegister { node: NodeId },

    #[error(transparent)]
    Graph(#[from] GraphError),
}
