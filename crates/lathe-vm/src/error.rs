use lathe_autograd::AutogradError;
use lathe_compiler::{CompileError, RegisterId};
use lathe_core::{CoreError, DType, Shape};
use lathe_graph::{GraphError, NodeId};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised while binding, running or inspecting a program.
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("{0} is not an input of this program")]
    NotAnInput(NodeId),

    #[error("input {0} has no bound value")]
    UnboundInput(NodeId),

    #[error("cannot bind {node}: expected shape {expected}, got {got}")]
    ShapeMismatch {
        node: NodeId,
        expected: Shape,
        got: Shape,
    },

    #[error("cannot bind {node}: expected dtype {expected}, got {got}")]
    DTypeMismatch {
        node: NodeId,
        expected: DType,
        got: DType,
    },

    #[error("instruction {index} ({node}) failed: {source}")]
    Execution {
        index: usize,
        node: NodeId,
        #[source]
        source: BoxError,
    },

    #[error("a previous run failed; call reset() before running again")]
    ResetRequired,

    #[error("register {0} is empty")]
    EmptyRegister(RegisterId),

    #[error("{0} has no value; fetch it, read it or enable tracing")]
    NoValue(NodeId),

    #[error("{0} has no gradient")]
    NoGradient(NodeId),

    #[error("device error: {0}")]
    Device(#[source] CoreError),

    #[error("invalid engine config: {0}")]
    Config(#[from] serde_json::Error),

    #[error("cannot read engine config: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Autograd(#[from] AutogradError),

    #[error(transparent)]
    Compile(#[from] CompileError),
}
