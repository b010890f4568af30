use crate::{DType, Device};

/// Errors raised by tensor construction, kernels and device transport.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("storage error: {0}")]
    StorageError(String),

    #[error("unsupported dtype for this kernel: {0}")]
    UnsupportedDType(DType),

    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: DType, got: DType },

    #[error("cannot broadcast shapes {a:?} and {b:?}")]
    BroadcastError { a: Vec<usize>, b: Vec<usize> },

    #[error("integer division by zero")]
    DivisionByZero,

    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    #[error("value lives on {0}; transfer it to host memory first")]
    NotOnHost(Device),

    #[error("device {0} is not available in this build")]
    DeviceUnavailable(Device),

    #[error("CUDA error: {0}")]
    CudaError(String),
}
