//! # lathe-core
//!
//! Value substrate for the lathe computation-graph engine.
//!
//! Provides the `Tensor` type consumed by graph operations:
//! - Float and integer dtypes (F32, F64, I32, I64)
//! - Host and CUDA devices (CUDA behind the `cuda` feature)
//! - Copy-on-write storage so registers can be reused in place
//! - Elementwise kernels with value-producing, in-place and preallocated variants

pub mod dtype;
pub mod device;
pub mod storage;
pub mod shape;
pub mod tensor;
pub mod ops;
pub mod error;
pub mod prelude;

#[cfg(feature = "cuda")]
pub mod cuda;

pub use dtype::DType;
pub use device::Device;
pub use storage::{HostData, Storage};
pub use shape::Shape;
pub use tensor::Tensor;
pub use ops::{Arith, BinaryKind, UnaryKind};
pub use error::CoreError;

pub type Result<T> = std::result::Result<T, CoreError>;
