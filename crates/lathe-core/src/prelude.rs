//! Convenience re-exports for common lathe-core types.
//!
//! ```rust
//! use lathe_core::prelude::*;
//! ```

pub use crate::BinaryKind;
pub use crate::CoreError;
pub use crate::DType;
pub use crate::Device;
pub use crate::Result;
pub use crate::Shape;
pub use crate::Tensor;
pub use crate::UnaryKind;
