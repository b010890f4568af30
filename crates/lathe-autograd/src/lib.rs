//! # lathe-autograd
//!
//! Symbolic reverse-mode differentiation for lathe graphs.
//!
//! - `affects_output` / `affected_by` dependency analysis over a topological order
//! - `differentiate` / `differentiate_multi` build a gradient subgraph in the
//!   same graph, recording `deriv_of` links for the VM
//! - `DiffOptions` carries the stabilization choice explicitly

pub mod analysis;
pub mod backprop;
pub mod error;
pub mod options;

pub use analysis::{affected_by, affects_output, NodeSet};
pub use backprop::{differentiate, differentiate_multi, grad};
pub use error::AutogradError;
pub use options::DiffOptions;

pub type Result<T> = std::result::Result<T, AutogradError>;
