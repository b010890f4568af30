//! # lathe-compiler
//!
//! Turns a graph and a set of fetched nodes into an immutable tape `Program`.
//!
//! Passes, in order:
//! - schedule: topological order of everything the fetches depend on
//! - placement: host, or the configured accelerator when an op can run there
//! - emission: one instruction per node plus device transfers
//! - liveness: first definition and last use of every emitted value
//! - allocation: linear scan over registers keyed by device, dtype and shape,
//!   coalescing in-place instructions onto their operand's register

pub mod compile;
pub mod error;
pub mod liveness;
pub mod options;
pub mod program;
pub mod regalloc;

pub use compile::{compile, compile_all};
pub use error::CompileError;
pub use options::CompileOptions;
pub use program::{Instruction, Program, RegisterId, RegisterMap, RegisterSpec, StatementKind};

pub type Result<T> = std::result::Result<T, CompileError>;
