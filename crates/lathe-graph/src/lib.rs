//! # lathe-graph
//!
//! Computation graph for the lathe engine.
//!
//! Provides:
//! - `Graph`, an arena of `Node`s addressed by stable `NodeId`s
//! - the `Op` contract with optional in-place, preallocation and device capabilities
//! - hash-consing so equal operations over equal operands share one node
//! - topological enumeration with cycle detection
//! - the operation catalogue (constants, elementwise math, reductions, statements)

pub mod error;
pub mod graph;
pub mod node;
pub mod op;
pub mod ops;

pub use error::GraphError;
pub use graph::{ConsumerMap, Graph};
pub use node::{Node, NodeId, NodeKind};
pub use op::{Arity, DeviceOp, InPlaceOp, Op, OpRef, PreallocOp};

pub type Result<T> = std::result::Result<T, GraphError>;
