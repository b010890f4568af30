//! Operation catalogue and graph construction helpers.

mod constant;
mod elementwise;
mod reduce;
mod statement;

pub use constant::Constant;
pub use elementwise::{Binary, Unary};
pub use reduce::{BroadcastTo, ReduceTo, Sum};
pub use statement::{Let, Read};

use lathe_core::{BinaryKind, Shape, UnaryKind};

use crate::{Graph, GraphError, NodeId, Result};

impl Graph {
    pub fn unary(&mut self, kind: UnaryKind, x: NodeId) -> Result<NodeId> {
        self.apply(Unary::new(kind), &[x])
    }

    pub fn binary(&mut self, kind: BinaryKind, a: NodeId, b: NodeId) -> Result<NodeId> {
        self.apply(Binary::new(kind), &[a, b])
    }

    pub fn add(&mut self, a: NodeId, b: NodeId) -> Result<NodeId> {
        self.binary(BinaryKind::Add, a, b)
    }

    pub fn sub(&mut self, a: NodeId, b: NodeId) -> Result<NodeId> {
        self.binary(BinaryKind::Sub, a, b)
    }

    pub fn mul(&mut self, a: NodeId, b: NodeId) -> Result<NodeId> {
        self.binary(BinaryKind::Mul, a, b)
    }

    pub fn div(&mut self, a: NodeId, b: NodeId) -> Result<NodeId> {
        self.binary(BinaryKind::Div, a, b)
    }

    pub fn neg(&mut self, x: NodeId) -> Result<NodeId> {
        self.unary(UnaryKind::Neg, x)
    }

    pub fn exp(&mut self, x: NodeId) -> Result<NodeId> {
        self.unary(UnaryKind::Exp, x)
    }

    pub fn log(&mut self, x: NodeId) -> Result<NodeId> {
        self.unary(UnaryKind::Log, x)
    }

    pub fn log1p(&mut self, x: NodeId) -> Result<NodeId> {
        self.unary(UnaryKind::Log1p, x)
    }

    pub fn expm1(&mut self, x: NodeId) -> Result<NodeId> {
        self.unary(UnaryKind::Expm1, x)
    }

    pub fn sqrt(&mut self, x: NodeId) -> Result<NodeId> {
        self.unary(UnaryKind::Sqrt, x)
    }

    pub fn square(&mut self, x: NodeId) -> Result<NodeId> {
        self.unary(UnaryKind::Square, x)
    }

    pub fn recip(&mut self, x: NodeId) -> Result<NodeId> {
        self.unary(UnaryKind::Recip, x)
    }

    /// Sum of all elements (scalar result).
    pub fn sum(&mut self, x: NodeId) -> Result<NodeId> {
        self.apply(Sum, &[x])
    }

    pub fn broadcast_to(&mut self, x: NodeId, shape: impl Into<Shape>) -> Result<NodeId> {
        self.apply(BroadcastTo::new(shape.into()), &[x])
    }

    pub fn reduce_to(&mut self, x: NodeId, shape: impl Into<Shape>) -> Result<NodeId> {
        self.apply(ReduceTo::new(shape.into()), &[x])
    }

    /// Binding statement: `x` must hold an externally supplied value at this point.
    pub fn let_binding(&mut self, x: NodeId) -> Result<NodeId> {
        self.apply(Let, &[x])
    }

    /// Observe statement: keeps `x` live and exposes its value on the statement node.
    pub fn read(&mut self, x: NodeId) -> Result<NodeId> {
        self.apply(Read, &[x])
    }

    /// Scalar constant with value `v` and the dtype of node `like`.
    pub fn scalar_like(&mut self, v: f64, like: NodeId) -> Result<NodeId> {
        let dtype = self.node(like)?.dtype();
        Ok(self.scalar(v, dtype))
    }

    /// Bring a gradient expression to `target`'s shape: broadcast it up when it
    /// is smaller, sum over broadcast axes when it is larger.
    pub fn fit_to_shape(&mut self, grad: NodeId, target: &Shape) -> Result<NodeId> {
        let shape = self.node(grad)?.shape().clone();
        if &shape == target {
            Ok(grad)
        } else if shape.broadcasts_to(target) {
            self.broadcast_to(grad, target.clone())
        } else if target.broadcasts_to(&shape) {
            self.reduce_to(grad, target.clone())
        } else {
            Err(GraphError::ShapeMismatch {
                op: "gradient".into(),
                detail: format!("gradient of shape {shape} cannot flow into {target}"),
            })
        }
    }
}
