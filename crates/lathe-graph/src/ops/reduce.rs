use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};

use lathe_core::{Shape, Tensor};
use smallvec::{smallvec, SmallVec};

use crate::op::{op_eq_by_value, Arity, Op, OperandGrads};
use crate::{Graph, GraphError, NodeId, Result};

/// Sum of every element; scalar result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Sum;

impl fmt::Display for Sum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("sum")
    }
}

impl Op for Sum {
    fn name(&self) -> &'static str {
        "sum"
    }

    fn arity(&self) -> Arity {
        Arity::Fixed(1)
    }

    fn infer_shape(&self, _operands: &[&Shape]) -> Result<Shape> {
        Ok(Shape::scalar())
    }

    fn execute(&self, inputs: &[&Tensor]) -> lathe_core::Result<Tensor> {
        inputs[0].sum_all()
    }

    fn diff_wrt(&self, _arity: usize) -> SmallVec<[bool; 2]> {
        smallvec![true]
    }

    fn sym_diff(
        &self,
        g: &mut Graph,
        operands: &[NodeId],
        _output: NodeId,
        grad: NodeId,
    ) -> Result<OperandGrads> {
        let shape = g.node(operands[0])?.shape().clone();
        Ok(smallvec![Some(g.fit_to_shape(grad, &shape)?)])
    }

    fn write_hash(&self, mut state: &mut dyn Hasher) {
        "sum".hash(&mut state);
    }

    fn op_eq(&self, other: &dyn Op) -> bool {
        op_eq_by_value(self, other)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Repeat the operand along broadcast axes up to a target shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BroadcastTo {
    shape: Shape,
}

impl BroadcastTo {
    pub fn new(shape: Shape) -> Self {
        Self { shape }
    }
}

impl fmt::Display for BroadcastTo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "broadcast_to{}", self.shape)
    }
}

impl Op for BroadcastTo {
    fn name(&self) -> &'static str {
        "broadcast_to"
    }

    fn arity(&self) -> Arity {
        Arity::Fixed(1)
    }

    fn infer_shape(&self, operands: &[&Shape]) -> Result<Shape> {
        if !operands[0].broadcasts_to(&self.shape) {
            return Err(GraphError::ShapeMismatch {
                op: self.to_string(),
                detail: format!("{} does not broadcast to {}", operands[0], self.shape),
            });
        }
        Ok(self.shape.clone())
    }

    fn execute(&self, inputs: &[&Tensor]) -> lathe_core::Result<Tensor> {
        inputs[0].broadcast_to(&self.shape)
    }

    fn diff_wrt(&self, _arity: usize) -> SmallVec<[bool; 2]> {
        smallvec![true]
    }

    fn sym_diff(
        &self,
        g: &mut Graph,
        operands: &[NodeId],
        _output: NodeId,
        grad: NodeId,
    ) -> Result<OperandGrads> {
        let shape = g.node(operands[0])?.shape().clone();
        Ok(smallvec![Some(g.fit_to_shape(grad, &shape)?)])
    }

    fn write_hash(&self, mut state: &mut dyn Hasher) {
        "broadcast_to".hash(&mut state);
        self.shape.hash(&mut state);
    }

    fn op_eq(&self, other: &dyn Op) -> bool {
        op_eq_by_value(self, other)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Sum over broadcast axes down to a target shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReduceTo {
    shape: Shape,
}

impl ReduceTo {
    pub fn new(shape: Shape) -> Self {
        Self { shape }
    }
}

impl fmt::Display for ReduceTo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reduce_to{}", self.shape)
    }
}

impl Op for ReduceTo {
    fn name(&self) -> &'static str {
        "reduce_to"
    }

    fn arity(&self) -> Arity {
        Arity::Fixed(1)
    }

    fn infer_shape(&self, operands: &[&Shape]) -> Result<Shape> {
        if !self.shape.broadcasts_to(operands[0]) {
            return Err(GraphError::ShapeMismatch {
                op: self.to_string(),
                detail: format!("{} cannot be reduced to {}", operands[0], self.shape),
            });
        }
        Ok(self.shape.clone())
    }

    fn execute(&self, inputs: &[&Tensor]) -> lathe_core::Result<Tensor> {
        inputs[0].reduce_to(&self.shape)
    }

    fn diff_wrt(&self, _arity: usize) -> SmallVec<[bool; 2]> {
        smallvec![true]
    }

    fn sym_diff(
        &self,
        g: &mut Graph,
        operands: &[NodeId],
        _output: NodeId,
        grad: NodeId,
    ) -> Result<OperandGrads> {
        let shape = g.node(operands[0])?.shape().clone();
        Ok(smallvec![Some(g.fit_to_shape(grad, &shape)?)])
    }

    fn write_hash(&self, mut state: &mut dyn Hasher) {
        "reduce_to".hash(&mut state);
        self.shape.hash(&mut state);
    }

    fn op_eq(&self, other: &dyn Op) -> bool {
        op_eq_by_value(self, other)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
