//! Statement operations. They carry no value of their own; the compiler emits
//! them as no-op instructions that only pin ordering and liveness.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};

use lathe_core::{Shape, Tensor};

use crate::op::{op_eq_by_value, Arity, Op};
use crate::Result;

/// `let x = …`: asserts the operand holds an externally bound value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Let;

impl fmt::Display for Let {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("let")
    }
}

impl Op for Let {
    fn name(&self) -> &'static str {
        "let"
    }

    fn arity(&self) -> Arity {
        Arity::Fixed(1)
    }

    fn infer_shape(&self, operands: &[&Shape]) -> Result<Shape> {
        Ok(operands[0].clone())
    }

    fn execute(&self, inputs: &[&Tensor]) -> lathe_core::Result<Tensor> {
        Ok(inputs[0].clone())
    }

    fn write_hash(&self, mut state: &mut dyn Hasher) {
        "let".hash(&mut state);
    }

    fn op_eq(&self, other: &dyn Op) -> bool {
        op_eq_by_value(self, other)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn is_statement(&self) -> bool {
        true
    }
}

/// Observe the operand: keeps it live until this point and exposes its value
/// on the statement node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Read;

impl fmt::Display for Read {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("read")
    }
}

impl Op for Read {
    fn name(&self) -> &'static str {
        "read"
    }

    fn arity(&self) -> Arity {
        Arity::Fixed(1)
    }

    fn infer_shape(&self, operands: &[&Shape]) -> Result<Shape> {
        Ok(operands[0].clone())
    }

    fn execute(&self, inputs: &[&Tensor]) -> lathe_core::Result<Tensor> {
        Ok(inputs[0].clone())
    }

    fn write_hash(&self, mut state: &mut dyn Hasher) {
        "read".hash(&mut state);
    }

    fn op_eq(&self, other: &dyn Op) -> bool {
        op_eq_by_value(self, other)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn is_statement(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Graph;
    use lathe_core::DType;

    #[test]
    fn test_statements() {
        let mut g = Graph::new();
        let x = g.input("x", DType::I64, [2]);
        let l = g.let_binding(x).unwrap();
        let r = g.read(x).unwrap();
        assert!(g.node(l).unwrap().is_statement());
        assert!(g.node(r).unwrap().is_statement());
        assert_ne!(l, r);
        assert_eq!(g.node(r).unwrap().dtype(), DType::I64);
        assert!(!Let.op_eq(&Read));
    }
}
