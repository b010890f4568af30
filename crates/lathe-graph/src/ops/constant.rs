use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};

use lathe_core::{DType, Shape, Tensor};

use crate::op::{op_eq_by_value, Arity, Op};
use crate::Result;

/// A fixed value. Arity 0; executing it yields the value.
#[derive(Debug, Clone, PartialEq)]
pub struct Constant {
    value: Tensor,
}

impl Constant {
    pub fn new(value: Tensor) -> Self {
        Self { value }
    }

    pub fn value(&self) -> &Tensor {
        &self.value
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value.item() {
            Ok(v) if self.value.shape().is_scalar() => write!(f, "{v}"),
            _ => write!(f, "const{}", self.value.shape()),
        }
    }
}

impl Op for Constant {
    fn name(&self) -> &'static str {
        "const"
    }

    fn arity(&self) -> Arity {
        Arity::Fixed(0)
    }

    fn infer_dtype(&self, _operands: &[DType]) -> Result<DType> {
        Ok(self.value.dtype())
    }

    fn infer_shape(&self, _operands: &[&Shape]) -> Result<Shape> {
        Ok(self.value.shape().clone())
    }

    fn execute(&self, _inputs: &[&Tensor]) -> lathe_core::Result<Tensor> {
        Ok(self.value.clone())
    }

    fn write_hash(&self, mut state: &mut dyn Hasher) {
        "const".hash(&mut state);
        self.value.hash_content(&mut state);
    }

    fn op_eq(&self, other: &dyn Op) -> bool {
        op_eq_by_value(self, other)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
