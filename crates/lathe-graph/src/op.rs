//! The operation contract.
//!
//! Every operation implements [`Op`]. Extended behaviour is advertised through
//! capability queries (`as_in_place`, `as_prealloc`, `as_device`) which the
//! compiler and VM test instead of matching on concrete types.

use std::any::Any;
use std::fmt;
use std::hash::Hasher;
use std::sync::Arc;

use lathe_core::{DType, Shape, Tensor};
use rustc_hash::FxHasher;
use smallvec::SmallVec;

use crate::{Graph, GraphError, NodeId, Result};

/// Shared handle to an operation. Operations are immutable descriptors.
pub type OpRef = Arc<dyn Op>;

/// Per-operand derivative expressions returned by symbolic differentiation.
/// `None` marks an operand that receives no gradient.
pub type OperandGrads = SmallVec<[Option<NodeId>; 2]>;

/// Number of operands an operation takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Fixed(usize),
    Variadic,
}

impl Arity {
    pub fn accepts(&self, n: usize) -> bool {
        match self {
            Arity::Fixed(k) => *k == n,
            Arity::Variadic => true,
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Fixed(k) => write!(f, "{k}"),
            Arity::Variadic => write!(f, "any number of"),
        }
    }
}

/// A pure, stateless, hashable description of one computation step.
pub trait Op: fmt::Debug + fmt::Display + Send + Sync + 'static {
    /// Short stable name, used in listings and error messages.
    fn name(&self) -> &'static str;

    fn arity(&self) -> Arity;

    /// Result dtype for the given operand dtypes.
    ///
    /// The default signature is `(a, a, ..) -> a`: every operand must share one dtype.
    fn infer_dtype(&self, operands: &[DType]) -> Result<DType> {
        unify(self.name(), operands)
    }

    /// Result shape for the given operand shapes.
    fn infer_shape(&self, operands: &[&Shape]) -> Result<Shape>;

    /// Value-producing execution. Always allocates a fresh result.
    fn execute(&self, inputs: &[&Tensor]) -> lathe_core::Result<Tensor>;

    /// Which operands this operation can be differentiated with respect to.
    fn diff_wrt(&self, arity: usize) -> SmallVec<[bool; 2]> {
        SmallVec::from_elem(false, arity)
    }

    /// Build the vector-Jacobian product for each operand into `graph`.
    ///
    /// `output` is the node this operation produced and `grad` the gradient
    /// flowing into it.
    fn sym_diff(
        &self,
        graph: &mut Graph,
        operands: &[NodeId],
        output: NodeId,
        grad: NodeId,
    ) -> Result<OperandGrads> {
        let _ = (graph, operands, output, grad);
        Err(GraphError::NotDifferentiable {
            op: self.to_string(),
        })
    }

    /// Numerically preferable derivative form, used when stabilization is on.
    /// `None` means the operation has no rewritten form.
    fn stabilized_sym_diff(
        &self,
        graph: &mut Graph,
        operands: &[NodeId],
        output: NodeId,
        grad: NodeId,
    ) -> Option<Result<OperandGrads>> {
        let _ = (graph, operands, output, grad);
        None
    }

    /// Feed the operation's identity into `state`. Equal operations must write
    /// equal bytes.
    fn write_hash(&self, state: &mut dyn Hasher);

    /// 32-bit identity hash derived from [`Op::write_hash`].
    fn hashcode(&self) -> u32 {
        let mut h = FxHasher::default();
        self.write_hash(&mut h);
        let full = h.finish();
        (full ^ (full >> 32)) as u32
    }

    /// Structural equality across trait objects.
    fn op_eq(&self, other: &dyn Op) -> bool;

    fn as_any(&self) -> &dyn Any;

    /// Statements (bindings, observations) produce no value of their own.
    fn is_statement(&self) -> bool {
        false
    }

    fn as_in_place(&self) -> Option<&dyn InPlaceOp> {
        None
    }

    fn as_prealloc(&self) -> Option<&dyn PreallocOp> {
        None
    }

    fn as_device(&self) -> Option<&dyn DeviceOp> {
        None
    }
}

/// Operations that may overwrite one operand's buffer with their result.
pub trait InPlaceOp {
    /// Index of the operand whose buffer is overwritten.
    fn overwrites_input(&self) -> usize;

    /// Compute into `target` (the overwritten operand's value) and return it.
    /// `rest` holds the remaining operands in order.
    fn execute_in_place(&self, target: Tensor, rest: &[&Tensor]) -> lathe_core::Result<Tensor>;
}

/// Operations that can write into an existing, correctly shaped buffer.
pub trait PreallocOp {
    fn execute_into(&self, out: &mut Tensor, inputs: &[&Tensor]) -> lathe_core::Result<()>;
}

/// Operations with an accelerator kernel.
pub trait DeviceOp {
    /// Whether a kernel exists for these operand dtypes and shapes.
    fn supports_device(&self, dtype: DType, shapes: &[&Shape]) -> bool;

    /// Execute with every input already resident on the target device.
    fn execute_on_device(&self, inputs: &[&Tensor]) -> lathe_core::Result<Tensor>;
}

/// `op_eq` for operations whose identity is their `PartialEq` value.
pub fn op_eq_by_value<T: Op + PartialEq>(this: &T, other: &dyn Op) -> bool {
    other
        .as_any()
        .downcast_ref::<T>()
        .is_some_and(|o| o == this)
}

/// All operand dtypes must be identical.
pub fn unify(op: &str, operands: &[DType]) -> Result<DType> {
    let Some((&first, rest)) = operands.split_first() else {
        return Err(GraphError::Arity {
            op: op.to_string(),
            expected: "at least 1".into(),
            got: 0,
        });
    };
    for &d in rest {
        if d != first {
            return Err(GraphError::TypeUnification {
                op: op.to_string(),
                expected: first,
                got: d,
            });
        }
    }
    Ok(first)
}

/// Like [`unify`], additionally requiring a float dtype.
pub fn unify_float(op: &str, operands: &[DType]) -> Result<DType> {
    let dtype = unify(op, operands)?;
    if !dtype.is_float() {
        return Err(GraphError::UnsupportedType {
            op: op.to_string(),
            dtype,
        });
    }
    Ok(dtype)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arity() {
        assert!(Arity::Fixed(2).accepts(2));
        assert!(!Arity::Fixed(2).accepts(1));
        assert!(Arity::Variadic.accepts(7));
    }

    #[test]
    fn test_unify() {
        assert_eq!(unify("add", &[DType::F32, DType::F32]).unwrap(), DType::F32);
        assert!(matches!(
            unify("add", &[DType::F32, DType::F64]),
            Err(GraphError::TypeUnification { .. })
        ));
        assert!(matches!(
            unify_float("exp", &[DType::I32]),
            Err(GraphError::UnsupportedType { .. })
        ));
    }
}
