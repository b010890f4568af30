use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};

use lathe_core::{BinaryKind, DType, Shape, Tensor, UnaryKind};
use smallvec::{smallvec, SmallVec};

#[cfg(feature = "cuda")]
use crate::op::DeviceOp;
use crate::op::{op_eq_by_value, unify_float, Arity, InPlaceOp, Op, OperandGrads, PreallocOp};
use crate::{Graph, GraphError, NodeId, Result};

// =============================================================================
// Unary
// =============================================================================

/// Element-wise unary function. Output has the operand's shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Unary {
    kind: UnaryKind,
}

impl Unary {
    pub fn new(kind: UnaryKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> UnaryKind {
        self.kind
    }
}

impl fmt::Display for Unary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind.name())
    }
}

impl Op for Unary {
    fn name(&self) -> &'static str {
        self.kind.name()
    }

    fn arity(&self) -> Arity {
        Arity::Fixed(1)
    }

    fn infer_dtype(&self, operands: &[DType]) -> Result<DType> {
        unify_float(self.name(), operands)
    }

    fn infer_shape(&self, operands: &[&Shape]) -> Result<Shape> {
        Ok(operands[0].clone())
    }

    fn execute(&self, inputs: &[&Tensor]) -> lathe_core::Result<Tensor> {
        inputs[0].unary(self.kind)
    }

    fn diff_wrt(&self, _arity: usize) -> SmallVec<[bool; 2]> {
        smallvec![true]
    }

    fn sym_diff(
        &self,
        g: &mut Graph,
        operands: &[NodeId],
        output: NodeId,
        grad: NodeId,
    ) -> Result<OperandGrads> {
        let x = operands[0];
        let dx = match self.kind {
            UnaryKind::Neg => g.neg(grad)?,
            // d exp(x) = exp(x)
            UnaryKind::Exp => g.mul(grad, output)?,
            UnaryKind::Log => g.div(grad, x)?,
            UnaryKind::Log1p => {
                let one = g.scalar_like(1.0, x)?;
                let denom = g.add(x, one)?;
                let r = g.recip(denom)?;
                g.mul(grad, r)?
            }
            UnaryKind::Expm1 => {
                let e = g.exp(x)?;
                g.mul(grad, e)?
            }
            // d sqrt(x) = 1 / (2 sqrt(x))
            UnaryKind::Sqrt => {
                let two = g.scalar_like(2.0, x)?;
                let denom = g.mul(two, output)?;
                g.div(grad, denom)?
            }
            UnaryKind::Square => {
                let two = g.scalar_like(2.0, x)?;
                let d = g.mul(two, x)?;
                g.mul(grad, d)?
            }
            // d (1/x) = -(1/x)^2
            UnaryKind::Recip => {
                let sq = g.square(output)?;
                let d = g.mul(grad, sq)?;
                g.neg(d)?
            }
        };
        Ok(smallvec![Some(dx)])
    }

    fn stabilized_sym_diff(
        &self,
        g: &mut Graph,
        operands: &[NodeId],
        output: NodeId,
        grad: NodeId,
    ) -> Option<Result<OperandGrads>> {
        let x = operands[0];
        let dx = match self.kind {
            UnaryKind::Log1p => stabilized_log1p(g, x, grad),
            UnaryKind::Expm1 => stabilized_expm1(g, x, output, grad),
            _ => return None,
        };
        Some(dx.map(|dx| smallvec![Some(dx)]))
    }

    fn write_hash(&self, mut state: &mut dyn Hasher) {
        "unary".hash(&mut state);
        self.kind.hash(&mut state);
    }

    fn op_eq(&self, other: &dyn Op) -> bool {
        op_eq_by_value(self, other)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_in_place(&self) -> Option<&dyn InPlaceOp> {
        Some(self)
    }

    fn as_prealloc(&self) -> Option<&dyn PreallocOp> {
        Some(self)
    }

    #[cfg(feature = "cuda")]
    fn as_device(&self) -> Option<&dyn DeviceOp> {
        Some(self)
    }
}

/// grad / (x + 1) in a single division.
fn stabilized_log1p(g: &mut Graph, x: NodeId, grad: NodeId) -> Result<NodeId> {
    let one = g.scalar_like(1.0, x)?;
    let denom = g.add(x, one)?;
    g.div(grad, denom)
}

/// exp(x) = expm1(x) + 1, reusing the forward result.
fn stabilized_expm1(g: &mut Graph, x: NodeId, output: NodeId, grad: NodeId) -> Result<NodeId> {
    let one = g.scalar_like(1.0, x)?;
    let e = g.add(output, one)?;
    g.mul(grad, e)
}

impl InPlaceOp for Unary {
    fn overwrites_input(&self) -> usize {
        0
    }

    fn execute_in_place(&self, mut target: Tensor, _rest: &[&Tensor]) -> lathe_core::Result<Tensor> {
        target.unary_(self.kind)?;
        Ok(target)
    }
}

impl PreallocOp for Unary {
    fn execute_into(&self, out: &mut Tensor, inputs: &[&Tensor]) -> lathe_core::Result<()> {
        inputs[0].unary_into(self.kind, out)
    }
}

#[cfg(feature = "cuda")]
impl DeviceOp for Unary {
    fn supports_device(&self, dtype: DType, _shapes: &[&Shape]) -> bool {
        lathe_core::cuda::supports(dtype)
    }

    fn execute_on_device(&self, inputs: &[&Tensor]) -> lathe_core::Result<Tensor> {
        lathe_core::cuda::unary(inputs[0], self.kind)
    }
}

// =============================================================================
// Binary
// =============================================================================

/// Element-wise binary function with broadcasting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Binary {
    kind: BinaryKind,
}

impl Binary {
    pub fn new(kind: BinaryKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> BinaryKind {
        self.kind
    }
}

impl fmt::Display for Binary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind.symbol())
    }
}

impl Op for Binary {
    fn name(&self) -> &'static str {
        self.kind.name()
    }

    fn arity(&self) -> Arity {
        Arity::Fixed(2)
    }

    fn infer_shape(&self, operands: &[&Shape]) -> Result<Shape> {
        let (a, b) = (operands[0], operands[1]);
        a.broadcast_with(b).ok_or_else(|| GraphError::ShapeMismatch {
            op: self.name().to_string(),
            detail: format!("cannot broadcast {a} with {b}"),
        })
    }

    fn execute(&self, inputs: &[&Tensor]) -> lathe_core::Result<Tensor> {
        inputs[0].binary(inputs[1], self.kind)
    }

    fn diff_wrt(&self, _arity: usize) -> SmallVec<[bool; 2]> {
        smallvec![true, true]
    }

    fn sym_diff(
        &self,
        g: &mut Graph,
        operands: &[NodeId],
        output: NodeId,
        grad: NodeId,
    ) -> Result<OperandGrads> {
        let (a, b) = (operands[0], operands[1]);
        let (da, db) = match self.kind {
            BinaryKind::Add => (grad, grad),
            BinaryKind::Sub => (grad, g.neg(grad)?),
            BinaryKind::Mul => (g.mul(grad, b)?, g.mul(grad, a)?),
            // d(a/b)/db = -(a/b)/b
            BinaryKind::Div => {
                let da = g.div(grad, b)?;
                let gy = g.mul(grad, output)?;
                let q = g.div(gy, b)?;
                (da, g.neg(q)?)
            }
        };
        let a_shape = g.node(a)?.shape().clone();
        let b_shape = g.node(b)?.shape().clone();
        Ok(smallvec![
            Some(g.fit_to_shape(da, &a_shape)?),
            Some(g.fit_to_shape(db, &b_shape)?),
        ])
    }

    fn write_hash(&self, mut state: &mut dyn Hasher) {
        "binary".hash(&mut state);
        self.kind.hash(&mut state);
    }

    fn op_eq(&self, other: &dyn Op) -> bool {
        op_eq_by_value(self, other)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_in_place(&self) -> Option<&dyn InPlaceOp> {
        Some(self)
    }

    fn as_prealloc(&self) -> Option<&dyn PreallocOp> {
        Some(self)
    }

    #[cfg(feature = "cuda")]
    fn as_device(&self) -> Option<&dyn DeviceOp> {
        Some(self)
    }
}

impl InPlaceOp for Binary {
    /// The left operand, valid only when it already has the output's shape.
    fn overwrites_input(&self) -> usize {
        0
    }

    fn execute_in_place(&self, mut target: Tensor, rest: &[&Tensor]) -> lathe_core::Result<Tensor> {
        target.binary_(rest[0], self.kind)?;
        Ok(target)
    }
}

impl PreallocOp for Binary {
    fn execute_into(&self, out: &mut Tensor, inputs: &[&Tensor]) -> lathe_core::Result<()> {
        inputs[0].binary_into(inputs[1], self.kind, out)
    }
}

#[cfg(feature = "cuda")]
impl DeviceOp for Binary {
    fn supports_device(&self, dtype: DType, shapes: &[&Shape]) -> bool {
        lathe_core::cuda::supports(dtype) && shapes.windows(2).all(|w| w[0] == w[1])
    }

    fn execute_on_device(&self, inputs: &[&Tensor]) -> lathe_core::Result<Tensor> {
        lathe_core::cuda::binary(inputs[0], inputs[1], self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity() {
        let add = Binary::new(BinaryKind::Add);
        assert_eq!(add.hashcode(), Binary::new(BinaryKind::Add).hashcode());
        assert!(add.op_eq(&Binary::new(BinaryKind::Add)));
        assert!(!add.op_eq(&Binary::new(BinaryKind::Mul)));
        assert!(!Unary::new(UnaryKind::Neg).op_eq(&add));
    }

    #[test]
    fn test_infer_shape_broadcasts() {
        let mul = Binary::new(BinaryKind::Mul);
        let s = mul
            .infer_shape(&[&Shape::new(&[2, 3]), &Shape::scalar()])
            .unwrap();
        assert_eq!(s.dims(), &[2, 3]);
    }

    #[test]
    fn test_integer_arithmetic_nodes() {
        let mut g = Graph::new();
        let a = g.input("a", DType::I32, [3]);
        let b = g.input("b", DType::I32, Shape::scalar());
        let q = g.div(a, b).unwrap();
        let s = g.sum(q).unwrap();
        assert_eq!(g.node(s).unwrap().dtype(), DType::I32);

        let out = Binary::new(BinaryKind::Div)
            .execute(&[
                &Tensor::from_host(lathe_core::HostData::I32(vec![9, 4, -6]), [3]).unwrap(),
                &Tensor::scalar(2.0, DType::I32),
            ])
            .unwrap();
        assert_eq!(out.to_f64_vec().unwrap(), vec![4.0, 2.0, -3.0]);

        assert!(matches!(g.exp(a), Err(GraphError::UnsupportedType { .. })));
        let f = g.input("f", DType::F32, [3]);
        assert!(matches!(g.add(a, f), Err(GraphError::TypeUnification { .. })));
    }

    #[test]
    fn test_execute_strategies() {
        let div = Binary::new(BinaryKind::Div);
        let a = Tensor::from_f64(&[1.0, 4.0], &[2]);
        let b = Tensor::from_f64(&[2.0, 8.0], &[2]);

        let fresh = div.execute(&[&a, &b]).unwrap();
        let inplace = div.execute_in_place(a.clone(), &[&b]).unwrap();
        let mut out = Tensor::zeros(a.shape(), DType::F64);
        div.execute_into(&mut out, &[&a, &b]).unwrap();

        assert_eq!(fresh.as_f64_slice().unwrap(), &[0.5, 0.5]);
        assert_eq!(fresh, inplace);
        assert_eq!(fresh, out);
    }

    #[test]
    fn test_log_derivative_structure() {
        let mut g = Graph::new();
        let x = g.input("x", DType::F64, Shape::scalar());
        let y = g.log(x).unwrap();
        let seed = g.scalar(1.0, DType::F64);
        let grads = Unary::new(UnaryKind::Log)
            .sym_diff(&mut g, &[x], y, seed)
            .unwrap();
        let dx = grads[0].unwrap();
        let n = g.node(dx).unwrap();
        assert_eq!(n.op().unwrap().name(), "div");
        assert_eq!(n.operands(), &[seed, x]);
    }

    #[test]
    fn test_log1p_stabilized_form() {
        let mut g = Graph::new();
        let x = g.input("x", DType::F64, Shape::scalar());
        let y = g.log1p(x).unwrap();
        let seed = g.scalar(1.0, DType::F64);
        let op = Unary::new(UnaryKind::Log1p);

        let plain = op.sym_diff(&mut g, &[x], y, seed).unwrap()[0].unwrap();
        assert_eq!(g.node(plain).unwrap().op().unwrap().name(), "mul");

        let stable = op
            .stabilized_sym_diff(&mut g, &[x], y, seed)
            .unwrap()
            .unwrap()[0]
            .unwrap();
        let n = g.node(stable).unwrap();
        assert_eq!(n.op().unwrap().name(), "div");
        let denom = g.node(n.operands()[1]).unwrap();
        assert_eq!(denom.op().unwrap().name(), "add");
        assert_eq!(denom.operands()[0], x);

        assert!(Unary::new(UnaryKind::Log)
            .stabilized_sym_diff(&mut g, &[x], y, seed)
            .is_none());
    }

    #[test]
    fn test_broadcast_mul_gradient_reduces() {
        let mut g = Graph::new();
        let v = g.input("v", DType::F64, [3]);
        let s = g.input("s", DType::F64, Shape::scalar());
        let out = g.mul(v, s).unwrap();
        let seed = g.constant(Tensor::ones(&Shape::new(&[3]), DType::F64));
        let grads = Binary::new(BinaryKind::Mul)
            .sym_diff(&mut g, &[v, s], out, seed)
            .unwrap();
        assert_eq!(g.node(grads[0].unwrap()).unwrap().shape().dims(), &[3]);
        let ds = g.node(grads[1].unwrap()).unwrap();
        assert!(ds.shape().is_scalar());
        assert_eq!(ds.op().unwrap().name(), "reduce_to");
    }
}
