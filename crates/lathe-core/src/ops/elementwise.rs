//! Element-wise arithmetic kernels.

use rayon::prelude::*;

use super::{Arith, BinaryKind, UnaryKind};
use crate::error::CoreError;
use crate::shape::Shape;
use crate::storage::HostData;
use crate::tensor::Tensor;
use crate::Result;

/// Below this many elements the rayon split costs more than it saves.
const PAR_THRESHOLD: usize = 1 << 15;

impl Tensor {
    // =========================================================================
    // Unary
    // =========================================================================

    /// Apply `kind` element-wise, allocating the result.
    pub fn unary(&self, kind: UnaryKind) -> Result<Tensor> {
        #[cfg(feature = "cuda")]
        if self.device().is_cuda() {
            return crate::cuda::unary(self, kind);
        }
        let data = match self.host()? {
            HostData::F32(v) => {
                let mut out = vec![0.0f32; v.len()];
                map_into(v, &mut out, |x| kind.apply(x));
                HostData::F32(out)
            }
            HostData::F64(v) => {
                let mut out = vec![0.0f64; v.len()];
                map_into(v, &mut out, |x| kind.apply(x));
                HostData::F64(out)
            }
            other => return Err(CoreError::UnsupportedDType(other.dtype())),
        };
        Tensor::from_host(data, self.shape().clone())
    }

    /// Apply `kind` element-wise, overwriting `self`.
    pub fn unary_(&mut self, kind: UnaryKind) -> Result<()> {
        match self.storage_mut().host_mut()? {
            HostData::F32(v) => map_inplace(v, |x| kind.apply(x)),
            HostData::F64(v) => map_inplace(v, |x| kind.apply(x)),
            other => return Err(CoreError::UnsupportedDType(other.dtype())),
        }
        Ok(())
    }

    /// Apply `kind` element-wise, writing into `out` (same shape and dtype as `self`).
    pub fn unary_into(&self, kind: UnaryKind, out: &mut Tensor) -> Result<()> {
        out.check_layout(self.shape(), self.dtype())?;
        match (self.host()?, out.storage_mut().host_mut()?) {
            (HostData::F32(src), HostData::F32(dst)) => map_into(src, dst, |x| kind.apply(x)),
            (HostData::F64(src), HostData::F64(dst)) => map_into(src, dst, |x| kind.apply(x)),
            (src, _) => return Err(CoreError::UnsupportedDType(src.dtype())),
        }
        Ok(())
    }

    // =========================================================================
    // Binary (broadcasting)
    // =========================================================================

    /// Apply `kind` element-wise with broadcasting, allocating the result.
    pub fn binary(&self, other: &Tensor, kind: BinaryKind) -> Result<Tensor> {
        #[cfg(feature = "cuda")]
        if self.device().is_cuda() || other.device().is_cuda() {
            return crate::cuda::binary(self, other, kind);
        }
        check_same_dtype(self, other)?;
        let out_shape = broadcast_shape(self, other)?;
        let mut out = Tensor::zeros(&out_shape, self.dtype());
        self.binary_into(other, kind, &mut out)?;
        Ok(out)
    }

    /// `self = self (kind) other`. The broadcast result must have `self`'s shape.
    pub fn binary_(&mut self, other: &Tensor, kind: BinaryKind) -> Result<()> {
        check_same_dtype(self, other)?;
        let out_shape = broadcast_shape(self, other)?;
        if &out_shape != self.shape() {
            return Err(CoreError::ShapeMismatch {
                expected: self.shape().dims().to_vec(),
                got: out_shape.dims().to_vec(),
            });
        }
        let shape = self.shape().clone();
        match (self.storage_mut().host_mut()?, other.host()?) {
            (HostData::F32(a), HostData::F32(b)) => zip_inplace(a, &shape, b, other.shape(), kind),
            (HostData::F64(a), HostData::F64(b)) => zip_inplace(a, &shape, b, other.shape(), kind),
            (HostData::I32(a), HostData::I32(b)) => zip_inplace(a, &shape, b, other.shape(), kind),
            (HostData::I64(a), HostData::I64(b)) => zip_inplace(a, &shape, b, other.shape(), kind),
            (a, _) => Err(CoreError::UnsupportedDType(a.dtype())),
        }
    }

    /// Apply `kind` with broadcasting, writing into `out`, which must already
    /// have the broadcast shape and the operands' dtype.
    pub fn binary_into(&self, other: &Tensor, kind: BinaryKind, out: &mut Tensor) -> Result<()> {
        check_same_dtype(self, other)?;
        let out_shape = broadcast_shape(self, other)?;
        out.check_layout(&out_shape, self.dtype())?;
        let (a_shape, b_shape) = (self.shape(), other.shape());
        match (self.host()?, other.host()?, out.storage_mut().host_mut()?) {
            (HostData::F32(a), HostData::F32(b), HostData::F32(dst)) => {
                zip_into((a, a_shape), (b, b_shape), (dst, &out_shape), kind)
            }
            (HostData::F64(a), HostData::F64(b), HostData::F64(dst)) => {
                zip_into((a, a_shape), (b, b_shape), (dst, &out_shape), kind)
            }
            (HostData::I32(a), HostData::I32(b), HostData::I32(dst)) => {
                zip_into((a, a_shape), (b, b_shape), (dst, &out_shape), kind)
            }
            (HostData::I64(a), HostData::I64(b), HostData::I64(dst)) => {
                zip_into((a, a_shape), (b, b_shape), (dst, &out_shape), kind)
            }
            (a, _, _) => Err(CoreError::UnsupportedDType(a.dtype())),
        }
    }

    // =========================================================================
    // Shorthands
    // =========================================================================

    /// Element-wise addition: self + other.
    pub fn add(&self, other: &Tensor) -> Result<Tensor> {
        self.binary(other, BinaryKind::Add)
    }

    /// Element-wise subtraction: self - other.
    pub fn sub(&self, other: &Tensor) -> Result<Tensor> {
        self.binary(other, BinaryKind::Sub)
    }

    /// Element-wise multiplication: self * other.
    pub fn mul(&self, other: &Tensor) -> Result<Tensor> {
        self.binary(other, BinaryKind::Mul)
    }

    /// Element-wise division: self / other.
    pub fn div(&self, other: &Tensor) -> Result<Tensor> {
        self.binary(other, BinaryKind::Div)
    }

    /// In-place accumulation: self += other.
    pub fn add_(&mut self, other: &Tensor) -> Result<()> {
        self.binary_(other, BinaryKind::Add)
    }

    pub fn neg(&self) -> Result<Tensor> {
        self.unary(UnaryKind::Neg)
    }

    pub fn exp(&self) -> Result<Tensor> {
        self.unary(UnaryKind::Exp)
    }

    pub fn log(&self) -> Result<Tensor> {
        self.unary(UnaryKind::Log)
    }
}

fn check_same_dtype(a: &Tensor, b: &Tensor) -> Result<()> {
    if a.dtype() != b.dtype() {
        return Err(CoreError::DTypeMismatch {
            expected: a.dtype(),
            got: b.dtype(),
        });
    }
    Ok(())
}

fn broadcast_shape(a: &Tensor, b: &Tensor) -> Result<Shape> {
    a.shape()
        .broadcast_with(b.shape())
        .ok_or_else(|| CoreError::BroadcastError {
            a: a.shape().dims().to_vec(),
            b: b.shape().dims().to_vec(),
        })
}

fn map_into<T: Copy + Send + Sync>(src: &[T], dst: &mut [T], f: impl Fn(T) -> T + Sync + Send) {
    if dst.len() >= PAR_THRESHOLD {
        dst.par_iter_mut()
            .zip(src.par_iter())
            .for_each(|(d, &s)| *d = f(s));
    } else {
        for (d, &s) in dst.iter_mut().zip(src) {
            *d = f(s);
        }
    }
}

fn map_inplace<T: Copy + Send + Sync>(data: &mut [T], f: impl Fn(T) -> T + Sync + Send) {
    if data.len() >= PAR_THRESHOLD {
        data.par_iter_mut().for_each(|d| *d = f(*d));
    } else {
        for d in data.iter_mut() {
            *d = f(*d);
        }
    }
}

fn check_divisors<T: Arith>(kind: BinaryKind, b: &[T]) -> Result<()> {
    if kind == BinaryKind::Div && b.iter().any(|&d| d.is_zero_divisor()) {
        return Err(CoreError::DivisionByZero);
    }
    Ok(())
}

fn zip_into<T: Arith>(
    (a, a_shape): (&[T], &Shape),
    (b, b_shape): (&[T], &Shape),
    (out, out_shape): (&mut [T], &Shape),
    kind: BinaryKind,
) -> Result<()> {
    check_divisors(kind, b)?;
    let f = move |x: T, y: T| kind.apply(x, y);
    if a_shape == out_shape && b_shape == out_shape {
        // Fast path: same shape
        if out.len() >= PAR_THRESHOLD {
            out.par_iter_mut()
                .zip(a.par_iter().zip(b.par_iter()))
                .for_each(|(o, (&x, &y))| *o = f(x, y));
        } else {
            for ((o, &x), &y) in out.iter_mut().zip(a).zip(b) {
                *o = f(x, y);
            }
        }
    } else if a_shape == out_shape && b.len() == 1 {
        let y = b[0];
        map_into(a, out, |x| f(x, y));
    } else if b_shape == out_shape && a.len() == 1 {
        let x = a[0];
        map_into(b, out, |y| f(x, y));
    } else {
        for (i, o) in out.iter_mut().enumerate() {
            let ai = out_shape.broadcast_source_index(i, a_shape);
            let bi = out_shape.broadcast_source_index(i, b_shape);
            *o = f(a[ai], b[bi]);
        }
    }
    Ok(())
}

fn zip_inplace<T: Arith>(
    a: &mut [T],
    shape: &Shape,
    b: &[T],
    b_shape: &Shape,
    kind: BinaryKind,
) -> Result<()> {
    check_divisors(kind, b)?;
    let f = move |x: T, y: T| kind.apply(x, y);
    if b_shape == shape {
        if a.len() >= PAR_THRESHOLD {
            a.par_iter_mut()
                .zip(b.par_iter())
                .for_each(|(x, &y)| *x = f(*x, y));
        } else {
            for (x, &y) in a.iter_mut().zip(b) {
                *x = f(*x, y);
            }
        }
    } else if b.len() == 1 {
        let y = b[0];
        map_inplace(a, |x| f(x, y));
    } else {
        for (i, x) in a.iter_mut().enumerate() {
            *x = f(*x, b[shape.broadcast_source_index(i, b_shape)]);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DType;

    #[test]
    fn test_add_same_shape() {
        let a = Tensor::from_f32(&[1.0, 2.0, 3.0], &[3]);
        let b = Tensor::from_f32(&[4.0, 5.0, 6.0], &[3]);
        let c = a.add(&b).unwrap();
        assert_eq!(c.as_f32_slice().unwrap(), &[5.0, 7.0, 9.0]);
    }

    #[test]
    fn test_mul_broadcast_scalar() {
        let a = Tensor::from_f64(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let s = Tensor::scalar(2.0, DType::F64);
        let c = a.mul(&s).unwrap();
        assert_eq!(c.as_f64_slice().unwrap(), &[2.0, 4.0, 6.0, 8.0]);
        let d = s.sub(&a).unwrap();
        assert_eq!(d.as_f64_slice().unwrap(), &[1.0, 0.0, -1.0, -2.0]);
    }

    #[test]
    fn test_broadcast_row_and_column() {
        let col = Tensor::from_f64(&[1.0, 2.0], &[2, 1]);
        let row = Tensor::from_f64(&[10.0, 20.0, 30.0], &[3]);
        let c = col.add(&row).unwrap();
        assert_eq!(c.shape().dims(), &[2, 3]);
        assert_eq!(
            c.as_f64_slice().unwrap(),
            &[11.0, 21.0, 31.0, 12.0, 22.0, 32.0]
        );
    }

    #[test]
    fn test_incompatible_broadcast() {
        let a = Tensor::from_f64(&[1.0, 2.0], &[2]);
        let b = Tensor::from_f64(&[1.0, 2.0, 3.0], &[3]);
        assert!(matches!(a.add(&b), Err(CoreError::BroadcastError { .. })));
    }

    #[test]
    fn test_dtype_mismatch() {
        let a = Tensor::from_f64(&[1.0], &[1]);
        let b = Tensor::from_f32(&[1.0], &[1]);
        assert!(matches!(a.add(&b), Err(CoreError::DTypeMismatch { .. })));
    }

    #[test]
    fn test_integer_unary_unsupported() {
        let a = Tensor::full(&Shape::new(&[2]), DType::I32, 1.0);
        assert!(matches!(a.exp(), Err(CoreError::UnsupportedDType(DType::I32))));
    }

    #[test]
    fn test_integer_binary() {
        let a = Tensor::from_host(HostData::I64(vec![7, -7, 9]), [3]).unwrap();
        let two = Tensor::scalar(2.0, DType::I64);
        assert_eq!(a.div(&two).unwrap().to_f64_vec().unwrap(), vec![3.0, -3.0, 4.0]);
        assert_eq!(a.mul(&two).unwrap().to_f64_vec().unwrap(), vec![14.0, -14.0, 18.0]);

        let mut acc = Tensor::from_host(HostData::I32(vec![1, 2, 3]), [3]).unwrap();
        let step = Tensor::from_host(HostData::I32(vec![10, 20, 30]), [3]).unwrap();
        acc.add_(&step).unwrap();
        assert_eq!(acc.to_f64_vec().unwrap(), vec![11.0, 22.0, 33.0]);
    }

    #[test]
    fn test_integer_division_by_zero() {
        let a = Tensor::from_host(HostData::I32(vec![4, 5]), [2]).unwrap();
        let b = Tensor::from_host(HostData::I32(vec![2, 0]), [2]).unwrap();
        assert!(matches!(a.div(&b), Err(CoreError::DivisionByZero)));

        let mut c = a.clone();
        assert!(matches!(c.binary_(&b, BinaryKind::Div), Err(CoreError::DivisionByZero)));
        assert_eq!(c.to_f64_vec().unwrap(), vec![4.0, 5.0]);

        // floats follow IEEE
        let x = Tensor::from_f64(&[1.0], &[1]);
        let zero = Tensor::from_f64(&[0.0], &[1]);
        assert_eq!(x.div(&zero).unwrap().to_f64_vec().unwrap(), vec![f64::INFINITY]);
    }

    #[test]
    fn test_unary_strategies_agree() {
        let a = Tensor::from_f64(&[0.5, 1.0, 2.0], &[3]);
        let fresh = a.unary(UnaryKind::Log1p).unwrap();

        let mut inplace = a.clone();
        inplace.unary_(UnaryKind::Log1p).unwrap();

        let mut prealloc = Tensor::zeros(a.shape(), DType::F64);
        a.unary_into(UnaryKind::Log1p, &mut prealloc).unwrap();

        assert_eq!(fresh, inplace);
        assert_eq!(fresh, prealloc);
        // the in-place write copied, so the original is untouched
        assert_eq!(a.as_f64_slice().unwrap(), &[0.5, 1.0, 2.0]);
    }

    #[test]
    fn test_binary_inplace_unique_buffer() {
        let mut a = Tensor::from_f32(&[1.0, 2.0], &[2]);
        let before = a.as_f32_slice().unwrap().as_ptr();
        a.add_(&Tensor::scalar(1.0, DType::F32)).unwrap();
        assert_eq!(a.as_f32_slice().unwrap(), &[2.0, 3.0]);
        assert_eq!(a.as_f32_slice().unwrap().as_ptr(), before);
    }

    #[test]
    fn test_binary_inplace_rejects_growing_shape() {
        let mut s = Tensor::scalar(1.0, DType::F64);
        let v = Tensor::from_f64(&[1.0, 2.0], &[2]);
        assert!(matches!(s.add_(&v), Err(CoreError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_binary_into_checks_layout() {
        let a = Tensor::from_f64(&[1.0, 2.0], &[2]);
        let mut wrong = Tensor::zeros(&Shape::new(&[3]), DType::F64);
        assert!(a.binary_into(&a, BinaryKind::Mul, &mut wrong).is_err());

        let mut out = Tensor::zeros(&Shape::new(&[2]), DType::F64);
        a.binary_into(&a, BinaryKind::Mul, &mut out).unwrap();
        assert_eq!(out.as_f64_slice().unwrap(), &[1.0, 4.0]);
    }

    #[test]
    fn test_large_parallel_path_matches_sequential() {
        let n = PAR_THRESHOLD + 3;
        let data: Vec<f64> = (0..n).map(|i| i as f64 * 0.001).collect();
        let a = Tensor::from_f64(&data, &[n]);
        let e = a.exp().unwrap();
        let got = e.as_f64_slice().unwrap();
        for (i, &x) in data.iter().enumerate() {
            assert_eq!(got[i], x.exp());
        }
    }
}
