//! Reductions and broadcast expansion.
//!
//! Reductions run sequentially in index order so repeated runs are bit-identical.

use super::Arith;
use crate::error::CoreError;
use crate::shape::Shape;
use crate::storage::HostData;
use crate::tensor::Tensor;
use crate::Result;

impl Tensor {
    /// Sum of all elements as a scalar tensor.
    pub fn sum_all(&self) -> Result<Tensor> {
        let data = match self.host()? {
            HostData::F32(v) => HostData::F32(vec![sum(v)]),
            HostData::F64(v) => HostData::F64(vec![sum(v)]),
            HostData::I32(v) => HostData::I32(vec![sum(v)]),
            HostData::I64(v) => HostData::I64(vec![sum(v)]),
        };
        Tensor::from_host(data, Shape::scalar())
    }

    /// Expand to `target` by repeating along broadcast axes.
    pub fn broadcast_to(&self, target: &Shape) -> Result<Tensor> {
        if !self.shape().broadcasts_to(target) {
            return Err(CoreError::BroadcastError {
                a: self.shape().dims().to_vec(),
                b: target.dims().to_vec(),
            });
        }
        let src = self.shape();
        let n = target.numel();
        let data = match self.host()? {
            HostData::F32(v) => HostData::F32(expand(v, src, target, n)),
            HostData::F64(v) => HostData::F64(expand(v, src, target, n)),
            HostData::I32(v) => HostData::I32(expand(v, src, target, n)),
            HostData::I64(v) => HostData::I64(expand(v, src, target, n)),
        };
        Tensor::from_host(data, target.clone())
    }

    /// Sum over the axes that broadcasting `target` up to `self.shape()` would
    /// have expanded. The inverse of [`Tensor::broadcast_to`] for gradients.
    pub fn reduce_to(&self, target: &Shape) -> Result<Tensor> {
        if !target.broadcasts_to(self.shape()) {
            return Err(CoreError::BroadcastError {
                a: self.shape().dims().to_vec(),
                b: target.dims().to_vec(),
            });
        }
        let data = match self.host()? {
            HostData::F32(v) => HostData::F32(reduce(v, self.shape(), target)),
            HostData::F64(v) => HostData::F64(reduce(v, self.shape(), target)),
            HostData::I32(v) => HostData::I32(reduce(v, self.shape(), target)),
            HostData::I64(v) => HostData::I64(reduce(v, self.shape(), target)),
        };
        Tensor::from_host(data, target.clone())
    }
}

fn sum<T: Arith>(v: &[T]) -> T {
    v.iter().fold(T::ZERO, |acc, &x| acc.add(x))
}

fn expand<T: Copy>(v: &[T], src: &Shape, target: &Shape, n: usize) -> Vec<T> {
    (0..n).map(|i| v[target.broadcast_source_index(i, src)]).collect()
}

fn reduce<T: Arith>(v: &[T], src: &Shape, target: &Shape) -> Vec<T> {
    let mut out = vec![T::ZERO; target.numel()];
    for (i, &x) in v.iter().enumerate() {
        let j = src.broadcast_source_index(i, target);
        out[j] = out[j].add(x);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DType;

    #[test]
    fn test_sum_all() {
        let t = Tensor::from_f64(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let s = t.sum_all().unwrap();
        assert!(s.shape().is_scalar());
        assert_eq!(s.item().unwrap(), 10.0);
    }

    #[test]
    fn test_broadcast_to() {
        let s = Tensor::scalar(3.0, DType::F32);
        let b = s.broadcast_to(&Shape::new(&[2, 2])).unwrap();
        assert_eq!(b.as_f32_slice().unwrap(), &[3.0; 4]);

        let row = Tensor::from_f64(&[1.0, 2.0], &[2]);
        let b = row.broadcast_to(&Shape::new(&[2, 2])).unwrap();
        assert_eq!(b.as_f64_slice().unwrap(), &[1.0, 2.0, 1.0, 2.0]);

        assert!(row.broadcast_to(&Shape::new(&[3])).is_err());
    }

    #[test]
    fn test_reduce_to() {
        let t = Tensor::from_f64(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let rows = t.reduce_to(&Shape::new(&[3])).unwrap();
        assert_eq!(rows.as_f64_slice().unwrap(), &[5.0, 7.0, 9.0]);

        let cols = t.reduce_to(&Shape::new(&[2, 1])).unwrap();
        assert_eq!(cols.as_f64_slice().unwrap(), &[6.0, 15.0]);

        let all = t.reduce_to(&Shape::scalar()).unwrap();
        assert_eq!(all.item().unwrap(), 21.0);
    }

    #[test]
    fn test_integer_reductions() {
        let t = Tensor::from_host(HostData::I32(vec![1, 2, 3, 4, 5, 6]), [2, 3]).unwrap();
        assert_eq!(t.sum_all().unwrap().item().unwrap(), 21.0);
        let rows = t.reduce_to(&Shape::new(&[3])).unwrap();
        assert_eq!(rows.dtype(), DType::I32);
        assert_eq!(rows.to_f64_vec().unwrap(), vec![5.0, 7.0, 9.0]);
        let back = rows.broadcast_to(&Shape::new(&[2, 3])).unwrap();
        assert_eq!(back.to_f64_vec().unwrap(), vec![5.0, 7.0, 9.0, 5.0, 7.0, 9.0]);
    }
}
