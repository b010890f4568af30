use smallvec::SmallVec;
use std::fmt;

/// Dimensions of a contiguous row-major value. A rank-0 shape is a scalar.
///
/// Up to four dims are kept inline; graph nodes and registers compare shapes
/// by value, so `Hash` and `Eq` are over the dims alone.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape {
    dims: SmallVec<[usize; 4]>,
}

impl Shape {
    pub fn new(dims: &[usize]) -> Self {
        Self {
            dims: SmallVec::from_slice(dims),
        }
    }

    pub fn scalar() -> Self {
        Self::default()
    }

    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    /// Element count; 1 for a scalar.
    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn dim(&self, axis: usize) -> Option<usize> {
        self.dims.get(axis).copied()
    }

    pub fn is_scalar(&self) -> bool {
        self.dims.is_empty()
    }

    /// Row-major strides, in elements.
    pub fn contiguous_strides(&self) -> SmallVec<[usize; 4]> {
        let mut strides: SmallVec<[usize; 4]> = SmallVec::from_elem(1, self.dims.len());
        let mut acc = 1;
        for (stride, &d) in strides.iter_mut().zip(&self.dims).rev() {
            *stride = acc;
            acc *= d;
        }
        strides
    }

    /// Result shape of an elementwise op over `self` and `other`.
    ///
    /// Dims are matched from the right; a missing or size-1 dim stretches to
    /// the other side. `None` when two matched dims differ and neither is 1.
    pub fn broadcast_with(&self, other: &Shape) -> Option<Shape> {
        let rank = self.ndim().max(other.ndim());
        let mut dims: SmallVec<[usize; 4]> = SmallVec::from_elem(1, rank);
        for (k, out) in dims.iter_mut().rev().enumerate() {
            *out = match (self.from_right(k), other.from_right(k)) {
                (a, b) if a == b => a,
                (1, b) => b,
                (a, 1) => a,
                _ => return None,
            };
        }
        Some(Shape { dims })
    }

    /// Whether a value of this shape can be stretched to exactly `target`.
    /// Gradient seeds and `BroadcastTo` operands must satisfy this.
    pub fn broadcasts_to(&self, target: &Shape) -> bool {
        self.ndim() <= target.ndim() && self.broadcast_with(target).as_ref() == Some(target)
    }

    /// Flat index into a source of shape `src` that element `flat_idx` of
    /// `self` (the broadcast result) reads from.
    pub fn broadcast_source_index(&self, flat_idx: usize, src: &Shape) -> usize {
        let offset = self.ndim() - src.ndim();
        let src_strides = src.contiguous_strides();

        let mut rest = flat_idx;
        let mut idx = 0;
        for (axis, &d) in self.dims.iter().enumerate().rev() {
            let coord = rest % d;
            rest /= d;
            if axis < offset {
                break;
            }
            let s = axis - offset;
            if src.dims[s] != 1 {
                idx += coord * src_strides[s];
            }
        }
        idx
    }

    fn from_right(&self, k: usize) -> usize {
        self.ndim()
            .checked_sub(k + 1)
            .map_or(1, |axis| self.dims[axis])
    }
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shape({:?})", self.dims.as_slice())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, ")")
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::new(dims)
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape {
            dims: SmallVec::from_vec(dims),
        }
    }
}

impl From<&Shape> for Shape {
    fn from(shape: &Shape) -> Self {
        shape.clone()
    }
}

macro_rules! impl_shape_from_array {
    ($($n:expr),*) => {
        $(
            impl From<[usize; $n]> for Shape {
                fn from(dims: [usize; $n]) -> Self {
                    Shape::new(&dims)
                }
            }
        )*
    };
}

impl_shape_from_array!(0, 1, 2, 3, 4, 5, 6);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar() {
        let s = Shape::scalar();
        assert_eq!(s.ndim(), 0);
        assert_eq!(s.numel(), 1);
        assert!(s.is_scalar());
    }

    #[test]
    fn test_basic_shape() {
        let s = Shape::new(&[2, 3, 4]);
        assert_eq!(s.ndim(), 3);
        assert_eq!(s.numel(), 24);
        assert_eq!(s.dim(2), Some(4));
        assert_eq!(s.dim(3), None);
        assert_eq!(s.contiguous_strides().as_slice(), &[12, 4, 1]);
    }

    #[test]
    fn test_broadcast() {
        let a = Shape::new(&[3, 1]);
        let b = Shape::new(&[1, 4]);
        assert_eq!(a.broadcast_with(&b).unwrap().dims(), &[3, 4]);

        let a = Shape::new(&[2, 3]);
        assert_eq!(a.broadcast_with(&Shape::scalar()).unwrap(), a);
        assert!(a.broadcast_with(&Shape::new(&[4, 3])).is_none());
    }

    #[test]
    fn test_broadcasts_to() {
        let target = Shape::new(&[2, 3]);
        assert!(Shape::scalar().broadcasts_to(&target));
        assert!(Shape::new(&[3]).broadcasts_to(&target));
        assert!(Shape::new(&[2, 1]).broadcasts_to(&target));
        assert!(!Shape::new(&[2, 3, 1]).broadcasts_to(&target));
        assert!(!Shape::new(&[4]).broadcasts_to(&target));
    }

    #[test]
    fn test_broadcast_source_index() {
        let out = Shape::new(&[2, 3]);
        let row = Shape::new(&[3]);
        let col = Shape::new(&[2, 1]);
        // element (1, 2) has flat index 5
        assert_eq!(out.broadcast_source_index(5, &row), 2);
        assert_eq!(out.broadcast_source_index(5, &col), 1);
        assert_eq!(out.broadcast_source_index(5, &Shape::scalar()), 0);
    }

    #[test]
    fn test_display() {
        assert_eq!(Shape::new(&[2, 3]).to_string(), "(2, 3)");
        assert_eq!(Shape::scalar().to_string(), "()");
    }
}
