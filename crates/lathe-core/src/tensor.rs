use std::fmt;
use std::hash::{Hash, Hasher};

use crate::dtype::DType;
use crate::device::Device;
use crate::error::CoreError;
use crate::shape::Shape;
use crate::storage::{HostData, Storage};
use crate::Result;

/// A dense, contiguous, row-major value bound to a graph node or register.
///
/// Cloning shares storage. Mutating methods (suffixed `_`) write in place when
/// the storage is uniquely owned and copy first otherwise.
///
/// # Examples
///
/// ```
/// use lathe_core::{DType, Tensor};
///
/// let t = Tensor::from_f64(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
/// assert_eq!(t.shape().dims(), &[2, 2]);
/// assert_eq!(t.dtype(), DType::F64);
///
/// let s = Tensor::scalar(0.5, DType::F32);
/// assert!(s.shape().is_scalar());
/// ```
#[derive(Clone)]
pub struct Tensor {
    storage: Storage,
    shape: Shape,
}

impl Tensor {
    // =========================================================================
    // Constructors
    // =========================================================================

    /// Create a tensor from f32 data with the given shape.
    ///
    /// # Panics
    /// Panics if `data.len()` does not match the shape's element count.
    pub fn from_f32(data: &[f32], shape: &[usize]) -> Self {
        let s = Shape::new(shape);
        assert_eq!(
            s.numel(),
            data.len(),
            "Shape {:?} requires {} elements, got {}",
            shape,
            s.numel(),
            data.len()
        );
        Self {
            storage: Storage::from_f32(data.to_vec()),
            shape: s,
        }
    }

    /// Create a tensor from f64 data with the given shape.
    ///
    /// # Panics
    /// Panics if `data.len()` does not match the shape's element count.
    pub fn from_f64(data: &[f64], shape: &[usize]) -> Self {
        let s = Shape::new(shape);
        assert_eq!(
            s.numel(),
            data.len(),
            "Shape {:?} requires {} elements, got {}",
            shape,
            s.numel(),
            data.len()
        );
        Self {
            storage: Storage::from_f64(data.to_vec()),
            shape: s,
        }
    }

    /// Wrap an owned host buffer, checking it against the shape.
    pub fn from_host(data: HostData, shape: impl Into<Shape>) -> Result<Self> {
        Self::from_storage(Storage::from_host(data), shape.into())
    }

    /// Wrap existing storage, checking it against the shape.
    pub fn from_storage(storage: Storage, shape: Shape) -> Result<Self> {
        if storage.numel() != shape.numel() {
            return Err(CoreError::StorageError(format!(
                "shape {} requires {} elements, storage holds {}",
                shape,
                shape.numel(),
                storage.numel()
            )));
        }
        Ok(Self { storage, shape })
    }

    /// A 0-dimensional tensor holding `value` converted to `dtype`.
    pub fn scalar(value: f64, dtype: DType) -> Self {
        Self::full(&Shape::scalar(), dtype, value)
    }

    /// Create a tensor of zeros with the given shape and dtype.
    pub fn zeros(shape: &Shape, dtype: DType) -> Self {
        Self {
            storage: Storage::zeros(dtype, shape.numel()),
            shape: shape.clone(),
        }
    }

    /// Create a tensor of ones with the given shape and dtype.
    pub fn ones(shape: &Shape, dtype: DType) -> Self {
        Self::full(shape, dtype, 1.0)
    }

    /// Create a tensor filled with `value` converted to `dtype`.
    pub fn full(shape: &Shape, dtype: DType, value: f64) -> Self {
        let n = shape.numel();
        let data = match dtype {
            DType::F32 => HostData::F32(vec![value as f32; n]),
            DType::F64 => HostData::F64(vec![value; n]),
            DType::I32 => HostData::I32(vec![value as i32; n]),
            DType::I64 => HostData::I64(vec![value as i64; n]),
        };
        Self {
            storage: Storage::from_host(data),
            shape: shape.clone(),
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.storage.dtype()
    }

    pub fn device(&self) -> Device {
        self.storage.device()
    }

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    pub fn storage_ref(&self) -> &Storage {
        &self.storage
    }

    pub(crate) fn storage_mut(&mut self) -> &mut Storage {
        &mut self.storage
    }

    /// Host buffer, or `NotOnHost` for device tensors.
    pub fn host(&self) -> Result<&HostData> {
        self.storage.host()
    }

    pub fn as_f32_slice(&self) -> Option<&[f32]> {
        self.storage.as_f32_slice()
    }

    pub fn as_f64_slice(&self) -> Option<&[f64]> {
        self.storage.as_f64_slice()
    }

    /// Whether this handle is the only reference to its storage.
    pub fn is_unique(&self) -> bool {
        self.storage.is_unique()
    }

    /// Copy every element out as f64.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        Ok(self.host()?.to_f64_vec())
    }

    /// The single element of a one-element tensor, as f64.
    pub fn item(&self) -> Result<f64> {
        if self.numel() != 1 {
            return Err(CoreError::ShapeMismatch {
                expected: vec![],
                got: self.shape.dims().to_vec(),
            });
        }
        Ok(self.to_f64_vec()?[0])
    }

    /// Same shape and dtype.
    pub fn same_layout(&self, other: &Tensor) -> bool {
        self.shape == other.shape && self.dtype() == other.dtype()
    }

    /// Fail unless this tensor has exactly the given shape and dtype.
    pub fn check_layout(&self, shape: &Shape, dtype: DType) -> Result<()> {
        if self.dtype() != dtype {
            return Err(CoreError::DTypeMismatch {
                expected: dtype,
                got: self.dtype(),
            });
        }
        if &self.shape != shape {
            return Err(CoreError::ShapeMismatch {
                expected: shape.dims().to_vec(),
                got: self.shape.dims().to_vec(),
            });
        }
        Ok(())
    }

    /// Bitwise equality of host contents (NaNs with equal payloads compare equal).
    /// Device tensors only compare equal to handles of the same allocation.
    pub fn bit_eq(&self, other: &Tensor) -> bool {
        if !self.same_layout(other) {
            return false;
        }
        if self.storage.shares_with(&other.storage) {
            return true;
        }
        match (self.host(), other.host()) {
            (Ok(a), Ok(b)) => a.as_bytes() == b.as_bytes(),
            _ => false,
        }
    }

    /// Feed dtype, shape and content bytes into a hasher.
    pub fn hash_content<H: Hasher>(&self, state: &mut H) {
        self.dtype().hash(state);
        self.shape.hash(state);
        if let Ok(host) = self.host() {
            host.as_bytes().hash(state);
        }
    }

    // =========================================================================
    // Device transport
    // =========================================================================

    /// Copy to `device`. A no-op clone when already there.
    pub fn to_device(&self, device: Device) -> Result<Tensor> {
        if device == self.device() {
            return Ok(self.clone());
        }
        let storage = match device {
            Device::Cpu => self.download()?,
            Device::Cuda(idx) => self.upload(idx)?,
        };
        tracing::trace!(from = %self.device(), to = %device, numel = self.numel(), "tensor transfer");
        Ok(Self {
            storage,
            shape: self.shape.clone(),
        })
    }

    #[cfg(feature = "cuda")]
    fn upload(&self, idx: usize) -> Result<Storage> {
        self.storage.to_cuda(idx)
    }

    #[cfg(not(feature = "cuda"))]
    fn upload(&self, idx: usize) -> Result<Storage> {
        Err(CoreError::DeviceUnavailable(Device::Cuda(idx)))
    }

    #[cfg(feature = "cuda")]
    fn download(&self) -> Result<Storage> {
        self.storage.to_host()
    }

    #[cfg(not(feature = "cuda"))]
    fn download(&self) -> Result<Storage> {
        Ok(self.storage.clone())
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.bit_eq(other)
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor({}, {}, {}", self.shape, self.dtype(), self.device())?;
        if let Ok(host) = self.host() {
            let values = host.to_f64_vec();
            if values.len() <= 8 {
                write!(f, ", {values:?}")?;
            } else {
                write!(f, ", {:?}..", &values[..8])?;
            }
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_f64() {
        let t = Tensor::from_f64(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        assert_eq!(t.shape().dims(), &[2, 3]);
        assert_eq!(t.numel(), 6);
        assert_eq!(t.dtype(), DType::F64);
        assert_eq!(t.device(), Device::Cpu);
    }

    #[test]
    #[should_panic]
    fn test_from_f32_wrong_len() {
        Tensor::from_f32(&[1.0, 2.0], &[3]);
    }

    #[test]
    fn test_scalar_and_full() {
        let s = Tensor::scalar(2.5, DType::F32);
        assert!(s.shape().is_scalar());
        assert_eq!(s.item().unwrap(), 2.5);

        let t = Tensor::full(&Shape::new(&[2]), DType::I64, 3.0);
        assert_eq!(t.to_f64_vec().unwrap(), vec![3.0, 3.0]);
    }

    #[test]
    fn test_item_requires_single_element() {
        let t = Tensor::zeros(&Shape::new(&[2]), DType::F64);
        assert!(t.item().is_err());
    }

    #[test]
    fn test_check_layout() {
        let t = Tensor::zeros(&Shape::new(&[2, 2]), DType::F32);
        assert!(t.check_layout(&Shape::new(&[2, 2]), DType::F32).is_ok());
        assert!(matches!(
            t.check_layout(&Shape::new(&[4]), DType::F32),
            Err(CoreError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            t.check_layout(&Shape::new(&[2, 2]), DType::F64),
            Err(CoreError::DTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_bit_eq() {
        let a = Tensor::from_f64(&[1.0, f64::NAN], &[2]);
        let b = Tensor::from_f64(&[1.0, f64::NAN], &[2]);
        assert_eq!(a, b);
        assert_ne!(a, Tensor::from_f64(&[1.0, 2.0], &[2]));
        assert_ne!(a, Tensor::from_f32(&[1.0, 2.0], &[2]));
    }

    #[test]
    fn test_to_same_device_shares_storage() {
        let a = Tensor::from_f32(&[1.0], &[1]);
        let b = a.to_device(Device::Cpu).unwrap();
        assert!(a.storage_ref().shares_with(b.storage_ref()));
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn test_cuda_unavailable_without_feature() {
        let a = Tensor::from_f32(&[1.0], &[1]);
        assert!(matches!(
            a.to_device(Device::Cuda(0)),
            Err(CoreError::DeviceUnavailable(Device::Cuda(0)))
        ));
    }
}
