use std::sync::Arc;

use crate::{CoreError, DType, Device, Result};

#[cfg(feature = "cuda")]
use cudarc::driver::{CudaDevice, CudaSlice};

/// Typed host buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum HostData {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I32(Vec<i32>),
    I64(Vec<i64>),
}

impl HostData {
    /// Zero-filled buffer of `numel` elements.
    pub fn zeros(dtype: DType, numel: usize) -> Self {
        match dtype {
            DType::F32 => HostData::F32(vec![0.0; numel]),
            DType::F64 => HostData::F64(vec![0.0; numel]),
            DType::I32 => HostData::I32(vec![0; numel]),
            DType::I64 => HostData::I64(vec![0; numel]),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            HostData::F32(_) => DType::F32,
            HostData::F64(_) => DType::F64,
            HostData::I32(_) => DType::I32,
            HostData::I64(_) => DType::I64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            HostData::F32(v) => v.len(),
            HostData::F64(v) => v.len(),
            HostData::I32(v) => v.len(),
            HostData::I64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw byte view, used for device uploads and identity hashing.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            HostData::F32(v) => bytemuck::cast_slice(v),
            HostData::F64(v) => bytemuck::cast_slice(v),
            HostData::I32(v) => bytemuck::cast_slice(v),
            HostData::I64(v) => bytemuck::cast_slice(v),
        }
    }

    /// Rebuild a typed buffer from raw bytes (e.g. after a device download).
    pub fn from_bytes(dtype: DType, bytes: &[u8]) -> Result<Self> {
        if bytes.len() % dtype.element_size() != 0 {
            return Err(CoreError::StorageError(format!(
                "{} bytes is not a whole number of {} elements",
                bytes.len(),
                dtype
            )));
        }
        // pod_collect_to_vec copies, so the source alignment does not matter.
        Ok(match dtype {
            DType::F32 => HostData::F32(bytemuck::pod_collect_to_vec(bytes)),
            DType::F64 => HostData::F64(bytemuck::pod_collect_to_vec(bytes)),
            DType::I32 => HostData::I32(bytemuck::pod_collect_to_vec(bytes)),
            DType::I64 => HostData::I64(bytemuck::pod_collect_to_vec(bytes)),
        })
    }

    /// Widen every element to f64.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        match self {
            HostData::F32(v) => v.iter().map(|&x| x as f64).collect(),
            HostData::F64(v) => v.clone(),
            HostData::I32(v) => v.iter().map(|&x| x as f64).collect(),
            HostData::I64(v) => v.iter().map(|&x| x as f64).collect(),
        }
    }
}

/// Backing storage for tensor data.
#[derive(Debug, Clone)]
pub enum StorageData {
    /// Host heap storage.
    Host(HostData),
    /// CUDA GPU storage with device handle and raw byte buffer.
    #[cfg(feature = "cuda")]
    Cuda {
        device: Arc<CudaDevice>,
        buffer: Arc<CudaSlice<u8>>,
        device_idx: usize,
    },
}

/// Shared, reference-counted, copy-on-write tensor storage.
///
/// Cloning is cheap. A register that holds the only reference can be
/// mutated in place; otherwise the first mutation copies.
#[derive(Debug, Clone)]
pub struct Storage {
    data: Arc<StorageData>,
    dtype: DType,
    device: Device,
    numel: usize,
}

impl Storage {
    /// Allocate zeroed host storage for `numel` elements of the given dtype.
    pub fn zeros(dtype: DType, numel: usize) -> Self {
        Self::from_host(HostData::zeros(dtype, numel))
    }

    /// Wrap an owned host buffer.
    pub fn from_host(data: HostData) -> Self {
        Self {
            dtype: data.dtype(),
            numel: data.len(),
            device: Device::Cpu,
            data: Arc::new(StorageData::Host(data)),
        }
    }

    pub fn from_f32(data: Vec<f32>) -> Self {
        Self::from_host(HostData::F32(data))
    }

    pub fn from_f64(data: Vec<f64>) -> Self {
        Self::from_host(HostData::F64(data))
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Number of logical elements.
    pub fn numel(&self) -> usize {
        self.numel
    }

    /// Size in bytes.
    pub fn nbytes(&self) -> usize {
        self.dtype.storage_bytes(self.numel)
    }

    /// Read-only host buffer, or `NotOnHost` for device storage.
    pub fn host(&self) -> Result<&HostData> {
        match self.data.as_ref() {
            StorageData::Host(h) => Ok(h),
            #[cfg(feature = "cuda")]
            StorageData::Cuda { .. } => Err(CoreError::NotOnHost(self.device)),
        }
    }

    /// Mutable host buffer. Clones the data first if it is shared (copy-on-write).
    pub fn host_mut(&mut self) -> Result<&mut HostData> {
        let device = self.device;
        match Arc::make_mut(&mut self.data) {
            StorageData::Host(h) => Ok(h),
            #[cfg(feature = "cuda")]
            StorageData::Cuda { .. } => Err(CoreError::NotOnHost(device)),
            #[cfg(not(feature = "cuda"))]
            #[allow(unreachable_patterns)]
            _ => Err(CoreError::NotOnHost(device)),
        }
    }

    pub fn as_f32_slice(&self) -> Option<&[f32]> {
        match self.data.as_ref() {
            StorageData::Host(HostData::F32(v)) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64_slice(&self) -> Option<&[f64]> {
        match self.data.as_ref() {
            StorageData::Host(HostData::F64(v)) => Some(v),
            _ => None,
        }
    }

    /// Whether this storage is uniquely owned (no other Arc references).
    pub fn is_unique(&self) -> bool {
        Arc::strong_count(&self.data) == 1
    }

    /// Whether two handles point at the same allocation.
    pub fn shares_with(&self, other: &Storage) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Upload to a CUDA device (H2D copy, enqueued on the device stream).
    #[cfg(feature = "cuda")]
    pub fn to_cuda(&self, device_idx: usize) -> Result<Self> {
        if self.device == Device::Cuda(device_idx) {
            return Ok(self.clone());
        }
        if !self.device.is_cpu() {
            return self.to_host()?.to_cuda(device_idx);
        }
        let host = self.host()?;
        let dev = crate::cuda::get_device(device_idx)?;
        let buffer = dev
            .htod_copy(host.as_bytes().to_vec())
            .map_err(|e| CoreError::CudaError(format!("H2D copy: {e}")))?;
        Ok(Self::from_cuda(dev, buffer, device_idx, self.dtype, self.numel))
    }

    /// Download to host memory (blocking D2H copy).
    #[cfg(feature = "cuda")]
    pub fn to_host(&self) -> Result<Self> {
        match self.data.as_ref() {
            StorageData::Host(_) => Ok(self.clone()),
            StorageData::Cuda { device, buffer, .. } => {
                let bytes: Vec<u8> = device
                    .dtoh_sync_copy(buffer.as_ref())
                    .map_err(|e| CoreError::CudaError(format!("D2H copy: {e}")))?;
                Ok(Self::from_host(HostData::from_bytes(self.dtype, &bytes)?))
            }
        }
    }

    /// Get the underlying CudaSlice for kernel launches.
    #[cfg(feature = "cuda")]
    pub fn as_cuda_slice(&self) -> Option<&CudaSlice<u8>> {
        match self.data.as_ref() {
            StorageData::Cuda { buffer, .. } => Some(buffer.as_ref()),
            _ => None,
        }
    }

    /// Create Storage directly from a CUDA buffer (used by kernel dispatch).
    #[cfg(feature = "cuda")]
    pub fn from_cuda(
        device: Arc<CudaDevice>,
        buffer: CudaSlice<u8>,
        device_idx: usize,
        dtype: DType,
        numel: usize,
    ) -> Self {
        Self {
            data: Arc::new(StorageData::Cuda {
                device,
                buffer: Arc::new(buffer),
                device_idx,
            }),
            dtype,
            device: Device::Cuda(device_idx),
            numel,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeros() {
        let s = Storage::zeros(DType::F32, 10);
        assert_eq!(s.dtype(), DType::F32);
        assert_eq!(s.device(), Device::Cpu);
        assert_eq!(s.numel(), 10);
        assert_eq!(s.nbytes(), 40);
        assert!(s.as_f32_slice().unwrap().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_copy_on_write() {
        let s1 = Storage::from_f32(vec![1.0, 2.0, 3.0]);
        let mut s2 = s1.clone();
        assert!(!s1.is_unique());
        assert!(s1.shares_with(&s2));

        if let HostData::F32(v) = s2.host_mut().unwrap() {
            v[0] = 99.0;
        }

        assert_eq!(s1.as_f32_slice().unwrap()[0], 1.0);
        assert_eq!(s2.as_f32_slice().unwrap()[0], 99.0);
        assert!(!s1.shares_with(&s2));
    }

    #[test]
    fn test_unique_mutation_does_not_copy() {
        let mut s = Storage::from_f64(vec![1.0, 2.0]);
        assert!(s.is_unique());
        let before = s.as_f64_slice().unwrap().as_ptr();
        s.host_mut().unwrap();
        assert_eq!(s.as_f64_slice().unwrap().as_ptr(), before);
    }

    #[test]
    fn test_bytes_roundtrip_through_unaligned_buffer() {
        let data = HostData::F64(vec![1.5, -2.25]);
        let mut shifted = vec![0u8];
        shifted.extend_from_slice(data.as_bytes());
        let back = HostData::from_bytes(DType::F64, &shifted[1..]).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_from_bytes_validation() {
        assert!(HostData::from_bytes(DType::F32, &[0u8; 11]).is_err());
        assert_eq!(HostData::from_bytes(DType::F32, &[0u8; 12]).unwrap().len(), 3);
    }
}
