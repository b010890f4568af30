//! Scoped device contexts.
//!
//! A machine acquires one context per device when it is built and drops them
//! with itself. Dropping a CUDA context drains its stream first, so no queued
//! work outlives the machine, including after a failed run.

#[cfg(feature = "cuda")]
use std::sync::Arc;

#[cfg(feature = "cuda")]
use cudarc::driver::CudaDevice;
use lathe_core::{CoreError, Device};

use crate::{Result, VmError};

pub struct DeviceContext {
    device: Device,
    #[cfg(feature = "cuda")]
    handle: Option<Arc<CudaDevice>>,
}

impl DeviceContext {
    /// Acquire `device`. The host always succeeds.
    pub fn acquire(device: Device) -> Result<Self> {
        let ctx = match device {
            Device::Cpu => Self::host(),
            Device::Cuda(idx) => Self::cuda(idx)?,
        };
        tracing::debug!(%device, "device context acquired");
        Ok(ctx)
    }

    fn host() -> Self {
        Self {
            device: Device::Cpu,
            #[cfg(feature = "cuda")]
            handle: None,
        }
    }

    #[cfg(feature = "cuda")]
    fn cuda(idx: usize) -> Result<Self> {
        let handle = lathe_core::cuda::get_device(idx).map_err(VmError::Device)?;
        Ok(Self {
            device: Device::Cuda(idx),
            handle: Some(handle),
        })
    }

    #[cfg(not(feature = "cuda"))]
    fn cuda(idx: usize) -> Result<Self> {
        Err(VmError::Device(CoreError::DeviceUnavailable(Device::Cuda(idx))))
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Wait for all work queued on this device.
    pub fn synchronize(&self) -> Result<()> {
        #[cfg(feature = "cuda")]
        {
            if let Some(handle) = &self.handle {
                handle.synchronize().map_err(|e| {
                    VmError::Device(CoreError::CudaError(format!("synchronize {}: {e}", self.device)))
                })?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext").field("device", &self.device).finish()
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        if let Err(e) = self.synchronize() {
            tracing::warn!(device = %self.device, error = %e, "device context released with pending failure");
        }
        tracing::debug!(device = %self.device, "device context released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_context() {
        let ctx = DeviceContext::acquire(Device::Cpu).unwrap();
        assert_eq!(ctx.device(), Device::Cpu);
        ctx.synchronize().unwrap();
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn test_cuda_unavailable_without_feature() {
        assert!(matches!(
            DeviceContext::acquire(Device::Cuda(0)),
            Err(VmError::Device(CoreError::DeviceUnavailable(Device::Cuda(0))))
        ));
    }
}
