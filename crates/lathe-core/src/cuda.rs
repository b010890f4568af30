//! CUDA backend: device registry, stream synchronization and f32
//! element-wise kernels compiled from embedded source via NVRTC.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use cudarc::driver::{CudaDevice, CudaFunction, LaunchAsync, LaunchConfig};
use parking_lot::Mutex;

use crate::storage::Storage;
use crate::tensor::Tensor;
use crate::{BinaryKind, CoreError, DType, Device, Result, UnaryKind};

// ============================================================================
// Device registry
// ============================================================================

/// One `CudaDevice` handle per GPU index, created on first use.
static DEVICES: OnceLock<Mutex<HashMap<usize, Arc<CudaDevice>>>> = OnceLock::new();

fn devices() -> &'static Mutex<HashMap<usize, Arc<CudaDevice>>> {
    DEVICES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Get or create the device handle for `device_idx`.
pub fn get_device(device_idx: usize) -> Result<Arc<CudaDevice>> {
    let mut map = devices().lock();
    if let Some(dev) = map.get(&device_idx) {
        return Ok(Arc::clone(dev));
    }
    let dev = CudaDevice::new(device_idx)
        .map_err(|e| CoreError::CudaError(format!("device {device_idx} init: {e}")))?;
    tracing::debug!(device_idx, "CUDA device initialized");
    map.insert(device_idx, Arc::clone(&dev));
    Ok(dev)
}

/// Block until all work queued on the device stream has completed.
pub fn synchronize(device_idx: usize) -> Result<()> {
    get_device(device_idx)?
        .synchronize()
        .map_err(|e| CoreError::CudaError(format!("synchronize cuda:{device_idx}: {e}")))
}

/// Check if any CUDA device is available.
pub fn is_cuda_available() -> bool {
    CudaDevice::new(0).is_ok()
}

// ============================================================================
// Kernels
// ============================================================================

const MODULE: &str = "lathe_elementwise";
const ELEMENTWISE_CU: &str = include_str!("cuda_kernels/elementwise.cu");
const ELEMENTWISE_FUNCS: &[&str] = &[
    "add_f32", "sub_f32", "mul_f32", "div_f32",
    "neg_f32", "exp_f32", "log_f32", "log1p_f32", "expm1_f32",
    "sqrt_f32", "square_f32", "recip_f32",
];
const BLOCK_SIZE: usize = 256;

fn get_func(dev: &Arc<CudaDevice>, func_name: &str) -> Result<CudaFunction> {
    if let Some(f) = dev.get_func(MODULE, func_name) {
        return Ok(f);
    }
    let ptx = cudarc::nvrtc::compile_ptx(ELEMENTWISE_CU)
        .map_err(|e| CoreError::CudaError(format!("PTX compile '{MODULE}': {e}")))?;
    dev.load_ptx(ptx, MODULE, ELEMENTWISE_FUNCS)
        .map_err(|e| CoreError::CudaError(format!("load module '{MODULE}': {e}")))?;
    dev.get_func(MODULE, func_name)
        .ok_or_else(|| CoreError::CudaError(format!("func '{func_name}' not found in '{MODULE}'")))
}

fn grid_1d(n: usize) -> LaunchConfig {
    LaunchConfig {
        grid_dim: (n.div_ceil(BLOCK_SIZE) as u32, 1, 1),
        block_dim: (BLOCK_SIZE as u32, 1, 1),
        shared_mem_bytes: 0,
    }
}

/// Whether the device kernels cover this dtype.
pub fn supports(dtype: DType) -> bool {
    dtype == DType::F32
}

fn device_index(t: &Tensor) -> Result<usize> {
    match t.device() {
        Device::Cuda(idx) => Ok(idx),
        other => Err(CoreError::CudaError(format!("expected a device tensor, found one on {other}"))),
    }
}

fn not_on_gpu() -> CoreError {
    CoreError::CudaError("tensor not on GPU".into())
}

fn check_f32(t: &Tensor) -> Result<()> {
    if supports(t.dtype()) {
        Ok(())
    } else {
        Err(CoreError::UnsupportedDType(t.dtype()))
    }
}

/// Element-wise unary kernel on a device-resident f32 tensor.
pub fn unary(a: &Tensor, kind: UnaryKind) -> Result<Tensor> {
    check_f32(a)?;
    let idx = device_index(a)?;
    let dev = get_device(idx)?;
    let n = a.numel();
    let src = a
        .storage_ref()
        .as_cuda_slice()
        .ok_or_else(not_on_gpu)?;
    let func_name = format!("{}_f32", kind.name());
    let f = get_func(&dev, &func_name)?;
    let mut out = dev
        .alloc_zeros::<u8>(n * 4)
        .map_err(|e| CoreError::CudaError(format!("alloc: {e}")))?;
    unsafe {
        f.launch(grid_1d(n), (src, &mut out, n as u32))
            .map_err(|e| CoreError::CudaError(format!("launch {func_name}: {e}")))?;
    }
    Tensor::from_storage(
        Storage::from_cuda(dev, out, idx, DType::F32, n),
        a.shape().clone(),
    )
}

/// Element-wise binary kernel on two same-shape device-resident f32 tensors.
pub fn binary(a: &Tensor, b: &Tensor, kind: BinaryKind) -> Result<Tensor> {
    check_f32(a)?;
    check_f32(b)?;
    if a.shape() != b.shape() {
        return Err(CoreError::ShapeMismatch {
            expected: a.shape().dims().to_vec(),
            got: b.shape().dims().to_vec(),
        });
    }
    let idx = device_index(a)?;
    if b.device() != a.device() {
        return Err(CoreError::CudaError(format!(
            "operands on {} and {}",
            a.device(),
            b.device()
        )));
    }
    let dev = get_device(idx)?;
    let n = a.numel();
    let lhs = a.storage_ref().as_cuda_slice().ok_or_else(not_on_gpu)?;
    let rhs = b.storage_ref().as_cuda_slice().ok_or_else(not_on_gpu)?;
    let func_name = format!("{}_f32", kind.name());
    let f = get_func(&dev, &func_name)?;
    let mut out = dev
        .alloc_zeros::<u8>(n * 4)
        .map_err(|e| CoreError::CudaError(format!("alloc: {e}")))?;
    unsafe {
        f.launch(grid_1d(n), (lhs, rhs, &mut out, n as u32))
            .map_err(|e| CoreError::CudaError(format!("launch {func_name}: {e}")))?;
    }
    Tensor::from_storage(
        Storage::from_cuda(dev, out, idx, DType::F32, n),
        a.shape().clone(),
    )
}
