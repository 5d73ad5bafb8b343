//! CUDA driver backend.
//!
//! Retains the primary context of every visible device once and makes the
//! right one current before each call, so any worker thread may use any
//! device. Library handles (cuBLAS, cuRAND, cuDNN) are created on the
//! current context and returned as raw integers.
//!
//! # Drop Behavior
//!
//! Releases every retained primary context. NEVER panics - logs errors instead.

use std::ffi::CStr;
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Once;

use tracing::{debug, info, warn};

use super::DeviceBackend;
use crate::error::{RuntimeError, RuntimeResult};
use crate::ffi::{
    cuCtxSetCurrent, cuDeviceGet, cuDeviceGetAttribute, cuDeviceGetCount, cuDeviceGetName,
    cuDevicePrimaryCtxRelease_v2, cuDevicePrimaryCtxRetain, cuDeviceTotalMem_v2,
    cuDriverGetVersion, cuInit, cuMemAlloc_v2, cuMemFree_v2, cuMemGetInfo_v2, cublasCreate_v2,
    cublasDestroy_v2, cublasHandle_t, curandCreateGenerator, curandDestroyGenerator,
    curandGenerator_t, curandSetGeneratorOffset, curandSetPseudoRandomGeneratorSeed,
    check_driver, cuda_result_to_string, decode_driver_version, is_cuda_success, CUcontext,
    CUdevice, CUdevice_attribute, CUdeviceptr, CUBLAS_STATUS_SUCCESS, CUDA_ERROR_NO_DEVICE,
    CUDA_ERROR_OUT_OF_MEMORY, CUDA_SUCCESS,
    CURAND_RNG_PSEUDO_DEFAULT, CURAND_STATUS_SUCCESS, CU_DEVICE_ATTRIBUTE_CLOCK_RATE,
    CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR, CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR,
    CU_DEVICE_ATTRIBUTE_KERNEL_EXEC_TIMEOUT, CU_DEVICE_ATTRIBUTE_MAX_BLOCK_DIM_X,
    CU_DEVICE_ATTRIBUTE_MAX_BLOCK_DIM_Y, CU_DEVICE_ATTRIBUTE_MAX_BLOCK_DIM_Z,
    CU_DEVICE_ATTRIBUTE_MAX_GRID_DIM_X, CU_DEVICE_ATTRIBUTE_MAX_GRID_DIM_Y,
    CU_DEVICE_ATTRIBUTE_MAX_GRID_DIM_Z, CU_DEVICE_ATTRIBUTE_MAX_REGISTERS_PER_BLOCK,
    CU_DEVICE_ATTRIBUTE_MAX_SHARED_MEMORY_PER_BLOCK, CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_BLOCK,
    CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT, CU_DEVICE_ATTRIBUTE_WARP_SIZE,
};
#[cfg(feature = "cudnn")]
use crate::ffi::{cudnnCreate, cudnnDestroy, cudnnHandle_t, CUDNN_STATUS_SUCCESS};
use crate::types::{DeviceId, DeviceMemory, DevicePtr, DeviceProperties, HandleKind, RawHandle};

/// Global once-guard for CUDA driver initialization.
static CUDA_INIT: Once = Once::new();

/// Result of cuInit, kept for every later caller.
static CUDA_INIT_RESULT: AtomicI32 = AtomicI32::new(CUDA_SUCCESS);

fn ensure_driver() -> RuntimeResult<()> {
    CUDA_INIT.call_once(|| {
        // SAFETY: cuInit(0) is thread-safe and idempotent
        let result = unsafe { cuInit(0) };
        CUDA_INIT_RESULT.store(result, Ordering::Release);
    });

    match CUDA_INIT_RESULT.load(Ordering::Acquire) {
        CUDA_SUCCESS => Ok(()),
        CUDA_ERROR_NO_DEVICE => Err(RuntimeError::NoDevice),
        code => Err(RuntimeError::DeviceInitFailed {
            reason: format!("cuInit failed: {}", cuda_result_to_string(code)),
        }),
    }
}

/// cuBLAS, cuRAND and cuDNN all report success as 0 but share no other
/// codes with the driver API.
fn check_library(call: &'static str, status: i32) -> RuntimeResult<()> {
    if status == 0 {
        Ok(())
    } else {
        Err(RuntimeError::DeviceCallFailed {
            call,
            code: status,
            message: format!("library status {}", status),
        })
    }
}

#[derive(Debug)]
struct PrimaryContext {
    device: CUdevice,
    context: CUcontext,
}

/// CUDA driver API backend.
///
/// # Example
///
/// ```no_run
/// # #[cfg(feature = "cuda")]
/// # fn main() -> Result<(), accel_runtime::RuntimeError> {
/// use accel_runtime::{CudaDriver, DeviceBackend, DeviceId};
///
/// let driver = CudaDriver::new()?;
/// let props = driver.properties(DeviceId(0))?;
/// println!("{} (sm_{}{})", props.name, props.compute_capability.0, props.compute_capability.1);
/// # Ok(())
/// # }
/// # #[cfg(not(feature = "cuda"))]
/// # fn main() {}
/// ```
#[derive(Debug)]
pub struct CudaDriver {
    contexts: Vec<PrimaryContext>,
}

// SAFETY: primary contexts are process-wide driver objects. Every call makes
// the target context current on the calling thread before using it.
unsafe impl Send for CudaDriver {}
// SAFETY: see above; the driver API is thread-safe for these entry points.
unsafe impl Sync for CudaDriver {}

impl CudaDriver {
    /// Initialize the driver and retain the primary context of every device.
    ///
    /// # Errors
    ///
    /// * `RuntimeError::NoDevice` - No CUDA device available
    /// * `RuntimeError::DeviceInitFailed` - cuInit or context retain failed
    pub fn new() -> RuntimeResult<Self> {
        ensure_driver()?;

        let mut count: i32 = 0;
        // SAFETY: count is a valid pointer, cuInit was called
        check_driver("cuDeviceGetCount", unsafe { cuDeviceGetCount(&mut count) })?;
        if count <= 0 {
            return Err(RuntimeError::NoDevice);
        }

        let mut driver = Self {
            contexts: Vec::with_capacity(count as usize),
        };
        for ordinal in 0..count {
            let mut device: CUdevice = 0;
            // SAFETY: device is a valid pointer, ordinal < count
            let result = unsafe { cuDeviceGet(&mut device, ordinal) };
            if !is_cuda_success(result) {
                return Err(RuntimeError::DeviceInitFailed {
                    reason: format!(
                        "cuDeviceGet({}) failed: {}",
                        ordinal,
                        cuda_result_to_string(result)
                    ),
                });
            }

            let mut context: CUcontext = ptr::null_mut();
            // SAFETY: device is valid, context is a valid pointer
            let result = unsafe { cuDevicePrimaryCtxRetain(&mut context, device) };
            if !is_cuda_success(result) {
                // Contexts retained so far are released by Drop.
                return Err(RuntimeError::DeviceInitFailed {
                    reason: format!(
                        "cuDevicePrimaryCtxRetain failed for device {}: {}",
                        ordinal,
                        cuda_result_to_string(result)
                    ),
                });
            }
            driver.contexts.push(PrimaryContext { device, context });
        }

        let mut version: i32 = 0;
        // SAFETY: version is a valid pointer
        let (major, minor) = if unsafe { cuDriverGetVersion(&mut version) } == CUDA_SUCCESS {
            decode_driver_version(version)
        } else {
            (0, 0)
        };
        info!(
            devices = count,
            driver_major = major,
            driver_minor = minor,
            "CUDA driver backend initialized"
        );

        Ok(driver)
    }

    fn make_current(&self, device: DeviceId) -> RuntimeResult<&PrimaryContext> {
        let ctx = self
            .contexts
            .get(device.index())
            .ok_or(RuntimeError::InvalidDevice {
                device,
                device_count: self.contexts.len(),
            })?;
        // SAFETY: ctx.context was retained in new() and is released only in Drop
        check_driver("cuCtxSetCurrent", unsafe { cuCtxSetCurrent(ctx.context) })?;
        Ok(ctx)
    }

    fn attribute(device: CUdevice, attrib: CUdevice_attribute) -> u32 {
        let mut value: i32 = 0;
        // SAFETY: device is valid, value is a valid pointer
        let result = unsafe { cuDeviceGetAttribute(&mut value, attrib, device) };
        if result != CUDA_SUCCESS {
            debug!(attrib, result, "cuDeviceGetAttribute failed, reporting 0");
            return 0;
        }
        value.max(0) as u32
    }

    fn device_name(device: CUdevice, ordinal: DeviceId) -> String {
        let mut name_buf = [0 as std::os::raw::c_char; 256];
        // SAFETY: buffer is valid and large enough
        let result =
            unsafe { cuDeviceGetName(name_buf.as_mut_ptr(), name_buf.len() as i32, device) };
        if result != CUDA_SUCCESS {
            return format!("GPU {} (name query failed)", ordinal);
        }
        // SAFETY: cuDeviceGetName null-terminates the string
        let c_str = unsafe { CStr::from_ptr(name_buf.as_ptr()) };
        c_str.to_string_lossy().into_owned()
    }
}

impl DeviceBackend for CudaDriver {
    fn name(&self) -> &'static str {
        "cuda"
    }

    fn device_count(&self) -> usize {
        self.contexts.len()
    }

    fn properties(&self, device: DeviceId) -> RuntimeResult<DeviceProperties> {
        let ctx = self.make_current(device)?;
        let dev = ctx.device;

        let mut total: usize = 0;
        // SAFETY: dev is valid, total is a valid pointer
        check_driver("cuDeviceTotalMem_v2", unsafe { cuDeviceTotalMem_v2(&mut total, dev) })?;

        Ok(DeviceProperties {
            device,
            name: Self::device_name(dev, device),
            compute_capability: (
                Self::attribute(dev, CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR),
                Self::attribute(dev, CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR),
            ),
            total_memory_bytes: total,
            shared_memory_per_block: Self::attribute(
                dev,
                CU_DEVICE_ATTRIBUTE_MAX_SHARED_MEMORY_PER_BLOCK,
            ) as usize,
            registers_per_block: Self::attribute(dev, CU_DEVICE_ATTRIBUTE_MAX_REGISTERS_PER_BLOCK),
            warp_size: Self::attribute(dev, CU_DEVICE_ATTRIBUTE_WARP_SIZE),
            max_threads_per_block: Self::attribute(dev, CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_BLOCK),
            max_block_dims: [
                Self::attribute(dev, CU_DEVICE_ATTRIBUTE_MAX_BLOCK_DIM_X),
                Self::attribute(dev, CU_DEVICE_ATTRIBUTE_MAX_BLOCK_DIM_Y),
                Self::attribute(dev, CU_DEVICE_ATTRIBUTE_MAX_BLOCK_DIM_Z),
            ],
            max_grid_dims: [
                Self::attribute(dev, CU_DEVICE_ATTRIBUTE_MAX_GRID_DIM_X),
                Self::attribute(dev, CU_DEVICE_ATTRIBUTE_MAX_GRID_DIM_Y),
                Self::attribute(dev, CU_DEVICE_ATTRIBUTE_MAX_GRID_DIM_Z),
            ],
            clock_rate_khz: Self::attribute(dev, CU_DEVICE_ATTRIBUTE_CLOCK_RATE),
            multiprocessor_count: Self::attribute(dev, CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT),
            kernel_timeout_enabled: Self::attribute(dev, CU_DEVICE_ATTRIBUTE_KERNEL_EXEC_TIMEOUT)
                != 0,
        })
    }

    fn mem_info(&self, device: DeviceId) -> RuntimeResult<DeviceMemory> {
        self.make_current(device)?;
        let mut free: usize = 0;
        let mut total: usize = 0;
        // SAFETY: a context is current, pointers are valid
        check_driver("cuMemGetInfo_v2", unsafe { cuMemGetInfo_v2(&mut free, &mut total) })?;
        Ok(DeviceMemory {
            free_bytes: free,
            total_bytes: total,
        })
    }

    fn malloc(&self, device: DeviceId, bytes: usize) -> RuntimeResult<DevicePtr> {
        self.make_current(device)?;
        let mut dptr: CUdeviceptr = 0;
        // cuMemAlloc rejects zero sizes; keep the non-null contract.
        // SAFETY: a context is current, dptr is a valid pointer
        let result = unsafe { cuMemAlloc_v2(&mut dptr, bytes.max(1)) };
        match result {
            CUDA_SUCCESS => Ok(DevicePtr(dptr)),
            CUDA_ERROR_OUT_OF_MEMORY => Err(RuntimeError::AllocationFailed {
                device,
                requested_bytes: bytes,
                free_bytes: self.mem_info(device).ok().map(|m| m.free_bytes),
                reason: "cuMemAlloc_v2: out of memory".to_string(),
            }),
            code => Err(RuntimeError::AllocationFailed {
                device,
                requested_bytes: bytes,
                free_bytes: None,
                reason: format!("cuMemAlloc_v2 failed: {}", cuda_result_to_string(code)),
            }),
        }
    }

    fn free(&self, device: DeviceId, ptr: DevicePtr) -> RuntimeResult<()> {
        self.make_current(device)?;
        // SAFETY: ptr came from cuMemAlloc_v2 on this device's context
        check_driver("cuMemFree_v2", unsafe { cuMemFree_v2(ptr.as_raw()) })
    }

    fn create_handle(&self, device: DeviceId, kind: HandleKind) -> RuntimeResult<RawHandle> {
        self.make_current(device)?;
        let failed = |reason: String| RuntimeError::HandleCreationFailed {
            kind,
            device,
            reason,
        };

        match kind {
            HandleKind::LinearAlgebra => {
                let mut handle: cublasHandle_t = ptr::null_mut();
                // SAFETY: a context is current, handle is a valid pointer
                let status = unsafe { cublasCreate_v2(&mut handle) };
                if status != CUBLAS_STATUS_SUCCESS {
                    return Err(failed(format!("cublasCreate_v2 status {}", status)));
                }
                Ok(RawHandle(handle as usize as u64))
            }
            HandleKind::RandomGeneration => {
                let mut generator: curandGenerator_t = ptr::null_mut();
                // SAFETY: a context is current, generator is a valid pointer
                let status =
                    unsafe { curandCreateGenerator(&mut generator, CURAND_RNG_PSEUDO_DEFAULT) };
                if status != CURAND_STATUS_SUCCESS {
                    return Err(failed(format!("curandCreateGenerator status {}", status)));
                }
                Ok(RawHandle(generator as usize as u64))
            }
            #[cfg(feature = "cudnn")]
            HandleKind::NeuralNet => {
                let mut handle: cudnnHandle_t = ptr::null_mut();
                // SAFETY: a context is current, handle is a valid pointer
                let status = unsafe { cudnnCreate(&mut handle) };
                if status != CUDNN_STATUS_SUCCESS {
                    return Err(failed(format!("cudnnCreate status {}", status)));
                }
                Ok(RawHandle(handle as usize as u64))
            }
            #[cfg(not(feature = "cudnn"))]
            HandleKind::NeuralNet => Err(RuntimeError::unsupported(
                "neural-net primitives (built without the `cudnn` feature)",
            )),
        }
    }

    fn destroy_handle(
        &self,
        device: DeviceId,
        kind: HandleKind,
        handle: RawHandle,
    ) -> RuntimeResult<()> {
        self.make_current(device)?;
        let raw = handle.0 as usize as *mut std::ffi::c_void;
        match kind {
            HandleKind::LinearAlgebra => {
                // SAFETY: handle came from cublasCreate_v2 on this device
                check_library("cublasDestroy_v2", unsafe { cublasDestroy_v2(raw) })
            }
            HandleKind::RandomGeneration => {
                // SAFETY: handle came from curandCreateGenerator on this device
                check_library("curandDestroyGenerator", unsafe { curandDestroyGenerator(raw) })
            }
            #[cfg(feature = "cudnn")]
            HandleKind::NeuralNet => {
                // SAFETY: handle came from cudnnCreate on this device
                check_library("cudnnDestroy", unsafe { cudnnDestroy(raw) })
            }
            #[cfg(not(feature = "cudnn"))]
            HandleKind::NeuralNet => Err(RuntimeError::unsupported("neural-net primitives")),
        }
    }

    fn seed_generator(&self, device: DeviceId, handle: RawHandle, seed: u64) -> RuntimeResult<()> {
        self.make_current(device)?;
        let generator = handle.0 as usize as curandGenerator_t;
        // SAFETY: generator came from curandCreateGenerator on this device
        check_library("curandSetPseudoRandomGeneratorSeed", unsafe {
            curandSetPseudoRandomGeneratorSeed(generator, seed)
        })?;
        // SAFETY: as above
        check_library("curandSetGeneratorOffset", unsafe {
            curandSetGeneratorOffset(generator, 0)
        })
    }
}

impl Drop for CudaDriver {
    fn drop(&mut self) {
        for (ordinal, ctx) in self.contexts.iter().enumerate() {
            // SAFETY: each context was retained exactly once in new()
            let result = unsafe { cuDevicePrimaryCtxRelease_v2(ctx.device) };
            if result != CUDA_SUCCESS {
                warn!(
                    device = ordinal,
                    result, "cuDevicePrimaryCtxRelease_v2 failed during drop"
                );
            }
        }
    }
}
