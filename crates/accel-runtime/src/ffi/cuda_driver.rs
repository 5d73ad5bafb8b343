//! CUDA Driver API FFI bindings.
//!
//! Low-level bindings to libcuda.so: initialization, device attributes,
//! primary contexts and device memory. Constants and result helpers are
//! always compiled; the `extern` block only exists with the `cuda` feature.
//!
//! The Driver API is used instead of the Runtime API so no static cudart
//! initialization runs at load time, and `cuDeviceGetAttribute` is far
//! cheaper than `cudaGetDeviceProperties`.

#![allow(non_camel_case_types)]

use std::ffi::c_void;
#[cfg(feature = "cuda")]
use std::os::raw::{c_char, c_uint};
use std::os::raw::c_int;

use crate::error::{RuntimeError, RuntimeResult};

// =============================================================================
// TYPE ALIASES
// =============================================================================

/// CUDA result code. 0 = success, non-zero = error.
pub type CUresult = c_int;

/// CUDA device handle (ordinal-based).
pub type CUdevice = c_int;

/// CUDA device attribute enumeration.
pub type CUdevice_attribute = c_int;

/// CUDA context handle (opaque pointer).
pub type CUcontext = *mut c_void;

/// Device memory address.
pub type CUdeviceptr = u64;

// =============================================================================
// RESULT CODES
// =============================================================================

/// CUDA operation completed successfully.
pub const CUDA_SUCCESS: CUresult = 0;

/// Device memory exhausted.
pub const CUDA_ERROR_OUT_OF_MEMORY: CUresult = 2;

/// CUDA driver not initialized. Call cuInit() first.
pub const CUDA_ERROR_NOT_INITIALIZED: CUresult = 3;

/// No CUDA-capable device is available.
pub const CUDA_ERROR_NO_DEVICE: CUresult = 100;

/// Invalid device ordinal passed to cuDeviceGet.
pub const CUDA_ERROR_INVALID_DEVICE: CUresult = 101;

// =============================================================================
// DEVICE ATTRIBUTE CONSTANTS
// =============================================================================

/// Maximum threads per block.
pub const CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_BLOCK: CUdevice_attribute = 1;

/// Maximum block dimension X.
pub const CU_DEVICE_ATTRIBUTE_MAX_BLOCK_DIM_X: CUdevice_attribute = 2;

/// Maximum block dimension Y.
pub const CU_DEVICE_ATTRIBUTE_MAX_BLOCK_DIM_Y: CUdevice_attribute = 3;

/// Maximum block dimension Z.
pub const CU_DEVICE_ATTRIBUTE_MAX_BLOCK_DIM_Z: CUdevice_attribute = 4;

/// Maximum grid dimension X.
pub const CU_DEVICE_ATTRIBUTE_MAX_GRID_DIM_X: CUdevice_attribute = 5;

/// Maximum grid dimension Y.
pub const CU_DEVICE_ATTRIBUTE_MAX_GRID_DIM_Y: CUdevice_attribute = 6;

/// Maximum grid dimension Z.
pub const CU_DEVICE_ATTRIBUTE_MAX_GRID_DIM_Z: CUdevice_attribute = 7;

/// Shared memory per block in bytes.
pub const CU_DEVICE_ATTRIBUTE_MAX_SHARED_MEMORY_PER_BLOCK: CUdevice_attribute = 8;

/// Warp size in threads.
pub const CU_DEVICE_ATTRIBUTE_WARP_SIZE: CUdevice_attribute = 10;

/// 32-bit registers per block.
pub const CU_DEVICE_ATTRIBUTE_MAX_REGISTERS_PER_BLOCK: CUdevice_attribute = 12;

/// Peak clock frequency in kHz.
pub const CU_DEVICE_ATTRIBUTE_CLOCK_RATE: CUdevice_attribute = 13;

/// Number of streaming multiprocessors.
pub const CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT: CUdevice_attribute = 16;

/// Kernel run-time limit flag.
pub const CU_DEVICE_ATTRIBUTE_KERNEL_EXEC_TIMEOUT: CUdevice_attribute = 17;

/// Compute capability major version.
pub const CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR: CUdevice_attribute = 75;

/// Compute capability minor version.
pub const CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR: CUdevice_attribute = 76;

// =============================================================================
// FFI DECLARATIONS
// =============================================================================

#[cfg(feature = "cuda")]
#[link(name = "cuda")]
extern "C" {
    /// Initialize the CUDA driver. MUST be called before any other driver
    /// function. Thread-safe if called with flags 0.
    pub fn cuInit(flags: c_uint) -> CUresult;

    /// Get the number of CUDA devices.
    pub fn cuDeviceGetCount(count: *mut c_int) -> CUresult;

    /// Get a CUDA device handle by ordinal.
    pub fn cuDeviceGet(device: *mut CUdevice, ordinal: c_int) -> CUresult;

    /// Get a device attribute value.
    pub fn cuDeviceGetAttribute(
        pi: *mut c_int,
        attrib: CUdevice_attribute,
        dev: CUdevice,
    ) -> CUresult;

    /// Get the device name as a null-terminated string.
    pub fn cuDeviceGetName(name: *mut c_char, len: c_int, dev: CUdevice) -> CUresult;

    /// Get total memory on the device in bytes.
    pub fn cuDeviceTotalMem_v2(bytes: *mut usize, dev: CUdevice) -> CUresult;

    /// Get the CUDA driver version, encoded as (major * 1000 + minor * 10).
    pub fn cuDriverGetVersion(version: *mut c_int) -> CUresult;

    // =========================================================================
    // PRIMARY CONTEXT
    // =========================================================================

    /// Retain the primary context of `dev`, creating it on first retain.
    pub fn cuDevicePrimaryCtxRetain(pctx: *mut CUcontext, dev: CUdevice) -> CUresult;

    /// Release one reference to the primary context of `dev`.
    pub fn cuDevicePrimaryCtxRelease_v2(dev: CUdevice) -> CUresult;

    /// Set the current CUDA context for the calling thread.
    pub fn cuCtxSetCurrent(ctx: CUcontext) -> CUresult;

    // =========================================================================
    // MEMORY
    // =========================================================================

    /// Allocate `bytesize` bytes of linear device memory.
    pub fn cuMemAlloc_v2(dptr: *mut CUdeviceptr, bytesize: usize) -> CUresult;

    /// Free device memory allocated by cuMemAlloc_v2.
    pub fn cuMemFree_v2(dptr: CUdeviceptr) -> CUresult;

    /// Get free and total memory of the current context's device.
    pub fn cuMemGetInfo_v2(free: *mut usize, total: *mut usize) -> CUresult;
}

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

/// Decode CUDA driver version from encoded format.
///
/// # Example
///
/// ```
/// use accel_runtime::ffi::decode_driver_version;
/// let (major, minor) = decode_driver_version(12040);
/// assert_eq!(major, 12);
/// assert_eq!(minor, 4);
/// ```
#[inline]
#[must_use]
pub const fn decode_driver_version(encoded: i32) -> (i32, i32) {
    let major = encoded / 1000;
    let minor = (encoded % 1000) / 10;
    (major, minor)
}

/// Check if a CUDA result indicates success.
#[inline]
#[must_use]
pub const fn is_cuda_success(result: CUresult) -> bool {
    result == CUDA_SUCCESS
}

/// Get human-readable error message for CUDA result codes.
#[must_use]
pub fn cuda_result_to_string(result: CUresult) -> String {
    match result {
        CUDA_SUCCESS => "CUDA_SUCCESS (0): Operation completed successfully".to_string(),
        CUDA_ERROR_OUT_OF_MEMORY => "CUDA_ERROR_OUT_OF_MEMORY (2): Out of device memory".to_string(),
        CUDA_ERROR_NOT_INITIALIZED => {
            "CUDA_ERROR_NOT_INITIALIZED (3): cuInit() not called".to_string()
        }
        CUDA_ERROR_NO_DEVICE => "CUDA_ERROR_NO_DEVICE (100): No CUDA-capable device".to_string(),
        CUDA_ERROR_INVALID_DEVICE => {
            "CUDA_ERROR_INVALID_DEVICE (101): Invalid device ordinal".to_string()
        }
        code => format!("CUDA_ERROR_UNKNOWN ({}): Unknown error code", code),
    }
}

/// Map a driver status to `Ok` or `RuntimeError::DeviceCallFailed`.
///
/// # Errors
///
/// `RuntimeError::DeviceCallFailed` carrying the decoded status for any
/// non-success result.
pub fn check_driver(call: &'static str, result: CUresult) -> RuntimeResult<()> {
    if is_cuda_success(result) {
        Ok(())
    } else {
        Err(RuntimeError::DeviceCallFailed {
            call,
            code: result,
            message: cuda_result_to_string(result),
        })
    }
}
