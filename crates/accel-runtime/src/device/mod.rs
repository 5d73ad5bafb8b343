//! Device backend seam.
//!
//! Every device API call the runtime makes goes through [`DeviceBackend`].
//! Numeric layers never talk to the driver directly; they go through the
//! allocator and the execution context, which hold an `Arc<dyn DeviceBackend>`.
//!
//! # Implementations
//!
//! - [`SimulatedDevice`]: in-memory accelerator model. Used by host-only runs
//!   and by tests; behaves like a driver (capacity, out-of-memory, invalid
//!   frees) without touching hardware.
//! - `CudaDriver` (feature `cuda`): CUDA driver API plus cuBLAS/cuRAND
//!   (and cuDNN with the `cudnn` feature).

mod simulated;

#[cfg(feature = "cuda")]
mod cuda;

use std::fmt;

use crate::error::RuntimeResult;
use crate::types::{DeviceId, DeviceMemory, DevicePtr, DeviceProperties, HandleKind, RawHandle};

pub use simulated::{SimulatedCounters, SimulatedDevice};

#[cfg(feature = "cuda")]
pub use cuda::CudaDriver;

/// Raw device operations consumed by the runtime.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`: one backend instance serves every
/// worker thread. Calls for different devices may arrive concurrently.
///
/// # Contract
///
/// - `malloc` never returns [`DevicePtr::NULL`] on success; zero-byte
///   requests still yield a distinct address.
/// - `free` must be given a pointer returned by `malloc` on the same device.
pub trait DeviceBackend: Send + Sync + fmt::Debug {
    /// Backend name for logging (e.g. "cuda", "simulated").
    fn name(&self) -> &'static str;

    /// Number of visible devices.
    fn device_count(&self) -> usize;

    /// Static properties of `device`.
    fn properties(&self, device: DeviceId) -> RuntimeResult<DeviceProperties>;

    /// Current free/total memory of `device`.
    fn mem_info(&self, device: DeviceId) -> RuntimeResult<DeviceMemory>;

    /// Allocate `bytes` of device memory on `device`.
    fn malloc(&self, device: DeviceId, bytes: usize) -> RuntimeResult<DevicePtr>;

    /// Release memory obtained from [`malloc`](Self::malloc).
    fn free(&self, device: DeviceId, ptr: DevicePtr) -> RuntimeResult<()>;

    /// Create a compute library handle of `kind` bound to `device`.
    fn create_handle(&self, device: DeviceId, kind: HandleKind) -> RuntimeResult<RawHandle>;

    /// Destroy a handle created by [`create_handle`](Self::create_handle).
    fn destroy_handle(&self, device: DeviceId, kind: HandleKind, handle: RawHandle)
        -> RuntimeResult<()>;

    /// Seed a random-generation handle and reset its offset.
    fn seed_generator(&self, device: DeviceId, handle: RawHandle, seed: u64) -> RuntimeResult<()>;

    /// Check that `device` is a visible ordinal.
    fn check_device(&self, device: DeviceId) -> RuntimeResult<()> {
        let device_count = self.device_count();
        if device.index() >= device_count {
            return Err(crate::error::RuntimeError::InvalidDevice {
                device,
                device_count,
            });
        }
        Ok(())
    }
}
