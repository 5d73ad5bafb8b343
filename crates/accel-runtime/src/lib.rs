#![deny(deprecated)]

//! Process-wide accelerator resource layer.
//!
//! This crate owns the device resources a compute framework shares across a
//! whole process:
//! - Per-worker execution contexts (library handles, mode, random stream)
//! - A pooled device memory allocator with transparent direct fallback
//! - A scope guard that activates the pool and always tears it down
//!
//! Numeric kernels, host heap allocation and training logic are out of
//! scope; they consume what this crate hands out.
//!
//! # Device Backends
//!
//! All device calls go through [`DeviceBackend`]. [`SimulatedDevice`] runs
//! everywhere; `CudaDriver` needs the `cuda` feature and a GPU.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use accel_runtime::{
//!     DeviceId, ExecutionContext, HandleKind, PoolActivation, PooledAllocator,
//!     SimulatedDevice, Stream,
//! };
//!
//! let backend = Arc::new(SimulatedDevice::new(2, 1 << 24));
//! let allocator = PooledAllocator::new(backend.clone());
//! let _pool = PoolActivation::new(&allocator, &[DeviceId(0), DeviceId(1)])?;
//!
//! let mut ctx = ExecutionContext::with_backend(backend);
//! let _blas = ctx.handle(HandleKind::LinearAlgebra)?;
//!
//! let stream = Stream::default_for(DeviceId(0));
//! let buf = allocator.allocate(1024, stream)?;
//! allocator.free(buf, stream)?;
//! # Ok::<(), accel_runtime::RuntimeError>(())
//! ```

pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod ffi;
pub mod global;
pub mod pool;
pub mod types;

pub use config::{PoolConfig, RuntimeConfig};
pub use context::{
    configure_thread_context, reset_thread_context, with_thread_context, ExecutionContext,
    ExecutionMode, RngStream,
};
#[cfg(feature = "cuda")]
pub use device::CudaDriver;
pub use device::{DeviceBackend, SimulatedCounters, SimulatedDevice};
pub use error::{fail_fast, RuntimeError, RuntimeResult};
pub use pool::{PoolActivation, PoolStats, PooledAllocator};
pub use types::{
    ComputeHandle, DeviceId, DeviceMemory, DevicePtr, DeviceProperties, HandleKind, MemInfo,
    RawHandle, Stream,
};
