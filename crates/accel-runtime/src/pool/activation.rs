//! Scoped pool activation.

use tracing::{debug, info};

use super::allocator::PooledAllocator;
use crate::error::RuntimeResult;
use crate::types::{DeviceId, Stream};

/// Size of the round trip that proves the pool serves requests.
const SMOKE_TEST_BYTES: usize = 4;

/// Enables pooling for a scope and tears it down when the scope ends.
///
/// With an empty device list nothing happens: no configure, no
/// initialize, no destroy, no device calls. With devices, the pool is
/// configured, initialized and exercised with one small allocate/free on
/// the first device's default stream.
///
/// # Drop Behavior
///
/// If this activation enabled the pool, `destroy()` runs exactly once when
/// it is dropped, including during unwinding and when construction failed
/// part way through.
///
/// # Nesting
///
/// Activations do not nest. The allocator must not already be initialized
/// when [`new`](Self::new) runs: `configure` is then ignored, yet the new
/// guard still owns teardown, so dropping it destroys the pool the outer
/// owner set up.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use accel_runtime::{DeviceId, PoolActivation, PooledAllocator, SimulatedDevice};
///
/// let allocator = PooledAllocator::new(Arc::new(SimulatedDevice::new(2, 1 << 20)));
/// {
///     let activation = PoolActivation::new(&allocator, &[DeviceId(0), DeviceId(1)])?;
///     assert!(activation.using_pool());
///     assert!(allocator.is_initialized());
/// }
/// assert!(!allocator.is_initialized());
/// # Ok::<(), accel_runtime::RuntimeError>(())
/// ```
#[derive(Debug)]
#[must_use = "the pool is destroyed as soon as the activation is dropped"]
pub struct PoolActivation<'a> {
    allocator: &'a PooledAllocator,
    active: bool,
}

impl<'a> PoolActivation<'a> {
    /// Activate pooling on `devices` for the lifetime of the returned guard.
    ///
    /// # Errors
    ///
    /// Any error from `configure`, `initialize` or the smoke round trip. The
    /// pool has already been destroyed again when the error is returned.
    pub fn new(allocator: &'a PooledAllocator, devices: &[DeviceId]) -> RuntimeResult<Self> {
        let mut activation = Self {
            allocator,
            active: false,
        };

        let Some(&first) = devices.first() else {
            debug!("No pool devices given, pooling stays disabled");
            return Ok(activation);
        };

        // From here on, dropping `activation` destroys the pool.
        activation.active = true;
        allocator.configure(devices)?;
        allocator.initialize()?;

        let stream = Stream::default_for(first);
        let ptr = allocator.allocate(SMOKE_TEST_BYTES, stream)?;
        allocator.free(ptr, stream)?;

        info!(devices = ?devices, "Memory pool activated");
        Ok(activation)
    }

    /// Check if this activation enabled the pool.
    pub fn using_pool(&self) -> bool {
        self.active
    }

    /// Allocator this activation manages.
    pub fn allocator(&self) -> &'a PooledAllocator {
        self.allocator
    }
}

impl Drop for PoolActivation<'_> {
    fn drop(&mut self) {
        if self.active {
            self.allocator.destroy();
            self.active = false;
        }
    }
}
