//! Process-wide pooled device allocator.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::device_pool::DevicePool;
use super::stats::{PoolStats, StatsCounters};
use crate::config::PoolConfig;
use crate::device::DeviceBackend;
use crate::error::{RuntimeError, RuntimeResult};
use crate::types::{DeviceId, DevicePtr, MemInfo, Stream};

/// Allocator state machine.
///
/// - `enabled: false, initialized: false` -> direct allocation
/// - `enabled: true, initialized: false` -> configured, still direct
/// - `enabled: true, initialized: true` -> pooled on `target_devices`
#[derive(Debug, Default)]
struct AllocatorState {
    enabled: bool,
    initialized: bool,
    target_devices: Vec<DeviceId>,
    pools: HashMap<DeviceId, Mutex<DevicePool>>,
}

/// Device allocator that serves requests from per-device reservations.
///
/// Until [`initialize`](Self::initialize) succeeds, and again after
/// [`destroy`](Self::destroy), every call goes straight to the device
/// backend. Callers see the same success and failure shape either way.
///
/// # Thread Safety
///
/// `allocate`/`free` take a shared lock on the allocator state plus the
/// target device's pool mutex, so different devices never contend.
/// `configure`/`initialize`/`destroy` take the exclusive lock.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use accel_runtime::{DeviceId, PooledAllocator, SimulatedDevice, Stream};
///
/// let backend = Arc::new(SimulatedDevice::new(1, 1 << 20));
/// let allocator = PooledAllocator::new(backend);
///
/// allocator.configure(&[DeviceId(0)])?;
/// allocator.initialize()?;
///
/// let stream = Stream::default_for(DeviceId(0));
/// let ptr = allocator.allocate(1024, stream)?;
/// allocator.free(ptr, stream)?;
/// allocator.destroy();
/// # Ok::<(), accel_runtime::RuntimeError>(())
/// ```
#[derive(Debug)]
pub struct PooledAllocator {
    backend: Arc<dyn DeviceBackend>,
    config: PoolConfig,
    state: RwLock<AllocatorState>,
    stats: StatsCounters,
}

impl PooledAllocator {
    /// Create an allocator with default pool settings.
    pub fn new(backend: Arc<dyn DeviceBackend>) -> Self {
        Self::with_config(backend, PoolConfig::default())
    }

    /// Create an allocator with explicit pool settings.
    pub fn with_config(backend: Arc<dyn DeviceBackend>, config: PoolConfig) -> Self {
        Self {
            backend,
            config,
            state: RwLock::new(AllocatorState::default()),
            stats: StatsCounters::default(),
        }
    }

    /// Backend every device call goes through.
    pub fn backend(&self) -> &Arc<dyn DeviceBackend> {
        &self.backend
    }

    /// Pool settings used at initialization.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Record the devices to pool on and mark pooling enabled.
    ///
    /// Duplicates are dropped. An empty list disables pooling. Ignored
    /// (with a warning) while the pool is initialized; destroy first.
    ///
    /// # Errors
    ///
    /// - `RuntimeError::InvalidDevice` if a device is not visible
    pub fn configure(&self, devices: &[DeviceId]) -> RuntimeResult<()> {
        for &device in devices {
            self.backend.check_device(device)?;
        }

        let mut state = self.state.write();
        if state.initialized {
            warn!(
                current = ?state.target_devices,
                requested = ?devices,
                "Pool already initialized; configure() ignored until destroy()"
            );
            return Ok(());
        }

        let mut targets = Vec::with_capacity(devices.len());
        for &device in devices {
            if !targets.contains(&device) {
                targets.push(device);
            }
        }

        state.enabled = !targets.is_empty();
        debug!(devices = ?targets, enabled = state.enabled, "Configured memory pool");
        state.target_devices = targets;
        Ok(())
    }

    /// Reserve memory on every configured device.
    ///
    /// Idempotent while initialized. If any device fails, reservations
    /// already made are returned and the allocator stays uninitialized.
    ///
    /// # Errors
    ///
    /// - `RuntimeError::PoolNotConfigured` if `configure` was not called
    ///   with at least one device
    /// - `RuntimeError::AllocationFailed` if a reservation fails
    pub fn initialize(&self) -> RuntimeResult<()> {
        let mut state = self.state.write();
        if state.initialized {
            debug!("Memory pool already initialized, skipping");
            return Ok(());
        }
        if !state.enabled {
            return Err(RuntimeError::PoolNotConfigured);
        }

        let mut pools = HashMap::with_capacity(state.target_devices.len());
        for &device in &state.target_devices {
            match DevicePool::reserve(self.backend.as_ref(), device, &self.config) {
                Ok(pool) => {
                    pools.insert(device, Mutex::new(pool));
                }
                Err(e) => {
                    warn!(
                        device = device.0,
                        error = %e,
                        rolled_back = pools.len(),
                        "Pool initialization failed, releasing reservations"
                    );
                    for (_, pool) in pools.drain() {
                        pool.into_inner().release(self.backend.as_ref());
                    }
                    return Err(e);
                }
            }
        }

        let reserved: usize = pools.values().map(|p| p.lock().reserved_bytes()).sum();
        state.pools = pools;
        state.initialized = true;
        self.stats.record_initialization();

        info!(
            backend = self.backend.name(),
            devices = ?state.target_devices,
            reserved_bytes = reserved,
            "Memory pool initialized"
        );
        Ok(())
    }

    /// Allocate `bytes` of device memory on `stream`'s device.
    ///
    /// Served from the pool when it is initialized and covers the device,
    /// directly by the backend otherwise. Never returns a null pointer.
    ///
    /// # Errors
    ///
    /// - `RuntimeError::PoolExhausted` / `RuntimeError::AllocationFailed` -
    ///   both fatal, both reported by `is_allocation_failure()`
    /// - `RuntimeError::StreamNotRegistered` for a pooled device's unknown stream
    pub fn allocate(&self, bytes: usize, stream: Stream) -> RuntimeResult<DevicePtr> {
        let state = self.state.read();
        if state.initialized {
            if let Some(pool) = state.pools.get(&stream.device) {
                let ptr = pool.lock().allocate(self.backend.as_ref(), bytes, stream)?;
                self.stats.record_allocation(true);
                return Ok(ptr);
            }
        }
        drop(state);

        let ptr = self.backend.malloc(stream.device, bytes)?;
        self.stats.record_allocation(false);
        Ok(ptr)
    }

    /// Allocate room for `count` values of `T`.
    ///
    /// # Errors
    ///
    /// Same as [`allocate`](Self::allocate), plus `AllocationFailed` when the
    /// byte size overflows.
    pub fn allocate_elements<T>(&self, count: usize, stream: Stream) -> RuntimeResult<DevicePtr> {
        let bytes = count
            .checked_mul(std::mem::size_of::<T>())
            .ok_or_else(|| RuntimeError::AllocationFailed {
                device: stream.device,
                requested_bytes: usize::MAX,
                free_bytes: None,
                reason: format!(
                    "{} elements of {} overflow the address space",
                    count,
                    std::any::type_name::<T>()
                ),
            })?;
        self.allocate(bytes, stream)
    }

    /// Release `ptr`.
    ///
    /// Pointers owned by a live pool go back to it; anything else is freed
    /// on `stream`'s device by the backend, which reports unknown pointers.
    ///
    /// # Errors
    ///
    /// - `RuntimeError::InvalidFree` if the device does not know `ptr`
    pub fn free(&self, ptr: DevicePtr, stream: Stream) -> RuntimeResult<()> {
        let state = self.state.read();
        if state.initialized {
            // The stream's device first, then any other pool.
            let owner = state
                .pools
                .get(&stream.device)
                .filter(|p| p.lock().owns(ptr))
                .or_else(|| state.pools.values().find(|p| p.lock().owns(ptr)));

            if let Some(pool) = owner {
                pool.lock().free(ptr, stream)?;
                self.stats.record_free(true);
                return Ok(());
            }
        }
        drop(state);

        self.backend.free(stream.device, ptr)?;
        self.stats.record_free(false);
        Ok(())
    }

    /// Make `stream` usable for pooled allocation on its device.
    ///
    /// No-op when the pool is not initialized or does not cover the device.
    pub fn register_stream(&self, stream: Stream) -> RuntimeResult<()> {
        let state = self.state.read();
        if !state.initialized {
            debug!(stream = %stream, "Pool not initialized; register_stream ignored");
            return Ok(());
        }

        match state.pools.get(&stream.device) {
            Some(pool) => pool.lock().register_stream(stream),
            None => debug!(stream = %stream, "Device not pooled; register_stream ignored"),
        }
        Ok(())
    }

    /// Free and used bytes on `device`.
    ///
    /// Pool figures when the device is pooled, raw device figures otherwise.
    /// Advisory only.
    pub fn get_info(&self, device: DeviceId) -> RuntimeResult<MemInfo> {
        let state = self.state.read();
        if state.initialized {
            if let Some(pool) = state.pools.get(&device) {
                return Ok(pool.lock().info());
            }
        }
        drop(state);

        let mem = self.backend.mem_info(device)?;
        Ok(MemInfo {
            free_bytes: mem.free_bytes,
            used_bytes: mem.used_bytes(),
        })
    }

    /// Return all reserved memory to the devices and reset to direct mode.
    ///
    /// No-op when the pool was never configured. Release failures are logged.
    pub fn destroy(&self) {
        let mut state = self.state.write();
        if !state.enabled && !state.initialized {
            debug!("Memory pool not active, destroy() is a no-op");
            return;
        }

        let was_initialized = state.initialized;
        for (_, pool) in state.pools.drain() {
            pool.into_inner().release(self.backend.as_ref());
        }
        state.initialized = false;
        state.enabled = false;
        state.target_devices.clear();

        if was_initialized {
            self.stats.record_teardown();
            info!(backend = self.backend.name(), "Memory pool destroyed");
        }
    }

    /// Check if pooling is enabled (configured with at least one device).
    pub fn is_enabled(&self) -> bool {
        self.state.read().enabled
    }

    /// Check if reservations are live and allocations are pooled.
    pub fn is_initialized(&self) -> bool {
        self.state.read().initialized
    }

    /// Devices recorded by the last `configure`.
    pub fn target_devices(&self) -> Vec<DeviceId> {
        self.state.read().target_devices.clone()
    }

    /// Bytes `stream` currently holds from the pool.
    pub fn in_use_on(&self, stream: Stream) -> usize {
        let state = self.state.read();
        state
            .pools
            .get(&stream.device)
            .map(|p| p.lock().in_use_on(stream))
            .unwrap_or(0)
    }

    /// Snapshot of allocation counters.
    pub fn stats(&self) -> PoolStats {
        self.stats.snapshot()
    }
}

impl Drop for PooledAllocator {
    fn drop(&mut self) {
        if self.state.get_mut().initialized {
            warn!("PooledAllocator dropped while initialized, releasing reservations");
            self.destroy();
        }
    }
}
