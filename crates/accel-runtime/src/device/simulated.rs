//! In-memory accelerator model.
//!
//! `SimulatedDevice` behaves like a driver without owning hardware: each
//! device has a fixed capacity, hands out aligned non-null addresses, rejects
//! frees of unknown pointers and runs out of memory. It counts every call so
//! callers can assert exactly which device side effects happened.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::DeviceBackend;
use crate::error::{RuntimeError, RuntimeResult};
use crate::types::{DeviceId, DeviceMemory, DevicePtr, DeviceProperties, HandleKind, RawHandle};

/// Address granularity of simulated allocations.
const ADDRESS_ALIGNMENT: u64 = 256;

/// Each device gets its own address window so pointers never collide.
const ADDRESS_WINDOW_SHIFT: u32 = 40;

#[derive(Debug, Default)]
struct MemoryState {
    used_bytes: usize,
    next_offset: u64,
    live: HashMap<DevicePtr, usize>,
}

#[derive(Debug)]
struct SimulatedUnit {
    properties: DeviceProperties,
    memory: Mutex<MemoryState>,
}

/// Snapshot of device calls made against a [`SimulatedDevice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SimulatedCounters {
    /// Successful `malloc` calls.
    pub mallocs: usize,
    /// Successful `free` calls.
    pub frees: usize,
    /// Handles created.
    pub handles_created: usize,
    /// Handles destroyed.
    pub handles_destroyed: usize,
    /// Generator reseeds.
    pub seeds: usize,
}

impl SimulatedCounters {
    /// Total number of memory calls (malloc + free).
    #[must_use]
    pub fn memory_calls(&self) -> usize {
        self.mallocs + self.frees
    }
}

/// In-memory accelerator backend.
///
/// # Example
///
/// ```
/// use accel_runtime::{DeviceBackend, DeviceId, SimulatedDevice};
///
/// let backend = SimulatedDevice::new(2, 1 << 20);
/// let ptr = backend.malloc(DeviceId(1), 4096).unwrap();
/// assert!(!ptr.is_null());
/// assert_eq!(backend.mem_info(DeviceId(1)).unwrap().used_bytes(), 4096);
/// backend.free(DeviceId(1), ptr).unwrap();
/// ```
#[derive(Debug)]
pub struct SimulatedDevice {
    units: Vec<SimulatedUnit>,
    next_handle: AtomicU64,
    live_handles: Mutex<HashSet<(DeviceId, HandleKind, RawHandle)>>,
    generator_seeds: Mutex<HashMap<RawHandle, u64>>,
    mallocs: AtomicUsize,
    frees: AtomicUsize,
    handles_created: AtomicUsize,
    handles_destroyed: AtomicUsize,
    seeds: AtomicUsize,
}

impl SimulatedDevice {
    /// Create `device_count` devices with `capacity_bytes` of memory each.
    #[must_use]
    pub fn new(device_count: usize, capacity_bytes: usize) -> Self {
        let units = (0..device_count)
            .map(|i| SimulatedUnit {
                properties: Self::default_properties(DeviceId(i as u32), capacity_bytes),
                memory: Mutex::new(MemoryState::default()),
            })
            .collect();

        Self {
            units,
            next_handle: AtomicU64::new(1),
            live_handles: Mutex::new(HashSet::new()),
            generator_seeds: Mutex::new(HashMap::new()),
            mallocs: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
            handles_created: AtomicUsize::new(0),
            handles_destroyed: AtomicUsize::new(0),
            seeds: AtomicUsize::new(0),
        }
    }

    fn default_properties(device: DeviceId, capacity_bytes: usize) -> DeviceProperties {
        DeviceProperties {
            device,
            name: format!("Simulated Accelerator {}", device),
            compute_capability: (8, 0),
            total_memory_bytes: capacity_bytes,
            shared_memory_per_block: 48 * 1024,
            registers_per_block: 65_536,
            warp_size: 32,
            max_threads_per_block: 1024,
            max_block_dims: [1024, 1024, 64],
            max_grid_dims: [2_147_483_647, 65_535, 65_535],
            clock_rate_khz: 1_410_000,
            multiprocessor_count: 108,
            kernel_timeout_enabled: false,
        }
    }

    fn unit(&self, device: DeviceId) -> RuntimeResult<&SimulatedUnit> {
        self.units
            .get(device.index())
            .ok_or(RuntimeError::InvalidDevice {
                device,
                device_count: self.units.len(),
            })
    }

    /// Snapshot of call counters.
    #[must_use]
    pub fn counters(&self) -> SimulatedCounters {
        SimulatedCounters {
            mallocs: self.mallocs.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            handles_created: self.handles_created.load(Ordering::Relaxed),
            handles_destroyed: self.handles_destroyed.load(Ordering::Relaxed),
            seeds: self.seeds.load(Ordering::Relaxed),
        }
    }

    /// Number of live allocations on `device`.
    #[must_use]
    pub fn live_allocations(&self, device: DeviceId) -> usize {
        self.units
            .get(device.index())
            .map(|u| u.memory.lock().live.len())
            .unwrap_or(0)
    }

    /// Number of handles created and not yet destroyed.
    #[must_use]
    pub fn live_handles(&self) -> usize {
        self.live_handles.lock().len()
    }

    /// Last seed applied to a generator handle.
    #[must_use]
    pub fn generator_seed(&self, handle: RawHandle) -> Option<u64> {
        self.generator_seeds.lock().get(&handle).copied()
    }
}

impl DeviceBackend for SimulatedDevice {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn device_count(&self) -> usize {
        self.units.len()
    }

    fn properties(&self, device: DeviceId) -> RuntimeResult<DeviceProperties> {
        Ok(self.unit(device)?.properties.clone())
    }

    fn mem_info(&self, device: DeviceId) -> RuntimeResult<DeviceMemory> {
        let unit = self.unit(device)?;
        let total_bytes = unit.properties.total_memory_bytes;
        let used = unit.memory.lock().used_bytes;
        Ok(DeviceMemory {
            free_bytes: total_bytes.saturating_sub(used),
            total_bytes,
        })
    }

    fn malloc(&self, device: DeviceId, bytes: usize) -> RuntimeResult<DevicePtr> {
        let unit = self.unit(device)?;
        let capacity = unit.properties.total_memory_bytes;
        let mut mem = unit.memory.lock();

        let free_bytes = capacity.saturating_sub(mem.used_bytes);
        if bytes > free_bytes {
            return Err(RuntimeError::AllocationFailed {
                device,
                requested_bytes: bytes,
                free_bytes: Some(free_bytes),
                reason: "out of memory".to_string(),
            });
        }

        // Zero-byte requests still consume one address slot.
        let span = (bytes.max(1) as u64).div_ceil(ADDRESS_ALIGNMENT) * ADDRESS_ALIGNMENT;
        let base = (u64::from(device.0) + 1) << ADDRESS_WINDOW_SHIFT;
        let ptr = DevicePtr(base + mem.next_offset);
        mem.next_offset += span;
        mem.used_bytes += bytes;
        mem.live.insert(ptr, bytes);

        self.mallocs.fetch_add(1, Ordering::Relaxed);
        Ok(ptr)
    }

    fn free(&self, device: DeviceId, ptr: DevicePtr) -> RuntimeResult<()> {
        let unit = self.unit(device)?;
        let mut mem = unit.memory.lock();
        let bytes = mem
            .live
            .remove(&ptr)
            .ok_or(RuntimeError::InvalidFree { device, ptr })?;
        mem.used_bytes = mem.used_bytes.saturating_sub(bytes);

        self.frees.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn create_handle(&self, device: DeviceId, kind: HandleKind) -> RuntimeResult<RawHandle> {
        self.unit(device)?;
        let handle = RawHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.live_handles.lock().insert((device, kind, handle));
        self.handles_created.fetch_add(1, Ordering::Relaxed);
        Ok(handle)
    }

    fn destroy_handle(
        &self,
        device: DeviceId,
        kind: HandleKind,
        handle: RawHandle,
    ) -> RuntimeResult<()> {
        if !self.live_handles.lock().remove(&(device, kind, handle)) {
            return Err(RuntimeError::DeviceCallFailed {
                call: "destroy_handle",
                code: -1,
                message: "unknown handle".to_string(),
            });
        }
        self.generator_seeds.lock().remove(&handle);
        self.handles_destroyed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn seed_generator(&self, device: DeviceId, handle: RawHandle, seed: u64) -> RuntimeResult<()> {
        if !self
            .live_handles
            .lock()
            .contains(&(device, HandleKind::RandomGeneration, handle))
        {
            return Err(RuntimeError::DeviceCallFailed {
                call: "seed_generator",
                code: -1,
                message: "unknown random generator".to_string(),
            });
        }
        self.generator_seeds.lock().insert(handle, seed);
        self.seeds.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
