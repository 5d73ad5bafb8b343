//! Value types shared by the device seam, the allocator and the contexts.
//!
//! Everything here is precision-agnostic: memory is counted in bytes and
//! device objects are opaque integers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Device ordinal as seen by the driver (0 for the first accelerator).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub u32);

impl DeviceId {
    /// Ordinal as an index into per-device tables.
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for DeviceId {
    fn from(ordinal: u32) -> Self {
        Self(ordinal)
    }
}

/// Device memory address.
///
/// Successful allocations never hand out [`DevicePtr::NULL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    /// The null device address.
    pub const NULL: DevicePtr = DevicePtr(0);

    /// Check if this is the null address.
    #[inline]
    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address `bytes` past this one.
    #[inline]
    #[must_use]
    pub fn offset(self, bytes: usize) -> DevicePtr {
        DevicePtr(self.0 + bytes as u64)
    }

    /// Raw address for FFI consumers.
    #[inline]
    #[must_use]
    pub fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Device execution stream.
///
/// A stream belongs to exactly one device. Stream id 0 is the device's
/// default stream, which the pool always tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Stream {
    /// Device the stream executes on.
    pub device: DeviceId,
    /// Driver stream handle; 0 is the default stream.
    pub id: u64,
}

impl Stream {
    /// Default stream id.
    pub const DEFAULT_ID: u64 = 0;

    /// The default stream of `device`.
    #[must_use]
    pub fn default_for(device: DeviceId) -> Self {
        Self {
            device,
            id: Self::DEFAULT_ID,
        }
    }

    /// A non-default stream.
    #[must_use]
    pub fn new(device: DeviceId, id: u64) -> Self {
        Self { device, id }
    }

    /// Check if this is the device's default stream.
    #[inline]
    #[must_use]
    pub fn is_default(&self) -> bool {
        self.id == Self::DEFAULT_ID
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device {}/stream {}", self.device, self.id)
    }
}

/// Kind of device compute library handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HandleKind {
    /// Dense linear algebra (cuBLAS).
    LinearAlgebra,
    /// Pseudo-random generation (cuRAND generator).
    RandomGeneration,
    /// Neural-net primitives (cuDNN). Only with the `cudnn` feature.
    NeuralNet,
}

impl HandleKind {
    /// Every handle kind, in creation order.
    pub const ALL: [HandleKind; 3] = [
        HandleKind::LinearAlgebra,
        HandleKind::RandomGeneration,
        HandleKind::NeuralNet,
    ];

    /// Get the human-readable name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LinearAlgebra => "linear-algebra",
            Self::RandomGeneration => "rng-generation",
            Self::NeuralNet => "neural-net-primitives",
        }
    }
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw library handle value as returned by the device backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawHandle(pub u64);

/// Opaque compute library handle bound to one device.
///
/// Owned by the [`ExecutionContext`](crate::ExecutionContext) that created
/// it; copies are only valid while that context keeps the handle alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComputeHandle {
    kind: HandleKind,
    device: DeviceId,
    raw: RawHandle,
}

impl ComputeHandle {
    pub(crate) fn new(kind: HandleKind, device: DeviceId, raw: RawHandle) -> Self {
        Self { kind, device, raw }
    }

    /// Library this handle belongs to.
    #[inline]
    #[must_use]
    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    /// Device the handle was created on.
    #[inline]
    #[must_use]
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Raw value for passing to the device library.
    #[inline]
    #[must_use]
    pub fn raw(&self) -> RawHandle {
        self.raw
    }

    /// Raw value as a C pointer.
    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *mut std::ffi::c_void {
        self.raw.0 as usize as *mut std::ffi::c_void
    }
}

/// Device memory as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceMemory {
    /// Bytes currently free on the device.
    pub free_bytes: usize,
    /// Total device memory in bytes.
    pub total_bytes: usize,
}

impl DeviceMemory {
    /// Bytes in use (`total - free`).
    #[must_use]
    pub fn used_bytes(&self) -> usize {
        self.total_bytes.saturating_sub(self.free_bytes)
    }
}

/// Diagnostic memory snapshot returned by the allocator.
///
/// Advisory only; never used for admission control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MemInfo {
    /// Bytes available for new allocations.
    pub free_bytes: usize,
    /// Bytes currently handed out.
    pub used_bytes: usize,
}

/// Static properties of one device, as printed by a device query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProperties {
    /// Device ordinal.
    pub device: DeviceId,
    /// Marketing name (e.g. "NVIDIA GeForce RTX 4090").
    pub name: String,
    /// Compute capability (major, minor).
    pub compute_capability: (u32, u32),
    /// Total global memory in bytes.
    pub total_memory_bytes: usize,
    /// Shared memory per block in bytes.
    pub shared_memory_per_block: usize,
    /// 32-bit registers per block.
    pub registers_per_block: u32,
    /// Warp size in threads.
    pub warp_size: u32,
    /// Maximum threads per block.
    pub max_threads_per_block: u32,
    /// Maximum block dimensions (x, y, z).
    pub max_block_dims: [u32; 3],
    /// Maximum grid dimensions (x, y, z).
    pub max_grid_dims: [u32; 3],
    /// Core clock in kHz.
    pub clock_rate_khz: u32,
    /// Streaming multiprocessor count.
    pub multiprocessor_count: u32,
    /// Whether a kernel run-time limit applies (display attached).
    pub kernel_timeout_enabled: bool,
}
