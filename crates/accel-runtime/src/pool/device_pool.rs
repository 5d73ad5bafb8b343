//! Pool state for a single device.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};

use super::arena::Segment;
use crate::config::PoolConfig;
use crate::device::DeviceBackend;
use crate::error::{RuntimeError, RuntimeResult};
use crate::types::{DeviceId, DevicePtr, MemInfo, Stream};

#[derive(Debug, Clone, Copy)]
struct Block {
    /// Aligned size carved from the segment.
    size: usize,
    /// Stream id the block was allocated on.
    stream: u64,
}

/// Reserved memory of one device, split into blocks on demand.
///
/// # Invariants
///
/// - Every live pointer lies inside exactly one segment.
/// - The default stream is always registered.
#[derive(Debug)]
pub(crate) struct DevicePool {
    device: DeviceId,
    alignment: usize,
    allow_growth: bool,
    growth_bytes: usize,
    segments: Vec<Segment>,
    live: HashMap<DevicePtr, Block>,
    streams: HashSet<u64>,
    in_use_by_stream: HashMap<u64, usize>,
}

impl DevicePool {
    /// Reserve the initial segment on `device`.
    ///
    /// # Errors
    ///
    /// - `RuntimeError::AllocationFailed` if the device has nothing to reserve
    ///   or refuses the reservation
    pub(crate) fn reserve(
        backend: &dyn DeviceBackend,
        device: DeviceId,
        config: &PoolConfig,
    ) -> RuntimeResult<Self> {
        let mem = backend.mem_info(device)?;
        let bytes = config.reservation_for(mem.free_bytes);
        if bytes == 0 {
            return Err(RuntimeError::AllocationFailed {
                device,
                requested_bytes: 0,
                free_bytes: Some(mem.free_bytes),
                reason: "no device memory available for pool reservation".to_string(),
            });
        }

        let base = backend.malloc(device, bytes)?;

        let mut streams = HashSet::new();
        streams.insert(Stream::DEFAULT_ID);

        info!(
            device = device.0,
            reserved_bytes = bytes,
            device_free_bytes = mem.free_bytes,
            "Reserved device memory pool"
        );

        Ok(Self {
            device,
            alignment: config.alignment.max(1),
            allow_growth: config.allow_growth,
            growth_bytes: config.growth_bytes,
            segments: vec![Segment::new(base, bytes)],
            live: HashMap::new(),
            streams,
            in_use_by_stream: HashMap::new(),
        })
    }

    /// Round `bytes` up to the pool alignment.
    ///
    /// Zero-byte requests still get a distinct block. Sizes that overflow
    /// when rounded are reported as an allocation failure.
    fn align(&self, bytes: usize) -> RuntimeResult<usize> {
        bytes
            .max(1)
            .checked_next_multiple_of(self.alignment)
            .ok_or_else(|| RuntimeError::AllocationFailed {
                device: self.device,
                requested_bytes: bytes,
                free_bytes: Some(self.free_bytes()),
                reason: format!("size overflows {}-byte alignment", self.alignment),
            })
    }

    pub(crate) fn register_stream(&mut self, stream: Stream) {
        if self.streams.insert(stream.id) {
            debug!(device = self.device.0, stream = stream.id, "Registered stream with pool");
        }
    }

    pub(crate) fn is_registered(&self, stream: Stream) -> bool {
        self.streams.contains(&stream.id)
    }

    /// Check if `ptr` is a live block of this pool.
    pub(crate) fn owns(&self, ptr: DevicePtr) -> bool {
        self.live.contains_key(&ptr)
    }

    /// Hand out a block of at least `bytes`.
    ///
    /// # Errors
    ///
    /// - `RuntimeError::StreamNotRegistered` for an unknown stream
    /// - `RuntimeError::PoolExhausted` if nothing fits and growth is disabled
    /// - `RuntimeError::AllocationFailed` if a growth segment cannot be reserved
    pub(crate) fn allocate(
        &mut self,
        backend: &dyn DeviceBackend,
        bytes: usize,
        stream: Stream,
    ) -> RuntimeResult<DevicePtr> {
        if !self.is_registered(stream) {
            return Err(RuntimeError::StreamNotRegistered { stream });
        }

        let size = self.align(bytes)?;
        let ptr = match self.segments.iter_mut().find_map(|seg| seg.alloc(size)) {
            Some(ptr) => ptr,
            None => self.grow(backend, size)?,
        };

        self.live.insert(
            ptr,
            Block {
                size,
                stream: stream.id,
            },
        );
        *self.in_use_by_stream.entry(stream.id).or_insert(0) += size;
        Ok(ptr)
    }

    fn grow(&mut self, backend: &dyn DeviceBackend, size: usize) -> RuntimeResult<DevicePtr> {
        if !self.allow_growth {
            debug!(
                device = self.device.0,
                requested_bytes = size,
                largest_free_block = self.largest_free_block(),
                free_blocks = self.free_block_count(),
                "Pool exhausted"
            );
            return Err(RuntimeError::PoolExhausted {
                device: self.device,
                requested_bytes: size,
                available_bytes: self.free_bytes(),
            });
        }

        let segment_bytes = self.align(size.max(self.growth_bytes))?;
        let base = backend.malloc(self.device, segment_bytes)?;
        info!(
            device = self.device.0,
            segment_bytes,
            segments = self.segments.len() + 1,
            "Grew device memory pool"
        );

        let mut segment = Segment::new(base, segment_bytes);
        let ptr = segment.alloc(size).ok_or(RuntimeError::PoolExhausted {
            device: self.device,
            requested_bytes: size,
            available_bytes: segment_bytes,
        })?;
        self.segments.push(segment);
        Ok(ptr)
    }

    /// Return a block to its segment.
    ///
    /// # Errors
    ///
    /// - `RuntimeError::InvalidFree` if `ptr` is not a live block
    pub(crate) fn free(&mut self, ptr: DevicePtr, stream: Stream) -> RuntimeResult<()> {
        let block = self.live.remove(&ptr).ok_or(RuntimeError::InvalidFree {
            device: self.device,
            ptr,
        })?;

        if block.stream != stream.id {
            debug!(
                device = self.device.0,
                allocated_on = block.stream,
                freed_on = stream.id,
                "Block freed on a different stream than it was allocated on"
            );
        }

        if let Some(in_use) = self.in_use_by_stream.get_mut(&block.stream) {
            *in_use = in_use.saturating_sub(block.size);
        }

        // Live blocks always lie inside a segment.
        if let Some(segment) = self.segments.iter_mut().find(|s| s.contains(ptr)) {
            segment.release(ptr, block.size);
        }
        Ok(())
    }

    pub(crate) fn free_bytes(&self) -> usize {
        self.segments.iter().map(Segment::free_bytes).sum()
    }

    pub(crate) fn used_bytes(&self) -> usize {
        self.live.values().map(|b| b.size).sum()
    }

    pub(crate) fn reserved_bytes(&self) -> usize {
        self.segments.iter().map(Segment::size).sum()
    }

    pub(crate) fn info(&self) -> MemInfo {
        MemInfo {
            free_bytes: self.free_bytes(),
            used_bytes: self.used_bytes(),
        }
    }

    /// Bytes currently handed out on `stream`.
    pub(crate) fn in_use_on(&self, stream: Stream) -> usize {
        self.in_use_by_stream.get(&stream.id).copied().unwrap_or(0)
    }

    fn largest_free_block(&self) -> usize {
        self.segments
            .iter()
            .map(Segment::largest_free_block)
            .max()
            .unwrap_or(0)
    }

    fn free_block_count(&self) -> usize {
        self.segments.iter().map(Segment::free_block_count).sum()
    }

    #[cfg(test)]
    pub(crate) fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Return every segment to the device.
    ///
    /// Live blocks are leaked from the caller's point of view; they are
    /// reported, then their memory goes back with the segment.
    pub(crate) fn release(mut self, backend: &dyn DeviceBackend) {
        if !self.live.is_empty() {
            warn!(
                device = self.device.0,
                live_blocks = self.live.len(),
                live_bytes = self.used_bytes(),
                "Destroying pool with live allocations"
            );
        }

        for segment in self.segments.drain(..) {
            if let Err(e) = backend.free(self.device, segment.base()) {
                warn!(
                    device = self.device.0,
                    base = %segment.base(),
                    error = %e,
                    "Failed to release pool segment"
                );
            }
        }
        debug!(device = self.device.0, "Released device memory pool");
    }
}
