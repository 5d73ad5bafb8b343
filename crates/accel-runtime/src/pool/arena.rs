//! First-fit sub-allocator over one contiguous device reservation.
//!
//! A `Segment` never touches the device; it only carves offsets out of a
//! range that its owner obtained with one `malloc`.

use std::collections::BTreeMap;

use crate::types::DevicePtr;

/// One contiguous reservation and its free list.
///
/// # Invariants
///
/// - Free blocks never overlap and never touch (adjacent blocks are merged).
/// - `free_bytes() + handed_out == size`
#[derive(Debug)]
pub(crate) struct Segment {
    base: DevicePtr,
    size: usize,
    /// offset -> length of each free block
    free: BTreeMap<usize, usize>,
}

impl Segment {
    pub(crate) fn new(base: DevicePtr, size: usize) -> Self {
        let mut free = BTreeMap::new();
        if size > 0 {
            free.insert(0, size);
        }
        Self { base, size, free }
    }

    pub(crate) fn base(&self) -> DevicePtr {
        self.base
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    /// Check if `ptr` falls inside this segment.
    pub(crate) fn contains(&self, ptr: DevicePtr) -> bool {
        ptr.0 >= self.base.0 && ptr.0 < self.base.0 + self.size as u64
    }

    pub(crate) fn free_bytes(&self) -> usize {
        self.free.values().sum()
    }

    pub(crate) fn largest_free_block(&self) -> usize {
        self.free.values().copied().max().unwrap_or(0)
    }

    /// Take `bytes` from the lowest free block that fits.
    ///
    /// `bytes` must already be rounded to the pool alignment.
    pub(crate) fn alloc(&mut self, bytes: usize) -> Option<DevicePtr> {
        let (offset, len) = self
            .free
            .iter()
            .find(|(_, &len)| len >= bytes)
            .map(|(&offset, &len)| (offset, len))?;

        self.free.remove(&offset);
        if len > bytes {
            self.free.insert(offset + bytes, len - bytes);
        }
        Some(self.base.offset(offset))
    }

    /// Return `bytes` at `ptr` to the free list, merging with neighbours.
    pub(crate) fn release(&mut self, ptr: DevicePtr, bytes: usize) {
        let mut offset = (ptr.0 - self.base.0) as usize;
        let mut len = bytes;

        // Merge with the block that ends where this one starts.
        if let Some((&prev_off, &prev_len)) = self.free.range(..offset).next_back() {
            if prev_off + prev_len == offset {
                self.free.remove(&prev_off);
                offset = prev_off;
                len += prev_len;
            }
        }

        // Merge with the block that starts where this one ends.
        if let Some(&next_len) = self.free.get(&(offset + len)) {
            self.free.remove(&(offset + len));
            len += next_len;
        }

        self.free.insert(offset, len);
    }

    /// Number of free blocks (fragmentation indicator).
    pub(crate) fn free_block_count(&self) -> usize {
        self.free.len()
    }
}
