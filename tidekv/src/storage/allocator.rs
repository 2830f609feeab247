//! Free-space allocator for the data heap.
//!
//! Records live at arbitrary byte offsets, so instead of a page bitmap the
//! allocator tracks free byte ranges released by superseded nodes and
//! tombstoned values, and hands them back best-fit before the file grows.
//!
//! # Structure
//!
//! - `sizes`: size -> set of free addresses of exactly that size. The key
//!   order doubles as the size-ordered sequence used for best-fit search.
//! - `blocks`: free address -> size, used for right-hand coalescing.
//!
//! # Invariants
//!
//! - `sizes` never holds more than `capacity` distinct sizes and never more
//!   than `capacity` addresses under one size.
//! - Every `(address, size)` in `blocks` appears in `sizes[size]` and vice versa.
//! - No two tracked free ranges overlap.
//!
//! Anything that would break the bounds above is dropped from tracking. That
//! leaks disk space until the file is rebuilt, never correctness.

use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Default number of distinct free sizes the allocator remembers.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Best-fit allocator over released byte ranges.
#[derive(Debug)]
pub struct FreeSpaceAllocator {
    /// Free addresses grouped by exact size.
    sizes: BTreeMap<u64, BTreeSet<u64>>,
    /// Free address -> size.
    blocks: HashMap<u64, u64>,
    /// Bound on distinct sizes, and on addresses per size.
    capacity: usize,
    /// Bytes dropped from tracking because a bound was hit.
    leaked: u64,
}

impl Default for FreeSpaceAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl FreeSpaceAllocator {
    /// Create an empty allocator.
    ///
    /// # Panics
    /// Panics if capacity is 0.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "allocator capacity must be positive");
        Self {
            sizes: BTreeMap::new(),
            blocks: HashMap::new(),
            capacity,
            leaked: 0,
        }
    }

    /// Take `size` bytes from the smallest free block that can hold them.
    ///
    /// Returns `None` when no tracked block is large enough; the caller then
    /// appends at end-of-file. When the chosen block is larger than `size`,
    /// the unused tail goes straight back through [`release`](Self::release).
    pub fn allocate(&mut self, size: u64) -> Option<u64> {
        if size == 0 {
            return None;
        }

        let found_size = *self.sizes.range(size..).next()?.0;
        let address = self.take(found_size)?;
        self.release(address + size, found_size - size);
        Some(address)
    }

    /// Return a byte range to the allocator.
    ///
    /// Any free block starting exactly at the end of the range is absorbed,
    /// repeatedly, so adjacent frees to the right collapse into one block.
    /// Blocks to the left are not merged.
    pub fn release(&mut self, address: u64, size: u64) {
        if size == 0 {
            return;
        }

        let mut tail = address + size;
        while let Some(tail_size) = self.blocks.remove(&tail) {
            self.forget(tail_size, tail);
            tail += tail_size;
        }
        let size = tail - address;

        if let Some(addresses) = self.sizes.get_mut(&size) {
            if addresses.len() < self.capacity {
                addresses.insert(address);
                self.blocks.insert(address, size);
            } else {
                self.leaked += size;
            }
            return;
        }

        self.sizes.insert(size, BTreeSet::from([address]));
        self.blocks.insert(address, size);

        if self.sizes.len() > self.capacity {
            self.evict_smallest();
        }
    }

    /// Whether `address` is the start of a tracked free block.
    #[must_use]
    pub fn is_free(&self, address: u64) -> bool {
        self.blocks.contains_key(&address)
    }

    /// Number of tracked free blocks.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Number of distinct free sizes currently tracked.
    #[must_use]
    pub fn size_count(&self) -> usize {
        self.sizes.len()
    }

    /// Total bytes held in tracked free blocks.
    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.blocks.values().sum()
    }

    /// Bytes permanently dropped from tracking since creation.
    #[must_use]
    pub const fn leaked_bytes(&self) -> u64 {
        self.leaked
    }

    /// Remove and return one address of exactly `size`.
    fn take(&mut self, size: u64) -> Option<u64> {
        let addresses = self.sizes.get_mut(&size)?;
        let address = addresses.pop_last()?;
        if addresses.is_empty() {
            self.sizes.remove(&size);
        }
        self.blocks.remove(&address);
        Some(address)
    }

    /// Drop `address` from the size index (it is already gone from `blocks`).
    fn forget(&mut self, size: u64, address: u64) {
        if let Some(addresses) = self.sizes.get_mut(&size) {
            addresses.remove(&address);
            if addresses.is_empty() {
                self.sizes.remove(&size);
            }
        }
    }

    /// Drop the smallest size class and every block in it.
    fn evict_smallest(&mut self) {
        let Some((size, addresses)) = self.sizes.pop_first() else {
            return;
        };
        for address in &addresses {
            self.blocks.remove(address);
        }
        let lost = size * addresses.len() as u64;
        self.leaked += lost;
        tracing::warn!(
            "Allocator evicted {} free blocks of {} bytes ({} bytes leaked)",
            addresses.len(),
            size,
            lost
        );
    }
}
