//! `HandleAlloc32`: hands out opaque `u32` handles in contiguous runs.
//!
//! A handle is just an index. It carries no payload and no generation tag;
//! callers use it to key their own parallel storage. The allocator's only
//! job is remembering which integers are checked out.
//!
//! Free handles are tracked as a sorted list of free ranges (see
//! [`SlotList`](../slots/struct.SlotList.html)). Allocation is first-fit from
//! that list; when nothing fits, the handle space grows by a fixed delta.
//! Freeing merges the range with its neighbours, so the list never holds two
//! adjacent ranges.
//!
//! ```text
//!   capacity = 8
//!   handle:  0   1   2   3   4   5   6   7
//!          +---+---+---+---+---+---+---+---+
//!          | x | x | x |   | x | x |   |   |
//!          +---+---+---+---+---+---+---+---+
//!   slots:             {3,1}         {6,2}
//! ```

use core::fmt;
use core::iter::FusedIterator;

use crate::allocators::Allocator;
use crate::error::AllocError;
use crate::slots::{FreeSlot, SlotList, Stats, Validity};

/// How much the handle space grows by when a caller doesn't pick.
pub const DEFAULT_CAPACITY_DELTA: u32 = 1024;

/// An allocator of `u32` handles, built on an injected memory allocator that
/// backs its free-range list.
///
/// Not synchronized; wrap it in a lock to share it.
pub struct HandleAlloc32<A: Allocator> {
    slots: SlotList<A>,
    capacity: u32,
    delta: u32,
}

impl<A: Allocator> fmt::Display for HandleAlloc32<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HandleAlloc32(capacity {}, {})", self.capacity, self.slots)
    }
}

impl<A: Allocator> HandleAlloc32<A> {
    /// Never a valid handle; for callers that keep "no handle" in a plain
    /// integer field.
    pub const INVALID: u32 = u32::MAX;

    /// Create an empty allocator whose handle space grows by `capacity_delta`
    /// each time it runs out.
    ///
    /// `capacity_delta` bounds the size of any single run: requesting more
    /// handles than that in one call is an error.
    pub fn new(allocator: A, capacity_delta: u32) -> Self {
        assert!(capacity_delta > 0, "Handle capacity delta must be non-zero");
        HandleAlloc32 {
            slots: SlotList::new(allocator),
            capacity: 0,
            delta: capacity_delta,
        }
    }

    pub fn with_default_delta(allocator: A) -> Self {
        HandleAlloc32::new(allocator, DEFAULT_CAPACITY_DELTA)
    }

    /// The memory allocator backing the free-range list.
    pub fn allocator(&self) -> &A {
        self.slots.allocator()
    }

    /// Current size of the handle space. Never decreases.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn capacity_delta(&self) -> u32 {
        self.delta
    }

    /// The free ranges, sorted by first handle.
    pub fn slots(&self) -> &[FreeSlot] {
        self.slots.as_slice()
    }

    /// Number of handles currently checked out.
    pub fn num_allocated(&self) -> u32 {
        let free: u32 = self.slots.iter().map(|s| s.count).sum();
        self.capacity - free
    }

    /// Check the free-range list for corruption, and count what it holds.
    pub fn stats(&self) -> (Validity, Stats) {
        self.slots.stats(self.capacity)
    }

    /// Allocate `n` consecutive handles and return the first.
    ///
    /// The first free range that can hold `n` handles gives up its front. If
    /// none can, the handle space grows by the capacity delta and the run is
    /// taken from the start of the new space.
    ///
    /// On error nothing changes.
    pub fn alloc_handles(&mut self, n: u32) -> Result<u32, AllocError> {
        if n == 0 {
            return Err(AllocError::EmptyRun);
        }
        if n > self.delta {
            return Err(AllocError::RunTooLarge {
                requested: n,
                delta: self.delta,
            });
        }

        if let Some(first) = self.slots.take_first_fit(n) {
            log::trace!("Allocated handles {}..{} from free list", first, first + n);
            return Ok(first);
        }

        let first = self.capacity;
        let new_capacity = first
            .checked_add(self.delta)
            .ok_or(AllocError::OutOfHandles)?;

        if n < self.delta {
            self.slots
                .push_back(FreeSlot::new(first + n, self.delta - n))?;
        }
        self.capacity = new_capacity;

        log::debug!(
            "Handle capacity grew to {}; allocated handles {}..{}",
            new_capacity,
            first,
            first + n
        );
        Ok(first)
    }

    /// Free the `n` handles starting at `first`.
    ///
    /// The range must have been allocated; freeing handles beyond the
    /// capacity, or handles already free, is an error and changes nothing.
    pub fn free_handles(&mut self, first: u32, n: u32) -> Result<(), AllocError> {
        if n == 0 {
            return Err(AllocError::EmptyRun);
        }

        let in_range = first
            .checked_add(n)
            .map_or(false, |end| end <= self.capacity);
        if !in_range {
            return Err(AllocError::OutOfRange {
                first,
                count: n,
                capacity: self.capacity,
            });
        }

        self.slots.insert_merge(first, n)?;
        log::trace!("Freed handles {}..{}", first, first + n);
        Ok(())
    }

    /// Reserve one specific handle, for callers that need stable,
    /// pre-assigned IDs.
    ///
    /// Grows the handle space as needed to reach `handle`. Returns `false` if
    /// the handle is already allocated.
    pub fn alloc_specific_handle(&mut self, handle: u32) -> Result<bool, AllocError> {
        if handle == Self::INVALID {
            return Err(AllocError::OutOfHandles);
        }

        while handle >= self.capacity {
            let new_capacity = self
                .capacity
                .checked_add(self.delta)
                .ok_or(AllocError::OutOfHandles)?;
            self.slots.insert_merge(self.capacity, self.delta)?;
            self.capacity = new_capacity;
            log::debug!("Handle capacity grew to {}", new_capacity);
        }

        self.slots.take_one(handle)
    }

    /// Whether `handle` is currently allocated.
    ///
    /// Handles past the capacity are simply not valid.
    pub fn is_valid(&self, handle: u32) -> bool {
        handle < self.capacity && !self.slots.contains(handle)
    }

    /// Iterate over every allocated handle, in ascending order.
    pub fn iter(&self) -> HandleIter<'_> {
        HandleIter {
            slots: self.slots.as_slice(),
            next: 0,
            capacity: self.capacity,
        }
    }
}

impl<'a, A: Allocator> IntoIterator for &'a HandleAlloc32<A> {
    type Item = u32;
    type IntoIter = HandleIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Walks the complement of the free-range list over `[0, capacity)`.
pub struct HandleIter<'a> {
    slots: &'a [FreeSlot],
    next: u32,
    capacity: u32,
}

impl<'a> Iterator for HandleIter<'a> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        loop {
            if self.next >= self.capacity {
                return None;
            }

            match self.slots.split_first() {
                Some((slot, rest)) if self.next >= slot.first => {
                    // Skip over the free range
                    self.next = slot.end();
                    self.slots = rest;
                }
                _ => {
                    let handle = self.next;
                    self.next += 1;
                    return Some(handle);
                }
            }
        }
    }
}

impl<'a> FusedIterator for HandleIter<'a> {}
