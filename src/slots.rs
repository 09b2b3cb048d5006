use core::fmt;
use core::slice;

use crate::allocators::Allocator;
use crate::error::AllocError;
use crate::raw_array::RawArray;

/// A contiguous run of free handle values, `[first, first + count)`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FreeSlot {
    pub first: u32,
    pub count: u32,
}

/// An enum for easy comparison of slots and their order
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Relation {
    Before,
    AdjacentBefore,
    Overlapping,
    AdjacentAfter,
    After,
}

impl FreeSlot {
    pub fn new(first: u32, count: u32) -> Self {
        FreeSlot { first, count }
    }

    /// One past the last free handle in this slot.
    pub fn end(&self) -> u32 {
        self.first + self.count
    }

    pub fn contains(&self, handle: u32) -> bool {
        self.first <= handle && handle < self.end()
    }

    /// Compare two slots to see how they are ordered.
    pub fn relation(&self, other: &Self) -> Relation {
        if self.end() < other.first {
            Relation::Before
        } else if self.end() == other.first {
            Relation::AdjacentBefore
        } else if self.first < other.end() {
            Relation::Overlapping
        } else if self.first == other.end() {
            Relation::AdjacentAfter
        } else {
            Relation::After
        }
    }
}

/// A `SlotList` is the sorted list of free handle ranges behind a
/// [`HandleAlloc32`](../handles/struct.HandleAlloc32.html).
///
/// The slots live in one contiguous array taken from the injected allocator,
/// and are kept up to date by shifting on insert and remove.
///
/// It maintains a few internal invariants:
///
/// - Slots are sorted by `first`.
/// - No slot is empty.
/// - No two slots overlap.
/// - No two slots are precisely adjacent (those are merged on insertion).
pub struct SlotList<A: Allocator> {
    slots: RawArray<FreeSlot, A>,
}

impl<A: Allocator> fmt::Display for SlotList<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SlotList(")?;
        let mut start = true;
        for slot in self {
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            write!(f, "FreeSlot({}, {})", slot.first, slot.count)?;
        }

        write!(f, ")")
    }
}

impl<'list, A: Allocator> IntoIterator for &'list SlotList<A> {
    type Item = &'list FreeSlot;
    type IntoIter = slice::Iter<'list, FreeSlot>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Validity contains a representation of all invalid states found in a
/// SlotList.
#[derive(Default, Debug, PartialEq, Eq)]
pub struct Validity {
    /// Number of slots overlapping other slots.
    ///
    /// This likely indicates corruption.
    pub overlaps: usize,

    /// Number of slots that are directly adjacent to each other, and not
    /// merged. This shouldn't happen, but isn't totally corrupt.
    pub adjacents: usize,

    /// Number of slots that do not start after their predecessor.
    ///
    /// This shouldn't occur.
    pub out_of_orders: usize,

    /// Number of slots holding zero handles.
    pub empties: usize,

    /// Number of slots reaching past the allocator's capacity.
    pub out_of_bounds: usize,
}

impl Validity {
    /// Returns a boolean - a simple check if all cases are 0
    pub fn is_valid(&self) -> bool {
        self.overlaps == 0
            && self.adjacents == 0
            && self.out_of_orders == 0
            && self.empties == 0
            && self.out_of_bounds == 0
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

#[derive(Default, Debug, PartialEq, Eq)]
pub struct Stats {
    /// Number of slots.
    pub length: usize,
    /// Total number of free handles across all slots.
    pub free_handles: u64,
}

impl<A: Allocator> SlotList<A> {
    pub fn new(allocator: A) -> Self {
        SlotList {
            slots: RawArray::new(allocator),
        }
    }

    pub fn allocator(&self) -> &A {
        self.slots.allocator()
    }

    pub fn iter(&self) -> slice::Iter<'_, FreeSlot> {
        self.slots.as_slice().iter()
    }

    pub fn as_slice(&self) -> &[FreeSlot] {
        self.slots.as_slice()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.len() == 0
    }

    /// Index of the first slot starting after `handle`.
    fn upper_bound(&self, handle: u32) -> usize {
        self.as_slice().partition_point(|s| s.first <= handle)
    }

    /// Find the slot containing `handle`, if any.
    pub fn find(&self, handle: u32) -> Option<usize> {
        let idx = self.upper_bound(handle);
        if idx == 0 {
            return None;
        }
        if self.as_slice()[idx - 1].contains(handle) {
            Some(idx - 1)
        } else {
            None
        }
    }

    pub fn contains(&self, handle: u32) -> bool {
        self.find(handle).is_some()
    }

    /// Find and remove `n` handles from the first slot that can hold them.
    ///
    /// Handles are taken from the front of the slot; a slot emptied this way
    /// is removed.
    pub fn take_first_fit(&mut self, n: u32) -> Option<u32> {
        let idx = self.iter().position(|s| s.count >= n)?;
        let slot = &mut self.slots.as_mut_slice()[idx];
        let first = slot.first;

        slot.count -= n;
        if slot.count == 0 {
            self.slots.remove(idx);
        } else {
            slot.first += n;
        }

        Some(first)
    }

    /// Append a slot past every existing one.
    ///
    /// The caller guarantees the slot lies strictly after, and not adjacent
    /// to, the current last slot.
    pub fn push_back(&mut self, slot: FreeSlot) -> Result<(), AllocError> {
        debug_assert!(slot.count > 0, "Pushing an empty slot");
        debug_assert!(
            self.as_slice()
                .last()
                .map_or(true, |last| last.relation(&slot) == Relation::Before),
            "Pushed slot {:?} does not come after {}",
            slot,
            self
        );
        self.slots.push(slot)
    }

    /// Return `[first, first + count)` to the list, merging with the slot
    /// before and/or after it when they touch.
    ///
    /// A range bridging two slots collapses all three into one, so no two
    /// adjacent slots survive a call. Ranges overlapping a free slot are
    /// rejected as double frees.
    pub fn insert_merge(&mut self, first: u32, count: u32) -> Result<(), AllocError> {
        let new = FreeSlot::new(first, count);
        let idx = self.upper_bound(first);
        let slots = self.slots.as_slice();

        let mut merge_before = false;
        if idx > 0 {
            match slots[idx - 1].relation(&new) {
                Relation::Before => {}
                Relation::AdjacentBefore => merge_before = true,
                _ => return Err(AllocError::DoubleFree { first, count }),
            }
        }

        let mut merge_after = false;
        if idx < slots.len() {
            match new.relation(&slots[idx]) {
                Relation::Before => {}
                Relation::AdjacentBefore => merge_after = true,
                _ => return Err(AllocError::DoubleFree { first, count }),
            }
        }

        match (merge_before, merge_after) {
            (true, true) => {
                // The freed range bridges two slots: fold all three into the
                // one before
                let after = self.slots.remove(idx);
                self.slots.as_mut_slice()[idx - 1].count += count + after.count;
            }
            (true, false) => {
                self.slots.as_mut_slice()[idx - 1].count += count;
            }
            (false, true) => {
                let slot = &mut self.slots.as_mut_slice()[idx];
                slot.first = first;
                slot.count += count;
            }
            (false, false) => {
                self.slots.insert(idx, new)?;
            }
        }

        Ok(())
    }

    /// Take the single handle `handle` out of whichever slot holds it,
    /// splitting that slot in two if the handle sits in its middle.
    ///
    /// Returns `false` if `handle` is not free.
    pub fn take_one(&mut self, handle: u32) -> Result<bool, AllocError> {
        let idx = match self.find(handle) {
            None => return Ok(false),
            Some(i) => i,
        };

        let slot = self.slots.as_slice()[idx];
        if slot.count == 1 {
            self.slots.remove(idx);
        } else if handle == slot.first {
            let s = &mut self.slots.as_mut_slice()[idx];
            s.first += 1;
            s.count -= 1;
        } else if handle == slot.end() - 1 {
            self.slots.as_mut_slice()[idx].count -= 1;
        } else {
            let tail = FreeSlot::new(handle + 1, slot.end() - handle - 1);
            // Insert first, so that a failed insert leaves the list untouched
            self.slots.insert(idx + 1, tail)?;
            self.slots.as_mut_slice()[idx].count = handle - slot.first;
        }

        Ok(true)
    }

    /// Check current size of the list, and whether it is valid with respect
    /// to a handle space of `capacity`.
    pub fn stats(&self, capacity: u32) -> (Validity, Stats) {
        let mut validity: Validity = Default::default();
        let mut stats: Stats = Default::default();

        let mut previous: Option<&FreeSlot> = None;
        for next in self.iter() {
            match previous.map(|p| p.relation(next)) {
                Some(Relation::Before) => {
                    // This is valid, do nothing.
                }
                Some(Relation::AdjacentBefore) => {
                    // Right order, but these should be merged.
                    validity.adjacents += 1;
                }
                Some(Relation::Overlapping) => {
                    // This is really bad.
                    validity.overlaps += 1;
                }
                Some(Relation::AdjacentAfter) => {
                    // Wrong order, and these should be merged.
                    validity.out_of_orders += 1;
                    validity.adjacents += 1;
                }
                Some(Relation::After) => {
                    // Wrong order.
                    validity.out_of_orders += 1;
                }
                None => {
                    // This is the first in the list. Valid, do nothing.
                }
            }

            if next.count == 0 {
                validity.empties += 1;
            }
            if u64::from(next.first) + u64::from(next.count) > u64::from(capacity) {
                validity.out_of_bounds += 1;
            }

            stats.length += 1;
            stats.free_handles += u64::from(next.count);
            previous = Some(next);
        }

        (validity, stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::allocators::DefaultAllocator;

    use test_log::test;

    fn list_of(slots: &[(u32, u32)]) -> SlotList<DefaultAllocator> {
        let mut list = SlotList::new(DefaultAllocator::default());
        for &(first, count) in slots {
            list.push_back(FreeSlot::new(first, count)).unwrap();
        }
        list
    }

    fn pairs<A: Allocator>(list: &SlotList<A>) -> Vec<(u32, u32)> {
        list.iter().map(|s| (s.first, s.count)).collect()
    }

    #[test]
    fn test_relation() {
        let a = FreeSlot::new(0, 2);
        assert_eq!(a.relation(&FreeSlot::new(3, 1)), Relation::Before);
        assert_eq!(a.relation(&FreeSlot::new(2, 1)), Relation::AdjacentBefore);
        assert_eq!(a.relation(&FreeSlot::new(1, 4)), Relation::Overlapping);
        assert_eq!(FreeSlot::new(2, 1).relation(&a), Relation::AdjacentAfter);
        assert_eq!(FreeSlot::new(5, 1).relation(&a), Relation::After);
    }

    #[test]
    fn test_insert_merge_cases() {
        let mut list = list_of(&[(0, 2), (10, 2)]);

        // Touches nothing
        list.insert_merge(5, 2).unwrap();
        assert_eq!(pairs(&list), [(0, 2), (5, 2), (10, 2)]);

        // Merges after the first slot
        list.insert_merge(2, 1).unwrap();
        assert_eq!(pairs(&list), [(0, 3), (5, 2), (10, 2)]);

        // Merges before the last slot
        list.insert_merge(9, 1).unwrap();
        assert_eq!(pairs(&list), [(0, 3), (5, 2), (9, 3)]);

        // Bridges two slots
        list.insert_merge(7, 2).unwrap();
        assert_eq!(pairs(&list), [(0, 3), (5, 7)]);

        // Front of the list
        let mut list = list_of(&[(4, 2)]);
        list.insert_merge(0, 1).unwrap();
        assert_eq!(pairs(&list), [(0, 1), (4, 2)]);
        list.insert_merge(1, 3).unwrap();
        assert_eq!(pairs(&list), [(0, 6)]);

        log::info!("merged: {}", list);
        let (validity, stats) = list.stats(6);
        assert!(validity.is_valid());
        assert_eq!(stats.free_handles, 6);
    }

    #[test]
    fn test_double_free_rejected() {
        let mut list = list_of(&[(2, 3), (8, 2)]);
        assert_eq!(
            list.insert_merge(4, 1),
            Err(AllocError::DoubleFree { first: 4, count: 1 })
        );
        assert_eq!(
            list.insert_merge(6, 3),
            Err(AllocError::DoubleFree { first: 6, count: 3 })
        );
        assert_eq!(
            list.insert_merge(0, 3),
            Err(AllocError::DoubleFree { first: 0, count: 3 })
        );
        assert_eq!(pairs(&list), [(2, 3), (8, 2)]);
    }

    #[test]
    fn test_take_first_fit() {
        let mut list = list_of(&[(0, 1), (4, 3), (10, 8)]);
        assert_eq!(list.take_first_fit(3), Some(4));
        assert_eq!(pairs(&list), [(0, 1), (10, 8)]);
        assert_eq!(list.take_first_fit(1), Some(0));
        assert_eq!(list.take_first_fit(5), Some(10));
        assert_eq!(pairs(&list), [(15, 3)]);
        assert_eq!(list.take_first_fit(4), None);
    }

    #[test]
    fn test_take_one() {
        let mut list = list_of(&[(0, 5), (8, 1)]);
        assert!(list.take_one(2).unwrap());
        assert_eq!(pairs(&list), [(0, 2), (3, 2), (8, 1)]);
        assert!(list.take_one(0).unwrap());
        assert!(list.take_one(4).unwrap());
        assert!(list.take_one(8).unwrap());
        assert_eq!(pairs(&list), [(1, 1), (3, 1)]);
        assert!(!list.take_one(2).unwrap());
        assert!(!list.take_one(100).unwrap());
    }

    #[test]
    fn test_find() {
        let list = list_of(&[(3, 2), (9, 4)]);
        assert_eq!(list.find(2), None);
        assert_eq!(list.find(3), Some(0));
        assert_eq!(list.find(4), Some(0));
        assert_eq!(list.find(5), None);
        assert_eq!(list.find(12), Some(1));
        assert_eq!(list.find(13), None);
    }

    #[test]
    fn test_stats_flags_bad_lists() {
        // Build a broken list by hand, bypassing push_back's checks
        let mut list = SlotList::new(DefaultAllocator::default());
        for &(first, count) in &[(0, 2), (2, 1), (1, 4), (0, 0)] {
            list.slots.push(FreeSlot::new(first, count)).unwrap();
        }
        let (validity, stats) = list.stats(4);
        assert_eq!(validity.adjacents, 1);
        assert_eq!(validity.overlaps, 1);
        assert_eq!(validity.out_of_orders, 1);
        assert_eq!(validity.empties, 1);
        assert_eq!(validity.out_of_bounds, 1);
        assert!(!validity.is_valid());
        assert_eq!(stats.length, 4);
        assert_eq!(stats.free_handles, 7);
    }
}
