//! A linear (bump) arena allocator.
//!
//! Memory comes from a list of chunks taken from a backing allocator.
//! Allocating bumps an offset inside the current chunk; nothing is freed
//! individually. `free_all` rewinds every chunk to empty and keeps them all,
//! so steady-state use (say, once per frame) costs no backing allocator
//! traffic at all.
//!
//! Each chunk carries its own header in-band:
//!
//! ```text
//! +-------------+------------------------------------------+
//! | Chunk       | buffer (capacity bytes)                  |
//! | next        | used ........ | offset -> free ......... |
//! | offset      |                                          |
//! | capacity    |                                          |
//! +-------------+------------------------------------------+
//!   CHUNK_HEADER_SIZE, 16-byte aligned
//! ```

use core::mem;
use core::ptr::{self, null_mut, NonNull};

use static_assertions::const_assert;

use crate::allocators::{align_up, checked_round_up, normalize_align, Allocator};
use crate::error::AllocError;

const CHUNK_ALIGN: usize = 16;
const CHUNK_HEADER_SIZE: usize = 32;
const_assert!(mem::size_of::<Chunk>() <= CHUNK_HEADER_SIZE);
const_assert!(CHUNK_HEADER_SIZE % CHUNK_ALIGN == 0);

#[repr(C)]
struct Chunk {
    next: Option<NonNull<Chunk>>,
    offset: usize,
    capacity: usize,
}

impl Chunk {
    fn buffer(chunk: NonNull<Chunk>) -> *mut u8 {
        unsafe { (chunk.as_ptr() as *mut u8).add(CHUNK_HEADER_SIZE) }
    }

    // Bump-allocate from this chunk, or None if it doesn't fit
    unsafe fn bump(chunk: NonNull<Chunk>, size: usize, align: usize) -> Option<NonNull<u8>> {
        let buffer = Self::buffer(chunk);
        let c = &mut *chunk.as_ptr();

        let start = align_up(buffer as usize + c.offset, align)? - buffer as usize;
        if start.checked_add(size)? > c.capacity {
            return None;
        }

        c.offset = start + size;
        Some(NonNull::new_unchecked(buffer.add(start)))
    }
}

/// Usage summary of a [`LinearAllocator`](struct.LinearAllocator.html).
#[derive(Default, Debug, PartialEq, Eq)]
pub struct LinearStats {
    /// Number of chunks obtained from the backing allocator.
    pub chunks: usize,
    /// Total buffer bytes across all chunks.
    pub capacity: usize,
    /// Bytes handed out since the last `free_all`, including alignment
    /// padding.
    pub used: usize,
}

pub struct LinearAllocator<B: Allocator> {
    backing: B,
    head: Option<NonNull<Chunk>>,
    tail: Option<NonNull<Chunk>>,
    current: Option<NonNull<Chunk>>,
    min_chunk_size: usize,
}

// The chunk list is owned exclusively by the allocator.
unsafe impl<B: Allocator + Send> Send for LinearAllocator<B> {}

impl<B: Allocator> LinearAllocator<B> {
    /// Create an arena that takes chunks of at least `min_chunk_size` bytes
    /// from `backing`. No memory is taken until the first allocation.
    ///
    /// Panics if `min_chunk_size` is not a power of two.
    pub fn new(backing: B, min_chunk_size: usize) -> Self {
        assert!(
            min_chunk_size.is_power_of_two(),
            "Linear allocator chunk size should be a power of 2, got {}",
            min_chunk_size
        );

        LinearAllocator {
            backing,
            head: None,
            tail: None,
            current: None,
            min_chunk_size,
        }
    }

    /// Allocate `size` bytes aligned to `align` (`0` for the default).
    ///
    /// Tries the current chunk, then any later chunk left over from before
    /// the last `free_all`, and finally appends a fresh chunk big enough for
    /// the request.
    pub fn allocate(&mut self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
        let align = normalize_align(align);

        let mut cursor = self.current;
        while let Some(chunk) = cursor {
            if let Some(ptr) = unsafe { Chunk::bump(chunk, size, align) } {
                self.current = Some(chunk);
                return Ok(ptr);
            }
            cursor = unsafe { chunk.as_ref().next };
        }

        let chunk = self.append_chunk(size, align)?;
        self.current = Some(chunk);
        unsafe { Chunk::bump(chunk, size, align) }.ok_or(AllocError::OutOfMemory { size, align })
    }

    fn append_chunk(&mut self, size: usize, align: usize) -> Result<NonNull<Chunk>, AllocError> {
        // Leave room to align the first allocation when it wants more than
        // the buffer's own alignment
        let capacity = size
            .checked_add(align.saturating_sub(CHUNK_ALIGN))
            .and_then(|padded| checked_round_up(padded, self.min_chunk_size))
            .ok_or(AllocError::OutOfMemory { size, align })?
            .max(self.min_chunk_size);
        let total = capacity
            .checked_add(CHUNK_HEADER_SIZE)
            .ok_or(AllocError::OutOfMemory { size, align })?;

        let mem = self.backing.alloc(total, CHUNK_ALIGN);
        let chunk = NonNull::new(mem as *mut Chunk).ok_or(AllocError::OutOfMemory {
            size: total,
            align: CHUNK_ALIGN,
        })?;

        unsafe {
            ptr::write(
                chunk.as_ptr(),
                Chunk {
                    next: None,
                    offset: 0,
                    capacity,
                },
            );

            match self.tail {
                Some(mut tail) => tail.as_mut().next = Some(chunk),
                None => self.head = Some(chunk),
            }
        }
        self.tail = Some(chunk);

        log::debug!("LinearAllocator added a chunk of {} bytes", capacity);
        Ok(chunk)
    }

    fn chunks(&self) -> ChunkIter {
        ChunkIter { next: self.head }
    }

    /// Forget every allocation at once. Chunks are kept for reuse.
    pub fn free_all(&mut self) {
        for chunk in self.chunks() {
            unsafe { (*chunk.as_ptr()).offset = 0 };
        }
        self.current = self.head;
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks().count()
    }

    pub fn stats(&self) -> LinearStats {
        let mut stats = LinearStats::default();
        for chunk in self.chunks() {
            let c = unsafe { chunk.as_ref() };
            stats.chunks += 1;
            stats.capacity += c.capacity;
            stats.used += c.offset;
        }
        stats
    }

    /// Whether `ptr` points into one of this arena's chunks.
    pub fn owns(&self, ptr: *const u8) -> bool {
        self.chunks().any(|chunk| {
            let start = Chunk::buffer(chunk) as *const u8;
            let capacity = unsafe { chunk.as_ref().capacity };
            start <= ptr && ptr <= unsafe { start.add(capacity) }
        })
    }
}

struct ChunkIter {
    next: Option<NonNull<Chunk>>,
}

impl Iterator for ChunkIter {
    type Item = NonNull<Chunk>;

    fn next(&mut self) -> Option<NonNull<Chunk>> {
        let chunk = self.next?;
        self.next = unsafe { chunk.as_ref().next };
        Some(chunk)
    }
}

impl<B: Allocator> Allocator for LinearAllocator<B> {
    unsafe fn realloc(&mut self, ptr: *mut u8, size: usize, align: usize) -> *mut u8 {
        if ptr.is_null() {
            if size == 0 {
                return null_mut();
            }
            return self.allocate(size, align).map_or(null_mut(), NonNull::as_ptr);
        }

        debug_assert!(self.owns(ptr), "Invalid pointer passed to LinearAllocator");
        if size != 0 {
            debug_assert!(false, "LinearAllocator doesn't support reallocations");
        }
        // Individual frees are ignored; memory comes back on free_all
        null_mut()
    }
}

impl<B: Allocator> Drop for LinearAllocator<B> {
    fn drop(&mut self) {
        let mut next = self.head.take();
        while let Some(chunk) = next {
            unsafe {
                next = chunk.as_ref().next;
                self.backing.free(chunk.as_ptr() as *mut u8, CHUNK_ALIGN);
            }
        }
        self.tail = None;
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::allocators::{DefaultAllocator, SystemAllocator, ToyHeap};
    use crate::tracer::TracingAllocator;

    use test_log::test;

    #[test]
    fn test_bump_sequence() {
        let mut arena = LinearAllocator::new(DefaultAllocator::default(), 256);
        assert_eq!(arena.chunk_count(), 0);

        let a = arena.allocate(16, 8).unwrap();
        let b = arena.allocate(16, 8).unwrap();
        assert_eq!(unsafe { a.as_ptr().add(16) }, b.as_ptr());

        let c = arena.allocate(1, 0).unwrap();
        let d = arena.allocate(8, 64).unwrap();
        assert_eq!(d.as_ptr() as usize % 64, 0);
        assert!(d.as_ptr() as usize > c.as_ptr() as usize);
        assert_eq!(arena.chunk_count(), 1);
    }

    #[test]
    fn test_new_chunks_on_exhaustion() {
        let mut arena = LinearAllocator::new(DefaultAllocator::default(), 64);
        arena.allocate(48, 0).unwrap();
        arena.allocate(48, 0).unwrap();
        assert_eq!(arena.chunk_count(), 2);

        // A request bigger than the minimum gets a chunk to match
        let big = arena.allocate(1000, 0).unwrap();
        assert!(arena.owns(big.as_ptr()));
        assert_eq!(
            arena.stats(),
            LinearStats {
                chunks: 3,
                capacity: 64 + 64 + 1024,
                used: 48 + 48 + 1000,
            }
        );
    }

    #[test]
    fn test_large_alignment_fits_fresh_chunk() {
        let mut arena = LinearAllocator::new(DefaultAllocator::default(), 64);
        let p = arena.allocate(64, 256).unwrap();
        assert_eq!(p.as_ptr() as usize % 256, 0);
        assert_eq!(arena.chunk_count(), 1);
    }

    #[test]
    fn test_free_all_reuses_chunks() {
        let mut backing = TracingAllocator::new("arena", DefaultAllocator::default());
        {
            let mut arena = LinearAllocator::new(&mut backing, 128);
            let sizes = [(24, 8), (100, 16), (7, 0), (64, 32), (200, 8)];

            let first: Vec<_> = sizes
                .iter()
                .map(|&(s, a)| arena.allocate(s, a).unwrap())
                .collect();
            let chunks = arena.chunk_count();

            arena.free_all();
            assert_eq!(arena.stats().used, 0);

            let second: Vec<_> = sizes
                .iter()
                .map(|&(s, a)| arena.allocate(s, a).unwrap())
                .collect();
            assert_eq!(first, second);
            assert_eq!(arena.chunk_count(), chunks);
        }

        // Dropping the arena gave every chunk back
        let stats = backing.stats();
        assert_eq!(stats.live_allocations, 0);
        assert_eq!(stats.total_allocations, stats.total_frees);
    }

    #[test]
    fn test_free_all_without_chunks() {
        let mut arena = LinearAllocator::new(DefaultAllocator::default(), 64);
        arena.free_all();
        assert_eq!(arena.stats(), LinearStats::default());
        arena.free_all();
        assert!(arena.allocate(8, 0).is_ok());
    }

    #[test]
    fn test_capability_ignores_free() {
        let mut arena = LinearAllocator::new(DefaultAllocator::default(), 64);
        let p = arena.alloc(16, 0);
        assert!(!p.is_null());
        unsafe { arena.free(p, 0) };
        // Still bumping past the "freed" block
        let q = arena.alloc(16, 0);
        assert_eq!(q, unsafe { p.add(16) });
        assert!(arena.alloc(0, 0).is_null());
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "doesn't support reallocations")]
    fn test_realloc_is_rejected() {
        let mut arena = LinearAllocator::new(DefaultAllocator::default(), 64);
        let p = arena.alloc(16, 0);
        unsafe { arena.realloc(p, 32, 0) };
    }

    #[test]
    fn test_backing_failure() {
        let mut arena = LinearAllocator::new(SystemAllocator::new(ToyHeap::new(512)), 256);
        assert!(arena.allocate(100, 0).is_ok());
        assert!(matches!(
            arena.allocate(200, 0),
            Err(AllocError::OutOfMemory { .. })
        ));
        // The first chunk is still usable
        assert!(arena.allocate(100, 0).is_ok());
    }

    #[test]
    fn test_huge_request_is_out_of_memory() {
        let mut arena = LinearAllocator::new(DefaultAllocator::default(), 64);
        assert_eq!(
            arena.allocate(usize::MAX - 10, 8),
            Err(AllocError::OutOfMemory {
                size: usize::MAX - 10,
                align: 8
            })
        );
        assert!(matches!(
            arena.allocate(usize::MAX - CHUNK_HEADER_SIZE, 0),
            Err(AllocError::OutOfMemory { .. })
        ));
        assert!(arena.alloc(usize::MAX, 0).is_null());
        assert_eq!(arena.chunk_count(), 0);

        // Nothing was left half-built
        assert!(arena.allocate(32, 0).is_ok());
        assert_eq!(arena.chunk_count(), 1);
    }

    #[test]
    #[should_panic(expected = "power of 2")]
    fn test_chunk_size_must_be_power_of_two() {
        LinearAllocator::new(DefaultAllocator::default(), 100);
    }
}
