//! A pool of same-sized objects.
//!
//! Objects live in chunks of `objs_per_chunk` slots taken from a backing
//! allocator. Each chunk threads an intrusive free list through its free
//! slots: a free slot holds the `u32` index of the next free slot. Slots are
//! put on the list lazily, one per allocation, so a fresh chunk costs nothing
//! to set up.

use core::alloc::Layout;
use core::mem;
use core::ptr::{self, NonNull};

use crate::allocators::{round_up, Allocator};
use crate::error::AllocError;

#[repr(C)]
struct PoolChunk {
    next: Option<NonNull<PoolChunk>>,
    // Index of the first free slot; objs_per_chunk when there is none
    next_free: u32,
    num_free: u32,
    num_initialized: u32,
}

pub struct ObjectPool<B: Allocator> {
    backing: B,
    chunks: Option<NonNull<PoolChunk>>,
    stride: usize,
    chunk_align: usize,
    data_offset: usize,
    objs_per_chunk: u32,
    live: usize,
}

// The chunks are owned exclusively by the pool.
unsafe impl<B: Allocator + Send> Send for ObjectPool<B> {}

impl<B: Allocator> ObjectPool<B> {
    /// Create a pool of objects fitting `layout`, allocating
    /// `objs_per_chunk` of them at a time.
    ///
    /// Slots are at least 4 bytes, to hold the free list link.
    pub fn new(backing: B, layout: Layout, objs_per_chunk: u32) -> Self {
        assert!(objs_per_chunk > 0, "Object pool chunks must hold at least one object");

        let slot_align = layout.align().max(mem::align_of::<u32>());
        let stride = round_up(layout.size().max(mem::size_of::<u32>()), slot_align);
        ObjectPool {
            backing,
            chunks: None,
            stride,
            chunk_align: slot_align.max(mem::align_of::<PoolChunk>()),
            data_offset: round_up(mem::size_of::<PoolChunk>(), slot_align),
            objs_per_chunk,
            live: 0,
        }
    }

    /// Distance in bytes between neighbouring objects.
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Number of objects handed out and not yet freed.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn chunk_count(&self) -> usize {
        let mut count = 0;
        let mut next = self.chunks;
        while let Some(chunk) = next {
            count += 1;
            next = unsafe { chunk.as_ref().next };
        }
        count
    }

    fn data(&self, chunk: NonNull<PoolChunk>) -> *mut u8 {
        unsafe { (chunk.as_ptr() as *mut u8).add(self.data_offset) }
    }

    fn slot(&self, chunk: NonNull<PoolChunk>, index: u32) -> *mut u8 {
        unsafe { self.data(chunk).add(index as usize * self.stride) }
    }

    /// Get an uninitialized object slot.
    pub fn alloc(&mut self) -> Result<NonNull<u8>, AllocError> {
        let mut next = self.chunks;
        while let Some(chunk) = next {
            if let Some(ptr) = unsafe { self.alloc_from_chunk(chunk) } {
                self.live += 1;
                return Ok(ptr);
            }
            next = unsafe { chunk.as_ref().next };
        }

        let chunk = self.new_chunk()?;
        let ptr = unsafe { self.alloc_from_chunk(chunk) }.ok_or(AllocError::OutOfMemory {
            size: self.stride,
            align: self.chunk_align,
        })?;
        self.live += 1;
        Ok(ptr)
    }

    unsafe fn alloc_from_chunk(&self, chunk: NonNull<PoolChunk>) -> Option<NonNull<u8>> {
        let c = &mut *chunk.as_ptr();

        if c.num_initialized < self.objs_per_chunk {
            // Thread one more slot onto the free list
            let slot = self.slot(chunk, c.num_initialized) as *mut u32;
            ptr::write(slot, c.num_initialized + 1);
            c.num_initialized += 1;
        }

        if c.num_free == 0 {
            return None;
        }

        let ret = self.slot(chunk, c.next_free);
        c.num_free -= 1;
        c.next_free = if c.num_free != 0 {
            ptr::read(ret as *const u32)
        } else {
            self.objs_per_chunk
        };

        Some(NonNull::new_unchecked(ret))
    }

    fn new_chunk(&mut self) -> Result<NonNull<PoolChunk>, AllocError> {
        let size = self
            .stride
            .checked_mul(self.objs_per_chunk as usize)
            .and_then(|s| s.checked_add(self.data_offset))
            .ok_or(AllocError::OutOfMemory {
                size: usize::MAX,
                align: self.chunk_align,
            })?;

        let mem = self.backing.alloc(size, self.chunk_align);
        let chunk = NonNull::new(mem as *mut PoolChunk).ok_or(AllocError::OutOfMemory {
            size,
            align: self.chunk_align,
        })?;

        unsafe {
            ptr::write(
                chunk.as_ptr(),
                PoolChunk {
                    next: self.chunks,
                    next_free: 0,
                    num_free: self.objs_per_chunk,
                    num_initialized: 0,
                },
            );
        }
        self.chunks = Some(chunk);

        log::debug!(
            "ObjectPool added a chunk of {} objects ({} bytes)",
            self.objs_per_chunk,
            size
        );
        Ok(chunk)
    }

    // Walk the chunk's free list looking for index
    fn is_free(&self, chunk: NonNull<PoolChunk>, index: u32) -> bool {
        let c = unsafe { chunk.as_ref() };
        let mut next = c.next_free;
        for _ in 0..c.num_free {
            if next >= c.num_initialized {
                // The rest of the list is slots not threaded yet
                return false;
            }
            if next == index {
                return true;
            }
            next = unsafe { ptr::read(self.slot(chunk, next) as *const u32) };
        }
        false
    }

    /// Return an object slot to the pool.
    ///
    /// Pointers that don't point at a slot this pool handed out are rejected,
    /// as is freeing into a chunk whose slots are all free already. Other
    /// double frees are only caught by debug builds.
    pub fn free(&mut self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        let addr = ptr.as_ptr() as usize;
        let span = self.stride * self.objs_per_chunk as usize;

        let mut next = self.chunks;
        while let Some(chunk) = next {
            let data = self.data(chunk) as usize;
            if data <= addr && addr < data + span {
                if (addr - data) % self.stride != 0 {
                    return Err(AllocError::ForeignPointer);
                }

                let index = ((addr - data) / self.stride) as u32;
                let (num_initialized, num_free) = {
                    let c = unsafe { chunk.as_ref() };
                    (c.num_initialized, c.num_free)
                };
                // Slots past num_initialized were never handed out
                if index >= num_initialized {
                    return Err(AllocError::ForeignPointer);
                }
                if num_free >= self.objs_per_chunk {
                    return Err(AllocError::DoubleFree {
                        first: index,
                        count: 1,
                    });
                }
                debug_assert!(!self.is_free(chunk, index), "Object freed twice");

                unsafe {
                    let c = &mut *chunk.as_ptr();
                    ptr::write(ptr.as_ptr() as *mut u32, c.next_free);
                    c.next_free = index;
                    c.num_free += 1;
                }
                self.live -= 1;
                return Ok(());
            }

            next = unsafe { chunk.as_ref().next };
        }

        Err(AllocError::ForeignPointer)
    }
}

impl<B: Allocator> Drop for ObjectPool<B> {
    fn drop(&mut self) {
        if self.live != 0 {
            log::warn!("ObjectPool dropped with {} live objects", self.live);
        }

        let mut next = self.chunks.take();
        while let Some(chunk) = next {
            unsafe {
                next = chunk.as_ref().next;
                self.backing.free(chunk.as_ptr() as *mut u8, self.chunk_align);
            }
        }
    }
}
