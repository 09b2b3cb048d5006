//! A LIFO stack allocator over a caller-provided buffer.
//!
//! Every allocation is preceded by a small header recording a running
//! allocation ID and how far the returned pointer sits from the previous top
//! of the stack:
//!
//! ```text
//!   previous top
//!   |
//!   v            offset
//!   +---------+--------+---------------+---------
//!   | padding | header | allocation    | free ...
//!   +---------+--------+---------------+---------
//!                      ^               ^
//!                      ptr             new top
//! ```
//!
//! Only the most recent allocation may be freed; the header's ID is checked
//! against the allocator's counter to enforce it.

use core::mem;
use core::ptr::{self, null_mut, NonNull};

use static_assertions::const_assert_eq;

use crate::allocators::{align_up, normalize_align, Allocator};
use crate::error::AllocError;

#[repr(C)]
struct AllocHeader {
    id: u32,
    offset: u32,
}

const HEADER_SIZE: usize = 8;
const_assert_eq!(mem::size_of::<AllocHeader>(), HEADER_SIZE);

pub struct StackAllocator<'buf> {
    buffer: &'buf mut [u8],
    top: usize,
    last_allocation_id: u32,
}

impl<'buf> StackAllocator<'buf> {
    pub fn new(buffer: &'buf mut [u8]) -> Self {
        StackAllocator {
            buffer,
            top: 0,
            last_allocation_id: 0,
        }
    }

    /// Bytes of the buffer in use, headers and padding included.
    pub fn used(&self) -> usize {
        self.top
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// ID of the most recent live allocation; 0 when the stack is empty.
    pub fn last_allocation_id(&self) -> u32 {
        self.last_allocation_id
    }

    /// Push an allocation of `size` bytes aligned to `align` (`0` for the
    /// default) onto the stack.
    pub fn allocate(&mut self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
        let align = normalize_align(align);
        let base = self.buffer.as_mut_ptr() as usize;
        let watermark = base + self.top;

        let oom = AllocError::OutOfMemory { size, align };

        let start = align_up(watermark + HEADER_SIZE, align).ok_or(oom)?;
        let offset = start - watermark;
        let end = (start - base)
            .checked_add(size)
            .filter(|&end| end <= self.buffer.len() && offset <= u32::MAX as usize)
            .ok_or(oom)?;

        self.last_allocation_id += 1;
        unsafe {
            let ptr = self.buffer.as_mut_ptr().add(start - base);
            // start is at least 8-aligned, so the header is aligned too
            #[allow(clippy::cast_ptr_alignment)]
            let header = ptr.sub(HEADER_SIZE) as *mut AllocHeader;
            ptr::write(
                header,
                AllocHeader {
                    id: self.last_allocation_id,
                    offset: offset as u32,
                },
            );

            self.top = end;
            Ok(NonNull::new_unchecked(ptr))
        }
    }

    /// Pop the allocation at `ptr`, which must be the most recent one.
    ///
    /// Out-of-order frees are rejected and leave the stack untouched.
    pub fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        let base = self.buffer.as_mut_ptr() as usize;
        let addr = ptr.as_ptr() as usize;
        if addr < base + HEADER_SIZE || addr > base + self.top {
            return Err(AllocError::ForeignPointer);
        }

        #[allow(clippy::cast_ptr_alignment)]
        let header = unsafe { ptr::read(ptr.as_ptr().sub(HEADER_SIZE) as *const AllocHeader) };
        if header.id != self.last_allocation_id {
            return Err(AllocError::OutOfOrderFree {
                expected: self.last_allocation_id,
                found: header.id,
            });
        }

        self.top = addr - base - header.offset as usize;
        self.last_allocation_id -= 1;
        Ok(())
    }
}

impl<'buf> Allocator for StackAllocator<'buf> {
    unsafe fn realloc(&mut self, ptr: *mut u8, size: usize, align: usize) -> *mut u8 {
        let ptr = match NonNull::new(ptr) {
            None if size == 0 => return null_mut(),
            None => return self.allocate(size, align).map_or(null_mut(), NonNull::as_ptr),
            Some(p) => p,
        };

        if size != 0 {
            // TODO: resizing the most recent allocation in place is possible
            debug_assert!(false, "StackAllocator doesn't support reallocations");
            return null_mut();
        }

        if let Err(e) = self.deallocate(ptr) {
            debug_assert!(false, "StackAllocator free failed: {}", e);
        }
        null_mut()
    }
}
