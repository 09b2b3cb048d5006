use core::mem;
use core::ptr::{self, NonNull};
use core::slice;

use crate::allocators::Allocator;
use crate::error::AllocError;

// Smallest non-zero capacity, in elements
const MIN_CAPACITY: usize = 4;

/// A growable contiguous array whose storage comes from an injected
/// `Allocator` instead of the global one.
///
/// Only `Copy` element types are supported, so nothing ever needs dropping.
pub(crate) struct RawArray<T: Copy, A: Allocator> {
    ptr: NonNull<T>,
    len: usize,
    cap: usize,
    allocator: A,
}

// RawArray owns its storage outright, just like a Vec.
unsafe impl<T: Copy + Send, A: Allocator + Send> Send for RawArray<T, A> {}

impl<T: Copy, A: Allocator> RawArray<T, A> {
    pub fn new(allocator: A) -> Self {
        RawArray {
            ptr: NonNull::dangling(),
            len: 0,
            cap: 0,
            allocator,
        }
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn as_slice(&self) -> &[T] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Make room for at least `additional` more elements.
    ///
    /// On failure the array is left exactly as it was.
    pub fn reserve(&mut self, additional: usize) -> Result<(), AllocError> {
        let needed = self.len.checked_add(additional).ok_or(AllocError::OutOfMemory {
            size: usize::MAX,
            align: mem::align_of::<T>(),
        })?;
        if needed <= self.cap {
            return Ok(());
        }

        let new_cap = needed.max(self.cap * 2).max(MIN_CAPACITY);
        let align = mem::align_of::<T>();
        let size = new_cap
            .checked_mul(mem::size_of::<T>())
            .ok_or(AllocError::OutOfMemory {
                size: usize::MAX,
                align,
            })?;

        let old = if self.cap == 0 {
            ptr::null_mut()
        } else {
            self.ptr.as_ptr() as *mut u8
        };

        let new = unsafe { self.allocator.realloc(old, size, align) };
        let new = NonNull::new(new as *mut T).ok_or(AllocError::OutOfMemory { size, align })?;
        log::trace!(
            "RawArray grew from {} to {} elements ({} bytes)",
            self.cap,
            new_cap,
            size
        );

        self.ptr = new;
        self.cap = new_cap;
        Ok(())
    }

    pub fn push(&mut self, value: T) -> Result<(), AllocError> {
        let len = self.len;
        self.insert(len, value)
    }

    /// Insert `value` at `index`, shifting everything after it up by one.
    pub fn insert(&mut self, index: usize, value: T) -> Result<(), AllocError> {
        assert!(
            index <= self.len,
            "insert index {} out of bounds for length {}",
            index,
            self.len
        );
        self.reserve(1)?;

        unsafe {
            let at = self.ptr.as_ptr().add(index);
            ptr::copy(at, at.add(1), self.len - index);
            ptr::write(at, value);
        }
        self.len += 1;
        Ok(())
    }

    /// Remove the element at `index`, shifting everything after it down by one.
    pub fn remove(&mut self, index: usize) -> T {
        assert!(
            index < self.len,
            "remove index {} out of bounds for length {}",
            index,
            self.len
        );

        unsafe {
            let at = self.ptr.as_ptr().add(index);
            let value = ptr::read(at);
            ptr::copy(at.add(1), at, self.len - index - 1);
            self.len -= 1;
            value
        }
    }

    /// Grow to `new_len` elements by appending copies of `fill`, or shrink by
    /// truncating.
    pub fn resize(&mut self, new_len: usize, fill: T) -> Result<(), AllocError> {
        if new_len <= self.len {
            self.len = new_len;
            return Ok(());
        }

        self.reserve(new_len - self.len)?;
        for i in self.len..new_len {
            unsafe { ptr::write(self.ptr.as_ptr().add(i), fill) };
        }
        self.len = new_len;
        Ok(())
    }
}

impl<T: Copy, A: Allocator> Drop for RawArray<T, A> {
    fn drop(&mut self) {
        if self.cap != 0 {
            unsafe {
                self.allocator
                    .free(self.ptr.as_ptr() as *mut u8, mem::align_of::<T>())
            };
        }
    }
}
