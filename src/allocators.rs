//! The allocator capability, and the backing heaps that implement it.
//!
//! ## Basic Types
//!
//! ### [`Allocator`](trait.Allocator.html)
//!
//! `Allocator` is the single capability every component in this crate is
//! built on: one `realloc(ptr, size, align)` call that allocates (null
//! `ptr`), frees (`size == 0`) or moves a block. Components never reach for a
//! global allocator; they are handed one.
//!
//! ### [`SystemAllocator`](struct.SystemAllocator.html)
//!
//! A `SystemAllocator` turns a [`HeapSource`](trait.HeapSource.html) into an
//! `Allocator` by keeping a small header in front of every block, so that
//! realloc and free don't need the caller to remember the old size.
//!
//! ### [`HeapSource`](trait.HeapSource.html)
//!
//! `HeapSource` is a simple trait interface meant to abstract over where raw
//! memory comes from: the Rust global allocator, libc, or a toy buffer.
//!
//! ### [`ToyHeap`](struct.ToyHeap.html)
//!
//! `ToyHeap` is a fixed buffer that can pretend to be a heap, and implements
//! `HeapSource` for such a purpose. It is mainly useful for testing, since
//! it runs out of memory exactly when you tell it to.
//!
//! ### [`SpinLocked`](struct.SpinLocked.html)
//!
//! The allocators in this crate are not synchronized. `SpinLocked` wraps one
//! in a spin lock so it can be shared between threads.

use alloc::boxed::Box;
use alloc::vec;
use core::alloc::Layout;
use core::fmt;
use core::ptr::{self, null_mut, NonNull};

#[cfg(feature = "use_libc")]
use errno::Errno;
use spin::{Mutex, MutexGuard};
use static_assertions::const_assert;

/// Alignment used when a caller passes `0`, and the minimum alignment any
/// allocator in this crate hands out.
pub const MIN_ALIGN: usize = 8;

// Round up value to the nearest multiple of increment
pub(crate) fn round_up(value: usize, increment: usize) -> usize {
    if value == 0 {
        return 0;
    }
    increment * ((value - 1) / increment + 1)
}

// Like round_up, but None if the result doesn't fit in a usize
pub(crate) fn checked_round_up(value: usize, increment: usize) -> Option<usize> {
    if value == 0 {
        return Some(0);
    }
    ((value - 1) / increment + 1).checked_mul(increment)
}

// Round an address up to a power-of-two alignment, or None on overflow
pub(crate) fn align_up(addr: usize, align: usize) -> Option<usize> {
    Some(addr.checked_add(align - 1)? & !(align - 1))
}

pub(crate) fn normalize_align(align: usize) -> usize {
    debug_assert!(
        align == 0 || align.is_power_of_two(),
        "Alignment {} is not a power of two",
        align
    );
    align.max(MIN_ALIGN)
}

/// The memory capability every component in this crate consumes.
///
/// The whole interface is one call, mirroring C's `realloc`:
///
/// - `realloc(null, size, align)` allocates `size` bytes.
/// - `realloc(ptr, 0, align)` frees `ptr`; the return value is null.
/// - `realloc(ptr, size, align)` moves `ptr` to a block of `size` bytes,
///   preserving the first `min(old, size)` bytes.
///
/// Null is returned when allocating fails. An `align` of `0` means
/// [`MIN_ALIGN`](constant.MIN_ALIGN.html); anything else must be a power of
/// two. Memory is not zeroed.
pub trait Allocator {
    /// # Safety
    ///
    /// `ptr` must be null, or a live pointer returned by this same allocator
    /// with the same `align`. After a successful realloc or free, `ptr` must
    /// not be used again.
    unsafe fn realloc(&mut self, ptr: *mut u8, size: usize, align: usize) -> *mut u8;

    /// Allocate `size` bytes. Returns null on failure, or when `size` is 0.
    fn alloc(&mut self, size: usize, align: usize) -> *mut u8 {
        unsafe { self.realloc(null_mut(), size, align) }
    }

    /// Give `ptr` back. Null is ignored.
    ///
    /// # Safety
    ///
    /// See [`realloc`](#tymethod.realloc).
    unsafe fn free(&mut self, ptr: *mut u8, align: usize) {
        if !ptr.is_null() {
            self.realloc(ptr, 0, align);
        }
    }
}

impl<A: Allocator + ?Sized> Allocator for &mut A {
    unsafe fn realloc(&mut self, ptr: *mut u8, size: usize, align: usize) -> *mut u8 {
        (**self).realloc(ptr, size, align)
    }
}

pub trait HeapSource {
    type Err: fmt::Debug;

    /// Get a fresh block of memory fitting `layout`.
    ///
    /// # Safety
    ///
    /// `layout` must have a non-zero size. The returned memory must be
    /// available and untracked by any other rust code until it is passed to
    /// `release`.
    unsafe fn grab(&mut self, layout: Layout) -> Result<NonNull<u8>, Self::Err>;

    /// Return a block obtained from `grab` with the same `layout`.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `grab` on this source, with this `layout`, and
    /// must not have been released already.
    unsafe fn release(&mut self, ptr: NonNull<u8>, layout: Layout);
}

/// `GlobalHeap` takes its memory from the Rust global allocator.
#[derive(Default, Debug, Copy, Clone)]
pub struct GlobalHeap;

#[derive(Debug)]
pub struct GlobalHeapError;

impl HeapSource for GlobalHeap {
    type Err = GlobalHeapError;

    unsafe fn grab(&mut self, layout: Layout) -> Result<NonNull<u8>, Self::Err> {
        NonNull::new(alloc::alloc::alloc(layout)).ok_or(GlobalHeapError)
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>, layout: Layout) {
        alloc::alloc::dealloc(ptr.as_ptr(), layout)
    }
}

/// `LibcHeap` takes its memory from `posix_memalign`.
#[cfg(feature = "use_libc")]
#[derive(Default, Debug)]
pub struct LibcHeap {
    // Just for tracking, not really needed
    grabs: usize,
}

#[cfg(feature = "use_libc")]
impl LibcHeap {
    /// Number of successful `posix_memalign` calls so far.
    pub fn grabs(&self) -> usize {
        self.grabs
    }
}

#[cfg(feature = "use_libc")]
impl HeapSource for LibcHeap {
    type Err = Errno;

    unsafe fn grab(&mut self, layout: Layout) -> Result<NonNull<u8>, Self::Err> {
        let mut out: *mut libc::c_void = null_mut();
        // posix_memalign wants at least pointer alignment
        let align = layout.align().max(core::mem::size_of::<usize>());
        let rc = libc::posix_memalign(&mut out, align, layout.size());
        if rc != 0 {
            // posix_memalign reports through its return value, not errno
            return Err(Errno(rc));
        }

        self.grabs += 1;
        NonNull::new(out as *mut u8).ok_or_else(errno::errno)
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>, _layout: Layout) {
        libc::free(ptr.as_ptr() as *mut libc::c_void)
    }
}

/// A fixed buffer posing as a heap.
///
/// Blocks are bump-allocated; once every grabbed block has been released, the
/// heap rewinds to empty. Running out of buffer is an error, which makes this
/// handy for testing allocation failure.
pub struct ToyHeap {
    /// Bytes in use, including alignment padding.
    pub size: usize,
    /// Blocks currently grabbed and not yet released.
    pub live: usize,
    heap: Box<[u8]>,
}

impl ToyHeap {
    pub fn new(capacity: usize) -> Self {
        ToyHeap {
            size: 0,
            live: 0,
            heap: vec![0u8; capacity].into_boxed_slice(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.heap.len()
    }
}

impl Default for ToyHeap {
    fn default() -> Self {
        ToyHeap::new(256 * 1024)
    }
}

#[derive(Debug)]
pub struct ToyHeapOverflowError();

impl HeapSource for ToyHeap {
    type Err = ToyHeapOverflowError;

    unsafe fn grab(&mut self, layout: Layout) -> Result<NonNull<u8>, Self::Err> {
        let base = self.heap.as_mut_ptr() as usize;
        let end = align_up(base + self.size, layout.align())
            .map(|start| start - base)
            .and_then(|start| start.checked_add(layout.size()))
            .filter(|&end| end <= self.heap.len())
            .ok_or(ToyHeapOverflowError())?;
        let start = end - layout.size();

        self.size = end;
        self.live += 1;
        Ok(NonNull::new_unchecked(self.heap.as_mut_ptr().add(start)))
    }

    unsafe fn release(&mut self, _ptr: NonNull<u8>, _layout: Layout) {
        self.live -= 1;
        if self.live == 0 {
            self.size = 0;
        }
    }
}

/// The header in front of every `SystemAllocator` block.
///
/// It sits directly before the returned pointer. `align` doubles as the
/// distance from the start of the raw block to the returned pointer.
#[repr(C)]
struct BlockHeader {
    size: usize,
    align: usize,
}

const HEADER_SIZE: usize = 16;
const_assert!(core::mem::size_of::<BlockHeader>() <= HEADER_SIZE);

/// An `Allocator` over any `HeapSource`.
///
/// Every block is over-allocated by its alignment (at least 16 bytes) so a
/// header recording the block's size can live just before it.
pub struct SystemAllocator<S> {
    pub source: S,
    live: usize,
}

/// The allocator to use when you don't care: the Rust global allocator with
/// size headers.
pub type DefaultAllocator = SystemAllocator<GlobalHeap>;

impl<S: HeapSource + Default> Default for SystemAllocator<S> {
    fn default() -> Self {
        SystemAllocator::new(S::default())
    }
}

impl<S> Drop for SystemAllocator<S> {
    fn drop(&mut self) {
        if self.live != 0 {
            log::warn!("SystemAllocator dropped with {} live blocks", self.live);
        }
    }
}

impl<S: HeapSource> SystemAllocator<S> {
    pub fn new(source: S) -> Self {
        SystemAllocator { source, live: 0 }
    }

    /// Number of blocks handed out and not yet freed.
    pub fn live_blocks(&self) -> usize {
        self.live
    }

    #[allow(clippy::cast_ptr_alignment)]
    unsafe fn alloc_block(&mut self, size: usize, align: usize) -> *mut u8 {
        let align = normalize_align(align).max(HEADER_SIZE);
        let layout = match size
            .checked_add(align)
            .and_then(|total| Layout::from_size_align(total, align).ok())
        {
            Some(l) => l,
            None => return null_mut(),
        };

        let raw = match self.source.grab(layout) {
            Ok(raw) => raw,
            Err(e) => {
                log::debug!("Heap source refused {} bytes: {:?}", layout.size(), e);
                return null_mut();
            }
        };

        let ptr = raw.as_ptr().add(align);
        ptr::write(
            ptr.sub(HEADER_SIZE) as *mut BlockHeader,
            BlockHeader { size, align },
        );
        self.live += 1;
        ptr
    }

    #[allow(clippy::cast_ptr_alignment)]
    unsafe fn header(ptr: *mut u8) -> BlockHeader {
        ptr::read(ptr.sub(HEADER_SIZE) as *const BlockHeader)
    }

    unsafe fn free_block(&mut self, ptr: *mut u8) {
        let header = Self::header(ptr);
        let raw = ptr.sub(header.align);
        let layout = Layout::from_size_align_unchecked(header.size + header.align, header.align);
        self.source.release(NonNull::new_unchecked(raw), layout);
        self.live -= 1;
    }
}

impl<S: HeapSource> Allocator for SystemAllocator<S> {
    unsafe fn realloc(&mut self, ptr: *mut u8, size: usize, align: usize) -> *mut u8 {
        if ptr.is_null() {
            if size == 0 {
                return null_mut();
            }
            return self.alloc_block(size, align);
        }

        if size == 0 {
            self.free_block(ptr);
            return null_mut();
        }

        let old_size = Self::header(ptr).size;
        let new_ptr = self.alloc_block(size, align);
        if new_ptr.is_null() {
            // The old block is left untouched, as with C realloc
            return null_mut();
        }
        ptr::copy_nonoverlapping(ptr, new_ptr, old_size.min(size));
        self.free_block(ptr);
        new_ptr
    }
}

/// An allocator behind a spin lock, for sharing one allocator between
/// threads.
///
/// `&SpinLocked<A>` is itself an `Allocator`, so it can be handed to any
/// component by shared reference.
pub struct SpinLocked<A> {
    inner: Mutex<A>,
}

impl<A: Default> Default for SpinLocked<A> {
    fn default() -> Self {
        SpinLocked::new(A::default())
    }
}

impl<A> SpinLocked<A> {
    pub const fn new(allocator: A) -> Self {
        SpinLocked {
            inner: Mutex::new(allocator),
        }
    }

    /// Get exclusive access to the underlying allocator.
    ///
    /// Allocation through this wrapper blocks while the guard is held.
    pub fn lock(&self) -> MutexGuard<'_, A> {
        self.inner.lock()
    }

    pub fn into_inner(self) -> A {
        self.inner.into_inner()
    }
}

impl<A: Allocator> Allocator for &SpinLocked<A> {
    unsafe fn realloc(&mut self, ptr: *mut u8, size: usize, align: usize) -> *mut u8 {
        self.inner.lock().realloc(ptr, size, align)
    }
}
