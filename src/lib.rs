#![cfg_attr(not(test), no_std)]

//! Handle allocation and simple special-purpose allocators.
//!
//! The centrepiece is [`HandleAlloc32`](handles/struct.HandleAlloc32.html),
//! which hands out runs of consecutive `u32` handles from a sorted list of
//! free ranges, coalescing ranges again as handles are returned. Around it
//! sit a bump [`LinearAllocator`](linear/struct.LinearAllocator.html), a
//! LIFO [`StackAllocator`](stack/struct.StackAllocator.html) and an
//! [`ObjectPool`](pool/struct.ObjectPool.html).
//!
//! Nothing here touches a global allocator directly: every component is
//! handed an [`Allocator`](allocators/trait.Allocator.html) and takes all of
//! its memory from it. [`DefaultAllocator`](allocators/type.DefaultAllocator.html)
//! is the usual choice; [`TracingAllocator`](tracer/struct.TracingAllocator.html)
//! can be slotted in anywhere to see what a component is doing.
//!
//! Logging goes through the `log` facade; install any logger to see it.

extern crate alloc;

pub mod allocators;
pub mod bitset;
pub mod error;
pub mod handles;
pub mod linear;
pub mod pool;
mod raw_array;
pub mod slots;
pub mod stack;
pub mod tracer;

pub use allocators::{
    Allocator, DefaultAllocator, GlobalHeap, HeapSource, SpinLocked, SystemAllocator, ToyHeap,
    MIN_ALIGN,
};
pub use bitset::BitSet;
pub use error::AllocError;
pub use handles::{HandleAlloc32, HandleIter, DEFAULT_CAPACITY_DELTA};
pub use linear::LinearAllocator;
pub use pool::ObjectPool;
pub use slots::{FreeSlot, Stats, Validity};
pub use stack::StackAllocator;
pub use tracer::{TraceStats, TracingAllocator};

#[cfg(feature = "use_libc")]
pub use allocators::LibcHeap;
