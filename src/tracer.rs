use alloc::collections::BTreeMap;

use crate::allocators::Allocator;

/// Running totals kept by a [`TracingAllocator`](struct.TracingAllocator.html).
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct TraceStats {
    pub live_allocations: usize,
    pub live_bytes: usize,
    pub peak_bytes: usize,
    pub total_allocations: usize,
    pub total_reallocs: usize,
    pub total_frees: usize,
}

/// Wraps an allocator and records every block passing through it.
///
/// Live blocks are kept in a map from address to size, so leaks can be
/// reported when the tracer is dropped. Every call is logged at `trace`
/// level under the tracer's name.
pub struct TracingAllocator<A: Allocator> {
    name: &'static str,
    inner: A,
    live: BTreeMap<usize, usize>,
    stats: TraceStats,
}

impl<A: Allocator> TracingAllocator<A> {
    pub fn new(name: &'static str, inner: A) -> Self {
        TracingAllocator {
            name,
            inner,
            live: BTreeMap::new(),
            stats: TraceStats::default(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn stats(&self) -> TraceStats {
        self.stats
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }

    /// Size of the live block at `ptr`, if this tracer handed it out.
    pub fn size_of(&self, ptr: *const u8) -> Option<usize> {
        self.live.get(&(ptr as usize)).copied()
    }

    fn on_alloc(&mut self, ptr: *mut u8, size: usize) {
        self.live.insert(ptr as usize, size);
        self.stats.live_allocations += 1;
        self.stats.live_bytes += size;
        self.stats.peak_bytes = self.stats.peak_bytes.max(self.stats.live_bytes);
    }

    fn on_free(&mut self, ptr: *mut u8) {
        match self.live.remove(&(ptr as usize)) {
            Some(size) => {
                self.stats.live_allocations -= 1;
                self.stats.live_bytes -= size;
            }
            None => log::warn!("[{}] freeing untracked pointer {:p}", self.name, ptr),
        }
    }
}

impl<A: Allocator> Allocator for TracingAllocator<A> {
    unsafe fn realloc(&mut self, ptr: *mut u8, size: usize, align: usize) -> *mut u8 {
        let new_ptr = self.inner.realloc(ptr, size, align);
        log::trace!(
            "[{}] realloc({:p}, {}, {}) -> {:p}",
            self.name,
            ptr,
            size,
            align,
            new_ptr
        );

        if ptr.is_null() {
            if !new_ptr.is_null() {
                self.stats.total_allocations += 1;
                self.on_alloc(new_ptr, size);
            }
        } else if size == 0 {
            self.stats.total_frees += 1;
            self.on_free(ptr);
        } else if !new_ptr.is_null() {
            self.stats.total_reallocs += 1;
            self.on_free(ptr);
            self.on_alloc(new_ptr, size);
        }

        new_ptr
    }
}

impl<A: Allocator> Drop for TracingAllocator<A> {
    fn drop(&mut self) {
        if self.live.is_empty() {
            return;
        }

        log::warn!(
            "[{}] {} allocations ({} bytes) leaked",
            self.name,
            self.stats.live_allocations,
            self.stats.live_bytes
        );
        for (addr, size) in &self.live {
            log::debug!("[{}]   {:#x}: {} bytes", self.name, addr, size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::allocators::{DefaultAllocator, SystemAllocator, ToyHeap};

    use test_log::test;

    #[test]
    fn test_counts() {
        let mut tracer = TracingAllocator::new("test", DefaultAllocator::default());

        let a = tracer.alloc(100, 0);
        let b = tracer.alloc(50, 0);
        assert_eq!(tracer.size_of(a), Some(100));
        assert_eq!(tracer.stats().live_bytes, 150);

        unsafe {
            let a = tracer.realloc(a, 300, 0);
            assert_eq!(tracer.stats().live_bytes, 350);
            assert_eq!(tracer.stats().peak_bytes, 350);
            tracer.free(a, 0);
            tracer.free(b, 0);
        }

        assert_eq!(
            tracer.stats(),
            TraceStats {
                live_allocations: 0,
                live_bytes: 0,
                peak_bytes: 350,
                total_allocations: 2,
                total_reallocs: 1,
                total_frees: 2,
            }
        );
        assert_eq!(tracer.inner().live_blocks(), 0);
        assert_eq!(tracer.name(), "test");
    }

    #[test]
    fn test_failed_allocations_are_not_counted() {
        let mut tracer = TracingAllocator::new("toy", SystemAllocator::new(ToyHeap::new(64)));
        assert!(tracer.alloc(1024, 0).is_null());
        assert_eq!(tracer.stats(), TraceStats::default());
    }
}
