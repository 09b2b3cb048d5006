use core::alloc::Layout;
use core::ptr::NonNull;
use std::collections::BTreeSet;

use handle_arena::allocators::{DefaultAllocator, SystemAllocator, ToyHeap};
use handle_arena::{AllocError, HandleAlloc32, ObjectPool, TracingAllocator};

use rand::distributions::Distribution;
use rand::seq::SliceRandom;
use rand::{Rng, RngCore, SeedableRng};
use test_log::test;

fn seeded_rng() -> rand::rngs::StdRng {
    let seed: u64 = rand::thread_rng().next_u64();
    log::info!("Using seed {}", seed);
    rand::rngs::StdRng::seed_from_u64(seed)
}

#[test]
fn test_handle_stress() {
    let mut handles = HandleAlloc32::new(DefaultAllocator::default(), 64);

    // Runs currently checked out, as (first, count); (0, 0) means empty
    let mut runs: [(u32, u32); 128] = [(0, 0); 128];
    let mut issued: BTreeSet<u32> = BTreeSet::new();
    let mut last_capacity = 0;

    fn validate<A: handle_arena::Allocator>(
        handles: &HandleAlloc32<A>,
        issued: &BTreeSet<u32>,
        last_capacity: u32,
    ) {
        let (validity, stats) = handles.stats();
        log::info!(
            "Issued: {}; capacity: {}; Validity: {:?}, Stats: {:?}",
            issued.len(),
            handles.capacity(),
            validity,
            stats,
        );
        log::debug!("Slots: {}", handles);
        assert!(validity.is_valid());

        // Free and live handles tile the whole space
        assert_eq!(
            stats.free_handles + issued.len() as u64,
            handles.capacity() as u64
        );
        assert!(handles.capacity() >= last_capacity);

        for slot in handles.slots() {
            assert!(issued.range(slot.first..slot.end()).next().is_none());
        }
    }

    let mut rng = seeded_rng();
    let range = rand::distributions::Uniform::new_inclusive(1u32, 8);

    for _ in 0..1024 * 10 {
        let chosen = runs.choose_mut(&mut rng).unwrap();
        let &mut (first, count) = chosen;
        if count == 0 {
            let n = range.sample(&mut rng) * range.sample(&mut rng);
            log::info!("Allocating {} handles", n);
            let first = handles.alloc_handles(n).unwrap();
            log::info!("  Allocated {}..{}", first, first + n);
            for h in first..first + n {
                assert!(issued.insert(h), "handle {} issued twice", h);
            }
            *chosen = (first, n);
        } else {
            log::info!("Freeing {}..{}", first, first + count);
            handles.free_handles(first, count).unwrap();
            for h in first..first + count {
                assert!(issued.remove(&h));
            }
            *chosen = (0, 0);
        }

        validate(&handles, &issued, last_capacity);
        last_capacity = handles.capacity();
    }

    // Iteration agrees with what we think is live
    let live: Vec<u32> = handles.iter().collect();
    assert_eq!(live, issued.iter().copied().collect::<Vec<_>>());

    for &(first, count) in runs.iter().filter(|r| r.1 != 0) {
        handles.free_handles(first, count).unwrap();
    }
    assert_eq!(handles.num_allocated(), 0);
    assert_eq!(handles.slots().len(), 1);
}

#[test]
fn test_handle_stress_on_toy_heap() {
    // A small heap so that growing the free-range list fails now and then
    let mut handles = HandleAlloc32::new(SystemAllocator::new(ToyHeap::new(4096)), 16);
    let mut live: Vec<(u32, u32)> = Vec::new();
    let mut rng = seeded_rng();

    for _ in 0..1024 * 4 {
        let before: Vec<_> = handles.slots().to_vec();
        let capacity = handles.capacity();

        if live.is_empty() || rng.gen_bool(0.6) {
            let n = rng.gen_range(1, 17);
            match handles.alloc_handles(n) {
                Ok(first) => live.push((first, n)),
                Err(AllocError::OutOfMemory { .. }) => {
                    assert_eq!(handles.slots(), &before[..]);
                    assert_eq!(handles.capacity(), capacity);
                }
                Err(e) => panic!("unexpected error {}", e),
            }
        } else {
            let idx = rng.gen_range(0, live.len());
            let (first, n) = live[idx];
            match handles.free_handles(first, n) {
                Ok(()) => {
                    live.swap_remove(idx);
                }
                Err(AllocError::OutOfMemory { .. }) => {
                    assert_eq!(handles.slots(), &before[..]);
                }
                Err(e) => panic!("unexpected error {}", e),
            }
        }

        assert!(handles.stats().0.is_valid());
    }
}

#[test]
fn test_pool_stress() {
    let mut tracer = TracingAllocator::new("pool", DefaultAllocator::default());
    {
        let mut pool = ObjectPool::new(&mut tracer, Layout::new::<[u32; 5]>(), 32);
        let mut live: Vec<(*mut [u32; 5], u32)> = Vec::new();
        let mut rng = seeded_rng();

        for i in 0..1024 * 10u32 {
            if live.is_empty() || rng.gen_bool(0.55) {
                let ptr = pool.alloc().unwrap().as_ptr() as *mut [u32; 5];
                unsafe { ptr.write([i; 5]) };
                live.push((ptr, i));
            } else {
                let idx = rng.gen_range(0, live.len());
                let (ptr, tag) = live.swap_remove(idx);
                // Nobody else scribbled over it
                assert_eq!(unsafe { ptr.read() }, [tag; 5]);
                pool.free(NonNull::new(ptr as *mut u8).unwrap()).unwrap();
            }
            assert_eq!(pool.len(), live.len());
        }

        for (ptr, tag) in live.drain(..) {
            assert_eq!(unsafe { ptr.read() }, [tag; 5]);
            pool.free(NonNull::new(ptr as *mut u8).unwrap()).unwrap();
        }
        assert!(pool.is_empty());
    }

    let stats = tracer.stats();
    log::info!("Pool backing stats: {:?}", stats);
    assert_eq!(stats.live_allocations, 0);
    assert_eq!(stats.total_allocations, stats.total_frees);
}
