//! Fixed-size-class pool façade: every allocation a [`ScalablePool<T>`]
//! hands out is exactly `size_of::<T>()` bytes (rounded up to `size_of::<u64>()`
//! so a freed slot can always carry one freelist pointer), so there is no
//! bookkeeping hashmap and no large-object path — just a [`HeapPool`] pair.
//!
//! Grounded on `scalable_pool.h`. The original instantiates one C++
//! template per `T`, each with its own function-local (Meyers) singleton
//! `ScalableAllocator`. Rust has no per-type static equivalent, and nothing
//! about the underlying heap actually depends on `T` as a type — `size_class`
//! is a runtime field of [`HeapPoolCreationParams`], not a generic parameter
//! — so here `ScalablePool<T>` is an ordinary instance-owned value: each one
//! gets its own [`ScalableAllocator`] behind an `Arc` and a process-unique
//! `pool_id`, and per-thread local heaps are cached in a `thread_local!` map
//! keyed by that id so more than one pool can coexist on the same thread.

use std::cell::RefCell;
use std::collections::HashMap;
use std::convert::TryFrom;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::allocator::{LocalHeapHandle, ScalableAllocator};
use crate::heap::{HeapPool, HeapPoolCreationParams};
use crate::options::{ArenaOptions, ScalablePoolOptions};
use crate::page::HEADER_SIZE;
use crate::platform;
use crate::queue::{BoundedQueue, MPMCBoundedQueue};
use crate::segment::SegmentKind;
use crate::spinlock::{NoLock, Spinlock};

type CentralHeapPool = HeapPool<MPMCBoundedQueue<u64>, Spinlock>;
type LocalHeapPool = HeapPool<BoundedQueue<u64>, NoLock>;
type PoolAllocator = ScalableAllocator<CentralHeapPool, LocalHeapPool>;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static LOCAL_HEAPS: RefCell<HashMap<u64, LocalHeapHandle<CentralHeapPool, LocalHeapPool>>> =
        RefCell::new(HashMap::new());
}

/// One size class, one arena, its own central heap and per-thread local
/// heaps. Every `T` gets its own instance rather than sharing a process-wide
/// singleton — construct one per size class you need and hold onto it, the
/// same way you would hold onto any other allocator handle.
pub struct ScalablePool<T> {
    id: u64,
    allocator: Arc<PoolAllocator>,
    local_params: HeapPoolCreationParams,
    _element: PhantomData<fn() -> T>,
}

impl<T> ScalablePool<T> {
    pub fn create(options: ScalablePoolOptions) -> Option<Self> {
        let mut local_params = HeapPoolCreationParams::default();
        let mut logical_page_size = local_params.logical_page_size;

        if options.use_huge_pages {
            let huge_page_size = platform::minimum_huge_page_size()?;
            if options.central_pool_initial_size < huge_page_size
                || options.central_pool_initial_size % huge_page_size != 0
            {
                return None;
            }
            if options.local_pool_initial_size < huge_page_size
                || options.local_pool_initial_size % huge_page_size != 0
            {
                return None;
            }
            logical_page_size = huge_page_size;
        }

        let element_size = core::mem::size_of::<T>().max(core::mem::size_of::<u64>());
        let size_class = u32::try_from(element_size).ok()?;
        while (size_class as usize) > logical_page_size - HEADER_SIZE {
            logical_page_size <<= 1;
        }

        let arena_options = ArenaOptions {
            cache_capacity: options.arena_initial_size,
            page_alignment: logical_page_size,
            use_huge_pages: options.use_huge_pages,
            numa_node: options.numa_node,
        };

        local_params.size_class = size_class;
        local_params.initial_size = options.local_pool_initial_size;
        local_params.logical_page_size = logical_page_size;
        local_params.segments_can_grow = options.local_pool_can_grow;
        local_params.page_recycling_threshold = options.page_recycling_threshold;
        local_params.grow_coefficient = options.grow_coefficient;
        local_params.recyclable_deallocation_queue_size = options.recyclable_deallocation_queue_size;
        local_params.non_recyclable_deallocation_queue_size = options.non_recyclable_deallocation_queue_size;
        local_params.deallocation_queues_processing_threshold = options.deallocation_queues_processing_threshold;

        let mut central_params = local_params;
        central_params.initial_size = options.central_pool_initial_size;
        central_params.segments_can_grow = true;

        let allocator = ScalableAllocator::new(arena_options, |arena| {
            let mut central: CentralHeapPool = HeapPool::new(SegmentKind::Central);
            if central.create(&central_params, arena) {
                Some(central)
            } else {
                None
            }
        })?;

        allocator.set_thread_local_heap_cache_count(options.thread_local_cached_heap_count.max(1));

        Some(ScalablePool {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            allocator: Arc::new(allocator),
            local_params,
            _element: PhantomData,
        })
    }

    pub fn allocate(&self) -> *mut u8 {
        let size = core::mem::size_of::<T>().max(core::mem::size_of::<u64>());
        self.with_local_heap(|local| self.allocator.allocate_with(local, size))
    }

    pub fn deallocate(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        self.with_local_heap(|local| {
            self.allocator.deallocate_with(local, ptr, true);
        });
    }

    fn with_local_heap<R>(&self, f: impl FnOnce(Option<&LocalHeapPool>) -> R) -> R {
        LOCAL_HEAPS.with(|map| {
            let mut map = map.borrow_mut();
            if !map.contains_key(&self.id) {
                // Bounded metadata buffer: once this pool's pre-created cache
                // count is exhausted this thread gets no local heap and falls
                // through to the central heap for every allocate/deallocate.
                if self.allocator.try_reserve_local_heap_slot() {
                    let mut heap: LocalHeapPool = HeapPool::new(SegmentKind::Local);
                    if heap.create(&self.local_params, self.allocator.arena()) {
                        map.insert(self.id, LocalHeapHandle::new(heap, Arc::clone(&self.allocator)));
                    } else {
                        self.allocator.release_local_heap_slot();
                    }
                }
            }
            f(map.get(&self.id).map(|handle| &handle.heap))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(align(8))]
    struct Fixed {
        _bytes: [u8; 24],
    }

    #[test]
    fn create_allocate_and_deallocate_round_trip() {
        let pool: ScalablePool<Fixed> = ScalablePool::create(ScalablePoolOptions {
            arena_initial_size: 8 * 1024 * 1024,
            central_pool_initial_size: 1024 * 1024,
            local_pool_initial_size: 1024 * 1024,
            ..ScalablePoolOptions::default()
        })
        .expect("pool creation should succeed");

        let a = pool.allocate();
        let b = pool.allocate();
        assert!(!a.is_null());
        assert!(!b.is_null());
        assert_ne!(a, b);

        pool.deallocate(a);
        pool.deallocate(b);

        let c = pool.allocate();
        assert!(!c.is_null());
        pool.deallocate(c);
    }

    #[test]
    fn two_pools_of_different_element_sizes_coexist_on_one_thread() {
        let small: ScalablePool<u64> = ScalablePool::create(ScalablePoolOptions {
            arena_initial_size: 4 * 1024 * 1024,
            central_pool_initial_size: 1024 * 1024,
            local_pool_initial_size: 1024 * 1024,
            ..ScalablePoolOptions::default()
        })
        .unwrap();
        let big: ScalablePool<Fixed> = ScalablePool::create(ScalablePoolOptions {
            arena_initial_size: 4 * 1024 * 1024,
            central_pool_initial_size: 1024 * 1024,
            local_pool_initial_size: 1024 * 1024,
            ..ScalablePoolOptions::default()
        })
        .unwrap();

        let p1 = small.allocate();
        let p2 = big.allocate();
        assert!(!p1.is_null());
        assert!(!p2.is_null());
        small.deallocate(p1);
        big.deallocate(p2);
    }
}
