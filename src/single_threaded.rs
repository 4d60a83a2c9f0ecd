//! Single-threaded façade for STL-style container allocators: one
//! [`HeapPow2`] with no concurrency guard at all (not even a spinlock),
//! since the contract is "never touched from more than one thread."
//!
//! Grounded on `single_threaded_allocator.h`. Unlike [`crate::malloc::ScalableMalloc`]
//! there's no local/central split — a single-threaded caller never needs one
//! heap to absorb traffic from another thread's freed pointers, so this
//! wraps [`Arena`] and [`HeapPow2`] directly rather than going through
//! [`crate::allocator::ScalableAllocator`]. The original exposes this as a
//! process-wide singleton (`get_instance()`); since Rust already refuses to
//! make this `Sync`, there is no reason to force it into a single static
//! instance too — callers own it like any other value and are free to build
//! as many as they want, one per thread that needs it.

use crate::arena::Arena;
use crate::dictionary::Dictionary;
use crate::heap::{HeapPow2, HeapPow2CreationParams, BIN_COUNT};
use crate::options::{ArenaOptions, SingleThreadedAllocatorOptions};
use crate::platform;
use crate::queue::BoundedQueue;
use crate::segment::SegmentKind;
use crate::spinlock::NoLock;
use crate::util::DEFAULT_ALLOCATION_ALIGNMENT;

type Heap = HeapPow2<BoundedQueue<u64>, NoLock>;

/// Alignment every pointer this allocator hands out satisfies. The original
/// only guarantees this much (rather than `ScalableMalloc`'s arbitrary
/// `allocate_aligned`) to keep the single-threaded path simple.
pub const MAX_SUPPORTED_ALIGNMENT: usize = 16;

/// Not `Send`/`Sync`: every field — the heap's intrusive freelists, the
/// hashmap's chains — is mutated without synchronization under the
/// assumption that only the thread that owns this value ever touches it.
pub struct SingleThreadedAllocator {
    arena: Arena,
    heap: Heap,
    non_small_objects: Dictionary<usize>,
    max_allocation_size: usize,
    max_small_object_size: usize,
}

impl SingleThreadedAllocator {
    pub fn create(options: SingleThreadedAllocatorOptions) -> Option<Self> {
        let mut heap_params = HeapPow2CreationParams {
            segments_can_grow: true,
            page_recycling_threshold_per_size_class: options.page_recycling_threshold,
            segment_grow_coefficient: options.grow_coefficient,
            deallocation_queues_processing_threshold: options.deallocation_queue_processing_threshold,
            ..HeapPow2CreationParams::default()
        };
        for i in 0..BIN_COUNT {
            heap_params.logical_page_counts[i] = options.logical_page_counts_per_size_class[i];
            heap_params.recyclable_deallocation_queue_sizes[i] = options.deallocation_queue_sizes[i];
            heap_params.non_recyclable_deallocation_queue_sizes[i] = 0;
        }

        let mut arena_options = ArenaOptions {
            cache_capacity: options.arena_initial_size,
            use_huge_pages: options.use_huge_pages,
            numa_node: options.numa_node,
            ..ArenaOptions::default()
        };

        if options.use_huge_pages {
            let target_size = platform::minimum_huge_page_size()?;
            heap_params.small_object_logical_page_size = target_size;
            heap_params.medium_object_logical_page_size = target_size;
            arena_options.page_alignment = target_size;
        }

        let mut non_small_objects = Dictionary::new();
        let node_size = core::mem::size_of::<u64>() + core::mem::size_of::<usize>() + core::mem::size_of::<usize>();
        if !non_small_objects.initialise((options.non_small_objects_hash_map_size / node_size).max(1)) {
            return None;
        }

        let mut arena = Arena::new();
        if !arena.create(arena_options) {
            return None;
        }

        let mut heap: Heap = HeapPow2::new(SegmentKind::Local);
        if !heap.create(&heap_params, &arena) {
            return None;
        }

        Some(SingleThreadedAllocator {
            arena,
            heap,
            non_small_objects,
            max_allocation_size: crate::heap::LARGEST_SIZE_CLASS,
            max_small_object_size: crate::heap::LARGEST_SMALL_OBJECT_SIZE_CLASS,
        })
    }

    pub fn allocate(&mut self, size: usize) -> *mut u8 {
        if size > self.max_allocation_size {
            return self.allocate_large_object(size);
        }

        let ptr = self.heap.allocate(size);
        if !ptr.is_null() && size > self.max_small_object_size {
            self.register_medium_object(ptr, size);
        }
        debug_assert_eq!((ptr as usize) % DEFAULT_ALLOCATION_ALIGNMENT, 0);
        ptr
    }

    fn allocate_large_object(&mut self, size: usize) -> *mut u8 {
        let ptr = platform::reserve(size, false, -1);
        if !ptr.is_null() {
            self.non_small_objects.insert(ptr as u64, size);
        }
        ptr
    }

    fn register_medium_object(&mut self, ptr: *mut u8, size: usize) {
        self.non_small_objects.insert(ptr as u64, size);
    }

    pub fn deallocate(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }

        if let Some(size) = self.non_small_objects.get(ptr as u64) {
            self.deallocate_medium_or_large_object(ptr, size);
            return;
        }

        self.heap.deallocate(ptr, true);
    }

    fn deallocate_medium_or_large_object(&mut self, ptr: *mut u8, size: usize) {
        if size < self.max_allocation_size {
            self.heap.deallocate(ptr, false);
        } else {
            platform::free(ptr, size);
        }
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }
}

/// `std::allocator`-compatible wrapper for STL-style containers, grounded
/// on the original's `STLAllocator<T>`. Stops short of implementing the
/// unstable `core::alloc::Allocator` trait — that API is nightly-only — so
/// this is a plain typed wrapper callers plug in manually rather than a
/// drop-in `Vec`/`Box` allocator parameter.
pub struct StlAllocator<'a, T> {
    allocator: &'a mut SingleThreadedAllocator,
    _element: core::marker::PhantomData<T>,
}

impl<'a, T> StlAllocator<'a, T> {
    pub fn new(allocator: &'a mut SingleThreadedAllocator) -> Self {
        StlAllocator { allocator, _element: core::marker::PhantomData }
    }

    pub fn allocate(&mut self, count: usize) -> *mut T {
        self.allocator.allocate(count * core::mem::size_of::<T>()) as *mut T
    }

    pub fn deallocate(&mut self, ptr: *mut T, _count: usize) {
        self.allocator.deallocate(ptr as *mut u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_options() -> SingleThreadedAllocatorOptions {
        SingleThreadedAllocatorOptions {
            arena_initial_size: 8 * 1024 * 1024,
            non_small_objects_hash_map_size: 4096,
            ..SingleThreadedAllocatorOptions::default()
        }
    }

    #[test]
    fn create_allocate_and_deallocate_round_trip() {
        let mut allocator = SingleThreadedAllocator::create(small_options()).expect("create should succeed");

        let small = allocator.allocate(64);
        assert!(!small.is_null());
        assert_eq!((small as usize) % MAX_SUPPORTED_ALIGNMENT, 0);
        allocator.deallocate(small);

        let large_size = crate::heap::LARGEST_SIZE_CLASS + 4096;
        let large = allocator.allocate(large_size);
        assert!(!large.is_null());
        allocator.deallocate(large);
    }

    #[test]
    fn stl_allocator_allocates_typed_elements() {
        let mut allocator = SingleThreadedAllocator::create(small_options()).expect("create should succeed");
        let mut stl: StlAllocator<u64> = StlAllocator::new(&mut allocator);

        let ptr = stl.allocate(16);
        assert!(!ptr.is_null());
        assert_eq!((ptr as usize) % core::mem::align_of::<u64>(), 0);
        stl.deallocate(ptr, 16);
    }
}
