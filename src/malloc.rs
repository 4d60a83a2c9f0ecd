//! General-purpose façade: power-of-two binned small/medium objects go
//! through a [`ScalableAllocator`]; anything bigger, or anything `allocate_aligned`
//! hands out, is tracked in a side hashmap keyed by pointer so `deallocate`
//! and `get_usable_size` know how to route it without consulting a page
//! header.
//!
//! Grounded on `scalable_malloc.h`'s non-`USE_ALLOC_HEADERS` build: the
//! bookkeeping hashmap approach rather than a per-allocation header, since
//! the header variant pays an 8 or 16-byte tax on every single allocation
//! (small objects included) to save one hashmap lookup on the rare
//! large/aligned path.

use std::cell::RefCell;
use std::sync::{Arc, OnceLock};

use crate::allocator::{LocalHeapHandle, ScalableAllocator};
use crate::dictionary::MPMCDictionary;
use crate::heap::{HeapPow2, HeapPow2CreationParams};
use crate::options::{ArenaOptions, ScalableMallocOptions};
use crate::platform;
use crate::queue::{BoundedQueue, MPMCBoundedQueue};
use crate::segment::{Segment, SegmentKind};
use crate::spinlock::{NoLock, Spinlock};
use crate::util::DEFAULT_ALLOCATION_ALIGNMENT;

type CentralHeap = HeapPow2<MPMCBoundedQueue<u64>, Spinlock>;
type LocalHeap = HeapPow2<BoundedQueue<u64>, NoLock>;
type Allocator = ScalableAllocator<CentralHeap, LocalHeap>;

#[derive(Clone, Copy, Default)]
struct AllocationMetadata {
    size: usize,
    padding_bytes: usize,
}

static ALLOCATOR: OnceLock<Arc<Allocator>> = OnceLock::new();
static MAX_ALLOCATION_SIZE: OnceLock<usize> = OnceLock::new();
static MAX_SMALL_OBJECT_SIZE: OnceLock<usize> = OnceLock::new();
static SMALL_OBJECT_LOGICAL_PAGE_SIZE: OnceLock<usize> = OnceLock::new();
static NON_SMALL_AND_ALIGNED_OBJECTS: OnceLock<MPMCDictionary<AllocationMetadata>> = OnceLock::new();
static LOCAL_HEAP_PARAMS: OnceLock<HeapPow2CreationParams> = OnceLock::new();

struct NewHandlerCell(core::cell::UnsafeCell<Option<fn()>>);
// Only ever read or written while `NEW_HANDLER_LOCK` is held.
unsafe impl Sync for NewHandlerCell {}

static NEW_HANDLER_LOCK: Spinlock = Spinlock::new();
static NEW_HANDLER: NewHandlerCell = NewHandlerCell(core::cell::UnsafeCell::new(None));

thread_local! {
    static LOCAL_HEAP: RefCell<Option<LocalHeapHandle<CentralHeap, LocalHeap>>> = RefCell::new(None);
}

/// Global allocator facade mirroring `ScalableMalloc` — a thin set of free
/// functions over process-wide statics rather than an instance type, since
/// there is exactly one of these per process (matching the reference
/// implementation's Meyers singleton).
pub struct ScalableMalloc;

impl ScalableMalloc {
    /// Creates the allocator with default options on first use and is a
    /// no-op afterwards. Lets [`ScalableGlobalAlloc`] work as a
    /// `#[global_allocator]` without every binary having to call [`ScalableMalloc::create`]
    /// by hand first; explicit callers who need non-default options should
    /// still call `create` themselves before the first allocation.
    pub fn ensure_created() -> bool {
        if ALLOCATOR.get().is_some() {
            return true;
        }
        Self::create(ScalableMallocOptions::default()) || ALLOCATOR.get().is_some()
    }

    /// Must be called exactly once, before any `allocate`/`deallocate`
    /// call, typically at process start-up.
    pub fn create(options: ScalableMallocOptions) -> bool {
        let mut local_params = HeapPow2CreationParams {
            logical_page_counts: options.local_logical_page_counts_per_size_class,
            page_recycling_threshold_per_size_class: options.page_recycling_threshold,
            segments_can_grow: options.local_heaps_can_grow,
            segment_grow_coefficient: options.grow_coefficient,
            deallocation_queues_processing_threshold: options.deallocation_queues_processing_threshold,
            recyclable_deallocation_queue_sizes: options.recyclable_deallocation_queue_sizes,
            non_recyclable_deallocation_queue_sizes: options.non_recyclable_deallocation_queue_sizes,
            ..HeapPow2CreationParams::default()
        };
        let mut central_params = HeapPow2CreationParams {
            logical_page_counts: options.central_logical_page_counts_per_size_class,
            page_recycling_threshold_per_size_class: options.page_recycling_threshold,
            segments_can_grow: true,
            segment_grow_coefficient: options.grow_coefficient,
            deallocation_queues_processing_threshold: options.deallocation_queues_processing_threshold,
            recyclable_deallocation_queue_sizes: options.recyclable_deallocation_queue_sizes,
            non_recyclable_deallocation_queue_sizes: options.non_recyclable_deallocation_queue_sizes,
            ..HeapPow2CreationParams::default()
        };

        let mut arena_options = ArenaOptions {
            cache_capacity: options.arena_initial_size,
            use_huge_pages: options.use_huge_pages,
            numa_node: options.numa_node,
            ..ArenaOptions::default()
        };

        if options.use_huge_pages {
            if let Some(target_size) = platform::minimum_huge_page_size() {
                local_params.small_object_logical_page_size = target_size;
                local_params.medium_object_logical_page_size = target_size;
                central_params.small_object_logical_page_size = target_size;
                central_params.medium_object_logical_page_size = target_size;
                arena_options.page_alignment = target_size;
            }
        }

        let small_object_logical_page_size = local_params.small_object_logical_page_size;

        let mut hashmap = MPMCDictionary::new();
        if !hashmap.initialise(options.non_small_and_aligned_objects_map_size.max(1)) {
            return false;
        }

        let allocator = ScalableAllocator::new(arena_options, |arena| {
            let mut central: CentralHeap = HeapPow2::new(SegmentKind::Central);
            if central.create(&central_params, arena) {
                Some(central)
            } else {
                None
            }
        });
        let Some(allocator) = allocator else { return false };
        let allocator = Arc::new(allocator);

        allocator.set_thread_local_heap_cache_count(options.thread_local_cached_heap_count.max(1));

        if ALLOCATOR.set(allocator).is_err() {
            return false;
        }
        let _ = MAX_ALLOCATION_SIZE.set(crate::heap::LARGEST_SIZE_CLASS);
        let _ = MAX_SMALL_OBJECT_SIZE.set(crate::heap::LARGEST_SMALL_OBJECT_SIZE_CLASS);
        let _ = SMALL_OBJECT_LOGICAL_PAGE_SIZE.set(small_object_logical_page_size);
        let _ = NON_SMALL_AND_ALIGNED_OBJECTS.set(hashmap);
        let _ = LOCAL_HEAP_PARAMS.set(local_params);
        true
    }

    pub fn allocate(size: usize) -> *mut u8 {
        let max_allocation_size = *MAX_ALLOCATION_SIZE.get().expect("ScalableMalloc::create not called");
        if size > max_allocation_size {
            return Self::allocate_large_object(size);
        }

        let ptr = with_local_heap(|local| allocator().allocate_with(local, size));

        let max_small_object_size = *MAX_SMALL_OBJECT_SIZE.get().unwrap();
        if !ptr.is_null() && size > max_small_object_size {
            Self::register_unpadded_medium_object(ptr, size);
        }
        ptr
    }

    fn allocate_large_object(size: usize) -> *mut u8 {
        let ptr = platform::reserve(size, false, -1);
        if !ptr.is_null() {
            hashmap().insert(ptr as u64, AllocationMetadata { size, padding_bytes: 0 });
        }
        ptr
    }

    fn register_unpadded_medium_object(ptr: *mut u8, size: usize) {
        hashmap().insert(ptr as u64, AllocationMetadata { size, padding_bytes: 0 });
    }

    pub fn deallocate(ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }

        if let Some(metadata) = hashmap().get(ptr as u64) {
            Self::deallocate_non_small_or_aligned_object(metadata, ptr);
            return;
        }

        with_local_heap(|local| allocator().deallocate_with(local, ptr, true));
    }

    fn deallocate_non_small_or_aligned_object(metadata: AllocationMetadata, ptr: *mut u8) {
        let unpadded = unsafe { ptr.sub(metadata.padding_bytes) };
        let max_small_object_size = *MAX_SMALL_OBJECT_SIZE.get().unwrap();
        let max_allocation_size = *MAX_ALLOCATION_SIZE.get().unwrap();

        if metadata.size <= max_small_object_size {
            with_local_heap(|local| allocator().deallocate_with(local, unpadded, true));
        } else if metadata.size <= max_allocation_size {
            with_local_heap(|local| allocator().deallocate_with(local, unpadded, false));
        } else {
            platform::free(unpadded, metadata.size);
        }
    }

    pub fn get_usable_size(ptr: *mut u8) -> usize {
        if let Some(metadata) = hashmap().get(ptr as u64) {
            return metadata.size;
        }
        let page_size = *SMALL_OBJECT_LOGICAL_PAGE_SIZE.get().unwrap();
        unsafe { Segment::get_size_class_from_address(ptr, page_size) as usize }
    }

    pub fn allocate_aligned(size: usize, alignment: usize) -> *mut u8 {
        let alignment = alignment.max(DEFAULT_ALLOCATION_ALIGNMENT);
        let adjusted_size = size + alignment;
        let max_allocation_size = *MAX_ALLOCATION_SIZE.get().unwrap();

        if adjusted_size > max_allocation_size {
            return Self::allocate_aligned_large_object(adjusted_size, alignment);
        }

        let ptr = with_local_heap(|local| allocator().allocate_with(local, adjusted_size));
        if ptr.is_null() {
            return core::ptr::null_mut();
        }

        let offset = offset_for_alignment(ptr as usize, alignment);
        let ret = unsafe { ptr.add(offset) };
        hashmap().insert(ret as u64, AllocationMetadata { size: adjusted_size, padding_bytes: offset });
        ret
    }

    fn allocate_aligned_large_object(adjusted_size: usize, alignment: usize) -> *mut u8 {
        let ptr = platform::reserve(adjusted_size, false, -1);
        if ptr.is_null() {
            return core::ptr::null_mut();
        }
        let offset = offset_for_alignment(ptr as usize, alignment);
        let ret = unsafe { ptr.add(offset) };
        hashmap().insert(ret as u64, AllocationMetadata { size: adjusted_size, padding_bytes: offset });
        ret
    }

    /// Installs (or, with `None`, clears) the handler [`ScalableMalloc::operator_new`]
    /// invokes on allocation failure, mirroring `std::set_new_handler`.
    pub fn set_new_handler(handler: Option<fn()>) {
        let _guard = NEW_HANDLER_LOCK.guard();
        unsafe { *NEW_HANDLER.0.get() = handler };
    }

    fn handle_operator_new_failure() {
        let handler = {
            let _guard = NEW_HANDLER_LOCK.guard();
            unsafe { *NEW_HANDLER.0.get() }
        };
        match handler {
            Some(handler) => handler(),
            None => panic!("ScalableMalloc: allocation failed and no new-handler is installed"),
        }
    }

    /// `allocate`, but runs the installed new-handler (or panics) on failure
    /// instead of returning null — the `operator new` replacement contract.
    pub fn operator_new(size: usize) -> *mut u8 {
        let ret = Self::allocate(size);
        if ret.is_null() {
            Self::handle_operator_new_failure();
        }
        ret
    }

    /// `allocate_aligned`, but runs the installed new-handler (or panics) on
    /// failure instead of returning null.
    pub fn operator_new_aligned(size: usize, alignment: usize) -> *mut u8 {
        let ret = Self::allocate_aligned(size, alignment);
        if ret.is_null() {
            Self::handle_operator_new_failure();
        }
        ret
    }

    pub fn allocate_and_zero_memory(count: usize, size: usize) -> *mut u8 {
        let total_size = count * size;
        let ret = Self::allocate(total_size);
        if !ret.is_null() {
            unsafe { core::ptr::write_bytes(ret, 0, total_size) };
        }
        ret
    }

    pub fn reallocate(ptr: *mut u8, new_size: usize) -> *mut u8 {
        if ptr.is_null() {
            return Self::allocate(new_size);
        }
        if new_size == 0 {
            Self::deallocate(ptr);
            return core::ptr::null_mut();
        }

        let old_size = Self::get_usable_size(ptr);
        if new_size <= old_size {
            return ptr;
        }

        let new_ptr = Self::allocate(new_size);
        if !new_ptr.is_null() {
            unsafe { core::ptr::copy_nonoverlapping(ptr, new_ptr, old_size) };
            Self::deallocate(ptr);
        }
        new_ptr
    }

    pub fn reallocate_and_zero_memory(ptr: *mut u8, count: usize, size: usize) -> *mut u8 {
        let total_size = count * size;
        let ret = Self::reallocate(ptr, total_size);
        if !ret.is_null() {
            unsafe { core::ptr::write_bytes(ret, 0, total_size) };
        }
        ret
    }

    pub fn aligned_reallocate(ptr: *mut u8, new_size: usize, alignment: usize) -> *mut u8 {
        if ptr.is_null() {
            return Self::allocate_aligned(new_size, alignment);
        }
        if new_size == 0 {
            Self::deallocate(ptr);
            return core::ptr::null_mut();
        }

        let old_size = Self::get_usable_size(ptr);
        if new_size <= old_size {
            return ptr;
        }

        let new_ptr = Self::allocate_aligned(new_size, alignment);
        if !new_ptr.is_null() {
            unsafe { core::ptr::copy_nonoverlapping(ptr, new_ptr, old_size) };
            Self::deallocate(ptr);
        }
        new_ptr
    }
}

fn offset_for_alignment(address: usize, alignment: usize) -> usize {
    let remainder = address % alignment;
    if remainder == 0 {
        0
    } else {
        alignment - remainder
    }
}

fn allocator() -> &'static Allocator {
    ALLOCATOR.get().expect("ScalableMalloc::create not called")
}

fn allocator_handle() -> Arc<Allocator> {
    Arc::clone(ALLOCATOR.get().expect("ScalableMalloc::create not called"))
}

fn hashmap() -> &'static MPMCDictionary<AllocationMetadata> {
    NON_SMALL_AND_ALIGNED_OBJECTS.get().expect("ScalableMalloc::create not called")
}

fn with_local_heap<R>(f: impl FnOnce(Option<&LocalHeap>) -> R) -> R {
    LOCAL_HEAP.with(|slot| {
        let mut slot_ref = slot.borrow_mut();
        if slot_ref.is_none() {
            if let Some(params) = LOCAL_HEAP_PARAMS.get() {
                let allocator = allocator_handle();
                // Bounded metadata buffer: once the pre-created cache count is
                // exhausted this thread gets no local heap and falls through
                // to the central heap for every allocate/deallocate.
                if allocator.try_reserve_local_heap_slot() {
                    let mut heap: LocalHeap = HeapPow2::new(SegmentKind::Local);
                    if heap.create(params, allocator.arena()) {
                        *slot_ref = Some(LocalHeapHandle::new(heap, allocator));
                    } else {
                        allocator.release_local_heap_slot();
                    }
                }
            }
        }
        f(slot_ref.as_ref().map(|handle| &handle.heap))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_options() -> ScalableMallocOptions {
        ScalableMallocOptions {
            arena_initial_size: 16 * 1024 * 1024,
            non_small_and_aligned_objects_map_size: 1024,
            ..ScalableMallocOptions::default()
        }
    }

    // ScalableMalloc is a process-wide singleton (`create` may only
    // succeed once), so every scenario that needs it created runs inside
    // a single test rather than one `create` call per test.
    #[test]
    fn create_allocate_and_deallocate_round_trip() {
        assert!(ScalableMalloc::create(small_options()));

        let small = ScalableMalloc::allocate(64);
        assert!(!small.is_null());
        assert_eq!((small as usize) % DEFAULT_ALLOCATION_ALIGNMENT, 0);
        ScalableMalloc::deallocate(small);

        let large_size = crate::heap::LARGEST_SIZE_CLASS + 4096;
        let large = ScalableMalloc::allocate(large_size);
        assert!(!large.is_null());
        assert_eq!(ScalableMalloc::get_usable_size(large), large_size);
        ScalableMalloc::deallocate(large);

        let aligned = ScalableMalloc::allocate_aligned(256, 4096);
        assert!(!aligned.is_null());
        assert_eq!((aligned as usize) % 4096, 0);
        ScalableMalloc::deallocate(aligned);

        let zeroed = ScalableMalloc::allocate_and_zero_memory(16, 8);
        assert!(!zeroed.is_null());
        let zeroed_slice = unsafe { core::slice::from_raw_parts(zeroed, 128) };
        assert!(zeroed_slice.iter().all(|&b| b == 0));
        ScalableMalloc::deallocate(zeroed);

        let small = ScalableMalloc::allocate(32);
        unsafe { core::ptr::write_bytes(small, 0xAB, 32) };
        let grown = ScalableMalloc::reallocate(small, 4096);
        assert!(!grown.is_null());
        let grown_prefix = unsafe { core::slice::from_raw_parts(grown, 32) };
        assert!(grown_prefix.iter().all(|&b| b == 0xAB));
        let freed = ScalableMalloc::reallocate(grown, 0);
        assert!(freed.is_null());

        let aligned_small = ScalableMalloc::allocate_aligned(64, 64);
        let aligned_grown = ScalableMalloc::aligned_reallocate(aligned_small, 8192, 64);
        assert!(!aligned_grown.is_null());
        assert_eq!((aligned_grown as usize) % 64, 0);
        ScalableMalloc::deallocate(aligned_grown);

        let new_ptr = ScalableMalloc::operator_new(128);
        assert!(!new_ptr.is_null());
        ScalableMalloc::deallocate(new_ptr);
    }

    #[test]
    #[should_panic(expected = "new-handler")]
    fn operator_new_panics_without_a_handler_on_exhaustion() {
        ScalableMalloc::set_new_handler(None);
        ScalableMalloc::handle_operator_new_failure();
    }
}
