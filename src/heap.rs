//! Power-of-two binned heaps ([`HeapPow2`]) and single-bin heaps
//! ([`HeapPool`]), each pairing one or more [`Segment`]s with a pair of
//! deallocation queues that absorb free/reuse traffic before it has to
//! touch a segment's own freelist bookkeeping.
//!
//! Both are generic over the queue discipline ([`DeallocQueue`]: the
//! single-consumer [`BoundedQueue`] for thread-local heaps, the lock-free
//! [`MPMCBoundedQueue`] for the shared central heap) and over the locking
//! discipline guarding segment mutation ([`ConcurrencyGuard`]: [`NoLock`]
//! for thread-local heaps, [`Spinlock`] for the central heap).

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::arena::Arena;
use crate::page::{self, LogicalPageHeader};
use crate::queue::DeallocQueue;
use crate::segment::{Segment, SegmentCreationParameters, SegmentKind};
use crate::spinlock::{ConcurrencyGuard, NoLock};
use crate::util;

pub const BIN_COUNT: usize = 15;
pub const MAX_BIN_INDEX: usize = BIN_COUNT - 1;
pub const MIN_MEDIUM_OBJECT_BIN_INDEX: usize = 12;

pub const MIN_SIZE_CLASS: usize = 16;
const LOG2_MIN_SIZE_CLASS: usize = 4;
pub const LARGEST_SIZE_CLASS: usize = MIN_SIZE_CLASS << MAX_BIN_INDEX;
pub const LARGEST_SMALL_OBJECT_SIZE_CLASS: usize = MIN_SIZE_CLASS << (MIN_MEDIUM_OBJECT_BIN_INDEX - 1);

/// Rounds up to the nearest size class and returns its bin, clamped to
/// [`MAX_BIN_INDEX`] — callers are responsible for routing anything bigger
/// than [`LARGEST_SIZE_CLASS`] to a large-object path before ever reaching
/// a heap.
#[inline]
pub fn bin_index_for_size(size: usize) -> usize {
    let rounded = util::round_up_to_pow2(size.max(MIN_SIZE_CLASS));
    let index = rounded.trailing_zeros() as usize - LOG2_MIN_SIZE_CLASS;
    index.min(MAX_BIN_INDEX)
}

/// Common surface [`crate::allocator::ScalableAllocator`] dispatches
/// through, implemented by both [`HeapPow2`] and [`HeapPool`] so the
/// allocator can be generic over which kind of heap backs its central and
/// local sides.
pub trait ScalableHeap {
    fn allocate(&self, size: usize) -> *mut u8;
    fn deallocate(&self, ptr: *mut u8, is_small_object: bool) -> bool;
    fn segment_count(&self) -> usize;

    /// # Safety
    /// Must not race a concurrent mutation of the same segment.
    unsafe fn segment_head(&self, bin: usize) -> *mut LogicalPageHeader;

    /// # Safety
    /// Must not race a concurrent mutation of the same segment.
    unsafe fn transfer_pages_into(&self, bin: usize, head: *mut LogicalPageHeader);
}

#[derive(Clone, Debug)]
pub struct HeapPow2CreationParams {
    pub small_object_logical_page_size: usize,
    pub medium_object_logical_page_size: usize,
    pub logical_page_counts: [usize; BIN_COUNT],
    pub page_recycling_threshold_per_size_class: usize,
    pub segments_can_grow: bool,
    pub segment_grow_coefficient: f64,
    pub deallocation_queues_processing_threshold: usize,
    pub recyclable_deallocation_queue_sizes: [usize; BIN_COUNT],
    pub non_recyclable_deallocation_queue_sizes: [usize; BIN_COUNT],
}

impl Default for HeapPow2CreationParams {
    fn default() -> Self {
        HeapPow2CreationParams {
            small_object_logical_page_size: 65536,
            medium_object_logical_page_size: 524288,
            logical_page_counts: [1, 1, 1, 1, 1, 1, 1, 2, 4, 8, 16, 32, 8, 16, 32],
            page_recycling_threshold_per_size_class: 1024,
            segments_can_grow: true,
            segment_grow_coefficient: 2.0,
            deallocation_queues_processing_threshold: 1024,
            recyclable_deallocation_queue_sizes: [65536; BIN_COUNT],
            non_recyclable_deallocation_queue_sizes: [65536; BIN_COUNT],
        }
    }
}

/// 15 fixed power-of-two size classes, each its own [`Segment`] plus a
/// recyclable/non-recyclable deallocation queue pair.
///
/// Freed pointers whose page still belongs to this heap's current segment
/// generation go on the recyclable queue and are handed straight back out
/// on the next `allocate` of the same bin. Freed pointers whose page
/// belongs to a *different* segment generation (migrated in from another
/// thread's heap via [`Segment::transfer_logical_pages_from`]) go on the
/// non-recyclable queue instead: they're still valid memory, just not safe
/// to fold into this segment's own freelist, so they're handed back out
/// as-is rather than being pushed through `Segment::deallocate`.
pub struct HeapPow2<Q: DeallocQueue, G: ConcurrencyGuard = NoLock> {
    small_object_logical_page_size: usize,
    medium_object_logical_page_size: usize,
    segments: Vec<UnsafeCell<Segment>>,
    pending_allocation_count: AtomicUsize,
    deallocation_queue_processing_threshold: usize,
    recyclable_queues: Vec<Q>,
    non_recyclable_queues: Vec<Q>,
    guard: G,
    kind: SegmentKind,
}

unsafe impl<Q: DeallocQueue, G: ConcurrencyGuard> Send for HeapPow2<Q, G> {}
unsafe impl<Q: DeallocQueue + Sync, G: ConcurrencyGuard + Sync> Sync for HeapPow2<Q, G> {}

impl<Q: DeallocQueue, G: ConcurrencyGuard> HeapPow2<Q, G> {
    pub fn new(kind: SegmentKind) -> Self {
        HeapPow2 {
            small_object_logical_page_size: 0,
            medium_object_logical_page_size: 0,
            segments: Vec::new(),
            pending_allocation_count: AtomicUsize::new(0),
            deallocation_queue_processing_threshold: 0,
            recyclable_queues: Vec::new(),
            non_recyclable_queues: Vec::new(),
            guard: G::default(),
            kind,
        }
    }

    pub fn create(&mut self, params: &HeapPow2CreationParams, arena: &Arena) -> bool {
        if !util::is_size_a_multiple_of(params.small_object_logical_page_size, crate::platform::page_size())
            || !util::is_size_a_multiple_of(params.medium_object_logical_page_size, crate::platform::page_size())
        {
            return false;
        }

        self.small_object_logical_page_size = params.small_object_logical_page_size;
        self.medium_object_logical_page_size = params.medium_object_logical_page_size;

        let mut small_buffer_size = 0usize;
        let mut medium_buffer_size = 0usize;
        for (i, &page_count) in params.logical_page_counts.iter().enumerate() {
            if i < MIN_MEDIUM_OBJECT_BIN_INDEX {
                small_buffer_size += page_count * params.small_object_logical_page_size;
            } else {
                medium_buffer_size += page_count * params.medium_object_logical_page_size;
            }
        }

        let small_buffer = arena.allocate(small_buffer_size);
        if small_buffer.is_null() {
            return false;
        }
        let medium_buffer = arena.allocate_aligned(medium_buffer_size, params.medium_object_logical_page_size);
        if medium_buffer.is_null() {
            return false;
        }

        let mut size_class = MIN_SIZE_CLASS as u32;
        let mut small_offset = 0usize;
        let mut medium_offset = 0usize;

        for (i, &page_count) in params.logical_page_counts.iter().enumerate() {
            let is_small = i < MIN_MEDIUM_OBJECT_BIN_INDEX;
            let logical_page_size = if is_small {
                params.small_object_logical_page_size
            } else {
                params.medium_object_logical_page_size
            };
            let bin_buffer_size = page_count * logical_page_size;
            let buffer = if is_small {
                let ptr = unsafe { small_buffer.add(small_offset) };
                small_offset += bin_buffer_size;
                ptr
            } else {
                let ptr = unsafe { medium_buffer.add(medium_offset) };
                medium_offset += bin_buffer_size;
                ptr
            };

            let segment_params = SegmentCreationParameters {
                logical_page_size,
                logical_page_count: page_count,
                page_recycling_threshold: params.page_recycling_threshold_per_size_class,
                size_class,
                grow_coefficient: params.segment_grow_coefficient,
                can_grow: params.segments_can_grow,
            };

            let mut segment = Segment::new(self.kind);
            if !segment.create(buffer, arena, segment_params) {
                return false;
            }
            self.segments.push(UnsafeCell::new(segment));
            size_class <<= 1;
        }

        self.deallocation_queue_processing_threshold = params.deallocation_queues_processing_threshold;

        for i in 0..BIN_COUNT {
            let mut recyclable = Q::default();
            if !recyclable.create(params.recyclable_deallocation_queue_sizes[i]) {
                return false;
            }
            let mut non_recyclable = Q::default();
            if !non_recyclable.create(params.non_recyclable_deallocation_queue_sizes[i]) {
                return false;
            }
            self.recyclable_queues.push(recyclable);
            self.non_recyclable_queues.push(non_recyclable);
        }

        true
    }

    pub fn get_segment_count(&self) -> usize {
        BIN_COUNT
    }

    pub fn get_max_allocation_size(&self) -> usize {
        LARGEST_SIZE_CLASS
    }

    pub fn get_max_small_object_size(&self) -> usize {
        LARGEST_SMALL_OBJECT_SIZE_CLASS
    }

    /// # Safety
    /// Caller must not mutate the returned segment concurrently with any
    /// in-flight `allocate`/`deallocate` call on the same bin unless it
    /// also takes the guard this heap uses for that purpose.
    pub unsafe fn segment_mut(&self, bin: usize) -> &mut Segment {
        &mut *self.segments[bin].get()
    }

    pub fn allocate(&self, size: usize) -> *mut u8 {
        let size = util::round_up_to_pow2(size.max(MIN_SIZE_CLASS));
        let bin = bin_index_for_size(size);

        if self.pending_allocation_count.fetch_add(1, Ordering::Relaxed) + 1 >= self.deallocation_queue_processing_threshold {
            return self.allocate_by_processing_deallocation_queues(bin, size);
        }

        if let Some(ptr) = self.non_recyclable_queues[bin].try_pop() {
            return ptr as *mut u8;
        }
        if let Some(ptr) = self.recyclable_queues[bin].try_pop() {
            return ptr as *mut u8;
        }

        self.guard.enter();
        let ptr = unsafe { (*self.segments[bin].get()).allocate(size) };
        self.guard.leave();
        ptr
    }

    fn allocate_by_processing_deallocation_queues(&self, bin: usize, size: usize) -> *mut u8 {
        self.pending_allocation_count.store(0, Ordering::Relaxed);

        let mut result: *mut u8 = core::ptr::null_mut();
        while let Some(ptr) = self.recyclable_queues[bin].try_pop() {
            if result.is_null() {
                result = ptr as *mut u8;
            } else {
                self.guard.enter();
                unsafe { (*self.segments[bin].get()).deallocate(ptr as *mut u8) };
                self.guard.leave();
            }
        }
        if !result.is_null() {
            return result;
        }

        if let Some(ptr) = self.non_recyclable_queues[bin].try_pop() {
            return ptr as *mut u8;
        }

        self.guard.enter();
        let ptr = unsafe { (*self.segments[bin].get()).allocate(size) };
        self.guard.leave();
        ptr
    }

    /// Pushes a freed pointer onto the appropriate queue. Returns `false`
    /// if the queue is full — callers (the scalable allocator's dispatch
    /// logic) fall through to the central heap in that case rather than
    /// retrying.
    pub fn deallocate(&self, ptr: *mut u8, is_small_object: bool) -> bool {
        let page_size = if is_small_object {
            self.small_object_logical_page_size
        } else {
            self.medium_object_logical_page_size
        };
        let header = unsafe { page::header_from_pointer(ptr, page_size) };
        let size_class = unsafe { (*header).size_class };
        let bin = bin_index_for_size(size_class as usize);
        let header_segment_id = unsafe { (*header).segment_id as u32 };
        let owning_segment_id = unsafe { (*self.segments[bin].get()).get_id() };

        if header_segment_id == owning_segment_id {
            self.recyclable_queues[bin].try_push(ptr as u64)
        } else {
            self.non_recyclable_queues[bin].try_push(ptr as u64)
        }
    }
}

impl<Q: DeallocQueue, G: ConcurrencyGuard> ScalableHeap for HeapPow2<Q, G> {
    fn allocate(&self, size: usize) -> *mut u8 {
        HeapPow2::allocate(self, size)
    }
    fn deallocate(&self, ptr: *mut u8, is_small_object: bool) -> bool {
        HeapPow2::deallocate(self, ptr, is_small_object)
    }
    fn segment_count(&self) -> usize {
        self.get_segment_count()
    }
    unsafe fn segment_head(&self, bin: usize) -> *mut LogicalPageHeader {
        self.segment_mut(bin).get_head_logical_page()
    }
    unsafe fn transfer_pages_into(&self, bin: usize, head: *mut LogicalPageHeader) {
        self.segment_mut(bin).transfer_logical_pages_from(head);
    }
}

#[derive(Clone, Copy, Debug)]
pub struct HeapPoolCreationParams {
    pub size_class: u32,
    pub initial_size: usize,
    pub logical_page_size: usize,
    pub segments_can_grow: bool,
    pub page_recycling_threshold: usize,
    pub grow_coefficient: f64,
    pub recyclable_deallocation_queue_size: usize,
    pub non_recyclable_deallocation_queue_size: usize,
    pub deallocation_queues_processing_threshold: usize,
}

impl Default for HeapPoolCreationParams {
    fn default() -> Self {
        HeapPoolCreationParams {
            size_class: 0,
            initial_size: 0,
            logical_page_size: 65536,
            segments_can_grow: true,
            page_recycling_threshold: 1,
            grow_coefficient: 2.0,
            recyclable_deallocation_queue_size: 65536,
            non_recyclable_deallocation_queue_size: 65536,
            deallocation_queues_processing_threshold: 1024,
        }
    }
}

/// A single size class, single segment heap: the pool-allocator analogue of
/// [`HeapPow2`], used when every allocation a caller makes is the same
/// fixed size. `size_class`/`is_small_object` at the call site are ignored
/// (kept for API parity with `HeapPow2`), since there's only one size class
/// and one logical page size to route through.
pub struct HeapPool<Q: DeallocQueue, G: ConcurrencyGuard = NoLock> {
    segment: UnsafeCell<Segment>,
    pending_allocation_count: AtomicUsize,
    deallocation_queue_processing_threshold: usize,
    recyclable_queue: Q,
    non_recyclable_queue: Q,
    guard: G,
}

unsafe impl<Q: DeallocQueue, G: ConcurrencyGuard> Send for HeapPool<Q, G> {}
unsafe impl<Q: DeallocQueue + Sync, G: ConcurrencyGuard + Sync> Sync for HeapPool<Q, G> {}

impl<Q: DeallocQueue, G: ConcurrencyGuard> HeapPool<Q, G> {
    pub fn new(kind: SegmentKind) -> Self {
        HeapPool {
            segment: UnsafeCell::new(Segment::new(kind)),
            pending_allocation_count: AtomicUsize::new(0),
            deallocation_queue_processing_threshold: 1024,
            recyclable_queue: Q::default(),
            non_recyclable_queue: Q::default(),
            guard: G::default(),
        }
    }

    pub fn create(&mut self, params: &HeapPoolCreationParams, arena: &Arena) -> bool {
        if params.size_class == 0 || params.initial_size == 0
            || params.initial_size % params.logical_page_size != 0
        {
            return false;
        }

        let buffer = arena.allocate(params.initial_size);
        if buffer.is_null() {
            return false;
        }

        let segment_params = SegmentCreationParameters {
            logical_page_size: params.logical_page_size,
            logical_page_count: params.initial_size / params.logical_page_size,
            page_recycling_threshold: params.page_recycling_threshold,
            size_class: params.size_class,
            grow_coefficient: params.grow_coefficient,
            can_grow: params.segments_can_grow,
        };

        if !self.segment.get_mut().create(buffer, arena, segment_params) {
            return false;
        }
        if !self.recyclable_queue.create(params.recyclable_deallocation_queue_size / core::mem::size_of::<u64>()) {
            return false;
        }
        if !self.non_recyclable_queue.create(params.non_recyclable_deallocation_queue_size / core::mem::size_of::<u64>()) {
            return false;
        }

        self.deallocation_queue_processing_threshold = params.deallocation_queues_processing_threshold;
        true
    }

    pub fn get_segment_count(&self) -> usize {
        1
    }

    /// # Safety
    /// See [`HeapPow2::segment_mut`].
    pub unsafe fn segment_mut(&self) -> &mut Segment {
        &mut *self.segment.get()
    }

    pub fn allocate(&self, size: usize) -> *mut u8 {
        if self.pending_allocation_count.fetch_add(1, Ordering::Relaxed) + 1 >= self.deallocation_queue_processing_threshold {
            return self.allocate_by_processing_deallocation_queue(size);
        }

        if let Some(ptr) = self.non_recyclable_queue.try_pop() {
            return ptr as *mut u8;
        }
        if let Some(ptr) = self.recyclable_queue.try_pop() {
            return ptr as *mut u8;
        }

        self.guard.enter();
        let ptr = unsafe { (*self.segment.get()).allocate(size) };
        self.guard.leave();
        ptr
    }

    fn allocate_by_processing_deallocation_queue(&self, size: usize) -> *mut u8 {
        self.pending_allocation_count.store(0, Ordering::Relaxed);

        let mut result: *mut u8 = core::ptr::null_mut();
        while let Some(ptr) = self.recyclable_queue.try_pop() {
            if result.is_null() {
                result = ptr as *mut u8;
            } else {
                self.guard.enter();
                unsafe { (*self.segment.get()).deallocate(ptr as *mut u8) };
                self.guard.leave();
            }
        }
        if !result.is_null() {
            return result;
        }

        if let Some(ptr) = self.non_recyclable_queue.try_pop() {
            return ptr as *mut u8;
        }

        self.guard.enter();
        let ptr = unsafe { (*self.segment.get()).allocate(size) };
        self.guard.leave();
        ptr
    }

    /// We don't push pointers that belong to a foreign segment generation
    /// back into the recyclable queue — doing so would let virtual-memory
    /// page recycling reclaim memory the segment never actually owns.
    pub fn deallocate(&self, ptr: *mut u8) -> bool {
        let owns = unsafe { (*self.segment.get()).owns_pointer(ptr) };
        if owns {
            self.recyclable_queue.try_push(ptr as u64)
        } else {
            self.non_recyclable_queue.try_push(ptr as u64)
        }
    }
}

impl<Q: DeallocQueue, G: ConcurrencyGuard> ScalableHeap for HeapPool<Q, G> {
    fn allocate(&self, size: usize) -> *mut u8 {
        HeapPool::allocate(self, size)
    }
    fn deallocate(&self, ptr: *mut u8, _is_small_object: bool) -> bool {
        HeapPool::deallocate(self, ptr)
    }
    fn segment_count(&self) -> usize {
        self.get_segment_count()
    }
    unsafe fn segment_head(&self, _bin: usize) -> *mut LogicalPageHeader {
        self.segment_mut().get_head_logical_page()
    }
    unsafe fn transfer_pages_into(&self, _bin: usize, head: *mut LogicalPageHeader) {
        self.segment_mut().transfer_logical_pages_from(head);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ArenaOptions;
    use crate::queue::BoundedQueue;
    use crate::spinlock::NoLock;

    #[test]
    fn bin_math_matches_expected_boundaries() {
        assert_eq!(bin_index_for_size(1), 0);
        assert_eq!(bin_index_for_size(16), 0);
        assert_eq!(bin_index_for_size(17), 1);
        assert_eq!(bin_index_for_size(32), 1);
        assert_eq!(bin_index_for_size(262144), MAX_BIN_INDEX);
        assert_eq!(LARGEST_SIZE_CLASS, 262144);
        assert_eq!(LARGEST_SMALL_OBJECT_SIZE_CLASS, 32768);
    }

    fn make_arena(capacity: usize) -> Box<Arena> {
        let mut arena = Box::new(Arena::new());
        assert!(arena.create(ArenaOptions {
            cache_capacity: capacity,
            page_alignment: 65536,
            use_huge_pages: false,
            numa_node: -1,
        }));
        arena
    }

    #[test]
    fn heap_pow2_create_allocate_deallocate_round_trips() {
        let arena = make_arena(16 * 1024 * 1024);
        let mut heap: HeapPow2<BoundedQueue<u64>, NoLock> = HeapPow2::new(SegmentKind::Local);
        let mut params = HeapPow2CreationParams::default();
        params.deallocation_queues_processing_threshold = 1_000_000;
        assert!(heap.create(&params, &arena));

        let ptr = heap.allocate(100);
        assert!(!ptr.is_null());
        assert!(heap.deallocate(ptr, true));

        let ptr2 = heap.allocate(100);
        assert_eq!(ptr, ptr2);
    }

    #[test]
    fn heap_pow2_processes_queue_once_threshold_is_crossed() {
        let arena = make_arena(16 * 1024 * 1024);
        let mut heap: HeapPow2<BoundedQueue<u64>, NoLock> = HeapPow2::new(SegmentKind::Local);
        let mut params = HeapPow2CreationParams::default();
        params.deallocation_queues_processing_threshold = 3;
        assert!(heap.create(&params, &arena));

        let a = heap.allocate(16);
        let b = heap.allocate(16);
        assert!(!a.is_null() && !b.is_null());
        assert!(heap.deallocate(a, true));
        assert!(heap.deallocate(b, true));

        // The third allocate call crosses the threshold and must route
        // through the processing path while still handing back valid memory.
        let c = heap.allocate(16);
        assert!(c == a || c == b);
    }

    #[test]
    fn heap_pool_create_allocate_deallocate_round_trips() {
        let arena = make_arena(1024 * 1024);
        let mut pool: HeapPool<BoundedQueue<u64>, NoLock> = HeapPool::new(SegmentKind::Local);
        let params = HeapPoolCreationParams {
            size_class: 128,
            initial_size: 65536,
            logical_page_size: 65536,
            deallocation_queues_processing_threshold: 1_000_000,
            ..HeapPoolCreationParams::default()
        };
        assert!(pool.create(&params, &arena));

        let ptr = pool.allocate(128);
        assert!(!ptr.is_null());
        assert!(pool.deallocate(ptr));
        let ptr2 = pool.allocate(128);
        assert_eq!(ptr, ptr2);
    }
}
