//! Generic local/central dispatch shared by every façade.
//!
//! [`ScalableAllocator`] owns one central heap (shared, spinlock-guarded
//! segments) and lazily creates one local heap per thread that ever calls
//! into it, up to a bounded cache count. `allocate` tries the calling
//! thread's local heap first and only reaches for the central heap if the
//! local heap doesn't exist (first call on this thread, or the cache is
//! already full) or is exhausted. `deallocate` mirrors that: local heap
//! first, central heap if the local heap's queues are full or the pointer
//! never belonged to a local heap to begin with.
//!
//! The reference implementation keeps a fixed-size metadata buffer sized
//! for `N` local heaps and placement-news into it as threads arrive,
//! failing once `active_count` reaches `N`. Rust's `thread_local!` gives
//! the same "create once per thread, reuse for the thread's lifetime"
//! behaviour without the manual slot bookkeeping, but the capacity bound
//! itself still has to exist: [`ScalableAllocator::try_reserve_local_heap_slot`]
//! reproduces it with an atomic counter checked against the configured
//! cache count instead of a literal buffer offset; see `DESIGN.md`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::arena::Arena;
use crate::heap::ScalableHeap;
use crate::options::ArenaOptions;

/// Shared central heap plus lazily-created per-thread local heaps.
///
/// Generic over the concrete heap type on each side: [`crate::malloc::ScalableMalloc`]
/// instantiates this with `HeapPow2` on both sides, [`crate::pool::ScalablePool`]
/// with `HeapPool`, matching how the original's `ScalableAllocator<CentralHeapType, LocalHeapType>`
/// template is instantiated twice.
pub struct ScalableAllocator<C: ScalableHeap, L: ScalableHeap> {
    // Boxed so the `Arena`'s address stays fixed once `central` (and every
    // local heap built afterwards) has taken a raw pointer to it for
    // segment growth — moving `ScalableAllocator` itself only moves the
    // `Box`'s pointer, never the pointee.
    arena: Box<Arena>,
    central: C,
    thread_local_heap_cache_count: AtomicUsize,
    active_local_heap_count: AtomicUsize,
    fast_shutdown: AtomicBool,
    _local: std::marker::PhantomData<L>,
}

impl<C: ScalableHeap + Send + Sync + 'static, L: ScalableHeap + 'static> ScalableAllocator<C, L> {
    /// `build_central` receives a reference to the already-created arena so
    /// the central heap's segments can be carved out of it before the
    /// allocator itself is assembled.
    pub fn new(arena_options: ArenaOptions, build_central: impl FnOnce(&Arena) -> Option<C>) -> Option<Self> {
        let mut arena = Box::new(Arena::new());
        if !arena.create(arena_options) {
            return None;
        }
        let central = build_central(&arena)?;
        Some(ScalableAllocator {
            arena,
            central,
            thread_local_heap_cache_count: AtomicUsize::new(1),
            active_local_heap_count: AtomicUsize::new(0),
            fast_shutdown: AtomicBool::new(false),
            _local: std::marker::PhantomData,
        })
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    pub fn central_heap(&self) -> &C {
        &self.central
    }

    pub fn set_thread_local_heap_cache_count(&self, count: usize) {
        self.thread_local_heap_cache_count.store(count.max(1), Ordering::Relaxed);
    }

    /// Reserves one slot in the bounded local-heap metadata buffer for the
    /// calling thread's first allocation. Returns `false` once `active_count`
    /// has reached the pre-created cache count, meaning the caller must fall
    /// back to the central heap instead of constructing a new local one.
    /// Paired with [`ScalableAllocator::release_local_heap_slot`], called by
    /// [`LocalHeapHandle`]'s `Drop` when the owning thread's local heap retires.
    pub fn try_reserve_local_heap_slot(&self) -> bool {
        let cap = self.thread_local_heap_cache_count.load(Ordering::Relaxed);
        let mut current = self.active_local_heap_count.load(Ordering::Relaxed);
        loop {
            if current >= cap {
                return false;
            }
            match self.active_local_heap_count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn release_local_heap_slot(&self) {
        self.active_local_heap_count.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn set_enable_fast_shutdown(&self, enabled: bool) {
        self.fast_shutdown.store(enabled, Ordering::Relaxed);
    }

    pub fn get_enable_fast_shutdown(&self) -> bool {
        self.fast_shutdown.load(Ordering::Relaxed)
    }

    /// Allocates from the calling thread's local heap, falling back to the
    /// central heap if no local heap exists for this thread yet (the
    /// caller is responsible for registering one via a `thread_local!` slot
    /// — see [`crate::malloc::ScalableMalloc`]/[`crate::pool::ScalablePool`]
    /// for the concrete wiring) or if the local heap returns null.
    pub fn allocate_with(&self, local: Option<&L>, size: usize) -> *mut u8 {
        if let Some(local) = local {
            let ptr = local.allocate(size);
            if !ptr.is_null() {
                return ptr;
            }
        }
        self.central.allocate(size)
    }

    /// Deallocates via the calling thread's local heap first; if there is
    /// no local heap, or the local heap's queues are full, falls through
    /// to the central heap.
    pub fn deallocate_with(&self, local: Option<&L>, ptr: *mut u8, is_small_object: bool) -> bool {
        if let Some(local) = local {
            if local.deallocate(ptr, is_small_object) {
                return true;
            }
        }
        self.central.deallocate(ptr, is_small_object)
    }

    /// Runs the thread-exit page-transfer hook for a departing thread's
    /// local heap, unless fast shutdown is enabled (in which case the
    /// thread's pages are simply abandoned along with its arena-backed
    /// memory, same as the reference implementation's `fast_shutdown` path).
    pub fn retire_local_heap(&self, local: &L) {
        if self.fast_shutdown.load(Ordering::Relaxed) {
            return;
        }
        for bin in 0..local.segment_count() {
            unsafe {
                let head = local.segment_head(bin);
                if !head.is_null() {
                    self.central.transfer_pages_into(bin, head);
                }
            }
        }
    }
}

unsafe impl<C: ScalableHeap + Send + Sync, L: ScalableHeap> Sync for ScalableAllocator<C, L> {}
unsafe impl<C: ScalableHeap + Send, L: ScalableHeap> Send for ScalableAllocator<C, L> {}

/// RAII handle a façade's `thread_local!` slot stores alongside its local
/// heap: when the owning thread exits, `Drop` runs the page-transfer hook
/// before the local heap itself (and the arena pages its segments point
/// into) goes away.
///
/// Holds an `Arc` rather than a `&'static` reference so the same type works
/// for [`crate::malloc::ScalableMalloc`]'s process-wide singleton and
/// [`crate::pool::ScalablePool`]'s per-instance allocators alike.
pub struct LocalHeapHandle<C: ScalableHeap + Send + Sync + 'static, L: ScalableHeap + 'static> {
    pub heap: L,
    allocator: std::sync::Arc<ScalableAllocator<C, L>>,
}

impl<C: ScalableHeap + Send + Sync + 'static, L: ScalableHeap + 'static> LocalHeapHandle<C, L> {
    pub fn new(heap: L, allocator: std::sync::Arc<ScalableAllocator<C, L>>) -> Self {
        LocalHeapHandle { heap, allocator }
    }
}

impl<C: ScalableHeap + Send + Sync + 'static, L: ScalableHeap + 'static> Drop for LocalHeapHandle<C, L> {
    fn drop(&mut self) {
        self.allocator.retire_local_heap(&self.heap);
        self.allocator.release_local_heap_slot();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{HeapPow2, HeapPow2CreationParams};
    use crate::queue::{BoundedQueue, MPMCBoundedQueue};
    use crate::segment::SegmentKind;
    use crate::spinlock::{NoLock, Spinlock};

    fn make_allocator() -> ScalableAllocator<HeapPow2<MPMCBoundedQueue<u64>, Spinlock>, HeapPow2<BoundedQueue<u64>, NoLock>> {
        let arena_options = ArenaOptions {
            cache_capacity: 32 * 1024 * 1024,
            page_alignment: 65536,
            use_huge_pages: false,
            numa_node: -1,
        };

        ScalableAllocator::new(arena_options, |arena| {
            let mut central: HeapPow2<MPMCBoundedQueue<u64>, Spinlock> = HeapPow2::new(SegmentKind::Central);
            if central.create(&HeapPow2CreationParams::default(), arena) {
                Some(central)
            } else {
                None
            }
        })
        .unwrap()
    }

    #[test]
    fn allocate_falls_back_to_central_without_local_heap() {
        let allocator = make_allocator();
        let ptr = allocator.allocate_with(None, 128);
        assert!(!ptr.is_null());
        assert!(allocator.deallocate_with(None, ptr, true));
    }

    #[test]
    fn fast_shutdown_flag_round_trips() {
        let allocator = make_allocator();
        assert!(!allocator.get_enable_fast_shutdown());
        allocator.set_enable_fast_shutdown(true);
        assert!(allocator.get_enable_fast_shutdown());
    }

    #[test]
    fn local_heap_slot_reservation_is_bounded_by_cache_count() {
        let allocator = make_allocator();
        allocator.set_thread_local_heap_cache_count(2);

        assert!(allocator.try_reserve_local_heap_slot());
        assert!(allocator.try_reserve_local_heap_slot());
        assert!(!allocator.try_reserve_local_heap_slot());

        allocator.release_local_heap_slot();
        assert!(allocator.try_reserve_local_heap_slot());
    }
}
