//! Reserves large regions from the OS and bump-allocates logical pages (and
//! segments) out of them, so pages never come directly from individual
//! `mmap`/`VirtualAlloc` calls on the hot path.

use core::cell::UnsafeCell;
use core::ptr::NonNull;
use log::{error, warn};

use crate::options::ArenaOptions;
use crate::platform;
use crate::spinlock::Spinlock;
use crate::util;

/// Always-uncached pass-through allocator used for queues, dictionaries, and
/// other bookkeeping buffers that must not be carved out of the bump cache
/// (their lifetime doesn't follow the arena's page-granular churn).
pub struct MetadataAllocator;

impl MetadataAllocator {
    pub fn allocate(size: usize) -> *mut u8 {
        if size == 0 {
            return core::ptr::null_mut();
        }
        let rounded = util::round_up_to_multiple_of_pow2(size, platform::page_size());
        platform::reserve(rounded, false, -1)
    }

    pub fn deallocate(ptr: *mut u8, size: usize) {
        if ptr.is_null() || size == 0 {
            return;
        }
        let rounded = util::round_up_to_multiple_of_pow2(size, platform::page_size());
        platform::free(ptr, rounded);
    }
}

struct ArenaState {
    cache_start: *mut u8,
    cache_remaining_start: *mut u8,
    cache_remaining_size: usize,
}

/// Spinlock-guarded linear-bump sub-allocator over large, page-aligned,
/// over-allocated-then-trimmed OS regions.
pub struct Arena {
    lock: Spinlock,
    state: UnsafeCell<ArenaState>,
    options: ArenaOptions,
}

unsafe impl Sync for Arena {}
unsafe impl Send for Arena {}

impl Arena {
    pub const fn new() -> Self {
        Arena {
            lock: Spinlock::new(),
            state: UnsafeCell::new(ArenaState {
                cache_start: core::ptr::null_mut(),
                cache_remaining_start: core::ptr::null_mut(),
                cache_remaining_size: 0,
            }),
            options: ArenaOptions {
                cache_capacity: 0,
                page_alignment: 65536,
                use_huge_pages: false,
                numa_node: -1,
            },
        }
    }

    pub fn create(&mut self, options: ArenaOptions) -> bool {
        if options.cache_capacity == 0 || !util::is_pow2(options.page_alignment) {
            error!("Arena: invalid options (capacity={}, alignment={})", options.cache_capacity, options.page_alignment);
            return false;
        }
        self.options = options;

        let capacity = util::round_up_to_multiple_of_pow2(options.cache_capacity, options.page_alignment);
        let ptr = self.allocate_aligned_from_system(capacity, options.page_alignment);
        if ptr.is_null() {
            error!("Arena: failed to reserve initial cache of {} bytes", capacity);
            return false;
        }

        let state = self.state.get_mut();
        state.cache_start = ptr;
        state.cache_remaining_start = ptr;
        state.cache_remaining_size = capacity;
        true
    }

    /// Bump-allocates `size` bytes, page-alignment-granularity aligned,
    /// rebuilding the cache from the OS when the current one runs dry.
    pub fn allocate(&self, size: usize) -> *mut u8 {
        if size == 0 {
            return core::ptr::null_mut();
        }
        let size = util::round_up_to_multiple_of_pow2(size, self.options.page_alignment);

        self.lock.lock();
        let ptr = unsafe { self.allocate_locked(size) };
        self.lock.unlock();
        ptr
    }

    /// Bump-allocates `size` bytes aligned to `alignment`, which must be a
    /// multiple of the arena's own page alignment.
    pub fn allocate_aligned(&self, size: usize, alignment: usize) -> *mut u8 {
        if size == 0 {
            return core::ptr::null_mut();
        }
        if alignment == self.options.page_alignment {
            return self.allocate(size);
        }
        if alignment < self.options.page_alignment || !util::is_pow2(alignment) {
            return core::ptr::null_mut();
        }

        // Over-allocate by `alignment` from the OS directly; this bypasses
        // the bump cache, matching the teacher's rare-path treatment of
        // unusually aligned segments.
        let over_size = util::round_up_to_multiple_of_pow2(size + alignment, self.options.page_alignment);
        self.allocate_aligned_from_system(over_size, alignment)
    }

    unsafe fn allocate_locked(&self, size: usize) -> *mut u8 {
        let state = &mut *self.state.get();

        if state.cache_remaining_size < size {
            if !self.build_cache(state, size) {
                return core::ptr::null_mut();
            }
        }

        let ptr = state.cache_remaining_start;
        state.cache_remaining_start = state.cache_remaining_start.add(size);
        state.cache_remaining_size -= size;
        ptr
    }

    /// Releases whatever remains unused in the current cache back to the OS.
    /// Does not affect memory already handed out.
    pub fn release_to_system(&self) {
        self.lock.lock();
        unsafe {
            let state = &mut *self.state.get();
            if state.cache_remaining_size > 0 {
                platform::free(state.cache_remaining_start, state.cache_remaining_size);
                state.cache_remaining_start = core::ptr::null_mut();
                state.cache_remaining_size = 0;
            }
        }
        self.lock.unlock();
    }

    fn build_cache(&self, state: &mut ArenaState, at_least: usize) -> bool {
        let target = at_least.max(self.options.cache_capacity);
        let capacity = util::round_up_to_multiple_of_pow2(target, self.options.page_alignment);

        let ptr = self.allocate_aligned_from_system(capacity, self.options.page_alignment);
        if ptr.is_null() {
            return false;
        }

        state.cache_start = ptr;
        state.cache_remaining_start = ptr;
        state.cache_remaining_size = capacity;
        true
    }

    fn allocate_aligned_from_system(&self, size: usize, alignment: usize) -> *mut u8 {
        if self.options.use_huge_pages {
            if let Some(huge_size) = platform::minimum_huge_page_size() {
                if size % huge_size == 0 && alignment % huge_size == 0 {
                    let ptr = platform::reserve_aligned(size, alignment, true, self.options.numa_node);
                    if !ptr.is_null() {
                        return ptr;
                    }
                    warn!("Arena: huge page reservation failed, falling back to regular pages");
                }
            }
        }
        platform::reserve_aligned(size, alignment, false, self.options.numa_node)
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.cache_start.is_null() {
            // Only the unused tail is ours to release without tracking every
            // carved-out page individually; carved pages are released by
            // their owning Segment through the OS directly when recycled.
            if state.cache_remaining_size > 0 {
                platform::free(state.cache_remaining_start, state.cache_remaining_size);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_hands_out_disjoint_regions() {
        let mut arena = Arena::new();
        assert!(arena.create(ArenaOptions {
            cache_capacity: 1024 * 1024,
            page_alignment: 65536,
            use_huge_pages: false,
            numa_node: -1,
        }));

        let a = arena.allocate(65536);
        let b = arena.allocate(65536);
        assert!(!a.is_null() && !b.is_null());
        assert_ne!(a, b);
        assert_eq!((a as usize) % 65536, 0);
        assert_eq!((b as usize) % 65536, 0);
    }

    #[test]
    fn allocate_grows_cache_when_exhausted() {
        let mut arena = Arena::new();
        assert!(arena.create(ArenaOptions {
            cache_capacity: 65536,
            page_alignment: 65536,
            use_huge_pages: false,
            numa_node: -1,
        }));

        let a = arena.allocate(65536);
        let b = arena.allocate(65536);
        assert!(!a.is_null() && !b.is_null());
    }

    #[test]
    fn metadata_allocator_is_page_aligned() {
        let ptr = MetadataAllocator::allocate(100);
        assert!(!ptr.is_null());
        assert_eq!((ptr as usize) % platform::page_size(), 0);
        MetadataAllocator::deallocate(ptr, 100);
    }
}
