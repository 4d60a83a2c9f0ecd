//! Public configuration surface for every façade. All defaults mirror the
//! ones the system is documented to ship with; nothing here reads
//! environment variables — overriding a field is the caller's job.

use crate::heap::BIN_COUNT;

/// Configuration for [`crate::arena::Arena`] construction.
#[derive(Clone, Copy, Debug)]
pub struct ArenaOptions {
    pub cache_capacity: usize,
    pub page_alignment: usize,
    pub use_huge_pages: bool,
    pub numa_node: i32,
}

impl Default for ArenaOptions {
    fn default() -> Self {
        ArenaOptions {
            cache_capacity: 1024 * 1024 * 64,
            page_alignment: 65536,
            use_huge_pages: false,
            numa_node: -1,
        }
    }
}

/// Configuration surface for [`crate::malloc::ScalableMalloc`].
#[derive(Clone, Debug)]
pub struct ScalableMallocOptions {
    // SIZES AND CAPACITIES
    pub arena_initial_size: usize,
    pub local_logical_page_counts_per_size_class: [usize; BIN_COUNT],
    pub central_logical_page_counts_per_size_class: [usize; BIN_COUNT],
    // RECYCLING AND GROWING
    pub page_recycling_threshold: usize,
    pub local_heaps_can_grow: bool,
    pub grow_coefficient: f64,
    // DEALLOCATION QUEUES
    pub deallocation_queues_processing_threshold: usize,
    pub recyclable_deallocation_queue_sizes: [usize; BIN_COUNT],
    pub non_recyclable_deallocation_queue_sizes: [usize; BIN_COUNT],
    // OTHERS
    pub use_huge_pages: bool,
    pub numa_node: i32,
    pub thread_local_cached_heap_count: usize,
    pub non_small_and_aligned_objects_map_size: usize,
}

impl Default for ScalableMallocOptions {
    fn default() -> Self {
        let page_counts = [1, 1, 1, 1, 1, 1, 1, 2, 4, 8, 16, 32, 8, 16, 32];
        ScalableMallocOptions {
            arena_initial_size: 2 * 1024 * 1024 * 1024,
            local_logical_page_counts_per_size_class: page_counts,
            central_logical_page_counts_per_size_class: page_counts,
            page_recycling_threshold: 10,
            local_heaps_can_grow: true,
            grow_coefficient: 2.0,
            deallocation_queues_processing_threshold: 409_600,
            recyclable_deallocation_queue_sizes: [65536; BIN_COUNT],
            non_recyclable_deallocation_queue_sizes: [65536; BIN_COUNT],
            use_huge_pages: false,
            numa_node: -1,
            thread_local_cached_heap_count: 0,
            non_small_and_aligned_objects_map_size: 655_360,
        }
    }
}

/// Configuration surface for [`crate::pool::ScalablePool`].
#[derive(Clone, Copy, Debug)]
pub struct ScalablePoolOptions {
    pub arena_initial_size: usize,
    pub central_pool_initial_size: usize,
    pub local_pool_initial_size: usize,
    pub local_pool_can_grow: bool,
    pub page_recycling_threshold: usize,
    pub grow_coefficient: f64,
    pub deallocation_queues_processing_threshold: usize,
    pub recyclable_deallocation_queue_size: usize,
    pub non_recyclable_deallocation_queue_size: usize,
    pub use_huge_pages: bool,
    pub numa_node: i32,
    pub thread_local_cached_heap_count: usize,
}

impl Default for ScalablePoolOptions {
    fn default() -> Self {
        ScalablePoolOptions {
            arena_initial_size: 1024 * 1024 * 64,
            central_pool_initial_size: 1024 * 1024 * 16,
            local_pool_initial_size: 1024 * 1024 * 32,
            local_pool_can_grow: true,
            page_recycling_threshold: 128,
            grow_coefficient: 2.0,
            deallocation_queues_processing_threshold: 409_600,
            recyclable_deallocation_queue_size: 65536,
            non_recyclable_deallocation_queue_size: 65536,
            use_huge_pages: false,
            numa_node: -1,
            thread_local_cached_heap_count: 0,
        }
    }
}

/// Configuration surface for [`crate::single_threaded::SingleThreadedAllocator`].
#[derive(Clone, Debug)]
pub struct SingleThreadedAllocatorOptions {
    pub arena_initial_size: usize,
    pub logical_page_counts_per_size_class: [usize; BIN_COUNT],
    pub page_recycling_threshold: usize,
    pub grow_coefficient: f64,
    pub deallocation_queue_processing_threshold: usize,
    pub deallocation_queue_sizes: [usize; BIN_COUNT],
    pub use_huge_pages: bool,
    pub numa_node: i32,
    pub non_small_objects_hash_map_size: usize,
}

impl Default for SingleThreadedAllocatorOptions {
    fn default() -> Self {
        SingleThreadedAllocatorOptions {
            arena_initial_size: 1024 * 1024 * 64,
            logical_page_counts_per_size_class: [1, 1, 1, 1, 1, 1, 1, 2, 4, 8, 16, 32, 8, 16, 32],
            page_recycling_threshold: 10,
            grow_coefficient: 2.0,
            deallocation_queue_processing_threshold: 409_600,
            deallocation_queue_sizes: [65536; BIN_COUNT],
            use_huge_pages: false,
            numa_node: -1,
            non_small_objects_hash_map_size: 655_360,
        }
    }
}
