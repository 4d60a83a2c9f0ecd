//! A segment owns a doubly-linked ring of same-size-class [`LogicalPage`]s
//! carved out of an [`Arena`]. Allocation walks the ring next-fit-style
//! starting from the last page that satisfied a request; deallocation
//! recovers a page header directly from the freed pointer and recycles the
//! page once it's empty and the segment holds more pages than its
//! recycling threshold.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::arena::Arena;
use crate::page::{self, LogicalPage, LogicalPageHeader};
use crate::platform;

/// Central-heap segments get ids offset past this value so that ids stay
/// globally unique across the local/central split even though each side
/// counts independently.
const CENTRAL_ID_OFFSET: u32 = 32768;

static LOCAL_SEGMENT_ID_COUNTER: AtomicU32 = AtomicU32::new(0);
static CENTRAL_SEGMENT_ID_COUNTER: AtomicU32 = AtomicU32::new(0);

#[derive(Clone, Copy, Debug)]
pub struct SegmentCreationParameters {
    pub logical_page_size: usize,
    pub logical_page_count: usize,
    pub page_recycling_threshold: usize,
    pub size_class: u32,
    pub grow_coefficient: f64,
    pub can_grow: bool,
}

impl Default for SegmentCreationParameters {
    fn default() -> Self {
        SegmentCreationParameters {
            logical_page_size: 65536,
            logical_page_count: 1,
            page_recycling_threshold: 10,
            size_class: 16,
            grow_coefficient: 2.0,
            can_grow: true,
        }
    }
}

/// A segment's locking discipline: local-heap segments are only ever
/// touched by their owning thread, central-heap segments are shared and
/// their callers take the heap-level spinlock before mutating them.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SegmentKind {
    Local,
    Central,
}

pub struct Segment {
    kind: SegmentKind,
    id: u32,
    arena: *const Arena,
    params: SegmentCreationParameters,
    head: *mut LogicalPageHeader,
    tail: *mut LogicalPageHeader,
    last_used: *mut LogicalPageHeader,
    page_count: usize,
}

unsafe impl Send for Segment {}

impl Segment {
    pub const fn new(kind: SegmentKind) -> Self {
        Segment {
            kind,
            id: 0,
            arena: core::ptr::null(),
            params: SegmentCreationParameters {
                logical_page_size: 65536,
                logical_page_count: 1,
                page_recycling_threshold: 10,
                size_class: 16,
                grow_coefficient: 2.0,
                can_grow: true,
            },
            head: core::ptr::null_mut(),
            tail: core::ptr::null_mut(),
            last_used: core::ptr::null_mut(),
            page_count: 0,
        }
    }

    pub fn create(&mut self, buffer: *mut u8, arena: &Arena, params: SegmentCreationParameters) -> bool {
        if buffer.is_null() || params.logical_page_count == 0 || params.size_class == 0 {
            return false;
        }

        self.id = match self.kind {
            SegmentKind::Local => LOCAL_SEGMENT_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            SegmentKind::Central => CENTRAL_ID_OFFSET + CENTRAL_SEGMENT_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
        };
        self.arena = arena as *const Arena;
        self.params = params;

        self.grow(buffer, params.logical_page_count);
        true
    }

    pub fn get_id(&self) -> u32 {
        self.id
    }

    pub fn get_logical_page_count(&self) -> usize {
        self.page_count
    }

    pub fn get_head_logical_page(&self) -> *mut LogicalPageHeader {
        self.head
    }

    /// Returns the header for any pointer previously handed out by a
    /// segment using `logical_page_size`.
    pub unsafe fn get_logical_page_from_address(ptr: *const u8, logical_page_size: usize) -> *mut LogicalPageHeader {
        page::header_from_pointer(ptr, logical_page_size)
    }

    pub unsafe fn get_size_class_from_address(ptr: *const u8, logical_page_size: usize) -> u32 {
        (*Self::get_logical_page_from_address(ptr, logical_page_size)).size_class
    }

    pub unsafe fn get_segment_id_from_address(ptr: *const u8, logical_page_size: usize) -> u32 {
        (*Self::get_logical_page_from_address(ptr, logical_page_size)).segment_id as u32
    }

    pub fn owns_pointer(&self, ptr: *const u8) -> bool {
        let id = unsafe { Self::get_segment_id_from_address(ptr, self.params.logical_page_size) };
        id == self.id
    }

    pub fn allocate(&mut self, size: usize) -> *mut u8 {
        if let Some(ptr) = self.allocate_next_fit(size) {
            return ptr;
        }
        if self.params.can_grow {
            if let Some(ptr) = self.allocate_by_growing(size) {
                return ptr;
            }
        }
        core::ptr::null_mut()
    }

    fn allocate_next_fit(&mut self, size: usize) -> Option<*mut u8> {
        let start = if self.last_used.is_null() { self.head } else { self.last_used };
        if start.is_null() {
            return None;
        }

        let mut current = start;
        loop {
            let mut page = unsafe { LogicalPage::from_header(current) };
            if let Some(ptr) = page.allocate(size) {
                self.last_used = current;
                return Some(ptr.as_ptr());
            }

            let next = page.next();
            current = if next == 0 { self.head } else { next as *mut LogicalPageHeader };

            if current == start {
                return None;
            }
        }
    }

    fn allocate_by_growing(&mut self, size: usize) -> Option<*mut u8> {
        let minimum_new_page_count = self.get_required_page_count_for_allocation(size);
        let mut new_page_count = ((self.page_count as f64) * self.params.grow_coefficient) as usize;
        if new_page_count < minimum_new_page_count {
            new_page_count = minimum_new_page_count;
        }

        let arena = unsafe { &*self.arena };
        let mut buffer = arena.allocate_aligned(new_page_count * self.params.logical_page_size, self.params.logical_page_size);

        if buffer.is_null() && new_page_count > minimum_new_page_count {
            // Growth at the configured coefficient didn't fit in the arena;
            // retry with exactly the minimum this allocation needs.
            new_page_count = minimum_new_page_count;
            buffer = arena.allocate_aligned(new_page_count * self.params.logical_page_size, self.params.logical_page_size);
        }

        if buffer.is_null() {
            return None;
        }

        self.grow(buffer, new_page_count);
        self.allocate_next_fit(size)
    }

    fn get_required_page_count_for_allocation(&self, size: usize) -> usize {
        let usable = self.params.logical_page_size - page::HEADER_SIZE;
        if size <= usable {
            1
        } else {
            (size + page::HEADER_SIZE + self.params.logical_page_size - 1) / self.params.logical_page_size
        }
    }

    /// Places `count` new logical pages at page-aligned offsets of
    /// `buffer` and appends them to the tail of the ring.
    fn grow(&mut self, buffer: *mut u8, count: usize) {
        for i in 0..count {
            let page_buffer = unsafe { buffer.add(i * self.params.logical_page_size) };
            let page = unsafe {
                LogicalPage::create(page_buffer, self.params.logical_page_size, self.params.size_class, self.id as u16)
            };
            let Some(page) = page else { continue };
            self.add_logical_page(page);
        }
    }

    fn add_logical_page(&mut self, mut page: LogicalPage) {
        let header = page.header_ptr();

        if self.head.is_null() {
            self.head = header;
            self.tail = header;
            page.set_next(0);
            page.set_prev(0);
        } else {
            page.set_prev(self.tail as u64);
            page.set_next(0);
            unsafe { (*self.tail).next_logical_page_ptr = header as u64 };
            self.tail = header;
        }

        if self.last_used.is_null() {
            self.last_used = header;
        }

        self.page_count += 1;
    }

    pub unsafe fn deallocate(&mut self, ptr: *mut u8) {
        let header = page::header_from_pointer(ptr, self.params.logical_page_size);
        let mut page = LogicalPage::from_header(header);
        page.deallocate(ptr);

        if page.can_be_recycled() && self.page_count > self.params.page_recycling_threshold {
            self.recycle_logical_page(header);
        }
    }

    /// Unlinks an empty page from the ring and decommits its backing
    /// memory (the virtual address range stays reserved; the arena only
    /// ever gives back the unused tail of its own cache, never interior
    /// carved-out ranges).
    fn recycle_logical_page(&mut self, header: *mut LogicalPageHeader) {
        self.remove_logical_page(header);
        let page_size = self.params.logical_page_size;
        platform::decommit(header as *mut u8, page_size);
        self.page_count -= 1;
    }

    fn remove_logical_page(&mut self, header: *mut LogicalPageHeader) {
        let page = unsafe { LogicalPage::from_header(header) };
        let prev = page.prev();
        let next = page.next();

        if prev != 0 {
            unsafe { (*(prev as *mut LogicalPageHeader)).next_logical_page_ptr = next };
        } else if self.head == header {
            self.head = if next != 0 { next as *mut LogicalPageHeader } else { core::ptr::null_mut() };
        }

        if next != 0 {
            unsafe { (*(next as *mut LogicalPageHeader)).prev_logical_page_ptr = prev };
        } else if self.tail == header {
            self.tail = if prev != 0 { prev as *mut LogicalPageHeader } else { core::ptr::null_mut() };
        }

        if self.last_used == header {
            self.last_used = if !self.head.is_null() { self.head } else { core::ptr::null_mut() };
        }
    }

    /// Appends a whole ring of pages (starting at `head`, from another
    /// segment of the same size class) onto this segment's own ring. Used
    /// by the thread-exit hook to hand a departing thread's live pages to
    /// the central heap instead of leaking them.
    pub fn transfer_logical_pages_from(&mut self, head: *mut LogicalPageHeader) {
        let mut current = head;
        while !current.is_null() {
            let next = unsafe { (*current).next_logical_page_ptr };
            unsafe { (*current).segment_id = self.id as u16 };

            let mut page = unsafe { LogicalPage::from_header(current) };
            page.set_prev(0);
            page.set_next(0);
            self.add_logical_page(page);

            current = if next == 0 { core::ptr::null_mut() } else { next as *mut LogicalPageHeader };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ArenaOptions;

    fn make_segment(page_recycling_threshold: usize) -> (Box<Arena>, Segment) {
        let mut arena = Box::new(Arena::new());
        assert!(arena.create(ArenaOptions {
            cache_capacity: 1024 * 1024,
            page_alignment: 65536,
            use_huge_pages: false,
            numa_node: -1,
        }));

        let mut segment = Segment::new(SegmentKind::Local);
        let buffer = arena.allocate(65536 * 4);
        assert!(segment.create(
            buffer,
            &arena,
            SegmentCreationParameters {
                logical_page_size: 65536,
                logical_page_count: 4,
                page_recycling_threshold,
                size_class: 2048,
                grow_coefficient: 2.0,
                can_grow: true,
            }
        ));
        (arena, segment)
    }

    #[test]
    fn allocate_and_deallocate_round_trips() {
        let (_arena, mut segment) = make_segment(10);
        let ptr = segment.allocate(2048);
        assert!(!ptr.is_null());
        assert!(segment.owns_pointer(ptr));
        unsafe { segment.deallocate(ptr) };
    }

    #[test]
    fn page_recycles_below_threshold() {
        // Mirrors the S6-style scenario: threshold 1, so an emptied page on
        // a segment holding more than one page gets recycled.
        let (_arena, mut segment) = make_segment(1);
        assert_eq!(segment.get_logical_page_count(), 4);

        let slots_per_page = (65536 - page::HEADER_SIZE) / 2048;
        let mut pointers = Vec::new();
        for _ in 0..slots_per_page {
            pointers.push(segment.allocate(2048));
        }

        for ptr in pointers {
            unsafe { segment.deallocate(ptr) };
        }

        assert_eq!(segment.get_logical_page_count(), 3);
    }

    #[test]
    fn grows_when_out_of_pages() {
        let (_arena, mut segment) = make_segment(10);
        let slots_per_page = (65536 - page::HEADER_SIZE) / 2048;
        let total_slots = slots_per_page * 4;

        let mut pointers = Vec::new();
        for _ in 0..total_slots {
            let ptr = segment.allocate(2048);
            assert!(!ptr.is_null());
            pointers.push(ptr);
        }

        // Next allocation should trigger growth rather than fail.
        let grown = segment.allocate(2048);
        assert!(!grown.is_null());
        assert!(segment.get_logical_page_count() > 4);
    }
}
