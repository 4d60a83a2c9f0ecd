//! Two deallocation-queue disciplines shared by every heap: a
//! single-consumer [`BoundedQueue`] backed by an intrusive freelist for
//! local (thread-owned) heaps, and a lock-free ticket-based
//! [`MPMCBoundedQueue`] (Erik Rigtorp's MPMCQueue design) for the central
//! heap, where producers and the consumer can run on different threads.
//!
//! Both are bounded, fixed-capacity, and backed by
//! [`crate::arena::MetadataAllocator`] rather than the arena's bump cache —
//! queue buffers don't follow the same lifetime as logical pages.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::arena::MetadataAllocator;

struct FreelistNode<T> {
    next: *mut FreelistNode<T>,
    data: T,
}

/// Bounded, non-thread-safe queue of `u64`-sized values (pointers). Pushes
/// pop a node from an internal freelist; pops return the node to it. Used
/// for a local heap's own deallocation queues, which only that heap's
/// owning thread ever touches.
///
/// Exposes `try_push`/`try_pop` by shared reference (via `UnsafeCell`) so it
/// can implement the same [`DeallocQueue`] trait as the atomic
/// `MPMCBoundedQueue` — [`crate::heap::HeapPow2`] holds either kind behind
/// a plain `&self`. Soundness relies entirely on a local heap never being
/// reachable from more than one thread at a time, the same assumption its
/// owning `Segment` already makes.
pub struct BoundedQueue<T> {
    buffer: *mut u8,
    buffer_len: usize,
    free_head: UnsafeCell<*mut FreelistNode<T>>,
    used_head: UnsafeCell<*mut FreelistNode<T>>,
    capacity: usize,
}

unsafe impl<T: Send> Send for BoundedQueue<T> {}

impl<T: Copy> BoundedQueue<T> {
    pub const fn new() -> Self {
        BoundedQueue {
            buffer: core::ptr::null_mut(),
            buffer_len: 0,
            free_head: UnsafeCell::new(core::ptr::null_mut()),
            used_head: UnsafeCell::new(core::ptr::null_mut()),
            capacity: 0,
        }
    }

    pub fn create(&mut self, capacity: usize) -> bool {
        if capacity == 0 {
            return false;
        }
        let node_size = core::mem::size_of::<FreelistNode<T>>();
        let buffer_len = capacity * node_size;
        let buffer = MetadataAllocator::allocate(buffer_len);
        if buffer.is_null() {
            return false;
        }

        self.buffer = buffer;
        self.buffer_len = buffer_len;
        self.capacity = capacity;

        let mut head: *mut FreelistNode<T> = core::ptr::null_mut();
        for i in (0..capacity).rev() {
            let node = unsafe { buffer.add(i * node_size) as *mut FreelistNode<T> };
            unsafe { (*node).next = head };
            head = node;
        }
        *self.free_head.get_mut() = head;
        true
    }

    pub fn try_push(&self, value: T) -> bool {
        let free_head = unsafe { &mut *self.free_head.get() };
        if free_head.is_null() {
            return false;
        }
        let node = *free_head;
        let used_head = unsafe { &mut *self.used_head.get() };
        unsafe {
            *free_head = (*node).next;
            (*node).data = value;
            (*node).next = *used_head;
        }
        *used_head = node;
        true
    }

    pub fn try_pop(&self) -> Option<T> {
        let used_head = unsafe { &mut *self.used_head.get() };
        if used_head.is_null() {
            return None;
        }
        let node = *used_head;
        let free_head = unsafe { &mut *self.free_head.get() };
        unsafe {
            *used_head = (*node).next;
            let value = (*node).data;
            (*node).next = *free_head;
            *free_head = node;
            Some(value)
        }
    }
}

impl<T> Drop for BoundedQueue<T> {
    fn drop(&mut self) {
        if !self.buffer.is_null() {
            MetadataAllocator::deallocate(self.buffer, self.buffer_len);
        }
    }
}

/// Common interface `HeapPow2`/`HeapPool` use to push/pop deallocated
/// pointers, regardless of whether the concrete queue is the
/// single-consumer freelist version or the lock-free MPMC one.
pub trait DeallocQueue: Default {
    fn create(&mut self, capacity: usize) -> bool;
    fn try_push(&self, value: u64) -> bool;
    fn try_pop(&self) -> Option<u64>;
}

impl Default for BoundedQueue<u64> {
    fn default() -> Self {
        BoundedQueue::new()
    }
}

impl DeallocQueue for BoundedQueue<u64> {
    fn create(&mut self, capacity: usize) -> bool {
        BoundedQueue::create(self, capacity)
    }
    fn try_push(&self, value: u64) -> bool {
        BoundedQueue::try_push(self, value)
    }
    fn try_pop(&self) -> Option<u64> {
        BoundedQueue::try_pop(self)
    }
}

#[repr(align(64))]
struct Slot<T> {
    turn: AtomicUsize,
    storage: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Slot {
            turn: AtomicUsize::new(0),
            storage: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

/// Lock-free bounded MPMC queue used by the central heap's deallocation
/// queues, where a freeing thread and the allocating thread are never the
/// same one. Ticket-based: `turn` on each slot encodes which "lap" around
/// the ring the slot is ready for, so producers and the consumer never
/// need to CAS against each other's payload, only the shared head/tail
/// counters. `head` and `tail` each sit on their own cache line so
/// producers and the consumer don't false-share.
pub struct MPMCBoundedQueue<T> {
    capacity: usize,
    slots: *mut Slot<T>,
    buffer_len: usize,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
}

#[repr(align(64))]
struct CachePadded<T>(T);

unsafe impl<T: Send> Send for MPMCBoundedQueue<T> {}
unsafe impl<T: Send> Sync for MPMCBoundedQueue<T> {}

impl<T: Copy> MPMCBoundedQueue<T> {
    pub const fn new() -> Self {
        MPMCBoundedQueue {
            capacity: 0,
            slots: core::ptr::null_mut(),
            buffer_len: 0,
            head: CachePadded(AtomicUsize::new(0)),
            tail: CachePadded(AtomicUsize::new(0)),
        }
    }

    pub fn create(&mut self, capacity: usize) -> bool {
        if capacity < 1 {
            return false;
        }
        let slot_count = capacity + 1;
        let buffer_len = slot_count * core::mem::size_of::<Slot<T>>();
        let buffer = MetadataAllocator::allocate(buffer_len);
        if buffer.is_null() {
            return false;
        }
        if (buffer as usize) % core::mem::align_of::<Slot<T>>() != 0 {
            MetadataAllocator::deallocate(buffer, buffer_len);
            return false;
        }

        let slots = buffer as *mut Slot<T>;
        for i in 0..slot_count {
            unsafe { slots.add(i).write(Slot::new()) };
        }

        self.capacity = capacity;
        self.slots = slots;
        self.buffer_len = buffer_len;
        true
    }

    #[inline]
    fn modulo_capacity(&self, value: usize) -> usize {
        value % self.capacity
    }

    #[inline]
    fn turn(&self, index: usize) -> usize {
        index / self.capacity
    }

    pub fn try_push(&self, value: T) -> bool {
        let mut head = self.head.0.load(Ordering::Acquire);
        loop {
            let slot = unsafe { &*self.slots.add(self.modulo_capacity(head)) };
            if self.turn(head) * 2 == slot.turn.load(Ordering::Acquire) {
                if self
                    .head
                    .0
                    .compare_exchange(head, head + 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    unsafe { (*slot.storage.get()).write(value) };
                    slot.turn.store(self.turn(head) * 2 + 1, Ordering::Release);
                    return true;
                }
            } else {
                let prev = head;
                head = self.head.0.load(Ordering::Acquire);
                if head == prev {
                    return false;
                }
            }
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        let mut tail = self.tail.0.load(Ordering::Acquire);
        loop {
            let slot = unsafe { &*self.slots.add(self.modulo_capacity(tail)) };
            if self.turn(tail) * 2 + 1 == slot.turn.load(Ordering::Acquire) {
                if self
                    .tail
                    .0
                    .compare_exchange(tail, tail + 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    let value = unsafe { (*slot.storage.get()).assume_init() };
                    slot.turn.store(self.turn(tail) * 2 + 2, Ordering::Release);
                    return Some(value);
                }
            } else {
                let prev = tail;
                tail = self.tail.0.load(Ordering::Acquire);
                if tail == prev {
                    return None;
                }
            }
        }
    }

    pub fn size(&self) -> usize {
        self.head.0.load(Ordering::Relaxed) - self.tail.0.load(Ordering::Relaxed)
    }
}

impl<T> Drop for MPMCBoundedQueue<T> {
    fn drop(&mut self) {
        if !self.slots.is_null() {
            MetadataAllocator::deallocate(self.slots as *mut u8, self.buffer_len);
        }
    }
}

impl Default for MPMCBoundedQueue<u64> {
    fn default() -> Self {
        MPMCBoundedQueue::new()
    }
}

impl DeallocQueue for MPMCBoundedQueue<u64> {
    fn create(&mut self, capacity: usize) -> bool {
        MPMCBoundedQueue::create(self, capacity)
    }
    fn try_push(&self, value: u64) -> bool {
        MPMCBoundedQueue::try_push(self, value)
    }
    fn try_pop(&self) -> Option<u64> {
        MPMCBoundedQueue::try_pop(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_queue_respects_capacity() {
        let mut q: BoundedQueue<u64> = BoundedQueue::new();
        assert!(q.create(2));
        assert!(q.try_push(1));
        assert!(q.try_push(2));
        assert!(!q.try_push(3));
        assert_eq!(q.try_pop(), Some(2));
        assert_eq!(q.try_pop(), Some(1));
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn mpmc_queue_single_thread_round_trip() {
        let mut q: MPMCBoundedQueue<u64> = MPMCBoundedQueue::new();
        assert!(q.create(4));
        assert!(q.try_push(10));
        assert!(q.try_push(20));
        assert_eq!(q.try_pop(), Some(10));
        assert_eq!(q.try_pop(), Some(20));
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn mpmc_queue_concurrent_producers_no_pointer_lost() {
        use std::sync::Arc;
        use std::thread;

        let mut queue = MPMCBoundedQueue::new();
        assert!(queue.create(1024));
        let queue = Arc::new(queue);

        let producers: Vec<_> = (0..4u64)
            .map(|t| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..200u64 {
                        while !queue.try_push(t * 1000 + i) {
                            std::thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        for p in producers {
            p.join().unwrap();
        }

        let mut popped = Vec::new();
        while let Some(v) = queue.try_pop() {
            popped.push(v);
        }
        assert_eq!(popped.len(), 800);
    }
}
