//! Two key/value stores keyed by `u64` (pointer values), generic over the
//! value type, used by the façades to record bookkeeping for large,
//! aligned, or otherwise irregular allocations that don't carry enough
//! information in their own page header to be freed correctly.
//!
//! [`Dictionary`] is the plain single-threaded version; [`MPMCDictionary`]
//! is safe for concurrent lock-free reads concurrent with locked inserts,
//! under the narrow contract that a key is never searched for before its
//! insert has completed.

use core::sync::atomic::{AtomicPtr, Ordering};

use crate::arena::MetadataAllocator;
use crate::spinlock::Spinlock;
use crate::util::murmur_hash3_finalize;

#[derive(Clone, Copy)]
struct Node<V> {
    key: u64,
    value: V,
    next: *mut Node<V>,
}

impl<V: Default> Node<V> {
    fn empty() -> Self {
        Node { key: 0, value: V::default(), next: core::ptr::null_mut() }
    }
}

/// Separate-chaining hash table, not thread safe, doubling its table and
/// re-hashing every existing entry whenever the load factor hits 1.
pub struct Dictionary<V> {
    table: *mut *mut Node<V>,
    node_cache: *mut Node<V>,
    table_size: usize,
    item_count: usize,
}

unsafe impl<V: Send> Send for Dictionary<V> {}

impl<V: Copy + Default> Dictionary<V> {
    pub const fn new() -> Self {
        Dictionary {
            table: core::ptr::null_mut(),
            node_cache: core::ptr::null_mut(),
            table_size: 0,
            item_count: 0,
        }
    }

    pub fn initialise(&mut self, size: usize) -> bool {
        self.grow(size.max(1))
    }

    pub fn insert(&mut self, key: u64, value: V) -> bool {
        debug_assert!(self.table_size > 0 && !self.node_cache.is_null());

        if self.item_count == self.table_size {
            if !self.grow(self.table_size * 2) {
                return false;
            }
        }

        let index = self.modulo_table_size(murmur_hash3_finalize(key));
        let node = unsafe { self.node_cache.add(self.item_count) };
        unsafe {
            (*node).key = key;
            (*node).value = value;
            (*node).next = *self.table.add(index);
            *self.table.add(index) = node;
        }

        self.item_count += 1;
        true
    }

    pub fn get(&self, key: u64) -> Option<V> {
        if self.table_size == 0 {
            return None;
        }
        let index = self.modulo_table_size(murmur_hash3_finalize(key));
        let mut current = unsafe { *self.table.add(index) };
        while !current.is_null() {
            let node = unsafe { &*current };
            if node.key == key {
                return Some(node.value);
            }
            current = node.next;
        }
        None
    }

    fn modulo_table_size(&self, hash: u64) -> usize {
        (hash % self.table_size as u64) as usize
    }

    fn grow(&mut self, size: usize) -> bool {
        let new_node_cache = MetadataAllocator::allocate(size * core::mem::size_of::<Node<V>>()) as *mut Node<V>;
        if new_node_cache.is_null() {
            return false;
        }
        let new_table = MetadataAllocator::allocate(size * core::mem::size_of::<*mut Node<V>>()) as *mut *mut Node<V>;
        if new_table.is_null() {
            MetadataAllocator::deallocate(new_node_cache as *mut u8, size * core::mem::size_of::<Node<V>>());
            return false;
        }

        for i in 0..size {
            unsafe { *new_table.add(i) = core::ptr::null_mut() };
        }

        let mut copy_count = 0usize;
        if !self.table.is_null() {
            for i in 0..self.table_size {
                let mut current = unsafe { *self.table.add(i) };
                while !current.is_null() {
                    let old_node = unsafe { &*current };
                    let new_index = (murmur_hash3_finalize(old_node.key) % size as u64) as usize;

                    let new_node = unsafe { new_node_cache.add(copy_count) };
                    unsafe {
                        (*new_node).key = old_node.key;
                        (*new_node).value = old_node.value;
                        (*new_node).next = *new_table.add(new_index);
                        *new_table.add(new_index) = new_node;
                    }
                    copy_count += 1;
                    current = old_node.next;
                }
            }
        }

        for i in copy_count..size {
            unsafe { *new_node_cache.add(i) = Node::empty() };
        }

        self.destroy();
        self.table = new_table;
        self.node_cache = new_node_cache;
        self.table_size = size;
        true
    }

    fn destroy(&mut self) {
        if !self.table.is_null() {
            MetadataAllocator::deallocate(self.table as *mut u8, self.table_size * core::mem::size_of::<*mut Node<V>>());
        }
        if !self.node_cache.is_null() {
            MetadataAllocator::deallocate(self.node_cache as *mut u8, self.table_size * core::mem::size_of::<Node<V>>());
        }
    }
}

impl<V> Drop for Dictionary<V> {
    fn drop(&mut self) {
        self.destroy();
    }
}

struct AtomicNode<V> {
    key: u64,
    value: V,
    next: AtomicPtr<AtomicNode<V>>,
}

impl<V: Default> AtomicNode<V> {
    fn empty() -> Self {
        AtomicNode { key: 0, value: V::default(), next: AtomicPtr::new(core::ptr::null_mut()) }
    }
}

/// Fixed-capacity, no-grow, insert-rare/search-frequent hash table. Inserts
/// take a spinlock (no ABA risk, single writer at a time); reads walk
/// atomically-published chains lock-free. Never supports removal.
///
/// If the node cache is ever exhausted (shouldn't happen — capacity should
/// be sized for the expected number of irregular allocations in flight)
/// insert rebuilds a fresh node cache rather than growing the table, same
/// as the reference implementation; the old node cache is intentionally
/// leaked since entries already published into the table still point into
/// it and it is never safe to free while readers may be chasing those
/// pointers lock-free.
pub struct MPMCDictionary<V> {
    table: *mut AtomicPtr<AtomicNode<V>>,
    table_size: usize,
    insertion_lock: Spinlock,
    node_cache: AtomicPtr<AtomicNode<V>>,
    node_cache_index: core::cell::UnsafeCell<usize>,
    node_cache_capacity: usize,
}

unsafe impl<V: Send> Send for MPMCDictionary<V> {}
unsafe impl<V: Send> Sync for MPMCDictionary<V> {}

impl<V: Copy + Default> MPMCDictionary<V> {
    pub const fn new() -> Self {
        MPMCDictionary {
            table: core::ptr::null_mut(),
            table_size: 0,
            insertion_lock: Spinlock::new(),
            node_cache: AtomicPtr::new(core::ptr::null_mut()),
            node_cache_index: core::cell::UnsafeCell::new(0),
            node_cache_capacity: 0,
        }
    }

    pub fn initialise(&mut self, capacity: usize) -> bool {
        if capacity == 0 {
            return false;
        }
        self.node_cache_capacity = capacity;
        self.table_size = capacity;

        let table = MetadataAllocator::allocate(self.table_size * core::mem::size_of::<AtomicPtr<AtomicNode<V>>>())
            as *mut AtomicPtr<AtomicNode<V>>;
        if table.is_null() {
            return false;
        }
        for i in 0..self.table_size {
            unsafe { table.add(i).write(AtomicPtr::new(core::ptr::null_mut())) };
        }
        self.table = table;

        self.build_node_cache()
    }

    fn build_node_cache(&self) -> bool {
        let new_cache = MetadataAllocator::allocate(self.node_cache_capacity * core::mem::size_of::<AtomicNode<V>>())
            as *mut AtomicNode<V>;
        if new_cache.is_null() {
            return false;
        }
        for i in 0..self.node_cache_capacity {
            unsafe { new_cache.add(i).write(AtomicNode::empty()) };
        }
        self.node_cache.store(new_cache, Ordering::Relaxed);
        unsafe { *self.node_cache_index.get() = 0 };
        true
    }

    pub fn insert(&self, key: u64, value: V) -> bool {
        debug_assert!(!self.table.is_null() && self.table_size > 0);

        self.insertion_lock.lock();

        let index = unsafe { *self.node_cache_index.get() };
        if index >= self.node_cache_capacity {
            if !self.build_node_cache() {
                self.insertion_lock.unlock();
                return false;
            }
        }
        let index = unsafe { *self.node_cache_index.get() };

        let cache = self.node_cache.load(Ordering::Relaxed);
        let new_node = unsafe { cache.add(index) };
        unsafe {
            (*new_node).key = key;
            (*new_node).value = value;
        }

        let bucket = self.hash(key);
        let slot = unsafe { &*self.table.add(bucket) };
        let mut old_head = slot.load(Ordering::Relaxed);
        loop {
            unsafe { (*new_node).next.store(old_head, Ordering::Relaxed) };
            match slot.compare_exchange_weak(old_head, new_node, Ordering::Release, Ordering::Relaxed) {
                Ok(_) => break,
                Err(actual) => old_head = actual,
            }
        }

        unsafe { *self.node_cache_index.get() = index + 1 };
        self.insertion_lock.unlock();
        true
    }

    pub fn get(&self, key: u64) -> Option<V> {
        if self.table.is_null() || self.table_size == 0 {
            return None;
        }
        let bucket = self.hash(key);
        let slot = unsafe { &*self.table.add(bucket) };
        let mut current = slot.load(Ordering::Acquire);
        while !current.is_null() {
            let node = unsafe { &*current };
            if node.key == key {
                return Some(node.value);
            }
            current = node.next.load(Ordering::Acquire);
        }
        None
    }

    fn hash(&self, key: u64) -> usize {
        (murmur_hash3_finalize(key) % self.table_size as u64) as usize
    }
}

impl<V> Drop for MPMCDictionary<V> {
    fn drop(&mut self) {
        let cache = self.node_cache.load(Ordering::Relaxed);
        if !cache.is_null() {
            MetadataAllocator::deallocate(cache as *mut u8, self.node_cache_capacity * core::mem::size_of::<AtomicNode<V>>());
        }
        if !self.table.is_null() {
            MetadataAllocator::deallocate(self.table as *mut u8, self.table_size * core::mem::size_of::<AtomicPtr<AtomicNode<V>>>());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dictionary_insert_get_and_grow() {
        let mut dict: Dictionary<usize> = Dictionary::new();
        assert!(dict.initialise(2));
        for i in 0..20u64 {
            assert!(dict.insert(i, (i * 10) as usize));
        }
        for i in 0..20u64 {
            assert_eq!(dict.get(i), Some((i * 10) as usize));
        }
        assert_eq!(dict.get(999), None);
    }

    #[test]
    fn mpmc_dictionary_insert_then_concurrent_reads() {
        use std::sync::Arc;
        use std::thread;

        let mut dict: MPMCDictionary<usize> = MPMCDictionary::new();
        assert!(dict.initialise(256));
        for i in 0..200u64 {
            assert!(dict.insert(i, (i * 2) as usize));
        }
        let dict = Arc::new(dict);

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let dict = Arc::clone(&dict);
                thread::spawn(move || {
                    for i in 0..200u64 {
                        assert_eq!(dict.get(i), Some((i * 2) as usize));
                    }
                })
            })
            .collect();

        for r in readers {
            r.join().unwrap();
        }
    }

    #[test]
    fn dictionary_supports_multi_field_values() {
        #[derive(Clone, Copy, Default, PartialEq, Debug)]
        struct Metadata {
            size: usize,
            padding_bytes: usize,
        }

        let mut dict: Dictionary<Metadata> = Dictionary::new();
        assert!(dict.initialise(4));
        assert!(dict.insert(0x1000, Metadata { size: 256, padding_bytes: 8 }));
        assert_eq!(dict.get(0x1000), Some(Metadata { size: 256, padding_bytes: 8 }));
    }
}
