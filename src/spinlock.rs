//! Cache-line-aligned test-and-set spinlock with pause-based backoff.
//!
//! Kept as a single concrete type rather than a `LockPolicy`-templated
//! family: the original's `Lockable<lock_policy>` collapses to a no-op for
//! `NO_LOCK`, which in Rust is better modeled by simply not holding a
//! `Spinlock` field at all in the no-lock specializations (see
//! [`crate::heap::HeapPow2`] local vs. central instantiation) than by a
//! generic lock type whose methods the optimizer must prove away.

use core::sync::atomic::{AtomicBool, Ordering};

const SPIN_LIMIT: u32 = 64;

#[repr(align(64))]
pub struct Spinlock {
    locked: AtomicBool,
}

impl Spinlock {
    pub const fn new() -> Self {
        Spinlock {
            locked: AtomicBool::new(false),
        }
    }

    pub fn lock(&self) {
        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }

            let mut spins = 0;
            while self.locked.load(Ordering::Relaxed) {
                if spins < SPIN_LIMIT {
                    core::hint::spin_loop();
                    spins += 1;
                } else {
                    std::thread::yield_now();
                }
            }
        }
    }

    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

impl Default for Spinlock {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard returned by [`Spinlock::lock`]-style call sites that want
/// scope-based unlock instead of manual `lock`/`unlock` pairing.
pub struct SpinlockGuard<'a> {
    lock: &'a Spinlock,
}

impl Spinlock {
    pub fn guard(&self) -> SpinlockGuard<'_> {
        self.lock();
        SpinlockGuard { lock: self }
    }
}

impl Drop for SpinlockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// Compile-time lock policy: [`NoLock`] for structures only ever touched by
/// a single owning thread (the local heap), [`Spinlock`] for structures
/// shared across threads (the central heap). Lets `HeapPow2`/`HeapPool` be
/// generic over locking discipline instead of branching on a runtime flag.
pub trait ConcurrencyGuard: Default {
    fn enter(&self);
    fn leave(&self);
}

#[derive(Default)]
pub struct NoLock;

impl ConcurrencyGuard for NoLock {
    #[inline(always)]
    fn enter(&self) {}
    #[inline(always)]
    fn leave(&self) {}
}

impl ConcurrencyGuard for Spinlock {
    fn enter(&self) {
        self.lock();
    }
    fn leave(&self) {
        self.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn mutual_exclusion_under_contention() {
        let lock = Arc::new(Spinlock::new());
        let counter = Arc::new(core::sync::atomic::AtomicU64::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        let _guard = lock.guard();
                        counter.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(counter.load(Ordering::Relaxed), 8000);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = Spinlock::new();
        lock.lock();
        assert!(!lock.try_lock());
        lock.unlock();
        assert!(lock.try_lock());
        lock.unlock();
    }
}
