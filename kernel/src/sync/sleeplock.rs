// =============================================================================
// ShardMem — Sleep Lock
// =============================================================================
//
// A long-term lock for a single resource, held across device I/O.
//
// Unlike `SpinLock`, a contending task does not burn its core: it gives the
// core away with `Cpu::yield_now()` and checks again when it is scheduled.
// Interrupts stay enabled while a sleep lock is held or awaited.
//
// FAIRNESS:
//   Same ticket scheme as the spinlock. A waiter's turn comes after every
//   waiter that arrived before it, so no waiter starves.
//
// OWNERSHIP:
//   The lock records the task id of its holder. `holding()` answers "does the
//   current task own this lock", which is how callers reject a release or a
//   write-back from a task that never acquired the lock.
//
// =============================================================================

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::arch::Cpu;

/// `holder` value while the lock is free. Task ids are never zero.
const NO_HOLDER: usize = 0;

/// A FIFO blocking lock that records its holder.
pub struct SleepLock<T, C: Cpu> {
    next_ticket: AtomicU32,
    now_serving: AtomicU32,
    holder: AtomicUsize,
    name: &'static str,
    data: UnsafeCell<T>,
    _cpu: PhantomData<fn() -> C>,
}

// SAFETY: only the holder touches `data`.
unsafe impl<T: Send, C: Cpu> Send for SleepLock<T, C> {}
unsafe impl<T: Send, C: Cpu> Sync for SleepLock<T, C> {}

impl<T, C: Cpu> SleepLock<T, C> {
    pub const fn new(name: &'static str, value: T) -> Self {
        Self {
            next_ticket: AtomicU32::new(0),
            now_serving: AtomicU32::new(0),
            holder: AtomicUsize::new(NO_HOLDER),
            name,
            data: UnsafeCell::new(value),
            _cpu: PhantomData,
        }
    }

    /// Block until the current task holds the lock.
    ///
    /// # Panics
    /// Panics if the current task already holds it.
    pub fn acquire(&self) {
        debug_assert!(C::intr_get(), "acquiresleep: {} with interrupts off", self.name);
        let me = C::task_id();
        if self.holder.load(Ordering::Relaxed) == me {
            panic!("acquiresleep: {} already held by this task", self.name);
        }

        let my_ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        while self.now_serving.load(Ordering::Acquire) != my_ticket {
            C::yield_now();
        }
        self.holder.store(me, Ordering::Relaxed);
    }

    /// Release the lock and admit the next waiter.
    ///
    /// # Panics
    /// Panics if the current task does not hold the lock.
    pub fn release(&self) {
        if !self.holding() {
            panic!("releasesleep: {} not held by this task", self.name);
        }
        self.holder.store(NO_HOLDER, Ordering::Relaxed);
        self.now_serving.fetch_add(1, Ordering::Release);
    }

    /// Whether the current task holds the lock.
    pub fn holding(&self) -> bool {
        self.holder.load(Ordering::Relaxed) == C::task_id()
    }

    pub fn is_locked(&self) -> bool {
        self.next_ticket.load(Ordering::Relaxed) != self.now_serving.load(Ordering::Relaxed)
    }

    /// Acquire the lock for the lifetime of the returned guard.
    pub fn lock(&self) -> SleepLockGuard<'_, T, C> {
        self.acquire();
        SleepLockGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Raw access to the protected value.
    ///
    /// # Safety
    /// The caller must hold the lock for as long as it uses the pointer, and
    /// must not create overlapping `&mut` references through it.
    pub unsafe fn data_ptr(&self) -> *mut T {
        self.data.get()
    }
}

/// RAII guard for a held [`SleepLock`]. Released on drop by the task that
/// took it, so the guard cannot leave that task.
pub struct SleepLockGuard<'a, T, C: Cpu> {
    lock: &'a SleepLock<T, C>,
    _not_send: PhantomData<*const ()>,
}

impl<T, C: Cpu> Deref for SleepLockGuard<'_, T, C> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves the current task holds the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T, C: Cpu> DerefMut for SleepLockGuard<'_, T, C> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves the current task holds the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T, C: Cpu> Drop for SleepLockGuard<'_, T, C> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier, Mutex};
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::arch::hosted::HostCpu;

    type Lock<T> = SleepLock<T, HostCpu>;

    #[test]
    fn holder_is_the_acquiring_task() {
        let lock = Arc::new(Lock::new("buffer", 0u32));
        lock.acquire();
        assert!(lock.holding());
        assert!(lock.is_locked());

        let other = Arc::clone(&lock);
        let seen = thread::spawn(move || other.holding()).join().unwrap();
        assert!(!seen);

        lock.release();
        assert!(!lock.holding());
        assert!(!lock.is_locked());
    }

    #[test]
    fn release_from_another_task_panics() {
        let lock = Arc::new(Lock::new("buffer", ()));
        lock.acquire();
        let other = Arc::clone(&lock);
        let result = thread::spawn(move || other.release()).join();
        assert!(result.is_err());
        // Still ours.
        assert!(lock.holding());
        lock.release();
    }

    #[test]
    #[should_panic(expected = "acquiresleep")]
    fn reacquire_panics() {
        let lock = Lock::new("buffer", ());
        lock.acquire();
        lock.acquire();
    }

    #[test]
    fn waiters_are_admitted_in_arrival_order() {
        let lock = Arc::new(Lock::new("buffer", ()));
        let order = Arc::new(Mutex::new(Vec::new()));
        lock.acquire();

        let mut handles = Vec::new();
        for i in 0..4 {
            let waiter = Arc::clone(&lock);
            let order = Arc::clone(&order);
            handles.push(thread::spawn(move || {
                let _g = waiter.lock();
                order.lock().unwrap().push(i);
            }));
            // Let waiter `i` take its ticket before the next one arrives.
            while lock.next_ticket.load(Ordering::Relaxed) < i + 2 {
                thread::sleep(Duration::from_millis(1));
            }
        }

        lock.release();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn guard_serializes_updates() {
        let lock = Arc::new(Lock::new("counter", 0u64));
        let start = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let start = Arc::clone(&start);
                thread::spawn(move || {
                    start.wait();
                    for _ in 0..1_000 {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 4_000);
    }
}
