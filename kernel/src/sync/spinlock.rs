// =============================================================================
// ShardMem — Ticket Spinlock
// =============================================================================
//
// A ticket spinlock provides mutual exclusion for short critical sections:
// the buffer cache shard lists and the page pool free-lists.
//
// HOW IT WORKS:
//   - Two counters: `next_ticket` and `now_serving`
//   - To lock: atomically increment `next_ticket`, get your ticket number.
//     Spin until `now_serving` equals your ticket.
//   - To unlock: increment `now_serving`, which lets the next waiter proceed.
//
// Waiters are served in arrival order, so no core starves.
//
// IRQ SAFETY:
//   Interrupts are disabled on the current core BEFORE taking a ticket and
//   stay disabled until the guard is dropped. Otherwise a timer interrupt on
//   the holder's core could switch to a task that spins on the same lock,
//   and the holder would never run again to release it.
//
// RULES FOR HOLDERS:
//   - Never block while holding a spinlock: no device I/O, no sleep lock.
//   - Guards of nested locks must be dropped in reverse acquisition order so
//     the saved interrupt state unwinds correctly.
//
// =============================================================================

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::arch::{Cpu, IrqGuard};

/// `owner` value while nobody holds the lock.
const NO_OWNER: usize = usize::MAX;

/// A ticket-based spinlock that disables interrupts while held.
///
/// # Type Parameters
/// - `T`: The data protected by the lock. Must be `Send` because ownership
///   effectively transfers between cores when the lock is acquired.
/// - `C`: The platform, used for interrupt masking and core identity.
pub struct SpinLock<T, C: Cpu> {
    /// The next ticket to be dispensed (atomically incremented by each locker).
    next_ticket: AtomicU32,

    /// The ticket number currently being served (incremented on unlock).
    now_serving: AtomicU32,

    /// Core and task holding the lock, for `holding()`. Only written by the
    /// holder. The task is recorded too because on a hosted platform several
    /// tasks may report the same core id.
    owner: AtomicUsize,
    owner_task: AtomicUsize,

    /// Short name used in diagnostics.
    name: &'static str,

    data: UnsafeCell<T>,

    _cpu: PhantomData<fn() -> C>,
}

// SAFETY: the lock ensures that only one core accesses T at a time.
unsafe impl<T: Send, C: Cpu> Send for SpinLock<T, C> {}
unsafe impl<T: Send, C: Cpu> Sync for SpinLock<T, C> {}

impl<T, C: Cpu> SpinLock<T, C> {
    /// Creates a new, unlocked spinlock wrapping the given value.
    pub const fn new(name: &'static str, value: T) -> Self {
        Self {
            next_ticket: AtomicU32::new(0),
            now_serving: AtomicU32::new(0),
            owner: AtomicUsize::new(NO_OWNER),
            owner_task: AtomicUsize::new(NO_OWNER),
            name,
            data: UnsafeCell::new(value),
            _cpu: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Acquires the lock, disabling interrupts on the current core.
    ///
    /// # Panics
    /// Panics if the current core already holds this lock; spinning would
    /// never end.
    pub fn lock(&self) -> SpinLockGuard<'_, T, C> {
        let irq = IrqGuard::new();
        if self.held_here() {
            panic!("acquire: {} already held by this core", self.name);
        }

        // Relaxed is enough for taking a ticket; the Acquire load in the
        // spin loop orders our accesses after the previous holder's.
        let my_ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        while self.now_serving.load(Ordering::Acquire) != my_ticket {
            core::hint::spin_loop();
        }

        self.set_owner();
        SpinLockGuard { lock: self, _irq: irq }
    }

    /// Attempts to acquire the lock without spinning.
    ///
    /// Returns `None` if the lock is currently held by anyone, including the
    /// current core. The buffer cache uses this to probe sibling shards while
    /// it already holds its home shard.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T, C>> {
        let irq = IrqGuard::new();

        let current = self.now_serving.load(Ordering::Relaxed);
        // Take the next ticket only if it is the one being served, meaning
        // the lock is free.
        let taken = self
            .next_ticket
            .compare_exchange(
                current,
                current.wrapping_add(1),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok();

        if taken {
            self.set_owner();
            Some(SpinLockGuard { lock: self, _irq: irq })
        } else {
            // `irq` drops here and restores the interrupt state.
            None
        }
    }

    /// Whether any core holds the lock right now.
    ///
    /// The answer may be stale by the time the caller looks at it.
    pub fn is_locked(&self) -> bool {
        self.next_ticket.load(Ordering::Relaxed) != self.now_serving.load(Ordering::Relaxed)
    }

    /// Whether the current core holds the lock.
    pub fn holding(&self) -> bool {
        let _irq = IrqGuard::<C>::new();
        self.held_here()
    }

    /// Caller must have interrupts disabled.
    fn held_here(&self) -> bool {
        self.is_locked()
            && self.owner.load(Ordering::Relaxed) == C::id()
            && self.owner_task.load(Ordering::Relaxed) == C::task_id()
    }

    fn set_owner(&self) {
        self.owner.store(C::id(), Ordering::Relaxed);
        self.owner_task.store(C::task_id(), Ordering::Relaxed);
    }

    /// Returns a mutable reference to the underlying data.
    ///
    /// `&mut self` guarantees exclusive access at compile time, so no lock
    /// is needed. Used during bootstrap before the lock is shared.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

/// RAII guard for a held spinlock.
///
/// While this guard exists the holder has exclusive access to the data and
/// interrupts are disabled on the holder's core. Dropping it releases the
/// lock and then restores the interrupt state.
pub struct SpinLockGuard<'a, T, C: Cpu> {
    lock: &'a SpinLock<T, C>,
    _irq: IrqGuard<C>,
}

impl<T, C: Cpu> Deref for SpinLockGuard<'_, T, C> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: We hold the lock, so we have exclusive access.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T, C: Cpu> DerefMut for SpinLockGuard<'_, T, C> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: We hold the lock, so we have exclusive access.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T, C: Cpu> Drop for SpinLockGuard<'_, T, C> {
    fn drop(&mut self) {
        self.lock.owner.store(NO_OWNER, Ordering::Relaxed);
        self.lock.owner_task.store(NO_OWNER, Ordering::Relaxed);
        // Release ordering publishes our writes to the protected data
        // before the next ticket holder observes `now_serving`.
        self.lock.now_serving.fetch_add(1, Ordering::Release);
        // `_irq` is dropped after this, re-enabling interrupts if they were
        // enabled when the lock was taken.
    }
}
