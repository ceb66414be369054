// =============================================================================
// ShardMem — Architecture Abstraction
// =============================================================================
//
// The kernel core never touches CPU registers itself. Everything it needs
// from the platform goes through the `Cpu` trait:
//   - which core is executing (only meaningful with interrupts off)
//   - masking and unmasking interrupts on the current core
//   - which task is running (the owner of a sleep lock)
//   - giving up the core while waiting for a sleep lock
//
// A bare-metal port implements `Cpu` with CLI/STI and a per-core GS read.
// The `hosted` module implements it on top of OS threads.
// =============================================================================

#[cfg(feature = "std")]
pub mod hosted;

use core::marker::PhantomData;

/// The platform services the kernel core consumes.
///
/// All functions are associated functions: there is exactly one CPU
/// implementation per build, and the locks carry it as a type parameter.
pub trait Cpu: 'static {
    /// Index of the executing core, in `0..ncpu`.
    ///
    /// Only valid while interrupts are disabled. With interrupts on, the
    /// task may be moved to another core between the read and its use.
    fn id() -> usize;

    /// Whether interrupts are enabled on this core.
    fn intr_get() -> bool;

    /// Disable interrupts on this core.
    fn intr_off();

    /// Enable interrupts on this core.
    fn intr_on();

    /// Identity of the task currently running on this core. Never zero.
    fn task_id() -> usize;

    /// Give up the core to another runnable task.
    fn yield_now();
}

/// Interrupts-off section on the current core.
///
/// Saves the interrupt state on creation and disables interrupts; restores
/// the saved state on drop. Nested guards must be dropped in reverse order of
/// creation, which is what scoping gives for free.
///
/// The guard is tied to the core that created it and is therefore neither
/// `Send` nor `Sync`.
pub struct IrqGuard<C: Cpu> {
    was_enabled: bool,
    _cpu: PhantomData<C>,
    _not_send: PhantomData<*const ()>,
}

impl<C: Cpu> IrqGuard<C> {
    #[inline]
    pub fn new() -> Self {
        let was_enabled = C::intr_get();
        C::intr_off();
        Self {
            was_enabled,
            _cpu: PhantomData,
            _not_send: PhantomData,
        }
    }
}

impl<C: Cpu> Default for IrqGuard<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Cpu> Drop for IrqGuard<C> {
    #[inline]
    fn drop(&mut self) {
        if self.was_enabled {
            C::intr_on();
        }
    }
}
