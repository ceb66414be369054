// =============================================================================
// ShardMem — Kernel Synchronization Primitives
// =============================================================================
//
// Two kinds of lock:
//   spinlock:   short critical sections, busy-waits, interrupts off while held
//   sleeplock:  per-resource ownership across device I/O, yields while waiting
//
// LOCK ORDERING:
//   Sleep lock (buffer content) is never acquired while a spinlock is held.
//   Buffer cache shard locks: at most two at once on the lookup path. A
//     blocking acquisition of a second shard lock only happens in ascending
//     shard index order; an out-of-order second lock may only be attempted
//     with `try_lock`. `Bcache::census` is the one exception: it holds every
//     shard lock, taken in ascending index order.
//   Page pool locks: never nested. `kalloc` drops one pool lock before
//     taking the next.
//   No lock spans both the buffer cache and the page allocator.
//
// Violating these rules WILL deadlock on multi-core.
// =============================================================================

pub mod sleeplock;
pub mod spinlock;

pub use sleeplock::{SleepLock, SleepLockGuard};
pub use spinlock::{SpinLock, SpinLockGuard};
