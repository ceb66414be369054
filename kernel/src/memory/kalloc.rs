//! Physical page allocator with one free-list per core.
//!
//! Every page of the managed region is, at any instant, either on exactly one
//! pool's free-list or owned by exactly one caller.
//!
//! **Fast path**: a core pops from its own pool; only that pool's lock is
//! taken. **Stealing**: when the local pool is empty, the other pools are
//! probed round-robin, one lock at a time, and the first page found is handed
//! straight to the caller. Freed pages always go to the freeing core's pool.
//!
//! Running out of pages is an ordinary condition: `kalloc` returns `None`
//! and the caller fails that one request.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ptr::NonNull;

use bitflags::bitflags;
use log::{debug, info, warn};

use super::address::PhysAddr;
use crate::arch::{Cpu, IrqGuard};
use crate::param::{NCPU, PGSIZE};
use crate::sync::SpinLock;

/// Fill byte for pages on a free-list, to catch dangling references.
pub const JUNK_ON_FREE: u8 = 0x01;

/// Fill byte for freshly allocated pages, so callers never see stale data.
pub const JUNK_ON_ALLOC: u8 = 0x05;

bitflags! {
    /// Modifiers for [`Kmem::kalloc_flags`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AllocFlags: u32 {
        /// Zero the page instead of filling it with junk.
        const ZERO = 1 << 0;
        /// Only look in the current core's pool.
        const LOCAL_ONLY = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KmemConfig {
    /// Number of per-core pools. Every core id must be below this.
    pub ncpu: usize,
}

impl Default for KmemConfig {
    fn default() -> Self {
        Self { ncpu: NCPU }
    }
}

/// Counters for one pool, as seen by [`Kmem::census`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Pages currently on the free-list.
    pub free: usize,
    /// Pages handed out from this pool, to any core.
    pub allocs: u64,
    /// Pages freed into this pool.
    pub frees: u64,
    /// Pages handed out from this pool to another core.
    pub stolen: u64,
    /// Times another core took this pool's lock.
    pub remote_probes: u64,
}

/// Free-list link, stored in the first bytes of each free page.
#[repr(C)]
struct Run {
    next: Option<NonNull<Run>>,
}

/// LIFO list of free pages, linked through the pages themselves.
struct FreeList {
    head: Option<NonNull<Run>>,
    stats: PoolStats,
}

// Safety: the list is only reached through its pool's spinlock, and the pages
// it links are owned by the pool, not by any core.
unsafe impl Send for FreeList {}

impl FreeList {
    const fn new() -> Self {
        Self {
            head: None,
            stats: PoolStats {
                free: 0,
                allocs: 0,
                frees: 0,
                stolen: 0,
                remote_probes: 0,
            },
        }
    }

    /// # Safety
    /// `pa` must be a page of the managed region that nobody else owns.
    unsafe fn push(&mut self, pa: PhysAddr) {
        let run = pa.as_mut_ptr::<Run>();
        // SAFETY: the page is ours and large enough for a `Run`.
        unsafe { run.write(Run { next: self.head }) };
        self.head = NonNull::new(run);
        self.stats.free += 1;
    }

    fn pop(&mut self) -> Option<PhysAddr> {
        let run = self.head?;
        // SAFETY: every run on the list was written by `push`.
        self.head = unsafe { run.as_ref().next };
        self.stats.free -= 1;
        Some(PhysAddr::new(run.as_ptr() as u64))
    }
}

/// The per-core page pools.
pub struct Kmem<C: Cpu> {
    pools: Box<[SpinLock<FreeList, C>]>,
    /// First managed page.
    start: PhysAddr,
    /// One past the last managed page.
    end: PhysAddr,
}

impl<C: Cpu> Kmem<C> {
    /// Bootstrap: carve `[start, end)` into pages and deal them round-robin
    /// to the per-core pools.
    ///
    /// `start` is rounded up to a page boundary; a trailing partial page is
    /// left unmanaged.
    ///
    /// # Safety
    /// The region must be directly-mapped memory that nothing else uses for
    /// as long as the returned allocator, or any page it hands out, is alive.
    pub unsafe fn kinit(config: KmemConfig, start: PhysAddr, end: PhysAddr) -> Self {
        assert!(config.ncpu > 0, "kinit: no cpus");

        let mut pools: Vec<SpinLock<FreeList, C>> = (0..config.ncpu)
            .map(|_| SpinLock::new("kmem", FreeList::new()))
            .collect();

        let start = start.page_round_up();
        let end = end.page_round_down();
        let mut pa = start;
        let mut npages = 0usize;
        while pa < end {
            // SAFETY: the caller hands us the whole region.
            unsafe {
                fill(pa, JUNK_ON_FREE);
                pools[npages % config.ncpu].get_mut().push(pa);
            }
            pa = pa + PGSIZE as u64;
            npages += 1;
        }

        info!(
            "kmem: {} pages ({} KiB) at {}, dealt over {} pools",
            npages,
            npages * PGSIZE / 1024,
            start,
            config.ncpu,
        );

        Self {
            pools: pools.into_boxed_slice(),
            start,
            end: pa,
        }
    }

    /// Allocate one page filled with [`JUNK_ON_ALLOC`].
    ///
    /// Returns `None` if every pool is empty.
    pub fn kalloc(&self) -> Option<PhysAddr> {
        self.kalloc_flags(AllocFlags::empty())
    }

    /// Allocate one zeroed page.
    pub fn kzalloc(&self) -> Option<PhysAddr> {
        self.kalloc_flags(AllocFlags::ZERO)
    }

    pub fn kalloc_flags(&self, flags: AllocFlags) -> Option<PhysAddr> {
        let (taken, me) = {
            // The core id picks the pool, so the task must not migrate
            // between reading it and finishing with the pool.
            let _irq = IrqGuard::<C>::new();
            let me = self.home_pool();
            (self.take_page(me, flags), me)
        };

        let Some((pa, from)) = taken else {
            warn!("kalloc: out of memory (cpu {})", me);
            return None;
        };
        if from != me {
            debug!("kalloc: cpu {} stole {} from pool {}", me, pa, from);
        }

        let byte = if flags.contains(AllocFlags::ZERO) {
            0
        } else {
            JUNK_ON_ALLOC
        };
        // SAFETY: the page just left a free-list, so it is ours alone.
        unsafe { fill(pa, byte) };
        Some(pa)
    }

    /// Pop a page, starting at pool `me`. Interrupts must be off.
    fn take_page(&self, me: usize, flags: AllocFlags) -> Option<(PhysAddr, usize)> {
        let n = self.pools.len();
        let tries = if flags.contains(AllocFlags::LOCAL_ONLY) { 1 } else { n };

        for k in 0..tries {
            let p = (me + k) % n;
            let mut pool = self.pools[p].lock();
            if p != me {
                pool.stats.remote_probes += 1;
            }
            if let Some(pa) = pool.pop() {
                pool.stats.allocs += 1;
                if p != me {
                    pool.stats.stolen += 1;
                }
                return Some((pa, p));
            }
            // Pool lock dropped here, before the next one is taken.
        }
        None
    }

    /// Return a page to the current core's pool.
    ///
    /// # Panics
    /// Panics if `pa` is not page aligned or not inside the managed region.
    pub fn kfree(&self, pa: PhysAddr) {
        if !self.contains(pa) {
            panic!("kfree: {} is not a managed page", pa);
        }

        // SAFETY: the caller gives the page back; it is inside the region.
        unsafe { fill(pa, JUNK_ON_FREE) };

        let _irq = IrqGuard::<C>::new();
        let me = self.home_pool();
        let mut pool = self.pools[me].lock();
        // SAFETY: as above.
        unsafe { pool.push(pa) };
        pool.stats.frees += 1;
    }

    /// Whether `pa` is the address of a page this allocator manages.
    pub fn contains(&self, pa: PhysAddr) -> bool {
        pa.is_page_aligned() && pa >= self.start && pa < self.end
    }

    /// Number of per-core pools.
    pub fn ncpu(&self) -> usize {
        self.pools.len()
    }

    /// Number of pages in the managed region.
    pub fn npages(&self) -> usize {
        ((self.end - self.start) / PGSIZE as u64) as usize
    }

    /// Pages currently free across all pools. Approximate under concurrency.
    pub fn free_pages(&self) -> usize {
        self.census().iter().map(|s| s.free).sum()
    }

    pub fn pool_stats(&self, cpu: usize) -> PoolStats {
        self.pools[cpu].lock().stats
    }

    /// Snapshot of every pool, taken one lock at a time.
    pub fn census(&self) -> Vec<PoolStats> {
        self.pools.iter().map(|p| p.lock().stats).collect()
    }

    fn home_pool(&self) -> usize {
        let me = C::id();
        assert!(me < self.pools.len(), "kalloc: cpu {} has no pool", me);
        me
    }
}

/// # Safety
/// `pa` must be a page the caller exclusively owns.
unsafe fn fill(pa: PhysAddr, byte: u8) {
    unsafe { core::ptr::write_bytes(pa.as_mut_ptr::<u8>(), byte, PGSIZE) };
}
