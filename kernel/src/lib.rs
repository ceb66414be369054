// =============================================================================
// ShardMem — Kernel Memory Core
// =============================================================================
//
// The resource-management layer of a small multiprocessor kernel:
//
//   fs::Bcache:    a fixed pool of disk block buffers, split over lock shards
//                  keyed by block number, with stealing between shards.
//   memory::Kmem:  the physical page allocator, one free-list per core, with
//                  stealing from other cores when the local list runs dry.
//
// Both subsystems are plain values built at boot by `Kernel::boot` and then
// shared by reference with every core. Nothing here is a global, so tests
// build as many independent instances as they like.
//
// The platform is reached through two traits:
//   arch::Cpu:           core id, interrupt masking, task identity, yield
//   fs::BlockDevice:     synchronous block transfers
//
// With the `std` feature (the default) the `arch::hosted` module provides a
// `Cpu` on top of OS threads, a page-aligned heap region standing in for RAM,
// and a capturing logger. A kernel build turns `std` off.
//
// =============================================================================

#![cfg_attr(not(feature = "std"), no_std)]

// Buffers, shard lists and page pools are heap allocated once at boot.
extern crate alloc;

/// Interrupt control, core and task identity, the hosted platform.
pub mod arch;

/// Block identities, the device trait, the buffer cache.
pub mod fs;

/// Physical addresses and the page allocator.
pub mod memory;

/// Compile-time defaults.
pub mod param;

/// Spinlock and sleep lock.
pub mod sync;

use log::info;

use arch::Cpu;
use fs::{Bcache, BcacheConfig, BlockDevice};
use memory::{Kmem, KmemConfig, PhysAddr};

/// Shape of both subsystems.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Config {
    pub bcache: BcacheConfig,
    pub kmem: KmemConfig,
}

/// The buffer cache and the page allocator of one running kernel.
pub struct Kernel<C: Cpu, D: BlockDevice> {
    pub bcache: Bcache<C, D>,
    pub kmem: Kmem<C>,
}

impl<C: Cpu, D: BlockDevice> Kernel<C, D> {
    /// Bring up the buffer cache over `disk` and hand every page of
    /// `[mem_start, mem_end)` to the page allocator.
    ///
    /// # Safety
    /// Same contract as [`Kmem::kinit`]: the range must be RAM that nothing
    /// else uses for as long as the kernel lives.
    pub unsafe fn boot(config: Config, disk: D, mem_start: PhysAddr, mem_end: PhysAddr) -> Self {
        info!("boot: bringing up buffer cache and page allocator");
        let bcache = Bcache::binit(config.bcache, disk);
        // SAFETY: forwarded from the caller.
        let kmem = unsafe { Kmem::kinit(config.kmem, mem_start, mem_end) };
        Self { bcache, kmem }
    }
}
