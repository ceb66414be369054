//! Physical memory management.

pub mod address;
pub mod kalloc;

pub use address::PhysAddr;
pub use kalloc::{AllocFlags, Kmem, KmemConfig, PoolStats};
