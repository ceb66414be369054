//! The block layer as the kernel core sees it: block identities, the device
//! that moves blocks, and the buffer cache in front of it.

pub mod bio;
mod lru;
pub mod ramdisk;

use core::fmt;

pub use bio::{Bcache, BcacheConfig, BcacheStats, Buf, Resident};
pub use ramdisk::RamDisk;

use crate::param::BSIZE;

/// Identity of a disk block: which device, which block on it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct BlockId {
    pub dev: u32,
    pub blockno: u32,
}

impl BlockId {
    pub const fn new(dev: u32, blockno: u32) -> Self {
        Self { dev, blockno }
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.dev, self.blockno)
    }
}

/// One block transfer; the variant is the direction.
pub enum Io<'a> {
    /// Device to memory.
    Read(&'a mut [u8; BSIZE]),
    /// Memory to device.
    Write(&'a [u8; BSIZE]),
}

/// The disk driver.
///
/// `rw` is synchronous: it returns once the transfer is complete and may
/// block the calling task meanwhile. It is never called with a spinlock held.
/// I/O errors are the driver's business; it either retries or halts.
pub trait BlockDevice: Sync {
    fn rw(&self, id: BlockId, io: Io<'_>);
}

impl<D: BlockDevice + ?Sized> BlockDevice for &D {
    fn rw(&self, id: BlockId, io: Io<'_>) {
        (**self).rw(id, io)
    }
}
