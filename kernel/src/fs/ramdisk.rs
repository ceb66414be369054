//! RAM-backed block device.
//!
//! Keeps blocks in a sparse map keyed by [`BlockId`], so any device number
//! and block number can be addressed. A block that was never written reads
//! as zeros. Every transfer is counted per block, which is how the buffer
//! cache's "load at most once" behaviour is observed.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use core::sync::atomic::{AtomicU64, Ordering};

use log::trace;
use spin::Mutex;

use super::{BlockDevice, BlockId, Io};
use crate::param::BSIZE;

struct Sector {
    data: Box<[u8; BSIZE]>,
    reads: u64,
    writes: u64,
}

impl Sector {
    fn zeroed() -> Self {
        Self {
            data: Box::new([0; BSIZE]),
            reads: 0,
            writes: 0,
        }
    }
}

/// An in-memory disk.
pub struct RamDisk {
    sectors: Mutex<BTreeMap<BlockId, Sector>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl RamDisk {
    pub const fn new() -> Self {
        Self {
            sectors: Mutex::new(BTreeMap::new()),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Put `data` in block `id` without counting it as a transfer.
    pub fn load(&self, id: BlockId, data: &[u8; BSIZE]) {
        let mut sectors = self.sectors.lock();
        let sector = sectors.entry(id).or_insert_with(Sector::zeroed);
        sector.data.copy_from_slice(data);
    }

    /// Current content of block `id`.
    pub fn contents(&self, id: BlockId) -> [u8; BSIZE] {
        self.sectors
            .lock()
            .get(&id)
            .map_or([0; BSIZE], |s| *s.data)
    }

    /// Device reads of block `id` so far.
    pub fn reads_of(&self, id: BlockId) -> u64 {
        self.sectors.lock().get(&id).map_or(0, |s| s.reads)
    }

    /// Device writes of block `id` so far.
    pub fn writes_of(&self, id: BlockId) -> u64 {
        self.sectors.lock().get(&id).map_or(0, |s| s.writes)
    }

    /// Total device reads.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Total device writes.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

impl Default for RamDisk {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockDevice for RamDisk {
    fn rw(&self, id: BlockId, io: Io<'_>) {
        let mut sectors = self.sectors.lock();
        let sector = sectors.entry(id).or_insert_with(Sector::zeroed);
        match io {
            Io::Read(buf) => {
                buf.copy_from_slice(&sector.data[..]);
                sector.reads += 1;
                self.reads.fetch_add(1, Ordering::Relaxed);
                trace!("ramdisk: read {}", id);
            }
            Io::Write(buf) => {
                sector.data.copy_from_slice(&buf[..]);
                sector.writes += 1;
                self.writes.fetch_add(1, Ordering::Relaxed);
                trace!("ramdisk: write {}", id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwritten_blocks_read_as_zeros() {
        let disk = RamDisk::new();
        let mut buf = [0xFF; BSIZE];
        disk.rw(BlockId::new(1, 7), Io::Read(&mut buf));
        assert!(buf.iter().all(|&b| b == 0));
        assert_eq!(disk.reads_of(BlockId::new(1, 7)), 1);
        assert_eq!(disk.reads(), 1);
    }

    #[test]
    fn writes_are_read_back_per_device() {
        let disk = RamDisk::new();
        let a = BlockId::new(1, 3);
        let b = BlockId::new(2, 3);
        disk.rw(a, Io::Write(&[0xAA; BSIZE]));
        assert_eq!(disk.contents(a)[0], 0xAA);
        assert_eq!(disk.contents(b)[0], 0);
        assert_eq!(disk.writes_of(a), 1);
        assert_eq!(disk.writes_of(b), 0);
    }

    #[test]
    fn load_is_not_counted() {
        let disk = RamDisk::new();
        let id = BlockId::new(1, 1);
        disk.load(id, &[7; BSIZE]);
        assert_eq!(disk.reads() + disk.writes(), 0);
        let mut buf = [0; BSIZE];
        disk.rw(id, Io::Read(&mut buf));
        assert_eq!(buf, [7; BSIZE]);
    }
}
