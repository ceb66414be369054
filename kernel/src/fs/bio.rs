// =============================================================================
// ShardMem — Buffer Cache
// =============================================================================
//
// A fixed pool of block-sized buffers holding cached copies of disk blocks.
// It gives the file system layer two things:
//   - fewer device reads for blocks that are used repeatedly
//   - one place where each block is modified, so concurrent users of the
//     same block see each other's changes
//
// SHARDS:
//   The buffers are spread over `nshards` recency lists, each behind its own
//   spinlock. A block's home shard is `blockno % nshards`. A labelled buffer
//   always lives in the home shard of its label, so a lookup only ever has to
//   search one list. Unlabelled buffers start out spread round-robin.
//
// LOOKUP OR ALLOCATE (bget):
//   1. Lock the home shard and search it. Hit: take a reference and go.
//   2. Miss: relabel the least recently used free buffer of the home shard.
//   3. Home shard full of referenced buffers: visit every sibling once with
//      `try_lock`. The first sibling with a free buffer donates its least
//      recently used one, which moves to the front of the home shard.
//   4. If a sibling could not be probed because it was busy, let go of the
//      home shard and walk the siblings again, this time locking home and
//      sibling in ascending index order, and redo the lookup from step 1.
//   5. Nothing free anywhere: the cache is overcommitted. Fatal.
//   The home shard lock is held from the lookup to the claim, so two callers
//   can never give one block two buffers.
//
// REFERENCE COUNT:
//   `refcnt` counts handles and pins. It is guarded by the shard lock, never
//   by the buffer's sleep lock. Only buffers with `refcnt == 0` are recycled.
//
// SLEEP LOCK:
//   Each buffer's contents are behind a sleep lock, held from `bread` to
//   `brelse`. Device I/O only ever happens under the sleep lock with no
//   spinlock held.
//
// =============================================================================

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::{debug, error, info, trace};

use super::lru::LruList;
use super::{BlockDevice, BlockId, Io};
use crate::arch::Cpu;
use crate::param::{BSIZE, NBUCKETS, NBUF};
use crate::sync::{SleepLock, SpinLock, SpinLockGuard};

/// Shape of a buffer cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BcacheConfig {
    /// Number of buffers.
    pub nbuf: usize,
    /// Number of lock shards.
    pub nshards: usize,
}

impl Default for BcacheConfig {
    fn default() -> Self {
        Self {
            nbuf: NBUF,
            nshards: NBUCKETS,
        }
    }
}

/// Counters since `binit`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BcacheStats {
    /// Lookups that found the block resident.
    pub hits: u64,
    /// Lookups that relabelled a free buffer.
    pub misses: u64,
    /// Misses served by a buffer taken from another shard.
    pub steals: u64,
    /// Lookups that found a sibling shard busy and fell back to locking
    /// shard pairs in order.
    pub contended: u64,
    /// Device reads issued by `bread`.
    pub reads: u64,
    /// Device writes issued by `bwrite`.
    pub writes: u64,
}

/// One labelled buffer as seen by [`Bcache::census`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resident {
    pub shard: usize,
    pub id: BlockId,
    pub refcnt: u32,
}

// ── Shard contents ──────────────────────────────────────────────

/// Per-buffer bookkeeping kept in a shard list, under the shard lock.
struct Entry {
    slot: usize,
    id: Option<BlockId>,
    refcnt: u32,
}

impl Entry {
    fn is(&self, id: BlockId) -> bool {
        self.id == Some(id)
    }

    fn is_free(&self) -> bool {
        self.refcnt == 0
    }
}

type Shard = LruList<Entry>;
type ShardGuard<'a, C> = SpinLockGuard<'a, Shard, C>;

/// Home and donor shard locked together, in ascending index order.
struct LockedPair<'a, C: Cpu> {
    // Declared in reverse acquisition order so the later lock drops first.
    second: ShardGuard<'a, C>,
    first: ShardGuard<'a, C>,
    home_first: bool,
}

impl<'a, C: Cpu> LockedPair<'a, C> {
    fn lock(shards: &'a [SpinLock<Shard, C>], home: usize, donor: usize) -> Self {
        debug_assert_ne!(home, donor);
        let (lo, hi) = if home < donor { (home, donor) } else { (donor, home) };
        let first = shards[lo].lock();
        let second = shards[hi].lock();
        Self {
            second,
            first,
            home_first: home < donor,
        }
    }

    /// `(home, donor)`.
    fn split(&mut self) -> (&mut Shard, &mut Shard) {
        if self.home_first {
            (&mut *self.first, &mut *self.second)
        } else {
            (&mut *self.second, &mut *self.first)
        }
    }
}

/// How a lookup was satisfied.
#[derive(Clone, Copy)]
enum Source {
    Hit,
    Home,
    Stolen(usize),
}

/// Where a claimed buffer sits in its home shard.
struct Claim {
    slot: usize,
    node: usize,
    source: Source,
}

/// A buffer's contents and whether they hold the labelled block.
struct Slot<C: Cpu> {
    valid: AtomicBool,
    data: SleepLock<[u8; BSIZE], C>,
}

// ── Handle ──────────────────────────────────────────────────────

/// Exclusive use of one cached block, from `bread` until `brelse`.
///
/// Dropping a `Buf` without `brelse` leaks its buffer for good.
#[must_use = "a Buf must be handed back with brelse"]
pub struct Buf<'a, C: Cpu> {
    slot: &'a Slot<C>,
    index: usize,
    home: usize,
    node: usize,
    id: BlockId,
}

impl<C: Cpu> Buf<'_, C> {
    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn dev(&self) -> u32 {
        self.id.dev
    }

    pub fn blockno(&self) -> u32 {
        self.id.blockno
    }

    /// Index of the cache buffer backing this handle.
    pub fn slot(&self) -> usize {
        self.index
    }

    pub fn data(&self) -> &[u8; BSIZE] {
        // SAFETY: the sleep lock was taken for this handle in `bget` and is
        // released only by `brelse`, which consumes the handle.
        unsafe { &*self.slot.data.data_ptr() }
    }

    pub fn data_mut(&mut self) -> &mut [u8; BSIZE] {
        // SAFETY: as in `data`; `&mut self` rules out other borrows.
        unsafe { &mut *self.slot.data.data_ptr() }
    }
}

// ── Cache ───────────────────────────────────────────────────────

/// The buffer cache in front of one block device.
pub struct Bcache<C: Cpu, D: BlockDevice> {
    shards: Box<[SpinLock<Shard, C>]>,
    slots: Box<[Slot<C>]>,
    disk: D,
    hits: AtomicU64,
    misses: AtomicU64,
    steals: AtomicU64,
    contended: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl<C: Cpu, D: BlockDevice> Bcache<C, D> {
    /// Build a cache of `config.nbuf` empty buffers over `disk`.
    ///
    /// # Panics
    /// Panics if `nbuf` or `nshards` is zero.
    pub fn binit(config: BcacheConfig, disk: D) -> Self {
        let BcacheConfig { nbuf, nshards } = config;
        assert!(nbuf > 0, "binit: no buffers");
        assert!(nshards > 0, "binit: no shards");

        // Any shard may end up holding every buffer, so each list gets room
        // for all of them.
        let mut shards: Vec<SpinLock<Shard, C>> = (0..nshards)
            .map(|_| SpinLock::new("bcache.shard", LruList::with_capacity(nbuf)))
            .collect();
        for slot in 0..nbuf {
            shards[slot % nshards].get_mut().push_front(Entry {
                slot,
                id: None,
                refcnt: 0,
            });
        }

        let slots = (0..nbuf)
            .map(|_| Slot {
                valid: AtomicBool::new(false),
                data: SleepLock::new("buffer", [0; BSIZE]),
            })
            .collect();

        info!("bcache: {} buffers in {} shards", nbuf, nshards);

        Self {
            shards: shards.into_boxed_slice(),
            slots,
            disk,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            steals: AtomicU64::new(0),
            contended: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    pub fn nbuf(&self) -> usize {
        self.slots.len()
    }

    pub fn nshards(&self) -> usize {
        self.shards.len()
    }

    /// Shard that `id` lives in while resident.
    pub fn home_of(&self, id: BlockId) -> usize {
        id.blockno as usize % self.shards.len()
    }

    pub fn disk(&self) -> &D {
        &self.disk
    }

    /// Return a locked buffer with the contents of the indicated block.
    ///
    /// Waits if another task is using the block. Reads the device only if
    /// the buffer does not already hold the block.
    ///
    /// # Panics
    /// Panics with `bget: no buffers` if every buffer is referenced.
    pub fn bread(&self, dev: u32, blockno: u32) -> Buf<'_, C> {
        let id = BlockId::new(dev, blockno);
        let mut buf = self.bget(id);
        if !buf.slot.valid.load(Ordering::Acquire) {
            self.disk.rw(id, Io::Read(buf.data_mut()));
            buf.slot.valid.store(true, Ordering::Release);
            self.reads.fetch_add(1, Ordering::Relaxed);
            trace!("bcache: loaded {}", id);
        }
        buf
    }

    /// Write the buffer's contents to disk.
    ///
    /// # Panics
    /// Panics if the calling task does not hold the buffer.
    pub fn bwrite(&self, buf: &Buf<'_, C>) {
        self.check_issuer(buf, "bwrite");
        if !buf.slot.data.holding() {
            panic!("bwrite: {} not held by this task", buf.id);
        }
        self.disk.rw(buf.id, Io::Write(buf.data()));
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Give up a buffer. When its last reference goes, the buffer becomes
    /// the most recently used entry of its shard.
    ///
    /// # Panics
    /// Panics if the calling task does not hold the buffer.
    pub fn brelse(&self, buf: Buf<'_, C>) {
        self.check_issuer(&buf, "brelse");
        if !buf.slot.data.holding() {
            panic!("brelse: {} not held by this task", buf.id);
        }
        buf.slot.data.release();

        let mut shard = self.shards[buf.home].lock();
        let idle = {
            let entry = shard.get_mut(buf.node);
            debug_assert_eq!(entry.slot, buf.index);
            if entry.refcnt == 0 {
                panic!("brelse: {} has no references", buf.id);
            }
            entry.refcnt -= 1;
            entry.refcnt == 0
        };
        if idle {
            shard.move_to_front(buf.node);
        }
    }

    /// Keep the buffer's block resident after `brelse`.
    pub fn bpin(&self, buf: &Buf<'_, C>) {
        self.check_issuer(buf, "bpin");
        let mut shard = self.shards[buf.home].lock();
        shard.get_mut(buf.node).refcnt += 1;
    }

    /// Drop a reference taken by [`bpin`](Self::bpin).
    ///
    /// # Panics
    /// Panics if the block has no references left.
    pub fn bunpin(&self, buf: &Buf<'_, C>) {
        self.check_issuer(buf, "bunpin");
        let mut shard = self.shards[buf.home].lock();
        let entry = shard.get_mut(buf.node);
        if entry.refcnt == 0 {
            panic!("bunpin: {} has no references", buf.id);
        }
        entry.refcnt -= 1;
    }

    /// Every labelled buffer, shard by shard, most recently used first.
    ///
    /// All shards are locked at once, in ascending index order, so the
    /// result is a consistent snapshot. This is the only place that holds
    /// more than two shard locks.
    pub fn census(&self) -> Vec<Resident> {
        let mut guards = Vec::with_capacity(self.shards.len());
        for shard in self.shards.iter() {
            guards.push(shard.lock());
        }

        let mut residents = Vec::new();
        for (shard, guard) in guards.iter().enumerate() {
            for entry in guard.iter() {
                if let Some(id) = entry.id {
                    residents.push(Resident {
                        shard,
                        id,
                        refcnt: entry.refcnt,
                    });
                }
            }
        }

        while let Some(guard) = guards.pop() {
            drop(guard);
        }
        residents
    }

    pub fn stats(&self) -> BcacheStats {
        BcacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            steals: self.steals.load(Ordering::Relaxed),
            contended: self.contended.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }

    // ── Lookup or allocate ──────────────────────────────────────

    fn bget(&self, id: BlockId) -> Buf<'_, C> {
        let home = self.home_of(id);
        let claim = self.claim(id, home);
        match claim.source {
            Source::Hit => trace!("bcache: hit {}", id),
            Source::Home => trace!("bcache: miss {}", id),
            Source::Stolen(from) => debug!("bcache: {} took a buffer from shard {}", id, from),
        }
        let slot = &self.slots[claim.slot];
        slot.data.acquire();
        Buf {
            slot,
            index: claim.slot,
            home,
            node: claim.node,
            id,
        }
    }

    /// Find or label an entry for `id` in shard `home` and take a reference
    /// on it. Returns with no spinlock held.
    fn claim(&self, id: BlockId, home: usize) -> Claim {
        let n = self.shards.len();

        let mut shard = self.shards[home].lock();
        if let Some(claim) = self.take_hit(&mut shard, id) {
            return claim;
        }
        if let Some(claim) = self.take_local(&mut shard, id) {
            return claim;
        }

        let mut contended = false;
        for k in 1..n {
            let sibling = (home + k) % n;
            let Some(mut donor) = self.shards[sibling].try_lock() else {
                contended = true;
                continue;
            };
            let stolen = self.steal(&mut shard, &mut donor, sibling, id);
            drop(donor);
            if let Some(claim) = stolen {
                return claim;
            }
        }
        drop(shard);

        if contended {
            self.contended.fetch_add(1, Ordering::Relaxed);
            for k in 1..n {
                let sibling = (home + k) % n;
                let mut pair = LockedPair::lock(&self.shards, home, sibling);
                let (home_list, donor_list) = pair.split();
                // The block may have been brought in while home was unlocked.
                if let Some(claim) = self.take_hit(home_list, id) {
                    return claim;
                }
                if let Some(claim) = self.take_local(home_list, id) {
                    return claim;
                }
                if let Some(claim) = self.steal(home_list, donor_list, sibling, id) {
                    return claim;
                }
            }
        }

        error!(
            "bcache: all {} buffers referenced, cannot load {}",
            self.slots.len(),
            id
        );
        panic!("bget: no buffers");
    }

    fn take_hit(&self, shard: &mut Shard, id: BlockId) -> Option<Claim> {
        let node = shard.find_mru(|e| e.is(id))?;
        let entry = shard.get_mut(node);
        entry.refcnt += 1;
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(Claim {
            slot: entry.slot,
            node,
            source: Source::Hit,
        })
    }

    fn take_local(&self, shard: &mut Shard, id: BlockId) -> Option<Claim> {
        let node = shard.find_lru(Entry::is_free)?;
        let slot = self.relabel(shard.get_mut(node), id);
        shard.move_to_front(node);
        Some(Claim {
            slot,
            node,
            source: Source::Home,
        })
    }

    /// Move the least recently used free entry of `donor` (shard `from`)
    /// to the front of `home`, labelled `id`.
    fn steal(
        &self,
        home: &mut Shard,
        donor: &mut Shard,
        from: usize,
        id: BlockId,
    ) -> Option<Claim> {
        let node = donor.find_lru(Entry::is_free)?;
        let mut entry = donor.remove(node);
        let slot = self.relabel(&mut entry, id);
        let node = home.push_front(entry);
        self.steals.fetch_add(1, Ordering::Relaxed);
        Some(Claim {
            slot,
            node,
            source: Source::Stolen(from),
        })
    }

    /// Caller holds the lock of the shard `entry` is in (or about to join).
    fn relabel(&self, entry: &mut Entry, id: BlockId) -> usize {
        debug_assert!(entry.is_free());
        entry.id = Some(id);
        entry.refcnt = 1;
        // Nobody holds or waits on the sleep lock of a free buffer.
        self.slots[entry.slot].valid.store(false, Ordering::Relaxed);
        self.misses.fetch_add(1, Ordering::Relaxed);
        entry.slot
    }

    /// `buf` must come from this cache: its node index means nothing in
    /// another cache's shards.
    fn check_issuer(&self, buf: &Buf<'_, C>, op: &str) {
        let ours = self
            .slots
            .get(buf.index)
            .is_some_and(|slot| core::ptr::eq(slot, buf.slot));
        if !ours {
            panic!("{}: {} was issued by another cache", op, buf.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Barrier;
    use std::thread;

    use super::*;
    use crate::arch::hosted::HostCpu;
    use crate::fs::RamDisk;

    type Cache<'d> = Bcache<HostCpu, &'d RamDisk>;

    fn cache(disk: &RamDisk, nbuf: usize, nshards: usize) -> Cache<'_> {
        Bcache::binit(BcacheConfig { nbuf, nshards }, disk)
    }

    #[test]
    fn binit_spreads_empty_buffers() {
        let disk = RamDisk::new();
        let bc = cache(&disk, 30, 13);
        assert_eq!(bc.nbuf(), 30);
        assert_eq!(bc.nshards(), 13);
        assert!(bc.census().is_empty());
        for (i, shard) in bc.shards.iter().enumerate() {
            let expected = if i < 30 % 13 { 3 } else { 2 };
            assert_eq!(shard.lock().len(), expected, "shard {}", i);
        }
    }

    #[test]
    #[should_panic(expected = "no buffers")]
    fn binit_rejects_an_empty_cache() {
        let disk = RamDisk::new();
        let _ = cache(&disk, 0, 13);
    }

    #[test]
    fn repeat_bread_hits_the_same_buffer() {
        let disk = RamDisk::new();
        let bc = cache(&disk, 30, 13);

        let b = bc.bread(1, 5);
        let slot = b.slot();
        bc.brelse(b);
        let b = bc.bread(1, 5);
        assert_eq!(b.slot(), slot);
        bc.brelse(b);

        let stats = bc.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[test]
    fn valid_buffers_are_not_read_again() {
        let disk = RamDisk::new();
        let id = BlockId::new(1, 8);
        disk.load(id, &[0x3C; BSIZE]);
        let bc = cache(&disk, 4, 2);

        for _ in 0..3 {
            let b = bc.bread(1, 8);
            assert_eq!(b.data(), &[0x3C; BSIZE]);
            bc.brelse(b);
        }
        assert_eq!(disk.reads_of(id), 1);
        assert_eq!(bc.stats().reads, 1);
    }

    #[test]
    fn same_blockno_on_two_devices_is_two_blocks() {
        let disk = RamDisk::new();
        disk.load(BlockId::new(1, 3), &[1; BSIZE]);
        disk.load(BlockId::new(2, 3), &[2; BSIZE]);
        let bc = cache(&disk, 4, 2);

        let a = bc.bread(1, 3);
        let b = bc.bread(2, 3);
        assert_ne!(a.slot(), b.slot());
        assert_eq!(a.data()[0], 1);
        assert_eq!(b.data()[0], 2);
        bc.brelse(b);
        bc.brelse(a);
    }

    #[test]
    fn forty_distinct_blocks_through_thirty_buffers() {
        let disk = RamDisk::new();
        let bc = Bcache::<HostCpu, _>::binit(BcacheConfig::default(), &disk);
        for blockno in 0..40 {
            let b = bc.bread(1, blockno);
            assert_eq!(b.blockno(), blockno);
            bc.brelse(b);
        }

        let residents = bc.census();
        assert!(residents.len() <= 30);
        let ids: BTreeSet<_> = residents.iter().map(|r| r.id).collect();
        assert_eq!(ids.len(), residents.len());
        for r in &residents {
            assert_eq!(r.shard, bc.home_of(r.id));
            assert_eq!(r.refcnt, 0);
        }
    }

    #[test]
    #[should_panic(expected = "bget: no buffers")]
    fn thirty_first_live_block_exhausts_the_cache() {
        let disk = RamDisk::new();
        let bc = Bcache::<HostCpu, _>::binit(BcacheConfig::default(), &disk);
        let mut held = Vec::new();
        for blockno in 0..30 {
            held.push(bc.bread(1, blockno));
        }
        let _ = bc.bread(1, 30);
    }

    #[test]
    fn miss_steals_into_the_home_shard() {
        let disk = RamDisk::new();
        // Buffers 0 and 2 start in shard 0, buffers 1 and 3 in shard 1.
        let bc = cache(&disk, 4, 2);
        let a = bc.bread(1, 0);
        let b = bc.bread(1, 2);
        let c = bc.bread(1, 4);
        assert_eq!(bc.stats().steals, 1);

        let residents = bc.census();
        assert_eq!(residents.len(), 3);
        assert!(residents.iter().all(|r| r.shard == 0 && r.refcnt == 1));

        for buf in [c, b, a] {
            bc.brelse(buf);
        }
    }

    #[test]
    fn steals_take_the_donors_least_recent_buffer() {
        let disk = RamDisk::new();
        let bc = cache(&disk, 4, 2);
        // Label both shard-1 buffers; block 3 is released last.
        bc.brelse(bc.bread(1, 1));
        bc.brelse(bc.bread(1, 3));

        let held = [bc.bread(1, 0), bc.bread(1, 2), bc.bread(1, 4)];
        let residents = bc.census();
        let ids: BTreeSet<_> = residents.iter().map(|r| r.id.blockno).collect();
        assert_eq!(ids, BTreeSet::from([0, 2, 3, 4]));

        for buf in held {
            bc.brelse(buf);
        }
    }

    #[test]
    fn released_buffers_are_recycled_least_recent_first() {
        let disk = RamDisk::new();
        let bc = cache(&disk, 3, 1);
        for blockno in 1..=3 {
            bc.brelse(bc.bread(1, blockno));
        }
        // Touch 1 so that 2 is now the least recently used.
        bc.brelse(bc.bread(1, 1));
        bc.brelse(bc.bread(1, 4));

        let ids: BTreeSet<_> = bc.census().iter().map(|r| r.id.blockno).collect();
        assert_eq!(ids, BTreeSet::from([1, 3, 4]));

        bc.brelse(bc.bread(1, 3));
        assert_eq!(disk.reads_of(BlockId::new(1, 3)), 1);
        bc.brelse(bc.bread(1, 2));
        assert_eq!(disk.reads_of(BlockId::new(1, 2)), 2);
    }

    #[test]
    fn bwrite_goes_to_the_device() {
        let disk = RamDisk::new();
        let bc = cache(&disk, 4, 2);
        let mut b = bc.bread(1, 6);
        b.data_mut().fill(0x42);
        bc.bwrite(&b);
        bc.brelse(b);

        let id = BlockId::new(1, 6);
        assert_eq!(disk.contents(id), [0x42; BSIZE]);
        assert_eq!(disk.writes_of(id), 1);
        assert_eq!(bc.stats().writes, 1);
    }

    #[test]
    fn bwrite_by_another_task_panics() {
        let disk = RamDisk::new();
        let bc = cache(&disk, 4, 2);
        let b = bc.bread(1, 6);
        let result = thread::scope(|s| s.spawn(|| bc.bwrite(&b)).join());
        assert!(result.is_err());
        assert_eq!(disk.writes(), 0);
        bc.brelse(b);
    }

    #[test]
    fn brelse_by_another_task_panics() {
        let disk = RamDisk::new();
        let bc = cache(&disk, 4, 2);
        let b = bc.bread(1, 6);
        let result = thread::scope(|s| s.spawn(|| bc.brelse(b)).join());
        assert!(result.is_err());
        // The handle is gone but the reference it held is not.
        assert_eq!(bc.census()[0].refcnt, 1);
    }

    #[test]
    fn pinned_block_stays_resident() {
        let disk = RamDisk::new();
        let bc = cache(&disk, 2, 1);
        let b = bc.bread(1, 1);
        bc.bpin(&b);
        bc.brelse(b);

        // Cycle other blocks through the one remaining buffer.
        for blockno in 2..6 {
            bc.brelse(bc.bread(1, blockno));
        }

        let b = bc.bread(1, 1);
        assert_eq!(disk.reads_of(BlockId::new(1, 1)), 1);
        bc.bunpin(&b);
        bc.brelse(b);
        let pinned = bc.census().into_iter().find(|r| r.id.blockno == 1);
        assert_eq!(pinned.map(|r| r.refcnt), Some(0));
    }

    #[test]
    #[should_panic(expected = "bget: no buffers")]
    fn pinned_blocks_count_against_capacity() {
        let disk = RamDisk::new();
        let bc = cache(&disk, 2, 2);
        for blockno in 0..2 {
            let b = bc.bread(1, blockno);
            bc.bpin(&b);
            bc.brelse(b);
        }
        let _ = bc.bread(1, 2);
    }

    /// Spin until `bc` has entered the ordered pair pass once.
    fn wait_for_contention(bc: &Cache<'_>) {
        while bc.stats().contended == 0 {
            thread::yield_now();
        }
    }

    #[test]
    fn busy_sibling_is_waited_for_then_stolen_from() {
        let disk = RamDisk::new();
        // Shard 0 starts with buffers 0 and 2, shard 1 with 1 and 3.
        let bc = cache(&disk, 4, 2);
        let held = [bc.bread(1, 0), bc.bread(1, 2)];
        let ready = Barrier::new(2);

        let b = thread::scope(|s| {
            s.spawn(|| {
                HostCpu::bind(1);
                let donor = bc.shards[1].lock();
                ready.wait();
                // The lookup skipped shard 1 and is now queued on it.
                wait_for_contention(&bc);
                drop(donor);
            });
            ready.wait();
            bc.bread(1, 4)
        });

        assert!(b.slot() == 1 || b.slot() == 3);
        let stats = bc.stats();
        assert_eq!(stats.contended, 1);
        assert_eq!(stats.steals, 1);
        assert!(bc.census().iter().all(|r| r.shard == 0));

        bc.brelse(b);
        for buf in held {
            bc.brelse(buf);
        }
    }

    #[test]
    fn block_claimed_while_waiting_is_found_not_duplicated() {
        let disk = RamDisk::new();
        let bc = cache(&disk, 4, 2);
        // Fill shard 1, the home of block 5.
        let held = [bc.bread(1, 1), bc.bread(1, 3)];
        let id = BlockId::new(1, 5);
        let ready = Barrier::new(2);

        let (b, other) = thread::scope(|s| {
            let other = s.spawn(|| {
                HostCpu::bind(1);
                let mut donor = bc.shards[0].lock();
                ready.wait();
                wait_for_contention(&bc);
                // The waiting lookup holds no shard now; another task
                // brings block 5 in from shard 0, locking in index order.
                let mut home = bc.shards[1].lock();
                let claim = bc.steal(&mut home, &mut donor, 0, id);
                drop(home);
                drop(donor);
                claim.map(|c| c.slot)
            });
            ready.wait();
            let b = bc.bread(1, 5);
            (b, other.join().unwrap())
        });

        assert_eq!(Some(b.slot()), other);
        let copies: Vec<_> = bc.census().into_iter().filter(|r| r.id == id).collect();
        assert_eq!(copies.len(), 1);
        // One reference from each task.
        assert_eq!(copies[0].refcnt, 2);
        let stats = bc.stats();
        assert_eq!((stats.hits, stats.steals, stats.contended), (1, 1, 1));

        bc.brelse(b);
        for buf in held {
            bc.brelse(buf);
        }
    }

    #[test]
    #[should_panic(expected = "brelse: 1:6 was issued by another cache")]
    fn brelse_into_the_wrong_cache_panics() {
        let disk = RamDisk::new();
        let a = cache(&disk, 4, 2);
        let b = cache(&disk, 4, 2);
        let buf = a.bread(1, 6);
        b.brelse(buf);
    }

    #[test]
    #[should_panic(expected = "bpin")]
    fn bpin_through_the_wrong_cache_panics() {
        let disk = RamDisk::new();
        let a = cache(&disk, 4, 2);
        let b = cache(&disk, 4, 2);
        let buf = a.bread(1, 6);
        b.bpin(&buf);
    }

    #[test]
    #[should_panic(expected = "bunpin")]
    fn bunpin_below_zero_panics() {
        let disk = RamDisk::new();
        let bc = cache(&disk, 2, 1);
        let b = bc.bread(1, 1);
        bc.bunpin(&b);
        bc.bunpin(&b);
    }
}
