//! Buffer cache.
//!
//! The buffer cache is a pool of sector-sized slots holding cached copies
//! of device sectors. Caching sectors in memory reduces the number of
//! device reads and also provides a synchronization point for sectors used
//! by multiple threads.
//!
//! Interface:
//! * To copy a sector out of the cache, call `read`.
//! * To replace a sector's bytes, call `write`; the cache is write-back,
//!   so the device is updated on eviction or on `flush`.
//! * When an inode is deleted, call `invalidate` so its cached sectors are
//!   dropped instead of written back.
//!
//! A metadata record exists for at most one resident copy per sector. The
//! usage-ordered list realizes LRU eviction: hits move a record to the
//! back, eviction takes the first record from the front whose pin count is
//! zero. Pins are taken under the list lock and released by guard only
//! after the slot lock has been dropped, so an evictor can never steal a
//! slot that is still in use.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use array_macro::array;
use spin::{Mutex, RwLock};
use static_assertions::const_assert;

use crate::device::Disk;
use crate::param::{NBUF, SECTOR_SIZE};

// The free-slot bitmap is a single word.
const_assert!(NBUF <= 64);

/// Metadata for one resident sector.
struct BufMeta {
    /// Cached sector number.
    sector: u32,
    /// Inumber of the inode this sector belongs to, for `invalidate`.
    inum: AtomicU32,
    /// Index of the slot holding the bytes.
    slot: usize,
    /// Slot bytes differ from the device.
    dirty: AtomicBool,
    /// Owning inode was deleted; do not write back.
    removed: AtomicBool,
    /// Nonzero blocks eviction.
    pins: AtomicU32,
}

/// Outcome of a cache lookup: either the sector is resident, or a freshly
/// reserved slot is returned with its write lock already held so no other
/// thread can observe it uninitialized.
enum Got<'s> {
    Hit(Arc<BufMeta>),
    New(Arc<BufMeta>, spin::RwLockWriteGuard<'s, [u8; SECTOR_SIZE]>),
}

pub struct Bcache<D> {
    disk: Arc<D>,
    /// Sector bytes, one reader/writer lock per slot.
    slots: [RwLock<[u8; SECTOR_SIZE]>; NBUF],
    /// Bitmap of slots not referenced by any metadata record.
    free: Mutex<u64>,
    /// Usage-ordered metadata; front is least recently used.
    lru: RwLock<Vec<Arc<BufMeta>>>,
}

impl<D: Disk> Bcache<D> {
    pub fn new(disk: Arc<D>) -> Self {
        Self {
            disk,
            slots: array![_ => RwLock::new([0; SECTOR_SIZE]); NBUF],
            free: Mutex::new(u64::MAX >> (64 - NBUF)),
            lru: RwLock::new(Vec::with_capacity(NBUF)),
        }
    }

    /// Copies sector `sector` into `out`, reading from the device on a
    /// miss. `inum` tags the resident copy with its owning inode.
    pub fn read(&self, sector: u32, out: &mut [u8], inum: u32) {
        assert_eq!(out.len(), SECTOR_SIZE);
        match self.get(sector, inum) {
            Got::Hit(entry) => {
                let _unpin = scopeguard::guard(entry.clone(), |e| {
                    e.pins.fetch_sub(1, Ordering::Release);
                });
                let slot = self.slots[entry.slot].read();
                out.copy_from_slice(&slot[..]);
            }
            Got::New(entry, slot) => {
                let _unpin = scopeguard::guard(entry, |e| {
                    e.pins.fetch_sub(1, Ordering::Release);
                });
                // Rebound after the guard so the slot lock is released
                // before the pin.
                let mut slot = slot;
                self.disk.read_sector(sector, &mut slot);
                out.copy_from_slice(&slot[..]);
            }
        }
    }

    /// Replaces sector `sector` with `data` and marks it dirty. The
    /// device is not touched; a miss fills the slot without reading.
    pub fn write(&self, sector: u32, data: &[u8], inum: u32) {
        assert_eq!(data.len(), SECTOR_SIZE);
        match self.get(sector, inum) {
            Got::Hit(entry) => {
                let _unpin = scopeguard::guard(entry.clone(), |e| {
                    e.pins.fetch_sub(1, Ordering::Release);
                });
                let mut slot = self.slots[entry.slot].write();
                slot.copy_from_slice(data);
                entry.dirty.store(true, Ordering::Release);
                // A freed sector may be recycled by a different inode
                // while its stale copy is still resident; the write makes
                // the copy live again under the new owner.
                entry.removed.store(false, Ordering::Release);
                entry.inum.store(inum, Ordering::Release);
            }
            Got::New(entry, slot) => {
                let _unpin = scopeguard::guard(entry.clone(), |e| {
                    e.pins.fetch_sub(1, Ordering::Release);
                });
                let mut slot = slot;
                slot.copy_from_slice(data);
                entry.dirty.store(true, Ordering::Release);
            }
        }
    }

    /// Marks every resident sector owned by `inum` as removed so eviction
    /// and `flush` drop it without write-back.
    pub fn invalidate(&self, inum: u32) {
        let lru = self.lru.read();
        for entry in lru.iter() {
            if entry.inum.load(Ordering::Acquire) == inum {
                entry.removed.store(true, Ordering::Release);
            }
        }
    }

    /// Writes every non-removed dirty sector back to the device and drops
    /// all metadata. Called once at shutdown.
    pub fn flush(&self) {
        let entries = {
            let mut lru = self.lru.write();
            let mut free = self.free.lock();
            for entry in lru.iter() {
                *free |= 1 << entry.slot;
            }
            core::mem::take(&mut *lru)
        };
        for entry in entries {
            if entry.dirty.load(Ordering::Acquire) && !entry.removed.load(Ordering::Acquire) {
                let slot = self.slots[entry.slot].read();
                self.disk.write_sector(entry.sector, &slot);
            }
        }
    }

    /// Finds the resident copy of `sector`, moving it to most recently
    /// used and pinning it.
    fn find(&self, sector: u32) -> Option<Arc<BufMeta>> {
        let mut lru = self.lru.write();
        let pos = lru.iter().position(|e| e.sector == sector)?;
        let entry = lru.remove(pos);
        entry.pins.fetch_add(1, Ordering::Acquire);
        lru.push(entry.clone());
        Some(entry)
    }

    /// Looks up `sector`, reserving and publishing a fresh slot on a miss.
    ///
    /// The fresh slot's write lock is acquired before the metadata record
    /// becomes visible, so a concurrent `find` blocks on the slot until
    /// the caller has initialized the bytes. The slot lock is taken ahead
    /// of the list lock only for unpublished records, which no other
    /// thread can hold or wait on.
    fn get(&self, sector: u32, inum: u32) -> Got<'_> {
        loop {
            if let Some(entry) = self.find(sector) {
                return Got::Hit(entry);
            }
            let slot = self.take_slot();
            let guard = self.slots[slot].write();
            let mut lru = self.lru.write();
            if lru.iter().any(|e| e.sector == sector) {
                // Raced with another thread inserting the same sector.
                drop(lru);
                drop(guard);
                *self.free.lock() |= 1 << slot;
                continue;
            }
            let entry = Arc::new(BufMeta {
                sector,
                inum: AtomicU32::new(inum),
                slot,
                dirty: AtomicBool::new(false),
                removed: AtomicBool::new(false),
                pins: AtomicU32::new(1),
            });
            lru.push(entry.clone());
            return Got::New(entry, guard);
        }
    }

    /// Reserves a slot, evicting the least recently used unpinned sector
    /// when the pool is full.
    fn take_slot(&self) -> usize {
        {
            let mut free = self.free.lock();
            if *free != 0 {
                let slot = free.trailing_zeros() as usize;
                *free &= !(1 << slot);
                return slot;
            }
        }
        self.evict()
    }

    /// Removes the eviction victim from the list and writes it back if it
    /// is dirty and still wanted. Pins are only taken under the list lock,
    /// so a record with zero pins cannot gain one once unlisted.
    fn evict(&self) -> usize {
        let victim = {
            let mut lru = self.lru.write();
            let pos = lru
                .iter()
                .position(|e| e.pins.load(Ordering::Acquire) == 0)
                .expect("bcache: all slots pinned");
            lru.remove(pos)
        };
        if victim.dirty.load(Ordering::Acquire) && !victim.removed.load(Ordering::Acquire) {
            let slot = self.slots[victim.slot].read();
            self.disk.write_sector(victim.sector, &slot);
            log::trace!("bcache: wrote back sector {}", victim.sector);
        }
        victim.slot
    }
}
