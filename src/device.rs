//! Block device interface.
//!
//! The file system consumes a device that moves whole sectors and counts
//! its own traffic. Sector I/O is infallible: a request for a sector the
//! device does not have denotes a corrupt volume and panics.

use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::param::SECTOR_SIZE;

/// A sector-addressed block device.
pub trait Disk: Send + Sync {
    /// Number of sectors on the device.
    fn size(&self) -> u32;

    /// Reads sector `sector` into `buf`.
    fn read_sector(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]);

    /// Writes `buf` to sector `sector`.
    fn write_sector(&self, sector: u32, buf: &[u8; SECTOR_SIZE]);

    /// Number of sectors read from the device so far.
    fn read_cnt(&self) -> u64;

    /// Number of sectors written to the device so far.
    fn write_cnt(&self) -> u64;
}

/// An in-memory volume.
///
/// Backs the tests and doubles as an image-backed device for hosts that
/// mount a volume they loaded themselves. The image survives as long as
/// the value does, so remounting the same `MemDisk` observes whatever the
/// previous mount wrote back.
pub struct MemDisk {
    sectors: Vec<Mutex<[u8; SECTOR_SIZE]>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemDisk {
    /// Creates a zero-filled volume of `size` sectors.
    pub fn new(size: u32) -> Self {
        let mut sectors = Vec::with_capacity(size as usize);
        for _ in 0..size {
            sectors.push(Mutex::new([0; SECTOR_SIZE]));
        }
        Self {
            sectors,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }
}

impl Disk for MemDisk {
    fn size(&self) -> u32 {
        self.sectors.len() as u32
    }

    fn read_sector(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]) {
        let data = self.sectors[sector as usize].lock();
        buf.copy_from_slice(&data[..]);
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    fn write_sector(&self, sector: u32, buf: &[u8; SECTOR_SIZE]) {
        let mut data = self.sectors[sector as usize].lock();
        data.copy_from_slice(&buf[..]);
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    fn read_cnt(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    fn write_cnt(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}
