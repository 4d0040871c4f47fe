//! Free map: one bit per device sector.
//!
//! The bitmap lives in memory and is persisted as the content of the file
//! whose inode occupies `FREE_MAP_SECTOR`, rewritten through the inode
//! layer after every structural change. The bits for the free-map file
//! itself and for the root directory are permanently set.

use spin::Mutex;

use crate::device::Disk;
use crate::param::{FREE_MAP_SECTOR, MAXSECTORS, NDIRECT, NINDIRECT, ROOT_DIR_SECTOR};

use super::inode::{Dinode, IndirectBlock, InodeRef};
use super::{FileSystem, FsError};

use zerocopy::AsBytes;

pub(crate) struct FreeMap {
    pub(super) inner: Mutex<FreeMapInner>,
}

pub(crate) struct FreeMapInner {
    bits: Box<[u8]>,
    sectors: u32,
    /// Backing file, absent until the free map is created or opened.
    file: Option<InodeRef>,
}

impl FreeMap {
    pub fn new(sectors: u32) -> Self {
        let mut inner = FreeMapInner {
            bits: vec![0; (sectors as usize + 7) / 8].into_boxed_slice(),
            sectors,
            file: None,
        };
        inner.set_range(FREE_MAP_SECTOR, 1);
        inner.set_range(ROOT_DIR_SECTOR, 1);
        Self {
            inner: Mutex::new(inner),
        }
    }
}

impl FreeMapInner {
    fn get(&self, sector: u32) -> bool {
        self.bits[(sector / 8) as usize] & (1 << (sector % 8)) != 0
    }

    /// Marks `cnt` sectors starting at `start` allocated.
    pub(super) fn set_range(&mut self, start: u32, cnt: u32) {
        for sector in start..start + cnt {
            debug_assert!(!self.get(sector), "allocating allocated sector");
            self.bits[(sector / 8) as usize] |= 1 << (sector % 8);
        }
    }

    /// Marks `cnt` sectors starting at `start` free. All of them must
    /// currently be allocated.
    pub(super) fn clear_range(&mut self, start: u32, cnt: u32) {
        for sector in start..start + cnt {
            assert!(self.get(sector), "freeing free sector");
            self.bits[(sector / 8) as usize] &= !(1 << (sector % 8));
        }
    }

    /// Finds the first run of `cnt` consecutive free sectors, marks it
    /// allocated, and returns its first sector.
    pub(super) fn scan_and_flip(&mut self, cnt: u32) -> Option<u32> {
        assert!(cnt > 0);
        let mut run = 0;
        let mut start = 0;
        let mut sector = 0;
        while sector < self.sectors {
            // Skip fully allocated bytes while no run is pending.
            if run == 0 && sector % 8 == 0 && sector + 8 <= self.sectors {
                if self.bits[(sector / 8) as usize] == 0xff {
                    sector += 8;
                    continue;
                }
            }
            if self.get(sector) {
                run = 0;
            } else {
                if run == 0 {
                    start = sector;
                }
                run += 1;
                if run == cnt {
                    self.set_range(start, cnt);
                    return Some(start);
                }
            }
            sector += 1;
        }
        None
    }

    pub(super) fn count_clear(&self) -> u32 {
        (0..self.sectors).filter(|&s| !self.get(s)).count() as u32
    }

    pub(super) fn bits_len(&self) -> usize {
        self.bits.len()
    }
}

impl<D: Disk> FileSystem<D> {
    /// Reserves `cnt` consecutive sectors and returns the first.
    pub(crate) fn free_map_allocate(&self, cnt: u32) -> Result<u32, FsError> {
        let mut inner = self.free_map.inner.lock();
        let start = inner.scan_and_flip(cnt).ok_or(FsError::NoSpace)?;
        if self.free_map_persist(&mut inner).is_err() {
            inner.clear_range(start, cnt);
            return Err(FsError::NoSpace);
        }
        Ok(start)
    }

    /// Reserves the data sectors for a new inode of `cnt` data sectors,
    /// along with the index sectors needed to address them, writing every
    /// sector pointer into `dinode` or, through the cache, into the index
    /// sectors. One contiguous run of the whole reservation is preferred;
    /// when none exists the sectors are gathered one at a time.
    ///
    /// The cache writes happen with the free-map lock held; that is fine
    /// because cache eviction performs device I/O only and never calls
    /// back into the allocator.
    pub(crate) fn free_map_allocate_inode(
        &self,
        cnt: u32,
        dinode: &mut Dinode,
        inum: u32,
    ) -> Result<(), FsError> {
        if cnt == 0 {
            return Ok(());
        }
        if cnt as usize > MAXSECTORS {
            return Err(FsError::NoSpace);
        }
        let n_indirect = if cnt as usize > NDIRECT { 1 } else { 0 };
        let n_doubly = if cnt as usize > NDIRECT + NINDIRECT {
            let second_level = cnt - (NDIRECT + NINDIRECT) as u32;
            1 + (second_level + NINDIRECT as u32 - 1) / NINDIRECT as u32
        } else {
            0
        };
        let total = cnt + n_indirect + n_doubly;

        let mut inner = self.free_map.inner.lock();
        let mut sectors: Vec<u32> = Vec::with_capacity(total as usize);
        if let Some(start) = inner.scan_and_flip(total) {
            sectors.extend(start..start + total);
        } else {
            log::debug!("free map: no contiguous run of {}, gathering", total);
            for _ in 0..total {
                match inner.scan_and_flip(1) {
                    Some(sector) => sectors.push(sector),
                    None => {
                        for &sector in sectors.iter().rev() {
                            inner.clear_range(sector, 1);
                        }
                        return Err(FsError::NoSpace);
                    }
                }
            }
        }

        let (data, index) = sectors.split_at(cnt as usize);
        let mut index = index.iter().copied();
        for (i, &sector) in data.iter().take(NDIRECT).enumerate() {
            dinode.direct[i] = sector;
        }
        if n_indirect > 0 {
            let ind_sector = index.next().expect("free map: missing index sector");
            dinode.indirect = ind_sector;
            let mut blk = IndirectBlock::zeroed();
            for (j, &sector) in data[NDIRECT..].iter().take(NINDIRECT).enumerate() {
                blk.ptrs[j] = sector;
            }
            self.cache.write(ind_sector, blk.as_bytes(), inum);
        }
        if n_doubly > 0 {
            let dbl_sector = index.next().expect("free map: missing index sector");
            dinode.doubly_indirect = dbl_sector;
            let mut dblk = IndirectBlock::zeroed();
            for (k, chunk) in data[NDIRECT + NINDIRECT..].chunks(NINDIRECT).enumerate() {
                let l2_sector = index.next().expect("free map: missing index sector");
                dblk.ptrs[k] = l2_sector;
                let mut l2 = IndirectBlock::zeroed();
                for (j, &sector) in chunk.iter().enumerate() {
                    l2.ptrs[j] = sector;
                }
                self.cache.write(l2_sector, l2.as_bytes(), inum);
            }
            self.cache.write(dbl_sector, dblk.as_bytes(), inum);
        }

        if self.free_map_persist(&mut inner).is_err() {
            for &sector in sectors.iter().rev() {
                inner.clear_range(sector, 1);
            }
            return Err(FsError::NoSpace);
        }
        Ok(())
    }

    /// Makes `cnt` sectors starting at `sector` available again.
    pub(crate) fn free_map_release(&self, sector: u32, cnt: u32) {
        let mut inner = self.free_map.inner.lock();
        inner.clear_range(sector, cnt);
        // A failed bitmap write here leaves the bits allocated on disk
        // until the next successful persist; no caller can act on it.
        let _ = self.free_map_persist(&mut inner);
    }

    fn free_map_persist(&self, inner: &mut FreeMapInner) -> Result<(), FsError> {
        if let Some(file) = inner.file.clone() {
            let written = self.write_at(&file, &inner.bits, 0)?;
            if written != inner.bits.len() {
                return Err(FsError::NoSpace);
            }
        }
        Ok(())
    }

    /// Creates the free-map file on disk and writes the bitmap to it.
    pub(super) fn free_map_create(&self) {
        let len = self.free_map.inner.lock().bits_len() as u32;
        self.inode_create(FREE_MAP_SECTOR, len)
            .expect("free map creation failed");
        let file = self.inode_open(FREE_MAP_SECTOR, false);
        let mut inner = self.free_map.inner.lock();
        inner.file = Some(file);
        self.free_map_persist(&mut inner)
            .expect("can't write free map");
    }

    /// Opens the free-map file and reads the bitmap from disk.
    pub(super) fn free_map_open(&self) {
        let file = self.inode_open(FREE_MAP_SECTOR, false);
        let mut inner = self.free_map.inner.lock();
        let mut buf = vec![0u8; inner.bits_len()];
        let read = self
            .read_at(&file, &mut buf, 0)
            .expect("can't read free map");
        assert_eq!(read, buf.len(), "can't read free map");
        inner.bits.copy_from_slice(&buf);
        inner.file = Some(file);
    }

    /// Writes the free map to disk and closes its file.
    pub(super) fn free_map_close(&self) {
        let file = {
            let mut inner = self.free_map.inner.lock();
            if inner.file.is_some() {
                self.free_map_persist(&mut inner)
                    .expect("can't write free map");
            }
            inner.file.take()
        };
        if let Some(file) = file {
            self.inode_close(file);
        }
    }

    /// Number of unallocated sectors on the device.
    pub fn free_count(&self) -> u32 {
        self.free_map.inner.lock().count_clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inner(sectors: u32) -> FreeMapInner {
        let map = FreeMap::new(sectors);
        map.inner.into_inner()
    }

    #[test]
    fn reserved_sectors_start_allocated() {
        let inner = inner(64);
        assert!(inner.get(FREE_MAP_SECTOR));
        assert!(inner.get(ROOT_DIR_SECTOR));
        assert_eq!(inner.count_clear(), 62);
    }

    #[test]
    fn scan_finds_first_fit() {
        let mut inner = inner(64);
        assert_eq!(inner.scan_and_flip(4), Some(2));
        assert_eq!(inner.scan_and_flip(1), Some(6));
        inner.clear_range(3, 2);
        // The two-sector hole fits, the four-sector request skips it.
        assert_eq!(inner.scan_and_flip(4), Some(7));
        assert_eq!(inner.scan_and_flip(2), Some(3));
    }

    #[test]
    fn scan_fails_when_fragmented() {
        let mut inner = inner(16);
        assert_eq!(inner.scan_and_flip(14), Some(2));
        inner.clear_range(4, 1);
        inner.clear_range(9, 1);
        assert_eq!(inner.scan_and_flip(2), None);
        assert_eq!(inner.count_clear(), 2);
    }

    #[test]
    #[should_panic(expected = "freeing free sector")]
    fn double_free_panics() {
        let mut inner = inner(16);
        inner.clear_range(8, 1);
    }
}
