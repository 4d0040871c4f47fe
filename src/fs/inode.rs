//! Inodes.
//!
//! An inode describes a single unnamed file. The on-disk structure
//! occupies exactly one sector and holds the file's length and the list of
//! sectors holding its content: twelve direct pointers, one indirect
//! sector of pointers, and one doubly-indirect sector of pointers to
//! pointer sectors. The sector number of the on-disk inode (its
//! "inumber") is the file's stable identifier.
//!
//! The in-memory `Inode` exists so threads opening the same file share
//! one synchronization point: the open-inode table hands out at most one
//! `Inode` per on-disk inode, reference-counted by its open count. The
//! open count, the deny-write count, and the removed flag live behind the
//! metadata lock; the resize lock arbitrates file growth against readers
//! and writers:
//!
//! * reads and non-growing writes take it shared and may run in parallel,
//! * a write that grows the file takes it exclusive.
//!
//! Deleting a file only marks it removed; its sectors return to the free
//! map when the last opener closes it, and its cached sectors are dropped
//! without write-back.

use core::mem;
use std::sync::Arc;

use spin::RwLock;
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

use crate::device::Disk;
use crate::param::{MAXLEN, MAXSECTORS, NDIRECT, NINDIRECT, ROOT_DIR_SECTOR, SECTOR_SIZE};

use super::{FileSystem, FsError};

/// Identifies an inode sector.
const INODE_MAGIC: u32 = 0x494e4f44;

/// Number of sectors needed to hold `length` bytes of data.
pub(crate) fn bytes_to_sectors(length: u32) -> u32 {
    ((length as usize + SECTOR_SIZE - 1) / SECTOR_SIZE) as u32
}

/// On-disk inode. Heads its sector; the rest of the sector is zero
/// padding, written by `write_dinode`.
#[repr(C)]
#[derive(AsBytes, FromBytes)]
pub(crate) struct Dinode {
    /// Direct sector pointers.
    pub direct: [u32; NDIRECT],
    /// Indirect pointer sector.
    pub indirect: u32,
    /// Doubly-indirect pointer sector.
    pub doubly_indirect: u32,
    /// File length in bytes.
    pub length: u32,
    /// Must be `INODE_MAGIC`.
    pub magic: u32,
}

const_assert_eq!(mem::size_of::<Dinode>(), 64);

impl Dinode {
    pub fn zeroed() -> Self {
        Self {
            direct: [0; NDIRECT],
            indirect: 0,
            doubly_indirect: 0,
            length: 0,
            magic: 0,
        }
    }

    pub fn new(length: u32) -> Self {
        let mut dinode = Self::zeroed();
        dinode.length = length;
        dinode.magic = INODE_MAGIC;
        dinode
    }
}

/// A sector of sector pointers, the content of an indirect or
/// doubly-indirect sector.
#[repr(C)]
#[derive(AsBytes, FromBytes)]
pub(crate) struct IndirectBlock {
    pub ptrs: [u32; NINDIRECT],
}

const_assert_eq!(mem::size_of::<IndirectBlock>(), SECTOR_SIZE);

impl IndirectBlock {
    pub fn zeroed() -> Self {
        Self {
            ptrs: [0; NINDIRECT],
        }
    }
}

/// Bookkeeping an in-memory inode is not stored on disk.
pub(crate) struct InodeMeta {
    /// Number of openers.
    pub open_cnt: u32,
    /// 0: writes ok, >0: deny writes.
    pub deny_write_cnt: u32,
    /// Delete on final close.
    pub removed: bool,
    /// Directory handles given out by the facade.
    pub ref_open: u32,
    /// Processes whose working directory this is.
    pub ref_cwd: u32,
}

/// In-memory inode.
pub struct Inode {
    sector: u32,
    is_dir: bool,
    is_root: bool,
    pub(crate) meta: RwLock<InodeMeta>,
    pub(crate) resize: RwLock<()>,
}

/// A shared handle on an in-memory inode. The handle does not close
/// itself: every open must be paired with a close so the delete-on-close
/// bookkeeping stays exact.
pub type InodeRef = Arc<Inode>;

impl Inode {
    /// The inode's stable identifier: the sector holding its disk form.
    pub fn inumber(&self) -> u32 {
        self.sector
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    pub(crate) fn is_root(&self) -> bool {
        self.is_root
    }
}

/// Table of open inodes, so that opening a sector twice yields the same
/// `Inode`.
pub(crate) struct Itable(pub(super) spin::Mutex<Vec<InodeRef>>);

impl Itable {
    pub fn new() -> Self {
        Self(spin::Mutex::new(Vec::new()))
    }
}

/// Log of a resize in progress: every sector taken from the free map, and
/// the subset holding file data (which must be zero-filled on success).
/// A failed resize returns the logged sectors in reverse order.
#[derive(Default)]
struct ResizeTxn {
    allocated: Vec<u32>,
    new_data: Vec<u32>,
}

impl<D: Disk> FileSystem<D> {
    /// Initializes an inode of `length` zero bytes on sector `sector`,
    /// allocating its data and index sectors.
    pub(crate) fn inode_create(&self, sector: u32, length: u32) -> Result<(), FsError> {
        if length as usize > MAXLEN {
            return Err(FsError::NoSpace);
        }
        let sectors = bytes_to_sectors(length);
        let mut dinode = Dinode::new(length);
        self.free_map_allocate_inode(sectors, &mut dinode, sector)?;
        self.write_dinode(sector, &dinode);
        let zeros = [0u8; SECTOR_SIZE];
        for idx in 0..sectors {
            let data_sector = self.locate(&dinode, idx, sector);
            self.cache.write(data_sector, &zeros, sector);
        }
        Ok(())
    }

    /// Returns the shared in-memory inode for `sector`, creating it on
    /// first open.
    pub(crate) fn inode_open(&self, sector: u32, is_dir: bool) -> InodeRef {
        let mut table = self.itable.0.lock();
        if let Some(inode) = table.iter().find(|i| i.sector == sector) {
            debug_assert_eq!(inode.is_dir, is_dir);
            inode.meta.write().open_cnt += 1;
            return inode.clone();
        }
        let inode = Arc::new(Inode {
            sector,
            is_dir,
            is_root: sector == ROOT_DIR_SECTOR,
            meta: RwLock::new(InodeMeta {
                open_cnt: 1,
                deny_write_cnt: 0,
                removed: false,
                ref_open: 0,
                ref_cwd: 0,
            }),
            resize: RwLock::new(()),
        });
        table.push(inode.clone());
        inode
    }

    /// Takes another reference on an open inode.
    pub fn reopen(&self, handle: &InodeRef) -> InodeRef {
        handle.meta.write().open_cnt += 1;
        handle.clone()
    }

    /// Drops one reference. The last close of a removed inode frees its
    /// content and index sectors, the inode sector itself, and every
    /// cached copy.
    pub(crate) fn inode_close(&self, handle: InodeRef) {
        let free_sectors = {
            let mut table = self.itable.0.lock();
            let mut meta = handle.meta.write();
            assert!(meta.open_cnt > 0, "close of unopened inode");
            meta.open_cnt -= 1;
            if meta.open_cnt > 0 {
                false
            } else {
                table.retain(|inode| inode.sector != handle.sector);
                meta.removed
            }
        };
        if free_sectors {
            {
                let _resize = handle.resize.write();
                self.resize_locked(&handle, 0)
                    .expect("shrinking cannot fail");
            }
            self.free_map_release(handle.sector, 1);
            self.cache.invalidate(handle.sector);
        }
    }

    /// Marks the inode for deletion at its last close.
    pub(crate) fn inode_remove(&self, handle: &InodeRef) {
        handle.meta.write().removed = true;
    }

    /// The file's length in bytes.
    pub fn length(&self, handle: &InodeRef) -> u32 {
        self.read_dinode(handle.sector).length
    }

    /// Blocks writes to the file, for as long as the caller keeps it
    /// open. Used while an executable is running.
    pub fn deny_write(&self, handle: &InodeRef) {
        let mut meta = handle.meta.write();
        meta.deny_write_cnt += 1;
        assert!(
            meta.deny_write_cnt <= meta.open_cnt,
            "more deny-writes than openers"
        );
    }

    /// Re-permits writes; pairs with [`FileSystem::deny_write`].
    pub fn allow_write(&self, handle: &InodeRef) {
        let mut meta = handle.meta.write();
        assert!(meta.deny_write_cnt > 0, "allow_write without deny_write");
        meta.deny_write_cnt -= 1;
    }

    /// Reads up to `buf.len()` bytes at byte `offset`, stopping at end of
    /// file. Returns the number of bytes read.
    pub fn read_at(&self, handle: &InodeRef, buf: &mut [u8], offset: u32) -> Result<usize, FsError> {
        if handle.meta.read().removed {
            return Err(FsError::InvalidHandle);
        }
        if handle.is_dir {
            return Err(FsError::IsDirectory);
        }
        Ok(self.read_at_inner(handle, buf, offset))
    }

    /// Writes `buf` at byte `offset`, growing the file if the write ends
    /// past its current length. Returns the number of bytes written.
    pub fn write_at(&self, handle: &InodeRef, buf: &[u8], offset: u32) -> Result<usize, FsError> {
        {
            let meta = handle.meta.read();
            if meta.removed {
                return Err(FsError::InvalidHandle);
            }
            if meta.deny_write_cnt > 0 {
                return Err(FsError::ReadOnly);
            }
        }
        if handle.is_dir {
            return Err(FsError::IsDirectory);
        }
        self.write_at_inner(handle, buf, offset)
    }

    /// Grows or shrinks the file to exactly `new_len` bytes. Grown bytes
    /// read as zeros; truncated bytes are gone even if the file grows
    /// back later.
    pub fn truncate(&self, handle: &InodeRef, new_len: u32) -> Result<(), FsError> {
        {
            let meta = handle.meta.read();
            if meta.removed {
                return Err(FsError::InvalidHandle);
            }
            if meta.deny_write_cnt > 0 {
                return Err(FsError::ReadOnly);
            }
        }
        if handle.is_dir {
            return Err(FsError::IsDirectory);
        }
        let _resize = handle.resize.write();
        self.resize_locked(handle, new_len)
    }

    pub(crate) fn read_at_inner(&self, handle: &InodeRef, buf: &mut [u8], offset: u32) -> usize {
        let _resize = handle.resize.read();
        let inum = handle.sector;
        let dinode = self.read_dinode(inum);
        if offset >= dinode.length {
            return 0;
        }
        let n = buf.len().min((dinode.length - offset) as usize);
        let mut offset = offset as usize;
        let mut done = 0;
        let mut bounce = [0u8; SECTOR_SIZE];
        while done < n {
            let sector = self.locate(&dinode, (offset / SECTOR_SIZE) as u32, inum);
            let sector_off = offset % SECTOR_SIZE;
            let chunk = (n - done).min(SECTOR_SIZE - sector_off);
            if sector_off == 0 && chunk == SECTOR_SIZE {
                self.cache.read(sector, &mut buf[done..done + SECTOR_SIZE], inum);
            } else {
                self.cache.read(sector, &mut bounce, inum);
                buf[done..done + chunk].copy_from_slice(&bounce[sector_off..sector_off + chunk]);
            }
            done += chunk;
            offset += chunk;
        }
        n
    }

    pub(crate) fn write_at_inner(
        &self,
        handle: &InodeRef,
        buf: &[u8],
        offset: u32,
    ) -> Result<usize, FsError> {
        let inum = handle.sector;
        if offset as usize + buf.len() > MAXLEN {
            return Err(FsError::NoSpace);
        }
        let end = offset + buf.len() as u32;

        {
            let _shared = handle.resize.read();
            let dinode = self.read_dinode(inum);
            if end <= dinode.length {
                self.write_sectors(&dinode, inum, buf, offset);
                return Ok(buf.len());
            }
        }

        // The file grows: exclude every reader and writer for the whole
        // write, then re-check under the exclusive lock.
        let _exclusive = handle.resize.write();
        let mut dinode = self.read_dinode(inum);
        if end > dinode.length {
            if end <= bytes_to_sectors(dinode.length) * SECTOR_SIZE as u32 {
                // The growth fits in the slack of the final sector.
                dinode.length = end;
                self.write_dinode(inum, &dinode);
            } else {
                self.resize_locked(handle, end)?;
                dinode = self.read_dinode(inum);
            }
        }
        self.write_sectors(&dinode, inum, buf, offset);
        Ok(buf.len())
    }

    /// Copies `buf` into the file's sectors through the cache. Every
    /// touched sector must already be allocated and inside the length.
    fn write_sectors(&self, dinode: &Dinode, inum: u32, buf: &[u8], offset: u32) {
        let mut offset = offset as usize;
        let n = buf.len();
        let mut done = 0;
        let mut bounce = [0u8; SECTOR_SIZE];
        while done < n {
            let sector = self.locate(dinode, (offset / SECTOR_SIZE) as u32, inum);
            let sector_off = offset % SECTOR_SIZE;
            let chunk = (n - done).min(SECTOR_SIZE - sector_off);
            if sector_off == 0 && chunk == SECTOR_SIZE {
                self.cache.write(sector, &buf[done..done + SECTOR_SIZE], inum);
            } else {
                self.cache.read(sector, &mut bounce, inum);
                bounce[sector_off..sector_off + chunk].copy_from_slice(&buf[done..done + chunk]);
                self.cache.write(sector, &bounce, inum);
            }
            done += chunk;
            offset += chunk;
        }
    }

    /// Translates a file-relative sector index into a device sector by
    /// walking the inode's pointers.
    fn locate(&self, dinode: &Dinode, idx: u32, inum: u32) -> u32 {
        let idx = idx as usize;
        if idx < NDIRECT {
            dinode.direct[idx]
        } else if idx < NDIRECT + NINDIRECT {
            let blk = self.read_ptr_block(dinode.indirect, inum);
            blk.ptrs[idx - NDIRECT]
        } else {
            assert!(idx < MAXSECTORS, "sector index out of range");
            let off = idx - NDIRECT - NINDIRECT;
            let dblk = self.read_ptr_block(dinode.doubly_indirect, inum);
            let l2 = self.read_ptr_block(dblk.ptrs[off / NINDIRECT], inum);
            l2.ptrs[off % NINDIRECT]
        }
    }

    fn read_ptr_block(&self, sector: u32, inum: u32) -> IndirectBlock {
        let mut blk = IndirectBlock::zeroed();
        self.cache.read(sector, blk.as_bytes_mut(), inum);
        blk
    }

    pub(crate) fn read_dinode(&self, inum: u32) -> Dinode {
        let mut buf = [0u8; SECTOR_SIZE];
        self.cache.read(inum, &mut buf, inum);
        let mut dinode = Dinode::zeroed();
        dinode
            .as_bytes_mut()
            .copy_from_slice(&buf[..mem::size_of::<Dinode>()]);
        assert_eq!(dinode.magic, INODE_MAGIC, "bad inode magic");
        dinode
    }

    pub(crate) fn write_dinode(&self, inum: u32, dinode: &Dinode) {
        let mut buf = [0u8; SECTOR_SIZE];
        buf[..mem::size_of::<Dinode>()].copy_from_slice(dinode.as_bytes());
        self.cache.write(inum, &buf, inum);
    }

    /// Grows or shrinks the file to `new_len` with the resize lock held
    /// exclusively.
    ///
    /// Runs as a transaction: new sectors are logged as they are taken
    /// from the free map, and the updated index sectors are buffered in
    /// memory. Only after every allocation has succeeded are the zero
    /// fills, the index sectors, and the inode written through the cache;
    /// a failed allocation releases the logged sectors in reverse order
    /// and leaves the file untouched.
    pub(crate) fn resize_locked(&self, handle: &InodeRef, new_len: u32) -> Result<(), FsError> {
        assert!(new_len as usize <= MAXLEN);
        let inum = handle.sector;
        let mut dinode = self.read_dinode(inum);
        let old_len = dinode.length;
        if new_len == old_len {
            return Ok(());
        }

        let mut txn = ResizeTxn::default();
        match self.resize_index(&mut dinode, new_len, inum, &mut txn) {
            Ok(dirty) => {
                let zeros = [0u8; SECTOR_SIZE];
                for &sector in &txn.new_data {
                    self.cache.write(sector, &zeros, inum);
                }
                for (sector, blk) in dirty {
                    self.cache.write(sector, blk.as_bytes(), inum);
                }
                dinode.length = new_len;
                self.write_dinode(inum, &dinode);
                if new_len < old_len && new_len as usize % SECTOR_SIZE != 0 {
                    // Clear the tail of the final kept sector so a later
                    // growth reads zeros there.
                    let sector = self.locate(&dinode, new_len / SECTOR_SIZE as u32, inum);
                    let mut bounce = [0u8; SECTOR_SIZE];
                    self.cache.read(sector, &mut bounce, inum);
                    for byte in &mut bounce[new_len as usize % SECTOR_SIZE..] {
                        *byte = 0;
                    }
                    self.cache.write(sector, &bounce, inum);
                }
                Ok(())
            }
            Err(e) => {
                for &sector in txn.allocated.iter().rev() {
                    self.free_map_release(sector, 1);
                }
                Err(e)
            }
        }
    }

    /// Applies the per-slot grow/shrink rule to the direct pointers, the
    /// indirect sector, and the doubly-indirect tree. Returns the index
    /// sectors whose content changed, to be written out by the caller on
    /// success.
    fn resize_index(
        &self,
        dinode: &mut Dinode,
        new_len: u32,
        inum: u32,
        txn: &mut ResizeTxn,
    ) -> Result<Vec<(u32, IndirectBlock)>, FsError> {
        let new_len = new_len as usize;
        let mut dirty = Vec::new();

        for i in 0..NDIRECT {
            let base = i * SECTOR_SIZE;
            if new_len <= base && dinode.direct[i] != 0 {
                self.free_map_release(dinode.direct[i], 1);
                dinode.direct[i] = 0;
            } else if new_len > base && dinode.direct[i] == 0 {
                dinode.direct[i] = self.txn_allocate(txn, true)?;
            }
        }

        let ind_base = NDIRECT * SECTOR_SIZE;
        let need_ind = new_len > ind_base;
        if dinode.indirect != 0 || need_ind {
            let (mut blk, mut blk_dirty) = if dinode.indirect == 0 {
                dinode.indirect = self.txn_allocate(txn, false)?;
                (IndirectBlock::zeroed(), true)
            } else {
                (self.read_ptr_block(dinode.indirect, inum), false)
            };
            for j in 0..NINDIRECT {
                let base = ind_base + j * SECTOR_SIZE;
                if new_len <= base && blk.ptrs[j] != 0 {
                    self.free_map_release(blk.ptrs[j], 1);
                    blk.ptrs[j] = 0;
                    blk_dirty = true;
                } else if new_len > base && blk.ptrs[j] == 0 {
                    blk.ptrs[j] = self.txn_allocate(txn, true)?;
                    blk_dirty = true;
                }
            }
            if !need_ind {
                self.free_map_release(dinode.indirect, 1);
                dinode.indirect = 0;
            } else if blk_dirty {
                dirty.push((dinode.indirect, blk));
            }
        }

        let dbl_base = (NDIRECT + NINDIRECT) * SECTOR_SIZE;
        let need_dbl = new_len > dbl_base;
        if dinode.doubly_indirect != 0 || need_dbl {
            let (mut dblk, mut dblk_dirty) = if dinode.doubly_indirect == 0 {
                dinode.doubly_indirect = self.txn_allocate(txn, false)?;
                (IndirectBlock::zeroed(), true)
            } else {
                (self.read_ptr_block(dinode.doubly_indirect, inum), false)
            };
            for k in 0..NINDIRECT {
                let l2_base = dbl_base + k * NINDIRECT * SECTOR_SIZE;
                let need_l2 = new_len > l2_base;
                if dblk.ptrs[k] == 0 && !need_l2 {
                    continue;
                }
                let (mut l2, mut l2_dirty) = if dblk.ptrs[k] == 0 {
                    dblk.ptrs[k] = self.txn_allocate(txn, false)?;
                    dblk_dirty = true;
                    (IndirectBlock::zeroed(), true)
                } else {
                    (self.read_ptr_block(dblk.ptrs[k], inum), false)
                };
                for j in 0..NINDIRECT {
                    let base = l2_base + j * SECTOR_SIZE;
                    if new_len <= base && l2.ptrs[j] != 0 {
                        self.free_map_release(l2.ptrs[j], 1);
                        l2.ptrs[j] = 0;
                        l2_dirty = true;
                    } else if new_len > base && l2.ptrs[j] == 0 {
                        l2.ptrs[j] = self.txn_allocate(txn, true)?;
                        l2_dirty = true;
                    }
                }
                if !need_l2 {
                    self.free_map_release(dblk.ptrs[k], 1);
                    dblk.ptrs[k] = 0;
                    dblk_dirty = true;
                } else if l2_dirty {
                    dirty.push((dblk.ptrs[k], l2));
                }
            }
            if !need_dbl {
                self.free_map_release(dinode.doubly_indirect, 1);
                dinode.doubly_indirect = 0;
            } else if dblk_dirty {
                dirty.push((dinode.doubly_indirect, dblk));
            }
        }

        Ok(dirty)
    }

    fn txn_allocate(&self, txn: &mut ResizeTxn, is_data: bool) -> Result<u32, FsError> {
        let sector = self.free_map_allocate(1)?;
        txn.allocated.push(sector);
        if is_data {
            txn.new_data.push(sector);
        }
        Ok(sector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDisk;
    use crate::fs::Cwd;

    fn fs(sectors: u32) -> FileSystem<MemDisk> {
        FileSystem::new(Arc::new(MemDisk::new(sectors)), true)
    }

    #[test]
    fn create_zero_fills() {
        let fs = fs(256);
        let cwd = Cwd::root();
        fs.create(&cwd, "/a", 3000, false).unwrap();
        let h = fs.open(&cwd, "/a").unwrap();
        assert_eq!(fs.length(&h), 3000);
        let mut buf = vec![0xffu8; 3000];
        assert_eq!(fs.read_at(&h, &mut buf, 0).unwrap(), 3000);
        assert!(buf.iter().all(|&b| b == 0));
        fs.close(h);
    }

    #[test]
    fn read_stops_at_eof() {
        let fs = fs(256);
        let cwd = Cwd::root();
        fs.create(&cwd, "/a", 100, false).unwrap();
        let h = fs.open(&cwd, "/a").unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(fs.read_at(&h, &mut buf, 80).unwrap(), 20);
        assert_eq!(fs.read_at(&h, &mut buf, 100).unwrap(), 0);
        assert_eq!(fs.read_at(&h, &mut buf, 4000).unwrap(), 0);
        fs.close(h);
    }

    #[test]
    fn write_read_round_trip_unaligned() {
        let fs = fs(256);
        let cwd = Cwd::root();
        fs.create(&cwd, "/a", 0, false).unwrap();
        let h = fs.open(&cwd, "/a").unwrap();
        let data: Vec<u8> = (0..1300).map(|i| (i % 251) as u8).collect();
        assert_eq!(fs.write_at(&h, &data, 123).unwrap(), data.len());
        assert_eq!(fs.length(&h), 123 + 1300);
        let mut buf = vec![0u8; 1300];
        assert_eq!(fs.read_at(&h, &mut buf, 123).unwrap(), 1300);
        assert_eq!(buf, data);
        // The gap before the write reads as zeros.
        let mut head = [0xffu8; 123];
        assert_eq!(fs.read_at(&h, &mut head, 0).unwrap(), 123);
        assert!(head.iter().all(|&b| b == 0));
        fs.close(h);
    }

    #[test]
    fn growth_crosses_index_boundaries() {
        let fs = fs(1024);
        let cwd = Cwd::root();
        fs.create(&cwd, "/a", 0, false).unwrap();
        let h = fs.open(&cwd, "/a").unwrap();
        // Last direct sector, then first indirect sector.
        let marker = [7u8; 4];
        let direct_end = (NDIRECT * SECTOR_SIZE) as u32;
        fs.write_at(&h, &marker, direct_end - 2).unwrap();
        assert_eq!(fs.length(&h), direct_end + 2);
        let mut buf = [0u8; 4];
        fs.read_at(&h, &mut buf, direct_end - 2).unwrap();
        assert_eq!(buf, marker);
        fs.close(h);
    }

    #[test]
    fn deny_write_blocks_and_allow_restores() {
        let fs = fs(256);
        let cwd = Cwd::root();
        fs.create(&cwd, "/x", 10, false).unwrap();
        let h = fs.open(&cwd, "/x").unwrap();
        fs.deny_write(&h);
        assert_eq!(fs.write_at(&h, b"hi", 0), Err(FsError::ReadOnly));
        fs.allow_write(&h);
        assert_eq!(fs.write_at(&h, b"hi", 0).unwrap(), 2);
        fs.close(h);
    }

    #[test]
    fn removed_handle_is_invalid() {
        let fs = fs(256);
        let cwd = Cwd::root();
        fs.create(&cwd, "/a", 10, false).unwrap();
        let h = fs.open(&cwd, "/a").unwrap();
        fs.remove(&cwd, "/a").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(fs.read_at(&h, &mut buf, 0), Err(FsError::InvalidHandle));
        assert_eq!(fs.write_at(&h, &buf, 0), Err(FsError::InvalidHandle));
        fs.close(h);
    }

    #[test]
    fn remove_returns_sectors_on_last_close() {
        let fs = fs(256);
        let cwd = Cwd::root();
        let before = fs.free_count();
        fs.create(&cwd, "/a", 4096, false).unwrap();
        let h = fs.open(&cwd, "/a").unwrap();
        fs.remove(&cwd, "/a").unwrap();
        // Still allocated while a handle is open.
        assert!(fs.free_count() < before);
        fs.close(h);
        assert_eq!(fs.free_count(), before);
    }

    #[test]
    fn write_past_max_length_fails() {
        let fs = fs(256);
        let cwd = Cwd::root();
        fs.create(&cwd, "/a", 0, false).unwrap();
        let h = fs.open(&cwd, "/a").unwrap();
        let res = fs.write_at(&h, b"abcd", MAXLEN as u32 - 2);
        assert_eq!(res, Err(FsError::NoSpace));
        assert_eq!(fs.length(&h), 0);
        fs.close(h);
    }
}
