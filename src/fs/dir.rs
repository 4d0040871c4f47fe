//! Directories.
//!
//! A directory is a file whose bytes are an array of fixed-size entries.
//! The first two entries are reserved for `.` and `..`; they are written
//! when the directory is created and never reported by `readdir`. Entry
//! slots freed by `dir_remove` are reused by later `dir_add`s before the
//! file grows.

use core::mem;

use arrayvec::ArrayString;
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

use crate::device::Disk;
use crate::param::NAME_MAX;

use super::inode::InodeRef;
use super::path::FileName;
use super::{FileSystem, FsError};

/// A single directory entry.
#[repr(C)]
#[derive(AsBytes, FromBytes)]
pub(crate) struct Dirent {
    /// Inumber of the named inode.
    inum: u32,
    /// NUL-terminated name.
    name: [u8; NAME_MAX + 1],
    in_use: u8,
    is_dir: u8,
    /// Explicit so the record has no hidden padding.
    pad: [u8; 3],
}

pub(crate) const DIRENT_SIZE: usize = mem::size_of::<Dirent>();
const_assert_eq!(DIRENT_SIZE, 24);

impl Dirent {
    fn zeroed() -> Self {
        Self {
            inum: 0,
            name: [0; NAME_MAX + 1],
            in_use: 0,
            is_dir: 0,
            pad: [0; 3],
        }
    }

    /// Fill in name, NUL-terminated. `name` must be at most NAME_MAX
    /// bytes.
    fn set_name(&mut self, name: &str) {
        let name = name.as_bytes();
        assert!(name.len() <= NAME_MAX);
        self.name = [0; NAME_MAX + 1];
        self.name[..name.len()].copy_from_slice(name);
    }

    /// The slice which exactly contains the name, without the NUL.
    fn name_bytes(&self) -> &[u8] {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(NAME_MAX + 1);
        &self.name[..len]
    }
}

/// A directory opened for iteration; wraps the handle with a cursor.
pub struct Dir {
    inode: InodeRef,
    pos: u32,
}

impl Dir {
    /// Wraps an open directory handle. The cursor starts past the
    /// reserved `.` and `..` entries.
    pub fn new(inode: InodeRef) -> Result<Self, FsError> {
        if !inode.is_dir() {
            return Err(FsError::NotDirectory);
        }
        Ok(Self {
            inode,
            pos: (2 * DIRENT_SIZE) as u32,
        })
    }

    pub fn inode(&self) -> &InodeRef {
        &self.inode
    }

    /// Gives the handle back, to be released with [`FileSystem::close`].
    pub fn into_inode(self) -> InodeRef {
        self.inode
    }
}

impl<D: Disk> FileSystem<D> {
    /// Writes the `.` and `..` entries of a fresh directory. The root is
    /// its own parent.
    pub(crate) fn dir_init(&self, dir: &InodeRef, parent: u32) -> Result<(), FsError> {
        let mut dot = Dirent::zeroed();
        dot.inum = dir.inumber();
        dot.set_name(".");
        dot.in_use = 1;
        dot.is_dir = 1;
        self.write_entry(dir, 0, &dot)?;

        let mut dotdot = Dirent::zeroed();
        dotdot.inum = parent;
        dotdot.set_name("..");
        dotdot.in_use = 1;
        dotdot.is_dir = 1;
        self.write_entry(dir, DIRENT_SIZE as u32, &dotdot)
    }

    /// Scans `dir` for the in-use entry named `name` and opens it.
    /// Returns the handle and the entry's byte offset.
    pub(crate) fn dir_lookup(
        &self,
        dir: &InodeRef,
        name: &FileName,
    ) -> Result<(InodeRef, u32), FsError> {
        assert!(dir.is_dir(), "dir_lookup on a file");
        let mut offset = 0;
        while let Some(entry) = self.read_entry(dir, offset) {
            if entry.in_use != 0 && entry.name_bytes() == name.as_str().as_bytes() {
                return Ok((self.inode_open(entry.inum, entry.is_dir != 0), offset));
            }
            offset += DIRENT_SIZE as u32;
        }
        Err(FsError::NotFound)
    }

    /// Links `name` to `inum` in `dir`, reusing the first free slot or
    /// growing the directory by one entry.
    pub(crate) fn dir_add(
        &self,
        dir: &InodeRef,
        name: &FileName,
        inum: u32,
        is_dir: bool,
    ) -> Result<(), FsError> {
        if let Ok((existing, _)) = self.dir_lookup(dir, name) {
            self.inode_close(existing);
            return Err(FsError::Exists);
        }
        let mut offset = 0;
        let slot = loop {
            match self.read_entry(dir, offset) {
                Some(entry) if entry.in_use == 0 => break offset,
                Some(_) => offset += DIRENT_SIZE as u32,
                None => break offset,
            }
        };
        let mut entry = Dirent::zeroed();
        entry.inum = inum;
        entry.set_name(name.as_str());
        entry.in_use = 1;
        entry.is_dir = is_dir as u8;
        self.write_entry(dir, slot, &entry)
    }

    /// Unlinks `name` from `dir` and marks the named inode for deletion
    /// at its last close.
    pub(crate) fn dir_remove(&self, dir: &InodeRef, name: &FileName) -> Result<(), FsError> {
        let (target, offset) = self.dir_lookup(dir, name)?;
        let mut entry = self.read_entry(dir, offset).expect("dir_remove: entry vanished");
        entry.in_use = 0;
        match self.write_entry(dir, offset, &entry) {
            Ok(()) => {
                self.inode_remove(&target);
                self.inode_close(target);
                Ok(())
            }
            Err(e) => {
                self.inode_close(target);
                Err(e)
            }
        }
    }

    /// Whether `dir` holds no in-use entries beyond `.` and `..`.
    pub(crate) fn dir_is_empty(&self, dir: &InodeRef) -> bool {
        let mut offset = (2 * DIRENT_SIZE) as u32;
        while let Some(entry) = self.read_entry(dir, offset) {
            if entry.in_use != 0 {
                return false;
            }
            offset += DIRENT_SIZE as u32;
        }
        true
    }

    /// Returns the name of the next in-use entry, advancing the cursor;
    /// `.` and `..` are not reported.
    pub fn readdir(&self, dir: &mut Dir) -> Option<ArrayString<NAME_MAX>> {
        while let Some(entry) = self.read_entry(&dir.inode, dir.pos) {
            dir.pos += DIRENT_SIZE as u32;
            if entry.in_use != 0 {
                let name =
                    core::str::from_utf8(entry.name_bytes()).expect("corrupt directory entry");
                return Some(ArrayString::from(name).expect("corrupt directory entry"));
            }
        }
        None
    }

    fn read_entry(&self, dir: &InodeRef, offset: u32) -> Option<Dirent> {
        let mut entry = Dirent::zeroed();
        let read = self.read_at_inner(dir, entry.as_bytes_mut(), offset);
        if read == DIRENT_SIZE {
            Some(entry)
        } else {
            None
        }
    }

    fn write_entry(&self, dir: &InodeRef, offset: u32, entry: &Dirent) -> Result<(), FsError> {
        self.write_at_inner(dir, entry.as_bytes(), offset)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::device::MemDisk;
    use crate::fs::Cwd;

    fn fs() -> FileSystem<MemDisk> {
        FileSystem::new(Arc::new(MemDisk::new(512)), true)
    }

    fn names(fs: &FileSystem<MemDisk>, cwd: &Cwd, path: &str) -> Vec<String> {
        let mut dir = Dir::new(fs.open(cwd, path).unwrap()).unwrap();
        let mut out = Vec::new();
        while let Some(name) = fs.readdir(&mut dir) {
            out.push(name.as_str().to_string());
        }
        fs.close(dir.into_inode());
        out
    }

    #[test]
    fn readdir_skips_dot_entries() {
        let fs = fs();
        let cwd = Cwd::root();
        fs.mkdir(&cwd, "/d").unwrap();
        fs.create(&cwd, "/d/a", 0, false).unwrap();
        fs.create(&cwd, "/d/b", 0, false).unwrap();
        assert_eq!(names(&fs, &cwd, "/d"), ["a", "b"]);
        assert_eq!(names(&fs, &cwd, "/"), ["d"]);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let fs = fs();
        let cwd = Cwd::root();
        fs.create(&cwd, "/a", 0, false).unwrap();
        assert_eq!(fs.create(&cwd, "/a", 0, false), Err(FsError::Exists));
        assert_eq!(fs.mkdir(&cwd, "/a"), Err(FsError::Exists));
    }

    #[test]
    fn removed_slot_is_reused() {
        let fs = fs();
        let cwd = Cwd::root();
        fs.create(&cwd, "/a", 0, false).unwrap();
        fs.create(&cwd, "/b", 0, false).unwrap();
        let root = fs.open(&cwd, "/").unwrap();
        let len_before = fs.length(&root);
        fs.remove(&cwd, "/a").unwrap();
        fs.create(&cwd, "/c", 0, false).unwrap();
        // `c` landed in `a`'s old slot instead of growing the directory.
        assert_eq!(fs.length(&root), len_before);
        assert_eq!(names(&fs, &cwd, "/"), ["c", "b"]);
        fs.close(root);
    }

    #[test]
    fn dot_and_dotdot_resolve() {
        let fs = fs();
        let cwd = Cwd::root();
        fs.mkdir(&cwd, "/d").unwrap();
        fs.create(&cwd, "/d/f", 0, false).unwrap();
        let h = fs.open(&cwd, "/d/./f").unwrap();
        fs.close(h);
        let h = fs.open(&cwd, "/d/../d/f").unwrap();
        fs.close(h);
        let root = fs.open(&cwd, "/d/..").unwrap();
        assert_eq!(root.inumber(), crate::param::ROOT_DIR_SECTOR);
        fs.close(root);
    }

    #[test]
    fn lookup_through_subdirectories() {
        let fs = fs();
        let cwd = Cwd::root();
        fs.mkdir(&cwd, "/a").unwrap();
        fs.mkdir(&cwd, "/a/b").unwrap();
        fs.create(&cwd, "/a/b/c", 7, false).unwrap();
        let h = fs.open(&cwd, "/a/b/c").unwrap();
        assert_eq!(fs.length(&h), 7);
        assert!(!h.is_dir());
        fs.close(h);
        assert!(matches!(fs.open(&cwd, "/a/x"), Err(FsError::NotFound)));
        assert!(matches!(fs.open(&cwd, "/a/b/c/d"), Err(FsError::NotDirectory)));
    }
}
