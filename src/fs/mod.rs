//! File system implementation. Five layers:
//!   + Free map: allocator for raw device sectors.
//!   + Buffer cache: write-back cache of sectors (see `crate::bio`).
//!   + Inodes: indexed file contents, reading, writing, growth.
//!   + Directories: inodes with special contents (lists of other inodes!).
//!   + Names: paths like /usr/src/efs for convenient naming.
//!
//! This module contains the facade the host's system-call layer drives;
//! the lower layers live in the submodules.

use core::fmt;
use std::sync::Arc;

use crate::bio::Bcache;
use crate::device::Disk;
use crate::param::ROOT_DIR_SECTOR;

mod dir;
mod freemap;
mod inode;
mod path;

pub use dir::Dir;
pub use inode::{Inode, InodeRef};
pub use path::{FileName, Path};

use freemap::FreeMap;
use inode::Itable;

/// Why a file system operation was refused.
///
/// Every refusal is reported this way; invariant violations (bad magic,
/// an eviction with every slot pinned, more deny-writes than openers)
/// denote corruption and panic instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FsError {
    /// The free map could not supply the requested sectors.
    NoSpace,
    /// A path component or directory entry does not exist.
    NotFound,
    /// A non-terminal path component is not a directory.
    NotDirectory,
    /// The operation expects a file but was handed a directory.
    IsDirectory,
    /// A path component is longer than `NAME_MAX`.
    NameTooLong,
    /// The directory already has an entry with this name.
    Exists,
    /// The target is the root, is not empty, or is still held open or as
    /// a working directory.
    Busy,
    /// The handle no longer names a live inode.
    InvalidHandle,
    /// Writes to this inode are currently denied.
    ReadOnly,
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            FsError::NoSpace => "no space on device",
            FsError::NotFound => "no such file or directory",
            FsError::NotDirectory => "not a directory",
            FsError::IsDirectory => "is a directory",
            FsError::NameTooLong => "file name too long",
            FsError::Exists => "file exists",
            FsError::Busy => "directory busy",
            FsError::InvalidHandle => "invalid handle",
            FsError::ReadOnly => "writes denied",
        };
        write!(f, "{}", msg)
    }
}

impl std::error::Error for FsError {}

/// A process's working directory.
///
/// Holds the directory's inumber plus an open handle that pins the
/// directory for as long as it is current, so `remove` can refuse it as
/// busy. The root needs no pin; it is never removable.
pub struct Cwd {
    inum: u32,
    held: Option<InodeRef>,
}

impl Cwd {
    /// The working directory every process starts with: the root.
    pub fn root() -> Self {
        Self {
            inum: ROOT_DIR_SECTOR,
            held: None,
        }
    }

    /// Inumber of the current directory.
    pub fn inumber(&self) -> u32 {
        self.inum
    }
}

/// A mounted file system.
///
/// Owns the sector cache, the free map, and the open-inode table; every
/// operation takes it explicitly. Call [`FileSystem::done`] before
/// dropping the value, or dirty sectors stay behind in the cache.
pub struct FileSystem<D: Disk> {
    disk: Arc<D>,
    pub(crate) cache: Bcache<D>,
    pub(crate) free_map: FreeMap,
    pub(crate) itable: Itable,
}

impl<D: Disk> FileSystem<D> {
    /// Mounts the file system on `disk`. When `format` is set, writes a
    /// fresh free map and root directory first; otherwise the device must
    /// already hold a file system.
    pub fn new(disk: Arc<D>, format: bool) -> Self {
        let fs = Self {
            cache: Bcache::new(disk.clone()),
            free_map: FreeMap::new(disk.size()),
            itable: Itable::new(),
            disk,
        };
        if format {
            fs.do_format();
        }
        fs.free_map_open();
        log::info!("file system mounted ({} sectors)", fs.disk.size());
        fs
    }

    /// Writes a fresh file system: the free-map file on sector 0 and an
    /// empty root directory on sector 1.
    fn do_format(&self) {
        log::info!("formatting file system");
        self.free_map_create();
        self.inode_create(ROOT_DIR_SECTOR, 2 * dir::DIRENT_SIZE as u32)
            .expect("root directory creation failed");
        let root = self.inode_open(ROOT_DIR_SECTOR, true);
        let init = self.dir_init(&root, ROOT_DIR_SECTOR);
        self.inode_close(root);
        init.expect("root directory creation failed");
        self.free_map_close();
    }

    /// Shuts the file system down, persisting the free map and writing
    /// every dirty cached sector back to the device.
    pub fn done(&self) {
        self.free_map_close();
        self.cache.flush();
        log::info!("file system flushed");
    }

    /// The underlying device, mainly for its traffic counters.
    pub fn disk(&self) -> &D {
        &self.disk
    }

    /// Creates a file (or, with `is_dir`, a directory pre-populated with
    /// `.` and `..`) named by `path`, with `initial_size` bytes of zeros.
    pub fn create(
        &self,
        cwd: &Cwd,
        path: &str,
        initial_size: u32,
        is_dir: bool,
    ) -> Result<(), FsError> {
        if path.is_empty() {
            return Err(FsError::NotFound);
        }
        let (parent, name) = self.nameiparent(cwd, Path::new(path))?;
        let result = self.create_in(&parent, name, initial_size, is_dir);
        self.inode_close(parent);
        result
    }

    /// Creates an empty directory named by `path`.
    pub fn mkdir(&self, cwd: &Cwd, path: &str) -> Result<(), FsError> {
        self.create(cwd, path, 0, true)
    }

    /// Opens the file or directory named by `path`. Directory handles are
    /// counted so `remove` can refuse a directory somebody holds open;
    /// release every handle with [`FileSystem::close`].
    pub fn open(&self, cwd: &Cwd, path: &str) -> Result<InodeRef, FsError> {
        if path.is_empty() {
            return Err(FsError::NotFound);
        }
        let handle = self.namei(cwd, Path::new(path))?;
        if handle.is_dir() && !handle.is_root() {
            handle.meta.write().ref_open += 1;
        }
        Ok(handle)
    }

    /// Closes a handle obtained from [`FileSystem::open`]. If the inode
    /// was removed and this was its last handle, its sectors return to
    /// the free map.
    pub fn close(&self, handle: InodeRef) {
        if handle.is_dir() && !handle.is_root() {
            let mut meta = handle.meta.write();
            assert!(meta.ref_open > 0, "close: directory handle not counted");
            meta.ref_open -= 1;
        }
        self.inode_close(handle);
    }

    /// Removes the file or directory named by `path`. A directory must be
    /// empty and must not be the root, anybody's working directory, or
    /// held open.
    pub fn remove(&self, cwd: &Cwd, path: &str) -> Result<(), FsError> {
        if path.is_empty() {
            return Err(FsError::NotFound);
        }
        let (parent, name) = self.nameiparent(cwd, Path::new(path))?;
        let result = self.remove_in(&parent, name);
        self.inode_close(parent);
        result
    }

    /// Changes `cwd` to the directory named by `path`, moving the
    /// busy-pin from the old working directory to the new one.
    pub fn chdir(&self, cwd: &mut Cwd, path: &str) -> Result<(), FsError> {
        if path.is_empty() {
            return Err(FsError::NotFound);
        }
        let handle = self.namei(cwd, Path::new(path))?;
        if !handle.is_dir() {
            self.inode_close(handle);
            return Err(FsError::NotDirectory);
        }
        let old = cwd.held.take();
        cwd.inum = handle.inumber();
        if handle.is_root() {
            self.inode_close(handle);
        } else {
            handle.meta.write().ref_cwd += 1;
            cwd.held = Some(handle);
        }
        if let Some(old) = old {
            old.meta.write().ref_cwd -= 1;
            self.inode_close(old);
        }
        Ok(())
    }

    /// Releases a working directory at process exit.
    pub fn cwd_close(&self, mut cwd: Cwd) {
        if let Some(held) = cwd.held.take() {
            held.meta.write().ref_cwd -= 1;
            self.inode_close(held);
        }
    }

    fn create_in(
        &self,
        parent: &InodeRef,
        name: &FileName,
        initial_size: u32,
        is_dir: bool,
    ) -> Result<(), FsError> {
        let sector = self.free_map_allocate(1)?;
        if let Err(e) = self.inode_create(sector, initial_size) {
            self.free_map_release(sector, 1);
            return Err(e);
        }
        let result = (|| {
            if is_dir {
                let new_dir = self.inode_open(sector, true);
                let init = self.dir_init(&new_dir, parent.inumber());
                self.inode_close(new_dir);
                init?;
            }
            self.dir_add(parent, name, sector, is_dir)
        })();
        if result.is_err() {
            // Unwind: the inode exists on disk but was never linked, so
            // deleting it returns its sectors to the free map.
            let doomed = self.inode_open(sector, is_dir);
            self.inode_remove(&doomed);
            self.inode_close(doomed);
        }
        result
    }

    fn remove_in(&self, parent: &InodeRef, name: &FileName) -> Result<(), FsError> {
        let (target, _) = self.dir_lookup(parent, name)?;
        let result = (|| {
            if target.is_dir() {
                if target.is_root() {
                    return Err(FsError::Busy);
                }
                {
                    let meta = target.meta.read();
                    if meta.ref_open > 0 || meta.ref_cwd > 0 {
                        return Err(FsError::Busy);
                    }
                }
                if !self.dir_is_empty(&target) {
                    return Err(FsError::Busy);
                }
            }
            self.dir_remove(parent, name)
        })();
        self.inode_close(target);
        result
    }

    fn namei(&self, cwd: &Cwd, path: &Path) -> Result<InodeRef, FsError> {
        Ok(self.namex(cwd, path, false)?.0)
    }

    fn nameiparent<'p>(
        &self,
        cwd: &Cwd,
        path: &'p Path,
    ) -> Result<(InodeRef, &'p FileName), FsError> {
        let (ino, name) = self.namex(cwd, path, true)?;
        let name = name.expect("nameiparent: no terminal component");
        Ok((ino, name))
    }

    /// Walks `path` from the root or from `cwd`, opening and closing one
    /// directory at a time. With `parent`, stops one level early and
    /// returns the directory that contains the terminal component along
    /// with that component's name.
    fn namex<'p>(
        &self,
        cwd: &Cwd,
        mut path: &'p Path,
        parent: bool,
    ) -> Result<(InodeRef, Option<&'p FileName>), FsError> {
        let mut cur = if path.is_absolute() {
            self.inode_open(ROOT_DIR_SECTOR, true)
        } else {
            self.inode_open(cwd.inum, true)
        };
        loop {
            let elem = match path.skipelem() {
                Ok(elem) => elem,
                Err(e) => {
                    self.inode_close(cur);
                    return Err(e);
                }
            };
            let (rest, name) = match elem {
                Some(pair) => pair,
                None => break,
            };
            if !cur.is_dir() {
                self.inode_close(cur);
                return Err(FsError::NotDirectory);
            }
            if parent && rest.is_empty_string() {
                return Ok((cur, Some(name)));
            }
            let next = match self.dir_lookup(&cur, name) {
                Ok((next, _)) => next,
                Err(e) => {
                    self.inode_close(cur);
                    return Err(e);
                }
            };
            self.inode_close(cur);
            cur = next;
            path = rest;
        }
        if parent {
            // The path named the root or was all slashes; there is no
            // containing directory to return.
            self.inode_close(cur);
            return Err(FsError::NotFound);
        }
        Ok((cur, None))
    }
}
