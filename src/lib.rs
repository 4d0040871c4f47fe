//! An extended file system. Five layers:
//!   + Free map: a persistent bitmap allocator for raw device sectors.
//!   + Buffer cache: a write-back cache of 64 sectors with LRU eviction.
//!   + Inodes: file contents behind direct, indirect, and doubly-indirect
//!     sector pointers, growing on demand up to ~8 MiB.
//!   + Directories: inodes with special contents (lists of other
//!     inodes!), always carrying `.` and `..`.
//!   + Names: paths like `/usr/src/efs` for convenient naming.
//!
//! The host supplies a [`Disk`] and drives the [`FileSystem`] facade;
//! everything in between lives here. Handles are explicit: every `open`
//! is paired with a `close`, working directories are [`Cwd`] values owned
//! by the host's processes, and file-descriptor tables stay on the host's
//! side of the line.
//!
//! Reads and non-growing writes to the same file run in parallel; a write
//! that grows a file briefly excludes the file's other users. Everything
//! is write-back: call [`FileSystem::done`] before dropping a mounted
//! file system, or whatever is still dirty in the cache stays there.

mod bio;
mod device;
mod fs;
mod param;

pub use crate::device::{Disk, MemDisk};
pub use crate::fs::{Cwd, Dir, FileName, FileSystem, FsError, Inode, InodeRef, Path};
pub use crate::param::{MAXLEN, NAME_MAX, ROOT_DIR_SECTOR, SECTOR_SIZE};
