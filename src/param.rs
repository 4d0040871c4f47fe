//! File system parameters.

/// Size of a device sector in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Size of the sector cache.
pub const NBUF: usize = 64;

/// Direct sector pointers per on-disk inode.
pub const NDIRECT: usize = 12;

/// Sector pointers per indirect sector.
pub const NINDIRECT: usize = SECTOR_SIZE / core::mem::size_of::<u32>();

/// Maximum number of data sectors addressable by one inode.
pub const MAXSECTORS: usize = NDIRECT + NINDIRECT + NINDIRECT * NINDIRECT;

/// Maximum representable file length in bytes.
pub const MAXLEN: usize = MAXSECTORS * SECTOR_SIZE;

/// Maximum length of a file name component.
pub const NAME_MAX: usize = 14;

/// Sector holding the free-map file inode.
pub const FREE_MAP_SECTOR: u32 = 0;

/// Sector holding the root-directory inode.
pub const ROOT_DIR_SECTOR: u32 = 1;
