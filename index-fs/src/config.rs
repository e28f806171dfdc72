//! Constants used in index-fs

/// Use a sector size of 512 bytes
pub const SECTOR_SIZE: usize = 512;
/// Number of bits in one sector, used by the free map
pub const SECTOR_BITS: usize = SECTOR_SIZE * 8;
/// Use a buffer cache of 64 sectors
pub const CACHE_CAPACITY: usize = 64;
/// The max length of a directory entry name
pub const NAME_MAX: usize = 27;

/// Sector of the super block
pub const SUPER_SECTOR: u32 = 0;
/// Sector of the root directory inode
pub const ROOT_DIR_SECTOR: u32 = 1;
/// First sector of the free map bitmap
pub const FREE_MAP_START: u32 = 2;
/// Number of entries the root directory is created with
pub const ROOT_DIR_ENTRIES: usize = 16;
