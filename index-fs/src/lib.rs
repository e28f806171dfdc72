//! An indexed file system over a sector device.
//!
//! The crate is layered bottom-up:
//! 1. [`BlockDevice`]: reads and writes whole 512-byte sectors.
//! 2. [`BlockCache`]: 64 write-back slots with clock replacement and an
//!    optional read-ahead thread. Nothing else touches the device.
//! 3. [`FreeMap`] and the on-disk structures in `layout`: super block,
//!    inode header with direct, indirect and doubly indirect pointers,
//!    directory entries.
//! 4. [`Inode`]: shared open inodes that grow on write and are released
//!    after the last close of a removed file.
//! 5. [`Dir`] and the `path` functions: named hierarchy with `.` and `..`.
//! 6. [`FileSystem`]: format, mount and the path-level operations.
//!
//! Disk layout: sector 0 holds the super block, sector 1 the root directory
//! inode, then the free-map bitmap; every other sector is allocated on
//! demand.
#![deny(missing_docs)]

#[macro_use]
extern crate bitflags;

mod block_cache;
mod block_dev;
mod config;
mod dir;
mod error;
mod free_map;
mod fs;
mod inode;
mod layout;
pub mod path;
mod sync;

pub use block_cache::{BlockCache, CacheStats};
pub use block_dev::{BlockDevice, RamDisk};
pub use config::*;
pub use dir::{validate_name, Dir};
pub use error::{FsError, FsResult};
pub use free_map::FreeMap;
pub use fs::{FileSystem, MountOptions};
pub use inode::{Inode, Stat, StatMode};
pub use layout::{DirEntry, DIRENT_SZ, MAX_FILE_SIZE};
