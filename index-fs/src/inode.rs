//! In-memory inodes.
//!
//! [`DiskInode`] lives in a sector, [`Inode`] is what the rest of the
//! system holds. Opening a sector that is already open hands out the same
//! shared state with its open count bumped, so every opener observes the
//! same length, removal flag and deny-write count.

use std::sync::Arc;

use spin::{Mutex, MutexGuard};

use crate::error::{FsError, FsResult};
use crate::free_map::FreeMap;
use crate::layout::{DiskInode, MAX_FILE_SIZE};
use crate::FileSystem;

/// The state of a inode(file)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    /// inode number, i.e. the sector of the header
    pub ino: u32,
    /// file type
    pub mode: StatMode,
    /// length in bytes
    pub size: u32,
    /// sectors held, index sectors included
    pub blocks: u32,
}

bitflags! {
    /// The mode of a inode
    /// whether a directory or a file
    pub struct StatMode: u32 {
        /// null
        const NULL  = 0;
        /// directory
        const DIR   = 0o040000;
        /// ordinary regular file
        const FILE  = 0o100000;
    }
}

struct InodeState {
    open_count: usize,
    removed: bool,
    deny_write_count: usize,
    disk: DiskInode,
}

/// Shared state of one open sector; one per sector in the open table.
pub(crate) struct OpenInode {
    sector: u32,
    fs: Arc<FileSystem>,
    state: Mutex<InodeState>,
    /// serializes scan-then-write sequences on directory content
    dir_lock: Mutex<()>,
}

/// Take `count` sectors one at a time; on failure give back the ones
/// already taken.
fn allocate_each(free_map: &FreeMap, count: usize) -> FsResult<Vec<u32>> {
    let mut fresh = Vec::with_capacity(count);
    for _ in 0..count {
        match free_map.allocate(1) {
            Some(sector) => fresh.push(sector),
            None => {
                for &sector in fresh.iter() {
                    free_map.release(sector, 1);
                }
                return Err(FsError::NoSpace);
            }
        }
    }
    Ok(fresh)
}

/// Grow `disk` to `new_length`, allocating and zero-filling whatever the
/// index is missing. On failure `disk` and the free map are untouched.
fn extend(fs: &FileSystem, disk: &mut DiskInode, new_length: usize) -> FsResult<()> {
    if new_length > MAX_FILE_SIZE {
        return Err(FsError::FileTooLarge);
    }
    let fresh = allocate_each(fs.free_map(), disk.sectors_needed(new_length))?;
    disk.grow(new_length, fresh, fs.cache());
    Ok(())
}

/// An opener's handle on an inode.
///
/// Cloning reopens the inode and dropping closes it. When the last handle
/// of a removed inode is dropped, its data, index and header sectors go
/// back to the free map.
pub struct Inode {
    inner: Arc<OpenInode>,
}

impl Inode {
    /// Write a new inode of `length` bytes to `sector`, allocating every
    /// sector the length needs. Nothing stays allocated if this fails.
    pub fn create(fs: &FileSystem, sector: u32, length: usize, is_dir: bool) -> FsResult<()> {
        let mut disk = DiskInode::new(is_dir);
        extend(fs, &mut disk, length)?;
        fs.cache()
            .modify(sector as usize, 0, |stored: &mut DiskInode| *stored = disk);
        Ok(())
    }

    /// Open the inode stored at `sector`.
    pub fn open(fs: &Arc<FileSystem>, sector: u32) -> FsResult<Self> {
        let mut table = fs.open_inodes.lock();
        if let Some(inner) = table.get(&sector).and_then(|weak| weak.upgrade()) {
            inner.state.lock().open_count += 1;
            return Ok(Self { inner });
        }
        let disk = fs
            .cache()
            .read_with(sector as usize, 0, |disk: &DiskInode| *disk);
        if !disk.is_valid() {
            log::error!("inode: bad magic in sector {}", sector);
            return Err(FsError::Corrupted);
        }
        let inner = Arc::new(OpenInode {
            sector,
            fs: Arc::clone(fs),
            state: Mutex::new(InodeState {
                open_count: 1,
                removed: false,
                deny_write_count: 0,
                disk,
            }),
            dir_lock: Mutex::new(()),
        });
        table.insert(sector, Arc::downgrade(&inner));
        Ok(Self { inner })
    }

    /// Sector of the header, which doubles as the inode number
    pub fn sector(&self) -> u32 {
        self.inner.sector
    }

    /// The file system this inode belongs to
    pub fn fs(&self) -> &Arc<FileSystem> {
        &self.inner.fs
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.inner.state.lock().disk.length as usize
    }

    /// Whether the length is 0
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether this inode holds a directory
    pub fn is_dir(&self) -> bool {
        self.inner.state.lock().disk.is_dir()
    }

    /// Whether [`Inode::remove`] was called by any opener
    pub fn is_removed(&self) -> bool {
        self.inner.state.lock().removed
    }

    /// Number of live handles on this inode
    pub fn open_count(&self) -> usize {
        self.inner.state.lock().open_count
    }

    /// Whether both handles refer to the same open inode
    pub fn same_inode(&self, other: &Inode) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Mark the inode for deletion once its last handle is dropped.
    pub fn remove(&self) {
        self.inner.state.lock().removed = true;
    }

    /// Type, size and sectors held
    pub fn stat(&self) -> Stat {
        let state = self.inner.state.lock();
        Stat {
            ino: self.inner.sector,
            mode: if state.disk.is_dir() {
                StatMode::DIR
            } else {
                StatMode::FILE
            },
            size: state.disk.length,
            blocks: DiskInode::total_sectors(state.disk.length as usize) as u32,
        }
    }

    /// Read data from current inode.
    /// Returns fewer bytes than `buf` holds when the file ends first.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        let disk = self.inner.state.lock().disk;
        disk.read_at(offset, buf, self.inner.fs.cache())
    }

    /// Write data to current inode, growing it when the range ends past
    /// the current length.
    ///
    /// Returns 0 while writes are denied, for an empty `buf`, or when the
    /// growth cannot be allocated (the length is then unchanged).
    pub fn write_at(&self, offset: usize, buf: &[u8]) -> usize {
        let fs = &self.inner.fs;
        let mut state = self.inner.state.lock();
        if state.deny_write_count > 0 || buf.is_empty() {
            return 0;
        }
        let end = match offset.checked_add(buf.len()) {
            Some(end) if end <= MAX_FILE_SIZE => end,
            _ => return 0,
        };
        if end > state.disk.length as usize {
            let mut grown = state.disk;
            if let Err(err) = extend(fs, &mut grown, end) {
                log::debug!("inode {}: cannot grow to {} bytes: {}", self.inner.sector, end, err);
                return 0;
            }
            state.disk = grown;
            fs.cache()
                .modify(self.inner.sector as usize, 0, |stored: &mut DiskInode| *stored = grown);
        }
        state.disk.write_at(offset, buf, fs.cache())
    }

    /// Forbid writes, e.g. while the file is being executed.
    /// At most once per opener.
    pub fn deny_write(&self) {
        let mut state = self.inner.state.lock();
        state.deny_write_count += 1;
        assert!(state.deny_write_count <= state.open_count);
    }

    /// Undo one [`Inode::deny_write`] made by this opener.
    pub fn allow_write(&self) {
        let mut state = self.inner.state.lock();
        assert!(state.deny_write_count > 0);
        assert!(state.deny_write_count <= state.open_count);
        state.deny_write_count -= 1;
    }

    pub(crate) fn lock_dir(&self) -> MutexGuard<'_, ()> {
        self.inner.dir_lock.lock()
    }
}

impl Clone for Inode {
    fn clone(&self) -> Self {
        self.inner.state.lock().open_count += 1;
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Drop for Inode {
    fn drop(&mut self) {
        let fs = &self.inner.fs;
        let disk = {
            let mut table = fs.open_inodes.lock();
            let mut state = self.inner.state.lock();
            state.open_count -= 1;
            if state.open_count > 0 {
                return;
            }
            table.remove(&self.inner.sector);
            if !state.removed {
                return;
            }
            state.disk
        };
        self.inner.deallocate(disk);
    }
}

impl OpenInode {
    fn deallocate(&self, mut disk: DiskInode) {
        let free_map = self.fs.free_map();
        let length = disk.length;
        disk.release(self.fs.cache(), &mut |sector| free_map.release(sector, 1));
        free_map.release(self.sector, 1);
        log::debug!("inode {}: deallocated ({} bytes)", self.sector, length);
    }
}
