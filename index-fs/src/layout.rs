use core::fmt::{Debug, Formatter, Result};

use crate::block_cache::{BlockCache, Plain};
use crate::{NAME_MAX, SECTOR_SIZE};

/// Magic number for sanity check of the super block
const FS_MAGIC: u32 = 0x3b800001;
/// Magic number stored in every inode header
pub const INODE_MAGIC: u32 = 0x494e4f44;

/// The number of direct pointers in an inode header
pub const DIRECT_COUNT: usize = 123;
/// The number of sector pointers held by one index sector
pub const INDIRECT_COUNT: usize = SECTOR_SIZE / 4;
/// The number of data sectors reachable through the doubly indirect pointer
pub const DOUBLY_INDIRECT_COUNT: usize = INDIRECT_COUNT * INDIRECT_COUNT;
/// The upper bound of direct block indices
const DIRECT_BOUND: usize = DIRECT_COUNT;
/// The upper bound of indirect block indices
const INDIRECT_BOUND: usize = DIRECT_BOUND + INDIRECT_COUNT;
/// The upper bound of doubly indirect block indices
const DOUBLY_INDIRECT_BOUND: usize = INDIRECT_BOUND + DOUBLY_INDIRECT_COUNT;
/// The largest file length the index can map, in bytes
pub const MAX_FILE_SIZE: usize = DOUBLY_INDIRECT_BOUND * SECTOR_SIZE;

/// An index sector: pointers to data sectors or to other index sectors
pub type IndirectBlock = [u32; INDIRECT_COUNT];
/// A data sector
pub type DataBlock = [u8; SECTOR_SIZE];

/// Super block of a filesystem
#[repr(C)]
pub struct SuperBlock {
    magic: u32,
    /// sectors on the device
    pub total_sectors: u32,
    /// first sector of the free map
    pub free_map_start: u32,
    /// sectors the free map occupies
    pub free_map_sectors: u32,
    /// sector of the root directory inode
    pub root_sector: u32,
}

unsafe impl Plain for SuperBlock {}

impl Debug for SuperBlock {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        f.debug_struct("SuperBlock")
            .field("total_sectors", &self.total_sectors)
            .field("free_map_start", &self.free_map_start)
            .field("free_map_sectors", &self.free_map_sectors)
            .field("root_sector", &self.root_sector)
            .finish()
    }
}

impl SuperBlock {
    /// Initialize a super block
    pub fn initialize(
        &mut self,
        total_sectors: u32,
        free_map_start: u32,
        free_map_sectors: u32,
        root_sector: u32,
    ) {
        *self = Self {
            magic: FS_MAGIC,
            total_sectors,
            free_map_start,
            free_map_sectors,
            root_sector,
        }
    }
    /// Check if a super block is valid using its magic
    pub fn is_valid(&self) -> bool {
        self.magic == FS_MAGIC
    }
}

/// On-disk inode header, exactly one sector.
///
/// Logical block `i` of the file lives in
/// - `direct[i]` for the first `DIRECT_COUNT` blocks,
/// - slot `i - DIRECT_COUNT` of the `indirect` index sector for the next
///   `INDIRECT_COUNT` blocks,
/// - the doubly indirect tree for the following `DOUBLY_INDIRECT_COUNT`.
///
/// A pointer of 0 means "not allocated". The number of allocated sectors is
/// always [`DiskInode::total_sectors`] of `length`.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct DiskInode {
    is_dir: u32,
    /// length in bytes
    pub length: u32,
    magic: u32,
    /// data sectors of the first `DIRECT_COUNT` blocks
    pub direct: [u32; DIRECT_COUNT],
    /// index sector of the next `INDIRECT_COUNT` blocks
    pub indirect: u32,
    /// top index sector of the doubly indirect tree
    pub doubly_indirect: u32,
}

const _: () = assert!(core::mem::size_of::<DiskInode>() == SECTOR_SIZE);

unsafe impl Plain for DiskInode {}

impl Debug for DiskInode {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        f.debug_struct("DiskInode")
            .field("is_dir", &self.is_dir())
            .field("length", &self.length)
            .field("indirect", &self.indirect)
            .field("doubly_indirect", &self.doubly_indirect)
            .finish()
    }
}

fn div_ceil(n: usize, d: usize) -> usize {
    (n + d - 1) / d
}

impl DiskInode {
    /// A header for an empty file or directory; nothing is allocated yet
    pub fn new(is_dir: bool) -> Self {
        Self {
            is_dir: is_dir as u32,
            length: 0,
            magic: INODE_MAGIC,
            direct: [0; DIRECT_COUNT],
            indirect: 0,
            doubly_indirect: 0,
        }
    }
    /// Whether the header carries the inode magic
    pub fn is_valid(&self) -> bool {
        self.magic == INODE_MAGIC
    }
    /// Whether this inode is a directory
    pub fn is_dir(&self) -> bool {
        self.is_dir != 0
    }

    /// Number of data sectors covering `length` bytes.
    pub fn data_sectors(length: usize) -> usize {
        div_ceil(length, SECTOR_SIZE)
    }

    /// Number of sectors needed for `length` bytes, index sectors included.
    pub fn total_sectors(length: usize) -> usize {
        let data = Self::data_sectors(length);
        let mut total = data;
        if data > DIRECT_BOUND {
            total += 1;
        }
        if data > INDIRECT_BOUND {
            total += 1 + div_ceil(data - INDIRECT_BOUND, INDIRECT_COUNT);
        }
        total
    }

    /// Sectors that must be allocated to grow this inode to `new_length`
    pub fn sectors_needed(&self, new_length: usize) -> usize {
        assert!(new_length >= self.length as usize);
        Self::total_sectors(new_length) - Self::total_sectors(self.length as usize)
    }

    /// Data sector holding logical block `index`.
    pub fn block_id(&self, index: usize, cache: &BlockCache) -> u32 {
        if index < DIRECT_BOUND {
            self.direct[index]
        } else if index < INDIRECT_BOUND {
            cache.read_with(self.indirect as usize, 0, |indirect: &IndirectBlock| {
                indirect[index - DIRECT_BOUND]
            })
        } else {
            assert!(index < DOUBLY_INDIRECT_BOUND, "block index {} out of range", index);
            let last = index - INDIRECT_BOUND;
            let second = cache.read_with(self.doubly_indirect as usize, 0, |top: &IndirectBlock| {
                top[last / INDIRECT_COUNT]
            });
            cache.read_with(second as usize, 0, |second: &IndirectBlock| {
                second[last % INDIRECT_COUNT]
            })
        }
    }

    /// Grow the index so that it covers `new_length` bytes.
    ///
    /// `fresh` must yield exactly [`DiskInode::sectors_needed`] sectors; each
    /// one is zero-filled before it is linked in. Pointers that are already
    /// set are kept.
    pub fn grow(&mut self, new_length: usize, fresh: Vec<u32>, cache: &BlockCache) {
        let mut fresh = fresh.into_iter();
        let mut remaining = Self::data_sectors(new_length);

        let direct = remaining.min(DIRECT_COUNT);
        for slot in self.direct.iter_mut().take(direct) {
            *slot = fill_index(*slot, 1, 0, &mut fresh, cache);
        }
        remaining -= direct;

        if remaining > 0 {
            let count = remaining.min(INDIRECT_COUNT);
            self.indirect = fill_index(self.indirect, count, 1, &mut fresh, cache);
            remaining -= count;
        }
        if remaining > 0 {
            let count = remaining.min(DOUBLY_INDIRECT_COUNT);
            self.doubly_indirect = fill_index(self.doubly_indirect, count, 2, &mut fresh, cache);
            remaining -= count;
        }
        assert_eq!(remaining, 0, "length {} beyond the index", new_length);
        assert!(fresh.next().is_none(), "more sectors than needed");
        self.length = new_length as u32;
    }

    /// Hand every data and index sector to `release`, leaves before the
    /// index sector that points at them, and reset the header to length 0.
    pub fn release(&mut self, cache: &BlockCache, release: &mut impl FnMut(u32)) {
        let mut remaining = Self::data_sectors(self.length as usize);

        let direct = remaining.min(DIRECT_COUNT);
        for slot in self.direct.iter_mut().take(direct) {
            release(*slot);
            *slot = 0;
        }
        remaining -= direct;

        if remaining > 0 {
            let count = remaining.min(INDIRECT_COUNT);
            release_index(self.indirect, count, 1, cache, release);
            self.indirect = 0;
            remaining -= count;
        }
        if remaining > 0 {
            let count = remaining.min(DOUBLY_INDIRECT_COUNT);
            release_index(self.doubly_indirect, count, 2, cache, release);
            self.doubly_indirect = 0;
        }
        self.length = 0;
    }

    /// Read data from current disk inode.
    /// Stops at `length`; returns the number of bytes copied.
    pub fn read_at(&self, offset: usize, buf: &mut [u8], cache: &BlockCache) -> usize {
        let end = offset.saturating_add(buf.len()).min(self.length as usize);
        if offset >= end {
            return 0;
        }
        let mut bounce = [0u8; SECTOR_SIZE];
        let mut start = offset;
        let mut read_size = 0usize;
        while start < end {
            let sector_ofs = start % SECTOR_SIZE;
            let chunk = (SECTOR_SIZE - sector_ofs).min(end - start);
            let sector = self.block_id(start / SECTOR_SIZE, cache) as usize;
            let dst = &mut buf[read_size..read_size + chunk];
            if chunk == SECTOR_SIZE {
                cache.read(sector, dst);
            } else {
                cache.read(sector, &mut bounce);
                dst.copy_from_slice(&bounce[sector_ofs..sector_ofs + chunk]);
            }
            read_size += chunk;
            start += chunk;
        }
        read_size
    }

    /// Write data into current disk inode.
    /// `length` must be adjusted beforehand; bytes past it are dropped.
    pub fn write_at(&self, offset: usize, buf: &[u8], cache: &BlockCache) -> usize {
        let end = offset.saturating_add(buf.len()).min(self.length as usize);
        if offset >= end {
            return 0;
        }
        let mut bounce = [0u8; SECTOR_SIZE];
        let mut start = offset;
        let mut write_size = 0usize;
        while start < end {
            let sector_ofs = start % SECTOR_SIZE;
            let chunk = (SECTOR_SIZE - sector_ofs).min(end - start);
            let sector = self.block_id(start / SECTOR_SIZE, cache) as usize;
            let src = &buf[write_size..write_size + chunk];
            if chunk == SECTOR_SIZE {
                cache.write(sector, src);
            } else {
                // keep the bytes around the chunk
                cache.read(sector, &mut bounce);
                bounce[sector_ofs..sector_ofs + chunk].copy_from_slice(src);
                cache.write(sector, &bounce);
            }
            write_size += chunk;
            start += chunk;
        }
        write_size
    }
}

/// Make sure `entry` (0 if absent) maps `sectors` sectors at `level`
/// (0 = data sector, 1 = indirect, 2 = doubly indirect), taking missing
/// sectors from `fresh`. Returns the possibly new `entry`.
fn fill_index(
    entry: u32,
    sectors: usize,
    level: u32,
    fresh: &mut impl Iterator<Item = u32>,
    cache: &BlockCache,
) -> u32 {
    let entry = if entry == 0 {
        let sector = fresh.next().expect("sector count mismatch while growing");
        cache.zero(sector as usize);
        sector
    } else {
        entry
    };
    if level == 0 {
        return entry;
    }
    let mut index = cache.read_with(entry as usize, 0, |index: &IndirectBlock| *index);
    let per_child = INDIRECT_COUNT.pow(level - 1);
    let mut remaining = sectors;
    for slot in index.iter_mut().take(div_ceil(sectors, per_child)) {
        let count = remaining.min(per_child);
        *slot = fill_index(*slot, count, level - 1, fresh, cache);
        remaining -= count;
    }
    cache.modify(entry as usize, 0, |stored: &mut IndirectBlock| *stored = index);
    entry
}

/// Mirror of [`fill_index`]: releases the `sectors` sectors mapped below
/// `entry`, then `entry` itself.
fn release_index(
    entry: u32,
    sectors: usize,
    level: u32,
    cache: &BlockCache,
    release: &mut impl FnMut(u32),
) {
    if level > 0 {
        let index = cache.read_with(entry as usize, 0, |index: &IndirectBlock| *index);
        let per_child = INDIRECT_COUNT.pow(level - 1);
        let mut remaining = sectors;
        for &child in index.iter().take(div_ceil(sectors, per_child)) {
            let count = remaining.min(per_child);
            release_index(child, count, level - 1, cache, release);
            remaining -= count;
        }
    }
    release(entry);
}

/// A directory entry, 32 bytes on disk
#[derive(Clone, Copy)]
#[repr(C)]
pub struct DirEntry {
    inode_sector: u32,
    name: [u8; NAME_MAX],
    in_use: u8,
}

/// Size of a directory entry
pub const DIRENT_SZ: usize = 32;

const _: () = assert!(core::mem::size_of::<DirEntry>() == DIRENT_SZ);

impl DirEntry {
    /// Create an empty directory entry
    pub fn empty() -> Self {
        Self {
            inode_sector: 0,
            name: [0u8; NAME_MAX],
            in_use: 0,
        }
    }
    /// Create an in-use directory entry from name and inode sector.
    /// The caller has checked `name.len() <= NAME_MAX`.
    pub fn new(name: &str, inode_sector: u32) -> Self {
        let mut bytes = [0u8; NAME_MAX];
        bytes[..name.len()].copy_from_slice(name.as_bytes());
        Self {
            inode_sector,
            name: bytes,
            in_use: 1,
        }
    }
    /// The reserved slot 0 of a directory, pointing at its parent
    pub fn parent(inode_sector: u32) -> Self {
        Self {
            inode_sector,
            ..Self::empty()
        }
    }
    /// Serialize into bytes
    pub fn as_bytes(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self as *const _ as *const u8, DIRENT_SZ) }
    }
    /// Serialize into mutable bytes
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self as *mut _ as *mut u8, DIRENT_SZ) }
    }
    /// Get name of the entry
    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(NAME_MAX);
        core::str::from_utf8(&self.name[..len]).unwrap_or("")
    }
    /// Get inode sector of the entry
    pub fn inode_sector(&self) -> u32 {
        self.inode_sector
    }
    /// Whether the slot holds a live entry
    pub fn in_use(&self) -> bool {
        self.in_use != 0
    }
    /// Turn the entry into a tombstone
    pub fn clear(&mut self) {
        self.in_use = 0;
    }
}
