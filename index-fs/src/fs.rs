use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use spin::Mutex;

use crate::block_cache::BlockCache;
use crate::dir::{validate_name, Dir};
use crate::error::{FsError, FsResult};
use crate::free_map::FreeMap;
use crate::inode::{Inode, OpenInode, Stat};
use crate::layout::SuperBlock;
use crate::path;
use crate::{BlockDevice, FREE_MAP_START, ROOT_DIR_ENTRIES, ROOT_DIR_SECTOR, SUPER_SECTOR};

/// Runtime knobs chosen when a device is formatted or mounted
#[derive(Debug, Clone, Copy)]
pub struct MountOptions {
    /// Prefetch the sector after each one read, on a background thread
    pub read_ahead: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self { read_ahead: true }
    }
}

/// A mounted file system.
///
/// Owns the buffer cache, the free map and the table of open inodes.
/// Paths are resolved against the root, or against a caller-owned current
/// directory passed in as `cwd`.
pub struct FileSystem {
    cache: Arc<BlockCache>,
    free_map: FreeMap,
    /// one entry per open sector; handles keep the entry alive
    pub(crate) open_inodes: Mutex<BTreeMap<u32, Weak<OpenInode>>>,
}

impl FileSystem {
    /// Write an empty file system to `device`: super block, free map and
    /// a root directory that is its own parent.
    pub fn format(device: Arc<dyn BlockDevice>, options: MountOptions) -> FsResult<Arc<Self>> {
        let total = device.block_count();
        let free_map_sectors = FreeMap::sectors_for(total);
        if total <= (FREE_MAP_START + free_map_sectors) as usize {
            return Err(FsError::NoSpace);
        }
        let cache = BlockCache::new(device, options.read_ahead);
        cache.zero(SUPER_SECTOR as usize);
        cache.zero(ROOT_DIR_SECTOR as usize);
        let free_map = FreeMap::create(Arc::clone(&cache), FREE_MAP_START, total);
        cache.modify(SUPER_SECTOR as usize, 0, |super_block: &mut SuperBlock| {
            super_block.initialize(total as u32, FREE_MAP_START, free_map_sectors, ROOT_DIR_SECTOR)
        });
        let fs = Arc::new(Self {
            cache,
            free_map,
            open_inodes: Mutex::new(BTreeMap::new()),
        });
        Dir::create(&fs, ROOT_DIR_SECTOR, ROOT_DIR_ENTRIES, ROOT_DIR_SECTOR)?;
        fs.cache.flush();
        log::debug!(
            "format: {} sectors, free map {} sector(s), {} free",
            total,
            free_map_sectors,
            fs.free_sectors()
        );
        Ok(fs)
    }

    /// Open a file system previously written by [`FileSystem::format`].
    pub fn mount(device: Arc<dyn BlockDevice>, options: MountOptions) -> FsResult<Arc<Self>> {
        let cache = BlockCache::new(device, options.read_ahead);
        let super_block = cache.read_with(SUPER_SECTOR as usize, 0, |super_block: &SuperBlock| {
            super_block.is_valid().then(|| {
                (
                    super_block.free_map_start,
                    super_block.free_map_sectors,
                    super_block.total_sectors as usize,
                )
            })
        });
        let (start, sectors, total) = match super_block {
            Some(fields) if fields.2 <= cache.device().block_count() => fields,
            _ => {
                log::error!("mount: no file system found");
                return Err(FsError::Corrupted);
            }
        };
        let free_map = FreeMap::open(Arc::clone(&cache), start, sectors, total);
        log::debug!("mount: {} sectors, {} free", total, free_map.free_count());
        Ok(Arc::new(Self {
            cache,
            free_map,
            open_inodes: Mutex::new(BTreeMap::new()),
        }))
    }

    /// The buffer cache every sector goes through
    pub fn cache(&self) -> &Arc<BlockCache> {
        &self.cache
    }

    /// The free-space bitmap
    pub fn free_map(&self) -> &FreeMap {
        &self.free_map
    }

    /// Open the root directory.
    pub fn root_dir(self: &Arc<Self>) -> FsResult<Dir> {
        Dir::open_root(self)
    }

    /// Create a file of `initial_size` zero bytes, or an empty directory,
    /// at `path`. Nothing stays allocated if this fails.
    pub fn create(
        self: &Arc<Self>,
        cwd: Option<&Dir>,
        path: &str,
        initial_size: usize,
        is_dir: bool,
    ) -> FsResult<()> {
        let (dir, name) = path::split(self, cwd, path)?;
        validate_name(&name)?;
        let sector = self.free_map.allocate(1).ok_or(FsError::NoSpace)?;
        if let Err(err) = Inode::create(self, sector, initial_size, is_dir) {
            self.free_map.release(sector, 1);
            return Err(err);
        }
        if let Err(err) = dir.add(&name, sector, is_dir) {
            self.discard(sector);
            return Err(err);
        }
        log::debug!(
            "create: {:?} at sector {} ({})",
            path,
            sector,
            if is_dir { "dir" } else { "file" }
        );
        Ok(())
    }

    /// Give back an inode that never got a directory entry.
    fn discard(self: &Arc<Self>, sector: u32) {
        match Inode::open(self, sector) {
            // the last close gives back the header and whatever it indexes
            Ok(orphan) => orphan.remove(),
            Err(err) => {
                log::warn!("create: releasing unreadable inode {}: {}", sector, err);
                self.free_map.release(sector, 1);
            }
        }
    }

    /// Create an empty directory at `path`.
    pub fn mkdir(self: &Arc<Self>, cwd: Option<&Dir>, path: &str) -> FsResult<()> {
        self.create(cwd, path, 0, true)
    }

    /// Open the file or directory at `path`.
    /// A path naming a directory by separators alone (`/`) opens it.
    pub fn open(self: &Arc<Self>, cwd: Option<&Dir>, path: &str) -> FsResult<Inode> {
        let (dir, name) = path::split(self, cwd, path)?;
        let inode = if name.is_empty() {
            dir.into_inode()
        } else {
            dir.lookup(&name)?
        };
        if inode.is_removed() {
            return Err(FsError::NotFound);
        }
        Ok(inode)
    }

    /// Open the directory at `path`.
    pub fn open_dir(self: &Arc<Self>, cwd: Option<&Dir>, path: &str) -> FsResult<Dir> {
        Dir::open(self.open(cwd, path)?)
    }

    /// Remove the entry at `path`. Its inode lives on until the last
    /// handle on it is dropped.
    pub fn remove(self: &Arc<Self>, cwd: Option<&Dir>, path: &str) -> FsResult<()> {
        let (dir, name) = path::split(self, cwd, path)?;
        if name.is_empty() {
            return Err(FsError::Busy);
        }
        dir.remove(&name)?;
        log::debug!("remove: {:?}", path);
        Ok(())
    }

    /// Make the directory at `path` the current directory. `cwd` is left
    /// alone when the path does not resolve.
    pub fn chdir(self: &Arc<Self>, cwd: &mut Option<Dir>, path: &str) -> FsResult<()> {
        let dir = path::open_path(self, cwd.as_ref(), path)?;
        *cwd = Some(dir);
        Ok(())
    }

    /// Stat the file or directory at `path`.
    pub fn stat(self: &Arc<Self>, cwd: Option<&Dir>, path: &str) -> FsResult<Stat> {
        Ok(self.open(cwd, path)?.stat())
    }

    /// Sectors the free map can still hand out
    pub fn free_sectors(&self) -> usize {
        self.free_map.free_count()
    }

    /// Inodes with at least one live handle
    pub fn open_inode_count(&self) -> usize {
        self.open_inodes
            .lock()
            .values()
            .filter(|inode| inode.strong_count() > 0)
            .count()
    }

    /// Write every dirty sector back and stop read-ahead.
    pub fn shutdown(&self) {
        self.cache.shutdown();
        log::debug!("shutdown: {:?}", self.cache.stats());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RamDisk, StatMode};

    fn setup() -> Arc<FileSystem> {
        let disk = Arc::new(RamDisk::new(2048));
        FileSystem::format(disk, MountOptions { read_ahead: false }).unwrap()
    }

    #[test]
    fn nested_directories() {
        let fs = setup();
        fs.mkdir(None, "/a").unwrap();
        fs.mkdir(None, "/a/b").unwrap();
        let a = fs.open(None, "/a").unwrap();
        let b = fs.open(None, "/a/b").unwrap();
        assert!(a.is_dir() && b.is_dir());
        assert!(fs.open(None, "/a/b/..").unwrap().same_inode(&a));
        assert!(fs.open(None, "/a/./b/.").unwrap().same_inode(&b));
        assert_eq!(fs.open(None, "/").unwrap().sector(), ROOT_DIR_SECTOR);
        assert_eq!(fs.open(None, "/a/c").err(), Some(FsError::NotFound));
        assert_eq!(fs.mkdir(None, "/x/y"), Err(FsError::NotFound));

        let names: Vec<String> = fs.open_dir(None, "/a").unwrap().collect();
        assert_eq!(names, vec!["b"]);
        drop((a, b));
        assert_eq!(fs.remove(None, "/a"), Err(FsError::DirectoryNotEmpty));
        fs.remove(None, "/a/b").unwrap();
        fs.remove(None, "/a").unwrap();
    }

    #[test]
    fn files_hold_data() {
        let fs = setup();
        fs.create(None, "/notes", 100, false).unwrap();
        let file = fs.open(None, "notes").unwrap();
        assert_eq!(file.len(), 100);
        assert_eq!(file.write_at(100, b"appended"), 8);
        let mut buf = [0u8; 108];
        assert_eq!(file.read_at(0, &mut buf), 108);
        assert!(buf[..100].iter().all(|&b| b == 0));
        assert_eq!(&buf[100..], b"appended");

        let stat = fs.stat(None, "/notes").unwrap();
        assert_eq!((stat.mode, stat.size), (StatMode::FILE, 108));
        assert_eq!(fs.stat(None, "/").unwrap().mode, StatMode::DIR);
        // a file is not a directory to walk through
        assert_eq!(fs.open(None, "/notes/x").err(), Some(FsError::NotFound));
        assert!(fs.open_dir(None, "/notes").is_err());
    }

    #[test]
    fn readdir_lists_each_entry_once() {
        let fs = setup();
        for name in ["x", "y", "z"] {
            fs.create(None, &format!("/{}", name), 0, false).unwrap();
        }
        fs.mkdir(None, "/sub").unwrap();
        let mut names: Vec<String> = fs.open_dir(None, "/").unwrap().collect();
        names.sort();
        assert_eq!(names, vec!["sub", "x", "y", "z"]);
        assert_eq!(fs.open_dir(None, "/sub").unwrap().count(), 0);
    }

    #[test]
    fn name_collision() {
        let fs = setup();
        fs.create(None, "/dup", 0, false).unwrap();
        let free = fs.free_sectors();
        assert_eq!(fs.create(None, "/dup", 5000, false), Err(FsError::AlreadyExists));
        assert_eq!(fs.mkdir(None, "/dup"), Err(FsError::AlreadyExists));
        assert_eq!(fs.free_sectors(), free);
        assert_eq!(fs.open_inode_count(), 0);
    }

    #[test]
    fn invalid_names_are_refused() {
        let fs = setup();
        let long = format!("/{}", "n".repeat(crate::NAME_MAX + 1));
        assert_eq!(fs.create(None, &long, 0, false), Err(FsError::InvalidName));
        assert_eq!(fs.create(None, "/", 0, false), Err(FsError::InvalidName));
        assert_eq!(fs.mkdir(None, "/.."), Err(FsError::InvalidName));
        assert_eq!(fs.create(None, "", 0, false), Err(FsError::NotFound));
    }

    #[test]
    fn remove_order() {
        let fs = setup();
        let free = fs.free_sectors();
        fs.mkdir(None, "/d").unwrap();
        fs.create(None, "/d/f", 3000, false).unwrap();
        assert_eq!(fs.remove(None, "/d"), Err(FsError::DirectoryNotEmpty));
        fs.remove(None, "/d/f").unwrap();
        fs.remove(None, "/d").unwrap();
        assert_eq!(fs.open(None, "/d").err(), Some(FsError::NotFound));
        assert_eq!(fs.remove(None, "/d"), Err(FsError::NotFound));
        assert_eq!(fs.free_sectors(), free);
        assert_eq!(fs.remove(None, "/"), Err(FsError::Busy));
    }

    #[test]
    fn open_removed_file_keeps_data_until_close() {
        let fs = setup();
        let free = fs.free_sectors();
        fs.create(None, "/tmp", 0, false).unwrap();
        let file = fs.open(None, "/tmp").unwrap();
        file.write_at(0, &[9u8; 4000]);
        fs.remove(None, "/tmp").unwrap();
        assert_eq!(fs.open(None, "/tmp").err(), Some(FsError::NotFound));
        let mut buf = [0u8; 10];
        assert_eq!(file.read_at(3990, &mut buf), 10);
        assert_eq!(buf, [9u8; 10]);
        drop(file);
        assert_eq!(fs.free_sectors(), free);
    }

    #[test]
    fn chdir_and_relative_paths() {
        let fs = setup();
        let mut cwd = None;
        fs.mkdir(None, "/home").unwrap();
        fs.chdir(&mut cwd, "/home").unwrap();
        fs.mkdir(cwd.as_ref(), "user").unwrap();
        fs.create(cwd.as_ref(), "user/file", 10, false).unwrap();
        assert!(fs.open(None, "/home/user/file").is_ok());

        fs.chdir(&mut cwd, "user").unwrap();
        assert_eq!(fs.open(cwd.as_ref(), "file").unwrap().len(), 10);
        assert!(fs.open(cwd.as_ref(), "../user/./file").is_ok());
        assert_eq!(fs.chdir(&mut cwd, "file"), Err(FsError::NotFound));
        let user = fs.open(None, "/home/user").unwrap();
        assert_eq!(cwd.as_ref().map(|dir| dir.sector()), Some(user.sector()));
    }

    #[test]
    fn removed_cwd_rejects_new_entries() {
        let fs = setup();
        let mut cwd = None;
        fs.mkdir(None, "/w").unwrap();
        fs.chdir(&mut cwd, "/w").unwrap();
        fs.remove(None, "/w").unwrap();
        assert_eq!(fs.create(cwd.as_ref(), "late", 0, false), Err(FsError::NotFound));
        assert_eq!(fs.open(cwd.as_ref(), "").err(), Some(FsError::NotFound));
        assert_eq!(fs.chdir(&mut cwd, "."), Err(FsError::NotFound));
        fs.chdir(&mut cwd, "/").unwrap();
        assert_eq!(cwd.as_ref().map(|dir| dir.sector()), Some(ROOT_DIR_SECTOR));
    }

    #[test]
    fn remount_sees_the_same_tree() {
        let disk = Arc::new(RamDisk::new(1024));
        let fs = FileSystem::format(disk.clone(), MountOptions::default()).unwrap();
        fs.mkdir(None, "/etc").unwrap();
        fs.create(None, "/etc/motd", 0, false).unwrap();
        fs.open(None, "/etc/motd").unwrap().write_at(0, b"welcome");
        let free = fs.free_sectors();
        fs.shutdown();
        drop(fs);

        let fs = FileSystem::mount(disk, MountOptions { read_ahead: false }).unwrap();
        assert_eq!(fs.free_sectors(), free);
        let motd = fs.open(None, "/etc/motd").unwrap();
        let mut buf = [0u8; 7];
        assert_eq!(motd.read_at(0, &mut buf), 7);
        assert_eq!(&buf, b"welcome");
    }

    #[test]
    fn unformatted_device_is_rejected() {
        let disk = Arc::new(RamDisk::new(64));
        assert_eq!(
            FileSystem::mount(disk, MountOptions::default()).err(),
            Some(FsError::Corrupted)
        );
    }

    #[test]
    fn tiny_device_cannot_be_formatted() {
        let disk = Arc::new(RamDisk::new(3));
        assert!(FileSystem::format(disk, MountOptions::default()).is_err());
    }

    #[test]
    fn discarded_inode_is_released_even_if_unreadable() {
        let fs = setup();
        let free = fs.free_sectors();
        let sector = fs.free_map().allocate(1).unwrap();
        Inode::create(&fs, sector, 3000, false).unwrap();
        fs.discard(sector);
        assert_eq!(fs.free_sectors(), free);

        // a header that fails its magic check still frees its sector
        let sector = fs.free_map().allocate(1).unwrap();
        fs.cache().zero(sector as usize);
        fs.discard(sector);
        assert!(!fs.free_map().is_allocated(sector));
        assert_eq!(fs.free_sectors(), free);
    }

    #[test]
    fn full_device_reports_no_space() {
        let disk = Arc::new(RamDisk::new(64));
        let fs = FileSystem::format(disk, MountOptions { read_ahead: false }).unwrap();
        let free = fs.free_sectors();
        assert_eq!(
            fs.create(None, "/big", 100 * crate::SECTOR_SIZE, false),
            Err(FsError::NoSpace)
        );
        assert_eq!(fs.free_sectors(), free);
        assert_eq!(fs.open(None, "/big").err(), Some(FsError::NotFound));
    }
}
