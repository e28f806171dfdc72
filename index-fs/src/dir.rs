//! Directories: inodes whose content is an array of [`DirEntry`].
//!
//! Slot 0 is reserved for the parent's sector; ordinary entries start at
//! slot 1. Removed entries are left in place as tombstones and reused by
//! later additions.

use std::sync::Arc;

use crate::error::{FsError, FsResult};
use crate::layout::{DirEntry, DIRENT_SZ};
use crate::{FileSystem, Inode, NAME_MAX, ROOT_DIR_SECTOR};

/// Reject names that cannot be stored in an entry.
pub fn validate_name(name: &str) -> FsResult<()> {
    if name.is_empty()
        || name.len() > NAME_MAX
        || name == "."
        || name == ".."
        || name.contains(&['/', '\0'][..])
    {
        Err(FsError::InvalidName)
    } else {
        Ok(())
    }
}

/// An open directory with a read cursor
pub struct Dir {
    inode: Inode,
    /// byte offset of the next entry `readdir` looks at
    pos: usize,
}

impl Dir {
    /// Write a directory inode with room for `entry_cnt` entries to
    /// `sector`, its slot 0 pointing at `parent`.
    pub fn create(fs: &Arc<FileSystem>, sector: u32, entry_cnt: usize, parent: u32) -> FsResult<()> {
        Inode::create(fs, sector, (entry_cnt + 1) * DIRENT_SZ, true)?;
        let inode = Inode::open(fs, sector)?;
        if inode.write_at(0, DirEntry::parent(parent).as_bytes()) != DIRENT_SZ {
            inode.remove();
            return Err(FsError::NoSpace);
        }
        Ok(())
    }

    /// Take ownership of `inode` as a directory.
    pub fn open(inode: Inode) -> FsResult<Self> {
        if inode.is_dir() {
            Ok(Self { inode, pos: 0 })
        } else {
            Err(FsError::NotFound)
        }
    }

    /// Open the root directory.
    pub fn open_root(fs: &Arc<FileSystem>) -> FsResult<Self> {
        Self::open(Inode::open(fs, ROOT_DIR_SECTOR)?)
    }

    /// A new handle on the same directory, with its own cursor
    pub fn reopen(&self) -> Self {
        Self {
            inode: self.inode.clone(),
            pos: 0,
        }
    }

    /// The directory's inode
    pub fn inode(&self) -> &Inode {
        &self.inode
    }

    /// Give up the cursor and keep the inode handle
    pub fn into_inode(self) -> Inode {
        self.inode
    }

    /// Sector of the directory's inode header
    pub fn sector(&self) -> u32 {
        self.inode.sector()
    }

    fn entry_at(&self, slot: usize) -> Option<DirEntry> {
        let mut entry = DirEntry::empty();
        if self.inode.read_at(slot * DIRENT_SZ, entry.as_bytes_mut()) == DIRENT_SZ {
            Some(entry)
        } else {
            None
        }
    }

    /// Ordinary slots, from slot 1 to the end of the content
    fn entries(&self) -> impl Iterator<Item = (usize, DirEntry)> + '_ {
        (1..).map_while(move |slot| self.entry_at(slot).map(|entry| (slot, entry)))
    }

    fn find(&self, name: &str) -> Option<(usize, DirEntry)> {
        self.entries()
            .find(|(_, entry)| entry.in_use() && entry.name() == name)
    }

    /// Sector of the parent directory, from slot 0
    pub fn parent_sector(&self) -> u32 {
        self.entry_at(0)
            .map(|entry| entry.inode_sector())
            .unwrap_or_else(|| self.sector())
    }

    /// Whether no ordinary slot is in use
    pub fn is_empty(&self) -> bool {
        self.entries().all(|(_, entry)| !entry.in_use())
    }

    /// Open the inode called `name` in this directory.
    /// `.` is this directory and `..` its parent.
    pub fn lookup(&self, name: &str) -> FsResult<Inode> {
        match name {
            "." => Ok(self.inode.clone()),
            ".." => Inode::open(self.inode.fs(), self.parent_sector()),
            _ => {
                let (_, entry) = self.find(name).ok_or(FsError::NotFound)?;
                Inode::open(self.inode.fs(), entry.inode_sector())
            }
        }
    }

    /// Add an entry `name` for the inode at `sector`.
    ///
    /// When `is_dir` is set, the child's slot 0 is first pointed back at
    /// this directory.
    pub fn add(&self, name: &str, sector: u32, is_dir: bool) -> FsResult<()> {
        validate_name(name)?;
        let _guard = self.inode.lock_dir();
        if self.inode.is_removed() {
            return Err(FsError::NotFound);
        }
        if self.find(name).is_some() {
            return Err(FsError::AlreadyExists);
        }
        if is_dir {
            let child = Inode::open(self.inode.fs(), sector)?;
            if child.write_at(0, DirEntry::parent(self.sector()).as_bytes()) != DIRENT_SZ {
                return Err(FsError::NoSpace);
            }
        }
        // first tombstone, or one past the last slot
        let slot = self
            .entries()
            .find(|(_, entry)| !entry.in_use())
            .map(|(slot, _)| slot)
            .unwrap_or_else(|| (self.inode.len() / DIRENT_SZ).max(1));
        let entry = DirEntry::new(name, sector);
        if self.inode.write_at(slot * DIRENT_SZ, entry.as_bytes()) != DIRENT_SZ {
            return Err(FsError::NoSpace);
        }
        Ok(())
    }

    /// Remove the entry `name` and mark its inode for deletion.
    /// A directory must be empty to be removed.
    pub fn remove(&self, name: &str) -> FsResult<()> {
        validate_name(name)?;
        let _guard = self.inode.lock_dir();
        let (slot, mut entry) = self.find(name).ok_or(FsError::NotFound)?;
        let inode = Inode::open(self.inode.fs(), entry.inode_sector())?;
        // the child's lock keeps additions out until it is marked removed
        let child = inode.clone();
        let _child_guard = child.lock_dir();
        if inode.is_dir() && !Dir::open(inode.clone())?.is_empty() {
            return Err(FsError::DirectoryNotEmpty);
        }
        entry.clear();
        if self.inode.write_at(slot * DIRENT_SZ, entry.as_bytes()) != DIRENT_SZ {
            return Err(FsError::NoSpace);
        }
        inode.remove();
        log::debug!("dir {}: removed {:?} (inode {})", self.sector(), name, inode.sector());
        Ok(())
    }

    /// Name of the next in-use entry after the cursor, or `None` once the
    /// content is exhausted.
    pub fn readdir(&mut self) -> Option<String> {
        if self.pos < DIRENT_SZ {
            self.pos = DIRENT_SZ;
        }
        while let Some(entry) = self.entry_at(self.pos / DIRENT_SZ) {
            self.pos += DIRENT_SZ;
            if entry.in_use() {
                return Some(String::from(entry.name()));
            }
        }
        None
    }
}

impl Iterator for Dir {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.readdir()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MountOptions, RamDisk};
    use std::thread;

    fn setup() -> Arc<FileSystem> {
        let disk = Arc::new(RamDisk::new(1024));
        FileSystem::format(disk, MountOptions { read_ahead: false }).unwrap()
    }

    fn new_inode(fs: &Arc<FileSystem>, is_dir: bool) -> u32 {
        let sector = fs.free_map().allocate(1).unwrap();
        Inode::create(fs, sector, 0, is_dir).unwrap();
        sector
    }

    #[test]
    fn root_is_its_own_parent() {
        let fs = setup();
        let root = Dir::open_root(&fs).unwrap();
        assert_eq!(root.parent_sector(), ROOT_DIR_SECTOR);
        assert!(root.is_empty());
        let up = root.lookup("..").unwrap();
        assert!(up.same_inode(root.inode()));
        let this = root.lookup(".").unwrap();
        assert_eq!(this.open_count(), 3);
    }

    #[test]
    fn add_lookup_and_list() {
        let fs = setup();
        let root = Dir::open_root(&fs).unwrap();
        let file = new_inode(&fs, false);
        let sub = new_inode(&fs, true);
        root.add("file", file, false).unwrap();
        root.add("sub", sub, true).unwrap();

        assert_eq!(root.lookup("file").unwrap().sector(), file);
        let sub_dir = Dir::open(root.lookup("sub").unwrap()).unwrap();
        assert_eq!(sub_dir.parent_sector(), ROOT_DIR_SECTOR);
        assert_eq!(sub_dir.lookup("..").unwrap().sector(), ROOT_DIR_SECTOR);

        let names: Vec<String> = root.reopen().collect();
        assert_eq!(names, vec!["file", "sub"]);
        assert_eq!(root.lookup("missing").err(), Some(FsError::NotFound));
    }

    #[test]
    fn name_collision_leaves_content_alone() {
        let fs = setup();
        let root = Dir::open_root(&fs).unwrap();
        let a = new_inode(&fs, false);
        let b = new_inode(&fs, false);
        root.add("same", a, false).unwrap();
        let len = root.inode().len();
        assert_eq!(root.add("same", b, false), Err(FsError::AlreadyExists));
        assert_eq!(root.inode().len(), len);
        assert_eq!(root.lookup("same").unwrap().sector(), a);
    }

    #[test]
    fn invalid_names() {
        let fs = setup();
        let root = Dir::open_root(&fs).unwrap();
        let a = new_inode(&fs, false);
        let long = "x".repeat(NAME_MAX + 1);
        for name in ["", ".", "..", "a/b", "a\0", "\0", long.as_str()] {
            assert_eq!(root.add(name, a, false), Err(FsError::InvalidName));
        }
        assert!(root.add(&"x".repeat(NAME_MAX), a, false).is_ok());
    }

    #[test]
    fn nul_cannot_alias_an_existing_name() {
        let fs = setup();
        let root = Dir::open_root(&fs).unwrap();
        root.add("a", new_inode(&fs, false), false).unwrap();
        assert_eq!(
            root.add("a\0", new_inode(&fs, false), false),
            Err(FsError::InvalidName)
        );
        let names: Vec<String> = root.reopen().collect();
        assert_eq!(names, vec!["a"]);
    }

    #[test]
    fn tombstones_are_reused() {
        let fs = setup();
        let root = Dir::open_root(&fs).unwrap();
        for name in ["a", "b", "c"] {
            root.add(name, new_inode(&fs, false), false).unwrap();
        }
        root.remove("b").unwrap();
        assert_eq!(root.lookup("b").err(), Some(FsError::NotFound));
        let len = root.inode().len();
        root.add("d", new_inode(&fs, false), false).unwrap();
        assert_eq!(root.inode().len(), len);
        let names: Vec<String> = root.reopen().collect();
        assert_eq!(names, vec!["a", "d", "c"]);
    }

    #[test]
    fn readdir_cursor_only_moves_forward() {
        let fs = setup();
        let root = Dir::open_root(&fs).unwrap();
        root.add("one", new_inode(&fs, false), false).unwrap();
        root.add("two", new_inode(&fs, false), false).unwrap();
        let mut cursor = root.reopen();
        assert_eq!(cursor.readdir().as_deref(), Some("one"));
        root.remove("one").unwrap();
        assert_eq!(cursor.readdir().as_deref(), Some("two"));
        assert_eq!(cursor.readdir(), None);
        assert_eq!(cursor.readdir(), None);
    }

    #[test]
    fn readdir_during_concurrent_mutation() {
        let fs = setup();
        let names: Vec<String> = (0..40).map(|i| format!("entry{}", i)).collect();
        let writer = {
            let fs = Arc::clone(&fs);
            let names = names.clone();
            thread::spawn(move || {
                let root = Dir::open_root(&fs).unwrap();
                for round in 0..6 {
                    for name in names.iter() {
                        root.add(name, new_inode(&fs, false), false).unwrap();
                    }
                    for name in names.iter().skip(round % 2).step_by(2) {
                        root.remove(name).unwrap();
                    }
                    for name in names.iter().skip(1 - round % 2).step_by(2) {
                        root.remove(name).unwrap();
                    }
                }
            })
        };

        let root = Dir::open_root(&fs).unwrap();
        for _ in 0..200 {
            let mut seen = 0;
            for name in root.reopen() {
                assert!(names.contains(&name), "torn entry {:?}", name);
                seen += 1;
                assert!(seen <= names.len());
            }
        }
        writer.join().unwrap();
        assert!(root.is_empty());
        assert_eq!(root.reopen().count(), 0);
    }

    #[test]
    fn non_empty_directory_is_kept() {
        let fs = setup();
        let root = Dir::open_root(&fs).unwrap();
        let sub = new_inode(&fs, true);
        root.add("sub", sub, true).unwrap();
        let sub_dir = Dir::open(root.lookup("sub").unwrap()).unwrap();
        sub_dir.add("inner", new_inode(&fs, false), false).unwrap();

        assert_eq!(root.remove("sub"), Err(FsError::DirectoryNotEmpty));
        sub_dir.remove("inner").unwrap();
        root.remove("sub").unwrap();
        assert!(sub_dir.inode().is_removed());
        // a removed directory takes no new entries
        assert_eq!(
            sub_dir.add("late", new_inode(&fs, false), false),
            Err(FsError::NotFound)
        );
    }

    #[test]
    fn removed_file_is_freed_after_close() {
        let fs = setup();
        let root = Dir::open_root(&fs).unwrap();
        let free = fs.free_sectors();
        let sector = new_inode(&fs, false);
        root.add("f", sector, false).unwrap();
        let handle = root.lookup("f").unwrap();
        handle.write_at(0, &[5u8; 2000]);
        root.remove("f").unwrap();
        assert!(fs.free_sectors() < free);
        drop(handle);
        assert_eq!(fs.free_sectors(), free);
    }
}
