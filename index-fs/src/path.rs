//! Path resolution.
//!
//! `/` separates components and a leading `/` makes a path absolute.
//! Empty components are skipped, so `a//b/` names the same thing as `a/b`.
//! `.` and `..` are looked up like any other name, see [`Dir::lookup`].

use std::sync::Arc;

use crate::dir::Dir;
use crate::error::{FsError, FsResult};
use crate::FileSystem;

/// Non-empty components of `path`, in order
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|name| !name.is_empty())
}

/// Open the directory named by `path`.
///
/// Relative paths start at `cwd`, or at the root when there is none. Every
/// component must name a directory, and the directory reached must not have
/// been removed.
pub fn open_path(fs: &Arc<FileSystem>, cwd: Option<&Dir>, path: &str) -> FsResult<Dir> {
    let mut dir = match cwd {
        Some(cwd) if !path.starts_with('/') => cwd.reopen(),
        _ => Dir::open_root(fs)?,
    };
    for name in components(path) {
        dir = Dir::open(dir.lookup(name)?)?;
    }
    if dir.inode().is_removed() {
        return Err(FsError::NotFound);
    }
    Ok(dir)
}

/// Split `path` into its parent directory, opened, and the last component.
///
/// Trailing separators are ignored. The leaf is empty only for a path made
/// of separators alone, whose parent is the root.
pub fn split(fs: &Arc<FileSystem>, cwd: Option<&Dir>, path: &str) -> FsResult<(Dir, String)> {
    if path.is_empty() {
        return Err(FsError::NotFound);
    }
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Ok((Dir::open_root(fs)?, String::new()));
    }
    let (parent, leaf) = match trimmed.rfind('/') {
        Some(pos) => (&trimmed[..=pos], &trimmed[pos + 1..]),
        None => ("", trimmed),
    };
    Ok((open_path(fs, cwd, parent)?, String::from(leaf)))
}
