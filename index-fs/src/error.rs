use core::fmt;

/// Errors reported by the file system.
///
/// A missing entry and a path component that is not a directory are both
/// reported as [`FsError::NotFound`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// The free map (or the index of a file) has no room left
    NoSpace,
    /// Empty name, name longer than `NAME_MAX`, or a reserved name
    InvalidName,
    /// No entry by that name, or a path component is not a directory
    NotFound,
    /// The name is already in use in the directory
    AlreadyExists,
    /// Only empty directories can be removed
    DirectoryNotEmpty,
    /// The target is in a state that forbids the operation (removing `/`)
    Busy,
    /// An on-disk header failed its magic check
    Corrupted,
    /// Requested size is beyond what the inode index can map
    FileTooLarge,
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::NoSpace => "no space left on device",
            Self::InvalidName => "invalid file name",
            Self::NotFound => "no such file or directory",
            Self::AlreadyExists => "file exists",
            Self::DirectoryNotEmpty => "directory not empty",
            Self::Busy => "resource busy",
            Self::Corrupted => "corrupted on-disk structure",
            Self::FileTooLarge => "file too large",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for FsError {}

/// Result type of file system operations
pub type FsResult<T> = Result<T, FsError>;
