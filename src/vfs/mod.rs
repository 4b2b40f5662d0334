//! VFS layer: a writable filesystem view over an object-store bucket.
//!
//! Submodules:
//! - `key`: path <-> object key translation
//! - `fs`: the filesystem itself (open-file registry, directory operations)
//! - `file`: shared per-key file state and per-open handles
//! - `xattrs`: per-handle extended-attribute view
//! - `archive`: streaming tar archiver for whole subtrees
//! - `sub`: path-prefixed view over another filesystem

pub mod archive;
pub mod file;
pub mod fs;
pub mod key;
pub mod sub;
pub mod xattrs;

use std::ops::BitOr;
use std::time::SystemTime;

use async_trait::async_trait;

use crate::error::Result;

pub use archive::ArchiveReader;
pub use file::FileHandle;
pub use fs::BucketFs;
pub use sub::SubFs;
pub use xattrs::FileXAttrs;

/// How a file is opened. Combine with `|`; a handle is writable when
/// `WRITE_ONLY` or `READ_WRITE` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags(u32);

impl OpenFlags {
    pub const READ_ONLY: OpenFlags = OpenFlags(0b0001);
    pub const WRITE_ONLY: OpenFlags = OpenFlags(0b0010);
    pub const READ_WRITE: OpenFlags = OpenFlags(0b0100);
    pub const CREATE: OpenFlags = OpenFlags(0b1000);

    pub fn is_set(self, flag: OpenFlags) -> bool {
        self.0 & flag.0 != 0
    }

    pub fn read_only(self) -> bool {
        !self.is_set(Self::WRITE_ONLY) && !self.is_set(Self::READ_WRITE)
    }
}

impl BitOr for OpenFlags {
    type Output = OpenFlags;

    fn bitor(self, rhs: OpenFlags) -> OpenFlags {
        OpenFlags(self.0 | rhs.0)
    }
}

/// Status of a file or directory. Directories are recognized by their
/// trailing-slash key; the empty key is the root directory. Objects carry no
/// mode bits, so `mode` always reports zero.
#[derive(Debug, Clone)]
pub struct FileInfo {
    key: String,
    size: u64,
    mod_time: SystemTime,
}

impl FileInfo {
    pub(crate) fn new(key: String, size: u64, mod_time: SystemTime) -> Self {
        Self {
            key,
            size,
            mod_time,
        }
    }

    pub(crate) fn root() -> Self {
        Self::new(String::new(), 0, SystemTime::UNIX_EPOCH)
    }

    pub fn name(&self) -> &str {
        key::base(&self.key)
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn mode(&self) -> u32 {
        0
    }

    pub fn mod_time(&self) -> SystemTime {
        self.mod_time
    }

    pub fn is_dir(&self) -> bool {
        self.key.is_empty() || self.key.ends_with('/')
    }
}

/// A single directory listing entry.
#[derive(Debug, Clone)]
pub struct DirEntry {
    name: String,
    size: u64,
    mod_time: SystemTime,
    is_dir: bool,
}

impl DirEntry {
    pub(crate) fn new(name: String, size: u64, mod_time: SystemTime, is_dir: bool) -> Self {
        Self {
            name,
            size,
            mod_time,
            is_dir,
        }
    }

    pub fn name(&self) -> &str {
        self.name.trim_end_matches('/')
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn mod_time(&self) -> SystemTime {
        self.mod_time
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    pub fn info(&self) -> FileInfo {
        FileInfo::new(self.name.clone(), self.size, self.mod_time)
    }
}

/// The capability surface of a writable filesystem.
#[async_trait]
pub trait WritableFs: Send + Sync {
    /// Open a file read-only.
    async fn open(&self, path: &str) -> Result<FileHandle> {
        self.open_file(path, OpenFlags::READ_ONLY).await
    }

    /// Open a file using the given flags. Opening a missing path without
    /// `CREATE` fails eagerly with `FsError::NotFound`.
    async fn open_file(&self, path: &str, flags: OpenFlags) -> Result<FileHandle>;

    async fn stat(&self, path: &str) -> Result<FileInfo>;

    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>>;

    /// Create a directory and all its ancestors as zero-length marker
    /// objects. Tolerant of markers that already exist.
    async fn mkdir_all(&self, path: &str) -> Result<()>;

    /// Remove a single object, or a whole subtree including its marker.
    async fn remove_all(&self, path: &str) -> Result<()>;

    /// Rename a file via copy-and-delete. Directories are not supported.
    async fn rename(&self, old_path: &str, new_path: &str) -> Result<()>;
}
