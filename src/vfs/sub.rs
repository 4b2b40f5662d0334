//! A view of another filesystem rooted at a path prefix.

use async_trait::async_trait;

use crate::error::Result;
use crate::vfs::file::FileHandle;
use crate::vfs::key;
use crate::vfs::{DirEntry, FileInfo, OpenFlags, WritableFs};

/// A filesystem whose paths are all resolved under `prefix` in the parent.
pub struct SubFs<F> {
    inner: F,
    prefix: String,
}

impl<F: WritableFs> SubFs<F> {
    pub fn new(inner: F, prefix: &str) -> Self {
        Self {
            inner,
            prefix: prefix.to_string(),
        }
    }

    fn resolve(&self, path: &str) -> String {
        key::join(&self.prefix, &key::clean(path))
    }
}

#[async_trait]
impl<F: WritableFs> WritableFs for SubFs<F> {
    async fn open_file(&self, path: &str, flags: OpenFlags) -> Result<FileHandle> {
        self.inner.open_file(&self.resolve(path), flags).await
    }

    async fn stat(&self, path: &str) -> Result<FileInfo> {
        self.inner.stat(&self.resolve(path)).await
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        self.inner.read_dir(&self.resolve(path)).await
    }

    async fn mkdir_all(&self, path: &str) -> Result<()> {
        self.inner.mkdir_all(&self.resolve(path)).await
    }

    async fn remove_all(&self, path: &str) -> Result<()> {
        self.inner.remove_all(&self.resolve(path)).await
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        self.inner
            .rename(&self.resolve(old_path), &self.resolve(new_path))
            .await
    }
}
