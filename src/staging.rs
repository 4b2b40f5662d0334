//! Local staging store for in-flight writes.
//!
//! Bucket objects are immutable, so partial and random writes land in a
//! process-unique temporary directory first and are uploaded wholesale on
//! sync or close. Staging paths are keyed by object key and confined to the
//! staging root; escape attempts fail with a permission error.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use rand::distr::Alphanumeric;
use rand::Rng;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tracing::debug;

use crate::error::{FsError, Result};
use crate::vfs::key;

pub struct StagingDir {
    root: PathBuf,
}

impl StagingDir {
    /// Create a fresh staging root under the system temp directory.
    pub async fn create() -> Result<Self> {
        let suffix: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(10)
            .map(char::from)
            .collect();
        let root = std::env::temp_dir().join(format!("bucketfs-{suffix}"));
        fs::create_dir_all(&root).await?;

        debug!(path = %root.display(), "created staging directory");

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative path inside the staging root, refusing anything
    /// that would lexically escape it.
    fn safe_path(&self, rel: &str) -> Result<PathBuf> {
        let cleaned = key::clean(rel);
        if cleaned.starts_with('/') || cleaned == ".." || cleaned.starts_with("../") {
            return Err(FsError::Permission);
        }
        if cleaned == "." {
            return Ok(self.root.clone());
        }
        Ok(self.root.join(cleaned))
    }

    pub async fn mkdir_all(&self, rel: &str) -> Result<()> {
        let path = self.safe_path(rel)?;
        fs::create_dir_all(path).await?;
        Ok(())
    }

    /// Open (creating if needed) a read/write staging file.
    pub async fn open_file(&self, rel: &str) -> Result<StagingFile> {
        let path = self.safe_path(rel)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .await?;
        Ok(StagingFile { file, path })
    }

    /// Remove a staged file or directory tree; missing paths are fine.
    pub async fn remove_all(&self, rel: &str) -> Result<()> {
        let path = self.safe_path(rel)?;
        let metadata = match fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        if metadata.is_dir() {
            fs::remove_dir_all(&path).await?;
        } else {
            fs::remove_file(&path).await?;
        }
        Ok(())
    }

    /// Recursively remove the staging root itself.
    pub async fn remove_root(&self) -> Result<()> {
        debug!(path = %self.root.display(), "removing staging directory");
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// A random-access staging file. Positioned reads and writes seek first, so
/// callers must serialize access (the per-file lock does).
pub struct StagingFile {
    file: File,
    path: PathBuf,
}

impl StagingFile {
    /// Read as much of `buf` as possible starting at `off`. Returns the
    /// number of bytes read; zero means end of file.
    pub async fn read_at(&mut self, buf: &mut [u8], off: u64) -> Result<usize> {
        self.file.seek(SeekFrom::Start(off)).await?;
        let mut total = 0;
        while total < buf.len() {
            let n = self.file.read(&mut buf[total..]).await?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    pub async fn write_at(&mut self, buf: &[u8], off: u64) -> Result<usize> {
        self.file.seek(SeekFrom::Start(off)).await?;
        self.file.write_all(buf).await?;
        Ok(buf.len())
    }

    /// Stream the given reader into the file from the start, replacing its
    /// contents.
    pub async fn fill_from(&mut self, reader: &mut (dyn tokio::io::AsyncRead + Send + Unpin)) -> Result<u64> {
        self.file.seek(SeekFrom::Start(0)).await?;
        let n = tokio::io::copy(reader, &mut self.file).await?;
        Ok(n)
    }

    pub async fn truncate(&self, size: u64) -> Result<()> {
        self.file.set_len(size).await?;
        Ok(())
    }

    pub async fn sync(&self) -> Result<()> {
        self.file.sync_all().await?;
        Ok(())
    }

    pub async fn stat(&self) -> Result<(u64, SystemTime)> {
        let metadata = self.file.metadata().await?;
        let mod_time = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        Ok((metadata.len(), mod_time))
    }

    /// A fresh read handle at offset zero, for streaming uploads.
    pub async fn reopen(&self) -> Result<File> {
        Ok(File::open(&self.path).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_escape_attempts_fail_with_permission() {
        let staging = StagingDir::create().await.unwrap();

        assert!(matches!(
            staging.open_file("../escape").await,
            Err(FsError::Permission)
        ));
        assert!(matches!(
            staging.open_file("/etc/passwd").await,
            Err(FsError::Permission)
        ));
        assert!(matches!(
            staging.mkdir_all("a/../../b").await,
            Err(FsError::Permission)
        ));

        // Dotted segments that stay inside the root are fine.
        staging.mkdir_all("a/../b").await.unwrap();

        staging.remove_root().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_write_truncate_round_trip() {
        let staging = StagingDir::create().await.unwrap();
        let mut file = staging.open_file("obj").await.unwrap();

        file.write_at(b"hello world", 0).await.unwrap();
        let mut buf = [0u8; 5];
        let n = file.read_at(&mut buf, 6).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"world");

        file.truncate(5).await.unwrap();
        let (size, _) = file.stat().await.unwrap();
        assert_eq!(size, 5);

        let mut buf = [0u8; 16];
        let n = file.read_at(&mut buf, 0).await.unwrap();
        assert_eq!(&buf[..n], b"hello");

        staging.remove_root().await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_all_tolerates_missing_paths() {
        let staging = StagingDir::create().await.unwrap();
        staging.remove_all("never/created").await.unwrap();
        staging.remove_root().await.unwrap();
    }
}
