//! Shared per-key file state and the per-open handles layered on top of it.
//!
//! A `FileNode` is shared by every handle open on the same path: they see a
//! common staging file, dirty flag and handle set. A `FileHandle` adds the
//! per-open state (cursor, read-only bit, cached streaming get).

use std::collections::HashSet;
use std::io::SeekFrom;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::{GetOptions, ObjectStream, PutBody, PutOptions};
use crate::error::{FsError, Result};
use crate::staging::StagingFile;
use crate::vfs::fs::{self, FsShared};
use crate::vfs::key;
use crate::vfs::xattrs::FileXAttrs;
use crate::vfs::FileInfo;

/// Race a future against a cancellation token. Cancellation surfaces as an
/// interrupted I/O error rather than a dedicated error kind.
pub(crate) async fn cancellable<T, F>(token: &CancellationToken, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(FsError::Io(std::io::Error::new(
            std::io::ErrorKind::Interrupted,
            "operation cancelled",
        ))),
        res = fut => res,
    }
}

/// An object shared between all handles open on the same path.
pub(crate) struct FileNode {
    pub(crate) shared: Arc<FsShared>,
    pub(crate) path: String,
    pub(crate) key: String,
    pub(crate) cancel: CancellationToken,
    pub(crate) state: Mutex<FileState>,
}

pub(crate) struct FileState {
    staging: Option<StagingFile>,
    dirty: bool,
    handles: HashSet<u64>,
    closed: bool,
}

impl FileState {
    pub(crate) fn is_idle(&self) -> bool {
        self.handles.is_empty() && self.staging.is_none()
    }
}

impl FileNode {
    pub(crate) fn new(
        shared: Arc<FsShared>,
        path: String,
        key: String,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            shared,
            path,
            key,
            cancel,
            state: Mutex::new(FileState {
                staging: None,
                dirty: false,
                handles: HashSet::new(),
                closed: false,
            }),
        }
    }

    /// Create a new handle. A writable handle materializes the staging file,
    /// populating it from the remote object when one exists.
    pub(crate) async fn new_handle(
        self: &Arc<Self>,
        read_only: bool,
        non_empty: bool,
    ) -> Result<FileHandle> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(FsError::Closed);
        }

        if !read_only && state.staging.is_none() {
            debug!(key = %self.key, "creating staging file");

            let parent = key::dirname(&self.key);
            if parent != "." {
                self.shared.staging.mkdir_all(&parent).await?;
            }
            let mut staging = self.shared.staging.open_file(&self.key).await?;

            if non_empty {
                debug!(key = %self.key, "downloading existing object into staging file");

                let mut obj = cancellable(&self.cancel, async {
                    self.shared
                        .client
                        .get_object(&self.key, &GetOptions::default())
                        .await
                        .map_err(FsError::from)
                })
                .await?;
                staging.fill_from(&mut obj).await?;
            }

            state.staging = Some(staging);
        }

        let id = self.shared.next_handle_id.fetch_add(1, Ordering::Relaxed);
        state.handles.insert(id);

        Ok(FileHandle {
            id,
            node: self.clone(),
            read_only,
            cursor: Mutex::new(HandleCursor {
                offset: 0,
                stream: None,
            }),
        })
    }

    pub(crate) async fn write_at(&self, buf: &[u8], off: u64) -> Result<usize> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(FsError::Closed);
        }
        let staging = state.staging.as_mut().ok_or(FsError::Invalid)?;
        let n = staging.write_at(buf, off).await?;
        if n > 0 {
            state.dirty = true;
        }
        Ok(n)
    }

    pub(crate) async fn truncate(&self, size: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(FsError::Closed);
        }
        if let Some(staging) = state.staging.as_ref() {
            debug!(key = %self.key, size, "truncating staging file");
            staging.truncate(size).await?;
        }
        state.dirty = true;
        Ok(())
    }

    pub(crate) async fn stat(&self) -> Result<FileInfo> {
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(FsError::Closed);
            }
            if let Some(staging) = state.staging.as_mut() {
                let (size, mod_time) = staging.stat().await?;
                return Ok(FileInfo::new(self.key.clone(), size, mod_time));
            }
        }
        fs::stat_path(&self.shared, &self.path).await
    }

    pub(crate) async fn sync(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(FsError::Closed);
        }
        self.sync_locked(&mut state).await
    }

    /// Upload the staged contents if dirty. Idempotent on a clean file.
    async fn sync_locked(&self, state: &mut FileState) -> Result<()> {
        if !state.dirty {
            return Ok(());
        }
        let Some(staging) = state.staging.as_mut() else {
            return Ok(());
        };

        debug!(key = %self.key, "uploading modified object");

        staging.sync().await?;
        let (size, _) = staging.stat().await?;
        let upload = staging.reopen().await?;

        cancellable(&self.cancel, async {
            self.shared
                .client
                .put_object(
                    &self.key,
                    PutBody::File(upload),
                    size,
                    &PutOptions {
                        content_type: Some("application/octet-stream".to_string()),
                        user_metadata: None,
                    },
                )
                .await
                .map_err(FsError::from)
        })
        .await?;

        state.dirty = false;

        // TODO: check whether the remote object was modified while staged and
        // reconcile instead of clobbering it.

        Ok(())
    }

    /// Drop one handle. The last close flushes staged changes, releases the
    /// staging file and retires the registry entry. A flush error aborts the
    /// teardown and surfaces to the caller.
    async fn close_handle(&self, id: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        state.handles.remove(&id);
        if !state.handles.is_empty() || state.closed {
            return Ok(());
        }

        if state.dirty {
            self.sync_locked(&mut state).await?;
        }

        // TODO: keep the staging file around for a while so a quick reopen
        // avoids re-downloading the object.
        if state.staging.take().is_some() {
            debug!(key = %self.key, "removing staging file");
            self.shared.staging.remove_all(&self.key).await?;
        }
        drop(state);

        self.shared.release(&self.path);
        Ok(())
    }

    /// Forced teardown on filesystem close: best-effort flush, then release
    /// the staging file regardless. Later operations through surviving
    /// handles fail with `Closed`.
    pub(crate) async fn teardown(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        state.handles.clear();

        let mut result = Ok(());
        if state.dirty {
            result = self.sync_locked(&mut state).await;
        }
        if state.staging.take().is_some() {
            if let Err(err) = self.shared.staging.remove_all(&self.key).await {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }
}

struct HandleCursor {
    offset: u64,
    /// A lazily opened ranged get, used when serving sequential reads
    /// against a non-staged file.
    stream: Option<ObjectStream>,
}

/// A stateful virtual file handle: tracks the cursor and enforces read-only
/// permissions. Handles on the same path share the underlying `FileNode`.
pub struct FileHandle {
    id: u64,
    node: Arc<FileNode>,
    read_only: bool,
    cursor: Mutex<HandleCursor>,
}

impl FileHandle {
    /// Read at the cursor, advancing it. Returns zero at end of file.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.node.state.lock().await;
        if state.closed {
            return Err(FsError::Closed);
        }
        let mut cursor = self.cursor.lock().await;

        if let Some(staging) = state.staging.as_mut() {
            debug!(key = %self.node.key, "reading from staging file");
            let n = staging.read_at(buf, cursor.offset).await?;
            cursor.offset += n as u64;
            return Ok(n);
        }
        drop(state);

        debug!(key = %self.node.key, "reading from remote object");

        let offset = cursor.offset;
        let stream = match cursor.stream.as_mut() {
            Some(stream) => stream,
            None => {
                let stream = cancellable(&self.node.cancel, async {
                    self.node
                        .shared
                        .client
                        .get_object(
                            &self.node.key,
                            &GetOptions {
                                range_start: Some(offset),
                            },
                        )
                        .await
                        .map_err(FsError::from)
                })
                .await?;
                cursor.stream.insert(stream)
            }
        };

        let n = stream.read(buf).await?;
        cursor.offset += n as u64;
        Ok(n)
    }

    /// Positioned read; does not move the cursor.
    pub async fn read_at(&self, buf: &mut [u8], off: u64) -> Result<usize> {
        let mut state = self.node.state.lock().await;
        if state.closed {
            return Err(FsError::Closed);
        }

        if let Some(staging) = state.staging.as_mut() {
            debug!(key = %self.node.key, off, "reading from staging file");
            return staging.read_at(buf, off).await;
        }
        drop(state);

        debug!(key = %self.node.key, off, "reading from remote object");

        let mut stream = cancellable(&self.node.cancel, async {
            self.node
                .shared
                .client
                .get_object(
                    &self.node.key,
                    &GetOptions {
                        range_start: Some(off),
                    },
                )
                .await
                .map_err(FsError::from)
        })
        .await?;

        let mut total = 0;
        while total < buf.len() {
            let n = stream.read(&mut buf[total..]).await?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    /// Write at the cursor, advancing it. Writes always land in the staging
    /// file; the object store is untouched until sync or the last close.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        if self.read_only {
            return Err(FsError::Permission);
        }

        let mut state = self.node.state.lock().await;
        if state.closed {
            return Err(FsError::Closed);
        }
        let mut cursor = self.cursor.lock().await;

        let staging = state.staging.as_mut().ok_or(FsError::Invalid)?;
        let n = staging.write_at(buf, cursor.offset).await?;
        if n > 0 {
            state.dirty = true;
        }
        cursor.offset += n as u64;
        Ok(n)
    }

    /// Positioned write; does not move the cursor.
    pub async fn write_at(&self, buf: &[u8], off: u64) -> Result<usize> {
        if self.read_only {
            return Err(FsError::Permission);
        }
        self.node.write_at(buf, off).await
    }

    /// Move the cursor. Any cached streaming get is dropped; the next read
    /// reopens it at the new position.
    pub async fn seek(&self, pos: SeekFrom) -> Result<u64> {
        let size = match pos {
            SeekFrom::End(_) => Some(self.node.stat().await?.size()),
            _ => None,
        };

        let mut cursor = self.cursor.lock().await;
        let next = match pos {
            SeekFrom::Start(off) => off,
            SeekFrom::Current(delta) => cursor
                .offset
                .checked_add_signed(delta)
                .ok_or(FsError::Invalid)?,
            SeekFrom::End(delta) => size
                .unwrap_or(0)
                .checked_add_signed(delta)
                .ok_or(FsError::Invalid)?,
        };
        cursor.offset = next;
        cursor.stream = None;
        Ok(next)
    }

    pub async fn truncate(&self, size: u64) -> Result<()> {
        if self.read_only {
            return Err(FsError::Permission);
        }
        self.node.truncate(size).await
    }

    /// Upload staged changes now instead of waiting for the last close.
    pub async fn sync(&self) -> Result<()> {
        self.node.sync().await
    }

    pub async fn stat(&self) -> Result<FileInfo> {
        self.node.stat().await
    }

    /// The extended-attribute view for this handle. Construction syncs the
    /// cache from the object's current user metadata.
    pub async fn xattrs(&self) -> Result<FileXAttrs> {
        FileXAttrs::new(self.node.clone(), self.read_only).await
    }

    /// Close this handle. Closing the last handle on a dirty file uploads
    /// the staged contents.
    pub async fn close(self) -> Result<()> {
        debug!(key = %self.node.key, "closing file handle");
        {
            let mut cursor = self.cursor.lock().await;
            cursor.stream = None;
        }
        self.node.close_handle(self.id).await
    }
}
