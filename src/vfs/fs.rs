//! The bucket filesystem: open-file registry, stat with directory synthesis,
//! and the directory-level operations (mkdir/readdir/remove/rename).

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::client::{ClientError, CopyOptions, ListOptions, ObjectClient, PutBody, PutOptions};
use crate::error::{FsError, Result};
use crate::staging::StagingDir;
use crate::vfs::file::{FileHandle, FileNode};
use crate::vfs::key;
use crate::vfs::{DirEntry, FileInfo, OpenFlags, WritableFs};

/// State shared between the filesystem, its file nodes and the archive
/// pipeline.
pub(crate) struct FsShared {
    pub(crate) client: Arc<dyn ObjectClient>,
    pub(crate) staging: StagingDir,
    pub(crate) cancel: CancellationToken,
    pub(crate) files: Mutex<HashMap<String, Arc<FileNode>>>,
    pub(crate) next_handle_id: AtomicU64,
}

impl FsShared {
    /// Operations on a closed filesystem fail instead of racing teardown.
    pub(crate) fn check_open(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(FsError::Closed);
        }
        Ok(())
    }

    /// Retire a registry entry once it has no handles and no staging file.
    /// Skipped when a concurrent open raced in; the entry then simply stays
    /// until its own last close.
    pub(crate) fn release(&self, path: &str) {
        let mut files = self.files.lock().unwrap();
        if let Some(node) = files.get(path).cloned() {
            if let Ok(state) = node.state.try_lock() {
                if state.is_idle() {
                    drop(state);
                    files.remove(path);
                }
            }
        }
    }
}

/// A writable filesystem backed by an object-store bucket.
///
/// Objects are immutable, so writes are staged in a local temporary
/// directory and uploaded when a file is synced or its last handle closes.
/// A crash before that point discards buffered changes.
#[derive(Clone)]
pub struct BucketFs {
    pub(crate) shared: Arc<FsShared>,
}

impl BucketFs {
    /// Open a filesystem over the given object client. Creates the staging
    /// directory; call [`BucketFs::close`] to tear it down again.
    pub async fn new(client: Arc<dyn ObjectClient>) -> Result<Self> {
        let staging = StagingDir::create().await?;

        Ok(Self {
            shared: Arc::new(FsShared {
                client,
                staging,
                cancel: CancellationToken::new(),
                files: Mutex::new(HashMap::new()),
                next_handle_id: AtomicU64::new(1),
            }),
        })
    }

    /// Close the filesystem: cancel pending operations, tear down every open
    /// file and remove the staging directory. Best-effort; the first error
    /// is reported but the staging root is removed regardless.
    pub async fn close(&self) -> Result<()> {
        debug!("closing bucket filesystem");

        self.shared.cancel.cancel();

        let files: Vec<Arc<FileNode>> = {
            let mut files = self.shared.files.lock().unwrap();
            files.drain().map(|(_, node)| node).collect()
        };

        let mut first_err = None;
        for node in files {
            node.cancel.cancel();
            if let Err(err) = node.teardown().await {
                first_err.get_or_insert(err);
            }
        }

        if let Err(err) = self.shared.staging.remove_root().await {
            first_err.get_or_insert(err);
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Stat a path against the store. A missing key is retried as a directory by
/// listing the parent: if the first entry after the key matches its basename
/// the path is a directory, explicit marker or not.
pub(crate) async fn stat_path(shared: &Arc<FsShared>, path: &str) -> Result<FileInfo> {
    let obj_key = key::to_key(path, false);

    debug!(key = %obj_key, "getting status of object");

    if obj_key.is_empty() {
        // Pseudo-entry for the root directory.
        return Ok(FileInfo::root());
    }

    match shared.client.stat_object(&obj_key).await {
        Ok(stat) => Ok(FileInfo::new(stat.key, stat.size, stat.last_modified)),
        Err(ClientError::NoSuchKey(_)) => {
            debug!(key = %obj_key, "statting directory by listing parent");

            let opts = ListOptions {
                recursive: false,
                start_after: Some(obj_key.clone()),
                max_keys: Some(1),
            };
            let mut stream = shared
                .client
                .list_objects(&key::parent_key(&obj_key), &opts);

            let want = key::base(obj_key.trim_end_matches('/'));
            while let Some(item) = stream.next().await {
                let info = item.map_err(FsError::from)?;
                if key::base(info.key.trim_end_matches('/')) == want {
                    debug!(key = %obj_key, "found directory in parent");
                    return Ok(FileInfo::new(info.key, info.size, info.last_modified));
                }
            }

            Err(FsError::NotFound)
        }
        Err(err) => Err(err.into()),
    }
}

#[async_trait]
impl WritableFs for BucketFs {
    async fn open_file(&self, path: &str, flags: OpenFlags) -> Result<FileHandle> {
        self.shared.check_open()?;

        let non_empty = match self.stat(path).await {
            Ok(_) => true,
            Err(FsError::NotFound) => {
                if !flags.is_set(OpenFlags::CREATE) {
                    return Err(FsError::NotFound);
                }
                false
            }
            Err(err) => return Err(err),
        };

        let node = {
            let mut files = self.shared.files.lock().unwrap();
            files
                .entry(key::clean(path))
                .or_insert_with(|| {
                    Arc::new(FileNode::new(
                        self.shared.clone(),
                        key::clean(path),
                        key::to_key(path, false),
                        self.shared.cancel.child_token(),
                    ))
                })
                .clone()
        };

        node.new_handle(flags.read_only(), non_empty).await
    }

    async fn stat(&self, path: &str) -> Result<FileInfo> {
        self.shared.check_open()?;

        stat_path(&self.shared, path).await
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        self.shared.check_open()?;

        let dir_key = key::to_key(path, true);

        debug!(key = %dir_key, "listing objects in directory");

        let mut stream = self
            .shared
            .client
            .list_objects(&dir_key, &ListOptions::default());

        let mut entries = Vec::new();
        while let Some(item) = stream.next().await {
            let info = item.map_err(FsError::from)?;

            // Skip the directory itself (not all stores return the marker).
            if info.key == dir_key {
                continue;
            }

            let name = info
                .key
                .strip_prefix(&dir_key)
                .unwrap_or(&info.key)
                .to_string();
            let is_dir = info.key.ends_with('/');
            entries.push(DirEntry::new(name, info.size, info.last_modified, is_dir));
        }

        // Distinguish an empty directory from a missing one. Only done as a
        // last resort since it costs an extra round trip.
        if entries.is_empty() && !dir_key.is_empty() && self.stat(path).await.is_err() {
            return Err(FsError::NotFound);
        }

        Ok(entries)
    }

    async fn mkdir_all(&self, path: &str) -> Result<()> {
        self.shared.check_open()?;

        let dir_key = key::to_key(path, true);

        debug!(key = %dir_key, "creating directory structure");

        let mut partial = String::new();
        for part in dir_key.split('/') {
            if part.is_empty() {
                continue;
            }
            partial.push_str(part);
            partial.push('/');

            // Directories are zero-length objects with a slash suffix.
            if let Err(err) = self
                .shared
                .client
                .put_object(&partial, PutBody::empty(), 0, &PutOptions::default())
                .await
            {
                error!(key = %partial, error = %err, "failed to create directory");
                return Err(err.into());
            }
        }

        Ok(())
    }

    async fn remove_all(&self, path: &str) -> Result<()> {
        self.shared.check_open()?;

        // Is it an object instead of a directory?
        if let Ok(info) = self.stat(path).await {
            if !info.is_dir() {
                let obj_key = key::to_key(path, false);
                debug!(key = %obj_key, "removing object");
                self.shared.client.remove_object(&obj_key).await?;
                return Ok(());
            }
        }

        let dir_key = key::to_key(path, true);

        debug!(key = %dir_key, "removing directory");

        let mut errors: Vec<FsError> = Vec::new();

        let mut keys = Vec::new();
        let mut stream = self.shared.client.list_objects(
            &dir_key,
            &ListOptions {
                recursive: true,
                ..Default::default()
            },
        );
        while let Some(item) = stream.next().await {
            match item {
                Ok(info) => keys.push(info.key),
                Err(err) => errors.push(err.into()),
            }
        }

        match self.shared.client.remove_objects(keys).await {
            Ok(failures) => errors.extend(failures.into_iter().map(FsError::from)),
            Err(err) => errors.push(err.into()),
        }

        // Finally the directory marker itself.
        if let Err(err) = self.shared.client.remove_object(&dir_key).await {
            errors.push(err.into());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(FsError::Aggregate(errors))
        }
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        self.shared.check_open()?;

        debug!(old = %old_path, new = %new_path, "renaming object");

        // TODO: support directory renames.

        let src = key::to_key(old_path, false);
        let dst = key::to_key(new_path, false);

        self.shared
            .client
            .copy_object(&src, &dst, &CopyOptions::default())
            .await?;
        self.shared.client.remove_object(&src).await?;
        Ok(())
    }
}
