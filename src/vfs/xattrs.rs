//! Per-handle extended-attribute view over an object's user metadata.
//!
//! Reads are served from a cache refreshed on every sync; writes and
//! removals are staged as pending changes and committed through a
//! metadata-replacing self-copy, the only way to rewrite object metadata.
//! Because that copy is not atomic, concurrent editors of the same key are
//! last-writer-wins. Attribute names fold to lowercase at every boundary.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::client::CopyOptions;
use crate::error::{FsError, Result};
use crate::vfs::file::FileNode;

#[derive(Debug, Clone)]
enum AttrChange {
    Set(String),
    Remove,
}

pub struct FileXAttrs {
    node: Arc<FileNode>,
    read_only: bool,
    /// Cache of the attributes as last seen on the object.
    cache: HashMap<String, String>,
    /// Staged changes, applied on the next sync.
    changes: Mutex<HashMap<String, AttrChange>>,
}

impl FileXAttrs {
    pub(crate) async fn new(node: Arc<FileNode>, read_only: bool) -> Result<Self> {
        let mut attrs = Self {
            node,
            read_only,
            cache: HashMap::new(),
            changes: Mutex::new(HashMap::new()),
        };
        attrs.sync().await?;
        Ok(attrs)
    }

    pub fn get(&self, name: &str) -> Result<Vec<u8>> {
        let name = name.to_lowercase();

        debug!(key = %self.node.key, name = %name, "getting extended attribute");

        // Pending changes shadow the cache.
        if let Some(change) = self.changes.lock().unwrap().get(&name) {
            return match change {
                AttrChange::Remove => Err(FsError::NoSuchAttr),
                AttrChange::Set(value) => Ok(value.clone().into_bytes()),
            };
        }

        match self.cache.get(&name) {
            Some(value) => Ok(value.clone().into_bytes()),
            None => Err(FsError::NoSuchAttr),
        }
    }

    pub fn set(&self, name: &str, value: &[u8]) -> Result<()> {
        let name = name.to_lowercase();

        debug!(key = %self.node.key, name = %name, "setting extended attribute");

        if self.read_only {
            return Err(FsError::Permission);
        }

        // Metadata values travel as header strings.
        let value = String::from_utf8(value.to_vec()).map_err(|_| FsError::Invalid)?;

        self.changes
            .lock()
            .unwrap()
            .insert(name, AttrChange::Set(value));
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        let name = name.to_lowercase();

        debug!(key = %self.node.key, name = %name, "removing extended attribute");

        if self.read_only {
            return Err(FsError::Permission);
        }

        self.changes.lock().unwrap().insert(name, AttrChange::Remove);
        Ok(())
    }

    /// All attribute names: the cache plus staged sets, minus tombstones.
    pub fn list(&self) -> Vec<String> {
        debug!(key = %self.node.key, "listing extended attributes");

        let mut names: HashSet<String> = self.cache.keys().cloned().collect();
        for (name, change) in self.changes.lock().unwrap().iter() {
            match change {
                AttrChange::Remove => {
                    names.remove(name);
                }
                AttrChange::Set(_) => {
                    names.insert(name.clone());
                }
            }
        }
        names.into_iter().collect()
    }

    /// Refresh the cache from the object, then commit staged changes via a
    /// metadata-replacing self-copy. The refresh deliberately races remote
    /// edits against local ones: writer wins for both set and remove.
    pub async fn sync(&mut self) -> Result<()> {
        debug!(key = %self.node.key, "syncing extended attributes");

        let stat = self
            .node
            .shared
            .client
            .stat_object(&self.node.key)
            .await
            .map_err(FsError::from)?;

        self.cache = stat
            .user_metadata
            .into_iter()
            .map(|(name, value)| (name.to_lowercase(), value))
            .collect();

        let pending = self.changes.lock().unwrap().clone();
        if pending.is_empty() {
            debug!(key = %self.node.key, "no attribute changes to commit");
            return Ok(());
        }

        for (name, change) in &pending {
            match change {
                AttrChange::Remove => {
                    self.cache.remove(name);
                }
                AttrChange::Set(value) => {
                    self.cache.insert(name.clone(), value.clone());
                }
            }
        }

        self.node
            .shared
            .client
            .copy_object(
                &self.node.key,
                &self.node.key,
                &CopyOptions {
                    user_metadata: Some(self.cache.clone()),
                    replace_metadata: true,
                },
            )
            .await
            .map_err(FsError::from)?;

        self.changes.lock().unwrap().clear();
        Ok(())
    }
}
