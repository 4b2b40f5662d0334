//! Object-store client facade.
//!
//! Submodules:
//! - `s3`: implementation backed by an S3-compatible endpoint
//! - `memory`: in-memory implementation for tests and ephemeral use
//!
//! The facade exposes the fixed verb set the filesystem is built on:
//! put/get/stat/list/remove/copy-with-metadata. Directory semantics live
//! entirely above this layer.

pub mod memory;
pub mod s3;

use std::collections::HashMap;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use thiserror::Error;
use tokio::io::AsyncRead;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no such key: {0}")]
    NoSuchKey(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Backend(Box<dyn std::error::Error + Send + Sync>),
}

impl ClientError {
    pub(crate) fn backend<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        ClientError::Backend(Box::new(err))
    }
}

/// A single listing result.
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: SystemTime,
}

/// The result of a stat, including the object's user metadata.
#[derive(Debug, Clone)]
pub struct ObjectStat {
    pub key: String,
    pub size: u64,
    pub last_modified: SystemTime,
    pub user_metadata: HashMap<String, String>,
}

/// The body of an upload. Buffered uploads use `Bytes`; staged files are
/// handed over as an open file so they stream instead of being buffered.
pub enum PutBody {
    Bytes(Bytes),
    File(tokio::fs::File),
}

impl PutBody {
    pub fn empty() -> Self {
        PutBody::Bytes(Bytes::new())
    }
}

#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub content_type: Option<String>,
    pub user_metadata: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GetOptions {
    /// Read from this byte offset to the end of the object.
    pub range_start: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Descend below the first level of the prefix. Non-recursive listings
    /// surface deeper entries as synthetic `…/` common prefixes.
    pub recursive: bool,
    /// Only return keys lexicographically after this one.
    pub start_after: Option<String>,
    pub max_keys: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct CopyOptions {
    pub user_metadata: Option<HashMap<String, String>>,
    /// Replace the destination metadata wholesale instead of copying the
    /// source's. A metadata-replacing self-copy is the only way to rewrite
    /// object metadata in place.
    pub replace_metadata: bool,
}

pub type ObjectStream = Box<dyn AsyncRead + Send + Unpin>;

pub type ListStream = BoxStream<'static, Result<ObjectInfo, ClientError>>;

/// The verb set the filesystem consumes. All operations are fallible and
/// cancellable by dropping the returned future.
#[async_trait]
pub trait ObjectClient: Send + Sync {
    async fn put_object(
        &self,
        key: &str,
        body: PutBody,
        size: u64,
        opts: &PutOptions,
    ) -> Result<(), ClientError>;

    async fn get_object(&self, key: &str, opts: &GetOptions) -> Result<ObjectStream, ClientError>;

    async fn stat_object(&self, key: &str) -> Result<ObjectStat, ClientError>;

    fn list_objects(&self, prefix: &str, opts: &ListOptions) -> ListStream;

    async fn remove_object(&self, key: &str) -> Result<(), ClientError>;

    /// Remove a batch of keys. Per-object failures are reported in the
    /// returned vector; the call itself only fails wholesale.
    async fn remove_objects(&self, keys: Vec<String>) -> Result<Vec<ClientError>, ClientError>;

    async fn copy_object(
        &self,
        src_key: &str,
        dst_key: &str,
        opts: &CopyOptions,
    ) -> Result<(), ClientError>;
}
