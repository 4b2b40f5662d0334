use thiserror::Error;

use crate::client::ClientError;

/// Errors surfaced by the filesystem layer.
///
/// The first group mirrors the classic filesystem error vocabulary; the rest
/// carry underlying I/O and object-store failures unchanged.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("invalid argument")]
    Invalid,

    #[error("permission denied")]
    Permission,

    #[error("file already exists")]
    Exist,

    #[error("file does not exist")]
    NotFound,

    #[error("file already closed")]
    Closed,

    #[error("no such attribute")]
    NoSuchAttr,

    #[error("short write")]
    ShortWrite,

    #[error("{} errors occurred during bulk operation", .0.len())]
    Aggregate(Vec<FsError>),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("object store: {0}")]
    Client(ClientError),
}

impl From<ClientError> for FsError {
    fn from(err: ClientError) -> Self {
        match err {
            // A missing key means the path does not exist as far as the
            // filesystem is concerned.
            ClientError::NoSuchKey(_) => FsError::NotFound,
            other => FsError::Client(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, FsError>;
