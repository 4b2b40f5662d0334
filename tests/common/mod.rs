#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Once;

use base64::Engine as _;
use sha2::{Digest, Sha256};

use bucketfs::client::memory::MemoryClient;
use bucketfs::vfs::{BucketFs, FileHandle, OpenFlags, WritableFs};

static INIT: Once = Once::new();

pub fn init_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .with_test_writer()
            .init();
    });
}

/// A filesystem over a fresh in-memory bucket. The raw client is returned
/// too so tests can observe the on-wire state directly.
pub async fn new_fs() -> (BucketFs, Arc<MemoryClient>) {
    init_logging();

    let client = Arc::new(MemoryClient::new());
    let fs = BucketFs::new(client.clone()).await.unwrap();
    (fs, client)
}

/// Create a file with the given contents and flush it to the store.
pub async fn write_file(fs: &impl WritableFs, path: &str, data: &[u8]) {
    let file = fs
        .open_file(path, OpenFlags::CREATE | OpenFlags::READ_WRITE)
        .await
        .unwrap();
    file.write(data).await.unwrap();
    file.close().await.unwrap();
}

/// Read a whole file through a handle.
pub async fn read_all(file: &FileHandle) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = file.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    out
}

/// Open a file read-only and return its contents.
pub async fn read_file(fs: &impl WritableFs, path: &str) -> Vec<u8> {
    let file = fs.open(path).await.unwrap();
    let data = read_all(&file).await;
    file.close().await.unwrap();
    data
}

/// Hash a (relative path -> contents) manifest the way Go module directory
/// hashes are computed: SHA-256 over the sorted per-file SHA-256 lines,
/// rendered as `h1:` plus the base64 digest.
pub fn dir_hash(files: &BTreeMap<String, Vec<u8>>) -> String {
    let mut outer = Sha256::new();
    for (name, content) in files {
        let digest = Sha256::digest(content);
        outer.update(format!("{}  {}\n", hex::encode(digest), name));
    }
    format!(
        "h1:{}",
        base64::engine::general_purpose::STANDARD.encode(outer.finalize())
    )
}
