//! Archive pipeline: completeness, round-trip fidelity, error propagation
//! and early reader close.

mod common;

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncReadExt;

use bucketfs::client::memory::MemoryClient;
use bucketfs::client::{
    ClientError, CopyOptions, GetOptions, ListOptions, ListStream, ObjectClient, ObjectStat,
    ObjectStream, PutBody, PutOptions,
};
use bucketfs::vfs::{BucketFs, OpenFlags, WritableFs};

use common::{dir_hash, new_fs, read_file, write_file};

async fn collect_archive(fs: &BucketFs, path: &str) -> Vec<u8> {
    let mut reader = fs.archive(path);
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes).await.unwrap();
    bytes
}

/// Parsed tar entries as (name, is_dir, mode, contents).
fn parse_archive(bytes: &[u8]) -> Vec<(String, bool, u32, Vec<u8>)> {
    let mut archive = tar::Archive::new(bytes);
    let mut out = Vec::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let name = entry.path().unwrap().to_string_lossy().into_owned();
        let is_dir = entry.header().entry_type() == tar::EntryType::Directory;
        let mode = entry.header().mode().unwrap();
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents).unwrap();
        out.push((name, is_dir, mode, contents));
    }
    out
}

#[tokio::test]
async fn test_archive_completeness() {
    let (fs, client) = new_fs().await;

    fs.mkdir_all("arc/sub").await.unwrap();
    write_file(&fs, "arc/a.txt", b"alpha").await;
    write_file(&fs, "arc/sub/b.txt", b"bravo").await;

    // An object with no directory markers anywhere on its path; the archive
    // synthesizes the intermediate directory.
    client
        .put_object(
            "arc/imp/c.txt",
            PutBody::Bytes(Bytes::from_static(b"charlie")),
            7,
            &PutOptions::default(),
        )
        .await
        .unwrap();

    let bytes = collect_archive(&fs, "arc").await;
    let entries = parse_archive(&bytes);

    // All directory entries precede all file entries.
    let first_file = entries.iter().position(|(_, is_dir, _, _)| !is_dir).unwrap();
    assert!(entries[..first_file].iter().all(|(_, is_dir, _, _)| *is_dir));
    assert!(entries[first_file..].iter().all(|(_, is_dir, _, _)| !is_dir));

    let dirs: Vec<&str> = entries[..first_file]
        .iter()
        .map(|(name, _, _, _)| name.trim_end_matches('/'))
        .collect();
    assert_eq!(dirs, vec!["imp", "sub"]);
    for (_, _, mode, _) in &entries[..first_file] {
        assert_eq!(*mode, 0o755);
    }

    let mut files: BTreeMap<String, Vec<u8>> = BTreeMap::new();
    for (name, _, mode, contents) in &entries[first_file..] {
        assert_eq!(*mode, 0o644);
        files.insert(name.clone(), contents.clone());
    }
    assert_eq!(files.len(), 3);
    assert_eq!(files.get("a.txt").unwrap(), b"alpha");
    assert_eq!(files.get("sub/b.txt").unwrap(), b"bravo");
    assert_eq!(files.get("imp/c.txt").unwrap(), b"charlie");

    fs.close().await.unwrap();
}

#[tokio::test]
async fn test_archive_of_empty_directory() {
    let (fs, _client) = new_fs().await;

    fs.mkdir_all("empty/inner").await.unwrap();

    let bytes = collect_archive(&fs, "empty").await;
    let entries = parse_archive(&bytes);

    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].0.trim_end_matches('/'), "inner");
    assert!(entries[0].1);

    fs.close().await.unwrap();
}

#[tokio::test]
async fn test_archive_round_trip_preserves_directory_hash() {
    let (fs, _client) = new_fs().await;

    let mut manifest: BTreeMap<String, Vec<u8>> = BTreeMap::new();
    manifest.insert("readme.txt".to_string(), b"top level".to_vec());
    manifest.insert("data/one.bin".to_string(), vec![1u8; 2048]);
    manifest.insert("data/two.bin".to_string(), vec![2u8; 777]);
    manifest.insert("data/nested/three.txt".to_string(), b"deep".to_vec());

    fs.mkdir_all("tree/data/nested").await.unwrap();
    for (name, contents) in &manifest {
        write_file(&fs, &format!("tree/{name}"), contents).await;
    }
    let expected = dir_hash(&manifest);

    let bytes = collect_archive(&fs, "tree").await;

    // Extract into a fresh filesystem, the way a client would.
    let (target, _client2) = new_fs().await;
    let mut archive = tar::Archive::new(bytes.as_slice());
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let name = entry.path().unwrap().to_string_lossy().into_owned();

        if entry.header().entry_type() == tar::EntryType::Directory {
            target.mkdir_all(&name).await.unwrap();
            continue;
        }

        let mut contents = Vec::new();
        entry.read_to_end(&mut contents).unwrap();
        assert_eq!(contents.len() as u64, entry.header().size().unwrap());

        let file = target
            .open_file(&name, OpenFlags::CREATE | OpenFlags::READ_WRITE)
            .await
            .unwrap();
        file.write(&contents).await.unwrap();
        file.close().await.unwrap();
    }

    // Recompute the directory hash over the extracted tree.
    let mut extracted: BTreeMap<String, Vec<u8>> = BTreeMap::new();
    for name in manifest.keys() {
        extracted.insert(name.clone(), read_file(&target, name).await);
    }
    assert_eq!(dir_hash(&extracted), expected);

    target.close().await.unwrap();
    fs.close().await.unwrap();
}

/// Wraps the in-memory client, counting downloads and slowing them so the
/// cancellation tests can observe the pipeline.
struct SlowClient {
    inner: MemoryClient,
    delay: Duration,
    gets: AtomicUsize,
    fail_substring: Option<&'static str>,
}

impl SlowClient {
    fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryClient::new(),
            delay,
            gets: AtomicUsize::new(0),
            fail_substring: None,
        }
    }

    fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectClient for SlowClient {
    async fn put_object(
        &self,
        key: &str,
        body: PutBody,
        size: u64,
        opts: &PutOptions,
    ) -> Result<(), ClientError> {
        self.inner.put_object(key, body, size, opts).await
    }

    async fn get_object(&self, key: &str, opts: &GetOptions) -> Result<ObjectStream, ClientError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if let Some(marker) = self.fail_substring {
            if key.contains(marker) {
                return Err(ClientError::Backend("injected download failure".into()));
            }
        }
        tokio::time::sleep(self.delay).await;
        self.inner.get_object(key, opts).await
    }

    async fn stat_object(&self, key: &str) -> Result<ObjectStat, ClientError> {
        self.inner.stat_object(key).await
    }

    fn list_objects(&self, prefix: &str, opts: &ListOptions) -> ListStream {
        self.inner.list_objects(prefix, opts)
    }

    async fn remove_object(&self, key: &str) -> Result<(), ClientError> {
        self.inner.remove_object(key).await
    }

    async fn remove_objects(&self, keys: Vec<String>) -> Result<Vec<ClientError>, ClientError> {
        self.inner.remove_objects(keys).await
    }

    async fn copy_object(
        &self,
        src_key: &str,
        dst_key: &str,
        opts: &CopyOptions,
    ) -> Result<(), ClientError> {
        self.inner.copy_object(src_key, dst_key, opts).await
    }
}

async fn populate(client: &SlowClient, count: usize) {
    for i in 0..count {
        client
            .inner
            .put_object(
                &format!("big/obj-{i:03}"),
                PutBody::Bytes(Bytes::from(vec![b'x'; 1024])),
                1024,
                &PutOptions::default(),
            )
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_dropping_reader_cancels_downloads() {
    common::init_logging();

    const OBJECTS: usize = 60;

    let client = Arc::new(SlowClient::new(Duration::from_millis(100)));
    populate(&client, OBJECTS).await;

    let fs = BucketFs::new(client.clone()).await.unwrap();

    let reader = fs.archive("big");
    drop(reader);

    // In-flight downloads abort and no new ones start.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let after_cancel = client.gets();
    assert!(after_cancel < OBJECTS, "downloads kept going: {after_cancel}");

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(client.gets(), after_cancel);

    fs.close().await.unwrap();
}

#[tokio::test]
async fn test_dropping_reader_mid_stream_cancels_downloads() {
    common::init_logging();

    const OBJECTS: usize = 60;

    let client = Arc::new(SlowClient::new(Duration::from_millis(50)));
    populate(&client, OBJECTS).await;

    let fs = BucketFs::new(client.clone()).await.unwrap();

    let mut reader = fs.archive("big");
    let mut buf = [0u8; 1024];
    reader.read_exact(&mut buf).await.unwrap();
    drop(reader);

    tokio::time::sleep(Duration::from_millis(400)).await;
    let after_cancel = client.gets();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(client.gets(), after_cancel);

    fs.close().await.unwrap();
}

#[tokio::test]
async fn test_download_error_surfaces_on_reader() {
    common::init_logging();

    let mut client = SlowClient::new(Duration::from_millis(1));
    client.fail_substring = Some("poison");
    let client = Arc::new(client);

    for (key, data) in [("err/ok-1", "fine"), ("err/poison", "bad"), ("err/ok-2", "fine")] {
        client
            .inner
            .put_object(
                key,
                PutBody::Bytes(Bytes::from(data.as_bytes().to_vec())),
                data.len() as u64,
                &PutOptions::default(),
            )
            .await
            .unwrap();
    }

    let fs = BucketFs::new(client.clone()).await.unwrap();

    let mut reader = fs.archive("err");
    let mut sink = Vec::new();
    let result = reader.read_to_end(&mut sink).await;
    assert!(result.is_err());

    fs.close().await.unwrap();
}
