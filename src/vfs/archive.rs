//! Streaming tar archiver for bucket subtrees.
//!
//! The producer lists the subtree, emits sorted directory headers up front,
//! then fans object downloads out across a bounded pool of workers. Workers
//! serialize their entries through a mutex-guarded tar writer into a bounded
//! pipe; the reader half is handed back to the caller. Dropping the reader
//! cancels the whole pipeline.

use std::collections::BTreeSet;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::SystemTime;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use tar::{EntryType, Header};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::io::StreamReader;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::debug;

use crate::client::{GetOptions, ListOptions, ObjectClient, ObjectInfo, ObjectStream};
use crate::error::FsError;
use crate::vfs::fs::{BucketFs, FsShared};
use crate::vfs::key;

/// How many object downloads may be in flight at once.
const NUM_CONNECTIONS: usize = 20;

/// Objects above this size stream through the tar writer instead of being
/// buffered, at the cost of serializing that transfer.
const LARGE_OBJECT_THRESHOLD: u64 = 32 * 1024 * 1024;

const COPY_CHUNK: usize = 64 * 1024;

/// Bounded depth of the pipe feeding the reader, in chunks.
const PIPE_DEPTH: usize = 16;

const BLOCK_SIZE: u64 = 512;

impl BucketFs {
    /// Stream an uncompressed tar archive of the subtree at `path`.
    /// Directory entries precede file entries and paths inside the archive
    /// are relative to the archived root. Errors during production surface
    /// on the reader; dropping the reader early aborts in-flight downloads.
    pub fn archive(&self, path: &str) -> ArchiveReader {
        let dir_key = key::to_key(path, true);

        debug!(key = %dir_key, "archiving directory");

        let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(PIPE_DEPTH);
        let token = self.shared.cancel.child_token();

        let shared = self.shared.clone();
        tokio::spawn(run(shared, dir_key, tx, token.clone()));

        let chunks = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();

        ArchiveReader {
            inner: StreamReader::new(chunks),
            _cancel: token.drop_guard(),
        }
    }
}

/// The reader half of the archive pipe. Dropping it cancels the pipeline.
pub struct ArchiveReader {
    inner: StreamReader<BoxStream<'static, io::Result<Bytes>>, Bytes>,
    _cancel: DropGuard,
}

impl AsyncRead for ArchiveReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

async fn run(
    shared: Arc<FsShared>,
    dir_key: String,
    tx: mpsc::Sender<io::Result<Bytes>>,
    token: CancellationToken,
) {
    if let Err(err) = produce(&shared, &dir_key, &tx, &token).await {
        // Deliver the error through the pipe; a vanished reader no longer
        // cares.
        let _ = tx.send(Err(err)).await;
    }
    // Pipeline finished or failed: abort anything still in flight.
    token.cancel();
}

async fn produce(
    shared: &Arc<FsShared>,
    dir_key: &str,
    tx: &mpsc::Sender<io::Result<Bytes>>,
    token: &CancellationToken,
) -> io::Result<()> {
    if token.is_cancelled() {
        return Err(io::Error::new(io::ErrorKind::Interrupted, "archive cancelled"));
    }

    let mut objects: Vec<ObjectInfo> = Vec::new();
    let mut directories: BTreeSet<String> = BTreeSet::new();

    let mut stream = shared.client.list_objects(
        dir_key,
        &ListOptions {
            recursive: true,
            ..Default::default()
        },
    );
    while let Some(item) = stream.next().await {
        let info = item.map_err(io::Error::other)?;

        // Skip the archived directory itself.
        if info.key == dir_key {
            continue;
        }

        let rel = info
            .key
            .strip_prefix(dir_key)
            .unwrap_or(&info.key)
            .to_string();

        if let Some(dir) = rel.strip_suffix('/') {
            directories.insert(dir.to_string());
            continue;
        }

        // Synthesize the intermediate directories so archives stay
        // well-formed even when the store omits explicit markers.
        let mut dir = key::dirname(&rel);
        while dir != "." && dir != "/" && !directories.contains(&dir) {
            directories.insert(dir.clone());
            dir = key::dirname(&dir);
        }

        objects.push(info);
    }

    let writer = Arc::new(Mutex::new(TarPipe { tx: tx.clone() }));

    // Directories go up front so files can be emitted in arbitrary order.
    {
        let pipe = writer.lock().await;
        for dir in &directories {
            pipe.write_dir_header(dir).await?;
        }
    }

    let semaphore = Arc::new(Semaphore::new(NUM_CONNECTIONS));
    let mut tasks = JoinSet::new();
    for info in objects {
        let client = shared.client.clone();
        let writer = writer.clone();
        let semaphore = semaphore.clone();
        let token = token.clone();
        let root = dir_key.to_string();

        tasks.spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return Ok(()),
            };
            if token.is_cancelled() {
                return Ok(());
            }
            archive_object(client.as_ref(), &writer, &token, &root, info).await
        });
    }

    // Joined in completion order, so the first failure cancels the rest
    // without waiting on unrelated downloads.
    let mut first_err: Option<io::Error> = None;
    while let Some(task) = tasks.join_next().await {
        match task {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                token.cancel();
                first_err.get_or_insert(err);
            }
            Err(err) => {
                token.cancel();
                first_err.get_or_insert(io::Error::other(err));
            }
        }
    }
    if let Some(err) = first_err {
        return Err(err);
    }

    let result = writer.lock().await.finish().await;
    result
}

async fn archive_object(
    client: &dyn ObjectClient,
    writer: &Mutex<TarPipe>,
    token: &CancellationToken,
    root: &str,
    info: ObjectInfo,
) -> io::Result<()> {
    let get_options = GetOptions::default();
    let get = client.get_object(&info.key, &get_options);
    let mut stream = tokio::select! {
        biased;
        _ = token.cancelled() => return Ok(()),
        res = get => res.map_err(io::Error::other)?,
    };

    let name = info.key.strip_prefix(root).unwrap_or(&info.key).to_string();

    if info.size > LARGE_OBJECT_THRESHOLD {
        let pipe = writer.lock().await;
        pipe.write_file_header(&name, info.size, info.last_modified)
            .await?;
        let copied = pipe.copy_from(stream, token).await?;
        if copied != info.size {
            return Err(io::Error::other(FsError::ShortWrite));
        }
        pipe.pad(info.size).await?;
    } else {
        // Buffer small objects first so the downloads overlap.
        let mut data = Vec::with_capacity(info.size as usize);
        let read = stream.read_to_end(&mut data);
        tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            res = read => {
                res?;
            }
        }
        if data.len() as u64 != info.size {
            return Err(io::Error::other(FsError::ShortWrite));
        }

        let pipe = writer.lock().await;
        pipe.write_file_header(&name, info.size, info.last_modified)
            .await?;
        pipe.send(Bytes::from(data)).await?;
        pipe.pad(info.size).await?;
    }

    Ok(())
}

/// The serialization point of the pipeline: emits tar blocks into the pipe.
struct TarPipe {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl TarPipe {
    async fn send(&self, bytes: Bytes) -> io::Result<()> {
        self.tx.send(Ok(bytes)).await.map_err(|_| {
            io::Error::new(io::ErrorKind::BrokenPipe, "archive reader closed")
        })
    }

    async fn write_dir_header(&self, path: &str) -> io::Result<()> {
        let mut header = Header::new_ustar();
        header.set_path(format!("{path}/"))?;
        header.set_entry_type(EntryType::Directory);
        header.set_mode(0o755);
        header.set_size(0);
        header.set_mtime(0);
        header.set_cksum();
        self.send(Bytes::copy_from_slice(header.as_bytes())).await
    }

    async fn write_file_header(
        &self,
        path: &str,
        size: u64,
        mod_time: SystemTime,
    ) -> io::Result<()> {
        let mut header = Header::new_ustar();
        header.set_path(path)?;
        header.set_entry_type(EntryType::Regular);
        header.set_mode(0o644);
        header.set_size(size);
        header.set_mtime(
            mod_time
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        );
        header.set_cksum();
        self.send(Bytes::copy_from_slice(header.as_bytes())).await
    }

    /// Zero-fill to the next block boundary after `size` bytes of content.
    async fn pad(&self, size: u64) -> io::Result<()> {
        let rem = (size % BLOCK_SIZE) as usize;
        if rem != 0 {
            self.send(Bytes::from(vec![0u8; BLOCK_SIZE as usize - rem]))
                .await?;
        }
        Ok(())
    }

    async fn copy_from(&self, mut stream: ObjectStream, token: &CancellationToken) -> io::Result<u64> {
        let mut total = 0u64;
        let mut buf = vec![0u8; COPY_CHUNK];
        loop {
            let read = stream.read(&mut buf);
            let n = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    return Err(io::Error::new(io::ErrorKind::Interrupted, "archive cancelled"))
                }
                res = read => res?,
            };
            if n == 0 {
                break;
            }
            total += n as u64;
            self.send(Bytes::copy_from_slice(&buf[..n])).await?;
        }
        Ok(total)
    }

    /// The tar stream trailer: two zero blocks.
    async fn finish(&self) -> io::Result<()> {
        self.send(Bytes::from_static(&[0u8; 1024])).await
    }
}
