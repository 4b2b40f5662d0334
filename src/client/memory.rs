//! In-memory object store, used as a mock backend by the test suite and for
//! fully ephemeral filesystems. Mirrors S3 listing semantics closely enough
//! to stand in for a real endpoint: lexicographic order, `start-after`,
//! `max-keys` and common-prefix folding for non-recursive listings.

use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::sync::Mutex;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::io::AsyncReadExt;

use super::{
    ClientError, CopyOptions, GetOptions, ListOptions, ListStream, ObjectClient, ObjectInfo,
    ObjectStat, ObjectStream, PutBody, PutOptions,
};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    last_modified: SystemTime,
    user_metadata: HashMap<String, String>,
}

#[derive(Debug, Default)]
pub struct MemoryClient {
    objects: Mutex<BTreeMap<String, StoredObject>>,
}

impl MemoryClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects, markers included.
    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lowercase_keys(metadata: HashMap<String, String>) -> HashMap<String, String> {
        // Metadata travels as HTTP headers on the wire, so names fold to
        // lowercase exactly like they would against a real endpoint.
        metadata
            .into_iter()
            .map(|(name, value)| (name.to_lowercase(), value))
            .collect()
    }
}

#[async_trait]
impl ObjectClient for MemoryClient {
    async fn put_object(
        &self,
        key: &str,
        body: PutBody,
        _size: u64,
        opts: &PutOptions,
    ) -> Result<(), ClientError> {
        let data = match body {
            PutBody::Bytes(bytes) => bytes,
            PutBody::File(mut file) => {
                let mut buf = Vec::new();
                file.read_to_end(&mut buf).await?;
                Bytes::from(buf)
            }
        };

        let mut objects = self.objects.lock().unwrap();
        objects.insert(
            key.to_string(),
            StoredObject {
                data,
                last_modified: SystemTime::now(),
                user_metadata: Self::lowercase_keys(opts.user_metadata.clone().unwrap_or_default()),
            },
        );

        Ok(())
    }

    async fn get_object(&self, key: &str, opts: &GetOptions) -> Result<ObjectStream, ClientError> {
        let objects = self.objects.lock().unwrap();
        let obj = objects
            .get(key)
            .ok_or_else(|| ClientError::NoSuchKey(key.to_string()))?;

        let start = (opts.range_start.unwrap_or(0) as usize).min(obj.data.len());
        Ok(Box::new(Cursor::new(obj.data.slice(start..))))
    }

    async fn stat_object(&self, key: &str) -> Result<ObjectStat, ClientError> {
        let objects = self.objects.lock().unwrap();
        let obj = objects
            .get(key)
            .ok_or_else(|| ClientError::NoSuchKey(key.to_string()))?;

        Ok(ObjectStat {
            key: key.to_string(),
            size: obj.data.len() as u64,
            last_modified: obj.last_modified,
            user_metadata: obj.user_metadata.clone(),
        })
    }

    fn list_objects(&self, prefix: &str, opts: &ListOptions) -> ListStream {
        let objects = self.objects.lock().unwrap();

        // Results keyed by name so explicit markers and synthesized common
        // prefixes collapse into a single entry, in lexicographic order.
        let mut results: BTreeMap<String, ObjectInfo> = BTreeMap::new();

        for (key, obj) in objects.iter() {
            let Some(rest) = key.strip_prefix(prefix) else {
                continue;
            };
            if let Some(start_after) = &opts.start_after {
                if key.as_str() <= start_after.as_str() {
                    continue;
                }
            }

            if !opts.recursive {
                if let Some(idx) = rest.find('/') {
                    if idx + 1 < rest.len() {
                        // The key extends past the first level: fold it into
                        // a common prefix.
                        let folded = format!("{prefix}{}", &rest[..=idx]);
                        results.entry(folded.clone()).or_insert(ObjectInfo {
                            key: folded,
                            size: 0,
                            last_modified: SystemTime::UNIX_EPOCH,
                        });
                        continue;
                    }
                }
            }

            results.insert(
                key.clone(),
                ObjectInfo {
                    key: key.clone(),
                    size: obj.data.len() as u64,
                    last_modified: obj.last_modified,
                },
            );
        }

        let mut entries: Vec<Result<ObjectInfo, ClientError>> =
            results.into_values().map(Ok).collect();
        if let Some(max) = opts.max_keys {
            entries.truncate(max);
        }

        futures::stream::iter(entries).boxed()
    }

    async fn remove_object(&self, key: &str) -> Result<(), ClientError> {
        // Removal of a missing key is not an error, matching S3.
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    async fn remove_objects(&self, keys: Vec<String>) -> Result<Vec<ClientError>, ClientError> {
        let mut objects = self.objects.lock().unwrap();
        for key in &keys {
            objects.remove(key);
        }
        Ok(Vec::new())
    }

    async fn copy_object(
        &self,
        src_key: &str,
        dst_key: &str,
        opts: &CopyOptions,
    ) -> Result<(), ClientError> {
        let mut objects = self.objects.lock().unwrap();
        let src = objects
            .get(src_key)
            .ok_or_else(|| ClientError::NoSuchKey(src_key.to_string()))?
            .clone();

        let user_metadata = if opts.replace_metadata {
            Self::lowercase_keys(opts.user_metadata.clone().unwrap_or_default())
        } else {
            src.user_metadata
        };

        objects.insert(
            dst_key.to_string(),
            StoredObject {
                data: src.data,
                last_modified: SystemTime::now(),
                user_metadata,
            },
        );

        Ok(())
    }
}
