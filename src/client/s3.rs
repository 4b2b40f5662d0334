//! S3-compatible backend for the object client facade, built on aws-sdk-s3.
//! Uses path-style addressing so it works against MinIO/SeaweedFS style
//! endpoints as well as AWS itself.

use std::time::SystemTime;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, MetadataDirective, ObjectIdentifier};
use aws_sdk_s3::Client;
use futures::StreamExt;
use tracing::debug;

use super::{
    ClientError, CopyOptions, GetOptions, ListOptions, ListStream, ObjectClient, ObjectInfo,
    ObjectStat, ObjectStream, PutBody, PutOptions,
};

/// S3 delete-objects batches are capped by the protocol.
const MAX_DELETE_BATCH: usize = 1000;

/// Connection options for an S3-compatible endpoint. Credentials and region
/// are injected by the caller; the endpoint URL scheme selects TLS.
#[derive(Debug, Clone)]
pub struct S3Options {
    pub endpoint_url: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
}

pub struct S3Client {
    client: Client,
    bucket: String,
}

impl S3Client {
    /// Open a client against the configured endpoint and bucket.
    pub async fn connect(opts: S3Options) -> Result<Self, ClientError> {
        let endpoint = normalize_endpoint(&opts.endpoint_url)?;

        debug!(endpoint = %endpoint, bucket = %opts.bucket, "opening S3 client");

        let credentials =
            Credentials::new(opts.access_key, opts.secret_key, None, None, "bucketfs");
        let conf = aws_config::defaults(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new(opts.region))
            .endpoint_url(endpoint)
            .load()
            .await;
        let s3_conf = aws_sdk_s3::config::Builder::from(&conf)
            .force_path_style(true)
            .build();

        Ok(Self {
            client: Client::from_conf(s3_conf),
            bucket: opts.bucket,
        })
    }
}

/// Normalize an endpoint URL: the scheme selects TLS and a missing port
/// defaults to 443/80 respectively.
fn normalize_endpoint(raw: &str) -> Result<String, ClientError> {
    let (scheme, rest) = raw
        .split_once("://")
        .ok_or_else(|| ClientError::Backend(format!("invalid endpoint url: {raw}").into()))?;

    let default_port = match scheme {
        "https" => 443,
        "http" => 80,
        other => {
            return Err(ClientError::Backend(
                format!("unsupported endpoint scheme: {other}").into(),
            ))
        }
    };

    let host = rest.split('/').next().unwrap_or(rest);
    if host.is_empty() {
        return Err(ClientError::Backend(
            format!("invalid endpoint url: {raw}").into(),
        ));
    }

    if host.contains(':') {
        Ok(format!("{scheme}://{host}"))
    } else {
        Ok(format!("{scheme}://{host}:{default_port}"))
    }
}

fn to_system_time(dt: Option<&aws_sdk_s3::primitives::DateTime>) -> SystemTime {
    dt.and_then(|dt| SystemTime::try_from(*dt).ok())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

#[async_trait]
impl ObjectClient for S3Client {
    async fn put_object(
        &self,
        key: &str,
        body: PutBody,
        size: u64,
        opts: &PutOptions,
    ) -> Result<(), ClientError> {
        let stream = match body {
            PutBody::Bytes(bytes) => ByteStream::from(bytes),
            PutBody::File(file) => ByteStream::read_from()
                .file(file)
                .build()
                .await
                .map_err(ClientError::backend)?,
        };

        let mut req = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_length(size as i64)
            .body(stream);
        if let Some(content_type) = &opts.content_type {
            req = req.content_type(content_type);
        }
        if let Some(metadata) = &opts.user_metadata {
            req = req.set_metadata(Some(metadata.clone()));
        }

        req.send().await.map_err(ClientError::backend)?;
        Ok(())
    }

    async fn get_object(&self, key: &str, opts: &GetOptions) -> Result<ObjectStream, ClientError> {
        let mut req = self.client.get_object().bucket(&self.bucket).key(key);
        if let Some(start) = opts.range_start {
            req = req.range(format!("bytes={start}-"));
        }

        match req.send().await {
            Ok(resp) => Ok(Box::new(resp.body.into_async_read())),
            Err(err) => {
                if let SdkError::ServiceError(service_err) = &err {
                    if service_err.err().is_no_such_key() {
                        return Err(ClientError::NoSuchKey(key.to_string()));
                    }
                }
                Err(ClientError::backend(err))
            }
        }
    }

    async fn stat_object(&self, key: &str) -> Result<ObjectStat, ClientError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(resp) => Ok(ObjectStat {
                key: key.to_string(),
                size: resp.content_length().unwrap_or(0).max(0) as u64,
                last_modified: to_system_time(resp.last_modified()),
                user_metadata: resp.metadata().cloned().unwrap_or_default(),
            }),
            Err(err) => {
                if let SdkError::ServiceError(service_err) = &err {
                    if service_err.err().is_not_found() {
                        return Err(ClientError::NoSuchKey(key.to_string()));
                    }
                }
                Err(ClientError::backend(err))
            }
        }
    }

    fn list_objects(&self, prefix: &str, opts: &ListOptions) -> ListStream {
        let mut req = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix);
        if !opts.recursive {
            req = req.delimiter("/");
        }
        if let Some(start_after) = &opts.start_after {
            req = req.start_after(start_after);
        }
        if let Some(max_keys) = opts.max_keys {
            req = req.max_keys(max_keys as i32);
        }

        let paginator = req.into_paginator().send();

        futures::stream::unfold(Some(paginator), |state| async move {
            let mut paginator = state?;
            match paginator.next().await {
                None => None,
                Some(Ok(page)) => {
                    let mut entries: Vec<ObjectInfo> = Vec::new();
                    for obj in page.contents() {
                        let Some(key) = obj.key() else { continue };
                        entries.push(ObjectInfo {
                            key: key.to_string(),
                            size: obj.size().unwrap_or(0).max(0) as u64,
                            last_modified: to_system_time(obj.last_modified()),
                        });
                    }
                    for common in page.common_prefixes() {
                        let Some(folded) = common.prefix() else { continue };
                        entries.push(ObjectInfo {
                            key: folded.to_string(),
                            size: 0,
                            last_modified: SystemTime::UNIX_EPOCH,
                        });
                    }
                    // Contents and common prefixes arrive as two sorted runs;
                    // merge them back into key order.
                    entries.sort_by(|a, b| a.key.cmp(&b.key));
                    let results: Vec<Result<ObjectInfo, ClientError>> =
                        entries.into_iter().map(Ok).collect();
                    Some((futures::stream::iter(results), Some(paginator)))
                }
                Some(Err(err)) => Some((
                    futures::stream::iter(vec![Err(ClientError::backend(err))]),
                    None,
                )),
            }
        })
        .flatten()
        .boxed()
    }

    async fn remove_object(&self, key: &str) -> Result<(), ClientError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(ClientError::backend)?;
        Ok(())
    }

    async fn remove_objects(&self, keys: Vec<String>) -> Result<Vec<ClientError>, ClientError> {
        let mut failures = Vec::new();

        for chunk in keys.chunks(MAX_DELETE_BATCH) {
            let mut identifiers = Vec::with_capacity(chunk.len());
            for key in chunk {
                identifiers.push(
                    ObjectIdentifier::builder()
                        .key(key)
                        .build()
                        .map_err(ClientError::backend)?,
                );
            }
            let delete = Delete::builder()
                .set_objects(Some(identifiers))
                .build()
                .map_err(ClientError::backend)?;

            let resp = self
                .client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(ClientError::backend)?;

            for err in resp.errors() {
                failures.push(ClientError::Backend(
                    format!(
                        "{}: {}",
                        err.key().unwrap_or("<unknown key>"),
                        err.message().unwrap_or("delete failed")
                    )
                    .into(),
                ));
            }
        }

        Ok(failures)
    }

    async fn copy_object(
        &self,
        src_key: &str,
        dst_key: &str,
        opts: &CopyOptions,
    ) -> Result<(), ClientError> {
        let mut req = self
            .client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(format!("{}/{}", self.bucket, src_key))
            .key(dst_key);
        if opts.replace_metadata {
            req = req
                .metadata_directive(MetadataDirective::Replace)
                .set_metadata(opts.user_metadata.clone());
        }

        match req.send().await {
            Ok(_) => Ok(()),
            Err(err) => {
                // The copy error type doesn't model NoSuchKey; fall back to
                // matching on the rendered error.
                let msg = format!("{err:?}");
                if msg.contains("NoSuchKey") {
                    return Err(ClientError::NoSuchKey(src_key.to_string()));
                }
                Err(ClientError::backend(err))
            }
        }
    }
}
