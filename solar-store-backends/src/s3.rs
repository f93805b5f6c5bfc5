use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::operation::head_object::HeadObjectError;
use aws_sdk_s3::primitives::{ByteStream as AwsByteStream, DateTime as AwsDateTime};
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::backend::{
    collect_stream, compute_etag, join_url, Backend, ByteStream, ObjectData, ObjectMetadata,
};
use crate::error::{BackendError, BackendResult};

/// S3 (or S3-compatible) backend.
///
/// Public URLs are plain object URLs, so the bucket (or the configured
/// `public_base_url` in front of it) must allow anonymous reads. A custom
/// endpoint switches the client to path-style addressing.
pub struct S3Backend {
    client: Client,
    bucket_name: String,
    public_base_url: String,
}

impl S3Backend {
    pub async fn new(
        bucket_name: String,
        region: String,
        endpoint: Option<String>,
        public_base_url: Option<String>,
    ) -> BackendResult<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.clone()));
        if let Some(endpoint_url) = endpoint.as_deref() {
            loader = loader.endpoint_url(endpoint_url);
        }
        let sdk_config = loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(endpoint.is_some())
            .build();

        let public_base_url = public_base_url
            .unwrap_or_else(|| default_public_base(&bucket_name, &region, endpoint.as_deref()));

        info!(
            "Initialized S3 backend for bucket {} in {} (public base: {})",
            bucket_name, region, public_base_url
        );
        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket_name,
            public_base_url,
        })
    }
}

fn provider_error<E>(operation: &str, key: &str, err: E) -> BackendError
where
    E: std::error::Error,
{
    let detail = DisplayErrorContext(&err).to_string();
    warn!("S3 {} failed for '{}': {}", operation, key, detail);
    BackendError::Provider(format!("S3 {} '{}': {}", operation, key, detail))
}

fn to_chrono(timestamp: Option<&AwsDateTime>) -> DateTime<Utc> {
    timestamp
        .and_then(|ts| DateTime::from_timestamp(ts.secs(), ts.subsec_nanos()))
        .unwrap_or_else(Utc::now)
}

fn object_metadata(
    key: &str,
    size: Option<i64>,
    content_type: Option<&str>,
    etag: Option<&str>,
    last_modified: Option<&AwsDateTime>,
    custom_metadata: Option<&HashMap<String, String>>,
) -> ObjectMetadata {
    ObjectMetadata {
        key: key.to_string(),
        size: size.and_then(|s| u64::try_from(s).ok()).unwrap_or(0),
        content_type: content_type.map(str::to_string),
        etag: etag.map(str::to_string).unwrap_or_default(),
        last_modified: to_chrono(last_modified),
        custom_metadata: custom_metadata.cloned().unwrap_or_default(),
    }
}

#[async_trait]
impl Backend for S3Backend {
    async fn init(&self) -> BackendResult<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket_name)
            .send()
            .await
            .map_err(|e| {
                BackendError::Configuration(format!(
                    "Cannot access S3 bucket '{}': {}",
                    self.bucket_name,
                    DisplayErrorContext(&e)
                ))
            })?;

        info!("S3 bucket {} is reachable", self.bucket_name);
        Ok(())
    }

    async fn put_object(
        &self,
        key: &str,
        stream: ByteStream,
        content_type: Option<String>,
        custom_metadata: HashMap<String, String>,
    ) -> BackendResult<ObjectMetadata> {
        let data = collect_stream(stream).await?;
        let size = data.len() as u64;
        let local_etag = compute_etag(&data);

        let output = self
            .client
            .put_object()
            .bucket(&self.bucket_name)
            .key(key)
            .body(AwsByteStream::from(data))
            .set_content_type(content_type.clone())
            .set_metadata((!custom_metadata.is_empty()).then(|| custom_metadata.clone()))
            .send()
            .await
            .map_err(|e| provider_error("put", key, e))?;

        debug!("Stored {} in S3 ({} bytes)", key, size);
        Ok(ObjectMetadata {
            key: key.to_string(),
            size,
            content_type,
            etag: output.e_tag().map(str::to_string).unwrap_or(local_etag),
            last_modified: Utc::now(),
            custom_metadata,
        })
    }

    async fn get_object(&self, key: &str) -> BackendResult<ObjectData> {
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket_name)
            .key(key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(e) if e.as_service_error().is_some_and(GetObjectError::is_no_such_key) => {
                return Err(BackendError::NotFound(key.to_string()));
            }
            Err(e) => return Err(provider_error("get", key, e)),
        };

        let metadata = object_metadata(
            key,
            output.content_length(),
            output.content_type(),
            output.e_tag(),
            output.last_modified(),
            output.metadata(),
        );

        debug!("Streaming {} from S3 ({} bytes)", key, metadata.size);
        let stream: ByteStream = Box::pin(ReaderStream::new(output.body.into_async_read()));

        Ok(ObjectData { metadata, stream })
    }

    async fn head_object(&self, key: &str) -> BackendResult<ObjectMetadata> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket_name)
            .key(key)
            .send()
            .await
        {
            Ok(output) => Ok(object_metadata(
                key,
                output.content_length(),
                output.content_type(),
                output.e_tag(),
                output.last_modified(),
                output.metadata(),
            )),
            Err(e) if e.as_service_error().is_some_and(HeadObjectError::is_not_found) => {
                Err(BackendError::NotFound(key.to_string()))
            }
            Err(e) => Err(provider_error("head", key, e)),
        }
    }

    /// S3 deletes are idempotent, so a missing key is reported as `NotFound`
    /// only after a failed `head_object`.
    async fn delete_object(&self, key: &str) -> BackendResult<()> {
        self.head_object(key).await?;

        self.client
            .delete_object()
            .bucket(&self.bucket_name)
            .key(key)
            .send()
            .await
            .map_err(|e| provider_error("delete", key, e))?;

        debug!("Deleted {} from S3", key);
        Ok(())
    }

    /// Follows continuation tokens until `max_keys` objects are collected or
    /// the listing is exhausted.
    async fn list_objects(
        &self,
        prefix: Option<&str>,
        max_keys: Option<usize>,
    ) -> BackendResult<Vec<ObjectMetadata>> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket_name)
            .set_prefix(prefix.map(str::to_string))
            .into_paginator()
            .send();

        let mut objects = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| provider_error("list", prefix.unwrap_or_default(), e))?;

            for obj in page.contents() {
                let Some(key) = obj.key() else {
                    continue;
                };
                objects.push(object_metadata(
                    key,
                    obj.size(),
                    None,
                    obj.e_tag(),
                    obj.last_modified(),
                    None,
                ));

                if max_keys.is_some_and(|max| objects.len() >= max) {
                    return Ok(objects);
                }
            }
        }

        debug!("Listed {} S3 objects under {:?}", objects.len(), prefix);
        Ok(objects)
    }

    fn public_url(&self, key: &str) -> String {
        join_url(&self.public_base_url, key)
    }
}

fn default_public_base(bucket_name: &str, region: &str, endpoint: Option<&str>) -> String {
    match endpoint {
        // Path-style addressing for S3-compatible servers
        Some(endpoint_url) => join_url(endpoint_url, bucket_name),
        None => format!("https://{}.s3.{}.amazonaws.com", bucket_name, region),
    }
}
