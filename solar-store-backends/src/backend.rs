use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;

use crate::error::{BackendError, BackendResult};

/// Body of a blob in transit, chunked.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// What a backend knows about a stored blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub key: String,
    pub size: u64,
    pub content_type: Option<String>,
    pub etag: String,
    pub last_modified: DateTime<Utc>,
    pub custom_metadata: HashMap<String, String>,
}

/// A blob opened for reading.
pub struct ObjectData {
    pub metadata: ObjectMetadata,
    pub stream: ByteStream,
}

impl fmt::Debug for ObjectData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectData")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// Blob storage addressed by key.
///
/// Implementations must be safe to share behind an `Arc<dyn Backend>`; every
/// call is independent and nothing is retried.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Verifies the backing bucket or directory is usable.
    async fn init(&self) -> BackendResult<()>;

    /// Stores the whole stream under `key`, replacing any previous blob.
    async fn put_object(
        &self,
        key: &str,
        stream: ByteStream,
        content_type: Option<String>,
        metadata: HashMap<String, String>,
    ) -> BackendResult<ObjectMetadata>;

    /// Fails with [`BackendError::NotFound`] when nothing is stored at `key`.
    async fn get_object(&self, key: &str) -> BackendResult<ObjectData>;

    async fn head_object(&self, key: &str) -> BackendResult<ObjectMetadata>;

    async fn delete_object(&self, key: &str) -> BackendResult<()>;

    /// Blobs whose key starts with `prefix`, ordered by key where the
    /// provider allows it.
    async fn list_objects(
        &self,
        prefix: Option<&str>,
        max_keys: Option<usize>,
    ) -> BackendResult<Vec<ObjectMetadata>>;

    async fn object_exists(&self, key: &str) -> BackendResult<bool> {
        match self.head_object(key).await {
            Ok(_) => Ok(true),
            Err(BackendError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Durable, non-expiring URL under which `key` can be fetched.
    fn public_url(&self, key: &str) -> String;
}

pub fn compute_etag(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Wraps an in-memory buffer as a single-chunk stream.
pub fn stream_from_bytes(data: impl Into<Bytes>) -> ByteStream {
    let data = data.into();
    Box::pin(futures::stream::once(async move { Ok(data) }))
}

/// Drains a stream into memory.
pub async fn collect_stream(mut stream: ByteStream) -> BackendResult<Vec<u8>> {
    let mut data = Vec::new();
    while let Some(chunk) = stream.next().await {
        data.extend_from_slice(&chunk?);
    }
    Ok(data)
}

pub(crate) fn join_url(base: &str, key: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        key.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_roundtrip() {
        let stream = stream_from_bytes(b"solar".to_vec());
        let data = collect_stream(stream).await.unwrap();
        assert_eq!(data, b"solar");
    }

    #[test]
    fn test_join_url_normalizes_slashes() {
        assert_eq!(
            join_url("http://localhost:8000/media/", "/images/solar/a.jpg"),
            "http://localhost:8000/media/images/solar/a.jpg"
        );
        assert_eq!(join_url("https://cdn", "a.png"), "https://cdn/a.png");
    }

    #[test]
    fn test_etag_is_stable() {
        assert_eq!(compute_etag(b"abc"), compute_etag(b"abc"));
        assert_ne!(compute_etag(b"abc"), compute_etag(b"abd"));
    }
}
