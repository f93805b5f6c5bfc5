use async_trait::async_trait;
use chrono::{DateTime, Utc};
use google_cloud_storage::client::{Client, ClientConfig};
use google_cloud_storage::http::objects::delete::DeleteObjectRequest;
use google_cloud_storage::http::objects::download::Range;
use google_cloud_storage::http::objects::get::GetObjectRequest;
use google_cloud_storage::http::objects::list::ListObjectsRequest;
use google_cloud_storage::http::objects::upload::{Media, UploadObjectRequest, UploadType};
use google_cloud_storage::http::objects::Object;
use google_cloud_storage::http::Error as GcsError;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::backend::{
    collect_stream, join_url, stream_from_bytes, Backend, ByteStream, ObjectData, ObjectMetadata,
};
use crate::error::{BackendError, BackendResult};

/// Google Cloud Storage backend; Firebase Storage buckets are plain GCS
/// buckets and work through it as well.
///
/// Uploads are simple media uploads, so custom metadata is not persisted.
pub struct GcsBackend {
    client: Client,
    bucket_name: String,
    public_base_url: String,
}

impl GcsBackend {
    pub async fn new(bucket_name: String, public_base_url: Option<String>) -> BackendResult<Self> {
        let config = ClientConfig::default().with_auth().await.map_err(|e| {
            BackendError::Configuration(format!("GCS credentials unavailable: {}", e))
        })?;

        let public_base_url = public_base_url.unwrap_or_else(|| default_public_base(&bucket_name));

        info!(
            "Initialized GCS backend for bucket {} (public base: {})",
            bucket_name, public_base_url
        );
        Ok(Self {
            client: Client::new(config),
            bucket_name,
            public_base_url,
        })
    }

    fn object_request(&self, key: &str) -> GetObjectRequest {
        GetObjectRequest {
            bucket: self.bucket_name.clone(),
            object: key.to_string(),
            ..Default::default()
        }
    }
}

fn default_public_base(bucket_name: &str) -> String {
    format!("https://storage.googleapis.com/{}", bucket_name)
}

fn is_not_found(err: &GcsError) -> bool {
    matches!(err, GcsError::Response(response) if response.code == 404)
}

fn map_gcs_error(operation: &str, key: &str, err: GcsError) -> BackendError {
    if is_not_found(&err) {
        return BackendError::NotFound(key.to_string());
    }
    warn!("GCS {} failed for '{}': {}", operation, key, err);
    BackendError::Provider(format!("GCS {} '{}': {}", operation, key, err))
}

fn from_gcs_object(object: Object) -> ObjectMetadata {
    let last_modified = object
        .updated
        .and_then(|ts| DateTime::from_timestamp(ts.unix_timestamp(), ts.nanosecond()))
        .unwrap_or_else(Utc::now);

    ObjectMetadata {
        key: object.name,
        size: u64::try_from(object.size).unwrap_or(0),
        content_type: object.content_type,
        etag: object.etag,
        last_modified,
        custom_metadata: object.metadata.unwrap_or_default(),
    }
}

#[async_trait]
impl Backend for GcsBackend {
    async fn init(&self) -> BackendResult<()> {
        let probe = ListObjectsRequest {
            bucket: self.bucket_name.clone(),
            max_results: Some(1),
            ..Default::default()
        };

        self.client.list_objects(&probe).await.map_err(|e| {
            BackendError::Configuration(format!(
                "Cannot access GCS bucket '{}': {}",
                self.bucket_name, e
            ))
        })?;

        info!("GCS bucket {} is reachable", self.bucket_name);
        Ok(())
    }

    async fn put_object(
        &self,
        key: &str,
        stream: ByteStream,
        content_type: Option<String>,
        _custom_metadata: HashMap<String, String>,
    ) -> BackendResult<ObjectMetadata> {
        let data = collect_stream(stream).await?;
        let size = data.len();

        let mut media = Media::new(key.to_string());
        if let Some(ct) = content_type {
            media.content_type = ct.into();
        }

        let request = UploadObjectRequest {
            bucket: self.bucket_name.clone(),
            ..Default::default()
        };

        let object = self
            .client
            .upload_object(&request, data, &UploadType::Simple(media))
            .await
            .map_err(|e| map_gcs_error("upload", key, e))?;

        debug!("Stored {} in GCS ({} bytes)", key, size);
        Ok(from_gcs_object(object))
    }

    /// Reads the object's metadata first so a missing key never starts a
    /// download.
    async fn get_object(&self, key: &str) -> BackendResult<ObjectData> {
        let metadata = self.head_object(key).await?;

        let data = self
            .client
            .download_object(&self.object_request(key), &Range::default())
            .await
            .map_err(|e| map_gcs_error("download", key, e))?;

        debug!("Downloaded {} from GCS ({} bytes)", key, data.len());
        Ok(ObjectData {
            metadata,
            stream: stream_from_bytes(data),
        })
    }

    async fn head_object(&self, key: &str) -> BackendResult<ObjectMetadata> {
        self.client
            .get_object(&self.object_request(key))
            .await
            .map(from_gcs_object)
            .map_err(|e| map_gcs_error("stat", key, e))
    }

    async fn delete_object(&self, key: &str) -> BackendResult<()> {
        let request = DeleteObjectRequest {
            bucket: self.bucket_name.clone(),
            object: key.to_string(),
            ..Default::default()
        };

        self.client
            .delete_object(&request)
            .await
            .map_err(|e| map_gcs_error("delete", key, e))?;

        debug!("Deleted {} from GCS", key);
        Ok(())
    }

    async fn list_objects(
        &self,
        prefix: Option<&str>,
        max_keys: Option<usize>,
    ) -> BackendResult<Vec<ObjectMetadata>> {
        let mut request = ListObjectsRequest {
            bucket: self.bucket_name.clone(),
            prefix: prefix.map(str::to_string),
            ..Default::default()
        };

        let mut objects = Vec::new();
        loop {
            let response = self
                .client
                .list_objects(&request)
                .await
                .map_err(|e| map_gcs_error("list", prefix.unwrap_or_default(), e))?;

            objects.extend(response.items.unwrap_or_default().into_iter().map(from_gcs_object));

            if let Some(max) = max_keys {
                if objects.len() >= max {
                    objects.truncate(max);
                    break;
                }
            }

            match response.next_page_token {
                Some(token) => request.page_token = Some(token),
                None => break,
            }
        }

        debug!("Listed {} GCS objects under {:?}", objects.len(), prefix);
        Ok(objects)
    }

    fn public_url(&self, key: &str) -> String {
        join_url(&self.public_base_url, key)
    }
}
