use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::backend::{
    collect_stream, compute_etag, join_url, Backend, ByteStream, ObjectData, ObjectMetadata,
};
use crate::error::{BackendError, BackendResult};

const METADATA_SUFFIX: &str = ".meta.json";

static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

/// Filesystem backend. Objects live under `<root>/<bucket>/<key>` with a
/// sidecar `<key>.meta.json`; public URLs are built from `public_base_url`,
/// which is expected to point at a route serving these objects.
pub struct LocalBackend {
    root_path: PathBuf,
    bucket_name: String,
    public_base_url: String,
}

impl LocalBackend {
    pub fn new(root_path: PathBuf, bucket_name: String, public_base_url: String) -> Self {
        Self {
            root_path,
            bucket_name,
            public_base_url,
        }
    }

    fn bucket_path(&self) -> PathBuf {
        self.root_path.join(&self.bucket_name)
    }

    fn get_full_path(&self, key: &str) -> BackendResult<PathBuf> {
        if key.is_empty() || key.contains("..") || key.starts_with('/') {
            return Err(BackendError::InvalidPath(format!("Invalid key: {}", key)));
        }
        if key.ends_with(METADATA_SUFFIX) {
            return Err(BackendError::InvalidPath(format!(
                "Reserved suffix in key: {}",
                key
            )));
        }

        Ok(self.bucket_path().join(key))
    }

    fn get_metadata_path(&self, key: &str) -> BackendResult<PathBuf> {
        let mut path = self.get_full_path(key)?.into_os_string();
        path.push(METADATA_SUFFIX);
        Ok(PathBuf::from(path))
    }

    async fn read_metadata(&self, key: &str) -> BackendResult<ObjectMetadata> {
        let meta_path = self.get_metadata_path(key)?;

        let content = match fs::read_to_string(&meta_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(BackendError::NotFound(key.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        Ok(serde_json::from_str(&content)?)
    }

    async fn write_metadata(&self, metadata: &ObjectMetadata) -> BackendResult<()> {
        let meta_path = self.get_metadata_path(&metadata.key)?;

        if let Some(parent) = meta_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_string_pretty(metadata)?;
        fs::write(&meta_path, content).await?;
        Ok(())
    }

    async fn collect_keys(&self, dir: PathBuf, keys: &mut Vec<String>) -> BackendResult<()> {
        let bucket_path = self.bucket_path();
        let mut pending = vec![dir];

        while let Some(current) = pending.pop() {
            let mut entries = match fs::read_dir(&current).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                if path.to_string_lossy().ends_with(METADATA_SUFFIX) {
                    continue;
                }
                if let Some(key) = relative_key(&bucket_path, &path) {
                    keys.push(key);
                }
            }
        }

        Ok(())
    }
}

fn relative_key(bucket_path: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(bucket_path).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    Some(parts.join("/"))
}

/// Sibling path a blob is written to before being renamed into place.
fn staging_path(path: &Path) -> PathBuf {
    let seq = STAGING_SEQ.fetch_add(1, Ordering::Relaxed);
    let mut staging = path.as_os_str().to_os_string();
    staging.push(format!(".{}.{}.partial", std::process::id(), seq));
    PathBuf::from(staging)
}

async fn remove_if_present(path: &Path) -> BackendResult<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn init(&self) -> BackendResult<()> {
        let bucket_path = self.bucket_path();
        fs::create_dir_all(&bucket_path).await?;
        info!("Local blob storage ready at {:?}", bucket_path);
        Ok(())
    }

    /// The blob is staged next to its final path and renamed over it, so
    /// readers never observe a partially written file.
    async fn put_object(
        &self,
        key: &str,
        stream: ByteStream,
        content_type: Option<String>,
        custom_metadata: HashMap<String, String>,
    ) -> BackendResult<ObjectMetadata> {
        let object_path = self.get_full_path(key)?;
        let data = collect_stream(stream).await?;

        if let Some(parent) = object_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let staging = staging_path(&object_path);
        let mut file = fs::File::create(&staging).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&staging, &object_path).await?;

        let metadata = ObjectMetadata {
            key: key.to_string(),
            size: data.len() as u64,
            content_type,
            etag: compute_etag(&data),
            last_modified: Utc::now(),
            custom_metadata,
        };
        self.write_metadata(&metadata).await?;

        debug!("Stored {} ({} bytes, etag {})", key, metadata.size, metadata.etag);
        Ok(metadata)
    }

    async fn get_object(&self, key: &str) -> BackendResult<ObjectData> {
        let metadata = self.read_metadata(key).await?;

        let file = match fs::File::open(self.get_full_path(key)?).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(BackendError::NotFound(key.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        debug!("Opened {} for reading", key);
        Ok(ObjectData {
            metadata,
            stream: Box::pin(ReaderStream::new(file)),
        })
    }

    async fn head_object(&self, key: &str) -> BackendResult<ObjectMetadata> {
        self.read_metadata(key).await
    }

    async fn delete_object(&self, key: &str) -> BackendResult<()> {
        let object_path = self.get_full_path(key)?;
        let meta_path = self.get_metadata_path(key)?;

        if !remove_if_present(&object_path).await? {
            return Err(BackendError::NotFound(key.to_string()));
        }
        remove_if_present(&meta_path).await?;

        debug!("Deleted {}", key);
        Ok(())
    }

    async fn list_objects(
        &self,
        prefix: Option<&str>,
        max_keys: Option<usize>,
    ) -> BackendResult<Vec<ObjectMetadata>> {
        debug!("Listing objects with prefix: {:?}", prefix);

        let prefix = prefix.unwrap_or("");
        // Walk from the deepest directory fully named by the prefix.
        let walk_root = match prefix.rfind('/') {
            Some(idx) => self.bucket_path().join(&prefix[..idx]),
            None => self.bucket_path(),
        };

        let mut keys = Vec::new();
        self.collect_keys(walk_root, &mut keys).await?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();

        if let Some(max) = max_keys {
            keys.truncate(max);
        }

        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            match self.read_metadata(&key).await {
                Ok(metadata) => results.push(metadata),
                Err(BackendError::NotFound(_)) => {
                    debug!("Skipping object without metadata: {}", key);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(results)
    }

    fn public_url(&self, key: &str) -> String {
        join_url(&self.public_base_url, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::stream_from_bytes;
    use tempfile::TempDir;

    fn backend(temp_dir: &TempDir) -> LocalBackend {
        LocalBackend::new(
            temp_dir.path().to_path_buf(),
            "test-bucket".to_string(),
            "http://localhost:8000/media".to_string(),
        )
    }

    #[tokio::test]
    async fn test_local_backend_put_get() {
        let temp_dir = TempDir::new().unwrap();
        let backend = backend(&temp_dir);

        backend.init().await.unwrap();

        let data = b"\xFF\xD8\xFFjpeg-bytes".to_vec();
        let metadata = backend
            .put_object(
                "images/solar/panel.jpg",
                stream_from_bytes(data.clone()),
                Some("image/jpeg".to_string()),
                HashMap::new(),
            )
            .await
            .unwrap();

        assert_eq!(metadata.key, "images/solar/panel.jpg");
        assert_eq!(metadata.size, data.len() as u64);

        let obj = backend.get_object("images/solar/panel.jpg").await.unwrap();
        assert_eq!(obj.metadata.content_type.as_deref(), Some("image/jpeg"));
        assert_eq!(collect_stream(obj.stream).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_local_backend_delete() {
        let temp_dir = TempDir::new().unwrap();
        let backend = backend(&temp_dir);

        backend.init().await.unwrap();

        backend
            .put_object(
                "a.txt",
                stream_from_bytes(b"hello".to_vec()),
                None,
                HashMap::new(),
            )
            .await
            .unwrap();

        backend.delete_object("a.txt").await.unwrap();

        assert!(!backend.object_exists("a.txt").await.unwrap());
        let result = backend.get_object("a.txt").await;
        assert!(matches!(result, Err(BackendError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_objects_by_prefix_skips_sidecars() {
        let temp_dir = TempDir::new().unwrap();
        let backend = backend(&temp_dir);
        backend.init().await.unwrap();

        for key in [
            ".documents/solar/b.json",
            ".documents/solar/a.json",
            ".documents/other/c.json",
            "images/solar/x.png",
        ] {
            backend
                .put_object(key, stream_from_bytes(b"{}".to_vec()), None, HashMap::new())
                .await
                .unwrap();
        }

        let listed = backend
            .list_objects(Some(".documents/solar/"), None)
            .await
            .unwrap();
        let keys: Vec<_> = listed.iter().map(|m| m.key.as_str()).collect();
        assert_eq!(keys, vec![".documents/solar/a.json", ".documents/solar/b.json"]);

        let empty = backend.list_objects(Some("missing/"), None).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_path_traversal_prevention() {
        let temp_dir = TempDir::new().unwrap();
        let backend = backend(&temp_dir);

        backend.init().await.unwrap();

        let result = backend
            .put_object(
                "../etc/passwd",
                stream_from_bytes(vec![1, 2, 3]),
                None,
                HashMap::new(),
            )
            .await;
        assert!(matches!(result, Err(BackendError::InvalidPath(_))));
    }

    #[tokio::test]
    async fn test_put_replaces_existing_blob() {
        let temp_dir = TempDir::new().unwrap();
        let backend = backend(&temp_dir);
        backend.init().await.unwrap();

        for body in [b"first".to_vec(), b"second".to_vec()] {
            backend
                .put_object("doc.json", stream_from_bytes(body), None, HashMap::new())
                .await
                .unwrap();
        }

        let obj = backend.get_object("doc.json").await.unwrap();
        assert_eq!(obj.metadata.size, 6);
        assert_eq!(collect_stream(obj.stream).await.unwrap(), b"second");

        let listed = backend.list_objects(None, None).await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[test]
    fn test_public_url() {
        let temp_dir = TempDir::new().unwrap();
        let backend = backend(&temp_dir);
        assert_eq!(
            backend.public_url("images/solar/x.png"),
            "http://localhost:8000/media/images/solar/x.png"
        );
    }
}
