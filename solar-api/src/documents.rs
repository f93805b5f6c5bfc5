use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use solar_store_backends::{collect_stream, stream_from_bytes, Backend, BackendError};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DOCUMENTS_PREFIX: &str = ".documents";

/// JSON object body of a stored document, without its id.
pub type Document = Map<String, Value>;

#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub id: String,
    pub fields: Document,
}

#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("Document not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    #[error("Duplicate value for {field}: {value}")]
    DuplicateKey { field: String, value: String },

    #[error("Document is not a JSON object")]
    NotAnObject,

    #[error("Document backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type DocumentResult<T> = Result<T, DocumentError>;

/// Collection-scoped JSON document storage.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Stores `doc` under a freshly generated id and returns the id.
    async fn insert(&self, collection: &str, doc: Document) -> DocumentResult<String>;

    /// Like `insert`, but fails with `DuplicateKey` when another document in
    /// the collection already holds the same value for `field`.
    async fn insert_unique(
        &self,
        collection: &str,
        field: &str,
        doc: Document,
    ) -> DocumentResult<String>;

    async fn get(&self, collection: &str, id: &str) -> DocumentResult<Option<StoredDocument>>;

    async fn list(&self, collection: &str) -> DocumentResult<Vec<StoredDocument>>;

    /// Documents whose `field` equals `value`.
    async fn query(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> DocumentResult<Vec<StoredDocument>>;

    /// Overlays `patch` onto an existing document; absent keys are kept.
    async fn merge_update(&self, collection: &str, id: &str, patch: Document)
        -> DocumentResult<()>;

    async fn delete(&self, collection: &str, id: &str) -> DocumentResult<()>;
}

pub fn to_document<T: Serialize>(value: &T) -> DocumentResult<Document> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        _ => Err(DocumentError::NotAnObject),
    }
}

/// Keeps one JSON object per document in a blob backend, under
/// `.documents/<collection>/<id>.json`.
///
/// `insert_unique` is serialized in-process only; two service instances
/// sharing a bucket can still race between the lookup and the write.
pub struct BackendDocumentStore {
    backend: Arc<dyn Backend>,
    unique_writes: Mutex<()>,
}

impl BackendDocumentStore {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        info!("Initialized document store (backend-hosted JSON documents)");
        Self {
            backend,
            unique_writes: Mutex::new(()),
        }
    }

    fn collection_prefix(collection: &str) -> String {
        format!("{}/{}/", DOCUMENTS_PREFIX, collection)
    }

    fn document_key(collection: &str, id: &str) -> String {
        format!("{}{}.json", Self::collection_prefix(collection), id)
    }

    fn generate_id() -> String {
        Uuid::new_v4().simple().to_string()
    }

    async fn load(&self, key: &str) -> DocumentResult<Option<Document>> {
        match self.backend.get_object(key).await {
            Ok(obj_data) => {
                let data = collect_stream(obj_data.stream).await?;
                match serde_json::from_slice::<Value>(&data)? {
                    Value::Object(map) => Ok(Some(map)),
                    _ => Err(DocumentError::NotAnObject),
                }
            }
            Err(BackendError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, key: &str, doc: &Document) -> DocumentResult<()> {
        let data = serde_json::to_vec(doc)?;

        self.backend
            .put_object(
                key,
                stream_from_bytes(data),
                Some("application/json".to_string()),
                HashMap::new(),
            )
            .await?;

        Ok(())
    }

    async fn write_new(&self, collection: &str, doc: &Document) -> DocumentResult<String> {
        let id = Self::generate_id();
        self.save(&Self::document_key(collection, &id), doc).await?;
        debug!("Inserted document {}/{}", collection, id);
        Ok(id)
    }
}

/// Ids are generated here, so anything outside this alphabet cannot exist
/// and is never turned into a backend key.
fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl DocumentStore for BackendDocumentStore {
    async fn insert(&self, collection: &str, doc: Document) -> DocumentResult<String> {
        self.write_new(collection, &doc).await
    }

    async fn insert_unique(
        &self,
        collection: &str,
        field: &str,
        doc: Document,
    ) -> DocumentResult<String> {
        let value = doc.get(field).cloned().unwrap_or(Value::Null);

        let _guard = self.unique_writes.lock().await;

        if !self.query(collection, field, &value).await?.is_empty() {
            return Err(DocumentError::DuplicateKey {
                field: field.to_string(),
                value: display_value(&value),
            });
        }

        self.write_new(collection, &doc).await
    }

    async fn get(&self, collection: &str, id: &str) -> DocumentResult<Option<StoredDocument>> {
        if !is_valid_id(id) {
            return Ok(None);
        }

        let fields = self.load(&Self::document_key(collection, id)).await?;
        Ok(fields.map(|fields| StoredDocument {
            id: id.to_string(),
            fields,
        }))
    }

    async fn list(&self, collection: &str) -> DocumentResult<Vec<StoredDocument>> {
        let prefix = Self::collection_prefix(collection);
        let objects = match self.backend.list_objects(Some(&prefix), None).await {
            Ok(objects) => objects,
            Err(BackendError::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut documents = Vec::with_capacity(objects.len());
        for obj in objects {
            let Some(id) = obj
                .key
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(".json"))
            else {
                continue;
            };

            match self.load(&obj.key).await {
                Ok(Some(fields)) => documents.push(StoredDocument {
                    id: id.to_string(),
                    fields,
                }),
                // Deleted between listing and reading
                Ok(None) => {}
                Err(DocumentError::Serialization(e)) => {
                    warn!("Failed to parse document {}: {}", obj.key, e);
                }
                Err(e) => return Err(e),
            }
        }

        debug!("Listed {} documents in {}", documents.len(), collection);
        Ok(documents)
    }

    async fn query(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> DocumentResult<Vec<StoredDocument>> {
        let matches = self
            .list(collection)
            .await?
            .into_iter()
            .filter(|doc| doc.fields.get(field) == Some(value))
            .collect();
        Ok(matches)
    }

    async fn merge_update(
        &self,
        collection: &str,
        id: &str,
        patch: Document,
    ) -> DocumentResult<()> {
        let not_found = || DocumentError::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        };

        if !is_valid_id(id) {
            return Err(not_found());
        }

        let key = Self::document_key(collection, id);
        let mut fields = self.load(&key).await?.ok_or_else(not_found)?;
        fields.extend(patch);
        self.save(&key, &fields).await?;

        debug!("Merged update into document {}/{}", collection, id);
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> DocumentResult<()> {
        let not_found = || DocumentError::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        };

        if !is_valid_id(id) {
            return Err(not_found());
        }

        match self
            .backend
            .delete_object(&Self::document_key(collection, id))
            .await
        {
            Ok(()) => {
                debug!("Deleted document {}/{}", collection, id);
                Ok(())
            }
            Err(BackendError::NotFound(_)) => Err(not_found()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use solar_store_backends::local::LocalBackend;
    use tempfile::TempDir;

    async fn setup_store() -> (BackendDocumentStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let backend = Arc::new(LocalBackend::new(
            temp_dir.path().to_path_buf(),
            "test-physical-bucket".to_string(),
            "http://localhost/media".to_string(),
        ));
        backend.init().await.unwrap();
        (BackendDocumentStore::new(backend), temp_dir)
    }

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[tokio::test]
    async fn test_insert_get_delete() {
        let (store, _temp_dir) = setup_store().await;

        let id = store
            .insert("solar", doc(json!({"name": "Panel A", "description": "desc"})))
            .await
            .unwrap();
        assert!(is_valid_id(&id));

        let stored = store.get("solar", &id).await.unwrap().unwrap();
        assert_eq!(stored.id, id);
        assert_eq!(stored.fields["name"], "Panel A");

        store.delete("solar", &id).await.unwrap();
        assert!(store.get("solar", &id).await.unwrap().is_none());

        let again = store.delete("solar", &id).await;
        assert!(matches!(again, Err(DocumentError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_query_by_field() {
        let (store, _temp_dir) = setup_store().await;

        store
            .insert("solar", doc(json!({"name": "Panel A"})))
            .await
            .unwrap();
        store
            .insert("solar", doc(json!({"name": "Panel B"})))
            .await
            .unwrap();
        store
            .insert("other", doc(json!({"name": "Panel A"})))
            .await
            .unwrap();

        let hits = store
            .query("solar", "name", &json!("Panel A"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(store.list("solar").await.unwrap().len(), 2);
        assert!(store.list("empty").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_merge_update_preserves_untouched_fields() {
        let (store, _temp_dir) = setup_store().await;

        let id = store
            .insert(
                "solar",
                doc(json!({"name": "Panel A", "image": "http://img/1", "createdAt": "t0"})),
            )
            .await
            .unwrap();

        store
            .merge_update("solar", &id, doc(json!({"name": "Panel B", "updatedAt": "t1"})))
            .await
            .unwrap();

        let stored = store.get("solar", &id).await.unwrap().unwrap();
        assert_eq!(stored.fields["name"], "Panel B");
        assert_eq!(stored.fields["image"], "http://img/1");
        assert_eq!(stored.fields["createdAt"], "t0");
        assert_eq!(stored.fields["updatedAt"], "t1");
    }

    #[tokio::test]
    async fn test_merge_update_missing_document() {
        let (store, _temp_dir) = setup_store().await;

        let result = store
            .merge_update("solar", "doesnotexist", doc(json!({"name": "x"})))
            .await;
        assert!(matches!(result, Err(DocumentError::NotFound { .. })));
        assert!(store.list("solar").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_insert_unique_rejects_duplicates() {
        let (store, _temp_dir) = setup_store().await;

        store
            .insert_unique("solar", "name", doc(json!({"name": "Panel A"})))
            .await
            .unwrap();

        let result = store
            .insert_unique("solar", "name", doc(json!({"name": "Panel A"})))
            .await;
        match result {
            Err(DocumentError::DuplicateKey { field, value }) => {
                assert_eq!(field, "name");
                assert_eq!(value, "Panel A");
            }
            other => panic!("expected duplicate key, got {:?}", other),
        }
        assert_eq!(store.list("solar").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_unique_inserts_store_one() {
        let (store, _temp_dir) = setup_store().await;
        let store = Arc::new(store);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .insert_unique("solar", "name", doc(json!({"name": "Same"})))
                        .await
                })
            })
            .collect();

        let mut stored = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                stored += 1;
            }
        }

        assert_eq!(stored, 1);
        assert_eq!(store.list("solar").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_path_like_ids() {
        let (store, _temp_dir) = setup_store().await;

        assert!(store.get("solar", "../../etc").await.unwrap().is_none());
        assert!(store.get("solar", "").await.unwrap().is_none());
        assert!(matches!(
            store.delete("solar", "a/b").await,
            Err(DocumentError::NotFound { .. })
        ));
    }

    #[test]
    fn test_to_document_requires_object() {
        assert!(to_document(&json!({"a": 1})).is_ok());
        assert!(matches!(
            to_document(&json!([1, 2])),
            Err(DocumentError::NotAnObject)
        ));
    }
}
