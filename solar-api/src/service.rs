use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use solar_store_backends::{stream_from_bytes, Backend, ObjectData};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::documents::{to_document, DocumentError, DocumentStore, StoredDocument};
use crate::error::{ServiceError, ServiceResult};
use crate::validation::{image_extension, validate_description, validate_name, IMAGE_REQUIRED};

pub const CREATED: &str = "Solar document added successfully!";
pub const UPDATED: &str = "Solar document updated successfully!";
pub const DELETED: &str = "Solar document deleted successfully!";
pub const NOT_FOUND: &str = "Solar document not found.";
pub const NONE_FOUND: &str = "No solar documents found.";
pub const NAME_NOT_UNIQUE: &str = "Name must be unique.";

const ADD_FAILED: &str = "Error adding solar document";
const UPDATE_FAILED: &str = "Error updating solar document";

const IMAGE_PREFIX: &str = "images/solar/";
const NAME_FIELD: &str = "name";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl TryFrom<StoredDocument> for Record {
    type Error = DocumentError;

    fn try_from(doc: StoredDocument) -> Result<Self, Self::Error> {
        let mut fields = doc.fields;
        fields.insert("id".to_string(), Value::String(doc.id));
        Ok(serde_json::from_value(Value::Object(fields))?)
    }
}

/// An uploaded image file as received from a multipart part.
#[derive(Debug, Clone)]
pub struct NewImage {
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub data: Bytes,
}

/// Raw client input for create and update, before validation.
#[derive(Debug, Clone, Default)]
pub struct SolarInput {
    pub name: Option<String>,
    pub description: Option<Value>,
    pub image: Option<NewImage>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NewSolar<'a> {
    name: &'a str,
    description: &'a str,
    image: &'a str,
    created_at: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SolarPatch<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<&'a str>,
    updated_at: String,
}

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub collection: String,
    pub empty_list_not_found: bool,
}

pub struct SolarService {
    blobs: Arc<dyn Backend>,
    documents: Arc<dyn DocumentStore>,
    settings: ServiceSettings,
}

impl SolarService {
    pub fn new(
        blobs: Arc<dyn Backend>,
        documents: Arc<dyn DocumentStore>,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            blobs,
            documents,
            settings,
        }
    }

    fn collection(&self) -> &str {
        &self.settings.collection
    }

    /// Validates, checks the name is free, uploads the image and stores the
    /// document. Returns the new id.
    pub async fn create(&self, input: SolarInput) -> ServiceResult<String> {
        let name = validate_name(input.name.as_deref())?;
        let description = validate_description(input.description.as_ref())?.unwrap_or_default();
        let image = input
            .image
            .ok_or_else(|| ServiceError::InvalidInput(IMAGE_REQUIRED.to_string()))?;

        let existing = self
            .documents
            .query(self.collection(), NAME_FIELD, &Value::String(name.clone()))
            .await
            .map_err(|e| ServiceError::storage_failure(ADD_FAILED, e))?;
        if !existing.is_empty() {
            return Err(ServiceError::DuplicateName(NAME_NOT_UNIQUE.to_string()));
        }

        // The blob is not removed if the document write below fails.
        let image_url = self
            .upload_image(image)
            .await
            .map_err(|e| ServiceError::storage_failure(ADD_FAILED, e))?;

        let doc = to_document(&NewSolar {
            name: &name,
            description: &description,
            image: &image_url,
            created_at: Utc::now().to_rfc3339(),
        })
        .map_err(|e| ServiceError::storage_failure(ADD_FAILED, e))?;

        let id = self
            .documents
            .insert_unique(self.collection(), NAME_FIELD, doc)
            .await
            .map_err(|e| ServiceError::storage_failure(ADD_FAILED, e))?;

        info!("Created solar document {} ({})", id, name);
        Ok(id)
    }

    pub async fn list(&self) -> ServiceResult<Vec<Record>> {
        let records = self
            .documents
            .list(self.collection())
            .await?
            .into_iter()
            .map(Record::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        if records.is_empty() && self.settings.empty_list_not_found {
            return Err(ServiceError::NotFound(NONE_FOUND.to_string()));
        }

        debug!("Listed {} solar documents", records.len());
        Ok(records)
    }

    pub async fn get(&self, id: &str) -> ServiceResult<Record> {
        let doc = self
            .documents
            .get(self.collection(), id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(NOT_FOUND.to_string()))?;

        debug!("Got solar document {}", id);
        Ok(Record::try_from(doc)?)
    }

    /// Replaces `name`, and `description` and `image` when supplied. The
    /// previous image blob is left in place.
    pub async fn update(&self, id: &str, input: SolarInput) -> ServiceResult<()> {
        let name = validate_name(input.name.as_deref())?;
        let description = validate_description(input.description.as_ref())?;

        let current = self
            .documents
            .get(self.collection(), id)
            .await
            .map_err(|e| ServiceError::storage_failure(UPDATE_FAILED, e))?;
        if current.is_none() {
            return Err(ServiceError::NotFound(NOT_FOUND.to_string()));
        }

        let image_url = match input.image {
            Some(image) => Some(
                self.upload_image(image)
                    .await
                    .map_err(|e| ServiceError::storage_failure(UPDATE_FAILED, e))?,
            ),
            None => None,
        };

        let patch = to_document(&SolarPatch {
            name: &name,
            description: description.as_deref(),
            image: image_url.as_deref(),
            updated_at: Utc::now().to_rfc3339(),
        })
        .map_err(|e| ServiceError::storage_failure(UPDATE_FAILED, e))?;

        self.documents
            .merge_update(self.collection(), id, patch)
            .await
            .map_err(|e| ServiceError::storage_failure(UPDATE_FAILED, e))?;

        info!("Updated solar document {}", id);
        Ok(())
    }

    /// Removes the document only; its image blob stays.
    pub async fn delete(&self, id: &str) -> ServiceResult<()> {
        if self.documents.get(self.collection(), id).await?.is_none() {
            return Err(ServiceError::NotFound(NOT_FOUND.to_string()));
        }

        self.documents.delete(self.collection(), id).await?;

        info!("Deleted solar document {}", id);
        Ok(())
    }

    /// Opens a stored image for streaming. Only keys under `images/` are
    /// served so documents never leak through this path.
    pub async fn open_image(&self, key: &str) -> ServiceResult<ObjectData> {
        if !key.starts_with("images/") || key.contains("..") {
            return Err(ServiceError::NotFound(format!("Image not found: {}", key)));
        }

        let obj_data = self.blobs.get_object(key).await?;
        debug!("Serving image {}", key);
        Ok(obj_data)
    }

    async fn upload_image(&self, image: NewImage) -> ServiceResult<String> {
        let key = format!(
            "{}{}{}",
            IMAGE_PREFIX,
            Uuid::new_v4(),
            image_extension(image.file_name.as_deref())
        );

        let content_type = image
            .content_type
            .filter(|ct| !ct.is_empty())
            .or_else(|| mime_guess::from_path(&key).first().map(|m| m.to_string()))
            .unwrap_or_else(|| "application/octet-stream".to_string());

        self.blobs
            .put_object(
                &key,
                stream_from_bytes(image.data),
                Some(content_type),
                HashMap::new(),
            )
            .await?;

        debug!("Uploaded image {}", key);
        Ok(self.blobs.public_url(&key))
    }
}
