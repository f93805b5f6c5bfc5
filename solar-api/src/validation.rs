use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;

use crate::error::{ServiceError, ServiceResult};

pub const NAME_REQUIRED: &str = "Name is required and should be a non-empty string.";
pub const DESCRIPTION_NOT_STRING: &str = "Description should be a string.";
pub const IMAGE_REQUIRED: &str = "Image file is required.";

/// Drops every HTML tag from client text. `script` and `style` lose their
/// content as well; the remaining text is entity-escaped.
pub fn strip_markup(text: &str) -> String {
    let mut sanitizer = ammonia::Builder::empty();
    sanitizer.clean_content_tags(HashSet::from(["script", "style"]));
    sanitizer.clean(text).to_string()
}

/// Returns the sanitized, trimmed name, or `InvalidInput` when it is absent
/// or nothing but markup and whitespace.
pub fn validate_name(candidate: Option<&str>) -> ServiceResult<String> {
    let name = candidate.map(strip_markup).unwrap_or_default();
    match name.trim() {
        "" => Err(ServiceError::InvalidInput(NAME_REQUIRED.to_string())),
        name => Ok(name.to_string()),
    }
}

/// Absent and `null` mean "not supplied"; anything but a string is rejected.
pub fn validate_description(candidate: Option<&Value>) -> ServiceResult<Option<String>> {
    match candidate {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(description)) => Ok(Some(strip_markup(description).trim().to_string())),
        Some(_) => Err(ServiceError::InvalidInput(
            DESCRIPTION_NOT_STRING.to_string(),
        )),
    }
}

/// `.ext` of an uploaded file name, or an empty string when there is none
/// or it contains anything but ASCII letters and digits.
pub fn image_extension(file_name: Option<&str>) -> String {
    file_name
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|ext| format!(".{}", ext))
        .unwrap_or_default()
}
