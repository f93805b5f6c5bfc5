use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::{BoxError, Json};
use serde_json::json;
use solar_store_backends::BackendError;
use thiserror::Error;
use tower::timeout::error::Elapsed;
use tracing::{error, warn};

use crate::config::RuntimeMode;
use crate::documents::DocumentError;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    DuplicateName(String),

    /// Uniqueness violation reported by the document store itself.
    #[error("This {field} : '{value}' already exists")]
    DuplicateKey { field: String, value: String },

    #[error("{0}")]
    NotFound(String),

    #[error("{context}: {source}")]
    StorageFailure {
        context: &'static str,
        #[source]
        source: Box<ServiceError>,
    },

    #[error("I can't find this route: {0}")]
    RouteNotFound(String),

    #[error("{message}")]
    Payload { status: StatusCode, message: String },

    #[error("Blob storage error: {0}")]
    Backend(#[from] BackendError),

    #[error("Document store error: {0}")]
    Document(#[source] DocumentError),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

impl ServiceError {
    /// Wraps an unexpected store failure; client errors pass through untouched.
    pub fn storage_failure(context: &'static str, err: impl Into<ServiceError>) -> Self {
        match err.into() {
            err @ (ServiceError::NotFound(_)
            | ServiceError::DuplicateKey { .. }
            | ServiceError::InvalidInput(_)
            | ServiceError::DuplicateName(_)) => err,
            err => ServiceError::StorageFailure {
                context,
                source: Box::new(err),
            },
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::InvalidInput(_)
            | ServiceError::DuplicateName(_)
            | ServiceError::DuplicateKey { .. }
            | ServiceError::RouteNotFound(_) => StatusCode::BAD_REQUEST,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Payload { status, .. } => *status,
            ServiceError::Backend(BackendError::NotFound(_)) => StatusCode::NOT_FOUND,
            ServiceError::Backend(BackendError::InvalidPath(_)) => StatusCode::BAD_REQUEST,
            ServiceError::StorageFailure { .. }
            | ServiceError::Backend(_)
            | ServiceError::Document(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Messages of this error and every error beneath it, outermost first.
    pub fn stack(&self) -> Vec<String> {
        std::iter::successors(
            Some(self as &(dyn std::error::Error + 'static)),
            |err| err.source(),
        )
        .map(|err| err.to_string())
        .collect()
    }
}

impl From<DocumentError> for ServiceError {
    fn from(err: DocumentError) -> Self {
        match err {
            DocumentError::DuplicateKey { field, value } => {
                ServiceError::DuplicateKey { field, value }
            }
            DocumentError::NotFound { .. } => {
                ServiceError::NotFound("Solar document not found.".to_string())
            }
            other => ServiceError::Document(other),
        }
    }
}

impl From<JsonRejection> for ServiceError {
    fn from(rejection: JsonRejection) -> Self {
        ServiceError::Payload {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}

impl From<MultipartRejection> for ServiceError {
    fn from(rejection: MultipartRejection) -> Self {
        ServiceError::Payload {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}

impl From<MultipartError> for ServiceError {
    fn from(err: MultipartError) -> Self {
        ServiceError::Payload {
            status: err.status(),
            message: err.body_text(),
        }
    }
}

/// Turns middleware failures into regular error responses; a request that
/// outlives the configured timeout gets 408.
pub async fn handle_middleware_error(err: BoxError) -> ServiceError {
    if err.is::<Elapsed>() {
        ServiceError::Payload {
            status: StatusCode::REQUEST_TIMEOUT,
            message: "Request timed out".to_string(),
        }
    } else {
        ServiceError::Payload {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("Unhandled internal error: {}", err),
        }
    }
}

/// Carried on error responses so the normalizer can render the verbose form.
#[derive(Debug, Clone)]
pub struct ErrorDetail {
    pub status: &'static str,
    pub message: String,
    pub error: String,
    pub stack: Vec<String>,
}

fn status_label(status: StatusCode) -> &'static str {
    if status.is_client_error() {
        "fail"
    } else {
        "error"
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.to_string();

        if status.is_server_error() {
            error!(status = status.as_u16(), "{}", message);
        } else {
            warn!(status = status.as_u16(), "{}", message);
        }

        let detail = ErrorDetail {
            status: status_label(status),
            message: message.clone(),
            error: format!("{:?}", self),
            stack: self.stack(),
        };

        let body = Json(json!({
            "status": detail.status,
            "message": message,
        }));

        let mut response = (status, body).into_response();
        response.extensions_mut().insert(detail);
        response
    }
}

/// Rewrites error bodies with the debug representation and source chain
/// when running in development mode.
pub async fn normalize_errors(
    State(mode): State<RuntimeMode>,
    request: Request,
    next: Next,
) -> Response {
    let mut response = next.run(request).await;

    if !mode.is_development() {
        return response;
    }

    match response.extensions_mut().remove::<ErrorDetail>() {
        Some(detail) => {
            let body = Json(json!({
                "status": detail.status,
                "error": detail.error,
                "message": detail.message,
                "stack": detail.stack,
            }));
            (response.status(), body).into_response()
        }
        None => response,
    }
}
