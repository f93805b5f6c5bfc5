use thiserror::Error;

/// Failures of a blob [`Backend`](crate::Backend) call.
#[derive(Error, Debug)]
pub enum BackendError {
    /// No blob is stored under the key.
    #[error("Blob not found: {0}")]
    NotFound(String),

    /// The key cannot address a blob (empty, absolute, `..`, reserved suffix).
    #[error("Invalid blob key: {0}")]
    InvalidPath(String),

    #[error("Storage provider error: {0}")]
    Provider(String),

    #[error("Backend configuration error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed blob metadata: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type BackendResult<T> = Result<T, BackendError>;
