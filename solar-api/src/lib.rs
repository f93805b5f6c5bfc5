pub mod api;
pub mod config;
pub mod documents;
pub mod error;
pub mod router;
pub mod service;
pub mod validation;

pub use config::Config;
pub use documents::{BackendDocumentStore, DocumentStore};
pub use error::{ServiceError, ServiceResult};
pub use service::{ServiceSettings, SolarService};
