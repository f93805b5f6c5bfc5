pub mod backend;
pub mod error;
pub mod gcs;
pub mod local;
pub mod s3;

pub use backend::{
    collect_stream, stream_from_bytes, Backend, ByteStream, ObjectData, ObjectMetadata,
};
pub use error::{BackendError, BackendResult};
