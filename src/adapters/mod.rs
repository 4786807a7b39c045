//! Adapter interfaces for external systems.
//!
//! Storage backends persist uploaded audio and, where configured, hand out
//! time-limited retrieval URLs:
//! - `LocalStorage`: files under a root directory, no presign capability
//! - `ObjectStorage`: S3-compatible bucket with SigV4 presigned URLs

pub mod object_storage;
pub mod storage;

pub use object_storage::{ObjectStorage, ObjectStorageConfig};
pub use storage::{
    audio_extension, build_filename, select_backend, Capability, LocalStorage, StorageBackend,
    StorageError, StoredObject, ALLOWED_EXTENSIONS,
};
