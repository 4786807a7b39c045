//! Storage backends for uploaded audio.
//!
//! Every backend shares the same extension allow-list and the same
//! deterministic naming scheme (`{call_id}.{ext}`), so a stored object is
//! always addressable from the call id alone.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::object_storage::{ObjectStorage, ObjectStorageConfig};
use crate::domain::ValidationError;

/// Recognised audio extensions (lowercase, without the dot)
pub const ALLOWED_EXTENSIONS: &[&str] = &["mp3", "wav"];

/// Upload streams are copied in chunks of this size
pub const COPY_CHUNK_SIZE: usize = 1024 * 1024;

/// Errors raised by storage backends
#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("object storage not configured: {0}")]
    NotConfigured(String),

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid object storage endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("upload rejected: {0}")]
    Upload(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl StorageError {
    fn io(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
        move |source| StorageError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Optional operations a backend may offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Persist an upload stream
    Write,

    /// Produce time-limited retrieval URLs
    Presign,
}

/// Result of a successful write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    /// Object key / stored filename (`{call_id}.{ext}`)
    pub key: String,

    /// Local path readable by the analysis worker
    pub path: PathBuf,

    /// Bytes written
    pub size: u64,
}

/// Trait for audio storage backends
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Human-readable backend name
    fn name(&self) -> &str;

    /// Capabilities this backend was constructed with
    fn capabilities(&self) -> &[Capability];

    fn supports(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    /// Stream `source` to the deterministic location for `call_id`
    async fn write(
        &self,
        call_id: Uuid,
        original_name: &str,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<StoredObject, StorageError>;

    /// Local path the analysis worker reads for `object_key`
    fn local_path(&self, object_key: &str) -> PathBuf;

    /// Time-limited retrieval URL for a stored object
    async fn presign(&self, _object_key: &str, _expiry: Duration) -> Result<String, StorageError> {
        Err(StorageError::NotConfigured(format!(
            "{} backend has no presign capability",
            self.name()
        )))
    }
}

/// Lowercased extension of `original_name` if it is on the allow-list
pub fn audio_extension(original_name: &str) -> Result<String, ValidationError> {
    let ext = Path::new(original_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    if ALLOWED_EXTENSIONS.contains(&ext.as_str()) {
        Ok(ext)
    } else {
        Err(ValidationError::UnsupportedExtension(ext))
    }
}

/// Deterministic stored name: `{call_id}.{ext}`
pub fn build_filename(call_id: Uuid, original_name: &str) -> Result<String, ValidationError> {
    let ext = audio_extension(original_name)?;
    Ok(format!("{}.{}", call_id, ext))
}

/// Copy `source` into `dst` in [`COPY_CHUNK_SIZE`] chunks.
///
/// Data lands in a sibling `.part` file that is renamed over `dst` once
/// complete, so readers never observe a half-written file. Concurrent
/// writers for the same destination resolve as last-rename-wins.
pub async fn copy_chunked<R>(source: &mut R, dst: &Path) -> Result<u64, StorageError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let part = dst.with_extension(format!("{}.part", Uuid::new_v4().simple()));

    let result = async {
        let mut file = File::create(&part).await.map_err(StorageError::io(&part))?;
        let mut buf = vec![0u8; COPY_CHUNK_SIZE];
        let mut total = 0u64;

        loop {
            let n = source.read(&mut buf).await.map_err(StorageError::io(dst))?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])
                .await
                .map_err(StorageError::io(&part))?;
            total += n as u64;
        }

        file.flush().await.map_err(StorageError::io(&part))?;
        file.sync_all().await.map_err(StorageError::io(&part))?;
        Ok::<u64, StorageError>(total)
    }
    .await;

    match result {
        Ok(total) => {
            fs::rename(&part, dst).await.map_err(StorageError::io(dst))?;
            Ok(total)
        }
        Err(e) => {
            let _ = fs::remove_file(&part).await;
            Err(e)
        }
    }
}

/// Stores recordings under a root directory on local disk
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path an object key maps to
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    fn name(&self) -> &str {
        "local"
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::Write]
    }

    fn local_path(&self, object_key: &str) -> PathBuf {
        self.path_for(object_key)
    }

    async fn write(
        &self,
        call_id: Uuid,
        original_name: &str,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<StoredObject, StorageError> {
        let key = build_filename(call_id, original_name)?;

        fs::create_dir_all(&self.root)
            .await
            .map_err(StorageError::io(&self.root))?;

        let path = self.path_for(&key);
        let size = copy_chunked(source, &path).await?;
        debug!(%call_id, path = %path.display(), size, "Stored recording on local disk");

        Ok(StoredObject { key, path, size })
    }
}

/// Pick the backend once at startup.
///
/// Object storage is used when enabled and fully configured. An enabled but
/// incomplete configuration falls back to local disk; presigned downloads
/// then report "not configured".
pub fn select_backend(
    recordings_dir: &Path,
    object_storage: &ObjectStorageConfig,
) -> Result<Arc<dyn StorageBackend>, StorageError> {
    if !object_storage.enabled {
        info!(root = %recordings_dir.display(), "Using local-disk storage");
        return Ok(Arc::new(LocalStorage::new(recordings_dir)));
    }

    match ObjectStorage::new(LocalStorage::new(recordings_dir), object_storage.clone()) {
        Ok(backend) => {
            info!(
                bucket = backend.bucket(),
                endpoint = %backend.endpoint(),
                "Using object storage with presigned URLs"
            );
            Ok(Arc::new(backend))
        }
        Err(StorageError::NotConfigured(reason)) => {
            warn!(%reason, "Object storage enabled but incomplete, falling back to local disk");
            Ok(Arc::new(LocalStorage::new(recordings_dir)))
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_audio_extension_allow_list() {
        assert_eq!(audio_extension("tone.wav").unwrap(), "wav");
        assert_eq!(audio_extension("Call.MP3").unwrap(), "mp3");

        assert_eq!(
            audio_extension("notes.txt").unwrap_err(),
            ValidationError::UnsupportedExtension("txt".to_string())
        );
        assert!(audio_extension("noext").is_err());
        assert!(audio_extension("archive.wav.zip").is_err());
    }

    #[test]
    fn test_build_filename_is_deterministic() {
        let call_id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(
            build_filename(call_id, "whatever.WAV").unwrap(),
            "550e8400-e29b-41d4-a716-446655440000.wav"
        );
        assert_eq!(
            build_filename(call_id, "other-name.wav").unwrap(),
            build_filename(call_id, "tone.wav").unwrap()
        );
    }

    #[tokio::test]
    async fn test_copy_chunked_spans_multiple_chunks() {
        let temp = TempDir::new().unwrap();
        let dst = temp.path().join("out.wav");

        let data: Vec<u8> = (0..(COPY_CHUNK_SIZE * 2 + 17)).map(|i| (i % 251) as u8).collect();
        let mut source = data.as_slice();

        let written = copy_chunked(&mut source, &dst).await.unwrap();
        assert_eq!(written, data.len() as u64);
        assert_eq!(tokio::fs::read(&dst).await.unwrap(), data);

        // No leftover part files
        let mut entries = tokio::fs::read_dir(temp.path()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names, vec!["out.wav".to_string()]);
    }

    #[tokio::test]
    async fn test_local_write_creates_root_and_overwrites() {
        let temp = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp.path().join("nested/recordings"));
        let call_id = Uuid::new_v4();

        let mut first: &[u8] = b"first upload";
        let stored = storage.write(call_id, "a.wav", &mut first).await.unwrap();
        assert_eq!(stored.key, format!("{}.wav", call_id));
        assert_eq!(stored.size, 12);

        let mut second: &[u8] = b"second";
        let again = storage.write(call_id, "b.wav", &mut second).await.unwrap();
        assert_eq!(again.path, stored.path);
        assert_eq!(tokio::fs::read(&stored.path).await.unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_local_write_rejects_before_io() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("recordings");
        let storage = LocalStorage::new(&root);

        let mut source: &[u8] = b"data";
        let err = storage
            .write(Uuid::new_v4(), "notes.txt", &mut source)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            StorageError::Validation(ValidationError::UnsupportedExtension(_))
        ));
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn test_local_has_no_presign() {
        let storage = LocalStorage::new("/tmp/unused");
        assert!(storage.supports(Capability::Write));
        assert!(!storage.supports(Capability::Presign));

        let err = storage
            .presign("x.wav", Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotConfigured(_)));
    }

    #[test]
    fn test_select_backend() {
        let disabled = ObjectStorageConfig::default();
        let backend = select_backend(Path::new("/tmp/rec"), &disabled).unwrap();
        assert_eq!(backend.name(), "local");

        let incomplete = ObjectStorageConfig {
            enabled: true,
            bucket: Some("calls".to_string()),
            ..Default::default()
        };
        let backend = select_backend(Path::new("/tmp/rec"), &incomplete).unwrap();
        assert!(!backend.supports(Capability::Presign));

        let complete = ObjectStorageConfig {
            enabled: true,
            endpoint_url: Some("http://minio:9000".to_string()),
            access_key: Some("minio".to_string()),
            secret_key: Some("minio123".to_string()),
            bucket: Some("calls".to_string()),
            ..Default::default()
        };
        let backend = select_backend(Path::new("/tmp/rec"), &complete).unwrap();
        assert_eq!(backend.name(), "object");
        assert!(backend.supports(Capability::Presign));
    }
}
