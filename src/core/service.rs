//! Boundary operations over calls and recordings.
//!
//! `CallService` is what an outer layer (the CLI here, an HTTP router
//! elsewhere) talks to. Every failure is a [`ServiceError`] whose
//! [`ErrorKind`] tells the caller how to react and whose `code()` is a
//! stable machine-readable reason.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncRead;
use tracing::{info, instrument};
use uuid::Uuid;

use super::call_store::{CallStore, StoreError};
use crate::adapters::{select_backend, Capability, StorageBackend, StorageError};
use crate::config::Settings;
use crate::domain::{
    Call, CallPage, CallStatus, CallView, JobDescriptor, NewCall, RecordingHandle, ValidationError,
};
use crate::ingest::{IngestError, IngestionService, JsonlTaskQueue, QueueError, TaskQueue};

/// Default page size for search
pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// Largest page size accepted by search
pub const MAX_PAGE_SIZE: u32 = 100;

/// How a caller should treat a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad input; nothing durable happened
    Validation,
    /// Conflicts with existing state
    Conflict,
    NotFound,
    /// Capability not configured on this deployment
    NotImplemented,
    Internal,
}

/// Errors returned by boundary operations
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Call not found: {0}")]
    CallNotFound(Uuid),

    #[error("No recording for call {0}")]
    RecordingNotFound(Uuid),

    #[error("Recording already exists for call {0}")]
    RecordingExists(Uuid),

    #[error("Call {call_id} is {status}, only processing calls can be re-queued")]
    NotRequeueable { call_id: Uuid, status: CallStatus },

    #[error("Presigned downloads are not configured: {0}")]
    PresignNotConfigured(String),

    #[error("Storage error: {0}")]
    Storage(StorageError),

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Queue error: {0}")]
    Queue(QueueError),
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::CallNotFound(_) | Self::RecordingNotFound(_) => ErrorKind::NotFound,
            Self::RecordingExists(_) | Self::NotRequeueable { .. } => ErrorKind::Conflict,
            Self::PresignNotConfigured(_) => ErrorKind::NotImplemented,
            Self::Storage(_) | Self::Store(_) | Self::Queue(_) => ErrorKind::Internal,
        }
    }

    /// Machine-readable reason code
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(e) => e.code(),
            Self::CallNotFound(_) => "call_not_found",
            Self::RecordingNotFound(_) => "recording_not_found",
            Self::RecordingExists(_) => "recording_already_exists",
            Self::NotRequeueable { .. } => "call_not_processing",
            Self::PresignNotConfigured(_) => "presign_not_configured",
            Self::Storage(_) => "storage_error",
            Self::Store(_) => "database_error",
            Self::Queue(_) => "queue_error",
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::CallNotFound(id) => Self::CallNotFound(id),
            StoreError::RecordingNotFound(id) => Self::RecordingNotFound(id),
            StoreError::RecordingExists(id) => Self::RecordingExists(id),
            other => Self::Store(other),
        }
    }
}

impl From<StorageError> for ServiceError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Validation(e) => Self::Validation(e),
            StorageError::NotConfigured(reason) => Self::PresignNotConfigured(reason),
            other => Self::Storage(other),
        }
    }
}

impl From<QueueError> for ServiceError {
    fn from(err: QueueError) -> Self {
        Self::Queue(err)
    }
}

impl From<IngestError> for ServiceError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::Validation(e) => Self::Validation(e),
            IngestError::CallNotFound(id) => Self::CallNotFound(id),
            IngestError::RecordingExists(id) => Self::RecordingExists(id),
            IngestError::Storage(e) => Self::from(e),
            IngestError::Store(e) => Self::from(e),
            IngestError::Enqueue { source, .. } => Self::Queue(source),
        }
    }
}

/// A time-limited retrieval URL
#[derive(Debug, Clone, Serialize)]
pub struct DownloadLink {
    pub call_id: Uuid,
    pub url: String,
    pub expires_in: u64,
}

/// Result of re-queueing a stuck call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RequeueOutcome {
    Enqueued { job_id: Uuid },
    AlreadyQueued { job_id: Uuid },
}

/// Boundary operations over the call pipeline
#[derive(Clone)]
pub struct CallService {
    store: Arc<CallStore>,
    storage: Arc<dyn StorageBackend>,
    queue: Arc<dyn TaskQueue>,
    ingestion: IngestionService,
    presign_expiry: Duration,
}

impl CallService {
    pub fn new(
        store: Arc<CallStore>,
        storage: Arc<dyn StorageBackend>,
        queue: Arc<dyn TaskQueue>,
        presign_expiry: Duration,
    ) -> Self {
        let ingestion = IngestionService::new(store.clone(), storage.clone(), queue.clone());
        Self {
            store,
            storage,
            queue,
            ingestion,
            presign_expiry,
        }
    }

    /// Open the store, pick the storage backend, and open the queue
    pub async fn from_settings(settings: &Settings) -> Result<Self, ServiceError> {
        let store = Arc::new(CallStore::open(&settings.database)?);
        let storage = select_backend(&settings.recordings_dir, &settings.object_storage)?;
        let queue = Arc::new(
            JsonlTaskQueue::open(&settings.queue_path, settings.queue.clone()).await?,
        );

        Ok(Self::new(
            store,
            storage,
            queue,
            settings.object_storage.presign_expiry(),
        ))
    }

    pub fn store(&self) -> &Arc<CallStore> {
        &self.store
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    pub fn queue(&self) -> &Arc<dyn TaskQueue> {
        &self.queue
    }

    pub fn create_call(
        &self,
        caller: &str,
        receiver: &str,
        started_at: DateTime<Utc>,
    ) -> Result<Call, ServiceError> {
        let new = NewCall::new(caller.trim(), receiver.trim(), started_at);
        new.validate()?;

        let call = self.store.create_call(&new)?;
        info!(call_id = %call.id, "Call created");
        Ok(call)
    }

    /// Call with its recording summary
    pub fn get_call(&self, id: Uuid) -> Result<CallView, ServiceError> {
        self.store
            .get_call_view(id)?
            .ok_or(ServiceError::CallNotFound(id))
    }

    /// Free-text search on caller/receiver, newest first
    pub fn search_calls(
        &self,
        query: &str,
        limit: u32,
        offset: u64,
    ) -> Result<CallPage, ServiceError> {
        if limit == 0 || limit > MAX_PAGE_SIZE {
            return Err(ValidationError::InvalidPagination(format!(
                "limit must be between 1 and {MAX_PAGE_SIZE}, got {limit}"
            ))
            .into());
        }

        Ok(self.store.search_calls(query, limit, offset)?)
    }

    pub async fn upload_recording(
        &self,
        call_id: Uuid,
        original_filename: &str,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<RecordingHandle, ServiceError> {
        Ok(self
            .ingestion
            .ingest(call_id, original_filename, source)
            .await?)
    }

    /// Presigned URL for the call's recording.
    ///
    /// Without a presign-capable backend this is `PresignNotConfigured`,
    /// never a link that cannot work.
    #[instrument(skip(self))]
    pub async fn download_url(
        &self,
        call_id: Uuid,
        expiry: Option<Duration>,
    ) -> Result<DownloadLink, ServiceError> {
        if !self.storage.supports(Capability::Presign) {
            return Err(ServiceError::PresignNotConfigured(format!(
                "{} storage has no presign capability",
                self.storage.name()
            )));
        }

        let recording = self
            .store
            .get_recording(call_id)?
            .ok_or(ServiceError::RecordingNotFound(call_id))?;

        let expiry = expiry.unwrap_or(self.presign_expiry);
        let url = self.storage.presign(&recording.filename, expiry).await?;

        Ok(DownloadLink {
            call_id,
            url,
            expires_in: expiry.as_secs(),
        })
    }

    /// Enqueue a fresh job for a call stuck in `processing`.
    ///
    /// Covers an enqueue that failed after the ingestion commit and jobs that
    /// were dead-lettered. A call that still has a pending or leased job is
    /// left alone.
    #[instrument(skip(self))]
    pub async fn requeue(&self, call_id: Uuid) -> Result<RequeueOutcome, ServiceError> {
        let call = self
            .store
            .get_call(call_id)?
            .ok_or(ServiceError::CallNotFound(call_id))?;

        match call.status {
            CallStatus::Processing => {}
            status @ (CallStatus::Created | CallStatus::Ready) => {
                return Err(ServiceError::NotRequeueable { call_id, status })
            }
        }

        let recording = self
            .store
            .get_recording(call_id)?
            .ok_or(ServiceError::RecordingNotFound(call_id))?;

        if let Some(job_id) = self.queue.active_job(call_id).await? {
            return Ok(RequeueOutcome::AlreadyQueued { job_id });
        }

        let job = JobDescriptor::new(call_id, self.storage.local_path(&recording.filename));
        let job_id = self.queue.enqueue(job).await?;
        info!(%call_id, %job_id, "Call re-queued");

        Ok(RequeueOutcome::Enqueued { job_id })
    }

    /// Re-queue every `processing` call without an active job
    pub async fn requeue_stuck(
        &self,
        limit: u32,
    ) -> Result<Vec<(Uuid, RequeueOutcome)>, ServiceError> {
        let mut outcomes = Vec::new();
        for call in self.store.calls_with_status(CallStatus::Processing, limit)? {
            match self.requeue(call.id).await {
                Ok(outcome) => outcomes.push((call.id, outcome)),
                // Recording row gone: nothing to analyse
                Err(ServiceError::RecordingNotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{LocalStorage, ObjectStorage, ObjectStorageConfig};
    use crate::ingest::{JobState, QueueConfig};
    use tempfile::TempDir;

    async fn service_with(
        storage: Arc<dyn StorageBackend>,
        temp: &TempDir,
    ) -> (CallService, Arc<JsonlTaskQueue>) {
        let store = Arc::new(CallStore::open_in_memory().unwrap());
        let queue = Arc::new(
            JsonlTaskQueue::open(temp.path().join("jobs.jsonl"), QueueConfig::default())
                .await
                .unwrap(),
        );
        let service = CallService::new(store, storage, queue.clone(), Duration::from_secs(3600));
        (service, queue)
    }

    async fn local_service(temp: &TempDir) -> (CallService, Arc<JsonlTaskQueue>) {
        service_with(Arc::new(LocalStorage::new(temp.path().join("recordings"))), temp).await
    }

    fn object_storage(temp: &TempDir) -> Arc<dyn StorageBackend> {
        let config = ObjectStorageConfig {
            enabled: true,
            endpoint_url: Some("http://minio:9000".to_string()),
            access_key: Some("minio".to_string()),
            secret_key: Some("minio123".to_string()),
            bucket: Some("recordings".to_string()),
            ..ObjectStorageConfig::default()
        };
        let local = LocalStorage::new(temp.path().join("recordings"));
        Arc::new(ObjectStorage::new(local, config).unwrap())
    }

    #[test]
    fn test_error_taxonomy() {
        let id = Uuid::new_v4();
        let cases = [
            (
                ServiceError::from(ValidationError::InvalidPhone("x".into())),
                ErrorKind::Validation,
                "invalid_phone",
            ),
            (ServiceError::CallNotFound(id), ErrorKind::NotFound, "call_not_found"),
            (
                ServiceError::RecordingExists(id),
                ErrorKind::Conflict,
                "recording_already_exists",
            ),
            (
                ServiceError::PresignNotConfigured("off".into()),
                ErrorKind::NotImplemented,
                "presign_not_configured",
            ),
            (
                ServiceError::from(StoreError::Poisoned),
                ErrorKind::Internal,
                "database_error",
            ),
        ];

        for (err, kind, code) in cases {
            assert_eq!(err.kind(), kind, "{err}");
            assert_eq!(err.code(), code, "{err}");
        }
    }

    #[tokio::test]
    async fn test_create_call_validates_phones() {
        let temp = TempDir::new().unwrap();
        let (service, _) = local_service(&temp).await;

        let call = service
            .create_call("+79001234567", "+79007654321", Utc::now())
            .unwrap();
        assert_eq!(call.status, CallStatus::Created);

        let err = service.create_call("not-a-phone", "+79007654321", Utc::now()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.code(), "invalid_phone");
    }

    #[tokio::test]
    async fn test_get_unknown_call() {
        let temp = TempDir::new().unwrap();
        let (service, _) = local_service(&temp).await;

        let err = service.get_call(Uuid::new_v4()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_search_rejects_bad_limit() {
        let temp = TempDir::new().unwrap();
        let (service, _) = local_service(&temp).await;

        assert_eq!(
            service.search_calls("", 0, 0).unwrap_err().code(),
            "invalid_pagination"
        );
        assert!(service.search_calls("", MAX_PAGE_SIZE + 1, 0).is_err());
        assert!(service.search_calls("", MAX_PAGE_SIZE, 0).is_ok());
    }

    #[tokio::test]
    async fn test_download_without_presign_is_not_implemented() {
        let temp = TempDir::new().unwrap();
        let (service, _) = local_service(&temp).await;
        let call = service
            .create_call("+79001234567", "+79007654321", Utc::now())
            .unwrap();
        let mut body: &[u8] = b"audio";
        service.upload_recording(call.id, "a.wav", &mut body).await.unwrap();

        let err = service.download_url(call.id, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotImplemented);
        assert_eq!(err.code(), "presign_not_configured");
    }

    #[tokio::test]
    async fn test_download_with_presign_returns_url() {
        let temp = TempDir::new().unwrap();
        let (service, _) = service_with(object_storage(&temp), &temp).await;
        let call = service
            .create_call("+79001234567", "+79007654321", Utc::now())
            .unwrap();

        // Upload needs a live bucket; insert the row directly
        service
            .store()
            .create_recording(call.id, &format!("{}.wav", call.id))
            .unwrap();

        let link = service
            .download_url(call.id, Some(Duration::from_secs(600)))
            .await
            .unwrap();
        assert_eq!(link.expires_in, 600);
        assert!(link.url.starts_with("http://minio:9000/recordings/"));
        assert!(link.url.contains(&format!("{}.wav", call.id)));
        assert!(link.url.contains("X-Amz-Expires=600"));
        assert!(link.url.contains("X-Amz-Signature="));
    }

    #[tokio::test]
    async fn test_download_without_recording() {
        let temp = TempDir::new().unwrap();
        let (service, _) = service_with(object_storage(&temp), &temp).await;
        let call = service
            .create_call("+79001234567", "+79007654321", Utc::now())
            .unwrap();

        let err = service.download_url(call.id, None).await.unwrap_err();
        assert_eq!(err.code(), "recording_not_found");
    }

    #[tokio::test]
    async fn test_requeue_after_dead_letter() {
        let temp = TempDir::new().unwrap();
        let (service, queue) = local_service(&temp).await;
        let call = service
            .create_call("+79001234567", "+79007654321", Utc::now())
            .unwrap();
        let mut body: &[u8] = b"audio";
        let handle = service.upload_recording(call.id, "a.wav", &mut body).await.unwrap();

        // Job still pending: nothing to do
        assert_eq!(
            service.requeue(call.id).await.unwrap(),
            RequeueOutcome::AlreadyQueued {
                job_id: handle.job_id
            }
        );

        let delivery = queue.dequeue("w").await.unwrap().unwrap();
        queue.dead_letter(&delivery, "boom").await.unwrap();

        let outcome = service.requeue(call.id).await.unwrap();
        let RequeueOutcome::Enqueued { job_id } = outcome else {
            panic!("expected a new job, got {outcome:?}");
        };

        let entries = queue.entries().await.unwrap();
        let fresh = entries.iter().find(|e| e.id == job_id).unwrap();
        assert_eq!(fresh.state, JobState::Pending);
        assert_eq!(fresh.job.stored_path, delivery.job.stored_path);
    }

    #[tokio::test]
    async fn test_requeue_rejects_created_call() {
        let temp = TempDir::new().unwrap();
        let (service, _) = local_service(&temp).await;
        let call = service
            .create_call("+79001234567", "+79007654321", Utc::now())
            .unwrap();

        let err = service.requeue(call.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(err.code(), "call_not_processing");
    }

    #[tokio::test]
    async fn test_requeue_stuck_finds_orphaned_calls() {
        let temp = TempDir::new().unwrap();
        let (service, queue) = local_service(&temp).await;
        let call = service
            .create_call("+79001234567", "+79007654321", Utc::now())
            .unwrap();

        // Simulate a lost enqueue: row committed, no job
        service.store().create_recording(call.id, "a.wav").unwrap();
        assert!(queue.entries().await.unwrap().is_empty());

        let outcomes = service.requeue_stuck(10).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].0, call.id);
        assert!(matches!(outcomes[0].1, RequeueOutcome::Enqueued { .. }));
        assert_eq!(queue.entries().await.unwrap().len(), 1);
    }
}
