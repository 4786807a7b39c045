//! Ingestion: accept an upload and hand it to asynchronous analysis.
//!
//! Order of effects:
//! 1. extension check, call and existing-recording lookups (no writes on failure)
//! 2. stream the upload to the storage backend
//! 3. recording row + `created → processing` in one transaction
//! 4. enqueue the analysis job
//!
//! Steps 2-4 are not one transaction. A sequential duplicate stops at step 1;
//! only concurrent duplicates reach the conflict at step 3, where the unique
//! index on `recording.call_id` rejects the later commit after its file was
//! written (the stored file is whichever write renamed last). An enqueue
//! failure after step 3 leaves the call in `processing` without a job, which
//! `requeue` repairs.

use std::sync::Arc;

use thiserror::Error;
use tokio::io::AsyncRead;
use tracing::{error, info, instrument};
use uuid::Uuid;

use super::queue::{QueueError, TaskQueue};
use crate::adapters::{audio_extension, StorageBackend, StorageError};
use crate::core::call_store::{CallStore, StoreError};
use crate::domain::{JobDescriptor, RecordingHandle, ValidationError};

/// Errors that can occur during ingestion
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Call not found: {0}")]
    CallNotFound(Uuid),

    #[error("Recording already exists for call {0}")]
    RecordingExists(Uuid),

    #[error("Storage write failed: {0}")]
    Storage(StorageError),

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Recording stored for call {call_id} but the job could not be enqueued: {source}")]
    Enqueue {
        call_id: Uuid,
        #[source]
        source: QueueError,
    },
}

impl From<StorageError> for IngestError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Validation(e) => Self::Validation(e),
            other => Self::Storage(other),
        }
    }
}

impl From<StoreError> for IngestError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::CallNotFound(id) => Self::CallNotFound(id),
            StoreError::RecordingExists(id) => Self::RecordingExists(id),
            other => Self::Store(other),
        }
    }
}

/// Synchronous entry point of the recording pipeline
#[derive(Clone)]
pub struct IngestionService {
    store: Arc<CallStore>,
    storage: Arc<dyn StorageBackend>,
    queue: Arc<dyn TaskQueue>,
}

impl IngestionService {
    pub fn new(
        store: Arc<CallStore>,
        storage: Arc<dyn StorageBackend>,
        queue: Arc<dyn TaskQueue>,
    ) -> Self {
        Self {
            store,
            storage,
            queue,
        }
    }

    /// Accept `source` as the recording of `call_id`
    #[instrument(skip(self, source), fields(backend = self.storage.name()))]
    pub async fn ingest(
        &self,
        call_id: Uuid,
        original_filename: &str,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<RecordingHandle, IngestError> {
        audio_extension(original_filename)?;

        if self.store.get_call(call_id)?.is_none() {
            return Err(IngestError::CallNotFound(call_id));
        }
        if self.store.get_recording(call_id)?.is_some() {
            return Err(IngestError::RecordingExists(call_id));
        }

        let stored = self.storage.write(call_id, original_filename, source).await?;

        let recording = self.store.create_recording(call_id, &stored.key)?;

        let job = JobDescriptor::new(call_id, &stored.path);
        let job_id = self.queue.enqueue(job).await.map_err(|source| {
            error!(%call_id, error = %source, "Enqueue failed after commit; call needs requeue");
            IngestError::Enqueue { call_id, source }
        })?;

        info!(
            %call_id,
            recording_id = %recording.id,
            %job_id,
            size = stored.size,
            "Recording accepted"
        );

        Ok(RecordingHandle {
            recording_id: recording.id,
            call_id,
            filename: recording.filename,
            job_id,
        })
    }
}
