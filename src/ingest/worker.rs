//! Analysis worker: lease a job, analyse the stored file, persist the
//! results and the `processing → ready` transition, then ack.
//!
//! Failure policy:
//! - recording row missing: dead-lettered at once, logged at warn
//! - analysis error or timeout: nacked (retry with backoff), dead-lettered
//!   after the queue's `max_attempts`; the call stays in `processing`
//! - the worker crashing mid-job: the lease expires and the job is redelivered
//!
//! Each worker process opens its own store connection at startup; workers
//! in one pool share it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::analysis::Analyzer;
use super::queue::{Delivery, NackOutcome, QueueError, TaskQueue};
use crate::core::call_store::{CallStore, StoreError};

/// Errors that stop a worker iteration (the job itself stays leased)
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Worker task panicked or was cancelled: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Workers in the pool
    pub concurrency: usize,
    /// Upper bound on one analysis run
    pub job_timeout_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            job_timeout_seconds: 120,
        }
    }
}

impl WorkerConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_seconds)
    }
}

/// What happened to one delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed {
        call_id: Uuid,
        duration_sec: u32,
    },
    Retrying {
        call_id: Uuid,
        error: String,
        retry_at: DateTime<Utc>,
    },
    DeadLettered {
        call_id: Uuid,
        reason: String,
    },
}

/// Consumes analysis jobs from the queue
pub struct AnalysisWorker {
    id: String,
    store: Arc<CallStore>,
    queue: Arc<dyn TaskQueue>,
    analyzer: Arc<dyn Analyzer>,
    job_timeout: Duration,
}

impl AnalysisWorker {
    pub fn new(
        id: impl Into<String>,
        store: Arc<CallStore>,
        queue: Arc<dyn TaskQueue>,
        analyzer: Arc<dyn Analyzer>,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            id: id.into(),
            store,
            queue,
            analyzer,
            job_timeout: config.job_timeout(),
        }
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Process at most one job; `None` when nothing is deliverable
    pub async fn run_once(&self) -> Result<Option<JobOutcome>, WorkerError> {
        match self.queue.dequeue(&self.id).await? {
            Some(delivery) => Ok(Some(self.process(&delivery).await?)),
            None => Ok(None),
        }
    }

    /// Handle jobs until none is deliverable
    async fn drain_queue(&self) -> Vec<JobOutcome> {
        let mut outcomes = Vec::new();
        loop {
            let delivery = match self.queue.dequeue(&self.id).await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => break,
                Err(e) => {
                    error!(worker = %self.id, error = %e, "Dequeue failed, stopping drain");
                    break;
                }
            };

            match self.process(&delivery).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(
                    worker = %self.id,
                    job_id = %delivery.id,
                    error = %e,
                    "Job failed, leaving it to lease expiry"
                ),
            }
        }
        outcomes
    }

    /// Poll until `shutdown` flips to true; returns jobs handled.
    ///
    /// A job in flight when shutdown arrives is finished first.
    pub async fn run(
        &self,
        poll_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<u64, WorkerError> {
        info!(worker = %self.id, analyzer = self.analyzer.name(), "Worker started");
        let mut handled = 0u64;

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.run_once().await {
                Ok(Some(_)) => {
                    handled += 1;
                    continue;
                }
                Ok(None) => {}
                Err(e) => error!(worker = %self.id, error = %e, "Worker iteration failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(worker = %self.id, handled, "Worker stopped");
        Ok(handled)
    }

    #[instrument(
        skip(self, delivery),
        fields(
            worker = %self.id,
            job_id = %delivery.id,
            call_id = %delivery.job.call_id,
            attempt = delivery.attempt
        )
    )]
    pub async fn process(&self, delivery: &Delivery) -> Result<JobOutcome, WorkerError> {
        let call_id = delivery.job.call_id;

        if self.store.get_recording(call_id)?.is_none() {
            return self.dead_letter(delivery, "recording not found").await;
        }

        let analysis = tokio::time::timeout(
            self.job_timeout,
            self.analyzer.analyze(&delivery.job.stored_path),
        )
        .await;

        let result = match analysis {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => return self.fail(delivery, e.to_string()).await,
            Err(_) => {
                let msg = format!("analysis timed out after {:?}", self.job_timeout);
                return self.fail(delivery, msg).await;
            }
        };

        match self.store.mark_ready(call_id, &result) {
            Ok(_) => {}
            Err(StoreError::RecordingNotFound(_)) | Err(StoreError::CallNotFound(_)) => {
                return self.dead_letter(delivery, "recording removed during analysis").await;
            }
            Err(e) => return self.fail(delivery, e.to_string()).await,
        }

        self.queue.ack(delivery).await?;
        info!(duration_sec = result.duration_sec, "Call ready");

        Ok(JobOutcome::Completed {
            call_id,
            duration_sec: result.duration_sec,
        })
    }

    async fn fail(&self, delivery: &Delivery, error: String) -> Result<JobOutcome, WorkerError> {
        let call_id = delivery.job.call_id;

        match self.queue.nack(delivery, &error).await? {
            NackOutcome::Retry { at } => {
                warn!(%error, retry_at = %at, "Analysis failed, will retry");
                Ok(JobOutcome::Retrying {
                    call_id,
                    error,
                    retry_at: at,
                })
            }
            NackOutcome::DeadLettered => {
                error!(
                    %error,
                    "Analysis failed on final attempt, dead-lettered; call stays processing"
                );
                Ok(JobOutcome::DeadLettered {
                    call_id,
                    reason: error,
                })
            }
        }
    }

    async fn dead_letter(
        &self,
        delivery: &Delivery,
        reason: &str,
    ) -> Result<JobOutcome, WorkerError> {
        warn!(reason, "Dead-lettering job");
        self.queue.dead_letter(delivery, reason).await?;
        Ok(JobOutcome::DeadLettered {
            call_id: delivery.job.call_id,
            reason: reason.to_string(),
        })
    }
}

/// Independent workers sharing one queue and one store connection
pub struct WorkerPool {
    workers: Vec<Arc<AnalysisWorker>>,
    poll_interval: Duration,
}

impl WorkerPool {
    pub fn new(
        store: Arc<CallStore>,
        queue: Arc<dyn TaskQueue>,
        analyzer: Arc<dyn Analyzer>,
        config: &WorkerConfig,
        poll_interval: Duration,
    ) -> Self {
        let pid = std::process::id();
        let workers = (0..config.concurrency.max(1))
            .map(|n| {
                Arc::new(AnalysisWorker::new(
                    format!("worker-{pid}-{n}"),
                    store.clone(),
                    queue.clone(),
                    analyzer.clone(),
                    config,
                ))
            })
            .collect();

        Self {
            workers,
            poll_interval,
        }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Handle every currently deliverable job, then return
    ///
    /// A job whose processing fails is logged and left to its lease; the
    /// worker moves on. A worker that cannot dequeue stops draining.
    pub async fn drain(&self) -> Vec<JobOutcome> {
        let handles: Vec<_> = self
            .workers
            .iter()
            .cloned()
            .map(|worker| tokio::spawn(async move { worker.drain_queue().await }))
            .collect();

        let mut outcomes = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(handled) => outcomes.extend(handled),
                Err(e) => error!(error = %e, "Drain task panicked"),
            }
        }
        outcomes
    }

    /// Run all workers until `shutdown` flips to true
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<u64, WorkerError> {
        info!(workers = self.workers.len(), "Worker pool started");

        let handles: Vec<_> = self
            .workers
            .iter()
            .cloned()
            .map(|worker| {
                let shutdown = shutdown.clone();
                let poll_interval = self.poll_interval;
                tokio::spawn(async move { worker.run(poll_interval, shutdown).await })
            })
            .collect();

        let mut handled = 0;
        for handle in handles {
            handled += handle.await??;
        }
        Ok(handled)
    }
}
