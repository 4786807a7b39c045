//! Durable JSONL task queue with lease-based, at-least-once delivery.
//!
//! Append-only JSONL event log with state derived from replay. Each
//! mutation runs under an exclusive advisory lock on a sibling `.lock` file,
//! so producers (upload) and consumers (workers) in different processes can
//! share one queue file.
//!
//! A dequeued job is *leased*, not removed. It stays invisible until the lease
//! expires, after which it is delivered again unless it was acked in the
//! meantime.
//!
//! Once `compact_threshold` jobs are finished (done or dead), the log is
//! rewritten under the same lock: done jobs are dropped, the newest dead
//! letters are kept, and every live job is carried over as a single
//! `restored` snapshot event.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::JobDescriptor;

/// Errors that can occur with the task queue
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Job not found: {0}")]
    NotFound(Uuid),

    #[error("Delivery {id} (attempt {attempt}) is no longer leased")]
    StaleDelivery { id: Uuid, attempt: u32 },

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Queue task panicked or was cancelled: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Queue tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// How long a delivery stays invisible before it is handed out again
    pub lease_seconds: u64,
    /// Deliveries before a failing job is dead-lettered
    pub max_attempts: u32,
    /// Base delay for retry backoff (doubles per attempt)
    pub retry_backoff_seconds: u64,
    /// Worker sleep between empty polls
    pub poll_interval_ms: u64,
    /// Finished jobs that trigger a log rewrite (0 disables compaction)
    pub compact_threshold: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_seconds: 300,
            max_attempts: 5,
            retry_backoff_seconds: 10,
            poll_interval_ms: 1000,
            compact_threshold: 1000,
        }
    }
}

impl QueueConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Delay before retrying after the given (1-based) failed attempt
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        Duration::from_secs(self.retry_backoff_seconds.saturating_mul(1u64 << exp))
    }
}

/// A leased job handed to a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: Uuid,
    pub job: JobDescriptor,
    /// 1-based delivery attempt
    pub attempt: u32,
}

/// What happened to a nacked delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    Retry { at: DateTime<Utc> },
    DeadLettered,
}

/// Queue status summary (done/dead counts cover jobs since the last
/// compaction)
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStatus {
    pub pending: usize,
    pub leased: usize,
    pub done: usize,
    pub dead: usize,
    /// Most recent dead letters (newest first)
    pub dead_letters: Vec<JobEntry>,
}

impl QueueStatus {
    pub fn total(&self) -> usize {
        self.pending + self.leased + self.done + self.dead
    }
}

/// Durable, at-least-once work queue
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Add a job; returns its queue id
    async fn enqueue(&self, job: JobDescriptor) -> Result<Uuid, QueueError>;

    /// Lease the oldest available job, if any
    async fn dequeue(&self, worker: &str) -> Result<Option<Delivery>, QueueError>;

    /// Complete a delivery
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Fail a delivery; it is retried with backoff or dead-lettered
    async fn nack(&self, delivery: &Delivery, error: &str) -> Result<NackOutcome, QueueError>;

    /// Move a delivery straight to the dead-letter state
    async fn dead_letter(&self, delivery: &Delivery, error: &str) -> Result<(), QueueError>;

    /// Id of a pending or leased job for this call, if one exists
    async fn active_job(&self, call_id: Uuid) -> Result<Option<Uuid>, QueueError>;

    async fn status(&self) -> Result<QueueStatus, QueueError>;
}

/// An event in the queue log (append-only)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEvent {
    pub timestamp: DateTime<Utc>,
    pub job_id: Uuid,
    pub event_type: QueueEventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueEventType {
    /// `data.message` carries the wire message
    Enqueued,
    /// `data.worker`, `data.lease_until`
    Leased,
    Acked,
    /// `data.error`, `data.retry_at`
    Nacked,
    /// `data.error`
    DeadLettered,
    /// `data.entry` carries a full job snapshot written by compaction
    Restored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Leased,
    Done,
    Dead,
}

/// A job with its current state (derived from replaying events)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEntry {
    pub id: Uuid,
    pub job: JobDescriptor,
    pub state: JobState,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    /// Earliest time a pending job may be delivered
    pub available_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_until: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl JobEntry {
    fn is_deliverable(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            JobState::Pending => self.available_at <= now,
            JobState::Leased => self.lease_until.map_or(true, |until| until <= now),
            JobState::Done | JobState::Dead => false,
        }
    }

    fn is_active(&self) -> bool {
        matches!(self.state, JobState::Pending | JobState::Leased)
    }

    fn is_finished(&self) -> bool {
        matches!(self.state, JobState::Done | JobState::Dead)
    }
}

/// Replayed queue state plus the handle used to append to it
struct QueueLog {
    path: PathBuf,
    entries: HashMap<Uuid, JobEntry>,
    /// Job ids in enqueue order
    order: Vec<Uuid>,
}

impl QueueLog {
    fn load(path: &Path) -> Result<Self, QueueError> {
        let mut log = Self {
            path: path.to_path_buf(),
            entries: HashMap::new(),
            order: Vec::new(),
        };

        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(log),
            Err(source) => {
                return Err(QueueError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|source| QueueError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<QueueEvent>(&line) {
                Ok(event) => log.apply(event),
                // A torn final write must not wedge the whole queue
                Err(e) => warn!(
                    path = %path.display(),
                    line = line_no + 1,
                    error = %e,
                    "Skipping unreadable queue event"
                ),
            }
        }

        Ok(log)
    }

    fn apply(&mut self, event: QueueEvent) {
        let data = event.data.unwrap_or(serde_json::Value::Null);

        if event.event_type == QueueEventType::Restored {
            match serde_json::from_value::<JobEntry>(data["entry"].clone()) {
                Ok(entry) => {
                    if self.entries.insert(entry.id, entry).is_none() {
                        self.order.push(event.job_id);
                    }
                }
                Err(e) => {
                    warn!(job_id = %event.job_id, error = %e, "Dropping undecodable snapshot")
                }
            }
            return;
        }

        if event.event_type == QueueEventType::Enqueued {
            match serde_json::from_value::<JobDescriptor>(data["message"].clone()) {
                Ok(job) => {
                    if self
                        .entries
                        .insert(
                            event.job_id,
                            JobEntry {
                                id: event.job_id,
                                job,
                                state: JobState::Pending,
                                attempts: 0,
                                enqueued_at: event.timestamp,
                                available_at: event.timestamp,
                                lease_until: None,
                                worker: None,
                                last_error: None,
                            },
                        )
                        .is_none()
                    {
                        self.order.push(event.job_id);
                    }
                }
                Err(e) => warn!(job_id = %event.job_id, error = %e, "Dropping undecodable job"),
            }
            return;
        }

        let Some(entry) = self.entries.get_mut(&event.job_id) else {
            return;
        };
        let error = data["error"].as_str().map(str::to_string);

        match event.event_type {
            QueueEventType::Enqueued | QueueEventType::Restored => {}
            QueueEventType::Leased => {
                entry.state = JobState::Leased;
                entry.attempts += 1;
                entry.worker = data["worker"].as_str().map(str::to_string);
                entry.lease_until = data["lease_until"]
                    .as_str()
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| dt.with_timezone(&Utc));
            }
            QueueEventType::Acked => {
                entry.state = JobState::Done;
                entry.lease_until = None;
            }
            QueueEventType::Nacked => {
                entry.state = JobState::Pending;
                entry.lease_until = None;
                entry.last_error = error;
                entry.available_at = data["retry_at"]
                    .as_str()
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or(event.timestamp);
            }
            QueueEventType::DeadLettered => {
                entry.state = JobState::Dead;
                entry.lease_until = None;
                entry.last_error = error;
            }
        }
    }

    /// Persist an event, then apply it to the in-memory state
    fn append(
        &mut self,
        job_id: Uuid,
        event_type: QueueEventType,
        data: Option<serde_json::Value>,
    ) -> Result<(), QueueError> {
        let event = QueueEvent {
            timestamp: Utc::now(),
            job_id,
            event_type,
            data,
        };

        let mut line = serde_json::to_string(&event)?;
        line.push('\n');

        let io_err = |source| QueueError::Io {
            path: self.path.clone(),
            source,
        };
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;

        // Never glue an event onto a torn trailing line
        let len = file.metadata().map_err(io_err)?.len();
        if len > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::Start(len - 1)).map_err(io_err)?;
            file.read_exact(&mut last).map_err(io_err)?;
            if last[0] != b'\n' {
                line.insert(0, '\n');
            }
        }

        file.write_all(line.as_bytes()).map_err(io_err)?;
        file.sync_data().map_err(io_err)?;

        self.apply(event);
        Ok(())
    }

    fn finished(&self) -> usize {
        self.entries.values().filter(|e| e.is_finished()).count()
    }

    /// Rewrite the log as one snapshot per kept job.
    ///
    /// Done jobs are dropped and only the newest `keep_dead` dead letters
    /// survive. The new log is written beside the old one and renamed over
    /// it, so a crash mid-rewrite leaves the old log intact.
    fn compact(&mut self, keep_dead: usize) -> Result<(), QueueError> {
        let mut dead_seen = 0;
        let mut kept: Vec<Uuid> = Vec::new();
        for id in self.order.iter().rev() {
            let Some(entry) = self.entries.get(id) else {
                continue;
            };
            let keep = match entry.state {
                JobState::Pending | JobState::Leased => true,
                JobState::Dead => {
                    dead_seen += 1;
                    dead_seen <= keep_dead
                }
                JobState::Done => false,
            };
            if keep {
                kept.push(*id);
            }
        }
        kept.reverse();

        let tmp_path = self.path.with_extension("compact");
        let io_err = |source| QueueError::Io {
            path: tmp_path.clone(),
            source,
        };

        let mut out = String::new();
        let now = Utc::now();
        for id in &kept {
            let Some(entry) = self.entries.get(id) else {
                continue;
            };
            let event = QueueEvent {
                timestamp: now,
                job_id: *id,
                event_type: QueueEventType::Restored,
                data: Some(serde_json::json!({ "entry": entry })),
            };
            out.push_str(&serde_json::to_string(&event)?);
            out.push('\n');
        }

        let mut file = File::create(&tmp_path).map_err(io_err)?;
        file.write_all(out.as_bytes()).map_err(io_err)?;
        file.sync_data().map_err(io_err)?;
        std::fs::rename(&tmp_path, &self.path).map_err(|source| QueueError::Io {
            path: self.path.clone(),
            source,
        })?;

        let before = self.order.len();
        let kept_ids: HashSet<Uuid> = kept.iter().copied().collect();
        self.entries.retain(|id, _| kept_ids.contains(id));
        self.order = kept;
        debug!(
            path = %self.path.display(),
            dropped = before - self.order.len(),
            kept = self.order.len(),
            "Compacted queue log"
        );
        Ok(())
    }

    /// The entry `delivery` still holds the lease on.
    ///
    /// A job dropped by compaction has finished, so a delivery for it is
    /// stale rather than unknown.
    fn leased(&self, delivery: &Delivery) -> Result<&JobEntry, QueueError> {
        let stale = || QueueError::StaleDelivery {
            id: delivery.id,
            attempt: delivery.attempt,
        };

        let entry = self.entries.get(&delivery.id).ok_or_else(stale)?;
        if entry.state != JobState::Leased || entry.attempts != delivery.attempt {
            return Err(stale());
        }
        Ok(entry)
    }
}

/// JSONL-backed task queue
pub struct JsonlTaskQueue {
    path: PathBuf,
    lock_path: PathBuf,
    config: QueueConfig,
}

impl JsonlTaskQueue {
    pub fn new(path: impl Into<PathBuf>, config: QueueConfig) -> Self {
        let path = path.into();
        let lock_path = path.with_extension("lock");
        Self {
            path,
            lock_path,
            config,
        }
    }

    /// Open the queue, creating its directory if needed
    pub async fn open(path: impl Into<PathBuf>, config: QueueConfig) -> Result<Self, QueueError> {
        let queue = Self::new(path, config);
        if let Some(parent) = queue.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| QueueError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        Ok(queue)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// All jobs in enqueue order
    pub async fn entries(&self) -> Result<Vec<JobEntry>, QueueError> {
        self.locked(|log| {
            Ok(log
                .order
                .iter()
                .filter_map(|id| log.entries.get(id).cloned())
                .collect())
        })
        .await
    }

    /// Run `f` against freshly replayed state while holding the queue lock
    async fn locked<T, F>(&self, f: F) -> Result<T, QueueError>
    where
        F: FnOnce(&mut QueueLog) -> Result<T, QueueError> + Send + 'static,
        T: Send + 'static,
    {
        let path = self.path.clone();
        let lock_path = self.lock_path.clone();
        let threshold = self.config.compact_threshold;

        tokio::task::spawn_blocking(move || {
            let io_err = |source| QueueError::Io {
                path: lock_path.clone(),
                source,
            };
            let lock = OpenOptions::new()
                .create(true)
                .write(true)
                .open(&lock_path)
                .map_err(io_err)?;
            lock.lock_exclusive().map_err(io_err)?;

            let result = QueueLog::load(&path).and_then(|mut log| {
                let value = f(&mut log)?;
                if threshold > 0 && log.finished() >= threshold {
                    log.compact(threshold / 2)?;
                }
                Ok(value)
            });

            // Dropping the handle releases the lock as well
            let _ = FileExt::unlock(&lock);
            result
        })
        .await?
    }
}

#[async_trait]
impl TaskQueue for JsonlTaskQueue {
    async fn enqueue(&self, job: JobDescriptor) -> Result<Uuid, QueueError> {
        let id = Uuid::new_v4();
        let data = serde_json::json!({ "message": job });
        let call_id = job.call_id;

        self.locked(move |log| log.append(id, QueueEventType::Enqueued, Some(data)))
            .await?;

        debug!(job_id = %id, %call_id, "Enqueued job");
        Ok(id)
    }

    async fn dequeue(&self, worker: &str) -> Result<Option<Delivery>, QueueError> {
        let worker = worker.to_string();
        let lease = chrono::Duration::from_std(self.config.lease())
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let max_attempts = self.config.max_attempts;

        self.locked(move |log| {
            let now = Utc::now();
            let candidates: Vec<Uuid> = log
                .order
                .iter()
                .filter(|id| log.entries.get(*id).is_some_and(|e| e.is_deliverable(now)))
                .copied()
                .collect();

            for id in candidates {
                let Some(entry) = log.entries.get(&id) else {
                    continue;
                };

                // Lease expired on the final attempt: the worker keeps dying on it
                if entry.state == JobState::Leased && entry.attempts >= max_attempts {
                    warn!(
                        job_id = %id,
                        attempts = entry.attempts,
                        "Lease expired on final attempt, dead-lettering"
                    );
                    let error = format!("lease expired after {} attempts", entry.attempts);
                    log.append(
                        id,
                        QueueEventType::DeadLettered,
                        Some(serde_json::json!({ "error": error })),
                    )?;
                    continue;
                }

                let lease_until = now + lease;
                log.append(
                    id,
                    QueueEventType::Leased,
                    Some(serde_json::json!({
                        "worker": worker,
                        "lease_until": lease_until.to_rfc3339(),
                    })),
                )?;

                let entry = log.entries.get(&id).ok_or(QueueError::NotFound(id))?;
                return Ok(Some(Delivery {
                    id,
                    job: entry.job.clone(),
                    attempt: entry.attempts,
                }));
            }

            Ok(None)
        })
        .await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let id = delivery.id;

        self.locked(move |log| {
            // Missing means finished and compacted away
            let finished = log
                .entries
                .get(&id)
                .map_or(true, |entry| entry.state == JobState::Done);
            if finished {
                return Ok(());
            }
            log.append(id, QueueEventType::Acked, None)
        })
        .await
    }

    async fn nack(&self, delivery: &Delivery, error: &str) -> Result<NackOutcome, QueueError> {
        let delivery = delivery.clone();
        let error = error.to_string();
        let config = self.config.clone();

        self.locked(move |log| {
            let attempts = log.leased(&delivery)?.attempts;

            if attempts >= config.max_attempts {
                log.append(
                    delivery.id,
                    QueueEventType::DeadLettered,
                    Some(serde_json::json!({ "error": error })),
                )?;
                return Ok(NackOutcome::DeadLettered);
            }

            let delay = chrono::Duration::from_std(config.backoff(attempts))
                .unwrap_or_else(|_| chrono::Duration::zero());
            let retry_at = Utc::now() + delay;
            log.append(
                delivery.id,
                QueueEventType::Nacked,
                Some(serde_json::json!({
                    "error": error,
                    "retry_at": retry_at.to_rfc3339(),
                })),
            )?;
            Ok(NackOutcome::Retry { at: retry_at })
        })
        .await
    }

    async fn dead_letter(&self, delivery: &Delivery, error: &str) -> Result<(), QueueError> {
        let delivery = delivery.clone();
        let error = error.to_string();

        self.locked(move |log| {
            log.leased(&delivery)?;
            log.append(
                delivery.id,
                QueueEventType::DeadLettered,
                Some(serde_json::json!({ "error": error })),
            )
        })
        .await
    }

    async fn active_job(&self, call_id: Uuid) -> Result<Option<Uuid>, QueueError> {
        self.locked(move |log| {
            Ok(log
                .order
                .iter()
                .filter_map(|id| log.entries.get(id))
                .find(|e| e.job.call_id == call_id && e.is_active())
                .map(|e| e.id))
        })
        .await
    }

    async fn status(&self) -> Result<QueueStatus, QueueError> {
        self.locked(|log| {
            let mut status = QueueStatus::default();
            for entry in log.entries.values() {
                match entry.state {
                    JobState::Pending => status.pending += 1,
                    JobState::Leased => status.leased += 1,
                    JobState::Done => status.done += 1,
                    JobState::Dead => status.dead += 1,
                }
            }

            status.dead_letters = log
                .order
                .iter()
                .rev()
                .filter_map(|id| log.entries.get(id))
                .filter(|e| e.state == JobState::Dead)
                .take(5)
                .cloned()
                .collect();

            Ok(status)
        })
        .await
    }
}
