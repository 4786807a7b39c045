//! Analysis job descriptor and its queue wire format.
//!
//! On the wire a job is a named task plus positional arguments:
//!
//! ```json
//! {"task": "tasks.process_recording", "args": ["<call_id>", "<stored_path>"]}
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Task name the analysis worker consumes
pub const PROCESS_RECORDING_TASK: &str = "tasks.process_recording";

/// Immutable payload enqueued after a successful ingestion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "TaskMessage", try_from = "TaskMessage")]
pub struct JobDescriptor {
    pub call_id: Uuid,
    pub stored_path: PathBuf,
}

impl JobDescriptor {
    pub fn new(call_id: Uuid, stored_path: impl Into<PathBuf>) -> Self {
        Self {
            call_id,
            stored_path: stored_path.into(),
        }
    }
}

/// Raw wire message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    pub task: String,
    pub args: (String, String),
}

#[derive(Debug, Error)]
pub enum TaskMessageError {
    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("invalid call id {0:?}: {1}")]
    InvalidCallId(String, uuid::Error),
}

impl From<JobDescriptor> for TaskMessage {
    fn from(job: JobDescriptor) -> Self {
        Self {
            task: PROCESS_RECORDING_TASK.to_string(),
            args: (
                job.call_id.to_string(),
                job.stored_path.to_string_lossy().into_owned(),
            ),
        }
    }
}

impl TryFrom<TaskMessage> for JobDescriptor {
    type Error = TaskMessageError;

    fn try_from(msg: TaskMessage) -> Result<Self, Self::Error> {
        if msg.task != PROCESS_RECORDING_TASK {
            return Err(TaskMessageError::UnknownTask(msg.task));
        }

        let (call_id, path) = msg.args;
        let call_id = Uuid::parse_str(&call_id)
            .map_err(|e| TaskMessageError::InvalidCallId(call_id.clone(), e))?;

        Ok(Self {
            call_id,
            stored_path: PathBuf::from(path),
        })
    }
}
