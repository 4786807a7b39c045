//! Call entity and its status state machine.
//!
//! A call moves through `created → processing → ready`. The status is a
//! closed enumeration; every call site matches on it exhaustively.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::recording::Recording;

/// Validation failures raised before any durable effect
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid phone number: {0:?}")]
    InvalidPhone(String),

    #[error("unsupported file extension: {0:?}")]
    UnsupportedExtension(String),

    #[error("invalid pagination: {0}")]
    InvalidPagination(String),

    #[error("presign expiry must be between 1 and {max} seconds, got {actual}")]
    InvalidExpiry { actual: u64, max: u64 },
}

impl ValidationError {
    /// Machine-readable reason code
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidPhone(_) => "invalid_phone",
            Self::UnsupportedExtension(_) => "unsupported_extension",
            Self::InvalidPagination(_) => "invalid_pagination",
            Self::InvalidExpiry { .. } => "invalid_expiry",
        }
    }
}

/// Status of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// Call exists, no recording yet
    Created,

    /// Recording stored, analysis pending
    Processing,

    /// Analysis results persisted (terminal)
    Ready,
}

impl CallStatus {
    pub const ALL: [CallStatus; 3] = [Self::Created, Self::Processing, Self::Ready];

    /// Wire/storage token
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Processing => "processing",
            Self::Ready => "ready",
        }
    }

    /// Whether moving from `self` to `next` is a defined transition.
    ///
    /// `ready → ready` is accepted so a redelivered analysis job can
    /// overwrite its own results.
    pub fn can_transition_to(self, next: CallStatus) -> bool {
        match (self, next) {
            (Self::Created, Self::Processing) => true,
            (Self::Processing, Self::Ready) => true,
            (Self::Ready, Self::Ready) => true,
            (Self::Created, _) | (Self::Processing, _) | (Self::Ready, _) => false,
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown call status: {0:?}")]
pub struct UnknownStatus(pub String);

impl FromStr for CallStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "processing" => Ok(Self::Processing),
            "ready" => Ok(Self::Ready),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// A tracked phone call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub id: Uuid,

    /// Caller identifier (E.164-like)
    pub caller: String,

    /// Receiver identifier (E.164-like)
    pub receiver: String,

    /// When the call started
    pub started_at: DateTime<Utc>,

    pub status: CallStatus,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCall {
    pub caller: String,
    pub receiver: String,
    pub started_at: DateTime<Utc>,
}

impl NewCall {
    pub fn new(
        caller: impl Into<String>,
        receiver: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            caller: caller.into(),
            receiver: receiver.into(),
            started_at,
        }
    }

    /// Check both phone identifiers
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_phone(&self.caller)?;
        validate_phone(&self.receiver)?;
        Ok(())
    }
}

/// Accepts `^\+?[1-9]\d{1,14}$`
pub fn validate_phone(value: &str) -> Result<(), ValidationError> {
    let digits = value.strip_prefix('+').unwrap_or(value);

    let valid = (2..=15).contains(&digits.len())
        && digits.bytes().all(|b| b.is_ascii_digit())
        && !digits.starts_with('0');

    if valid {
        Ok(())
    } else {
        Err(ValidationError::InvalidPhone(value.to_string()))
    }
}

/// A call together with its recording, if any
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallView {
    #[serde(flatten)]
    pub call: Call,

    pub recording: Option<RecordingSummary>,
}

/// Client-facing subset of a recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingSummary {
    pub id: Uuid,
    pub filename: String,
    pub duration_sec: Option<u32>,
    pub transcription: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub silence_marks: Option<Vec<super::SilenceInterval>>,
}

impl From<Recording> for RecordingSummary {
    fn from(rec: Recording) -> Self {
        Self {
            id: rec.id,
            filename: rec.filename,
            duration_sec: rec.duration_sec,
            transcription: rec.transcription,
            silence_marks: rec.silence_marks,
        }
    }
}

/// One page of search results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallPage {
    pub total: u64,
    pub items: Vec<Call>,
}
