//! Recording entity and analysis results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum stored length of a transcription
pub const MAX_TRANSCRIPTION_LEN: usize = 4000;

/// The single audio artifact attached to a call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    pub id: Uuid,

    /// Owning call (unique across recordings)
    pub call_id: Uuid,

    /// Stored filename / object key (`{call_id}.{ext}`)
    pub filename: String,

    /// Whole seconds, set by analysis
    pub duration_sec: Option<u32>,

    /// Transcript text, set by analysis
    pub transcription: Option<String>,

    /// Detected silence, set by analysis
    pub silence_marks: Option<Vec<SilenceInterval>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Recording {
    /// Whether the analysis fields have been populated
    pub fn is_analyzed(&self) -> bool {
        self.duration_sec.is_some() && self.transcription.is_some()
    }
}

/// A time range, in seconds, judged to contain no speech
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SilenceInterval {
    pub start: u32,
    pub end: u32,
}

/// Output of the analysis functions for one stored file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub duration_sec: u32,
    pub transcript: String,
    pub silence: Vec<SilenceInterval>,
}

/// Returned to the uploader once ingestion is accepted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingHandle {
    pub recording_id: Uuid,
    pub call_id: Uuid,
    pub filename: String,
    /// Queue id of the analysis job
    pub job_id: Uuid,
}

/// Cut `text` to at most `max` characters on a char boundary
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
