//! Domain types for the calls pipeline.
//!
//! This module contains the core data structures:
//! - Call: the tracked phone call and its status state machine
//! - Recording: the single audio artifact of a call plus analysis results
//! - Job: the descriptor handed from ingestion to the analysis worker

pub mod call;
pub mod job;
pub mod recording;

// Re-export commonly used types
pub use call::{
    validate_phone, Call, CallPage, CallStatus, CallView, NewCall, RecordingSummary,
    ValidationError,
};
pub use job::{JobDescriptor, TaskMessage, PROCESS_RECORDING_TASK};
pub use recording::{AnalysisResult, Recording, RecordingHandle, SilenceInterval};
