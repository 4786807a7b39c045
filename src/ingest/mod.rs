//! Recording ingestion and asynchronous analysis pipeline.
//!
//! # Architecture
//!
//! ```text
//! upload → IngestionService ─┬─ StorageBackend (write)
//!                            ├─ CallStore (recording row, → processing)
//!                            └─ TaskQueue (enqueue)
//!                                    ↓
//!                             AnalysisWorker → Analyzer → CallStore (→ ready)
//! ```
//!
//! 1. **Ingestion**: validates and stores the upload, creates the recording
//! 2. **Queue**: JSONL lease queue, at-least-once delivery
//! 3. **Analysis**: duration, transcript, silence intervals
//! 4. **Worker**: consumes jobs and persists results

pub mod analysis;
pub mod ingestion;
pub mod queue;
pub mod worker;

// Re-export key types
pub use analysis::{
    build_analyzer, AnalysisConfig, AnalysisError, Analyzer, AudioAnalyzer, TranscriberKind,
    WhisperAnalyzer,
};
pub use ingestion::{IngestError, IngestionService};
pub use queue::{
    Delivery, JobEntry, JobState, JsonlTaskQueue, NackOutcome, QueueConfig, QueueError,
    QueueStatus, TaskQueue,
};
pub use worker::{AnalysisWorker, JobOutcome, WorkerConfig, WorkerError, WorkerPool};
