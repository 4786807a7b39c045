//! callflow - call recording ingestion and asynchronous analysis
//!
//! Tracks phone calls, accepts one audio recording per call, and analyzes
//! it out of band to produce a duration, a transcript and silence intervals.
//!
//! # Architecture
//!
//! - A call moves `created → processing → ready`; `processing` is entered
//!   when the recording is stored, `ready` when analysis results land
//! - Uploads are streamed to a storage backend (local disk, or local staging
//!   plus an S3-compatible bucket)
//! - Analysis jobs go through an append-only JSONL lease queue with
//!   at-least-once delivery; workers are idempotent per call
//!
//! # Modules
//!
//! - `adapters`: Storage backends (local filesystem, S3-compatible)
//! - `core`: Call store (SQLite) and the boundary service
//! - `domain`: Calls, recordings, job descriptors
//! - `ingest`: Ingestion, task queue, analysis, workers
//! - `config`: Layered configuration
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! callflow create +79001234567 +79007654321
//! callflow upload <call-id> meeting.wav
//! callflow worker --once
//! callflow show <call-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod ingest;

// Re-export main types at crate root for convenience
pub use core::{CallService, CallStore, ServiceError};
pub use domain::{Call, CallStatus, CallView, Recording};
pub use ingest::{AnalysisWorker, IngestionService, JsonlTaskQueue, TaskQueue, WorkerPool};
