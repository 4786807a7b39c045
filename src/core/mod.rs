//! Core call pipeline logic.
//!
//! This module contains:
//! - CallStore: durable calls and recordings (SQLite)
//! - CallService: boundary operations and the error taxonomy

pub mod call_store;
pub mod service;

// Re-export commonly used types
pub use call_store::{CallStore, StoreError};
pub use service::{
    CallService, DownloadLink, ErrorKind, RequeueOutcome, ServiceError, DEFAULT_PAGE_SIZE,
    MAX_PAGE_SIZE,
};
