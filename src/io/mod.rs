//! Input readers
//!
//! This module provides:
//! - HTCondor JSON job dumps (`htcondor`)
//! - Standard Workload Format traces (`swf`)
//! - HTCondor pool exports (`pools`)
//! - Storage index and content files (`storage`)
//!
//! Readers normalise every byte quantity to bytes and every duration to
//! seconds; malformed rows are logged and skipped, only structurally broken
//! inputs fail the whole read.

pub mod htcondor;
pub mod pools;
pub mod storage;
pub mod swf;

use thiserror::Error;

/// Reader errors.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed JSON input: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed CSV input: {0}")]
    Csv(#[from] csv::Error),

    #[error("input is not a list of job records")]
    UnexpectedShape,

    #[error("missing column(s) {0:?}")]
    MissingColumn(String),

    #[error("job record rejected: {0}")]
    Job(#[from] crate::job::JobError),
}

/// Result type for reader operations.
pub type ReadResult<T> = Result<T, ReadError>;
