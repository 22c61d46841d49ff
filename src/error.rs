use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum IngestError {
    #[error("invalid location: {0}")]
    InvalidLocation(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("missing config file grid-ingest.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("source discovery failed for {pattern}: {reason}")]
    Discovery { pattern: String, reason: String },

    #[error("no source files match {0}")]
    NoSources(String),

    #[error("failed to decode {location}: {reason}")]
    Decode { location: String, reason: String },

    #[error("schema mismatch in {location}: {reason}")]
    Schema { location: String, reason: String },

    #[error("chunk geometry conflict on `{variable}`: {reason}")]
    Geometry { variable: String, reason: String },

    #[error("write to {target} failed: {reason}")]
    Write { target: String, reason: String },

    #[error("storage error on {key}: {reason}")]
    Storage { key: String, reason: String },

    #[error("batch {batch}: {location} failed permanently after {attempts} attempt(s): {reason}")]
    TaskFailed {
        batch: usize,
        location: String,
        attempts: u32,
        reason: String,
    },

    #[error("no source file could be ingested; the store was not created")]
    NothingWritten,

    #[error("task cancelled")]
    Cancelled,

    #[error("worker pool failure: {0}")]
    WorkerPool(String),

    #[error("batch {batch}: {source}")]
    InBatch {
        batch: usize,
        #[source]
        source: Box<IngestError>,
    },
}

impl IngestError {
    pub fn in_batch(self, batch: usize) -> Self {
        match self {
            err @ (IngestError::InBatch { .. } | IngestError::TaskFailed { .. }) => err,
            other => IngestError::InBatch {
                batch,
                source: Box::new(other),
            },
        }
    }

    pub fn root(&self) -> &IngestError {
        match self {
            IngestError::InBatch { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, IngestError::Decode { .. } | IngestError::Storage { .. })
    }

    pub fn storage(key: impl Into<String>, err: impl std::fmt::Display) -> Self {
        IngestError::Storage {
            key: key.into(),
            reason: err.to_string(),
        }
    }
}
