// src/errors.rs

//! Crate-wide error aliases and helpers.

use thiserror::Error;

use crate::model::{JobId, JobState, ProductId};

#[derive(Error, Debug)]
pub enum ReductorError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Cycle detected in stage graph: {0}")]
    DagCycle(String),

    /// A store invariant (uniqueness, referential integrity) would be broken.
    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Product not found: {0}")]
    ProductNotFound(ProductId),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    /// The job left the state the caller expected while it was working on it.
    #[error("Job {job_id} changed state to '{state}' while being processed")]
    JobStateChanged { job_id: JobId, state: JobState },

    #[error("Job {0} has no expected output products")]
    NoExpectedOutputs(JobId),

    #[error("Artifact '{name}' of job {job_id} matches no expected product")]
    UnmatchedArtifact { job_id: JobId, name: String },

    /// Two artifacts of one job claim the same expected product.
    #[error("Artifact '{name}' of job {job_id} was reported more than once")]
    AmbiguousArtifact { job_id: JobId, name: String },

    #[error("Invalid input group for stage '{stage}': {reason}")]
    InvalidGroup { stage: String, reason: String },

    #[error("Database error: {0}")]
    Database(rusqlite::Error),

    #[error("Executor error: {0}")]
    Executor(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<rusqlite::Error> for ReductorError {
    fn from(err: rusqlite::Error) -> Self {
        let constraint = matches!(
            &err,
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == rusqlite::ErrorCode::ConstraintViolation
        );
        if constraint {
            ReductorError::Constraint(err.to_string())
        } else {
            ReductorError::Database(err)
        }
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, ReductorError>;
