//! Error taxonomy for the ingestion core.
//!
//! Validation drops and verification mismatches are not errors: the first is
//! a counted side effect of sanitizing, the second a terminal run state.

use std::io;
use std::path::PathBuf;

use deltalake::arrow::error::ArrowError;
use deltalake::parquet::errors::ParquetError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StagingError {
    #[error("staging file not found: {}", path.display())]
    SourceNotFound { path: PathBuf },

    #[error("staging file {} is missing required columns: {}", path.display(), missing.join(", "))]
    SchemaMismatch { path: PathBuf, missing: Vec<String> },

    #[error("parquet error in {}: {source}", path.display())]
    Parquet {
        path: PathBuf,
        #[source]
        source: ParquetError,
    },

    #[error("arrow error: {0}")]
    Arrow(#[from] ArrowError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("insert of batch {batch_id} failed: {message}")]
    InsertFailed { batch_id: String, message: String },

    #[error("batch {batch_id}: invalid status transition from {from} to {to}")]
    InvalidTransition {
        batch_id: String,
        from: String,
        to: String,
    },

    #[error("could not allocate a unique batch id after {attempts} attempts")]
    IdExhausted { attempts: u32 },
}

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("statistics hold a non-finite value and cannot be serialized")]
    NonFinite,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Errors that abort a file (and therefore the run) inside the orchestrator.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
