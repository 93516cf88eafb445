//! Micro-batch ingestion of staged price measurements with an incremental
//! statistics engine verified against the store's own aggregates.
//!
//! Raw CSVs are restaged as Parquet (`bronze`), read back one micro-batch at
//! a time (`io`), sanitized (`validate`), appended to SQLite (`store`) and
//! folded into running statistics (`stats`). `orchestrator` drives a run;
//! `ops` wires everything from a `PipelineConfig`.

pub mod arrow_utils;
pub mod bronze;
pub mod config;
pub mod error;
pub mod io;
pub mod ops;
pub mod orchestrator;
pub mod source;
pub mod stats;
pub mod store;
pub mod types;
pub mod utils;
pub mod validate;

pub use config::PipelineConfig;
pub use error::{ConfigError, IngestError, PersistenceError, StagingError, StoreError};
pub use io::StagingReader;
pub use orchestrator::{Orchestrator, OrchestratorConfig, RunResult, RunState};
pub use stats::{BatchContext, ComparisonResult, IncrementalStatsEngine, StatsSnapshot};
pub use store::{SqliteStore, StoreGateway};
pub use types::{
    AggregateStats, BatchId, BatchInfo, BatchStatus, ExternalAggregate, MeasurementRow, MicroBatch,
};
