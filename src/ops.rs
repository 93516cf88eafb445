//! Top-level operations wired from a `PipelineConfig`.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::bronze::{convert_all, BronzeConversionReport, BronzeOptions, CREATED_BY};
use crate::config::PipelineConfig;
use crate::io::bronze_price_profile;
use crate::orchestrator::{Orchestrator, OrchestratorConfig, RunResult};
use crate::source::{FetchOutcome, LocalDirectory, SourceFiles};
use crate::stats::{compare_sources, IncrementalStatsEngine, SourceComparison, StatsSnapshot, VerificationRecord};
use crate::store::{SqliteStore, StoreGateway};
use crate::types::{AggregateStats, BatchSummary};
use crate::utils::log_timing;

const RECENT_VERIFICATIONS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub success: bool,
    pub acquisition: FetchOutcome,
    pub bronze: Option<BronzeConversionReport>,
    pub ingestion: Option<RunResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub engine: Option<StatsSnapshot>,
    pub store: Option<AggregateStats>,
    pub batch_summary: Option<BatchSummary>,
    pub recent_verifications: Vec<VerificationRecord>,
    pub bronze_profile: Option<AggregateStats>,
    /// Engine, store and bronze layer checked against each other; present
    /// when at least two of them are available.
    pub consistency: Option<SourceComparison>,
}

/// Stems the run consumes: primaries, plus the late file unless excluded.
fn expected_stems(config: &PipelineConfig) -> Vec<String> {
    if config.exclude_late_file {
        config.primary_stems.clone()
    } else {
        config.all_stems()
    }
}

fn bronze_options(config: &PipelineConfig) -> BronzeOptions {
    BronzeOptions {
        batch_size: config.batch_size,
        compression_level: config.bronze_compression_level,
        created_by: CREATED_BY.to_string(),
    }
}

fn open_engine(config: &PipelineConfig) -> IncrementalStatsEngine {
    match config.statistics_path_if_enabled() {
        Some(path) => IncrementalStatsEngine::with_persistence(path),
        None => IncrementalStatsEngine::new(),
    }
}

pub fn run_full_ingestion(config: &PipelineConfig) -> Result<RunResult> {
    let store = SqliteStore::open(&config.database_path)
        .with_context(|| format!("open store {}", config.database_path.display()))?;
    let engine = open_engine(config);
    let mut orchestrator = Orchestrator::new(OrchestratorConfig::from(config), store, engine);
    Ok(orchestrator.run())
}

fn convert_from(config: &PipelineConfig, csv_dir: &Path) -> BronzeConversionReport {
    info!(
        from = %csv_dir.display(),
        to = %config.bronze_dir.display(),
        batch_size = config.batch_size,
        "converting raw csv to bronze"
    );
    convert_all(csv_dir, &config.bronze_dir, &expected_stems(config), &bronze_options(config))
}

pub fn convert_to_bronze(config: &PipelineConfig) -> Result<BronzeConversionReport> {
    let outcome = LocalDirectory::new(&config.raw_dir, expected_stems(config)).fetch()?;
    let csv_dir = outcome.path.unwrap_or_else(|| config.raw_dir.clone());
    Ok(convert_from(config, &csv_dir))
}

/// Acquisition check, bronze conversion, then full ingestion. Stops at the
/// first stage that does not succeed.
pub fn run_pipeline(config: &PipelineConfig) -> Result<PipelineReport> {
    let t0 = Instant::now();
    let acquisition = LocalDirectory::new(&config.raw_dir, expected_stems(config)).fetch()?;
    let Some(csv_dir) = acquisition.path.clone().filter(|_| acquisition.success) else {
        warn!(missing = ?acquisition.missing, "raw files unavailable; pipeline stopped");
        return Ok(PipelineReport {
            success: false,
            acquisition,
            bronze: None,
            ingestion: None,
        });
    };

    let bronze = convert_from(config, &csv_dir);
    if !bronze.success() {
        warn!(failed = bronze.failed.len(), missing = bronze.missing.len(), "bronze conversion incomplete; pipeline stopped");
        return Ok(PipelineReport {
            success: false,
            acquisition,
            bronze: Some(bronze),
            ingestion: None,
        });
    }

    let ingestion = run_full_ingestion(config)?;
    log_timing("pipeline run", t0);
    Ok(PipelineReport {
        success: ingestion.overall_success,
        acquisition,
        bronze: Some(bronze),
        ingestion: Some(ingestion),
    })
}

/// Removes the database (with its WAL side files) and the persisted
/// statistics. Returns the paths that were deleted.
pub fn reset_state(config: &PipelineConfig) -> Result<Vec<PathBuf>> {
    let db = config.database_path.as_os_str();
    let with_suffix = |suffix: &str| {
        let mut name = db.to_os_string();
        name.push(suffix);
        PathBuf::from(name)
    };
    let targets = [
        config.database_path.clone(),
        with_suffix("-wal"),
        with_suffix("-shm"),
        config.statistics_path.clone(),
        config.statistics_path.with_extension("json.tmp"),
    ];

    let mut removed = Vec::new();
    for path in targets {
        if path.is_file() {
            std::fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
            info!(path = %path.display(), "removed");
            removed.push(path);
        }
    }
    Ok(removed)
}

pub fn status_report(config: &PipelineConfig) -> Result<StatusReport> {
    let engine = if config.statistics_path.is_file() {
        let bytes = std::fs::read(&config.statistics_path)
            .with_context(|| format!("read {}", config.statistics_path.display()))?;
        let mut engine = IncrementalStatsEngine::new();
        engine.restore_from_bytes(&bytes)?;
        Some(engine.get_current_stats())
    } else {
        None
    };

    let (store, batch_summary, recent_verifications) = if config.database_path.is_file() {
        let store = SqliteStore::open(&config.database_path)?;
        (
            Some(store.get_aggregate_stats()?),
            Some(store.get_batch_summary()?),
            store.list_verifications(RECENT_VERIFICATIONS)?,
        )
    } else {
        (None, None, Vec::new())
    };

    let files: Vec<PathBuf> = expected_stems(config)
        .iter()
        .map(|stem| config.bronze_path(stem))
        .filter(|path| path.is_file())
        .collect();
    let bronze_profile = if files.is_empty() {
        None
    } else {
        let rt = tokio::runtime::Runtime::new()?;
        Some(rt.block_on(bronze_price_profile(&files))?)
    };

    let mut sources = Vec::new();
    if let Some(snapshot) = &engine {
        sources.push(("incremental_engine".to_string(), snapshot.as_aggregate()));
    }
    if let Some(aggregate) = &store {
        sources.push(("store".to_string(), aggregate.to_reference()));
    }
    if let Some(profile) = &bronze_profile {
        sources.push(("bronze_layer".to_string(), profile.to_reference()));
    }
    let consistency = compare_sources(&sources, config.compare_tolerance);

    Ok(StatusReport {
        engine,
        store,
        batch_summary,
        recent_verifications,
        bronze_profile,
        consistency,
    })
}
