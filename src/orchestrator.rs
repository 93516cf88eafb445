//! Ingestion orchestrator.
//!
//! `Idle -> ProcessingPrimaryFiles -> ProcessingLateFile -> Verifying ->
//! Completed | Failed`. Files run one at a time and each file one micro-batch
//! at a time; any staging or store error ends the run as `Failed`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::error::IngestError;
use crate::io::StagingReader;
use crate::stats::{
    BatchContext, ComparisonResult, IncrementalStatsEngine, StatsSnapshot, VerificationRecord,
};
use crate::store::StoreGateway;
use crate::types::{BatchId, BatchInfo};
use crate::utils::{file_name_of, log_timing, now_iso};
use crate::validate::sanitize;

const PROGRESS_EVERY: u64 = 5;

pub const CHECKPOINT_PRIMARY: &str = "after_primary_files";
pub const CHECKPOINT_FINAL: &str = "final";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Idle,
    ProcessingPrimaryFiles,
    ProcessingLateFile,
    Verifying,
    Completed,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::ProcessingPrimaryFiles => "processing_primary_files",
            RunState::ProcessingLateFile => "processing_late_file",
            RunState::Verifying => "verifying",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub batch_size: usize,
    pub primary_files: Vec<PathBuf>,
    pub late_file: Option<PathBuf>,
    pub tolerance: f64,
}

impl From<&PipelineConfig> for OrchestratorConfig {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            primary_files: config.primary_bronze_files(),
            late_file: config.late_bronze_file(),
            tolerance: config.compare_tolerance,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileResult {
    pub source_file: String,
    pub path: PathBuf,
    pub success: bool,
    pub batches_processed: u64,
    /// Batches left empty after sanitizing, never forwarded.
    pub batches_skipped: u64,
    pub rows_read: u64,
    pub rows_processed: u64,
    pub rows_filtered: u64,
    pub batch_ids: Vec<BatchId>,
    pub failed_batch: Option<u64>,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsDelta {
    pub rows_added: u64,
    pub count_before: u64,
    pub count_after: u64,
    pub average_before: f64,
    pub average_after: f64,
    pub average_shift: f64,
    pub new_min: bool,
    pub new_max: bool,
}

impl StatsDelta {
    pub fn between(before: &StatsSnapshot, after: &StatsSnapshot) -> Self {
        let new_min = match (before.min, after.min) {
            (Some(old), Some(new)) => new < old,
            (None, Some(_)) => true,
            _ => false,
        };
        let new_max = match (before.max, after.max) {
            (Some(old), Some(new)) => new > old,
            (None, Some(_)) => true,
            _ => false,
        };
        Self {
            rows_added: after.count.saturating_sub(before.count),
            count_before: before.count,
            count_after: after.count,
            average_before: before.average,
            average_after: after.average,
            average_shift: after.average - before.average,
            new_min,
            new_max,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LateFileReport {
    pub file: FileResult,
    pub before: StatsSnapshot,
    pub after: StatsSnapshot,
    pub delta: StatsDelta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub stage: RunState,
    pub source_file: Option<String>,
    pub batch: Option<u64>,
    pub message: String,
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.stage)?;
        if let Some(file) = &self.source_file {
            write!(f, " [{}", file)?;
            if let Some(batch) = self.batch {
                write!(f, " batch {}", batch)?;
            }
            write!(f, "]")?;
        }
        write!(f, ": {}", self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub overall_success: bool,
    pub state: RunState,
    pub per_file: Vec<FileResult>,
    pub total_rows_processed: u64,
    pub total_batches: u64,
    pub total_rows_filtered: u64,
    /// Checkpoint taken after the primary files when a late file follows.
    pub primary_verification: Option<ComparisonResult>,
    pub verification_result: Option<ComparisonResult>,
    pub late_file: Option<LateFileReport>,
    pub failure: Option<RunFailure>,
    pub final_stats: StatsSnapshot,
    pub started_at: String,
    pub finished_at: String,
}

pub struct Orchestrator<S: StoreGateway> {
    config: OrchestratorConfig,
    store: S,
    engine: IncrementalStatsEngine,
    state: RunState,
}

impl<S: StoreGateway> Orchestrator<S> {
    pub fn new(config: OrchestratorConfig, store: S, engine: IncrementalStatsEngine) -> Self {
        Self {
            config,
            store,
            engine,
            state: RunState::Idle,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn engine(&self) -> &IncrementalStatsEngine {
        &self.engine
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn enter(&mut self, next: RunState) {
        debug!(from = %self.state, to = %next, "run state transition");
        self.state = next;
    }

    pub fn run(&mut self) -> RunResult {
        let started_at = now_iso();
        let t0 = Instant::now();
        let mut per_file = Vec::new();
        let mut primary_verification = None;
        let mut verification_result = None;
        let mut late_file = None;

        let failure = self.run_stages(
            &mut per_file,
            &mut primary_verification,
            &mut verification_result,
            &mut late_file,
        );

        let final_state = match (&failure, &verification_result) {
            (None, Some(result)) if result.overall_match => RunState::Completed,
            _ => RunState::Failed,
        };
        self.enter(final_state);
        log_timing("orchestrator run", t0);

        let result = RunResult {
            overall_success: final_state == RunState::Completed,
            state: final_state,
            total_rows_processed: per_file.iter().map(|file| file.rows_processed).sum(),
            total_batches: per_file.iter().map(|file| file.batches_processed).sum(),
            total_rows_filtered: per_file.iter().map(|file| file.rows_filtered).sum(),
            per_file,
            primary_verification,
            verification_result,
            late_file,
            failure,
            final_stats: self.engine.get_current_stats(),
            started_at,
            finished_at: now_iso(),
        };

        if result.overall_success {
            info!(
                rows = result.total_rows_processed,
                batches = result.total_batches,
                filtered = result.total_rows_filtered,
                stats = %result.final_stats,
                "ingestion run completed"
            );
        } else if let Some(failure) = &result.failure {
            error!(failure = %failure, "ingestion run failed");
        }
        result
    }

    fn run_stages(
        &mut self,
        per_file: &mut Vec<FileResult>,
        primary_verification: &mut Option<ComparisonResult>,
        verification_result: &mut Option<ComparisonResult>,
        late_file: &mut Option<LateFileReport>,
    ) -> Option<RunFailure> {
        self.enter(RunState::ProcessingPrimaryFiles);
        let primary_files = self.config.primary_files.clone();
        info!(files = primary_files.len(), batch_size = self.config.batch_size, "processing primary files");
        for path in &primary_files {
            let (result, outcome) = self.ingest_file(path);
            per_file.push(result);
            if let Err(failure) = outcome {
                return Some(failure);
            }
        }

        if let Some(path) = self.config.late_file.clone() {
            let comparison = match self.verify(CHECKPOINT_PRIMARY) {
                Ok(comparison) => comparison,
                Err(failure) => return Some(failure),
            };
            let matched = comparison.overall_match;
            *primary_verification = Some(comparison);
            if !matched {
                return Some(self.mismatch_failure(CHECKPOINT_PRIMARY, primary_verification.as_ref()));
            }

            self.enter(RunState::ProcessingLateFile);
            let before = self.engine.get_current_stats();
            info!(file = %path.display(), stats = %before, "processing late-arriving file");
            let (result, outcome) = self.ingest_file(&path);
            let after = self.engine.get_current_stats();
            let delta = StatsDelta::between(&before, &after);
            info!(
                rows_added = delta.rows_added,
                average_before = delta.average_before,
                average_after = delta.average_after,
                average_shift = delta.average_shift,
                new_min = delta.new_min,
                new_max = delta.new_max,
                "late file statistics delta"
            );
            per_file.push(result.clone());
            *late_file = Some(LateFileReport {
                file: result,
                before,
                after,
                delta,
            });
            if let Err(failure) = outcome {
                return Some(failure);
            }
        }

        self.enter(RunState::Verifying);
        match self.verify(CHECKPOINT_FINAL) {
            Ok(comparison) => {
                let matched = comparison.overall_match;
                *verification_result = Some(comparison);
                if !matched {
                    return Some(self.mismatch_failure(CHECKPOINT_FINAL, verification_result.as_ref()));
                }
                None
            }
            Err(failure) => Some(failure),
        }
    }

    fn mismatch_failure(&self, checkpoint: &str, comparison: Option<&ComparisonResult>) -> RunFailure {
        let metrics: Vec<String> = comparison
            .map(|result| result.differences.keys().map(|metric| metric.to_string()).collect())
            .unwrap_or_default();
        RunFailure {
            stage: RunState::Verifying,
            source_file: None,
            batch: None,
            message: format!(
                "verification mismatch at {} on {}",
                checkpoint,
                metrics.join(", ")
            ),
        }
    }

    fn ingest_file(&mut self, path: &Path) -> (FileResult, Result<(), RunFailure>) {
        let t0 = Instant::now();
        let mut result = FileResult {
            source_file: file_name_of(path),
            path: path.to_path_buf(),
            ..FileResult::default()
        };
        let outcome = self.process_file(path, &mut result);
        result.elapsed_ms = t0.elapsed().as_millis() as u64;
        log_timing("orchestrator ingest_file", t0);

        match outcome {
            Ok(()) => {
                result.success = true;
                info!(
                    file = %result.source_file,
                    batches = result.batches_processed,
                    rows = result.rows_processed,
                    filtered = result.rows_filtered,
                    stats = %self.engine.get_current_stats(),
                    "file ingested"
                );
                (result, Ok(()))
            }
            Err(err) => {
                let message = err.to_string();
                error!(file = %result.source_file, batch = ?result.failed_batch, error = %message, "file ingestion failed");
                result.error = Some(message.clone());
                let failure = RunFailure {
                    stage: self.state,
                    source_file: Some(result.source_file.clone()),
                    batch: result.failed_batch,
                    message,
                };
                (result, Err(failure))
            }
        }
    }

    fn process_file(&mut self, path: &Path, result: &mut FileResult) -> Result<(), IngestError> {
        let mut reader = StagingReader::open(path, self.config.batch_size)?;
        debug!(
            file = %result.source_file,
            rows = reader.metadata().num_rows,
            row_groups = reader.metadata().num_row_groups,
            "staging file opened"
        );

        while let Some(batch) = reader.next_batch()? {
            let sequence = batch.sequence;
            let sanitized = sanitize(batch);
            result.rows_read += sanitized.initial_rows as u64;
            result.rows_filtered += sanitized.dropped() as u64;
            if sanitized.is_empty() {
                warn!(file = %result.source_file, batch = sequence, "batch empty after sanitizing; skipped");
                result.batches_skipped += 1;
                continue;
            }

            let info = BatchInfo {
                source_file: result.source_file.clone(),
                sequence_number: sequence,
            };
            let batch_id = match self.store.insert_batch(&sanitized.batch.rows, &info) {
                Ok(batch_id) => batch_id,
                Err(err) => {
                    result.failed_batch = Some(sequence);
                    return Err(err.into());
                }
            };
            let prices = sanitized.prices();
            drop(sanitized);

            let t_fold = Instant::now();
            let snapshot = self.engine.update_batch(
                &prices,
                BatchContext {
                    source_file: result.source_file.clone(),
                    sequence_number: sequence,
                    batch_id: Some(batch_id.clone()),
                },
            );
            log_timing("orchestrator fold", t_fold);

            result.batches_processed += 1;
            result.rows_processed += prices.len() as u64;
            result.batch_ids.push(batch_id);
            drop(prices);

            if sequence % PROGRESS_EVERY == 0 {
                info!(
                    file = %result.source_file,
                    batch = sequence,
                    rows = result.rows_processed,
                    stats = %snapshot,
                    "progress"
                );
            }
        }
        Ok(())
    }

    fn verify(&mut self, checkpoint: &str) -> Result<ComparisonResult, RunFailure> {
        let t0 = Instant::now();
        let store_stats = self.store.get_aggregate_stats().map_err(|err| RunFailure {
            stage: RunState::Verifying,
            source_file: None,
            batch: None,
            message: format!("aggregate query failed at {}: {}", checkpoint, err),
        })?;
        let comparison = self
            .engine
            .compare_with_external(&store_stats.to_reference(), self.config.tolerance);
        log_timing("orchestrator verify", t0);

        let record = VerificationRecord::new(checkpoint, store_stats, &comparison);
        if let Err(err) = self.store.save_verification(&record) {
            warn!(checkpoint, error = %err, "failed to record verification");
        }
        info!(checkpoint, overall_match = comparison.overall_match, "verification checkpoint");
        Ok(comparison)
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::path::Path;
    use std::sync::Arc;

    use deltalake::arrow::array::{ArrayRef, Float64Array, StringArray};
    use deltalake::arrow::datatypes::{DataType, Field, Schema};
    use deltalake::arrow::record_batch::RecordBatch;
    use deltalake::parquet::arrow::ArrowWriter;

    use super::{Orchestrator, OrchestratorConfig, RunState};
    use crate::error::StoreError;
    use crate::stats::{IncrementalStatsEngine, VerificationRecord, DEFAULT_TOLERANCE};
    use crate::store::{SqliteStore, StoreGateway};
    use crate::types::{AggregateStats, BatchId, BatchInfo, BatchSummary, MeasurementRow};

    fn write_staging(path: &Path, prices: &[Option<f64>]) {
        let schema = Arc::new(Schema::new(vec![
            Field::new("timestamp", DataType::Utf8, true),
            Field::new("price", DataType::Float64, true),
            Field::new("user_id", DataType::Utf8, true),
            Field::new("source_file", DataType::Utf8, false),
        ]));
        let n = prices.len();
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("x");
        let columns: Vec<ArrayRef> = vec![
            Arc::new(StringArray::from(vec![Some("2012-01-01 00:00:00"); n])),
            Arc::new(Float64Array::from(prices.to_vec())),
            Arc::new(StringArray::from(vec![Some("u1"); n])),
            Arc::new(StringArray::from(vec![format!("{}.csv", stem); n])),
        ];
        let batch = RecordBatch::try_new(schema.clone(), columns).expect("batch");
        let mut writer = ArrowWriter::try_new(File::create(path).expect("create"), schema, None)
            .expect("writer");
        writer.write(&batch).expect("write");
        writer.close().expect("close");
    }

    fn setup(dir: &Path) -> OrchestratorConfig {
        let a = dir.join("2012-1.parquet");
        let b = dir.join("2012-2.parquet");
        let late = dir.join("validation.parquet");
        write_staging(&a, &[Some(10.5), Some(20.3), None, Some(15.7), Some(8.9), Some(25.1)]);
        write_staging(&b, &[Some(12.4), Some(-1.0), Some(18.6), Some(22.1), Some(9.3), Some(30.0)]);
        write_staging(&late, &[Some(5.5), Some(35.2)]);
        OrchestratorConfig {
            batch_size: 2,
            primary_files: vec![a, b],
            late_file: Some(late),
            tolerance: DEFAULT_TOLERANCE,
        }
    }

    #[test]
    fn full_run_verifies_against_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = setup(dir.path());
        let store = SqliteStore::open_in_memory().expect("store");
        let mut orchestrator = Orchestrator::new(config, store, IncrementalStatsEngine::new());
        assert_eq!(orchestrator.state(), RunState::Idle);

        let result = orchestrator.run();
        assert!(result.overall_success, "{:?}", result.failure);
        assert_eq!(result.state, RunState::Completed);
        assert_eq!(orchestrator.state(), RunState::Completed);
        assert_eq!(result.per_file.len(), 3);
        assert_eq!(result.total_rows_processed, 12);
        assert_eq!(result.total_rows_filtered, 2);
        assert!(result.primary_verification.as_ref().map(|r| r.overall_match).unwrap_or(false));

        let late = result.late_file.expect("late file report");
        assert_eq!(late.delta.rows_added, 2);
        assert_eq!(late.before.count, 10);
        assert!(late.delta.new_min);
        assert!(late.delta.new_max);
        assert!((late.before.average - 17.29).abs() < 1e-9);

        let store_stats = orchestrator.store().get_aggregate_stats().expect("stats");
        assert_eq!(store_stats.count, result.final_stats.count);
        assert_eq!(orchestrator.store().list_verifications(10).expect("audit").len(), 2);
    }

    #[test]
    fn excluded_late_file_skips_primary_checkpoint() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = setup(dir.path());
        config.late_file = None;
        let store = SqliteStore::open_in_memory().expect("store");
        let mut orchestrator = Orchestrator::new(config, store, IncrementalStatsEngine::new());

        let result = orchestrator.run();
        assert!(result.overall_success);
        assert!(result.primary_verification.is_none());
        assert!(result.late_file.is_none());
        assert_eq!(result.final_stats.count, 10);
    }

    #[test]
    fn missing_primary_file_fails_the_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = setup(dir.path());
        config.primary_files.insert(1, dir.path().join("absent.parquet"));
        let store = SqliteStore::open_in_memory().expect("store");
        let mut orchestrator = Orchestrator::new(config, store, IncrementalStatsEngine::new());

        let result = orchestrator.run();
        assert!(!result.overall_success);
        assert_eq!(result.state, RunState::Failed);
        let failure = result.failure.expect("failure");
        assert_eq!(failure.stage, RunState::ProcessingPrimaryFiles);
        assert_eq!(failure.source_file.as_deref(), Some("absent.parquet"));
        assert_eq!(result.per_file.len(), 2);
        assert!(result.verification_result.is_none());
    }

    /// Store that rejects the n-th insert and otherwise delegates.
    struct FailingStore {
        inner: SqliteStore,
        inserts: u64,
        fail_on: u64,
    }

    impl StoreGateway for FailingStore {
        fn insert_batch(&mut self, rows: &[MeasurementRow], info: &BatchInfo) -> Result<BatchId, StoreError> {
            self.inserts += 1;
            if self.inserts == self.fail_on {
                return Err(StoreError::InsertFailed {
                    batch_id: "rejected".to_string(),
                    message: "disk full".to_string(),
                });
            }
            self.inner.insert_batch(rows, info)
        }

        fn get_aggregate_stats(&self) -> Result<AggregateStats, StoreError> {
            self.inner.get_aggregate_stats()
        }

        fn get_batch_summary(&self) -> Result<BatchSummary, StoreError> {
            self.inner.get_batch_summary()
        }

        fn save_verification(&mut self, record: &VerificationRecord) -> Result<(), StoreError> {
            self.inner.save_verification(record)
        }
    }

    #[test]
    fn store_failure_aborts_without_folding() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = setup(dir.path());
        let store = FailingStore {
            inner: SqliteStore::open_in_memory().expect("store"),
            inserts: 0,
            fail_on: 2,
        };
        let mut orchestrator = Orchestrator::new(config, store, IncrementalStatsEngine::new());

        let result = orchestrator.run();
        assert!(!result.overall_success);
        let failure = result.failure.expect("failure");
        assert_eq!(failure.batch, Some(2));
        assert!(failure.message.contains("disk full"));
        assert_eq!(result.final_stats.count, 2);
        assert_eq!(
            orchestrator.store().get_aggregate_stats().expect("stats").count,
            result.final_stats.count
        );
    }

    /// Store whose aggregate disagrees with what it was given.
    struct SkewedStore(SqliteStore);

    impl StoreGateway for SkewedStore {
        fn insert_batch(&mut self, rows: &[MeasurementRow], info: &BatchInfo) -> Result<BatchId, StoreError> {
            self.0.insert_batch(rows, info)
        }

        fn get_aggregate_stats(&self) -> Result<AggregateStats, StoreError> {
            let mut stats = self.0.get_aggregate_stats()?;
            stats.max += 1.0;
            Ok(stats)
        }

        fn get_batch_summary(&self) -> Result<BatchSummary, StoreError> {
            self.0.get_batch_summary()
        }

        fn save_verification(&mut self, record: &VerificationRecord) -> Result<(), StoreError> {
            self.0.save_verification(record)
        }
    }

    #[test]
    fn verification_mismatch_fails_the_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = setup(dir.path());
        config.late_file = None;
        let store = SkewedStore(SqliteStore::open_in_memory().expect("store"));
        let mut orchestrator = Orchestrator::new(config, store, IncrementalStatsEngine::new());

        let result = orchestrator.run();
        assert!(!result.overall_success);
        assert_eq!(result.state, RunState::Failed);
        let verification = result.verification_result.expect("verification ran");
        assert!(!verification.overall_match);
        assert_eq!(verification.differences.len(), 1);
        assert_eq!(result.failure.expect("failure").stage, RunState::Verifying);
    }
}
