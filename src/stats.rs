//! Incremental statistics engine.
//!
//! Keeps count, sum, min, max and average of every price folded in, one value
//! at a time, without reading the store. The store's own aggregate query is
//! only used to check this state (see [`IncrementalStatsEngine::compare_with_external`]).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::PersistenceError;
use crate::types::{AggregateStats, BatchId, ExternalAggregate};
use crate::utils::now_iso;

pub const DEFAULT_TOLERANCE: f64 = 1e-6;

/// Running aggregate state. `sum` is carried with a Neumaier compensation
/// term; [`RunningAggregate::total`] is the corrected value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningAggregate {
    pub count: u64,
    pub sum: f64,
    #[serde(default)]
    pub compensation: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub created_at: String,
    pub last_updated: String,
}

impl RunningAggregate {
    pub fn new() -> Self {
        let now = now_iso();
        Self {
            count: 0,
            sum: 0.0,
            compensation: 0.0,
            min: None,
            max: None,
            created_at: now.clone(),
            last_updated: now,
        }
    }

    pub fn push(&mut self, value: f64) {
        self.count += 1;

        let total = self.sum + value;
        if !total.is_finite() {
            // Past overflow the correction term is meaningless.
            self.compensation = 0.0;
        } else if self.sum.abs() >= value.abs() {
            self.compensation += (self.sum - total) + value;
        } else {
            self.compensation += (value - total) + self.sum;
        }
        self.sum = total;

        match self.min {
            Some(current) if current <= value => {}
            _ => self.min = Some(value),
        }
        match self.max {
            Some(current) if current >= value => {}
            _ => self.max = Some(value),
        }
    }

    pub fn total(&self) -> f64 {
        self.sum + self.compensation
    }

    pub fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total() / self.count as f64
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_finite(&self) -> bool {
        self.total().is_finite()
            && self.min.map_or(true, f64::is_finite)
            && self.max.map_or(true, f64::is_finite)
    }
}

impl Default for RunningAggregate {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchContext {
    pub source_file: String,
    pub sequence_number: u64,
    pub batch_id: Option<BatchId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchHistoryEntry {
    /// 1-based index across every batch this engine has folded.
    pub batch_number: u64,
    pub source_file: String,
    pub sequence_number: u64,
    pub batch_id: Option<BatchId>,
    pub rows_processed: u64,
    pub batch_min: f64,
    pub batch_max: f64,
    pub batch_average: f64,
    pub running_count_before: u64,
    pub running_count_after: u64,
    pub running_average_before: f64,
    pub running_average_after: f64,
    pub processed_at: String,
}

/// Point-in-time view of the engine. `min`/`max` stay `None` until a value
/// has been folded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub count: u64,
    pub sum: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub average: f64,
    pub batches_processed: u64,
    pub is_empty: bool,
    pub last_updated: String,
    pub last_batch: Option<BatchHistoryEntry>,
}

impl StatsSnapshot {
    pub fn as_aggregate(&self) -> ExternalAggregate {
        ExternalAggregate {
            count: self.count,
            average: self.average,
            min: self.min,
            max: self.max,
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.min, self.max) {
            (Some(min), Some(max)) if !self.is_empty => write!(
                f,
                "count={} avg={:.2} min={:.2} max={:.2}",
                self.count, self.average, min, max
            ),
            _ => write!(f, "count=0 (no data)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Count,
    Average,
    Min,
    Max,
}

impl Metric {
    pub const ALL: [Metric; 4] = [Metric::Count, Metric::Average, Metric::Min, Metric::Max];

    pub fn as_str(self) -> &'static str {
        match self {
            Metric::Count => "count",
            Metric::Average => "average",
            Metric::Min => "min",
            Metric::Max => "max",
        }
    }

    fn value(self, aggregate: &ExternalAggregate) -> Option<f64> {
        match self {
            Metric::Count => Some(aggregate.count as f64),
            Metric::Average => Some(aggregate.average),
            Metric::Min => aggregate.min,
            Metric::Max => aggregate.max,
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricCheck {
    pub matches: bool,
    pub incremental: Option<f64>,
    pub reference: Option<f64>,
    /// Absolute difference; `None` when either side is unset.
    pub difference: Option<f64>,
}

/// Count is compared exactly; the real-valued metrics within `tolerance`.
/// Two unset values match; one unset value never does.
fn check_metric(
    metric: Metric,
    incremental: &ExternalAggregate,
    reference: &ExternalAggregate,
    tolerance: f64,
) -> MetricCheck {
    let left = metric.value(incremental);
    let right = metric.value(reference);
    let difference = match (left, right) {
        (Some(a), Some(b)) => Some((a - b).abs()),
        _ => None,
    };
    let matches = match metric {
        Metric::Count => incremental.count == reference.count,
        _ => match (left, right) {
            (None, None) => true,
            (Some(_), Some(_)) => difference.map(|d| d <= tolerance).unwrap_or(false),
            _ => false,
        },
    };
    MetricCheck {
        matches,
        incremental: left,
        reference: right,
        difference,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub incremental: StatsSnapshot,
    pub reference: ExternalAggregate,
    pub matches: BTreeMap<Metric, bool>,
    /// Only mismatching metrics appear here.
    pub differences: BTreeMap<Metric, MetricCheck>,
    pub overall_match: bool,
    pub tolerance: f64,
    pub compared_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub checkpoint: String,
    pub incremental: ExternalAggregate,
    pub incremental_sum: f64,
    pub store: AggregateStats,
    pub matches: BTreeMap<Metric, bool>,
    pub differences: BTreeMap<Metric, MetricCheck>,
    pub overall_match: bool,
    pub verified_at: String,
}

impl VerificationRecord {
    pub fn new(checkpoint: &str, store: AggregateStats, comparison: &ComparisonResult) -> Self {
        Self {
            checkpoint: checkpoint.to_string(),
            incremental: comparison.incremental.as_aggregate(),
            incremental_sum: comparison.incremental.sum,
            store,
            matches: comparison.matches.clone(),
            differences: comparison.differences.clone(),
            overall_match: comparison.overall_match,
            verified_at: comparison.compared_at.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceComparison {
    pub reference_source: String,
    pub compared_sources: Vec<String>,
    pub results: BTreeMap<String, BTreeMap<Metric, MetricCheck>>,
    pub overall_consistent: bool,
    pub compared_at: String,
}

pub fn compare_sources(
    sources: &[(String, ExternalAggregate)],
    tolerance: f64,
) -> Option<SourceComparison> {
    let ((reference_name, reference), rest) = sources.split_first()?;
    if rest.is_empty() {
        return None;
    }

    let mut results = BTreeMap::new();
    let mut overall_consistent = true;
    for (name, candidate) in rest {
        let checks: BTreeMap<Metric, MetricCheck> = Metric::ALL
            .iter()
            .map(|metric| (*metric, check_metric(*metric, candidate, reference, tolerance)))
            .collect();
        if checks.values().any(|check| !check.matches) {
            overall_consistent = false;
        }
        results.insert(name.clone(), checks);
    }

    Some(SourceComparison {
        reference_source: reference_name.clone(),
        compared_sources: rest.iter().map(|(name, _)| name.clone()).collect(),
        results,
        overall_consistent,
        compared_at: now_iso(),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_batches: u64,
    pub total_rows: u64,
    pub average_batch_size: f64,
    pub source_files: usize,
    pub batches_per_file: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedStats {
    pub stats: RunningAggregate,
    #[serde(default)]
    pub batch_history: Vec<BatchHistoryEntry>,
    pub saved_at: String,
}

impl PersistedStats {
    pub fn load(path: &Path) -> Result<Self, PersistenceError> {
        let bytes = fs::read(path).map_err(|source| PersistenceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn ensure_finite(&self) -> Result<(), PersistenceError> {
        let history_finite = self.batch_history.iter().all(|entry| {
            [
                entry.batch_min,
                entry.batch_max,
                entry.batch_average,
                entry.running_average_before,
                entry.running_average_after,
            ]
            .iter()
            .all(|value| value.is_finite())
        });
        if self.stats.is_finite() && history_finite {
            Ok(())
        } else {
            Err(PersistenceError::NonFinite)
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), PersistenceError> {
        let io_err = |source| PersistenceError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
        }
        self.ensure_finite()?;
        let bytes = serde_json::to_vec_pretty(self)?;
        let tmp_path = path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp_path).map_err(io_err)?;
            file.write_all(&bytes).map_err(io_err)?;
            file.sync_all().map_err(io_err)?;
        }
        fs::rename(&tmp_path, path).map_err(io_err)?;
        Ok(())
    }
}

pub struct IncrementalStatsEngine {
    aggregate: RunningAggregate,
    history: Vec<BatchHistoryEntry>,
    persistence_path: Option<PathBuf>,
}

impl IncrementalStatsEngine {
    pub fn new() -> Self {
        Self {
            aggregate: RunningAggregate::new(),
            history: Vec::new(),
            persistence_path: None,
        }
    }

    /// Engine persisted to `path` after every mutation. An existing document
    /// is restored. If it cannot be read the engine starts empty with
    /// persistence disabled, leaving the file untouched.
    pub fn with_persistence(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut engine = Self::new();
        if path.exists() {
            match PersistedStats::load(&path) {
                Ok(document) => {
                    engine.apply(document);
                    info!(
                        path = %path.display(),
                        stats = %engine.get_current_stats(),
                        "restored persisted statistics"
                    );
                }
                Err(err) => {
                    error!(
                        path = %path.display(),
                        error = %err,
                        "failed to load persisted statistics; continuing in memory"
                    );
                    return engine;
                }
            }
        }
        engine.persistence_path = Some(path);
        engine
    }

    pub fn persistence_path(&self) -> Option<&Path> {
        self.persistence_path.as_deref()
    }

    /// Folds `values` in order. An empty slice leaves the state untouched and
    /// records no history.
    pub fn update_batch(&mut self, values: &[f64], context: BatchContext) -> StatsSnapshot {
        if values.is_empty() {
            debug!(file = %context.source_file, batch = context.sequence_number, "empty batch ignored");
            return self.get_current_stats();
        }

        let count_before = self.aggregate.count;
        let average_before = self.aggregate.average();

        let mut batch = RunningAggregate::new();
        for &value in values {
            self.aggregate.push(value);
            batch.push(value);
        }
        let now = now_iso();
        self.aggregate.last_updated = now.clone();

        let entry = BatchHistoryEntry {
            batch_number: self.history.len() as u64 + 1,
            source_file: context.source_file,
            sequence_number: context.sequence_number,
            batch_id: context.batch_id,
            rows_processed: values.len() as u64,
            batch_min: batch.min.unwrap_or_default(),
            batch_max: batch.max.unwrap_or_default(),
            batch_average: batch.average(),
            running_count_before: count_before,
            running_count_after: self.aggregate.count,
            running_average_before: average_before,
            running_average_after: self.aggregate.average(),
            processed_at: now,
        };
        debug!(
            file = %entry.source_file,
            batch = entry.sequence_number,
            rows = entry.rows_processed,
            count = entry.running_count_after,
            "folded batch"
        );
        self.history.push(entry);
        self.persist();
        self.get_current_stats()
    }

    pub fn get_current_stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            count: self.aggregate.count,
            sum: self.aggregate.total(),
            min: self.aggregate.min,
            max: self.aggregate.max,
            average: self.aggregate.average(),
            batches_processed: self.history.len() as u64,
            is_empty: self.aggregate.is_empty(),
            last_updated: self.aggregate.last_updated.clone(),
            last_batch: self.history.last().cloned(),
        }
    }

    pub fn compare_with_external(&self, reference: &ExternalAggregate, tolerance: f64) -> ComparisonResult {
        let incremental = self.get_current_stats();
        let current = incremental.as_aggregate();

        let mut matches = BTreeMap::new();
        let mut differences = BTreeMap::new();
        for metric in Metric::ALL {
            let check = check_metric(metric, &current, reference, tolerance);
            matches.insert(metric, check.matches);
            if !check.matches {
                differences.insert(metric, check);
            }
        }
        let overall_match = differences.is_empty();

        if overall_match {
            info!(stats = %incremental, "incremental statistics match reference");
        } else {
            for (metric, check) in &differences {
                error!(
                    metric = %metric,
                    incremental = ?check.incremental,
                    reference = ?check.reference,
                    difference = ?check.difference,
                    "statistics mismatch"
                );
            }
        }

        ComparisonResult {
            incremental,
            reference: *reference,
            matches,
            differences,
            overall_match,
            tolerance,
            compared_at: now_iso(),
        }
    }

    pub fn reset(&mut self) {
        info!("resetting incremental statistics");
        self.aggregate = RunningAggregate::new();
        self.history.clear();
        self.persist();
    }

    pub fn get_batch_history(&self) -> &[BatchHistoryEntry] {
        &self.history
    }

    pub fn performance_metrics(&self) -> PerformanceMetrics {
        let total_batches = self.history.len() as u64;
        let total_rows: u64 = self.history.iter().map(|entry| entry.rows_processed).sum();
        let source_files = self
            .history
            .iter()
            .map(|entry| entry.source_file.as_str())
            .collect::<BTreeSet<_>>()
            .len();
        PerformanceMetrics {
            total_batches,
            total_rows,
            average_batch_size: if total_batches == 0 {
                0.0
            } else {
                total_rows as f64 / total_batches as f64
            },
            source_files,
            batches_per_file: if source_files == 0 {
                0.0
            } else {
                total_batches as f64 / source_files as f64
            },
        }
    }

    pub fn document(&self) -> PersistedStats {
        PersistedStats {
            stats: self.aggregate.clone(),
            batch_history: self.history.clone(),
            saved_at: now_iso(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, PersistenceError> {
        let document = self.document();
        document.ensure_finite()?;
        Ok(serde_json::to_vec(&document)?)
    }

    pub fn restore_from_bytes(&mut self, bytes: &[u8]) -> Result<(), PersistenceError> {
        let document: PersistedStats = serde_json::from_slice(bytes)?;
        self.apply(document);
        Ok(())
    }

    fn apply(&mut self, document: PersistedStats) {
        self.aggregate = document.stats;
        self.history = document.batch_history;
    }

    fn persist(&mut self) {
        let Some(path) = self.persistence_path.as_ref() else {
            return;
        };
        if let Err(err) = self.document().save(path) {
            warn!(
                path = %path.display(),
                error = %err,
                "failed to persist statistics; persistence disabled"
            );
            self.persistence_path = None;
        }
    }
}

impl Default for IncrementalStatsEngine {
    fn default() -> Self {
        Self::new()
    }
}
