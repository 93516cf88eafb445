use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const TIMESTAMP_COLUMN: &str = "timestamp";
pub const PRICE_COLUMN: &str = "price";
pub const SUBJECT_COLUMN: &str = "user_id";
pub const SOURCE_FILE_COLUMN: &str = "source_file";

pub const REQUIRED_COLUMNS: [&str; 3] = [TIMESTAMP_COLUMN, PRICE_COLUMN, SUBJECT_COLUMN];

#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementRow {
    pub timestamp: Option<String>,
    pub price: Option<f64>,
    pub subject_id: Option<String>,
    pub source_file: String,
}

/// One bounded slice of a staging file. Owned by a single orchestrator
/// iteration and dropped before the next slice is read.
#[derive(Debug)]
pub struct MicroBatch {
    pub source_file: String,
    /// 1-based position of this batch within its file.
    pub sequence: u64,
    pub offset: u64,
    pub rows: Vec<MeasurementRow>,
}

impl MicroBatch {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Prices in row order. Rows without a price are skipped; after
    /// sanitizing there are none.
    pub fn prices(&self) -> Vec<f64> {
        self.rows.iter().filter_map(|row| row.price).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchInfo {
    pub source_file: String,
    pub sequence_number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(String);

impl BatchId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for BatchId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Processing => "processing",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
        }
    }

    /// pending -> processing -> {completed | failed}. A batch that never
    /// reached processing may still be failed.
    pub fn can_transition_to(self, next: BatchStatus) -> bool {
        matches!(
            (self, next),
            (BatchStatus::Pending, BatchStatus::Processing)
                | (BatchStatus::Pending, BatchStatus::Failed)
                | (BatchStatus::Processing, BatchStatus::Completed)
                | (BatchStatus::Processing, BatchStatus::Failed)
        )
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(BatchStatus::Pending),
            "processing" => Ok(BatchStatus::Processing),
            "completed" => Ok(BatchStatus::Completed),
            "failed" => Ok(BatchStatus::Failed),
            other => Err(format!("unknown batch status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub batch_id: BatchId,
    pub source_file: String,
    pub sequence_number: u64,
    pub rows_processed: u64,
    pub status: BatchStatus,
    pub error_message: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total_batches: u64,
    pub completed: u64,
    pub failed: u64,
    pub in_flight: u64,
    pub total_rows: u64,
    /// Completed share of all batches, in percent.
    pub success_rate: f64,
}

/// Ground-truth aggregate computed by the store. An empty store reports
/// zeros for every field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateStats {
    pub count: u64,
    pub average: f64,
    pub min: f64,
    pub max: f64,
    pub sum: f64,
}

impl AggregateStats {
    /// Reference form used for comparison. With no rows the zero min/max
    /// carry no information and are reported as unset.
    pub fn to_reference(&self) -> ExternalAggregate {
        if self.count == 0 {
            return ExternalAggregate::empty();
        }
        ExternalAggregate {
            count: self.count,
            average: self.average,
            min: Some(self.min),
            max: Some(self.max),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExternalAggregate {
    pub count: u64,
    pub average: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl ExternalAggregate {
    pub fn empty() -> Self {
        Self {
            count: 0,
            average: 0.0,
            min: None,
            max: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AggregateStats, BatchStatus};

    #[test]
    fn status_transitions_are_monotone() {
        use BatchStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Processing.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Processing));
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            BatchStatus::Pending,
            BatchStatus::Processing,
            BatchStatus::Completed,
            BatchStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<BatchStatus>(), Ok(status));
        }
        assert!("done".parse::<BatchStatus>().is_err());
    }

    #[test]
    fn empty_store_aggregate_has_unset_extrema() {
        let reference = AggregateStats::default().to_reference();
        assert_eq!(reference.count, 0);
        assert_eq!(reference.min, None);
        assert_eq!(reference.max, None);
    }
}
