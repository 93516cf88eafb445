//! Row sanitizer applied to every micro-batch before it reaches the store or
//! the statistics engine.
//!
//! Policy, in order:
//! 1. drop rows whose price is missing (null or NaN);
//! 2. drop rows whose price is not a positive finite number;
//! 3. warn about nulls in `timestamp` / `user_id`, keeping the rows.

use tracing::{debug, warn};

use crate::types::MicroBatch;

#[derive(Debug)]
pub struct SanitizedBatch {
    pub batch: MicroBatch,
    pub initial_rows: usize,
    pub dropped_missing_price: usize,
    pub dropped_invalid_price: usize,
    pub null_timestamps: usize,
    pub null_subjects: usize,
}

impl SanitizedBatch {
    pub fn dropped(&self) -> usize {
        self.dropped_missing_price + self.dropped_invalid_price
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    pub fn prices(&self) -> Vec<f64> {
        self.batch.prices()
    }
}

fn is_missing(price: Option<f64>) -> bool {
    match price {
        None => true,
        Some(value) => value.is_nan(),
    }
}

fn is_valid(price: f64) -> bool {
    price.is_finite() && price > 0.0
}

pub fn sanitize(mut batch: MicroBatch) -> SanitizedBatch {
    let initial_rows = batch.len();

    batch.rows.retain(|row| !is_missing(row.price));
    let dropped_missing_price = initial_rows - batch.len();

    let before_range = batch.len();
    batch
        .rows
        .retain(|row| row.price.map(is_valid).unwrap_or(false));
    let dropped_invalid_price = before_range - batch.len();

    let null_timestamps = batch.rows.iter().filter(|row| row.timestamp.is_none()).count();
    let null_subjects = batch.rows.iter().filter(|row| row.subject_id.is_none()).count();

    if dropped_missing_price > 0 {
        warn!(
            file = %batch.source_file,
            batch = batch.sequence,
            dropped = dropped_missing_price,
            "dropping rows with missing price"
        );
    }
    if dropped_invalid_price > 0 {
        warn!(
            file = %batch.source_file,
            batch = batch.sequence,
            dropped = dropped_invalid_price,
            "dropping rows with non-positive price"
        );
    }
    if null_timestamps > 0 {
        warn!(
            file = %batch.source_file,
            batch = batch.sequence,
            rows = null_timestamps,
            "null timestamp values passed through"
        );
    }
    if null_subjects > 0 {
        warn!(
            file = %batch.source_file,
            batch = batch.sequence,
            rows = null_subjects,
            "null user_id values passed through"
        );
    }
    debug!(
        file = %batch.source_file,
        batch = batch.sequence,
        kept = batch.len(),
        initial = initial_rows,
        "sanitized batch"
    );

    SanitizedBatch {
        batch,
        initial_rows,
        dropped_missing_price,
        dropped_invalid_price,
        null_timestamps,
        null_subjects,
    }
}
