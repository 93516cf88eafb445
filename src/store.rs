//! Durable store gateway.
//!
//! Rows are appended batch by batch; each batch gets a UUID and a lifecycle
//! record (`pending -> processing -> completed | failed`). The aggregate query
//! here is the ground truth the statistics engine is verified against and is
//! never used on the ingestion path.

use std::path::Path;
use std::time::Instant;

use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension};
use tracing::{debug, error, info};

use crate::error::StoreError;
use crate::stats::VerificationRecord;
use crate::types::{
    AggregateStats, BatchId, BatchInfo, BatchRecord, BatchStatus, BatchSummary, ExternalAggregate,
    MeasurementRow,
};
use crate::utils::{log_timing, now_iso};

const ID_ATTEMPTS: u32 = 3;

const STORE_SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS batch_metadata (
    batch_id TEXT PRIMARY KEY,
    source_file TEXT NOT NULL,
    sequence_number INTEGER NOT NULL,
    rows_processed INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL
        CHECK (status IN ('pending', 'processing', 'completed', 'failed')),
    error_message TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_batch_metadata_source
    ON batch_metadata(source_file, sequence_number);

CREATE TABLE IF NOT EXISTS measurements (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT,
    price REAL NOT NULL,
    subject_id TEXT,
    source_file TEXT NOT NULL,
    batch_id TEXT NOT NULL REFERENCES batch_metadata(batch_id),
    inserted_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_measurements_batch ON measurements(batch_id);
CREATE INDEX IF NOT EXISTS idx_measurements_source ON measurements(source_file);

CREATE TABLE IF NOT EXISTS stats_verification (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    checkpoint TEXT NOT NULL,
    incremental_count INTEGER NOT NULL,
    incremental_average REAL NOT NULL,
    incremental_min REAL,
    incremental_max REAL,
    incremental_sum REAL NOT NULL,
    store_count INTEGER NOT NULL,
    store_average REAL NOT NULL,
    store_min REAL NOT NULL,
    store_max REAL NOT NULL,
    store_sum REAL NOT NULL,
    matches TEXT NOT NULL,
    differences TEXT NOT NULL,
    overall_match INTEGER NOT NULL,
    verified_at TEXT NOT NULL
);
"#;

/// Append-only row sink plus the ground-truth aggregate query.
pub trait StoreGateway {
    /// Appends `rows` as one batch and returns its new identifier. On failure
    /// the batch record is left `failed` and the error is returned.
    fn insert_batch(&mut self, rows: &[MeasurementRow], info: &BatchInfo) -> Result<BatchId, StoreError>;

    /// Count, average, min, max and sum over every stored row. All zeros
    /// when the store is empty.
    fn get_aggregate_stats(&self) -> Result<AggregateStats, StoreError>;

    fn get_batch_summary(&self) -> Result<BatchSummary, StoreError>;

    fn save_verification(&mut self, record: &VerificationRecord) -> Result<(), StoreError>;
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.exists() && !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags)?;
        conn.execute_batch(STORE_SCHEMA)?;
        info!(path = %path.display(), "store opened");
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(STORE_SCHEMA)?;
        Ok(Self { conn })
    }

    fn allocate_batch(&self, info: &BatchInfo) -> Result<BatchId, StoreError> {
        let now = now_iso();
        for attempt in 1..=ID_ATTEMPTS {
            let batch_id = BatchId::generate();
            let inserted = self.conn.execute(
                "INSERT INTO batch_metadata
                    (batch_id, source_file, sequence_number, rows_processed, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 0, ?4, ?5, ?5)",
                params![
                    batch_id.as_str(),
                    info.source_file,
                    info.sequence_number as i64,
                    BatchStatus::Pending.as_str(),
                    now,
                ],
            );
            match inserted {
                Ok(_) => return Ok(batch_id),
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == ErrorCode::ConstraintViolation =>
                {
                    debug!(attempt, batch_id = %batch_id, "batch id collision, retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(StoreError::IdExhausted {
            attempts: ID_ATTEMPTS,
        })
    }

    /// Appends the rows and completes the batch in one transaction, so a
    /// batch is either `completed` with its rows or has none.
    fn commit_batch(&mut self, batch_id: &BatchId, rows: &[MeasurementRow]) -> Result<(), StoreError> {
        let inserted_at = now_iso();
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO measurements
                    (timestamp, price, subject_id, source_file, batch_id, inserted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for row in rows {
                stmt.execute(params![
                    row.timestamp,
                    row.price,
                    row.subject_id,
                    row.source_file,
                    batch_id.as_str(),
                    inserted_at,
                ])?;
            }
        }
        transition(
            &tx,
            batch_id,
            BatchStatus::Processing,
            BatchStatus::Completed,
            Some(rows.len() as u64),
            None,
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn row_count(&self) -> Result<u64, StoreError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM measurements", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    pub fn batch_record(&self, batch_id: &BatchId) -> Result<Option<BatchRecord>, StoreError> {
        let record = self
            .conn
            .query_row(
                "SELECT batch_id, source_file, sequence_number, rows_processed, status,
                        error_message, created_at
                   FROM batch_metadata WHERE batch_id = ?1",
                params![batch_id.as_str()],
                batch_record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn batch_records_for(&self, source_file: &str) -> Result<Vec<BatchRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT batch_id, source_file, sequence_number, rows_processed, status,
                    error_message, created_at
               FROM batch_metadata
              WHERE source_file = ?1
              ORDER BY created_at, sequence_number",
        )?;
        let records = stmt
            .query_map(params![source_file], batch_record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    // newest first
    pub fn list_verifications(&self, limit: usize) -> Result<Vec<VerificationRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT checkpoint, incremental_count, incremental_average, incremental_min,
                    incremental_max, incremental_sum, store_count, store_average, store_min,
                    store_max, store_sum, matches, differences, overall_match, verified_at
               FROM stats_verification
              ORDER BY id DESC
              LIMIT ?1",
        )?;
        let raw = stmt
            .query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, Option<f64>>(3)?,
                    row.get::<_, Option<f64>>(4)?,
                    row.get::<_, f64>(5)?,
                    AggregateStats {
                        count: row.get::<_, i64>(6)?.max(0) as u64,
                        average: row.get(7)?,
                        min: row.get(8)?,
                        max: row.get(9)?,
                        sum: row.get(10)?,
                    },
                    row.get::<_, String>(11)?,
                    row.get::<_, String>(12)?,
                    row.get::<_, bool>(13)?,
                    row.get::<_, String>(14)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut records = Vec::with_capacity(raw.len());
        for (checkpoint, count, average, min, max, sum, store, matches, differences, overall_match, verified_at) in raw {
            records.push(VerificationRecord {
                checkpoint,
                incremental: ExternalAggregate {
                    count: count.max(0) as u64,
                    average,
                    min,
                    max,
                },
                incremental_sum: sum,
                store,
                matches: serde_json::from_str(&matches)?,
                differences: serde_json::from_str(&differences)?,
                overall_match,
                verified_at,
            });
        }
        Ok(records)
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "BEGIN;
             DELETE FROM measurements;
             DELETE FROM batch_metadata;
             DELETE FROM stats_verification;
             COMMIT;",
        )?;
        info!("store cleared");
        Ok(())
    }
}

fn transition(
    conn: &Connection,
    batch_id: &BatchId,
    from: BatchStatus,
    to: BatchStatus,
    rows_processed: Option<u64>,
    error_message: Option<&str>,
) -> Result<(), StoreError> {
    let invalid = || StoreError::InvalidTransition {
        batch_id: batch_id.to_string(),
        from: from.to_string(),
        to: to.to_string(),
    };
    if !from.can_transition_to(to) {
        return Err(invalid());
    }
    let changed = conn.execute(
        "UPDATE batch_metadata
            SET status = ?1,
                rows_processed = COALESCE(?2, rows_processed),
                error_message = COALESCE(?3, error_message),
                updated_at = ?4
          WHERE batch_id = ?5 AND status = ?6",
        params![
            to.as_str(),
            rows_processed.map(|rows| rows as i64),
            error_message,
            now_iso(),
            batch_id.as_str(),
            from.as_str(),
        ],
    )?;
    if changed != 1 {
        return Err(invalid());
    }
    Ok(())
}

fn batch_record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BatchRecord> {
    let status: String = row.get(4)?;
    let status = status.parse::<BatchStatus>().map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            err.into(),
        )
    })?;
    Ok(BatchRecord {
        batch_id: BatchId::from(row.get::<_, String>(0)?),
        source_file: row.get(1)?,
        sequence_number: row.get::<_, i64>(2)?.max(0) as u64,
        rows_processed: row.get::<_, i64>(3)?.max(0) as u64,
        status,
        error_message: row.get(5)?,
        created_at: row.get(6)?,
    })
}

impl StoreGateway for SqliteStore {
    fn insert_batch(&mut self, rows: &[MeasurementRow], info: &BatchInfo) -> Result<BatchId, StoreError> {
        let t0 = Instant::now();
        let batch_id = self.allocate_batch(info)?;
        transition(&self.conn, &batch_id, BatchStatus::Pending, BatchStatus::Processing, None, None)?;

        match self.commit_batch(&batch_id, rows) {
            Ok(()) => {
                log_timing("store insert_batch", t0);
                debug!(
                    file = %info.source_file,
                    batch = info.sequence_number,
                    batch_id = %batch_id,
                    rows = rows.len(),
                    "batch stored"
                );
                Ok(batch_id)
            }
            Err(err) => {
                let message = err.to_string();
                if let Err(mark_err) = transition(
                    &self.conn,
                    &batch_id,
                    BatchStatus::Processing,
                    BatchStatus::Failed,
                    Some(0),
                    Some(&message),
                ) {
                    error!(batch_id = %batch_id, error = %mark_err, "failed to mark batch as failed");
                }
                error!(
                    file = %info.source_file,
                    batch = info.sequence_number,
                    batch_id = %batch_id,
                    error = %message,
                    "batch insert failed"
                );
                Err(StoreError::InsertFailed {
                    batch_id: batch_id.to_string(),
                    message,
                })
            }
        }
    }

    fn get_aggregate_stats(&self) -> Result<AggregateStats, StoreError> {
        let t0 = Instant::now();
        let stats = self.conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(AVG(price), 0.0),
                    COALESCE(MIN(price), 0.0),
                    COALESCE(MAX(price), 0.0),
                    COALESCE(SUM(price), 0.0)
               FROM measurements",
            [],
            |row| {
                Ok(AggregateStats {
                    count: row.get::<_, i64>(0)?.max(0) as u64,
                    average: row.get(1)?,
                    min: row.get(2)?,
                    max: row.get(3)?,
                    sum: row.get(4)?,
                })
            },
        )?;
        log_timing("store get_aggregate_stats", t0);
        Ok(stats)
    }

    fn get_batch_summary(&self) -> Result<BatchSummary, StoreError> {
        let (total, completed, failed, in_flight, total_rows) = self.conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status IN ('pending', 'processing') THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'completed' THEN rows_processed ELSE 0 END), 0)
               FROM batch_metadata",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            },
        )?;
        let success_rate = if total > 0 {
            completed as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        Ok(BatchSummary {
            total_batches: total.max(0) as u64,
            completed: completed.max(0) as u64,
            failed: failed.max(0) as u64,
            in_flight: in_flight.max(0) as u64,
            total_rows: total_rows.max(0) as u64,
            success_rate,
        })
    }

    fn save_verification(&mut self, record: &VerificationRecord) -> Result<(), StoreError> {
        let matches = serde_json::to_string(&record.matches)?;
        let differences = serde_json::to_string(&record.differences)?;
        self.conn.execute(
            "INSERT INTO stats_verification
                (checkpoint, incremental_count, incremental_average, incremental_min,
                 incremental_max, incremental_sum, store_count, store_average, store_min,
                 store_max, store_sum, matches, differences, overall_match, verified_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                record.checkpoint,
                record.incremental.count as i64,
                record.incremental.average,
                record.incremental.min,
                record.incremental.max,
                record.incremental_sum,
                record.store.count as i64,
                record.store.average,
                record.store.min,
                record.store.max,
                record.store.sum,
                matches,
                differences,
                record.overall_match,
                record.verified_at,
            ],
        )?;
        Ok(())
    }
}
