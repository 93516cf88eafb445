//! Staging-layer reads: the micro-batch reader over bronze Parquet files and
//! the DataFusion price profile across them.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use deltalake::arrow::array::{Array, Float64Array, Int64Array};
use deltalake::datafusion::execution::context::SessionConfig;
use deltalake::datafusion::prelude::*;
use deltalake::parquet::arrow::arrow_reader::{
    ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder,
};

use crate::arrow_utils::{get_array, rows_from_batch};
use crate::error::StagingError;
use crate::types::{AggregateStats, MicroBatch, PRICE_COLUMN, REQUIRED_COLUMNS};
use crate::utils::{file_name_of, log_timing};

#[derive(Debug, Clone, PartialEq)]
pub struct StagingMetadata {
    pub num_rows: u64,
    pub num_row_groups: usize,
    pub columns: Vec<String>,
    pub created_by: Option<String>,
}

/// Lazy, single-pass reader over one bronze file. Only the current
/// micro-batch is materialised; nothing is retained between calls to
/// [`StagingReader::next_batch`].
pub struct StagingReader {
    source_file: String,
    reader: ParquetRecordBatchReader,
    metadata: StagingMetadata,
    next_sequence: u64,
    rows_read: u64,
}

impl StagingReader {
    pub fn open(path: &Path, batch_size: usize) -> Result<Self, StagingError> {
        if !path.exists() {
            return Err(StagingError::SourceNotFound {
                path: path.to_path_buf(),
            });
        }
        let t0 = Instant::now();
        let file = File::open(path)?;
        let parquet_err = |source| StagingError::Parquet {
            path: path.to_path_buf(),
            source,
        };
        let builder = ParquetRecordBatchReaderBuilder::try_new(file).map_err(parquet_err)?;

        let columns: Vec<String> = builder
            .schema()
            .fields()
            .iter()
            .map(|field| field.name().clone())
            .collect();
        let missing: Vec<String> = REQUIRED_COLUMNS
            .iter()
            .filter(|required| !columns.iter().any(|name| name == *required))
            .map(|required| required.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(StagingError::SchemaMismatch {
                path: path.to_path_buf(),
                missing,
            });
        }

        let file_meta = builder.metadata().file_metadata();
        let metadata = StagingMetadata {
            num_rows: file_meta.num_rows().max(0) as u64,
            num_row_groups: builder.metadata().num_row_groups(),
            columns,
            created_by: file_meta.created_by().map(str::to_string),
        };
        let reader = builder
            .with_batch_size(batch_size.max(1))
            .build()
            .map_err(parquet_err)?;
        log_timing("staging_reader open", t0);

        Ok(Self {
            source_file: file_name_of(path),
            reader,
            metadata,
            next_sequence: 1,
            rows_read: 0,
        })
    }

    pub fn metadata(&self) -> &StagingMetadata {
        &self.metadata
    }

    pub fn rows_read(&self) -> u64 {
        self.rows_read
    }

    pub fn next_batch(&mut self) -> Result<Option<MicroBatch>, StagingError> {
        let t0 = Instant::now();
        let record_batch = match self.reader.next() {
            Some(batch) => batch?,
            None => return Ok(None),
        };
        let rows = rows_from_batch(&record_batch, &self.source_file)?;
        drop(record_batch);
        log_timing("staging_reader next_batch", t0);

        let batch = MicroBatch {
            source_file: self.source_file.clone(),
            sequence: self.next_sequence,
            offset: self.rows_read,
            rows,
        };
        self.next_sequence += 1;
        self.rows_read += batch.len() as u64;
        Ok(Some(batch))
    }
}

impl Iterator for StagingReader {
    type Item = Result<MicroBatch, StagingError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch().transpose()
    }
}

pub fn parquet_read_session_config() -> SessionConfig {
    let mut config = SessionConfig::new()
        .with_target_partitions(1)
        .with_repartition_file_scans(false)
        .with_parquet_pruning(true);
    // Bronze files are scanned whole; page index lookups only add reads.
    config.options_mut().execution.parquet.enable_page_index = false;
    config
}

/// Aggregates `price` across bronze files with the sanitizer's drop policy
/// applied, giving a third reference independent of the store.
pub async fn bronze_price_profile(files: &[PathBuf]) -> Result<AggregateStats> {
    let uris: Vec<String> = files
        .iter()
        .filter(|path| path.exists())
        .map(|path| path.display().to_string())
        .collect();
    if uris.is_empty() {
        return Ok(AggregateStats::default());
    }

    let ctx = SessionContext::new_with_config(parquet_read_session_config());
    let t0 = Instant::now();
    let df = ctx
        .read_parquet(uris, ParquetReadOptions::default())
        .await
        .context("read bronze files")?;
    log_timing("bronze_price_profile read_parquet_df", t0);

    // NaN orders above +inf under arrow's total ordering, so the upper bound
    // drops NaN as well as infinities. Null prices fail both predicates.
    let df = df
        .filter(col(PRICE_COLUMN).gt(lit(0.0_f64)))?
        .filter(col(PRICE_COLUMN).lt(lit(f64::INFINITY)))?
        .aggregate(
            vec![],
            vec![
                count(col(PRICE_COLUMN)).alias("count"),
                sum(col(PRICE_COLUMN)).alias("sum"),
                min(col(PRICE_COLUMN)).alias("min"),
                max(col(PRICE_COLUMN)).alias("max"),
                avg(col(PRICE_COLUMN)).alias("avg"),
            ],
        )?;

    let t1 = Instant::now();
    let batches = df.collect().await?;
    log_timing("bronze_price_profile collect", t1);
    let batch = match batches.iter().find(|batch| batch.num_rows() > 0) {
        Some(batch) => batch,
        None => return Ok(AggregateStats::default()),
    };

    let count = get_array::<Int64Array>(batch, "count")?.value(0).max(0) as u64;
    if count == 0 {
        return Ok(AggregateStats::default());
    }
    let value = |name: &str| -> Result<f64> {
        let array = get_array::<Float64Array>(batch, name)?;
        Ok(if array.is_null(0) { 0.0 } else { array.value(0) })
    };
    Ok(AggregateStats {
        count,
        average: value("avg")?,
        min: value("min")?,
        max: value("max")?,
        sum: value("sum")?,
    })
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::path::Path;
    use std::sync::Arc;

    use deltalake::arrow::array::{Float64Array, StringArray};
    use deltalake::arrow::datatypes::{DataType, Field, Schema};
    use deltalake::arrow::record_batch::RecordBatch;
    use deltalake::parquet::arrow::ArrowWriter;

    use super::StagingReader;
    use crate::error::StagingError;

    fn write_parquet(path: &Path, prices: Vec<Option<f64>>, with_user: bool) {
        let mut fields = vec![
            Field::new("timestamp", DataType::Utf8, true),
            Field::new("price", DataType::Float64, true),
        ];
        let n = prices.len();
        let mut columns: Vec<Arc<dyn deltalake::arrow::array::Array>> = vec![
            Arc::new(StringArray::from(vec![Some("2012-01-01"); n])),
            Arc::new(Float64Array::from(prices)),
        ];
        if with_user {
            fields.push(Field::new("user_id", DataType::Utf8, true));
            columns.push(Arc::new(StringArray::from(vec![Some("u"); n])));
        }
        let schema = Arc::new(Schema::new(fields));
        let batch = RecordBatch::try_new(schema.clone(), columns).expect("batch");
        let file = File::create(path).expect("create");
        let mut writer = ArrowWriter::try_new(file, schema, None).expect("writer");
        writer.write(&batch).expect("write");
        writer.close().expect("close");
    }

    #[test]
    fn yields_fixed_size_batches_in_sequence() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("2012-1.parquet");
        write_parquet(&path, (1..=25).map(|v| Some(v as f64)).collect(), true);

        let mut reader = StagingReader::open(&path, 10).expect("open");
        assert_eq!(reader.metadata().num_rows, 25);

        let sizes: Vec<(u64, u64, usize)> = std::iter::from_fn(|| reader.next_batch().expect("batch"))
            .map(|batch| (batch.sequence, batch.offset, batch.len()))
            .collect();
        assert_eq!(sizes, vec![(1, 0, 10), (2, 10, 10), (3, 20, 5)]);
        assert_eq!(reader.rows_read(), 25);
        assert!(reader.next_batch().expect("exhausted").is_none());
    }

    #[test]
    fn missing_file_is_source_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = StagingReader::open(&dir.path().join("nope.parquet"), 10)
            .err()
            .expect("error");
        assert!(matches!(err, StagingError::SourceNotFound { .. }));
    }

    #[test]
    fn missing_columns_is_schema_mismatch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.parquet");
        write_parquet(&path, vec![Some(1.0)], false);

        match StagingReader::open(&path, 10) {
            Err(StagingError::SchemaMismatch { missing, .. }) => {
                assert_eq!(missing, vec!["user_id".to_string()]);
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn bronze_profile_applies_drop_policy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("2012-2.parquet");
        write_parquet(
            &path,
            vec![Some(15.0), None, Some(-5.0), Some(20.0), Some(f64::NAN)],
            true,
        );

        let rt = tokio::runtime::Runtime::new().expect("runtime");
        let profile = rt
            .block_on(super::bronze_price_profile(&[path]))
            .expect("profile");
        assert_eq!(profile.count, 2);
        assert!((profile.sum - 35.0).abs() < 1e-9);
        assert!((profile.average - 17.5).abs() < 1e-9);
        assert_eq!(profile.min, 15.0);
        assert_eq!(profile.max, 20.0);
    }
}
