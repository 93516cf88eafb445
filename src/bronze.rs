//! Bronze layer: raw CSV files restaged as Parquet.
//!
//! Every raw column is kept as text except `price`, which is coerced to
//! Float64 (unparseable values become null). Provenance columns record the
//! CSV name and when and by what the file was written. The CSV is read in
//! chunks of `batch_size` rows, never whole.

use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use arrow::csv::reader::Format;
use arrow::csv::ReaderBuilder;
use deltalake::arrow::datatypes::{DataType, Field, Schema};
use deltalake::parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use deltalake::parquet::arrow::ArrowWriter;
use deltalake::parquet::basic::{Compression, ZstdLevel};
use deltalake::parquet::file::properties::WriterProperties;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::arrow_utils::{bronze_schema, build_bronze_batch};
use crate::error::StagingError;
use crate::types::REQUIRED_COLUMNS;
use crate::utils::{file_name_of, file_size, file_stem_of, format_size, log_timing, now_iso};

pub const CREATED_BY: &str = concat!("bronze_ingest ", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, PartialEq)]
pub struct BronzeOptions {
    pub batch_size: usize,
    pub compression_level: i32,
    pub created_by: String,
}

impl Default for BronzeOptions {
    fn default() -> Self {
        Self {
            batch_size: crate::config::DEFAULT_BATCH_SIZE,
            compression_level: 3,
            created_by: CREATED_BY.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BronzeFileReport {
    pub stem: String,
    pub csv_path: PathBuf,
    pub parquet_path: PathBuf,
    pub rows: u64,
    pub chunks: u64,
    pub csv_bytes: u64,
    pub parquet_bytes: u64,
    /// csv size / parquet size.
    pub compression_ratio: f64,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BronzeConversionReport {
    pub converted: Vec<BronzeFileReport>,
    pub missing: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl BronzeConversionReport {
    pub fn success(&self) -> bool {
        self.missing.is_empty() && self.failed.is_empty()
    }

    pub fn total_rows(&self) -> u64 {
        self.converted.iter().map(|report| report.rows).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParquetInfo {
    pub path: PathBuf,
    pub rows: u64,
    pub row_groups: usize,
    pub columns: Vec<String>,
    pub size_bytes: u64,
    pub created_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerCheck {
    pub stem: String,
    pub path: PathBuf,
    pub info: Option<ParquetInfo>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerVerification {
    pub checks: Vec<LayerCheck>,
}

impl LayerVerification {
    pub fn valid(&self) -> bool {
        self.checks.iter().all(|check| check.info.is_some())
    }

    pub fn total_rows(&self) -> u64 {
        self.checks
            .iter()
            .filter_map(|check| check.info.as_ref())
            .map(|info| info.rows)
            .sum()
    }
}

/// Reads the header and returns it as an all-text schema.
fn raw_schema(file: &mut File, path: &Path) -> Result<Schema> {
    let (inferred, _) = Format::default()
        .with_header(true)
        .infer_schema(&mut *file, Some(0))
        .with_context(|| format!("read csv header of {}", path.display()))?;
    file.seek(SeekFrom::Start(0))?;

    let names: Vec<&String> = inferred.fields().iter().map(|field| field.name()).collect();
    let missing: Vec<String> = REQUIRED_COLUMNS
        .iter()
        .filter(|required| !names.iter().any(|name| name.as_str() == **required))
        .map(|required| required.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(StagingError::SchemaMismatch {
            path: path.to_path_buf(),
            missing,
        }
        .into());
    }

    Ok(Schema::new(
        inferred
            .fields()
            .iter()
            .map(|field| Field::new(field.name(), DataType::Utf8, true))
            .collect::<Vec<_>>(),
    ))
}

pub fn convert_csv_to_parquet(
    csv_path: &Path,
    bronze_dir: &Path,
    options: &BronzeOptions,
) -> Result<BronzeFileReport> {
    if !csv_path.exists() {
        return Err(StagingError::SourceNotFound {
            path: csv_path.to_path_buf(),
        }
        .into());
    }
    let t0 = Instant::now();
    let stem = file_stem_of(csv_path);
    let source_file = file_name_of(csv_path);
    std::fs::create_dir_all(bronze_dir)
        .with_context(|| format!("create bronze dir {}", bronze_dir.display()))?;
    let parquet_path = bronze_dir.join(format!("{}.parquet", stem));

    let mut file = File::open(csv_path).with_context(|| format!("open {}", csv_path.display()))?;
    let raw = Arc::new(raw_schema(&mut file, csv_path)?);
    let schema = bronze_schema(raw.as_ref());
    let reader = ReaderBuilder::new(raw)
        .with_header(true)
        .with_batch_size(options.batch_size.max(1))
        .build(file)
        .with_context(|| format!("build csv reader for {}", csv_path.display()))?;

    let props = WriterProperties::builder()
        .set_compression(Compression::ZSTD(ZstdLevel::try_new(options.compression_level)?))
        .set_created_by(options.created_by.clone())
        .build();
    // Written to a temp name so a failed conversion never leaves a partial
    // file under the final name.
    let tmp_path = parquet_path.with_extension("parquet.tmp");
    let out = File::create(&tmp_path).with_context(|| format!("create {}", tmp_path.display()))?;
    let mut writer = ArrowWriter::try_new(out, schema.clone(), Some(props))?;

    let created_at = now_iso();
    let mut rows = 0u64;
    let mut chunks = 0u64;
    for chunk in reader {
        let chunk = chunk.with_context(|| format!("read csv chunk {} of {}", chunks + 1, source_file))?;
        let batch = build_bronze_batch(&chunk, &schema, &source_file, &created_at, &options.created_by)?;
        drop(chunk);
        writer.write(&batch)?;
        rows += batch.num_rows() as u64;
        chunks += 1;
    }
    writer.close()?;
    std::fs::rename(&tmp_path, &parquet_path)
        .with_context(|| format!("move {} into place", parquet_path.display()))?;
    log_timing("bronze convert_csv_to_parquet", t0);

    let csv_bytes = file_size(csv_path);
    let parquet_bytes = file_size(&parquet_path);
    let report = BronzeFileReport {
        stem,
        csv_path: csv_path.to_path_buf(),
        parquet_path,
        rows,
        chunks,
        csv_bytes,
        parquet_bytes,
        compression_ratio: if parquet_bytes > 0 {
            csv_bytes as f64 / parquet_bytes as f64
        } else {
            0.0
        },
        elapsed_ms: t0.elapsed().as_millis() as u64,
    };
    info!(
        file = %source_file,
        rows = report.rows,
        chunks = report.chunks,
        csv = %format_size(report.csv_bytes),
        parquet = %format_size(report.parquet_bytes),
        ratio = format!("{:.2}", report.compression_ratio),
        "converted csv to bronze"
    );
    Ok(report)
}

/// Converts `<stem>.csv` for every stem found in `csv_dir`, in sorted order.
/// Missing files and per-file failures are reported, not raised.
pub fn convert_all(
    csv_dir: &Path,
    bronze_dir: &Path,
    stems: &[String],
    options: &BronzeOptions,
) -> BronzeConversionReport {
    let mut ordered: Vec<&String> = stems.iter().collect();
    ordered.sort();

    let mut report = BronzeConversionReport::default();
    for stem in ordered {
        let csv_path = csv_dir.join(format!("{}.csv", stem));
        if !csv_path.exists() {
            warn!(file = %csv_path.display(), "csv not found; skipped");
            report.missing.push(stem.clone());
            continue;
        }
        match convert_csv_to_parquet(&csv_path, bronze_dir, options) {
            Ok(file_report) => report.converted.push(file_report),
            Err(err) => {
                warn!(file = %csv_path.display(), error = %format!("{:#}", err), "bronze conversion failed");
                report.failed.push((stem.clone(), format!("{:#}", err)));
            }
        }
    }
    info!(
        converted = report.converted.len(),
        missing = report.missing.len(),
        failed = report.failed.len(),
        rows = report.total_rows(),
        "bronze conversion finished"
    );
    report
}

pub fn parquet_info(path: &Path) -> Result<ParquetInfo> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("read parquet metadata of {}", path.display()))?;
    let metadata = builder.metadata();
    Ok(ParquetInfo {
        path: path.to_path_buf(),
        rows: metadata.file_metadata().num_rows().max(0) as u64,
        row_groups: metadata.num_row_groups(),
        columns: builder
            .schema()
            .fields()
            .iter()
            .map(|field| field.name().clone())
            .collect(),
        size_bytes: file_size(path),
        created_by: metadata.file_metadata().created_by().map(str::to_string),
    })
}

/// Checks that every expected bronze file exists and its metadata is readable.
pub fn verify_layer(bronze_dir: &Path, stems: &[String]) -> LayerVerification {
    let checks = stems
        .iter()
        .map(|stem| {
            let path = bronze_dir.join(format!("{}.parquet", stem));
            let (info, error) = if !path.exists() {
                (None, Some("file not found".to_string()))
            } else {
                match parquet_info(&path) {
                    Ok(info) => (Some(info), None),
                    Err(err) => (None, Some(format!("{:#}", err))),
                }
            };
            LayerCheck {
                stem: stem.clone(),
                path,
                info,
                error,
            }
        })
        .collect();
    LayerVerification { checks }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use deltalake::arrow::array::{Array, Float64Array, StringArray};
    use deltalake::parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

    use super::{convert_all, convert_csv_to_parquet, verify_layer, BronzeOptions};
    use crate::arrow_utils::get_array;
    use crate::error::StagingError;

    fn write_csv(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).expect("write csv");
        path
    }

    fn options(batch_size: usize) -> BronzeOptions {
        BronzeOptions {
            batch_size,
            ..BronzeOptions::default()
        }
    }

    #[test]
    fn converts_in_chunks_and_coerces_price() {
        let dir = tempfile::tempdir().expect("tempdir");
        let csv = write_csv(
            dir.path(),
            "2012-1.csv",
            "timestamp,price,user_id\n\
             2012-01-01,10.5,u1\n\
             2012-01-02,,u2\n\
             2012-01-03,oops,u3\n\
             2012-01-04,20,u4\n\
             2012-01-05,7.25,\n",
        );
        let bronze = dir.path().join("bronze");
        let report = convert_csv_to_parquet(&csv, &bronze, &options(2)).expect("convert");
        assert_eq!(report.rows, 5);
        assert_eq!(report.chunks, 3);
        assert!(report.parquet_path.ends_with("2012-1.parquet"));

        let file = std::fs::File::open(&report.parquet_path).expect("open");
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .expect("builder")
            .with_batch_size(100)
            .build()
            .expect("reader");
        let batches: Vec<_> = reader.collect::<Result<_, _>>().expect("batches");
        assert_eq!(batches.len(), 1);
        let batch = &batches[0];
        let price = get_array::<Float64Array>(batch, "price").expect("price");
        assert_eq!(price.value(0), 10.5);
        assert!(price.is_null(1));
        assert!(price.is_null(2));
        assert_eq!(price.value(3), 20.0);
        let source = get_array::<StringArray>(batch, "source_file").expect("source");
        assert_eq!(source.value(4), "2012-1.csv");
        assert!(batch.schema().index_of("bronze_created_at").is_ok());
        assert!(batch.schema().index_of("bronze_created_by").is_ok());
    }

    #[test]
    fn missing_required_column_is_schema_mismatch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let csv = write_csv(dir.path(), "bad.csv", "timestamp,amount,user_id\n2012-01-01,1,u\n");
        let err = convert_csv_to_parquet(&csv, dir.path(), &options(10)).unwrap_err();
        match err.downcast_ref::<StagingError>() {
            Some(StagingError::SchemaMismatch { missing, .. }) => {
                assert_eq!(missing, &vec!["price".to_string()]);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!dir.path().join("bad.parquet").exists());
    }

    #[test]
    fn convert_all_reports_missing_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_csv(dir.path(), "2012-2.csv", "timestamp,price,user_id\nt,1.0,u\n");
        write_csv(dir.path(), "2012-1.csv", "timestamp,price,user_id\nt,2.0,u\nt,3.0,u\n");
        let bronze = dir.path().join("bronze");
        let stems: Vec<String> = ["2012-2", "2012-1", "validation"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let report = convert_all(dir.path(), &bronze, &stems, &options(10));
        assert!(!report.success());
        assert_eq!(report.missing, vec!["validation".to_string()]);
        let converted: Vec<&str> = report.converted.iter().map(|r| r.stem.as_str()).collect();
        assert_eq!(converted, vec!["2012-1", "2012-2"]);
        assert_eq!(report.total_rows(), 3);

        let layer = verify_layer(&bronze, &stems);
        assert!(!layer.valid());
        assert_eq!(layer.total_rows(), 3);
        let absent = layer.checks.iter().find(|c| c.stem == "validation").expect("check");
        assert!(absent.error.is_some());
    }
}
