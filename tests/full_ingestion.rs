use std::path::Path;

use anyhow::Result;
use tempfile::tempdir;

use bronze_ingest::ops::{convert_to_bronze, run_full_ingestion, status_report};
use bronze_ingest::orchestrator::CHECKPOINT_PRIMARY;
use bronze_ingest::{IncrementalStatsEngine, PipelineConfig, RunState, SqliteStore, StoreGateway};

fn write_csv(dir: &Path, stem: &str, prices: &[&str]) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let mut body = String::from("timestamp,price,user_id\n");
    for (i, price) in prices.iter().enumerate() {
        body.push_str(&format!("2012-01-{:02} 10:00:00,{},user{}\n", i + 1, price, i % 3));
    }
    std::fs::write(dir.join(format!("{}.csv", stem)), body)?;
    Ok(())
}

fn staged_config(root: &Path) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::default().with_data_dir(root);
    config.primary_stems = vec!["2012-1".to_string(), "2012-2".to_string()];
    config.late_stem = "validation".to_string();
    config.batch_size = 2;

    // Raw files sit in an extracted subdirectory, as after unpacking an archive.
    let extracted = config.raw_dir.join("challenge");
    write_csv(&extracted, "2012-1", &["10", "20", "", "30"])?;
    write_csv(&extracted, "2012-2", &["40", "-3", "50", "NaN"])?;
    write_csv(&extracted, "validation", &["5", "60"])?;

    let bronze = convert_to_bronze(&config)?;
    assert!(bronze.success(), "bronze conversion failed: {:?}", bronze.failed);
    assert_eq!(bronze.total_rows(), 10);
    Ok(config)
}

#[test]
fn bronze_to_store_with_late_file_and_verification() -> Result<()> {
    let dir = tempdir()?;
    let config = staged_config(dir.path())?;

    let result = run_full_ingestion(&config)?;
    assert!(result.overall_success, "run failed: {:?}", result.failure);
    assert_eq!(result.state, RunState::Completed);
    assert_eq!(result.total_rows_processed, 7);
    assert_eq!(result.total_rows_filtered, 3);
    assert_eq!(result.per_file.len(), 3);

    let primary = result.primary_verification.as_ref().expect("primary checkpoint");
    assert!(primary.overall_match);

    let late = result.late_file.as_ref().expect("late file report");
    assert_eq!(late.before.count, 5);
    assert!((late.before.average - 30.0).abs() < 1e-12);
    assert_eq!(late.delta.rows_added, 2);
    assert!(late.delta.new_min);
    assert!(late.delta.new_max);

    assert_eq!(result.final_stats.count, 7);
    assert_eq!(result.final_stats.min, Some(5.0));
    assert_eq!(result.final_stats.max, Some(60.0));
    assert!((result.final_stats.sum - 215.0).abs() < 1e-9);
    assert!(result.verification_result.as_ref().expect("final").overall_match);

    let store = SqliteStore::open(&config.database_path)?;
    let aggregate = store.get_aggregate_stats()?;
    assert_eq!(aggregate.count, 7);
    assert!((aggregate.average - 215.0 / 7.0).abs() < 1e-9);
    let summary = store.get_batch_summary()?;
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.completed, summary.total_batches);
    let audits = store.list_verifications(10)?;
    assert_eq!(audits.len(), 2);
    assert!(audits.iter().any(|audit| audit.checkpoint == CHECKPOINT_PRIMARY));

    let status = status_report(&config)?;
    assert!(status.consistency.expect("three sources").overall_consistent);
    Ok(())
}

#[test]
fn persisted_statistics_survive_a_second_run() -> Result<()> {
    let dir = tempdir()?;
    let config = staged_config(dir.path())?;

    assert!(run_full_ingestion(&config)?.overall_success);
    let restored = IncrementalStatsEngine::with_persistence(&config.statistics_path);
    assert_eq!(restored.get_current_stats().count, 7);
    drop(restored);

    // Both the store and the restored engine now hold every row twice.
    let second = run_full_ingestion(&config)?;
    assert!(second.overall_success, "second run failed: {:?}", second.failure);
    assert_eq!(second.final_stats.count, 14);
    assert!((second.final_stats.sum - 430.0).abs() < 1e-9);

    let store = SqliteStore::open(&config.database_path)?;
    assert_eq!(store.get_aggregate_stats()?.count, 14);
    Ok(())
}

#[test]
fn in_memory_engine_diverges_from_existing_store() -> Result<()> {
    let dir = tempdir()?;
    let mut config = staged_config(dir.path())?;
    config.enable_statistics_persistence = false;

    assert!(run_full_ingestion(&config)?.overall_success);
    assert!(!config.statistics_path.exists());

    let second = run_full_ingestion(&config)?;
    assert!(!second.overall_success);
    assert_eq!(second.state, RunState::Failed);
    let primary = second.primary_verification.as_ref().expect("primary checkpoint");
    assert!(!primary.overall_match);
    assert!(second.late_file.is_none());
    let failure = second.failure.as_ref().expect("failure");
    assert_eq!(failure.stage, RunState::Verifying);
    assert!(failure.message.contains(CHECKPOINT_PRIMARY));
    Ok(())
}

#[test]
fn excluded_late_file_is_never_read() -> Result<()> {
    let dir = tempdir()?;
    let mut config = staged_config(dir.path())?;
    config.exclude_late_file = true;

    let result = run_full_ingestion(&config)?;
    assert!(result.overall_success);
    assert!(result.late_file.is_none());
    assert!(result.primary_verification.is_none());
    assert_eq!(result.final_stats.count, 5);
    assert_eq!(result.final_stats.max, Some(50.0));
    Ok(())
}
