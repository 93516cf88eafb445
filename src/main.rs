//! `bronze-ingest` command line.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bronze_ingest::ops::{self, StatusReport};
use bronze_ingest::orchestrator::RunResult;
use bronze_ingest::PipelineConfig;

#[derive(Parser, Debug)]
#[command(name = "bronze-ingest")]
#[command(about = "Stage CSV measurements as Parquet and ingest them with verified running statistics")]
struct Cli {
    /// TOML config file; defaults apply to anything it leaves out
    #[arg(long, global = true, env = "BRONZE_INGEST_CONFIG")]
    config: Option<PathBuf>,

    /// Re-root raw, bronze, database and statistics paths under this directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[arg(long, global = true)]
    batch_size: Option<usize>,

    /// Keep the running statistics in memory only
    #[arg(long, global = true)]
    no_persist_stats: bool,

    /// Skip the late-arriving file
    #[arg(long, global = true)]
    exclude_late_file: bool,

    /// Print reports as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert raw CSV files into bronze Parquet files
    Convert,
    /// Ingest the bronze files into the store
    Ingest,
    /// Locate raw files, convert them and ingest
    Run,
    /// Show engine, store and bronze statistics
    Status,
    /// Cross-check engine, store and bronze statistics
    Verify,
    /// Delete the database and persisted statistics
    Reset {
        #[arg(long)]
        yes: bool,
    },
}

impl Cli {
    fn pipeline_config(&self) -> Result<PipelineConfig> {
        let mut config = PipelineConfig::load(self.config.as_deref())?;
        if let Some(dir) = &self.data_dir {
            config = config.with_data_dir(dir);
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if self.no_persist_stats {
            config.enable_statistics_persistence = false;
        }
        if self.exclude_late_file {
            config.exclude_late_file = true;
        }
        config.validate()?;
        Ok(config)
    }
}

fn emit<T: Serialize>(json: bool, report: &T, human: impl FnOnce()) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        human();
    }
    Ok(())
}

fn print_run(result: &RunResult) {
    println!("state: {}", result.state);
    for file in &result.per_file {
        println!(
            "  {}: batches={} rows={} filtered={}{}",
            file.source_file,
            file.batches_processed,
            file.rows_processed,
            file.rows_filtered,
            file.error.as_deref().map(|e| format!(" error={}", e)).unwrap_or_default()
        );
    }
    if let Some(late) = &result.late_file {
        println!(
            "late file: avg {:.4} -> {:.4} (+{} rows)",
            late.delta.average_before, late.delta.average_after, late.delta.rows_added
        );
    }
    println!("final: {}", result.final_stats);
    if let Some(verification) = &result.verification_result {
        println!("verification: {}", if verification.overall_match { "match" } else { "MISMATCH" });
    }
    if let Some(failure) = &result.failure {
        println!("failure: {}", failure);
    }
}

fn print_status(status: &StatusReport) {
    match &status.engine {
        Some(snapshot) => println!("engine: {}", snapshot),
        None => println!("engine: no persisted statistics"),
    }
    match &status.store {
        Some(store) => println!(
            "store: count={} avg={:.2} min={:.2} max={:.2}",
            store.count, store.average, store.min, store.max
        ),
        None => println!("store: no database"),
    }
    if let Some(summary) = &status.batch_summary {
        println!(
            "batches: total={} completed={} failed={} success_rate={:.1}%",
            summary.total_batches, summary.completed, summary.failed, summary.success_rate
        );
    }
    if let Some(profile) = &status.bronze_profile {
        println!("bronze: count={} avg={:.2}", profile.count, profile.average);
    }
    for record in &status.recent_verifications {
        println!(
            "  verification {} at {}: {}",
            record.checkpoint,
            record.verified_at,
            if record.overall_match { "match" } else { "mismatch" }
        );
    }
    if let Some(consistency) = &status.consistency {
        println!(
            "consistency vs {}: {}",
            consistency.reference_source,
            if consistency.overall_consistent { "consistent" } else { "INCONSISTENT" }
        );
    }
}

fn main() -> Result<ExitCode> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("bronze_ingest=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.pipeline_config()?;

    let ok = match &cli.command {
        Command::Convert => {
            let report = ops::convert_to_bronze(&config)?;
            emit(cli.json, &report, || {
                for file in &report.converted {
                    println!(
                        "{}: rows={} chunks={} ratio={:.2}",
                        file.stem, file.rows, file.chunks, file.compression_ratio
                    );
                }
                for stem in &report.missing {
                    println!("{}: missing", stem);
                }
                for (stem, error) in &report.failed {
                    println!("{}: failed: {}", stem, error);
                }
            })?;
            report.success()
        }
        Command::Ingest => {
            let result = ops::run_full_ingestion(&config)?;
            emit(cli.json, &result, || print_run(&result))?;
            result.overall_success
        }
        Command::Run => {
            let report = ops::run_pipeline(&config)?;
            emit(cli.json, &report, || {
                if let Some(path) = &report.acquisition.path {
                    println!("raw files: {}", path.display());
                }
                if !report.acquisition.missing.is_empty() {
                    println!("missing raw files: {}", report.acquisition.missing.join(", "));
                }
                if let Some(bronze) = &report.bronze {
                    println!("bronze: {} files, {} rows", bronze.converted.len(), bronze.total_rows());
                }
                if let Some(result) = &report.ingestion {
                    print_run(result);
                }
            })?;
            report.success
        }
        Command::Status => {
            let status = ops::status_report(&config)?;
            emit(cli.json, &status, || print_status(&status))?;
            true
        }
        Command::Verify => {
            let status = ops::status_report(&config)?;
            emit(cli.json, &status, || print_status(&status))?;
            status
                .consistency
                .as_ref()
                .map_or(false, |consistency| consistency.overall_consistent)
        }
        Command::Reset { yes } => {
            if !yes {
                eprintln!("refusing to reset without --yes");
                return Ok(ExitCode::FAILURE);
            }
            let removed = ops::reset_state(&config)?;
            emit(cli.json, &removed, || {
                if removed.is_empty() {
                    println!("nothing to remove");
                }
                for path in &removed {
                    println!("removed {}", path.display());
                }
            })?;
            true
        }
    };

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
