use std::time::Instant;

use bronze_ingest::{BatchContext, IncrementalStatsEngine};

fn build_prices(count: usize) -> Vec<f64> {
    (0..count)
        .map(|i| 1.0 + (i % 10_000) as f64 * 0.01 + (i % 7) as f64 * 1e-3)
        .collect()
}

#[test]
#[ignore]
fn perf_engine_update_batches() {
    let prices = build_prices(5_000_000);
    let batch_size = 1_000;
    let mut engine = IncrementalStatsEngine::new();

    let start = Instant::now();
    for (i, chunk) in prices.chunks(batch_size).enumerate() {
        engine.update_batch(
            chunk,
            BatchContext {
                source_file: "perf.parquet".to_string(),
                sequence_number: i as u64 + 1,
                batch_id: None,
            },
        );
    }
    let elapsed = start.elapsed();

    assert_eq!(engine.get_current_stats().count, prices.len() as u64);
    let mvps = prices.len() as f64 / elapsed.as_secs_f64() / 1_000_000.0;
    eprintln!(
        "perf_engine_update_batches: {} values in {:?} -> {:.3} M values/s",
        prices.len(),
        elapsed,
        mvps
    );

    if let Ok(min_mvps) = std::env::var("BRONZE_INGEST_PERF_MIN_MVPS") {
        let min: f64 = min_mvps
            .parse()
            .expect("BRONZE_INGEST_PERF_MIN_MVPS must be a float");
        assert!(
            mvps >= min,
            "engine update performance below threshold: {:.3} < {:.3} M values/s",
            mvps,
            min
        );
    }
}
