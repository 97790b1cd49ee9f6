//! Prometheus metrics for the KV state machine.
//!
//! Only in-process registration lives here; scraping and export belong to
//! the embedding process.

use prometheus::HistogramOpts;
use prometheus::HistogramVec;
use prometheus::IntCounterVec;
use prometheus::Opts;
use prometheus::Registry;

/// Batch sizes cluster around the write-batch chunk limit.
const BATCH_SIZE_BUCKETS: &[f64] = &[
    1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0, 256.0, 512.0, 1024.0,
];

/// Apply-path metrics, labeled by region and operation kind.
pub struct KVMetrics {
    registry: Registry,
    /// Applied operations, by region and operation name.
    pub apply_total: IntCounterVec,
    /// Size of each batch handed to the engine, by region.
    pub batch_write_size: HistogramVec,
}

impl Default for KVMetrics {
    fn default() -> Self {
        KVMetrics::new()
    }
}

impl KVMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let apply_total = IntCounterVec::new(
            Opts::new(
                "rockskv_state_machine_apply_total",
                "Operations applied to the state machine",
            ),
            &["region", "op"],
        )
        .expect("metric creation should not fail");

        let batch_write_size = HistogramVec::new(
            HistogramOpts::new(
                "rockskv_state_machine_batch_write_size",
                "Number of operations per engine batch",
            )
            .buckets(BATCH_SIZE_BUCKETS.to_vec()),
            &["region"],
        )
        .expect("metric creation should not fail");

        registry
            .register(Box::new(apply_total.clone()))
            .expect("metric registration should not fail");
        registry
            .register(Box::new(batch_write_size.clone()))
            .expect("metric registration should not fail");

        KVMetrics {
            registry,
            apply_total,
            batch_write_size,
        }
    }

    /// The registry backing these metrics, for embedding into an exporter.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_apply(&self, region: &str, op: &str, count: u64) {
        self.apply_total.with_label_values(&[region, op]).inc_by(count);
    }

    pub fn record_batch(&self, region: &str, size: usize) {
        self.batch_write_size
            .with_label_values(&[region])
            .observe(size as f64);
    }
}
