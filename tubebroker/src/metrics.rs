//! Prometheus metrics for tubebroker.
//!
//! Compiled only with the `metrics` feature.
//!
//! # Metrics
//!
//! ## Counters
//! - `tubebroker_jobs_reserved_total` - Jobs reserved, per tube
//! - `tubebroker_jobs_resolved_total` - Job attempts by outcome, per tube
//! - `tubebroker_executor_timeouts_total` - Executors stopped at their deadline
//!
//! ## Histograms
//! - `tubebroker_job_duration_seconds` - Time spent in the executor
#![cfg(feature = "metrics")]

use prometheus::{exponential_buckets, CounterVec, HistogramVec, Opts, Registry};
use std::sync::LazyLock;

/// Global Prometheus registry for tubebroker metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Labels: `tube`.
pub static JOBS_RESERVED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("tubebroker_jobs_reserved_total", "Total number of jobs reserved");
    CounterVec::new(opts, &["tube"]).expect("tubebroker_jobs_reserved_total metric creation failed")
});

/// Labels: `tube`, `outcome` (deleted, released, abandoned, left, unroutable, failed).
pub static JOBS_RESOLVED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "tubebroker_jobs_resolved_total",
        "Total number of job attempts by outcome",
    );
    CounterVec::new(opts, &["tube", "outcome"])
        .expect("tubebroker_jobs_resolved_total metric creation failed")
});

/// Labels: `tube`.
pub static EXECUTOR_TIMEOUTS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "tubebroker_executor_timeouts_total",
        "Total number of executors terminated at their deadline",
    );
    CounterVec::new(opts, &["tube"])
        .expect("tubebroker_executor_timeouts_total metric creation failed")
});

/// Labels: `tube`, `outcome`.
pub static JOB_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.01, 2.0, 16).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "tubebroker_job_duration_seconds",
        "Executor wall-clock duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["tube", "outcome"])
        .expect("tubebroker_job_duration_seconds metric creation failed")
});

/// Register every metric with [`REGISTRY`]. Safe to call more than once.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(JOBS_RESERVED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(JOBS_RESOLVED_TOTAL.clone()),
        Box::new(EXECUTOR_TIMEOUTS_TOTAL.clone()),
        Box::new(JOB_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            if !matches!(e, prometheus::Error::AlreadyReg) {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_job_reserved(tube: &str) {
    JOBS_RESERVED_TOTAL.with_label_values(&[tube]).inc();
}

pub fn record_job_resolved(tube: &str, outcome: &str) {
    JOBS_RESOLVED_TOTAL.with_label_values(&[tube, outcome]).inc();
}

pub fn record_executor_timeout(tube: &str) {
    EXECUTOR_TIMEOUTS_TOTAL.with_label_values(&[tube]).inc();
}

pub fn observe_job_duration(tube: &str, outcome: &str, duration_secs: f64) {
    JOB_DURATION_SECONDS
        .with_label_values(&[tube, outcome])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
