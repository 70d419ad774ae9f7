//! Tracing spans and structured events for the job lifecycle.
//!
//! Every helper logs through `tracing` and, with the `metrics` feature,
//! updates the matching Prometheus series. Without the feature the metric
//! side is a no-op.
//!
//! # Example
//!
//! ```ignore
//! use tracing::Instrument;
//! use tubebroker::telemetry::{job_span, record_job_resolved};
//!
//! async { /* reserve, execute, resolve */ }
//!     .instrument(job_span("emails", job.id))
//!     .await;
//! record_job_resolved("emails", "deleted");
//! ```

use std::time::{Duration, Instant};

use tracing::{info_span, Span};

use crate::job::JobId;

/// Span wrapping the whole life of one worker.
#[must_use]
pub fn worker_span(tube: &str, slot: usize) -> Span {
    info_span!("tubebroker.worker", tube = %tube, slot = slot)
}

/// Span wrapping one attempt at a reserved job.
#[must_use]
pub fn job_span(tube: &str, job_id: JobId) -> Span {
    info_span!("tubebroker.job", tube = %tube, job_id = %job_id)
}

/// Span wrapping the all-tubes discovery loop.
#[must_use]
pub fn discovery_span() -> Span {
    info_span!("tubebroker.discovery")
}

/// A job was handed to this worker by the queue server.
pub fn record_job_reserved(tube: &str, job_id: JobId, body_len: usize) {
    tracing::info!(tube = %tube, job_id = %job_id, body_len, "job reserved");

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_reserved(tube);
}

/// A job attempt reached its final outcome.
///
/// `outcome` is a [`crate::lifecycle::Disposition`] label, `unroutable`, or
/// `failed` when the queue call applying the disposition did not go through.
pub fn record_job_resolved(tube: &str, outcome: &str) {
    tracing::info!(tube = %tube, outcome = %outcome, "job resolved");

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_resolved(tube, outcome);
}

/// An executor was still running at its deadline.
pub fn record_executor_timeout(tube: &str, job_id: JobId, elapsed: Duration) {
    tracing::warn!(
        tube = %tube,
        job_id = %job_id,
        elapsed_ms = elapsed.as_millis() as u64,
        "executor timed out"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_executor_timeout(tube);
}

/// Start timing an execution. Pass the handle to [`record_job_end`].
pub fn record_job_start(job_id: JobId) -> JobTimingHandle {
    JobTimingHandle {
        job_id,
        start: Instant::now(),
    }
}

/// Finish timing an execution and observe its duration.
pub fn record_job_end(handle: JobTimingHandle, tube: &str, outcome: &str) {
    let duration_secs = handle.elapsed().as_secs_f64();
    tracing::debug!(
        tube = %tube,
        job_id = %handle.job_id,
        outcome = %outcome,
        duration_secs,
        "job duration observed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_job_duration(tube, outcome, duration_secs);
}

/// Opaque timer returned by [`record_job_start`].
#[derive(Debug)]
pub struct JobTimingHandle {
    job_id: JobId,
    start: Instant,
}

impl JobTimingHandle {
    #[must_use]
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
