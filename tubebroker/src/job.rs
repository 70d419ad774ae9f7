use std::fmt::Display;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::runtime::supervisor::ExecutionError;

/// Job identifier assigned by the queue server on reservation.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
pub struct JobId(pub u64);

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for JobId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// A job reserved from a tube.
///
/// The body is opaque apart from the routing key extracted by
/// [`crate::payload::extract_routing_key`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Job {
    pub id: JobId,
    pub body: Vec<u8>,
}

impl Job {
    pub fn new(id: impl Into<JobId>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            body: body.into(),
        }
    }
}

/// Retry bookkeeping reported by the queue server for one job.
///
/// Both counters only ever grow over the job's lifetime.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobHistory {
    /// Times the job's reservation expired without being resolved.
    pub timeouts: u64,
    /// Times the job was explicitly released back to its tube.
    pub releases: u64,
}

impl JobHistory {
    pub fn new(timeouts: u64, releases: u64) -> Self {
        Self { timeouts, releases }
    }
}

/// Outcome of one attempt at a job. Built once and never mutated afterwards.
#[derive(Debug, Default)]
pub struct JobResult {
    /// Job the attempt belongs to.
    pub job_id: JobId,
    /// The job was re-queued without running because its history was exhausted.
    pub buried: bool,
    /// The executor was started (or its start was attempted).
    pub executed: bool,
    /// Exit status of the executor; `None` if it never produced one.
    pub exit_status: Option<i32>,
    /// Everything the executor wrote to standard output.
    pub stdout: Vec<u8>,
    /// The execution deadline fired before the executor finished.
    pub timed_out: bool,
    /// Wall-clock time spent in the executor.
    pub elapsed: Duration,
    /// Infrastructure failure while handling the job.
    ///
    /// A non-zero exit status alone is never an error.
    pub error: Option<AttemptError>,
}

impl JobResult {
    /// Result for a job re-queued before execution.
    pub fn buried(job_id: JobId) -> Self {
        Self {
            job_id,
            buried: true,
            ..Default::default()
        }
    }

    /// Result for a job whose body could not be routed to a working directory.
    pub fn unroutable(job_id: JobId, error: crate::payload::PayloadError) -> Self {
        Self {
            job_id,
            error: Some(AttemptError::Payload(error)),
            ..Default::default()
        }
    }

    /// Whether the executor ran to a zero exit status within its deadline.
    pub fn succeeded(&self) -> bool {
        self.executed && !self.timed_out && self.exit_status == Some(0)
    }

    /// Lossy UTF-8 view of the captured output.
    pub fn stdout_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }
}

/// Why an attempt failed for reasons other than the executor's exit status.
#[derive(Debug, thiserror::Error)]
pub enum AttemptError {
    #[error("unroutable job body: {0}")]
    Payload(#[from] crate::payload::PayloadError),
    #[error("executor failure: {0}")]
    Execution(#[from] ExecutionError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::PayloadError;

    #[test]
    fn test_job_id_display() {
        assert_eq!(JobId(42).to_string(), "42");
    }

    #[test]
    fn test_buried_result_is_not_executed() {
        let result = JobResult::buried(JobId(7));
        assert!(result.buried);
        assert!(!result.executed);
        assert!(!result.succeeded());
        assert!(result.error.is_none());
    }

    #[test]
    fn test_succeeded_requires_zero_exit_within_deadline() {
        let ok = JobResult {
            executed: true,
            exit_status: Some(0),
            ..Default::default()
        };
        assert!(ok.succeeded());

        let timed_out = JobResult {
            executed: true,
            exit_status: Some(0),
            timed_out: true,
            ..Default::default()
        };
        assert!(!timed_out.succeeded());

        let failed = JobResult {
            executed: true,
            exit_status: Some(3),
            ..Default::default()
        };
        assert!(!failed.succeeded());
    }

    #[test]
    fn test_unroutable_result_carries_payload_error() {
        let result = JobResult::unroutable(JobId(1), PayloadError::MissingDomain);
        assert!(!result.executed);
        assert!(matches!(
            result.error,
            Some(AttemptError::Payload(PayloadError::MissingDomain))
        ));
    }
}
