//! Decides what happens to a reserved job.
//!
//! The policy is pure: it looks at the retry counters the queue server keeps
//! for a job and, after execution, at the [`JobResult`], and answers with a
//! [`Disposition`]. Issuing the matching queue call is the worker's job.

use std::time::Duration;

use crate::job::{JobHistory, JobResult};

/// Timeouts a job may accumulate before it is abandoned. Any lapse counts.
pub const TIMEOUT_TRIES: u64 = 1;

/// Releases a job may accumulate before it is abandoned.
pub const RELEASE_TRIES: u64 = 10;

/// What to do with a reserved job.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Disposition {
    /// The executor succeeded; remove the job.
    Delete,
    /// The executor failed; release the job with a backoff delay.
    Release(Duration),
    /// The job's history is exhausted; release it with the requeue delay
    /// without running it. Stands in for a bury.
    Abandon(Duration),
    /// Leave the reservation alone and let the server's own TTR handling
    /// redeliver the job.
    Leave,
}

impl Disposition {
    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Delete => "deleted",
            Disposition::Release(_) => "released",
            Disposition::Abandon(_) => "abandoned",
            Disposition::Leave => "left",
        }
    }
}

/// Why a job was abandoned before execution.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AbandonReason {
    TimedOut { timeouts: u64 },
    Released { releases: u64 },
}

/// Release counter as read after execution.
///
/// A failed lookup is an explicit variant so the fallback is never silent.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReleaseCount {
    Known(u64),
    Unavailable,
}

impl<E> From<Result<u64, E>> for ReleaseCount {
    fn from(value: Result<u64, E>) -> Self {
        match value {
            Ok(count) => ReleaseCount::Known(count),
            Err(_) => ReleaseCount::Unavailable,
        }
    }
}

/// Thresholds and delays for the job lifecycle.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub timeout_tries: u64,
    pub release_tries: u64,
    pub requeue_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout_tries: TIMEOUT_TRIES,
            release_tries: RELEASE_TRIES,
            requeue_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(requeue_delay: Duration) -> Self {
        Self {
            requeue_delay,
            ..Default::default()
        }
    }

    /// Check a job's history before running it.
    ///
    /// Returns the reason to abandon, or `None` when the job should run.
    pub fn check_history(&self, history: &JobHistory) -> Option<AbandonReason> {
        if history.timeouts >= self.timeout_tries {
            return Some(AbandonReason::TimedOut {
                timeouts: history.timeouts,
            });
        }
        if history.releases >= self.release_tries {
            return Some(AbandonReason::Released {
                releases: history.releases,
            });
        }
        None
    }

    /// Disposition for a job before execution: `Abandon` or `None`.
    pub fn before_execution(&self, history: &JobHistory) -> Option<Disposition> {
        self.check_history(history)
            .map(|_| Disposition::Abandon(self.requeue_delay))
    }

    /// Disposition for a job that went through the executor.
    ///
    /// A timed-out execution is left to the server: its timeout counter will
    /// grow on the next reservation and [`RetryPolicy::before_execution`]
    /// abandons it then.
    pub fn after_execution(&self, result: &JobResult, releases: ReleaseCount) -> Disposition {
        if result.timed_out {
            return Disposition::Leave;
        }
        if result.exit_status == Some(0) {
            return Disposition::Delete;
        }
        let base = match releases {
            ReleaseCount::Known(count) => count,
            ReleaseCount::Unavailable => self.release_tries,
        };
        Disposition::Release(release_delay(base))
    }

    /// Full decision for one attempt. `result` is `None` before execution.
    pub fn decide(
        &self,
        history: &JobHistory,
        result: Option<&JobResult>,
        releases: ReleaseCount,
    ) -> Option<Disposition> {
        match result {
            None => self.before_execution(history),
            Some(result) => Some(self.after_execution(result, releases)),
        }
    }
}

/// Backoff before a failed job becomes visible again: `releases^4` seconds.
///
/// The last permitted retry (9 releases) waits 1h49m21s, the whole run of
/// retries 4h15m33s.
pub fn release_delay(releases: u64) -> Duration {
    Duration::from_secs(releases.saturating_pow(4))
}
