use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tubebroker::*;

/// Executor double that records every call and answers with a fixed exit
/// status after an optional delay.
///
/// A delay running past the deadline produces a timed-out result without an
/// exit status, like a process that had to be killed.
#[derive(Clone)]
pub struct MockExecutor {
    calls: Arc<Mutex<Vec<ExecutionRecord>>>,
    exit_status: Arc<Mutex<i32>>,
    delay: Duration,
}

#[derive(Clone, Debug)]
pub struct ExecutionRecord {
    pub job_id: JobId,
    pub working_dir: PathBuf,
    pub body: Vec<u8>,
    /// Time between the call and its deadline.
    pub budget: Duration,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::exiting(0)
    }

    pub fn exiting(exit_status: i32) -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            exit_status: Arc::new(Mutex::new(exit_status)),
            delay: Duration::ZERO,
        }
    }

    /// Take `delay` for every job.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_exit_status(&self, exit_status: i32) {
        *self.exit_status.lock() = exit_status;
    }

    pub fn record(&self) -> Vec<ExecutionRecord> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn assert_call_count_eq(&self, expected: usize) {
        let actual = self.call_count();
        assert_eq!(actual, expected, "Expected {expected} executions, got {actual}");
    }
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobExecutor for MockExecutor {
    async fn execute(&self, job: &Job, working_dir: &Path, deadline: Instant) -> JobResult {
        let started = Instant::now();
        self.calls.lock().push(ExecutionRecord {
            job_id: job.id,
            working_dir: working_dir.to_path_buf(),
            body: job.body.clone(),
            budget: deadline.saturating_duration_since(started),
        });

        let finish = started + self.delay;
        let timed_out = finish > deadline;
        tokio::time::sleep_until(finish.min(deadline)).await;

        JobResult {
            job_id: job.id,
            executed: true,
            exit_status: if timed_out {
                None
            } else {
                Some(*self.exit_status.lock())
            },
            timed_out,
            elapsed: started.elapsed(),
            ..Default::default()
        }
    }
}
