use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::config::BrokerConfig;
use crate::job::{Job, JobId, JobResult};
use crate::lifecycle::{Disposition, ReleaseCount, RetryPolicy};
use crate::payload::WorkdirLayout;
use crate::queue::{reserve_job, QueueConnection, QueueError};
use crate::runtime::supervisor::{supervise, JobExecutor};
use crate::telemetry;

/// Settings shared by every worker of a dispatcher.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Timeout of a single reserve call.
    #[serde(with = "crate::config::humantime_serde")]
    pub reserve_timeout: Duration,
    /// Added to the reported time-left when arming the execution deadline.
    #[serde(with = "crate::config::humantime_serde")]
    pub ttr_margin: Duration,
    /// Delay used when an exhausted job is re-queued without running.
    #[serde(with = "crate::config::humantime_serde")]
    pub requeue_delay: Duration,
}

impl WorkerConfig {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            reserve_timeout: config.reserve_timeout,
            ttr_margin: config.ttr_margin,
            requeue_delay: config.requeue_delay,
        }
    }

    /// Set the reserve timeout.
    pub fn with_reserve_timeout(mut self, timeout: Duration) -> Self {
        self.reserve_timeout = timeout;
        self
    }

    /// Set the deadline margin.
    pub fn with_ttr_margin(mut self, margin: Duration) -> Self {
        self.ttr_margin = margin;
        self
    }

    /// Set the requeue delay.
    pub fn with_requeue_delay(mut self, delay: Duration) -> Self {
        self.requeue_delay = delay;
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.requeue_delay)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from_config(&BrokerConfig::default())
    }
}

/// Receiving end of a worker's pacing channel.
///
/// One token is consumed per reservation. Once the sending side is gone the
/// worker stops before its next reservation; an iteration already under way
/// is never interrupted.
#[derive(Debug)]
pub struct Pacer {
    rx: mpsc::Receiver<()>,
}

impl Pacer {
    /// A pacing channel holding at most one pending token.
    pub fn channel() -> (mpsc::Sender<()>, Pacer) {
        let (tx, rx) = mpsc::channel(1);
        (tx, Pacer { rx })
    }

    /// Wait for the next token. `false` once the channel is closed.
    pub async fn next(&mut self) -> bool {
        if self.rx.is_closed() {
            return false;
        }
        self.rx.recv().await.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.rx.is_closed()
    }
}

/// Where a worker is in its loop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WorkerState {
    Idle,
    Reserving,
    Deciding,
    Executing,
    Resolving,
    Stopped,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Reserving => "reserving",
            WorkerState::Deciding => "deciding",
            WorkerState::Executing => "executing",
            WorkerState::Resolving => "resolving",
            WorkerState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a worker stopped.
#[derive(Debug, thiserror::Error)]
pub enum WorkerExit {
    /// The pacing channel was closed.
    #[error("pacing channel closed")]
    Paced,
    #[error("failed to connect: {0}")]
    Connect(#[source] QueueError),
    #[error("failed to watch tube: {0}")]
    Watch(#[source] QueueError),
    #[error("reserve failed: {0}")]
    Reserve(#[source] QueueError),
    #[error("connection lost while handling job {job_id}: {source}")]
    Connection {
        job_id: JobId,
        #[source]
        source: QueueError,
    },
}

impl WorkerExit {
    /// Whether the worker stopped because it was asked to.
    pub fn is_graceful(&self) -> bool {
        matches!(self, WorkerExit::Paced)
    }
}

/// Services one tube over its own connection, one job at a time.
pub struct Worker<C, E> {
    tube: String,
    slot: usize,
    conn: C,
    executor: Arc<E>,
    layout: Arc<WorkdirLayout>,
    config: WorkerConfig,
    policy: RetryPolicy,
    pacer: Pacer,
    results: Option<mpsc::Sender<JobResult>>,
    state: WorkerState,
}

impl<C, E> fmt::Debug for Worker<C, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("tube", &self.tube)
            .field("slot", &self.slot)
            .field("state", &self.state)
            .field("config", &self.config)
            .finish()
    }
}

impl<C, E> Worker<C, E>
where
    C: QueueConnection,
    E: JobExecutor,
{
    /// Create a worker on a connection already watching `tube`.
    pub fn new(
        tube: impl Into<String>,
        slot: usize,
        conn: C,
        executor: Arc<E>,
        layout: Arc<WorkdirLayout>,
        config: WorkerConfig,
        pacer: Pacer,
    ) -> Self {
        let policy = config.policy();
        Self {
            tube: tube.into(),
            slot,
            conn,
            executor,
            layout,
            config,
            policy,
            pacer,
            results: None,
            state: WorkerState::Idle,
        }
    }

    /// Emit every [`JobResult`] on `results`.
    pub fn with_results(mut self, results: mpsc::Sender<JobResult>) -> Self {
        self.results = Some(results);
        self
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Run until the pacer closes or the connection fails.
    pub async fn run(mut self) -> WorkerExit {
        let span = telemetry::worker_span(&self.tube, self.slot);
        let exit = self.run_loop().instrument(span.clone()).await;
        span.in_scope(|| {
            self.transition(WorkerState::Stopped);
            if exit.is_graceful() {
                tracing::info!("worker stopped");
            } else {
                tracing::error!(error = %exit, "worker stopped");
            }
        });
        exit
    }

    async fn run_loop(&mut self) -> WorkerExit {
        loop {
            self.transition(WorkerState::Idle);
            if !self.pacer.next().await {
                return WorkerExit::Paced;
            }

            self.transition(WorkerState::Reserving);
            tracing::info!(tube = %self.tube, "waiting for job");
            let pacer = &self.pacer;
            let reserved =
                reserve_job(&mut self.conn, self.config.reserve_timeout, || pacer.is_closed())
                    .await;
            let job = match reserved {
                Ok(Some(job)) => job,
                Ok(None) => return WorkerExit::Paced,
                Err(err) => return WorkerExit::Reserve(err),
            };

            let span = telemetry::job_span(&self.tube, job.id);
            if let Err(exit) = self.attempt(job).instrument(span).await {
                return exit;
            }
        }
    }

    async fn attempt(&mut self, job: Job) -> Result<(), WorkerExit> {
        telemetry::record_job_reserved(&self.tube, job.id, job.body.len());
        self.transition(WorkerState::Deciding);

        let history = match self.conn.history(job.id).await {
            Ok(history) => history,
            Err(err) => return self.abort_attempt(job.id, err),
        };

        if let Some(reason) = self.policy.check_history(&history) {
            tracing::warn!(?reason, "job exhausted its retries, re-queueing without running");
            self.transition(WorkerState::Resolving);
            let disposition = Disposition::Abandon(self.policy.requeue_delay);
            return self
                .resolve(job.id, disposition, JobResult::buried(job.id))
                .await;
        }

        let working_dir = match self.layout.working_dir_for(&job.body) {
            Ok(dir) => dir,
            Err(err) => {
                tracing::error!(error = %err, "cannot route job, leaving it for redelivery");
                telemetry::record_job_resolved(&self.tube, "unroutable");
                self.transition(WorkerState::Resolving);
                self.emit(JobResult::unroutable(job.id, err)).await;
                return Ok(());
            }
        };

        self.transition(WorkerState::Executing);
        tracing::info!(working_dir = %working_dir.display(), "running job");
        let timing = telemetry::record_job_start(job.id);
        let supervised = supervise(
            &mut self.conn,
            self.executor.as_ref(),
            &job,
            &working_dir,
            self.config.ttr_margin,
        )
        .await;
        let result = match supervised {
            Ok(result) => result,
            Err(err) => return self.abort_attempt(job.id, err),
        };

        if let Some(err) = &result.error {
            tracing::error!(error = %err, "executor failure");
        }
        if result.timed_out {
            telemetry::record_executor_timeout(&self.tube, job.id, result.elapsed);
        } else {
            tracing::info!(
                exit_status = ?result.exit_status,
                elapsed_ms = result.elapsed.as_millis() as u64,
                "executor finished"
            );
        }

        self.transition(WorkerState::Resolving);
        let releases = if result.timed_out || result.exit_status == Some(0) {
            ReleaseCount::Known(history.releases)
        } else {
            match self.conn.releases(job.id).await {
                Ok(count) => ReleaseCount::Known(count),
                Err(err) => {
                    tracing::warn!(error = %err, "cannot read release count, using the retry ceiling");
                    ReleaseCount::Unavailable
                }
            }
        };
        let disposition = self.policy.after_execution(&result, releases);
        telemetry::record_job_end(timing, &self.tube, disposition.as_str());

        self.resolve(job.id, disposition, result).await
    }

    /// Apply `disposition` and report the result.
    async fn resolve(
        &mut self,
        job_id: JobId,
        disposition: Disposition,
        result: JobResult,
    ) -> Result<(), WorkerExit> {
        let applied = match disposition {
            Disposition::Delete => self.conn.delete(job_id).await,
            Disposition::Release(delay) | Disposition::Abandon(delay) => {
                self.conn.release(job_id, delay).await
            }
            Disposition::Leave => Ok(()),
        };

        match applied {
            Ok(()) => {
                tracing::debug!(outcome = disposition.as_str(), ?disposition, "job resolved");
                telemetry::record_job_resolved(&self.tube, disposition.as_str());
                self.emit(result).await;
                Ok(())
            }
            Err(err) if err.is_connection_fatal() => Err(WorkerExit::Connection {
                job_id,
                source: err,
            }),
            Err(err) => {
                tracing::error!(
                    error = %err,
                    outcome = disposition.as_str(),
                    "failed to resolve job"
                );
                telemetry::record_job_resolved(&self.tube, "failed");
                self.emit(result).await;
                Ok(())
            }
        }
    }

    /// A queue query failed before the job could be resolved.
    ///
    /// The job is left to the server either way; only a broken connection
    /// stops the worker.
    fn abort_attempt(&self, job_id: JobId, err: QueueError) -> Result<(), WorkerExit> {
        if err.is_connection_fatal() {
            return Err(WorkerExit::Connection {
                job_id,
                source: err,
            });
        }
        tracing::error!(error = %err, "queue query failed, leaving job for redelivery");
        telemetry::record_job_resolved(&self.tube, "failed");
        Ok(())
    }

    async fn emit(&mut self, result: JobResult) {
        if let Some(results) = &self.results {
            if results.send(result).await.is_err() {
                tracing::debug!("results receiver dropped");
            }
        }
    }

    fn transition(&mut self, next: WorkerState) {
        if self.state != next {
            tracing::trace!(from = %self.state, to = %next, "worker state");
            self.state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pacer_yields_tokens_until_closed() {
        let (tx, mut pacer) = Pacer::channel();

        tx.send(()).await.unwrap();
        assert!(pacer.next().await);

        drop(tx);
        assert!(pacer.is_closed());
        assert!(!pacer.next().await);
    }

    #[tokio::test]
    async fn test_pacer_ignores_buffered_token_after_close() {
        let (tx, mut pacer) = Pacer::channel();
        tx.send(()).await.unwrap();
        drop(tx);

        assert!(!pacer.next().await);
    }

    #[test]
    fn test_worker_config_from_broker_config() {
        let broker = BrokerConfig::default()
            .with_requeue_delay(Duration::from_secs(5))
            .with_reserve_timeout(Duration::from_millis(200));
        let config = WorkerConfig::from_config(&broker).with_ttr_margin(Duration::ZERO);

        assert_eq!(config.reserve_timeout, Duration::from_millis(200));
        assert_eq!(config.ttr_margin, Duration::ZERO);
        assert_eq!(config.policy().requeue_delay, Duration::from_secs(5));
    }

    #[test]
    fn test_worker_exit_classification() {
        assert!(WorkerExit::Paced.is_graceful());
        assert!(!WorkerExit::Reserve(QueueError::Disconnected).is_graceful());
    }

    #[test]
    fn test_state_labels() {
        assert_eq!(WorkerState::Executing.to_string(), "executing");
        assert_eq!(WorkerState::Stopped.as_str(), "stopped");
    }
}
