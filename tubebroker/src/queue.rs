use std::time::Duration;

use async_trait::async_trait;

use crate::job::{Job, JobHistory, JobId};

/// Pause between a `DEADLINE_SOON` answer and the next reserve attempt.
pub const DEADLINE_SOON_DELAY: Duration = Duration::from_secs(1);

/// One connection to the queue server.
///
/// A connection is owned by exactly one worker (or the discovery loop) and
/// is never shared, hence `&mut self` everywhere.
#[async_trait]
pub trait QueueConnection: Send {
    /// Watch `tube` and stop watching everything else.
    async fn watch_only(&mut self, tube: &str) -> Result<(), QueueError>;

    /// Reserve the next job from the watched tubes, waiting at most `timeout`.
    ///
    /// Returns [`QueueError::Timeout`] when nothing arrived and
    /// [`QueueError::DeadlineSoon`] when a job already reserved on this
    /// connection is about to lapse.
    async fn reserve(&mut self, timeout: Duration) -> Result<Job, QueueError>;

    /// Put a reserved job back, visible again after `delay`.
    async fn release(&mut self, id: JobId, delay: Duration) -> Result<(), QueueError>;

    /// Remove a reserved job for good.
    async fn delete(&mut self, id: JobId) -> Result<(), QueueError>;

    /// Time left before the server gives up on the reservation of `id`.
    async fn time_left(&mut self, id: JobId) -> Result<Duration, QueueError>;

    /// How many times the reservation of `id` has lapsed.
    async fn timeouts(&mut self, id: JobId) -> Result<u64, QueueError>;

    /// How many times `id` has been released.
    async fn releases(&mut self, id: JobId) -> Result<u64, QueueError>;

    /// Names of every tube the server knows about.
    async fn list_tubes(&mut self) -> Result<Vec<String>, QueueError>;

    /// Both retry counters of `id`.
    async fn history(&mut self, id: JobId) -> Result<JobHistory, QueueError> {
        let timeouts = self.timeouts(id).await?;
        let releases = self.releases(id).await?;
        Ok(JobHistory { timeouts, releases })
    }
}

/// Opens fresh connections to the queue server.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: QueueConnection + 'static;

    /// Dial a new, exclusively owned connection.
    async fn connect(&self) -> Result<Self::Connection, QueueError>;
}

/// Errors reported by a queue connection.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// No job arrived within the reserve timeout.
    #[error("reserve timed out")]
    Timeout,
    /// A reservation held by this connection is about to lapse.
    #[error("reservation deadline soon")]
    DeadlineSoon,
    /// The job does not exist or is not reserved by this connection.
    #[error("job {0} not found")]
    NotFound(JobId),
    /// The server answered with an error line.
    #[error("server error: {0}")]
    Server(String),
    /// The server answered with something we cannot parse.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The server closed the connection.
    #[error("connection closed by server")]
    Disconnected,
    #[error("connection i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl QueueError {
    /// Conditions the reserve adapter retries on its own.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Timeout | QueueError::DeadlineSoon)
    }

    /// Conditions that leave the connection unusable.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            QueueError::Disconnected | QueueError::Io(_) | QueueError::Protocol(_)
        )
    }
}

/// Reserve until a job shows up or something fatal happens.
///
/// `TIMED_OUT` is retried at once and `DEADLINE_SOON` after
/// [`DEADLINE_SOON_DELAY`]. Between retries `should_stop` is consulted; once
/// it returns true the adapter gives up with `Ok(None)`. A reserve call that
/// is already in flight is never interrupted.
pub async fn reserve_job<C, F>(
    conn: &mut C,
    timeout: Duration,
    should_stop: F,
) -> Result<Option<Job>, QueueError>
where
    C: QueueConnection + ?Sized,
    F: Fn() -> bool,
{
    loop {
        match conn.reserve(timeout).await {
            Ok(job) => return Ok(Some(job)),
            Err(QueueError::Timeout) => {
                tracing::trace!("reserve timed out, retrying");
            }
            Err(QueueError::DeadlineSoon) => {
                tracing::debug!("reserve hit deadline soon, backing off");
                tokio::time::sleep(DEADLINE_SOON_DELAY).await;
            }
            Err(err) => return Err(err),
        }

        if should_stop() {
            return Ok(None);
        }
    }
}
