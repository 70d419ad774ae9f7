use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tubebroker::*;

/// How often a blocked reserve looks for work again.
const RESERVE_POLL: Duration = Duration::from_millis(5);

/// State of a job inside the fake server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FakeJobState {
    Ready,
    Delayed { until: Instant },
    Reserved { connection: u64, deadline: Instant },
    Deleted,
}

/// Snapshot of one job for assertions.
#[derive(Clone, Debug)]
pub struct FakeJob {
    pub id: JobId,
    pub tube: String,
    pub body: Vec<u8>,
    pub ttr: Duration,
    pub state: FakeJobState,
    pub reserves: u64,
    pub timeouts: u64,
    pub releases: u64,
    /// Delay of every release, in order.
    pub release_delays: Vec<Duration>,
}

impl FakeJob {
    pub fn is_deleted(&self) -> bool {
        self.state == FakeJobState::Deleted
    }

    pub fn is_reserved(&self) -> bool {
        matches!(self.state, FakeJobState::Reserved { .. })
    }

    pub fn last_release_delay(&self) -> Option<Duration> {
        self.release_delays.last().copied()
    }
}

#[derive(Default)]
struct ServerState {
    next_job: u64,
    next_connection: u64,
    tubes: BTreeSet<String>,
    jobs: BTreeMap<JobId, FakeJob>,
    watchers: HashMap<String, usize>,
    /// Connections opened at or before this id are dead.
    severed_through: u64,
    refuse_connections: bool,
    list_failures: usize,
    release_query_failures: usize,
}

impl ServerState {
    /// Move lapsed reservations and elapsed delays back to ready.
    fn tick(&mut self, now: Instant) {
        for job in self.jobs.values_mut() {
            match job.state {
                FakeJobState::Reserved { deadline, .. } if deadline <= now => {
                    job.timeouts += 1;
                    job.state = FakeJobState::Ready;
                }
                FakeJobState::Delayed { until } if until <= now => {
                    job.state = FakeJobState::Ready;
                }
                _ => {}
            }
        }
    }

    fn reserved_by(&mut self, id: JobId, connection: u64) -> Result<&mut FakeJob, QueueError> {
        match self.jobs.get_mut(&id) {
            Some(job)
                if matches!(job.state, FakeJobState::Reserved { connection: c, .. } if c == connection) =>
            {
                Ok(job)
            }
            _ => Err(QueueError::NotFound(id)),
        }
    }

    fn live(&self, id: JobId) -> Result<&FakeJob, QueueError> {
        match self.jobs.get(&id) {
            Some(job) if !job.is_deleted() => Ok(job),
            _ => Err(QueueError::NotFound(id)),
        }
    }
}

/// In-memory beanstalkd stand-in.
///
/// Jobs are served lowest id first. Reservations lapse after the job's TTR
/// and bump its timeout counter, the same way the real server does. Time is
/// read from `tokio::time`, so paused-clock tests work.
#[derive(Clone, Default)]
pub struct FakeQueue {
    state: Arc<Mutex<ServerState>>,
}

impl FakeQueue {
    pub fn new() -> Self {
        let queue = Self::default();
        queue.add_tube("default");
        queue
    }

    /// Make `tube` show up in `list-tubes` even while it is empty.
    pub fn add_tube(&self, tube: &str) {
        self.state.lock().tubes.insert(tube.to_string());
    }

    /// Put a job with a fresh history.
    pub fn put(&self, tube: &str, body: impl Into<Vec<u8>>, ttr: Duration) -> JobId {
        self.put_with_history(tube, body, ttr, JobHistory::default())
    }

    /// Put a job that already went through `history.timeouts` lapses and
    /// `history.releases` releases.
    pub fn put_with_history(
        &self,
        tube: &str,
        body: impl Into<Vec<u8>>,
        ttr: Duration,
        history: JobHistory,
    ) -> JobId {
        let mut state = self.state.lock();
        state.next_job += 1;
        let id = JobId(state.next_job);
        state.tubes.insert(tube.to_string());
        state.jobs.insert(
            id,
            FakeJob {
                id,
                tube: tube.to_string(),
                body: body.into(),
                ttr,
                state: FakeJobState::Ready,
                reserves: 0,
                timeouts: history.timeouts,
                releases: history.releases,
                release_delays: Vec::new(),
            },
        );
        id
    }

    pub fn job(&self, id: JobId) -> Option<FakeJob> {
        let mut state = self.state.lock();
        state.tick(Instant::now());
        state.jobs.get(&id).cloned()
    }

    pub fn jobs(&self) -> Vec<FakeJob> {
        let mut state = self.state.lock();
        state.tick(Instant::now());
        state.jobs.values().cloned().collect()
    }

    /// Connections opened so far.
    pub fn connections(&self) -> u64 {
        self.state.lock().next_connection
    }

    /// Connections that called `watch_only(tube)`.
    pub fn watchers(&self, tube: &str) -> usize {
        self.state.lock().watchers.get(tube).copied().unwrap_or(0)
    }

    /// Break every connection opened so far.
    pub fn sever_connections(&self) {
        let mut state = self.state.lock();
        state.severed_through = state.next_connection;
    }

    /// Refuse (or accept again) new connections.
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.lock().refuse_connections = refuse;
    }

    /// Make the next `count` `list-tubes` calls fail with a server error.
    pub fn fail_list_tubes(&self, count: usize) {
        self.state.lock().list_failures = count;
    }

    /// Make the next `count` standalone release-count queries fail with a
    /// server error. `history` is unaffected.
    pub fn fail_release_queries(&self, count: usize) {
        self.state.lock().release_query_failures = count;
    }

    pub fn connector(&self) -> FakeConnector {
        FakeConnector {
            queue: self.clone(),
        }
    }

    fn open(&self) -> Result<FakeConnection, QueueError> {
        let mut state = self.state.lock();
        if state.refuse_connections {
            return Err(QueueError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "fake queue refuses connections",
            )));
        }
        state.next_connection += 1;
        Ok(FakeConnection {
            queue: self.clone(),
            id: state.next_connection,
            watched: vec!["default".to_string()],
        })
    }
}

/// Dials [`FakeConnection`]s to a [`FakeQueue`].
#[derive(Clone)]
pub struct FakeConnector {
    queue: FakeQueue,
}

#[async_trait]
impl Connector for FakeConnector {
    type Connection = FakeConnection;

    async fn connect(&self) -> Result<FakeConnection, QueueError> {
        self.queue.open()
    }
}

/// One connection to a [`FakeQueue`].
pub struct FakeConnection {
    queue: FakeQueue,
    id: u64,
    watched: Vec<String>,
}

impl FakeConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Lock the server, failing if this connection was severed.
    fn server(&self) -> Result<parking_lot::MutexGuard<'_, ServerState>, QueueError> {
        let mut state = self.queue.state.lock();
        if self.id <= state.severed_through {
            return Err(QueueError::Disconnected);
        }
        state.tick(Instant::now());
        Ok(state)
    }

    fn try_reserve(&self) -> Result<Option<Job>, QueueError> {
        let mut state = self.server()?;
        let now = Instant::now();

        let deadline_soon = state.jobs.values().any(|job| {
            matches!(job.state, FakeJobState::Reserved { connection, deadline }
                if connection == self.id && deadline.saturating_duration_since(now) <= Duration::from_secs(1))
        });
        if deadline_soon {
            return Err(QueueError::DeadlineSoon);
        }

        let candidate = state
            .jobs
            .values_mut()
            .find(|job| job.state == FakeJobState::Ready && self.watched.contains(&job.tube));
        Ok(candidate.map(|job| {
            job.reserves += 1;
            job.state = FakeJobState::Reserved {
                connection: self.id,
                deadline: now + job.ttr,
            };
            Job::new(job.id, job.body.clone())
        }))
    }
}

#[async_trait]
impl QueueConnection for FakeConnection {
    async fn watch_only(&mut self, tube: &str) -> Result<(), QueueError> {
        let mut state = self.server()?;
        state.tubes.insert(tube.to_string());
        *state.watchers.entry(tube.to_string()).or_default() += 1;
        drop(state);
        self.watched = vec![tube.to_string()];
        Ok(())
    }

    async fn reserve(&mut self, timeout: Duration) -> Result<Job, QueueError> {
        let give_up = Instant::now() + timeout;
        loop {
            if let Some(job) = self.try_reserve()? {
                return Ok(job);
            }
            let now = Instant::now();
            if now >= give_up {
                return Err(QueueError::Timeout);
            }
            tokio::time::sleep(RESERVE_POLL.min(give_up - now)).await;
        }
    }

    async fn release(&mut self, id: JobId, delay: Duration) -> Result<(), QueueError> {
        let mut state = self.server()?;
        let job = state.reserved_by(id, self.id)?;
        job.releases += 1;
        job.release_delays.push(delay);
        job.state = if delay.is_zero() {
            FakeJobState::Ready
        } else {
            FakeJobState::Delayed {
                until: Instant::now() + delay,
            }
        };
        Ok(())
    }

    async fn delete(&mut self, id: JobId) -> Result<(), QueueError> {
        let mut state = self.server()?;
        let job = state.reserved_by(id, self.id)?;
        job.state = FakeJobState::Deleted;
        Ok(())
    }

    async fn time_left(&mut self, id: JobId) -> Result<Duration, QueueError> {
        let mut state = self.server()?;
        let job = state.reserved_by(id, self.id)?;
        match job.state {
            // The real server reports whole seconds, rounded down.
            FakeJobState::Reserved { deadline, .. } => Ok(Duration::from_secs(
                deadline.saturating_duration_since(Instant::now()).as_secs(),
            )),
            _ => Err(QueueError::NotFound(id)),
        }
    }

    async fn timeouts(&mut self, id: JobId) -> Result<u64, QueueError> {
        let state = self.server()?;
        Ok(state.live(id)?.timeouts)
    }

    async fn releases(&mut self, id: JobId) -> Result<u64, QueueError> {
        let mut state = self.server()?;
        if state.release_query_failures > 0 {
            state.release_query_failures -= 1;
            return Err(QueueError::Server("INTERNAL_ERROR".into()));
        }
        Ok(state.live(id)?.releases)
    }

    // One lock for both counters, like a single `stats-job`.
    async fn history(&mut self, id: JobId) -> Result<JobHistory, QueueError> {
        let state = self.server()?;
        let job = state.live(id)?;
        Ok(JobHistory::new(job.timeouts, job.releases))
    }

    async fn list_tubes(&mut self) -> Result<Vec<String>, QueueError> {
        let mut state = self.server()?;
        if state.list_failures > 0 {
            state.list_failures -= 1;
            return Err(QueueError::Server("INTERNAL_ERROR".into()));
        }
        Ok(state.tubes.iter().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reserve_release_delete() {
        let queue = FakeQueue::new();
        let id = queue.put("emails", "body", Duration::from_secs(60));
        let mut conn = queue.connector().connect().await.unwrap();
        conn.watch_only("emails").await.unwrap();

        let job = conn.reserve(Duration::from_millis(50)).await.unwrap();
        assert_eq!(job.id, id);
        assert!(queue.job(id).unwrap().is_reserved());

        conn.release(id, Duration::ZERO).await.unwrap();
        assert_eq!(conn.releases(id).await.unwrap(), 1);

        let job = conn.reserve(Duration::from_millis(50)).await.unwrap();
        conn.delete(job.id).await.unwrap();
        assert!(queue.job(id).unwrap().is_deleted());
        assert!(matches!(
            conn.reserve(Duration::from_millis(20)).await,
            Err(QueueError::Timeout)
        ));
    }

    #[tokio::test]
    async fn test_only_watched_tube_is_served() {
        let queue = FakeQueue::new();
        queue.put("pdf", "body", Duration::from_secs(60));
        let mut conn = queue.connector().connect().await.unwrap();
        conn.watch_only("emails").await.unwrap();

        assert!(matches!(
            conn.reserve(Duration::from_millis(20)).await,
            Err(QueueError::Timeout)
        ));
        assert_eq!(queue.watchers("emails"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lapsed_reservation_counts_timeout() {
        let queue = FakeQueue::new();
        let id = queue.put("default", "body", Duration::from_secs(2));
        let mut conn = queue.connector().connect().await.unwrap();

        conn.reserve(Duration::from_secs(1)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        let job = queue.job(id).unwrap();
        assert_eq!(job.state, FakeJobState::Ready);
        assert_eq!(job.timeouts, 1);
    }

    #[tokio::test]
    async fn test_release_query_failures_spare_history() {
        let queue = FakeQueue::new();
        let id = queue.put_with_history(
            "default",
            "body",
            Duration::from_secs(60),
            JobHistory::new(0, 4),
        );
        queue.fail_release_queries(1);
        let mut conn = queue.connector().connect().await.unwrap();

        assert_eq!(conn.history(id).await.unwrap().releases, 4);
        assert!(matches!(conn.releases(id).await, Err(QueueError::Server(_))));
        assert_eq!(conn.releases(id).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_severed_connection_is_disconnected() {
        let queue = FakeQueue::new();
        let mut conn = queue.connector().connect().await.unwrap();
        queue.sever_connections();

        assert!(matches!(
            conn.list_tubes().await,
            Err(QueueError::Disconnected)
        ));
        let mut fresh = queue.connector().connect().await.unwrap();
        assert_eq!(fresh.list_tubes().await.unwrap(), vec!["default".to_string()]);
    }
}
