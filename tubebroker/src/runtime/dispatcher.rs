use std::any::type_name;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};
use tokio::time::MissedTickBehavior;
use tracing::Instrument;

use crate::config::BrokerConfig;
use crate::job::JobResult;
use crate::payload::WorkdirLayout;
use crate::queue::{Connector, QueueConnection};
use crate::telemetry;

use super::supervisor::JobExecutor;
use super::worker::{Pacer, Worker, WorkerConfig, WorkerExit};

/// Configuration for a [`Dispatcher`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Workers started for every watched tube.
    pub per_tube: usize,
    /// Interval between `list-tubes` polls in all-tubes mode.
    #[serde(with = "crate::config::humantime_serde")]
    pub discovery_interval: Duration,
    /// Settings handed to each worker.
    pub worker: WorkerConfig,
}

impl DispatcherConfig {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            per_tube: config.per_tube.max(1),
            discovery_interval: config.discovery_interval,
            worker: WorkerConfig::from_config(config),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::from_config(&BrokerConfig::default())
    }
}

/// Token for signaling graceful shutdown to workers.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation. Returns `true` only for the first call.
    pub fn cancel(&self) -> bool {
        let first = !self.inner.cancelled.swap(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
        first
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts running tasks and lets callers wait for all of them to finish.
#[derive(Clone, Debug, Default)]
pub struct WorkerGroup {
    inner: Arc<WorkerGroupInner>,
}

#[derive(Debug, Default)]
struct WorkerGroupInner {
    active: AtomicUsize,
    idle: Notify,
}

impl WorkerGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task. The task is done when the guard is dropped.
    pub fn enter(&self) -> WorkerGroupGuard {
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        WorkerGroupGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Wait until no registered task is left.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug)]
pub struct WorkerGroupGuard {
    inner: Arc<WorkerGroupInner>,
}

impl Drop for WorkerGroupGuard {
    fn drop(&mut self) {
        if self.inner.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

/// Starts and stops workers per tube.
///
/// The set of watched tubes is owned here and only touched under its lock;
/// workers never see it.
pub struct Dispatcher<C, E>
where
    C: Connector,
    E: JobExecutor,
{
    config: DispatcherConfig,
    connector: Arc<C>,
    executor: Arc<E>,
    layout: Arc<WorkdirLayout>,
    results: Option<mpsc::Sender<JobResult>>,
    watched: Mutex<HashSet<String>>,
    shutdown: ShutdownToken,
    group: WorkerGroup,
}

impl<C, E> fmt::Debug for Dispatcher<C, E>
where
    C: Connector,
    E: JobExecutor,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("connector_type", &type_name::<C>())
            .field("executor_type", &type_name::<E>())
            .field("layout", &self.layout)
            .field("watched", &self.watched.lock().len())
            .field("active_tasks", &self.group.active())
            .field("shutdown_cancelled", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl<C, E> Dispatcher<C, E>
where
    C: Connector,
    E: JobExecutor,
{
    pub fn new(
        config: DispatcherConfig,
        connector: Arc<C>,
        executor: Arc<E>,
        layout: Arc<WorkdirLayout>,
        results: Option<mpsc::Sender<JobResult>>,
    ) -> Self {
        Self {
            config,
            connector,
            executor,
            layout,
            results,
            watched: Mutex::new(HashSet::new()),
            shutdown: ShutdownToken::new(),
            group: WorkerGroup::new(),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.clone()
    }

    /// Tasks (workers and discovery) that have not finished yet.
    pub fn active_tasks(&self) -> usize {
        self.group.active()
    }

    /// Watched tube names, sorted.
    pub fn watched_tubes(&self) -> Vec<String> {
        let mut tubes: Vec<String> = self.watched.lock().iter().cloned().collect();
        tubes.sort();
        tubes
    }

    /// Start `per_tube` workers for `tube` unless it is already watched.
    ///
    /// Returns `true` when workers were started. Does nothing once shutdown
    /// has begun. Must be called within a tokio runtime.
    pub fn watch(&self, tube: &str) -> bool {
        // Workers join the group under the lock so a concurrent shutdown
        // either sees them or prevents them.
        let guards: Vec<WorkerGroupGuard> = {
            let mut watched = self.watched.lock();
            if self.shutdown.is_cancelled() || !watched.insert(tube.to_string()) {
                return false;
            }
            (0..self.config.per_tube).map(|_| self.group.enter()).collect()
        };

        tracing::info!(tube = %tube, workers = self.config.per_tube, "watching tube");
        for (slot, guard) in guards.into_iter().enumerate() {
            self.spawn_worker(tube, slot, guard);
        }
        true
    }

    /// Watch every tube the server knows about, now and as new ones appear.
    ///
    /// Discovery runs on its own connection until shutdown. Failures are
    /// logged and retried on the next tick; a lost connection is re-dialed.
    pub fn watch_all(self: &Arc<Self>) {
        let guard = {
            let _watched = self.watched.lock();
            if self.shutdown.is_cancelled() {
                return;
            }
            self.group.enter()
        };
        let dispatcher = Arc::clone(self);
        tokio::spawn(
            async move {
                dispatcher.discover().await;
                drop(guard);
            }
            .instrument(telemetry::discovery_span()),
        );
    }

    async fn discover(&self) {
        let mut conn: Option<C::Connection> = None;
        let period = self.config.discovery_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if conn.is_none() {
                match self.connector.connect().await {
                    Ok(fresh) => conn = Some(fresh),
                    Err(err) => {
                        tracing::warn!(error = %err, "discovery connection failed");
                        continue;
                    }
                }
            }
            let Some(current) = conn.as_mut() else {
                continue;
            };

            match current.list_tubes().await {
                Ok(tubes) => {
                    for tube in tubes {
                        if self.watch(&tube) {
                            tracing::info!(tube = %tube, "discovered tube");
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "failed to list tubes");
                    if err.is_connection_fatal() {
                        conn = None;
                    }
                }
            }
        }
        tracing::info!("discovery stopped");
    }

    /// Stop every worker and wait for in-flight attempts to finish.
    ///
    /// Safe to call more than once and from several tasks.
    pub async fn shutdown(&self) {
        let first = {
            let _watched = self.watched.lock();
            self.shutdown.cancel()
        };
        if first {
            tracing::info!(active = self.group.active(), "shutting down dispatcher");
        }
        self.group.wait().await;
        tracing::info!("dispatcher shutdown complete");
    }

    /// Wait until every worker and the discovery loop have finished.
    pub async fn wait(&self) {
        self.group.wait().await;
    }

    fn spawn_worker(&self, tube: &str, slot: usize, guard: WorkerGroupGuard) {
        let (tx, pacer) = Pacer::channel();
        tokio::spawn(pump(tx, self.shutdown.clone()));

        let connector = Arc::clone(&self.connector);
        let executor = Arc::clone(&self.executor);
        let layout = Arc::clone(&self.layout);
        let config = self.config.worker.clone();
        let results = self.results.clone();
        let tube = tube.to_string();

        tokio::spawn(async move {
            let exit = match open_connection(connector.as_ref(), &tube).await {
                Ok(conn) => {
                    let mut worker = Worker::new(&tube, slot, conn, executor, layout, config, pacer);
                    if let Some(results) = results {
                        worker = worker.with_results(results);
                    }
                    worker.run().await
                }
                Err(exit) => {
                    tracing::error!(tube = %tube, slot, error = %exit, "worker failed to start");
                    exit
                }
            };
            tracing::debug!(tube = %tube, slot, graceful = exit.is_graceful(), "worker task finished");
            drop(guard);
        });
    }
}

async fn open_connection<C: Connector>(
    connector: &C,
    tube: &str,
) -> Result<C::Connection, WorkerExit> {
    let mut conn = connector.connect().await.map_err(WorkerExit::Connect)?;
    conn.watch_only(tube).await.map_err(WorkerExit::Watch)?;
    Ok(conn)
}

/// Feed pacing tokens as fast as the worker takes them, until shutdown.
async fn pump(tx: mpsc::Sender<()>, shutdown: ShutdownToken) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            sent = tx.send(()) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
}
