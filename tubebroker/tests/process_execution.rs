//! Jobs executed as real child processes, end to end through a worker.

#![cfg(unix)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tubebroker::*;
use tubebroker_testkit::{job_body, FakeQueue};

const TUBE: &str = "emails";

struct Checkout {
    root: TempDir,
}

impl Checkout {
    /// Instance and cluster roots with a worker directory for each domain.
    fn new(domains: &[&str]) -> Self {
        let root = tempfile::tempdir().unwrap();
        for domain in domains {
            std::fs::create_dir_all(root.path().join("instances").join(domain).join("worker"))
                .unwrap();
        }
        std::fs::create_dir_all(root.path().join("cluster").join("worker")).unwrap();
        Self { root }
    }

    fn layout(&self) -> WorkdirLayout {
        WorkdirLayout::new(self.root.path().join("instances"), self.root.path().join("cluster"))
    }

    fn worker_dir(&self, domain: &str) -> std::path::PathBuf {
        self.root.path().join("instances").join(domain).join("worker")
    }
}

fn shell(script: &str) -> ProcessExecutor {
    ProcessExecutor::new(ExecutorCommand::new("sh", ["-c", script]))
        .with_kill_grace(Duration::from_secs(1))
}

struct Running {
    results: mpsc::Receiver<JobResult>,
    pump: JoinHandle<()>,
    worker: JoinHandle<WorkerExit>,
}

impl Running {
    async fn start(queue: &FakeQueue, executor: ProcessExecutor, layout: WorkdirLayout) -> Self {
        let mut conn = queue.connector().connect().await.unwrap();
        conn.watch_only(TUBE).await.unwrap();

        let (tx, pacer) = Pacer::channel();
        let pump = tokio::spawn(async move { while tx.send(()).await.is_ok() {} });
        let (results_tx, results) = mpsc::channel(8);
        let config = WorkerConfig::default()
            .with_reserve_timeout(Duration::from_millis(20))
            .with_ttr_margin(Duration::ZERO)
            .with_requeue_delay(Duration::from_secs(60));

        let worker = Worker::new(
            TUBE,
            0,
            conn,
            Arc::new(executor),
            Arc::new(layout),
            config,
            pacer,
        )
        .with_results(results_tx);

        Self {
            results,
            pump,
            worker: tokio::spawn(worker.run()),
        }
    }

    async fn next_result(&mut self) -> JobResult {
        timeout(Duration::from_secs(15), self.results.recv())
            .await
            .expect("result in time")
            .expect("results channel open")
    }

    async fn stop(self) {
        self.pump.abort();
        let exit = timeout(Duration::from_secs(15), self.worker)
            .await
            .expect("worker stopped in time")
            .expect("worker task");
        assert!(exit.is_graceful(), "{exit}");
    }
}

#[tokio::test]
async fn test_process_receives_body_in_domain_directory() {
    let checkout = Checkout::new(&["acme"]);
    let queue = FakeQueue::new();
    let body = job_body("acme");
    let id = queue.put(TUBE, body.clone(), Duration::from_secs(60));

    let mut running = Running::start(
        &queue,
        shell("cat > received.body; echo done"),
        checkout.layout(),
    )
    .await;
    let result = running.next_result().await;
    running.stop().await;

    assert!(result.succeeded(), "{result:?}");
    assert_eq!(result.stdout_lossy(), "done\n");
    assert!(queue.job(id).unwrap().is_deleted());

    let received = std::fs::read(checkout.worker_dir("acme").join("received.body")).unwrap();
    assert_eq!(received, body);
}

#[tokio::test]
async fn test_failing_process_is_released() {
    let checkout = Checkout::new(&["acme"]);
    let queue = FakeQueue::new();
    let id = queue.put_with_history(
        TUBE,
        job_body("acme"),
        Duration::from_secs(60),
        JobHistory::new(0, 1),
    );

    let mut running = Running::start(&queue, shell("exit 4"), checkout.layout()).await;
    let result = running.next_result().await;
    running.stop().await;

    assert_eq!(result.exit_status, Some(4));
    assert!(!result.timed_out);
    let job = queue.job(id).unwrap();
    assert_eq!(job.releases, 2);
    assert_eq!(job.release_delays, vec![Duration::from_secs(1)]);
}

#[tokio::test]
async fn test_missing_working_directory_is_released() {
    let checkout = Checkout::new(&[]);
    let queue = FakeQueue::new();
    let id = queue.put_with_history(
        TUBE,
        job_body("ghost"),
        Duration::from_secs(60),
        JobHistory::new(0, 2),
    );

    let mut running = Running::start(&queue, shell("exit 0"), checkout.layout()).await;
    let result = running.next_result().await;
    running.stop().await;

    assert!(matches!(
        result.error,
        Some(AttemptError::Execution(ExecutionError::Spawn { .. }))
    ));
    assert_eq!(result.exit_status, None);
    assert_eq!(
        queue.job(id).unwrap().last_release_delay(),
        Some(Duration::from_secs(16))
    );
}

#[tokio::test]
async fn test_overrunning_process_is_terminated_then_abandoned() {
    let checkout = Checkout::new(&["acme"]);
    let queue = FakeQueue::new();
    let id = queue.put(TUBE, job_body("acme"), Duration::from_secs(2));

    let mut running = Running::start(&queue, shell("exec sleep 30"), checkout.layout()).await;

    let first = running.next_result().await;
    assert!(first.timed_out);
    assert_eq!(first.exit_status, Some(143));
    assert!(first.elapsed < Duration::from_secs(5));
    assert!(queue.job(id).unwrap().release_delays.is_empty());

    // The reservation lapses and the next delivery is abandoned unexecuted.
    let second = running.next_result().await;
    running.stop().await;

    assert!(second.buried);
    assert!(!second.executed);
    let job = queue.job(id).unwrap();
    assert_eq!(job.timeouts, 1);
    assert_eq!(job.last_release_delay(), Some(Duration::from_secs(60)));
}

#[tokio::test]
async fn test_cluster_job_runs_in_cluster_checkout() {
    let checkout = Checkout::new(&[]);
    let queue = FakeQueue::new();
    queue.put(TUBE, job_body("cluster"), Duration::from_secs(60));

    let mut running = Running::start(&queue, shell("pwd"), checkout.layout()).await;
    let result = running.next_result().await;
    running.stop().await;

    let expected = checkout.root.path().join("cluster").join("worker");
    let reported = result.stdout_lossy();
    assert!(
        Path::new(reported.trim()).ends_with(Path::new("cluster/worker")),
        "{reported} vs {}",
        expected.display()
    );
}
