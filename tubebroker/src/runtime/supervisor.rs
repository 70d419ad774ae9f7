use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::time::{sleep_until, Instant};

use crate::config::BrokerConfig;
use crate::job::{Job, JobResult};
use crate::queue::{QueueConnection, QueueError};

/// Script the interpreter runs for every job.
pub const ENTRY_SCRIPT: &str = "index.php";

const READ_CHUNK: usize = 8 * 1024;

/// Runs one job to completion under a deadline.
///
/// Implementors never fail as a whole: infrastructure problems end up in
/// [`JobResult::error`].
#[async_trait]
pub trait JobExecutor: Send + Sync + 'static {
    /// Run `job` in `working_dir`, terminating it if it is still running at
    /// `deadline`.
    async fn execute(&self, job: &Job, working_dir: &Path, deadline: Instant) -> JobResult;
}

/// Query the job's remaining reservation time, arm the deadline and run it.
///
/// The deadline is `time-left + margin`: beanstalkd truncates time-left to
/// whole seconds, so a job with a TTR of one second reports zero.
pub async fn supervise<C, E>(
    conn: &mut C,
    executor: &E,
    job: &Job,
    working_dir: &Path,
    margin: Duration,
) -> Result<JobResult, QueueError>
where
    C: QueueConnection + ?Sized,
    E: JobExecutor + ?Sized,
{
    let time_left = conn.time_left(job.id).await?;
    let deadline = Instant::now() + time_left + margin;
    tracing::debug!(
        job_id = %job.id,
        time_left_secs = time_left.as_secs(),
        "execution deadline armed"
    );
    Ok(executor.execute(job, working_dir, deadline).await)
}

/// Argument template of the executor process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutorCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl ExecutorCommand {
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// `<php> -c <php.ini> index.php <controller>`
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self::new(
            &config.php_binary,
            [
                OsString::from("-c"),
                config.php_ini.clone().into_os_string(),
                OsString::from(ENTRY_SCRIPT),
                OsString::from(&config.controller),
            ],
        )
    }
}

impl fmt::Display for ExecutorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Infrastructure failures while running an executor.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write job body to stdin: {0}")]
    Stdin(#[source] std::io::Error),
    #[error("failed to read stdout: {0}")]
    Stdout(#[source] std::io::Error),
    #[error("failed to wait for executor: {0}")]
    Wait(#[source] std::io::Error),
}

/// Executes jobs as child processes.
#[derive(Clone, Debug)]
pub struct ProcessExecutor {
    command: ExecutorCommand,
    kill_grace: Duration,
}

impl ProcessExecutor {
    pub fn new(command: ExecutorCommand) -> Self {
        Self {
            command,
            kill_grace: Duration::from_secs(10),
        }
    }

    pub fn from_config(config: &BrokerConfig) -> Self {
        Self::new(ExecutorCommand::from_config(config)).with_kill_grace(config.kill_grace)
    }

    /// Time a terminated executor gets before it is killed outright.
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn command(&self) -> &ExecutorCommand {
        &self.command
    }

    fn spawn(&self, working_dir: &Path) -> Result<Child, ExecutionError> {
        Command::new(&self.command.program)
            .args(&self.command.args)
            .current_dir(working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecutionError::Spawn {
                program: self.command.program.display().to_string(),
                source,
            })
    }
}

#[async_trait]
impl JobExecutor for ProcessExecutor {
    async fn execute(&self, job: &Job, working_dir: &Path, deadline: Instant) -> JobResult {
        let started = Instant::now();
        let mut result = JobResult {
            job_id: job.id,
            executed: true,
            ..Default::default()
        };

        let mut child = match self.spawn(working_dir) {
            Ok(child) => child,
            Err(err) => {
                result.error = Some(err.into());
                return result;
            }
        };
        tracing::debug!(job_id = %job.id, command = %self.command, "executor started");

        // Feed stdin from its own task so a large body cannot stall the
        // stdout drain below.
        let stdin = child.stdin.take();
        let body = job.body.clone();
        let writer = tokio::spawn(async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&body).await?;
                stdin.shutdown().await?;
            }
            Ok::<(), std::io::Error>(())
        });

        let mut termination = Termination::new(self.kill_grace);
        let timer = sleep_until(deadline);
        tokio::pin!(timer);

        if let Some(mut stdout) = child.stdout.take() {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                tokio::select! {
                    read = stdout.read(&mut buf) => match read {
                        Ok(0) => break,
                        Ok(n) => {
                            tracing::info!(
                                job_id = %job.id,
                                "stdout: {}",
                                String::from_utf8_lossy(&buf[..n]).trim_end()
                            );
                            result.stdout.extend_from_slice(&buf[..n]);
                        }
                        Err(err) => {
                            result.error = Some(ExecutionError::Stdout(err).into());
                            termination.terminate(&mut child);
                            break;
                        }
                    },
                    _ = &mut timer, if !result.timed_out => {
                        tracing::warn!(job_id = %job.id, "execution deadline exceeded, terminating executor");
                        result.timed_out = true;
                        termination.terminate(&mut child);
                    }
                    _ = termination.escalation(), if termination.pending() => {
                        termination.kill(&mut child);
                    }
                }
            }
        }

        // The output stream can close while the process is still tearing
        // down, so the same deadline keeps guarding the wait.
        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                _ = &mut timer, if !result.timed_out => {
                    tracing::warn!(job_id = %job.id, "executor hung after closing stdout, terminating");
                    result.timed_out = true;
                    termination.terminate(&mut child);
                }
                _ = termination.escalation(), if termination.pending() => {
                    termination.kill(&mut child);
                }
            }
        };

        match status {
            Ok(status) => result.exit_status = Some(exit_code(status)),
            Err(err) => {
                result.error.get_or_insert(ExecutionError::Wait(err).into());
            }
        }

        match writer.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) if err.kind() == std::io::ErrorKind::BrokenPipe => {
                tracing::debug!(job_id = %job.id, "executor exited without reading all of stdin");
            }
            Ok(Err(err)) => {
                result.error.get_or_insert(ExecutionError::Stdin(err).into());
            }
            Err(join_err) => {
                result.error.get_or_insert(
                    ExecutionError::Stdin(std::io::Error::other(join_err.to_string())).into(),
                );
            }
        }

        result.elapsed = started.elapsed();
        result
    }
}

/// SIGTERM first, SIGKILL once the grace period is over.
///
/// Executors lead their own process group, and both signals go to the whole
/// group so descendants holding stdout open die with the executor.
struct Termination {
    grace: Duration,
    kill_at: Option<Instant>,
    killed: bool,
}

impl Termination {
    fn new(grace: Duration) -> Self {
        Self {
            grace,
            kill_at: None,
            killed: false,
        }
    }

    fn pending(&self) -> bool {
        self.kill_at.is_some() && !self.killed
    }

    async fn escalation(&self) {
        match self.kill_at {
            Some(at) => sleep_until(at).await,
            None => std::future::pending().await,
        }
    }

    fn terminate(&mut self, child: &mut Child) {
        if self.kill_at.is_some() {
            return;
        }
        self.kill_at = Some(Instant::now() + self.grace);

        let Some(pgid) = group_of(child) else {
            return;
        };
        if let Err(errno) = killpg(pgid, Signal::SIGTERM) {
            tracing::warn!(pgid = %pgid, %errno, "SIGTERM failed, killing executor");
            self.kill(child);
        }
    }

    fn kill(&mut self, child: &mut Child) {
        self.killed = true;
        if let Some(pgid) = group_of(child) {
            match killpg(pgid, Signal::SIGKILL) {
                Ok(()) => {
                    tracing::warn!(pgid = %pgid, "executor ignored SIGTERM, sent SIGKILL");
                    return;
                }
                Err(errno) => tracing::warn!(pgid = %pgid, %errno, "SIGKILL to process group failed"),
            }
        }
        if let Err(err) = child.start_kill() {
            tracing::warn!(error = %err, "failed to kill executor");
        }
    }
}

/// Process group led by `child`, unless it has already been reaped.
fn group_of(child: &Child) -> Option<Pid> {
    #[allow(clippy::cast_possible_wrap)]
    child.id().map(|pid| Pid::from_raw(pid as i32))
}

/// Exit code, or `128 + signal` for a process killed by a signal.
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> ProcessExecutor {
        ProcessExecutor::new(ExecutorCommand::new("sh", ["-c", script]))
            .with_kill_grace(Duration::from_millis(300))
    }

    fn in_secs(secs: u64) -> Instant {
        Instant::now() + Duration::from_secs(secs)
    }

    #[test]
    fn test_command_from_config() {
        let config = BrokerConfig::default();
        let command = ExecutorCommand::from_config(&config);

        assert_eq!(command.program, PathBuf::from("/usr/bin/php"));
        assert_eq!(
            command.args,
            vec![
                OsString::from("-c"),
                OsString::from("/etc/php.ini"),
                OsString::from("index.php"),
                OsString::from("/Core/Job/Console"),
            ]
        );
        assert_eq!(
            command.to_string(),
            "/usr/bin/php -c /etc/php.ini index.php /Core/Job/Console"
        );
    }

    #[tokio::test]
    async fn test_body_is_piped_to_stdin() {
        let job = Job::new(1, "a:1:{s:6:\"domain\";s:4:\"acme\";}");
        let result = sh("cat").execute(&job, Path::new("/"), in_secs(10)).await;

        assert!(result.executed);
        assert!(!result.timed_out);
        assert!(result.error.is_none(), "{:?}", result.error);
        assert_eq!(result.exit_status, Some(0));
        assert_eq!(result.stdout, job.body);
    }

    #[tokio::test]
    async fn test_runs_in_working_directory() {
        let job = Job::new(2, "");
        let result = sh("pwd").execute(&job, Path::new("/"), in_secs(10)).await;

        assert_eq!(result.stdout_lossy().trim(), "/");
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_not_an_error() {
        let job = Job::new(3, "");
        let result = sh("echo failing; exit 3")
            .execute(&job, Path::new("/"), in_secs(10))
            .await;

        assert_eq!(result.exit_status, Some(3));
        assert!(result.error.is_none());
        assert_eq!(result.stdout_lossy(), "failing\n");
    }

    #[tokio::test]
    async fn test_deadline_terminates_executor() {
        let job = Job::new(4, "");
        let started = Instant::now();
        let result = sh("echo started; exec sleep 30")
            .execute(&job, Path::new("/"), Instant::now() + Duration::from_millis(200))
            .await;

        assert!(result.timed_out);
        assert_eq!(result.exit_status, Some(128 + 15));
        assert_eq!(result.stdout_lossy(), "started\n");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_deadline_terminates_descendants() {
        let job = Job::new(9, "");
        let started = Instant::now();
        let result = sh("echo started; sleep 30; echo done")
            .execute(&job, Path::new("/"), Instant::now() + Duration::from_millis(200))
            .await;

        assert!(result.timed_out);
        assert_eq!(result.stdout_lossy(), "started\n");
        assert!(started.elapsed() < Duration::from_secs(5), "{:?}", started.elapsed());
    }

    #[tokio::test]
    async fn test_orphaned_descendant_holding_stdout_is_terminated() {
        let job = Job::new(10, "");
        let started = Instant::now();
        let result = sh("(sleep 30; echo late) & echo started; exit 0")
            .execute(&job, Path::new("/"), Instant::now() + Duration::from_millis(300))
            .await;

        assert!(result.timed_out);
        assert_eq!(result.exit_status, Some(0));
        assert_eq!(result.stdout_lossy(), "started\n");
        assert!(started.elapsed() < Duration::from_secs(5), "{:?}", started.elapsed());
    }

    #[tokio::test]
    async fn test_sigterm_resistant_executor_is_killed() {
        let job = Job::new(5, "");
        let started = Instant::now();
        let result = sh("trap '' TERM; while :; do sleep 0.05; done")
            .execute(&job, Path::new("/"), Instant::now() + Duration::from_millis(100))
            .await;

        assert!(result.timed_out);
        assert_eq!(result.exit_status, Some(128 + 9));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_fast_executor_is_never_terminated() {
        let job = Job::new(6, "");
        let result = sh("sleep 0.1; exit 0")
            .execute(&job, Path::new("/"), Instant::now() + Duration::from_secs(2))
            .await;

        assert!(!result.timed_out);
        assert_eq!(result.exit_status, Some(0));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let executor = ProcessExecutor::new(ExecutorCommand::new(
            "/nonexistent/tubebroker-executor",
            Vec::<String>::new(),
        ));
        let job = Job::new(7, "");
        let result = executor.execute(&job, Path::new("/"), in_secs(1)).await;

        assert!(result.executed);
        assert_eq!(result.exit_status, None);
        assert!(matches!(
            result.error,
            Some(crate::job::AttemptError::Execution(ExecutionError::Spawn { .. }))
        ));
    }

    #[tokio::test]
    async fn test_executor_ignoring_stdin_is_fine() {
        let job = Job::new(8, vec![b'x'; 1 << 20]);
        let result = sh("exit 0").execute(&job, Path::new("/"), in_secs(10)).await;

        assert_eq!(result.exit_status, Some(0));
        assert!(result.error.is_none(), "{:?}", result.error);
    }
}
