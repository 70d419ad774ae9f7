//! beanstalkd client over the plain text protocol.
//!
//! Only the commands a consumer needs are spoken: `watch`, `ignore`,
//! `reserve-with-timeout`, `release`, `delete`, `stats-job` and `list-tubes`.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::job::{Job, JobHistory, JobId};
use crate::queue::{Connector, QueueConnection, QueueError};

/// Timeout for establishing the TCP connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Tube every new connection watches.
const DEFAULT_TUBE: &str = "default";

/// Largest body accepted in a single response.
const MAX_BODY_LEN: usize = 64 * 1024 * 1024;

/// Longest reply line accepted, CRLF included.
const MAX_LINE_LEN: usize = 1024;

/// Answers that mean the server rejected the command itself.
const SERVER_ERRORS: &[&str] = &[
    "OUT_OF_MEMORY",
    "INTERNAL_ERROR",
    "BAD_FORMAT",
    "UNKNOWN_COMMAND",
    "DRAINING",
    "JOB_TOO_BIG",
    "EXPECTED_CRLF",
];

/// Subset of the `stats-job` YAML document.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "kebab-case")]
pub struct JobStats {
    pub id: u64,
    pub tube: String,
    pub state: String,
    pub pri: u32,
    pub ttr: u64,
    pub time_left: u64,
    pub reserves: u64,
    pub timeouts: u64,
    pub releases: u64,
    pub buries: u64,
}

/// Dials [`BeanstalkConnection`]s to one server.
#[derive(Clone, Debug)]
pub struct BeanstalkConnector {
    address: String,
    connect_timeout: Duration,
}

impl BeanstalkConnector {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl Connector for BeanstalkConnector {
    type Connection = BeanstalkConnection;

    async fn connect(&self) -> Result<BeanstalkConnection, QueueError> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| {
                QueueError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connecting to {} timed out", self.address),
                ))
            })??;
        stream.set_nodelay(true)?;
        tracing::debug!(address = %self.address, "connected to beanstalkd");
        Ok(BeanstalkConnection::new(stream))
    }
}

/// One beanstalkd connection.
#[derive(Debug)]
pub struct BeanstalkConnection {
    stream: BufStream<TcpStream>,
}

impl BeanstalkConnection {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream: BufStream::new(stream),
        }
    }

    /// Fetch the `stats-job` document for `id`.
    pub async fn stats_job(&mut self, id: JobId) -> Result<JobStats, QueueError> {
        let line = self.command(&format!("stats-job {id}")).await?;
        let body = self.expect_ok(&line, Some(id)).await?;
        serde_yaml::from_slice(&body)
            .map_err(|err| QueueError::Protocol(format!("invalid stats-job document: {err}")))
    }

    async fn command(&mut self, command: &str) -> Result<String, QueueError> {
        tracing::trace!(command, "beanstalkd request");
        self.stream.write_all(command.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;
        self.stream.flush().await?;
        self.read_line().await
    }

    async fn read_line(&mut self) -> Result<String, QueueError> {
        let mut line = String::new();
        let read = (&mut self.stream)
            .take(MAX_LINE_LEN as u64)
            .read_line(&mut line)
            .await?;
        if read == 0 {
            return Err(QueueError::Disconnected);
        }
        match line.strip_suffix("\r\n") {
            Some(trimmed) => Ok(trimmed.to_string()),
            None if read >= MAX_LINE_LEN => Err(QueueError::Protocol(format!(
                "reply line longer than {MAX_LINE_LEN} bytes"
            ))),
            None => Err(QueueError::Protocol(format!("unterminated reply {line:?}"))),
        }
    }

    async fn read_body(&mut self, len: usize) -> Result<Vec<u8>, QueueError> {
        if len > MAX_BODY_LEN {
            return Err(QueueError::Protocol(format!("body of {len} bytes is too large")));
        }
        let mut body = vec![0u8; len + 2];
        self.stream.read_exact(&mut body).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                QueueError::Disconnected
            } else {
                QueueError::Io(err)
            }
        })?;
        if !body.ends_with(b"\r\n") {
            return Err(QueueError::Protocol("body not terminated by CRLF".into()));
        }
        body.truncate(len);
        Ok(body)
    }

    /// Read the body announced by an `OK <bytes>` reply.
    async fn expect_ok(&mut self, line: &str, id: Option<JobId>) -> Result<Vec<u8>, QueueError> {
        let mut words = line.split_ascii_whitespace();
        match (words.next(), words.next()) {
            (Some("OK"), Some(len)) => {
                let len = parse_number(len, line)?;
                self.read_body(len).await
            }
            _ => Err(unexpected(line, id)),
        }
    }

    async fn watch(&mut self, tube: &str) -> Result<(), QueueError> {
        let line = self.command(&format!("watch {tube}")).await?;
        if line.starts_with("WATCHING ") {
            Ok(())
        } else {
            Err(unexpected(&line, None))
        }
    }

    async fn ignore(&mut self, tube: &str) -> Result<(), QueueError> {
        let line = self.command(&format!("ignore {tube}")).await?;
        if line.starts_with("WATCHING ") {
            Ok(())
        } else {
            Err(unexpected(&line, None))
        }
    }
}

#[async_trait]
impl QueueConnection for BeanstalkConnection {
    async fn watch_only(&mut self, tube: &str) -> Result<(), QueueError> {
        self.watch(tube).await?;
        if tube != DEFAULT_TUBE {
            self.ignore(DEFAULT_TUBE).await?;
        }
        Ok(())
    }

    async fn reserve(&mut self, timeout: Duration) -> Result<Job, QueueError> {
        let line = self
            .command(&format!("reserve-with-timeout {}", whole_seconds(timeout)))
            .await?;
        let mut words = line.split_ascii_whitespace();
        match (words.next(), words.next(), words.next()) {
            (Some("RESERVED"), Some(id), Some(len)) => {
                let id = JobId(parse_number(id, &line)?);
                let len = parse_number(len, &line)?;
                let body = self.read_body(len).await?;
                Ok(Job::new(id, body))
            }
            (Some("TIMED_OUT"), None, None) => Err(QueueError::Timeout),
            (Some("DEADLINE_SOON"), None, None) => Err(QueueError::DeadlineSoon),
            _ => Err(unexpected(&line, None)),
        }
    }

    async fn release(&mut self, id: JobId, delay: Duration) -> Result<(), QueueError> {
        let priority = self.stats_job(id).await?.pri;
        let line = self
            .command(&format!("release {id} {priority} {}", whole_seconds(delay)))
            .await?;
        match line.as_str() {
            "RELEASED" => Ok(()),
            "BURIED" => Err(QueueError::Server("BURIED".into())),
            _ => Err(unexpected(&line, Some(id))),
        }
    }

    async fn delete(&mut self, id: JobId) -> Result<(), QueueError> {
        let line = self.command(&format!("delete {id}")).await?;
        match line.as_str() {
            "DELETED" => Ok(()),
            _ => Err(unexpected(&line, Some(id))),
        }
    }

    async fn time_left(&mut self, id: JobId) -> Result<Duration, QueueError> {
        Ok(Duration::from_secs(self.stats_job(id).await?.time_left))
    }

    async fn timeouts(&mut self, id: JobId) -> Result<u64, QueueError> {
        Ok(self.stats_job(id).await?.timeouts)
    }

    async fn releases(&mut self, id: JobId) -> Result<u64, QueueError> {
        Ok(self.stats_job(id).await?.releases)
    }

    async fn list_tubes(&mut self) -> Result<Vec<String>, QueueError> {
        let line = self.command("list-tubes").await?;
        let body = self.expect_ok(&line, None).await?;
        serde_yaml::from_slice(&body)
            .map_err(|err| QueueError::Protocol(format!("invalid list-tubes document: {err}")))
    }

    async fn history(&mut self, id: JobId) -> Result<JobHistory, QueueError> {
        let stats = self.stats_job(id).await?;
        Ok(JobHistory::new(stats.timeouts, stats.releases))
    }
}

/// Seconds for a protocol argument, rounding sub-second remainders up.
fn whole_seconds(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

fn parse_number<T: std::str::FromStr>(word: &str, line: &str) -> Result<T, QueueError> {
    word.parse()
        .map_err(|_| QueueError::Protocol(format!("bad number in reply {line:?}")))
}

fn unexpected(line: &str, id: Option<JobId>) -> QueueError {
    match (line, id) {
        ("NOT_FOUND", Some(id)) => QueueError::NotFound(id),
        _ if SERVER_ERRORS.contains(&line) => QueueError::Server(line.to_string()),
        _ => QueueError::Protocol(format!("unexpected reply {line:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Accept one connection and answer each expected command in order.
    async fn serve(script: Vec<(&'static str, &'static [u8])>) -> (String, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut socket = BufReader::new(socket);
            for (expected, reply) in script {
                let mut line = String::new();
                socket.read_line(&mut line).await.unwrap();
                assert_eq!(line, format!("{expected}\r\n"));
                socket.get_mut().write_all(reply).await.unwrap();
            }
        });
        (address, handle)
    }

    async fn connect(address: &str) -> BeanstalkConnection {
        BeanstalkConnector::new(address).connect().await.unwrap()
    }

    const STATS: &[u8] = b"OK 140\r\n---\nid: 7\ntube: emails\nstate: reserved\npri: 42\nage: 3\ndelay: 0\nttr: 60\ntime-left: 58\nreserves: 2\ntimeouts: 1\nreleases: 3\nburies: 0\nkicks: 0\n\r\n";

    #[test]
    fn test_stats_fixture_length() {
        let body_len = STATS.len() - b"OK 140\r\n".len() - 2;
        assert_eq!(body_len, 140);
    }

    #[tokio::test]
    async fn test_reserve_reads_body() {
        let (address, server) = serve(vec![(
            "reserve-with-timeout 3600",
            b"RESERVED 7 11\r\nhello\r\nbody\r\n",
        )])
        .await;

        let mut conn = connect(&address).await;
        let job = conn.reserve(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(job.id, JobId(7));
        assert_eq!(job.body, b"hello\r\nbody");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_endless_reply_line_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 64];
            let _ = socket.read(&mut request).await.unwrap();
            socket.write_all(&vec![b'x'; 256 * 1024]).await.unwrap();
            // Keep the connection open; the client must give up on its own.
            std::future::pending::<()>().await;
        });

        let mut conn = connect(&address).await;
        let reserved = tokio::time::timeout(
            Duration::from_secs(5),
            conn.reserve(Duration::from_secs(1)),
        )
        .await
        .expect("reply line is bounded");
        assert!(matches!(reserved, Err(QueueError::Protocol(_))));
        server.abort();
    }

    #[tokio::test]
    async fn test_reserve_transient_answers() {
        let (address, server) = serve(vec![
            ("reserve-with-timeout 1", b"TIMED_OUT\r\n"),
            ("reserve-with-timeout 1", b"DEADLINE_SOON\r\n"),
        ])
        .await;

        let mut conn = connect(&address).await;
        let timeout = Duration::from_millis(250);
        assert!(matches!(conn.reserve(timeout).await, Err(QueueError::Timeout)));
        assert!(matches!(conn.reserve(timeout).await, Err(QueueError::DeadlineSoon)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_stats_job_feeds_counters() {
        let (address, server) = serve(vec![("stats-job 7", STATS), ("stats-job 7", STATS)]).await;

        let mut conn = connect(&address).await;
        assert_eq!(conn.history(JobId(7)).await.unwrap(), JobHistory::new(1, 3));
        assert_eq!(
            conn.time_left(JobId(7)).await.unwrap(),
            Duration::from_secs(58)
        );
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_release_keeps_priority() {
        let (address, server) = serve(vec![
            ("stats-job 7", STATS),
            ("release 7 42 81", b"RELEASED\r\n"),
        ])
        .await;

        let mut conn = connect(&address).await;
        conn.release(JobId(7), Duration::from_secs(81)).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_not_found() {
        let (address, server) = serve(vec![("delete 9", b"NOT_FOUND\r\n")]).await;

        let mut conn = connect(&address).await;
        let err = conn.delete(JobId(9)).await.unwrap_err();
        assert!(matches!(err, QueueError::NotFound(JobId(9))));
        assert!(!err.is_connection_fatal());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_list_tubes() {
        let (address, server) = serve(vec![(
            "list-tubes",
            b"OK 29\r\n---\n- default\n- emails\n- pdf\n\r\n",
        )])
        .await;

        let mut conn = connect(&address).await;
        assert_eq!(
            conn.list_tubes().await.unwrap(),
            vec!["default".to_string(), "emails".to_string(), "pdf".to_string()]
        );
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_watch_only_ignores_default() {
        let (address, server) = serve(vec![
            ("watch emails", b"WATCHING 2\r\n"),
            ("ignore default", b"WATCHING 1\r\n"),
        ])
        .await;

        let mut conn = connect(&address).await;
        conn.watch_only("emails").await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_server_error_is_not_fatal() {
        let (address, server) = serve(vec![("delete 3", b"INTERNAL_ERROR\r\n")]).await;

        let mut conn = connect(&address).await;
        let err = conn.delete(JobId(3)).await.unwrap_err();
        assert!(matches!(err, QueueError::Server(ref s) if s == "INTERNAL_ERROR"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_socket_is_disconnect() {
        let (address, server) = serve(vec![]).await;

        let mut conn = connect(&address).await;
        server.await.unwrap();
        let err = conn.reserve(Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_connection_fatal(), "{err:?}");
    }

    #[test]
    fn test_whole_seconds_rounds_up() {
        assert_eq!(whole_seconds(Duration::ZERO), 0);
        assert_eq!(whole_seconds(Duration::from_millis(1)), 1);
        assert_eq!(whole_seconds(Duration::from_secs(60)), 60);
        assert_eq!(whole_seconds(Duration::from_millis(1500)), 2);
    }
}
