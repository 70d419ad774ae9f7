//! tubebroker - beanstalkd tube consumer running every job through an
//! external executor process.
//!
//! Jobs are reserved from one or more tubes, routed to a working directory by
//! the `domain` key of their PHP-serialized body, executed under the
//! reservation's time-to-run, and then deleted, released with a backoff, or
//! left for the server to redeliver.
//!
//! # Core Concepts
//!
//! - **Queue**: [`QueueConnection`] and [`Connector`] abstract the queue
//!   server; [`BeanstalkConnector`] speaks the beanstalkd text protocol.
//!
//! - **Policy**: [`RetryPolicy`] turns a job's retry counters and the outcome
//!   of its execution into a [`Disposition`].
//!
//! - **Execution**: [`JobExecutor`] runs a job under a deadline;
//!   [`ProcessExecutor`] spawns the configured interpreter.
//!
//! - **Runtime**: a [`Dispatcher`] owns the watched tubes and starts a fixed
//!   number of [`Worker`]s per tube, each on its own connection.
//!
//! # Feature Flags
//!
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tubebroker::*;
//!
//! let config = BrokerConfig::default();
//! let dispatcher = Arc::new(
//!     ProcessDispatcherBuilder::from_config(&config)?
//!         .with_connector(Arc::new(BeanstalkConnector::new(&config.address)))
//!         .build()?,
//! );
//! dispatcher.watch("default");
//! dispatcher.shutdown().await;
//! ```

/// beanstalkd protocol client.
pub mod beanstalk;

/// Broker configuration and validation.
pub mod config;

/// Job identifiers, bodies, retry history and attempt results.
pub mod job;

/// Job lifecycle policy.
///
/// The `lifecycle` module decides, from a job's retry counters and the
/// outcome of its execution, whether it is deleted, released with a backoff
/// of `releases^4` seconds, abandoned, or left for redelivery.
pub mod lifecycle;

#[cfg(feature = "metrics")]
/// Prometheus metrics.
pub mod metrics;

/// Routing-key extraction from job bodies.
///
/// The `payload` module reads the `domain` entry of a PHP-serialized job body
/// and maps it to the working directory the executor runs in.
pub mod payload;

/// Queue server contract.
///
/// The `queue` module defines [`QueueConnection`] and [`Connector`], the
/// [`QueueError`] taxonomy, and [`reserve_job`] which absorbs transient
/// reserve answers.
pub mod queue;

/// Runtime: supervisor, workers and dispatcher.
///
/// Includes:
/// - [`ProcessExecutor`] - runs one job as a child process under a deadline
/// - [`Worker`] - reserve, decide, execute, resolve loop for one tube
/// - [`Dispatcher`] - owns watched tubes and their workers
/// - [`ShutdownToken`] - graceful shutdown signaling
/// - Builders for constructing dispatchers
pub mod runtime;

/// Tracing spans and lifecycle events.
pub mod telemetry;

pub use beanstalk::{BeanstalkConnection, BeanstalkConnector, JobStats};
pub use config::*;
pub use job::*;
pub use lifecycle::*;
pub use payload::*;
pub use queue::*;
pub use runtime::*;
