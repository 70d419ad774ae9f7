use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::BrokerConfig;
use crate::job::JobResult;
use crate::payload::WorkdirLayout;
use crate::queue::Connector;

use super::dispatcher::{Dispatcher, DispatcherConfig};
use super::supervisor::{JobExecutor, ProcessExecutor};

/// Builder for constructing a [`Dispatcher`] with explicit dependencies.
///
/// The connector, executor and working-directory layout are required; the
/// results channel is optional.
///
/// # Example
///
/// ```ignore
/// use tubebroker::*;
///
/// let dispatcher = DispatcherBuilder::new(DispatcherConfig::from_config(&config))
///     .with_connector(Arc::new(BeanstalkConnector::new(&config.address)))
///     .with_executor(Arc::new(ProcessExecutor::from_config(&config)))
///     .with_layout(WorkdirLayout::from_config(&config))
///     .build()?;
/// ```
pub struct DispatcherBuilder<C, E>
where
    C: Connector,
    E: JobExecutor,
{
    config: DispatcherConfig,
    connector: Option<Arc<C>>,
    executor: Option<Arc<E>>,
    layout: Option<WorkdirLayout>,
    results: Option<mpsc::Sender<JobResult>>,
}

impl<C, E> fmt::Debug for DispatcherBuilder<C, E>
where
    C: Connector,
    E: JobExecutor,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("DispatcherBuilder");
        debug.field("config", &self.config);
        debug.field("connector_set", &self.connector.is_some());
        debug.field("executor_set", &self.executor.is_some());
        debug.field("layout", &self.layout);
        debug.field("results_set", &self.results.is_some());

        if self.connector.is_some() {
            debug.field("connector_type", &type_name::<C>());
        }
        if self.executor.is_some() {
            debug.field("executor_type", &type_name::<E>());
        }

        debug.finish()
    }
}

impl<C, E> DispatcherBuilder<C, E>
where
    C: Connector,
    E: JobExecutor,
{
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            config,
            connector: None,
            executor: None,
            layout: None,
            results: None,
        }
    }

    /// Set the queue connector. Every worker dials its own connection.
    pub fn with_connector(mut self, connector: Arc<C>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Set the job executor.
    pub fn with_executor(mut self, executor: Arc<E>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Set the working-directory layout.
    pub fn with_layout(mut self, layout: WorkdirLayout) -> Self {
        self.layout = Some(layout);
        self
    }

    /// Receive a [`JobResult`] for every attempt.
    ///
    /// A slow consumer slows down every worker.
    pub fn with_results(mut self, results: mpsc::Sender<JobResult>) -> Self {
        self.results = Some(results);
        self
    }

    /// Build the `Dispatcher` with all configured dependencies.
    ///
    /// # Errors
    ///
    /// Returns an error if any required dependency is missing or the
    /// configuration is unusable.
    pub fn build(self) -> anyhow::Result<Dispatcher<C, E>> {
        if self.config.per_tube == 0 {
            anyhow::bail!("per_tube must be at least 1");
        }
        let connector = self
            .connector
            .ok_or_else(|| anyhow::anyhow!("connector dependency missing"))?;
        let executor = self
            .executor
            .ok_or_else(|| anyhow::anyhow!("executor dependency missing"))?;
        let layout = self
            .layout
            .ok_or_else(|| anyhow::anyhow!("layout dependency missing"))?;

        Ok(Dispatcher::new(
            self.config,
            connector,
            executor,
            Arc::new(layout),
            self.results,
        ))
    }
}

/// Convenience builder for a dispatcher running jobs as child processes.
///
/// Derives the executor and layout from a [`BrokerConfig`]; only the
/// connector has to be supplied.
pub struct ProcessDispatcherBuilder;

impl ProcessDispatcherBuilder {
    /// Validate `config` and prepare a builder for it.
    pub fn from_config<C: Connector>(
        config: &BrokerConfig,
    ) -> anyhow::Result<DispatcherBuilder<C, ProcessExecutor>> {
        config.validate()?;
        Ok(DispatcherBuilder::new(DispatcherConfig::from_config(config))
            .with_executor(Arc::new(ProcessExecutor::from_config(config)))
            .with_layout(WorkdirLayout::from_config(config)))
    }
}
