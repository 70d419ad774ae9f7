use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use tubebroker::{BeanstalkConnector, BrokerConfig, ProcessDispatcherBuilder, DEFAULT_ADDRESS};

/// Consume beanstalkd tubes and run every job through a PHP controller.
#[derive(Debug, Parser)]
#[command(name = "tubebroker")]
#[command(version, about, long_about = None)]
struct Args {
    /// beanstalkd TCP address.
    #[arg(long, env = "TUBEBROKER_ADDRESS", default_value = DEFAULT_ADDRESS)]
    address: String,

    /// PHP binary to use.
    #[arg(long = "php", default_value = "/usr/bin/php")]
    php_binary: PathBuf,

    /// php.ini file to use for configuration.
    #[arg(long, default_value = "/etc/php.ini")]
    php_ini: PathBuf,

    /// Directory where instances are located.
    #[arg(long, default_value = "/var/www/html")]
    instance_root: PathBuf,

    /// Directory where the cluster is located.
    #[arg(long, default_value = "/opt/cluster")]
    cluster_root: PathBuf,

    /// Controller that will handle the job.
    #[arg(long, default_value = "/Core/Job/Console")]
    controller: String,

    /// Delay used when an exhausted job is re-queued.
    #[arg(long, default_value = "1m", value_parser = humantime::parse_duration)]
    requeue_delay: Duration,

    /// Listen to all tubes instead of --tubes.
    #[arg(long)]
    all: bool,

    /// Number of workers per tube.
    #[arg(long, default_value_t = 1)]
    per_tube: usize,

    /// Comma separated list of tubes.
    #[arg(long, value_delimiter = ',', default_value = "default")]
    tubes: Vec<String>,

    /// Timeout of a single reserve call.
    #[arg(long, default_value = "1h", value_parser = humantime::parse_duration)]
    reserve_timeout: Duration,

    /// Margin added to a job's time-left before its executor is stopped.
    #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
    ttr_margin: Duration,

    /// Time between SIGTERM and SIGKILL for an executor past its deadline.
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    kill_grace: Duration,

    /// Interval between tube discovery polls with --all.
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    discovery_interval: Duration,

    /// Log filter used when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON.
    #[arg(long)]
    log_json: bool,
}

impl Args {
    fn into_config(self) -> BrokerConfig {
        BrokerConfig {
            address: self.address,
            all: self.all,
            per_tube: self.per_tube,
            tubes: self
                .tubes
                .into_iter()
                .map(|tube| tube.trim().to_string())
                .filter(|tube| !tube.is_empty())
                .collect(),
            php_binary: self.php_binary,
            php_ini: self.php_ini,
            instance_root: self.instance_root,
            cluster_root: self.cluster_root,
            controller: self.controller,
            requeue_delay: self.requeue_delay,
            reserve_timeout: self.reserve_timeout,
            ttr_margin: self.ttr_margin,
            kill_grace: self.kill_grace,
            discovery_interval: self.discovery_interval,
        }
    }
}

fn init_tracing(log_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// SIGINT, SIGTERM and SIGQUIT, installed once for the life of the process.
#[cfg(unix)]
struct ShutdownSignals {
    sigint: tokio::signal::unix::Signal,
    sigterm: tokio::signal::unix::Signal,
    sigquit: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl ShutdownSignals {
    fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
            sigquit: signal(SignalKind::quit())?,
        })
    }

    async fn recv(&mut self) {
        tokio::select! {
            _ = self.sigint.recv() => {},
            _ = self.sigterm.recv() => {},
            _ = self.sigquit.recv() => {},
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Drain {
    Complete,
    Forced,
}

/// Wait for `shutdown` unless `interrupt` fires first.
async fn drain_or_force<S, I>(shutdown: S, interrupt: I) -> Drain
where
    S: Future<Output = ()>,
    I: Future<Output = ()>,
{
    tokio::select! {
        _ = shutdown => Drain::Complete,
        _ = interrupt => Drain::Forced,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level, args.log_json);

    let config = args.into_config();
    #[cfg(feature = "metrics")]
    tubebroker::metrics::init_metrics().context("failed to register metrics")?;

    let connector = Arc::new(BeanstalkConnector::new(&config.address));
    let dispatcher = Arc::new(
        ProcessDispatcherBuilder::from_config(&config)?
            .with_connector(connector)
            .build()
            .context("failed to build dispatcher")?,
    );

    info!(
        address = %config.address,
        per_tube = config.per_tube,
        all = config.all,
        "starting tubebroker"
    );
    if config.all {
        dispatcher.watch_all();
    } else {
        for tube in &config.tubes {
            dispatcher.watch(tube);
        }
    }

    let mut signals = ShutdownSignals::install().context("failed to install signal handlers")?;
    tokio::select! {
        _ = signals.recv() => {
            info!(
                reserve_timeout = %humantime::format_duration(config.reserve_timeout),
                "shutdown signal received; running jobs finish and idle workers stop \
                 when their reserve call returns, signal again to exit now"
            );
        }
        _ = dispatcher.wait() => {
            warn!("every worker has stopped");
        }
    }

    match drain_or_force(dispatcher.shutdown(), signals.recv()).await {
        Drain::Complete => {
            info!("tubebroker stopped");
            Ok(())
        }
        Drain::Forced => {
            warn!(
                active = dispatcher.active_tasks(),
                "second signal received, exiting without waiting for workers"
            );
            anyhow::bail!("forced shutdown")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_map_onto_config() {
        let args = Args::parse_from([
            "tubebroker",
            "--address",
            "10.0.0.5:11300",
            "--tubes",
            "emails, pdf,,",
            "--per-tube",
            "3",
            "--requeue-delay",
            "90s",
        ]);
        let config = args.into_config();

        assert_eq!(config.address, "10.0.0.5:11300");
        assert_eq!(config.tubes, vec!["emails".to_string(), "pdf".to_string()]);
        assert_eq!(config.per_tube, 3);
        assert_eq!(config.requeue_delay, Duration::from_secs(90));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults_match_broker_config() {
        let config = Args::parse_from(["tubebroker"]).into_config();
        let defaults = BrokerConfig::default();

        assert_eq!(config.address, defaults.address);
        assert_eq!(config.tubes, defaults.tubes);
        assert_eq!(config.php_binary, defaults.php_binary);
        assert_eq!(config.controller, defaults.controller);
        assert_eq!(config.reserve_timeout, defaults.reserve_timeout);
        assert_eq!(config.kill_grace, defaults.kill_grace);
    }

    #[tokio::test]
    async fn test_shutdown_completes_without_interrupt() {
        let drain = drain_or_force(async {}, std::future::pending()).await;
        assert_eq!(drain, Drain::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_signal_cuts_shutdown_short() {
        let shutdown = tokio::time::sleep(Duration::from_secs(3600));
        let interrupt = tokio::time::sleep(Duration::from_secs(1));
        let started = tokio::time::Instant::now();

        assert_eq!(drain_or_force(shutdown, interrupt).await, Drain::Forced);
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
