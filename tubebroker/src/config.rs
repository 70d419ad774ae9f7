use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default beanstalkd address.
pub const DEFAULT_ADDRESS: &str = "127.0.0.1:11300";

/// Runtime configuration for the broker.
///
/// Usually produced by the command line parser in `main.rs`, but every field
/// has a default so tests can build one with struct update syntax.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// The beanstalkd TCP address.
    pub address: String,
    /// Watch every tube on the server instead of `tubes`.
    pub all: bool,
    /// Number of workers servicing each tube concurrently.
    pub per_tube: usize,
    /// Tubes to watch when `all` is false.
    pub tubes: Vec<String>,
    /// Interpreter used to run each job.
    pub php_binary: PathBuf,
    /// Configuration file handed to the interpreter with `-c`.
    pub php_ini: PathBuf,
    /// Directory holding one checkout per instance domain.
    pub instance_root: PathBuf,
    /// Directory holding the cluster checkout.
    pub cluster_root: PathBuf,
    /// Controller that will handle the job.
    pub controller: String,
    /// Delay used when a job is re-queued without being executed.
    #[serde(with = "humantime_serde")]
    pub requeue_delay: Duration,
    /// Timeout of a single `reserve-with-timeout` call.
    #[serde(with = "humantime_serde")]
    pub reserve_timeout: Duration,
    /// Added to the reported time-left when arming the execution deadline.
    #[serde(with = "humantime_serde")]
    pub ttr_margin: Duration,
    /// Time between SIGTERM and SIGKILL for an executor past its deadline.
    #[serde(with = "humantime_serde")]
    pub kill_grace: Duration,
    /// Interval between `list-tubes` polls in all-tubes mode.
    #[serde(with = "humantime_serde")]
    pub discovery_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            all: false,
            per_tube: 1,
            tubes: vec!["default".to_string()],
            php_binary: PathBuf::from("/usr/bin/php"),
            php_ini: PathBuf::from("/etc/php.ini"),
            instance_root: PathBuf::from("/var/www/html"),
            cluster_root: PathBuf::from("/opt/cluster"),
            controller: "/Core/Job/Console".to_string(),
            requeue_delay: Duration::from_secs(60),
            reserve_timeout: Duration::from_secs(60 * 60),
            ttr_margin: Duration::from_secs(1),
            kill_grace: Duration::from_secs(10),
            discovery_interval: Duration::from_secs(10),
        }
    }
}

impl BrokerConfig {
    /// Check that every required setting is present.
    ///
    /// All problems are collected so the operator sees them in one go.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.address.trim().is_empty() {
            problems.push("address must not be empty (use --address)".to_string());
        }
        if self.php_binary.as_os_str().is_empty() {
            problems.push("path to PHP binary must not be empty (use --php)".to_string());
        }
        if self.php_ini.as_os_str().is_empty() {
            problems.push("path to PHP ini file must not be empty (use --php-ini)".to_string());
        }
        if self.instance_root.as_os_str().is_empty() {
            problems
                .push("instance root path must not be empty (use --instance-root)".to_string());
        }
        if self.cluster_root.as_os_str().is_empty() {
            problems.push("path to cluster must not be empty (use --cluster-root)".to_string());
        }
        if self.controller.trim().is_empty() {
            problems.push("controller must not be empty (use --controller)".to_string());
        }
        if self.per_tube == 0 {
            problems.push("per-tube worker count must be at least 1 (use --per-tube)".to_string());
        }
        if !self.all && self.tubes.iter().all(|t| t.trim().is_empty()) {
            problems.push("at least one tube is required unless --all is set".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError { problems })
        }
    }

    /// Set the workers-per-tube count.
    pub fn with_per_tube(mut self, per_tube: usize) -> Self {
        self.per_tube = per_tube;
        self
    }

    /// Set the requeue delay.
    pub fn with_requeue_delay(mut self, delay: Duration) -> Self {
        self.requeue_delay = delay;
        self
    }

    /// Set the reserve timeout.
    pub fn with_reserve_timeout(mut self, timeout: Duration) -> Self {
        self.reserve_timeout = timeout;
        self
    }

    /// Set the discovery interval.
    pub fn with_discovery_interval(mut self, interval: Duration) -> Self {
        self.discovery_interval = interval;
        self
    }
}

/// Invalid broker configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid configuration:\n{}", problems.join("\n"))]
pub struct ConfigError {
    /// One message per rejected setting.
    pub problems: Vec<String>,
}

pub(crate) mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
