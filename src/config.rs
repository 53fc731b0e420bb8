use std::{collections::HashMap, fmt::Debug, net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{anyhow, Result};
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;
use uuid::Uuid;

const LOCAL_ENV: &str = "local";
const ENV_PREFIX: &str = "FUNCHOST_";

/// Launch parameters for one language worker pool.
#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LanguageWorkerConfig {
    pub executable: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde_inline_default(1)]
    pub process_count: usize,
    #[serde_inline_default(10)]
    pub max_process_count: usize,
    /// Minimum spacing between two launches in the same pool.
    #[serde_inline_default(10_000)]
    pub process_startup_interval_ms: u64,
    /// Delay before replacing a worker that exited unexpectedly.
    #[serde_inline_default(10_000)]
    pub process_restart_interval_ms: u64,
    #[serde_inline_default(10_000)]
    pub process_shutdown_timeout_ms: u64,
    #[serde_inline_default(30_000)]
    pub handshake_timeout_ms: u64,
}

impl LanguageWorkerConfig {
    pub fn new(executable: &str) -> Self {
        Self {
            executable: executable.to_string(),
            arguments: Vec::new(),
            environment: HashMap::new(),
            process_count: 1,
            max_process_count: 10,
            process_startup_interval_ms: 10_000,
            process_restart_interval_ms: 10_000,
            process_shutdown_timeout_ms: 10_000,
            handshake_timeout_ms: 30_000,
        }
    }

    pub fn startup_interval(&self) -> Duration {
        Duration::from_millis(self.process_startup_interval_ms)
    }

    pub fn restart_interval(&self) -> Duration {
        Duration::from_millis(self.process_restart_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.process_shutdown_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn validate(&self, language: &str) -> Result<()> {
        if self.executable.is_empty() {
            return Err(anyhow!("worker {}: executable is empty", language));
        }
        if self.process_count == 0 {
            return Err(anyhow!("worker {}: process_count must be >= 1", language));
        }
        if self.process_count > self.max_process_count {
            return Err(anyhow!(
                "worker {}: process_count {} exceeds max_process_count {}",
                language,
                self.process_count,
                self.max_process_count
            ));
        }
        Ok(())
    }
}

#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostConfig {
    #[serde_inline_default(5)]
    pub max_build_attempts: u32,
    #[serde_inline_default(1_000)]
    pub backoff_min_ms: u64,
    #[serde_inline_default(120_000)]
    pub backoff_max_ms: u64,
    /// How long a superseded host may keep serving in-flight invocations.
    #[serde_inline_default(30_000)]
    pub restart_grace_period_ms: u64,
    /// Upper bound on waiting for a host or a ready worker during dispatch.
    #[serde_inline_default(30_000)]
    pub dispatch_timeout_ms: u64,
    /// 0 disables function metadata change detection.
    #[serde_inline_default(2_000)]
    pub file_watch_interval_ms: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            max_build_attempts: 5,
            backoff_min_ms: 1_000,
            backoff_max_ms: 120_000,
            restart_grace_period_ms: 30_000,
            dispatch_timeout_ms: 30_000,
            file_watch_interval_ms: 2_000,
        }
    }
}

impl HostConfig {
    pub fn restart_grace_period(&self) -> Duration {
        Duration::from_millis(self.restart_grace_period_ms)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }
}

#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DrainConfig {
    #[serde_inline_default(60_000)]
    pub drain_timeout_ms: u64,
    /// Trigger types that keep firing while the host drains.
    #[serde_inline_default(vec!["timerTrigger".to_string()])]
    pub drain_unaware_triggers: Vec<String>,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            drain_timeout_ms: 60_000,
            drain_unaware_triggers: vec!["timerTrigger".to_string()],
        }
    }
}

impl DrainConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn is_drain_aware(&self, trigger_type: &str) -> bool {
        !self
            .drain_unaware_triggers
            .iter()
            .any(|t| t.eq_ignore_ascii_case(trigger_type))
    }
}

#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsPublisherConfig {
    /// No path means publishing is disabled.
    #[serde(default)]
    pub metrics_path: Option<PathBuf>,
    #[serde_inline_default(5_000)]
    pub publish_interval_ms: u64,
    #[serde_inline_default(0)]
    pub initial_publish_delay_ms: u64,
    #[serde_inline_default(1_000)]
    pub minimum_activity_interval_ms: u64,
    #[serde_inline_default(100)]
    pub max_file_count: usize,
    #[serde(default)]
    pub always_ready: bool,
}

impl Default for MetricsPublisherConfig {
    fn default() -> Self {
        Self {
            metrics_path: None,
            publish_interval_ms: 5_000,
            initial_publish_delay_ms: 0,
            minimum_activity_interval_ms: 1_000,
            max_file_count: 100,
            always_ready: false,
        }
    }
}

impl MetricsPublisherConfig {
    pub fn publish_interval(&self) -> Duration {
        Duration::from_millis(self.publish_interval_ms)
    }
}

#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub enable_metrics: bool,
    // OpenTelemetry collector grpc endpoint. Defaults to the
    // OTEL_EXPORTER_OTLP_ENDPOINT env var or to localhost:4317 if empty.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde_inline_default(10)]
    pub metrics_interval_secs: u64,
    #[serde(default)]
    pub instance_id: Option<String>,
    /// Level for lines relayed from language workers, when RUST_LOG is unset.
    #[serde_inline_default("info".to_string())]
    pub worker_log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enable_metrics: false,
            endpoint: None,
            metrics_interval_secs: 10,
            instance_id: None,
            worker_log_level: "info".to_string(),
        }
    }
}

#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde_inline_default(LOCAL_ENV.to_string())]
    pub env: String,
    #[serde_inline_default("0.0.0.0:7071".to_string())]
    pub listen_addr: String,
    #[serde_inline_default(PathBuf::from("./functions"))]
    pub script_root: PathBuf,
    /// Boot into a generic standby host and wait for an assignment.
    #[serde(default)]
    pub placeholder_mode: bool,
    /// Runtime of the customer functions when known at boot.
    #[serde(default)]
    pub worker_runtime: Option<String>,
    #[serde(default)]
    pub workers: HashMap<String, LanguageWorkerConfig>,
    #[serde_inline_default(600)]
    pub worker_error_window_secs: u64,
    #[serde_inline_default(1_000)]
    pub capacity_check_interval_ms: u64,
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default)]
    pub drain: DrainConfig,
    #[serde(default)]
    pub metrics_publisher: MetricsPublisherConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            env: LOCAL_ENV.to_string(),
            listen_addr: "0.0.0.0:7071".to_string(),
            script_root: PathBuf::from("./functions"),
            placeholder_mode: false,
            worker_runtime: None,
            workers: HashMap::new(),
            worker_error_window_secs: 600,
            capacity_check_interval_ms: 1_000,
            host: HostConfig::default(),
            drain: DrainConfig::default(),
            metrics_publisher: MetricsPublisherConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_path(path: &str) -> Result<ServerConfig> {
        let config_str = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&config_str)
    }

    fn from_yaml_str(config_str: &str) -> Result<ServerConfig> {
        let config: ServerConfig = Figment::new()
            .merge(Yaml::string(config_str))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with `FUNCHOST_` environment variables.
    pub fn from_env() -> Result<ServerConfig> {
        let config: ServerConfig = Figment::from(Serialized::defaults(ServerConfig::default()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow!("invalid listen address: {}", self.listen_addr));
        }
        for (language, worker) in &self.workers {
            worker.validate(language)?;
        }
        if let Some(runtime) = &self.worker_runtime {
            if !self.workers.contains_key(runtime) {
                return Err(anyhow!(
                    "worker_runtime {} has no entry under workers",
                    runtime
                ));
            }
        }
        if self.host.max_build_attempts == 0 {
            return Err(anyhow!("host.max_build_attempts must be >= 1"));
        }
        if self.host.backoff_min_ms > self.host.backoff_max_ms {
            return Err(anyhow!("host.backoff_min_ms exceeds host.backoff_max_ms"));
        }
        if self.capacity_check_interval_ms == 0 {
            return Err(anyhow!("capacity_check_interval_ms must be > 0"));
        }
        if self.metrics_publisher.publish_interval_ms == 0 {
            return Err(anyhow!("metrics_publisher.publish_interval_ms must be > 0"));
        }
        if self.metrics_publisher.max_file_count == 0 {
            return Err(anyhow!("metrics_publisher.max_file_count must be > 0"));
        }
        Ok(())
    }

    pub fn structured_logging(&self) -> bool {
        self.env != LOCAL_ENV
    }

    pub fn instance_id(&self) -> String {
        self.telemetry
            .instance_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.env, Uuid::new_v4()))
    }

    pub fn worker_error_window(&self) -> Duration {
        Duration::from_secs(self.worker_error_window_secs)
    }

    pub fn capacity_check_interval(&self) -> Duration {
        Duration::from_millis(self.capacity_check_interval_ms)
    }
}
