//! ---
//! keel_section: "04-configuration"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Typed kernel configuration with load-time validation."
//! keel_version: "v0.1.0"
//! keel_owner: "tbd"
//! ---
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use thiserror::Error;
use tracing::debug;

use crate::logging::LogFormat;
use crate::view::ConfigView;

fn default_kernel_name() -> String {
    "keel".to_owned()
}

fn default_actor() -> String {
    "system".to_owned()
}

fn default_max_restarts() -> u32 {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_millis(1_000)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(300)
}

fn default_restart_pause() -> Duration {
    Duration::from_millis(1_000)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_retries() -> u32 {
    3
}

fn default_retry_delay() -> Duration {
    Duration::from_millis(1_000)
}

fn default_probe_timeout() -> Duration {
    Duration::from_millis(5_000)
}

fn default_failure_threshold() -> usize {
    3
}

fn default_recovery_threshold() -> usize {
    2
}

fn default_window() -> usize {
    5
}

fn default_history_cap() -> usize {
    10
}

fn default_check_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_event_history() -> usize {
    100
}

fn default_handler_timeout() -> Duration {
    Duration::from_millis(100)
}

fn default_true() -> bool {
    true
}

fn default_redact_patterns() -> Vec<String> {
    ["password", "passwd", "secret", "key", "token"]
        .iter()
        .map(|p| (*p).to_owned())
        .collect()
}

fn default_roles() -> IndexMap<String, Vec<String>> {
    let mut roles = IndexMap::new();
    roles.insert("admin".to_owned(), vec!["*".to_owned()]);
    roles.insert(
        "operator".to_owned(),
        vec!["unit.*".to_owned(), "health.*".to_owned()],
    );
    roles.insert("viewer".to_owned(), vec!["health.read".to_owned()]);
    roles
}

fn default_actors() -> IndexMap<String, Vec<String>> {
    let mut actors = IndexMap::new();
    actors.insert(default_actor(), vec!["admin".to_owned()]);
    actors
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 9_797)
}

fn default_quarantine() -> Duration {
    Duration::from_secs(300)
}

fn default_backend_timeout() -> Duration {
    Duration::from_millis(2_000)
}

/// Raised when a loaded configuration violates a structural invariant.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid configuration value for `{key}`: {reason}")]
    Invalid { key: String, reason: String },
    #[error("resource `{resource}` references unknown connection `{connection}`")]
    UnknownConnection { resource: String, connection: String },
}

impl ConfigError {
    fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Root configuration object for the kernel and its collaborators.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct KernelConfig {
    #[serde(default)]
    pub kernel: KernelSection,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Free-form per-unit settings handed to `configure()`.
    #[serde(default)]
    pub units: IndexMap<String, toml::Table>,
    /// Replicated resources fronted by a failover policy.
    #[serde(default)]
    pub resources: IndexMap<String, ResourceConfig>,
}

/// Metadata describing where a [`KernelConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedKernelConfig {
    pub config: KernelConfig,
    pub source: PathBuf,
}

impl KernelConfig {
    pub const ENV_CONFIG_PATH: &'static str = "KEEL_CONFIG";

    /// Load configuration from disk, respecting the `KEEL_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration together with the path it was read from.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedKernelConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedKernelConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            let path = candidate.as_ref();
            if path.exists() {
                let config = Self::from_path(path)?;
                return Ok(LoadedKernelConfig {
                    config,
                    source: path.to_path_buf(),
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse::<Self>()
            .with_context(|| format!("failed to load config file {}", path.display()))
    }

    /// Settings table for the named unit, empty when the unit has none.
    pub fn unit_settings(&self, unit: &str) -> ConfigView {
        self.units
            .get(unit)
            .cloned()
            .map(ConfigView::from_table)
            .unwrap_or_default()
    }

    /// Dotted-path view over the whole configuration document.
    pub fn view(&self) -> Result<ConfigView> {
        let value = toml::Value::try_from(self).context("failed to serialise configuration")?;
        Ok(ConfigView::new(value))
    }

    /// Validate structural invariants once, at load time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.lifecycle.validate()?;
        self.health.validate()?;
        if self.events.history_cap == 0 {
            return Err(ConfigError::invalid(
                "events.history_cap",
                "must be at least 1",
            ));
        }
        self.security.validate()?;
        for (name, resource) in &self.resources {
            resource.validate(name)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for KernelConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: KernelConfig =
            toml::from_str(content).context("failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelSection {
    #[serde(default = "default_kernel_name")]
    pub name: String,
    /// Actor recorded against supervisor actions that carry no explicit caller.
    #[serde(default = "default_actor")]
    pub actor: String,
}

impl Default for KernelSection {
    fn default() -> Self {
        Self {
            name: default_kernel_name(),
            actor: default_actor(),
        }
    }
}

/// Backoff shape used by the recovery loop.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryStrategy {
    Linear,
    #[default]
    Exponential,
}

impl std::str::FromStr for RecoveryStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "linear" => Ok(RecoveryStrategy::Linear),
            "exponential" => Ok(RecoveryStrategy::Exponential),
            other => Err(format!("unknown recovery strategy: {}", other)),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default)]
    pub recovery_strategy: RecoveryStrategy,
    #[serde(rename = "base_delay_ms", default = "default_base_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub base_delay: Duration,
    #[serde(rename = "max_delay_ms", default = "default_max_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_delay: Duration,
    /// Pause between the stop and start halves of a restart.
    #[serde(rename = "restart_pause_ms", default = "default_restart_pause")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub restart_pause: Duration,
    #[serde(rename = "shutdown_timeout_ms", default = "default_shutdown_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub shutdown_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            recovery_strategy: RecoveryStrategy::default(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            restart_pause: default_restart_pause(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

impl LifecycleConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_delay < self.base_delay {
            return Err(ConfigError::invalid(
                "lifecycle.max_delay_ms",
                "must not be smaller than base_delay_ms",
            ));
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Probe attempts per `check()` call.
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(rename = "retry_delay_ms", default = "default_retry_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub retry_delay: Duration,
    #[serde(rename = "timeout_ms", default = "default_probe_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub timeout: Duration,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: usize,
    #[serde(default = "default_recovery_threshold")]
    pub recovery_threshold: usize,
    /// Number of newest history entries considered by the threshold scan.
    #[serde(default = "default_window")]
    pub window: usize,
    #[serde(default = "default_history_cap")]
    pub history_cap: usize,
    #[serde(rename = "interval_ms", default = "default_check_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub interval: Duration,
    #[serde(default)]
    pub auto_recover: bool,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            retry_delay: default_retry_delay(),
            timeout: default_probe_timeout(),
            failure_threshold: default_failure_threshold(),
            recovery_threshold: default_recovery_threshold(),
            window: default_window(),
            history_cap: default_history_cap(),
            interval: default_check_interval(),
            auto_recover: false,
        }
    }
}

impl HealthConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.retries == 0 {
            return Err(ConfigError::invalid("health.retries", "must be at least 1"));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::invalid(
                "health.timeout_ms",
                "must be greater than zero",
            ));
        }
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid(
                "health.failure_threshold",
                "must be at least 1",
            ));
        }
        if self.recovery_threshold == 0 {
            return Err(ConfigError::invalid(
                "health.recovery_threshold",
                "must be at least 1",
            ));
        }
        if self.window == 0 {
            return Err(ConfigError::invalid("health.window", "must be at least 1"));
        }
        if self.history_cap < self.window {
            return Err(ConfigError::invalid(
                "health.history_cap",
                format!("must be at least the window size ({})", self.window),
            ));
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_event_history")]
    pub history_cap: usize,
    /// Handlers running longer than this are reported as slow.
    #[serde(rename = "handler_timeout_ms", default = "default_handler_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub handler_timeout: Duration,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            history_cap: default_event_history(),
            handler_timeout: default_handler_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// NDJSON audit file; entries are kept in memory when unset.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_redact_patterns")]
    pub redact_patterns: Vec<String>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            redact_patterns: default_redact_patterns(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// When false every capability check passes.
    #[serde(default = "default_true")]
    pub enforce: bool,
    /// Role name to capability patterns (`unit.*`, `*`).
    #[serde(default = "default_roles")]
    pub roles: IndexMap<String, Vec<String>>,
    /// Actor name to role names.
    #[serde(default = "default_actors")]
    pub actors: IndexMap<String, Vec<String>>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enforce: true,
            roles: default_roles(),
            actors: default_actors(),
        }
    }
}

impl SecurityConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        for (role, capabilities) in &self.roles {
            if capabilities.iter().any(|c| c.trim().is_empty()) {
                return Err(ConfigError::invalid(
                    format!("security.roles.{role}"),
                    "capability patterns must not be empty",
                ));
            }
        }
        for (actor, roles) in &self.actors {
            if let Some(missing) = roles.iter().find(|r| !self.roles.contains_key(*r)) {
                return Err(ConfigError::invalid(
                    format!("security.actors.{actor}"),
                    format!("unknown role `{missing}`"),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_metrics_listen(),
        }
    }
}

/// Failover settings for one replicated resource.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Configured primary connection name.
    pub primary: String,
    /// Every connection the resource knows about.
    #[serde(default)]
    pub connections: IndexMap<String, BackendConfig>,
    /// Connections that are static failover candidates.
    #[serde(default)]
    pub replicas: Vec<String>,
    /// Units that must be running before this resource starts.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default = "default_true")]
    pub auto_promote: bool,
    #[serde(default)]
    pub preferred_tags: Vec<String>,
    #[serde(rename = "quarantine_ms", default = "default_quarantine")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub quarantine: Duration,
    #[serde(rename = "probe_timeout_ms", default = "default_backend_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub probe_timeout: Duration,
    /// JSON file holding operator-registered replicas.
    #[serde(default)]
    pub state_file: Option<PathBuf>,
}

impl ResourceConfig {
    /// Build a resource with the given primary and no connections.
    pub fn new(primary: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            connections: IndexMap::new(),
            replicas: Vec::new(),
            dependencies: Vec::new(),
            auto_promote: true,
            preferred_tags: Vec::new(),
            quarantine: default_quarantine(),
            probe_timeout: default_backend_timeout(),
            state_file: None,
        }
    }

    pub fn with_connection(mut self, name: impl Into<String>, backend: BackendConfig) -> Self {
        self.connections.insert(name.into(), backend);
        self
    }

    pub fn with_replica(mut self, name: impl Into<String>) -> Self {
        self.replicas.push(name.into());
        self
    }

    fn validate(&self, resource: &str) -> Result<(), ConfigError> {
        if !self.connections.contains_key(&self.primary) {
            return Err(ConfigError::UnknownConnection {
                resource: resource.to_owned(),
                connection: self.primary.clone(),
            });
        }
        if let Some(unknown) = self
            .replicas
            .iter()
            .find(|r| !self.connections.contains_key(*r))
        {
            return Err(ConfigError::UnknownConnection {
                resource: resource.to_owned(),
                connection: unknown.clone(),
            });
        }
        Ok(())
    }
}

/// Static attributes of one backend connection.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct BackendConfig {
    /// `host:port` used by network connectors.
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub weight: i64,
    #[serde(default)]
    pub auto_promote: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(rename = "lag_threshold_ms", default)]
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub lag_threshold: Option<Duration>,
}
