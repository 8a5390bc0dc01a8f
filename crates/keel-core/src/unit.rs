//! ---
//! keel_section: "01-core-supervision"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Managed unit contract and lifecycle/health vocabularies."
//! keel_version: "v0.1.0"
//! keel_owner: "tbd"
//! ---
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::FutureExt;
use keel_common::ConfigView;
use semver::Version;
use serde::{Deserialize, Serialize};

/// Lifecycle position of a registered unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Registered,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Registered => "registered",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Failed => "failed",
        }
    }

    /// `starting` and `stopping` only exist while a supervisor action is in flight.
    pub fn is_transient(self) -> bool {
        matches!(self, LifecycleState::Starting | LifecycleState::Stopping)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Debounced health judgement stored in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Degraded,
    Failed,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Failed => "failed",
        }
    }

    /// Ordering used when folding several statuses into one overall status.
    pub(crate) fn severity(self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Unknown => 1,
            HealthStatus::Degraded => 2,
            HealthStatus::Failed => 3,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw outcome reported by a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    Healthy,
    Degraded,
    Failed,
    Critical,
    Unknown,
}

impl ProbeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProbeStatus::Healthy => "healthy",
            ProbeStatus::Degraded => "degraded",
            ProbeStatus::Failed => "failed",
            ProbeStatus::Critical => "critical",
            ProbeStatus::Unknown => "unknown",
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(self, ProbeStatus::Failed | ProbeStatus::Critical)
    }

    /// Map onto the registry vocabulary; `critical` collapses into `failed`.
    pub fn as_health(self) -> HealthStatus {
        match self {
            ProbeStatus::Healthy => HealthStatus::Healthy,
            ProbeStatus::Degraded => HealthStatus::Degraded,
            ProbeStatus::Failed | ProbeStatus::Critical => HealthStatus::Failed,
            ProbeStatus::Unknown => HealthStatus::Unknown,
        }
    }
}

impl fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload returned by [`ManagedUnit::health`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: ProbeStatus,
    #[serde(default)]
    pub detail: serde_json::Value,
}

impl HealthReport {
    pub fn new(status: ProbeStatus, detail: serde_json::Value) -> Self {
        Self { status, detail }
    }

    pub fn healthy() -> Self {
        Self::new(ProbeStatus::Healthy, serde_json::Value::Null)
    }

    pub fn degraded(detail: serde_json::Value) -> Self {
        Self::new(ProbeStatus::Degraded, detail)
    }

    pub fn failed(detail: serde_json::Value) -> Self {
        Self::new(ProbeStatus::Failed, detail)
    }
}

/// A component supervised by the kernel.
///
/// Errors and panics from `start`, `stop`, `health` and `recover` are treated as failure
/// signals by the supervisor and evaluator; they never propagate to the caller.
#[async_trait]
pub trait ManagedUnit: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> Version;

    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    /// Receives the `units.<name>` table of the kernel configuration.
    async fn configure(&self, _settings: &ConfigView) -> Result<()> {
        Ok(())
    }

    async fn boot(&self) -> Result<()> {
        Ok(())
    }

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    async fn health(&self) -> Result<HealthReport>;

    /// Attempt to repair the unit. `Ok(false)` means the unit declined or could not recover.
    async fn recover(&self) -> Result<bool> {
        Ok(true)
    }

    async fn shutdown(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }
}

/// Await a unit hook, converting a panic into an error.
pub(crate) async fn guarded<T, F>(hook: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(hook).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(anyhow!("unit panicked: {}", panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
