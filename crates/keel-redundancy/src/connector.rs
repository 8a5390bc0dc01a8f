//! ---
//! keel_section: "07-resilience-fault-tolerance"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Backend probing and connection contract."
//! keel_version: "v0.1.0"
//! keel_owner: "tbd"
//! ---
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_common::BackendConfig;
use serde::Serialize;
use tokio::net::TcpStream;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendHealth {
    Healthy,
    Unhealthy,
    Unknown,
}

/// Live health observation of one backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendSample {
    pub health: BackendHealth,
    pub last_error: Option<String>,
    /// Replication lag, when the connector can observe it.
    pub lag: Option<Duration>,
    pub latency: Option<Duration>,
    pub sampled_at: DateTime<Utc>,
}

impl BackendSample {
    pub fn healthy(latency: Option<Duration>, lag: Option<Duration>) -> Self {
        Self {
            health: BackendHealth::Healthy,
            last_error: None,
            lag,
            latency,
            sampled_at: Utc::now(),
        }
    }

    pub fn unhealthy(error: impl Into<String>) -> Self {
        Self {
            health: BackendHealth::Unhealthy,
            last_error: Some(error.into()),
            lag: None,
            latency: None,
            sampled_at: Utc::now(),
        }
    }

    pub fn unknown(reason: impl Into<String>) -> Self {
        Self {
            health: BackendHealth::Unknown,
            last_error: Some(reason.into()),
            lag: None,
            latency: None,
            sampled_at: Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.health == BackendHealth::Healthy
    }
}

/// Driver-specific access to backends. The policy bounds both calls with `probe_timeout`.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn probe(&self, backend: &str, config: &BackendConfig) -> BackendSample;

    /// Establish (or verify) a working connection before the backend is made active.
    async fn connect(&self, backend: &str, config: &BackendConfig) -> Result<()>;
}

/// Treats a backend as healthy when a TCP connection to its address succeeds.
/// Replication lag is not observable at this level and is reported as absent.
#[derive(Debug, Clone)]
pub struct TcpBackendConnector {
    timeout: Duration,
}

impl TcpBackendConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn dial(&self, backend: &str, config: &BackendConfig) -> Result<Duration> {
        let address = config
            .address
            .as_deref()
            .ok_or_else(|| anyhow!("backend `{backend}` has no address"))?;
        let started = Instant::now();
        tokio::time::timeout(self.timeout, TcpStream::connect(address))
            .await
            .map_err(|_| anyhow!("connect to {address} timed out"))?
            .with_context(|| format!("connect to {address} failed"))?;
        Ok(started.elapsed())
    }
}

#[async_trait]
impl BackendConnector for TcpBackendConnector {
    async fn probe(&self, backend: &str, config: &BackendConfig) -> BackendSample {
        if config.address.is_none() {
            return BackendSample::unknown(format!("backend `{backend}` has no address"));
        }
        match self.dial(backend, config).await {
            Ok(latency) => {
                debug!(backend, latency_ms = latency.as_millis() as u64, "backend reachable");
                BackendSample::healthy(Some(latency), None)
            }
            Err(err) => BackendSample::unhealthy(format!("{err:#}")),
        }
    }

    async fn connect(&self, backend: &str, config: &BackendConfig) -> Result<()> {
        self.dial(backend, config).await.map(|_| ())
    }
}
