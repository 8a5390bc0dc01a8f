//! ---
//! keel_section: "01-core-supervision"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Health evaluator with retrying probes and threshold debouncing."
//! keel_version: "v0.1.0"
//! keel_owner: "tbd"
//! ---
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use keel_common::time::duration_to_millis;
use keel_common::HealthConfig;
use keel_events::{topics, NotificationBus};
use keel_metrics::KernelMetrics;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::{KernelError, KernelResult};
use crate::registry::UnitRegistry;
use crate::signal::ShutdownSignal;
use crate::unit::{guarded, HealthReport, HealthStatus, ProbeStatus};

/// One probe outcome kept in a unit's history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSample {
    pub status: ProbeStatus,
    /// Attempt number (1-based) that produced the sample.
    pub attempt: u32,
    pub at: DateTime<Utc>,
}

/// Result of [`HealthEvaluator::check`]. Probe failures are reported here, not as errors.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthCheck {
    pub unit: String,
    /// Raw probe status of the successful attempt; `None` when every attempt failed.
    pub raw: Option<ProbeStatus>,
    /// Debounced status written to the registry.
    pub status: HealthStatus,
    pub attempts: u32,
    pub detail: serde_json::Value,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl HealthCheck {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Process-level self check included in [`HealthSummary`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemHealth {
    pub uptime_secs: u64,
    pub resident_memory_bytes: Option<u64>,
    /// 1, 5 and 15 minute load averages.
    pub load_average: Option<[f64; 3]>,
}

impl SystemHealth {
    fn sample(started: Instant) -> Self {
        Self {
            uptime_secs: started.elapsed().as_secs(),
            resident_memory_bytes: read_resident_memory(),
            load_average: read_load_average(),
        }
    }
}

/// Aggregate produced by [`HealthEvaluator::check_all`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSummary {
    pub overall: HealthStatus,
    pub units: Vec<HealthCheck>,
    pub system: SystemHealth,
    pub checked_at: DateTime<Utc>,
}

/// Fold a chronological probe history into a debounced status.
///
/// Scans newest to oldest. Failures (including `critical`) reset the success streak and
/// return `failed` once `failure_threshold` consecutive failures are seen; healthy probes
/// reset the failure streak and return `healthy` at `recovery_threshold`. `degraded` and
/// `unknown` probes leave both streaks untouched. The first threshold reached wins. When
/// neither is reached, any failure in the window yields `degraded`, otherwise the newest
/// raw status is returned.
pub fn determine_status(
    history: &[ProbeStatus],
    failure_threshold: usize,
    recovery_threshold: usize,
) -> HealthStatus {
    let mut failures = 0usize;
    let mut successes = 0usize;
    let mut seen_failure = false;
    for status in history.iter().rev() {
        match status {
            ProbeStatus::Failed | ProbeStatus::Critical => {
                failures += 1;
                successes = 0;
                seen_failure = true;
                if failures == failure_threshold {
                    return HealthStatus::Failed;
                }
            }
            ProbeStatus::Healthy => {
                successes += 1;
                failures = 0;
                if successes == recovery_threshold {
                    return HealthStatus::Healthy;
                }
            }
            ProbeStatus::Degraded | ProbeStatus::Unknown => {}
        }
    }
    if seen_failure {
        return HealthStatus::Degraded;
    }
    history
        .last()
        .map(|status| status.as_health())
        .unwrap_or(HealthStatus::Unknown)
}

/// Probes units with retry-with-timeout semantics and debounces the outcomes.
pub struct HealthEvaluator {
    registry: Arc<UnitRegistry>,
    bus: Arc<NotificationBus>,
    metrics: Option<KernelMetrics>,
    config: HealthConfig,
    histories: Mutex<HashMap<String, VecDeque<HealthSample>>>,
    shutdown: ShutdownSignal,
    started: Instant,
}

impl HealthEvaluator {
    pub fn new(
        registry: Arc<UnitRegistry>,
        bus: Arc<NotificationBus>,
        metrics: Option<KernelMetrics>,
        config: HealthConfig,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            registry,
            bus,
            metrics,
            config,
            histories: Mutex::new(HashMap::new()),
            shutdown,
            started: Instant::now(),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Probe `name` up to `retries` times. Only an unknown unit is an error.
    pub async fn check(&self, name: &str) -> KernelResult<HealthCheck> {
        let unit = self.registry.unit(name)?;
        let started = Instant::now();
        let mut last_error = String::new();
        let mut attempts = 0;

        for attempt in 1..=self.config.retries.max(1) {
            attempts = attempt;
            // dropping the timed-out future cancels the probe
            match tokio::time::timeout(self.config.timeout, guarded(unit.health())).await {
                Ok(Ok(report)) => return Ok(self.settle(name, report, attempt, started)),
                Ok(Err(err)) => {
                    warn!(unit = name, attempt, error = %err, "health probe failed");
                    last_error = err.to_string();
                }
                Err(_) => {
                    let err = KernelError::ProbeTimeout {
                        unit: name.to_string(),
                        timeout: self.config.timeout,
                    };
                    warn!(unit = name, attempt, error = %err, "health probe timed out");
                    last_error = err.to_string();
                }
            }
            if attempt < self.config.retries && !self.shutdown.sleep(self.config.retry_delay).await
            {
                debug!(unit = name, "health retries cut short by shutdown");
                break;
            }
        }
        Ok(self.exhausted(name, attempts, last_error, started))
    }

    fn settle(&self, name: &str, report: HealthReport, attempt: u32, started: Instant) -> HealthCheck {
        let window = self.push_sample(name, report.status, attempt);
        let status = determine_status(
            &window,
            self.config.failure_threshold,
            self.config.recovery_threshold,
        );
        if let Err(err) = self.registry.set_health(name, status, report.detail.clone()) {
            warn!(unit = name, error = %err, "unit vanished during health check");
        }
        if status != report.status.as_health() {
            debug!(unit = name, raw = %report.status, status = %status, "health status debounced");
            self.bus.emit(
                topics::HEALTH_STATUS_CHANGED,
                json!({ "unit": name, "raw": report.status, "status": status }),
            );
        }
        let elapsed = started.elapsed();
        self.observe(name, status, elapsed);
        HealthCheck {
            unit: name.to_string(),
            raw: Some(report.status),
            status,
            attempts: attempt,
            detail: report.detail,
            error: None,
            elapsed_ms: duration_to_millis(elapsed),
        }
    }

    fn exhausted(&self, name: &str, attempts: u32, error: String, started: Instant) -> HealthCheck {
        self.push_sample(name, ProbeStatus::Failed, attempts);
        let detail = json!({ "error": error, "attempts": attempts });
        if let Err(err) = self
            .registry
            .set_health(name, HealthStatus::Failed, detail.clone())
        {
            warn!(unit = name, error = %err, "unit vanished during health check");
        }
        warn!(unit = name, attempts, error = %error, "health check exhausted retries");
        self.bus.emit(
            topics::HEALTH_FAILED,
            json!({ "unit": name, "error": error, "attempts": attempts }),
        );
        let elapsed = started.elapsed();
        self.observe(name, HealthStatus::Failed, elapsed);
        HealthCheck {
            unit: name.to_string(),
            raw: None,
            status: HealthStatus::Failed,
            attempts,
            detail,
            error: Some(error),
            elapsed_ms: duration_to_millis(elapsed),
        }
    }

    /// Append a sample and return the statuses inside the evaluation window, oldest first.
    fn push_sample(&self, name: &str, status: ProbeStatus, attempt: u32) -> Vec<ProbeStatus> {
        let mut histories = self.histories.lock();
        let history = histories.entry(name.to_string()).or_default();
        history.push_back(HealthSample {
            status,
            attempt,
            at: Utc::now(),
        });
        while history.len() > self.config.history_cap.max(1) {
            history.pop_front();
        }
        let skip = history.len().saturating_sub(self.config.window);
        history.iter().skip(skip).map(|sample| sample.status).collect()
    }

    fn observe(&self, name: &str, status: HealthStatus, elapsed: Duration) {
        if let Some(metrics) = &self.metrics {
            metrics.record_health_check(name, status.as_str(), elapsed.as_secs_f64());
        }
    }

    /// Check every registered unit concurrently and add a process self-check.
    pub async fn check_all(&self) -> HealthSummary {
        let names = self.registry.names();
        let results = join_all(names.iter().map(|name| self.check(name))).await;
        let units: Vec<HealthCheck> = results
            .into_iter()
            .zip(names)
            .filter_map(|(result, name)| match result {
                Ok(check) => Some(check),
                Err(err) => {
                    debug!(unit = %name, error = %err, "unit unregistered during check_all");
                    None
                }
            })
            .collect();
        let overall = units
            .iter()
            .map(|check| check.status)
            .max_by_key(|status| status.severity())
            .unwrap_or(HealthStatus::Healthy);
        let summary = HealthSummary {
            overall,
            system: SystemHealth::sample(self.started),
            checked_at: Utc::now(),
            units,
        };
        let failing: Vec<&str> = summary
            .units
            .iter()
            .filter(|check| check.status == HealthStatus::Failed)
            .map(|check| check.unit.as_str())
            .collect();
        info!(overall = %overall, units = summary.units.len(), "health sweep complete");
        self.bus.emit(
            topics::HEALTH_CHECK_COMPLETE,
            json!({ "overall": overall, "units": summary.units.len(), "failed": failing }),
        );
        summary
    }

    /// Samples recorded for `name`, oldest first.
    pub fn history(&self, name: &str) -> Vec<HealthSample> {
        self.histories
            .lock()
            .get(name)
            .map(|history| history.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        self.histories.lock().clear();
    }
}

impl std::fmt::Debug for HealthEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthEvaluator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

const PAGE_SIZE: u64 = 4096;

fn read_resident_memory() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * PAGE_SIZE)
}

fn read_load_average() -> Option<[f64; 3]> {
    let loadavg = std::fs::read_to_string("/proc/loadavg").ok()?;
    let mut fields = loadavg.split_whitespace().map(str::parse::<f64>);
    Some([
        fields.next()?.ok()?,
        fields.next()?.ok()?,
        fields.next()?.ok()?,
    ])
}
