//! ---
//! keel_section: "15-testing-qa-runbook"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "test"
//! keel_description: "Scripted managed units shared by kernel tests."
//! keel_version: "v0.1.0"
//! keel_owner: "tbd"
//! ---
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use keel_common::{ConfigView, KernelConfig};
use keel_core::{Collaborators, HealthReport, Kernel, ManagedUnit, ProbeStatus};
use keel_security::{AllowAll, MemoryAuditSink};
use parking_lot::Mutex;
use semver::Version;

/// Scripted probe result, consumed front to back; the last one repeats.
#[derive(Debug, Clone)]
pub enum Probe {
    Report(ProbeStatus),
    Error,
    Panic,
    Hang,
}

pub type CallLog = Arc<Mutex<Vec<String>>>;

pub struct ScriptedUnit {
    name: String,
    deps: Vec<String>,
    log: CallLog,
    pub fail_start: AtomicBool,
    pub panic_start: AtomicBool,
    pub fail_stop: AtomicBool,
    pub fail_configure: AtomicBool,
    pub recover_result: Mutex<Result<bool, String>>,
    pub recover_calls: AtomicUsize,
    pub probe_calls: AtomicUsize,
    pub shutdown_calls: AtomicUsize,
    probes: Mutex<VecDeque<Probe>>,
    pub settings: Mutex<Option<ConfigView>>,
}

impl ScriptedUnit {
    pub fn new(name: &str, deps: &[&str], log: &CallLog) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            deps: deps.iter().map(|d| d.to_string()).collect(),
            log: log.clone(),
            fail_start: AtomicBool::new(false),
            panic_start: AtomicBool::new(false),
            fail_stop: AtomicBool::new(false),
            fail_configure: AtomicBool::new(false),
            recover_result: Mutex::new(Ok(true)),
            recover_calls: AtomicUsize::new(0),
            probe_calls: AtomicUsize::new(0),
            shutdown_calls: AtomicUsize::new(0),
            probes: Mutex::new(VecDeque::from([Probe::Report(ProbeStatus::Healthy)])),
            settings: Mutex::new(None),
        })
    }

    pub fn script(&self, probes: impl IntoIterator<Item = Probe>) {
        *self.probes.lock() = probes.into_iter().collect();
    }

    fn next_probe(&self) -> Probe {
        let mut probes = self.probes.lock();
        if probes.len() > 1 {
            probes.pop_front().unwrap_or(Probe::Report(ProbeStatus::Healthy))
        } else {
            probes
                .front()
                .cloned()
                .unwrap_or(Probe::Report(ProbeStatus::Healthy))
        }
    }

    fn note(&self, call: &str) {
        self.log.lock().push(format!("{call}:{}", self.name));
    }
}

#[async_trait]
impl ManagedUnit for ScriptedUnit {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> Version {
        Version::new(0, 3, 1)
    }

    fn dependencies(&self) -> Vec<String> {
        self.deps.clone()
    }

    async fn configure(&self, settings: &ConfigView) -> Result<()> {
        self.note("configure");
        if self.fail_configure.load(Ordering::SeqCst) {
            return Err(anyhow!("bad settings"));
        }
        *self.settings.lock() = Some(settings.clone());
        Ok(())
    }

    async fn boot(&self) -> Result<()> {
        self.note("boot");
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.note("start");
        if self.panic_start.load(Ordering::SeqCst) {
            panic!("start blew up");
        }
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(anyhow!("connection refused"));
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.note("stop");
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(anyhow!("stuck"));
        }
        Ok(())
    }

    async fn health(&self) -> Result<HealthReport> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        match self.next_probe() {
            Probe::Report(status) => Ok(HealthReport::new(
                status,
                serde_json::json!({ "probe": status.as_str() }),
            )),
            Probe::Error => Err(anyhow!("probe error")),
            Probe::Panic => panic!("probe panicked"),
            Probe::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(HealthReport::healthy())
            }
        }
    }

    async fn recover(&self) -> Result<bool> {
        self.note("recover");
        self.recover_calls.fetch_add(1, Ordering::SeqCst);
        self.recover_result.lock().clone().map_err(|e| anyhow!(e))
    }

    async fn shutdown(&self, _timeout: Duration) -> Result<()> {
        self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Config with millisecond delays so backoff and retries stay fast.
pub fn fast_config() -> KernelConfig {
    let mut config = KernelConfig::default();
    config.lifecycle.base_delay = Duration::from_millis(1);
    config.lifecycle.max_delay = Duration::from_millis(20);
    config.lifecycle.restart_pause = Duration::from_millis(1);
    config.lifecycle.shutdown_timeout = Duration::from_millis(200);
    config.health.retry_delay = Duration::from_millis(1);
    config.health.timeout = Duration::from_millis(50);
    config
}

pub fn kernel_with_audit(config: KernelConfig) -> (Kernel, Arc<MemoryAuditSink>) {
    let audit = Arc::new(MemoryAuditSink::new());
    let collaborators = Collaborators {
        gate: Arc::new(AllowAll),
        audit: audit.clone(),
        metrics: None,
    };
    let kernel = Kernel::new(config, collaborators).expect("valid config");
    (kernel, audit)
}

pub fn new_log() -> CallLog {
    Arc::new(Mutex::new(Vec::new()))
}
