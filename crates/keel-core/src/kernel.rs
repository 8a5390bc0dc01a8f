//! ---
//! keel_section: "01-core-supervision"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Kernel root wiring registry, supervisor, evaluator and bus."
//! keel_version: "v0.1.0"
//! keel_owner: "tbd"
//! ---
use std::sync::Arc;

use anyhow::{Context, Result};
use keel_common::KernelConfig;
use keel_events::NotificationBus;
use keel_metrics::{KernelMetrics, SharedRegistry};
use keel_security::{
    audit_sink_from_config, Actor, AllowAll, AuditSink, CapabilityGate, MemoryAuditSink,
    RbacGate, SecurityMetrics,
};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::KernelResult;
use crate::health::HealthEvaluator;
use crate::monitor::HealthMonitor;
use crate::registry::UnitRegistry;
use crate::signal::ShutdownSignal;
use crate::supervisor::{BatchReport, Supervisor};
use crate::unit::ManagedUnit;

/// External services the kernel consults but does not own.
#[derive(Clone)]
pub struct Collaborators {
    pub gate: Arc<dyn CapabilityGate>,
    pub audit: Arc<dyn AuditSink>,
    pub metrics: Option<KernelMetrics>,
}

impl Collaborators {
    /// Allow-all gate and an in-memory audit sink, no metrics.
    pub fn permissive() -> Self {
        Self {
            gate: Arc::new(AllowAll),
            audit: Arc::new(MemoryAuditSink::new()),
            metrics: None,
        }
    }

    /// RBAC gate and audit sink from configuration; metrics registered on `registry` when given.
    pub fn from_config(config: &KernelConfig, registry: Option<SharedRegistry>) -> Result<Self> {
        let (kernel_metrics, security_metrics) = match registry {
            Some(registry) => (
                Some(KernelMetrics::new(registry.clone())?),
                Some(SecurityMetrics::new(registry)?),
            ),
            None => (None, None),
        };
        let mut gate = RbacGate::from_config(&config.security)
            .context("invalid security configuration")?;
        if let Some(metrics) = &security_metrics {
            gate = gate.with_metrics(metrics.clone());
        }
        let audit = audit_sink_from_config(&config.audit, security_metrics)
            .context("failed to open audit sink")?;
        Ok(Self {
            gate: Arc::new(gate),
            audit,
            metrics: kernel_metrics,
        })
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("metrics", &self.metrics.is_some())
            .finish_non_exhaustive()
    }
}

/// Root object owning every kernel component. Constructed explicitly by the entry point.
pub struct Kernel {
    config: Arc<KernelConfig>,
    bus: Arc<NotificationBus>,
    registry: Arc<UnitRegistry>,
    supervisor: Arc<Supervisor>,
    health: Arc<HealthEvaluator>,
    shutdown: ShutdownSignal,
    monitor: Mutex<Option<HealthMonitor>>,
}

impl Kernel {
    pub fn new(config: KernelConfig, collaborators: Collaborators) -> KernelResult<Self> {
        config.validate()?;
        let shutdown = ShutdownSignal::new();
        let bus = Arc::new(NotificationBus::from_config(&config.events));
        let registry = Arc::new(UnitRegistry::new(
            bus.clone(),
            collaborators.metrics.clone(),
        ));
        let supervisor = Arc::new(Supervisor::new(
            registry.clone(),
            bus.clone(),
            collaborators.gate,
            collaborators.audit,
            collaborators.metrics.clone(),
            config.lifecycle.clone(),
            Actor::new(config.kernel.actor.clone()),
            shutdown.clone(),
        ));
        let health = Arc::new(HealthEvaluator::new(
            registry.clone(),
            bus.clone(),
            collaborators.metrics,
            config.health.clone(),
            shutdown.clone(),
        ));
        Ok(Self {
            config: Arc::new(config),
            bus,
            registry,
            supervisor,
            health,
            shutdown,
            monitor: Mutex::new(None),
        })
    }

    pub fn register(&self, unit: Arc<dyn ManagedUnit>) -> KernelResult<()> {
        self.registry.register(unit)
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<NotificationBus> {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<UnitRegistry> {
        &self.registry
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn health(&self) -> &Arc<HealthEvaluator> {
        &self.health
    }

    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    /// Configure and boot every unit in dependency order, then start them all.
    ///
    /// A circular dependency aborts before any unit is touched.
    pub async fn boot(&self) -> KernelResult<BatchReport> {
        let order = self.registry.resolve_dependency_order()?;
        info!(kernel = %self.config.kernel.name, units = order.len(), "booting kernel");
        for name in &order {
            let settings = self.config.unit_settings(name);
            if !self.supervisor.prepare(name, &settings).await {
                warn!(unit = %name, "unit failed to configure; start_all will stop here");
            }
        }
        let report = self.supervisor.start_all().await?;
        if report.is_success() {
            info!(started = report.succeeded.len(), "kernel boot complete");
        } else {
            warn!(failed = ?report.failed, skipped = ?report.skipped, "kernel boot incomplete");
        }
        Ok(report)
    }

    /// Start the periodic health monitor if it is not already running.
    pub fn spawn_monitor(&self) -> bool {
        let mut monitor = self.monitor.lock();
        if monitor.as_ref().is_some_and(|m| !m.is_finished()) {
            return false;
        }
        *monitor = Some(HealthMonitor::spawn(
            self.health.clone(),
            self.supervisor.clone(),
            self.config.health.interval,
            self.config.health.auto_recover,
            self.shutdown.clone(),
        ));
        true
    }

    /// Graceful shutdown bounded by `lifecycle.shutdown_timeout`.
    pub async fn shutdown(&self) -> BatchReport {
        let report = self
            .supervisor
            .shutdown(self.config.lifecycle.shutdown_timeout)
            .await;
        let monitor = self.monitor.lock().take();
        if let Some(monitor) = monitor {
            monitor.join().await;
        }
        report
    }

    /// Forget all units, health history and notifications, and re-arm the shutdown signal.
    pub fn reset(&self) {
        if let Some(monitor) = self.monitor.lock().take() {
            monitor.abort();
        }
        self.registry.clear();
        self.health.clear();
        self.bus.clear();
        self.shutdown.reset();
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("name", &self.config.kernel.name)
            .field("units", &self.registry.names())
            .finish_non_exhaustive()
    }
}
