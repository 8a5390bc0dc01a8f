//! ---
//! keel_section: "01-core-supervision"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Capability-gated lifecycle supervisor with backoff recovery."
//! keel_version: "v0.1.0"
//! keel_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use keel_common::time::{duration_to_millis, exponential_delay};
use keel_common::{ConfigView, LifecycleConfig, RecoveryStrategy};
use keel_events::{topics, NotificationBus};
use keel_metrics::KernelMetrics;
use keel_security::{Actor, AuditContext, AuditOutcome, AuditSink, CapabilityGate};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::error::KernelResult;
use crate::registry::{UnitRegistry, UnitSlot};
use crate::signal::ShutdownSignal;
use crate::unit::{guarded, LifecycleState};

/// Capability names checked by the supervisor.
pub mod capabilities {
    pub const UNIT_CONFIGURE: &str = "unit.configure";
    pub const UNIT_START: &str = "unit.start";
    pub const UNIT_STOP: &str = "unit.stop";
    pub const UNIT_RESTART: &str = "unit.restart";
    pub const UNIT_RECOVER: &str = "unit.recover";
    pub const UNIT_FAULT: &str = "unit.fault";
}

/// Audit action recorded when the capability gate refuses an action.
pub const CAPABILITY_DENIED: &str = "capability.denied";

/// Outcome of `start_all` / `stop_all`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    /// Order in which units were visited.
    pub order: Vec<String>,
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    /// Units never attempted because the batch aborted.
    pub skipped: Vec<String>,
}

impl BatchReport {
    fn new(order: Vec<String>) -> Self {
        Self {
            order,
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }
}

/// Drives start/stop/restart/recover for registered units.
///
/// Every mutating action checks a capability first and writes an audit record after.
/// Lifecycle failures become `failed` state, a `unit.failed` event and a `false` result.
pub struct Supervisor {
    registry: Arc<UnitRegistry>,
    bus: Arc<NotificationBus>,
    gate: Arc<dyn CapabilityGate>,
    audit: Arc<dyn AuditSink>,
    metrics: Option<KernelMetrics>,
    lifecycle: LifecycleConfig,
    default_actor: Actor,
    shutdown: ShutdownSignal,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<UnitRegistry>,
        bus: Arc<NotificationBus>,
        gate: Arc<dyn CapabilityGate>,
        audit: Arc<dyn AuditSink>,
        metrics: Option<KernelMetrics>,
        lifecycle: LifecycleConfig,
        default_actor: Actor,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            registry,
            bus,
            gate,
            audit,
            metrics,
            lifecycle,
            default_actor,
            shutdown,
        }
    }

    pub fn default_actor(&self) -> &Actor {
        &self.default_actor
    }

    pub fn registry(&self) -> &Arc<UnitRegistry> {
        &self.registry
    }

    /// Backoff before the recovery attempt made with `restart_count` prior restarts.
    pub fn backoff_delay(&self, restart_count: u32) -> Duration {
        match self.lifecycle.recovery_strategy {
            RecoveryStrategy::Linear => self.lifecycle.base_delay.min(self.lifecycle.max_delay),
            RecoveryStrategy::Exponential => exponential_delay(
                self.lifecycle.base_delay,
                restart_count,
                self.lifecycle.max_delay,
            ),
        }
    }

    fn lookup(&self, name: &str, action: &str) -> Option<Arc<UnitSlot>> {
        match self.registry.slot(name) {
            Ok(slot) => Some(slot),
            Err(err) => {
                warn!(unit = name, action, error = %err, "lifecycle action on unknown unit");
                None
            }
        }
    }

    fn authorize(&self, capability: &str, actor: &Actor, unit: &str) -> bool {
        let context = json!({ "unit": unit });
        match self.gate.assert_allowed(capability, actor, &context) {
            Ok(()) => true,
            Err(denied) => {
                warn!(unit, actor = %actor, capability, "capability denied");
                self.record(
                    CAPABILITY_DENIED,
                    json!({ "unit": unit, "capability": denied.capability, "context": denied.context }),
                    actor,
                    AuditOutcome::Denied,
                );
                false
            }
        }
    }

    pub(crate) fn record(&self, action: &str, payload: Value, actor: &Actor, outcome: AuditOutcome) {
        let context = AuditContext::new(actor.id.clone(), outcome);
        if let Err(err) = self.audit.write(action, &payload, &context) {
            warn!(action, error = %err, "audit write failed");
        }
    }

    fn count_action(&self, unit: &str, action: &str, success: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.record_action(unit, action, success);
        }
    }

    /// Apply `units.<name>` settings and run the boot hook.
    pub async fn prepare(&self, name: &str, settings: &ConfigView) -> bool {
        self.prepare_as(name, settings, &self.default_actor).await
    }

    pub async fn prepare_as(&self, name: &str, settings: &ConfigView, actor: &Actor) -> bool {
        let Some(slot) = self.lookup(name, "configure") else {
            return false;
        };
        if !self.authorize(capabilities::UNIT_CONFIGURE, actor, name) {
            return false;
        }
        let _guard = slot.op_lock.lock().await;
        let settings_json = settings
            .get("")
            .and_then(|root| serde_json::to_value(root).ok())
            .unwrap_or(Value::Null);
        let result = match guarded(slot.unit.configure(settings)).await {
            Ok(()) => guarded(slot.unit.boot()).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => {
                debug!(unit = name, "unit configured and booted");
                self.record(
                    "unit.configure",
                    json!({ "unit": name, "settings": settings_json }),
                    actor,
                    AuditOutcome::Success,
                );
                self.count_action(name, "configure", true);
                true
            }
            Err(err) => {
                error!(unit = name, error = %err, "unit configuration failed");
                self.fail(&slot, "configure", &err.to_string());
                self.record(
                    "unit.configure",
                    json!({ "unit": name, "settings": settings_json, "error": err.to_string() }),
                    actor,
                    AuditOutcome::Failure,
                );
                self.count_action(name, "configure", false);
                false
            }
        }
    }

    fn fail(&self, slot: &UnitSlot, action: &str, error: &str) {
        self.registry.transition(slot, LifecycleState::Failed);
        self.bus.emit(
            topics::UNIT_FAILED,
            json!({ "unit": slot.name, "action": action, "error": error }),
        );
    }

    pub async fn start(&self, name: &str) -> bool {
        self.start_as(name, &self.default_actor).await
    }

    pub async fn start_as(&self, name: &str, actor: &Actor) -> bool {
        let Some(slot) = self.lookup(name, "start") else {
            return false;
        };
        if !self.authorize(capabilities::UNIT_START, actor, name) {
            return false;
        }
        let _guard = slot.op_lock.lock().await;
        self.start_locked(&slot, actor).await
    }

    async fn start_locked(&self, slot: &UnitSlot, actor: &Actor) -> bool {
        let name = slot.name.as_str();
        match slot.state() {
            LifecycleState::Running => {
                debug!(unit = name, "unit already running");
                return true;
            }
            LifecycleState::Failed => {
                warn!(unit = name, "unit is failed; recover it before starting");
                self.record(
                    "unit.start",
                    json!({ "unit": name, "error": "unit is failed" }),
                    actor,
                    AuditOutcome::Failure,
                );
                self.count_action(name, "start", false);
                return false;
            }
            _ => {}
        }
        self.registry.transition(slot, LifecycleState::Starting);
        match guarded(slot.unit.start()).await {
            Ok(()) => {
                self.registry.transition(slot, LifecycleState::Running);
                self.registry.clear_restarts(slot);
                info!(unit = name, "unit started");
                self.bus.emit(topics::UNIT_STARTED, json!({ "unit": name }));
                self.record("unit.start", json!({ "unit": name }), actor, AuditOutcome::Success);
                self.count_action(name, "start", true);
                true
            }
            Err(err) => {
                error!(unit = name, error = %err, "unit failed to start");
                self.fail(slot, "start", &err.to_string());
                self.record(
                    "unit.start",
                    json!({ "unit": name, "error": err.to_string() }),
                    actor,
                    AuditOutcome::Failure,
                );
                self.count_action(name, "start", false);
                false
            }
        }
    }

    pub async fn stop(&self, name: &str) -> bool {
        self.stop_as(name, &self.default_actor).await
    }

    pub async fn stop_as(&self, name: &str, actor: &Actor) -> bool {
        let Some(slot) = self.lookup(name, "stop") else {
            return false;
        };
        if !self.authorize(capabilities::UNIT_STOP, actor, name) {
            return false;
        }
        let _guard = slot.op_lock.lock().await;
        self.stop_locked(&slot, actor).await
    }

    async fn stop_locked(&self, slot: &UnitSlot, actor: &Actor) -> bool {
        let name = slot.name.as_str();
        match slot.state() {
            LifecycleState::Stopped | LifecycleState::Registered => {
                debug!(unit = name, "unit not running; nothing to stop");
                return true;
            }
            LifecycleState::Failed => {
                warn!(unit = name, "unit is failed; recover it before stopping");
                self.record(
                    "unit.stop",
                    json!({ "unit": name, "error": "unit is failed" }),
                    actor,
                    AuditOutcome::Failure,
                );
                self.count_action(name, "stop", false);
                return false;
            }
            _ => {}
        }
        self.registry.transition(slot, LifecycleState::Stopping);
        match guarded(slot.unit.stop()).await {
            Ok(()) => {
                self.registry.transition(slot, LifecycleState::Stopped);
                info!(unit = name, "unit stopped");
                self.bus.emit(topics::UNIT_STOPPED, json!({ "unit": name }));
                self.record("unit.stop", json!({ "unit": name }), actor, AuditOutcome::Success);
                self.count_action(name, "stop", true);
                true
            }
            Err(err) => {
                error!(unit = name, error = %err, "unit failed to stop");
                self.fail(slot, "stop", &err.to_string());
                self.record(
                    "unit.stop",
                    json!({ "unit": name, "error": err.to_string() }),
                    actor,
                    AuditOutcome::Failure,
                );
                self.count_action(name, "stop", false);
                false
            }
        }
    }

    pub async fn restart(&self, name: &str) -> bool {
        self.restart_as(name, &self.default_actor).await
    }

    /// Stop, pause for `lifecycle.restart_pause`, start. Fails fast when the stop fails.
    pub async fn restart_as(&self, name: &str, actor: &Actor) -> bool {
        let Some(slot) = self.lookup(name, "restart") else {
            return false;
        };
        if !self.authorize(capabilities::UNIT_RESTART, actor, name) {
            return false;
        }
        let _guard = slot.op_lock.lock().await;
        let restarted = if !self.stop_locked(&slot, actor).await {
            warn!(unit = name, "restart aborted: stop failed");
            false
        } else if !self.shutdown.sleep(self.lifecycle.restart_pause).await {
            info!(unit = name, "restart interrupted by shutdown");
            false
        } else {
            self.start_locked(&slot, actor).await
        };
        let outcome = if restarted {
            AuditOutcome::Success
        } else {
            AuditOutcome::Failure
        };
        self.record("unit.restart", json!({ "unit": name }), actor, outcome);
        self.count_action(name, "restart", restarted);
        restarted
    }

    pub async fn start_all(&self) -> KernelResult<BatchReport> {
        self.start_all_as(&self.default_actor).await
    }

    /// Start every unit in dependency order, aborting at the first failure.
    pub async fn start_all_as(&self, actor: &Actor) -> KernelResult<BatchReport> {
        let order = self.registry.resolve_dependency_order()?;
        let mut report = BatchReport::new(order.clone());
        for (index, name) in order.iter().enumerate() {
            if self.start_as(name, actor).await {
                report.succeeded.push(name.clone());
            } else {
                report.failed.push(name.clone());
                report.skipped = order[index + 1..].to_vec();
                error!(unit = %name, skipped = report.skipped.len(), "start_all aborted");
                break;
            }
        }
        Ok(report)
    }

    pub async fn stop_all(&self) -> KernelResult<BatchReport> {
        self.stop_all_as(&self.default_actor).await
    }

    /// Stop every unit in reverse dependency order, continuing past failures.
    pub async fn stop_all_as(&self, actor: &Actor) -> KernelResult<BatchReport> {
        let mut order = self.registry.resolve_dependency_order()?;
        order.reverse();
        Ok(self.stop_in_order(order, actor).await)
    }

    async fn stop_in_order(&self, order: Vec<String>, actor: &Actor) -> BatchReport {
        let mut report = BatchReport::new(order.clone());
        for name in &order {
            if self.stop_as(name, actor).await {
                report.succeeded.push(name.clone());
            } else {
                report.failed.push(name.clone());
            }
        }
        report
    }

    pub async fn recover(&self, name: &str) -> bool {
        self.recover_as(name, &self.default_actor).await
    }

    /// Backoff-governed recovery bounded by `lifecycle.max_restarts`.
    pub async fn recover_as(&self, name: &str, actor: &Actor) -> bool {
        let Some(slot) = self.lookup(name, "recover") else {
            return false;
        };
        if !self.authorize(capabilities::UNIT_RECOVER, actor, name) {
            return false;
        }
        let _guard = slot.op_lock.lock().await;

        let restart_count = slot.restart_count();
        if restart_count >= self.lifecycle.max_restarts {
            warn!(
                unit = name,
                restart_count,
                max_restarts = self.lifecycle.max_restarts,
                "restart budget exhausted"
            );
            return self.recovery_failed(name, actor, "max restarts exceeded", restart_count);
        }
        self.registry.bump_restarts(&slot);
        let delay = self.backoff_delay(restart_count);
        info!(
            unit = name,
            attempt = restart_count + 1,
            delay_ms = duration_to_millis(delay),
            "recovering unit"
        );
        if !self.shutdown.sleep(delay).await {
            info!(unit = name, "recovery cancelled by shutdown");
            return self.recovery_failed(name, actor, "cancelled by shutdown", restart_count + 1);
        }

        match guarded(slot.unit.recover()).await {
            Ok(true) => {
                if slot.state() == LifecycleState::Failed {
                    self.registry.transition(&slot, LifecycleState::Stopped);
                }
                if !self.start_locked(&slot, actor).await {
                    return self.recovery_failed(
                        name,
                        actor,
                        "start after recovery failed",
                        restart_count + 1,
                    );
                }
                info!(unit = name, "unit recovered");
                self.bus.emit(
                    topics::UNIT_RECOVERED,
                    json!({ "unit": name, "attempt": restart_count + 1 }),
                );
                self.record("unit.recover", json!({ "unit": name }), actor, AuditOutcome::Success);
                if let Some(metrics) = &self.metrics {
                    metrics.record_recovery(name, true);
                }
                true
            }
            Ok(false) => {
                warn!(unit = name, "unit declined recovery");
                self.recovery_failed(name, actor, "recover hook declined", restart_count + 1)
            }
            Err(err) => {
                error!(unit = name, error = %err, "unit recovery hook failed");
                self.recovery_failed(name, actor, &err.to_string(), restart_count + 1)
            }
        }
    }

    fn recovery_failed(&self, name: &str, actor: &Actor, reason: &str, restart_count: u32) -> bool {
        self.bus.emit(
            topics::UNIT_RECOVERY_FAILED,
            json!({ "unit": name, "reason": reason, "restart_count": restart_count }),
        );
        self.record(
            "unit.recover",
            json!({ "unit": name, "reason": reason }),
            actor,
            AuditOutcome::Failure,
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_recovery(name, false);
        }
        false
    }

    pub async fn inject_failure(&self, name: &str, reason: &str) -> bool {
        self.inject_failure_as(name, reason, &self.default_actor).await
    }

    /// Mark a unit failed without calling into it. Does not wait for in-flight actions.
    pub async fn inject_failure_as(&self, name: &str, reason: &str, actor: &Actor) -> bool {
        let Some(slot) = self.lookup(name, "fault") else {
            return false;
        };
        if !self.authorize(capabilities::UNIT_FAULT, actor, name) {
            return false;
        }
        warn!(unit = name, reason, "injecting failure");
        self.registry.transition(&slot, LifecycleState::Failed);
        self.bus.emit(
            topics::UNIT_FAILED,
            json!({ "unit": name, "action": "fault", "error": reason, "injected": true }),
        );
        self.record(
            "unit.fault_injected",
            json!({ "unit": name, "reason": reason }),
            actor,
            AuditOutcome::Success,
        );
        self.count_action(name, "fault", true);
        true
    }

    /// Cancel pending waits, stop every unit, then run each unit's shutdown hook bounded by
    /// `timeout`. Units that overrun are logged and left alone.
    pub async fn shutdown(&self, timeout: Duration) -> BatchReport {
        info!(timeout_ms = duration_to_millis(timeout), "kernel shutting down");
        self.bus.emit(
            topics::KERNEL_SHUTDOWN,
            json!({ "timeout_ms": duration_to_millis(timeout) }),
        );
        self.shutdown.trigger();

        let report = match self.stop_all().await {
            Ok(report) => report,
            Err(err) => {
                warn!(error = %err, "dependency order unavailable; stopping in reverse registration order");
                let mut order = self.registry.names();
                order.reverse();
                self.stop_in_order(order, &self.default_actor).await
            }
        };

        let hooks = self.registry.slots().into_iter().map(|slot| async move {
            match tokio::time::timeout(timeout, guarded(slot.unit.shutdown(timeout))).await {
                Ok(Ok(())) => debug!(unit = %slot.name, "unit shutdown hook completed"),
                Ok(Err(err)) => warn!(unit = %slot.name, error = %err, "unit shutdown hook failed"),
                Err(_) => warn!(unit = %slot.name, "unit shutdown hook timed out"),
            }
        });
        join_all(hooks).await;
        report
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("lifecycle", &self.lifecycle)
            .field("default_actor", &self.default_actor)
            .finish_non_exhaustive()
    }
}
