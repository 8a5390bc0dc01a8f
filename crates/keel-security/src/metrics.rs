//! ---
//! keel_section: "06-security-access-control"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Prometheus counters for authorization and audit."
//! keel_version: "v0.1.0"
//! keel_owner: "tbd"
//! ---
use prometheus::{IntCounter, IntCounterVec, Opts, Registry};
use std::sync::Arc;

/// Security metrics exported via Prometheus.
#[derive(Clone)]
pub struct SecurityMetrics {
    registry: Arc<Registry>,
    capability_checks_total: IntCounterVec,
    audit_write_failures_total: IntCounter,
}

impl SecurityMetrics {
    /// Register metrics with the provided registry.
    pub fn new(registry: Arc<Registry>) -> anyhow::Result<Self> {
        let capability_checks_total = IntCounterVec::new(
            Opts::new(
                "keel_capability_checks_total",
                "Capability checks by capability and outcome",
            ),
            &["capability", "outcome"],
        )?;
        let audit_write_failures_total = IntCounter::new(
            "keel_audit_write_failures_total",
            "Audit entries that could not be persisted",
        )?;

        registry.register(Box::new(capability_checks_total.clone()))?;
        registry.register(Box::new(audit_write_failures_total.clone()))?;

        Ok(Self {
            registry,
            capability_checks_total,
            audit_write_failures_total,
        })
    }

    /// Access the underlying registry.
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Record a gate decision.
    pub fn record_check(&self, capability: &str, allowed: bool) {
        let outcome = if allowed { "granted" } else { "denied" };
        self.capability_checks_total
            .with_label_values(&[capability, outcome])
            .inc();
    }

    /// Increment audit write failures.
    pub fn inc_audit_failure(&self) {
        self.audit_write_failures_total.inc();
    }
}

impl std::fmt::Debug for SecurityMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityMetrics").finish_non_exhaustive()
    }
}
