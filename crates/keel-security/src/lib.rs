//! ---
//! keel_section: "06-security-access-control"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Capability gating, access control, and audit sinks."
//! keel_version: "v0.1.0"
//! keel_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Authorization and audit collaborators consumed by the supervision kernel.

pub mod audit;
pub mod gate;
pub mod metrics;
pub mod rbac;

use std::sync::Arc;

use anyhow::Result;
use keel_common::AuditConfig;

pub use audit::{
    AuditContext, AuditEntry, AuditLog, AuditOutcome, AuditSink, MemoryAuditSink, NoopAuditSink,
    RecordedAudit, Redactor,
};
pub use gate::{Actor, AllowAll, CapabilityDenied, CapabilityGate};
pub use metrics::SecurityMetrics;
pub use rbac::RbacGate;

/// Build the audit sink selected by the `[audit]` section.
///
/// A configured path yields a hash-chained [`AuditLog`], no path keeps entries in memory,
/// and a disabled section discards them.
pub fn audit_sink_from_config(
    config: &AuditConfig,
    metrics: Option<SecurityMetrics>,
) -> Result<Arc<dyn AuditSink>> {
    let redactor = Redactor::new(&config.redact_patterns);
    if !config.enabled {
        return Ok(Arc::new(NoopAuditSink));
    }
    match &config.path {
        Some(path) => {
            let mut log = AuditLog::open(path)?.with_redactor(redactor);
            if let Some(metrics) = metrics {
                log = log.with_metrics(metrics);
            }
            Ok(Arc::new(log))
        }
        None => Ok(Arc::new(MemoryAuditSink::with_redactor(redactor))),
    }
}
