//! ---
//! keel_section: "02-events-notifications"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Notification bus and topic catalogue."
//! keel_version: "v0.1.0"
//! keel_owner: "tbd"
//! ---
//! Topic names emitted by the kernel.

/// Subscribes a handler to every topic.
pub const ALL: &str = "*";

/// A unit was added to the registry.
pub const UNIT_REGISTERED: &str = "unit.registered";
/// A unit moved between lifecycle states.
pub const UNIT_STATE_CHANGED: &str = "unit.state_changed";
/// A unit reached `running`.
pub const UNIT_STARTED: &str = "unit.started";
/// A unit reached `stopped`.
pub const UNIT_STOPPED: &str = "unit.stopped";
/// A unit entered `failed`.
pub const UNIT_FAILED: &str = "unit.failed";
/// A recovery attempt brought the unit back.
pub const UNIT_RECOVERED: &str = "unit.recovered";
/// Recovery was refused or did not succeed.
pub const UNIT_RECOVERY_FAILED: &str = "unit.recovery_failed";

/// The derived health status differs from the raw probe status.
pub const HEALTH_STATUS_CHANGED: &str = "health.status_changed";
/// Every probe attempt of a check failed.
pub const HEALTH_FAILED: &str = "health.failed";
/// A full sweep over all units finished.
pub const HEALTH_CHECK_COMPLETE: &str = "health.check_complete";

/// A replicated resource switched to a new active backend.
pub const FAILOVER_COMPLETED: &str = "failover.completed";
/// No backend qualified for promotion.
pub const FAILOVER_FAILED: &str = "failover.failed";
/// An operator added a replica at runtime.
pub const REPLICA_REGISTERED: &str = "failover.replica_registered";
/// An operator removed a runtime replica.
pub const REPLICA_UNREGISTERED: &str = "failover.replica_unregistered";

/// The kernel is shutting down.
pub const KERNEL_SHUTDOWN: &str = "kernel.shutdown";
