//! ---
//! keel_section: "01-core-supervision"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Supervision kernel: registry, lifecycle, and health."
//! keel_version: "v0.1.0"
//! keel_owner: "tbd"
//! ---
//! The supervision kernel. [`Kernel`] owns a [`UnitRegistry`] of [`ManagedUnit`]s, drives
//! their lifecycle through the [`Supervisor`] and judges their health with the
//! [`HealthEvaluator`].

pub mod error;
pub mod health;
pub mod kernel;
pub mod monitor;
pub mod registry;
pub mod signal;
pub mod supervisor;
pub mod unit;

pub use error::{KernelError, KernelResult};
pub use health::{
    determine_status, HealthCheck, HealthEvaluator, HealthSample, HealthSummary, SystemHealth,
};
pub use kernel::{Collaborators, Kernel};
pub use monitor::HealthMonitor;
pub use registry::{UnitRecord, UnitRegistry};
pub use signal::ShutdownSignal;
pub use supervisor::{capabilities, BatchReport, Supervisor};
pub use unit::{HealthReport, HealthStatus, LifecycleState, ManagedUnit, ProbeStatus};
