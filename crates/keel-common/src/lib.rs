//! ---
//! keel_section: "01-core-supervision"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Shared primitives for the supervision kernel."
//! keel_version: "v0.1.0"
//! keel_owner: "tbd"
//! ---
//! Shared primitives for the Keel workspace: typed configuration with
//! dotted-path lookup, tracing initialisation, and duration helpers.

pub mod config;
pub mod logging;
pub mod time;
pub mod view;

pub use config::{
    AuditConfig, BackendConfig, ConfigError, EventsConfig, HealthConfig, KernelConfig,
    KernelSection, LifecycleConfig, LoadedKernelConfig, LoggingConfig, MetricsConfig,
    RecoveryStrategy, ResourceConfig, SecurityConfig,
};
pub use logging::{init_test_tracing, init_tracing, LogFormat};
pub use view::ConfigView;
