//! ---
//! keel_section: "07-resilience-fault-tolerance"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Chaos scenarios and resilience metrics."
//! keel_version: "v0.1.0"
//! keel_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Declarative fault injection against a running kernel.

pub mod chaos;
pub mod metrics;

pub use chaos::{ChaosAction, ChaosEngine, ChaosEventRecord, ChaosScenario};
pub use metrics::ResilienceMetrics;
