//! ---
//! keel_section: "07-resilience-fault-tolerance"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Failover policy for resources with interchangeable backends."
//! keel_version: "v0.1.0"
//! keel_owner: "tbd"
//! ---
//! Failover for replicated resources: backend scoring, quarantine, promotion and
//! operator-registered replicas, plus a managed unit fronting the policy.

mod connector;
mod error;
mod policy;
mod store;
mod unit;

pub use connector::{BackendConnector, BackendHealth, BackendSample, TcpBackendConnector};
pub use error::FailoverError;
pub use policy::{
    score_backend, BackendRole, BackendStatusRow, Candidate, FailoverPolicy, HeartbeatOutcome,
    PromotionOutcome, PromotionRequest,
};
pub use store::ReplicaStore;
pub use unit::ReplicatedResourceUnit;
