//! ---
//! keel_section: "07-resilience-fault-tolerance"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Failover error taxonomy."
//! keel_version: "v0.1.0"
//! keel_owner: "tbd"
//! ---
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FailoverError {
    /// No candidate qualified; the resource stays on its current backend.
    #[error("no backend of `{resource}` qualified for promotion: {reason}")]
    PromotionFailed { resource: String, reason: String },
    #[error("`{backend}` is not a configured connection of `{resource}`")]
    UnknownBackend { resource: String, backend: String },
    #[error("`{backend}` is the active backend of `{resource}`")]
    ActiveBackend { resource: String, backend: String },
    #[error("replica state at {} could not be persisted", .path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("replica state at {} could not be loaded", .path.display())]
    Load {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
