//! ---
//! keel_section: "01-core-supervision"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Kernel error taxonomy."
//! keel_version: "v0.1.0"
//! keel_owner: "tbd"
//! ---
use std::time::Duration;

use keel_common::ConfigError;
use keel_security::CapabilityDenied;
use thiserror::Error;

/// Errors surfaced by the registry, supervisor and kernel root.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("unit `{0}` is not registered")]
    UnitNotFound(String),
    #[error("unit `{0}` is already registered")]
    DuplicateUnit(String),
    /// Units whose dependencies can never be satisfied, in registration order.
    #[error("circular or unsatisfiable dependencies among: {}", .0.join(", "))]
    CircularDependency(Vec<String>),
    #[error(transparent)]
    CapabilityDenied(#[from] CapabilityDenied),
    #[error("health probe for `{unit}` timed out after {}ms", .timeout.as_millis())]
    ProbeTimeout { unit: String, timeout: Duration },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type KernelResult<T> = Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circular_dependency_lists_units() {
        let err = KernelError::CircularDependency(vec!["a".into(), "b".into()]);
        assert_eq!(
            err.to_string(),
            "circular or unsatisfiable dependencies among: a, b"
        );
    }

    #[test]
    fn probe_timeout_formats_millis() {
        let err = KernelError::ProbeTimeout {
            unit: "db".into(),
            timeout: Duration::from_millis(250),
        };
        assert_eq!(err.to_string(), "health probe for `db` timed out after 250ms");
    }
}
