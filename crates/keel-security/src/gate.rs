//! ---
//! keel_section: "06-security-access-control"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Capability gate contract and permissive implementation."
//! keel_version: "v0.1.0"
//! keel_owner: "tbd"
//! ---
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Principal on whose behalf a kernel action runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// Actor identifier, matched against `security.actors`.
    pub id: String,
    /// Roles carried by the actor in addition to the configured ones.
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Actor {
    /// Actor without inline roles.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            roles: Vec::new(),
        }
    }

    /// Attach an inline role.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Raised when an actor lacks a capability.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("actor `{actor}` lacks capability `{capability}`")]
pub struct CapabilityDenied {
    /// Capability that was requested, e.g. `unit.start`.
    pub capability: String,
    /// Actor identifier.
    pub actor: String,
    /// Context supplied with the request.
    pub context: serde_json::Value,
}

/// Authorization decision point consulted before every mutating kernel action.
pub trait CapabilityGate: Send + Sync {
    /// Return `Ok(())` when `actor` may exercise `capability`.
    fn assert_allowed(
        &self,
        capability: &str,
        actor: &Actor,
        context: &serde_json::Value,
    ) -> Result<(), CapabilityDenied>;
}

/// Gate that grants everything. Useful for tests and embedded deployments.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl CapabilityGate for AllowAll {
    fn assert_allowed(
        &self,
        _capability: &str,
        _actor: &Actor,
        _context: &serde_json::Value,
    ) -> Result<(), CapabilityDenied> {
        Ok(())
    }
}

/// Match `capability` against a pattern such as `unit.*` or `*`.
pub(crate) fn capability_matches(pattern: &str, capability: &str) -> bool {
    if pattern == "*" || pattern == capability {
        return true;
    }
    pattern
        .strip_suffix('*')
        .is_some_and(|prefix| capability.starts_with(prefix))
}
