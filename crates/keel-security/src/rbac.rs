//! ---
//! keel_section: "06-security-access-control"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Role-based capability gate."
//! keel_version: "v0.1.0"
//! keel_owner: "tbd"
//! ---
use std::collections::HashMap;

use keel_common::SecurityConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::gate::{capability_matches, Actor, CapabilityDenied, CapabilityGate};
use crate::metrics::SecurityMetrics;

/// Role describes a named set of capability patterns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    /// Role identifier.
    pub name: String,
    /// Capability patterns granted by the role (`*` wildcards allowed).
    pub capabilities: Vec<String>,
}

impl Role {
    /// Whether this role grants `capability`.
    pub fn grants(&self, capability: &str) -> bool {
        self.capabilities
            .iter()
            .any(|pattern| capability_matches(pattern, capability))
    }
}

/// Errors occurring while building the role table.
#[derive(Debug, Error)]
pub enum RbacError {
    /// An actor references a role that is not defined.
    #[error("actor `{actor}` references unknown role `{role}`")]
    UnknownRole {
        /// Actor identifier.
        actor: String,
        /// Missing role.
        role: String,
    },
}

/// Capability gate backed by role definitions and actor assignments.
#[derive(Debug, Clone)]
pub struct RbacGate {
    enforce: bool,
    roles: HashMap<String, Role>,
    assignments: HashMap<String, Vec<String>>,
    metrics: Option<SecurityMetrics>,
}

impl RbacGate {
    /// Build the gate from the `[security]` section.
    pub fn from_config(config: &SecurityConfig) -> Result<Self, RbacError> {
        let roles: HashMap<String, Role> = config
            .roles
            .iter()
            .map(|(name, capabilities)| {
                (
                    name.clone(),
                    Role {
                        name: name.clone(),
                        capabilities: capabilities.clone(),
                    },
                )
            })
            .collect();
        for (actor, assigned) in &config.actors {
            if let Some(role) = assigned.iter().find(|role| !roles.contains_key(*role)) {
                return Err(RbacError::UnknownRole {
                    actor: actor.clone(),
                    role: role.clone(),
                });
            }
        }
        Ok(Self {
            enforce: config.enforce,
            roles,
            assignments: config
                .actors
                .iter()
                .map(|(actor, roles)| (actor.clone(), roles.clone()))
                .collect(),
            metrics: None,
        })
    }

    /// Count decisions in `keel_capability_checks_total`.
    pub fn with_metrics(mut self, metrics: SecurityMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Insert or replace a role definition.
    pub fn insert_role(&mut self, role: Role) {
        self.roles.insert(role.name.clone(), role);
    }

    /// Assign roles to an actor identifier.
    pub fn assign(&mut self, actor: impl Into<String>, roles: Vec<String>) {
        self.assignments.insert(actor.into(), roles);
    }

    /// Determine whether any role held by `actor` grants `capability`.
    pub fn is_authorized(&self, actor: &Actor, capability: &str) -> bool {
        let configured = self
            .assignments
            .get(&actor.id)
            .map(Vec::as_slice)
            .unwrap_or_default();
        configured
            .iter()
            .chain(actor.roles.iter())
            .any(|role_name| match self.roles.get(role_name) {
                Some(role) => role.grants(capability),
                None => {
                    warn!(actor = %actor, role = %role_name, "actor carries undefined role");
                    false
                }
            })
    }
}

impl CapabilityGate for RbacGate {
    fn assert_allowed(
        &self,
        capability: &str,
        actor: &Actor,
        context: &serde_json::Value,
    ) -> Result<(), CapabilityDenied> {
        let allowed = !self.enforce || self.is_authorized(actor, capability);
        if let Some(metrics) = &self.metrics {
            metrics.record_check(capability, allowed);
        }
        if allowed {
            debug!(actor = %actor, capability, "capability granted");
            Ok(())
        } else {
            Err(CapabilityDenied {
                capability: capability.to_string(),
                actor: actor.id.clone(),
                context: context.clone(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_roles_cover_kernel_capabilities() {
        let mut config = SecurityConfig::default();
        config.actors.insert("ops".into(), vec!["operator".into()]);
        config.actors.insert("auditor".into(), vec!["viewer".into()]);
        let gate = RbacGate::from_config(&config).unwrap();

        assert!(gate.is_authorized(&Actor::new("system"), "unit.fault"));
        assert!(gate.is_authorized(&Actor::new("ops"), "unit.restart"));
        assert!(!gate.is_authorized(&Actor::new("auditor"), "unit.start"));
        assert!(gate.is_authorized(&Actor::new("auditor"), "health.read"));
        assert!(!gate.is_authorized(&Actor::new("stranger"), "health.read"));
    }

    #[test]
    fn inline_roles_are_honoured() {
        let gate = RbacGate::from_config(&SecurityConfig::default()).unwrap();
        let actor = Actor::new("cli").with_role("operator");
        assert!(gate
            .assert_allowed("unit.stop", &actor, &json!({}))
            .is_ok());
    }

    #[test]
    fn denial_carries_context() {
        let gate = RbacGate::from_config(&SecurityConfig::default()).unwrap();
        let err = gate
            .assert_allowed("unit.start", &Actor::new("nobody"), &json!({"unit": "db"}))
            .unwrap_err();
        assert_eq!(err.capability, "unit.start");
        assert_eq!(err.actor, "nobody");
        assert_eq!(err.context["unit"], "db");
    }

    #[test]
    fn enforcement_can_be_disabled() {
        let config = SecurityConfig {
            enforce: false,
            ..SecurityConfig::default()
        };
        let gate = RbacGate::from_config(&config).unwrap();
        assert!(gate
            .assert_allowed("unit.start", &Actor::new("nobody"), &json!({}))
            .is_ok());
    }

    #[test]
    fn unknown_role_assignment_is_rejected() {
        let mut config = SecurityConfig::default();
        config.actors.insert("ops".into(), vec!["superuser".into()]);
        let err = RbacGate::from_config(&config).unwrap_err();
        assert!(matches!(err, RbacError::UnknownRole { ref role, .. } if role == "superuser"));
    }
}
