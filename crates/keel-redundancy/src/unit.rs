//! ---
//! keel_section: "07-resilience-fault-tolerance"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Managed unit fronting a failover policy."
//! keel_version: "v0.1.0"
//! keel_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use keel_common::ConfigView;
use keel_core::{HealthReport, ManagedUnit, ProbeStatus};
use semver::Version;
use serde_json::json;
use tracing::info;

use crate::policy::{FailoverPolicy, HeartbeatOutcome};

/// Supervises a replicated resource: health is a heartbeat of the active backend and
/// recovery promotes a replacement.
#[derive(Debug)]
pub struct ReplicatedResourceUnit {
    policy: Arc<FailoverPolicy>,
    auto_promote: AtomicBool,
}

impl ReplicatedResourceUnit {
    pub fn new(policy: Arc<FailoverPolicy>) -> Self {
        let auto_promote = policy.config().auto_promote;
        Self {
            policy,
            auto_promote: AtomicBool::new(auto_promote),
        }
    }

    pub fn policy(&self) -> &Arc<FailoverPolicy> {
        &self.policy
    }

    pub fn auto_promote(&self) -> bool {
        self.auto_promote.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ManagedUnit for ReplicatedResourceUnit {
    fn name(&self) -> &str {
        self.policy.resource()
    }

    fn version(&self) -> Version {
        Version::parse(env!("CARGO_PKG_VERSION")).unwrap_or_else(|_| Version::new(0, 0, 0))
    }

    fn dependencies(&self) -> Vec<String> {
        self.policy.config().dependencies.clone()
    }

    async fn configure(&self, settings: &ConfigView) -> Result<()> {
        if let Some(auto_promote) = settings.get_as::<bool>("auto_promote") {
            self.auto_promote.store(auto_promote, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let active = self.policy.active();
        let candidate = self
            .policy
            .candidates()
            .into_iter()
            .find(|c| c.name == active)
            .with_context(|| format!("active backend `{active}` is not a candidate"))?;
        self.policy
            .connector()
            .connect(&candidate.name, &candidate.config)
            .await
            .with_context(|| format!("connecting `{}` to `{active}`", self.policy.resource()))?;
        info!(resource = %self.policy.resource(), backend = %active, "resource connected");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn health(&self) -> Result<HealthReport> {
        let report = match self.policy.heartbeat(false).await? {
            HeartbeatOutcome::Healthy { active } => HealthReport::new(
                ProbeStatus::Healthy,
                json!({ "active": active }),
            ),
            HeartbeatOutcome::Unhealthy { active, reason } => {
                HealthReport::failed(json!({ "active": active, "reason": reason }))
            }
            HeartbeatOutcome::Promoted(outcome) => {
                HealthReport::degraded(json!({ "active": outcome.to, "promoted_from": outcome.from }))
            }
        };
        Ok(report)
    }

    async fn recover(&self) -> Result<bool> {
        match self.policy.heartbeat(self.auto_promote()).await {
            Ok(HeartbeatOutcome::Healthy { .. } | HeartbeatOutcome::Promoted(_)) => Ok(true),
            Ok(HeartbeatOutcome::Unhealthy { .. }) => Ok(false),
            Err(err) => {
                info!(resource = %self.policy.resource(), error = %err, "resource recovery found no replacement");
                Ok(false)
            }
        }
    }
}
