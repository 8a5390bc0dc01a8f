//! ---
//! keel_section: "01-core-supervision"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Periodic health sweep with optional auto-recovery."
//! keel_version: "v0.1.0"
//! keel_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::health::HealthEvaluator;
use crate::signal::ShutdownSignal;
use crate::supervisor::Supervisor;
use crate::unit::{HealthStatus, LifecycleState};

/// Background task running `check_all` every `interval` until shutdown.
#[derive(Debug)]
pub struct HealthMonitor {
    handle: JoinHandle<()>,
}

impl HealthMonitor {
    pub fn spawn(
        evaluator: Arc<HealthEvaluator>,
        supervisor: Arc<Supervisor>,
        period: Duration,
        auto_recover: bool,
        shutdown: ShutdownSignal,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = period.as_millis() as u64, auto_recover, "health monitor started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        sweep(&evaluator, &supervisor, auto_recover).await;
                    }
                    _ = shutdown.cancelled() => {
                        debug!("health monitor received shutdown");
                        break;
                    }
                }
            }
            info!("health monitor stopped");
        });
        Self { handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the loop to exit after shutdown was signalled.
    pub async fn join(self) {
        if let Err(err) = self.handle.await {
            warn!(error = %err, "health monitor task ended abnormally");
        }
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

async fn sweep(evaluator: &HealthEvaluator, supervisor: &Supervisor, auto_recover: bool) {
    let summary = evaluator.check_all().await;
    if !auto_recover {
        return;
    }
    for check in summary.units.iter().filter(|c| c.status == HealthStatus::Failed) {
        // units that were deliberately stopped or never started are left alone
        let state = match supervisor.registry().state(&check.unit) {
            Ok(state) => state,
            Err(_) => continue,
        };
        if matches!(
            state,
            LifecycleState::Registered | LifecycleState::Stopped | LifecycleState::Stopping
        ) {
            continue;
        }
        info!(unit = %check.unit, state = %state, "auto-recovering failed unit");
        if !supervisor.recover(&check.unit).await {
            warn!(unit = %check.unit, "auto-recovery did not succeed");
        }
    }
}
