//! ---
//! keel_section: "07-resilience-fault-tolerance"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Chaos scenarios and resilience metrics."
//! keel_version: "v0.1.0"
//! keel_owner: "tbd"
//! ---
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use keel_core::{HealthStatus, Kernel, LifecycleState};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::metrics::ResilienceMetrics;

const DEFAULT_SEED: u64 = 0x4B45_454C;

/// Declarative chaos scenario loaded from TOML configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ChaosScenario {
    /// Optional seed to guarantee deterministic replay of jitter.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Upper bound of the random jitter added to each action delay (milliseconds).
    #[serde(default)]
    pub jitter_ms: Option<u64>,
    /// Ordered chaos actions executed by the engine.
    #[serde(default)]
    pub actions: Vec<ChaosAction>,
}

impl ChaosScenario {
    /// Load a scenario from disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())
            .with_context(|| format!("unable to read chaos scenario {}", path.as_ref().display()))?;
        contents.parse::<Self>()
    }

    fn jitter_duration(&self, rng: &mut StdRng) -> Duration {
        match self.jitter_ms {
            None | Some(0) => Duration::ZERO,
            Some(jitter_ms) => Duration::from_millis(rng.gen_range(0..=jitter_ms)),
        }
    }
}

impl std::str::FromStr for ChaosScenario {
    type Err = anyhow::Error;

    fn from_str(input: &str) -> std::result::Result<Self, Self::Err> {
        toml::from_str::<Self>(input).map_err(anyhow::Error::new)
    }
}

/// Supported chaos actions. Each one goes through the supervisor or health evaluator, so
/// capability checks, audit and events apply exactly as for operator calls.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChaosAction {
    /// Force the unit into `failed` without touching the unit itself.
    FailUnit {
        /// Target unit.
        unit: String,
        /// Reason recorded on the failure event.
        #[serde(default = "default_reason")]
        reason: String,
        /// Milliseconds to wait before executing the action.
        #[serde(default)]
        delay_ms: u64,
    },
    /// Stop the unit through its stop hook.
    StopUnit {
        /// Target unit.
        unit: String,
        /// Milliseconds to wait before executing the action.
        #[serde(default)]
        delay_ms: u64,
    },
    /// Stop then start the unit.
    RestartUnit {
        /// Target unit.
        unit: String,
        /// Milliseconds to wait before executing the action.
        #[serde(default)]
        delay_ms: u64,
    },
    /// Run backoff-governed recovery.
    RecoverUnit {
        /// Target unit.
        unit: String,
        /// Milliseconds to wait before executing the action.
        #[serde(default)]
        delay_ms: u64,
    },
    /// Run a health check and record the debounced status.
    CheckUnit {
        /// Target unit.
        unit: String,
        /// Milliseconds to wait before executing the action.
        #[serde(default)]
        delay_ms: u64,
    },
}

fn default_reason() -> String {
    "chaos".to_string()
}

impl ChaosAction {
    /// Action identifier used in logs, records and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ChaosAction::FailUnit { .. } => "fail_unit",
            ChaosAction::StopUnit { .. } => "stop_unit",
            ChaosAction::RestartUnit { .. } => "restart_unit",
            ChaosAction::RecoverUnit { .. } => "recover_unit",
            ChaosAction::CheckUnit { .. } => "check_unit",
        }
    }

    /// Unit the action targets.
    pub fn unit(&self) -> &str {
        match self {
            ChaosAction::FailUnit { unit, .. }
            | ChaosAction::StopUnit { unit, .. }
            | ChaosAction::RestartUnit { unit, .. }
            | ChaosAction::RecoverUnit { unit, .. }
            | ChaosAction::CheckUnit { unit, .. } => unit,
        }
    }

    fn delay(&self) -> Duration {
        match self {
            ChaosAction::FailUnit { delay_ms, .. }
            | ChaosAction::StopUnit { delay_ms, .. }
            | ChaosAction::RestartUnit { delay_ms, .. }
            | ChaosAction::RecoverUnit { delay_ms, .. }
            | ChaosAction::CheckUnit { delay_ms, .. } => Duration::from_millis(*delay_ms),
        }
    }

    fn parameters(&self) -> serde_json::Value {
        match self {
            ChaosAction::FailUnit { reason, .. } => serde_json::json!({ "reason": reason }),
            _ => serde_json::json!({}),
        }
    }
}

/// Execution record returned after running a chaos scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ChaosEventRecord {
    /// Action label executed.
    pub action: String,
    /// Unit targeted by the action.
    pub unit: String,
    /// Delay, jitter included, applied before the action ran.
    pub delay_applied: Duration,
    /// Timestamp when the action was triggered.
    pub executed_at: DateTime<Utc>,
    /// Whether the supervisor reported success.
    pub success: bool,
    /// Lifecycle state of the unit after the action.
    pub state_after: LifecycleState,
    /// Debounced health, for `check_unit` only.
    pub health: Option<HealthStatus>,
    /// Additional contextual parameters recorded for traceability.
    pub parameters: serde_json::Value,
}

/// Chaos engine responsible for executing scenarios against a kernel.
#[derive(Debug)]
pub struct ChaosEngine {
    scenario: ChaosScenario,
    metrics: Option<ResilienceMetrics>,
    rng: StdRng,
}

impl ChaosEngine {
    /// Build a new chaos engine from a scenario.
    pub fn new(scenario: ChaosScenario, metrics: Option<ResilienceMetrics>) -> Self {
        let seed = scenario.seed.unwrap_or(DEFAULT_SEED);
        let rng = StdRng::seed_from_u64(seed);
        Self {
            scenario,
            metrics,
            rng,
        }
    }

    /// Scenario being executed.
    pub fn scenario(&self) -> &ChaosScenario {
        &self.scenario
    }

    /// Execute all chaos actions sequentially, returning execution records.
    ///
    /// Every targeted unit must be registered before anything runs. A kernel shutdown
    /// during a delay ends the scenario early with the records gathered so far.
    pub async fn execute(&mut self, kernel: &Kernel) -> Result<Vec<ChaosEventRecord>> {
        if let Some(unknown) = self
            .scenario
            .actions
            .iter()
            .find(|action| !kernel.registry().has(action.unit()))
        {
            bail!(
                "chaos action `{}` targets unknown unit `{}`",
                unknown.label(),
                unknown.unit()
            );
        }

        let mut records = Vec::with_capacity(self.scenario.actions.len());
        for action in &self.scenario.actions {
            let jitter = self.scenario.jitter_duration(&mut self.rng);
            let delay = action.delay() + jitter;
            if delay > Duration::ZERO && !kernel.shutdown_signal().sleep(delay).await {
                info!(executed = records.len(), "chaos scenario interrupted by shutdown");
                return Ok(records);
            }

            let executed_at = Utc::now();
            let started = Instant::now();
            let unit = action.unit();
            let supervisor = kernel.supervisor();
            let (success, health) = match action {
                ChaosAction::FailUnit { reason, .. } => {
                    (supervisor.inject_failure(unit, reason).await, None)
                }
                ChaosAction::StopUnit { .. } => (supervisor.stop(unit).await, None),
                ChaosAction::RestartUnit { .. } => (supervisor.restart(unit).await, None),
                ChaosAction::RecoverUnit { .. } => (supervisor.recover(unit).await, None),
                ChaosAction::CheckUnit { .. } => {
                    let check = kernel
                        .health()
                        .check(unit)
                        .await
                        .with_context(|| format!("chaos health check of `{unit}`"))?;
                    (!check.is_error(), Some(check.status))
                }
            };
            let elapsed = started.elapsed();
            if let Some(metrics) = &self.metrics {
                metrics.record_chaos_event(action.label(), success, elapsed);
            }
            let state_after = kernel
                .registry()
                .state(unit)
                .with_context(|| format!("unit `{unit}` vanished during chaos"))?;
            warn!(
                target: "keel::resilience::chaos",
                action = action.label(),
                unit,
                success,
                state = %state_after,
                delay_ms = delay.as_millis() as u64,
                params = %action.parameters(),
                "chaos action executed",
            );
            records.push(ChaosEventRecord {
                action: action.label().to_string(),
                unit: unit.to_string(),
                delay_applied: delay,
                executed_at,
                success,
                state_after,
                health,
                parameters: action.parameters(),
            });
        }
        info!(total_actions = records.len(), "completed chaos scenario");
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_action_kind() {
        let scenario = r#"
        seed = 7
        jitter_ms = 5

        [[actions]]
        type = "fail_unit"
        unit = "db"
        reason = "disk gone"

        [[actions]]
        type = "recover_unit"
        unit = "db"
        delay_ms = 10

        [[actions]]
        type = "stop_unit"
        unit = "api"

        [[actions]]
        type = "restart_unit"
        unit = "api"

        [[actions]]
        type = "check_unit"
        unit = "api"
        "#
        .parse::<ChaosScenario>()
        .unwrap();
        let labels: Vec<_> = scenario.actions.iter().map(ChaosAction::label).collect();
        assert_eq!(
            labels,
            vec!["fail_unit", "recover_unit", "stop_unit", "restart_unit", "check_unit"]
        );
        assert_eq!(scenario.actions[1].delay(), Duration::from_millis(10));
        assert_eq!(scenario.actions[0].parameters()["reason"], "disk gone");
        match &scenario.actions[2] {
            ChaosAction::StopUnit { unit, delay_ms } => {
                assert_eq!(unit, "api");
                assert_eq!(*delay_ms, 0);
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn unknown_action_type_is_rejected() {
        let err = r#"
        [[actions]]
        type = "kill_datacenter"
        unit = "db"
        "#
        .parse::<ChaosScenario>()
        .unwrap_err();
        assert!(err.to_string().contains("kill_datacenter"));
    }

    #[test]
    fn seeded_jitter_replays() {
        let scenario = ChaosScenario {
            seed: Some(42),
            jitter_ms: Some(100),
            actions: Vec::new(),
        };
        let mut a = StdRng::seed_from_u64(42);
        let mut b = StdRng::seed_from_u64(42);
        let first: Vec<_> = (0..8).map(|_| scenario.jitter_duration(&mut a)).collect();
        let second: Vec<_> = (0..8).map(|_| scenario.jitter_duration(&mut b)).collect();
        assert_eq!(first, second);
        assert!(first.iter().all(|d| *d <= Duration::from_millis(100)));

        let none = ChaosScenario {
            jitter_ms: Some(0),
            ..scenario
        };
        assert_eq!(none.jitter_duration(&mut a), Duration::ZERO);
    }
}
