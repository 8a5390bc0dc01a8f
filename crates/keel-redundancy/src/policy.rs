//! ---
//! keel_section: "07-resilience-fault-tolerance"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Priority-scored promotion with quarantine."
//! keel_version: "v0.1.0"
//! keel_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use indexmap::IndexMap;
use keel_common::time::duration_to_millis;
use keel_common::{BackendConfig, ResourceConfig};
use keel_events::{topics, NotificationBus};
use keel_metrics::KernelMetrics;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::connector::{BackendConnector, BackendHealth, BackendSample};
use crate::error::FailoverError;
use crate::store::ReplicaStore;

const AUTO_PROMOTE_BONUS: i64 = 50;
const UNHEALTHY_PENALTY: i64 = 1000;
const QUARANTINE_PENALTY: i64 = 1000;
const LAG_PENALTY: i64 = 500;
const PREFERRED_TAG_BONUS: i64 = 25;

/// Promotion score: higher is better.
pub fn score_backend(
    config: &BackendConfig,
    sample: Option<&BackendSample>,
    quarantined: bool,
    preferred_tags: &[String],
) -> i64 {
    let mut score = config.priority + config.weight;
    if config.auto_promote {
        score += AUTO_PROMOTE_BONUS;
    }
    if !sample.is_some_and(BackendSample::is_healthy) {
        score -= UNHEALTHY_PENALTY;
    }
    if quarantined {
        score -= QUARANTINE_PENALTY;
    }
    if let (Some(lag), Some(threshold)) = (sample.and_then(|s| s.lag), config.lag_threshold) {
        if lag > threshold {
            score -= LAG_PENALTY;
        }
    }
    let matching = config
        .tags
        .iter()
        .filter(|tag| preferred_tags.contains(*tag))
        .count() as i64;
    score + matching * PREFERRED_TAG_BONUS
}

/// A backend eligible to serve the resource, after merging static and dynamic configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub name: String,
    pub config: BackendConfig,
    /// Registered at runtime rather than listed in the configuration file.
    pub dynamic: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PromotionRequest {
    pub reason: String,
    /// Only this backend may be promoted.
    pub target: Option<String>,
    /// Promote even when the candidate's last sample is not healthy.
    pub force: bool,
    /// Added to the resource's configured preferred tags.
    pub preferred_tags: Vec<String>,
}

impl PromotionRequest {
    pub fn automatic(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            ..Self::default()
        }
    }

    pub fn to(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            target: Some(target.into()),
            ..Self::default()
        }
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromotionOutcome {
    pub resource: String,
    pub from: String,
    pub to: String,
    pub reason: String,
    pub score: i64,
    /// Result of the probe run against the new active backend right after promotion.
    pub validated: bool,
    pub promoted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum HeartbeatOutcome {
    Healthy { active: String },
    Unhealthy { active: String, reason: String },
    Promoted(PromotionOutcome),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendRole {
    ConfiguredPrimary,
    ActivePrimary,
    Replica,
}

/// One row of [`FailoverPolicy::status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendStatusRow {
    pub name: String,
    pub role: BackendRole,
    pub health: BackendHealth,
    pub last_error: Option<String>,
    pub lag_ms: Option<u64>,
    pub latency_ms: Option<u64>,
    pub active: bool,
    pub quarantined: bool,
    pub quarantined_until: Option<DateTime<Utc>>,
    pub score: i64,
}

#[derive(Debug)]
struct PolicyState {
    active: String,
    dynamic: IndexMap<String, BackendConfig>,
    quarantine: HashMap<String, DateTime<Utc>>,
    samples: HashMap<String, BackendSample>,
}

impl PolicyState {
    /// Expired entries are dropped here, on access.
    fn is_quarantined(&mut self, backend: &str, now: DateTime<Utc>) -> bool {
        match self.quarantine.get(backend) {
            Some(until) if *until > now => true,
            Some(_) => {
                self.quarantine.remove(backend);
                debug!(backend, "quarantine expired");
                false
            }
            None => false,
        }
    }
}

/// Failover state of one replicated resource.
pub struct FailoverPolicy {
    resource: String,
    config: ResourceConfig,
    connector: Arc<dyn BackendConnector>,
    store: ReplicaStore,
    state: Mutex<PolicyState>,
    /// Serializes promotions; the state lock is never held across a probe.
    promotion: tokio::sync::Mutex<()>,
    bus: Arc<NotificationBus>,
    metrics: Option<KernelMetrics>,
}

impl FailoverPolicy {
    pub fn new(
        resource: impl Into<String>,
        config: ResourceConfig,
        connector: Arc<dyn BackendConnector>,
        bus: Arc<NotificationBus>,
        metrics: Option<KernelMetrics>,
    ) -> Result<Self, FailoverError> {
        let resource = resource.into();
        if !config.connections.contains_key(&config.primary) {
            return Err(FailoverError::UnknownBackend {
                resource,
                backend: config.primary.clone(),
            });
        }
        let store = ReplicaStore::new(resource.clone(), config.state_file.clone());
        let mut dynamic = store.load()?;
        dynamic.retain(|name, _| {
            let known = config.connections.contains_key(name);
            if !known {
                warn!(resource = %resource, backend = %name, "dropping persisted replica without connection");
            }
            known
        });
        Ok(Self {
            state: Mutex::new(PolicyState {
                active: config.primary.clone(),
                dynamic,
                quarantine: HashMap::new(),
                samples: HashMap::new(),
            }),
            resource,
            config,
            connector,
            store,
            promotion: tokio::sync::Mutex::new(()),
            bus,
            metrics,
        })
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    pub fn connector(&self) -> &Arc<dyn BackendConnector> {
        &self.connector
    }

    pub fn active(&self) -> String {
        self.state.lock().active.clone()
    }

    /// Primary, configured replicas, then runtime registrations; a runtime entry replaces a
    /// static one of the same name in place.
    pub fn candidates(&self) -> Vec<Candidate> {
        let state = self.state.lock();
        self.candidates_locked(&state)
    }

    fn candidates_locked(&self, state: &PolicyState) -> Vec<Candidate> {
        let mut merged: IndexMap<String, Candidate> = IndexMap::new();
        for name in std::iter::once(&self.config.primary).chain(self.config.replicas.iter()) {
            if let Some(config) = self.config.connections.get(name) {
                merged.insert(
                    name.clone(),
                    Candidate {
                        name: name.clone(),
                        config: config.clone(),
                        dynamic: false,
                    },
                );
            }
        }
        for (name, config) in &state.dynamic {
            merged.insert(
                name.clone(),
                Candidate {
                    name: name.clone(),
                    config: config.clone(),
                    dynamic: true,
                },
            );
        }
        merged.into_values().collect()
    }

    fn backend_config(&self, name: &str) -> BackendConfig {
        let state = self.state.lock();
        state
            .dynamic
            .get(name)
            .or_else(|| self.config.connections.get(name))
            .cloned()
            .unwrap_or_default()
    }

    async fn probe(&self, name: &str, config: &BackendConfig) -> BackendSample {
        let sample = match tokio::time::timeout(
            self.config.probe_timeout,
            self.connector.probe(name, config),
        )
        .await
        {
            Ok(sample) => sample,
            Err(_) => BackendSample::unhealthy(format!(
                "probe timed out after {}ms",
                duration_to_millis(self.config.probe_timeout)
            )),
        };
        self.state
            .lock()
            .samples
            .insert(name.to_string(), sample.clone());
        sample
    }

    /// Probe the active backend and, when allowed, promote a replacement if it is unhealthy
    /// or quarantined.
    pub async fn heartbeat(&self, auto_promote: bool) -> Result<HeartbeatOutcome, FailoverError> {
        let active = self.active();
        let sample = self.probe(&active, &self.backend_config(&active)).await;
        let quarantined = self.state.lock().is_quarantined(&active, Utc::now());
        if sample.is_healthy() && !quarantined {
            return Ok(HeartbeatOutcome::Healthy { active });
        }
        let reason = if quarantined {
            format!("active backend `{active}` is quarantined")
        } else {
            format!(
                "active backend `{active}` unhealthy: {}",
                sample.last_error.as_deref().unwrap_or("no detail")
            )
        };
        if !auto_promote {
            warn!(resource = %self.resource, backend = %active, %reason, "active backend degraded");
            return Ok(HeartbeatOutcome::Unhealthy { active, reason });
        }
        let _serial = self.promotion.lock().await;
        // a concurrent heartbeat already replaced the backend this probe saw failing
        let current = self.active();
        if current != active {
            debug!(resource = %self.resource, failed = %active, active = %current, "promotion already handled");
            return Ok(HeartbeatOutcome::Healthy { active: current });
        }
        self.promote_locked(PromotionRequest::automatic(reason))
            .await
            .map(HeartbeatOutcome::Promoted)
    }

    /// Score every candidate and switch to the best eligible one.
    ///
    /// The current active backend, quarantined backends and (when a target is named) every
    /// other backend are skipped. Candidates that are not healthy are skipped unless forced.
    pub async fn promote(
        &self,
        request: PromotionRequest,
    ) -> Result<PromotionOutcome, FailoverError> {
        let _serial = self.promotion.lock().await;
        self.promote_locked(request).await
    }

    /// Caller holds the promotion lock.
    async fn promote_locked(
        &self,
        request: PromotionRequest,
    ) -> Result<PromotionOutcome, FailoverError> {
        let candidates = self.candidates();
        if let Some(target) = &request.target {
            if !candidates.iter().any(|c| &c.name == target) {
                return Err(FailoverError::UnknownBackend {
                    resource: self.resource.clone(),
                    backend: target.clone(),
                });
            }
        }

        join_all(
            candidates
                .iter()
                .map(|candidate| self.probe(&candidate.name, &candidate.config)),
        )
        .await;

        let mut preferred = self.config.preferred_tags.clone();
        preferred.extend(request.preferred_tags.iter().cloned());
        let (from, ranked) = {
            let mut state = self.state.lock();
            let now = Utc::now();
            let mut scored = Vec::with_capacity(candidates.len());
            for candidate in candidates {
                let quarantined = state.is_quarantined(&candidate.name, now);
                let sample = state.samples.get(&candidate.name);
                let healthy = sample.is_some_and(BackendSample::is_healthy);
                let score = score_backend(&candidate.config, sample, quarantined, &preferred);
                let eligible = candidate.name != state.active
                    && !quarantined
                    && request
                        .target
                        .as_ref()
                        .map_or(true, |target| target == &candidate.name);
                debug!(
                    resource = %self.resource,
                    backend = %candidate.name,
                    score,
                    healthy,
                    quarantined,
                    eligible,
                    "scored failover candidate"
                );
                if eligible {
                    scored.push((candidate, score, healthy));
                }
            }
            // stable: equal scores keep candidate order
            scored.sort_by(|a, b| b.1.cmp(&a.1));
            (state.active.clone(), scored)
        };

        for (candidate, score, healthy) in ranked {
            if !healthy && !request.force {
                continue;
            }
            match tokio::time::timeout(
                self.config.probe_timeout,
                self.connector.connect(&candidate.name, &candidate.config),
            )
            .await
            {
                Ok(Ok(())) => {
                    return Ok(self
                        .commit(&from, &candidate, score, &request.reason)
                        .await)
                }
                Ok(Err(err)) => {
                    warn!(resource = %self.resource, backend = %candidate.name, error = %err, "candidate connection failed");
                }
                Err(_) => {
                    warn!(resource = %self.resource, backend = %candidate.name, "candidate connection timed out");
                }
            }
        }

        warn!(resource = %self.resource, active = %from, reason = %request.reason, "no backend qualified for promotion");
        self.bus.emit(
            topics::FAILOVER_FAILED,
            json!({ "resource": self.resource, "active": from, "reason": request.reason }),
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_failover_failure(&self.resource);
        }
        Err(FailoverError::PromotionFailed {
            resource: self.resource.clone(),
            reason: request.reason,
        })
    }

    async fn commit(
        &self,
        from: &str,
        candidate: &Candidate,
        score: i64,
        reason: &str,
    ) -> PromotionOutcome {
        let now = Utc::now();
        let until = quarantine_until(now, self.config.quarantine);
        {
            let mut state = self.state.lock();
            state.active = candidate.name.clone();
            state.quarantine.insert(from.to_string(), until);
        }
        let validated = self
            .probe(&candidate.name, &candidate.config)
            .await
            .is_healthy();
        if !validated {
            warn!(resource = %self.resource, backend = %candidate.name, "promoted backend failed validation probe");
        }
        info!(
            resource = %self.resource,
            from,
            to = %candidate.name,
            score,
            reason,
            quarantine_ms = duration_to_millis(self.config.quarantine),
            "backend promoted"
        );
        self.bus.emit(
            topics::FAILOVER_COMPLETED,
            json!({
                "resource": self.resource,
                "from": from,
                "to": candidate.name,
                "reason": reason,
                "score": score,
                "validated": validated,
            }),
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_failover(&self.resource, from, &candidate.name);
        }
        PromotionOutcome {
            resource: self.resource.clone(),
            from: from.to_string(),
            to: candidate.name.clone(),
            reason: reason.to_string(),
            score,
            validated,
            promoted_at: now,
        }
    }

    pub fn status(&self) -> Vec<BackendStatusRow> {
        let mut state = self.state.lock();
        let now = Utc::now();
        let candidates = self.candidates_locked(&state);
        candidates
            .into_iter()
            .map(|candidate| {
                let quarantined = state.is_quarantined(&candidate.name, now);
                let sample = state.samples.get(&candidate.name);
                let active = candidate.name == state.active;
                let role = if active {
                    BackendRole::ActivePrimary
                } else if candidate.name == self.config.primary {
                    BackendRole::ConfiguredPrimary
                } else {
                    BackendRole::Replica
                };
                BackendStatusRow {
                    score: score_backend(
                        &candidate.config,
                        sample,
                        quarantined,
                        &self.config.preferred_tags,
                    ),
                    health: sample.map_or(BackendHealth::Unknown, |s| s.health),
                    last_error: sample.and_then(|s| s.last_error.clone()),
                    lag_ms: sample.and_then(|s| s.lag).map(duration_to_millis),
                    latency_ms: sample.and_then(|s| s.latency).map(duration_to_millis),
                    quarantined_until: quarantined
                        .then(|| state.quarantine.get(&candidate.name).copied())
                        .flatten(),
                    name: candidate.name,
                    role,
                    active,
                    quarantined,
                }
            })
            .collect()
    }

    /// Add (or override) a runtime replica. `overrides` defaults to the connection's own
    /// configuration.
    pub async fn register_replica(
        &self,
        backend: &str,
        overrides: Option<BackendConfig>,
    ) -> Result<(), FailoverError> {
        let connection = self.config.connections.get(backend).ok_or_else(|| {
            FailoverError::UnknownBackend {
                resource: self.resource.clone(),
                backend: backend.to_string(),
            }
        })?;
        {
            let mut state = self.state.lock();
            let mut next = state.dynamic.clone();
            next.insert(
                backend.to_string(),
                overrides.unwrap_or_else(|| connection.clone()),
            );
            self.store.save(&next)?;
            state.dynamic = next;
        }
        info!(resource = %self.resource, backend, "replica registered");
        self.bus.emit(
            topics::REPLICA_REGISTERED,
            json!({ "resource": self.resource, "backend": backend }),
        );
        self.refresh().await;
        Ok(())
    }

    /// Remove a runtime replica. Returns `false` when it was not registered at runtime.
    pub async fn unregister_replica(&self, backend: &str) -> Result<bool, FailoverError> {
        if !self.config.connections.contains_key(backend) {
            return Err(FailoverError::UnknownBackend {
                resource: self.resource.clone(),
                backend: backend.to_string(),
            });
        }
        {
            let mut state = self.state.lock();
            if state.active == backend {
                return Err(FailoverError::ActiveBackend {
                    resource: self.resource.clone(),
                    backend: backend.to_string(),
                });
            }
            if !state.dynamic.contains_key(backend) {
                return Ok(false);
            }
            let mut next = state.dynamic.clone();
            next.shift_remove(backend);
            self.store.save(&next)?;
            state.dynamic = next;
        }
        info!(resource = %self.resource, backend, "replica unregistered");
        self.bus.emit(
            topics::REPLICA_UNREGISTERED,
            json!({ "resource": self.resource, "backend": backend }),
        );
        self.refresh().await;
        Ok(true)
    }

    async fn refresh(&self) {
        match self.heartbeat(false).await {
            Ok(HeartbeatOutcome::Unhealthy { reason, .. }) => {
                debug!(resource = %self.resource, %reason, "post-change heartbeat unhealthy");
            }
            Ok(_) => {}
            Err(err) => warn!(resource = %self.resource, error = %err, "post-change heartbeat failed"),
        }
    }
}

impl std::fmt::Debug for FailoverPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailoverPolicy")
            .field("resource", &self.resource)
            .field("active", &self.active())
            .finish_non_exhaustive()
    }
}

fn quarantine_until(now: DateTime<Utc>, quarantine: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(quarantine)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(priority: i64, auto_promote: bool, tags: &[&str]) -> BackendConfig {
        BackendConfig {
            priority,
            auto_promote,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            ..BackendConfig::default()
        }
    }

    #[test]
    fn scoring_components() {
        let healthy = BackendSample::healthy(None, Some(Duration::from_millis(900)));
        let mut config = backend(10, true, &["ssd", "eu"]);
        config.weight = 5;
        assert_eq!(
            score_backend(&config, Some(&healthy), false, &["eu".into()]),
            10 + 5 + 50 + 25
        );
        config.lag_threshold = Some(Duration::from_millis(500));
        assert_eq!(
            score_backend(&config, Some(&healthy), true, &[]),
            10 + 5 + 50 - 500 - 1000
        );
        assert_eq!(
            score_backend(&backend(0, false, &[]), None, false, &[]),
            -1000
        );
    }

    #[test]
    fn quarantine_saturates_on_huge_durations() {
        let now = Utc::now();
        assert_eq!(quarantine_until(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
        assert!(quarantine_until(now, Duration::from_secs(1)) > now);
    }
}
