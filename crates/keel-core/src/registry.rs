//! ---
//! keel_section: "01-core-supervision"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Unit registry and dependency ordering."
//! keel_version: "v0.1.0"
//! keel_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use keel_events::{topics, NotificationBus};
use keel_metrics::KernelMetrics;
use parking_lot::{Mutex, RwLock};
use semver::Version;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};

use crate::error::{KernelError, KernelResult};
use crate::unit::{HealthStatus, LifecycleState, ManagedUnit};

/// Registry-owned view of one unit. Snapshots are handed out by value.
#[derive(Debug, Clone, Serialize)]
pub struct UnitRecord {
    pub name: String,
    pub version: Version,
    pub dependencies: Vec<String>,
    pub state: LifecycleState,
    pub health: HealthStatus,
    pub health_detail: serde_json::Value,
    pub restart_count: u32,
    pub registered_at: DateTime<Utc>,
    pub last_transition: Option<DateTime<Utc>>,
}

pub(crate) struct UnitSlot {
    pub(crate) name: String,
    pub(crate) unit: Arc<dyn ManagedUnit>,
    record: Mutex<UnitRecord>,
    /// Serializes supervisor actions on this unit.
    pub(crate) op_lock: tokio::sync::Mutex<()>,
}

impl UnitSlot {
    pub(crate) fn state(&self) -> LifecycleState {
        self.record.lock().state
    }

    pub(crate) fn restart_count(&self) -> u32 {
        self.record.lock().restart_count
    }
}

/// Ground truth for registered units, their state, health and restart counters.
pub struct UnitRegistry {
    slots: RwLock<IndexMap<String, Arc<UnitSlot>>>,
    bus: Arc<NotificationBus>,
    metrics: Option<KernelMetrics>,
}

impl UnitRegistry {
    pub fn new(bus: Arc<NotificationBus>, metrics: Option<KernelMetrics>) -> Self {
        Self {
            slots: RwLock::new(IndexMap::new()),
            bus,
            metrics,
        }
    }

    /// Take ownership of `unit`. The first registration of a name wins.
    pub fn register(&self, unit: Arc<dyn ManagedUnit>) -> KernelResult<()> {
        let name = unit.name().to_string();
        let record = UnitRecord {
            name: name.clone(),
            version: unit.version(),
            dependencies: unit.dependencies(),
            state: LifecycleState::Registered,
            health: HealthStatus::Unknown,
            health_detail: serde_json::Value::Null,
            restart_count: 0,
            registered_at: Utc::now(),
            last_transition: None,
        };
        let payload = json!({
            "unit": name,
            "version": record.version.to_string(),
            "dependencies": record.dependencies,
        });
        let count = {
            let mut slots = self.slots.write();
            if slots.contains_key(&name) {
                return Err(KernelError::DuplicateUnit(name));
            }
            slots.insert(
                name.clone(),
                Arc::new(UnitSlot {
                    name: name.clone(),
                    unit,
                    record: Mutex::new(record),
                    op_lock: tokio::sync::Mutex::new(()),
                }),
            );
            slots.len()
        };
        if let Some(metrics) = &self.metrics {
            metrics.set_units_registered(count);
            metrics.set_restart_count(&name, 0);
        }
        info!(unit = %name, "unit registered");
        self.bus.emit(topics::UNIT_REGISTERED, payload);
        Ok(())
    }

    pub(crate) fn slot(&self, name: &str) -> KernelResult<Arc<UnitSlot>> {
        self.slots
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| KernelError::UnitNotFound(name.to_string()))
    }

    pub(crate) fn slots(&self) -> Vec<Arc<UnitSlot>> {
        self.slots.read().values().cloned().collect()
    }

    pub fn unit(&self, name: &str) -> KernelResult<Arc<dyn ManagedUnit>> {
        Ok(self.slot(name)?.unit.clone())
    }

    pub fn get(&self, name: &str) -> Option<UnitRecord> {
        self.slots
            .read()
            .get(name)
            .map(|slot| slot.record.lock().clone())
    }

    pub fn has(&self, name: &str) -> bool {
        self.slots.read().contains_key(name)
    }

    /// Names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.slots.read().keys().cloned().collect()
    }

    pub fn records(&self) -> Vec<UnitRecord> {
        self.slots
            .read()
            .values()
            .map(|slot| slot.record.lock().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state(&self, name: &str) -> KernelResult<LifecycleState> {
        Ok(self.slot(name)?.state())
    }

    /// Move `name` to `state`, returning the previous state.
    pub fn set_state(&self, name: &str, state: LifecycleState) -> KernelResult<LifecycleState> {
        let slot = self.slot(name)?;
        Ok(self.transition(&slot, state))
    }

    pub(crate) fn transition(&self, slot: &UnitSlot, state: LifecycleState) -> LifecycleState {
        let previous = {
            let mut record = slot.record.lock();
            let previous = record.state;
            record.state = state;
            record.last_transition = Some(Utc::now());
            previous
        };
        debug!(unit = %slot.name, from = %previous, to = %state, "unit state changed");
        if let Some(metrics) = &self.metrics {
            metrics.record_transition(&slot.name, state.as_str());
        }
        self.bus.emit(
            topics::UNIT_STATE_CHANGED,
            json!({"unit": slot.name, "from": previous, "to": state}),
        );
        previous
    }

    /// Every unit after all of its dependencies; ties keep registration order.
    ///
    /// Units that can never be placed (cycles, or a dependency that is not registered)
    /// are reported together in [`KernelError::CircularDependency`].
    pub fn resolve_dependency_order(&self) -> KernelResult<Vec<String>> {
        let mut pending: Vec<(String, Vec<String>)> = self
            .slots
            .read()
            .values()
            .map(|slot| (slot.name.clone(), slot.record.lock().dependencies.clone()))
            .collect();
        let mut order = Vec::with_capacity(pending.len());
        let mut placed: HashSet<String> = HashSet::with_capacity(pending.len());

        while !pending.is_empty() {
            // only dependencies placed in earlier passes count, so each pass is one layer
            let ready: Vec<String> = pending
                .iter()
                .filter(|(_, deps)| deps.iter().all(|dep| placed.contains(dep)))
                .map(|(name, _)| name.clone())
                .collect();
            if ready.is_empty() {
                return Err(KernelError::CircularDependency(
                    pending.into_iter().map(|(name, _)| name).collect(),
                ));
            }
            pending.retain(|(name, _)| !ready.contains(name));
            placed.extend(ready.iter().cloned());
            order.extend(ready);
        }
        Ok(order)
    }

    pub fn set_health(
        &self,
        name: &str,
        status: HealthStatus,
        detail: serde_json::Value,
    ) -> KernelResult<()> {
        let slot = self.slot(name)?;
        let mut record = slot.record.lock();
        record.health = status;
        record.health_detail = detail;
        Ok(())
    }

    pub fn get_health(&self, name: &str) -> KernelResult<(HealthStatus, serde_json::Value)> {
        let slot = self.slot(name)?;
        let record = slot.record.lock();
        Ok((record.health, record.health_detail.clone()))
    }

    pub fn restart_count(&self, name: &str) -> KernelResult<u32> {
        Ok(self.slot(name)?.restart_count())
    }

    /// Returns the incremented value.
    pub fn increment_restart_count(&self, name: &str) -> KernelResult<u32> {
        let slot = self.slot(name)?;
        Ok(self.bump_restarts(&slot))
    }

    pub fn reset_restart_count(&self, name: &str) -> KernelResult<()> {
        let slot = self.slot(name)?;
        self.clear_restarts(&slot);
        Ok(())
    }

    pub(crate) fn bump_restarts(&self, slot: &UnitSlot) -> u32 {
        let count = {
            let mut record = slot.record.lock();
            record.restart_count = record.restart_count.saturating_add(1);
            record.restart_count
        };
        if let Some(metrics) = &self.metrics {
            metrics.set_restart_count(&slot.name, count);
        }
        count
    }

    pub(crate) fn clear_restarts(&self, slot: &UnitSlot) {
        slot.record.lock().restart_count = 0;
        if let Some(metrics) = &self.metrics {
            metrics.set_restart_count(&slot.name, 0);
        }
    }

    /// Drop every unit. Intended for test resets.
    pub fn clear(&self) {
        self.slots.write().clear();
        if let Some(metrics) = &self.metrics {
            metrics.set_units_registered(0);
        }
    }
}

impl std::fmt::Debug for UnitRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitRegistry")
            .field("units", &self.names())
            .finish_non_exhaustive()
    }
}
