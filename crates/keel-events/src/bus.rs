//! ---
//! keel_section: "02-events-notifications"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Notification bus and topic catalogue."
//! keel_version: "v0.1.0"
//! keel_owner: "tbd"
//! ---
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use keel_common::config::EventsConfig;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::topics;

/// Callback invoked synchronously for every matching notification.
pub type Handler = Arc<dyn Fn(&Notification) -> anyhow::Result<()> + Send + Sync>;

/// A single emitted event, retained in the bus history.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Notification {
    /// Monotonic sequence number assigned by the bus.
    pub sequence: u64,
    /// Topic the event was emitted on.
    pub topic: String,
    /// Event payload.
    pub payload: serde_json::Value,
    /// Emission timestamp.
    pub emitted_at: DateTime<Utc>,
}

/// Identifier returned by [`NotificationBus::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    pattern: String,
    priority: i32,
    handler: Handler,
}

/// Snapshot of bus counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BusStats {
    /// Notifications emitted.
    pub emitted: u64,
    /// Successful handler invocations.
    pub delivered: u64,
    /// Handler invocations that returned an error or panicked.
    pub failed: u64,
    /// Handler invocations that exceeded the handler timeout.
    pub slow: u64,
}

struct Counters {
    emitted: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    slow: AtomicU64,
}

impl Counters {
    fn new() -> Self {
        Self {
            emitted: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            slow: AtomicU64::new(0),
        }
    }

    fn snapshot(&self) -> BusStats {
        BusStats {
            emitted: self.emitted.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            slow: self.slow.load(Ordering::Relaxed),
        }
    }
}

/// Synchronous, priority-ordered fan-out with per-handler isolation and a bounded history.
///
/// Handlers with a higher priority run first; equal priorities run in subscription order.
/// A handler that errors or panics is logged and skipped, the remaining handlers still run.
/// Handlers are invoked outside the subscription lock, so they may subscribe or emit.
pub struct NotificationBus {
    subscriptions: RwLock<Vec<Subscription>>,
    history: Mutex<VecDeque<Notification>>,
    history_cap: usize,
    handler_timeout: Duration,
    next_subscription: AtomicU64,
    next_sequence: AtomicU64,
    counters: Counters,
}

impl NotificationBus {
    /// Create a bus retaining at most `history_cap` notifications.
    pub fn new(history_cap: usize, handler_timeout: Duration) -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
            history: Mutex::new(VecDeque::with_capacity(history_cap.min(1024))),
            history_cap: history_cap.max(1),
            handler_timeout,
            next_subscription: AtomicU64::new(1),
            next_sequence: AtomicU64::new(1),
            counters: Counters::new(),
        }
    }

    /// Build a bus from the `[events]` configuration section.
    pub fn from_config(config: &EventsConfig) -> Self {
        Self::new(config.history_cap, config.handler_timeout)
    }

    /// Subscribe `handler` to `pattern`: an exact topic, a `prefix.*` wildcard, or `*`.
    pub fn on<F>(&self, pattern: impl Into<String>, handler: F, priority: i32) -> SubscriptionId
    where
        F: Fn(&Notification) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        let pattern = pattern.into();
        debug!(pattern = %pattern, priority, "notification handler subscribed");
        self.subscriptions.write().push(Subscription {
            id,
            pattern,
            priority,
            handler: Arc::new(handler),
        });
        id
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.write();
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        subscriptions.len() != before
    }

    /// Emit `payload` on `topic`, returning the number of handlers that completed successfully.
    pub fn emit(&self, topic: &str, payload: serde_json::Value) -> usize {
        let notification = Notification {
            sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
            topic: topic.to_owned(),
            payload,
            emitted_at: Utc::now(),
        };
        self.counters.emitted.fetch_add(1, Ordering::Relaxed);
        self.remember(notification.clone());

        let mut handlers: Vec<(i32, SubscriptionId, Handler)> = self
            .subscriptions
            .read()
            .iter()
            .filter(|s| topic_matches(&s.pattern, topic))
            .map(|s| (s.priority, s.id, s.handler.clone()))
            .collect();
        // stable sort keeps subscription order within a priority
        handlers.sort_by(|a, b| b.0.cmp(&a.0));

        let mut delivered = 0;
        for (priority, id, handler) in handlers {
            let started = Instant::now();
            let result = catch_unwind(AssertUnwindSafe(|| handler(&notification)));
            let elapsed = started.elapsed();
            if elapsed > self.handler_timeout {
                self.counters.slow.fetch_add(1, Ordering::Relaxed);
                warn!(
                    topic,
                    subscription = id.0,
                    priority,
                    elapsed_ms = elapsed.as_millis() as u64,
                    timeout_ms = self.handler_timeout.as_millis() as u64,
                    "notification handler exceeded timeout"
                );
            }
            match result {
                Ok(Ok(())) => {
                    delivered += 1;
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(err)) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(topic, subscription = id.0, error = %err, "notification handler failed");
                }
                Err(_) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    error!(topic, subscription = id.0, "notification handler panicked");
                }
            }
        }
        delivered
    }

    fn remember(&self, notification: Notification) {
        let mut history = self.history.lock();
        while history.len() >= self.history_cap {
            history.pop_front();
        }
        history.push_back(notification);
    }

    /// Retained notifications, oldest first.
    pub fn history(&self) -> Vec<Notification> {
        self.history.lock().iter().cloned().collect()
    }

    /// Retained notifications on `topic`, oldest first.
    pub fn history_for(&self, topic: &str) -> Vec<Notification> {
        self.history
            .lock()
            .iter()
            .filter(|n| n.topic == topic)
            .cloned()
            .collect()
    }

    /// Number of active subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> BusStats {
        self.counters.snapshot()
    }

    /// Drop the retained history; subscriptions are kept.
    pub fn clear(&self) {
        self.history.lock().clear();
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::from_config(&EventsConfig::default())
    }
}

impl std::fmt::Debug for NotificationBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationBus")
            .field("subscriptions", &self.subscription_count())
            .field("history_cap", &self.history_cap)
            .field("handler_timeout", &self.handler_timeout)
            .finish_non_exhaustive()
    }
}

fn topic_matches(pattern: &str, topic: &str) -> bool {
    if pattern == topics::ALL || pattern == topic {
        return true;
    }
    match pattern.strip_suffix(".*") {
        Some(prefix) => topic
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.')),
        None => false,
    }
}
