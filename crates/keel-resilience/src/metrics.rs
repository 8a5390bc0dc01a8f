//! ---
//! keel_section: "07-resilience-fault-tolerance"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Chaos scenarios and resilience metrics."
//! keel_version: "v0.1.0"
//! keel_owner: "tbd"
//! ---
use std::time::Duration;

use anyhow::Result;
use keel_metrics::SharedRegistry;
use prometheus::{self, HistogramOpts, HistogramVec, IntCounterVec, Opts};

/// Metrics published by the chaos engine.
#[derive(Clone)]
pub struct ResilienceMetrics {
    registry: SharedRegistry,
    chaos_events_total: IntCounterVec,
    chaos_action_seconds: HistogramVec,
}

impl ResilienceMetrics {
    /// Register the resilience metric family against the provided registry.
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let chaos_events_total = IntCounterVec::new(
            Opts::new(
                "keel_chaos_events_total",
                "Number of chaos injection actions executed",
            ),
            &["action"],
        )?;
        registry.register(Box::new(chaos_events_total.clone()))?;

        let histogram_opts = HistogramOpts::new(
            "keel_chaos_action_seconds",
            "Time spent inside the supervisor call of a chaos action",
        )
        .buckets(prometheus::exponential_buckets(0.001, 2.0, 16)?);
        let chaos_action_seconds = HistogramVec::new(histogram_opts, &["action", "outcome"])?;
        registry.register(Box::new(chaos_action_seconds.clone()))?;

        Ok(Self {
            registry,
            chaos_events_total,
            chaos_action_seconds,
        })
    }

    /// Expose the underlying shared registry for convenience.
    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    /// Count one executed action and observe how long the supervisor took.
    pub fn record_chaos_event(&self, action: &str, success: bool, elapsed: Duration) {
        self.chaos_events_total.with_label_values(&[action]).inc();
        let outcome = if success { "success" } else { "failure" };
        self.chaos_action_seconds
            .with_label_values(&[action, outcome])
            .observe(elapsed.as_secs_f64());
    }
}

impl std::fmt::Debug for ResilienceMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceMetrics").finish_non_exhaustive()
    }
}
