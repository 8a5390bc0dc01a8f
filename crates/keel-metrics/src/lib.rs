//! ---
//! keel_section: "03-persistence-logging"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Metrics collection and export utilities."
//! keel_version: "v0.1.0"
//! keel_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{
    GaugeVec, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across the workspace.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Encode every family in the registry using the Prometheus text exposition format.
pub fn render_text(registry: &Registry) -> Result<String> {
    let families = registry.gather();
    TextEncoder::new()
        .encode_to_string(&families)
        .context("failed to encode metrics")
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .context("failed to configure metrics listener as non-blocking")?;
    let bound = std_listener
        .local_addr()
        .context("failed to read metrics listener address")?;
    let listener = TcpListener::from_std(std_listener)
        .context("failed to convert std listener into tokio listener")?;

    info!(address = %bound, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = app.into_make_service();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr: bound,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    match render_text(&registry) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            body,
        ),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))],
                String::from("metrics encoding error"),
            )
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Return the bound address for convenience.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Metrics recorded by the daemon process itself.
#[derive(Clone)]
pub struct DaemonMetrics {
    registry: SharedRegistry,
    starts_total: IntCounter,
    config_load_seconds: Histogram,
    build_info: GaugeVec,
}

impl DaemonMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let starts_total = IntCounter::with_opts(Opts::new(
            "keeld_starts_total",
            "Total number of times the kernel daemon has initialised",
        ))?;
        registry.register(Box::new(starts_total.clone()))?;

        let buckets = prometheus::exponential_buckets(0.001, 2.0, 16)
            .context("failed to construct histogram buckets")?;
        let config_load_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "keeld_config_load_seconds",
                "Time spent loading and validating configuration",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(config_load_seconds.clone()))?;

        let build_info = GaugeVec::new(
            Opts::new("keeld_build_info", "Build metadata for the running daemon"),
            &["version", "profile"],
        )?;
        registry.register(Box::new(build_info.clone()))?;

        Ok(Self {
            registry,
            starts_total,
            config_load_seconds,
            build_info,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn inc_start(&self) {
        self.starts_total.inc();
    }

    pub fn observe_config_load(&self, seconds: f64) {
        self.config_load_seconds.observe(seconds);
    }

    pub fn set_build_info(&self, version: &str, profile: &str) {
        self.build_info
            .with_label_values(&[version, profile])
            .set(1.0);
    }
}

impl std::fmt::Debug for DaemonMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonMetrics").finish_non_exhaustive()
    }
}

/// Telemetry emitted by the registry, supervisor, health evaluator and failover policies.
#[derive(Clone)]
pub struct KernelMetrics {
    registry: SharedRegistry,
    units_registered: IntGauge,
    state_transitions: IntCounterVec,
    lifecycle_actions: IntCounterVec,
    health_checks: IntCounterVec,
    health_check_seconds: HistogramVec,
    unit_restarts: IntGaugeVec,
    recoveries: IntCounterVec,
    failovers: IntCounterVec,
    failover_failures: IntCounterVec,
}

impl KernelMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let units_registered = IntGauge::with_opts(Opts::new(
            "keel_units_registered",
            "Number of managed units currently registered",
        ))?;
        registry.register(Box::new(units_registered.clone()))?;

        let state_transitions = IntCounterVec::new(
            Opts::new(
                "keel_unit_state_transitions_total",
                "Lifecycle state transitions by unit and target state",
            ),
            &["unit", "state"],
        )?;
        registry.register(Box::new(state_transitions.clone()))?;

        let lifecycle_actions = IntCounterVec::new(
            Opts::new(
                "keel_lifecycle_actions_total",
                "Supervisor actions by unit, action and outcome",
            ),
            &["unit", "action", "outcome"],
        )?;
        registry.register(Box::new(lifecycle_actions.clone()))?;

        let health_checks = IntCounterVec::new(
            Opts::new(
                "keel_health_checks_total",
                "Completed health checks by unit and derived status",
            ),
            &["unit", "status"],
        )?;
        registry.register(Box::new(health_checks.clone()))?;

        let health_check_seconds = HistogramVec::new(
            HistogramOpts::new(
                "keel_health_check_seconds",
                "Wall-clock duration of a health check including retries",
            )
            .buckets(prometheus::exponential_buckets(0.001, 2.0, 16)?),
            &["unit"],
        )?;
        registry.register(Box::new(health_check_seconds.clone()))?;

        let unit_restarts = IntGaugeVec::new(
            Opts::new(
                "keel_unit_restarts",
                "Current restart counter per unit (reset on confirmed start)",
            ),
            &["unit"],
        )?;
        registry.register(Box::new(unit_restarts.clone()))?;

        let recoveries = IntCounterVec::new(
            Opts::new(
                "keel_recoveries_total",
                "Recovery attempts by unit and outcome",
            ),
            &["unit", "outcome"],
        )?;
        registry.register(Box::new(recoveries.clone()))?;

        let failovers = IntCounterVec::new(
            Opts::new(
                "keel_failovers_total",
                "Backend promotions by resource, demoted and promoted backend",
            ),
            &["resource", "from", "to"],
        )?;
        registry.register(Box::new(failovers.clone()))?;

        let failover_failures = IntCounterVec::new(
            Opts::new(
                "keel_failover_failures_total",
                "Promotion attempts that found no eligible backend",
            ),
            &["resource"],
        )?;
        registry.register(Box::new(failover_failures.clone()))?;

        Ok(Self {
            registry,
            units_registered,
            state_transitions,
            lifecycle_actions,
            health_checks,
            health_check_seconds,
            unit_restarts,
            recoveries,
            failovers,
            failover_failures,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn set_units_registered(&self, count: usize) {
        self.units_registered
            .set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    pub fn record_transition(&self, unit: &str, state: &str) {
        self.state_transitions
            .with_label_values(&[unit, state])
            .inc();
    }

    pub fn record_action(&self, unit: &str, action: &str, success: bool) {
        self.lifecycle_actions
            .with_label_values(&[unit, action, outcome_label(success)])
            .inc();
    }

    pub fn record_health_check(&self, unit: &str, status: &str, seconds: f64) {
        self.health_checks.with_label_values(&[unit, status]).inc();
        self.health_check_seconds
            .with_label_values(&[unit])
            .observe(seconds);
    }

    pub fn set_restart_count(&self, unit: &str, count: u32) {
        self.unit_restarts
            .with_label_values(&[unit])
            .set(i64::from(count));
    }

    pub fn record_recovery(&self, unit: &str, success: bool) {
        self.recoveries
            .with_label_values(&[unit, outcome_label(success)])
            .inc();
    }

    pub fn record_failover(&self, resource: &str, from: &str, to: &str) {
        self.failovers
            .with_label_values(&[resource, from, to])
            .inc();
    }

    pub fn record_failover_failure(&self, resource: &str) {
        self.failover_failures
            .with_label_values(&[resource])
            .inc();
    }
}

impl std::fmt::Debug for KernelMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelMetrics").finish_non_exhaustive()
    }
}

fn outcome_label(success: bool) -> &'static str {
    if success {
        "success"
    } else {
        "failure"
    }
}

pub use prometheus;
