//! ---
//! keel_section: "01-core-supervision"
//! keel_subsection: "binary"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Binary entrypoint for the Keel daemon."
//! keel_version: "v0.1.0"
//! keel_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use keel_common::config::KernelConfig;
use keel_common::logging::init_tracing;
use keel_core::{Collaborators, Kernel};
use keel_metrics::{new_registry, spawn_http_server, DaemonMetrics, SharedRegistry};
use keel_redundancy::{FailoverPolicy, ReplicatedResourceUnit, TcpBackendConnector};
use keel_resilience::{ChaosEngine, ChaosScenario, ResilienceMetrics};
use tokio::signal;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(
    author,
    version = concat!("Keel ", env!("CARGO_PKG_VERSION")),
    about = "Keel supervision daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Boot every unit and supervise until ctrl-c")]
    Run,
    #[command(about = "Load and validate the configuration, then exit")]
    Validate,
    #[command(about = "Print the dependency start order of configured units")]
    Order,
    #[command(about = "Boot the kernel, run a chaos scenario and shut down")]
    Chaos {
        #[arg(value_name = "SCENARIO", help = "TOML chaos scenario")]
        scenario: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/keel.toml"));
    candidates.push(PathBuf::from("/etc/keel/keel.toml"));

    let load_started = Instant::now();
    let loaded = KernelConfig::load_with_source(&candidates)?;
    let config = loaded.config;
    let load_duration = load_started.elapsed();

    let metrics_registry = new_registry();
    let daemon_metrics = DaemonMetrics::new(metrics_registry.clone())?;
    daemon_metrics.observe_config_load(load_duration.as_secs_f64());

    init_tracing("keeld", &config.logging)?;
    info!(config_path = %loaded.source.display(), "configuration loaded");

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Validate => {
            config.validate()?;
            println!("{}: ok", loaded.source.display());
        }
        Commands::Order => {
            let kernel = build_kernel(config, None)?;
            let order = kernel.registry().resolve_dependency_order()?;
            for (position, name) in order.iter().enumerate() {
                println!("{:>3}  {name}", position + 1);
            }
        }
        Commands::Run => {
            daemon_metrics.inc_start();
            daemon_metrics.set_build_info(env!("CARGO_PKG_VERSION"), build_profile());
            run_daemon(config, metrics_registry).await?;
        }
        Commands::Chaos { scenario } => {
            let scenario = ChaosScenario::from_file(&scenario)?;
            run_chaos(config, scenario, metrics_registry).await?;
        }
    }

    Ok(())
}

fn build_profile() -> &'static str {
    if cfg!(debug_assertions) {
        "debug"
    } else {
        "release"
    }
}

/// Kernel with one replicated resource unit per `[resources.<name>]` section.
fn build_kernel(config: KernelConfig, registry: Option<SharedRegistry>) -> Result<Kernel> {
    let collaborators = Collaborators::from_config(&config, registry)?;
    let metrics = collaborators.metrics.clone();
    let resources = config.resources.clone();
    let kernel = Kernel::new(config, collaborators)?;
    for (name, resource) in resources {
        let connector = Arc::new(TcpBackendConnector::new(resource.probe_timeout));
        let policy = FailoverPolicy::new(
            name.clone(),
            resource,
            connector,
            kernel.bus().clone(),
            metrics.clone(),
        )
        .with_context(|| format!("building failover policy for `{name}`"))?;
        kernel.register(Arc::new(ReplicatedResourceUnit::new(Arc::new(policy))))?;
    }
    Ok(kernel)
}

async fn run_daemon(config: KernelConfig, metrics_registry: SharedRegistry) -> Result<()> {
    let metrics_settings = config.metrics.clone();
    let metrics_server = if metrics_settings.enabled {
        info!(address = %metrics_settings.listen, "metrics exporter enabled");
        Some(spawn_http_server(metrics_registry.clone(), metrics_settings.listen)?)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let kernel = build_kernel(config, Some(metrics_registry))?;
    let report = kernel.boot().await?;
    if !report.is_success() {
        warn!(failed = ?report.failed, skipped = ?report.skipped, "kernel booted with failures");
    }
    if kernel.spawn_monitor() {
        info!("health monitor running");
    }

    info!(units = kernel.registry().len(), "daemon running; waiting for termination signal");
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");
    let report = kernel.shutdown().await;
    if !report.is_success() {
        warn!(failed = ?report.failed, "some units did not shut down cleanly");
    }

    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }
    Ok(())
}

async fn run_chaos(
    config: KernelConfig,
    scenario: ChaosScenario,
    metrics_registry: SharedRegistry,
) -> Result<()> {
    let resilience = ResilienceMetrics::new(metrics_registry.clone())?;
    let kernel = build_kernel(config, Some(metrics_registry))?;
    kernel.boot().await?;

    let mut engine = ChaosEngine::new(scenario, Some(resilience));
    let outcome = engine.execute(&kernel).await;
    kernel.shutdown().await;
    let records = outcome?;
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}
