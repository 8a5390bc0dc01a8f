//! ---
//! keel_section: "15-testing-qa-runbook"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "test"
//! keel_description: "Kernel boot, monitor and reset flows."
//! keel_version: "v0.1.0"
//! keel_owner: "tbd"
//! ---
mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{fast_config, kernel_with_audit, new_log, Probe, ScriptedUnit};
use keel_core::{Collaborators, Kernel, KernelError, LifecycleState, ProbeStatus};
use keel_metrics::new_registry;

#[tokio::test]
async fn boot_configures_in_order_then_starts() {
    let mut config = fast_config();
    let settings: toml::Table = toml::from_str(
        r#"
        pool_size = 8
        password = "hunter2"
        [tls]
        enabled = true
        "#,
    )
    .unwrap();
    config.units.insert("db".into(), settings);
    let (kernel, audit) = kernel_with_audit(config);
    let log = new_log();
    let api = ScriptedUnit::new("api", &["db"], &log);
    let db = ScriptedUnit::new("db", &[], &log);
    kernel.register(api.clone()).unwrap();
    kernel.register(db.clone()).unwrap();

    let report = kernel.boot().await.unwrap();
    assert!(report.is_success());
    assert_eq!(
        *log.lock(),
        vec![
            "configure:db",
            "boot:db",
            "configure:api",
            "boot:api",
            "start:db",
            "start:api"
        ]
    );
    let view = db.settings.lock().clone().unwrap();
    assert_eq!(view.get_as::<i64>("pool_size"), Some(8));
    assert_eq!(view.get_as::<bool>("tls.enabled"), Some(true));
    assert!(api.settings.lock().clone().unwrap().is_empty());

    let configure = audit.entries_for("unit.configure");
    assert_eq!(configure.len(), 2);
    assert_eq!(configure[0].payload["settings"]["password"], "[REDACTED]");
}

#[tokio::test]
async fn boot_aborts_on_cycles() {
    let (kernel, _audit) = kernel_with_audit(fast_config());
    let log = new_log();
    kernel.register(ScriptedUnit::new("a", &["b"], &log)).unwrap();
    kernel.register(ScriptedUnit::new("b", &["a"], &log)).unwrap();
    assert!(matches!(
        kernel.boot().await,
        Err(KernelError::CircularDependency(_))
    ));
    assert!(log.lock().is_empty());
}

#[tokio::test]
async fn configure_failure_stops_boot_at_that_unit() {
    let (kernel, _audit) = kernel_with_audit(fast_config());
    let log = new_log();
    let db = ScriptedUnit::new("db", &[], &log);
    db.fail_configure.store(true, Ordering::SeqCst);
    kernel.register(db).unwrap();
    kernel.register(ScriptedUnit::new("api", &["db"], &log)).unwrap();
    let report = kernel.boot().await.unwrap();
    assert_eq!(report.failed, vec!["db"]);
    assert_eq!(report.skipped, vec!["api"]);
    assert_eq!(kernel.registry().state("db").unwrap(), LifecycleState::Failed);
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let mut config = fast_config();
    config.health.window = 0;
    assert!(matches!(
        Kernel::new(config, Collaborators::permissive()),
        Err(KernelError::Config(_))
    ));
}

#[tokio::test]
async fn monitor_auto_recovers_failed_units() {
    let mut config = fast_config();
    config.health.interval = Duration::from_millis(10);
    config.health.retries = 1;
    config.health.failure_threshold = 1;
    config.health.auto_recover = true;
    let (kernel, _audit) = kernel_with_audit(config);
    let log = new_log();
    let unit = ScriptedUnit::new("db", &[], &log);
    unit.script([Probe::Report(ProbeStatus::Critical), Probe::Report(ProbeStatus::Healthy)]);
    kernel.register(unit.clone()).unwrap();
    kernel.boot().await.unwrap();

    assert!(kernel.spawn_monitor());
    assert!(!kernel.spawn_monitor());
    let mut recovered = false;
    for _ in 0..100 {
        if unit.recover_calls.load(Ordering::SeqCst) > 0 {
            recovered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(recovered);
    kernel.shutdown().await;
    assert_eq!(kernel.registry().state("db").unwrap(), LifecycleState::Stopped);
}

#[tokio::test]
async fn reset_clears_state() {
    let (kernel, _audit) = kernel_with_audit(fast_config());
    let log = new_log();
    kernel.register(ScriptedUnit::new("db", &[], &log)).unwrap();
    kernel.supervisor().start("db").await;
    kernel.shutdown().await;
    kernel.reset();
    assert!(kernel.registry().is_empty());
    assert!(kernel.bus().history().is_empty());
    assert!(!kernel.shutdown_signal().is_triggered());
    kernel.register(ScriptedUnit::new("db", &[], &log)).unwrap();
}

#[tokio::test]
async fn metrics_follow_lifecycle() {
    let registry = new_registry();
    let config = fast_config();
    let collaborators = Collaborators::from_config(&config, Some(registry.clone())).unwrap();
    let kernel = Kernel::new(config, collaborators).unwrap();
    let log = new_log();
    kernel.register(ScriptedUnit::new("db", &[], &log)).unwrap();
    kernel.supervisor().start("db").await;
    kernel.health().check("db").await.unwrap();

    let text = keel_metrics::render_text(&registry).unwrap();
    assert!(text.contains("keel_units_registered 1"));
    assert!(text.contains("keel_unit_state_transitions_total"));
    assert!(text.contains("keel_capability_checks_total"));
    assert!(text.contains("keel_health_check_seconds_bucket"));
}
