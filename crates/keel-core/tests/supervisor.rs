//! ---
//! keel_section: "15-testing-qa-runbook"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "test"
//! keel_description: "Lifecycle supervisor behaviour."
//! keel_version: "v0.1.0"
//! keel_owner: "tbd"
//! ---
mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{fast_config, kernel_with_audit, new_log, ScriptedUnit};
use keel_common::{KernelConfig, RecoveryStrategy, SecurityConfig};
use keel_core::{Collaborators, Kernel, KernelError, LifecycleState};
use keel_events::topics;
use keel_security::{Actor, AuditOutcome, MemoryAuditSink, RbacGate};

#[tokio::test]
async fn start_all_respects_dependencies_and_stop_all_reverses() {
    let (kernel, _audit) = kernel_with_audit(fast_config());
    let log = new_log();
    kernel.register(ScriptedUnit::new("b", &["a"], &log)).unwrap();
    kernel.register(ScriptedUnit::new("a", &[], &log)).unwrap();

    let report = kernel.supervisor().start_all().await.unwrap();
    assert!(report.is_success());
    assert_eq!(report.succeeded, vec!["a", "b"]);

    let report = kernel.supervisor().stop_all().await.unwrap();
    assert_eq!(report.succeeded, vec!["b", "a"]);
    assert_eq!(
        *log.lock(),
        vec!["start:a", "start:b", "stop:b", "stop:a"]
    );
    assert_eq!(
        kernel.registry().state("a").unwrap(),
        LifecycleState::Stopped
    );
}

#[tokio::test]
async fn start_all_aborts_on_first_failure() {
    let (kernel, _audit) = kernel_with_audit(fast_config());
    let log = new_log();
    let db = ScriptedUnit::new("db", &[], &log);
    db.fail_start.store(true, Ordering::SeqCst);
    kernel.register(db).unwrap();
    kernel.register(ScriptedUnit::new("api", &["db"], &log)).unwrap();
    kernel.register(ScriptedUnit::new("ui", &["api"], &log)).unwrap();

    let report = kernel.supervisor().start_all().await.unwrap();
    assert_eq!(report.failed, vec!["db"]);
    assert_eq!(report.skipped, vec!["api", "ui"]);
    assert_eq!(*log.lock(), vec!["start:db"]);
    assert_eq!(kernel.registry().state("db").unwrap(), LifecycleState::Failed);
    assert_eq!(
        kernel.registry().state("api").unwrap(),
        LifecycleState::Registered
    );
}

#[tokio::test]
async fn batch_operations_surface_cycles() {
    let (kernel, _audit) = kernel_with_audit(fast_config());
    let log = new_log();
    kernel.register(ScriptedUnit::new("a", &["b"], &log)).unwrap();
    kernel.register(ScriptedUnit::new("b", &["a"], &log)).unwrap();
    let err = kernel.supervisor().start_all().await.unwrap_err();
    assert!(matches!(err, KernelError::CircularDependency(ref units) if units.len() == 2));
    assert!(log.lock().is_empty());
}

#[tokio::test]
async fn start_failure_marks_failed_and_audits() {
    let (kernel, audit) = kernel_with_audit(fast_config());
    let log = new_log();
    let unit = ScriptedUnit::new("gw", &[], &log);
    unit.panic_start.store(true, Ordering::SeqCst);
    kernel.register(unit).unwrap();

    assert!(!kernel.supervisor().start("gw").await);
    assert_eq!(kernel.registry().state("gw").unwrap(), LifecycleState::Failed);
    let failed = kernel.bus().history_for(topics::UNIT_FAILED);
    assert_eq!(failed.len(), 1);
    assert!(failed[0].payload["error"]
        .as_str()
        .unwrap()
        .contains("start blew up"));
    let entries = audit.entries_for("unit.start");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].context.outcome, AuditOutcome::Failure);

    // failed units must go through recover
    assert!(!kernel.supervisor().start("gw").await);
    assert!(!kernel.supervisor().stop("gw").await);
    assert_eq!(*log.lock(), vec!["start:gw"]);
    let starts = audit.entries_for("unit.start");
    assert_eq!(starts.len(), 2);
    assert_eq!(starts[1].context.outcome, AuditOutcome::Failure);
    assert_eq!(starts[1].payload["error"], "unit is failed");
    let stops = audit.entries_for("unit.stop");
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].context.outcome, AuditOutcome::Failure);
    assert_eq!(stops[0].payload["error"], "unit is failed");
}

#[tokio::test]
async fn start_is_idempotent_and_stop_on_registered_is_noop() {
    let (kernel, _audit) = kernel_with_audit(fast_config());
    let log = new_log();
    kernel.register(ScriptedUnit::new("db", &[], &log)).unwrap();
    assert!(kernel.supervisor().stop("db").await);
    assert!(kernel.supervisor().start("db").await);
    assert!(kernel.supervisor().start("db").await);
    assert_eq!(*log.lock(), vec!["start:db"]);
    assert!(!kernel.supervisor().start("ghost").await);
}

#[tokio::test]
async fn restart_fails_fast_when_stop_fails() {
    let (kernel, audit) = kernel_with_audit(fast_config());
    let log = new_log();
    let unit = ScriptedUnit::new("db", &[], &log);
    kernel.register(unit.clone()).unwrap();
    assert!(kernel.supervisor().start("db").await);
    assert!(kernel.supervisor().restart("db").await);
    assert_eq!(*log.lock(), vec!["start:db", "stop:db", "start:db"]);

    unit.fail_stop.store(true, Ordering::SeqCst);
    assert!(!kernel.supervisor().restart("db").await);
    assert_eq!(log.lock().last().unwrap(), "stop:db");
    assert_eq!(kernel.registry().state("db").unwrap(), LifecycleState::Failed);
    let restarts = audit.entries_for("unit.restart");
    assert_eq!(restarts.len(), 2);
    assert_eq!(restarts[1].context.outcome, AuditOutcome::Failure);
}

#[tokio::test]
async fn denied_start_leaves_state_and_writes_one_audit_entry() {
    let audit = Arc::new(MemoryAuditSink::new());
    let mut security = SecurityConfig::default();
    security.actors.insert("viewer-1".into(), vec!["viewer".into()]);
    let collaborators = Collaborators {
        gate: Arc::new(RbacGate::from_config(&security).unwrap()),
        audit: audit.clone(),
        metrics: None,
    };
    let kernel = Kernel::new(fast_config(), collaborators).unwrap();
    let log = new_log();
    kernel.register(ScriptedUnit::new("db", &[], &log)).unwrap();

    let viewer = Actor::new("viewer-1");
    assert!(!kernel.supervisor().start_as("db", &viewer).await);
    assert_eq!(
        kernel.registry().state("db").unwrap(),
        LifecycleState::Registered
    );
    assert!(log.lock().is_empty());
    let entries = audit.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].action, "capability.denied");
    assert_eq!(entries[0].context.actor, "viewer-1");
    assert_eq!(entries[0].context.outcome, AuditOutcome::Denied);
    assert_eq!(entries[0].payload["capability"], "unit.start");

    // the configured system actor holds admin
    assert!(kernel.supervisor().start("db").await);
}

#[tokio::test]
async fn recover_with_exhausted_budget_returns_immediately() {
    let mut config = fast_config();
    config.lifecycle.max_restarts = 2;
    config.lifecycle.base_delay = Duration::from_secs(30);
    config.lifecycle.max_delay = Duration::from_secs(60);
    let (kernel, _audit) = kernel_with_audit(config);
    let log = new_log();
    let unit = ScriptedUnit::new("db", &[], &log);
    kernel.register(unit.clone()).unwrap();
    kernel.registry().increment_restart_count("db").unwrap();
    kernel.registry().increment_restart_count("db").unwrap();

    let started = Instant::now();
    assert!(!kernel.supervisor().recover("db").await);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(unit.recover_calls.load(Ordering::SeqCst), 0);
    let failed = kernel.bus().history_for(topics::UNIT_RECOVERY_FAILED);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].payload["reason"], "max restarts exceeded");
}

#[tokio::test]
async fn successful_recovery_restarts_failed_unit() {
    let (kernel, audit) = kernel_with_audit(fast_config());
    let log = new_log();
    let unit = ScriptedUnit::new("db", &[], &log);
    kernel.register(unit.clone()).unwrap();
    assert!(kernel.supervisor().start("db").await);
    assert!(kernel.supervisor().inject_failure("db", "drill").await);
    assert_eq!(kernel.registry().state("db").unwrap(), LifecycleState::Failed);

    assert!(kernel.supervisor().recover("db").await);
    assert_eq!(kernel.registry().state("db").unwrap(), LifecycleState::Running);
    assert_eq!(kernel.registry().restart_count("db").unwrap(), 0);
    assert_eq!(*log.lock(), vec!["start:db", "recover:db", "start:db"]);
    assert_eq!(kernel.bus().history_for(topics::UNIT_RECOVERED).len(), 1);
    assert_eq!(audit.entries_for("unit.fault_injected").len(), 1);
}

#[tokio::test]
async fn declined_recovery_keeps_counter_and_reports_failure() {
    let (kernel, _audit) = kernel_with_audit(fast_config());
    let log = new_log();
    let unit = ScriptedUnit::new("db", &[], &log);
    *unit.recover_result.lock() = Ok(false);
    kernel.register(unit.clone()).unwrap();
    kernel.supervisor().inject_failure("db", "drill").await;

    assert!(!kernel.supervisor().recover("db").await);
    assert_eq!(kernel.registry().restart_count("db").unwrap(), 1);
    assert_eq!(kernel.registry().state("db").unwrap(), LifecycleState::Failed);

    *unit.recover_result.lock() = Err("replica unreachable".into());
    assert!(!kernel.supervisor().recover("db").await);
    assert_eq!(kernel.registry().restart_count("db").unwrap(), 2);
    let failed = kernel.bus().history_for(topics::UNIT_RECOVERY_FAILED);
    assert_eq!(failed.len(), 2);
    assert!(failed[1].payload["reason"]
        .as_str()
        .unwrap()
        .contains("replica unreachable"));
}

#[tokio::test]
async fn recovered_unit_that_cannot_start_exhausts_budget() {
    let mut config = fast_config();
    config.lifecycle.max_restarts = 2;
    let (kernel, _audit) = kernel_with_audit(config);
    let log = new_log();
    let unit = ScriptedUnit::new("db", &[], &log);
    unit.fail_start.store(true, Ordering::SeqCst);
    kernel.register(unit.clone()).unwrap();
    kernel.supervisor().inject_failure("db", "drill").await;

    assert!(!kernel.supervisor().recover("db").await);
    assert_eq!(kernel.registry().restart_count("db").unwrap(), 1);
    assert_eq!(kernel.registry().state("db").unwrap(), LifecycleState::Failed);
    assert!(!kernel.supervisor().recover("db").await);
    assert_eq!(kernel.registry().restart_count("db").unwrap(), 2);

    assert!(!kernel.supervisor().recover("db").await);
    assert_eq!(unit.recover_calls.load(Ordering::SeqCst), 2);
    let failed = kernel.bus().history_for(topics::UNIT_RECOVERY_FAILED);
    assert_eq!(failed.len(), 3);
    assert_eq!(failed[0].payload["reason"], "start after recovery failed");
    assert_eq!(failed[2].payload["reason"], "max restarts exceeded");
}

#[tokio::test]
async fn backoff_follows_strategy() {
    let mut config = KernelConfig::default();
    config.lifecycle.base_delay = Duration::from_millis(100);
    config.lifecycle.max_delay = Duration::from_millis(500);
    let (kernel, _audit) = kernel_with_audit(config.clone());
    let supervisor = kernel.supervisor();
    assert_eq!(supervisor.backoff_delay(0), Duration::from_millis(100));
    assert_eq!(supervisor.backoff_delay(2), Duration::from_millis(400));
    assert_eq!(supervisor.backoff_delay(3), Duration::from_millis(500));

    config.lifecycle.recovery_strategy = RecoveryStrategy::Linear;
    let (kernel, _audit) = kernel_with_audit(config);
    assert_eq!(
        kernel.supervisor().backoff_delay(5),
        Duration::from_millis(100)
    );
}

#[tokio::test]
async fn shutdown_cancels_backoff_and_stops_units() {
    let mut config = fast_config();
    config.lifecycle.base_delay = Duration::from_secs(60);
    config.lifecycle.max_delay = Duration::from_secs(60);
    let (kernel, _audit) = kernel_with_audit(config);
    let kernel = Arc::new(kernel);
    let log = new_log();
    let db = ScriptedUnit::new("db", &[], &log);
    let api = ScriptedUnit::new("api", &["db"], &log);
    kernel.register(db.clone()).unwrap();
    kernel.register(api.clone()).unwrap();
    kernel.supervisor().start_all().await.unwrap();
    kernel.supervisor().inject_failure("api", "drill").await;

    let recovering = {
        let kernel = kernel.clone();
        tokio::spawn(async move { kernel.supervisor().recover("api").await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let started = Instant::now();
    let report = kernel.shutdown().await;
    assert!(!recovering.await.unwrap());
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(report.order, vec!["api", "db"]);
    assert_eq!(report.succeeded, vec!["db"]);
    assert_eq!(report.failed, vec!["api"]);
    assert_eq!(db.shutdown_calls.load(Ordering::SeqCst), 1);
    assert_eq!(api.shutdown_calls.load(Ordering::SeqCst), 1);
    assert_eq!(kernel.bus().history_for(topics::KERNEL_SHUTDOWN).len(), 1);
}
