//! ---
//! keel_section: "15-testing-qa-runbook"
//! keel_subsection: "integration-tests"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Kernel boot, authorization, audit and metrics end to end."
//! keel_version: "v0.1.0"
//! keel_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use keel_common::{ConfigView, KernelConfig};
use keel_core::{Collaborators, HealthReport, Kernel, KernelError, LifecycleState, ManagedUnit};
use keel_events::topics;
use keel_metrics::{new_registry, render_text};
use keel_security::{Actor, AuditLog, AuditOutcome};
use semver::Version;
use tempfile::tempdir;

struct Service {
    name: String,
    deps: Vec<String>,
    order: Arc<Mutex<Vec<String>>>,
    port: AtomicUsize,
}

impl Service {
    fn new(name: &str, deps: &[&str], order: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            deps: deps.iter().map(|d| d.to_string()).collect(),
            order: order.clone(),
            port: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ManagedUnit for Service {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> Version {
        Version::new(2, 1, 0)
    }

    fn dependencies(&self) -> Vec<String> {
        self.deps.clone()
    }

    async fn configure(&self, settings: &ConfigView) -> Result<()> {
        self.port
            .store(settings.get_or("port", 0usize), Ordering::SeqCst);
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.order.lock().unwrap().push(format!("start:{}", self.name));
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.order.lock().unwrap().push(format!("stop:{}", self.name));
        Ok(())
    }

    async fn health(&self) -> Result<HealthReport> {
        Ok(HealthReport::healthy())
    }
}

fn config_with_audit(audit_path: &std::path::Path) -> KernelConfig {
    format!(
        r#"
        [audit]
        enabled = true
        path = "{}"

        [security]
        enforce = true

        [security.actors]
        system = ["admin"]
        bob = ["viewer"]

        [units.api]
        port = 8080
        password = "hunter2"
        "#,
        audit_path.display()
    )
    .parse()
    .unwrap()
}

#[tokio::test]
async fn boot_authorize_audit_and_export() {
    let dir = tempdir().unwrap();
    let audit_path = dir.path().join("audit").join("keel.ndjson");
    let config = config_with_audit(&audit_path);
    let registry = new_registry();
    let collaborators = Collaborators::from_config(&config, Some(registry.clone())).unwrap();
    let kernel = Kernel::new(config, collaborators).unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let db = Service::new("db", &[], &order);
    let api = Service::new("api", &["db"], &order);
    kernel.register(api.clone()).unwrap();
    kernel.register(db.clone()).unwrap();

    let report = kernel.boot().await.unwrap();
    assert!(report.is_success(), "{report:?}");
    assert_eq!(report.order, vec!["db", "api"]);
    assert_eq!(api.port.load(Ordering::SeqCst), 8080);

    // a viewer may read health but not drive the lifecycle
    let bob = Actor::new("bob");
    assert!(!kernel.supervisor().stop_as("api", &bob).await);
    assert_eq!(
        kernel.registry().state("api").unwrap(),
        LifecycleState::Running
    );

    let summary = kernel.health().check_all().await;
    assert_eq!(summary.units.len(), 2);

    let shutdown = kernel.shutdown().await;
    assert!(shutdown.is_success());
    assert_eq!(
        *order.lock().unwrap(),
        vec!["start:db", "start:api", "stop:api", "stop:db"]
    );

    let log = AuditLog::open(&audit_path).unwrap();
    assert!(log.verify().unwrap());
    let entries = log.entries().unwrap();
    let denied: Vec<_> = entries
        .iter()
        .filter(|e| e.action == "capability.denied")
        .collect();
    assert_eq!(denied.len(), 1);
    assert_eq!(denied[0].actor, "bob");
    assert_eq!(denied[0].outcome, AuditOutcome::Denied);
    let raw = std::fs::read_to_string(&audit_path).unwrap();
    assert!(!raw.contains("hunter2"));
    assert!(raw.contains("unit.configure"));

    let text = render_text(&registry).unwrap();
    assert!(text.contains("keel_unit_state_transitions_total"));
    assert!(text.contains("keel_capability_checks_total"));
    assert!(text.contains("outcome=\"denied\""));
}

#[tokio::test]
async fn cycles_abort_boot_without_starting_anything() {
    let kernel = Kernel::new(KernelConfig::default(), Collaborators::permissive()).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));
    kernel.register(Service::new("a", &["b"], &order)).unwrap();
    kernel.register(Service::new("b", &["a"], &order)).unwrap();
    kernel.register(Service::new("c", &[], &order)).unwrap();

    match kernel.boot().await {
        Err(KernelError::CircularDependency(units)) => assert_eq!(units, vec!["a", "b"]),
        other => panic!("expected a cycle, got {other:?}"),
    }
    assert!(order.lock().unwrap().is_empty());
    assert!(kernel.bus().history_for(topics::UNIT_STARTED).is_empty());
}

#[tokio::test]
async fn reset_clears_units_for_reuse() {
    let kernel = Kernel::new(KernelConfig::default(), Collaborators::permissive()).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));
    kernel.register(Service::new("db", &[], &order)).unwrap();
    assert!(matches!(
        kernel.register(Service::new("db", &[], &order)),
        Err(KernelError::DuplicateUnit(_))
    ));
    kernel.reset();
    assert!(kernel.registry().is_empty());
    kernel.register(Service::new("db", &[], &order)).unwrap();
}
