//! Integration tests for the worker fleet
//!
//! Provisioning, readiness, teardown, and the controller node, driven
//! pass by pass against the simulated cloud and node registry.

use migrate::error::ExternalError;
use migrate::settings::{KEY_VM_ACTIVE_WAIT_RETRY_LIMIT, SETTINGS_NAME};
use migrate::sim::{ManualClock, Simulation};
use migrate::{
    Action, Engine, EngineConfig, MemoryConfigStore, MigrationPhase, MigrationSpec, NodeRole,
    TargetPlacement, WorkerNodeSpec, WorkerPhase, WORKER_FINALIZER,
};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    engine: Engine,
    sim: Simulation,
    settings: Arc<MemoryConfigStore>,
}

fn harness() -> Harness {
    let mut config = EngineConfig::default();
    config.fleet.auto_scale = false;
    config.fleet.flavor_id = "worker.medium".to_string();
    config.fleet.image_id = "migrate-worker-v3".to_string();
    config.fleet.credentials_ref = "openstack-creds".to_string();

    let sim = Simulation::new();
    let settings = Arc::new(MemoryConfigStore::new());
    let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
    let engine = Engine::with_parts(config, sim.collaborators(), settings.clone(), clock)
        .expect("Failed to build engine");
    Harness {
        engine,
        sim,
        settings,
    }
}

fn phase(h: &Harness, name: &str) -> WorkerPhase {
    h.engine.worker(name).expect("Worker missing").phase()
}

async fn pass(h: &Harness, name: &str) -> Action {
    h.engine.reconcile_worker(name).await.expect("Worker pass failed")
}

async fn ready_worker(h: &Harness, name: &str) {
    h.engine.add_worker(name, WorkerNodeSpec::default()).unwrap();
    pass(h, name).await;
    pass(h, name).await;
    assert_eq!(phase(h, name), WorkerPhase::Ready);
}

#[tokio::test]
async fn test_vm_created_once_cloud_reports_it() {
    let h = harness();
    h.sim.cloud.set_lookup_delay(3);
    h.engine.add_worker("w1", WorkerNodeSpec::default()).unwrap();

    for poll in 1..=3 {
        let action = pass(&h, "w1").await;
        assert_eq!(action, Action::Requeue(Duration::from_secs(20)));
        assert_eq!(phase(&h, "w1"), WorkerPhase::Provisioning, "poll {}", poll);
    }

    pass(&h, "w1").await;
    let node = h.engine.worker("w1").unwrap();
    assert_eq!(node.phase(), WorkerPhase::VMCreated);
    assert!(node.status.vm_id.is_some());
    assert!(node.status.vm_ip.is_some());
    assert_eq!(node.status.readiness_polls, 0);
    assert!(node.metadata.has_finalizer(WORKER_FINALIZER));

    // Only one create was issued, with the fleet defaults filled in
    let requests = h.sim.cloud.create_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].name, "w1");
    assert_eq!(requests[0].flavor_id, "worker.medium");
    assert_eq!(requests[0].image_id, "migrate-worker-v3");

    pass(&h, "w1").await;
    assert_eq!(phase(&h, "w1"), WorkerPhase::Ready);
}

#[tokio::test]
async fn test_readiness_limit_reports_but_keeps_polling() {
    let h = harness();
    h.settings.set(SETTINGS_NAME, KEY_VM_ACTIVE_WAIT_RETRY_LIMIT, "2");
    h.sim.cloud.set_lookup_delay(5);
    h.engine.add_worker("w1", WorkerNodeSpec::default()).unwrap();

    for _ in 0..3 {
        pass(&h, "w1").await;
    }
    let node = h.engine.worker("w1").unwrap();
    assert_eq!(node.phase(), WorkerPhase::Provisioning);
    assert_eq!(node.status.readiness_polls, 3);
    assert_eq!(
        node.status.message.as_deref(),
        Some("VM did not become active within 2 polls")
    );

    for _ in 0..3 {
        pass(&h, "w1").await;
    }
    assert_eq!(phase(&h, "w1"), WorkerPhase::VMCreated);
}

#[tokio::test]
async fn test_spec_overrides_fleet_template() {
    let h = harness();
    let spec = WorkerNodeSpec {
        flavor_id: "worker.xlarge".to_string(),
        ..Default::default()
    };
    h.engine.add_worker("w1", spec).unwrap();
    pass(&h, "w1").await;

    let requests = h.sim.cloud.create_requests();
    assert_eq!(requests[0].flavor_id, "worker.xlarge");
    assert_eq!(requests[0].credentials_ref, "openstack-creds");
}

#[tokio::test]
async fn test_delete_holds_until_vm_and_node_are_gone() {
    let h = harness();
    h.sim.cloud.set_delete_linger(1);
    ready_worker(&h, "w1").await;

    assert!(!h.engine.delete_worker("w1").unwrap());

    pass(&h, "w1").await;
    assert_eq!(phase(&h, "w1"), WorkerPhase::Deleting);
    assert!(h.sim.cloud.has_vm("w1"));
    assert!(!h.sim.registry.contains("w1"));

    pass(&h, "w1").await;
    assert_eq!(phase(&h, "w1"), WorkerPhase::Deleting);
    assert!(!h.sim.cloud.has_vm("w1"));

    // Both report absent: hold released, record gone
    let action = pass(&h, "w1").await;
    assert_eq!(action, Action::AwaitChange);
    assert!(h.engine.worker("w1").is_none());
}

#[tokio::test]
async fn test_migration_on_deleted_worker_fails() {
    let h = harness();
    h.sim.source.add_vm("vm-1", &[("disk-0", 1024)]);
    h.sim.copy.set_full_copy_polls(10);
    ready_worker(&h, "w1").await;

    let spec = MigrationSpec {
        source_vm: "vm-1".to_string(),
        placement: TargetPlacement {
            flavor_id: "m1.small".to_string(),
            ..Default::default()
        },
        ..Default::default()
    };
    h.engine.submit_migration("m1", spec).unwrap();
    for _ in 0..4 {
        h.engine.reconcile_migration("m1").await.unwrap();
    }
    assert_eq!(h.engine.migration("m1").unwrap().phase(), MigrationPhase::Copying);

    h.engine.delete_worker("w1").unwrap();
    h.engine.reconcile_migration("m1").await.unwrap();

    let m = h.engine.migration("m1").unwrap();
    assert_eq!(m.phase(), MigrationPhase::Failed);
    assert!(m.status.failure_reason.unwrap().contains("Worker lost"));
}

#[tokio::test]
async fn test_vanished_vm_removes_worker() {
    let h = harness();
    ready_worker(&h, "w1").await;

    h.sim.cloud.remove_vm("w1");
    let action = pass(&h, "w1").await;
    assert_eq!(action, Action::AwaitChange);
    assert!(h.engine.worker("w1").unwrap().metadata.is_deleting());

    // Node still registered on the first teardown pass
    pass(&h, "w1").await;
    assert!(h.engine.worker("w1").is_some());
    pass(&h, "w1").await;
    assert!(h.engine.worker("w1").is_none());
}

#[tokio::test]
async fn test_unready_node_drops_back_to_vm_created() {
    let h = harness();
    ready_worker(&h, "w1").await;

    h.sim.registry.set_ready("w1", false);
    pass(&h, "w1").await;
    assert_eq!(phase(&h, "w1"), WorkerPhase::VMCreated);

    h.sim.registry.set_ready("w1", true);
    pass(&h, "w1").await;
    assert_eq!(phase(&h, "w1"), WorkerPhase::Ready);
}

#[tokio::test]
async fn test_controller_node_refreshes_image() {
    let h = harness();
    let spec = WorkerNodeSpec {
        role: NodeRole::Controller,
        ..Default::default()
    };
    h.engine.add_worker("controller", spec).unwrap();

    let action = pass(&h, "controller").await;
    assert_eq!(action, Action::Requeue(Duration::from_secs(60)));
    assert_eq!(phase(&h, "controller"), WorkerPhase::Ready);
    assert_eq!(h.sim.cloud.controller_refreshes(), 1);
    assert!(h.sim.cloud.create_requests().is_empty());

    h.sim.cloud.fail_next_refresh(ExternalError::transient("image service busy"));
    let action = pass(&h, "controller").await;
    assert_eq!(action, Action::Requeue(Duration::from_secs(30)));
    assert!(h
        .engine
        .worker("controller")
        .unwrap()
        .status
        .message
        .unwrap()
        .contains("image service busy"));

    // Never torn down, only released
    h.engine.delete_worker("controller").unwrap();
    pass(&h, "controller").await;
    assert!(h.engine.worker("controller").is_none());
}

#[tokio::test]
async fn test_controller_node_never_takes_migrations() {
    let h = harness();
    h.sim.source.add_vm("vm-1", &[("disk-0", 1024)]);
    let spec = WorkerNodeSpec {
        role: NodeRole::Controller,
        ..Default::default()
    };
    h.engine.add_worker("controller", spec).unwrap();
    pass(&h, "controller").await;

    let spec = MigrationSpec {
        source_vm: "vm-1".to_string(),
        placement: TargetPlacement {
            flavor_id: "m1.small".to_string(),
            ..Default::default()
        },
        ..Default::default()
    };
    h.engine.submit_migration("m1", spec).unwrap();
    for _ in 0..4 {
        h.engine.reconcile_migration("m1").await.unwrap();
    }
    let m = h.engine.migration("m1").unwrap();
    assert_eq!(m.phase(), MigrationPhase::AwaitingDataCopyStart);
    assert_eq!(m.status.assigned_worker, None);
}
