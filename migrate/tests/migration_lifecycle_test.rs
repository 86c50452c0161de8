//! Integration tests for the migration lifecycle
//!
//! Drives migrations pass by pass against the simulated collaborators:
//! submit -> validate -> copy -> converge -> convert -> cut over

use chrono::{DateTime, TimeZone, Utc};
use migrate::error::ExternalError;
use migrate::settings::{
    KEY_CLEANUP_AFTER_CONVERT_FAILURE, KEY_ITERATION_THRESHOLD, SETTINGS_NAME,
};
use migrate::sim::{ManualClock, Simulation};
use migrate::{
    Action, ConditionType, CutoverMode, CutoverSignal, Engine, EngineConfig, MemoryConfigStore,
    Migration, MigrationMethod, MigrationPhase, MigrationSpec, PowerState, TargetPlacement,
    WorkerNodeSpec, WorkerPhase, MIGRATION_FINALIZER,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const MIB: u64 = 1024 * 1024;

struct Harness {
    engine: Engine,
    sim: Simulation,
    settings: Arc<MemoryConfigStore>,
    clock: Arc<ManualClock>,
}

fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap()
}

fn harness_with(config: EngineConfig) -> Harness {
    let sim = Simulation::new();
    let settings = Arc::new(MemoryConfigStore::new());
    let clock = Arc::new(ManualClock::new(start_time()));
    let engine = Engine::with_parts(config, sim.collaborators(), settings.clone(), clock.clone())
        .expect("Failed to build engine");
    Harness {
        engine,
        sim,
        settings,
        clock,
    }
}

/// Fleet without automatic scale-up, so tests control every worker
fn harness() -> Harness {
    let mut config = EngineConfig::default();
    config.fleet.auto_scale = false;
    harness_with(config)
}

fn spec(vm: &str) -> MigrationSpec {
    MigrationSpec {
        source_vm: vm.to_string(),
        source_credentials: "vcenter-creds".to_string(),
        placement: TargetPlacement {
            flavor_id: "m1.large".to_string(),
            network_ids: vec!["net-1".to_string()],
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn ready_worker(h: &Harness, name: &str) {
    h.engine
        .add_worker(name, WorkerNodeSpec::default())
        .expect("Failed to add worker");
    for _ in 0..2 {
        h.engine.reconcile_worker(name).await.expect("Worker pass failed");
    }
    assert_eq!(h.engine.worker(name).unwrap().phase(), WorkerPhase::Ready);
}

/// Run passes until the migration reaches `phase`
async fn drive_until(h: &Harness, name: &str, phase: MigrationPhase) -> Migration {
    for _ in 0..20 {
        let m = h.engine.migration(name).expect("Migration missing");
        if m.phase() == phase {
            return m;
        }
        h.engine
            .reconcile_migration(name)
            .await
            .expect("Migration pass failed");
    }
    let m = h.engine.migration(name).expect("Migration missing");
    assert_eq!(m.phase(), phase, "migration {} stuck: {:?}", name, m.status);
    m
}

#[tokio::test]
async fn test_happy_path_with_admin_cutover() {
    let h = harness();
    h.sim.source.add_vm("vm-1", &[("disk-0", 40 * 1024 * MIB), ("disk-1", 10 * 1024 * MIB)]);
    ready_worker(&h, "w1").await;
    let mut events = h.engine.subscribe();

    h.engine.submit_migration("m1", spec("vm-1")).unwrap();

    let m = drive_until(&h, "m1", MigrationPhase::AwaitingAdminCutOver).await;
    assert_eq!(m.status.source_disks, vec!["disk-0".to_string(), "disk-1".to_string()]);
    assert_eq!(m.status.assigned_worker.as_deref(), Some("w1"));
    assert_eq!(m.status.convergence.iterations, 1);
    assert!(m.status.condition(ConditionType::Validated).unwrap().status);

    // Parked until the admin says yes
    let action = h.engine.reconcile_migration("m1").await.unwrap();
    assert_eq!(action, Action::AwaitChange);
    h.engine.trigger_cutover("m1", CutoverSignal::No).unwrap();
    h.engine.reconcile_migration("m1").await.unwrap();
    assert_eq!(h.engine.migration("m1").unwrap().phase(), MigrationPhase::AwaitingAdminCutOver);

    h.engine.trigger_cutover("m1", CutoverSignal::Yes).unwrap();
    let m = drive_until(&h, "m1", MigrationPhase::Succeeded).await;
    assert_eq!(m.status.cutover_attempts, 1);
    assert_eq!(m.status.assigned_worker, None);
    assert_eq!(h.sim.cloud.activated(), vec!["vm-1".to_string()]);
    assert_eq!(h.sim.source.power_state("vm-1"), Some(PowerState::Off));
    assert_eq!(h.engine.worker("w1").unwrap().active_count(), 0);

    let mut phases = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.migration, "m1");
        phases.push(event.to);
    }
    assert_eq!(
        phases,
        vec![
            MigrationPhase::Validating,
            MigrationPhase::AwaitingDataCopyStart,
            MigrationPhase::Copying,
            MigrationPhase::CopyingChangedBlocks,
            MigrationPhase::ConvertingDisk,
            MigrationPhase::AwaitingAdminCutOver,
            MigrationPhase::Succeeded,
        ]
    );

    // Terminal: further passes change nothing
    assert_eq!(h.engine.reconcile_migration("m1").await.unwrap(), Action::AwaitChange);
}

#[tokio::test]
async fn test_scheduled_cutover_waits_for_start_time() {
    let h = harness();
    h.sim.source.add_vm("vm-1", &[("disk-0", 8 * 1024 * MIB)]);
    ready_worker(&h, "w1").await;

    let mut s = spec("vm-1");
    s.cutover_mode = CutoverMode::ScheduledTime;
    s.scheduled_cutover = Some(start_time() + chrono::Duration::hours(1));
    h.engine.submit_migration("m1", s).unwrap();

    drive_until(&h, "m1", MigrationPhase::AwaitingCutOverStartTime).await;

    // Long waits are sliced to the maximum poll interval
    let action = h.engine.reconcile_migration("m1").await.unwrap();
    assert_eq!(action, Action::Requeue(Duration::from_secs(300)));

    h.clock.advance(chrono::Duration::minutes(59));
    let action = h.engine.reconcile_migration("m1").await.unwrap();
    assert_eq!(action, Action::Requeue(Duration::from_secs(60)));
    assert_eq!(
        h.engine.migration("m1").unwrap().phase(),
        MigrationPhase::AwaitingCutOverStartTime
    );
    assert!(h.sim.cloud.activated().is_empty());

    h.clock.advance(chrono::Duration::minutes(1));
    let m = drive_until(&h, "m1", MigrationPhase::Succeeded).await;
    assert_eq!(m.status.cutover_attempts, 1);
    assert_eq!(h.sim.source.final_syncs(), 1);
}

#[tokio::test]
async fn test_admin_yes_releases_scheduled_cutover_early() {
    let h = harness();
    h.sim.source.add_vm("vm-1", &[("disk-0", MIB)]);
    ready_worker(&h, "w1").await;

    let mut s = spec("vm-1");
    s.cutover_mode = CutoverMode::ScheduledTime;
    s.scheduled_cutover = Some(start_time() + chrono::Duration::days(7));
    h.engine.submit_migration("m1", s).unwrap();
    drive_until(&h, "m1", MigrationPhase::AwaitingCutOverStartTime).await;

    h.engine.trigger_cutover("m1", CutoverSignal::Yes).unwrap();
    drive_until(&h, "m1", MigrationPhase::Succeeded).await;
}

#[tokio::test]
async fn test_retry_after_failure() {
    let h = harness();
    ready_worker(&h, "w1").await;
    h.engine.submit_migration("m1", spec("vm-1")).unwrap();

    // Source VM does not exist yet
    let m = drive_until(&h, "m1", MigrationPhase::Failed).await;
    assert!(m.status.failure_reason.as_deref().unwrap().contains("not found"));
    assert!(m.status.condition(ConditionType::Failed).unwrap().status);
    assert!(!m.status.condition(ConditionType::Validated).unwrap().status);

    // Stays failed without a retry
    assert_eq!(h.engine.reconcile_migration("m1").await.unwrap(), Action::AwaitChange);
    assert_eq!(h.engine.migration("m1").unwrap().phase(), MigrationPhase::Failed);

    h.sim.source.add_vm("vm-1", &[("disk-0", MIB)]);
    h.engine.retry_migration("m1").unwrap();
    h.engine.reconcile_migration("m1").await.unwrap();

    let m = h.engine.migration("m1").unwrap();
    assert_eq!(m.phase(), MigrationPhase::Pending);
    assert_eq!(m.status.failure_reason, None);
    assert_eq!(m.status.observed_retry_generation, 1);
    assert!(m.status.conditions.is_empty());

    drive_until(&h, "m1", MigrationPhase::AwaitingAdminCutOver).await;
}

#[tokio::test]
async fn test_invalid_spec_fails_validation() {
    let h = harness();
    let mut s = spec("vm-1");
    s.cutover_mode = CutoverMode::ScheduledTime;
    h.engine.submit_migration("m1", s).unwrap();

    h.engine.reconcile_migration("m1").await.unwrap();
    let m = h.engine.migration("m1").unwrap();
    assert_eq!(m.phase(), MigrationPhase::Failed);
    assert!(m.status.message.unwrap().contains("scheduled"));
}

#[tokio::test]
async fn test_transient_copy_errors_retry_then_recover() {
    let h = harness();
    h.sim.source.add_vm("vm-1", &[("disk-0", MIB)]);
    ready_worker(&h, "w1").await;
    h.engine.submit_migration("m1", spec("vm-1")).unwrap();
    drive_until(&h, "m1", MigrationPhase::Copying).await;

    h.sim.copy.fail_next(ExternalError::transient("nbd connection reset"));
    h.sim.copy.fail_next(ExternalError::transient("nbd connection reset"));

    let action = h.engine.reconcile_migration("m1").await.unwrap();
    assert_eq!(action, Action::Requeue(Duration::from_secs(5)));
    let action = h.engine.reconcile_migration("m1").await.unwrap();
    assert_eq!(action, Action::Requeue(Duration::from_secs(10)));

    let m = h.engine.migration("m1").unwrap();
    assert_eq!(m.phase(), MigrationPhase::Copying);
    assert_eq!(m.status.transient_failures, 2);

    h.engine.reconcile_migration("m1").await.unwrap();
    let m = h.engine.migration("m1").unwrap();
    assert_eq!(m.phase(), MigrationPhase::CopyingChangedBlocks);
    assert_eq!(m.status.transient_failures, 0);
}

#[tokio::test]
async fn test_transient_copy_errors_exhaust_retries() {
    let h = harness();
    h.sim.source.add_vm("vm-1", &[("disk-0", MIB)]);
    ready_worker(&h, "w1").await;
    h.engine.submit_migration("m1", spec("vm-1")).unwrap();
    drive_until(&h, "m1", MigrationPhase::Copying).await;

    for _ in 0..6 {
        h.sim.copy.fail_next(ExternalError::transient("datastore busy"));
    }
    let m = drive_until(&h, "m1", MigrationPhase::Failed).await;
    assert!(m.status.failure_reason.unwrap().contains("datastore busy"));
    assert_eq!(h.engine.worker("w1").unwrap().active_count(), 0);
}

#[tokio::test]
async fn test_unrecoverable_copy_error_fails_and_releases_worker() {
    let h = harness();
    h.sim.source.add_vm("vm-1", &[("disk-0", MIB)]);
    ready_worker(&h, "w1").await;
    h.engine.submit_migration("m1", spec("vm-1")).unwrap();
    drive_until(&h, "m1", MigrationPhase::Copying).await;
    assert_eq!(h.engine.worker("w1").unwrap().active_count(), 1);

    h.sim.copy.fail_next(ExternalError::unrecoverable("disk checksum mismatch"));
    h.engine.reconcile_migration("m1").await.unwrap();

    let m = h.engine.migration("m1").unwrap();
    assert_eq!(m.phase(), MigrationPhase::Failed);
    assert_eq!(m.status.assigned_worker, None);
    assert_eq!(h.engine.worker("w1").unwrap().active_count(), 0);
}

#[tokio::test]
async fn test_convergence_runs_until_delta_is_small() {
    let h = harness();
    h.sim.source.add_vm("vm-1", &[("disk-0", MIB)]);
    h.sim.copy.script_remaining(&[900 * MIB, 300 * MIB, 10 * MIB]);
    ready_worker(&h, "w1").await;
    h.engine.submit_migration("m1", spec("vm-1")).unwrap();
    drive_until(&h, "m1", MigrationPhase::CopyingChangedBlocks).await;

    let action = h.engine.reconcile_migration("m1").await.unwrap();
    assert_eq!(action, Action::Requeue(Duration::from_secs(5)));
    let m = h.engine.migration("m1").unwrap();
    assert_eq!(m.status.convergence.iterations, 1);
    assert_eq!(m.status.convergence.last_remaining_bytes, Some(900 * MIB));

    let m = drive_until(&h, "m1", MigrationPhase::ConvertingDisk).await;
    assert_eq!(m.status.convergence.iterations, 3);
    assert_eq!(h.sim.copy.passes(), 3);
}

#[tokio::test]
async fn test_iteration_threshold_forces_convergence() {
    let h = harness();
    h.settings.set(SETTINGS_NAME, KEY_ITERATION_THRESHOLD, "2");
    h.sim.source.add_vm("vm-1", &[("disk-0", MIB)]);
    h.sim.copy.script_remaining(&[900 * MIB; 10]);
    ready_worker(&h, "w1").await;
    h.engine.submit_migration("m1", spec("vm-1")).unwrap();

    let m = drive_until(&h, "m1", MigrationPhase::ConvertingDisk).await;
    assert_eq!(m.status.convergence.iterations, 2);
    assert_eq!(m.status.convergence.threshold, 2);
    assert_eq!(h.sim.copy.passes(), 2);
}

#[tokio::test]
async fn test_cold_migration_powers_off_and_converges_in_one_pass() {
    let h = harness();
    h.sim.source.add_vm("vm-1", &[("disk-0", MIB)]);
    h.sim.copy.script_remaining(&[900 * MIB]);
    ready_worker(&h, "w1").await;

    let mut s = spec("vm-1");
    s.method = Some(MigrationMethod::Cold);
    h.engine.submit_migration("m1", s).unwrap();

    drive_until(&h, "m1", MigrationPhase::Copying).await;
    assert_eq!(h.sim.source.power_state("vm-1"), Some(PowerState::Off));

    let m = drive_until(&h, "m1", MigrationPhase::ConvertingDisk).await;
    assert_eq!(m.status.convergence.iterations, 1);
}

#[tokio::test]
async fn test_conversion_failure_cleans_up_volumes_when_enabled() {
    let h = harness();
    h.settings.set(SETTINGS_NAME, KEY_CLEANUP_AFTER_CONVERT_FAILURE, "true");
    h.sim.source.add_vm("vm-1", &[("disk-0", MIB)]);
    ready_worker(&h, "w1").await;
    h.engine.submit_migration("m1", spec("vm-1")).unwrap();
    drive_until(&h, "m1", MigrationPhase::ConvertingDisk).await;

    h.sim.converter.fail_next(ExternalError::unrecoverable("unsupported disk format"));
    h.engine.reconcile_migration("m1").await.unwrap();

    let m = h.engine.migration("m1").unwrap();
    assert_eq!(m.phase(), MigrationPhase::Failed);
    assert_eq!(h.sim.converter.cleanups(), vec!["m1".to_string()]);
}

#[tokio::test]
async fn test_conversion_failure_keeps_volumes_by_default() {
    let h = harness();
    h.sim.source.add_vm("vm-1", &[("disk-0", MIB)]);
    ready_worker(&h, "w1").await;
    h.engine.submit_migration("m1", spec("vm-1")).unwrap();
    drive_until(&h, "m1", MigrationPhase::ConvertingDisk).await;

    h.sim.converter.fail_next(ExternalError::unrecoverable("unsupported disk format"));
    h.engine.reconcile_migration("m1").await.unwrap();

    assert_eq!(h.engine.migration("m1").unwrap().phase(), MigrationPhase::Failed);
    assert!(h.sim.converter.cleanups().is_empty());
}

#[tokio::test]
async fn test_cutover_failures_retry_up_to_limit() {
    let h = harness();
    h.sim.source.add_vm("vm-1", &[("disk-0", MIB)]);
    ready_worker(&h, "w1").await;
    let mut s = spec("vm-1");
    s.start_cutover = Some(CutoverSignal::Yes);
    h.engine.submit_migration("m1", s).unwrap();
    drive_until(&h, "m1", MigrationPhase::AwaitingAdminCutOver).await;

    for _ in 0..3 {
        h.sim.cloud.fail_next_activate(ExternalError::transient("target API unavailable"));
    }
    h.engine.reconcile_migration("m1").await.unwrap();
    h.engine.reconcile_migration("m1").await.unwrap();
    let m = h.engine.migration("m1").unwrap();
    assert_eq!(m.phase(), MigrationPhase::AwaitingAdminCutOver);
    assert_eq!(m.status.cutover_attempts, 2);

    h.engine.reconcile_migration("m1").await.unwrap();
    let m = h.engine.migration("m1").unwrap();
    assert_eq!(m.phase(), MigrationPhase::Failed);
    assert_eq!(m.status.cutover_attempts, 3);
    assert!(m.status.failure_reason.unwrap().contains("after 3 attempts"));
}

#[tokio::test]
async fn test_capacity_is_bounded_per_worker() {
    let h = harness();
    h.sim.source.add_vm("vm-1", &[("disk-0", MIB)]);
    h.sim.source.add_vm("vm-2", &[("disk-0", MIB)]);
    ready_worker(&h, "w1").await;

    let mut first = spec("vm-1");
    first.start_cutover = Some(CutoverSignal::Yes);
    h.engine.submit_migration("m1", first).unwrap();
    h.engine.submit_migration("m2", spec("vm-2")).unwrap();

    drive_until(&h, "m1", MigrationPhase::Copying).await;
    drive_until(&h, "m2", MigrationPhase::AwaitingDataCopyStart).await;

    h.engine.reconcile_migration("m2").await.unwrap();
    let waiting = h.engine.migration("m2").unwrap();
    assert_eq!(waiting.phase(), MigrationPhase::AwaitingDataCopyStart);
    assert!(waiting.status.message.unwrap().contains("Waiting for a worker"));
    assert_eq!(h.engine.worker("w1").unwrap().status.active_migrations, vec!["m1".to_string()]);

    drive_until(&h, "m1", MigrationPhase::Succeeded).await;
    let m2 = drive_until(&h, "m2", MigrationPhase::Copying).await;
    assert_eq!(m2.status.assigned_worker.as_deref(), Some("w1"));
}

#[tokio::test]
async fn test_scale_up_when_no_worker_has_capacity() {
    let h = harness_with(EngineConfig::default());
    h.sim.source.add_vm("vm-1", &[("disk-0", MIB)]);
    h.engine.submit_migration("m1", spec("vm-1")).unwrap();
    drive_until(&h, "m1", MigrationPhase::AwaitingDataCopyStart).await;

    h.engine.reconcile_migration("m1").await.unwrap();
    let m = h.engine.migration("m1").unwrap();
    assert_eq!(m.phase(), MigrationPhase::AwaitingDataCopyStart);
    assert!(m.status.message.unwrap().contains("provisioning"));

    let workers = h.engine.list_workers();
    assert_eq!(workers.len(), 1);
    let name = workers[0].name().to_string();
    for _ in 0..2 {
        h.engine.reconcile_worker(&name).await.unwrap();
    }

    let m = drive_until(&h, "m1", MigrationPhase::Copying).await;
    assert_eq!(m.status.assigned_worker.as_deref(), Some(name.as_str()));
}

#[tokio::test]
async fn test_paused_migration_does_not_advance() {
    let h = harness();
    h.sim.source.add_vm("vm-1", &[("disk-0", MIB)]);
    h.engine.submit_migration("m1", spec("vm-1")).unwrap();
    h.engine.set_paused("m1", true).unwrap();

    let action = h.engine.reconcile_migration("m1").await.unwrap();
    assert_eq!(action, Action::Requeue(h.engine.config().requeue.phase_poll()));
    assert_eq!(h.engine.migration("m1").unwrap().phase(), MigrationPhase::Pending);

    h.engine.set_paused("m1", false).unwrap();
    h.engine.reconcile_migration("m1").await.unwrap();
    assert_eq!(h.engine.migration("m1").unwrap().phase(), MigrationPhase::Validating);
}

#[tokio::test]
async fn test_delete_mid_copy_releases_worker() {
    let h = harness();
    h.sim.source.add_vm("vm-1", &[("disk-0", MIB)]);
    ready_worker(&h, "w1").await;
    h.engine.submit_migration("m1", spec("vm-1")).unwrap();
    drive_until(&h, "m1", MigrationPhase::Copying).await;

    assert!(!h.engine.delete_migration("m1").unwrap());
    assert!(h.engine.migration("m1").unwrap().metadata.is_deleting());

    h.engine.reconcile_migration("m1").await.unwrap();
    assert!(h.engine.migration("m1").is_none());
    assert_eq!(h.engine.worker("w1").unwrap().active_count(), 0);
}

#[tokio::test]
async fn test_records_survive_restart() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let mut config = EngineConfig::default();
    config.fleet.auto_scale = false;
    config.state_dir = Some(temp.path().to_path_buf());

    {
        let h = harness_with(config.clone());
        h.sim.source.add_vm("vm-1", &[("disk-0", MIB)]);
        h.engine.submit_migration("m1", spec("vm-1")).unwrap();
        h.engine.reconcile_migration("m1").await.unwrap();
    }

    let h = harness_with(config);
    let m = h.engine.migration("m1").expect("Migration not restored");
    assert_eq!(m.phase(), MigrationPhase::Validating);
    assert!(m.metadata.has_finalizer(MIGRATION_FINALIZER));

    h.sim.source.add_vm("vm-1", &[("disk-0", MIB)]);
    h.engine.reconcile_migration("m1").await.unwrap();
    assert_eq!(
        h.engine.migration("m1").unwrap().phase(),
        MigrationPhase::AwaitingDataCopyStart
    );
}

#[tokio::test]
async fn test_unrecognized_stored_phase_is_parked() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let mut config = EngineConfig::default();
    config.state_dir = Some(temp.path().to_path_buf());

    {
        let h = harness_with(config.clone());
        h.engine.submit_migration("m1", spec("vm-1")).unwrap();
    }
    let path = config.migrations_state_path().unwrap();
    let snapshot = std::fs::read_to_string(&path).unwrap();
    assert!(snapshot.contains("\"phase\": \"Pending\""));
    std::fs::write(&path, snapshot.replace("\"phase\": \"Pending\"", "\"phase\": \"Teleporting\""))
        .unwrap();

    let h = harness_with(config);
    assert_eq!(h.engine.migration("m1").unwrap().phase(), MigrationPhase::Unknown);

    let action = h.engine.reconcile_migration("m1").await.unwrap();
    assert_eq!(action, Action::AwaitChange);
    let m = h.engine.migration("m1").unwrap();
    assert_eq!(m.phase(), MigrationPhase::Unknown);
    assert!(m.status.message.unwrap().contains("manual intervention"));
}

#[tokio::test(start_paused = true)]
async fn test_control_loops_drive_migration_to_success() {
    let h = harness();
    h.sim.source.add_vm("vm-1", &[("disk-0", MIB)]);
    h.engine.add_worker("w1", WorkerNodeSpec::default()).unwrap();
    let mut events = h.engine.subscribe();

    h.engine.start();
    let mut s = spec("vm-1");
    s.start_cutover = Some(CutoverSignal::Yes);
    h.engine.submit_migration("m1", s).unwrap();

    let finished = tokio::time::timeout(Duration::from_secs(3600), async {
        loop {
            match events.recv().await {
                Ok(event) if event.to.is_terminal() => return event.to,
                Ok(_) => {}
                Err(e) => panic!("event stream ended: {}", e),
            }
        }
    })
    .await
    .expect("Migration did not finish");

    assert_eq!(finished, MigrationPhase::Succeeded);
    h.engine.shutdown().await;

    let summary = h.engine.summary();
    assert_eq!(summary.migrations.get("Succeeded"), Some(&1));
    assert_eq!(summary.busy_workers, 0);
}
