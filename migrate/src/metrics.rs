//! Engine observability metrics
//!
//! Emits through the `metrics` facade; whichever recorder the host installs
//! receives them. Covers:
//! - Reconcile passes and their failures
//! - Migration phase transitions, convergence, and cutover attempts
//! - Worker fleet transitions, capacity, and scaling
//! - External calls that ran past their deadline

use crate::error::MigrateError;
use crate::fleet::{WorkerNode, WorkerPhase};
use crate::migration::{Migration, MigrationPhase};
use std::time::Duration;

/// Record one reconcile pass
pub fn record_reconcile(controller: &str, duration: Duration, error: Option<&MigrateError>) {
    metrics::histogram!(
        "stellaris_migrate_reconcile_duration_seconds",
        "controller" => controller.to_string(),
    )
    .record(duration.as_secs_f64());

    let status = if error.is_some() { "error" } else { "ok" };
    metrics::counter!(
        "stellaris_migrate_reconcile_total",
        "controller" => controller.to_string(),
        "status" => status,
    )
    .increment(1);

    if let Some(e) = error {
        metrics::counter!(
            "stellaris_migrate_reconcile_errors_total",
            "controller" => controller.to_string(),
            "error_type" => e.error_type(),
        )
        .increment(1);
    }
}

/// Record an external call that did not answer in time
pub fn record_external_timeout(operation: &str) {
    metrics::counter!(
        "stellaris_migrate_external_timeouts_total",
        "operation" => operation.to_string(),
    )
    .increment(1);
}

/// Record a migration phase change
pub fn record_phase_transition(from: &str, to: &str) {
    metrics::counter!(
        "stellaris_migrate_phase_transitions_total",
        "from" => from.to_string(),
        "to" => to.to_string(),
    )
    .increment(1);
}

/// Record a finished changed-block pass
pub fn record_convergence_pass(remaining_bytes: u64) {
    metrics::counter!("stellaris_migrate_convergence_passes_total").increment(1);
    metrics::histogram!("stellaris_migrate_convergence_remaining_bytes").record(remaining_bytes as f64);
}

pub fn record_cutover_attempt() {
    metrics::counter!("stellaris_migrate_cutover_attempts_total").increment(1);
}

/// Record a record found in a state the engine cannot interpret
pub fn record_integrity_alert() {
    metrics::counter!("stellaris_migrate_integrity_alerts_total").increment(1);
}

/// Record fleet events (assigned, released, scale_up, vm_requested)
pub fn record_worker_event(event: &str) {
    metrics::counter!(
        "stellaris_migrate_worker_events_total",
        "event" => event.to_string(),
    )
    .increment(1);
}

/// Record a worker phase change
pub fn record_worker_transition(from: &str, to: &str) {
    metrics::counter!(
        "stellaris_migrate_worker_transitions_total",
        "from" => from.to_string(),
        "to" => to.to_string(),
    )
    .increment(1);
}

/// Update fleet gauges from the current worker records
pub fn update_fleet_metrics(workers: &[WorkerNode], default_capacity: u32) {
    let fleet: Vec<&WorkerNode> = workers.iter().filter(|w| !w.is_controller()).collect();

    for phase in [
        WorkerPhase::Provisioning,
        WorkerPhase::VMCreated,
        WorkerPhase::Ready,
        WorkerPhase::Deleting,
    ] {
        let count = fleet.iter().filter(|w| w.phase() == phase).count();
        metrics::gauge!(
            "stellaris_migrate_workers",
            "phase" => phase.as_str(),
        )
        .set(count as f64);
    }

    let slots: u32 = fleet
        .iter()
        .filter(|w| w.is_schedulable())
        .map(|w| w.capacity(default_capacity))
        .sum();
    let used: usize = fleet.iter().map(|w| w.active_count()).sum();
    metrics::gauge!("stellaris_migrate_worker_slots_total").set(slots as f64);
    metrics::gauge!("stellaris_migrate_worker_slots_used").set(used as f64);
}

/// Update per-phase migration gauges
pub fn update_migration_metrics(migrations: &[Migration]) {
    for phase in MigrationPhase::all_phases() {
        let count = migrations.iter().filter(|m| m.phase() == *phase).count();
        metrics::gauge!(
            "stellaris_migrate_migrations",
            "phase" => phase.as_str(),
        )
        .set(count as f64);
    }
}
