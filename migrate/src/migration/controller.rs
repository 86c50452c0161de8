//! Migration reconciliation
//!
//! Each pass observes the collaborator relevant to the current phase, turns
//! what it saw into a [`PhaseEvent`], applies [`advance`], persists the new
//! status with a status patch, and then carries out the returned actions.

use super::cutover::{self, CutoverGate};
use super::machine::{advance, PhaseAction, PhaseEvent, PhasePolicy, Transition, TransitionContext};
use super::{CutoverMode, Migration, MigrationPhase, PhaseChangeEvent, MIGRATION_FINALIZER};
use crate::error::{ExternalError, MigrateError, Result};
use crate::external::{with_timeout, Collaborators, ConversionProgress, CopyProgress, CopyRequest};
use crate::fleet::{Assignment, FleetManager};
use crate::metrics;
use crate::reconcile::{exponential_backoff, Action, Reconciler};
use crate::settings::{MigrationMethod, Settings, SettingsProvider};
use crate::store::ObjectStore;
use crate::types::{Clock, Object, ObjectKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Reconciler for [`Migration`] records
pub struct MigrationController {
    migrations: Arc<ObjectStore<Migration>>,
    fleet: Arc<FleetManager>,
    collaborators: Collaborators,
    settings: SettingsProvider,
    policy: PhasePolicy,
    clock: Arc<dyn Clock>,
    call_timeout: Duration,
    events: broadcast::Sender<PhaseChangeEvent>,
}

impl MigrationController {
    pub fn new(
        migrations: Arc<ObjectStore<Migration>>,
        fleet: Arc<FleetManager>,
        collaborators: Collaborators,
        settings: SettingsProvider,
        policy: PhasePolicy,
        clock: Arc<dyn Clock>,
        call_timeout: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            migrations,
            fleet,
            collaborators,
            settings,
            policy,
            clock,
            call_timeout,
            events,
        }
    }

    /// Phase changes, one event per transition
    pub fn subscribe(&self) -> broadcast::Receiver<PhaseChangeEvent> {
        self.events.subscribe()
    }

    pub fn store(&self) -> &Arc<ObjectStore<Migration>> {
        &self.migrations
    }

    pub fn policy(&self) -> &PhasePolicy {
        &self.policy
    }

    async fn call<T, F>(&self, operation: &str, call: F) -> std::result::Result<Option<T>, ExternalError>
    where
        F: Future<Output = std::result::Result<T, ExternalError>>,
    {
        with_timeout(self.call_timeout, operation, call).await
    }

    fn copy_request(&self, migration: &Migration, worker: &str, settings: &Settings) -> CopyRequest {
        CopyRequest {
            migration: migration.name().to_string(),
            worker: worker.to_string(),
            source_vm: migration.spec.source_vm.clone(),
            disks: migration.status.source_disks.clone(),
            method: migration.method(settings),
        }
    }

    /// Look at the outside world for the current phase
    async fn observe(&self, migration: &Migration, settings: &Settings, now: DateTime<Utc>) -> PhaseEvent {
        let spec = &migration.spec;
        match migration.phase() {
            MigrationPhase::Pending => match validate_spec(migration) {
                Ok(()) => PhaseEvent::ValidationPassed,
                Err(reason) => PhaseEvent::ValidationFailed(reason),
            },

            MigrationPhase::Validating => {
                let source = self.collaborators.source.clone();
                match self.call("get source vm", source.get_vm(&spec.source_vm)).await {
                    Ok(None) => PhaseEvent::StepInProgress,
                    Ok(Some(None)) => PhaseEvent::PrerequisitesFailed(format!(
                        "source VM {} not found",
                        spec.source_vm
                    )),
                    Ok(Some(Some(vm))) if vm.disks.is_empty() => PhaseEvent::PrerequisitesFailed(
                        format!("source VM {} has no disks", spec.source_vm),
                    ),
                    Ok(Some(Some(vm))) => PhaseEvent::PrerequisitesConfirmed {
                        disks: vm.disks.into_iter().map(|d| d.name).collect(),
                    },
                    Err(e) if e.is_transient() => PhaseEvent::TransientError(e.message),
                    Err(e) => PhaseEvent::PrerequisitesFailed(e.message),
                }
            }

            MigrationPhase::AwaitingDataCopyStart => {
                match self.fleet.acquire_worker(migration.name()).await {
                    Ok(Assignment::Assigned { worker }) => {
                        if migration.method(settings) == MigrationMethod::Cold {
                            if let Some(event) = self.power_off_for_cold_copy(migration).await {
                                return event;
                            }
                        }
                        PhaseEvent::WorkerAssigned { worker }
                    }
                    Ok(Assignment::Unavailable { reason, scaling }) => {
                        let reason = if scaling {
                            format!("{} (provisioning a new worker)", reason)
                        } else {
                            reason
                        };
                        PhaseEvent::WorkerUnavailable { reason }
                    }
                    Err(e) => PhaseEvent::TransientError(format!("worker assignment failed: {}", e)),
                }
            }

            MigrationPhase::Copying | MigrationPhase::CopyingChangedBlocks | MigrationPhase::ConvertingDisk => {
                let worker = match self.check_worker(migration) {
                    Ok(worker) => worker,
                    Err(lost) => return lost,
                };
                let request = self.copy_request(migration, &worker, settings);
                self.observe_worker_step(migration, &request, settings).await
            }

            MigrationPhase::AwaitingCutOverStartTime => PhaseEvent::Tick,

            MigrationPhase::AwaitingAdminCutOver => {
                match cutover::execution_gate(spec, now, self.policy.max_cutover_poll) {
                    CutoverGate::Proceed => {
                        metrics::record_cutover_attempt();
                        match cutover::execute(
                            migration,
                            self.collaborators.source.as_ref(),
                            self.collaborators.target.as_ref(),
                            self.call_timeout,
                        )
                        .await
                        {
                            Ok(()) => PhaseEvent::CutoverExecuted,
                            Err(e) => {
                                warn!("Cutover of {} failed: {}", migration.name(), e);
                                PhaseEvent::CutoverFailed(e)
                            }
                        }
                    }
                    CutoverGate::Wait(_) | CutoverGate::AwaitSignal => PhaseEvent::Tick,
                }
            }

            MigrationPhase::Failed => {
                if spec.retry_generation > migration.status.observed_retry_generation {
                    PhaseEvent::RetryRequested {
                        generation: spec.retry_generation,
                    }
                } else {
                    PhaseEvent::Tick
                }
            }

            MigrationPhase::Succeeded | MigrationPhase::Unknown => PhaseEvent::Tick,
        }
    }

    async fn power_off_for_cold_copy(&self, migration: &Migration) -> Option<PhaseEvent> {
        let source = self.collaborators.source.clone();
        let vm = &migration.spec.source_vm;
        match self.call("power off source vm", source.power_off(vm)).await {
            Ok(Some(())) => {
                info!("Powered off {} for cold migration", vm);
                None
            }
            Ok(None) => Some(PhaseEvent::TransientError(format!(
                "power off of {} still in progress",
                vm
            ))),
            Err(e) => Some(PhaseEvent::TransientError(format!(
                "power off of {} failed: {}",
                vm, e
            ))),
        }
    }

    /// The assigned worker must still exist and be Ready
    fn check_worker(&self, migration: &Migration) -> std::result::Result<String, PhaseEvent> {
        let Some(worker) = migration.status.assigned_worker.clone() else {
            return Err(PhaseEvent::WorkerLost("no worker assigned".to_string()));
        };
        match self.fleet.worker(&worker) {
            None => Err(PhaseEvent::WorkerLost(format!("worker {} no longer exists", worker))),
            Some(node) if node.metadata.is_deleting() => {
                Err(PhaseEvent::WorkerLost(format!("worker {} is being deleted", worker)))
            }
            Some(node) if !node.is_schedulable() => Err(PhaseEvent::WorkerLost(format!(
                "worker {} is {}",
                worker,
                node.phase()
            ))),
            Some(_) => Ok(worker),
        }
    }

    async fn observe_worker_step(
        &self,
        migration: &Migration,
        request: &CopyRequest,
        settings: &Settings,
    ) -> PhaseEvent {
        let copy = self.collaborators.copy.clone();
        match migration.phase() {
            MigrationPhase::Copying => match self.call("full copy", copy.full_copy(request)).await {
                Ok(Some(CopyProgress::Complete { .. })) => PhaseEvent::FullCopyComplete,
                Ok(Some(CopyProgress::InProgress)) | Ok(None) => PhaseEvent::StepInProgress,
                Err(e) => PhaseEvent::CopyFailed(e),
            },
            MigrationPhase::CopyingChangedBlocks => {
                if migration.status.convergence.iterations >= settings.iteration_threshold() {
                    return PhaseEvent::Tick;
                }
                match self
                    .call("changed block pass", copy.changed_block_pass(request))
                    .await
                {
                    Ok(Some(CopyProgress::Complete { remaining_bytes })) => {
                        metrics::record_convergence_pass(remaining_bytes);
                        PhaseEvent::ChangedBlockPassComplete { remaining_bytes }
                    }
                    Ok(Some(CopyProgress::InProgress)) | Ok(None) => PhaseEvent::StepInProgress,
                    Err(e) => PhaseEvent::CopyFailed(e),
                }
            }
            _ => {
                let converter = self.collaborators.converter.clone();
                match self.call("convert disks", converter.convert(request)).await {
                    Ok(Some(ConversionProgress::Complete)) => PhaseEvent::ConversionSucceeded,
                    Ok(Some(ConversionProgress::InProgress)) | Ok(None) => PhaseEvent::StepInProgress,
                    Err(e) => PhaseEvent::ConversionFailed(e),
                }
            }
        }
    }

    /// Persist a transition, announce it, and carry out its actions
    async fn apply(&self, migration: &Migration, transition: Transition) -> Result<Action> {
        let key = migration.key();
        let status = transition.status.clone();
        self.migrations.patch(&key, move |m| m.status = status)?;

        if transition.phase_changed() {
            let reason = transition.reason.clone();
            match transition.to {
                MigrationPhase::Failed => warn!(
                    "Migration {} {} -> Failed: {}",
                    key,
                    transition.from,
                    reason.as_deref().unwrap_or("unknown reason")
                ),
                _ => info!(
                    "Migration {} {} -> {}",
                    key, transition.from, transition.to
                ),
            }
            metrics::record_phase_transition(transition.from.as_str(), transition.to.as_str());
            // No subscribers is fine
            let _ = self.events.send(PhaseChangeEvent {
                migration: migration.name().to_string(),
                from: transition.from,
                to: transition.to,
                reason,
                timestamp: self.clock.now(),
            });
        }

        for action in &transition.actions {
            match action {
                PhaseAction::ReleaseWorker { worker } => {
                    if let Err(e) = self.fleet.release_worker(worker, migration.name()).await {
                        warn!(
                            "Failed to release worker {} from {}: {}",
                            worker,
                            migration.name(),
                            e
                        );
                    }
                }
                PhaseAction::CleanupVolumes => self.cleanup_volumes(migration).await,
                PhaseAction::RaiseIntegrityAlert => {
                    error!(
                        "Migration {} has an unrecognized phase; it will not progress until repaired",
                        key
                    );
                    metrics::record_integrity_alert();
                }
            }
        }

        Ok(transition.next)
    }

    async fn cleanup_volumes(&self, migration: &Migration) {
        let converter = self.collaborators.converter.clone();
        match self
            .call("cleanup volumes", converter.cleanup_volumes(migration.name()))
            .await
        {
            Ok(Some(())) => info!("Cleaned up volumes of {}", migration.name()),
            Ok(None) => warn!("Volume cleanup for {} timed out", migration.name()),
            Err(e) => warn!("Volume cleanup for {} failed: {}", migration.name(), e),
        }
    }

    /// Deletion: give back any capacity held, then drop the hold
    async fn finalize(&self, migration: &Migration) -> Result<Action> {
        let name = migration.name();
        for worker in self.fleet.list().iter().filter(|w| w.owns(name)) {
            self.fleet.release_worker(worker.name(), name).await?;
        }
        self.migrations
            .remove_finalizer(&migration.key(), MIGRATION_FINALIZER)?;
        info!("Migration {} finalized", migration.key());
        Ok(Action::await_change())
    }
}

/// Static checks on the desired state
fn validate_spec(migration: &Migration) -> std::result::Result<(), String> {
    let spec = &migration.spec;
    if spec.source_vm.trim().is_empty() {
        return Err("no source VM given".to_string());
    }
    if spec.placement.flavor_id.trim().is_empty() {
        return Err("no target flavor given".to_string());
    }
    if spec.cutover_mode == CutoverMode::ScheduledTime && spec.scheduled_cutover.is_none() {
        return Err("scheduled-time cutover requires a scheduled cutover time".to_string());
    }
    Ok(())
}

#[async_trait]
impl Reconciler for MigrationController {
    fn name(&self) -> &'static str {
        "migration"
    }

    fn keys(&self) -> Vec<ObjectKey> {
        self.migrations.keys()
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let Some(mut migration) = self.migrations.get(key) else {
            debug!("Migration {} no longer exists", key);
            return Ok(Action::await_change());
        };

        if migration.metadata.is_deleting() {
            return self.finalize(&migration).await;
        }

        if !migration.metadata.has_finalizer(MIGRATION_FINALIZER) {
            migration = self.migrations.patch(key, |m| {
                m.metadata.add_finalizer(MIGRATION_FINALIZER);
            })?;
        }

        if migration.is_paused() {
            debug!("Migration {} is paused", key);
            return Ok(Action::requeue(self.policy.phase_poll));
        }

        let settings = self.settings.load().await?;
        let now = self.clock.now();
        let event = self.observe(&migration, &settings, now).await;
        debug!("Migration {} in {} observed {}", key, migration.phase(), event.name());

        let ctx = TransitionContext {
            settings: &settings,
            policy: &self.policy,
            now,
        };
        let transition = advance(&migration, &event, &ctx)?;
        self.apply(&migration, transition).await
    }

    fn error_policy(&self, key: &ObjectKey, error: &MigrateError, attempt: u32) -> Action {
        let delay = exponential_backoff(self.policy.backoff_base, attempt, self.policy.backoff_max);
        warn!(
            "Migration {} reconcile failed ({}, attempt {}): {}, retrying in {:?}",
            key,
            error.error_type(),
            attempt,
            error,
            delay
        );
        Action::requeue(delay)
    }
}
