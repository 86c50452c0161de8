//! Pure migration phase transitions
//!
//! [`advance`] maps the current record, the outcome of the last external
//! step and the settings snapshot to the next status, the side effects the
//! controller must carry out, and when to look again. It performs no I/O:
//! applying the same event to the same record always yields the same result.

use super::convergence::{self, ConvergenceDecision, FailureDecision};
use super::cutover::{self, CutoverGate};
use super::{ConditionType, ConvergenceStatus, CutoverMode, Migration, MigrationPhase, MigrationStatus};
use crate::config::EngineConfig;
use crate::error::{ExternalError, MigrateError, Result};
use crate::reconcile::{exponential_backoff, Action};
use crate::settings::Settings;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Delays and limits that shape transitions
#[derive(Debug, Clone)]
pub struct PhasePolicy {
    pub trigger_delay: Duration,
    pub phase_poll: Duration,
    pub changed_block_interval: Duration,
    pub max_cutover_poll: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub copy_retry_limit: u32,
    pub cutover_attempt_limit: u32,
    pub convergence_cutoff_bytes: u64,
}

impl PhasePolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            trigger_delay: config.requeue.trigger_delay(),
            phase_poll: config.requeue.phase_poll(),
            changed_block_interval: config.migration.changed_block_interval(),
            max_cutover_poll: config.migration.max_cutover_poll(),
            backoff_base: config.requeue.error_backoff_base(),
            backoff_max: config.requeue.error_backoff_max(),
            copy_retry_limit: config.migration.copy_retry_limit,
            cutover_attempt_limit: config.migration.cutover_attempt_limit.max(1),
            convergence_cutoff_bytes: config.migration.convergence_cutoff_bytes,
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        exponential_backoff(self.backoff_base, attempt, self.backoff_max)
    }
}

impl Default for PhasePolicy {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// Inputs besides the record itself
#[derive(Debug, Clone, Copy)]
pub struct TransitionContext<'a> {
    pub settings: &'a Settings,
    pub policy: &'a PhasePolicy,
    pub now: DateTime<Utc>,
}

/// Outcome of the last external step, as observed by the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseEvent {
    /// Nothing new; re-evaluate time-based gates
    Tick,
    ValidationPassed,
    ValidationFailed(String),
    PrerequisitesConfirmed { disks: Vec<String> },
    PrerequisitesFailed(String),
    WorkerAssigned { worker: String },
    WorkerUnavailable { reason: String },
    /// The assigned worker vanished or stopped being Ready
    WorkerLost(String),
    /// The external step is still running
    StepInProgress,
    FullCopyComplete,
    ChangedBlockPassComplete { remaining_bytes: u64 },
    CopyFailed(ExternalError),
    ConversionSucceeded,
    ConversionFailed(ExternalError),
    CutoverExecuted,
    CutoverFailed(ExternalError),
    RetryRequested { generation: u64 },
    /// A collaborator call failed in a way that warrants a plain retry
    TransientError(String),
}

impl PhaseEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PhaseEvent::Tick => "tick",
            PhaseEvent::ValidationPassed => "validation-passed",
            PhaseEvent::ValidationFailed(_) => "validation-failed",
            PhaseEvent::PrerequisitesConfirmed { .. } => "prerequisites-confirmed",
            PhaseEvent::PrerequisitesFailed(_) => "prerequisites-failed",
            PhaseEvent::WorkerAssigned { .. } => "worker-assigned",
            PhaseEvent::WorkerUnavailable { .. } => "worker-unavailable",
            PhaseEvent::WorkerLost(_) => "worker-lost",
            PhaseEvent::StepInProgress => "step-in-progress",
            PhaseEvent::FullCopyComplete => "full-copy-complete",
            PhaseEvent::ChangedBlockPassComplete { .. } => "changed-block-pass-complete",
            PhaseEvent::CopyFailed(_) => "copy-failed",
            PhaseEvent::ConversionSucceeded => "conversion-succeeded",
            PhaseEvent::ConversionFailed(_) => "conversion-failed",
            PhaseEvent::CutoverExecuted => "cutover-executed",
            PhaseEvent::CutoverFailed(_) => "cutover-failed",
            PhaseEvent::RetryRequested { .. } => "retry-requested",
            PhaseEvent::TransientError(_) => "transient-error",
        }
    }
}

/// Side effects the controller carries out after persisting a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseAction {
    /// Return the capacity slot held on a worker
    ReleaseWorker { worker: String },
    /// Delete partially written target volumes
    CleanupVolumes,
    /// Surface a corrupt record to operators
    RaiseIntegrityAlert,
}

/// Result of applying one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: MigrationPhase,
    pub to: MigrationPhase,
    pub status: MigrationStatus,
    pub actions: Vec<PhaseAction>,
    pub next: Action,
    /// Human-readable cause of a phase change
    pub reason: Option<String>,
}

impl Transition {
    pub fn phase_changed(&self) -> bool {
        self.from != self.to
    }
}

struct Step<'a> {
    from: MigrationPhase,
    status: MigrationStatus,
    actions: Vec<PhaseAction>,
    next: Action,
    reason: Option<String>,
    ctx: &'a TransitionContext<'a>,
}

impl<'a> Step<'a> {
    fn new(migration: &Migration, ctx: &'a TransitionContext<'a>) -> Self {
        Self {
            from: migration.status.phase,
            status: migration.status.clone(),
            actions: Vec::new(),
            next: Action::requeue(ctx.policy.phase_poll),
            reason: None,
            ctx,
        }
    }

    fn wait(mut self, delay: Duration) -> Self {
        self.next = Action::requeue(delay);
        self
    }

    fn park(mut self) -> Self {
        self.next = Action::await_change();
        self
    }

    fn message(mut self, message: impl Into<String>) -> Self {
        self.status.message = Some(message.into());
        self
    }

    fn condition(
        mut self,
        condition_type: ConditionType,
        status: bool,
        reason: &str,
        message: impl Into<String>,
    ) -> Self {
        self.status
            .set_condition(condition_type, status, reason, message, self.ctx.now);
        self
    }

    fn enter(mut self, phase: MigrationPhase) -> Self {
        if self.status.phase != phase {
            self.status.phase = phase;
            self.status.last_transition_time = Some(self.ctx.now);
            self.status.transient_failures = 0;
        }
        self.next = Action::requeue(self.ctx.policy.trigger_delay);
        self
    }

    fn release_worker(mut self) -> Self {
        if let Some(worker) = self.status.assigned_worker.take() {
            self.actions.push(PhaseAction::ReleaseWorker { worker });
        }
        self
    }

    fn fail(self, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let mut step = self
            .enter(MigrationPhase::Failed)
            .release_worker()
            .condition(ConditionType::Failed, true, "MigrationFailed", reason.clone())
            .message(reason.clone())
            .park();
        step.status.failure_reason = Some(reason.clone());
        step.reason = Some(reason);
        step
    }

    fn reject(self, reason: &str) -> Self {
        self.condition(ConditionType::Validated, false, "ValidationFailed", reason)
            .fail(format!("Validation failed: {}", reason))
    }

    fn transient(mut self, message: &str) -> Self {
        let attempt = self.status.transient_failures.saturating_add(1);
        self.status.transient_failures = attempt;
        let delay = self.ctx.policy.backoff(attempt);
        self.message(format!("{} (retry {} in {:?})", message, attempt, delay))
            .wait(delay)
    }

    fn step_failure(mut self, what: &str, error: &ExternalError) -> Self {
        let policy = self.ctx.policy;
        match convergence::classify_failure(error, self.status.transient_failures, policy.copy_retry_limit) {
            FailureDecision::Retry { attempt } => {
                self.status.transient_failures = attempt;
                let delay = policy.backoff(attempt);
                self.message(format!(
                    "{} failed (attempt {}/{}): {}",
                    what, attempt, policy.copy_retry_limit, error
                ))
                .wait(delay)
            }
            FailureDecision::Escalate => self.fail(format!("{} failed: {}", what, error)),
        }
    }

    fn converge(self, decision: ConvergenceDecision) -> Self {
        let detail = match decision {
            ConvergenceDecision::IterationCapReached => format!(
                "Stopped after {} changed-block passes",
                self.status.convergence.iterations
            ),
            _ => format!(
                "Converged after {} changed-block passes",
                self.status.convergence.iterations
            ),
        };
        self.enter(MigrationPhase::ConvertingDisk)
            .condition(ConditionType::DataCopy, true, decision.reason(), detail)
            .condition(ConditionType::Migrating, true, "ConvertingDisk", "Converting disks")
            .message("Converting disks")
    }

    fn finish(mut self) -> Result<Transition> {
        let to = self.status.phase;
        if !self.from.can_transition_to(to) {
            return Err(MigrateError::Internal(format!(
                "illegal transition {} -> {}",
                self.from, to
            )));
        }
        if to.requires_worker() && self.status.assigned_worker.is_none() {
            return Err(MigrateError::Internal(format!(
                "phase {} entered without a worker assignment",
                to
            )));
        }
        if self.from != to && self.reason.is_none() {
            self.reason = self.status.message.clone();
        }
        Ok(Transition {
            from: self.from,
            to,
            status: self.status,
            actions: self.actions,
            next: self.next,
            reason: self.reason,
        })
    }
}

/// Apply one event to a migration.
///
/// Events that make no sense in the current phase are rejected with
/// [`MigrateError::Internal`]; the record is left untouched.
pub fn advance(
    migration: &Migration,
    event: &PhaseEvent,
    ctx: &TransitionContext<'_>,
) -> Result<Transition> {
    use MigrationPhase::*;

    let step = Step::new(migration, ctx);
    let settings = ctx.settings;
    let policy = ctx.policy;
    let spec = &migration.spec;

    let step = match (migration.status.phase, event) {
        (Unknown, _) => {
            let mut step = step
                .message("Stored phase is not recognized; manual intervention required")
                .park();
            step.actions.push(PhaseAction::RaiseIntegrityAlert);
            step
        }
        (Succeeded, _) => step.park(),
        (Failed, PhaseEvent::RetryRequested { generation }) => {
            if *generation > migration.status.observed_retry_generation {
                let mut step = step.enter(Pending);
                step.status = MigrationStatus {
                    phase: Pending,
                    observed_retry_generation: *generation,
                    last_transition_time: Some(ctx.now),
                    message: Some("Retry requested".to_string()),
                    ..Default::default()
                };
                step.reason = Some("Retry requested".to_string());
                step
            } else {
                step.park()
            }
        }
        (Failed, _) => step.park(),
        (_, PhaseEvent::RetryRequested { .. }) => step,
        (_, PhaseEvent::TransientError(message)) => step.transient(message),
        (phase, PhaseEvent::WorkerLost(detail)) if phase.requires_worker() => {
            step.fail(format!("Worker lost: {}", detail))
        }

        (Pending, PhaseEvent::ValidationPassed) => step.enter(Validating).message("Validating source VM"),
        (Pending | Validating, PhaseEvent::ValidationFailed(reason)) => step.reject(reason),
        (Validating, PhaseEvent::PrerequisitesFailed(reason)) => step.reject(reason),
        (Validating, PhaseEvent::PrerequisitesConfirmed { disks }) => {
            let mut step = step
                .enter(AwaitingDataCopyStart)
                .condition(
                    ConditionType::Validated,
                    true,
                    "ValidationSucceeded",
                    format!("Source VM {} has {} disk(s)", spec.source_vm, disks.len()),
                )
                .message("Waiting for a worker");
            step.status.source_disks = disks.clone();
            step
        }

        (AwaitingDataCopyStart, PhaseEvent::WorkerAssigned { worker }) => {
            let mut step = step.enter(Copying).condition(
                ConditionType::DataCopy,
                true,
                "CopyStarted",
                format!("Full copy running on worker {}", worker),
            );
            step.status.assigned_worker = Some(worker.clone());
            step.message(format!("Copying disks on {}", worker))
        }
        (AwaitingDataCopyStart, PhaseEvent::WorkerUnavailable { reason }) => {
            step.message(reason.clone()).wait(policy.phase_poll)
        }

        (Validating | Copying | ConvertingDisk, PhaseEvent::StepInProgress) => {
            step.wait(policy.phase_poll)
        }
        (CopyingChangedBlocks, PhaseEvent::StepInProgress) => step.wait(policy.changed_block_interval),
        (Copying, PhaseEvent::FullCopyComplete) => {
            let mut step = step
                .enter(CopyingChangedBlocks)
                .condition(
                    ConditionType::DataCopy,
                    true,
                    "FullCopyComplete",
                    "Full copy complete, copying changed blocks",
                )
                .message("Copying changed blocks");
            step.status.convergence = ConvergenceStatus {
                iterations: 0,
                threshold: settings.iteration_threshold(),
                last_remaining_bytes: None,
            };
            step
        }
        (Copying | CopyingChangedBlocks, PhaseEvent::CopyFailed(error)) => {
            step.step_failure("Disk copy", error)
        }
        (CopyingChangedBlocks, PhaseEvent::ChangedBlockPassComplete { remaining_bytes }) => {
            let mut step = step;
            let threshold = settings.iteration_threshold();
            let iterations = step.status.convergence.iterations.saturating_add(1);
            step.status.convergence = ConvergenceStatus {
                iterations,
                threshold,
                last_remaining_bytes: Some(*remaining_bytes),
            };
            step.status.transient_failures = 0;

            let decision = convergence::evaluate(
                iterations,
                threshold,
                *remaining_bytes,
                policy.convergence_cutoff_bytes,
                migration.method(settings),
            );
            if decision.is_done() {
                step.converge(decision)
            } else {
                step.condition(
                    ConditionType::DataCopy,
                    true,
                    decision.reason(),
                    format!(
                        "Changed-block pass {}/{} complete, {} bytes remaining",
                        iterations, threshold, remaining_bytes
                    ),
                )
                .wait(policy.changed_block_interval)
            }
        }
        (CopyingChangedBlocks, PhaseEvent::Tick)
            if migration.status.convergence.iterations >= settings.iteration_threshold() =>
        {
            step.converge(ConvergenceDecision::IterationCapReached)
        }

        (ConvertingDisk, PhaseEvent::ConversionSucceeded) => {
            let next = match spec.cutover_mode {
                CutoverMode::ExplicitAdmin => AwaitingAdminCutOver,
                CutoverMode::ScheduledTime => AwaitingCutOverStartTime,
            };
            step.enter(next)
                .condition(
                    ConditionType::Migrating,
                    true,
                    "AwaitingCutOver",
                    "Disks converted, waiting for cutover",
                )
                .message("Waiting for cutover")
        }
        (ConvertingDisk, PhaseEvent::ConversionFailed(error)) => {
            let cleanup = settings.cleanup_volumes_after_convert_failure;
            let mut step = step.step_failure("Disk conversion", error);
            if cleanup && step.status.phase == Failed {
                step.actions.push(PhaseAction::CleanupVolumes);
            }
            step
        }

        (AwaitingCutOverStartTime, PhaseEvent::Tick) => {
            match cutover::start_time_gate(spec, ctx.now, policy.max_cutover_poll) {
                CutoverGate::Proceed => step.enter(AwaitingAdminCutOver).condition(
                    ConditionType::Migrating,
                    true,
                    "AwaitingCutOver",
                    "Cutover start time reached",
                ),
                CutoverGate::Wait(delay) => {
                    let when = spec
                        .scheduled_cutover
                        .map(|at| at.to_rfc3339())
                        .unwrap_or_default();
                    step.message(format!("Cutover scheduled for {}", when)).wait(delay)
                }
                CutoverGate::AwaitSignal => step.park(),
            }
        }
        (AwaitingAdminCutOver, PhaseEvent::Tick) => {
            match cutover::execution_gate(spec, ctx.now, policy.max_cutover_poll) {
                CutoverGate::Proceed => step.wait(policy.trigger_delay),
                CutoverGate::Wait(delay) => step.wait(delay),
                CutoverGate::AwaitSignal => step
                    .message("Waiting for the admin cutover signal")
                    .park(),
            }
        }
        (AwaitingAdminCutOver, PhaseEvent::CutoverExecuted) => {
            let attempts = migration.status.cutover_attempts.saturating_add(1);
            let mut step = step
                .enter(Succeeded)
                .release_worker()
                .condition(
                    ConditionType::Migrating,
                    true,
                    "CutoverComplete",
                    "VM is running on the target cloud",
                )
                .message("Migration complete")
                .park();
            step.status.cutover_attempts = attempts;
            step
        }
        (AwaitingAdminCutOver, PhaseEvent::CutoverFailed(error)) => {
            let attempts = migration.status.cutover_attempts.saturating_add(1);
            let mut step = if attempts >= policy.cutover_attempt_limit {
                step.fail(format!("Cutover failed after {} attempts: {}", attempts, error))
            } else {
                step.message(format!(
                    "Cutover attempt {}/{} failed: {}",
                    attempts, policy.cutover_attempt_limit, error
                ))
                .wait(policy.backoff(attempts))
            };
            step.status.cutover_attempts = attempts;
            step
        }

        (_, PhaseEvent::Tick) => step,
        (phase, event) => {
            return Err(MigrateError::Internal(format!(
                "event {} is not valid in phase {}",
                event.name(),
                phase
            )))
        }
    };

    step.finish()
}
