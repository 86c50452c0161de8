//! Per-VM migration records and the machinery that drives them
//!
//! - **phase**: the phase enum with its rank ordering
//! - **machine**: the pure transition function `(migration, event, settings) → transition`
//! - **convergence**: stop conditions and failure policy for changed-block copying
//! - **cutover**: gating of the final switch-over
//! - **controller**: the reconciler that observes collaborators and applies transitions

pub mod controller;
pub mod convergence;
pub mod cutover;
pub mod machine;
mod phase;

pub use controller::MigrationController;
pub use convergence::ConvergenceDecision;
pub use cutover::CutoverGate;
pub use machine::{advance, PhaseAction, PhaseEvent, PhasePolicy, Transition, TransitionContext};
pub use phase::MigrationPhase;

use crate::settings::{MigrationMethod, Settings};
use crate::types::{Object, ObjectMeta};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Hold placed on every migration until its worker assignment is released
pub const MIGRATION_FINALIZER: &str = "migration.k8s.stellaris.io/finalizer";

/// Label that parks a migration in its current phase while set to "true"
pub const PAUSE_LABEL: &str = "migrate.k8s.stellaris.io/pause";

/// How the final switch-over is triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CutoverMode {
    /// Wait for an administrator to set `start-cutover = yes`
    #[default]
    ExplicitAdmin,
    /// Cut over automatically once the scheduled time has passed
    ScheduledTime,
}

/// Administrator cutover signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CutoverSignal {
    Yes,
    No,
}

/// Where and how the VM lands on the target cloud
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetPlacement {
    pub flavor_id: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network_ids: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability_zone: Option<String>,
}

/// Desired state of a migration, written by operators
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationSpec {
    /// Identifier of the VM on the source platform
    pub source_vm: String,

    /// Reference to the source platform credentials object
    #[serde(default)]
    pub source_credentials: String,

    pub placement: TargetPlacement,

    /// Overrides the default method from settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<MigrationMethod>,

    #[serde(default)]
    pub cutover_mode: CutoverMode,

    /// Earliest cutover time in `scheduled-time` mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_cutover: Option<DateTime<Utc>>,

    /// Admin cutover trigger
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_cutover: Option<CutoverSignal>,

    /// Bumped by the retry trigger; a Failed migration whose observed
    /// generation is behind restarts from Pending
    #[serde(default)]
    pub retry_generation: u64,
}

/// Kinds of condition reported on a migration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionType {
    Validated,
    DataCopy,
    Migrating,
    Failed,
}

/// Operator-facing detail about one aspect of a migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub status: bool,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

/// Convergence loop counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvergenceStatus {
    /// Changed-block passes completed
    pub iterations: u32,

    /// Threshold in force for the latest pass
    pub threshold: u32,

    /// Delta reported after the latest pass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_remaining_bytes: Option<u64>,
}

/// Observed state of a migration, written only by the migration controller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStatus {
    #[serde(default)]
    pub phase: MigrationPhase,

    /// Worker node executing the copy phases
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_worker: Option<String>,

    /// Disks discovered during validation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_disks: Vec<String>,

    #[serde(default)]
    pub convergence: ConvergenceStatus,

    /// Consecutive transient failures in the current phase
    #[serde(default)]
    pub transient_failures: u32,

    #[serde(default)]
    pub cutover_attempts: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    /// Latest status message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default)]
    pub observed_retry_generation: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl MigrationStatus {
    /// Upsert a condition. The transition time only moves when the status flips.
    pub fn set_condition(
        &mut self,
        condition_type: ConditionType,
        status: bool,
        reason: &str,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        let message = message.into();
        match self
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == condition_type)
        {
            Some(existing) => {
                if existing.status != status {
                    existing.last_transition_time = now;
                }
                existing.status = status;
                existing.reason = reason.to_string();
                existing.message = message;
            }
            None => self.conditions.push(Condition {
                condition_type,
                status,
                reason: reason.to_string(),
                message,
                last_transition_time: now,
            }),
        }
    }

    pub fn condition(&self, condition_type: ConditionType) -> Option<&Condition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    /// Most recently transitioned condition
    pub fn latest_condition(&self) -> Option<&Condition> {
        self.conditions.iter().max_by_key(|c| c.last_transition_time)
    }
}

/// One VM's move from the source platform to the target cloud
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Migration {
    pub metadata: ObjectMeta,
    pub spec: MigrationSpec,
    #[serde(default)]
    pub status: MigrationStatus,
}

impl Object for Migration {
    const KIND: &'static str = "Migration";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl Migration {
    pub fn new(namespace: &str, name: &str, spec: MigrationSpec) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec,
            status: MigrationStatus::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn phase(&self) -> MigrationPhase {
        self.status.phase
    }

    /// Method in force: the migration's own override or the settings default
    pub fn method(&self, settings: &Settings) -> MigrationMethod {
        self.spec.method.unwrap_or(settings.default_migration_method)
    }

    pub fn is_paused(&self) -> bool {
        self.metadata
            .label(PAUSE_LABEL)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }
}

/// Emitted whenever a migration changes phase
#[derive(Debug, Clone)]
pub struct PhaseChangeEvent {
    pub migration: String,
    pub from: MigrationPhase,
    pub to: MigrationPhase,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}
