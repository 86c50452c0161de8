//! Cutover gating and execution
//!
//! In scheduled mode a migration parks in `AwaitingCutOverStartTime` until
//! its start time, sleeping in slices no longer than the maximum poll. In
//! explicit-admin mode it parks in `AwaitingAdminCutOver` until the admin
//! signal reads `yes`. An admin `yes` also releases a scheduled migration
//! early.

use super::{CutoverMode, CutoverSignal, Migration, MigrationSpec};
use crate::error::ExternalError;
use crate::external::{with_timeout, SourceInventory, TargetCloud};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::info;

/// Shortest wait handed back while parked, so a due time is never spun on
const MIN_WAIT: Duration = Duration::from_secs(1);

/// Whether the cutover may proceed right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CutoverGate {
    Proceed,
    /// Scheduled time not reached; check again after the delay
    Wait(Duration),
    /// Parked until the admin signal changes
    AwaitSignal,
}

fn admin_says_yes(spec: &MigrationSpec) -> bool {
    spec.start_cutover == Some(CutoverSignal::Yes)
}

/// Gate for leaving `AwaitingCutOverStartTime`
pub fn start_time_gate(spec: &MigrationSpec, now: DateTime<Utc>, max_poll: Duration) -> CutoverGate {
    if admin_says_yes(spec) || spec.cutover_mode == CutoverMode::ExplicitAdmin {
        return CutoverGate::Proceed;
    }
    match spec.scheduled_cutover {
        None => CutoverGate::Proceed,
        Some(at) if now >= at => CutoverGate::Proceed,
        Some(at) => {
            let remaining = (at - now).to_std().unwrap_or(Duration::ZERO);
            CutoverGate::Wait(remaining.min(max_poll).max(MIN_WAIT))
        }
    }
}

/// Gate for executing the cutover from `AwaitingAdminCutOver`
pub fn execution_gate(spec: &MigrationSpec, now: DateTime<Utc>, max_poll: Duration) -> CutoverGate {
    if admin_says_yes(spec) {
        return CutoverGate::Proceed;
    }
    match spec.cutover_mode {
        CutoverMode::ExplicitAdmin => CutoverGate::AwaitSignal,
        CutoverMode::ScheduledTime => start_time_gate(spec, now, max_poll),
    }
}

/// Power off the source with a final sync, then activate the target VM.
///
/// Both steps tolerate being repeated after a partial failure: the source
/// may already be off and the target may already be active.
pub async fn execute(
    migration: &Migration,
    source: &dyn SourceInventory,
    target: &dyn TargetCloud,
    timeout: Duration,
) -> Result<(), ExternalError> {
    let vm = &migration.spec.source_vm;

    with_timeout(timeout, "power off and final sync", source.power_off_and_final_sync(vm))
        .await?
        .ok_or_else(|| ExternalError::transient(format!("final sync of {} timed out", vm)))?;

    with_timeout(timeout, "activate target vm", target.activate_vm(vm))
        .await?
        .ok_or_else(|| ExternalError::transient(format!("activation of {} timed out", vm)))?;

    info!("Cutover of {} to the target cloud complete", migration.name());
    Ok(())
}
