//! Stop conditions and failure policy for changed-block copying

use crate::error::ExternalError;
use crate::settings::MigrationMethod;

/// Outcome of a completed changed-block pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceDecision {
    /// Remaining delta fell below the cutoff
    Converged,
    /// Iteration threshold reached before the delta did
    IterationCapReached,
    /// Schedule another pass
    Continue,
}

impl ConvergenceDecision {
    pub fn is_done(&self) -> bool {
        !matches!(self, ConvergenceDecision::Continue)
    }

    pub fn reason(&self) -> &'static str {
        match self {
            ConvergenceDecision::Converged => "DeltaConverged",
            ConvergenceDecision::IterationCapReached => "IterationCapReached",
            ConvergenceDecision::Continue => "ChangedBlocksCopied",
        }
    }
}

/// Decide whether copying has converged after `iterations` completed passes.
///
/// A cold migration copies from a powered-off source, so its first pass
/// leaves nothing behind.
pub fn evaluate(
    iterations: u32,
    threshold: u32,
    remaining_bytes: u64,
    cutoff_bytes: u64,
    method: MigrationMethod,
) -> ConvergenceDecision {
    if method == MigrationMethod::Cold || remaining_bytes < cutoff_bytes {
        return ConvergenceDecision::Converged;
    }
    if iterations >= threshold.max(1) {
        return ConvergenceDecision::IterationCapReached;
    }
    ConvergenceDecision::Continue
}

/// What to do about a failed copy or conversion step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    /// Try again; `attempt` is the new consecutive failure count
    Retry { attempt: u32 },
    /// Give up and fail the migration
    Escalate,
}

/// Transient errors are retried until `retry_limit` consecutive failures;
/// unrecoverable errors escalate immediately.
pub fn classify_failure(error: &ExternalError, failures: u32, retry_limit: u32) -> FailureDecision {
    if error.is_transient() && failures < retry_limit {
        FailureDecision::Retry {
            attempt: failures + 1,
        }
    } else {
        FailureDecision::Escalate
    }
}
