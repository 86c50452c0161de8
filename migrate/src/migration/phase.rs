//! Migration phases and their ordering
//!
//! ```text
//! Pending → Validating → AwaitingDataCopyStart → Copying → CopyingChangedBlocks
//!         → ConvertingDisk → AwaitingCutOverStartTime → AwaitingAdminCutOver → Succeeded
//!
//! Any in-progress phase → Failed;  Failed → Pending (explicit retry)
//! Unrecognized stored value → Unknown (sink, never auto-progresses)
//! ```

use serde::{Deserialize, Serialize};

/// Phase of a single VM migration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MigrationPhase {
    #[default]
    Pending,
    Validating,
    Failed,
    AwaitingDataCopyStart,
    Copying,
    CopyingChangedBlocks,
    ConvertingDisk,
    AwaitingCutOverStartTime,
    AwaitingAdminCutOver,
    Succeeded,
    Unknown,
}

impl MigrationPhase {
    /// Rank used for monotonicity checks and display ordering
    pub fn rank(&self) -> u8 {
        match self {
            MigrationPhase::Pending => 0,
            MigrationPhase::Validating => 1,
            MigrationPhase::Failed => 2,
            MigrationPhase::AwaitingDataCopyStart => 3,
            MigrationPhase::Copying => 4,
            MigrationPhase::CopyingChangedBlocks => 5,
            MigrationPhase::ConvertingDisk => 6,
            MigrationPhase::AwaitingCutOverStartTime => 7,
            MigrationPhase::AwaitingAdminCutOver => 8,
            MigrationPhase::Succeeded => 9,
            MigrationPhase::Unknown => 10,
        }
    }

    /// All phases in rank order
    pub fn all_phases() -> &'static [MigrationPhase] {
        &[
            MigrationPhase::Pending,
            MigrationPhase::Validating,
            MigrationPhase::Failed,
            MigrationPhase::AwaitingDataCopyStart,
            MigrationPhase::Copying,
            MigrationPhase::CopyingChangedBlocks,
            MigrationPhase::ConvertingDisk,
            MigrationPhase::AwaitingCutOverStartTime,
            MigrationPhase::AwaitingAdminCutOver,
            MigrationPhase::Succeeded,
            MigrationPhase::Unknown,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationPhase::Pending => "Pending",
            MigrationPhase::Validating => "Validating",
            MigrationPhase::Failed => "Failed",
            MigrationPhase::AwaitingDataCopyStart => "AwaitingDataCopyStart",
            MigrationPhase::Copying => "Copying",
            MigrationPhase::CopyingChangedBlocks => "CopyingChangedBlocks",
            MigrationPhase::ConvertingDisk => "ConvertingDisk",
            MigrationPhase::AwaitingCutOverStartTime => "AwaitingCutOverStartTime",
            MigrationPhase::AwaitingAdminCutOver => "AwaitingAdminCutOver",
            MigrationPhase::Succeeded => "Succeeded",
            MigrationPhase::Unknown => "Unknown",
        }
    }

    /// Parse a stored phase name. Returns `None` for unrecognized values.
    pub fn parse(s: &str) -> Option<MigrationPhase> {
        Self::all_phases()
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
    }

    /// Neither finished, failed, nor corrupt
    pub fn is_in_progress(&self) -> bool {
        !matches!(
            self,
            MigrationPhase::Failed | MigrationPhase::Succeeded | MigrationPhase::Unknown
        )
    }

    /// No further progress without outside intervention
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MigrationPhase::Failed | MigrationPhase::Succeeded | MigrationPhase::Unknown
        )
    }

    /// Phases that execute on a worker and so need a Ready assignment
    pub fn requires_worker(&self) -> bool {
        matches!(
            self,
            MigrationPhase::Copying
                | MigrationPhase::CopyingChangedBlocks
                | MigrationPhase::ConvertingDisk
        )
    }

    /// Whether a migration may move from `self` to `next`.
    ///
    /// Rank never decreases, except for `* → Failed` and the explicit
    /// `Failed → Pending` retry.
    pub fn can_transition_to(&self, next: MigrationPhase) -> bool {
        if *self == next {
            return true;
        }
        match (*self, next) {
            (MigrationPhase::Failed, MigrationPhase::Pending) => true,
            (from, MigrationPhase::Failed) => from.is_in_progress(),
            (MigrationPhase::Failed, _)
            | (MigrationPhase::Succeeded, _)
            | (MigrationPhase::Unknown, _) => false,
            (_, MigrationPhase::Unknown) => false,
            (from, to) => to.rank() > from.rank(),
        }
    }
}

impl std::fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MigrationPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("Unknown migration phase: {}", s))
    }
}

impl From<String> for MigrationPhase {
    /// Storage decoding: corrupt or unrecognized values land in the `Unknown` sink
    fn from(s: String) -> Self {
        Self::parse(&s).unwrap_or(MigrationPhase::Unknown)
    }
}

impl From<MigrationPhase> for String {
    fn from(phase: MigrationPhase) -> Self {
        phase.as_str().to_string()
    }
}
