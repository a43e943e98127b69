//! Closed status enums and their transition tables.
//!
//! Every status that crosses a boundary (persistence, HTTP, the event feed)
//! is one of these enums, rendered as snake_case. Moves between states go
//! through `can_transition_to`; the controller refuses anything else.

use serde::{Deserialize, Serialize};

/// Implements `as_str`, `FromStr` and `Display` for a fieldless status enum.
macro_rules! labeled_enum {
    ($name:ident, $what:literal, { $($variant:ident => $label:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $label,)+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($label => Ok(Self::$variant),)+
                    _ => Err(format!("Invalid {}: {}", $what, s)),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

pub(crate) use labeled_enum;

/// Lifecycle of one Execution.
///
/// ```text
/// preparing -> running <-> paused -> {completed, failed} -> rolling_back -> {rolled_back, rollback_failed}
/// ```
///
/// `running`/`paused` may also move straight to `rolling_back` (cancellation),
/// and `paused` to `failed` when a halt policy fires while nothing is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Preparing,
    Running,
    Paused,
    Completed,
    Failed,
    RollingBack,
    RolledBack,
    RollbackFailed,
}

labeled_enum!(ExecutionStatus, "execution status", {
    Preparing => "preparing",
    Running => "running",
    Paused => "paused",
    Completed => "completed",
    Failed => "failed",
    RollingBack => "rolling_back",
    RolledBack => "rolled_back",
    RollbackFailed => "rollback_failed",
});

impl ExecutionStatus {
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Preparing, Running)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, RollingBack)
                | (Paused, Running)
                | (Paused, Failed)
                | (Paused, RollingBack)
                | (Completed, RollingBack)
                | (Failed, RollingBack)
                | (RollingBack, RolledBack)
                | (RollingBack, RollbackFailed)
        )
    }

    /// Forward run is over (successfully or not), or the rollback finished.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::RolledBack | Self::RollbackFailed
        )
    }

    /// No further transition is possible at all.
    pub fn is_final(self) -> bool {
        matches!(self, Self::RolledBack | Self::RollbackFailed)
    }

    /// Quiescent: nothing is executing and nothing will without an operator command.
    pub fn is_settled(self) -> bool {
        self == Self::Paused || self.is_terminal()
    }

    /// Forward execution (phases/steps) is still possible.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

/// Status of a Phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    /// Waiting for dependencies or a concurrency slot
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    /// Never started because a dependency failed
    Skipped,
    /// Stopped at a step boundary because the Execution stopped
    Halted,
}

labeled_enum!(PhaseStatus, "phase status", {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
    Skipped => "skipped",
    Halted => "halted",
});

impl PhaseStatus {
    pub fn can_transition_to(self, next: PhaseStatus) -> bool {
        use PhaseStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Skipped)
                | (Pending, Halted)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Halted)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Skipped | Self::Halted
        )
    }
}

/// Status of a Step.
///
/// A step stays `running` across retry attempts; `warning` is a failed
/// non-critical step that lets its phase continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Warning,
}

labeled_enum!(StepStatus, "step status", {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
    Warning => "warning",
});

impl StepStatus {
    pub fn can_transition_to(self, next: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, next),
            (Pending, Running) | (Running, Completed) | (Running, Failed) | (Running, Warning)
        )
    }

    /// Counts toward phase progress and never runs again.
    pub fn is_done(self) -> bool {
        matches!(self, Self::Completed | Self::Warning)
    }
}

/// Status of one step of a running rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStepStatus {
    #[default]
    Pending,
    Running,
    Verifying,
    Completed,
    Failed,
}

labeled_enum!(RollbackStepStatus, "rollback step status", {
    Pending => "pending",
    Running => "running",
    Verifying => "verifying",
    Completed => "completed",
    Failed => "failed",
});
