//! Typed error hierarchy for the execution engine.
//!
//! - `PlanError`: submission-time validation; no Execution exists when one is returned
//! - `StepError`: step-level failures, retryable or not
//! - `HealthCheckFailure`: advisory, counted toward the unhealthy classification
//! - `RollbackFailure`: fatal, terminal, never retried
//! - `EngineError`: everything the submission/control/query interfaces return

use thiserror::Error;
use uuid::Uuid;

use crate::model::ExecutionStatus;

/// Errors raised while validating a submitted plan.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PlanError {
    #[error("Dependency cycle detected between phases: {}", .cycle.join(" -> "))]
    DependencyCycle { cycle: Vec<String> },

    #[error("Duplicate phase id: {0}")]
    DuplicatePhase(String),

    #[error("Duplicate step id '{step}' (phase '{phase}')")]
    DuplicateStep { phase: String, step: String },

    #[error("Unknown dependency '{dependency}' in phase '{phase}': no phase with that id exists")]
    UnknownDependency { phase: String, dependency: String },

    #[error("Invalid rollback plan: {0}")]
    InvalidRollbackPlan(String),

    #[error("Phase '{phase}' references unknown rollback step '{step}'")]
    UnknownRollbackStep { phase: String, step: String },

    #[error("Invalid plan: {0}")]
    Invalid(String),
}

/// Errors from a single step attempt.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StepError {
    #[error("Step {step_id} in phase {phase_id} failed: {message}")]
    Execution {
        phase_id: String,
        step_id: String,
        message: String,
        output: String,
        retryable: bool,
    },

    #[error("Step {step_id} in phase {phase_id} timed out after {timeout_ms}ms")]
    Timeout {
        phase_id: String,
        step_id: String,
        timeout_ms: u64,
    },
}

impl StepError {
    /// Timeouts are always retryable; execution failures carry the adapter's verdict.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Execution { retryable, .. } => *retryable,
            Self::Timeout { .. } => true,
        }
    }

    /// Raw adapter output captured with the failure, if any.
    pub fn output(&self) -> &str {
        match self {
            Self::Execution { output, .. } => output,
            Self::Timeout { .. } => "",
        }
    }

    pub fn step_id(&self) -> &str {
        match self {
            Self::Execution { step_id, .. } | Self::Timeout { step_id, .. } => step_id,
        }
    }
}

/// A failed or timed-out health sample.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum HealthCheckFailure {
    #[error("Health sample timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Health probe failed: {0}")]
    Probe(String),
}

/// A rollback step (or its verification) failed; the Execution is terminal.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("Rollback step {order} ({step}) failed{}: {message}", verification_suffix(.verification))]
pub struct RollbackFailure {
    pub order: u32,
    pub step: String,
    pub message: String,
    pub output: String,
    pub verification: bool,
}

fn verification_suffix(verification: &bool) -> &'static str {
    if *verification { " verification" } else { "" }
}

/// Errors returned by the engine's public interfaces.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("Execution {0} not found")]
    NotFound(Uuid),

    #[error("Cannot {action} execution in state '{from}'")]
    InvalidTransition {
        from: ExecutionStatus,
        action: &'static str,
    },

    #[error("Execution {0} has no rollback plan attached")]
    NoRollbackPlan(Uuid),

    #[error("Rollback plan can only be attached while the execution is preparing (state '{0}')")]
    RollbackPlanLocked(ExecutionStatus),

    #[error("Issue {0} not found")]
    IssueNotFound(Uuid),

    #[error("Issue {id} cannot move from '{from}' to '{to}'")]
    InvalidIssueTransition { id: Uuid, from: String, to: String },

    #[error("Controller for execution {0} is no longer running")]
    ControllerGone(Uuid),

    #[error("Store error: {0}")]
    Store(#[source] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependency_cycle_lists_the_cycle() {
        let err = PlanError::DependencyCycle {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(
            err.to_string(),
            "Dependency cycle detected between phases: a -> b -> a"
        );
    }

    #[test]
    fn timeout_is_always_retryable() {
        let err = StepError::Timeout {
            phase_id: "p".into(),
            step_id: "s".into(),
            timeout_ms: 10,
        };
        assert!(err.is_retryable());
        assert_eq!(err.output(), "");
        assert_eq!(err.step_id(), "s");
    }

    #[test]
    fn execution_error_carries_adapter_verdict() {
        let err = StepError::Execution {
            phase_id: "p".into(),
            step_id: "s".into(),
            message: "exit 1".into(),
            output: "boom".into(),
            retryable: false,
        };
        assert!(!err.is_retryable());
        assert_eq!(err.output(), "boom");
        assert!(err.to_string().contains("phase p"));
    }

    #[test]
    fn rollback_failure_mentions_verification() {
        let err = RollbackFailure {
            order: 2,
            step: "restore db".into(),
            message: "checksum mismatch".into(),
            output: String::new(),
            verification: true,
        };
        assert_eq!(
            err.to_string(),
            "Rollback step 2 (restore db) failed verification: checksum mismatch"
        );
    }

    #[test]
    fn engine_error_converts_from_plan_error() {
        let err: EngineError = PlanError::DuplicatePhase("x".into()).into();
        assert!(matches!(err, EngineError::Plan(PlanError::DuplicatePhase(_))));
    }

    #[test]
    fn invalid_transition_names_state() {
        let err = EngineError::InvalidTransition {
            from: ExecutionStatus::Completed,
            action: "pause",
        };
        assert_eq!(err.to_string(), "Cannot pause execution in state 'completed'");
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&PlanError::Invalid("x".into()));
        assert_std_error(&HealthCheckFailure::Timeout { timeout_ms: 5 });
        assert_std_error(&EngineError::NotFound(Uuid::nil()));
    }
}
