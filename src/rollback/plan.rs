//! Rollback plans and the record of a rollback run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use uuid::Uuid;

use crate::errors::PlanError;
use crate::model::RollbackStepStatus;

/// One step of a rollback plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackStep {
    pub id: String,
    /// Steps run in strictly ascending order
    pub order: u32,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub estimated_minutes: u32,
    pub command: String,
    /// Runs after `command`; a failed verification fails the step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl RollbackStep {
    pub fn new(id: &str, order: u32, name: &str, command: &str) -> Self {
        Self {
            id: id.to_string(),
            order,
            name: name.to_string(),
            description: String::new(),
            estimated_minutes: 0,
            command: command.to_string(),
            verification_command: None,
            working_dir: None,
            timeout_secs: None,
        }
    }

    pub fn with_verification(mut self, command: &str) -> Self {
        self.verification_command = Some(command.to_string());
        self
    }

    pub fn with_estimate(mut self, minutes: u32) -> Self {
        self.estimated_minutes = minutes;
        self
    }
}

/// An ordered recovery procedure attached to an Execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackPlan {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Overall estimate; defaults to the sum of the step estimates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_minutes: Option<u32>,
    pub steps: Vec<RollbackStep>,
    #[serde(default)]
    pub risks: Vec<String>,
    /// References to the data backups the plan relies on
    #[serde(default)]
    pub backups: Vec<String>,
    /// Checks to perform after the rollback completes
    #[serde(default)]
    pub verification_steps: Vec<String>,
}

impl RollbackPlan {
    pub fn new(name: &str, steps: Vec<RollbackStep>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: String::new(),
            estimated_minutes: None,
            steps,
            risks: Vec::new(),
            backups: Vec::new(),
            verification_steps: Vec::new(),
        }
    }

    pub fn step(&self, id: &str) -> Option<&RollbackStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn total_estimated_minutes(&self) -> u32 {
        self.estimated_minutes
            .unwrap_or_else(|| {
                self.steps
                    .iter()
                    .map(|s| s.estimated_minutes)
                    .fold(0u32, u32::saturating_add)
            })
    }

    /// Steps in execution order.
    pub fn ordered_steps(&self) -> Vec<&RollbackStep> {
        let mut steps: Vec<&RollbackStep> = self.steps.iter().collect();
        steps.sort_by_key(|s| s.order);
        steps
    }

    /// A rollback plan is a line, not a graph: ids and orders must be unique,
    /// orders positive, and every command non-empty.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.steps.is_empty() {
            return Err(PlanError::InvalidRollbackPlan(format!(
                "'{}' has no steps",
                self.name
            )));
        }

        let mut ids = HashSet::new();
        let mut orders = HashSet::new();
        for step in &self.steps {
            if step.id.trim().is_empty() {
                return Err(PlanError::InvalidRollbackPlan(format!(
                    "step '{}' has an empty id",
                    step.name
                )));
            }
            if !ids.insert(step.id.as_str()) {
                return Err(PlanError::InvalidRollbackPlan(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
            if step.order == 0 {
                return Err(PlanError::InvalidRollbackPlan(format!(
                    "step '{}' must have an order of at least 1",
                    step.id
                )));
            }
            if !orders.insert(step.order) {
                return Err(PlanError::InvalidRollbackPlan(format!(
                    "order {} is used by more than one step",
                    step.order
                )));
            }
            if step.command.trim().is_empty() {
                return Err(PlanError::InvalidRollbackPlan(format!(
                    "step '{}' has an empty command",
                    step.id
                )));
            }
            if step
                .verification_command
                .as_deref()
                .is_some_and(|c| c.trim().is_empty())
            {
                return Err(PlanError::InvalidRollbackPlan(format!(
                    "step '{}' has an empty verification command",
                    step.id
                )));
            }
            if step.timeout_secs == Some(0) {
                return Err(PlanError::InvalidRollbackPlan(format!(
                    "step '{}' has a zero timeout",
                    step.id
                )));
            }
        }

        Ok(())
    }
}

/// Progress of one rollback step during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackStepRun {
    pub step_id: String,
    pub order: u32,
    pub name: String,
    pub status: RollbackStepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output: Option<String>,
    pub error: Option<String>,
}

/// The record of executing a rollback plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackRun {
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub steps: Vec<RollbackStepRun>,
    pub error: Option<String>,
}

impl RollbackRun {
    pub fn new(plan: &RollbackPlan) -> Self {
        Self {
            started_at: Utc::now(),
            completed_at: None,
            steps: plan
                .ordered_steps()
                .into_iter()
                .map(|s| RollbackStepRun {
                    step_id: s.id.clone(),
                    order: s.order,
                    name: s.name.clone(),
                    status: RollbackStepStatus::Pending,
                    started_at: None,
                    completed_at: None,
                    output: None,
                    error: None,
                })
                .collect(),
            error: None,
        }
    }

    pub fn step_mut(&mut self, order: u32) -> Option<&mut RollbackStepRun> {
        self.steps.iter_mut().find(|s| s.order == order)
    }

    /// Orders of the steps that actually ran, in the order they ran.
    pub fn executed_orders(&self) -> Vec<u32> {
        self.steps
            .iter()
            .filter(|s| s.status != RollbackStepStatus::Pending)
            .map(|s| s.order)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> RollbackPlan {
        RollbackPlan::new(
            "restore",
            vec![
                RollbackStep::new("c", 3, "C", "true").with_estimate(5),
                RollbackStep::new("a", 1, "A", "true").with_estimate(2),
                RollbackStep::new("b", 2, "B", "true").with_verification("true"),
            ],
        )
    }

    #[test]
    fn test_ordered_steps() {
        let plan = plan();
        let orders: Vec<u32> = plan.ordered_steps().iter().map(|s| s.order).collect();
        assert_eq!(orders, vec![1, 2, 3]);
        assert_eq!(plan.total_estimated_minutes(), 7);
    }

    #[test]
    fn test_estimate_saturates() {
        let plan = RollbackPlan::new(
            "huge",
            vec![
                RollbackStep::new("a", 1, "A", "true").with_estimate(u32::MAX),
                RollbackStep::new("b", 2, "B", "true").with_estimate(10),
            ],
        );
        assert_eq!(plan.total_estimated_minutes(), u32::MAX);
    }

    #[test]
    fn test_explicit_estimate_wins() {
        let mut plan = plan();
        plan.estimated_minutes = Some(30);
        assert_eq!(plan.total_estimated_minutes(), 30);
    }

    #[test]
    fn test_validate() {
        plan().validate().unwrap();

        let mut dup_order = plan();
        dup_order.steps[0].order = 1;
        assert!(matches!(
            dup_order.validate(),
            Err(PlanError::InvalidRollbackPlan(msg)) if msg.contains("order 1")
        ));

        let mut zero = plan();
        zero.steps[0].order = 0;
        assert!(zero.validate().is_err());

        let mut empty_cmd = plan();
        empty_cmd.steps[1].command = "  ".into();
        assert!(empty_cmd.validate().is_err());

        let mut empty_verify = plan();
        empty_verify.steps[2].verification_command = Some(String::new());
        assert!(empty_verify.validate().is_err());

        assert!(RollbackPlan::new("none", vec![]).validate().is_err());
    }

    #[test]
    fn test_run_starts_pending_in_order() {
        let run = RollbackRun::new(&plan());
        let ids: Vec<&str> = run.steps.iter().map(|s| s.step_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(run.executed_orders().is_empty());
    }

    #[test]
    fn test_yaml_defaults() {
        let plan: RollbackPlan = serde_yaml::from_str(
            "name: r\nsteps:\n  - id: x\n    order: 1\n    name: X\n    command: 'true'\n",
        )
        .unwrap();
        assert!(plan.risks.is_empty());
        assert!(plan.steps[0].verification_command.is_none());
    }
}
