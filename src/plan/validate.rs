//! Submission-time validation of plan documents.

use std::collections::HashSet;

use super::PlanSpec;
use crate::dag::DagBuilder;
use crate::errors::PlanError;

impl PlanSpec {
    /// Validate the whole plan. Nothing is created when this fails.
    ///
    /// Checks non-empty ids, unique phase and step ids, known dependencies,
    /// an acyclic dependency graph, the rollback plan, and that every phase's
    /// `rollback_steps` names a step of that plan.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.name.trim().is_empty() {
            return Err(PlanError::Invalid("plan name is empty".into()));
        }

        let mut step_ids = HashSet::new();
        for phase in &self.phases {
            if phase.id.trim().is_empty() {
                return Err(PlanError::Invalid(format!(
                    "phase '{}' has an empty id",
                    phase.name
                )));
            }
            for step in &phase.steps {
                if step.id.trim().is_empty() {
                    return Err(PlanError::Invalid(format!(
                        "step '{}' in phase '{}' has an empty id",
                        step.name, phase.id
                    )));
                }
                if !step_ids.insert(step.id.as_str()) {
                    return Err(PlanError::DuplicateStep {
                        phase: phase.id.clone(),
                        step: step.id.clone(),
                    });
                }
                if step.config.timeout_secs == Some(0) {
                    return Err(PlanError::Invalid(format!(
                        "step '{}' in phase '{}' has a zero timeout",
                        step.id, phase.id
                    )));
                }
            }
        }

        DagBuilder::from_specs(&self.phases).build()?;

        if let Some(max) = self.settings.max_parallel
            && max == 0
        {
            return Err(PlanError::Invalid("settings.max_parallel must be at least 1".into()));
        }

        if let Some(rollback) = &self.rollback {
            rollback.validate()?;
        }

        for phase in &self.phases {
            for step in &phase.rollback_steps {
                let known = self
                    .rollback
                    .as_ref()
                    .is_some_and(|plan| plan.step(step).is_some());
                if !known {
                    return Err(PlanError::UnknownRollbackStep {
                        phase: phase.id.clone(),
                        step: step.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}
