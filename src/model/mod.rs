//! Execution, Phase, Step and log records.
//!
//! These are the shapes the controller mutates, the repository persists and
//! the query interface returns. Only the controller writes them while an
//! Execution is live; everything else sees clones.

mod metrics;
mod status;

pub use metrics::{
    AvailabilityMetrics, HealthState, MetricsSample, Metrics, MigrationMetrics,
    PerformanceMetrics,
};
pub(crate) use status::labeled_enum;
pub use status::{ExecutionStatus, PhaseStatus, RollbackStepStatus, StepStatus};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::config::{ExecutionSettings, ProgressWeighting};
use crate::issues::Issue;
use crate::plan::{PhaseSpec, PlanSpec, StepConfig, StepSpec};
use crate::rollback::{RollbackPlan, RollbackRun};

/// Smallest schedulable action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Set only once the step is done (completed or warning)
    pub duration_ms: Option<u64>,
    /// Attempts made so far, including retries
    #[serde(default)]
    pub attempts: u32,
    pub output: Option<String>,
    pub error: Option<String>,
    pub config: StepConfig,
}

impl Step {
    fn from_spec(spec: &StepSpec) -> Self {
        Self {
            id: spec.id.clone(),
            name: spec.name.clone(),
            description: spec.description.clone(),
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            attempts: 0,
            output: None,
            error: None,
            config: spec.config.clone(),
        }
    }

    /// Move to `to` if the step transition table allows it. An illegal move
    /// is refused and leaves the step untouched.
    pub fn set_status(&mut self, to: StepStatus) -> bool {
        if !self.status.can_transition_to(to) {
            warn!(step = %self.id, from = %self.status, to = %to, "refusing step transition");
            return false;
        }
        self.status = to;
        true
    }
}

/// A dependency-ordered group of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub status: PhaseStatus,
    /// 0..=100, never decreases
    pub progress: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub rollback_steps: Vec<String>,
    pub steps: Vec<Step>,
    pub error: Option<String>,
}

impl Phase {
    fn from_spec(spec: &PhaseSpec) -> Self {
        Self {
            id: spec.id.clone(),
            name: spec.name.clone(),
            description: spec.description.clone(),
            status: PhaseStatus::Pending,
            progress: 0.0,
            started_at: None,
            completed_at: None,
            depends_on: spec.depends_on.clone(),
            rollback_steps: spec.rollback_steps.clone(),
            steps: spec.steps.iter().map(Step::from_spec).collect(),
            error: None,
        }
    }

    /// Move to `to` if the phase transition table allows it. An illegal move
    /// is refused and leaves the phase untouched.
    pub fn set_status(&mut self, to: PhaseStatus) -> bool {
        if !self.status.can_transition_to(to) {
            warn!(phase = %self.id, from = %self.status, to = %to, "refusing phase transition");
            return false;
        }
        self.status = to;
        true
    }

    pub fn done_steps(&self) -> usize {
        self.steps.iter().filter(|s| s.status.is_done()).count()
    }

    /// Index of the first step that still has to run. Completed and warning
    /// steps are never handed out again.
    pub fn next_step_index(&self) -> Option<usize> {
        self.steps.iter().position(|s| !s.status.is_done())
    }

    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == step_id)
    }

    /// Recompute progress from done steps, keeping it monotone and in [0, 100].
    pub fn recompute_progress(&mut self) {
        let raw = if self.steps.is_empty() {
            if self.status == PhaseStatus::Completed {
                100.0
            } else {
                0.0
            }
        } else {
            self.done_steps() as f64 / self.steps.len() as f64 * 100.0
        };
        self.progress = self.progress.max(raw).clamp(0.0, 100.0);
    }
}

/// Severity of an execution log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

labeled_enum!(LogLevel, "log level", {
    Info => "info",
    Warn => "warn",
    Error => "error",
});

/// One line of an Execution's append-only log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub message: String,
}

/// One migration/deployment run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub status: ExecutionStatus,
    /// 0..=100; exactly 100 only when every phase is completed
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub estimated_completion: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub phases: Vec<Phase>,
    pub metrics: Option<Metrics>,
    #[serde(default)]
    pub metrics_history: Vec<Metrics>,
    #[serde(default)]
    pub health: HealthState,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    #[serde(default)]
    pub issues: Vec<Issue>,
    pub rollback_plan: Option<RollbackPlan>,
    pub rollback: Option<RollbackRun>,
    pub settings: ExecutionSettings,
    pub error: Option<String>,
}

impl Execution {
    /// Build a fresh `preparing` Execution from an already validated plan.
    pub fn from_plan(plan: &PlanSpec, settings: ExecutionSettings) -> Self {
        let mut execution = Self {
            id: Uuid::new_v4(),
            name: plan.name.clone(),
            description: plan.description.clone(),
            status: ExecutionStatus::Preparing,
            progress: 0.0,
            created_at: Utc::now(),
            started_at: None,
            estimated_completion: None,
            completed_at: None,
            phases: plan.phases.iter().map(Phase::from_spec).collect(),
            metrics: None,
            metrics_history: Vec::new(),
            health: HealthState::Healthy,
            logs: Vec::new(),
            issues: Vec::new(),
            rollback_plan: plan.rollback.clone(),
            rollback: None,
            settings,
            error: None,
        };
        execution.recompute_progress();
        execution
    }

    pub fn phase(&self, phase_id: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.id == phase_id)
    }

    pub fn phase_mut(&mut self, phase_id: &str) -> Option<&mut Phase> {
        self.phases.iter_mut().find(|p| p.id == phase_id)
    }

    pub fn total_steps(&self) -> usize {
        self.phases.iter().map(|p| p.steps.len()).sum()
    }

    pub fn done_steps(&self) -> usize {
        self.phases.iter().map(Phase::done_steps).sum()
    }

    pub fn all_phases_completed(&self) -> bool {
        self.phases
            .iter()
            .all(|p| p.status == PhaseStatus::Completed)
    }

    /// Recompute overall progress from the phases.
    ///
    /// The value is capped at 99 until every phase is `completed`, so 100
    /// means exactly that.
    pub fn recompute_progress(&mut self) {
        if self.all_phases_completed() {
            self.progress = 100.0;
            return;
        }

        let raw = match self.settings.progress_weighting {
            ProgressWeighting::PhaseEqual => {
                self.phases.iter().map(|p| p.progress).sum::<f64>() / self.phases.len() as f64
            }
            ProgressWeighting::StepCount => {
                let total = self.total_steps();
                if total == 0 {
                    let completed = self
                        .phases
                        .iter()
                        .filter(|p| p.status == PhaseStatus::Completed)
                        .count();
                    completed as f64 / self.phases.len() as f64 * 100.0
                } else {
                    self.done_steps() as f64 / total as f64 * 100.0
                }
            }
        };
        self.progress = raw.clamp(0.0, 99.0);
    }

    /// Linear extrapolation from elapsed time and current progress.
    pub fn update_estimate(&mut self, now: DateTime<Utc>) {
        let Some(started) = self.started_at else {
            return;
        };
        if self.progress <= 0.0 || self.progress >= 100.0 {
            self.estimated_completion = None;
            return;
        }
        let elapsed_ms = (now - started).num_milliseconds().max(0) as f64;
        let total_ms = elapsed_ms * 100.0 / self.progress;
        self.estimated_completion = Some(started + Duration::milliseconds(total_ms as i64));
    }

    /// Append a log line and return it.
    pub fn push_log(
        &mut self,
        level: LogLevel,
        phase_id: Option<&str>,
        step_id: Option<&str>,
        message: impl Into<String>,
    ) -> LogEntry {
        let entry = LogEntry {
            seq: self.logs.len() as u64,
            timestamp: Utc::now(),
            level,
            phase_id: phase_id.map(str::to_string),
            step_id: step_id.map(str::to_string),
            message: message.into(),
        };
        self.logs.push(entry.clone());
        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{PhaseSpec, StepSpec};

    fn plan() -> PlanSpec {
        PlanSpec::new(
            "demo",
            vec![
                PhaseSpec::new("a", "A", vec![]).with_steps(vec![
                    StepSpec::new("s1", "S1"),
                    StepSpec::new("s2", "S2"),
                ]),
                PhaseSpec::new("b", "B", vec!["a".into()])
                    .with_steps(vec![StepSpec::new("s3", "S3")]),
            ],
        )
    }

    #[test]
    fn test_from_plan_starts_preparing() {
        let exec = Execution::from_plan(&plan(), ExecutionSettings::default());
        assert_eq!(exec.status, ExecutionStatus::Preparing);
        assert_eq!(exec.phases.len(), 2);
        assert_eq!(exec.total_steps(), 3);
        assert_eq!(exec.progress, 0.0);
        assert!(exec.phases.iter().all(|p| p.status == PhaseStatus::Pending));
    }

    #[test]
    fn test_phase_progress_is_monotone() {
        let mut exec = Execution::from_plan(&plan(), ExecutionSettings::default());
        let phase = exec.phase_mut("a").unwrap();
        phase.steps[0].status = StepStatus::Completed;
        phase.recompute_progress();
        assert_eq!(phase.progress, 50.0);

        // A step flipping back cannot pull progress down.
        phase.steps[0].status = StepStatus::Running;
        phase.recompute_progress();
        assert_eq!(phase.progress, 50.0);
    }

    #[test]
    fn test_execution_progress_capped_until_all_completed() {
        let mut exec = Execution::from_plan(&plan(), ExecutionSettings::default());
        for phase in &mut exec.phases {
            for step in &mut phase.steps {
                step.status = StepStatus::Completed;
            }
            phase.recompute_progress();
        }
        exec.recompute_progress();
        assert_eq!(exec.progress, 99.0);

        for phase in &mut exec.phases {
            phase.status = PhaseStatus::Completed;
        }
        exec.recompute_progress();
        assert_eq!(exec.progress, 100.0);
    }

    #[test]
    fn test_step_count_weighting() {
        let settings = ExecutionSettings {
            progress_weighting: ProgressWeighting::StepCount,
            ..Default::default()
        };
        let mut exec = Execution::from_plan(&plan(), settings);
        let phase = exec.phase_mut("a").unwrap();
        phase.steps[0].status = StepStatus::Completed;
        phase.recompute_progress();
        exec.recompute_progress();
        // 1 of 3 steps, vs 25% under phase-equal weighting
        assert!((exec.progress - 100.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_next_step_skips_done_steps() {
        let mut exec = Execution::from_plan(&plan(), ExecutionSettings::default());
        let phase = exec.phase_mut("a").unwrap();
        assert_eq!(phase.next_step_index(), Some(0));
        phase.steps[0].status = StepStatus::Warning;
        assert_eq!(phase.next_step_index(), Some(1));
        phase.steps[1].status = StepStatus::Completed;
        assert_eq!(phase.next_step_index(), None);
    }

    #[test]
    fn test_status_setters_follow_transition_tables() {
        let mut exec = Execution::from_plan(&plan(), ExecutionSettings::default());
        let phase = exec.phase_mut("a").unwrap();
        assert!(!phase.set_status(PhaseStatus::Completed));
        assert_eq!(phase.status, PhaseStatus::Pending);
        assert!(phase.set_status(PhaseStatus::Running));
        assert!(phase.set_status(PhaseStatus::Failed));
        // terminal phases stay put
        assert!(!phase.set_status(PhaseStatus::Running));
        assert_eq!(phase.status, PhaseStatus::Failed);

        let step = &mut phase.steps[0];
        assert!(!step.set_status(StepStatus::Warning));
        assert_eq!(step.status, StepStatus::Pending);
        assert!(step.set_status(StepStatus::Running));
        assert!(step.set_status(StepStatus::Completed));
        assert!(!step.set_status(StepStatus::Failed));
        assert_eq!(step.status, StepStatus::Completed);
    }

    #[test]
    fn test_estimate_extrapolates() {
        let mut exec = Execution::from_plan(&plan(), ExecutionSettings::default());
        let start = Utc::now();
        exec.started_at = Some(start);
        exec.progress = 25.0;
        exec.update_estimate(start + Duration::seconds(10));
        assert_eq!(exec.estimated_completion, Some(start + Duration::seconds(40)));
    }

    #[test]
    fn test_log_sequence_numbers() {
        let mut exec = Execution::from_plan(&plan(), ExecutionSettings::default());
        let first = exec.push_log(LogLevel::Info, None, None, "one");
        let second = exec.push_log(LogLevel::Warn, Some("a"), Some("s1"), "two");
        assert_eq!(first.seq, 0);
        assert_eq!(second.seq, 1);
        assert_eq!(exec.logs.len(), 2);
    }
}
