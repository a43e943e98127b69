//! Plan documents: what a caller submits to the engine.
//!
//! A plan is a set of phases (each an ordered list of steps) with dependency
//! edges between phases, an optional rollback plan, and optional per-execution
//! settings. Plans are loaded from YAML or JSON and validated in full before
//! an Execution is created.
//!
//! ```yaml
//! name: orders-db-cutover
//! settings:
//!   max_parallel: 2
//!   issue_policy: fail_fast
//! phases:
//!   - id: snapshot
//!     name: Snapshot source
//!     steps:
//!       - id: dump
//!         name: Dump orders
//!         command: ./scripts/dump.sh
//!         timeout_secs: 600
//!         retries: 2
//!   - id: copy
//!     name: Copy data
//!     depends_on: [snapshot]
//!     rollback_steps: [restore]
//!     steps:
//!       - id: load
//!         name: Load into target
//!         command: ./scripts/load.sh
//! rollback:
//!   name: Restore source of truth
//!   steps:
//!     - id: restore
//!       order: 1
//!       name: Point traffic back
//!       command: ./scripts/restore.sh
//!       verification_command: ./scripts/check.sh
//! ```

mod validate;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::{HealthSection, IssuePolicy, ProgressWeighting, RollbackTrigger};
use crate::rollback::RollbackPlan;

/// Typed configuration handed to the step executor adapter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepConfig {
    /// Command the adapter runs; adapters that don't run commands may ignore it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Free-form parameters passed through to the adapter
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
    /// Per-attempt timeout; falls back to `[steps] timeout_secs`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Retries after the first attempt; falls back to `[steps] retries`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    /// A failed non-critical step becomes a warning and its phase continues
    #[serde(default = "default_critical")]
    pub critical: bool,
}

fn default_critical() -> bool {
    true
}

/// One step as submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(flatten)]
    pub config: StepConfig,
}

impl StepSpec {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: String::new(),
            config: StepConfig {
                critical: true,
                ..Default::default()
            },
        }
    }

    pub fn with_command(mut self, command: &str) -> Self {
        self.config.command = Some(command.to_string());
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.config.retries = Some(retries);
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.config.timeout_secs = Some(secs);
        self
    }

    pub fn non_critical(mut self) -> Self {
        self.config.critical = false;
        self
    }

    pub fn with_param(mut self, key: &str, value: &str) -> Self {
        self.config.params.insert(key.to_string(), value.to_string());
        self
    }
}

/// One phase as submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Phases that must be `completed` before this one starts
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Rollback step ids this phase contributes to the rollback plan
    #[serde(default)]
    pub rollback_steps: Vec<String>,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
}

impl PhaseSpec {
    pub fn new(id: &str, name: &str, depends_on: Vec<String>) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: String::new(),
            depends_on,
            rollback_steps: Vec::new(),
            steps: Vec::new(),
        }
    }

    pub fn with_steps(mut self, steps: Vec<StepSpec>) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_rollback_steps(mut self, ids: Vec<String>) -> Self {
        self.rollback_steps = ids;
        self
    }
}

/// Per-execution overrides of the `[execution]` and `[health]` config sections.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_weighting: Option<ProgressWeighting>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_trigger: Option<RollbackTrigger>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_policy: Option<IssuePolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthSection>,
}

/// Health probe declared by the plan itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeSpec {
    /// Command printing one JSON metrics sample on stdout; non-zero exit is a failed sample
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

/// A complete submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub settings: PlanSettings,
    #[serde(default)]
    pub phases: Vec<PhaseSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackPlan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe: Option<ProbeSpec>,
}

impl PlanSpec {
    pub fn new(name: &str, phases: Vec<PhaseSpec>) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            settings: PlanSettings::default(),
            phases,
            rollback: None,
            probe: None,
        }
    }

    pub fn with_rollback(mut self, plan: RollbackPlan) -> Self {
        self.rollback = Some(plan);
        self
    }

    pub fn with_settings(mut self, settings: PlanSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Load a plan from a `.yaml`/`.yml` or `.json` file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan file: {}", path.display()))?;

        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));

        if is_json {
            Self::from_json(&content)
                .with_context(|| format!("Failed to parse plan file: {}", path.display()))
        } else {
            Self::from_yaml(&content)
                .with_context(|| format!("Failed to parse plan file: {}", path.display()))
        }
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Invalid plan YAML")
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("Invalid plan JSON")
    }

    pub fn step_count(&self) -> usize {
        self.phases.iter().map(|p| p.steps.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const YAML: &str = r#"
name: orders-db-cutover
settings:
  max_parallel: 2
  issue_policy: fail_fast
phases:
  - id: snapshot
    name: Snapshot source
    steps:
      - id: dump
        name: Dump orders
        command: ./dump.sh
        timeout_secs: 600
        retries: 2
      - id: verify
        name: Verify dump
        critical: false
  - id: copy
    name: Copy data
    depends_on: [snapshot]
    rollback_steps: [restore]
    steps:
      - id: load
        name: Load
        command: ./load.sh
        params:
          table: orders
rollback:
  name: Restore
  steps:
    - id: restore
      order: 1
      name: Point traffic back
      command: ./restore.sh
"#;

    #[test]
    fn test_parse_yaml_plan() {
        let plan = PlanSpec::from_yaml(YAML).unwrap();
        assert_eq!(plan.name, "orders-db-cutover");
        assert_eq!(plan.phases.len(), 2);
        assert_eq!(plan.step_count(), 3);
        assert_eq!(plan.settings.max_parallel, Some(2));
        assert_eq!(plan.settings.issue_policy, Some(IssuePolicy::FailFast));

        let dump = &plan.phases[0].steps[0];
        assert_eq!(dump.config.command.as_deref(), Some("./dump.sh"));
        assert_eq!(dump.config.timeout_secs, Some(600));
        assert_eq!(dump.config.retries, Some(2));
        assert!(dump.config.critical);
        assert!(!plan.phases[0].steps[1].config.critical);

        assert_eq!(plan.phases[1].depends_on, vec!["snapshot"]);
        assert_eq!(plan.phases[1].steps[0].config.params["table"], "orders");
        assert_eq!(plan.rollback.as_ref().unwrap().steps.len(), 1);
    }

    #[test]
    fn test_load_by_extension() {
        let dir = tempdir().unwrap();
        let yaml_path = dir.path().join("plan.yaml");
        std::fs::write(&yaml_path, YAML).unwrap();
        let from_yaml = PlanSpec::load(&yaml_path).unwrap();

        let json_path = dir.path().join("plan.json");
        std::fs::write(&json_path, serde_json::to_string(&from_yaml).unwrap()).unwrap();
        let from_json = PlanSpec::load(&json_path).unwrap();

        assert_eq!(from_yaml, from_json);
    }

    #[test]
    fn test_load_missing_file() {
        let err = PlanSpec::load(Path::new("/nonexistent/plan.yaml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read plan file"));
    }

    #[test]
    fn test_builder_helpers() {
        let step = StepSpec::new("s1", "Step")
            .with_command("true")
            .with_retries(3)
            .with_timeout_secs(5)
            .non_critical();
        assert_eq!(step.config.retries, Some(3));
        assert!(!step.config.critical);
    }
}
