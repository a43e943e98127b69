//! Issue tracker: anomalies raised by failing steps or the health aggregator.
//!
//! Issues are append-only. Severity is fixed at creation and status only
//! moves forward: `open -> investigating -> {resolved, ignored}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use crate::errors::EngineError;
use crate::model::labeled_enum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Low,
    Medium,
    High,
    Critical,
}

labeled_enum!(IssueSeverity, "issue severity", {
    Low => "low",
    Medium => "medium",
    High => "high",
    Critical => "critical",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    Performance,
    Security,
    Data,
    Connectivity,
    Configuration,
}

labeled_enum!(IssueType, "issue type", {
    Performance => "performance",
    Security => "security",
    Data => "data",
    Connectivity => "connectivity",
    Configuration => "configuration",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    #[default]
    Open,
    Investigating,
    Resolved,
    Ignored,
}

labeled_enum!(IssueStatus, "issue status", {
    Open => "open",
    Investigating => "investigating",
    Resolved => "resolved",
    Ignored => "ignored",
});

impl IssueStatus {
    pub fn can_transition_to(self, next: IssueStatus) -> bool {
        use IssueStatus::*;
        matches!(
            (self, next),
            (Open, Investigating) | (Investigating, Resolved) | (Investigating, Ignored)
        )
    }

    /// Still needs attention.
    pub fn is_unresolved(self) -> bool {
        matches!(self, Self::Open | Self::Investigating)
    }
}

/// A recorded anomaly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub id: Uuid,
    pub severity: IssueSeverity,
    #[serde(rename = "type")]
    pub issue_type: IssueType,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Component that raised it (`controller`, `health`, a step id, ...)
    pub source: String,
    #[serde(default)]
    pub impact: String,
    pub resolution: Option<String>,
    pub status: IssueStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
}

impl Issue {
    pub fn new(
        severity: IssueSeverity,
        issue_type: IssueType,
        title: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            severity,
            issue_type,
            title: title.into(),
            description: String::new(),
            source: source.into(),
            impact: String::new(),
            resolution: None,
            status: IssueStatus::Open,
            created_at: Utc::now(),
            resolved_at: None,
            phase_id: None,
            step_id: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_impact(mut self, impact: impl Into<String>) -> Self {
        self.impact = impact.into();
        self
    }

    pub fn for_step(mut self, phase_id: &str, step_id: &str) -> Self {
        self.phase_id = Some(phase_id.to_string());
        self.step_id = Some(step_id.to_string());
        self
    }

    pub fn is_open_critical(&self) -> bool {
        self.severity == IssueSeverity::Critical && self.status.is_unresolved()
    }
}

/// Append-safe issue collection shared by the controller and the aggregator.
#[derive(Debug, Default)]
pub struct IssueTracker {
    issues: Mutex<Vec<Issue>>,
}

impl IssueTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a tracker with already-recorded issues.
    pub fn with_issues(issues: Vec<Issue>) -> Self {
        Self {
            issues: Mutex::new(issues),
        }
    }

    fn guard(&self) -> MutexGuard<'_, Vec<Issue>> {
        self.issues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a new issue and return a copy of it.
    pub fn raise(&self, issue: Issue) -> Issue {
        self.guard().push(issue.clone());
        issue
    }

    /// Move an issue to a new status, optionally recording resolution text.
    pub fn update(
        &self,
        id: Uuid,
        status: IssueStatus,
        resolution: Option<String>,
    ) -> Result<Issue, EngineError> {
        let mut issues = self.guard();
        let issue = issues
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or(EngineError::IssueNotFound(id))?;

        if !issue.status.can_transition_to(status) {
            return Err(EngineError::InvalidIssueTransition {
                id,
                from: issue.status.to_string(),
                to: status.to_string(),
            });
        }

        issue.status = status;
        if resolution.is_some() {
            issue.resolution = resolution;
        }
        if !status.is_unresolved() {
            issue.resolved_at = Some(Utc::now());
        }
        Ok(issue.clone())
    }

    pub fn get(&self, id: Uuid) -> Option<Issue> {
        self.guard().iter().find(|i| i.id == id).cloned()
    }

    pub fn list(&self) -> Vec<Issue> {
        self.guard().clone()
    }

    /// Issues raised after the first `from`, in raise order.
    pub fn since(&self, from: usize) -> Vec<Issue> {
        self.guard().iter().skip(from).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }

    pub fn has_open_critical(&self) -> bool {
        self.guard().iter().any(Issue::is_open_critical)
    }
}
