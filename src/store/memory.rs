use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use super::{ExecutionRepository, ExecutionSummary, Persisted};
use crate::issues::Issue;
use crate::model::{Execution, Metrics};

#[derive(Default)]
struct Records {
    executions: HashMap<Uuid, Execution>,
    metrics: HashMap<Uuid, Vec<Metrics>>,
}

/// Repository that keeps everything in process memory.
#[derive(Default)]
pub struct MemoryRepository {
    records: Mutex<Records>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, Records> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ExecutionRepository for MemoryRepository {
    async fn save(&self, execution: &Execution) -> Result<()> {
        let mut record = execution.clone();
        // history lives in its own table
        record.metrics_history.clear();
        self.guard().executions.insert(execution.id, record);
        Ok(())
    }

    async fn save_changes(&self, changes: &Execution, persisted: Persisted) -> Result<()> {
        let mut records = self.guard();
        let mut record = changes.clone();
        record.metrics_history.clear();
        if let Some(existing) = records.executions.remove(&changes.id) {
            let mut logs = existing.logs;
            logs.truncate(persisted.logs);
            logs.append(&mut record.logs);
            record.logs = logs;

            // issues updated since they were raised are newer in the store
            let mut issues = existing.issues;
            for issue in record.issues.drain(..) {
                if !issues.iter().any(|i| i.id == issue.id) {
                    issues.push(issue);
                }
            }
            record.issues = issues;
        }
        records.executions.insert(changes.id, record);
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<Option<Execution>> {
        let records = self.guard();
        Ok(records.executions.get(&id).map(|execution| {
            let mut execution = execution.clone();
            execution.metrics_history = records.metrics.get(&id).cloned().unwrap_or_default();
            execution
        }))
    }

    async fn list(&self) -> Result<Vec<ExecutionSummary>> {
        let mut summaries: Vec<ExecutionSummary> = self
            .guard()
            .executions
            .values()
            .map(ExecutionSummary::from)
            .collect();
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(summaries)
    }

    async fn append_metrics(&self, execution_id: Uuid, metrics: &Metrics) -> Result<()> {
        self.guard()
            .metrics
            .entry(execution_id)
            .or_default()
            .push(metrics.clone());
        Ok(())
    }

    async fn save_issue(&self, execution_id: Uuid, issue: &Issue) -> Result<()> {
        let mut records = self.guard();
        if let Some(execution) = records.executions.get_mut(&execution_id) {
            match execution.issues.iter_mut().find(|i| i.id == issue.id) {
                Some(existing) => *existing = issue.clone(),
                None => execution.issues.push(issue.clone()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionSettings;
    use crate::issues::{IssueSeverity, IssueStatus, IssueType};
    use crate::model::LogLevel;
    use crate::plan::{PhaseSpec, PlanSpec, StepSpec};
    use chrono::Utc;

    fn execution(name: &str) -> Execution {
        let plan = PlanSpec::new(
            name,
            vec![PhaseSpec::new("a", "A", vec![]).with_steps(vec![StepSpec::new("s1", "S1")])],
        );
        Execution::from_plan(&plan, ExecutionSettings::default())
    }

    #[tokio::test]
    async fn test_save_load_and_list() {
        let repo = MemoryRepository::new();
        let first = execution("first");
        let mut second = execution("second");
        second.created_at = first.created_at + chrono::Duration::seconds(1);

        repo.save(&first).await.unwrap();
        repo.save(&second).await.unwrap();

        assert_eq!(repo.load(first.id).await.unwrap(), Some(first.clone()));
        assert!(repo.load(Uuid::new_v4()).await.unwrap().is_none());

        let names: Vec<_> = repo.list().await.unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["second", "first"]);
    }

    #[tokio::test]
    async fn test_metrics_history_is_appended() {
        let repo = MemoryRepository::new();
        let exec = execution("m");
        repo.save(&exec).await.unwrap();
        let sample = Metrics::from_sample(Default::default(), Utc::now());
        repo.append_metrics(exec.id, &sample).await.unwrap();
        repo.append_metrics(exec.id, &sample).await.unwrap();
        // a later save does not drop history
        repo.save(&exec).await.unwrap();

        let loaded = repo.load(exec.id).await.unwrap().unwrap();
        assert_eq!(loaded.metrics_history.len(), 2);
    }

    #[tokio::test]
    async fn test_save_issue_upserts() {
        let repo = MemoryRepository::new();
        let exec = execution("i");
        repo.save(&exec).await.unwrap();

        let mut issue = Issue::new(IssueSeverity::Low, IssueType::Data, "drift", "health");
        repo.save_issue(exec.id, &issue).await.unwrap();
        issue.status = IssueStatus::Investigating;
        repo.save_issue(exec.id, &issue).await.unwrap();

        let loaded = repo.load(exec.id).await.unwrap().unwrap();
        assert_eq!(loaded.issues.len(), 1);
        assert_eq!(loaded.issues[0].status, IssueStatus::Investigating);
    }

    #[tokio::test]
    async fn test_save_changes_appends_new_entries() {
        let repo = MemoryRepository::new();
        let mut exec = execution("c");
        exec.push_log(LogLevel::Info, None, None, "prepared");
        repo.save(&exec).await.unwrap();

        let mut issue = Issue::new(IssueSeverity::Low, IssueType::Data, "drift", "health");
        issue.status = IssueStatus::Investigating;
        repo.save_issue(exec.id, &issue).await.unwrap();

        let persisted = Persisted { logs: 1, issues: 0 };
        exec.push_log(LogLevel::Info, None, None, "started");
        let mut changes = exec.clone();
        changes.logs.drain(..1);
        changes.issues = vec![Issue::new(IssueSeverity::High, IssueType::Data, "lag", "health")];
        repo.save_changes(&changes, persisted).await.unwrap();

        let loaded = repo.load(exec.id).await.unwrap().unwrap();
        let messages: Vec<_> = loaded.logs.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["prepared", "started"]);
        assert_eq!(loaded.issues.len(), 2);
        // the stored issue keeps its later status
        assert_eq!(loaded.issues[0].status, IssueStatus::Investigating);
    }
}
