//! Submission, control and query interfaces over many Executions.
//!
//! The engine validates plans, creates Executions, spawns one controller per
//! Execution and keeps the handles. Live Executions are answered from the
//! controller's shared state; Executions from an earlier process are read
//! back from the repository and are read-only.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::CutoverToml;
use crate::controller::{ControllerHandle, ExecutionShared, ROLL_BACK, refusal, spawn_controller};
use crate::dag::DagScheduler;
use crate::errors::EngineError;
use crate::events::{ExecutionEvent, ExecutionUpdate, Subscription, UPDATE_CHANNEL_CAPACITY};
use crate::executor::StepExecutor;
use crate::health::{CommandProbe, HealthProbe};
use crate::issues::{Issue, IssueStatus, IssueTracker};
use crate::model::{Execution, ExecutionStatus, Metrics};
use crate::plan::PlanSpec;
use crate::rollback::RollbackPlan;
use crate::store::{ExecutionRepository, ExecutionSummary};

/// Entry point for callers of the engine: the CLI, the HTTP server and tests.
pub struct Engine {
    executor: Arc<dyn StepExecutor>,
    repository: Arc<dyn ExecutionRepository>,
    /// Used when a plan declares no probe of its own
    probe: Option<Arc<dyn HealthProbe>>,
    config: CutoverToml,
    /// Base directory for plan-declared probe commands
    project_dir: PathBuf,
    controllers: Mutex<HashMap<Uuid, ControllerHandle>>,
    updates: broadcast::Sender<ExecutionUpdate>,
}

impl Engine {
    pub fn new(executor: Arc<dyn StepExecutor>, repository: Arc<dyn ExecutionRepository>) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            executor,
            repository,
            probe: None,
            config: CutoverToml::default(),
            project_dir: PathBuf::from("."),
            controllers: Mutex::new(HashMap::new()),
            updates,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_config(mut self, config: CutoverToml) -> Self {
        self.config = config;
        self
    }

    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn repository(&self) -> &Arc<dyn ExecutionRepository> {
        &self.repository
    }

    fn controllers(&self) -> MutexGuard<'_, HashMap<Uuid, ControllerHandle>> {
        self.controllers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn live(&self, id: Uuid) -> Option<ControllerHandle> {
        self.controllers().get(&id).cloned()
    }

    /// Drop handles whose controller has exited. Their final state is in the
    /// repository, which answers for them from now on.
    fn prune(&self) {
        self.controllers().retain(|id, handle| {
            let closed = handle.is_closed();
            if closed {
                debug!(execution_id = %id, "Controller exited, handle released");
            }
            !closed
        });
    }

    /// Live handle for a control command. A stored Execution without a
    /// controller can no longer move, so the command is refused from its
    /// recorded state.
    async fn controlled(
        &self,
        id: Uuid,
        action: &'static str,
    ) -> Result<ControllerHandle, EngineError> {
        if let Some(handle) = self.live(id) {
            return Ok(handle);
        }
        match self.load(id).await? {
            Some(execution) => Err(refusal(&execution, action)),
            None => Err(EngineError::NotFound(id)),
        }
    }

    async fn load(&self, id: Uuid) -> Result<Option<Execution>, EngineError> {
        self.repository.load(id).await.map_err(EngineError::Store)
    }

    fn probe_for(&self, plan: &PlanSpec) -> Option<Arc<dyn HealthProbe>> {
        match &plan.probe {
            Some(spec) => {
                let dir = match &spec.working_dir {
                    Some(dir) if dir.is_absolute() => dir.clone(),
                    Some(dir) => self.project_dir.join(dir),
                    None => self.project_dir.clone(),
                };
                Some(Arc::new(CommandProbe::new(spec.command.clone(), dir)))
            }
            None => self.probe.clone(),
        }
    }

    // ── Submission ────────────────────────────────────────────────────

    /// Validate the plan and create a `preparing` Execution without starting it.
    ///
    /// Nothing is created or stored when validation fails.
    pub async fn prepare(&self, plan: PlanSpec) -> Result<Uuid, EngineError> {
        plan.validate()?;

        let settings = self.config.execution_settings(&plan.settings);
        let execution = Execution::from_plan(&plan, settings);
        let id = execution.id;
        self.repository
            .save(&execution)
            .await
            .map_err(EngineError::Store)?;

        let shared = Arc::new(ExecutionShared::new(execution, self.updates.clone()));
        let handle = spawn_controller(
            shared,
            self.executor.clone(),
            self.probe_for(&plan),
            self.repository.clone(),
        )?;
        self.prune();
        self.controllers().insert(id, handle);

        info!(
            execution_id = %id,
            name = %plan.name,
            phases = plan.phases.len(),
            steps = plan.step_count(),
            "Execution prepared"
        );
        Ok(id)
    }

    /// Prepare and start in one call.
    pub async fn submit(&self, plan: PlanSpec) -> Result<Uuid, EngineError> {
        let id = self.prepare(plan).await?;
        self.start(id).await?;
        Ok(id)
    }

    /// Attach or replace the rollback plan. Only allowed while `preparing`.
    pub async fn attach_rollback_plan(
        &self,
        id: Uuid,
        plan: RollbackPlan,
    ) -> Result<(), EngineError> {
        self.controlled(id, "attach a rollback plan to")
            .await?
            .attach_rollback_plan(plan)
            .await
    }

    // ── Control ───────────────────────────────────────────────────────

    pub async fn start(&self, id: Uuid) -> Result<(), EngineError> {
        self.controlled(id, "start").await?.start().await
    }

    pub async fn pause(&self, id: Uuid) -> Result<(), EngineError> {
        self.controlled(id, "pause").await?.pause().await
    }

    pub async fn resume(&self, id: Uuid) -> Result<(), EngineError> {
        self.controlled(id, "resume").await?.resume().await
    }

    pub async fn request_rollback(&self, id: Uuid) -> Result<(), EngineError> {
        self.controlled(id, ROLL_BACK)
            .await?
            .request_rollback()
            .await
    }

    /// Move an issue forward in its lifecycle.
    pub async fn update_issue(
        &self,
        id: Uuid,
        issue_id: Uuid,
        status: IssueStatus,
        resolution: Option<String>,
    ) -> Result<Issue, EngineError> {
        let issue = match self.live(id) {
            Some(handle) => {
                let shared = handle.shared();
                let issue = shared.issues().update(issue_id, status, resolution)?;
                shared.publisher().publish(ExecutionEvent::IssueUpdated {
                    issue: issue.clone(),
                });
                issue
            }
            None => {
                let execution = self.load(id).await?.ok_or(EngineError::NotFound(id))?;
                IssueTracker::with_issues(execution.issues).update(issue_id, status, resolution)?
            }
        };

        self.repository
            .save_issue(id, &issue)
            .await
            .map_err(EngineError::Store)?;
        info!(execution_id = %id, issue_id = %issue.id, status = %issue.status, "Issue updated");
        Ok(issue)
    }

    // ── Query ─────────────────────────────────────────────────────────

    /// Point-in-time copy of one Execution.
    pub async fn snapshot(&self, id: Uuid) -> Result<Execution, EngineError> {
        if let Some(handle) = self.live(id) {
            return Ok(handle.shared().snapshot());
        }
        self.load(id).await?.ok_or(EngineError::NotFound(id))
    }

    pub async fn status(&self, id: Uuid) -> Result<ExecutionStatus, EngineError> {
        match self.live(id) {
            Some(handle) => Ok(handle.shared().status()),
            None => Ok(self.snapshot(id).await?.status),
        }
    }

    /// Every known Execution, newest first.
    pub async fn list(&self) -> Result<Vec<ExecutionSummary>, EngineError> {
        let mut summaries = self.repository.list().await.map_err(EngineError::Store)?;
        self.prune();
        let controllers = self.controllers();
        for summary in &mut summaries {
            if let Some(handle) = controllers.get(&summary.id) {
                *summary = ExecutionSummary::from(&handle.shared().snapshot());
            }
        }
        Ok(summaries)
    }

    pub async fn issues(&self, id: Uuid) -> Result<Vec<Issue>, EngineError> {
        match self.live(id) {
            Some(handle) => Ok(handle.shared().issues().list()),
            None => Ok(self.snapshot(id).await?.issues),
        }
    }

    /// Retained metrics history, oldest first.
    pub async fn metrics(&self, id: Uuid) -> Result<Vec<Metrics>, EngineError> {
        match self.live(id) {
            Some(handle) => Ok(handle.shared().metrics().history()),
            None => Ok(self.snapshot(id).await?.metrics_history),
        }
    }

    /// Phases grouped into the waves they can run in, ignoring the concurrency limit.
    pub async fn waves(&self, id: Uuid) -> Result<Vec<Vec<String>>, EngineError> {
        Ok(self.scheduler(id).await?.compute_waves())
    }

    pub async fn topological_order(&self, id: Uuid) -> Result<Vec<String>, EngineError> {
        Ok(self.scheduler(id).await?.topological_order())
    }

    async fn scheduler(&self, id: Uuid) -> Result<DagScheduler, EngineError> {
        let execution = self.snapshot(id).await?;
        Ok(DagScheduler::from_phases(
            &execution.phases,
            execution.settings.max_parallel,
        )?)
    }

    /// Feed of incremental updates, for one Execution or all of them.
    pub fn subscribe(&self, execution_id: Option<Uuid>) -> Subscription {
        Subscription::new(self.updates.subscribe(), execution_id)
    }

    /// Raw feed, for surfaces that do their own filtering.
    pub fn updates(&self) -> broadcast::Sender<ExecutionUpdate> {
        self.updates.clone()
    }

    /// Resolve once the Execution is paused or terminal.
    pub async fn wait_settled(&self, id: Uuid) -> Result<ExecutionStatus, EngineError> {
        match self.live(id) {
            Some(handle) => Ok(handle.shared().wait_settled().await),
            None => self.status(id).await,
        }
    }

    #[cfg(test)]
    fn live_count(&self) -> usize {
        self.prune();
        self.controllers().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PlanError;
    use crate::issues::{IssueSeverity, IssueType};
    use crate::plan::{PhaseSpec, ProbeSpec, StepSpec};
    use crate::rollback::RollbackStep;
    use crate::store::{MemoryRepository, SqliteRepository};
    use crate::testing::ScriptedExecutor;
    use std::time::Duration;
    use tempfile::tempdir;

    fn fast_config() -> CutoverToml {
        CutoverToml::parse(
            r#"
            [steps]
            timeout_secs = 5
            retries = 0
            backoff_initial_ms = 5

            [health]
            interval_ms = 20
            timeout_ms = 200
            "#,
        )
        .unwrap()
    }

    fn engine_with(executor: ScriptedExecutor, repo: Arc<dyn ExecutionRepository>) -> Engine {
        Engine::new(Arc::new(executor), repo).with_config(fast_config())
    }

    fn engine() -> Engine {
        engine_with(ScriptedExecutor::new(), Arc::new(MemoryRepository::new()))
    }

    fn plan() -> PlanSpec {
        PlanSpec::new(
            "orders cutover",
            vec![
                PhaseSpec::new("backup", "Backup", vec![])
                    .with_steps(vec![StepSpec::new("dump", "Dump")]),
                PhaseSpec::new("copy", "Copy", vec!["backup".into()])
                    .with_steps(vec![StepSpec::new("load", "Load")]),
                PhaseSpec::new("verify", "Verify", vec!["backup".into()])
                    .with_steps(vec![StepSpec::new("count", "Count")]),
                PhaseSpec::new("switch", "Switch", vec!["copy".into(), "verify".into()])
                    .with_steps(vec![StepSpec::new("dns", "DNS")]),
            ],
        )
    }

    fn rollback() -> RollbackPlan {
        RollbackPlan::new(
            "restore",
            vec![RollbackStep::new("restore", 1, "Restore", "restore.sh")],
        )
    }

    async fn settle(engine: &Engine, id: Uuid) -> ExecutionStatus {
        tokio::time::timeout(Duration::from_secs(10), engine.wait_settled(id))
            .await
            .expect("execution did not settle")
            .unwrap()
    }

    #[tokio::test]
    async fn test_submit_runs_to_completion() {
        let engine = engine();
        let id = engine.submit(plan()).await.unwrap();
        assert_eq!(settle(&engine, id).await, ExecutionStatus::Completed);

        let snapshot = engine.snapshot(id).await.unwrap();
        assert_eq!(snapshot.progress, 100.0);
        assert!(snapshot.completed_at.is_some());

        let listed = engine.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_cycle_is_rejected_and_nothing_is_created() {
        let engine = engine();
        let cyclic = PlanSpec::new(
            "cyclic",
            vec![
                PhaseSpec::new("a", "A", vec!["b".into()]),
                PhaseSpec::new("b", "B", vec!["a".into()]),
            ],
        );
        let err = engine.submit(cyclic).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Plan(PlanError::DependencyCycle { .. })
        ));
        assert!(engine.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_prepare_attach_then_start() {
        let engine = engine();
        let id = engine.prepare(plan()).await.unwrap();
        assert_eq!(engine.status(id).await.unwrap(), ExecutionStatus::Preparing);

        engine.attach_rollback_plan(id, rollback()).await.unwrap();
        engine.start(id).await.unwrap();
        assert_eq!(settle(&engine, id).await, ExecutionStatus::Completed);

        let err = engine.attach_rollback_plan(id, rollback()).await.unwrap_err();
        assert!(matches!(err, EngineError::RollbackPlanLocked(_)));

        // rollback after completion undoes the cutover
        engine.request_rollback(id).await.unwrap();
        assert_eq!(settle(&engine, id).await, ExecutionStatus::RolledBack);
    }

    async fn wait_released(engine: &Engine, expected: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.live_count() > expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("controller handles were not released");
    }

    #[tokio::test]
    async fn test_finished_controllers_are_released() {
        let engine = engine();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let id = engine.submit(plan()).await.unwrap();
            assert_eq!(settle(&engine, id).await, ExecutionStatus::Completed);
            ids.push(id);
        }
        wait_released(&engine, 0).await;

        // reads fall back to the repository
        for id in &ids {
            assert_eq!(engine.status(*id).await.unwrap(), ExecutionStatus::Completed);
            assert_eq!(engine.snapshot(*id).await.unwrap().progress, 100.0);
        }
        assert_eq!(engine.list().await.unwrap().len(), 3);
        let err = engine.request_rollback(ids[0]).await.unwrap_err();
        assert!(matches!(err, EngineError::NoRollbackPlan(_)));
        let err = engine.pause(ids[1]).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidTransition {
                from: ExecutionStatus::Completed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_controller_kept_while_rollback_is_possible() {
        let engine = engine();
        let id = engine.prepare(plan()).await.unwrap();
        engine.attach_rollback_plan(id, rollback()).await.unwrap();
        engine.start(id).await.unwrap();
        assert_eq!(settle(&engine, id).await, ExecutionStatus::Completed);
        assert_eq!(engine.live_count(), 1);

        engine.request_rollback(id).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !engine.status(id).await.unwrap().is_final() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("rollback did not finish");
        wait_released(&engine, 0).await;
        assert_eq!(engine.status(id).await.unwrap(), ExecutionStatus::RolledBack);
    }

    #[tokio::test]
    async fn test_unknown_execution() {
        let engine = engine();
        let id = Uuid::new_v4();
        assert!(matches!(
            engine.pause(id).await,
            Err(EngineError::NotFound(missing)) if missing == id
        ));
        assert!(matches!(
            engine.snapshot(id).await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_waves_and_order() {
        let engine = engine();
        let id = engine.prepare(plan()).await.unwrap();
        assert_eq!(
            engine.waves(id).await.unwrap(),
            vec![
                vec!["backup".to_string()],
                vec!["copy".to_string(), "verify".to_string()],
                vec!["switch".to_string()],
            ]
        );
        let order = engine.topological_order(id).await.unwrap();
        assert_eq!(order.first().map(String::as_str), Some("backup"));
        assert_eq!(order.last().map(String::as_str), Some("switch"));
    }

    #[tokio::test]
    async fn test_subscription_sees_status_changes() {
        let engine = engine();
        let mut feed = engine.subscribe(None);
        let id = engine.submit(plan()).await.unwrap();
        settle(&engine, id).await;

        let mut statuses = Vec::new();
        while let Ok(Some(update)) =
            tokio::time::timeout(Duration::from_millis(200), feed.next()).await
        {
            assert_eq!(update.execution_id, id);
            if let ExecutionEvent::StatusChanged { to, .. } = update.event {
                statuses.push(to);
            }
        }
        assert_eq!(
            statuses,
            vec![ExecutionStatus::Running, ExecutionStatus::Completed]
        );
    }

    #[tokio::test]
    async fn test_issue_lifecycle_through_engine() {
        let engine = engine_with(
            ScriptedExecutor::new().fail_always("count", "row count mismatch", false),
            Arc::new(MemoryRepository::new()),
        );
        let mut failing = plan();
        failing.phases[2].steps[0].config.critical = false;
        let id = engine.submit(failing).await.unwrap();
        assert_eq!(settle(&engine, id).await, ExecutionStatus::Completed);

        let issues = engine.issues(id).await.unwrap();
        assert_eq!(issues.len(), 1);
        let issue_id = issues[0].id;

        let err = engine
            .update_issue(id, issue_id, IssueStatus::Resolved, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidIssueTransition { .. }));

        engine
            .update_issue(id, issue_id, IssueStatus::Investigating, None)
            .await
            .unwrap();
        let resolved = engine
            .update_issue(
                id,
                issue_id,
                IssueStatus::Resolved,
                Some("counts reconciled".into()),
            )
            .await
            .unwrap();
        assert!(resolved.resolved_at.is_some());

        let stored = engine.repository().load(id).await.unwrap().unwrap();
        assert_eq!(stored.issues[0].status, IssueStatus::Resolved);
    }

    #[tokio::test]
    async fn test_stored_execution_is_read_only_after_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cutover.db");

        let id = {
            let repo = Arc::new(SqliteRepository::open(&path).unwrap());
            let engine = engine_with(ScriptedExecutor::new(), repo);
            let id = engine.submit(plan()).await.unwrap();
            settle(&engine, id).await;
            // the final save happens just after the status flips
            tokio::time::sleep(Duration::from_millis(100)).await;
            id
        };

        let repo = Arc::new(SqliteRepository::open(&path).unwrap());
        let engine = engine_with(ScriptedExecutor::new(), repo);
        let snapshot = engine.snapshot(id).await.unwrap();
        assert_eq!(snapshot.status, ExecutionStatus::Completed);
        assert_eq!(snapshot.phases.len(), 4);
        assert_eq!(engine.wait_settled(id).await.unwrap(), ExecutionStatus::Completed);

        let err = engine.pause(id).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidTransition {
                from: ExecutionStatus::Completed,
                ..
            }
        ));

        let issue = Issue::new(IssueSeverity::Low, IssueType::Data, "late", "operator");
        engine.repository().save_issue(id, &issue).await.unwrap();
        let updated = engine
            .update_issue(id, issue.id, IssueStatus::Investigating, None)
            .await
            .unwrap();
        assert_eq!(updated.status, IssueStatus::Investigating);
    }

    #[tokio::test]
    async fn test_plan_probe_collects_metrics() {
        let dir = tempdir().unwrap();
        let mut executor = ScriptedExecutor::new();
        let gate = executor.gate("dump");
        let engine = engine_with(executor, Arc::new(MemoryRepository::new()))
            .with_project_dir(dir.path());

        let mut probed = plan();
        probed.probe = Some(ProbeSpec {
            command: r#"echo '{"performance":{"cpu_percent":12.5}}'"#.into(),
            working_dir: None,
        });
        let id = engine.submit(probed).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while engine.metrics(id).await.unwrap().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "no metrics sampled");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        gate.notify_one();
        assert_eq!(settle(&engine, id).await, ExecutionStatus::Completed);

        let metrics = engine.metrics(id).await.unwrap();
        assert_eq!(metrics[0].performance.cpu_percent, 12.5);
    }
}
