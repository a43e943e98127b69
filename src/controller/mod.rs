//! The Execution Controller.
//!
//! One controller task owns each live Execution. It is the only writer of the
//! Execution record: operator commands arrive over an mpsc channel with a
//! oneshot reply, and step tasks, the health aggregator and the rollback
//! executor report back over a second channel. Events are applied one at a
//! time, so every transition is validated against the current state.
//!
//! Stops (pause, failure, rollback while running) never interrupt an attempt
//! that is already with the adapter. Dispatch stops at once and the stop
//! takes effect when the last in-flight step reports back.

mod worker;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

use chrono::Utc;
use futures_util::FutureExt;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{error, info, warn};
use uuid::Uuid;

pub(crate) use worker::{StepEvent, StepJob};

use crate::config::{ExecutionSettings, IssuePolicy, RollbackTrigger};
use crate::dag::{DagScheduler, PhaseIndex};
use crate::errors::{EngineError, PlanError, RollbackFailure, StepError};
use crate::events::{EventPublisher, ExecutionEvent, ExecutionUpdate};
use crate::executor::{StepDescriptor, StepExecutor, duration_ms};
use crate::health::{HealthAggregator, HealthProbe, HealthSignal, MetricsStore};
use crate::issues::{Issue, IssueSeverity, IssueTracker, IssueType};
use crate::model::{
    Execution, ExecutionStatus, HealthState, LogLevel, PhaseStatus, RollbackStepStatus, Step,
    StepStatus,
};
use crate::rollback::{RollbackExecutor, RollbackPlan, RollbackProgress, RollbackRun, RollbackStepRun};
use crate::store::{ExecutionRepository, Persisted};

const COMMAND_CHANNEL_CAPACITY: usize = 32;
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// State of one Execution shared between its controller and readers.
pub struct ExecutionShared {
    id: Uuid,
    execution: RwLock<Execution>,
    issues: Arc<IssueTracker>,
    metrics: Arc<MetricsStore>,
    publisher: EventPublisher,
    status: watch::Sender<ExecutionStatus>,
}

impl ExecutionShared {
    pub fn new(execution: Execution, updates: broadcast::Sender<ExecutionUpdate>) -> Self {
        let issues = Arc::new(IssueTracker::with_issues(execution.issues.clone()));
        let metrics = Arc::new(MetricsStore::new(execution.settings.health.history_len));
        for sample in &execution.metrics_history {
            metrics.record(sample.clone());
        }
        let (status, _) = watch::channel(execution.status);
        Self {
            id: execution.id,
            publisher: EventPublisher::new(execution.id, updates),
            execution: RwLock::new(execution),
            issues,
            metrics,
            status,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn status(&self) -> ExecutionStatus {
        self.read().status
    }

    pub fn issues(&self) -> &Arc<IssueTracker> {
        &self.issues
    }

    pub fn metrics(&self) -> &Arc<MetricsStore> {
        &self.metrics
    }

    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    /// A consistent copy of the Execution with its issues and metrics merged in.
    pub fn snapshot(&self) -> Execution {
        let mut execution = self.read().clone();
        execution.issues = self.issues.list();
        execution.metrics_history = self.metrics.history();
        if let Some(latest) = self.metrics.latest() {
            execution.metrics = Some(latest);
        }
        execution
    }

    pub fn watch_status(&self) -> watch::Receiver<ExecutionStatus> {
        self.status.subscribe()
    }

    /// Wait until the Execution is paused or terminal and that state is saved.
    pub async fn wait_settled(&self) -> ExecutionStatus {
        let mut rx = self.status.subscribe();
        match rx.wait_for(|status| status.is_settled()).await {
            Ok(status) => *status,
            Err(_) => self.status(),
        }
    }

    /// The record carrying only the log lines and issues past `persisted`,
    /// with the counts that will be stored once it is saved.
    fn changes_since(&self, persisted: Persisted) -> (Execution, Persisted) {
        let issues = self.issues.since(persisted.issues);
        let latest = self.metrics.latest();
        self.update(|e| {
            let logs = std::mem::take(&mut e.logs);
            let mut changes = e.clone();
            changes.logs = logs
                .get(persisted.logs..)
                .map(<[_]>::to_vec)
                .unwrap_or_default();
            e.logs = logs;

            let stored = Persisted {
                logs: e.logs.len(),
                issues: persisted.issues + issues.len(),
            };
            changes.issues = issues;
            if latest.is_some() {
                changes.metrics = latest;
            }
            (changes, stored)
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, Execution> {
        self.execution.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn update<R>(&self, f: impl FnOnce(&mut Execution) -> R) -> R {
        let mut execution = self.execution.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut execution)
    }
}

type Reply = oneshot::Sender<Result<(), EngineError>>;

enum Command {
    Start(Reply),
    Pause(Reply),
    Resume(Reply),
    Rollback(Reply),
    AttachRollbackPlan(RollbackPlan, Reply),
}

/// Handle used by the engine to drive one controller.
#[derive(Clone)]
pub struct ControllerHandle {
    shared: Arc<ExecutionShared>,
    commands: mpsc::Sender<Command>,
}

impl ControllerHandle {
    pub fn shared(&self) -> &Arc<ExecutionShared> {
        &self.shared
    }

    pub async fn start(&self) -> Result<(), EngineError> {
        self.request("start", Command::Start).await
    }

    pub async fn pause(&self) -> Result<(), EngineError> {
        self.request("pause", Command::Pause).await
    }

    pub async fn resume(&self) -> Result<(), EngineError> {
        self.request("resume", Command::Resume).await
    }

    pub async fn request_rollback(&self) -> Result<(), EngineError> {
        self.request(ROLL_BACK, Command::Rollback).await
    }

    pub async fn attach_rollback_plan(&self, plan: RollbackPlan) -> Result<(), EngineError> {
        let status = self.shared.status();
        if status != ExecutionStatus::Preparing {
            return Err(EngineError::RollbackPlanLocked(status));
        }
        self.request("attach a rollback plan to", |reply| {
            Command::AttachRollbackPlan(plan, reply)
        })
        .await
    }

    async fn request(
        &self,
        action: &'static str,
        command: impl FnOnce(Reply) -> Command,
    ) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(command(tx)).await.is_err() {
            return Err(self.gone(action));
        }
        rx.await.unwrap_or_else(|_| Err(self.gone(action)))
    }

    /// The controller has exited and no longer takes commands.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// A controller exits once its Execution can no longer move; commands
    /// then fail the way they would have against the stored state.
    fn gone(&self, action: &'static str) -> EngineError {
        let execution = self.shared.read();
        if execution.status.is_terminal() {
            refusal(&execution, action)
        } else {
            EngineError::ControllerGone(self.shared.id)
        }
    }
}

pub(crate) const ROLL_BACK: &str = "roll back";

/// Error for a command against an Execution that has no controller left.
pub(crate) fn refusal(execution: &Execution, action: &'static str) -> EngineError {
    if action == ROLL_BACK
        && execution.rollback_plan.is_none()
        && execution.status.can_transition_to(ExecutionStatus::RollingBack)
    {
        return EngineError::NoRollbackPlan(execution.id);
    }
    EngineError::InvalidTransition {
        from: execution.status,
        action,
    }
}

/// No command can move the Execution any further.
fn exhausted(execution: &Execution) -> bool {
    execution.status.is_final()
        || (execution.status.is_terminal() && execution.rollback_plan.is_none())
}

/// Spawn the controller task for a `preparing` Execution.
pub fn spawn_controller(
    shared: Arc<ExecutionShared>,
    executor: Arc<dyn StepExecutor>,
    probe: Option<Arc<dyn HealthProbe>>,
    repository: Arc<dyn ExecutionRepository>,
) -> Result<ControllerHandle, PlanError> {
    let (settings, scheduler, persisted) = {
        let execution = shared.read();
        (
            execution.settings.clone(),
            DagScheduler::from_phases(&execution.phases, execution.settings.max_parallel),
            Persisted::of(&execution),
        )
    };
    let scheduler = scheduler?;

    let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

    let controller = Controller {
        shared: shared.clone(),
        executor,
        probe,
        repository,
        scheduler,
        settings,
        commands: command_rx,
        commands_open: true,
        events_tx,
        events_rx,
        in_flight: HashMap::new(),
        stop: None,
        health: None,
        persisted,
    };
    tokio::spawn(controller.run());

    Ok(ControllerHandle {
        shared,
        commands: command_tx,
    })
}

/// Everything that reports back to the controller.
enum Event {
    Step(StepEvent),
    Health(HealthSignal),
    Rollback(RollbackProgress),
}

impl From<StepEvent> for Event {
    fn from(event: StepEvent) -> Self {
        Self::Step(event)
    }
}

impl From<HealthSignal> for Event {
    fn from(signal: HealthSignal) -> Self {
        Self::Health(signal)
    }
}

impl From<RollbackProgress> for Event {
    fn from(progress: RollbackProgress) -> Self {
        Self::Rollback(progress)
    }
}

/// A stop waiting for in-flight steps to drain.
#[derive(Debug, Clone, PartialEq)]
enum Stop {
    Pause,
    Fail(String),
    Rollback,
}

impl Stop {
    fn rank(&self) -> u8 {
        match self {
            Self::Pause => 0,
            Self::Fail(_) => 1,
            Self::Rollback => 2,
        }
    }
}

struct Controller {
    shared: Arc<ExecutionShared>,
    executor: Arc<dyn StepExecutor>,
    probe: Option<Arc<dyn HealthProbe>>,
    repository: Arc<dyn ExecutionRepository>,
    scheduler: DagScheduler,
    settings: ExecutionSettings,
    commands: mpsc::Receiver<Command>,
    commands_open: bool,
    events_tx: mpsc::Sender<Event>,
    events_rx: mpsc::Receiver<Event>,
    /// Phase id -> step currently with the adapter; at most one per phase
    in_flight: HashMap<String, String>,
    stop: Option<Stop>,
    /// Shutdown handle for the running health aggregator
    health: Option<oneshot::Sender<()>>,
    /// What the repository already holds of the append-only lists
    persisted: Persisted,
}

impl Controller {
    async fn run(mut self) {
        info!(execution_id = %self.shared.id, "controller started");
        loop {
            tokio::select! {
                command = self.commands.recv(), if self.commands_open => match command {
                    Some(command) => self.handle_command(command).await,
                    None => self.commands_open = false,
                },
                Some(event) = self.events_rx.recv() => {
                    self.handle_event(event).await;
                    self.persist().await;
                }
            }
            if self.finished() {
                break;
            }
        }
        self.stop_health();
        info!(execution_id = %self.shared.id, status = %self.status(), "controller stopped");
    }

    fn finished(&self) -> bool {
        if exhausted(&self.shared.read()) {
            return true;
        }
        let status = self.status();
        // Nobody can drive this Execution any further.
        !self.commands_open
            && self.in_flight.is_empty()
            && (status.is_settled() || status == ExecutionStatus::Preparing)
    }

    /// Save what changed, then announce the status to `watch_status` receivers.
    async fn persist(&mut self) {
        let (changes, stored) = self.shared.changes_since(self.persisted);
        match self.repository.save_changes(&changes, self.persisted).await {
            Ok(()) => self.persisted = stored,
            Err(err) => {
                warn!(execution_id = %self.shared.id, error = %format!("{:#}", err), "failed to persist execution");
            }
        }
        self.shared.status.send_if_modified(|status| {
            let changed = *status != changes.status;
            *status = changes.status;
            changed
        });
    }

    fn status(&self) -> ExecutionStatus {
        self.shared.status()
    }

    // ── commands ────────────────────────────────────────────────────────

    /// Apply a command and save it before replying. A refused command
    /// changes nothing and is not saved.
    async fn handle_command(&mut self, command: Command) {
        let (result, reply) = match command {
            Command::Start(reply) => (self.start(), reply),
            Command::Pause(reply) => (self.pause(), reply),
            Command::Resume(reply) => (self.resume(), reply),
            Command::Rollback(reply) => (self.request_rollback(), reply),
            Command::AttachRollbackPlan(plan, reply) => (self.attach_rollback_plan(plan), reply),
        };
        if result.is_ok() {
            self.persist().await;
        }
        let _ = reply.send(result);
    }

    fn start(&mut self) -> Result<(), EngineError> {
        let from = self.status();
        if from != ExecutionStatus::Preparing {
            return Err(EngineError::InvalidTransition {
                from,
                action: "start",
            });
        }

        let phases = self.scheduler.phase_count();
        self.shared.update(|e| e.started_at = Some(Utc::now()));
        self.log(
            LogLevel::Info,
            None,
            None,
            format!("Execution started with {} phases", phases),
        );
        self.transition(ExecutionStatus::Running);
        self.start_health();
        self.dispatch();
        Ok(())
    }

    fn pause(&mut self) -> Result<(), EngineError> {
        match self.status() {
            ExecutionStatus::Running => {
                if self.stop.is_none() {
                    self.log(LogLevel::Info, None, None, "Pause requested");
                    self.request_stop(Stop::Pause);
                }
                Ok(())
            }
            from => Err(EngineError::InvalidTransition {
                from,
                action: "pause",
            }),
        }
    }

    fn resume(&mut self) -> Result<(), EngineError> {
        match (self.status(), &self.stop) {
            (ExecutionStatus::Paused, _) => {
                self.log(LogLevel::Info, None, None, "Execution resumed");
                self.transition(ExecutionStatus::Running);
                self.dispatch();
                Ok(())
            }
            (ExecutionStatus::Running, Some(Stop::Pause)) => {
                self.stop = None;
                self.log(LogLevel::Info, None, None, "Pause cancelled");
                self.dispatch();
                Ok(())
            }
            (from, _) => Err(EngineError::InvalidTransition {
                from,
                action: "resume",
            }),
        }
    }

    fn request_rollback(&mut self) -> Result<(), EngineError> {
        let from = self.status();
        if !matches!(
            from,
            ExecutionStatus::Running
                | ExecutionStatus::Paused
                | ExecutionStatus::Completed
                | ExecutionStatus::Failed
        ) {
            return Err(EngineError::InvalidTransition {
                from,
                action: ROLL_BACK,
            });
        }
        if self.shared.read().rollback_plan.is_none() {
            return Err(EngineError::NoRollbackPlan(self.shared.id));
        }

        warn!(execution_id = %self.shared.id, from = %from, "rollback requested");
        self.log(LogLevel::Warn, None, None, "Rollback requested");
        if from.is_terminal() {
            self.begin_rollback();
        } else {
            self.request_stop(Stop::Rollback);
        }
        Ok(())
    }

    fn attach_rollback_plan(&mut self, plan: RollbackPlan) -> Result<(), EngineError> {
        let status = self.status();
        if status != ExecutionStatus::Preparing {
            return Err(EngineError::RollbackPlanLocked(status));
        }
        plan.validate()?;

        let unknown = self
            .shared
            .read()
            .phases
            .iter()
            .flat_map(|p| p.rollback_steps.iter().map(move |s| (p, s)))
            .find(|(_, step)| plan.step(step).is_none())
            .map(|(p, s)| (p.id.clone(), s.clone()));
        if let Some((phase, step)) = unknown {
            return Err(PlanError::UnknownRollbackStep { phase, step }.into());
        }

        let message = format!(
            "Rollback plan '{}' attached ({} steps)",
            plan.name,
            plan.steps.len()
        );
        self.shared.update(|e| e.rollback_plan = Some(plan));
        self.log(LogLevel::Info, None, None, message);
        Ok(())
    }

    // ── scheduling ──────────────────────────────────────────────────────

    /// Hand out work until every running phase has a step in flight and no
    /// free slot can take a ready phase.
    fn dispatch(&mut self) {
        if self.status() != ExecutionStatus::Running || self.stop.is_some() {
            self.settle();
            return;
        }

        loop {
            let mut progressed = false;
            for idx in 0..self.scheduler.phase_count() {
                if self.scheduler.status(idx) == PhaseStatus::Running
                    && !self.in_flight.contains_key(self.scheduler.phase_id(idx))
                {
                    progressed |= self.advance_phase(idx);
                }
            }
            for idx in self.scheduler.next_batch() {
                self.start_phase(idx);
                self.advance_phase(idx);
                progressed = true;
            }
            if !progressed {
                break;
            }
        }

        self.settle();
    }

    fn start_phase(&mut self, idx: PhaseIndex) {
        self.scheduler.mark_running(idx);
        let phase_id = self.scheduler.phase_id(idx).to_string();
        let now = Utc::now();
        self.shared.update(|e| {
            if let Some(phase) = e.phase_mut(&phase_id)
                && phase.set_status(PhaseStatus::Running)
            {
                phase.started_at = Some(now);
            }
        });
        info!(execution_id = %self.shared.id, phase = %phase_id, "phase started");
        self.publish(ExecutionEvent::PhaseStarted {
            phase_id: phase_id.clone(),
        });
        self.log(LogLevel::Info, Some(&phase_id), None, "Phase started");
    }

    /// Launch the phase's next step, or complete the phase when none is left.
    /// Returns true when the phase completed.
    fn advance_phase(&mut self, idx: PhaseIndex) -> bool {
        let phase_id = self.scheduler.phase_id(idx).to_string();
        let next = self
            .shared
            .read()
            .phase(&phase_id)
            .and_then(|p| p.next_step_index().map(|i| p.steps[i].clone()));

        match next {
            Some(step) => {
                self.launch_step(&phase_id, step);
                false
            }
            None => {
                self.complete_phase(idx);
                true
            }
        }
    }

    fn launch_step(&mut self, phase_id: &str, step: Step) {
        let job = StepJob {
            executor: self.executor.clone(),
            descriptor: StepDescriptor {
                execution_id: self.shared.id,
                phase_id: phase_id.to_string(),
                step_id: step.id.clone(),
                name: step.name.clone(),
                attempt: 1,
                timeout: self.settings.step_timeout(step.config.timeout_secs),
                config: step.config.clone(),
            },
            retries: self.settings.step_retries(step.config.retries),
            backoff: self.settings.steps.clone(),
        };
        self.in_flight.insert(phase_id.to_string(), step.id);
        job.spawn(self.events_tx.clone());
    }

    fn complete_phase(&mut self, idx: PhaseIndex) {
        self.scheduler.mark_completed(idx);
        let phase_id = self.scheduler.phase_id(idx).to_string();
        let now = Utc::now();
        let (duration, phase_progress, progress) = self.shared.update(|e| {
            let mut duration = 0;
            if let Some(phase) = e.phase_mut(&phase_id)
                && phase.set_status(PhaseStatus::Completed)
            {
                phase.completed_at = Some(now);
                phase.recompute_progress();
                duration = phase
                    .started_at
                    .map(|s| (now - s).num_milliseconds().max(0) as u64)
                    .unwrap_or(0);
            }
            e.recompute_progress();
            e.update_estimate(now);
            (duration, e.phase(&phase_id).map(|p| p.progress), e.progress)
        });

        info!(execution_id = %self.shared.id, phase = %phase_id, duration_ms = duration, "phase completed");
        self.publish(ExecutionEvent::PhaseCompleted {
            phase_id: phase_id.clone(),
            duration_ms: duration,
        });
        self.publish(ExecutionEvent::Progress {
            progress,
            phase_id: Some(phase_id.clone()),
            phase_progress,
        });
        self.log(
            LogLevel::Info,
            Some(&phase_id),
            None,
            format!("Phase completed in {}ms", duration),
        );
    }

    fn fail_phase(&mut self, phase_id: &str, message: &str) {
        let Some(idx) = self.scheduler.index_of(phase_id) else {
            return;
        };
        let skipped = self.scheduler.mark_failed(idx);
        let now = Utc::now();
        self.shared.update(|e| {
            if let Some(phase) = e.phase_mut(phase_id)
                && phase.set_status(PhaseStatus::Failed)
            {
                phase.completed_at = Some(now);
                phase.error = Some(message.to_string());
            }
        });
        error!(execution_id = %self.shared.id, phase = %phase_id, error = %message, "phase failed");
        self.publish(ExecutionEvent::PhaseFailed {
            phase_id: phase_id.to_string(),
            error: message.to_string(),
        });
        self.log(
            LogLevel::Error,
            Some(phase_id),
            None,
            format!("Phase failed: {}", message),
        );

        for dependent in skipped {
            let dependent_id = self.scheduler.phase_id(dependent).to_string();
            let reason = format!("dependency '{}' failed", phase_id);
            self.shared.update(|e| {
                if let Some(phase) = e.phase_mut(&dependent_id) {
                    phase.set_status(PhaseStatus::Skipped);
                }
            });
            self.publish(ExecutionEvent::PhaseSkipped {
                phase_id: dependent_id.clone(),
                reason: reason.clone(),
            });
            self.log(
                LogLevel::Warn,
                Some(&dependent_id),
                None,
                format!("Phase skipped: {}", reason),
            );
        }

        self.request_stop(Stop::Fail(format!(
            "Phase '{}' failed: {}",
            phase_id, message
        )));
    }

    fn halt_unfinished(&mut self) {
        let now = Utc::now();
        for idx in self.scheduler.halt_unfinished() {
            let phase_id = self.scheduler.phase_id(idx).to_string();
            self.shared.update(|e| {
                if let Some(phase) = e.phase_mut(&phase_id)
                    && phase.set_status(PhaseStatus::Halted)
                {
                    phase.completed_at = Some(now);
                }
            });
            self.publish(ExecutionEvent::PhaseHalted {
                phase_id: phase_id.clone(),
            });
            self.log(LogLevel::Warn, Some(&phase_id), None, "Phase halted");
        }
    }

    // ── stopping ────────────────────────────────────────────────────────

    fn request_stop(&mut self, stop: Stop) {
        let replace = self
            .stop
            .as_ref()
            .is_none_or(|current| stop.rank() > current.rank());
        if replace {
            self.stop = Some(stop);
        }
        self.settle();
    }

    /// Apply a pending stop, or finish the run, once nothing is in flight.
    fn settle(&mut self) {
        if !self.in_flight.is_empty() || !self.status().is_active() {
            return;
        }

        if let Some(stop) = self.stop.take() {
            match stop {
                Stop::Pause => {
                    if self.status() == ExecutionStatus::Running {
                        self.log(LogLevel::Info, None, None, "Execution paused");
                        self.transition(ExecutionStatus::Paused);
                    }
                }
                Stop::Fail(reason) => self.fail(reason),
                Stop::Rollback => {
                    self.halt_unfinished();
                    self.begin_rollback();
                }
            }
            return;
        }

        if self.status() == ExecutionStatus::Running && self.scheduler.all_complete() {
            if self.scheduler.all_success() {
                self.complete();
            } else {
                self.fail("Not every phase completed".to_string());
            }
        }
    }

    fn complete(&mut self) {
        let now = Utc::now();
        self.shared.update(|e| {
            e.completed_at = Some(now);
            e.estimated_completion = None;
            e.recompute_progress();
        });
        info!(execution_id = %self.shared.id, "execution completed");
        self.log(LogLevel::Info, None, None, "Execution completed");
        self.stop_health();
        self.transition(ExecutionStatus::Completed);
    }

    /// Halt what is left and fail the Execution. Progress stays where it was.
    fn fail(&mut self, reason: String) {
        self.halt_unfinished();
        let now = Utc::now();
        self.shared.update(|e| {
            e.error = Some(reason.clone());
            e.completed_at = Some(now);
            e.estimated_completion = None;
        });
        error!(execution_id = %self.shared.id, error = %reason, "execution failed");
        self.log(
            LogLevel::Error,
            None,
            None,
            format!("Execution failed: {}", reason),
        );

        let automatic = self.settings.rollback_trigger == RollbackTrigger::Automatic
            && self.shared.read().rollback_plan.is_some();
        if !automatic {
            self.stop_health();
        }
        self.transition(ExecutionStatus::Failed);
        if automatic {
            self.log(LogLevel::Warn, None, None, "Automatic rollback triggered");
            self.begin_rollback();
        }
    }

    // ── rollback ────────────────────────────────────────────────────────

    fn begin_rollback(&mut self) {
        let Some(plan) = self.shared.read().rollback_plan.clone() else {
            return;
        };
        if !self.status().can_transition_to(ExecutionStatus::RollingBack) {
            return;
        }

        self.shared.update(|e| e.rollback = Some(RollbackRun::new(&plan)));
        warn!(
            execution_id = %self.shared.id,
            plan = %plan.name,
            steps = plan.steps.len(),
            "rollback started"
        );
        self.log(
            LogLevel::Warn,
            None,
            None,
            format!(
                "Rolling back with plan '{}' ({} steps)",
                plan.name,
                plan.steps.len()
            ),
        );
        self.transition(ExecutionStatus::RollingBack);
        self.publish(ExecutionEvent::RollbackStarted {
            plan_id: plan.id,
            steps: plan.steps.len(),
        });
        self.start_health();

        let runner = RollbackExecutor::new(
            self.executor.clone(),
            self.shared.id,
            self.settings.step_timeout(None),
        );
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let run = AssertUnwindSafe(runner.run(&plan, &events)).catch_unwind().await;
            if run.is_err() {
                let failure = RollbackFailure {
                    order: 0,
                    step: plan.name.clone(),
                    message: "rollback task panicked".to_string(),
                    output: String::new(),
                    verification: false,
                };
                let _ = events.send(RollbackProgress::Finished(Err(failure)).into()).await;
            }
        });
    }

    fn update_rollback_step(&self, order: u32, f: impl FnOnce(&mut RollbackStepRun)) {
        self.shared.update(|e| {
            if let Some(step) = e.rollback.as_mut().and_then(|run| run.step_mut(order)) {
                f(step);
            }
        });
    }

    fn on_rollback_progress(&mut self, progress: RollbackProgress) {
        let now = Utc::now();
        match progress {
            RollbackProgress::StepStarted { order, step_id } => {
                self.update_rollback_step(order, |step| {
                    step.status = RollbackStepStatus::Running;
                    step.started_at = Some(now);
                });
                self.log(
                    LogLevel::Info,
                    None,
                    Some(&step_id),
                    format!("Rollback step {} started", order),
                );
                self.publish(ExecutionEvent::RollbackStepStarted { order, step_id });
            }
            RollbackProgress::Verifying { order, step_id } => {
                self.update_rollback_step(order, |step| {
                    step.status = RollbackStepStatus::Verifying;
                });
                self.publish(ExecutionEvent::RollbackStepVerifying { order, step_id });
            }
            RollbackProgress::StepCompleted {
                order,
                step_id,
                output,
            } => {
                self.update_rollback_step(order, |step| {
                    step.status = RollbackStepStatus::Completed;
                    step.completed_at = Some(now);
                    step.output = Some(output);
                });
                self.log(
                    LogLevel::Info,
                    None,
                    Some(&step_id),
                    format!("Rollback step {} completed", order),
                );
                self.publish(ExecutionEvent::RollbackStepCompleted { order, step_id });
            }
            RollbackProgress::StepFailed(failure) => {
                let message = failure.to_string();
                self.update_rollback_step(failure.order, |step| {
                    step.status = RollbackStepStatus::Failed;
                    step.completed_at = Some(now);
                    step.error = Some(failure.message.clone());
                    if !failure.output.is_empty() {
                        step.output = Some(failure.output.clone());
                    }
                });
                self.log(LogLevel::Error, None, None, message.clone());
                self.publish(ExecutionEvent::RollbackStepFailed {
                    order: failure.order,
                    error: message,
                });
            }
            RollbackProgress::Finished(Ok(())) => {
                self.shared.update(|e| {
                    if let Some(run) = e.rollback.as_mut() {
                        run.completed_at = Some(now);
                    }
                    e.completed_at = Some(now);
                });
                info!(execution_id = %self.shared.id, "rollback completed");
                self.log(LogLevel::Info, None, None, "Rollback completed");
                self.stop_health();
                self.transition(ExecutionStatus::RolledBack);
            }
            RollbackProgress::Finished(Err(failure)) => {
                let message = failure.to_string();
                self.shared.update(|e| {
                    if let Some(run) = e.rollback.as_mut() {
                        run.completed_at = Some(now);
                        run.error = Some(message.clone());
                    }
                    e.error = Some(message.clone());
                    e.completed_at = Some(now);
                });
                error!(execution_id = %self.shared.id, error = %message, "rollback failed");
                self.raise_issue(
                    Issue::new(
                        IssueSeverity::Critical,
                        IssueType::Data,
                        "Rollback failed",
                        "rollback",
                    )
                    .with_description(message)
                    .with_impact("System may be left partially rolled back; manual intervention required"),
                );
                self.stop_health();
                self.transition(ExecutionStatus::RollbackFailed);
            }
        }
    }

    // ── events ──────────────────────────────────────────────────────────

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Step(event) => self.on_step_event(event),
            Event::Health(signal) => self.on_health_signal(signal).await,
            Event::Rollback(progress) => self.on_rollback_progress(progress),
        }
    }

    fn on_step_event(&mut self, event: StepEvent) {
        match event {
            StepEvent::Attempt {
                phase_id,
                step_id,
                attempt,
            } => {
                let now = Utc::now();
                self.shared.update(|e| {
                    if let Some(step) = e.phase_mut(&phase_id).and_then(|p| p.step_mut(&step_id)) {
                        // later attempts find the step already running
                        if step.status == StepStatus::Pending
                            && step.set_status(StepStatus::Running)
                        {
                            step.started_at = Some(now);
                        }
                        step.attempts = attempt;
                    }
                });
                if attempt == 1 {
                    self.log(LogLevel::Info, Some(&phase_id), Some(&step_id), "Step started");
                }
                self.publish(ExecutionEvent::StepStarted {
                    phase_id,
                    step_id,
                    attempt,
                });
            }
            StepEvent::Retrying {
                phase_id,
                step_id,
                attempt,
                delay,
                error,
            } => {
                let message = error.to_string();
                self.shared.update(|e| {
                    if let Some(step) = e.phase_mut(&phase_id).and_then(|p| p.step_mut(&step_id)) {
                        step.error = Some(message.clone());
                    }
                });
                let delay_ms = duration_ms(delay);
                self.log(
                    LogLevel::Warn,
                    Some(&phase_id),
                    Some(&step_id),
                    format!(
                        "Attempt {} failed, retrying in {}ms: {}",
                        attempt, delay_ms, message
                    ),
                );
                self.publish(ExecutionEvent::StepRetrying {
                    phase_id,
                    step_id,
                    attempt,
                    delay_ms,
                    error: message,
                });
            }
            StepEvent::Finished {
                phase_id,
                step_id,
                attempts,
                duration,
                result,
            } => {
                self.in_flight.remove(&phase_id);
                match result {
                    Ok(output) => {
                        self.step_completed(&phase_id, &step_id, attempts, duration_ms(duration), output)
                    }
                    Err(error) => self.step_failed(&phase_id, &step_id, attempts, duration_ms(duration), error),
                }
                self.dispatch();
            }
        }
    }

    fn step_completed(
        &mut self,
        phase_id: &str,
        step_id: &str,
        attempts: u32,
        duration_ms: u64,
        output: String,
    ) {
        let now = Utc::now();
        let (phase_progress, progress) = self.shared.update(|e| {
            if let Some(phase) = e.phase_mut(phase_id) {
                if let Some(step) = phase.step_mut(step_id)
                    && step.set_status(StepStatus::Completed)
                {
                    step.completed_at = Some(now);
                    step.duration_ms = Some(duration_ms);
                    step.attempts = attempts;
                    step.output = Some(output.clone());
                    step.error = None;
                }
                phase.recompute_progress();
            }
            e.recompute_progress();
            e.update_estimate(now);
            (e.phase(phase_id).map(|p| p.progress), e.progress)
        });

        info!(
            execution_id = %self.shared.id,
            phase = %phase_id,
            step = %step_id,
            attempts,
            duration_ms,
            "step completed"
        );
        self.log(
            LogLevel::Info,
            Some(phase_id),
            Some(step_id),
            format!("Step completed in {}ms", duration_ms),
        );
        self.publish(ExecutionEvent::StepCompleted {
            phase_id: phase_id.to_string(),
            step_id: step_id.to_string(),
            duration_ms,
            output,
        });
        self.publish(ExecutionEvent::Progress {
            progress,
            phase_id: Some(phase_id.to_string()),
            phase_progress,
        });
    }

    fn step_failed(
        &mut self,
        phase_id: &str,
        step_id: &str,
        attempts: u32,
        duration_ms: u64,
        error: StepError,
    ) {
        let critical = self
            .shared
            .read()
            .phase(phase_id)
            .and_then(|p| p.step(step_id))
            .is_none_or(|s| s.config.critical);
        let message = error.to_string();
        let output = error.output().to_string();
        let issue_type = match error {
            StepError::Timeout { .. } => IssueType::Performance,
            StepError::Execution { .. } => IssueType::Configuration,
        };
        let now = Utc::now();

        let progress = self.shared.update(|e| {
            if let Some(phase) = e.phase_mut(phase_id) {
                let to = if critical {
                    StepStatus::Failed
                } else {
                    StepStatus::Warning
                };
                if let Some(step) = phase.step_mut(step_id)
                    && step.set_status(to)
                {
                    step.completed_at = Some(now);
                    step.attempts = attempts;
                    step.error = Some(message.clone());
                    if !output.is_empty() {
                        step.output = Some(output.clone());
                    }
                    if !critical {
                        step.duration_ms = Some(duration_ms);
                    }
                }
                if !critical {
                    phase.recompute_progress();
                }
            }
            if !critical {
                e.recompute_progress();
                e.update_estimate(now);
            }
            e.progress
        });

        if critical {
            error!(
                execution_id = %self.shared.id,
                phase = %phase_id,
                step = %step_id,
                attempts,
                error = %message,
                "step failed"
            );
            self.log(
                LogLevel::Error,
                Some(phase_id),
                Some(step_id),
                format!("Step failed after {} attempts: {}", attempts, message),
            );
            self.publish(ExecutionEvent::StepFailed {
                phase_id: phase_id.to_string(),
                step_id: step_id.to_string(),
                error: message.clone(),
                output,
            });
            self.raise_issue(
                Issue::new(
                    IssueSeverity::High,
                    issue_type,
                    format!("Step '{}' failed", step_id),
                    step_id,
                )
                .for_step(phase_id, step_id)
                .with_description(message.clone())
                .with_impact(format!(
                    "Phase '{}' failed; phases that depend on it will not run",
                    phase_id
                )),
            );
            self.fail_phase(phase_id, &message);
        } else {
            warn!(
                execution_id = %self.shared.id,
                phase = %phase_id,
                step = %step_id,
                error = %message,
                "non-critical step failed"
            );
            self.log(
                LogLevel::Warn,
                Some(phase_id),
                Some(step_id),
                format!("Non-critical step failed, continuing: {}", message),
            );
            self.publish(ExecutionEvent::StepWarning {
                phase_id: phase_id.to_string(),
                step_id: step_id.to_string(),
                error: message.clone(),
            });
            self.raise_issue(
                Issue::new(
                    IssueSeverity::Medium,
                    issue_type,
                    format!("Non-critical step '{}' failed", step_id),
                    step_id,
                )
                .for_step(phase_id, step_id)
                .with_description(message)
                .with_impact("Phase continued without this step"),
            );
            self.publish(ExecutionEvent::Progress {
                progress,
                phase_id: Some(phase_id.to_string()),
                phase_progress: self.shared.read().phase(phase_id).map(|p| p.progress),
            });
        }
    }

    // ── health and issues ───────────────────────────────────────────────

    fn start_health(&mut self) {
        if self.health.is_some() {
            return;
        }
        let Some(probe) = self.probe.clone() else {
            return;
        };
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        HealthAggregator::new(
            self.shared.id,
            probe,
            self.settings.health.clone(),
            self.shared.metrics.clone(),
            self.shared.issues.clone(),
            self.events_tx.clone(),
        )
        .spawn(shutdown_rx);
        self.health = Some(shutdown_tx);
    }

    fn stop_health(&mut self) {
        if let Some(shutdown) = self.health.take() {
            let _ = shutdown.send(());
        }
    }

    async fn on_health_signal(&mut self, signal: HealthSignal) {
        match signal {
            HealthSignal::Sampled(metrics) => {
                self.shared.update(|e| e.metrics = Some(metrics.clone()));
                if let Err(err) = self.repository.append_metrics(self.shared.id, &metrics).await {
                    warn!(execution_id = %self.shared.id, error = %format!("{:#}", err), "failed to persist metrics");
                }
                self.publish(ExecutionEvent::MetricsSampled { metrics });
            }
            HealthSignal::SampleFailed {
                failure,
                consecutive_failures,
            } => {
                self.log(
                    LogLevel::Warn,
                    None,
                    None,
                    format!(
                        "Health sample failed ({} in a row): {}",
                        consecutive_failures, failure
                    ),
                );
            }
            HealthSignal::Changed { from, to } => {
                self.shared.update(|e| e.health = to);
                let level = match to {
                    HealthState::Healthy => LogLevel::Info,
                    HealthState::Degraded => LogLevel::Warn,
                    HealthState::Unhealthy => LogLevel::Error,
                };
                self.log(level, None, None, format!("Health changed: {} -> {}", from, to));
                self.publish(ExecutionEvent::HealthChanged { from, to });

                if to == HealthState::Unhealthy
                    && self.settings.health.fatal_on_unhealthy
                    && self.status().is_active()
                {
                    self.request_stop(Stop::Fail(
                        "System under migration is unhealthy".to_string(),
                    ));
                }
            }
            HealthSignal::IssueRaised(issue) => {
                self.publish(ExecutionEvent::IssueRaised { issue });
                self.apply_issue_policy();
            }
        }
    }

    fn raise_issue(&mut self, issue: Issue) {
        let issue = self.shared.issues.raise(issue);
        self.publish(ExecutionEvent::IssueRaised { issue });
        self.apply_issue_policy();
    }

    fn apply_issue_policy(&mut self) {
        if self.settings.issue_policy == IssuePolicy::FailFast
            && self.status().is_active()
            && self.shared.issues.has_open_critical()
        {
            self.request_stop(Stop::Fail(
                "Critical issue open under fail_fast policy".to_string(),
            ));
        }
    }

    // ── helpers ─────────────────────────────────────────────────────────

    fn transition(&mut self, to: ExecutionStatus) -> bool {
        let from = self.status();
        if !from.can_transition_to(to) {
            warn!(execution_id = %self.shared.id, from = %from, to = %to, "refusing status transition");
            return false;
        }
        self.shared.update(|e| e.status = to);
        info!(execution_id = %self.shared.id, from = %from, to = %to, "execution status changed");
        self.publish(ExecutionEvent::StatusChanged { from, to });
        true
    }

    fn publish(&self, event: ExecutionEvent) {
        self.shared.publisher.publish(event);
    }

    fn log(
        &self,
        level: LogLevel,
        phase_id: Option<&str>,
        step_id: Option<&str>,
        message: impl Into<String>,
    ) {
        let entry = self
            .shared
            .update(|e| e.push_log(level, phase_id, step_id, message));
        self.publish(ExecutionEvent::Log { entry });
    }
}
