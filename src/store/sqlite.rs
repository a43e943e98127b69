use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use super::{ExecutionRepository, ExecutionSummary, Persisted};
use crate::issues::Issue;
use crate::model::{Execution, LogEntry, Metrics, Phase, Step};
use crate::rollback::{RollbackPlan, RollbackRun, RollbackStep};

/// Async-safe handle to the execution database.
///
/// Wraps `SqliteDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<SqliteDb>>,
}

impl DbHandle {
    pub fn new(db: SqliteDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&SqliteDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn opt_ts(dt: &Option<DateTime<Utc>>) -> Option<String> {
    dt.as_ref().map(ts)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp in database: {}", s))?
        .with_timezone(&Utc))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

fn parse_label<T: FromStr<Err = String>>(s: &str) -> Result<T> {
    s.parse().map_err(|e: String| anyhow!(e))
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).context("Failed to encode column as JSON")
}

fn from_json<T: DeserializeOwned>(s: &str) -> Result<T> {
    serde_json::from_str(s).context("Failed to decode JSON column")
}

struct ExecutionRow {
    id: String,
    name: String,
    description: String,
    status: String,
    progress: f64,
    created_at: String,
    started_at: Option<String>,
    estimated_completion: Option<String>,
    completed_at: Option<String>,
    health: String,
    metrics: Option<String>,
    settings: String,
    error: Option<String>,
}

struct PhaseRow {
    id: String,
    name: String,
    description: String,
    status: String,
    progress: f64,
    started_at: Option<String>,
    completed_at: Option<String>,
    depends_on: String,
    rollback_steps: String,
    error: Option<String>,
}

struct StepRow {
    phase_id: String,
    id: String,
    name: String,
    description: String,
    status: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    duration_ms: Option<i64>,
    attempts: i64,
    output: Option<String>,
    error: Option<String>,
    config: String,
}

struct IssueRow {
    id: String,
    severity: String,
    issue_type: String,
    title: String,
    description: String,
    source: String,
    impact: String,
    resolution: Option<String>,
    status: String,
    created_at: String,
    resolved_at: Option<String>,
    phase_id: Option<String>,
    step_id: Option<String>,
}

impl IssueRow {
    fn into_issue(self) -> Result<Issue> {
        Ok(Issue {
            id: Uuid::parse_str(&self.id).context("Invalid issue id")?,
            severity: parse_label(&self.severity)?,
            issue_type: parse_label(&self.issue_type)?,
            title: self.title,
            description: self.description,
            source: self.source,
            impact: self.impact,
            resolution: self.resolution,
            status: parse_label(&self.status)?,
            created_at: parse_ts(&self.created_at)?,
            resolved_at: parse_opt_ts(self.resolved_at)?,
            phase_id: self.phase_id,
            step_id: self.step_id,
        })
    }
}

pub struct SqliteDb {
    conn: Connection,
}

impl SqliteDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory: {}", parent.display())
            })?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS executions (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL DEFAULT 'preparing',
                    progress REAL NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    started_at TEXT,
                    estimated_completion TEXT,
                    completed_at TEXT,
                    health TEXT NOT NULL DEFAULT 'healthy',
                    metrics TEXT,
                    settings TEXT NOT NULL,
                    error TEXT
                );

                CREATE TABLE IF NOT EXISTS phases (
                    execution_id TEXT NOT NULL REFERENCES executions(id) ON DELETE CASCADE,
                    id TEXT NOT NULL,
                    position INTEGER NOT NULL,
                    name TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL DEFAULT 'pending',
                    progress REAL NOT NULL DEFAULT 0,
                    started_at TEXT,
                    completed_at TEXT,
                    depends_on TEXT NOT NULL DEFAULT '[]',
                    rollback_steps TEXT NOT NULL DEFAULT '[]',
                    error TEXT,
                    PRIMARY KEY (execution_id, id)
                );

                CREATE TABLE IF NOT EXISTS steps (
                    execution_id TEXT NOT NULL REFERENCES executions(id) ON DELETE CASCADE,
                    phase_id TEXT NOT NULL,
                    id TEXT NOT NULL,
                    position INTEGER NOT NULL,
                    name TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL DEFAULT 'pending',
                    started_at TEXT,
                    completed_at TEXT,
                    duration_ms INTEGER,
                    attempts INTEGER NOT NULL DEFAULT 0,
                    output TEXT,
                    error TEXT,
                    config TEXT NOT NULL DEFAULT '{}',
                    PRIMARY KEY (execution_id, phase_id, id)
                );

                CREATE TABLE IF NOT EXISTS issues (
                    id TEXT PRIMARY KEY,
                    execution_id TEXT NOT NULL REFERENCES executions(id) ON DELETE CASCADE,
                    severity TEXT NOT NULL,
                    issue_type TEXT NOT NULL,
                    title TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    source TEXT NOT NULL,
                    impact TEXT NOT NULL DEFAULT '',
                    resolution TEXT,
                    status TEXT NOT NULL DEFAULT 'open',
                    created_at TEXT NOT NULL,
                    resolved_at TEXT,
                    phase_id TEXT,
                    step_id TEXT
                );

                CREATE TABLE IF NOT EXISTS rollback_plans (
                    execution_id TEXT PRIMARY KEY REFERENCES executions(id) ON DELETE CASCADE,
                    id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    estimated_minutes INTEGER,
                    risks TEXT NOT NULL DEFAULT '[]',
                    backups TEXT NOT NULL DEFAULT '[]',
                    verification_steps TEXT NOT NULL DEFAULT '[]',
                    run TEXT
                );

                CREATE TABLE IF NOT EXISTS rollback_steps (
                    execution_id TEXT NOT NULL REFERENCES executions(id) ON DELETE CASCADE,
                    id TEXT NOT NULL,
                    step_order INTEGER NOT NULL,
                    name TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    estimated_minutes INTEGER NOT NULL DEFAULT 0,
                    command TEXT NOT NULL,
                    verification_command TEXT,
                    working_dir TEXT,
                    timeout_secs INTEGER,
                    PRIMARY KEY (execution_id, id)
                );

                CREATE TABLE IF NOT EXISTS metrics_samples (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    execution_id TEXT NOT NULL REFERENCES executions(id) ON DELETE CASCADE,
                    sampled_at TEXT NOT NULL,
                    data TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS execution_logs (
                    execution_id TEXT NOT NULL REFERENCES executions(id) ON DELETE CASCADE,
                    seq INTEGER NOT NULL,
                    timestamp TEXT NOT NULL,
                    level TEXT NOT NULL,
                    phase_id TEXT,
                    step_id TEXT,
                    message TEXT NOT NULL,
                    PRIMARY KEY (execution_id, seq)
                );

                CREATE INDEX IF NOT EXISTS idx_executions_created ON executions(created_at);
                CREATE INDEX IF NOT EXISTS idx_issues_execution ON issues(execution_id);
                CREATE INDEX IF NOT EXISTS idx_metrics_execution ON metrics_samples(execution_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Executions ────────────────────────────────────────────────────

    /// Write the record in one transaction. Phases and steps are replaced;
    /// the issues and log lines it carries are upserted, and rows it does
    /// not carry are left alone.
    pub fn save_execution(&self, execution: &Execution) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let id = execution.id.to_string();
        let metrics = execution.metrics.as_ref().map(to_json).transpose()?;

        tx.execute(
            "INSERT INTO executions (id, name, description, status, progress, created_at,
                 started_at, estimated_completion, completed_at, health, metrics, settings, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 description = excluded.description,
                 status = excluded.status,
                 progress = excluded.progress,
                 started_at = excluded.started_at,
                 estimated_completion = excluded.estimated_completion,
                 completed_at = excluded.completed_at,
                 health = excluded.health,
                 metrics = excluded.metrics,
                 settings = excluded.settings,
                 error = excluded.error",
            params![
                id,
                execution.name,
                execution.description,
                execution.status.as_str(),
                execution.progress,
                ts(&execution.created_at),
                opt_ts(&execution.started_at),
                opt_ts(&execution.estimated_completion),
                opt_ts(&execution.completed_at),
                execution.health.to_string(),
                metrics,
                to_json(&execution.settings)?,
                execution.error,
            ],
        )
        .context("Failed to upsert execution")?;

        for (position, phase) in execution.phases.iter().enumerate() {
            tx.execute(
                "INSERT OR REPLACE INTO phases (execution_id, id, position, name, description,
                     status, progress, started_at, completed_at, depends_on, rollback_steps, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    id,
                    phase.id,
                    position as i64,
                    phase.name,
                    phase.description,
                    phase.status.as_str(),
                    phase.progress,
                    opt_ts(&phase.started_at),
                    opt_ts(&phase.completed_at),
                    to_json(&phase.depends_on)?,
                    to_json(&phase.rollback_steps)?,
                    phase.error,
                ],
            )
            .context("Failed to save phase")?;

            for (step_position, step) in phase.steps.iter().enumerate() {
                tx.execute(
                    "INSERT OR REPLACE INTO steps (execution_id, phase_id, id, position, name,
                         description, status, started_at, completed_at, duration_ms, attempts,
                         output, error, config)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                    params![
                        id,
                        phase.id,
                        step.id,
                        step_position as i64,
                        step.name,
                        step.description,
                        step.status.as_str(),
                        opt_ts(&step.started_at),
                        opt_ts(&step.completed_at),
                        step.duration_ms.map(|d| d as i64),
                        step.attempts as i64,
                        step.output,
                        step.error,
                        to_json(&step.config)?,
                    ],
                )
                .context("Failed to save step")?;
            }
        }

        for issue in &execution.issues {
            Self::upsert_issue(&tx, &id, issue)?;
        }

        match &execution.rollback_plan {
            Some(plan) => Self::save_rollback_plan(&tx, &id, plan, execution.rollback.as_ref())?,
            None => {
                tx.execute(
                    "DELETE FROM rollback_plans WHERE execution_id = ?1",
                    params![id],
                )
                .context("Failed to clear rollback plan")?;
            }
        }

        for entry in &execution.logs {
            tx.execute(
                "INSERT OR IGNORE INTO execution_logs (execution_id, seq, timestamp, level,
                     phase_id, step_id, message)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id,
                    entry.seq as i64,
                    ts(&entry.timestamp),
                    entry.level.as_str(),
                    entry.phase_id,
                    entry.step_id,
                    entry.message,
                ],
            )
            .context("Failed to append log entry")?;
        }

        tx.commit().context("Failed to commit execution")?;
        Ok(())
    }

    fn save_rollback_plan(
        conn: &Connection,
        execution_id: &str,
        plan: &RollbackPlan,
        run: Option<&RollbackRun>,
    ) -> Result<()> {
        conn.execute(
            "INSERT OR REPLACE INTO rollback_plans (execution_id, id, name, description,
                 estimated_minutes, risks, backups, verification_steps, run)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                execution_id,
                plan.id.to_string(),
                plan.name,
                plan.description,
                plan.estimated_minutes,
                to_json(&plan.risks)?,
                to_json(&plan.backups)?,
                to_json(&plan.verification_steps)?,
                run.map(to_json).transpose()?,
            ],
        )
        .context("Failed to save rollback plan")?;

        conn.execute(
            "DELETE FROM rollback_steps WHERE execution_id = ?1",
            params![execution_id],
        )
        .context("Failed to clear rollback steps")?;
        for step in &plan.steps {
            conn.execute(
                "INSERT INTO rollback_steps (execution_id, id, step_order, name, description,
                     estimated_minutes, command, verification_command, working_dir, timeout_secs)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    execution_id,
                    step.id,
                    step.order,
                    step.name,
                    step.description,
                    step.estimated_minutes,
                    step.command,
                    step.verification_command,
                    step.working_dir.as_ref().map(|p| p.to_string_lossy().into_owned()),
                    step.timeout_secs.map(|t| t as i64),
                ],
            )
            .context("Failed to save rollback step")?;
        }
        Ok(())
    }

    fn upsert_issue(conn: &Connection, execution_id: &str, issue: &Issue) -> Result<()> {
        conn.execute(
            "INSERT OR REPLACE INTO issues (id, execution_id, severity, issue_type, title,
                 description, source, impact, resolution, status, created_at, resolved_at,
                 phase_id, step_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                issue.id.to_string(),
                execution_id,
                issue.severity.as_str(),
                issue.issue_type.as_str(),
                issue.title,
                issue.description,
                issue.source,
                issue.impact,
                issue.resolution,
                issue.status.as_str(),
                ts(&issue.created_at),
                opt_ts(&issue.resolved_at),
                issue.phase_id,
                issue.step_id,
            ],
        )
        .context("Failed to save issue")?;
        Ok(())
    }

    pub fn save_issue(&self, execution_id: Uuid, issue: &Issue) -> Result<()> {
        Self::upsert_issue(&self.conn, &execution_id.to_string(), issue)
    }

    pub fn append_metrics(&self, execution_id: Uuid, metrics: &Metrics) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO metrics_samples (execution_id, sampled_at, data) VALUES (?1, ?2, ?3)",
                params![execution_id.to_string(), ts(&metrics.sampled_at), to_json(metrics)?],
            )
            .context("Failed to append metrics sample")?;
        Ok(())
    }

    pub fn list_executions(&self) -> Result<Vec<ExecutionSummary>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, status, progress, created_at, started_at, completed_at
                 FROM executions ORDER BY created_at DESC",
            )
            .context("Failed to prepare list_executions")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                ))
            })
            .context("Failed to query executions")?;

        let mut summaries = Vec::new();
        for row in rows {
            let (id, name, status, progress, created_at, started_at, completed_at) =
                row.context("Failed to read execution row")?;
            summaries.push(ExecutionSummary {
                id: Uuid::parse_str(&id).context("Invalid execution id")?,
                name,
                status: parse_label(&status)?,
                progress,
                created_at: parse_ts(&created_at)?,
                started_at: parse_opt_ts(started_at)?,
                completed_at: parse_opt_ts(completed_at)?,
            });
        }
        Ok(summaries)
    }

    pub fn load_execution(&self, id: Uuid) -> Result<Option<Execution>> {
        let key = id.to_string();
        let row = self
            .conn
            .query_row(
                "SELECT id, name, description, status, progress, created_at, started_at,
                     estimated_completion, completed_at, health, metrics, settings, error
                 FROM executions WHERE id = ?1",
                params![key],
                |row| {
                    Ok(ExecutionRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        description: row.get(2)?,
                        status: row.get(3)?,
                        progress: row.get(4)?,
                        created_at: row.get(5)?,
                        started_at: row.get(6)?,
                        estimated_completion: row.get(7)?,
                        completed_at: row.get(8)?,
                        health: row.get(9)?,
                        metrics: row.get(10)?,
                        settings: row.get(11)?,
                        error: row.get(12)?,
                    })
                },
            )
            .optional()
            .context("Failed to query execution")?;
        let Some(row) = row else {
            return Ok(None);
        };

        let mut phases = self.load_phases(&key)?;
        for step in self.load_steps(&key)? {
            let phase_id = step.0;
            if let Some(phase) = phases.iter_mut().find(|p| p.id == phase_id) {
                phase.steps.push(step.1);
            }
        }
        let (rollback_plan, rollback) = self.load_rollback(&key)?;

        Ok(Some(Execution {
            id: Uuid::parse_str(&row.id).context("Invalid execution id")?,
            name: row.name,
            description: row.description,
            status: parse_label(&row.status)?,
            progress: row.progress,
            created_at: parse_ts(&row.created_at)?,
            started_at: parse_opt_ts(row.started_at)?,
            estimated_completion: parse_opt_ts(row.estimated_completion)?,
            completed_at: parse_opt_ts(row.completed_at)?,
            phases,
            metrics: row.metrics.as_deref().map(from_json).transpose()?,
            metrics_history: self.load_metrics(&key)?,
            health: parse_label(&row.health)?,
            logs: self.load_logs(&key)?,
            issues: self.load_issues(&key)?,
            rollback_plan,
            rollback,
            settings: from_json(&row.settings)?,
            error: row.error,
        }))
    }

    fn load_phases(&self, execution_id: &str) -> Result<Vec<Phase>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, description, status, progress, started_at, completed_at,
                     depends_on, rollback_steps, error
                 FROM phases WHERE execution_id = ?1 ORDER BY position",
            )
            .context("Failed to prepare load_phases")?;
        let rows = stmt
            .query_map(params![execution_id], |row| {
                Ok(PhaseRow {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    description: row.get(2)?,
                    status: row.get(3)?,
                    progress: row.get(4)?,
                    started_at: row.get(5)?,
                    completed_at: row.get(6)?,
                    depends_on: row.get(7)?,
                    rollback_steps: row.get(8)?,
                    error: row.get(9)?,
                })
            })
            .context("Failed to query phases")?;

        let mut phases = Vec::new();
        for row in rows {
            let row = row.context("Failed to read phase row")?;
            phases.push(Phase {
                id: row.id,
                name: row.name,
                description: row.description,
                status: parse_label(&row.status)?,
                progress: row.progress,
                started_at: parse_opt_ts(row.started_at)?,
                completed_at: parse_opt_ts(row.completed_at)?,
                depends_on: from_json(&row.depends_on)?,
                rollback_steps: from_json(&row.rollback_steps)?,
                steps: Vec::new(),
                error: row.error,
            });
        }
        Ok(phases)
    }

    /// Steps in plan order, paired with their phase id.
    fn load_steps(&self, execution_id: &str) -> Result<Vec<(String, Step)>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT phase_id, id, name, description, status, started_at, completed_at,
                     duration_ms, attempts, output, error, config
                 FROM steps WHERE execution_id = ?1 ORDER BY phase_id, position",
            )
            .context("Failed to prepare load_steps")?;
        let rows = stmt
            .query_map(params![execution_id], |row| {
                Ok(StepRow {
                    phase_id: row.get(0)?,
                    id: row.get(1)?,
                    name: row.get(2)?,
                    description: row.get(3)?,
                    status: row.get(4)?,
                    started_at: row.get(5)?,
                    completed_at: row.get(6)?,
                    duration_ms: row.get(7)?,
                    attempts: row.get(8)?,
                    output: row.get(9)?,
                    error: row.get(10)?,
                    config: row.get(11)?,
                })
            })
            .context("Failed to query steps")?;

        let mut steps = Vec::new();
        for row in rows {
            let row = row.context("Failed to read step row")?;
            steps.push((
                row.phase_id,
                Step {
                    id: row.id,
                    name: row.name,
                    description: row.description,
                    status: parse_label(&row.status)?,
                    started_at: parse_opt_ts(row.started_at)?,
                    completed_at: parse_opt_ts(row.completed_at)?,
                    duration_ms: row.duration_ms.map(|d| d.max(0) as u64),
                    attempts: row.attempts.max(0) as u32,
                    output: row.output,
                    error: row.error,
                    config: from_json(&row.config)?,
                },
            ));
        }
        Ok(steps)
    }

    fn load_rollback(
        &self,
        execution_id: &str,
    ) -> Result<(Option<RollbackPlan>, Option<RollbackRun>)> {
        let row = self
            .conn
            .query_row(
                "SELECT id, name, description, estimated_minutes, risks, backups,
                     verification_steps, run
                 FROM rollback_plans WHERE execution_id = ?1",
                params![execution_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<u32>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, Option<String>>(7)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query rollback plan")?;
        let Some((id, name, description, estimated_minutes, risks, backups, verification, run)) =
            row
        else {
            return Ok((None, None));
        };

        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, step_order, name, description, estimated_minutes, command,
                     verification_command, working_dir, timeout_secs
                 FROM rollback_steps WHERE execution_id = ?1 ORDER BY step_order",
            )
            .context("Failed to prepare rollback steps query")?;
        let rows = stmt
            .query_map(params![execution_id], |row| {
                Ok(RollbackStep {
                    id: row.get(0)?,
                    order: row.get(1)?,
                    name: row.get(2)?,
                    description: row.get(3)?,
                    estimated_minutes: row.get(4)?,
                    command: row.get(5)?,
                    verification_command: row.get(6)?,
                    working_dir: row.get::<_, Option<String>>(7)?.map(Into::into),
                    timeout_secs: row.get::<_, Option<i64>>(8)?.map(|t| t.max(0) as u64),
                })
            })
            .context("Failed to query rollback steps")?;
        let mut steps = Vec::new();
        for row in rows {
            steps.push(row.context("Failed to read rollback step row")?);
        }

        let plan = RollbackPlan {
            id: Uuid::parse_str(&id).context("Invalid rollback plan id")?,
            name,
            description,
            estimated_minutes,
            steps,
            risks: from_json(&risks)?,
            backups: from_json(&backups)?,
            verification_steps: from_json(&verification)?,
        };
        let run = run.as_deref().map(from_json).transpose()?;
        Ok((Some(plan), run))
    }

    fn load_issues(&self, execution_id: &str) -> Result<Vec<Issue>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, severity, issue_type, title, description, source, impact,
                     resolution, status, created_at, resolved_at, phase_id, step_id
                 FROM issues WHERE execution_id = ?1 ORDER BY created_at, rowid",
            )
            .context("Failed to prepare load_issues")?;
        let rows = stmt
            .query_map(params![execution_id], |row| {
                Ok(IssueRow {
                    id: row.get(0)?,
                    severity: row.get(1)?,
                    issue_type: row.get(2)?,
                    title: row.get(3)?,
                    description: row.get(4)?,
                    source: row.get(5)?,
                    impact: row.get(6)?,
                    resolution: row.get(7)?,
                    status: row.get(8)?,
                    created_at: row.get(9)?,
                    resolved_at: row.get(10)?,
                    phase_id: row.get(11)?,
                    step_id: row.get(12)?,
                })
            })
            .context("Failed to query issues")?;
        let mut issues = Vec::new();
        for row in rows {
            issues.push(row.context("Failed to read issue row")?.into_issue()?);
        }
        Ok(issues)
    }

    fn load_metrics(&self, execution_id: &str) -> Result<Vec<Metrics>> {
        let mut stmt = self
            .conn
            .prepare("SELECT data FROM metrics_samples WHERE execution_id = ?1 ORDER BY id")
            .context("Failed to prepare load_metrics")?;
        let rows = stmt
            .query_map(params![execution_id], |row| row.get::<_, String>(0))
            .context("Failed to query metrics")?;
        let mut samples = Vec::new();
        for row in rows {
            samples.push(from_json(&row.context("Failed to read metrics row")?)?);
        }
        Ok(samples)
    }

    fn load_logs(&self, execution_id: &str) -> Result<Vec<LogEntry>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT seq, timestamp, level, phase_id, step_id, message
                 FROM execution_logs WHERE execution_id = ?1 ORDER BY seq",
            )
            .context("Failed to prepare load_logs")?;
        let rows = stmt
            .query_map(params![execution_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .context("Failed to query logs")?;
        let mut logs = Vec::new();
        for row in rows {
            let (seq, timestamp, level, phase_id, step_id, message) =
                row.context("Failed to read log row")?;
            logs.push(LogEntry {
                seq: seq.max(0) as u64,
                timestamp: parse_ts(&timestamp)?,
                level: parse_label(&level)?,
                phase_id,
                step_id,
                message,
            });
        }
        Ok(logs)
    }
}

/// `ExecutionRepository` backed by SQLite.
#[derive(Clone)]
pub struct SqliteRepository {
    db: DbHandle,
}

impl SqliteRepository {
    pub fn new(db: SqliteDb) -> Self {
        Self {
            db: DbHandle::new(db),
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(SqliteDb::new(path)?))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(SqliteDb::new_in_memory()?))
    }
}

#[async_trait]
impl ExecutionRepository for SqliteRepository {
    async fn save(&self, execution: &Execution) -> Result<()> {
        let execution = execution.clone();
        self.db.call(move |db| db.save_execution(&execution)).await
    }

    async fn save_changes(&self, changes: &Execution, _persisted: Persisted) -> Result<()> {
        // rows are keyed, so writing the unseen tail is enough
        self.save(changes).await
    }

    async fn load(&self, id: Uuid) -> Result<Option<Execution>> {
        self.db.call(move |db| db.load_execution(id)).await
    }

    async fn list(&self) -> Result<Vec<ExecutionSummary>> {
        self.db.call(|db| db.list_executions()).await
    }

    async fn append_metrics(&self, execution_id: Uuid, metrics: &Metrics) -> Result<()> {
        let metrics = metrics.clone();
        self.db
            .call(move |db| db.append_metrics(execution_id, &metrics))
            .await
    }

    async fn save_issue(&self, execution_id: Uuid, issue: &Issue) -> Result<()> {
        let issue = issue.clone();
        self.db
            .call(move |db| db.save_issue(execution_id, &issue))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionSettings;
    use crate::issues::{IssueSeverity, IssueStatus, IssueType};
    use crate::model::{ExecutionStatus, LogLevel, MetricsSample, PhaseStatus, StepStatus};
    use crate::plan::{PhaseSpec, PlanSpec, StepSpec};
    use tempfile::tempdir;

    fn execution() -> Execution {
        let plan = PlanSpec::new(
            "orders-db cutover",
            vec![
                PhaseSpec::new("backup", "Backup", vec![])
                    .with_steps(vec![
                        StepSpec::new("snapshot", "Snapshot").with_command("pg_dump"),
                        StepSpec::new("verify", "Verify").non_critical(),
                    ])
                    .with_rollback_steps(vec!["r1".into()]),
                PhaseSpec::new("migrate", "Migrate", vec!["backup".into()])
                    .with_steps(vec![StepSpec::new("copy", "Copy").with_retries(4)]),
            ],
        )
        .with_rollback(RollbackPlan::new(
            "restore",
            vec![RollbackStep::new("r1", 1, "Restore", "pg_restore").with_verification("check")],
        ));
        Execution::from_plan(&plan, ExecutionSettings::default())
    }

    #[test]
    fn test_create_database_and_run_migrations() -> Result<()> {
        let db = SqliteDb::new_in_memory()?;
        let table_count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN
                ('executions', 'phases', 'steps', 'issues', 'rollback_plans',
                 'rollback_steps', 'metrics_samples', 'execution_logs')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(table_count, 8);

        // migrations are idempotent
        db.run_migrations()?;
        Ok(())
    }

    #[test]
    fn test_execution_round_trips() -> Result<()> {
        let db = SqliteDb::new_in_memory()?;
        let mut exec = execution();
        exec.status = ExecutionStatus::Running;
        exec.started_at = Some(Utc::now());
        exec.phases[0].status = PhaseStatus::Running;
        exec.phases[0].steps[0].status = StepStatus::Completed;
        exec.phases[0].steps[0].output = Some("dumped 42 tables".into());
        exec.phases[0].steps[0].attempts = 2;
        exec.phases[0].recompute_progress();
        exec.recompute_progress();
        exec.push_log(LogLevel::Info, Some("backup"), Some("snapshot"), "Step completed");
        exec.issues.push(Issue::new(
            IssueSeverity::Medium,
            IssueType::Performance,
            "Slow dump",
            "health",
        ));
        exec.rollback = Some(RollbackRun::new(exec.rollback_plan.as_ref().unwrap()));

        db.save_execution(&exec)?;
        let loaded = db.load_execution(exec.id)?.expect("execution should exist");
        assert_eq!(loaded, exec);
        Ok(())
    }

    #[test]
    fn test_save_is_an_upsert() -> Result<()> {
        let db = SqliteDb::new_in_memory()?;
        let mut exec = execution();
        db.save_execution(&exec)?;
        exec.push_log(LogLevel::Info, None, None, "started");
        db.save_execution(&exec)?;

        exec.status = ExecutionStatus::Completed;
        exec.progress = 100.0;
        exec.push_log(LogLevel::Info, None, None, "done");
        db.save_execution(&exec)?;

        let loaded = db.load_execution(exec.id)?.unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Completed);
        assert_eq!(loaded.logs.len(), 2);
        assert_eq!(db.list_executions()?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_missing_execution_is_none() -> Result<()> {
        let db = SqliteDb::new_in_memory()?;
        assert!(db.load_execution(Uuid::new_v4())?.is_none());
        Ok(())
    }

    #[test]
    fn test_metrics_and_issue_updates() -> Result<()> {
        let db = SqliteDb::new_in_memory()?;
        let exec = execution();
        db.save_execution(&exec)?;

        let mut sample = MetricsSample::default();
        sample.performance.cpu_percent = 55.0;
        db.append_metrics(exec.id, &Metrics::from_sample(sample, Utc::now()))?;

        let mut issue = Issue::new(IssueSeverity::High, IssueType::Data, "Row drift", "health");
        db.save_issue(exec.id, &issue)?;
        issue.status = IssueStatus::Investigating;
        db.save_issue(exec.id, &issue)?;

        let loaded = db.load_execution(exec.id)?.unwrap();
        assert_eq!(loaded.metrics_history.len(), 1);
        assert_eq!(loaded.metrics_history[0].performance.cpu_percent, 55.0);
        assert_eq!(loaded.issues.len(), 1);
        assert_eq!(loaded.issues[0].status, IssueStatus::Investigating);
        Ok(())
    }

    #[tokio::test]
    async fn test_save_changes_writes_only_the_tail() -> Result<()> {
        let repo = SqliteRepository::in_memory()?;
        let mut exec = execution();
        exec.push_log(LogLevel::Info, None, None, "prepared");
        repo.save(&exec).await?;

        let persisted = Persisted::of(&exec);
        exec.status = ExecutionStatus::Running;
        exec.push_log(LogLevel::Info, None, None, "started");
        let mut changes = exec.clone();
        changes.logs.drain(..persisted.logs);
        repo.save_changes(&changes, persisted).await?;

        let loaded = repo.load(exec.id).await?.expect("execution should exist");
        assert_eq!(loaded.status, ExecutionStatus::Running);
        assert_eq!(loaded.logs, exec.logs);
        Ok(())
    }

    #[tokio::test]
    async fn test_repository_on_disk() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("nested").join("cutover.db");
        let exec = execution();
        {
            let repo = SqliteRepository::open(&path)?;
            repo.save(&exec).await?;
        }

        let repo = SqliteRepository::open(&path)?;
        let listed = repo.list().await?;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "orders-db cutover");
        assert_eq!(repo.load(exec.id).await?, Some(exec));
        Ok(())
    }
}
