//! Persistence of Executions, their issues and metrics history.
//!
//! The engine saves the full Execution record when it is created. After
//! that the controller saves the record after every applied change, passing
//! only the log lines and issues the store has not seen yet. Loading a record
//! back reproduces the snapshot the query interface returned.

mod memory;
mod sqlite;

pub use memory::MemoryRepository;
pub use sqlite::{DbHandle, SqliteDb, SqliteRepository};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::issues::Issue;
use crate::model::{Execution, ExecutionStatus, Metrics};

/// One row of the execution history listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub id: Uuid,
    pub name: String,
    pub status: ExecutionStatus,
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Execution> for ExecutionSummary {
    fn from(execution: &Execution) -> Self {
        Self {
            id: execution.id,
            name: execution.name.clone(),
            status: execution.status,
            progress: execution.progress,
            created_at: execution.created_at,
            started_at: execution.started_at,
            completed_at: execution.completed_at,
        }
    }
}

/// How many entries of an Execution's append-only lists are already stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Persisted {
    pub logs: usize,
    pub issues: usize,
}

impl Persisted {
    pub fn of(execution: &Execution) -> Self {
        Self {
            logs: execution.logs.len(),
            issues: execution.issues.len(),
        }
    }
}

/// Storage backend for Execution records.
#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    /// Insert or replace the whole record.
    async fn save(&self, execution: &Execution) -> Result<()>;

    /// Update a stored record. `changes.logs` and `changes.issues` hold only
    /// the entries after the first `persisted` ones, which are already stored.
    async fn save_changes(&self, changes: &Execution, persisted: Persisted) -> Result<()>;

    async fn load(&self, id: Uuid) -> Result<Option<Execution>>;

    /// All known Executions, newest first.
    async fn list(&self) -> Result<Vec<ExecutionSummary>>;

    /// Append one sample to the metrics history.
    async fn append_metrics(&self, execution_id: Uuid, metrics: &Metrics) -> Result<()>;

    /// Insert or update one issue.
    async fn save_issue(&self, execution_id: Uuid, issue: &Issue) -> Result<()>;
}
