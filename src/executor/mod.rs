//! The step executor adapter contract.
//!
//! The engine never performs a step's action itself. It hands a
//! [`StepDescriptor`] to a [`StepExecutor`] and interprets the outcome.
//! Adapters must be safe to call again for the same step (retries) and should
//! return promptly once the descriptor's timeout elapses; the engine enforces
//! the timeout regardless.

mod shell;

pub use shell::{EXIT_TEMPFAIL, ShellExecutor};

use anyhow::Result;
use async_trait::async_trait;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::time::timeout;
use tracing::error;
use uuid::Uuid;

use crate::errors::StepError;
use crate::plan::StepConfig;

/// Everything an adapter gets to know about one attempt of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDescriptor {
    pub execution_id: Uuid,
    pub phase_id: String,
    pub step_id: String,
    pub name: String,
    /// 1-based attempt number
    pub attempt: u32,
    pub timeout: Duration,
    pub config: StepConfig,
}

/// What an adapter reports for one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded {
        output: String,
    },
    Failed {
        error: String,
        output: String,
        /// Whether another attempt might succeed
        retryable: bool,
    },
}

impl StepOutcome {
    pub fn success(output: impl Into<String>) -> Self {
        Self::Succeeded {
            output: output.into(),
        }
    }

    pub fn failure(error: impl Into<String>, retryable: bool) -> Self {
        Self::Failed {
            error: error.into(),
            output: String::new(),
            retryable,
        }
    }
}

/// Abstraction over the thing that actually performs a step.
/// Real implementation: `ShellExecutor`. Test double: `testing::ScriptedExecutor`.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, step: &StepDescriptor) -> Result<StepOutcome>;
}

/// Run one attempt under the descriptor's timeout.
///
/// An adapter error (as opposed to a reported failure) is treated as a
/// retryable execution error: the adapter could not tell us what happened.
/// A panicking adapter fails the attempt for good.
pub async fn run_attempt(executor: &dyn StepExecutor, step: &StepDescriptor) -> Result<String, StepError> {
    let attempt = AssertUnwindSafe(executor.execute(step)).catch_unwind();
    match timeout(step.timeout, attempt).await {
        Ok(Err(panic)) => {
            let message = panic_message(panic.as_ref());
            error!(phase = %step.phase_id, step = %step.step_id, panic = %message, "step adapter panicked");
            Err(StepError::Execution {
                phase_id: step.phase_id.clone(),
                step_id: step.step_id.clone(),
                message: format!("adapter panicked: {}", message),
                output: String::new(),
                retryable: false,
            })
        }
        Ok(Ok(result)) => interpret(step, result),
        Err(_) => Err(StepError::Timeout {
            phase_id: step.phase_id.clone(),
            step_id: step.step_id.clone(),
            timeout_ms: duration_ms(step.timeout),
        }),
    }
}

fn interpret(step: &StepDescriptor, result: Result<StepOutcome>) -> Result<String, StepError> {
    match result {
        Ok(StepOutcome::Succeeded { output }) => Ok(output),
        Ok(StepOutcome::Failed {
            error,
            output,
            retryable,
        }) => Err(StepError::Execution {
            phase_id: step.phase_id.clone(),
            step_id: step.step_id.clone(),
            message: error,
            output,
            retryable,
        }),
        Err(err) => Err(StepError::Execution {
            phase_id: step.phase_id.clone(),
            step_id: step.step_id.clone(),
            message: format!("{:#}", err),
            output: String::new(),
            retryable: true,
        }),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
