use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, info};
use uuid::Uuid;

use super::plan::{RollbackPlan, RollbackStep};
use crate::errors::{RollbackFailure, StepError};
use crate::executor::{StepDescriptor, StepExecutor, run_attempt};
use crate::plan::StepConfig;

/// Phase id under which rollback commands are handed to the adapter.
const ROLLBACK_PHASE_ID: &str = "rollback";

/// Progress reports from a running rollback.
#[derive(Debug, Clone, PartialEq)]
pub enum RollbackProgress {
    StepStarted { order: u32, step_id: String },
    Verifying { order: u32, step_id: String },
    StepCompleted { order: u32, step_id: String, output: String },
    StepFailed(RollbackFailure),
    Finished(Result<(), RollbackFailure>),
}

/// Runs a rollback plan through the same adapter as the forward steps.
pub struct RollbackExecutor {
    executor: Arc<dyn StepExecutor>,
    execution_id: Uuid,
    default_timeout: Duration,
}

impl RollbackExecutor {
    pub fn new(executor: Arc<dyn StepExecutor>, execution_id: Uuid, default_timeout: Duration) -> Self {
        Self {
            executor,
            execution_id,
            default_timeout,
        }
    }

    /// Execute every step in ascending order, stopping at the first failure.
    ///
    /// Progress is reported on `progress`; a closed receiver does not stop
    /// the rollback.
    pub async fn run<T>(
        &self,
        plan: &RollbackPlan,
        progress: &mpsc::Sender<T>,
    ) -> Result<(), RollbackFailure>
    where
        T: From<RollbackProgress> + Send,
    {
        let result = self.run_steps(plan, progress).await;
        let _ = progress
            .send(RollbackProgress::Finished(result.clone()).into())
            .await;
        result
    }

    async fn run_steps<T>(
        &self,
        plan: &RollbackPlan,
        progress: &mpsc::Sender<T>,
    ) -> Result<(), RollbackFailure>
    where
        T: From<RollbackProgress> + Send,
    {
        for step in plan.ordered_steps() {
            info!(
                execution_id = %self.execution_id,
                order = step.order,
                step = %step.name,
                "rollback step started"
            );
            let _ = progress
                .send(
                    RollbackProgress::StepStarted {
                        order: step.order,
                        step_id: step.id.clone(),
                    }
                    .into(),
                )
                .await;

            let output = match self.run_command(step, &step.command, false).await {
                Ok(output) => output,
                Err(failure) => return Err(self.fail(failure, progress).await),
            };

            let output = match &step.verification_command {
                Some(verify) => {
                    let _ = progress
                        .send(
                            RollbackProgress::Verifying {
                                order: step.order,
                                step_id: step.id.clone(),
                            }
                            .into(),
                        )
                        .await;
                    match self.run_command(step, verify, true).await {
                        Ok(verified) if output.is_empty() => verified,
                        Ok(verified) if verified.is_empty() => output,
                        Ok(verified) => format!("{}\n{}", output, verified),
                        Err(failure) => return Err(self.fail(failure, progress).await),
                    }
                }
                None => output,
            };

            info!(execution_id = %self.execution_id, order = step.order, "rollback step completed");
            let _ = progress
                .send(
                    RollbackProgress::StepCompleted {
                        order: step.order,
                        step_id: step.id.clone(),
                        output,
                    }
                    .into(),
                )
                .await;
        }

        Ok(())
    }

    async fn fail<T>(&self, failure: RollbackFailure, progress: &mpsc::Sender<T>) -> RollbackFailure
    where
        T: From<RollbackProgress> + Send,
    {
        error!(execution_id = %self.execution_id, error = %failure, "rollback halted");
        let _ = progress
            .send(RollbackProgress::StepFailed(failure.clone()).into())
            .await;
        failure
    }

    async fn run_command(
        &self,
        step: &RollbackStep,
        command: &str,
        verification: bool,
    ) -> Result<String, RollbackFailure> {
        let step_id = if verification {
            format!("{}:verify", step.id)
        } else {
            step.id.clone()
        };
        let descriptor = StepDescriptor {
            execution_id: self.execution_id,
            phase_id: ROLLBACK_PHASE_ID.to_string(),
            step_id,
            name: step.name.clone(),
            attempt: 1,
            timeout: step
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(self.default_timeout),
            config: StepConfig {
                command: Some(command.to_string()),
                working_dir: step.working_dir.clone(),
                critical: true,
                ..Default::default()
            },
        };

        run_attempt(self.executor.as_ref(), &descriptor)
            .await
            .map_err(|err| {
                let message = match &err {
                    StepError::Execution { message, .. } => message.clone(),
                    StepError::Timeout { timeout_ms, .. } => {
                        format!("timed out after {}ms", timeout_ms)
                    }
                };
                RollbackFailure {
                    order: step.order,
                    step: step.name.clone(),
                    message,
                    output: err.output().to_string(),
                    verification,
                }
            })
    }
}
