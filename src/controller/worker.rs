use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::StepsSection;
use crate::errors::StepError;
use crate::executor::{StepDescriptor, StepExecutor, run_attempt};

/// Reports from a step task back to the controller.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StepEvent {
    Attempt {
        phase_id: String,
        step_id: String,
        attempt: u32,
    },
    Retrying {
        phase_id: String,
        step_id: String,
        attempt: u32,
        delay: Duration,
        error: StepError,
    },
    Finished {
        phase_id: String,
        step_id: String,
        attempts: u32,
        duration: Duration,
        result: Result<String, StepError>,
    },
}

/// One step handed to the adapter, with its retry budget.
pub(crate) struct StepJob {
    pub executor: Arc<dyn StepExecutor>,
    /// Descriptor of the first attempt; `attempt` is bumped per retry
    pub descriptor: StepDescriptor,
    /// Retries after the first attempt
    pub retries: u32,
    pub backoff: StepsSection,
}

impl StepJob {
    /// Run the step to a final verdict on its own task.
    pub fn spawn<T>(self, events: mpsc::Sender<T>) -> JoinHandle<()>
    where
        T: From<StepEvent> + Send + 'static,
    {
        tokio::spawn(async move {
            let phase_id = self.descriptor.phase_id.clone();
            let step_id = self.descriptor.step_id.clone();
            let started = Instant::now();
            let finished = match AssertUnwindSafe(self.run(&events)).catch_unwind().await {
                Ok(finished) => finished,
                Err(_) => {
                    error!(phase = %phase_id, step = %step_id, "step task panicked");
                    StepEvent::Finished {
                        result: Err(StepError::Execution {
                            phase_id: phase_id.clone(),
                            step_id: step_id.clone(),
                            message: "step task panicked".to_string(),
                            output: String::new(),
                            retryable: false,
                        }),
                        phase_id,
                        step_id,
                        attempts: 1,
                        duration: started.elapsed(),
                    }
                }
            };
            let _ = events.send(finished.into()).await;
        })
    }

    async fn run<T>(mut self, events: &mpsc::Sender<T>) -> StepEvent
    where
        T: From<StepEvent> + Send + 'static,
    {
        let started = Instant::now();
        let phase_id = self.descriptor.phase_id.clone();
        let step_id = self.descriptor.step_id.clone();

        loop {
            let attempt = self.descriptor.attempt;
            let _ = events
                .send(
                    StepEvent::Attempt {
                        phase_id: phase_id.clone(),
                        step_id: step_id.clone(),
                        attempt,
                    }
                    .into(),
                )
                .await;

            let result = run_attempt(self.executor.as_ref(), &self.descriptor).await;
            let error = match result {
                Ok(output) => {
                    debug!(phase = %phase_id, step = %step_id, attempt, "step attempt succeeded");
                    return StepEvent::Finished {
                        phase_id,
                        step_id,
                        attempts: attempt,
                        duration: started.elapsed(),
                        result: Ok(output),
                    };
                }
                Err(error) => error,
            };

            let retry = attempt; // retries used so far + 1
            if !error.is_retryable() || retry > self.retries {
                return StepEvent::Finished {
                    phase_id,
                    step_id,
                    attempts: attempt,
                    duration: started.elapsed(),
                    result: Err(error),
                };
            }

            let delay = self.backoff.backoff_delay(retry);
            warn!(
                phase = %phase_id,
                step = %step_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "step attempt failed, retrying"
            );
            let _ = events
                .send(
                    StepEvent::Retrying {
                        phase_id: phase_id.clone(),
                        step_id: step_id.clone(),
                        attempt,
                        delay,
                        error,
                    }
                    .into(),
                )
                .await;

            tokio::time::sleep(delay).await;
            self.descriptor.attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::StepConfig;
    use crate::testing::ScriptedExecutor;
    use uuid::Uuid;

    fn job(executor: Arc<ScriptedExecutor>, retries: u32, timeout: Duration) -> StepJob {
        StepJob {
            executor,
            descriptor: StepDescriptor {
                execution_id: Uuid::nil(),
                phase_id: "p".into(),
                step_id: "s".into(),
                name: "step".into(),
                attempt: 1,
                timeout,
                config: StepConfig::default(),
            },
            retries,
            backoff: StepsSection {
                backoff_initial_ms: 5,
                backoff_multiplier: 2.0,
                backoff_max_ms: 20,
                ..Default::default()
            },
        }
    }

    async fn collect(job: StepJob) -> Vec<StepEvent> {
        let (tx, mut rx) = mpsc::channel::<StepEvent>(64);
        job.spawn(tx).await.unwrap();
        let mut out = Vec::new();
        while let Some(event) = rx.recv().await {
            out.push(event);
        }
        out
    }

    fn finished(events: &[StepEvent]) -> (u32, Result<String, StepError>) {
        match events.last() {
            Some(StepEvent::Finished {
                attempts, result, ..
            }) => (*attempts, result.clone()),
            other => panic!("expected Finished, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_retryable_failure_then_success() {
        let exec = Arc::new(ScriptedExecutor::new().fail_times("s", 2, "connection reset"));
        let events = collect(job(exec.clone(), 3, Duration::from_secs(1))).await;

        let (attempts, result) = finished(&events);
        assert_eq!(attempts, 3);
        assert_eq!(result, Ok("s ok".to_string()));
        assert_eq!(exec.call_count("s"), 3);

        let retries: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                StepEvent::Retrying { delay, .. } => Some(*delay),
                _ => None,
            })
            .collect();
        assert_eq!(retries, vec![Duration::from_millis(5), Duration::from_millis(10)]);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_stops_immediately() {
        let exec = Arc::new(ScriptedExecutor::new().fail_always("s", "syntax error", false));
        let events = collect(job(exec.clone(), 3, Duration::from_secs(1))).await;

        let (attempts, result) = finished(&events);
        assert_eq!(attempts, 1);
        assert!(matches!(result, Err(StepError::Execution { retryable: false, .. })));
        assert_eq!(exec.call_count("s"), 1);
    }

    #[tokio::test]
    async fn test_retry_budget_is_exhausted() {
        let exec = Arc::new(ScriptedExecutor::new().fail_always("s", "busy", true));
        let events = collect(job(exec.clone(), 2, Duration::from_secs(1))).await;

        let (attempts, result) = finished(&events);
        assert_eq!(attempts, 3);
        assert!(result.is_err());
        assert_eq!(exec.call_count("s"), 3);
    }

    #[tokio::test]
    async fn test_timeouts_are_retried_then_reported() {
        let exec = Arc::new(ScriptedExecutor::new().delay("s", Duration::from_millis(200)));
        let events = collect(job(exec.clone(), 1, Duration::from_millis(20))).await;

        let (attempts, result) = finished(&events);
        assert_eq!(attempts, 2);
        assert!(matches!(result, Err(StepError::Timeout { timeout_ms: 20, .. })));
    }
}
