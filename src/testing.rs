//! Scripted adapters for tests.
//!
//! `ScriptedExecutor` stands in for a real step executor: every step succeeds
//! unless told otherwise, and every call is recorded. `ScriptedProbe` replays
//! a fixed sequence of health samples.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tokio::sync::Notify;

use crate::executor::{StepDescriptor, StepExecutor, StepOutcome};
use crate::health::HealthProbe;
use crate::model::MetricsSample;

#[derive(Debug, Clone)]
enum Script {
    /// Fail the first `remaining` attempts, then succeed
    FailTimes {
        remaining: u32,
        error: String,
        retryable: bool,
    },
    FailAlways {
        error: String,
        retryable: bool,
    },
    /// Return `Err` from the adapter itself
    AdapterError(String),
}

/// Step executor whose behaviour is scripted per step id.
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, Script>>,
    delays: HashMap<String, Duration>,
    default_delay: Duration,
    gates: HashMap<String, Arc<Notify>>,
    calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    call_signal: Arc<Notify>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every attempt of `step_id` fails.
    pub fn fail_always(self, step_id: &str, error: &str, retryable: bool) -> Self {
        guard(&self.scripts).insert(
            step_id.to_string(),
            Script::FailAlways {
                error: error.to_string(),
                retryable,
            },
        );
        self
    }

    /// The first `times` attempts of `step_id` fail with a retryable error.
    pub fn fail_times(self, step_id: &str, times: u32, error: &str) -> Self {
        guard(&self.scripts).insert(
            step_id.to_string(),
            Script::FailTimes {
                remaining: times,
                error: error.to_string(),
                retryable: true,
            },
        );
        self
    }

    /// The adapter itself returns an error for `step_id`.
    pub fn adapter_error(self, step_id: &str, error: &str) -> Self {
        guard(&self.scripts).insert(step_id.to_string(), Script::AdapterError(error.to_string()));
        self
    }

    /// Every attempt of `step_id` takes `delay`.
    pub fn delay(mut self, step_id: &str, delay: Duration) -> Self {
        self.delays.insert(step_id.to_string(), delay);
        self
    }

    /// Steps without their own delay take `delay`.
    pub fn default_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    /// `step_id` blocks until the returned gate is notified.
    pub fn gate(&mut self, step_id: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.gates.insert(step_id.to_string(), gate.clone());
        gate
    }

    /// Step ids in call order, one entry per attempt.
    pub fn calls(&self) -> Vec<String> {
        guard(&self.calls).clone()
    }

    pub fn call_count(&self, step_id: &str) -> usize {
        guard(&self.calls).iter().filter(|c| *c == step_id).count()
    }

    /// Highest number of attempts that were running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Resolve once `step_id` has been called at least once.
    pub async fn wait_for_call(&self, step_id: &str) {
        loop {
            let notified = self.call_signal.notified();
            if self.call_count(step_id) > 0 {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
    async fn execute(&self, step: &StepDescriptor) -> Result<StepOutcome> {
        guard(&self.calls).push(step.step_id.clone());
        self.call_signal.notify_waiters();

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = self
            .delays
            .get(&step.step_id)
            .copied()
            .unwrap_or(self.default_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(gate) = self.gates.get(&step.step_id) {
            gate.notified().await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let mut scripts = guard(&self.scripts);
        match scripts.get_mut(&step.step_id) {
            None => Ok(StepOutcome::success(format!("{} ok", step.step_id))),
            Some(Script::FailAlways { error, retryable }) => Ok(StepOutcome::Failed {
                error: error.clone(),
                output: format!("{} output", step.step_id),
                retryable: *retryable,
            }),
            Some(Script::FailTimes {
                remaining,
                error,
                retryable,
            }) => {
                if *remaining > 0 {
                    *remaining -= 1;
                    Ok(StepOutcome::Failed {
                        error: error.clone(),
                        output: String::new(),
                        retryable: *retryable,
                    })
                } else {
                    Ok(StepOutcome::success(format!("{} ok", step.step_id)))
                }
            }
            Some(Script::AdapterError(error)) => Err(anyhow!("{}", error)),
        }
    }
}

/// One scripted probe result.
#[derive(Debug, Clone)]
pub enum ProbeStep {
    Sample(MetricsSample),
    Fail(String),
    /// Take this long before answering with a default sample
    Hang(Duration),
}

/// Probe that replays a script; the last entry repeats forever.
pub struct ScriptedProbe {
    steps: Vec<ProbeStep>,
    cursor: AtomicUsize,
}

impl ScriptedProbe {
    pub fn new(steps: Vec<ProbeStep>) -> Self {
        Self {
            steps,
            cursor: AtomicUsize::new(0),
        }
    }

    /// A probe that always reports a default (healthy) sample.
    pub fn healthy() -> Self {
        Self::new(vec![ProbeStep::Sample(MetricsSample::default())])
    }

    pub fn samples_taken(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn sample(&self) -> Result<MetricsSample> {
        let n = self.cursor.fetch_add(1, Ordering::SeqCst);
        let Some(step) = self.steps.get(n).or_else(|| self.steps.last()) else {
            return Ok(MetricsSample::default());
        };
        match step.clone() {
            ProbeStep::Sample(sample) => Ok(sample),
            ProbeStep::Fail(error) => Err(anyhow!("{}", error)),
            ProbeStep::Hang(duration) => {
                tokio::time::sleep(duration).await;
                Ok(MetricsSample::default())
            }
        }
    }
}
