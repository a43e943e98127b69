//! Built-in adapter that runs a step's `command` through `sh -c`.
//!
//! - Exit code 0: success, stdout is the step output
//! - Exit code 75 (`EX_TEMPFAIL`): retryable failure
//! - Any other exit code or a signal: non-retryable failure
//!
//! The step's identity is exported as `CUTOVER_*` variables and every
//! `params` entry as `CUTOVER_PARAM_<KEY>`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use super::{StepDescriptor, StepExecutor, StepOutcome};

/// Exit code a command uses to ask for another attempt.
pub const EXIT_TEMPFAIL: i32 = 75;

/// Runs step commands as subprocesses.
pub struct ShellExecutor {
    /// Default working directory for commands
    project_dir: PathBuf,
}

impl ShellExecutor {
    pub fn new(project_dir: impl AsRef<Path>) -> Self {
        Self {
            project_dir: project_dir.as_ref().to_path_buf(),
        }
    }

    fn working_dir(&self, step: &StepDescriptor) -> PathBuf {
        step.config
            .working_dir
            .as_ref()
            .map(|p| {
                if p.is_absolute() {
                    p.clone()
                } else {
                    self.project_dir.join(p)
                }
            })
            .unwrap_or_else(|| self.project_dir.clone())
    }
}

#[async_trait]
impl StepExecutor for ShellExecutor {
    async fn execute(&self, step: &StepDescriptor) -> Result<StepOutcome> {
        let Some(command) = step.config.command.as_deref().filter(|c| !c.trim().is_empty())
        else {
            return Ok(StepOutcome::failure(
                format!("Step '{}' has no command to run", step.step_id),
                false,
            ));
        };

        debug!(
            phase_id = %step.phase_id,
            step_id = %step.step_id,
            attempt = step.attempt,
            command,
            "spawning step command"
        );

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(self.working_dir(step))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // The engine drops this future on timeout; take the child with it.
            .kill_on_drop(true)
            .env("CUTOVER_EXECUTION_ID", step.execution_id.to_string())
            .env("CUTOVER_PHASE", &step.phase_id)
            .env("CUTOVER_STEP", &step.step_id)
            .env("CUTOVER_ATTEMPT", step.attempt.to_string());

        for (key, value) in &step.config.env {
            cmd.env(key, value);
        }
        for (key, value) in &step.config.params {
            cmd.env(param_var(key), value);
        }

        let output = cmd
            .output()
            .await
            .with_context(|| format!("Failed to spawn step command: {}", command))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        let code = output.status.code();
        debug!(step_id = %step.step_id, exit_code = ?code, "step command exited");

        match code {
            Some(0) => Ok(StepOutcome::success(stdout)),
            Some(code) => Ok(StepOutcome::Failed {
                error: if stderr.is_empty() {
                    format!("Command exited with code {}", code)
                } else {
                    format!("Command exited with code {}: {}", code, last_line(&stderr))
                },
                output: combine(&stdout, &stderr),
                retryable: code == EXIT_TEMPFAIL,
            }),
            None => Ok(StepOutcome::Failed {
                error: "Command was terminated by a signal".to_string(),
                output: combine(&stdout, &stderr),
                retryable: false,
            }),
        }
    }
}

fn param_var(key: &str) -> String {
    let key: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("CUTOVER_PARAM_{}", key)
}

fn last_line(text: &str) -> &str {
    text.lines().last().unwrap_or(text)
}

fn combine(stdout: &str, stderr: &str) -> String {
    match (stdout.is_empty(), stderr.is_empty()) {
        (_, true) => stdout.to_string(),
        (true, false) => stderr.to_string(),
        (false, false) => format!("{}\n{}", stdout, stderr),
    }
}
