use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use super::HealthProbe;
use crate::model::MetricsSample;

/// Probe that runs a command and reads one JSON metrics sample from its stdout.
///
/// Exit code 0 with empty stdout counts as a healthy sample with default
/// metrics; a non-zero exit or unparseable output is a failed sample.
pub struct CommandProbe {
    command: String,
    working_dir: PathBuf,
}

impl CommandProbe {
    pub fn new(command: impl Into<String>, working_dir: impl AsRef<Path>) -> Self {
        Self {
            command: command.into(),
            working_dir: working_dir.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl HealthProbe for CommandProbe {
    async fn sample(&self) -> Result<MetricsSample> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to spawn probe command: {}", self.command))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "Probe exited with code {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        if stdout.is_empty() {
            return Ok(MetricsSample::default());
        }
        serde_json::from_str(stdout).context("Probe output is not a metrics sample")
    }
}
