//! Live progress display for one Execution.
//!
//! Consumes the update feed and renders it in one of three modes:
//! - `full`: an overall bar plus one bar per running phase
//! - `minimal`: one line per significant event
//! - `json`: every update as one JSON line on stdout

use console::{Term, style};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;

use crate::events::{ExecutionEvent, ExecutionUpdate};
use crate::model::{Execution, ExecutionStatus};
use crate::ui::icons::{
    CHECK, CROSS, HEALTH, ISSUE, PAUSE, RETRY, ROLLBACK, RUNNING, SKIP, SPARKLE, WARN,
};

/// Output mode for the progress display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UiMode {
    #[default]
    Full,
    Minimal,
    Json,
}

impl std::str::FromStr for UiMode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "json" => Self::Json,
            "minimal" => Self::Minimal,
            _ => Self::Full,
        })
    }
}

fn bar_style(template: &str, chars: &str) -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars(chars)
}

pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs > 0 {
        format!("{}s", secs)
    } else {
        format!("{}ms", d.as_millis())
    }
}

/// One-line description of an event, or `None` for events too chatty for
/// line-oriented output.
pub fn describe(event: &ExecutionEvent) -> Option<String> {
    let line = match event {
        ExecutionEvent::StatusChanged { from, to } => format!("Execution {} -> {}", from, to),
        ExecutionEvent::PhaseStarted { phase_id } => format!("{}phase {} started", RUNNING, phase_id),
        ExecutionEvent::PhaseCompleted {
            phase_id,
            duration_ms,
        } => format!(
            "{}phase {} completed ({})",
            CHECK,
            phase_id,
            format_duration(Duration::from_millis(*duration_ms))
        ),
        ExecutionEvent::PhaseFailed { phase_id, error } => {
            format!("{}phase {} failed: {}", CROSS, phase_id, error)
        }
        ExecutionEvent::PhaseSkipped { phase_id, reason } => {
            format!("{}phase {} skipped: {}", SKIP, phase_id, reason)
        }
        ExecutionEvent::PhaseHalted { phase_id } => format!("{}phase {} halted", PAUSE, phase_id),
        ExecutionEvent::StepRetrying {
            step_id,
            attempt,
            delay_ms,
            error,
            ..
        } => format!(
            "{}step {} attempt {} failed, retrying in {}: {}",
            RETRY,
            step_id,
            attempt,
            format_duration(Duration::from_millis(*delay_ms)),
            error
        ),
        ExecutionEvent::StepWarning { step_id, error, .. } => {
            format!("{}step {} failed (non-critical): {}", WARN, step_id, error)
        }
        ExecutionEvent::StepFailed { step_id, error, .. } => {
            format!("{}step {} failed: {}", CROSS, step_id, error)
        }
        ExecutionEvent::HealthChanged { from, to } => {
            format!("{}health {} -> {}", HEALTH, from, to)
        }
        ExecutionEvent::IssueRaised { issue } => format!(
            "{}[{}] {}: {}",
            ISSUE, issue.severity, issue.issue_type, issue.title
        ),
        ExecutionEvent::IssueUpdated { issue } => {
            format!("{}issue '{}' is now {}", ISSUE, issue.title, issue.status)
        }
        ExecutionEvent::RollbackStarted { steps, .. } => {
            format!("{}rollback started ({} steps)", ROLLBACK, steps)
        }
        ExecutionEvent::RollbackStepCompleted { order, step_id } => {
            format!("{}rollback step {} ({}) done", ROLLBACK, order, step_id)
        }
        ExecutionEvent::RollbackStepFailed { order, error } => {
            format!("{}rollback step {} failed: {}", CROSS, order, error)
        }
        ExecutionEvent::StepStarted { .. }
        | ExecutionEvent::StepCompleted { .. }
        | ExecutionEvent::Progress { .. }
        | ExecutionEvent::Log { .. }
        | ExecutionEvent::MetricsSampled { .. }
        | ExecutionEvent::RollbackStepStarted { .. }
        | ExecutionEvent::RollbackStepVerifying { .. } => return None,
    };
    Some(line)
}

/// Progress display for one Execution.
pub struct ExecutionUI {
    mode: UiMode,
    multi: MultiProgress,
    header_bar: ProgressBar,
    phase_bars: HashMap<String, ProgressBar>,
    verbose: bool,
    term: Term,
}

impl ExecutionUI {
    pub fn new(execution: &Execution, mode: UiMode, verbose: bool) -> Self {
        let multi = MultiProgress::new();
        let header_bar = if mode == UiMode::Full {
            let bar = multi.add(ProgressBar::new(100));
            bar.set_style(bar_style(
                "{prefix:.bold} [{bar:40.cyan/blue}] {pos:>3}% {msg}",
                "█▓▒░",
            ));
            bar.set_prefix(execution.name.clone());
            bar.set_message(format!("{} phases", execution.phases.len()));
            bar
        } else {
            ProgressBar::hidden()
        };

        Self {
            mode,
            multi,
            header_bar,
            phase_bars: HashMap::new(),
            verbose,
            term: Term::stdout(),
        }
    }

    /// Print a line above the bars, falling back to stderr if the terminal is gone.
    fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    pub fn handle(&mut self, update: &ExecutionUpdate) {
        match self.mode {
            UiMode::Json => {
                if let Ok(json) = serde_json::to_string(update) {
                    let _ = writeln!(&self.term, "{}", json);
                }
            }
            UiMode::Minimal => {
                if let Some(line) = describe(&update.event) {
                    let _ = writeln!(&self.term, "{}", line);
                }
            }
            UiMode::Full => self.handle_full(&update.event),
        }
    }

    fn handle_full(&mut self, event: &ExecutionEvent) {
        match event {
            ExecutionEvent::PhaseStarted { phase_id } => {
                let bar = self.multi.add(ProgressBar::new(100));
                bar.set_style(bar_style(
                    "  {prefix:.bold} [{bar:30.green/white}] {pos:>3}% {msg}",
                    "█▓░",
                ));
                bar.set_prefix(format!("[{}]", phase_id));
                bar.set_message(format!("{}starting", RUNNING));
                bar.enable_steady_tick(Duration::from_millis(100));
                self.phase_bars.insert(phase_id.clone(), bar);
            }
            ExecutionEvent::StepStarted {
                phase_id,
                step_id,
                attempt,
            } => {
                if let Some(bar) = self.phase_bars.get(phase_id) {
                    let msg = if *attempt > 1 {
                        format!("{} (attempt {})", style(step_id).cyan(), attempt)
                    } else {
                        style(step_id).cyan().to_string()
                    };
                    bar.set_message(msg);
                }
            }
            ExecutionEvent::Progress {
                progress,
                phase_id,
                phase_progress,
            } => {
                self.header_bar.set_position(progress.round() as u64);
                if let (Some(phase_id), Some(phase_progress)) = (phase_id, phase_progress)
                    && let Some(bar) = self.phase_bars.get(phase_id)
                {
                    bar.set_position(phase_progress.round() as u64);
                }
            }
            ExecutionEvent::PhaseCompleted {
                phase_id,
                duration_ms,
            } => {
                if let Some(bar) = self.phase_bars.remove(phase_id) {
                    bar.set_style(bar_style(
                        "  {prefix:.bold} [{bar:30.green/green}] {msg}",
                        "███",
                    ));
                    bar.set_position(100);
                    bar.finish_with_message(format!(
                        "{}{}",
                        CHECK,
                        format_duration(Duration::from_millis(*duration_ms))
                    ));
                }
            }
            ExecutionEvent::PhaseFailed { phase_id, error } => {
                if let Some(bar) = self.phase_bars.remove(phase_id) {
                    bar.set_style(bar_style(
                        "  {prefix:.bold} [{bar:30.red/red}] {msg}",
                        "███",
                    ));
                    bar.abandon_with_message(format!("{}{}", CROSS, error));
                }
            }
            ExecutionEvent::PhaseHalted { phase_id } => {
                if let Some(bar) = self.phase_bars.remove(phase_id) {
                    bar.abandon_with_message(format!("{}halted", PAUSE));
                }
            }
            ExecutionEvent::StatusChanged { to, .. } => {
                self.header_bar.set_message(style(to).yellow().to_string());
            }
            ExecutionEvent::Log { entry } if self.verbose => {
                self.print_line(format!(
                    "  {} {}",
                    style(format!("[{}]", entry.level)).dim(),
                    entry.message
                ));
            }
            other => {
                if let Some(line) = describe(other) {
                    self.print_line(format!("  {}", line));
                }
            }
        }
    }

    /// Tear down the bars and print the outcome.
    pub fn finish(&mut self, execution: &Execution) {
        for (_, bar) in self.phase_bars.drain() {
            bar.abandon();
        }
        if self.mode == UiMode::Json {
            return;
        }
        self.header_bar.set_position(execution.progress.round() as u64);
        let outcome = match execution.status {
            ExecutionStatus::Completed => {
                format!("{}{}", SPARKLE, style("completed").green().bold())
            }
            ExecutionStatus::RolledBack => {
                format!("{}{}", ROLLBACK, style("rolled back").yellow().bold())
            }
            ExecutionStatus::Paused => format!("{}{}", PAUSE, style("paused").yellow()),
            status => format!("{}{}", CROSS, style(status).red().bold()),
        };
        self.header_bar.finish_with_message(outcome.clone());
        if self.mode == UiMode::Minimal {
            let _ = writeln!(&self.term, "{} ({:.0}%)", outcome, execution.progress);
        }
        if let Some(error) = &execution.error {
            let _ = writeln!(&self.term, "  {}", style(error).red());
        }
    }
}
