//! Static reports: execution detail, history listing, plan preview.

use console::style;

use crate::model::{Execution, ExecutionStatus, PhaseStatus, StepStatus};
use crate::plan::PlanSpec;
use crate::store::ExecutionSummary;

fn status_color(status: ExecutionStatus) -> String {
    let text = status.to_string();
    match status {
        ExecutionStatus::Completed | ExecutionStatus::RolledBack => style(text).green().to_string(),
        ExecutionStatus::Failed | ExecutionStatus::RollbackFailed => style(text).red().to_string(),
        ExecutionStatus::Running | ExecutionStatus::RollingBack => style(text).cyan().to_string(),
        _ => style(text).yellow().to_string(),
    }
}

fn phase_marker(status: PhaseStatus) -> &'static str {
    match status {
        PhaseStatus::Completed => "✓",
        PhaseStatus::Failed => "✗",
        PhaseStatus::Running => "▶",
        PhaseStatus::Skipped => "-",
        _ => "·",
    }
}

fn step_marker(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Completed => "✓",
        StepStatus::Failed => "✗",
        StepStatus::Warning => "!",
        StepStatus::Running => "▶",
        _ => "·",
    }
}

/// Render `history` rows.
pub fn history_lines(summaries: &[ExecutionSummary]) -> Vec<String> {
    summaries
        .iter()
        .map(|s| {
            format!(
                "{}  {:<16} {:>5.1}%  {}  {}",
                s.id,
                s.status.to_string(),
                s.progress,
                s.created_at.format("%Y-%m-%d %H:%M:%S"),
                s.name
            )
        })
        .collect()
}

pub fn print_history(summaries: &[ExecutionSummary]) {
    if summaries.is_empty() {
        println!("No executions recorded.");
        return;
    }
    println!(
        "{}",
        style(format!(
            "{:<36}  {:<16} {:>6}  {:<19}  {}",
            "ID", "STATUS", "DONE", "CREATED", "NAME"
        ))
        .bold()
    );
    for line in history_lines(summaries) {
        println!("{}", line);
    }
}

pub fn print_execution(execution: &Execution) {
    println!();
    println!(
        "{} {}",
        style(&execution.name).bold(),
        style(execution.id).dim()
    );
    println!(
        "  status: {}   progress: {:.1}%   health: {}",
        status_color(execution.status),
        execution.progress,
        execution.health
    );
    if let Some(started) = execution.started_at {
        println!("  started: {}", started.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(eta) = execution.estimated_completion
        && execution.completed_at.is_none()
    {
        println!("  estimated completion: {}", eta.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(done) = execution.completed_at {
        println!("  finished: {}", done.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(error) = &execution.error {
        println!("  error: {}", style(error).red());
    }

    println!();
    for phase in &execution.phases {
        println!(
            "  {} {} {} ({:.0}%)",
            phase_marker(phase.status),
            style(&phase.id).yellow(),
            phase.name,
            phase.progress
        );
        for step in &phase.steps {
            let attempts = if step.attempts > 1 {
                format!(" [{} attempts]", step.attempts)
            } else {
                String::new()
            };
            println!(
                "      {} {} {}{}",
                step_marker(step.status),
                step.id,
                style(step.status).dim(),
                attempts
            );
            if let Some(error) = &step.error {
                println!("          {}", style(error).red());
            }
        }
    }

    if !execution.issues.is_empty() {
        println!();
        println!("  {}", style("Issues").bold());
        for issue in &execution.issues {
            println!(
                "    {} [{}] {} ({}) {}",
                style(issue.id).dim(),
                issue.severity,
                issue.title,
                issue.status,
                issue.issue_type
            );
        }
    }

    if let Some(run) = &execution.rollback {
        println!();
        println!("  {}", style("Rollback").bold());
        for step in &run.steps {
            println!("    {}. {} {}", step.order, step.name, style(step.status).dim());
        }
        if let Some(error) = &run.error {
            println!("    {}", style(error).red());
        }
    }
    println!();
}

/// Print the wave preview of a validated plan.
pub fn print_plan(plan: &PlanSpec, waves: &[Vec<String>]) {
    println!(
        "{} {}: {} phases, {} steps",
        style("✓").green(),
        style(&plan.name).bold(),
        plan.phases.len(),
        plan.step_count()
    );
    for (i, wave) in waves.iter().enumerate() {
        println!("  wave {}: {}", i + 1, wave.join(", "));
    }
    match &plan.rollback {
        Some(rollback) => println!(
            "  rollback: {} ({} steps, ~{} min)",
            rollback.name,
            rollback.steps.len(),
            rollback.total_estimated_minutes()
        ),
        None => println!("  rollback: {}", style("none").dim()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn test_history_lines() {
        let summary = ExecutionSummary {
            id: Uuid::nil(),
            name: "orders".into(),
            status: ExecutionStatus::RolledBack,
            progress: 62.5,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        let lines = history_lines(&[summary]);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("rolled_back"));
        assert!(lines[0].contains("62.5%"));
        assert!(lines[0].ends_with("orders"));
    }
}
