//! Plan execution with live progress (`cutover run`).

use anyhow::{Context, Result, bail};
use console::style;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use cutover::config::{CutoverConfig, RollbackTrigger};
use cutover::events::Subscription;
use cutover::model::ExecutionStatus;
use cutover::plan::PlanSpec;
use cutover::ui::{ExecutionUI, UiMode};

/// Grace period for updates still in the broadcast buffer once the Execution settles.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

pub struct RunOptions {
    pub plan: PathBuf,
    pub max_parallel: Option<usize>,
    pub auto_rollback: bool,
    pub ui: UiMode,
}

pub async fn cmd_run(config: &CutoverConfig, options: RunOptions) -> Result<()> {
    let mut plan = PlanSpec::load(&options.plan)?;
    // CLI flags win over the plan's own settings block.
    if let Some(n) = options.max_parallel {
        plan.settings.max_parallel = Some(n);
    }
    if options.auto_rollback {
        plan.settings.rollback_trigger = Some(RollbackTrigger::Automatic);
    }
    let has_rollback_plan = plan.rollback.is_some();

    let engine = super::open_engine(config)?;
    let id = engine
        .prepare(plan)
        .await
        .with_context(|| format!("Failed to submit plan {}", options.plan.display()))?;
    let mut updates = engine.subscribe(Some(id));

    let mut ui = ExecutionUI::new(&engine.snapshot(id).await?, options.ui, config.verbose);
    engine.start(id).await?;
    info!(execution_id = %id, plan = %options.plan.display(), "run started");

    // Ctrl+C pauses; once paused, a second Ctrl+C rolls back when a plan is attached.
    let mut interrupted = false;
    let status = loop {
        let awaiting_operator = interrupted
            && has_rollback_plan
            && engine.status(id).await? == ExecutionStatus::Paused;
        tokio::select! {
            biased;
            update = updates.next() => match update {
                Some(update) => ui.handle(&update),
                None => break engine.status(id).await?,
            },
            _ = tokio::signal::ctrl_c() => {
                if !interrupted {
                    interrupted = true;
                    warn!(execution_id = %id, "interrupt received, pausing");
                    eprintln!(
                        "\n{} pausing after in-flight steps finish...",
                        style("Interrupted:").yellow().bold()
                    );
                    if let Err(e) = engine.pause(id).await {
                        warn!(execution_id = %id, error = %e, "pause refused");
                    }
                } else if awaiting_operator {
                    warn!(execution_id = %id, "second interrupt received, rolling back");
                    eprintln!("{} rolling back...", style("Interrupted:").yellow().bold());
                    engine.request_rollback(id).await?;
                } else {
                    break engine.status(id).await?;
                }
            },
            status = engine.wait_settled(id), if !awaiting_operator => {
                let status = status?;
                if status == ExecutionStatus::Paused && interrupted && has_rollback_plan {
                    eprintln!(
                        "Paused. Press Ctrl+C again to roll back with the attached rollback plan."
                    );
                    continue;
                }
                break status;
            },
        }
    };

    drain(&mut updates, &mut ui).await;
    let execution = engine.snapshot(id).await?;
    ui.finish(&execution);

    match status {
        ExecutionStatus::Completed => Ok(()),
        ExecutionStatus::Paused => {
            eprintln!(
                "Execution {} left paused. Inspect it with 'cutover show {}'.",
                id, id
            );
            Ok(())
        }
        other => bail!("Execution {} finished as {}", id, other),
    }
}

async fn drain(updates: &mut Subscription, ui: &mut ExecutionUI) {
    while let Ok(Some(update)) = tokio::time::timeout(DRAIN_TIMEOUT, updates.next()).await {
        ui.handle(&update);
    }
}
