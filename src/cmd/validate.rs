//! Plan validation and wave preview (`cutover validate`).

use anyhow::{Context, Result};
use std::path::Path;

use cutover::config::CutoverConfig;
use cutover::dag::DagScheduler;
use cutover::plan::PlanSpec;
use cutover::ui::report::print_plan;

pub fn cmd_validate(config: &CutoverConfig, plan_path: &Path) -> Result<()> {
    let plan = PlanSpec::load(plan_path)?;
    plan.validate()
        .with_context(|| format!("Plan {} is invalid", plan_path.display()))?;

    let settings = config.execution_settings(&plan.settings);
    let scheduler = DagScheduler::from_specs(&plan.phases, settings.max_parallel)?;
    print_plan(&plan, &scheduler.compute_waves());

    for warning in config.validate() {
        println!("  warning: {}", warning);
    }
    Ok(())
}
