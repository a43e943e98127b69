//! Stored execution queries (`cutover history`, `cutover show`).

use anyhow::{Result, bail};
use uuid::Uuid;

use cutover::config::CutoverConfig;
use cutover::store::ExecutionSummary;
use cutover::ui::report::{print_execution, print_history};

pub async fn cmd_history(config: &CutoverConfig, limit: Option<usize>) -> Result<()> {
    let engine = super::open_engine(config)?;
    let mut summaries = engine.list().await?;
    if let Some(limit) = limit {
        summaries.truncate(limit);
    }
    print_history(&summaries);
    Ok(())
}

/// Resolve a full id or a unique prefix of one.
fn resolve_id(summaries: &[ExecutionSummary], query: &str) -> Result<Uuid> {
    if let Ok(id) = Uuid::parse_str(query) {
        return Ok(id);
    }
    let matches: Vec<Uuid> = summaries
        .iter()
        .map(|s| s.id)
        .filter(|id| id.to_string().starts_with(query))
        .collect();
    match matches.as_slice() {
        [id] => Ok(*id),
        [] => bail!("No execution matches '{}'", query),
        _ => bail!(
            "'{}' is ambiguous ({} executions match); use more characters",
            query,
            matches.len()
        ),
    }
}

pub async fn cmd_show(config: &CutoverConfig, query: &str, json: bool) -> Result<()> {
    let engine = super::open_engine(config)?;
    let id = resolve_id(&engine.list().await?, query)?;
    let execution = engine.snapshot(id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&execution)?);
    } else {
        print_execution(&execution);
    }
    Ok(())
}
