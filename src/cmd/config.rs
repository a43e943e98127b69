//! Configuration view and validation commands (`cutover config`).

use anyhow::Result;

use super::super::ConfigCommands;
use cutover::config::{CutoverConfig, CutoverToml};

fn threshold(value: Option<f64>) -> String {
    value.map_or_else(|| "off".to_string(), |v| v.to_string())
}

fn print_sections(toml: &CutoverToml) {
    println!("[execution]");
    println!("  max_parallel = {}", toml.execution.max_parallel);
    println!(
        "  progress_weighting = \"{}\"",
        toml.execution.progress_weighting
    );
    println!("  rollback_trigger = \"{}\"", toml.execution.rollback_trigger);
    println!("  issue_policy = \"{}\"", toml.execution.issue_policy);
    println!();

    println!("[steps]");
    println!("  timeout_secs = {}", toml.steps.timeout_secs);
    println!("  retries = {}", toml.steps.retries);
    println!(
        "  backoff = {}ms x{} (max {}ms)",
        toml.steps.backoff_initial_ms, toml.steps.backoff_multiplier, toml.steps.backoff_max_ms
    );
    println!();

    println!("[health]");
    println!("  interval_ms = {}", toml.health.interval_ms);
    println!("  timeout_ms = {}", toml.health.timeout_ms);
    println!("  retries = {}", toml.health.retries);
    println!("  history_len = {}", toml.health.history_len);
    println!("  fatal_on_unhealthy = {}", toml.health.fatal_on_unhealthy);
    println!("  max_error_rate = {}", threshold(toml.health.max_error_rate));
    println!("  max_cpu_percent = {}", threshold(toml.health.max_cpu_percent));
    println!(
        "  max_memory_percent = {}",
        threshold(toml.health.max_memory_percent)
    );
    println!(
        "  max_response_time_ms = {}",
        threshold(toml.health.max_response_time_ms)
    );
    println!(
        "  min_success_rate = {}",
        threshold(toml.health.min_success_rate)
    );
    println!();

    println!("[logging]");
    println!("  level = \"{}\"", toml.logging.level);
    println!("  format = \"{}\"", toml.logging.format);
    if let Some(dir) = &toml.logging.dir {
        println!("  dir = \"{}\"", dir.display());
    }
    println!();

    println!("[server]");
    println!("  host = \"{}\"", toml.server.host);
    println!("  port = {}", toml.server.port);
    println!();
}

pub fn cmd_config(config: &CutoverConfig, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = config.config_file();

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Cutover Configuration");
            println!("=====================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No cutover.toml found at {}", config_path.display());
                println!("Using defaults. Run 'cutover config init' to create one.");
            }
            println!();

            // Effective values: file, then CUTOVER_* environment
            print_sections(&config.toml);
            println!("Store: {}", config.store_path().display());
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No cutover.toml found. Using defaults (valid).");
                return Ok(());
            }

            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("cutover.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            CutoverToml::default().save(&config_path)?;

            println!("Created cutover.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [execution] max_parallel, rollback_trigger, issue_policy");
            println!("  - [steps] timeouts, retries and backoff");
            println!("  - [health] sampling cadence and thresholds");
            println!();
        }
    }

    Ok(())
}
