//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module     | Commands handled          |
//! |------------|---------------------------|
//! | `run`      | `Run`                     |
//! | `validate` | `Validate`                |
//! | `history`  | `History`, `Show`         |
//! | `serve`    | `Serve`                   |
//! | `config`   | `Config`                  |

pub mod config;
pub mod history;
pub mod run;
pub mod serve;
pub mod validate;

pub use config::cmd_config;
pub use history::{cmd_history, cmd_show};
pub use run::{RunOptions, cmd_run};
pub use serve::cmd_serve;
pub use validate::cmd_validate;

use anyhow::{Context, Result};
use std::sync::Arc;

use cutover::config::CutoverConfig;
use cutover::engine::Engine;
use cutover::executor::ShellExecutor;
use cutover::store::SqliteRepository;

/// Engine over the project's SQLite store with the shell adapter.
pub(crate) fn open_engine(config: &CutoverConfig) -> Result<Engine> {
    let store_path = config.store_path();
    let repository = SqliteRepository::open(&store_path)
        .with_context(|| format!("Failed to open store at {}", store_path.display()))?;
    Ok(Engine::new(
        Arc::new(ShellExecutor::new(&config.project_dir)),
        Arc::new(repository),
    )
    .with_config(config.toml.clone())
    .with_project_dir(&config.project_dir))
}
