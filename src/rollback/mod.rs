//! Rollback planner and executor.
//!
//! A rollback plan is validated like the forward plan but is strictly linear:
//! steps run in ascending `order`, each followed by its verification command.
//! The first failure stops the run (fail-stop); nothing is retried or repaired.

mod executor;
mod plan;

pub use executor::{RollbackExecutor, RollbackProgress};
pub use plan::{RollbackPlan, RollbackRun, RollbackStep, RollbackStepRun};
