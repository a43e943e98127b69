//! Execution engine for migration and deployment plans: dependency-ordered
//! phases of retried steps, continuous health sampling, issue tracking and
//! an ordered rollback path.

pub mod config;
pub mod controller;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod events;
pub mod executor;
pub mod health;
pub mod issues;
pub mod logging;
pub mod model;
pub mod plan;
pub mod rollback;
pub mod server;
pub mod store;
pub mod testing;
pub mod ui;
