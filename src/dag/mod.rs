//! Dependency scheduling for phases.
//!
//! Phases form a directed acyclic graph through their `depends_on` sets. This
//! module validates that graph once, at submission, and afterwards answers the
//! controller's only question: which phases may start now.
//!
//! ## Example
//!
//! ```
//! use cutover::dag::DagScheduler;
//! use cutover::plan::PhaseSpec;
//!
//! let phases = vec![
//!     PhaseSpec::new("01", "Setup", vec![]),
//!     PhaseSpec::new("02", "Copy", vec!["01".to_string()]),
//!     PhaseSpec::new("03", "Verify", vec!["01".to_string()]),
//!     PhaseSpec::new("04", "Switch", vec!["02".to_string(), "03".to_string()]),
//! ];
//!
//! let scheduler = DagScheduler::from_specs(&phases, 4).unwrap();
//! assert_eq!(
//!     scheduler.compute_waves(),
//!     vec![vec!["01"], vec!["02", "03"], vec!["04"]]
//! );
//! ```

mod builder;
mod scheduler;

pub use builder::{DagBuilder, PhaseGraph, PhaseIndex};
pub use scheduler::DagScheduler;
