//! Ready-set scheduling over the phase graph.
//!
//! The scheduler tracks which phases are pending, running or finished and
//! hands out the next phases to start. A phase is ready once every phase it
//! depends on is `completed`; ready phases start in declaration order until
//! the concurrency limit is reached.

use std::collections::HashSet;

use crate::dag::builder::{DagBuilder, PhaseGraph, PhaseIndex};
use crate::errors::PlanError;
use crate::model::{Phase, PhaseStatus};
use crate::plan::PhaseSpec;

pub struct DagScheduler {
    graph: PhaseGraph,
    statuses: Vec<PhaseStatus>,
    completed: HashSet<PhaseIndex>,
    max_parallel: usize,
}

impl DagScheduler {
    /// Build a scheduler for a plan that has not started.
    pub fn from_specs(phases: &[PhaseSpec], max_parallel: usize) -> Result<Self, PlanError> {
        let graph = DagBuilder::from_specs(phases).build()?;
        let statuses = vec![PhaseStatus::Pending; graph.len()];
        Ok(Self::with_statuses(graph, statuses, max_parallel))
    }

    /// Build a scheduler that picks up from the phase statuses of an Execution.
    pub fn from_phases(phases: &[Phase], max_parallel: usize) -> Result<Self, PlanError> {
        let graph = DagBuilder::from_phases(phases).build()?;
        let statuses = phases.iter().map(|p| p.status).collect();
        Ok(Self::with_statuses(graph, statuses, max_parallel))
    }

    fn with_statuses(graph: PhaseGraph, statuses: Vec<PhaseStatus>, max_parallel: usize) -> Self {
        let completed = statuses
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == PhaseStatus::Completed)
            .map(|(i, _)| i)
            .collect();
        Self {
            graph,
            statuses,
            completed,
            max_parallel: max_parallel.max(1),
        }
    }

    pub fn graph(&self) -> &PhaseGraph {
        &self.graph
    }

    pub fn phase_count(&self) -> usize {
        self.graph.len()
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    pub fn index_of(&self, id: &str) -> Option<PhaseIndex> {
        self.graph.get_index(id)
    }

    pub fn phase_id(&self, index: PhaseIndex) -> &str {
        self.graph.id(index).unwrap_or_default()
    }

    pub fn status(&self, index: PhaseIndex) -> PhaseStatus {
        self.statuses
            .get(index)
            .copied()
            .unwrap_or(PhaseStatus::Pending)
    }

    /// Pending phases whose dependencies are all completed, in declaration order.
    pub fn ready_phases(&self) -> Vec<PhaseIndex> {
        (0..self.graph.len())
            .filter(|&i| {
                self.statuses[i] == PhaseStatus::Pending
                    && self.graph.dependencies_satisfied(i, &self.completed)
            })
            .collect()
    }

    pub fn running_count(&self) -> usize {
        self.statuses
            .iter()
            .filter(|s| **s == PhaseStatus::Running)
            .count()
    }

    /// Ready phases that fit in the free concurrency slots.
    pub fn next_batch(&self) -> Vec<PhaseIndex> {
        let free = self.max_parallel.saturating_sub(self.running_count());
        self.ready_phases().into_iter().take(free).collect()
    }

    pub fn mark_running(&mut self, index: PhaseIndex) {
        self.statuses[index] = PhaseStatus::Running;
    }

    pub fn mark_completed(&mut self, index: PhaseIndex) {
        self.statuses[index] = PhaseStatus::Completed;
        self.completed.insert(index);
    }

    /// Mark a phase failed and skip every pending phase that transitively
    /// depends on it. Returns the skipped phases.
    pub fn mark_failed(&mut self, index: PhaseIndex) -> Vec<PhaseIndex> {
        self.statuses[index] = PhaseStatus::Failed;
        self.skip_dependents(index)
    }

    fn skip_dependents(&mut self, failed_idx: PhaseIndex) -> Vec<PhaseIndex> {
        let mut skipped = Vec::new();
        for dependent in self.graph.transitive_dependents(failed_idx) {
            if self.statuses[dependent] == PhaseStatus::Pending {
                self.statuses[dependent] = PhaseStatus::Skipped;
                skipped.push(dependent);
            }
        }
        skipped
    }

    /// Halt every phase that has not reached a terminal status.
    /// Returns the halted phases.
    pub fn halt_unfinished(&mut self) -> Vec<PhaseIndex> {
        let mut halted = Vec::new();
        for (i, status) in self.statuses.iter_mut().enumerate() {
            if !status.is_terminal() {
                *status = PhaseStatus::Halted;
                halted.push(i);
            }
        }
        halted
    }

    pub fn all_complete(&self) -> bool {
        self.statuses.iter().all(|s| s.is_terminal())
    }

    pub fn all_success(&self) -> bool {
        self.completed.len() == self.graph.len()
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    /// Phases in waves: every phase of wave N depends only on phases of earlier waves.
    pub fn compute_waves(&self) -> Vec<Vec<String>> {
        let mut waves = Vec::new();
        let mut completed: HashSet<PhaseIndex> = HashSet::new();

        loop {
            let ready: Vec<PhaseIndex> = (0..self.graph.len())
                .filter(|i| !completed.contains(i))
                .filter(|&i| self.graph.dependencies_satisfied(i, &completed))
                .collect();

            if ready.is_empty() {
                break;
            }

            completed.extend(ready.iter().copied());
            waves.push(ready.iter().map(|&i| self.phase_id(i).to_string()).collect());
        }

        waves
    }

    pub fn topological_order(&self) -> Vec<String> {
        self.graph
            .topological_order()
            .into_iter()
            .map(|i| self.phase_id(i).to_string())
            .collect()
    }
}
