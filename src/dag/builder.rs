//! DAG builder for constructing dependency graphs from phases.
//!
//! The builder takes phase ids with their dependencies and constructs a
//! directed acyclic graph that the scheduler drives. Cycles are found with a
//! three-colour depth-first search so the rejection can name the phases that
//! form the cycle.

use std::collections::{HashMap, HashSet};

use crate::errors::PlanError;
use crate::model::Phase;
use crate::plan::PhaseSpec;

/// Index into the phase list (declaration order).
pub type PhaseIndex = usize;

/// A directed acyclic graph of phases.
#[derive(Debug, Clone)]
pub struct PhaseGraph {
    /// Phase ids in declaration order
    ids: Vec<String>,
    /// Map from phase id to index
    index_map: HashMap<String, PhaseIndex>,
    /// Forward edges: index -> phases that depend on it
    forward_edges: Vec<Vec<PhaseIndex>>,
    /// Reverse edges: index -> phases it depends on
    reverse_edges: Vec<Vec<PhaseIndex>>,
}

impl PhaseGraph {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn id(&self, index: PhaseIndex) -> Option<&str> {
        self.ids.get(index).map(String::as_str)
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn get_index(&self, id: &str) -> Option<PhaseIndex> {
        self.index_map.get(id).copied()
    }

    /// Phases that depend on the given phase.
    pub fn dependents(&self, index: PhaseIndex) -> &[PhaseIndex] {
        self.forward_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Phases the given phase depends on.
    pub fn dependencies(&self, index: PhaseIndex) -> &[PhaseIndex] {
        self.reverse_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Phases with no dependencies (entry points).
    pub fn root_phases(&self) -> Vec<PhaseIndex> {
        self.reverse_edges
            .iter()
            .enumerate()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(i, _)| i)
            .collect()
    }

    /// Phases nothing else depends on (exit points).
    pub fn leaf_phases(&self) -> Vec<PhaseIndex> {
        self.forward_edges
            .iter()
            .enumerate()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(i, _)| i)
            .collect()
    }

    pub fn dependencies_satisfied(
        &self,
        index: PhaseIndex,
        completed: &HashSet<PhaseIndex>,
    ) -> bool {
        self.dependencies(index)
            .iter()
            .all(|dep| completed.contains(dep))
    }

    /// Every phase reachable through dependent edges, excluding `index` itself.
    pub fn transitive_dependents(&self, index: PhaseIndex) -> Vec<PhaseIndex> {
        let mut seen = HashSet::new();
        let mut stack: Vec<PhaseIndex> = self.dependents(index).to_vec();
        let mut out = Vec::new();
        while let Some(next) = stack.pop() {
            if seen.insert(next) {
                out.push(next);
                stack.extend_from_slice(self.dependents(next));
            }
        }
        out.sort_unstable();
        out
    }

    /// A topological order that prefers declaration order among unconstrained phases.
    pub fn topological_order(&self) -> Vec<PhaseIndex> {
        let mut in_degree: Vec<usize> = self.reverse_edges.iter().map(Vec::len).collect();
        let mut order = Vec::with_capacity(self.len());
        let mut placed = vec![false; self.len()];

        while order.len() < self.len() {
            let Some(next) = (0..self.len()).find(|&i| !placed[i] && in_degree[i] == 0) else {
                break;
            };
            placed[next] = true;
            order.push(next);
            for &dependent in self.dependents(next) {
                in_degree[dependent] -= 1;
            }
        }

        order
    }
}

/// Builder for constructing phase graphs.
pub struct DagBuilder {
    nodes: Vec<(String, Vec<String>)>,
}

impl DagBuilder {
    /// Create a builder from `(phase id, dependency ids)` pairs in declaration order.
    pub fn new(nodes: Vec<(String, Vec<String>)>) -> Self {
        Self { nodes }
    }

    pub fn from_specs(phases: &[PhaseSpec]) -> Self {
        Self::new(
            phases
                .iter()
                .map(|p| (p.id.clone(), p.depends_on.clone()))
                .collect(),
        )
    }

    pub fn from_phases(phases: &[Phase]) -> Self {
        Self::new(
            phases
                .iter()
                .map(|p| (p.id.clone(), p.depends_on.clone()))
                .collect(),
        )
    }

    /// Build the phase graph.
    ///
    /// Validates that ids are unique, every dependency names an existing
    /// phase, and the dependency relation has no cycle.
    pub fn build(self) -> Result<PhaseGraph, PlanError> {
        let mut index_map = HashMap::new();
        for (i, (id, _)) in self.nodes.iter().enumerate() {
            if index_map.insert(id.clone(), i).is_some() {
                return Err(PlanError::DuplicatePhase(id.clone()));
            }
        }

        let mut forward_edges: Vec<Vec<PhaseIndex>> = vec![Vec::new(); self.nodes.len()];
        let mut reverse_edges: Vec<Vec<PhaseIndex>> = vec![Vec::new(); self.nodes.len()];

        for (to_idx, (id, deps)) in self.nodes.iter().enumerate() {
            for dep in deps {
                let from_idx = *index_map
                    .get(dep)
                    .ok_or_else(|| PlanError::UnknownDependency {
                        phase: id.clone(),
                        dependency: dep.clone(),
                    })?;

                // A repeated dependency is one edge.
                if reverse_edges[to_idx].contains(&from_idx) {
                    continue;
                }
                forward_edges[from_idx].push(to_idx);
                reverse_edges[to_idx].push(from_idx);
            }
        }

        let graph = PhaseGraph {
            ids: self.nodes.into_iter().map(|(id, _)| id).collect(),
            index_map,
            forward_edges,
            reverse_edges,
        };

        if let Some(cycle) = Self::find_cycle(&graph) {
            return Err(PlanError::DependencyCycle { cycle });
        }

        Ok(graph)
    }

    /// Depth-first search with white/gray/black colouring over dependency edges.
    ///
    /// Returns the ids along the first cycle found, with the entry phase
    /// repeated at the end (`a -> b -> a`).
    fn find_cycle(graph: &PhaseGraph) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let mut color = vec![Color::White; graph.len()];

        for root in 0..graph.len() {
            if color[root] != Color::White {
                continue;
            }

            // (node, index of the next dependency to visit)
            let mut stack: Vec<(PhaseIndex, usize)> = vec![(root, 0)];
            color[root] = Color::Gray;

            while let Some(top) = stack.last_mut() {
                let node = top.0;
                let deps = graph.dependencies(node);
                if top.1 < deps.len() {
                    let dep = deps[top.1];
                    top.1 += 1;
                    match color[dep] {
                        Color::White => {
                            color[dep] = Color::Gray;
                            stack.push((dep, 0));
                        }
                        Color::Gray => {
                            let start = stack.iter().position(|&(n, _)| n == dep).unwrap_or(0);
                            let mut cycle: Vec<String> = stack[start..]
                                .iter()
                                .map(|&(n, _)| graph.ids[n].clone())
                                .collect();
                            cycle.push(graph.ids[dep].clone());
                            return Some(cycle);
                        }
                        Color::Black => {}
                    }
                } else {
                    color[node] = Color::Black;
                    stack.pop();
                }
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, deps: Vec<&str>) -> (String, Vec<String>) {
        (id.to_string(), deps.into_iter().map(String::from).collect())
    }

    #[test]
    fn test_build_simple_graph() {
        let graph = DagBuilder::new(vec![
            node("01", vec![]),
            node("02", vec!["01"]),
            node("03", vec!["01"]),
            node("04", vec!["02", "03"]),
        ])
        .build()
        .unwrap();

        assert_eq!(graph.len(), 4);
        assert_eq!(graph.root_phases(), vec![0]);
        assert_eq!(graph.leaf_phases(), vec![3]);
    }

    #[test]
    fn test_dependencies_and_dependents() {
        let graph = DagBuilder::new(vec![
            node("01", vec![]),
            node("02", vec!["01"]),
            node("03", vec!["01"]),
        ])
        .build()
        .unwrap();

        assert!(graph.dependencies(0).is_empty());
        assert_eq!(graph.dependencies(1), &[0]);
        assert_eq!(graph.dependencies(2), &[0]);
        let dependents = graph.dependents(0);
        assert!(dependents.contains(&1));
        assert!(dependents.contains(&2));
    }

    #[test]
    fn test_cycle_reports_path() {
        let err = DagBuilder::new(vec![
            node("01", vec!["03"]),
            node("02", vec!["01"]),
            node("03", vec!["02"]),
        ])
        .build()
        .unwrap_err();

        match err {
            PlanError::DependencyCycle { cycle } => {
                assert_eq!(cycle, vec!["01", "03", "02", "01"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let err = DagBuilder::new(vec![node("a", vec!["a"])]).build().unwrap_err();
        assert_eq!(
            err,
            PlanError::DependencyCycle {
                cycle: vec!["a".into(), "a".into()]
            }
        );
    }

    #[test]
    fn test_cycle_behind_acyclic_prefix() {
        let err = DagBuilder::new(vec![
            node("root", vec![]),
            node("x", vec!["root", "y"]),
            node("y", vec!["x"]),
        ])
        .build()
        .unwrap_err();
        assert!(matches!(err, PlanError::DependencyCycle { ref cycle } if cycle.contains(&"x".to_string()) && cycle.contains(&"y".to_string())));
    }

    #[test]
    fn test_missing_dependency() {
        let err = DagBuilder::new(vec![node("01", vec!["nonexistent"])])
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            PlanError::UnknownDependency {
                phase: "01".into(),
                dependency: "nonexistent".into()
            }
        );
    }

    #[test]
    fn test_duplicate_phase_id() {
        let err = DagBuilder::new(vec![node("01", vec![]), node("01", vec![])])
            .build()
            .unwrap_err();
        assert_eq!(err, PlanError::DuplicatePhase("01".into()));
    }

    #[test]
    fn test_repeated_dependency_is_one_edge() {
        let graph = DagBuilder::new(vec![node("a", vec![]), node("b", vec!["a", "a"])])
            .build()
            .unwrap();
        assert_eq!(graph.dependencies(1), &[0]);
        assert_eq!(graph.dependents(0), &[1]);
    }

    #[test]
    fn test_empty_graph() {
        let graph = DagBuilder::new(vec![]).build().unwrap();
        assert!(graph.is_empty());
        assert!(graph.topological_order().is_empty());
    }

    #[test]
    fn test_dependencies_satisfied() {
        let graph = DagBuilder::new(vec![
            node("01", vec![]),
            node("02", vec!["01"]),
            node("03", vec!["01", "02"]),
        ])
        .build()
        .unwrap();
        let mut completed = HashSet::new();

        assert!(graph.dependencies_satisfied(0, &completed));
        assert!(!graph.dependencies_satisfied(1, &completed));

        completed.insert(0);
        assert!(graph.dependencies_satisfied(1, &completed));
        assert!(!graph.dependencies_satisfied(2, &completed));

        completed.insert(1);
        assert!(graph.dependencies_satisfied(2, &completed));
    }

    #[test]
    fn test_transitive_dependents() {
        let graph = DagBuilder::new(vec![
            node("a", vec![]),
            node("b", vec!["a"]),
            node("c", vec!["b"]),
            node("d", vec![]),
        ])
        .build()
        .unwrap();
        assert_eq!(graph.transitive_dependents(0), vec![1, 2]);
        assert!(graph.transitive_dependents(3).is_empty());
    }

    #[test]
    fn test_topological_order_prefers_declaration_order() {
        let graph = DagBuilder::new(vec![
            node("late", vec!["early"]),
            node("early", vec![]),
            node("free", vec![]),
        ])
        .build()
        .unwrap();
        assert_eq!(graph.topological_order(), vec![1, 0, 2]);
    }
}
