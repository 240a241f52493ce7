//! Stage dependency graph.
//!
//! Plans declare stage ordering through dependency lists; this module turns
//! those lists into a petgraph-backed graph used for validation (cycles,
//! dangling references), readiness queries, and deterministic ordering.
//!
//! Internal to `hypshard-engine` to preserve freedom to change internals.

use std::collections::{HashMap, VecDeque};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

use crate::error::{Error, Result};

/// Dependency graph over stage ids.
///
/// Edges point from a dependency to its dependent, so `a -> b` means stage
/// `b` waits on stage `a`. Traversal results use insertion order as the
/// tie-break so plan validation and scheduling are reproducible.
#[derive(Debug, Clone, Default)]
pub struct StageGraph {
    graph: DiGraph<String, ()>,
    index_map: HashMap<String, NodeIndex>,
    /// Insertion order for deterministic tie-breaking in toposort.
    insertion_order: Vec<NodeIndex>,
}

impl StageGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a graph from `(stage_id, dependencies)` pairs.
    ///
    /// # Errors
    ///
    /// Returns `PlanValidation` if a dependency names a stage that is not
    /// in the plan.
    pub fn from_stages<'a, I>(stages: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a [String])> + Clone,
    {
        let mut graph = Self::new();
        for (id, _) in stages.clone() {
            graph.add_stage(id);
        }
        for (id, deps) in stages {
            for dep in deps {
                graph.add_dependency(dep, id)?;
            }
        }
        Ok(graph)
    }

    /// Returns the number of stages in the graph.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Adds a stage node. Re-adding an existing stage is a no-op.
    pub fn add_stage(&mut self, stage_id: impl Into<String>) -> NodeIndex {
        let stage_id = stage_id.into();
        if let Some(&idx) = self.index_map.get(&stage_id) {
            return idx;
        }
        let idx = self.graph.add_node(stage_id.clone());
        self.index_map.insert(stage_id, idx);
        self.insertion_order.push(idx);
        idx
    }

    /// Records that `dependent` waits on `dependency`.
    ///
    /// # Errors
    ///
    /// Returns `PlanValidation` if either stage is unknown.
    pub fn add_dependency(&mut self, dependency: &str, dependent: &str) -> Result<()> {
        let from = self.index_of(dependency)?;
        let to = self.index_of(dependent)?;
        self.graph.add_edge(from, to, ());
        Ok(())
    }

    fn index_of(&self, stage_id: &str) -> Result<NodeIndex> {
        self.index_map
            .get(stage_id)
            .copied()
            .ok_or_else(|| Error::PlanValidation {
                message: format!("dependency references unknown stage: {stage_id}"),
            })
    }

    /// Returns true if the stage exists in the graph.
    #[must_use]
    pub fn contains(&self, stage_id: &str) -> bool {
        self.index_map.contains_key(stage_id)
    }

    /// Returns stage ids in a topological order.
    ///
    /// Kahn's algorithm with insertion-order tie-breaking: when multiple
    /// stages have zero in-degree they are emitted in the order they were
    /// added, so the result is stable across runs.
    ///
    /// # Errors
    ///
    /// Returns `PlanValidation` naming a stage on the cycle if the graph
    /// is not acyclic.
    pub fn toposort(&self) -> Result<Vec<String>> {
        let node_count = self.graph.node_count();
        if node_count == 0 {
            return Ok(Vec::new());
        }

        let mut in_degree: HashMap<NodeIndex, usize> = HashMap::with_capacity(node_count);
        for idx in self.graph.node_indices() {
            in_degree.insert(idx, 0);
        }
        for edge in self.graph.edge_references() {
            *in_degree.entry(edge.target()).or_insert(0) += 1;
        }

        let mut queue: VecDeque<NodeIndex> = self
            .insertion_order
            .iter()
            .filter(|&&idx| in_degree.get(&idx).copied().unwrap_or(0) == 0)
            .copied()
            .collect();

        let mut result = Vec::with_capacity(node_count);

        while let Some(idx) = queue.pop_front() {
            if let Some(stage) = self.graph.node_weight(idx) {
                result.push(stage.clone());
            }

            let mut neighbors: Vec<NodeIndex> = self
                .graph
                .neighbors_directed(idx, Direction::Outgoing)
                .collect();
            neighbors.sort_by_key(|n| self.insertion_position(*n));

            for neighbor in neighbors {
                if let Some(deg) = in_degree.get_mut(&neighbor) {
                    *deg = deg.saturating_sub(1);
                    if *deg == 0 {
                        queue.push_back(neighbor);
                    }
                }
            }
        }

        if result.len() != node_count {
            let cycle_stage = self
                .insertion_order
                .iter()
                .find(|&&idx| in_degree.get(&idx).copied().unwrap_or(0) > 0)
                .and_then(|&idx| self.graph.node_weight(idx))
                .map_or_else(|| "unknown".to_string(), Clone::clone);

            return Err(Error::PlanValidation {
                message: format!("dependency cycle detected involving stage: {cycle_stage}"),
            });
        }

        Ok(result)
    }

    /// Returns the stages `stage_id` waits on, in insertion order.
    ///
    /// # Errors
    ///
    /// Returns `PlanValidation` if the stage is unknown.
    pub fn dependencies_of(&self, stage_id: &str) -> Result<Vec<String>> {
        let idx = self.index_of(stage_id)?;
        Ok(self.sorted_neighbors(idx, Direction::Incoming))
    }

    /// Returns the stages waiting on `stage_id`, in insertion order.
    ///
    /// # Errors
    ///
    /// Returns `PlanValidation` if the stage is unknown.
    pub fn dependents_of(&self, stage_id: &str) -> Result<Vec<String>> {
        let idx = self.index_of(stage_id)?;
        Ok(self.sorted_neighbors(idx, Direction::Outgoing))
    }

    /// Returns stages with no dependencies, in insertion order.
    ///
    /// These are the stages eligible to partition as soon as the plan is
    /// submitted.
    #[must_use]
    pub fn roots(&self) -> Vec<String> {
        let mut indices: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|&idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .count()
                    == 0
            })
            .collect();
        indices.sort_by_key(|n| self.insertion_position(*n));

        indices
            .into_iter()
            .filter_map(|idx| self.graph.node_weight(idx).cloned())
            .collect()
    }

    fn sorted_neighbors(&self, idx: NodeIndex, dir: Direction) -> Vec<String> {
        let mut neighbors: Vec<NodeIndex> = self.graph.neighbors_directed(idx, dir).collect();
        neighbors.sort_by_key(|n| self.insertion_position(*n));
        neighbors
            .into_iter()
            .filter_map(|n| self.graph.node_weight(n).cloned())
            .collect()
    }

    fn insertion_position(&self, idx: NodeIndex) -> usize {
        self.insertion_order
            .iter()
            .position(|&i| i == idx)
            .unwrap_or(usize::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_of(stages: &[(&str, &[&str])]) -> StageGraph {
        let mut g = StageGraph::new();
        for (id, _) in stages {
            g.add_stage(*id);
        }
        for (id, deps) in stages {
            for dep in *deps {
                g.add_dependency(dep, id).unwrap();
            }
        }
        g
    }

    #[test]
    fn empty_graph_sorts_to_nothing() {
        let g = StageGraph::new();
        assert!(g.toposort().unwrap().is_empty());
    }

    #[test]
    fn linear_chain_sorts_in_order() {
        let g = graph_of(&[("pack", &[]), ("warm", &["pack"]), ("index", &["warm"])]);
        assert_eq!(g.toposort().unwrap(), vec!["pack", "warm", "index"]);
    }

    #[test]
    fn cycle_is_rejected() {
        let mut g = StageGraph::new();
        g.add_stage("a");
        g.add_stage("b");
        g.add_dependency("a", "b").unwrap();
        g.add_dependency("b", "a").unwrap();

        let err = g.toposort();
        assert!(matches!(err, Err(Error::PlanValidation { .. })));
    }

    #[test]
    fn dangling_dependency_is_rejected() {
        let mut g = StageGraph::new();
        g.add_stage("a");
        let err = g.add_dependency("missing", "a");
        assert!(matches!(err, Err(Error::PlanValidation { .. })));
    }

    #[test]
    fn roots_are_dependency_free_stages() {
        let g = graph_of(&[
            ("pack", &[]),
            ("warm", &[]),
            ("index", &["pack", "warm"]),
        ]);
        assert_eq!(g.roots(), vec!["pack", "warm"]);
    }

    #[test]
    fn dependents_follow_insertion_order() {
        let g = graph_of(&[
            ("pack", &[]),
            ("warm", &["pack"]),
            ("index", &["pack"]),
        ]);
        assert_eq!(g.dependents_of("pack").unwrap(), vec!["warm", "index"]);
        assert_eq!(g.dependencies_of("index").unwrap(), vec!["pack"]);
    }

    #[test]
    fn toposort_is_deterministic_across_calls() {
        let g = graph_of(&[
            ("a", &[]),
            ("b", &[]),
            ("c", &["a"]),
            ("d", &["b"]),
        ]);
        let first = g.toposort().unwrap();
        assert_eq!(first, vec!["a", "b", "c", "d"]);
        assert_eq!(g.toposort().unwrap(), first);
    }

    #[test]
    fn diamond_respects_all_edges() {
        let g = graph_of(&[
            ("top", &[]),
            ("left", &["top"]),
            ("right", &["top"]),
            ("bottom", &["left", "right"]),
        ]);
        let sorted = g.toposort().unwrap();
        let pos = |s: &str| sorted.iter().position(|x| x == s).unwrap();
        assert!(pos("top") < pos("left"));
        assert!(pos("top") < pos("right"));
        assert!(pos("left") < pos("bottom"));
        assert!(pos("right") < pos("bottom"));
    }

    #[test]
    fn from_stages_builds_and_validates() {
        let deps_warm = vec!["pack".to_string()];
        let no_deps: Vec<String> = vec![];
        let stages: Vec<(&str, &[String])> =
            vec![("pack", no_deps.as_slice()), ("warm", deps_warm.as_slice())];
        let g = StageGraph::from_stages(stages).unwrap();
        assert_eq!(g.stage_count(), 2);
        assert_eq!(g.toposort().unwrap(), vec!["pack", "warm"]);
    }
}
