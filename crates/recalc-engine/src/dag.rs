//! Directed graph with deterministic topological ordering.
//!
//! This module provides the ordering primitive used by the planner:
//! - Kahn's algorithm with insertion-order tie-breaking
//! - Partial sorts that keep going past cycles and report the unsortable residual
//! - Cycle extraction over the residual for diagnostics
//!
//! **Note:** This module is internal to `recalc-engine` to preserve freedom to change internals.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Display;
use std::hash::Hash;

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

use crate::error::{Error, Result};

/// Result of a partial topological sort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopoOrder<T> {
    /// Nodes in dependency order.
    pub sorted: Vec<T>,
    /// Nodes on or downstream of a cycle, in insertion order.
    pub unsorted: Vec<T>,
}

impl<T> TopoOrder<T> {
    /// Returns true if every node was sorted.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.unsorted.is_empty()
    }
}

/// A directed graph for dependency ordering.
///
/// Node indices are handed out in insertion order and nodes are never removed, so a
/// node's index doubles as its insertion position for tie-breaking.
#[derive(Debug, Clone)]
pub struct Dag<T>
where
    T: Clone + Eq + Hash + Display,
{
    graph: DiGraph<T, ()>,
    index_map: HashMap<T, NodeIndex>,
}

impl<T> Dag<T>
where
    T: Clone + Eq + Hash + Display,
{
    /// Creates a new empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            index_map: HashMap::new(),
        }
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Adds a node; existing nodes are returned unchanged.
    pub fn add_node(&mut self, value: T) -> NodeIndex {
        if let Some(&idx) = self.index_map.get(&value) {
            return idx;
        }
        let idx = self.graph.add_node(value.clone());
        self.index_map.insert(value, idx);
        idx
    }

    /// Adds a directed edge from `from` to `to`. Parallel edges collapse into one.
    ///
    /// # Errors
    ///
    /// Returns an error if either node index is invalid.
    pub fn add_edge(&mut self, from: NodeIndex, to: NodeIndex) -> Result<()> {
        self.weight(from)?;
        self.weight(to)?;
        self.graph.update_edge(from, to, ());
        Ok(())
    }

    /// Returns the node index for a value, if it exists.
    #[must_use]
    pub fn get_index(&self, value: &T) -> Option<NodeIndex> {
        self.index_map.get(value).copied()
    }

    fn weight(&self, idx: NodeIndex) -> Result<&T> {
        self.graph.node_weight(idx).ok_or_else(|| Error::DagNodeNotFound {
            node: format!("index {}", idx.index()),
        })
    }

    fn sorted_neighbors(&self, idx: NodeIndex, direction: Direction) -> Vec<NodeIndex> {
        let mut neighbors: Vec<NodeIndex> = self.graph.neighbors_directed(idx, direction).collect();
        neighbors.sort_by_key(|n| n.index());
        neighbors.dedup();
        neighbors
    }

    /// Sorts as much of the graph as possible.
    ///
    /// Uses Kahn's algorithm; when several nodes have zero in-degree they are emitted
    /// in insertion order. Nodes that never reach zero in-degree (members of a cycle
    /// and everything downstream of one) are returned in `unsorted`.
    #[must_use]
    pub fn partial_toposort(&self) -> TopoOrder<T> {
        let node_count = self.graph.node_count();
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|idx| (idx, 0))
            .collect();
        for edge in self.graph.edge_references() {
            *in_degree.entry(edge.target()).or_insert(0) += 1;
        }

        let mut queue: VecDeque<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|idx| in_degree.get(idx).copied().unwrap_or(0) == 0)
            .collect();

        let mut visited = HashSet::with_capacity(node_count);
        let mut sorted = Vec::with_capacity(node_count);
        while let Some(idx) = queue.pop_front() {
            if let Some(node) = self.graph.node_weight(idx) {
                sorted.push(node.clone());
            }
            visited.insert(idx);

            for neighbor in self.sorted_neighbors(idx, Direction::Outgoing) {
                if let Some(deg) = in_degree.get_mut(&neighbor) {
                    *deg = deg.saturating_sub(1);
                    if *deg == 0 {
                        queue.push_back(neighbor);
                    }
                }
            }
        }

        let unsorted = self
            .graph
            .node_indices()
            .filter(|idx| !visited.contains(idx))
            .filter_map(|idx| self.graph.node_weight(idx).cloned())
            .collect();

        TopoOrder { sorted, unsorted }
    }

    /// Returns a topologically sorted list of nodes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CycleDetected`] with one concrete cycle if the graph is cyclic.
    pub fn toposort(&self) -> Result<Vec<T>> {
        let order = self.partial_toposort();
        if order.is_complete() {
            return Ok(order.sorted);
        }
        let cycle = self
            .find_cycle(&order.unsorted)
            .unwrap_or_else(|| order.unsorted.clone());
        Err(Error::CycleDetected {
            cycle: cycle.iter().map(ToString::to_string).collect(),
        })
    }

    /// Finds one cycle among `residual` (the unsorted nodes of a partial sort).
    ///
    /// Every residual node has a predecessor inside the residual, so walking
    /// predecessors from any residual node must revisit a node. The returned path is in
    /// edge direction and closed: its first and last elements are the same node.
    #[must_use]
    pub fn find_cycle(&self, residual: &[T]) -> Option<Vec<T>> {
        let members: HashSet<NodeIndex> = residual
            .iter()
            .filter_map(|node| self.get_index(node))
            .collect();
        let start = members.iter().min_by_key(|idx| idx.index()).copied()?;

        let mut path: Vec<NodeIndex> = Vec::new();
        let mut position: HashMap<NodeIndex, usize> = HashMap::new();
        let mut current = start;
        loop {
            if let Some(&at) = position.get(&current) {
                let mut cycle: Vec<NodeIndex> = path[at..].to_vec();
                cycle.reverse();
                cycle.push(cycle[0]);
                return Some(
                    cycle
                        .into_iter()
                        .filter_map(|idx| self.graph.node_weight(idx).cloned())
                        .collect(),
                );
            }
            position.insert(current, path.len());
            path.push(current);
            current = self
                .sorted_neighbors(current, Direction::Incoming)
                .into_iter()
                .find(|idx| members.contains(idx))?;
        }
    }

    /// Returns the upstream dependencies of a node, in insertion order.
    ///
    /// # Errors
    ///
    /// Returns an error if the node does not exist.
    pub fn upstream(&self, node: &T) -> Result<Vec<T>> {
        let idx = self.get_index(node).ok_or_else(|| Error::DagNodeNotFound {
            node: node.to_string(),
        })?;
        Ok(self
            .sorted_neighbors(idx, Direction::Incoming)
            .into_iter()
            .filter_map(|n| self.graph.node_weight(n).cloned())
            .collect())
    }
}

impl<T> Default for Dag<T>
where
    T: Clone + Eq + Hash + Display,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(nodes: &[&str], edges: &[(&str, &str)]) -> Dag<String> {
        let mut dag = Dag::new();
        for node in nodes {
            dag.add_node((*node).to_string());
        }
        for (from, to) in edges {
            let from = dag.add_node((*from).to_string());
            let to = dag.add_node((*to).to_string());
            dag.add_edge(from, to).unwrap();
        }
        dag
    }

    #[test]
    fn empty_dag_sorts_to_nothing() {
        let dag: Dag<String> = Dag::new();
        assert_eq!(dag.node_count(), 0);
        assert!(dag.toposort().unwrap().is_empty());
    }

    #[test]
    fn linear_dag_sorts_correctly() {
        let dag = build(&["c", "b", "a"], &[("a", "b"), ("b", "c")]);
        assert_eq!(dag.toposort().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn toposort_is_deterministic_with_multiple_roots() {
        let dag = build(&["a", "b", "c", "d"], &[("a", "c"), ("b", "d")]);
        let sorted = dag.toposort().unwrap();
        assert_eq!(sorted, vec!["a", "b", "c", "d"]);
        assert_eq!(dag.toposort().unwrap(), sorted);
    }

    #[test]
    fn partial_sort_reports_cycle_and_downstream() {
        // a -> b -> c -> d -> b, d -> e
        let dag = build(
            &["a", "b", "c", "d", "e"],
            &[("a", "b"), ("b", "c"), ("c", "d"), ("d", "b"), ("d", "e")],
        );
        let order = dag.partial_toposort();
        assert_eq!(order.sorted, vec!["a"]);
        assert_eq!(order.unsorted, vec!["b", "c", "d", "e"]);
        assert!(!order.is_complete());

        let cycle = dag.find_cycle(&order.unsorted).unwrap();
        assert_eq!(cycle.first(), cycle.last());
        let mut members: Vec<_> = cycle[..cycle.len() - 1].to_vec();
        members.sort();
        assert_eq!(members, vec!["b", "c", "d"]);
    }

    #[test]
    fn cycle_path_follows_edge_direction() {
        let dag = build(&["x", "y"], &[("x", "y"), ("y", "x")]);
        let cycle = dag.find_cycle(&["x".to_string(), "y".to_string()]).unwrap();
        assert_eq!(cycle.len(), 3);
        for pair in cycle.windows(2) {
            let downstream = dag.get_index(&pair[0]).unwrap();
            let target = dag.get_index(&pair[1]).unwrap();
            assert!(dag.graph.contains_edge(downstream, target));
        }
    }

    #[test]
    fn toposort_fails_on_cycle() {
        let dag = build(&["a", "b"], &[("a", "b"), ("b", "a")]);
        assert!(matches!(dag.toposort(), Err(Error::CycleDetected { .. })));
    }

    #[test]
    fn upstream_is_in_insertion_order_and_deduplicated() {
        let mut dag = build(&["a", "b", "c"], &[("b", "c"), ("a", "c")]);
        let a = dag.get_index(&"a".to_string()).unwrap();
        let c = dag.get_index(&"c".to_string()).unwrap();
        dag.add_edge(a, c).unwrap();
        assert_eq!(dag.upstream(&"c".to_string()).unwrap(), vec!["a", "b"]);
        assert!(dag.upstream(&"zz".to_string()).is_err());
    }
}
