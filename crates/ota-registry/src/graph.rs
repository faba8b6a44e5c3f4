//! Dependency graph over Active services
//!
//! Edges are derived on demand from descriptors' dependency lists and point
//! from a service to what it depends on. Nothing here is stored; a graph is
//! built from a snapshot, inspected, and dropped.

use crate::descriptor::ServiceDescriptor;
use crate::registry::RegistryState;
use petgraph::graphmap::DiGraphMap;
use petgraph::Direction;
use std::collections::HashSet;

/// Directed service dependency graph
#[derive(Debug, Clone)]
pub struct DependencyGraph<'a> {
    graph: DiGraphMap<&'a str, ()>,
}

impl<'a> DependencyGraph<'a> {
    /// Graph induced by the Active entries of `state`
    #[must_use]
    pub fn from_state(state: &'a RegistryState) -> Self {
        let mut graph = DiGraphMap::new();
        for entry in state.entries() {
            add_descriptor(&mut graph, entry.descriptor());
        }
        Self { graph }
    }

    /// Same graph with `candidate` hypothetically installed
    ///
    /// The candidate's outgoing edges replace those of any Active version
    /// of the same name.
    #[must_use]
    pub fn with_candidate(state: &'a RegistryState, candidate: &'a ServiceDescriptor) -> Self {
        let mut graph = DiGraphMap::new();
        for entry in state.entries() {
            if entry.name() != candidate.name() {
                add_descriptor(&mut graph, entry.descriptor());
            }
        }
        add_descriptor(&mut graph, candidate);
        Self { graph }
    }

    /// Number of services (including declared but absent dependencies)
    #[inline]
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Names of services that `name` depends on directly
    #[must_use]
    pub fn dependencies_of(&self, name: &str) -> Vec<&'a str> {
        self.neighbors(name, Direction::Outgoing)
    }

    /// Names of services that depend on `name` directly
    #[must_use]
    pub fn dependents_of(&self, name: &str) -> Vec<&'a str> {
        self.neighbors(name, Direction::Incoming)
    }

    /// First cycle reachable from `start`, as a closed path
    ///
    /// The path begins and ends with the same name, e.g. `[C, D, C]`.
    #[must_use]
    pub fn find_cycle_from(&self, start: &str) -> Option<Vec<String>> {
        let start = self.node(start)?;
        let mut visited = HashSet::new();
        let mut stack = Vec::new();
        self.dfs(start, &mut visited, &mut stack)
    }

    /// Any cycle in the graph
    ///
    /// Nodes are visited in name order so the reported path is stable.
    #[must_use]
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut nodes: Vec<_> = self.graph.nodes().collect();
        nodes.sort_unstable();

        let mut visited = HashSet::new();
        for node in nodes {
            if visited.contains(node) {
                continue;
            }
            let mut stack = Vec::new();
            if let Some(path) = self.dfs(node, &mut visited, &mut stack) {
                return Some(path);
            }
        }
        None
    }

    /// Services ordered so every dependency precedes its dependents
    ///
    /// Returns `None` if the graph has a cycle.
    #[must_use]
    pub fn activation_order(&self) -> Option<Vec<&'a str>> {
        let mut order = petgraph::algo::toposort(&self.graph, None).ok()?;
        // edges point at dependencies, so toposort yields dependents first
        order.reverse();
        Some(order)
    }

    fn node(&self, name: &str) -> Option<&'a str> {
        self.graph.nodes().find(|n| *n == name)
    }

    fn neighbors(&self, name: &str, dir: Direction) -> Vec<&'a str> {
        let Some(node) = self.node(name) else {
            return Vec::new();
        };
        let mut out: Vec<_> = self.graph.neighbors_directed(node, dir).collect();
        out.sort_unstable();
        out
    }

    fn dfs(&self, node: &'a str, visited: &mut HashSet<&'a str>, stack: &mut Vec<&'a str>) -> Option<Vec<String>> {
        if let Some(pos) = stack.iter().position(|n| *n == node) {
            let mut path: Vec<String> = stack[pos..].iter().map(|n| (*n).to_string()).collect();
            path.push(node.to_string());
            return Some(path);
        }
        if !visited.insert(node) {
            return None;
        }

        stack.push(node);
        let mut next: Vec<_> = self.graph.neighbors_directed(node, Direction::Outgoing).collect();
        next.sort_unstable();
        for dep in next {
            if let Some(path) = self.dfs(dep, visited, stack) {
                return Some(path);
            }
        }
        stack.pop();
        None
    }
}

fn add_descriptor<'a>(graph: &mut DiGraphMap<&'a str, ()>, descriptor: &'a ServiceDescriptor) {
    graph.add_node(descriptor.name());
    for dep in descriptor.dependencies() {
        graph.add_edge(descriptor.name(), dep.name.as_str(), ());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Language;
    use crate::registry::{ServiceRegistry, Snapshot};
    use semver::Version;

    fn descriptor(name: &str, deps: &[&str]) -> ServiceDescriptor {
        deps.iter()
            .fold(
                ServiceDescriptor::builder(name, Language::Rust, Version::new(1, 0, 0)),
                |b, d| b.depends_on(*d, "*"),
            )
            .build()
            .unwrap()
    }

    fn snapshot_with(services: &[ServiceDescriptor]) -> Snapshot {
        let registry = ServiceRegistry::new();
        for d in services {
            let txn = registry.begin_transaction(&registry.snapshot()).unwrap();
            registry.commit(txn, d.clone()).unwrap();
        }
        registry.snapshot()
    }

    #[test]
    fn candidate_closing_a_loop_is_detected() {
        let snap = snapshot_with(&[descriptor("D", &["C"])]);
        let candidate = descriptor("C", &["D"]);
        let graph = DependencyGraph::with_candidate(&snap, &candidate);

        assert_eq!(
            graph.find_cycle_from("C"),
            Some(vec!["C".to_string(), "D".to_string(), "C".to_string()])
        );
    }

    #[test]
    fn candidate_replaces_prior_edges() {
        let snap = snapshot_with(&[descriptor("A", &[]), descriptor("B", &["A"])]);
        // A used to depend on nothing; a new A depending on B closes A -> B -> A
        let candidate = descriptor("A", &["B"]);
        assert!(DependencyGraph::with_candidate(&snap, &candidate).find_cycle().is_some());

        // B re-declared without the edge is fine
        let candidate = descriptor("B", &[]);
        let graph = DependencyGraph::with_candidate(&snap, &candidate);
        assert!(graph.find_cycle().is_none());
        assert!(graph.dependencies_of("B").is_empty());
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let snap = snapshot_with(&[]);
        let candidate = descriptor("A", &["A"]);
        let graph = DependencyGraph::with_candidate(&snap, &candidate);
        assert_eq!(graph.find_cycle_from("A"), Some(vec!["A".to_string(), "A".to_string()]));
    }

    #[test]
    fn activation_order_puts_dependencies_first() {
        let snap = snapshot_with(&[
            descriptor("A", &[]),
            descriptor("B", &["A"]),
            descriptor("C", &["A", "B"]),
        ]);
        let graph = DependencyGraph::from_state(&snap);
        let order = graph.activation_order().unwrap();

        let pos = |n: &str| order.iter().position(|x| *x == n).unwrap();
        assert!(pos("A") < pos("B"));
        assert!(pos("B") < pos("C"));
        assert_eq!(graph.dependents_of("A"), vec!["B", "C"]);
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        let snap = snapshot_with(&[
            descriptor("A", &[]),
            descriptor("B", &["A"]),
            descriptor("C", &["A"]),
        ]);
        let candidate = descriptor("D", &["B", "C"]);
        let graph = DependencyGraph::with_candidate(&snap, &candidate);
        assert!(graph.find_cycle().is_none());
        assert_eq!(graph.node_count(), 4);
    }
}
