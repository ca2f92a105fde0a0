//! Dependency graph scoped to one crawl run, used for structural cycle
//! detection before recursing into a dependency.

use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::types::ProjectName;

/// Directed graph of project dependencies. Edge insertion is rejected when
/// it would close a cycle, so the graph stays acyclic by construction.
#[derive(Default)]
pub struct DepGraph {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    graph: DiGraph<ProjectName, ()>,
    nodes: HashMap<ProjectName, NodeIndex>,
}

impl DepGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `from -> to`. Returns `true` when the edge would create a
    /// cycle; in that case the graph is left unchanged.
    pub fn creates_cycle(&self, from: &ProjectName, to: &ProjectName) -> bool {
        let mut inner = self.inner.lock().expect("dep graph lock");
        let from_idx = Self::node(&mut inner, from);
        let to_idx = Self::node(&mut inner, to);
        if from_idx == to_idx {
            return true;
        }
        if has_path_connecting(&inner.graph, to_idx, from_idx, None) {
            return true;
        }
        inner.graph.add_edge(from_idx, to_idx, ());
        false
    }

    fn node(inner: &mut Inner, name: &ProjectName) -> NodeIndex {
        if let Some(&idx) = inner.nodes.get(name) {
            return idx;
        }
        let idx = inner.graph.add_node(name.clone());
        inner.nodes.insert(name.clone(), idx);
        idx
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("dep graph lock").graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_acyclic_edges() {
        let graph = DepGraph::new();
        assert!(!graph.creates_cycle(&"a".into(), &"b".into()));
        assert!(!graph.creates_cycle(&"b".into(), &"c".into()));
        assert!(!graph.creates_cycle(&"a".into(), &"c".into()));
    }

    #[test]
    fn rejects_direct_and_transitive_cycles() {
        let graph = DepGraph::new();
        assert!(!graph.creates_cycle(&"a".into(), &"b".into()));
        assert!(graph.creates_cycle(&"b".into(), &"a".into()));
        assert!(!graph.creates_cycle(&"b".into(), &"c".into()));
        assert!(graph.creates_cycle(&"c".into(), &"a".into()));
        assert!(graph.creates_cycle(&"a".into(), &"a".into()));
    }

    #[test]
    fn rejected_edges_leave_graph_usable() {
        let graph = DepGraph::new();
        assert!(!graph.creates_cycle(&"a".into(), &"b".into()));
        assert!(graph.creates_cycle(&"b".into(), &"a".into()));
        // The rejected edge was rolled back, so this is still acyclic.
        assert!(!graph.creates_cycle(&"b".into(), &"c".into()));
        assert!(!graph.creates_cycle(&"c".into(), &"d".into()));
    }

    #[test]
    fn name_spellings_collapse_to_one_node() {
        let graph = DepGraph::new();
        assert!(!graph.creates_cycle(&"Foo.Bar".into(), &"baz".into()));
        assert!(graph.creates_cycle(&"baz".into(), &"foo-bar".into()));
        assert_eq!(graph.len(), 2);
    }
}
