//! Acyclic dependency graph of resource nodes.

use std::collections::{BTreeMap, BTreeSet};

use super::node::ResourceNode;
use crate::error::GraphError;

/// A directed acyclic graph of resource nodes, keyed by identifier.
///
/// Edges point from a node to the nodes it depends on. The graph only grows
/// through [`ResourceGraph::add_node`], which refuses any node whose edges
/// would close a cycle, so every graph value is acyclic.
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    nodes: BTreeMap<String, ResourceNode>,
}

impl ResourceGraph {
    /// Creates an empty graph.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
        }
    }

    /// Builds a graph from a list of nodes.
    ///
    /// # Errors
    ///
    /// Returns an error if an identifier repeats or the nodes form a cycle.
    pub fn from_nodes<I>(nodes: I) -> Result<Self, GraphError>
    where
        I: IntoIterator<Item = ResourceNode>,
    {
        let mut graph = Self::new();
        for node in nodes {
            graph.add_node(node)?;
        }
        Ok(graph)
    }

    /// Adds a node to the graph.
    ///
    /// Dependencies on identifiers that are not in the graph yet are allowed;
    /// the edge is checked again when the referenced node is added.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::DuplicateNode` if the identifier is taken, or
    /// `GraphError::Cycle` naming the cycle if the node's edges would close one.
    pub fn add_node(&mut self, node: ResourceNode) -> Result<(), GraphError> {
        if self.nodes.contains_key(&node.id) {
            return Err(GraphError::DuplicateNode { id: node.id });
        }

        for dep in &node.depends_on {
            if *dep == node.id {
                return Err(GraphError::Cycle {
                    cycle: vec![node.id.clone(), node.id.clone()],
                });
            }
            let mut visited = BTreeSet::new();
            let mut path = vec![node.id.clone()];
            if self.find_path(dep, &node.id, &mut visited, &mut path) {
                return Err(GraphError::Cycle { cycle: path });
            }
        }

        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    /// Depth-first search along dependency edges from `from` to `target`.
    ///
    /// On success `path` holds every identifier visited on the way, ending with `target`.
    fn find_path(
        &self,
        from: &str,
        target: &str,
        visited: &mut BTreeSet<String>,
        path: &mut Vec<String>,
    ) -> bool {
        path.push(from.to_string());
        if from == target {
            return true;
        }
        if visited.insert(from.to_string())
            && let Some(node) = self.nodes.get(from)
        {
            for dep in &node.depends_on {
                if self.find_path(dep, target, visited, path) {
                    return true;
                }
            }
        }
        path.pop();
        false
    }

    /// Removes a node and returns it.
    ///
    /// Edges from other nodes to the removed identifier are kept and become
    /// dangling until a node with that identifier is added again.
    pub fn remove_node(&mut self, id: &str) -> Option<ResourceNode> {
        self.nodes.remove(id)
    }

    /// Returns the node with the given identifier.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ResourceNode> {
        self.nodes.get(id)
    }

    /// Returns true if the graph holds a node with this identifier.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterates over the nodes in identifier order.
    pub fn nodes(&self) -> impl Iterator<Item = &ResourceNode> {
        self.nodes.values()
    }

    /// Returns a deterministic topological order of the node identifiers.
    ///
    /// Every node appears after all of its dependencies. Among nodes that are
    /// ready at the same time the smallest identifier goes first. Edges to
    /// identifiers absent from the graph are ignored.
    #[must_use]
    pub fn resolve_order(&self) -> Vec<String> {
        let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

        for (id, node) in &self.nodes {
            let deps: BTreeSet<&str> = node
                .depends_on
                .iter()
                .map(String::as_str)
                .filter(|d| self.nodes.contains_key(*d))
                .collect();
            in_degree.insert(id.as_str(), deps.len());
            for dep in deps {
                dependents.entry(dep).or_default().push(id.as_str());
            }
        }

        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(id) = ready.pop_first() {
            order.push(id.to_string());
            for child in dependents.get(id).into_iter().flatten() {
                if let Some(count) = in_degree.get_mut(child) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        ready.insert(*child);
                    }
                }
            }
        }

        order
    }

    /// Returns `(node, dependency)` pairs whose dependency is not in the graph.
    #[must_use]
    pub fn missing_dependencies(&self) -> Vec<(String, String)> {
        self.nodes
            .values()
            .flat_map(|node| {
                node.depends_on
                    .iter()
                    .filter(|dep| !self.nodes.contains_key(*dep))
                    .map(|dep| (node.id.clone(), dep.clone()))
            })
            .collect()
    }

    /// Returns the identifiers of the nodes that depend directly on `id`.
    #[must_use]
    pub fn dependents(&self, id: &str) -> Vec<String> {
        self.nodes
            .values()
            .filter(|node| node.depends_on.iter().any(|d| d == id))
            .map(|node| node.id.clone())
            .collect()
    }

    /// Returns every identifier `id` depends on, directly or transitively.
    #[must_use]
    pub fn transitive_dependencies(&self, id: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&str> = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.get(current) {
                for dep in &node.depends_on {
                    if seen.insert(dep.clone()) {
                        stack.push(dep);
                    }
                }
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ResourceKind;
    use pretty_assertions::assert_eq;

    fn node(id: &str, deps: &[&str]) -> ResourceNode {
        deps.iter().fold(ResourceNode::new(ResourceKind::Cluster, id), |n, d| {
            n.with_dependency(*d)
        })
    }

    fn position(order: &[String], id: &str) -> usize {
        order.iter().position(|x| x == id).unwrap()
    }

    #[test]
    fn test_resolve_order_respects_dependencies() {
        let graph = ResourceGraph::from_nodes([
            node("addon-lb", &["eks"]),
            node("eks", &["network"]),
            node("pool-a", &["eks"]),
            node("addon-ca", &["eks", "addon-ssm"]),
            node("addon-ssm", &["eks"]),
            node("network", &[]),
        ])
        .unwrap();

        let order = graph.resolve_order();
        assert_eq!(order.len(), 6);
        for n in graph.nodes() {
            for dep in &n.depends_on {
                assert!(position(&order, dep) < position(&order, &n.id));
            }
        }
    }

    #[test]
    fn test_resolve_order_breaks_ties_by_identifier() {
        let graph = ResourceGraph::from_nodes([
            node("c", &["root"]),
            node("a", &["root"]),
            node("root", &[]),
            node("b", &["root"]),
        ])
        .unwrap();

        assert_eq!(graph.resolve_order(), vec!["root", "a", "b", "c"]);
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let mut graph = ResourceGraph::new();
        let err = graph.add_node(node("a", &["a"])).unwrap_err();
        assert_eq!(err, GraphError::Cycle { cycle: vec!["a".into(), "a".into()] });
        assert!(graph.is_empty());
    }

    #[test]
    fn test_cycle_through_forward_reference() {
        let mut graph = ResourceGraph::new();
        graph.add_node(node("a", &["b"])).unwrap();
        graph.add_node(node("b", &["c"])).unwrap();
        let err = graph.add_node(node("c", &["a"])).unwrap_err();

        assert_eq!(
            err,
            GraphError::Cycle {
                cycle: vec!["c".into(), "a".into(), "b".into(), "c".into()]
            }
        );
        assert_eq!(graph.len(), 2);
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let mut graph = ResourceGraph::new();
        graph.add_node(node("a", &[])).unwrap();
        assert_eq!(
            graph.add_node(node("a", &[])).unwrap_err(),
            GraphError::DuplicateNode { id: "a".into() }
        );
    }

    #[test]
    fn test_missing_dependencies_are_reported_and_ignored() {
        let graph = ResourceGraph::from_nodes([node("eks", &["network"])]).unwrap();
        assert_eq!(
            graph.missing_dependencies(),
            vec![("eks".to_string(), "network".to_string())]
        );
        assert_eq!(graph.resolve_order(), vec!["eks"]);
    }

    #[test]
    fn test_dependents_and_transitive_dependencies() {
        let mut graph = ResourceGraph::from_nodes([
            node("network", &[]),
            node("eks", &["network"]),
            node("addon", &["eks"]),
        ])
        .unwrap();

        assert_eq!(graph.dependents("eks"), vec!["addon"]);
        let deps: Vec<String> = graph.transitive_dependencies("addon").into_iter().collect();
        assert_eq!(deps, vec!["eks", "network"]);

        let removed = graph.remove_node("eks").unwrap();
        assert_eq!(removed.id, "eks");
        assert_eq!(graph.resolve_order(), vec!["addon", "network"]);
    }
}
