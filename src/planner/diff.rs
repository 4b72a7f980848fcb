//! Diff engine for comparing desired vs observed state.
//!
//! This module computes the difference between the desired resource nodes of
//! an environment and the nodes the provisioning API reports for it.

use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

use crate::config::ConfigHasher;
use crate::error::{PlanError, Result};
use crate::graph::{ResourceGraph, ResourceKind, ResourceNode};

/// Engine for computing diffs between desired and observed states.
#[derive(Debug, Default)]
pub struct DiffEngine {
    /// Configuration hasher.
    hasher: ConfigHasher,
}

/// Difference for a single resource.
#[derive(Debug, Clone)]
pub struct ResourceDiff {
    /// Resource identifier.
    pub id: String,
    /// Resource kind (the desired kind, or the observed one for deletes).
    pub kind: ResourceKind,
    /// Type of difference.
    pub diff_type: DiffType,
    /// Changed top-level keys.
    pub details: Vec<DiffDetail>,
    /// Hash of the observed configuration (if observed).
    pub old_hash: Option<String>,
    /// Hash of the desired configuration (if desired).
    pub new_hash: Option<String>,
}

/// Type of difference detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffType {
    /// Resource needs to be created.
    Create,
    /// Resource needs to be updated.
    Update,
    /// Resource needs to be deleted.
    Delete,
    /// Resource is unchanged.
    NoChange,
}

/// Detail about a specific difference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffDetail {
    /// Field that differs.
    pub field: String,
    /// Old value.
    pub old_value: Option<String>,
    /// New value.
    pub new_value: Option<String>,
}

/// Complete diff result.
///
/// `diffs` lists desired resources in dependency order, followed by the
/// resources to delete in reverse dependency order of the observed graph.
#[derive(Debug)]
pub struct DiffResult {
    /// All resource diffs.
    pub diffs: Vec<ResourceDiff>,
    /// Number of resources to create.
    pub creates: usize,
    /// Number of resources to update.
    pub updates: usize,
    /// Number of resources to delete.
    pub deletes: usize,
    /// Number of unchanged resources.
    pub unchanged: usize,
    /// Desired graph, duplicates collapsed.
    pub desired: ResourceGraph,
    /// Observed graph.
    pub observed: ResourceGraph,
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            hasher: ConfigHasher::new(),
        }
    }

    /// Computes the diff between desired nodes and the observed snapshot.
    ///
    /// # Errors
    ///
    /// Returns `PlanError::Conflict` if an identifier is declared twice with
    /// different configurations, `PlanError::DependencyResolutionFailed` if a
    /// desired node depends on an undeclared identifier, and `GraphError::Cycle`
    /// if the desired nodes form a cycle.
    pub fn compute_diff(
        &self,
        desired: &[ResourceNode],
        observed: &[ResourceNode],
    ) -> Result<DiffResult> {
        let desired_graph = ResourceGraph::from_nodes(Self::collapse_duplicates(desired)?)?;

        if let Some((node, dep)) = desired_graph.missing_dependencies().into_iter().next() {
            return Err(PlanError::DependencyResolutionFailed {
                message: format!("resource '{node}' depends on undeclared resource '{dep}'"),
            }
            .into());
        }

        let mut observed_graph = ResourceGraph::new();
        for node in observed {
            if observed_graph.contains(&node.id) {
                debug!("Ignoring repeated observed resource {}", node.id);
                continue;
            }
            observed_graph.add_node(node.clone())?;
        }

        let mut diffs = Vec::new();

        for id in desired_graph.resolve_order() {
            let Some(node) = desired_graph.get(&id) else {
                continue;
            };
            let new_hash = self.hasher.hash_value(&node.config.to_value());
            let diff = match observed_graph.get(&id) {
                None => {
                    debug!("Resource {id} needs to be created");
                    ResourceDiff {
                        id: id.clone(),
                        kind: node.kind,
                        diff_type: DiffType::Create,
                        details: vec![],
                        old_hash: None,
                        new_hash: Some(new_hash),
                    }
                }
                Some(current) => {
                    let old_hash = self.hasher.hash_value(&current.config.to_value());
                    let diff_type = if node.same_desired_state(current) {
                        DiffType::NoChange
                    } else {
                        debug!("Resource {id} needs update");
                        DiffType::Update
                    };
                    let details = if diff_type == DiffType::Update {
                        Self::compute_detailed_diff(node, current)
                    } else {
                        vec![]
                    };
                    ResourceDiff {
                        id: id.clone(),
                        kind: node.kind,
                        diff_type,
                        details,
                        old_hash: Some(old_hash),
                        new_hash: Some(new_hash),
                    }
                }
            };
            diffs.push(diff);
        }

        for id in observed_graph.resolve_order().into_iter().rev() {
            if desired_graph.contains(&id) {
                continue;
            }
            let Some(current) = observed_graph.get(&id) else {
                continue;
            };
            debug!("Found orphaned resource: {id}");
            diffs.push(ResourceDiff {
                id: id.clone(),
                kind: current.kind,
                diff_type: DiffType::Delete,
                details: vec![],
                old_hash: Some(self.hasher.hash_value(&current.config.to_value())),
                new_hash: None,
            });
        }

        let count = |t: DiffType| diffs.iter().filter(|d| d.diff_type == t).count();
        let creates = count(DiffType::Create);
        let updates = count(DiffType::Update);
        let deletes = count(DiffType::Delete);
        let unchanged = count(DiffType::NoChange);

        Ok(DiffResult {
            diffs,
            creates,
            updates,
            deletes,
            unchanged,
            desired: desired_graph,
            observed: observed_graph,
        })
    }

    /// Collapses identical duplicate declarations, keeping the first occurrence.
    fn collapse_duplicates(desired: &[ResourceNode]) -> Result<Vec<ResourceNode>> {
        let mut seen: BTreeMap<&str, &ResourceNode> = BTreeMap::new();
        let mut unique = Vec::with_capacity(desired.len());

        for node in desired {
            match seen.get(node.id.as_str()) {
                Some(first) => {
                    let mut a = first.depends_on.clone();
                    let mut b = node.depends_on.clone();
                    a.sort();
                    a.dedup();
                    b.sort();
                    b.dedup();
                    if !first.same_desired_state(node) || a != b {
                        return Err(PlanError::Conflict { id: node.id.clone() }.into());
                    }
                    debug!("Collapsing identical declarations of {}", node.id);
                }
                None => {
                    seen.insert(node.id.as_str(), node);
                    unique.push(node.clone());
                }
            }
        }

        Ok(unique)
    }

    /// Lists the top-level keys whose normalized values differ.
    fn compute_detailed_diff(desired: &ResourceNode, observed: &ResourceNode) -> Vec<DiffDetail> {
        let mut details = Vec::new();

        if desired.kind != observed.kind {
            details.push(DiffDetail {
                field: String::from("kind"),
                old_value: Some(observed.kind.to_string()),
                new_value: Some(desired.kind.to_string()),
            });
        }

        let new = desired.config.normalized();
        let old = observed.config.normalized();
        let empty = serde_json::Map::new();
        let new_map = new.as_object().unwrap_or(&empty);
        let old_map = old.as_object().unwrap_or(&empty);

        let mut keys: Vec<&String> = new_map.keys().chain(old_map.keys()).collect();
        keys.sort();
        keys.dedup();

        for key in keys {
            let before = old_map.get(key);
            let after = new_map.get(key);
            if before != after {
                details.push(DiffDetail {
                    field: key.clone(),
                    old_value: before.map(render),
                    new_value: after.map(render),
                });
            }
        }

        details
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl DiffResult {
    /// Returns true if there are any changes.
    #[must_use]
    pub const fn has_changes(&self) -> bool {
        self.creates > 0 || self.updates > 0 || self.deletes > 0
    }

    /// Returns the total number of changes.
    #[must_use]
    pub const fn total_changes(&self) -> usize {
        self.creates + self.updates + self.deletes
    }

    /// Filters to only diffs that require action.
    #[must_use]
    pub fn actionable_diffs(&self) -> Vec<&ResourceDiff> {
        self.diffs
            .iter()
            .filter(|d| d.diff_type != DiffType::NoChange)
            .collect()
    }
}

impl std::fmt::Display for DiffType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::NoChange => "no change",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for ResourceDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.id, self.diff_type)?;
        if !self.details.is_empty() {
            write!(f, " (")?;
            for (i, detail) in self.details.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", detail.field)?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConvergeError, GraphError};
    use crate::graph::ResourceConfig;

    fn network() -> ResourceNode {
        ResourceNode::new(ResourceKind::Network, "network")
            .with_config(ResourceConfig::new().with("cidr", "10.0.0.0/16"))
    }

    fn cluster() -> ResourceNode {
        ResourceNode::new(ResourceKind::Cluster, "eks")
            .with_config(ResourceConfig::new().with("version", "1.29"))
            .with_dependency("network")
    }

    fn addon(version: &str) -> ResourceNode {
        ResourceNode::new(ResourceKind::Addon, "cluster-autoscaler")
            .with_config(ResourceConfig::new().with("version", version))
            .with_dependency("eks")
    }

    #[test]
    fn test_diff_against_empty_observed() {
        let diff = DiffEngine::new()
            .compute_diff(&[cluster(), network()], &[])
            .unwrap();

        assert_eq!(diff.creates, 2);
        let ids: Vec<_> = diff.diffs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["network", "eks"]);
    }

    #[test]
    fn test_only_changed_addon_is_updated() {
        let diff = DiffEngine::new()
            .compute_diff(
                &[network(), cluster(), addon("9.9.3")],
                &[network(), cluster(), addon("9.9.2")],
            )
            .unwrap();

        assert_eq!((diff.creates, diff.updates, diff.deletes, diff.unchanged), (0, 1, 0, 2));
        let update = diff.actionable_diffs()[0];
        assert_eq!(update.id, "cluster-autoscaler");
        assert_eq!(
            update.details,
            vec![DiffDetail {
                field: "version".into(),
                old_value: Some("9.9.2".into()),
                new_value: Some("9.9.3".into()),
            }]
        );
    }

    #[test]
    fn test_formatting_differences_are_not_updates() {
        let mut observed = cluster();
        observed.config = ResourceConfig::new().with("version", " 1.29 ");
        let diff = DiffEngine::new()
            .compute_diff(&[network(), cluster()], &[network(), observed])
            .unwrap();

        assert!(!diff.has_changes());
    }

    #[test]
    fn test_identical_duplicates_collapse() {
        let diff = DiffEngine::new()
            .compute_diff(&[network(), network(), cluster()], &[])
            .unwrap();
        assert_eq!(diff.creates, 2);
    }

    #[test]
    fn test_conflicting_duplicates_fail() {
        let other = ResourceNode::new(ResourceKind::Network, "network")
            .with_config(ResourceConfig::new().with("cidr", "10.1.0.0/16"));
        let err = DiffEngine::new()
            .compute_diff(&[network(), other], &[])
            .unwrap_err();

        assert!(matches!(err, ConvergeError::Plan(PlanError::Conflict { ref id }) if id == "network"));
    }

    #[test]
    fn test_undeclared_dependency_fails() {
        let err = DiffEngine::new().compute_diff(&[cluster()], &[]).unwrap_err();
        assert!(matches!(
            err,
            ConvergeError::Plan(PlanError::DependencyResolutionFailed { .. })
        ));
    }

    #[test]
    fn test_desired_cycle_fails() {
        let a = ResourceNode::new(ResourceKind::Network, "a").with_dependency("b");
        let b = ResourceNode::new(ResourceKind::Network, "b").with_dependency("a");
        let err = DiffEngine::new().compute_diff(&[a, b], &[]).unwrap_err();
        assert!(matches!(err, ConvergeError::Graph(GraphError::Cycle { .. })));
    }

    #[test]
    fn test_orphans_deleted_dependents_first() {
        let diff = DiffEngine::new()
            .compute_diff(&[], &[network(), cluster(), addon("9.9.2")])
            .unwrap();

        let ids: Vec<_> = diff.diffs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["cluster-autoscaler", "eks", "network"]);
        assert!(diff.diffs.iter().all(|d| d.diff_type == DiffType::Delete));
    }
}
