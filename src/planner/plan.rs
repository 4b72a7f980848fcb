//! Plan types and construction.
//!
//! This module defines the structure of convergence plans and converts
//! diffs into ordered, dependency-annotated operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::graph::{ResourceConfig, ResourceKind, ResourceNode};

use super::diff::{DiffResult, DiffType};

/// An ordered set of operations for one environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// Unique plan identifier.
    pub id: Uuid,
    /// Target environment.
    pub environment: String,
    /// Desired-state version this plan converges to.
    pub version: String,
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Operations, creates and updates in dependency order, then deletes.
    pub operations: Vec<Operation>,
}

/// A single change to one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Target resource identifier.
    pub target: String,
    /// Target resource kind.
    pub kind: ResourceKind,
    /// What to do.
    pub action: Action,
    /// Configuration to apply (the last observed configuration for deletes).
    pub payload: ResourceConfig,
    /// Hash of the normalized payload.
    pub config_hash: String,
    /// Indices of operations in the same plan that must finish first.
    #[serde(default)]
    pub depends_on: Vec<usize>,
    /// Resource identifiers the target depends on, passed to the provider.
    #[serde(default)]
    pub resource_dependencies: Vec<String>,
    /// Current status.
    #[serde(default)]
    pub status: OperationStatus,
}

/// Operation actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Create a resource.
    Create,
    /// Update a resource in place.
    Update,
    /// Delete a resource.
    Delete,
}

/// Status of an operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationStatus {
    /// Not started yet.
    #[default]
    Pending,
    /// Dispatched and acknowledged by the provisioning API.
    Applied,
    /// Matched the last recorded success; not dispatched.
    NoOp,
    /// Dispatched and failed.
    Failed,
    /// Not attempted because a prerequisite failed.
    Skipped,
    /// Not attempted because the run was cancelled.
    Cancelled,
}

impl Plan {
    /// Creates a plan from a diff result.
    ///
    /// Creates and updates follow the desired graph's dependency order, then
    /// deletes follow the reverse of the observed graph's order. A create or
    /// update waits for the operations on its dependencies; a delete waits for
    /// the deletes of the resources that depend on it.
    #[must_use]
    pub fn from_diff(environment: &str, version: &str, diff: &DiffResult) -> Self {
        let mut operations: Vec<Operation> = Vec::new();
        let mut index_of: BTreeMap<String, usize> = BTreeMap::new();

        for resource_diff in &diff.diffs {
            let action = match resource_diff.diff_type {
                DiffType::Create => Action::Create,
                DiffType::Update => Action::Update,
                DiffType::Delete | DiffType::NoChange => continue,
            };
            let Some(node) = diff.desired.get(&resource_diff.id) else {
                continue;
            };
            let depends_on = node
                .depends_on
                .iter()
                .filter_map(|dep| index_of.get(dep).copied())
                .collect();
            index_of.insert(node.id.clone(), operations.len());
            operations.push(Operation {
                target: node.id.clone(),
                kind: node.kind,
                action,
                payload: node.config.clone(),
                config_hash: resource_diff.new_hash.clone().unwrap_or_default(),
                depends_on,
                resource_dependencies: node.depends_on.clone(),
                status: OperationStatus::Pending,
            });
        }

        let mut delete_index: BTreeMap<String, usize> = BTreeMap::new();
        for resource_diff in &diff.diffs {
            if resource_diff.diff_type != DiffType::Delete {
                continue;
            }
            let Some(node) = diff.observed.get(&resource_diff.id) else {
                continue;
            };
            let depends_on = diff
                .observed
                .dependents(&node.id)
                .iter()
                .filter_map(|dependent| delete_index.get(dependent).copied())
                .collect();
            delete_index.insert(node.id.clone(), operations.len());
            operations.push(Operation {
                target: node.id.clone(),
                kind: node.kind,
                action: Action::Delete,
                payload: node.config.clone(),
                config_hash: resource_diff.old_hash.clone().unwrap_or_default(),
                depends_on,
                resource_dependencies: node.depends_on.clone(),
                status: OperationStatus::Pending,
            });
        }

        Self::new(environment, version, operations)
    }

    /// Creates a plan from explicit operations.
    #[must_use]
    pub fn new(environment: &str, version: &str, operations: Vec<Operation>) -> Self {
        Self {
            id: Uuid::new_v4(),
            environment: environment.to_string(),
            version: version.to_string(),
            created_at: Utc::now(),
            operations,
        }
    }

    /// Returns true if the plan is empty (no changes).
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Returns the number of operations.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.operations.len()
    }

    /// Returns the number of operations with the given action.
    #[must_use]
    pub fn count(&self, action: Action) -> usize {
        self.operations.iter().filter(|op| op.action == action).count()
    }

    /// Returns operations that can be dispatched immediately.
    #[must_use]
    pub fn ready_operations(&self) -> Vec<&Operation> {
        self.operations
            .iter()
            .filter(|op| op.depends_on.is_empty())
            .collect()
    }

    /// Returns the indices of every operation that waits on `index`, directly or transitively.
    #[must_use]
    pub fn transitive_dependents(&self, index: usize) -> Vec<usize> {
        let mut blocked = vec![false; self.operations.len()];
        let mut stack = vec![index];
        while let Some(current) = stack.pop() {
            for (i, op) in self.operations.iter().enumerate() {
                if !blocked[i] && op.depends_on.contains(&current) {
                    blocked[i] = true;
                    stack.push(i);
                }
            }
        }
        blocked
            .iter()
            .enumerate()
            .filter_map(|(i, b)| b.then_some(i))
            .collect()
    }
}

impl Operation {
    /// Creates a pending operation with no prerequisites.
    #[must_use]
    pub fn new(target: &str, kind: ResourceKind, action: Action, payload: ResourceConfig) -> Self {
        let config_hash = crate::config::ConfigHasher::new().hash_value(&payload.to_value());
        Self {
            target: target.to_string(),
            kind,
            action,
            payload,
            config_hash,
            depends_on: vec![],
            resource_dependencies: vec![],
            status: OperationStatus::Pending,
        }
    }

    /// Sets the resource identifiers the target depends on.
    #[must_use]
    pub fn with_resource_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.resource_dependencies = dependencies;
        self
    }

    /// Returns the resource node this operation converges to.
    #[must_use]
    pub fn to_node(&self) -> ResourceNode {
        ResourceNode {
            kind: self.kind,
            id: self.target.clone(),
            config: self.payload.clone(),
            depends_on: self.resource_dependencies.clone(),
        }
    }

    /// Returns a human-readable description of the operation.
    #[must_use]
    pub fn description(&self) -> String {
        match self.action {
            Action::Create => format!("Create {} '{}'", self.kind, self.target),
            Action::Update => format!("Update {} '{}'", self.kind, self.target),
            Action::Delete => format!("Delete {} '{}'", self.kind, self.target),
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Applied => "applied",
            Self::NoOp => "no-op",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.action, self.target)
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.operations.is_empty() {
            return write!(f, "No changes required");
        }

        writeln!(
            f,
            "Plan for {} ({} operations):",
            self.environment,
            self.operations.len()
        )?;
        for (i, op) in self.operations.iter().enumerate() {
            write!(f, "  {i}. {}", op.description())?;
            if !op.depends_on.is_empty() {
                let deps: Vec<String> = op.depends_on.iter().map(ToString::to_string).collect();
                write!(f, " (after {})", deps.join(", "))?;
            }
            writeln!(f)?;
        }

        Ok(())
    }
}
