//! Record of successfully applied operations.
//!
//! The ledger makes plan execution idempotent: an operation whose target,
//! kind, configuration hash and removal flag match the last recorded success is
//! skipped instead of dispatched again, e.g. when a plan is re-applied after a
//! crash half-way through.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;
use uuid::Uuid;

use crate::graph::{ResourceKind, ResourceNode};

use super::plan::{Action, Operation};

/// Last successful outcome for one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Kind of the resource that was applied.
    pub kind: ResourceKind,
    /// Hash of the configuration that was applied.
    pub config_hash: String,
    /// Whether the recorded success was a delete.
    pub removal: bool,
    /// Plan that applied it.
    pub plan_id: Uuid,
    /// When it was applied.
    pub applied_at: DateTime<Utc>,
}

/// Per-environment ledger of applied operations, keyed by resource id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppliedLedger {
    entries: BTreeMap<String, LedgerEntry>,
}

impl AppliedLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Returns true if `operation` matches the last recorded success for its target.
    #[must_use]
    pub fn is_applied(&self, operation: &Operation) -> bool {
        self.entries.get(&operation.target).is_some_and(|entry| {
            entry.removal == (operation.action == Action::Delete)
                && entry.kind == operation.kind
                && entry.config_hash == operation.config_hash
        })
    }

    /// Records a successful operation.
    pub fn record(&mut self, operation: &Operation, plan_id: Uuid) {
        self.entries.insert(
            operation.target.clone(),
            LedgerEntry {
                kind: operation.kind,
                config_hash: operation.config_hash.clone(),
                removal: operation.action == Action::Delete,
                plan_id,
                applied_at: Utc::now(),
            },
        );
    }

    /// Returns the entry for a resource.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&LedgerEntry> {
        self.entries.get(id)
    }

    /// Removes the entry for a resource.
    pub fn forget(&mut self, id: &str) -> Option<LedgerEntry> {
        self.entries.remove(id)
    }

    /// Iterates over all entries in resource order.
    pub fn entries(&self) -> impl Iterator<Item = (&String, &LedgerEntry)> {
        self.entries.iter()
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops entries the observed state contradicts and returns their ids.
    ///
    /// An applied entry is contradicted when the resource is visible with a
    /// different kind or configuration; a removal entry when the resource is visible
    /// again. A resource that is not visible yet keeps its entry for `grace`
    /// after it was applied, since the provider may lag behind.
    pub fn forget_drifted(&mut self, observed: &[ResourceNode], grace: Duration) -> Vec<String> {
        let visible: HashMap<&str, &ResourceNode> =
            observed.iter().map(|node| (node.id.as_str(), node)).collect();
        let now = Utc::now();
        let mut forgotten = Vec::new();

        self.entries.retain(|id, entry| {
            let keep = match (entry.removal, visible.get(id.as_str())) {
                (true, None) => true,
                (true, Some(_)) => false,
                (false, Some(node)) => {
                    node.kind == entry.kind && node.config_hash() == entry.config_hash
                }
                (false, None) => now - entry.applied_at < grace,
            };
            if !keep {
                debug!("Forgetting ledger entry for {id}: observed state diverged");
                forgotten.push(id.clone());
            }
            keep
        });

        forgotten
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ResourceConfig, ResourceKind};

    fn addon(version: &str) -> ResourceNode {
        ResourceNode::new(ResourceKind::Addon, "cluster-autoscaler")
            .with_config(ResourceConfig::new().with("version", version))
    }

    fn op(node: &ResourceNode, action: Action) -> Operation {
        Operation::new(&node.id, node.kind, action, node.config.clone())
    }

    #[test]
    fn test_records_and_matches_by_hash_and_removal() {
        let mut ledger = AppliedLedger::new();
        let create = op(&addon("9.9.2"), Action::Create);
        assert!(!ledger.is_applied(&create));

        ledger.record(&create, Uuid::new_v4());
        assert!(ledger.is_applied(&create));
        assert!(ledger.is_applied(&op(&addon(" 9.9.2"), Action::Update)));
        assert!(!ledger.is_applied(&op(&addon("9.9.3"), Action::Update)));
        assert!(!ledger.is_applied(&op(&addon("9.9.2"), Action::Delete)));
    }

    #[test]
    fn test_kind_is_part_of_the_key() {
        let mut ledger = AppliedLedger::new();
        let node = addon("9.9.2");
        ledger.record(&op(&node, Action::Create), Uuid::new_v4());

        let mut pool = node.clone();
        pool.kind = ResourceKind::NodePool;
        assert!(!ledger.is_applied(&op(&pool, Action::Update)));
        assert_eq!(ledger.forget_drifted(&[pool], Duration::minutes(5)).len(), 1);
    }

    #[test]
    fn test_forget_drifted() {
        let mut ledger = AppliedLedger::new();
        ledger.record(&op(&addon("9.9.2"), Action::Create), Uuid::new_v4());

        // Not visible yet: kept within the grace period.
        assert!(ledger.forget_drifted(&[], Duration::minutes(5)).is_empty());
        // Visible and matching: kept.
        assert!(ledger.forget_drifted(&[addon("9.9.2")], Duration::zero()).is_empty());
        // Visible with another version: dropped.
        assert_eq!(
            ledger.forget_drifted(&[addon("9.9.1")], Duration::minutes(5)),
            vec!["cluster-autoscaler"]
        );
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_forget_absent_after_grace() {
        let mut ledger = AppliedLedger::new();
        ledger.record(&op(&addon("9.9.2"), Action::Create), Uuid::new_v4());
        assert_eq!(ledger.forget_drifted(&[], Duration::zero()).len(), 1);
    }

    #[test]
    fn test_reappeared_resource_drops_removal() {
        let mut ledger = AppliedLedger::new();
        ledger.record(&op(&addon("9.9.2"), Action::Delete), Uuid::new_v4());

        assert!(ledger.forget_drifted(&[], Duration::zero()).is_empty());
        assert_eq!(ledger.forget_drifted(&[addon("9.9.2")], Duration::zero()).len(), 1);
    }
}
