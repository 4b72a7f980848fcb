//! Resource node types.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::config::ConfigHasher;

/// The kind of infrastructure a node declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    /// A virtual network with its subnets and gateways.
    Network,
    /// A managed Kubernetes control plane.
    Cluster,
    /// A group of worker nodes attached to a cluster.
    NodePool,
    /// A cluster-level system component (autoscaler, ingress controller, node agent).
    Addon,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Network => "network",
            Self::Cluster => "cluster",
            Self::NodePool => "node-pool",
            Self::Addon => "addon",
        };
        write!(f, "{s}")
    }
}

/// Opaque key-value configuration of a resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceConfig(BTreeMap<String, Value>);

impl ResourceConfig {
    /// Creates an empty configuration.
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Sets a key, returning the updated configuration.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Inserts or replaces a key.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    /// Returns the value of a key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Returns the keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    /// Returns true when no keys are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the configuration as a JSON object.
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Object(self.0.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    /// Returns the normalized configuration.
    #[must_use]
    pub fn normalized(&self) -> Value {
        ConfigHasher::normalize(&self.to_value())
    }

    /// Returns the declared `version`, rendered as a string.
    #[must_use]
    pub fn version(&self) -> Option<String> {
        match ConfigHasher::normalize(self.get("version")?) {
            Value::String(s) => Some(s),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}

impl From<BTreeMap<String, Value>> for ResourceConfig {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self(map)
    }
}

/// A declared infrastructure unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceNode {
    /// Kind of resource.
    pub kind: ResourceKind,
    /// Unique identifier within an environment.
    pub id: String,
    /// Desired configuration.
    #[serde(default)]
    pub config: ResourceConfig,
    /// Identifiers this node depends on.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl ResourceNode {
    /// Creates a node with an empty configuration and no dependencies.
    #[must_use]
    pub fn new(kind: ResourceKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            config: ResourceConfig::new(),
            depends_on: Vec::new(),
        }
    }

    /// Sets the configuration.
    #[must_use]
    pub fn with_config(mut self, config: ResourceConfig) -> Self {
        self.config = config;
        self
    }

    /// Adds a dependency.
    #[must_use]
    pub fn with_dependency(mut self, id: impl Into<String>) -> Self {
        self.depends_on.push(id.into());
        self
    }

    /// Computes the hash of the normalized configuration.
    #[must_use]
    pub fn config_hash(&self) -> String {
        ConfigHasher::new().hash_value(&self.config.to_value())
    }

    /// Returns true when `other` declares the same kind and an equivalent configuration.
    #[must_use]
    pub fn same_desired_state(&self, other: &Self) -> bool {
        self.kind == other.kind && self.config.normalized() == other.config.normalized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_serde_is_kebab_case() {
        let kind: ResourceKind = serde_json::from_value(json!("node-pool")).unwrap();
        assert_eq!(kind, ResourceKind::NodePool);
        assert_eq!(ResourceKind::NodePool.to_string(), "node-pool");
    }

    #[test]
    fn test_version_is_normalized() {
        let config = ResourceConfig::new().with("version", " 9.9.2 ");
        assert_eq!(config.version().as_deref(), Some("9.9.2"));

        let numeric = ResourceConfig::new().with("version", "3");
        assert_eq!(numeric.version().as_deref(), Some("3"));

        assert_eq!(ResourceConfig::new().version(), None);
    }

    #[test]
    fn test_same_desired_state_ignores_formatting() {
        let a = ResourceNode::new(ResourceKind::NodePool, "pool")
            .with_config(ResourceConfig::new().with("desired_size", "3"));
        let b = ResourceNode::new(ResourceKind::NodePool, "pool")
            .with_config(ResourceConfig::new().with("desired_size", 3));
        assert!(a.same_desired_state(&b));
        assert_eq!(a.config_hash(), b.config_hash());

        let c = ResourceNode::new(ResourceKind::Addon, "pool")
            .with_config(ResourceConfig::new().with("desired_size", 3));
        assert!(!a.same_desired_state(&c));
    }
}
