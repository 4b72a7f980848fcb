//! Platform configuration types.
//!
//! These structs map to `converge.platform.yaml`: the environments in
//! promotion order, the resources every environment declares, and the
//! settings of the engine itself.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::graph::{ResourceConfig, ResourceKind, ResourceNode};
use crate::pipeline::DesiredState;
use crate::planner::{ExecutorConfig, RetryPolicy};
use crate::registry::Environment;

/// The root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlatformConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Provisioning API.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Plan execution settings.
    #[serde(default)]
    pub executor: ExecutorSettings,
    /// Add-on reconciliation settings.
    #[serde(default)]
    pub reconciler: ReconcilerSettings,
    /// How approvals are obtained.
    #[serde(default)]
    pub approval: ApprovalSettings,
    /// Environments in promotion order.
    pub environments: Vec<EnvironmentConfig>,
    /// Resources declared in every environment.
    #[serde(default)]
    pub resources: Vec<ResourceSpec>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,
}

/// State backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type.
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for the s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix.
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region; the AWS default applies when unset.
    #[serde(default)]
    pub region: Option<String>,
    /// Local state file path.
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Provisioning API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Base URL of the provisioning API.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Name of the environment variable holding the bearer token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    /// Request timeout in seconds.
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
}

/// Plan execution settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutorSettings {
    /// Maximum operations in flight per plan.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Upper bound of a single provider call in seconds.
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,
    /// Retry behavior for transient failures.
    #[serde(default)]
    pub retry: RetrySettings,
}

/// Retry settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetrySettings {
    /// Attempts per operation, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Initial backoff in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Backoff ceiling in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Randomize backoff.
    #[serde(default = "default_true")]
    pub jitter: bool,
}

/// Add-on reconciliation settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconcilerSettings {
    /// Seconds between cycles per cluster.
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    /// Seconds an applied operation is trusted while not yet observed.
    #[serde(default = "default_visibility_grace")]
    pub visibility_grace_secs: u64,
}

/// How approvals are obtained.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApprovalSettings {
    /// Approval mode.
    #[serde(default)]
    pub mode: ApprovalMode,
    /// With `auto`, reject plans with more operations than this.
    #[serde(default)]
    pub max_operations: Option<usize>,
}

/// Approval modes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalMode {
    /// Wait for `converge approve` / `converge reject`.
    #[default]
    Manual,
    /// Decide by policy.
    Auto,
}

/// A deployment target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnvironmentConfig {
    /// Unique identifier.
    pub id: String,
    /// Cloud region.
    pub region: String,
    /// Target account.
    pub account: String,
    /// Position in the promotion sequence; defaults to the list index.
    #[serde(default)]
    pub position: Option<u32>,
    /// Whether promotion needs a manual approval.
    #[serde(default)]
    pub requires_approval: bool,
    /// Per-resource configuration merged over the base configuration.
    ///
    /// A `null` value removes the key; `enabled: false` removes the resource
    /// from this environment.
    #[serde(default)]
    pub overrides: BTreeMap<String, BTreeMap<String, Value>>,
}

/// A declared resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceSpec {
    /// Unique identifier.
    pub id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Identifiers this resource depends on.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Desired configuration.
    #[serde(default)]
    pub config: BTreeMap<String, Value>,
    /// Whether the resource is declared at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

const fn default_true() -> bool {
    true
}

fn default_token_env() -> String {
    String::from("CONVERGE_PROVIDER_TOKEN")
}

const fn default_provider_timeout() -> u64 {
    30
}

const fn default_max_parallel() -> usize {
    4
}

const fn default_operation_timeout() -> u64 {
    900
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_base_delay_ms() -> u64 {
    500
}

const fn default_max_delay_ms() -> u64 {
    30_000
}

const fn default_interval() -> u64 {
    300
}

const fn default_visibility_grace() -> u64 {
    300
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            token_env: default_token_env(),
            timeout_secs: default_provider_timeout(),
        }
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            operation_timeout_secs: default_operation_timeout(),
            retry: RetrySettings::default(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: true,
        }
    }
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            visibility_grace_secs: default_visibility_grace(),
        }
    }
}

impl ExecutorSettings {
    /// Converts to executor configuration.
    #[must_use]
    pub fn to_executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            max_parallel: self.max_parallel,
            operation_timeout: Duration::from_secs(self.operation_timeout_secs),
            retry: RetryPolicy::new()
                .with_max_attempts(self.retry.max_attempts)
                .with_base_delay(Duration::from_millis(self.retry.base_delay_ms))
                .with_max_delay(Duration::from_millis(self.retry.max_delay_ms))
                .with_jitter(self.retry.jitter),
        }
    }
}

impl ReconcilerSettings {
    /// Interval between cycles.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Grace period for not-yet-visible resources.
    #[must_use]
    pub fn visibility_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.visibility_grace_secs).unwrap_or(i64::MAX))
    }
}

impl EnvironmentConfig {
    /// Returns the effective position, given the list index.
    #[must_use]
    pub fn effective_position(&self, index: usize) -> u32 {
        self.position
            .unwrap_or_else(|| u32::try_from(index).unwrap_or(u32::MAX))
    }

    /// Builds a registry environment.
    #[must_use]
    pub fn to_environment(&self, index: usize) -> Environment {
        Environment::new(&self.id, &self.region, &self.account, self.effective_position(index))
            .with_approval_required(self.requires_approval)
    }

    fn substitute(&self, value: Value) -> Value {
        match value {
            Value::String(s) => Value::String(
                s.replace("{{environment}}", &self.id)
                    .replace("{{region}}", &self.region)
                    .replace("{{account}}", &self.account),
            ),
            Value::Array(items) => Value::Array(items.into_iter().map(|v| self.substitute(v)).collect()),
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, self.substitute(v)))
                    .collect(),
            ),
            other => other,
        }
    }
}

impl ResourceSpec {
    /// Builds the node this resource declares in `environment`, or `None` if
    /// it is disabled there.
    #[must_use]
    pub fn resolve(&self, environment: &EnvironmentConfig) -> Option<ResourceNode> {
        let mut merged = self.config.clone();
        let mut enabled = self.enabled;

        if let Some(overrides) = environment.overrides.get(&self.id) {
            for (key, value) in overrides {
                if key == "enabled" {
                    enabled = value.as_bool().unwrap_or(enabled);
                } else if value.is_null() {
                    merged.remove(key);
                } else {
                    merged.insert(key.clone(), value.clone());
                }
            }
        }
        if !enabled {
            return None;
        }

        let mut config = ResourceConfig::new();
        for (key, value) in merged {
            config.insert(key, environment.substitute(value));
        }
        let mut node = ResourceNode::new(self.kind, &self.id).with_config(config);
        node.depends_on.clone_from(&self.depends_on);
        Some(node)
    }
}

impl PlatformConfig {
    /// Returns the environments ordered by position.
    #[must_use]
    pub fn ordered_environments(&self) -> Vec<(u32, &EnvironmentConfig)> {
        let mut envs: Vec<_> = self
            .environments
            .iter()
            .enumerate()
            .map(|(i, e)| (e.effective_position(i), e))
            .collect();
        envs.sort_by_key(|(position, _)| *position);
        envs
    }

    /// Gets an environment by identifier.
    #[must_use]
    pub fn environment(&self, id: &str) -> Option<&EnvironmentConfig> {
        self.environments.iter().find(|e| e.id == id)
    }

    /// Returns the registry environments in promotion order.
    #[must_use]
    pub fn registry_environments(&self) -> Vec<Environment> {
        self.environments
            .iter()
            .enumerate()
            .map(|(i, e)| e.to_environment(i))
            .collect()
    }

    /// Returns the resources an environment declares.
    #[must_use]
    pub fn desired_nodes(&self, environment: &EnvironmentConfig) -> Vec<ResourceNode> {
        self.resources
            .iter()
            .filter_map(|r| r.resolve(environment))
            .collect()
    }

    /// Returns the desired state of every environment.
    #[must_use]
    pub fn desired_state(&self) -> DesiredState {
        DesiredState::new(
            self.environments
                .iter()
                .map(|e| (e.id.clone(), self.desired_nodes(e)))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn environment() -> EnvironmentConfig {
        EnvironmentConfig {
            id: "prod".into(),
            region: "eu-central-1".into(),
            account: "333".into(),
            position: None,
            requires_approval: true,
            overrides: BTreeMap::new(),
        }
    }

    fn cluster() -> ResourceSpec {
        ResourceSpec {
            id: "eks".into(),
            kind: ResourceKind::Cluster,
            depends_on: vec!["network".into()],
            config: BTreeMap::from([
                ("name".to_string(), json!("eks-{{environment}}")),
                ("version".to_string(), json!("1.29")),
                ("tags".to_string(), json!({ "region": "{{region}}" })),
            ]),
            enabled: true,
        }
    }

    #[test]
    fn test_placeholders_are_substituted() {
        let node = cluster().resolve(&environment()).unwrap();
        assert_eq!(node.config.get("name"), Some(&json!("eks-prod")));
        assert_eq!(node.config.get("tags"), Some(&json!({ "region": "eu-central-1" })));
        assert_eq!(node.depends_on, vec!["network"]);
    }

    #[test]
    fn test_overrides_merge_and_disable() {
        let mut env = environment();
        env.overrides.insert(
            "eks".into(),
            BTreeMap::from([
                ("version".to_string(), json!("1.30")),
                ("tags".to_string(), Value::Null),
            ]),
        );
        let node = cluster().resolve(&env).unwrap();
        assert_eq!(node.config.version().as_deref(), Some("1.30"));
        assert!(node.config.get("tags").is_none());

        env.overrides
            .insert("eks".into(), BTreeMap::from([("enabled".to_string(), json!(false))]));
        assert!(cluster().resolve(&env).is_none());

        let mut disabled = cluster();
        disabled.enabled = false;
        assert!(disabled.resolve(&environment()).is_none());
    }

    #[test]
    fn test_executor_settings_conversion() {
        let settings = ExecutorSettings::default();
        let config = settings.to_executor_config();
        assert_eq!(config.max_parallel, 4);
        assert_eq!(config.operation_timeout, Duration::from_secs(900));
        assert_eq!(config.retry.max_attempts, 5);
    }
}
