//! Configuration validation.
//!
//! Catches what the YAML schema cannot express: duplicate identifiers,
//! dangling or cyclic dependencies, promotion positions that clash, and
//! per-environment overrides that break the graph.

use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::debug;

use crate::error::{ConfigError, Result};
use crate::graph::{ResourceGraph, ResourceKind, ResourceNode};

use super::spec::{
    ApprovalMode, EnvironmentConfig, PlatformConfig, ProjectConfig, ResourceSpec, StateBackend,
};

/// Validator for platform configurations.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing every problem found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// Errors; the configuration cannot be used.
    pub errors: Vec<ValidationError>,
    /// Warnings; the configuration works but looks suspicious.
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ValidationResult {
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a configuration, failing on the first error.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError::ValidationError` for the first problem found.
    pub fn validate(&self, config: &PlatformConfig) -> Result<ValidationResult> {
        let result = self.check(config);
        if let Some(first) = result.errors.first() {
            return Err(ConfigError::validation(first.message.clone(), first.field.clone()).into());
        }
        debug!("Configuration validation passed");
        Ok(result)
    }

    /// Collects every error and warning.
    #[must_use]
    pub fn check(&self, config: &PlatformConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_project(&config.project, &mut result);
        Self::validate_settings(config, &mut result);
        Self::validate_environments(config, &mut result);
        Self::validate_resources(&config.resources, &mut result);
        Self::validate_per_environment(config, &mut result);

        result
    }

    fn validate_project(project: &ProjectConfig, result: &mut ValidationResult) {
        if project.name.is_empty() {
            result.error("project.name", "Project name cannot be empty");
        } else if !is_valid_name(&project.name) {
            result.error(
                "project.name",
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            );
        }
    }

    fn validate_settings(config: &PlatformConfig, result: &mut ValidationResult) {
        if config.state.backend == StateBackend::S3
            && config.state.bucket.as_deref().is_none_or(str::is_empty)
        {
            result.error("state.bucket", "S3 bucket name is required when using S3 backend");
        }

        match config.provider.endpoint.as_deref() {
            None => result.warnings.push(String::from(
                "provider.endpoint: not set; plan and apply need a provisioning API",
            )),
            Some(url) if !url.starts_with("http://") && !url.starts_with("https://") => {
                result.error(
                    "provider.endpoint",
                    format!("Endpoint '{url}' must start with http:// or https://"),
                );
            }
            Some(_) => {}
        }

        let executor = &config.executor;
        if executor.max_parallel == 0 {
            result.error("executor.max_parallel", "Must be at least 1");
        }
        if executor.operation_timeout_secs == 0 {
            result.error("executor.operation_timeout_secs", "Must be at least 1");
        }
        if executor.retry.max_attempts == 0 {
            result.error("executor.retry.max_attempts", "Must be at least 1");
        }
        if executor.retry.base_delay_ms > executor.retry.max_delay_ms {
            result.error(
                "executor.retry.base_delay_ms",
                "Base delay cannot exceed executor.retry.max_delay_ms",
            );
        }
        if config.reconciler.interval_secs == 0 {
            result.error("reconciler.interval_secs", "Must be at least 1");
        }
        if config.approval.mode == ApprovalMode::Manual && config.approval.max_operations.is_some() {
            result.warnings.push(String::from(
                "approval.max_operations: only used when approval.mode is auto",
            ));
        }
    }

    fn validate_environments(config: &PlatformConfig, result: &mut ValidationResult) {
        if config.environments.is_empty() {
            result.error("environments", "At least one environment is required");
            return;
        }

        let resource_ids: HashSet<&str> = config.resources.iter().map(|r| r.id.as_str()).collect();
        let mut seen_ids = HashSet::new();
        let mut positions: HashMap<u32, &str> = HashMap::new();

        for (i, env) in config.environments.iter().enumerate() {
            let prefix = format!("environments[{i}]");

            if !is_valid_name(&env.id) {
                result.error(
                    format!("{prefix}.id"),
                    format!("Environment id '{}' is invalid. Must be lowercase alphanumeric with hyphens.", env.id),
                );
            }
            if !seen_ids.insert(env.id.as_str()) {
                result.error(format!("{prefix}.id"), format!("Duplicate environment id: {}", env.id));
            }

            let position = env.effective_position(i);
            if let Some(existing) = positions.insert(position, &env.id) {
                result.error(
                    format!("{prefix}.position"),
                    format!("Position {position} is already taken by environment {existing}"),
                );
            }

            if env.region.trim().is_empty() {
                result.error(format!("{prefix}.region"), "Region cannot be empty");
            }
            if env.account.trim().is_empty() {
                result.error(format!("{prefix}.account"), "Account cannot be empty");
            } else if env.account.len() != 12 || !env.account.chars().all(|c| c.is_ascii_digit()) {
                result.warnings.push(format!(
                    "{prefix}.account: '{}' does not look like a 12-digit AWS account id",
                    env.account
                ));
            }

            for (resource, values) in &env.overrides {
                let field = format!("{prefix}.overrides.{resource}");
                if !resource_ids.contains(resource.as_str()) {
                    result.error(field.clone(), format!("Override for undeclared resource '{resource}'"));
                }
                if let Some(enabled) = values.get("enabled")
                    && !enabled.is_boolean()
                {
                    result.error(format!("{field}.enabled"), "Must be true or false");
                }
            }
        }

        let first = config.ordered_environments().first().map(|(_, e)| e.requires_approval);
        if first == Some(true) {
            result.warnings.push(String::from(
                "environments: the first environment requires approval; nothing validates changes before it",
            ));
        }
    }

    fn validate_resources(resources: &[ResourceSpec], result: &mut ValidationResult) {
        if resources.is_empty() {
            result.warnings.push(String::from("No resources defined in configuration"));
            return;
        }

        let declared: HashMap<&str, &ResourceSpec> =
            resources.iter().map(|r| (r.id.as_str(), r)).collect();
        let mut seen = HashSet::new();

        for (i, resource) in resources.iter().enumerate() {
            let prefix = format!("resources[{i}]");

            if !seen.insert(resource.id.as_str()) {
                result.error(format!("{prefix}.id"), format!("Duplicate resource id: {}", resource.id));
            }
            if !is_valid_name(&resource.id) {
                result.error(
                    format!("{prefix}.id"),
                    format!("Resource id '{}' is invalid. Must be lowercase alphanumeric with hyphens.", resource.id),
                );
            }

            for (j, dep) in resource.depends_on.iter().enumerate() {
                let field = format!("{prefix}.depends_on[{j}]");
                match declared.get(dep.as_str()) {
                    None => result.error(field, format!("Unknown dependency '{dep}'")),
                    Some(target) if resource.enabled && !target.enabled => {
                        result.error(field, format!("Dependency '{dep}' is disabled"));
                    }
                    Some(_) => {}
                }
            }

            if matches!(resource.kind, ResourceKind::Cluster | ResourceKind::Addon)
                && !resource.config.contains_key("version")
            {
                result.warnings.push(format!(
                    "{prefix}.config.version: {} '{}' has no version and will never be upgraded",
                    resource.kind, resource.id
                ));
            }
        }

        let nodes: Vec<ResourceNode> = resources
            .iter()
            .map(|r| {
                let mut node = ResourceNode::new(r.kind, &r.id);
                node.depends_on.clone_from(&r.depends_on);
                node
            })
            .collect();
        let graph = match ResourceGraph::from_nodes(nodes) {
            Ok(graph) => graph,
            Err(e) => {
                result.error("resources", e.to_string());
                return;
            }
        };

        for resource in resources {
            if !matches!(resource.kind, ResourceKind::NodePool | ResourceKind::Addon) {
                continue;
            }
            let on_cluster = graph
                .transitive_dependencies(&resource.id)
                .iter()
                .any(|dep| graph.get(dep).is_some_and(|n| n.kind == ResourceKind::Cluster));
            if !on_cluster {
                result.warnings.push(format!(
                    "resources.{}: {} does not depend on any cluster",
                    resource.id, resource.kind
                ));
            }
        }
    }

    fn validate_per_environment(config: &PlatformConfig, result: &mut ValidationResult) {
        for env in &config.environments {
            let nodes = config.desired_nodes(env);
            let present: BTreeSet<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
            for node in &nodes {
                for dep in &node.depends_on {
                    let declared = config.resources.iter().any(|r| &r.id == dep);
                    if declared && !present.contains(dep.as_str()) {
                        result.error(
                            format!("environments.{}.overrides.{dep}", env.id),
                            format!(
                                "'{}' depends on '{dep}', which is disabled in {}",
                                node.id, env.id
                            ),
                        );
                    }
                }
            }
            Self::check_placeholders(env, &nodes, result);
        }
    }

    fn check_placeholders(env: &EnvironmentConfig, nodes: &[ResourceNode], result: &mut ValidationResult) {
        for node in nodes {
            let rendered = node.config.to_value().to_string();
            if rendered.contains("{{") {
                result.warnings.push(format!(
                    "environments.{}: resource '{}' contains an unknown placeholder",
                    env.id, node.id
                ));
            }
        }
    }
}

/// Checks if a name is valid (lowercase alphanumeric with hyphens).
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;

    fn parse(yaml: &str) -> PlatformConfig {
        ConfigParser::new().parse_yaml(yaml, None).unwrap()
    }

    const BASE: &str = r#"
project:
  name: eks-platform
provider:
  endpoint: https://provisioning.example.com/api/v1
environments:
  - id: dev
    region: eu-west-1
    account: "111111111111"
  - id: prod
    region: eu-central-1
    account: "333333333333"
    requires_approval: true
resources:
  - id: network
    kind: network
  - id: eks
    kind: cluster
    depends_on: [network]
    config:
      version: "1.29"
  - id: autoscaler
    kind: addon
    depends_on: [eks]
    config:
      version: "9.9.2"
"#;

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("eks"));
        assert!(is_valid_name("pre-prod"));
        assert!(is_valid_name("pool-1"));
    }

    #[test]
    fn test_invalid_name() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Prod"));
        assert!(!is_valid_name("1-env"));
        assert!(!is_valid_name("node_pool"));
        assert!(!is_valid_name("eks-"));
        assert!(!is_valid_name("eks--pool"));
    }

    #[test]
    fn test_valid_config() {
        let result = ConfigValidator::new().check(&parse(BASE));
        assert!(result.is_valid(), "{:?}", result.errors);
        assert_eq!(result.warning_count(), 0, "{:?}", result.warnings);
    }

    #[test]
    fn test_unknown_dependency() {
        let yaml = BASE.replace("depends_on: [network]", "depends_on: [vpc]");
        let result = ConfigValidator::new().check(&parse(&yaml));
        assert!(result.errors.iter().any(|e| e.field == "resources[1].depends_on[0]"));
    }

    #[test]
    fn test_cycle_is_reported() {
        let yaml = BASE.replace(
            "  - id: network\n    kind: network\n",
            "  - id: network\n    kind: network\n    depends_on: [autoscaler]\n",
        );
        let err = ConfigValidator::new().validate(&parse(&yaml)).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_duplicate_environment_and_position() {
        let yaml = BASE.replace("  - id: prod\n", "  - id: dev\n");
        let result = ConfigValidator::new().check(&parse(&yaml));
        assert!(result.errors.iter().any(|e| e.message.contains("Duplicate environment id")));
    }

    #[test]
    fn test_disabling_a_dependency_per_environment() {
        let yaml = BASE.replace(
            "    requires_approval: true\n",
            "    requires_approval: true\n    overrides:\n      eks:\n        enabled: false\n",
        );
        let result = ConfigValidator::new().check(&parse(&yaml));
        assert!(result
            .errors
            .iter()
            .any(|e| e.field == "environments.prod.overrides.eks"));
    }

    #[test]
    fn test_s3_backend_requires_bucket() {
        let yaml = format!("{BASE}state:\n  backend: s3\n");
        let result = ConfigValidator::new().check(&parse(&yaml));
        assert!(result.errors.iter().any(|e| e.field == "state.bucket"));
    }

    #[test]
    fn test_init_template_is_valid() {
        let config = parse(include_str!("../../templates/platform.yaml"));
        let result = ConfigValidator::new().check(&config);
        assert!(result.is_valid(), "{:?}", result.errors);

        let dev = config.environment("dev").unwrap();
        let nodes = config.desired_nodes(dev);
        assert!(!nodes.iter().any(|n| n.id == "spot-default"));
        assert!(nodes.iter().any(|n| n.id == "od-graviton"));

        let autoscaler = nodes.iter().find(|n| n.id == "cluster-autoscaler").unwrap();
        assert!(autoscaler.depends_on.iter().any(|d| d == "ssm-agent"));
        assert_eq!(config.ordered_environments().len(), 3);
    }
}
