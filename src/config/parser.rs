//! Configuration parser for loading and merging configuration files.
//!
//! Configuration comes from a YAML file, then `CONVERGE_*` environment
//! variables override a handful of fields that usually differ between an
//! operator's laptop and CI.

use crate::error::{ConfigError, ConvergeError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::PlatformConfig;

/// Configuration parser for loading platform configuration.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<PlatformConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConvergeError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            ConvergeError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<PlatformConfig> {
        debug!("Parsing YAML configuration");

        let config: PlatformConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string()).or_else(|| {
                e.location()
                    .map(|l| format!("line {}, column {}", l.line(), l.column()))
            });
            ConvergeError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!("Successfully parsed configuration for project: {}", config.project.name);
        Ok(config)
    }

    /// Loads configuration with environment variable overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<PlatformConfig> {
        let mut config = self.load_file(path)?;
        Self::apply_overrides(&mut config, |name| std::env::var(name).ok());
        Ok(config)
    }

    /// Applies `CONVERGE_*` overrides, reading variables through `lookup`.
    pub fn apply_overrides<F>(config: &mut PlatformConfig, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup("CONVERGE_PROJECT_NAME") {
            debug!("Overriding project.name from environment");
            config.project.name = name;
        }

        if let Some(bucket) = lookup("CONVERGE_STATE_BUCKET") {
            debug!("Overriding state.bucket from environment");
            config.state.bucket = Some(bucket);
        }

        if let Some(prefix) = lookup("CONVERGE_STATE_PREFIX") {
            debug!("Overriding state.prefix from environment");
            config.state.prefix = Some(prefix);
        }

        if let Some(endpoint) = lookup("CONVERGE_PROVIDER_ENDPOINT") {
            debug!("Overriding provider.endpoint from environment");
            config.provider.endpoint = Some(endpoint);
        }

        if let Some(parallel) = lookup("CONVERGE_MAX_PARALLEL").and_then(|v| v.parse().ok()) {
            debug!("Overriding executor.max_parallel from environment");
            config.executor.max_parallel = parallel;
        }
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                ConvergeError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Gets the provisioning API token named by `provider.token_env`.
    ///
    /// # Errors
    ///
    /// Returns an error if the variable is not set.
    pub fn provider_token(config: &PlatformConfig) -> Result<String> {
        let name = &config.provider.token_env;
        std::env::var(name).map_err(|_| {
            ConvergeError::Config(ConfigError::MissingEnvVar { name: name.clone() })
        })
    }
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["converge.platform.yaml", "converge.platform.yml"];

/// Finds the configuration file in the current directory or parent directories.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(ConvergeError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApprovalMode, StateBackend};
    use crate::graph::ResourceKind;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r"
project:
  name: test-platform
environments:
  - id: dev
    region: eu-west-1
    account: '111111111111'
";
        let config = ConfigParser::new().parse_yaml(yaml, None).unwrap();
        assert_eq!(config.project.name, "test-platform");
        assert_eq!(config.state.backend, StateBackend::Local);
        assert_eq!(config.approval.mode, ApprovalMode::Manual);
        assert_eq!(config.executor.max_parallel, 4);
        assert!(config.resources.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
project:
  name: eks-platform
state:
  backend: s3
  bucket: platform-state
  prefix: eks-platform
provider:
  endpoint: https://provisioning.example.com/api/v1
approval:
  mode: auto
  max_operations: 10
environments:
  - id: dev
    region: eu-west-1
    account: "111111111111"
  - id: prod
    region: eu-central-1
    account: "333333333333"
    requires_approval: true
    overrides:
      pool-general:
        desired_size: 6
resources:
  - id: network
    kind: network
    config:
      name: vpc-{{environment}}
  - id: pool-general
    kind: node-pool
    depends_on: [network]
    config:
      desired_size: 2
"#;
        let config = ConfigParser::new().parse_yaml(yaml, None).unwrap();
        assert_eq!(config.state.bucket.as_deref(), Some("platform-state"));
        assert_eq!(config.approval.max_operations, Some(10));
        assert_eq!(config.resources[1].kind, ResourceKind::NodePool);

        let prod = config.environment("prod").unwrap();
        let nodes = config.desired_nodes(prod);
        assert_eq!(nodes[0].config.get("name"), Some(&serde_json::json!("vpc-prod")));
        assert_eq!(nodes[1].config.get("desired_size"), Some(&serde_json::json!(6)));
    }

    #[test]
    fn test_parse_error() {
        let err = ConfigParser::new()
            .parse_yaml("project: [unclosed", None)
            .unwrap_err();
        assert!(matches!(
            err,
            ConvergeError::Config(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn test_env_overrides() {
        let yaml = "project:\n  name: eks-platform\nenvironments: []\n";
        let mut config = ConfigParser::new().parse_yaml(yaml, None).unwrap();
        let vars = HashMap::from([
            ("CONVERGE_STATE_BUCKET", "ci-state"),
            ("CONVERGE_PROVIDER_ENDPOINT", "http://localhost:8080"),
            ("CONVERGE_MAX_PARALLEL", "not-a-number"),
        ]);

        ConfigParser::apply_overrides(&mut config, |name| vars.get(name).map(|v| (*v).to_string()));

        assert_eq!(config.project.name, "eks-platform");
        assert_eq!(config.state.bucket.as_deref(), Some("ci-state"));
        assert_eq!(config.provider.endpoint.as_deref(), Some("http://localhost:8080"));
        assert_eq!(config.executor.max_parallel, 4);
    }

    #[test]
    fn test_find_config_file_searches_parents() {
        let temp = TempDir::new().unwrap();
        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(temp.path().join("converge.platform.yml"), "").unwrap();

        let found = find_config_file(&nested).unwrap();
        assert_eq!(found, temp.path().join("converge.platform.yml"));
    }

    #[test]
    fn test_load_missing_file() {
        let err = ConfigParser::new().load_file("/nonexistent/converge.platform.yaml").unwrap_err();
        assert!(matches!(err, ConvergeError::Config(ConfigError::FileNotFound { .. })));
    }
}
