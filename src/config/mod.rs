//! Platform configuration.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `converge.platform.yaml`
//! - Validation of configuration values
//! - Computing configuration hashes for change detection

mod hash;
mod parser;
mod spec;
mod validator;

pub use hash::ConfigHasher;
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, find_config_file};
pub use spec::{
    ApprovalMode, ApprovalSettings, EnvironmentConfig, ExecutorSettings, PlatformConfig,
    ProjectConfig, ProviderConfig, ReconcilerSettings, ResourceSpec, RetrySettings, StateBackend,
    StateConfig,
};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
