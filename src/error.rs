//! Error types for the convergence engine.
//!
//! This module provides the error hierarchy for every stage of the cluster
//! lifecycle: configuration, graph construction, planning, provisioning,
//! convergence, the environment registry, promotion pipelines and state.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// The main error type for the convergence engine.
#[derive(Debug, Error)]
pub enum ConvergeError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Resource graph errors.
    #[error("{0}")]
    Graph(#[from] GraphError),

    /// Planning errors.
    #[error("{0}")]
    Plan(#[from] PlanError),

    /// Provisioning API errors.
    #[error("Provisioning error: {0}")]
    Provision(#[from] ProvisionError),

    /// Plan execution errors.
    #[error("{0}")]
    Convergence(#[from] ConvergenceError),

    /// Environment registry errors.
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Promotion pipeline errors.
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },

    /// An environment name was requested that the configuration does not declare.
    #[error("Unknown environment: {name}")]
    UnknownEnvironment {
        /// The requested environment name.
        name: String,
    },
}

/// Resource graph errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    /// Inserting a node would create a dependency cycle.
    #[error("CycleError: dependency cycle {}", cycle.join(" -> "))]
    Cycle {
        /// The identifiers along the cycle, first and last equal.
        cycle: Vec<String>,
    },

    /// A node with the same identifier is already in the graph.
    #[error("Duplicate resource identifier: {id}")]
    DuplicateNode {
        /// The duplicated identifier.
        id: String,
    },
}

/// Planning errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlanError {
    /// Two desired nodes declare the same identifier with different configurations.
    #[error("PlanConflictError: resource '{id}' is declared more than once with different configurations")]
    Conflict {
        /// The conflicting identifier.
        id: String,
    },

    /// A desired node depends on an identifier that is not declared.
    #[error("Failed to resolve dependencies: {message}")]
    DependencyResolutionFailed {
        /// Description of the dependency issue.
        message: String,
    },
}

/// Errors reported by the provisioning API.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProvisionError {
    /// The API throttled the request.
    #[error("rate limited, retry after {retry_after_secs} seconds")]
    RateLimited {
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// The resource is not yet visible or settled (eventual consistency).
    #[error("resource '{resource}' is not yet consistent: {message}")]
    NotYetConsistent {
        /// The resource identifier.
        resource: String,
        /// Provider message.
        message: String,
    },

    /// The API is temporarily unavailable.
    #[error("service unavailable ({status}): {message}")]
    Unavailable {
        /// HTTP status code.
        status: u16,
        /// Provider message.
        message: String,
    },

    /// Transport-level failure.
    #[error("network error: {message}")]
    Network {
        /// Description of the network error.
        message: String,
    },

    /// The operation did not finish within its timeout.
    #[error("timed out after {}s", elapsed.as_secs())]
    Timeout {
        /// How long the operation ran.
        elapsed: Duration,
    },

    /// The configuration was rejected by the provider.
    #[error("invalid configuration for '{resource}': {message}")]
    InvalidConfiguration {
        /// The resource identifier.
        resource: String,
        /// Provider message.
        message: String,
    },

    /// The resource does not exist.
    #[error("resource '{resource}' not found")]
    NotFound {
        /// The resource identifier.
        resource: String,
    },

    /// Credentials were missing or refused.
    #[error("authentication failed: {message}")]
    AuthenticationFailed {
        /// Description of the auth failure.
        message: String,
    },

    /// Any other non-retryable API failure.
    #[error("request rejected ({status}): {message}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Provider message.
        message: String,
    },

    /// The provider returned a response that could not be understood.
    #[error("invalid response: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },
}

/// Errors produced while converging a plan.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConvergenceError {
    /// Transient failures persisted beyond the retry budget.
    #[error("TransientProvisioningError: {action} '{resource}' failed after {attempts} attempts: {reason}")]
    TransientExhausted {
        /// The resource identifier.
        resource: String,
        /// The operation action.
        action: String,
        /// Number of attempts made.
        attempts: u32,
        /// Last error observed.
        reason: String,
    },

    /// A non-retryable failure halted the operation and its dependents.
    #[error("UnrecoverableProvisioningError: {action} '{resource}' failed: {reason}")]
    Unrecoverable {
        /// The resource identifier.
        resource: String,
        /// The operation action.
        action: String,
        /// The provider error.
        reason: String,
    },

    /// The plan was cancelled before all operations started.
    #[error("Convergence cancelled: {reason}")]
    Cancelled {
        /// Reason for cancellation.
        reason: String,
    },
}

/// Environment registry errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The environment is not registered.
    #[error("Unknown environment: {id}")]
    UnknownEnvironment {
        /// The requested environment identifier.
        id: String,
    },

    /// An environment with this identifier is already registered.
    #[error("Environment '{id}' is already registered")]
    DuplicateEnvironment {
        /// The duplicated identifier.
        id: String,
    },

    /// Another environment already occupies this promotion position.
    #[error("Promotion position {position} is already taken by '{existing}'")]
    DuplicatePosition {
        /// The contested position.
        position: u32,
        /// The environment holding it.
        existing: String,
    },

    /// An earlier environment in the sequence has not converged.
    #[error("Cannot approve '{environment}': preceding environment '{blocking}' has not converged")]
    PrecedingNotConverged {
        /// The environment being approved.
        environment: String,
        /// The first unconverged predecessor.
        blocking: String,
    },
}

/// Promotion pipeline errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    /// The pipeline run does not exist.
    #[error("Pipeline run not found: {id}")]
    RunNotFound {
        /// The requested run identifier.
        id: String,
    },

    /// The event is not valid in the run's current state.
    #[error("Event '{event}' is not valid while the run is {state}")]
    InvalidTransition {
        /// Current run state.
        state: String,
        /// The rejected event.
        event: String,
    },

    /// A run identifier prefix matched more than one run.
    #[error("Run identifier '{prefix}' is ambiguous ({matches} runs match)")]
    AmbiguousRunId {
        /// The requested prefix.
        prefix: String,
        /// Number of matching runs.
        matches: usize,
    },

    /// An approval decision named the wrong environment.
    #[error("Run is awaiting approval for '{expected}', not '{received}'")]
    EnvironmentMismatch {
        /// The environment awaiting approval.
        expected: String,
        /// The environment named by the decision.
        received: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, purpose: {purpose}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// What the holder is doing.
        purpose: String,
        /// When the lock was acquired.
        since: String,
    },

    /// Storage backend error.
    #[error("State storage error: {message}")]
    Storage {
        /// Description of the storage error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },
}

/// Result type alias for convergence operations.
pub type Result<T> = std::result::Result<T, ConvergeError>;

/// Process exit codes, one per error category.
pub mod exit_codes {
    /// Internal or IO failure.
    pub const INTERNAL: u8 = 1;
    /// Invalid configuration.
    pub const CONFIG: u8 = 2;
    /// Dependency cycle in the desired graph.
    pub const CYCLE: u8 = 3;
    /// Ambiguous desired state.
    pub const PLAN_CONFLICT: u8 = 4;
    /// Transient provisioning failures exhausted their retries.
    pub const TRANSIENT_PROVISIONING: u8 = 5;
    /// Unrecoverable provisioning failure.
    pub const UNRECOVERABLE_PROVISIONING: u8 = 6;
    /// State backend or lock failure.
    pub const STATE: u8 = 7;
    /// A promotion ended with an approval rejection.
    pub const APPROVAL_REJECTED: u8 = 8;
    /// Pipeline or registry misuse.
    pub const PIPELINE: u8 = 9;
    /// A run or apply was cancelled.
    pub const CANCELLED: u8 = 10;
}

impl ConvergeError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns the process exit code for this error.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) | Self::Plan(PlanError::DependencyResolutionFailed { .. }) => {
                exit_codes::CONFIG
            }
            Self::Graph(GraphError::Cycle { .. }) => exit_codes::CYCLE,
            Self::Graph(GraphError::DuplicateNode { .. }) | Self::Plan(PlanError::Conflict { .. }) => {
                exit_codes::PLAN_CONFLICT
            }
            Self::Provision(err) => {
                if err.is_transient() {
                    exit_codes::TRANSIENT_PROVISIONING
                } else {
                    exit_codes::UNRECOVERABLE_PROVISIONING
                }
            }
            Self::Convergence(ConvergenceError::TransientExhausted { .. }) => {
                exit_codes::TRANSIENT_PROVISIONING
            }
            Self::Convergence(ConvergenceError::Unrecoverable { .. }) => {
                exit_codes::UNRECOVERABLE_PROVISIONING
            }
            Self::Convergence(ConvergenceError::Cancelled { .. }) => exit_codes::CANCELLED,
            Self::Registry(_) | Self::Pipeline(_) => exit_codes::PIPELINE,
            Self::State(_) => exit_codes::STATE,
            Self::Io(_) | Self::Internal(_) => exit_codes::INTERNAL,
        }
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Provision(err) => err.is_transient(),
            Self::State(StateError::LockFailed { .. }) => true,
            _ => false,
        }
    }
}

impl ProvisionError {
    /// Returns true for rate limits, eventual-consistency lag and transport trouble.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::NotYetConsistent { .. }
                | Self::Unavailable { .. }
                | Self::Network { .. }
                | Self::Timeout { .. }
        )
    }

    /// Returns the delay the provider asked for, if any.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after_secs } => Some(Duration::from_secs(*retry_after_secs)),
            _ => None,
        }
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Creates an invalid configuration error.
    #[must_use]
    pub fn invalid(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            resource: resource.into(),
            message: message.into(),
        }
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }
}

impl StateError {
    /// Creates a storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_error_names_path() {
        let err = ConvergeError::from(GraphError::Cycle {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        });
        assert_eq!(err.to_string(), "CycleError: dependency cycle a -> b -> a");
        assert_eq!(err.exit_code(), exit_codes::CYCLE);
    }

    #[test]
    fn test_transient_classification() {
        assert!(ProvisionError::RateLimited { retry_after_secs: 3 }.is_transient());
        assert!(ProvisionError::network("reset").is_transient());
        assert!(!ProvisionError::invalid("eks", "bad version").is_transient());
        assert!(!ProvisionError::NotFound { resource: "eks".into() }.is_transient());
    }

    #[test]
    fn test_exit_codes() {
        let conflict = ConvergeError::from(PlanError::Conflict { id: "eks".into() });
        assert_eq!(conflict.exit_code(), exit_codes::PLAN_CONFLICT);

        let exhausted = ConvergeError::from(ConvergenceError::TransientExhausted {
            resource: "eks".into(),
            action: "create".into(),
            attempts: 5,
            reason: "rate limited".into(),
        });
        assert_eq!(exhausted.exit_code(), exit_codes::TRANSIENT_PROVISIONING);

        let unrecoverable = ConvergeError::from(ConvergenceError::Unrecoverable {
            resource: "eks".into(),
            action: "create".into(),
            reason: "invalid".into(),
        });
        assert_eq!(unrecoverable.exit_code(), exit_codes::UNRECOVERABLE_PROVISIONING);
    }
}
