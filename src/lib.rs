// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![warn(missing_docs)]                // All public items must be documented
#![warn(dead_code)]                   // Unused code is flagged
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![warn(unused_imports)]              // Unused imports are flagged
#![warn(unused_variables)]            // Unused variables are flagged
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Cluster Converge
//!
//! A staged lifecycle reconciliation engine for cloud platform environments.
//!
//! ## Overview
//!
//! A platform is declared once as a graph of resources (networks, clusters,
//! node pools, add-ons) and rolled out through an ordered chain of
//! environments such as `dev`, `pre-prod` and `prod`:
//!
//! - Compute the difference between declared and observed resources
//! - Apply the resulting plan in dependency order, with bounded parallelism
//! - Promote a desired state from one environment to the next behind
//!   approval gates
//! - Keep cluster add-ons at their declared versions
//!
//! ## Architecture
//!
//! 1. **Desired State**: Defined in `converge.platform.yaml`
//! 2. **Observed State**: Queried through a [`provider::ProvisioningApi`]
//! 3. **Planner**: Turns the diff into an ordered [`Plan`] and executes it
//! 4. **Pipeline**: Drives a [`pipeline::PipelineRun`] across environments
//!
//! ## Modules
//!
//! - [`config`]: Configuration parsing and validation
//! - [`graph`]: Resource nodes and the dependency graph
//! - [`planner`]: Diff computation, plans and the convergence executor
//! - [`provider`]: Provisioning API interface and clients
//! - [`registry`]: Environment records and approval status
//! - [`pipeline`]: Promotion runs, approval gates and cancellation
//! - [`reconciler`]: Per-cluster add-on reconciliation and drift checks
//! - [`state`]: State storage backends (local, S3)
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: eks-platform
//!
//! environments:
//!   - id: dev
//!     region: eu-west-1
//!     account: "111111111111"
//!   - id: prod
//!     region: eu-central-1
//!     account: "333333333333"
//!     requires_approval: true
//!
//! resources:
//!   - id: network
//!     kind: network
//!     config:
//!       name: vpc-{{environment}}
//!   - id: eks
//!     kind: cluster
//!     depends_on: [network]
//!     config:
//!       version: "1.29"
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod graph;
pub mod pipeline;
pub mod planner;
pub mod provider;
pub mod reconciler;
pub mod registry;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, PlatformConfig};
pub use error::{ConvergeError, Result};
pub use graph::{ResourceGraph, ResourceKind, ResourceNode};
pub use pipeline::{PipelineRun, PromotionController, RunState};
pub use planner::{ConvergenceExecutor, DiffEngine, Plan};
pub use provider::{HttpProvisioner, InMemoryProvisioner, ProvisioningApi};
pub use reconciler::{AddonReconciler, CycleReport, DriftReport};
pub use registry::{Environment, EnvironmentRegistry};
pub use state::{LocalStateStore, PlatformState, S3StateStore, StateStore};
