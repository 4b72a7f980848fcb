//! Planning and convergence.
//!
//! This module compares desired and observed states, turns the differences
//! into ordered plans, and applies those plans through the provisioning API.

mod barrier;
mod diff;
mod executor;
mod ledger;
mod plan;
mod retry;

pub use barrier::{Completion, DependencyBarrier};
pub use diff::{DiffDetail, DiffEngine, DiffResult, DiffType, ResourceDiff};
pub use executor::{ConvergenceExecutor, ExecutionReport, ExecutorConfig, OperationResult};
pub use ledger::{AppliedLedger, LedgerEntry};
pub use plan::{Action, Operation, OperationStatus, Plan};
pub use retry::RetryPolicy;
