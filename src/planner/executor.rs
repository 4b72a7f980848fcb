//! Convergence executor for applying plans.
//!
//! Operations are started in plan order and dispatched as soon as their
//! prerequisites have completed. Independent branches of the plan run
//! concurrently up to `max_parallel`. A failure blocks only the operations
//! that depend on it, transitively; every other branch keeps going.

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{ConvergenceError, ProvisionError};
use crate::graph::ResourceKind;
use crate::pipeline::CancellationFlag;
use crate::provider::ProvisioningApi;

use super::barrier::{Completion, DependencyBarrier};
use super::ledger::AppliedLedger;
use super::plan::{Action, Operation, OperationStatus, Plan};
use super::retry::RetryPolicy;

/// Executor settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Maximum number of operations in flight at once.
    pub max_parallel: usize,
    /// Upper bound of a single provider call.
    pub operation_timeout: Duration,
    /// Retry behavior for transient errors.
    pub retry: RetryPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            operation_timeout: Duration::from_secs(900),
            retry: RetryPolicy::default(),
        }
    }
}

/// Executor for convergence plans.
#[derive(Debug, Clone)]
pub struct ConvergenceExecutor {
    /// Provisioning API.
    provider: Arc<dyn ProvisioningApi>,
    /// Settings.
    config: ExecutorConfig,
}

/// Outcome of one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    /// Index of the operation in the plan.
    pub index: usize,
    /// Target resource identifier.
    pub target: String,
    /// Target resource kind.
    pub kind: ResourceKind,
    /// Requested action.
    pub action: Action,
    /// Final status.
    pub status: OperationStatus,
    /// Number of provider calls made.
    pub attempts: u32,
    /// Failure, if the operation failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ConvergenceError>,
    /// The prerequisite that prevented this operation from running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<String>,
    /// Wall time spent on the operation, in milliseconds.
    pub duration_ms: u64,
}

/// Result of applying a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReport {
    /// Plan that was applied.
    pub plan_id: Uuid,
    /// Target environment.
    pub environment: String,
    /// Desired-state version of the plan.
    pub version: String,
    /// Per-operation results, in plan order.
    pub results: Vec<OperationResult>,
    /// Operations applied by the provider.
    pub applied: usize,
    /// Operations skipped because the ledger already recorded them.
    pub no_op: usize,
    /// Failed operations.
    pub failed: usize,
    /// Operations blocked by a failed prerequisite.
    pub skipped: usize,
    /// Operations never started because of cancellation.
    pub cancelled: usize,
    /// Operations sent to the provider at least once.
    pub dispatched: usize,
    /// When execution started.
    pub started_at: DateTime<Utc>,
    /// When execution finished.
    pub finished_at: DateTime<Utc>,
}

impl ConvergenceExecutor {
    /// Creates an executor with default settings.
    #[must_use]
    pub fn new(provider: Arc<dyn ProvisioningApi>) -> Self {
        Self {
            provider,
            config: ExecutorConfig::default(),
        }
    }

    /// Replaces the settings.
    #[must_use]
    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Returns the settings.
    #[must_use]
    pub const fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Applies a plan, recording each success in `ledger`.
    ///
    /// Operation statuses in `plan` are updated to their final values.
    pub async fn apply(&self, plan: &mut Plan, ledger: &mut AppliedLedger) -> ExecutionReport {
        self.run(plan, ledger, None).await
    }

    /// Applies a plan, starting no new operation once `flag` is cancelled.
    pub async fn apply_with_cancellation(
        &self,
        plan: &mut Plan,
        ledger: &mut AppliedLedger,
        flag: &CancellationFlag,
    ) -> ExecutionReport {
        self.run(plan, ledger, Some(flag)).await
    }

    async fn run(
        &self,
        plan: &mut Plan,
        ledger: &mut AppliedLedger,
        cancel: Option<&CancellationFlag>,
    ) -> ExecutionReport {
        let started_at = Utc::now();
        info!(
            "Applying plan {} to {} with {} operations",
            plan.id,
            plan.environment,
            plan.operations.len()
        );

        let operations = plan.operations.clone();
        let already_applied: Vec<bool> = operations.iter().map(|op| ledger.is_applied(op)).collect();
        let barrier = DependencyBarrier::new(operations.len());
        let semaphore = Semaphore::new(self.config.max_parallel.max(1));
        let environment = plan.environment.as_str();

        let mut pending: FuturesUnordered<_> = operations
            .iter()
            .enumerate()
            .map(|(index, op)| {
                let ctx = OperationContext {
                    environment,
                    operations: &operations,
                    barrier: &barrier,
                    semaphore: &semaphore,
                    cancel,
                };
                self.run_operation(ctx, index, op, already_applied[index])
            })
            .collect();

        let mut results: Vec<Option<OperationResult>> = vec![None; operations.len()];
        while let Some(result) = pending.next().await {
            if result.status == OperationStatus::Applied {
                ledger.record(&operations[result.index], plan.id);
            }
            let index = result.index;
            results[index] = Some(result);
        }
        drop(pending);

        let results: Vec<OperationResult> = results.into_iter().flatten().collect();
        for result in &results {
            if let Some(op) = plan.operations.get_mut(result.index) {
                op.status = result.status;
            }
        }

        let count = |s: OperationStatus| results.iter().filter(|r| r.status == s).count();
        let report = ExecutionReport {
            plan_id: plan.id,
            environment: plan.environment.clone(),
            version: plan.version.clone(),
            applied: count(OperationStatus::Applied),
            no_op: count(OperationStatus::NoOp),
            failed: count(OperationStatus::Failed),
            skipped: count(OperationStatus::Skipped),
            cancelled: count(OperationStatus::Cancelled),
            dispatched: results.iter().filter(|r| r.attempts > 0).count(),
            results,
            started_at,
            finished_at: Utc::now(),
        };

        if report.success() {
            info!(
                "Plan {} converged: {} applied, {} no-op",
                report.plan_id, report.applied, report.no_op
            );
        } else {
            warn!(
                "Plan {} did not converge: {} failed, {} skipped, {} cancelled",
                report.plan_id, report.failed, report.skipped, report.cancelled
            );
        }

        report
    }

    async fn run_operation(
        &self,
        ctx: OperationContext<'_>,
        index: usize,
        op: &Operation,
        already_applied: bool,
    ) -> OperationResult {
        let started = Instant::now();
        let mut result = OperationResult {
            index,
            target: op.target.clone(),
            kind: op.kind,
            action: op.action,
            status: OperationStatus::Pending,
            attempts: 0,
            error: None,
            blocked_by: None,
            duration_ms: 0,
        };

        let completion = if let Err(blocking) = ctx.barrier.wait_for(&op.depends_on).await {
            let name = ctx
                .operations
                .get(blocking)
                .map_or_else(|| format!("#{blocking}"), ToString::to_string);
            let completion = if ctx.barrier.completion(blocking) == Some(Completion::Cancelled) {
                debug!("Not starting {op}: {name} was cancelled");
                result.status = OperationStatus::Cancelled;
                Completion::Cancelled
            } else {
                warn!("Skipping {op}: prerequisite {name} did not succeed");
                result.status = OperationStatus::Skipped;
                Completion::Blocked
            };
            result.blocked_by = Some(name);
            completion
        } else if already_applied {
            debug!("{op} matches the last recorded success, skipping");
            result.status = OperationStatus::NoOp;
            Completion::Succeeded
        } else {
            self.dispatch(&ctx, op, &mut result).await
        };

        ctx.barrier.complete(index, completion);
        result.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        result
    }

    async fn dispatch(
        &self,
        ctx: &OperationContext<'_>,
        op: &Operation,
        result: &mut OperationResult,
    ) -> Completion {
        let Ok(_permit) = ctx.semaphore.acquire().await else {
            result.status = OperationStatus::Cancelled;
            return Completion::Cancelled;
        };

        if let Some(flag) = ctx.cancel
            && flag.is_cancelled()
        {
            debug!("Not starting {op}: run cancelled");
            result.status = OperationStatus::Cancelled;
            return Completion::Cancelled;
        }

        let retry = &self.config.retry;
        loop {
            result.attempts += 1;
            debug!("Dispatching {op} (attempt {})", result.attempts);

            let outcome = match tokio::time::timeout(
                self.config.operation_timeout,
                self.provider.apply_operation(ctx.environment, op),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(ProvisionError::Timeout {
                    elapsed: self.config.operation_timeout,
                }),
            };

            let err = match outcome {
                Ok(()) => {
                    result.status = OperationStatus::Applied;
                    return Completion::Succeeded;
                }
                Err(ProvisionError::NotFound { .. }) if op.action == Action::Delete => {
                    debug!("{op}: resource already absent");
                    result.status = OperationStatus::Applied;
                    return Completion::Succeeded;
                }
                Err(err) => err,
            };

            if retry.should_retry(result.attempts, &err) {
                let delay = retry.delay_for(result.attempts, &err);
                warn!(
                    "{op} failed with transient error ({err}), retrying in {}ms",
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            let failure = if err.is_transient() {
                ConvergenceError::TransientExhausted {
                    resource: op.target.clone(),
                    action: op.action.to_string(),
                    attempts: result.attempts,
                    reason: err.to_string(),
                }
            } else {
                ConvergenceError::Unrecoverable {
                    resource: op.target.clone(),
                    action: op.action.to_string(),
                    reason: err.to_string(),
                }
            };
            error!("{failure}");
            result.status = OperationStatus::Failed;
            result.error = Some(failure);
            return Completion::Blocked;
        }
    }
}

/// Shared per-plan state borrowed by every operation future.
#[derive(Clone, Copy)]
struct OperationContext<'a> {
    environment: &'a str,
    operations: &'a [Operation],
    barrier: &'a DependencyBarrier,
    semaphore: &'a Semaphore,
    cancel: Option<&'a CancellationFlag>,
}

impl ExecutionReport {
    /// Returns true if every operation reached its target state.
    #[must_use]
    pub fn success(&self) -> bool {
        self.results
            .iter()
            .all(|r| matches!(r.status, OperationStatus::Applied | OperationStatus::NoOp))
    }

    /// Returns the failed operations.
    #[must_use]
    pub fn failures(&self) -> Vec<&OperationResult> {
        self.results
            .iter()
            .filter(|r| r.status == OperationStatus::Failed)
            .collect()
    }

    /// Returns the first failure in plan order, if any.
    #[must_use]
    pub fn first_error(&self) -> Option<&ConvergenceError> {
        self.results.iter().find_map(|r| r.error.as_ref())
    }

    /// Returns the result for a resource.
    #[must_use]
    pub fn result_for(&self, target: &str) -> Option<&OperationResult> {
        self.results.iter().find(|r| r.target == target)
    }

    /// Returns the error that best describes an unsuccessful report.
    #[must_use]
    pub fn to_error(&self) -> Option<ConvergenceError> {
        if let Some(err) = self.first_error() {
            return Some(err.clone());
        }
        (self.cancelled > 0).then(|| ConvergenceError::Cancelled {
            reason: format!("{} operations were not started", self.cancelled),
        })
    }
}

impl std::fmt::Display for ExecutionReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Execution of plan {} on {}: {} applied, {} no-op, {} failed, {} skipped, {} cancelled",
            self.plan_id,
            self.environment,
            self.applied,
            self.no_op,
            self.failed,
            self.skipped,
            self.cancelled
        )?;
        for r in &self.results {
            write!(f, "  {}({}): {}", r.action, r.target, r.status)?;
            if let Some(err) = &r.error {
                write!(f, " - {err}")?;
            }
            if let Some(blocked) = &r.blocked_by {
                write!(f, " (blocked by {blocked})")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ResourceConfig, ResourceNode};
    use crate::planner::DiffEngine;
    use crate::provider::InMemoryProvisioner;
    use pretty_assertions::assert_eq;

    fn fast_config() -> ExecutorConfig {
        ExecutorConfig {
            max_parallel: 4,
            operation_timeout: Duration::from_secs(5),
            retry: RetryPolicy::new()
                .with_max_attempts(3)
                .with_base_delay(Duration::from_millis(1))
                .with_max_delay(Duration::from_millis(5))
                .with_jitter(false),
        }
    }

    fn executor(provider: &Arc<InMemoryProvisioner>) -> ConvergenceExecutor {
        let api: Arc<dyn ProvisioningApi> = provider.clone();
        ConvergenceExecutor::new(api).with_config(fast_config())
    }

    fn network() -> ResourceNode {
        ResourceNode::new(ResourceKind::Network, "network")
            .with_config(ResourceConfig::new().with("cidr", "10.0.0.0/16"))
    }

    fn cluster() -> ResourceNode {
        ResourceNode::new(ResourceKind::Cluster, "eks").with_dependency("network")
    }

    async fn plan_for(provider: &InMemoryProvisioner, desired: &[ResourceNode]) -> Plan {
        let observed = provider.observed_state("dev").await.unwrap();
        let diff = DiffEngine::new().compute_diff(desired, &observed).unwrap();
        Plan::from_diff("dev", "v1", &diff)
    }

    #[tokio::test]
    async fn test_applies_in_dependency_order() {
        let provider = Arc::new(InMemoryProvisioner::new());
        let mut plan = plan_for(&provider, &[cluster(), network()]).await;
        let mut ledger = AppliedLedger::new();

        let report = executor(&provider).apply(&mut plan, &mut ledger).await;

        assert!(report.success());
        assert_eq!(report.applied, 2);
        let order: Vec<_> = provider.dispatched().into_iter().map(|d| d.target).collect();
        assert_eq!(order, vec!["network", "eks"]);
        assert!(plan.operations.iter().all(|op| op.status == OperationStatus::Applied));
        assert_eq!(ledger.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_prerequisite_skips_dependents() {
        let provider = Arc::new(InMemoryProvisioner::new());
        provider.fail_always("network", ProvisionError::invalid("network", "cidr overlaps"));
        let pool = ResourceNode::new(ResourceKind::NodePool, "pool").with_dependency("eks");
        let standalone = ResourceNode::new(ResourceKind::Network, "dns");
        let mut plan = plan_for(&provider, &[network(), cluster(), pool, standalone]).await;

        let report = executor(&provider).apply(&mut plan, &mut AppliedLedger::new()).await;

        assert!(!report.success());
        let network = report.result_for("network").unwrap();
        assert_eq!(network.status, OperationStatus::Failed);
        assert_eq!(network.attempts, 1);
        assert!(matches!(
            network.error,
            Some(ConvergenceError::Unrecoverable { ref resource, ref action, .. })
                if resource == "network" && action == "create"
        ));

        let eks = report.result_for("eks").unwrap();
        assert_eq!(eks.status, OperationStatus::Skipped);
        assert_eq!(eks.blocked_by.as_deref(), Some("create(network)"));
        assert_eq!(report.result_for("pool").unwrap().status, OperationStatus::Skipped);
        assert_eq!(report.result_for("dns").unwrap().status, OperationStatus::Applied);

        let dispatched: Vec<_> = provider.dispatched().into_iter().map(|d| d.target).collect();
        assert!(!dispatched.contains(&"eks".to_string()));
        assert_eq!((report.failed, report.skipped, report.applied), (1, 2, 1));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let provider = Arc::new(InMemoryProvisioner::new());
        provider.fail_times("network", 2, ProvisionError::RateLimited { retry_after_secs: 0 });
        let mut plan = plan_for(&provider, &[network()]).await;

        let report = executor(&provider).apply(&mut plan, &mut AppliedLedger::new()).await;

        assert!(report.success());
        assert_eq!(report.results[0].attempts, 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_escalate() {
        let provider = Arc::new(InMemoryProvisioner::new());
        provider.fail_always(
            "network",
            ProvisionError::NotYetConsistent {
                resource: "network".into(),
                message: "vpc pending".into(),
            },
        );
        let mut plan = plan_for(&provider, &[network()]).await;

        let report = executor(&provider).apply(&mut plan, &mut AppliedLedger::new()).await;

        assert_eq!(report.failed, 1);
        assert!(matches!(
            report.to_error(),
            Some(ConvergenceError::TransientExhausted { attempts: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_second_apply_dispatches_nothing() {
        let provider = Arc::new(InMemoryProvisioner::new());
        let mut plan = plan_for(&provider, &[network(), cluster()]).await;
        let mut ledger = AppliedLedger::new();
        let executor = executor(&provider);

        let first = executor.apply(&mut plan, &mut ledger).await;
        let state_after_first = provider.resources("dev");
        let second = executor.apply(&mut plan, &mut ledger).await;

        assert_eq!(first.applied, 2);
        assert_eq!(second.no_op, 2);
        assert_eq!(second.dispatched, 0);
        assert_eq!(provider.dispatch_count(), 2);
        assert_eq!(provider.resources("dev"), state_after_first);
    }

    #[tokio::test]
    async fn test_kind_change_is_dispatched() {
        let provider = Arc::new(InMemoryProvisioner::new());
        let config = ResourceConfig::new().with("replicas", 2);
        let pool = ResourceNode::new(ResourceKind::NodePool, "x").with_config(config.clone());
        let mut ledger = AppliedLedger::new();
        let executor = executor(&provider);

        let mut first = plan_for(&provider, &[pool]).await;
        assert!(executor.apply(&mut first, &mut ledger).await.success());

        let addon = ResourceNode::new(ResourceKind::Addon, "x").with_config(config);
        let mut second = plan_for(&provider, &[addon]).await;
        assert_eq!(second.operations[0].action, Action::Update);
        let report = executor.apply(&mut second, &mut ledger).await;

        assert!(report.success());
        assert_eq!((report.applied, report.no_op), (1, 0));
        assert_eq!(provider.dispatch_count(), 2);
        assert_eq!(provider.resources("dev")[0].kind, ResourceKind::Addon);
    }

    #[tokio::test]
    async fn test_delete_of_absent_resource_counts_as_applied() {
        let provider = Arc::new(InMemoryProvisioner::new());
        let op = Operation::new("old", ResourceKind::Addon, Action::Delete, ResourceConfig::new());
        let mut plan = Plan::new("dev", "v1", vec![op]);

        let report = executor(&provider).apply(&mut plan, &mut AppliedLedger::new()).await;

        assert!(report.success());
        assert_eq!(report.applied, 1);
    }

    #[tokio::test]
    async fn test_independent_branches_run_concurrently() {
        let provider = Arc::new(InMemoryProvisioner::new().with_latency(Duration::from_millis(30)));
        let pools: Vec<_> = (0..4)
            .map(|i| ResourceNode::new(ResourceKind::Network, format!("net-{i}")))
            .collect();
        let mut plan = plan_for(&provider, &pools).await;

        let config = ExecutorConfig {
            max_parallel: 2,
            ..fast_config()
        };
        let api: Arc<dyn ProvisioningApi> = provider.clone();
        let report = ConvergenceExecutor::new(api)
            .with_config(config)
            .apply(&mut plan, &mut AppliedLedger::new())
            .await;

        assert!(report.success());
        assert_eq!(provider.max_in_flight(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_run_starts_nothing() {
        let provider = Arc::new(InMemoryProvisioner::new());
        let mut plan = plan_for(&provider, &[network(), cluster()]).await;
        let flag = CancellationFlag::new();
        flag.cancel("operator");

        let report = executor(&provider)
            .apply_with_cancellation(&mut plan, &mut AppliedLedger::new(), &flag)
            .await;

        assert_eq!(report.cancelled, 2);
        assert_eq!(provider.dispatch_count(), 0);
        assert!(matches!(report.to_error(), Some(ConvergenceError::Cancelled { .. })));
    }
}
