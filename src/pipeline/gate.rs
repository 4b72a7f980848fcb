//! Approval gates and delivery hand-off.
//!
//! A gate receives an [`ApprovalRequest`] when a run reaches an environment
//! that needs approval. It never blocks the controller: it either defers the
//! decision to a later external event or decides on the spot.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};
use uuid::Uuid;

/// A promotion request keyed by run and environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Pipeline run asking for approval.
    pub run_id: Uuid,
    /// Environment to promote into.
    pub environment: String,
    /// Desired-state version being promoted.
    pub version: String,
    /// Number of operations in the plan.
    pub operations: usize,
    /// Human-readable plan.
    pub summary: String,
}

/// An approval decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "lowercase")]
pub enum ApprovalDecision {
    /// Promotion may proceed.
    Approve,
    /// Promotion is refused.
    Reject {
        /// Why it was refused.
        reason: String,
    },
}

/// What a gate did with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateResponse {
    /// The decision will arrive later as an external event.
    Deferred,
    /// The gate decided immediately.
    Decided(ApprovalDecision),
}

/// Receives approval requests.
#[async_trait]
pub trait ApprovalGate: Send + Sync + std::fmt::Debug {
    /// Submits a request.
    async fn submit(&self, request: &ApprovalRequest) -> GateResponse;

    /// Called once a decision for `environment` in `run_id` has been applied.
    fn resolved(&self, _run_id: Uuid, _environment: &str) {}
}

/// A gate that waits for a human decision.
///
/// Requests are kept until withdrawn; the decision is delivered to the
/// controller separately (e.g. by `converge approve`).
#[derive(Debug, Default)]
pub struct ManualApprovalGate {
    pending: RwLock<HashMap<(Uuid, String), ApprovalRequest>>,
}

impl ManualApprovalGate {
    /// Creates a gate with no pending requests.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the pending requests.
    #[must_use]
    pub fn pending(&self) -> Vec<ApprovalRequest> {
        let mut requests: Vec<_> = self.pending.read().values().cloned().collect();
        requests.sort_by(|a, b| (a.run_id, &a.environment).cmp(&(b.run_id, &b.environment)));
        requests
    }

    /// Withdraws a request once it has been decided.
    pub fn withdraw(&self, run_id: Uuid, environment: &str) -> Option<ApprovalRequest> {
        self.pending.write().remove(&(run_id, environment.to_string()))
    }
}

#[async_trait]
impl ApprovalGate for ManualApprovalGate {
    async fn submit(&self, request: &ApprovalRequest) -> GateResponse {
        info!(
            "Run {} is waiting for approval to promote version {} into {} ({} operations)",
            request.run_id, request.version, request.environment, request.operations
        );
        self.pending.write().insert(
            (request.run_id, request.environment.clone()),
            request.clone(),
        );
        GateResponse::Deferred
    }

    fn resolved(&self, run_id: Uuid, environment: &str) {
        self.withdraw(run_id, environment);
    }
}

/// Policy of an automatic gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoApprovalPolicy {
    /// Approve everything.
    ApproveAll,
    /// Reject everything with a fixed reason.
    RejectAll(String),
    /// Approve plans with at most this many operations.
    MaxOperations(usize),
}

/// A gate that decides immediately according to a policy.
#[derive(Debug, Clone)]
pub struct AutoApprovalGate {
    policy: AutoApprovalPolicy,
}

impl AutoApprovalGate {
    /// Creates a gate with the given policy.
    #[must_use]
    pub const fn new(policy: AutoApprovalPolicy) -> Self {
        Self { policy }
    }

    /// A gate that approves everything.
    #[must_use]
    pub const fn approve_all() -> Self {
        Self::new(AutoApprovalPolicy::ApproveAll)
    }
}

#[async_trait]
impl ApprovalGate for AutoApprovalGate {
    async fn submit(&self, request: &ApprovalRequest) -> GateResponse {
        let decision = match &self.policy {
            AutoApprovalPolicy::ApproveAll => ApprovalDecision::Approve,
            AutoApprovalPolicy::RejectAll(reason) => ApprovalDecision::Reject {
                reason: reason.clone(),
            },
            AutoApprovalPolicy::MaxOperations(max) if request.operations <= *max => {
                ApprovalDecision::Approve
            }
            AutoApprovalPolicy::MaxOperations(max) => ApprovalDecision::Reject {
                reason: format!(
                    "plan has {} operations, policy allows at most {max}",
                    request.operations
                ),
            },
        };
        if let ApprovalDecision::Reject { reason } = &decision {
            warn!("Policy rejected {} for run {}: {reason}", request.environment, request.run_id);
        }
        GateResponse::Decided(decision)
    }
}

/// Consumer of converged cluster state, e.g. a GitOps agent.
///
/// The engine only reports that the substrate is ready; it never deploys
/// application workloads itself.
#[async_trait]
pub trait DeliveryAgent: Send + Sync + std::fmt::Debug {
    /// Called after an environment converged to `version`.
    async fn substrate_ready(&self, environment: &str, version: &str);
}

/// A delivery agent that only logs the hand-off.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingDeliveryAgent;

#[async_trait]
impl DeliveryAgent for LoggingDeliveryAgent {
    async fn substrate_ready(&self, environment: &str, version: &str) {
        info!("Cluster substrate in {environment} is ready at version {version}");
    }
}
