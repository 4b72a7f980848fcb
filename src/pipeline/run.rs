//! Pipeline runs and their state machine.
//!
//! A run promotes one desired-state version through the environments in
//! order. Its state only changes through [`PipelineRun::apply_event`], which
//! is pure: it never performs I/O and rejects events that are not valid in
//! the current state.
//!
//! ```text
//! Pending --Begin--> Planning --PlanComputed--> AwaitingApproval --Approved--> Applying
//!                       |  ^          \______________________________________/   |
//!                       |  |                 (no approval required)              |
//!                       |  +------------- ApplyFinished (success, more envs) ----+
//!                       v                                                        v
//!                     Failed <---------- ApplyFinished (failure) ----------  Completed
//! AwaitingApproval --Rejected--> Rejected        any non-terminal --Cancel--> Cancelled
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::config::ConfigHasher;
use crate::error::{ConvergeError, PipelineError, exit_codes};
use crate::graph::ResourceNode;
use crate::planner::{ExecutionReport, Plan};

/// The desired resources of every environment at one version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredState {
    /// Version identifier, derived from the resource hashes.
    pub version: String,
    /// Desired resources per environment.
    pub environments: BTreeMap<String, Vec<ResourceNode>>,
}

impl DesiredState {
    /// Creates a desired state and derives its version.
    #[must_use]
    pub fn new(environments: BTreeMap<String, Vec<ResourceNode>>) -> Self {
        let hasher = ConfigHasher::new();
        let mut entries: Vec<(String, String)> = Vec::new();
        for (env, nodes) in &environments {
            for node in nodes {
                let mut deps = node.depends_on.clone();
                deps.sort();
                entries.push((
                    format!("{env}/{}/{}/{}", node.kind, node.id, deps.join(",")),
                    node.config_hash(),
                ));
            }
        }
        entries.sort();
        let full = hasher.hash_entries(entries.iter().map(|(a, b)| (a.as_str(), b.as_str())));
        Self {
            version: hasher.short_hash(&full),
            environments,
        }
    }

    /// Creates a desired state that declares the same resources everywhere.
    #[must_use]
    pub fn uniform(environments: &[&str], nodes: &[ResourceNode]) -> Self {
        Self::new(
            environments
                .iter()
                .map(|env| ((*env).to_string(), nodes.to_vec()))
                .collect(),
        )
    }

    /// Returns the desired resources of an environment.
    #[must_use]
    pub fn nodes_for(&self, environment: &str) -> Option<&[ResourceNode]> {
        self.environments.get(environment).map(Vec::as_slice)
    }
}

/// State of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunState {
    /// Created, not started.
    Pending,
    /// Computing the plan for the current environment.
    Planning,
    /// Waiting for an approval decision for the current environment.
    AwaitingApproval,
    /// Applying the plan of the current environment.
    Applying,
    /// Every environment converged.
    Completed,
    /// An approval was refused.
    Rejected,
    /// Planning or applying failed.
    Failed,
    /// The run was cancelled.
    Cancelled,
}

impl RunState {
    /// Returns true for states a run never leaves.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Rejected | Self::Failed | Self::Cancelled
        )
    }
}

/// Events that drive a run.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// Start the run.
    Begin,
    /// The plan for the current environment is ready.
    PlanComputed {
        /// The plan.
        plan: Plan,
        /// Whether the environment needs approval first.
        requires_approval: bool,
    },
    /// The plan for the current environment could not be computed.
    PlanFailed {
        /// Why.
        reason: String,
    },
    /// The current environment was approved.
    Approved,
    /// The current environment was rejected.
    Rejected {
        /// Why.
        reason: String,
    },
    /// The plan of the current environment finished.
    ApplyFinished {
        /// Execution report.
        report: ExecutionReport,
    },
    /// Stop the run.
    Cancel {
        /// Why.
        reason: String,
    },
}

/// Outcome of one environment within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageOutcome {
    /// Planning.
    Planning,
    /// Waiting for approval.
    AwaitingApproval,
    /// Applying.
    Applying,
    /// Converged.
    Converged,
    /// Approval refused.
    Rejected,
    /// Planning or applying failed.
    Failed,
    /// Cancelled.
    Cancelled,
}

/// Record of one environment within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    /// Environment identifier.
    pub environment: String,
    /// Plan, once computed.
    #[serde(default)]
    pub plan: Option<Plan>,
    /// Execution report, once applied.
    #[serde(default)]
    pub report: Option<ExecutionReport>,
    /// Current outcome.
    pub outcome: StageOutcome,
    /// When approval was requested, if it was.
    #[serde(default)]
    pub approval_requested_at: Option<DateTime<Utc>>,
    /// When the stage started.
    pub started_at: DateTime<Utc>,
    /// When the stage finished.
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Where and why a run stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureChain {
    /// Environment being processed.
    pub environment: String,
    /// Failing operation, e.g. `create(network)`.
    #[serde(default)]
    pub operation: Option<String>,
    /// Reason.
    pub reason: String,
}

/// One promotion attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Unique run identifier.
    pub id: Uuid,
    /// Version being promoted.
    pub version: String,
    /// Desired state snapshot.
    pub desired: DesiredState,
    /// Environments to visit, in order.
    pub environments: Vec<String>,
    /// Index of the current environment.
    pub position: usize,
    /// Current state.
    pub state: RunState,
    /// Per-environment records, in visiting order.
    #[serde(default)]
    pub stages: Vec<StageRecord>,
    /// Set when the run failed, was rejected or was cancelled.
    #[serde(default)]
    pub failure: Option<FailureChain>,
    /// When the run was created.
    pub created_at: DateTime<Utc>,
    /// When the run last changed.
    pub updated_at: DateTime<Utc>,
}

impl PipelineRun {
    /// Creates a pending run.
    #[must_use]
    pub fn new(desired: DesiredState, environments: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            version: desired.version.clone(),
            desired,
            environments,
            position: 0,
            state: RunState::Pending,
            stages: Vec::new(),
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns the environment currently being processed.
    #[must_use]
    pub fn current_environment(&self) -> Option<&str> {
        self.environments.get(self.position).map(String::as_str)
    }

    /// Returns the record of the current environment.
    #[must_use]
    pub fn current_stage(&self) -> Option<&StageRecord> {
        self.stages.last()
    }

    /// Returns the process exit code for where the run stands.
    ///
    /// Runs still in progress or waiting for approval exit with 0. A failed
    /// apply maps its first operation error through the error taxonomy; a
    /// failed plan maps to the pipeline code.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self.state {
            RunState::Rejected => exit_codes::APPROVAL_REJECTED,
            RunState::Cancelled => exit_codes::CANCELLED,
            RunState::Failed => self
                .current_stage()
                .and_then(|s| s.report.as_ref())
                .and_then(ExecutionReport::to_error)
                .map_or(exit_codes::PIPELINE, |e| ConvergeError::from(e).exit_code()),
            _ => 0,
        }
    }

    /// Returns the record of the current environment, mutably.
    pub fn current_stage_mut(&mut self) -> Option<&mut StageRecord> {
        self.stages.last_mut()
    }

    /// Applies an event and returns the new state.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::InvalidTransition` if the event is not valid in
    /// the current state; the run is left unchanged.
    pub fn apply_event(&mut self, event: PipelineEvent) -> Result<RunState, PipelineError> {
        let next = match (self.state, event) {
            (RunState::Pending, PipelineEvent::Begin) => {
                if self.environments.is_empty() {
                    RunState::Completed
                } else {
                    self.open_stage();
                    RunState::Planning
                }
            }
            (
                RunState::Planning,
                PipelineEvent::PlanComputed {
                    plan,
                    requires_approval,
                },
            ) => {
                let outcome = if requires_approval {
                    StageOutcome::AwaitingApproval
                } else {
                    StageOutcome::Applying
                };
                if let Some(stage) = self.current_stage_mut() {
                    stage.plan = Some(plan);
                    stage.outcome = outcome;
                }
                if requires_approval {
                    RunState::AwaitingApproval
                } else {
                    RunState::Applying
                }
            }
            (RunState::Planning, PipelineEvent::PlanFailed { reason }) => {
                self.close_stage(StageOutcome::Failed);
                self.fail(None, reason);
                RunState::Failed
            }
            (RunState::AwaitingApproval, PipelineEvent::Approved) => {
                if let Some(stage) = self.current_stage_mut() {
                    stage.outcome = StageOutcome::Applying;
                }
                RunState::Applying
            }
            (RunState::AwaitingApproval, PipelineEvent::Rejected { reason }) => {
                self.close_stage(StageOutcome::Rejected);
                self.fail(None, format!("approval rejected: {reason}"));
                RunState::Rejected
            }
            (RunState::Applying, PipelineEvent::ApplyFinished { report }) => {
                let success = report.success();
                let failing = report
                    .failures()
                    .first()
                    .map(|r| format!("{}({})", r.action, r.target));
                let reason = report.to_error().map(|e| e.to_string());
                if let Some(stage) = self.current_stage_mut() {
                    stage.report = Some(report);
                }

                if success {
                    self.close_stage(StageOutcome::Converged);
                    self.position += 1;
                    if self.position < self.environments.len() {
                        self.open_stage();
                        RunState::Planning
                    } else {
                        RunState::Completed
                    }
                } else {
                    self.close_stage(StageOutcome::Failed);
                    self.fail(
                        failing,
                        reason.unwrap_or_else(|| String::from("plan did not converge")),
                    );
                    RunState::Failed
                }
            }
            (state, PipelineEvent::Cancel { reason }) if !state.is_terminal() => {
                self.close_stage(StageOutcome::Cancelled);
                self.fail(None, format!("cancelled: {reason}"));
                RunState::Cancelled
            }
            (state, event) => {
                return Err(PipelineError::InvalidTransition {
                    state: state.to_string(),
                    event: event.name().to_string(),
                });
            }
        };

        self.state = next;
        self.updated_at = Utc::now();
        Ok(next)
    }

    fn open_stage(&mut self) {
        if let Some(env) = self.environments.get(self.position) {
            self.stages.push(StageRecord {
                environment: env.clone(),
                plan: None,
                report: None,
                outcome: StageOutcome::Planning,
                approval_requested_at: None,
                started_at: Utc::now(),
                finished_at: None,
            });
        }
    }

    fn close_stage(&mut self, outcome: StageOutcome) {
        if let Some(stage) = self.stages.last_mut()
            && stage.finished_at.is_none()
        {
            stage.outcome = outcome;
            stage.finished_at = Some(Utc::now());
        }
    }

    fn fail(&mut self, operation: Option<String>, reason: String) {
        self.failure = Some(FailureChain {
            environment: self.current_environment().unwrap_or_default().to_string(),
            operation,
            reason,
        });
    }
}

impl PipelineEvent {
    /// Returns a short name for logs and errors.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Begin => "begin",
            Self::PlanComputed { .. } => "plan-computed",
            Self::PlanFailed { .. } => "plan-failed",
            Self::Approved => "approved",
            Self::Rejected { .. } => "rejected",
            Self::ApplyFinished { .. } => "apply-finished",
            Self::Cancel { .. } => "cancel",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Planning => "planning",
            Self::AwaitingApproval => "awaiting-approval",
            Self::Applying => "applying",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Planning => "planning",
            Self::AwaitingApproval => "awaiting-approval",
            Self::Applying => "applying",
            Self::Converged => "converged",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for FailureChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.environment)?;
        if let Some(op) = &self.operation {
            write!(f, " -> {op}")?;
        }
        write!(f, " -> {}", self.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ResourceKind;
    use crate::planner::{ExecutionReport, OperationResult, OperationStatus, Action};
    use crate::error::ConvergenceError;

    fn desired() -> DesiredState {
        DesiredState::uniform(
            &["dev", "prod"],
            &[ResourceNode::new(ResourceKind::Network, "network")],
        )
    }

    fn report(status: OperationStatus) -> ExecutionReport {
        let error = (status == OperationStatus::Failed).then(|| ConvergenceError::Unrecoverable {
            resource: "network".into(),
            action: "create".into(),
            reason: "invalid cidr".into(),
        });
        let now = Utc::now();
        ExecutionReport {
            plan_id: Uuid::new_v4(),
            environment: "dev".into(),
            version: "v".into(),
            results: vec![OperationResult {
                index: 0,
                target: "network".into(),
                kind: ResourceKind::Network,
                action: Action::Create,
                status,
                attempts: 1,
                error,
                blocked_by: None,
                duration_ms: 1,
            }],
            applied: usize::from(status == OperationStatus::Applied),
            no_op: 0,
            failed: usize::from(status == OperationStatus::Failed),
            skipped: 0,
            cancelled: 0,
            dispatched: 1,
            started_at: now,
            finished_at: now,
        }
    }

    fn computed(requires_approval: bool) -> PipelineEvent {
        PipelineEvent::PlanComputed {
            plan: Plan::new("dev", "v", vec![]),
            requires_approval,
        }
    }

    #[test]
    fn test_version_is_stable_and_content_addressed() {
        assert_eq!(desired().version, desired().version);
        let other = DesiredState::uniform(
            &["dev", "prod"],
            &[ResourceNode::new(ResourceKind::Network, "network-2")],
        );
        assert_ne!(desired().version, other.version);
        assert_eq!(desired().version.len(), 8);
    }

    #[test]
    fn test_happy_path() {
        let mut run = PipelineRun::new(desired(), vec!["dev".into(), "prod".into()]);

        assert_eq!(run.apply_event(PipelineEvent::Begin), Ok(RunState::Planning));
        assert_eq!(run.apply_event(computed(false)), Ok(RunState::Applying));
        assert_eq!(
            run.apply_event(PipelineEvent::ApplyFinished { report: report(OperationStatus::Applied) }),
            Ok(RunState::Planning)
        );
        assert_eq!(run.current_environment(), Some("prod"));
        assert_eq!(run.apply_event(computed(true)), Ok(RunState::AwaitingApproval));
        assert_eq!(run.apply_event(PipelineEvent::Approved), Ok(RunState::Applying));
        assert_eq!(
            run.apply_event(PipelineEvent::ApplyFinished { report: report(OperationStatus::Applied) }),
            Ok(RunState::Completed)
        );
        assert!(run.stages.iter().all(|s| s.outcome == StageOutcome::Converged));
    }

    #[test]
    fn test_empty_run_completes() {
        let mut run = PipelineRun::new(desired(), vec![]);
        assert_eq!(run.apply_event(PipelineEvent::Begin), Ok(RunState::Completed));
    }

    #[test]
    fn test_rejection_is_terminal() {
        let mut run = PipelineRun::new(desired(), vec!["prod".into()]);
        run.apply_event(PipelineEvent::Begin).unwrap();
        run.apply_event(computed(true)).unwrap();

        let state = run
            .apply_event(PipelineEvent::Rejected { reason: "change freeze".into() })
            .unwrap();
        assert_eq!(state, RunState::Rejected);
        assert!(run.apply_event(PipelineEvent::Approved).is_err());
        assert!(run.apply_event(PipelineEvent::Cancel { reason: "x".into() }).is_err());
        assert_eq!(run.stages[0].outcome, StageOutcome::Rejected);
    }

    #[test]
    fn test_failed_apply_does_not_advance() {
        let mut run = PipelineRun::new(desired(), vec!["dev".into(), "prod".into()]);
        run.apply_event(PipelineEvent::Begin).unwrap();
        run.apply_event(computed(false)).unwrap();

        let state = run
            .apply_event(PipelineEvent::ApplyFinished { report: report(OperationStatus::Failed) })
            .unwrap();

        assert_eq!(state, RunState::Failed);
        assert_eq!(run.position, 0);
        assert_eq!(run.stages.len(), 1);
        let chain = run.failure.as_ref().unwrap();
        assert_eq!(chain.environment, "dev");
        assert_eq!(chain.operation.as_deref(), Some("create(network)"));
        assert!(chain.to_string().contains("network"));
    }

    #[test]
    fn test_exit_codes() {
        let mut run = PipelineRun::new(desired(), vec!["dev".into(), "prod".into()]);
        run.apply_event(PipelineEvent::Begin).unwrap();
        run.apply_event(computed(true)).unwrap();
        assert_eq!(run.exit_code(), 0);
        run.apply_event(PipelineEvent::Rejected { reason: "freeze".into() }).unwrap();
        assert_eq!(run.exit_code(), exit_codes::APPROVAL_REJECTED);

        let mut run = PipelineRun::new(desired(), vec!["dev".into()]);
        run.apply_event(PipelineEvent::Begin).unwrap();
        run.apply_event(computed(false)).unwrap();
        run.apply_event(PipelineEvent::ApplyFinished { report: report(OperationStatus::Failed) })
            .unwrap();
        assert_eq!(run.exit_code(), exit_codes::UNRECOVERABLE_PROVISIONING);

        let mut run = PipelineRun::new(desired(), vec!["dev".into()]);
        run.apply_event(PipelineEvent::Begin).unwrap();
        run.apply_event(PipelineEvent::PlanFailed { reason: "cycle".into() }).unwrap();
        assert_eq!(run.exit_code(), exit_codes::PIPELINE);

        let mut run = PipelineRun::new(desired(), vec!["dev".into()]);
        run.apply_event(PipelineEvent::Cancel { reason: "operator".into() }).unwrap();
        assert_eq!(run.exit_code(), exit_codes::CANCELLED);
    }

    #[test]
    fn test_invalid_transitions() {
        let mut run = PipelineRun::new(desired(), vec!["dev".into()]);
        let err = run.apply_event(PipelineEvent::Approved).unwrap_err();
        assert_eq!(
            err,
            PipelineError::InvalidTransition {
                state: "pending".into(),
                event: "approved".into()
            }
        );
        assert_eq!(run.state, RunState::Pending);

        run.apply_event(PipelineEvent::Begin).unwrap();
        assert!(run.apply_event(PipelineEvent::Begin).is_err());
        assert!(run.apply_event(PipelineEvent::Approved).is_err());
    }

    #[test]
    fn test_cancel_from_any_open_state() {
        let mut run = PipelineRun::new(desired(), vec!["dev".into()]);
        assert_eq!(
            run.apply_event(PipelineEvent::Cancel { reason: "operator".into() }),
            Ok(RunState::Cancelled)
        );

        let mut run = PipelineRun::new(desired(), vec!["dev".into()]);
        run.apply_event(PipelineEvent::Begin).unwrap();
        run.apply_event(computed(true)).unwrap();
        assert_eq!(
            run.apply_event(PipelineEvent::Cancel { reason: "operator".into() }),
            Ok(RunState::Cancelled)
        );
        assert_eq!(run.stages[0].outcome, StageOutcome::Cancelled);
    }

    #[test]
    fn test_run_serializes() {
        let mut run = PipelineRun::new(desired(), vec!["dev".into()]);
        run.apply_event(PipelineEvent::Begin).unwrap();
        let json = serde_json::to_string(&run).unwrap();
        let back: PipelineRun = serde_json::from_str(&json).unwrap();
        assert_eq!(back.state, RunState::Planning);
        assert_eq!(back.desired, run.desired);
    }
}
