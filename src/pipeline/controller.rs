//! Promotion controller.
//!
//! Drives pipeline runs through the environments in registry order. The
//! controller never waits for a human: when a run needs approval it submits
//! the request to the [`ApprovalGate`] and returns, and the decision comes
//! back later through [`PromotionController::decide`].

use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::planner::{ConvergenceExecutor, DiffEngine, Plan};
use crate::registry::{ConvergenceStatus, EnvironmentRegistry};

use super::cancel::CancellationFlag;
use super::gate::{ApprovalDecision, ApprovalGate, ApprovalRequest, DeliveryAgent, GateResponse};
use super::run::{DesiredState, PipelineEvent, PipelineRun, RunState};

/// How long a ledger entry survives while its resource is not yet visible.
const DEFAULT_VISIBILITY_GRACE_SECS: i64 = 300;

/// Orchestrates promotion runs.
pub struct PromotionController {
    registry: Arc<EnvironmentRegistry>,
    executor: ConvergenceExecutor,
    gate: Arc<dyn ApprovalGate>,
    delivery: Option<Arc<dyn DeliveryAgent>>,
    diff: DiffEngine,
    runs: RwLock<BTreeMap<Uuid, Arc<Mutex<PipelineRun>>>>,
    flags: RwLock<HashMap<Uuid, Arc<CancellationFlag>>>,
    visibility_grace: chrono::Duration,
}

impl std::fmt::Debug for PromotionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromotionController")
            .field("registry", &self.registry)
            .field("gate", &self.gate)
            .field("runs", &self.runs.read().len())
            .finish_non_exhaustive()
    }
}

impl PromotionController {
    /// Creates a controller.
    #[must_use]
    pub fn new(
        registry: Arc<EnvironmentRegistry>,
        executor: ConvergenceExecutor,
        gate: Arc<dyn ApprovalGate>,
    ) -> Self {
        Self {
            registry,
            executor,
            gate,
            delivery: None,
            diff: DiffEngine::new(),
            runs: RwLock::new(BTreeMap::new()),
            flags: RwLock::new(HashMap::new()),
            visibility_grace: chrono::Duration::seconds(DEFAULT_VISIBILITY_GRACE_SECS),
        }
    }

    /// Notifies `agent` whenever an environment converges.
    #[must_use]
    pub fn with_delivery_agent(mut self, agent: Arc<dyn DeliveryAgent>) -> Self {
        self.delivery = Some(agent);
        self
    }

    /// Sets how long applied operations are trusted while their resource is
    /// not yet visible in the observed state.
    #[must_use]
    pub const fn with_visibility_grace(mut self, grace: chrono::Duration) -> Self {
        self.visibility_grace = grace;
        self
    }

    /// Returns the registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<EnvironmentRegistry> {
        &self.registry
    }

    /// Creates a pending run that promotes `desired` through every registered
    /// environment.
    pub fn start(&self, desired: DesiredState) -> Uuid {
        let run = PipelineRun::new(desired, self.registry.ids());
        let id = run.id;
        info!(
            "Created run {id} for version {} across [{}]",
            run.version,
            run.environments.join(", ")
        );
        self.insert(run);
        id
    }

    /// Creates a run and advances it as far as it can go.
    ///
    /// # Errors
    ///
    /// Returns an error if the run cannot be advanced.
    pub async fn promote(&self, desired: DesiredState) -> Result<(Uuid, RunState)> {
        let id = self.start(desired);
        let state = self.advance(id).await?;
        Ok((id, state))
    }

    /// Re-registers a persisted run.
    pub fn restore(&self, run: PipelineRun) {
        self.insert(run);
    }

    fn insert(&self, run: PipelineRun) {
        let id = run.id;
        self.flags
            .write()
            .entry(id)
            .or_insert_with(|| Arc::new(CancellationFlag::new()));
        self.runs.write().insert(id, Arc::new(Mutex::new(run)));
    }

    fn handle(&self, id: Uuid) -> Result<(Arc<Mutex<PipelineRun>>, Arc<CancellationFlag>)> {
        let run = self
            .runs
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| PipelineError::RunNotFound { id: id.to_string() })?;
        let flag = self
            .flags
            .write()
            .entry(id)
            .or_insert_with(|| Arc::new(CancellationFlag::new()))
            .clone();
        Ok((run, flag))
    }

    /// Returns the cancellation flag of a run.
    ///
    /// Cancelling the flag stops a run at its next step the same way
    /// [`Self::cancel`] does, without waiting for the run to be released.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::RunNotFound` if the run is unknown.
    pub fn cancellation_flag(&self, id: Uuid) -> Result<Arc<CancellationFlag>> {
        Ok(self.handle(id)?.1)
    }

    /// Returns a copy of a run.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::RunNotFound` if the run is unknown.
    pub async fn run(&self, id: Uuid) -> Result<PipelineRun> {
        let (run, _) = self.handle(id)?;
        let run = run.lock().await;
        Ok(run.clone())
    }

    /// Returns copies of every run, oldest first.
    pub async fn runs(&self) -> Vec<PipelineRun> {
        let handles: Vec<_> = self.runs.read().values().cloned().collect();
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            out.push(handle.lock().await.clone());
        }
        out.sort_by_key(|r| r.created_at);
        out
    }

    /// Drives a run until it terminates or waits for an approval decision.
    ///
    /// # Errors
    ///
    /// Returns an error if the run is unknown, an event is refused by the
    /// state machine, or the registry rejects an update.
    pub async fn advance(&self, id: Uuid) -> Result<RunState> {
        let (handle, flag) = self.handle(id)?;
        let mut run = handle.lock().await;
        self.drive(&mut run, &flag).await
    }

    async fn drive(&self, run: &mut PipelineRun, flag: &CancellationFlag) -> Result<RunState> {
        loop {
            if run.state.is_terminal() {
                return Ok(run.state);
            }
            if flag.is_cancelled() {
                let reason = flag.reason().unwrap_or_else(|| String::from("cancelled"));
                warn!("Run {} cancelled: {reason}", run.id);
                return Ok(run.apply_event(PipelineEvent::Cancel { reason })?);
            }

            match run.state {
                RunState::Pending => {
                    run.apply_event(PipelineEvent::Begin)?;
                }
                RunState::Planning => {
                    let event = self.plan_stage(run).await;
                    run.apply_event(event)?;
                }
                RunState::AwaitingApproval => {
                    let already_requested = run
                        .current_stage()
                        .is_some_and(|s| s.approval_requested_at.is_some());
                    if already_requested {
                        return Ok(run.state);
                    }
                    match self.request_approval(run).await? {
                        GateResponse::Deferred => return Ok(run.state),
                        GateResponse::Decided(decision) => {
                            self.apply_decision(run, decision).await?;
                        }
                    }
                }
                RunState::Applying => self.apply_stage(run, flag).await?,
                RunState::Completed | RunState::Rejected | RunState::Failed | RunState::Cancelled => {
                    return Ok(run.state);
                }
            }
        }
    }

    async fn plan_stage(&self, run: &PipelineRun) -> PipelineEvent {
        let Some(env) = run.current_environment() else {
            return PipelineEvent::PlanFailed {
                reason: String::from("no current environment"),
            };
        };
        let Some(desired) = run.desired.nodes_for(env) else {
            return PipelineEvent::PlanFailed {
                reason: format!("no desired state declared for environment {env}"),
            };
        };

        let requires_approval = match self.registry.environment(env).await {
            Ok(environment) => environment.requires_approval,
            Err(e) => return PipelineEvent::PlanFailed { reason: e.to_string() },
        };
        let observed = match self.registry.get_observed_state(env).await {
            Ok(nodes) => nodes,
            Err(e) => {
                return PipelineEvent::PlanFailed {
                    reason: format!("failed to observe {env}: {e}"),
                };
            }
        };
        let diff = match self.diff.compute_diff(desired, &observed) {
            Ok(diff) => diff,
            Err(e) => return PipelineEvent::PlanFailed { reason: e.to_string() },
        };

        let plan = Plan::from_diff(env, &run.version, &diff);
        info!(
            "Planned {} operations for {env} in run {} ({} unchanged)",
            plan.len(),
            run.id,
            diff.unchanged
        );
        PipelineEvent::PlanComputed {
            plan,
            requires_approval,
        }
    }

    async fn request_approval(&self, run: &mut PipelineRun) -> Result<GateResponse> {
        let Some(env) = run.current_environment().map(str::to_string) else {
            return Ok(GateResponse::Deferred);
        };
        self.registry.request_approval(&env).await?;

        let (operations, summary) = run
            .current_stage()
            .and_then(|s| s.plan.as_ref())
            .map_or((0, String::new()), |p| (p.len(), p.to_string()));
        let request = ApprovalRequest {
            run_id: run.id,
            environment: env,
            version: run.version.clone(),
            operations,
            summary,
        };
        if let Some(stage) = run.current_stage_mut() {
            stage.approval_requested_at = Some(Utc::now());
        }
        Ok(self.gate.submit(&request).await)
    }

    async fn apply_decision(&self, run: &mut PipelineRun, decision: ApprovalDecision) -> Result<()> {
        let env = run.current_environment().unwrap_or_default().to_string();
        match decision {
            ApprovalDecision::Approve => {
                self.registry.approve(&env).await?;
                run.apply_event(PipelineEvent::Approved)?;
            }
            ApprovalDecision::Reject { reason } => {
                self.registry.reject(&env).await?;
                warn!("Promotion of run {} into {env} rejected: {reason}", run.id);
                run.apply_event(PipelineEvent::Rejected { reason })?;
            }
        }
        self.gate.resolved(run.id, &env);
        Ok(())
    }

    async fn apply_stage(&self, run: &mut PipelineRun, flag: &CancellationFlag) -> Result<()> {
        let env = run.current_environment().unwrap_or_default().to_string();
        let version = run.version.clone();
        let mut plan = run
            .current_stage()
            .and_then(|s| s.plan.clone())
            .unwrap_or_else(|| Plan::new(&env, &version, Vec::new()));

        let report = {
            let mut record = self.registry.lock(&env).await?;
            let observed = self
                .registry
                .cached_observed_state(&env)
                .map(|s| s.nodes)
                .unwrap_or_default();
            record.ledger.forget_drifted(&observed, self.visibility_grace);

            let report = self
                .executor
                .apply_with_cancellation(&mut plan, &mut record.ledger, flag)
                .await;

            if report.success() {
                EnvironmentRegistry::set_applied_version(&mut record.environment, &version);
            } else {
                record.environment.convergence = ConvergenceStatus::Failed;
                record.environment.updated_at = Utc::now();
            }
            report
        };

        if let Some(stage) = run.current_stage_mut() {
            stage.plan = Some(plan);
        }

        if report.success() {
            if let Some(agent) = &self.delivery {
                agent.substrate_ready(&env, &version).await;
            }
        } else {
            error!("Run {} failed in {env}: {report}", run.id);
        }

        if report.cancelled > 0 && report.failed == 0 && flag.is_cancelled() {
            let reason = flag.reason().unwrap_or_else(|| String::from("cancelled"));
            if let Some(stage) = run.current_stage_mut() {
                stage.report = Some(report);
            }
            run.apply_event(PipelineEvent::Cancel { reason })?;
        } else {
            run.apply_event(PipelineEvent::ApplyFinished { report })?;
        }
        Ok(())
    }

    /// Delivers an approval decision for the environment a run waits on, then
    /// advances the run.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::EnvironmentMismatch` if the run waits on another
    /// environment, `PipelineError::InvalidTransition` if it is not waiting for
    /// approval, or a registry error if the approval is not allowed.
    pub async fn decide(
        &self,
        id: Uuid,
        environment: &str,
        decision: ApprovalDecision,
    ) -> Result<RunState> {
        let (handle, flag) = self.handle(id)?;
        let mut run = handle.lock().await;

        if run.state != RunState::AwaitingApproval {
            let event = match &decision {
                ApprovalDecision::Approve => "approved",
                ApprovalDecision::Reject { .. } => "rejected",
            };
            return Err(PipelineError::InvalidTransition {
                state: run.state.to_string(),
                event: event.to_string(),
            }
            .into());
        }
        let expected = run.current_environment().unwrap_or_default();
        if expected != environment {
            return Err(PipelineError::EnvironmentMismatch {
                expected: expected.to_string(),
                received: environment.to_string(),
            }
            .into());
        }

        self.apply_decision(&mut run, decision).await?;
        self.drive(&mut run, &flag).await
    }

    /// Requests cancellation of a run.
    ///
    /// Operations already in flight finish; nothing new starts.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::RunNotFound` if the run is unknown.
    pub async fn cancel(&self, id: Uuid, reason: &str) -> Result<RunState> {
        let (handle, flag) = self.handle(id)?;
        flag.cancel(reason);

        let mut run = handle.lock().await;
        if !run.state.is_terminal() {
            info!("Cancelling run {id}: {reason}");
            run.apply_event(PipelineEvent::Cancel {
                reason: reason.to_string(),
            })?;
        }
        Ok(run.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConvergeError, ProvisionError};
    use crate::graph::{ResourceConfig, ResourceKind, ResourceNode};
    use crate::pipeline::{AutoApprovalGate, AutoApprovalPolicy, ManualApprovalGate, StageOutcome};
    use crate::planner::{ExecutorConfig, RetryPolicy};
    use crate::provider::{InMemoryProvisioner, ProvisioningApi};
    use crate::registry::Environment;
    use std::time::Duration;

    struct Fixture {
        provider: Arc<InMemoryProvisioner>,
        controller: PromotionController,
    }

    fn fixture(gate: Arc<dyn ApprovalGate>) -> Fixture {
        fixture_with(InMemoryProvisioner::new(), 4, gate)
    }

    fn fixture_with(
        provider: InMemoryProvisioner,
        max_parallel: usize,
        gate: Arc<dyn ApprovalGate>,
    ) -> Fixture {
        let provider = Arc::new(provider);
        let api: Arc<dyn ProvisioningApi> = provider.clone();
        let registry = EnvironmentRegistry::new(Arc::clone(&api)).with_observe_retry(
            RetryPolicy::new()
                .with_max_attempts(3)
                .with_base_delay(Duration::from_millis(1))
                .with_max_delay(Duration::from_millis(5))
                .with_jitter(false),
        );
        registry.register(Environment::new("dev", "eu-west-1", "111", 0)).unwrap();
        registry.register(Environment::new("pre-prod", "eu-west-1", "222", 1)).unwrap();
        registry
            .register(Environment::new("prod", "eu-central-1", "333", 2).with_approval_required(true))
            .unwrap();

        let executor = ConvergenceExecutor::new(api).with_config(ExecutorConfig {
            max_parallel,
            retry: RetryPolicy::no_retry(),
            operation_timeout: Duration::from_secs(5),
        });
        Fixture {
            provider,
            controller: PromotionController::new(Arc::new(registry), executor, gate),
        }
    }

    fn desired() -> DesiredState {
        DesiredState::uniform(
            &["dev", "pre-prod", "prod"],
            &[
                ResourceNode::new(ResourceKind::Network, "network")
                    .with_config(ResourceConfig::new().with("cidr", "10.0.0.0/16")),
                ResourceNode::new(ResourceKind::Cluster, "eks")
                    .with_config(ResourceConfig::new().with("version", "1.29"))
                    .with_dependency("network"),
            ],
        )
    }

    #[tokio::test]
    async fn test_auto_approved_promotion_completes() {
        let f = fixture(Arc::new(AutoApprovalGate::approve_all()));
        let desired = desired();
        let version = desired.version.clone();

        let (id, state) = f.controller.promote(desired).await.unwrap();

        assert_eq!(state, RunState::Completed);
        assert_eq!(f.provider.dispatch_count(), 6);
        for env in ["dev", "pre-prod", "prod"] {
            let environment = f.controller.registry().environment(env).await.unwrap();
            assert_eq!(environment.applied_version.as_deref(), Some(version.as_str()));
            assert_eq!(f.provider.resources(env).len(), 2);
        }
        let run = f.controller.run(id).await.unwrap();
        assert_eq!(run.stages.len(), 3);
        assert!(run.stages.iter().all(|s| s.outcome == StageOutcome::Converged));
    }

    #[tokio::test]
    async fn test_rejection_dispatches_nothing_to_later_environments() {
        let gate = Arc::new(ManualApprovalGate::new());
        let f = fixture(gate.clone());

        let (id, state) = f.controller.promote(desired()).await.unwrap();
        assert_eq!(state, RunState::AwaitingApproval);
        assert_eq!(gate.pending().len(), 1);
        assert_eq!(f.provider.dispatch_count_for("prod"), 0);

        let state = f
            .controller
            .decide(id, "prod", ApprovalDecision::Reject { reason: "change freeze".into() })
            .await
            .unwrap();

        assert_eq!(state, RunState::Rejected);
        assert_eq!(f.provider.dispatch_count_for("prod"), 0);
        assert!(gate.pending().is_empty());
        let run = f.controller.run(id).await.unwrap();
        assert_eq!(run.failure.unwrap().environment, "prod");
    }

    #[tokio::test]
    async fn test_manual_approval_resumes_run() {
        let f = fixture(Arc::new(ManualApprovalGate::new()));
        let (id, _) = f.controller.promote(desired()).await.unwrap();

        assert_eq!(
            f.controller.advance(id).await.unwrap(),
            RunState::AwaitingApproval
        );
        let state = f
            .controller
            .decide(id, "prod", ApprovalDecision::Approve)
            .await
            .unwrap();

        assert_eq!(state, RunState::Completed);
        assert_eq!(f.provider.dispatch_count_for("prod"), 2);
    }

    #[tokio::test]
    async fn test_decision_for_wrong_environment() {
        let f = fixture(Arc::new(ManualApprovalGate::new()));
        let (id, _) = f.controller.promote(desired()).await.unwrap();

        let err = f
            .controller
            .decide(id, "dev", ApprovalDecision::Approve)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConvergeError::Pipeline(PipelineError::EnvironmentMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_policy_rejection() {
        let f = fixture(Arc::new(AutoApprovalGate::new(AutoApprovalPolicy::RejectAll(
            "prod is frozen".into(),
        ))));
        let (_, state) = f.controller.promote(desired()).await.unwrap();
        assert_eq!(state, RunState::Rejected);
        assert_eq!(f.provider.dispatch_count_for("prod"), 0);
    }

    #[tokio::test]
    async fn test_failure_stops_promotion() {
        let f = fixture(Arc::new(AutoApprovalGate::approve_all()));
        f.provider
            .fail_always("network", ProvisionError::invalid("network", "cidr overlaps"));

        let (id, state) = f.controller.promote(desired()).await.unwrap();

        assert_eq!(state, RunState::Failed);
        assert_eq!(f.provider.dispatch_count_for("pre-prod"), 0);
        let run = f.controller.run(id).await.unwrap();
        let chain = run.failure.unwrap();
        assert_eq!(chain.environment, "dev");
        assert_eq!(chain.operation.as_deref(), Some("create(network)"));
        let dev = f.controller.registry().environment("dev").await.unwrap();
        assert_eq!(dev.convergence, ConvergenceStatus::Failed);
    }

    #[tokio::test]
    async fn test_second_promotion_is_idempotent() {
        let f = fixture(Arc::new(AutoApprovalGate::approve_all()));
        f.controller.promote(desired()).await.unwrap();
        let dispatched = f.provider.dispatch_count();

        let (_, state) = f.controller.promote(desired()).await.unwrap();

        assert_eq!(state, RunState::Completed);
        assert_eq!(f.provider.dispatch_count(), dispatched);
    }

    #[tokio::test]
    async fn test_cancel_waiting_run() {
        let f = fixture(Arc::new(ManualApprovalGate::new()));
        let (id, _) = f.controller.promote(desired()).await.unwrap();

        let state = f.controller.cancel(id, "operator request").await.unwrap();
        assert_eq!(state, RunState::Cancelled);
        assert!(f.controller.decide(id, "prod", ApprovalDecision::Approve).await.is_err());
        assert_eq!(f.provider.dispatch_count_for("prod"), 0);
    }

    #[tokio::test]
    async fn test_transient_observation_does_not_fail_run() {
        let f = fixture(Arc::new(AutoApprovalGate::approve_all()));
        f.provider
            .fail_observe_times("dev", 1, ProvisionError::RateLimited { retry_after_secs: 0 });
        f.provider.fail_observe_times(
            "prod",
            2,
            ProvisionError::Unavailable {
                status: 503,
                message: "control plane busy".into(),
            },
        );

        let (id, state) = f.controller.promote(desired()).await.unwrap();

        assert_eq!(state, RunState::Completed);
        assert_eq!(f.provider.dispatch_count(), 6);
        assert!(f.controller.run(id).await.unwrap().failure.is_none());
    }

    #[tokio::test]
    async fn test_persistent_observation_failure_fails_run() {
        let f = fixture(Arc::new(AutoApprovalGate::approve_all()));
        f.provider
            .fail_observe_always("dev", ProvisionError::network("connection reset"));

        let (id, state) = f.controller.promote(desired()).await.unwrap();

        assert_eq!(state, RunState::Failed);
        assert_eq!(f.provider.observation_count(), 3);
        assert_eq!(f.provider.dispatch_count(), 0);
        assert_eq!(f.controller.run(id).await.unwrap().failure.unwrap().environment, "dev");
    }

    #[tokio::test]
    async fn test_cancel_while_applying_finishes_in_flight_work() {
        let f = fixture_with(
            InMemoryProvisioner::new().with_latency(Duration::from_millis(100)),
            1,
            Arc::new(AutoApprovalGate::approve_all()),
        );
        let id = f.controller.start(desired());

        let (advanced, cancelled) = tokio::join!(f.controller.advance(id), async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            f.controller.cancel(id, "operator request").await
        });

        assert_eq!(advanced.unwrap(), RunState::Cancelled);
        assert_eq!(cancelled.unwrap(), RunState::Cancelled);
        // The network create was in flight and completes; the cluster never starts.
        assert_eq!(f.provider.dispatch_count(), 1);
        assert_eq!(f.provider.resources("dev").len(), 1);
        assert_eq!(f.provider.dispatch_count_for("pre-prod"), 0);
        assert_eq!(f.provider.dispatch_count_for("prod"), 0);

        let run = f.controller.run(id).await.unwrap();
        let report = run.stages[0].report.as_ref().unwrap();
        assert_eq!((report.applied, report.cancelled), (1, 1));
    }

    #[tokio::test]
    async fn test_cancellation_flag_stops_run() {
        let f = fixture(Arc::new(AutoApprovalGate::approve_all()));
        let id = f.controller.start(desired());
        f.controller.cancellation_flag(id).unwrap().cancel("interrupted");

        assert_eq!(f.controller.advance(id).await.unwrap(), RunState::Cancelled);
        assert_eq!(f.provider.dispatch_count(), 0);
        assert!(f.controller.cancellation_flag(Uuid::new_v4()).is_err());
    }

    #[tokio::test]
    async fn test_missing_environment_fails_planning() {
        let f = fixture(Arc::new(AutoApprovalGate::approve_all()));
        let desired = DesiredState::uniform(
            &["dev"],
            &[ResourceNode::new(ResourceKind::Network, "network")],
        );

        let (id, state) = f.controller.promote(desired).await.unwrap();

        assert_eq!(state, RunState::Failed);
        let run = f.controller.run(id).await.unwrap();
        assert_eq!(run.failure.unwrap().environment, "pre-prod");
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let f = fixture(Arc::new(AutoApprovalGate::approve_all()));
        assert!(f.controller.advance(Uuid::new_v4()).await.is_err());
        assert!(f.controller.runs().await.is_empty());
    }
}
