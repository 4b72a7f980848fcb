//! Add-on reconciler.
//!
//! Keeps cluster add-ons at their declared versions. Each cluster is
//! reconciled on its own periodic cycle, independently of pipeline runs. Within
//! a cycle every add-on is its own failure domain: a failed update is reported
//! and the cycle moves on to the next add-on.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{GraphError, Result};
use crate::graph::{ResourceGraph, ResourceKind, ResourceNode};
use crate::pipeline::CancellationFlag;
use crate::planner::{Action, ConvergenceExecutor, DiffEngine, DiffType, Operation, OperationStatus, Plan};
use crate::registry::EnvironmentRegistry;

/// Version label used for plans issued by the reconciler.
const RECONCILE_VERSION: &str = "addon-reconcile";

/// A cluster and the add-ons that run on it.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterTarget {
    /// Environment the cluster lives in.
    pub environment: String,
    /// Cluster node.
    pub cluster: ResourceNode,
    /// Desired add-ons, in identifier order.
    pub addons: Vec<ResourceNode>,
}

impl ClusterTarget {
    /// Groups the desired add-ons of an environment under the cluster they
    /// depend on, directly or through a node pool.
    ///
    /// Add-ons that depend on no cluster are ignored.
    ///
    /// # Errors
    ///
    /// Returns a graph error if the desired nodes are not a valid graph.
    pub fn discover(environment: &str, desired: &[ResourceNode]) -> std::result::Result<Vec<Self>, GraphError> {
        let graph = ResourceGraph::from_nodes(desired.iter().cloned())?;

        let mut targets: Vec<Self> = graph
            .nodes()
            .filter(|n| n.kind == ResourceKind::Cluster)
            .map(|cluster| Self {
                environment: environment.to_string(),
                cluster: cluster.clone(),
                addons: Vec::new(),
            })
            .collect();

        for addon in graph.nodes().filter(|n| n.kind == ResourceKind::Addon) {
            let ancestors = graph.transitive_dependencies(&addon.id);
            let mut placed = false;
            for target in &mut targets {
                if ancestors.contains(&target.cluster.id) {
                    target.addons.push(addon.clone());
                    placed = true;
                }
            }
            if !placed {
                warn!("Add-on {} in {environment} depends on no cluster, ignoring", addon.id);
            }
        }
        Ok(targets)
    }
}

/// What a cycle did with one add-on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum AddonOutcome {
    /// Running version matches.
    InSync,
    /// Updated to the desired version.
    Updated {
        /// Version that was running.
        from: Option<String>,
    },
    /// The add-on was missing and has been installed.
    Created,
    /// The update failed.
    Failed {
        /// Why.
        reason: String,
    },
    /// Not attempted.
    Skipped {
        /// Why.
        reason: String,
    },
}

/// Result for one add-on.
#[derive(Debug, Clone, Serialize)]
pub struct AddonResult {
    /// Add-on identifier.
    pub addon: String,
    /// Declared version.
    pub desired_version: Option<String>,
    /// Running version, if the add-on was observed.
    pub observed_version: Option<String>,
    /// Outcome.
    pub outcome: AddonOutcome,
}

/// Aggregated results of one cycle for one cluster.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    /// Environment.
    pub environment: String,
    /// Cluster identifier.
    pub cluster: String,
    /// Per add-on results.
    pub results: Vec<AddonResult>,
    /// When the cycle started.
    pub started_at: DateTime<Utc>,
    /// When the cycle finished.
    pub finished_at: DateTime<Utc>,
}

impl CycleReport {
    fn count(&self, f: impl Fn(&AddonOutcome) -> bool) -> usize {
        self.results.iter().filter(|r| f(&r.outcome)).count()
    }

    /// Number of add-ons already in sync.
    #[must_use]
    pub fn in_sync(&self) -> usize {
        self.count(|o| *o == AddonOutcome::InSync)
    }

    /// Number of add-ons updated or installed.
    #[must_use]
    pub fn changed(&self) -> usize {
        self.count(|o| matches!(o, AddonOutcome::Updated { .. } | AddonOutcome::Created))
    }

    /// Number of failed add-ons.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, AddonOutcome::Failed { .. }))
    }

    /// Number of skipped add-ons.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, AddonOutcome::Skipped { .. }))
    }

    /// Returns true if no add-on failed or was skipped.
    #[must_use]
    pub fn success(&self) -> bool {
        self.failed() == 0 && self.skipped() == 0
    }

    /// Returns the result for an add-on.
    #[must_use]
    pub fn result_for(&self, addon: &str) -> Option<&AddonResult> {
        self.results.iter().find(|r| r.addon == addon)
    }
}

/// A resource whose observed state differs from the desired one.
#[derive(Debug, Clone, Serialize)]
pub struct DriftedResource {
    /// Resource identifier.
    pub id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Change needed to converge (`create`, `update` or `delete`).
    pub change: String,
    /// Top-level fields that differ.
    pub fields: Vec<String>,
}

/// Report of drift detection.
#[derive(Debug, Clone, Serialize)]
pub struct DriftReport {
    /// Environment.
    pub environment: String,
    /// Whether drift was detected.
    pub has_drift: bool,
    /// Resources that have drifted.
    pub drifted_resources: Vec<DriftedResource>,
    /// Number of declared resources.
    pub total_resources: usize,
    /// Number of observed resources.
    pub observed_count: usize,
}

impl DriftReport {
    /// Returns true if the environment is converged.
    #[must_use]
    pub const fn is_converged(&self) -> bool {
        !self.has_drift
    }
}

/// Reconciles cluster add-ons.
#[derive(Debug)]
pub struct AddonReconciler {
    registry: Arc<EnvironmentRegistry>,
    executor: Arc<ConvergenceExecutor>,
    diff: DiffEngine,
    visibility_grace: chrono::Duration,
}

impl AddonReconciler {
    /// Creates a reconciler.
    #[must_use]
    pub fn new(registry: Arc<EnvironmentRegistry>, executor: Arc<ConvergenceExecutor>) -> Self {
        Self {
            registry,
            executor,
            diff: DiffEngine::new(),
            visibility_grace: chrono::Duration::minutes(5),
        }
    }

    /// Sets how long applied updates are trusted while not yet visible.
    #[must_use]
    pub const fn with_visibility_grace(mut self, grace: chrono::Duration) -> Self {
        self.visibility_grace = grace;
        self
    }

    /// Runs one reconciliation cycle for a cluster.
    ///
    /// Never fails as a whole; problems are reported per add-on.
    pub async fn reconcile_cycle(&self, target: &ClusterTarget) -> CycleReport {
        let started_at = Utc::now();
        let env = target.environment.as_str();
        debug!(
            "Reconciling {} add-ons on {env}/{}",
            target.addons.len(),
            target.cluster.id
        );

        let results = match self.registry.get_observed_state(env).await {
            Err(e) => {
                error!("Failed to observe {env}: {e}");
                Self::skip_all(target, &format!("observed state unavailable: {e}"))
            }
            Ok(observed) if !observed.iter().any(|n| n.id == target.cluster.id) => {
                warn!("Cluster {} is not present in {env}, skipping its add-ons", target.cluster.id);
                Self::skip_all(target, &format!("cluster {} is not present", target.cluster.id))
            }
            Ok(observed) => {
                let mut results = Vec::with_capacity(target.addons.len());
                for addon in &target.addons {
                    results.push(self.reconcile_addon(env, addon, &observed).await);
                }
                results
            }
        };

        let report = CycleReport {
            environment: env.to_string(),
            cluster: target.cluster.id.clone(),
            results,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            "Add-on cycle for {env}/{}: {} in sync, {} changed, {} failed, {} skipped",
            report.cluster,
            report.in_sync(),
            report.changed(),
            report.failed(),
            report.skipped()
        );
        report
    }

    fn skip_all(target: &ClusterTarget, reason: &str) -> Vec<AddonResult> {
        target
            .addons
            .iter()
            .map(|addon| AddonResult {
                addon: addon.id.clone(),
                desired_version: addon.config.version(),
                observed_version: None,
                outcome: AddonOutcome::Skipped {
                    reason: reason.to_string(),
                },
            })
            .collect()
    }

    async fn reconcile_addon(
        &self,
        env: &str,
        addon: &ResourceNode,
        observed: &[ResourceNode],
    ) -> AddonResult {
        let desired_version = addon.config.version();
        let running = observed.iter().find(|n| n.id == addon.id);
        let observed_version = running.and_then(|n| n.config.version());

        let mut result = AddonResult {
            addon: addon.id.clone(),
            desired_version: desired_version.clone(),
            observed_version: observed_version.clone(),
            outcome: AddonOutcome::InSync,
        };

        let action = match running {
            None => Action::Create,
            Some(_) if desired_version.is_none() || desired_version == observed_version => {
                return result;
            }
            Some(_) => Action::Update,
        };

        info!(
            "Add-on {} in {env} is at {} but {} is declared, issuing {action}",
            addon.id,
            observed_version.as_deref().unwrap_or("nothing"),
            desired_version.as_deref().unwrap_or("unversioned")
        );

        let operation = Operation::new(&addon.id, addon.kind, action, addon.config.clone())
            .with_resource_dependencies(addon.depends_on.clone());
        let mut plan = Plan::new(env, RECONCILE_VERSION, vec![operation]);

        let report = match self.registry.lock(env).await {
            Ok(mut record) => {
                record.ledger.forget_drifted(observed, self.visibility_grace);
                self.executor.apply(&mut plan, &mut record.ledger).await
            }
            Err(e) => {
                result.outcome = AddonOutcome::Failed { reason: e.to_string() };
                return result;
            }
        };

        result.outcome = match report.results.first() {
            Some(r) if r.status == OperationStatus::Applied => match action {
                Action::Create => AddonOutcome::Created,
                _ => AddonOutcome::Updated {
                    from: observed_version,
                },
            },
            Some(r) if r.status == OperationStatus::NoOp => AddonOutcome::InSync,
            Some(r) => AddonOutcome::Failed {
                reason: r
                    .error
                    .as_ref()
                    .map_or_else(|| r.status.to_string(), ToString::to_string),
            },
            None => AddonOutcome::Failed {
                reason: String::from("no result"),
            },
        };
        if let AddonOutcome::Failed { reason } = &result.outcome {
            error!("Add-on {} in {env} failed to reconcile: {reason}", addon.id);
        }
        result
    }

    /// Spawns one task per cluster that reconciles it every `interval` until
    /// `flag` is cancelled.
    ///
    /// Each task resolves to the number of cycles it ran.
    pub fn run_periodic(
        self: &Arc<Self>,
        targets: Vec<ClusterTarget>,
        interval: Duration,
        flag: Arc<CancellationFlag>,
    ) -> Vec<JoinHandle<u64>> {
        targets
            .into_iter()
            .map(|target| {
                let reconciler = Arc::clone(self);
                let flag = Arc::clone(&flag);
                tokio::spawn(async move {
                    let mut cycles = 0;
                    while !flag.is_cancelled() {
                        let report = reconciler.reconcile_cycle(&target).await;
                        cycles += 1;
                        if !report.success() {
                            warn!(
                                "Cycle {cycles} for {}/{} finished with {} failed add-ons",
                                target.environment,
                                target.cluster.id,
                                report.failed()
                            );
                        }
                        if flag.sleep(interval).await {
                            break;
                        }
                    }
                    debug!(
                        "Reconciliation of {}/{} stopped after {cycles} cycles",
                        target.environment, target.cluster.id
                    );
                    cycles
                })
            })
            .collect()
    }

    /// Compares an environment with its desired resources without acting.
    ///
    /// # Errors
    ///
    /// Returns an error if the environment cannot be observed or the desired
    /// resources cannot be planned.
    pub async fn check_drift(&self, environment: &str, desired: &[ResourceNode]) -> Result<DriftReport> {
        info!("Checking for drift in {environment}");

        let observed = self.registry.get_observed_state(environment).await?;
        let diff = self.diff.compute_diff(desired, &observed)?;

        let drifted_resources: Vec<DriftedResource> = diff
            .diffs
            .iter()
            .filter(|d| d.diff_type != DiffType::NoChange)
            .map(|d| DriftedResource {
                id: d.id.clone(),
                kind: d.kind,
                change: d.diff_type.to_string(),
                fields: d.details.iter().map(|detail| detail.field.clone()).collect(),
            })
            .collect();

        Ok(DriftReport {
            environment: environment.to_string(),
            has_drift: !drifted_resources.is_empty(),
            drifted_resources,
            total_resources: diff.desired.len(),
            observed_count: observed.len(),
        })
    }
}

impl std::fmt::Display for AddonOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InSync => write!(f, "in sync"),
            Self::Updated { from: Some(from) } => write!(f, "updated from {from}"),
            Self::Updated { from: None } => write!(f, "updated"),
            Self::Created => write!(f, "installed"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
            Self::Skipped { reason } => write!(f, "skipped: {reason}"),
        }
    }
}

impl std::fmt::Display for CycleReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Add-ons on {}/{}:", self.environment, self.cluster)?;
        for r in &self.results {
            writeln!(
                f,
                "  {} ({}): {}",
                r.addon,
                r.desired_version.as_deref().unwrap_or("-"),
                r.outcome
            )?;
        }
        Ok(())
    }
}

impl std::fmt::Display for DriftReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.has_drift {
            writeln!(f, "Drift detected in {}:", self.environment)?;
            for resource in &self.drifted_resources {
                write!(f, "  - {} {} ({})", resource.change, resource.id, resource.kind)?;
                if !resource.fields.is_empty() {
                    write!(f, ": {}", resource.fields.join(", "))?;
                }
                writeln!(f)?;
            }
        } else {
            write!(f, "No drift detected in {} - state is converged", self.environment)?;
        }
        Ok(())
    }
}
