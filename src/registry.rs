//! Environment registry.
//!
//! The registry owns one record per environment: its place in the promotion
//! sequence, the version it last converged to, its approval status and the
//! ledger of applied operations. Records are mutated by a single writer at a
//! time through a per-environment async mutex, while the cache of observed
//! state is a shared, read-mostly map.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::error::{RegistryError, Result};
use crate::graph::ResourceNode;
use crate::planner::{AppliedLedger, RetryPolicy};
use crate::provider::ProvisioningApi;

/// Approval status of an environment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    /// No decision yet.
    #[default]
    Pending,
    /// Approved for promotion.
    Approved,
    /// Promotion was rejected.
    Rejected,
}

/// Convergence status of an environment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConvergenceStatus {
    /// Nothing has been applied yet.
    #[default]
    NotStarted,
    /// The last plan converged.
    Converged,
    /// The last plan failed.
    Failed,
}

/// A deployment target in the promotion sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    /// Unique identifier (e.g. `dev`, `pre-prod`, `prod`).
    pub id: String,
    /// Cloud region.
    pub region: String,
    /// Target account.
    pub account: String,
    /// Position in the promotion sequence, lower goes first.
    pub position: u32,
    /// Whether promotion into this environment needs a manual approval.
    #[serde(default)]
    pub requires_approval: bool,
    /// Desired-state version last converged.
    #[serde(default)]
    pub applied_version: Option<String>,
    /// Approval status.
    #[serde(default)]
    pub approval: ApprovalStatus,
    /// Convergence status.
    #[serde(default)]
    pub convergence: ConvergenceStatus,
    /// When the record last changed.
    pub updated_at: DateTime<Utc>,
}

impl Environment {
    /// Creates an environment that has not converged yet.
    #[must_use]
    pub fn new(id: &str, region: &str, account: &str, position: u32) -> Self {
        Self {
            id: id.to_string(),
            region: region.to_string(),
            account: account.to_string(),
            position,
            requires_approval: false,
            applied_version: None,
            approval: ApprovalStatus::Pending,
            convergence: ConvergenceStatus::NotStarted,
            updated_at: Utc::now(),
        }
    }

    /// Sets whether a manual approval is required.
    #[must_use]
    pub const fn with_approval_required(mut self, required: bool) -> Self {
        self.requires_approval = required;
        self
    }
}

/// An environment together with its ledger of applied operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentRecord {
    /// The environment.
    pub environment: Environment,
    /// Operations applied to it.
    #[serde(default)]
    pub ledger: AppliedLedger,
}

/// A cached observation of an environment.
#[derive(Debug, Clone)]
pub struct ObservedSnapshot {
    /// Observed resources.
    pub nodes: Vec<ResourceNode>,
    /// When they were observed.
    pub observed_at: DateTime<Utc>,
}

/// Registry of environments in promotion order.
pub struct EnvironmentRegistry {
    provider: Arc<dyn ProvisioningApi>,
    records: RwLock<BTreeMap<String, Arc<Mutex<EnvironmentRecord>>>>,
    positions: RwLock<BTreeMap<u32, String>>,
    observed: RwLock<HashMap<String, ObservedSnapshot>>,
    observe_retry: RetryPolicy,
}

impl fmt::Debug for EnvironmentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvironmentRegistry")
            .field("environments", &self.ids())
            .finish_non_exhaustive()
    }
}

impl EnvironmentRegistry {
    /// Creates an empty registry backed by a provisioning API.
    #[must_use]
    pub fn new(provider: Arc<dyn ProvisioningApi>) -> Self {
        Self {
            provider,
            records: RwLock::new(BTreeMap::new()),
            positions: RwLock::new(BTreeMap::new()),
            observed: RwLock::new(HashMap::new()),
            observe_retry: RetryPolicy::default(),
        }
    }

    /// Sets the backoff used when observing an environment fails transiently.
    #[must_use]
    pub fn with_observe_retry(mut self, policy: RetryPolicy) -> Self {
        self.observe_retry = policy;
        self
    }

    /// Returns the provisioning API.
    #[must_use]
    pub fn provider(&self) -> Arc<dyn ProvisioningApi> {
        Arc::clone(&self.provider)
    }

    /// Registers an environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the identifier or the position is already taken.
    pub fn register(&self, environment: Environment) -> Result<()> {
        self.register_record(EnvironmentRecord {
            environment,
            ledger: AppliedLedger::new(),
        })
    }

    /// Registers an environment with an existing ledger.
    ///
    /// # Errors
    ///
    /// Returns an error if the identifier or the position is already taken.
    pub fn register_record(&self, record: EnvironmentRecord) -> Result<()> {
        let mut records = self.records.write();
        let mut positions = self.positions.write();
        let env = &record.environment;

        if records.contains_key(&env.id) {
            return Err(RegistryError::DuplicateEnvironment { id: env.id.clone() }.into());
        }
        if let Some(existing) = positions.get(&env.position) {
            return Err(RegistryError::DuplicatePosition {
                position: env.position,
                existing: existing.clone(),
            }
            .into());
        }

        info!("Registered environment {} at position {}", env.id, env.position);
        positions.insert(env.position, env.id.clone());
        records.insert(env.id.clone(), Arc::new(Mutex::new(record)));
        Ok(())
    }

    /// Returns the environment identifiers in promotion order.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.positions.read().values().cloned().collect()
    }

    /// Returns true if the environment is registered.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.records.read().contains_key(id)
    }

    fn record(&self, id: &str) -> Result<Arc<Mutex<EnvironmentRecord>>> {
        self.records
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownEnvironment { id: id.to_string() }.into())
    }

    /// Acquires the single-writer guard over an environment and its ledger.
    ///
    /// # Errors
    ///
    /// Returns an error if the environment is unknown.
    pub async fn lock(&self, id: &str) -> Result<OwnedMutexGuard<EnvironmentRecord>> {
        Ok(self.record(id)?.lock_owned().await)
    }

    /// Returns a copy of an environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the environment is unknown.
    pub async fn environment(&self, id: &str) -> Result<Environment> {
        Ok(self.lock(id).await?.environment.clone())
    }

    /// Returns copies of all environments in promotion order.
    pub async fn environments(&self) -> Vec<Environment> {
        let mut out = Vec::new();
        for id in self.ids() {
            if let Ok(env) = self.environment(&id).await {
                out.push(env);
            }
        }
        out
    }

    /// Reads the observed state of an environment and refreshes the cache.
    ///
    /// Transient provider errors are retried with the observe backoff.
    ///
    /// # Errors
    ///
    /// Returns an error if the environment is unknown, the provider fails
    /// permanently, or transient failures outlast the retry budget.
    pub async fn get_observed_state(&self, id: &str) -> Result<Vec<ResourceNode>> {
        if !self.contains(id) {
            return Err(RegistryError::UnknownEnvironment { id: id.to_string() }.into());
        }

        let mut attempt = 0;
        let nodes = loop {
            attempt += 1;
            match self.provider.observed_state(id).await {
                Ok(nodes) => break nodes,
                Err(err) if self.observe_retry.should_retry(attempt, &err) => {
                    let delay = self.observe_retry.delay_for(attempt, &err);
                    warn!(
                        "Observing {id} failed with transient error ({err}), retrying in {}ms",
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err.into()),
            }
        };
        debug!("Observed {} resources in {id}", nodes.len());
        self.observed.write().insert(
            id.to_string(),
            ObservedSnapshot {
                nodes: nodes.clone(),
                observed_at: Utc::now(),
            },
        );
        Ok(nodes)
    }

    /// Returns the last cached observation of an environment.
    #[must_use]
    pub fn cached_observed_state(&self, id: &str) -> Option<ObservedSnapshot> {
        self.observed.read().get(id).cloned()
    }

    /// Records that an environment converged to `version`.
    ///
    /// # Errors
    ///
    /// Returns an error if the environment is unknown.
    pub async fn record_applied_version(&self, id: &str, version: &str) -> Result<()> {
        let mut record = self.lock(id).await?;
        Self::set_applied_version(&mut record.environment, version);
        Ok(())
    }

    /// Marks an environment converged on a record the caller already holds.
    pub fn set_applied_version(environment: &mut Environment, version: &str) {
        info!("Environment {} converged to version {version}", environment.id);
        environment.applied_version = Some(version.to_string());
        environment.convergence = ConvergenceStatus::Converged;
        environment.updated_at = Utc::now();
    }

    /// Records that the last plan for an environment failed.
    ///
    /// # Errors
    ///
    /// Returns an error if the environment is unknown.
    pub async fn mark_failed(&self, id: &str) -> Result<()> {
        let mut record = self.lock(id).await?;
        record.environment.convergence = ConvergenceStatus::Failed;
        record.environment.updated_at = Utc::now();
        Ok(())
    }

    /// Resets the approval of an environment to pending.
    ///
    /// # Errors
    ///
    /// Returns an error if the environment is unknown.
    pub async fn request_approval(&self, id: &str) -> Result<()> {
        let mut record = self.lock(id).await?;
        record.environment.approval = ApprovalStatus::Pending;
        record.environment.updated_at = Utc::now();
        Ok(())
    }

    /// Marks an environment approved.
    ///
    /// # Errors
    ///
    /// Returns `PrecedingNotConverged` unless every environment earlier in the
    /// sequence has converged, or an error if the environment is unknown.
    pub async fn approve(&self, id: &str) -> Result<()> {
        let mut record = self.lock(id).await?;
        let position = record.environment.position;
        let preceding: Vec<String> = self
            .positions
            .read()
            .range(..position)
            .map(|(_, env)| env.clone())
            .collect();

        for earlier in preceding {
            let converged = self.environment(&earlier).await?.convergence;
            if converged != ConvergenceStatus::Converged {
                return Err(RegistryError::PrecedingNotConverged {
                    environment: id.to_string(),
                    blocking: earlier,
                }
                .into());
            }
        }

        record.environment.approval = ApprovalStatus::Approved;
        record.environment.updated_at = Utc::now();
        info!("Environment {id} approved");
        Ok(())
    }

    /// Marks an environment rejected.
    ///
    /// # Errors
    ///
    /// Returns an error if the environment is unknown.
    pub async fn reject(&self, id: &str) -> Result<()> {
        let mut record = self.lock(id).await?;
        record.environment.approval = ApprovalStatus::Rejected;
        record.environment.updated_at = Utc::now();
        info!("Environment {id} rejected");
        Ok(())
    }

    /// Returns copies of every record in promotion order.
    pub async fn snapshot(&self) -> Vec<EnvironmentRecord> {
        let mut out = Vec::new();
        for id in self.ids() {
            if let Ok(record) = self.lock(&id).await {
                out.push(record.clone());
            }
        }
        out
    }

    /// Registers previously persisted records.
    ///
    /// # Errors
    ///
    /// Returns an error if a record clashes with a registered environment.
    pub fn restore(&self, records: Vec<EnvironmentRecord>) -> Result<()> {
        for record in records {
            self.register_record(record)?;
        }
        Ok(())
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for ConvergenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotStarted => "not-started",
            Self::Converged => "converged",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConvergeError, ProvisionError};
    use crate::graph::ResourceKind;
    use crate::provider::InMemoryProvisioner;
    use std::time::Duration;

    fn registry() -> (Arc<InMemoryProvisioner>, EnvironmentRegistry) {
        let provider = Arc::new(InMemoryProvisioner::new());
        let api: Arc<dyn ProvisioningApi> = provider.clone();
        let registry = EnvironmentRegistry::new(api);
        registry.register(Environment::new("dev", "eu-west-1", "111", 0)).unwrap();
        registry
            .register(Environment::new("prod", "eu-central-1", "333", 2).with_approval_required(true))
            .unwrap();
        registry.register(Environment::new("pre-prod", "eu-west-1", "222", 1)).unwrap();
        (provider, registry)
    }

    #[tokio::test]
    async fn test_promotion_order() {
        let (_, registry) = registry();
        assert_eq!(registry.ids(), vec!["dev", "pre-prod", "prod"]);
        let envs = registry.environments().await;
        assert!(envs[2].requires_approval);
    }

    #[tokio::test]
    async fn test_duplicates_rejected() {
        let (_, registry) = registry();
        let dup_id = registry.register(Environment::new("dev", "r", "a", 9)).unwrap_err();
        assert!(matches!(
            dup_id,
            ConvergeError::Registry(RegistryError::DuplicateEnvironment { .. })
        ));

        let dup_pos = registry.register(Environment::new("qa", "r", "a", 1)).unwrap_err();
        assert!(matches!(
            dup_pos,
            ConvergeError::Registry(RegistryError::DuplicatePosition { position: 1, ref existing })
                if existing == "pre-prod"
        ));
    }

    #[tokio::test]
    async fn test_approval_requires_preceding_convergence() {
        let (_, registry) = registry();
        registry.record_applied_version("dev", "v1").await.unwrap();

        let err = registry.approve("prod").await.unwrap_err();
        assert!(matches!(
            err,
            ConvergeError::Registry(RegistryError::PrecedingNotConverged { ref blocking, .. })
                if blocking == "pre-prod"
        ));

        registry.record_applied_version("pre-prod", "v1").await.unwrap();
        registry.approve("prod").await.unwrap();
        let prod = registry.environment("prod").await.unwrap();
        assert_eq!(prod.approval, ApprovalStatus::Approved);

        registry.mark_failed("pre-prod").await.unwrap();
        assert!(registry.approve("prod").await.is_err());
    }

    #[tokio::test]
    async fn test_approval_checks_after_taking_the_lock() {
        let (_, registry) = registry();
        registry.record_applied_version("dev", "v1").await.unwrap();
        let held = registry.lock("prod").await.unwrap();

        let (approved, ()) = tokio::join!(registry.approve("prod"), async {
            registry.record_applied_version("pre-prod", "v1").await.unwrap();
            drop(held);
        });

        approved.unwrap();
        let prod = registry.environment("prod").await.unwrap();
        assert_eq!(prod.approval, ApprovalStatus::Approved);
    }

    #[tokio::test]
    async fn test_transient_observation_is_retried() {
        let (provider, registry) = registry();
        let registry = registry.with_observe_retry(
            RetryPolicy::new()
                .with_max_attempts(3)
                .with_base_delay(Duration::from_millis(1))
                .with_max_delay(Duration::from_millis(5))
                .with_jitter(false),
        );
        provider.fail_observe_times("dev", 2, ProvisionError::RateLimited { retry_after_secs: 0 });

        assert!(registry.get_observed_state("dev").await.unwrap().is_empty());
        assert_eq!(provider.observation_count(), 3);

        provider.fail_observe_always("prod", ProvisionError::AuthenticationFailed { message: "expired token".into() });
        assert!(registry.get_observed_state("prod").await.is_err());
        assert_eq!(provider.observation_count(), 4);

        provider.fail_observe_always("pre-prod", ProvisionError::network("connection reset"));
        assert!(registry.get_observed_state("pre-prod").await.is_err());
        assert_eq!(provider.observation_count(), 7);
    }

    #[tokio::test]
    async fn test_observed_state_is_cached() {
        let (provider, registry) = registry();
        provider.seed("dev", [ResourceNode::new(ResourceKind::Network, "network")]);

        assert!(registry.cached_observed_state("dev").is_none());
        let nodes = registry.get_observed_state("dev").await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(registry.cached_observed_state("dev").unwrap().nodes, nodes);
        assert!(registry.get_observed_state("staging").await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_version_updates_are_serialized() {
        let (_, registry) = registry();
        let registry = Arc::new(registry);

        let mut handles = Vec::new();
        for i in 0..16 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                let mut record = registry.lock("dev").await.unwrap();
                let next = record
                    .environment
                    .applied_version
                    .as_deref()
                    .and_then(|v| v.parse::<u32>().ok())
                    .unwrap_or(0)
                    + 1;
                tokio::task::yield_now().await;
                EnvironmentRegistry::set_applied_version(&mut record.environment, &next.to_string());
                i
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let dev = registry.environment("dev").await.unwrap();
        assert_eq!(dev.applied_version.as_deref(), Some("16"));
    }

    #[tokio::test]
    async fn test_snapshot_and_restore() {
        let (provider, registry) = registry();
        registry.record_applied_version("dev", "v7").await.unwrap();
        let snapshot = registry.snapshot().await;

        let api: Arc<dyn ProvisioningApi> = provider;
        let restored = EnvironmentRegistry::new(api);
        restored.restore(snapshot).unwrap();

        assert_eq!(restored.ids(), vec!["dev", "pre-prod", "prod"]);
        let dev = restored.environment("dev").await.unwrap();
        assert_eq!(dev.applied_version.as_deref(), Some("v7"));
    }
}
