//! In-memory provisioning API.
//!
//! Simulates a cloud control plane: resources live in a map per environment,
//! freshly created resources can stay invisible for a number of observations,
//! and failures can be scripted per resource or per environment observation. Every dispatched operation is
//! recorded so callers can assert on what actually reached the provider.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tracing::debug;

use crate::error::ProvisionError;
use crate::graph::ResourceNode;
use crate::planner::{Action, Operation};

use super::ProvisioningApi;

/// One operation received by the simulated provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRecord {
    /// Environment the operation targeted.
    pub environment: String,
    /// Target resource identifier.
    pub target: String,
    /// Requested action.
    pub action: Action,
}

#[derive(Debug, Clone)]
struct SimulatedResource {
    node: ResourceNode,
    hidden_for: u32,
}

#[derive(Debug, Clone)]
enum Fault {
    Times(u32, ProvisionError),
    Always(ProvisionError),
}

#[derive(Debug, Default)]
struct Inner {
    environments: HashMap<String, BTreeMap<String, SimulatedResource>>,
    faults: HashMap<String, VecDeque<Fault>>,
    observe_faults: HashMap<String, VecDeque<Fault>>,
    observations: usize,
    dispatched: Vec<DispatchRecord>,
    in_flight: usize,
    max_in_flight: usize,
}

/// Simulated provisioning API with fault injection and visibility lag.
#[derive(Debug, Default)]
pub struct InMemoryProvisioner {
    inner: Mutex<Inner>,
    visibility_lag: u32,
    latency: Duration,
}

impl InMemoryProvisioner {
    /// Creates an empty simulated provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hides created resources from the next `lag` observations.
    #[must_use]
    pub const fn with_visibility_lag(mut self, lag: u32) -> Self {
        self.visibility_lag = lag;
        self
    }

    /// Makes every dispatched operation take `latency`.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Places existing resources into an environment, visible immediately.
    pub fn seed(&self, environment: &str, nodes: impl IntoIterator<Item = ResourceNode>) {
        let mut inner = self.inner.lock();
        let resources = inner.environments.entry(environment.to_string()).or_default();
        for node in nodes {
            resources.insert(
                node.id.clone(),
                SimulatedResource {
                    node,
                    hidden_for: 0,
                },
            );
        }
    }

    /// Removes a resource behind the engine's back.
    pub fn remove(&self, environment: &str, id: &str) -> Option<ResourceNode> {
        self.inner
            .lock()
            .environments
            .get_mut(environment)
            .and_then(|resources| resources.remove(id))
            .map(|r| r.node)
    }

    /// Fails the next `times` operations on `target` with `error`.
    pub fn fail_times(&self, target: &str, times: u32, error: ProvisionError) {
        self.inner
            .lock()
            .faults
            .entry(target.to_string())
            .or_default()
            .push_back(Fault::Times(times, error));
    }

    /// Fails every operation on `target` with `error`.
    pub fn fail_always(&self, target: &str, error: ProvisionError) {
        self.inner
            .lock()
            .faults
            .entry(target.to_string())
            .or_default()
            .push_back(Fault::Always(error));
    }

    /// Fails the next `times` observations of `environment` with `error`.
    pub fn fail_observe_times(&self, environment: &str, times: u32, error: ProvisionError) {
        self.inner
            .lock()
            .observe_faults
            .entry(environment.to_string())
            .or_default()
            .push_back(Fault::Times(times, error));
    }

    /// Fails every observation of `environment` with `error`.
    pub fn fail_observe_always(&self, environment: &str, error: ProvisionError) {
        self.inner
            .lock()
            .observe_faults
            .entry(environment.to_string())
            .or_default()
            .push_back(Fault::Always(error));
    }

    /// Returns the number of observation requests received, failed ones included.
    #[must_use]
    pub fn observation_count(&self) -> usize {
        self.inner.lock().observations
    }

    /// Returns every dispatched operation in arrival order.
    #[must_use]
    pub fn dispatched(&self) -> Vec<DispatchRecord> {
        self.inner.lock().dispatched.clone()
    }

    /// Returns the number of dispatched operations.
    #[must_use]
    pub fn dispatch_count(&self) -> usize {
        self.inner.lock().dispatched.len()
    }

    /// Returns the number of operations dispatched to one environment.
    #[must_use]
    pub fn dispatch_count_for(&self, environment: &str) -> usize {
        self.inner
            .lock()
            .dispatched
            .iter()
            .filter(|d| d.environment == environment)
            .count()
    }

    /// Returns the highest number of operations that were in flight at once.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.inner.lock().max_in_flight
    }

    /// Returns every resource of an environment, including hidden ones.
    #[must_use]
    pub fn resources(&self, environment: &str) -> Vec<ResourceNode> {
        self.inner
            .lock()
            .environments
            .get(environment)
            .map(|resources| resources.values().map(|r| r.node.clone()).collect())
            .unwrap_or_default()
    }

    fn take_fault(faults: &mut HashMap<String, VecDeque<Fault>>, key: &str) -> Option<ProvisionError> {
        let queue = faults.get_mut(key)?;
        let front = queue.front_mut()?;
        let (error, exhausted) = match front {
            Fault::Always(error) => (error.clone(), false),
            Fault::Times(remaining, error) => {
                *remaining = remaining.saturating_sub(1);
                (error.clone(), *remaining == 0)
            }
        };
        if exhausted {
            queue.pop_front();
        }
        Some(error)
    }
}

#[async_trait]
impl ProvisioningApi for InMemoryProvisioner {
    async fn observed_state(&self, environment: &str) -> Result<Vec<ResourceNode>, ProvisionError> {
        let mut inner = self.inner.lock();
        inner.observations += 1;
        if let Some(error) = Self::take_fault(&mut inner.observe_faults, environment) {
            debug!("Simulated observation failure for {environment}: {error}");
            return Err(error);
        }
        let Some(resources) = inner.environments.get_mut(environment) else {
            return Ok(vec![]);
        };

        let mut visible = Vec::new();
        for resource in resources.values_mut() {
            if resource.hidden_for > 0 {
                resource.hidden_for -= 1;
                continue;
            }
            visible.push(resource.node.clone());
        }
        Ok(visible)
    }

    async fn apply_operation(
        &self,
        environment: &str,
        operation: &Operation,
    ) -> Result<(), ProvisionError> {
        {
            let mut inner = self.inner.lock();
            inner.dispatched.push(DispatchRecord {
                environment: environment.to_string(),
                target: operation.target.clone(),
                action: operation.action,
            });
            inner.in_flight += 1;
            inner.max_in_flight = inner.max_in_flight.max(inner.in_flight);
        }

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let mut inner = self.inner.lock();
        inner.in_flight -= 1;

        if let Some(error) = Self::take_fault(&mut inner.faults, &operation.target) {
            debug!("Simulated failure for {} {}: {error}", operation.action, operation.target);
            return Err(error);
        }

        let lag = self.visibility_lag;
        let resources = inner.environments.entry(environment.to_string()).or_default();
        match operation.action {
            Action::Create => {
                resources.insert(
                    operation.target.clone(),
                    SimulatedResource {
                        node: operation.to_node(),
                        hidden_for: lag,
                    },
                );
            }
            Action::Update => {
                let Some(existing) = resources.get_mut(&operation.target) else {
                    return Err(ProvisionError::NotFound {
                        resource: operation.target.clone(),
                    });
                };
                existing.node = operation.to_node();
            }
            Action::Delete => {
                if resources.remove(&operation.target).is_none() {
                    return Err(ProvisionError::NotFound {
                        resource: operation.target.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ResourceConfig, ResourceKind};

    fn create(id: &str) -> Operation {
        Operation::new(id, ResourceKind::Network, Action::Create, ResourceConfig::new())
    }

    #[tokio::test]
    async fn test_visibility_lag() {
        let provider = InMemoryProvisioner::new().with_visibility_lag(2);
        provider.apply_operation("dev", &create("network")).await.unwrap();

        assert!(provider.observed_state("dev").await.unwrap().is_empty());
        assert!(provider.observed_state("dev").await.unwrap().is_empty());
        assert_eq!(provider.observed_state("dev").await.unwrap().len(), 1);
        assert_eq!(provider.resources("dev").len(), 1);
    }

    #[tokio::test]
    async fn test_scripted_faults() {
        let provider = InMemoryProvisioner::new();
        provider.fail_times(
            "network",
            2,
            ProvisionError::RateLimited {
                retry_after_secs: 0,
            },
        );

        assert!(provider.apply_operation("dev", &create("network")).await.is_err());
        assert!(provider.apply_operation("dev", &create("network")).await.is_err());
        assert!(provider.apply_operation("dev", &create("network")).await.is_ok());
        assert_eq!(provider.dispatch_count(), 3);
        assert_eq!(provider.dispatch_count_for("prod"), 0);
    }

    #[tokio::test]
    async fn test_scripted_observation_faults() {
        let provider = InMemoryProvisioner::new();
        provider.seed("dev", [ResourceNode::new(ResourceKind::Network, "network")]);
        provider.fail_observe_times("dev", 1, ProvisionError::network("connection reset"));

        assert!(provider.observed_state("dev").await.is_err());
        assert_eq!(provider.observed_state("dev").await.unwrap().len(), 1);
        assert!(provider.observed_state("prod").await.unwrap().is_empty());
        assert_eq!(provider.observation_count(), 3);
        assert_eq!(provider.dispatch_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_of_absent_resource_is_not_found() {
        let provider = InMemoryProvisioner::new();
        let delete = Operation::new("eks", ResourceKind::Cluster, Action::Delete, ResourceConfig::new());

        assert_eq!(
            provider.apply_operation("dev", &delete).await,
            Err(ProvisionError::NotFound {
                resource: "eks".into()
            })
        );
    }
}
