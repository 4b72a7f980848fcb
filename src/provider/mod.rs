//! Provisioning API interface and clients.
//!
//! The engine never talks to a cloud provider directly. Everything it needs
//! goes through [`ProvisioningApi`]: reading the observed resources of an
//! environment and applying a single operation.

mod http;
mod memory;

pub use http::HttpProvisioner;
pub use memory::{DispatchRecord, InMemoryProvisioner};

use async_trait::async_trait;

use crate::error::ProvisionError;
use crate::graph::ResourceNode;
use crate::planner::Operation;

/// Narrow interface to the external provisioning API.
///
/// Implementations must tolerate eventual consistency: a resource that was
/// just created may be missing from the next `observed_state` call.
#[async_trait]
pub trait ProvisioningApi: Send + Sync + std::fmt::Debug {
    /// Returns the resources currently observed in an environment.
    ///
    /// # Errors
    ///
    /// Returns a provisioning error if the state cannot be read.
    async fn observed_state(&self, environment: &str) -> Result<Vec<ResourceNode>, ProvisionError>;

    /// Applies a single operation in an environment.
    ///
    /// # Errors
    ///
    /// Returns a provisioning error classified as transient or not.
    async fn apply_operation(
        &self,
        environment: &str,
        operation: &Operation,
    ) -> Result<(), ProvisionError>;
}
