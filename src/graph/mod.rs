//! Resource graph model.
//!
//! This module provides the typed representation of desired infrastructure:
//! networks, clusters, node pools and add-ons, plus the dependency edges
//! between them.

mod dag;
mod node;

pub use dag::ResourceGraph;
pub use node::{ResourceConfig, ResourceKind, ResourceNode};
