//! Provider driver boundary
//!
//! The engine reaches remote state only through [`ProviderDriver`]. Real
//! deployments compose a provider-side provisioner with the management-plane
//! client ([`management::ManagedDriver`]); engine tests use the deterministic
//! [`fake::FakeDriver`].
//!
//! Drivers are shared between concurrently running workflows, so every
//! method takes `&self` and implementations must be `Send + Sync`. The engine
//! assumes nothing about atomicity across calls.

pub mod fake;
pub mod management;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use hosted_common::Error;

use crate::model::{ClusterChange, ClusterHandle, ClusterSpec, NodeGroup, Snapshot};

/// Capability set for one hosted Kubernetes provider
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProviderDriver: Send + Sync {
    /// Provider name used in logs and errors (e.g. "eks")
    fn provider(&self) -> String;

    /// Create (or import) a cluster named `name`
    async fn create(&self, name: &str, spec: &ClusterSpec) -> Result<ClusterHandle, Error>;

    /// Request deletion of a cluster
    async fn delete(&self, handle: &ClusterHandle) -> Result<(), Error>;

    /// Request a mutation; the returned handle carries the newly requested spec
    async fn mutate(
        &self,
        handle: &ClusterHandle,
        change: &ClusterChange,
    ) -> Result<ClusterHandle, Error>;

    /// Read current state.
    ///
    /// A cluster the management plane does not know returns
    /// `Ok(Snapshot::not_found(..))`; `Err` is reserved for failed lookups.
    async fn fetch(&self, handle: &ClusterHandle) -> Result<Snapshot, Error>;
}

/// Convenience wrappers over [`ProviderDriver::mutate`]
#[async_trait]
pub trait ProviderDriverExt: ProviderDriver {
    /// Scale one node group
    async fn scale(
        &self,
        handle: &ClusterHandle,
        group: &str,
        desired_size: u32,
    ) -> Result<ClusterHandle, Error> {
        let change = ClusterChange::ScaleNodeGroup {
            group: group.to_string(),
            desired_size,
        };
        self.mutate(handle, &change).await
    }

    /// Upgrade the control plane
    async fn upgrade(&self, handle: &ClusterHandle, version: &str) -> Result<ClusterHandle, Error> {
        let change = ClusterChange::UpgradeControlPlane {
            version: version.to_string(),
        };
        self.mutate(handle, &change).await
    }

    /// Add a node group
    async fn add_group(
        &self,
        handle: &ClusterHandle,
        group: NodeGroup,
    ) -> Result<ClusterHandle, Error> {
        self.mutate(handle, &ClusterChange::AddNodeGroup(group)).await
    }

    /// Remove a node group
    async fn remove_group(&self, handle: &ClusterHandle, group: &str) -> Result<ClusterHandle, Error> {
        let change = ClusterChange::RemoveNodeGroup {
            group: group.to_string(),
        };
        self.mutate(handle, &change).await
    }
}

impl<T: ProviderDriver + ?Sized> ProviderDriverExt for T {}
