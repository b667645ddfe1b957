//! Provider driver assembled from a provisioner and a management-plane client
//!
//! In a deployed run, create and mutate calls go to the cloud provider, while
//! observation and deletion go through the management plane that imported
//! the cluster. [`ManagedDriver`] glues the two halves into one
//! [`ProviderDriver`].

use async_trait::async_trait;
use tracing::debug;

use hosted_common::Error;

use super::ProviderDriver;
use crate::model::{ClusterChange, ClusterHandle, ClusterSpec, ObservedCluster, Snapshot};

/// Lookup and deletion by identity against the management plane
#[async_trait]
pub trait ManagementClient: Send + Sync {
    /// Read the raw fields of a cluster, `None` if the identity is unknown
    async fn get_cluster(&self, id: &str) -> Result<Option<ObservedCluster>, Error>;

    /// Request deletion of a cluster
    async fn delete_cluster(&self, id: &str) -> Result<(), Error>;
}

/// Provider-side create and mutate calls
#[async_trait]
pub trait ClusterProvisioner: Send + Sync {
    /// Provider name (e.g. "eks")
    fn provider(&self) -> String;

    /// Create or import a cluster
    async fn create(&self, name: &str, spec: &ClusterSpec) -> Result<ClusterHandle, Error>;

    /// Apply a change to an existing cluster
    async fn mutate(
        &self,
        handle: &ClusterHandle,
        change: &ClusterChange,
    ) -> Result<ClusterHandle, Error>;
}

/// A [`ProviderDriver`] backed by a provisioner and a management client
pub struct ManagedDriver<P, M> {
    provisioner: P,
    management: M,
}

impl<P, M> ManagedDriver<P, M>
where
    P: ClusterProvisioner,
    M: ManagementClient,
{
    /// Combine the two halves
    pub fn new(provisioner: P, management: M) -> Self {
        Self {
            provisioner,
            management,
        }
    }
}

#[async_trait]
impl<P, M> ProviderDriver for ManagedDriver<P, M>
where
    P: ClusterProvisioner,
    M: ManagementClient,
{
    fn provider(&self) -> String {
        self.provisioner.provider()
    }

    async fn create(&self, name: &str, spec: &ClusterSpec) -> Result<ClusterHandle, Error> {
        self.provisioner.create(name, spec).await
    }

    async fn delete(&self, handle: &ClusterHandle) -> Result<(), Error> {
        self.management.delete_cluster(&handle.id).await
    }

    async fn mutate(
        &self,
        handle: &ClusterHandle,
        change: &ClusterChange,
    ) -> Result<ClusterHandle, Error> {
        self.provisioner.mutate(handle, change).await
    }

    async fn fetch(&self, handle: &ClusterHandle) -> Result<Snapshot, Error> {
        match self.management.get_cluster(&handle.id).await {
            Ok(Some(cluster)) => Ok(Snapshot::found(&handle.id, cluster)),
            Ok(None) => Ok(Snapshot::not_found(&handle.id)),
            // Some clients report a missing cluster as an error
            Err(e) if e.is_not_found() => {
                debug!(cluster = %handle.name, "Management plane reports cluster not found");
                Ok(Snapshot::not_found(&handle.id))
            }
            Err(e) => Err(e),
        }
    }
}
