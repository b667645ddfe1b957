//! Deterministic in-memory provider
//!
//! `FakeDriver` models the asynchronous lifecycle of a hosted cluster with a
//! fetch counter instead of wall-clock time: every operation leaves the
//! cluster in flight for `settle_after` observations, and the next fetch
//! after that shows it settled. Failures are scripted per operation so engine
//! behavior can be tested without network access or real delays.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use hosted_common::Error;

use super::ProviderDriver;
use crate::model::{ClusterChange, ClusterHandle, ClusterSpec, ObservedCluster, Snapshot};

const PROVIDER: &str = "fake";

/// Transitioning error of a create that reuses the name of a cluster still
/// being deleted
pub const NAME_IN_USE_ERROR: &str = "a cluster in fake exists with the same name";

/// Transitioning error of a node group moved across Windows and Linux images
pub const IMAGE_FAMILY_ERROR: &str =
    "Node pools cannot be upgraded between Windows and non-Windows image families";

/// Driver operations, for scripting failures and counting calls
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `create`
    Create,
    /// `delete`
    Delete,
    /// `mutate`
    Mutate,
    /// `fetch`
    Fetch,
}

/// One recorded driver call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    /// Operation invoked
    pub operation: Operation,
    /// Cluster name the call addressed
    pub cluster: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Provisioning,
    Active,
    Updating,
    Deleting,
}

impl Phase {
    fn raw(self) -> &'static str {
        match self {
            Phase::Provisioning => "provisioning",
            Phase::Active => "active",
            Phase::Updating => "updating",
            Phase::Deleting => "removing",
        }
    }
}

#[derive(Clone, Debug)]
struct InjectedError {
    message: String,
    // None keeps the error until the cluster is deleted
    clears_after: Option<u32>,
}

#[derive(Clone, Debug)]
struct FakeCluster {
    name: String,
    phase: Phase,
    spec: ClusterSpec,
    upstream: Option<ClusterSpec>,
    in_flight: u32,
    error: Option<InjectedError>,
    frozen_upstream: bool,
}

impl FakeCluster {
    fn observe(&self) -> ObservedCluster {
        if let Some(error) = &self.error {
            return ObservedCluster::errored(self.phase.raw(), &error.message, self.spec.clone())
                .with_upstream(self.upstream.clone());
        }
        let observed = if self.phase == Phase::Active {
            ObservedCluster::settled(self.phase.raw(), self.spec.clone())
        } else {
            ObservedCluster::transitioning(self.phase.raw(), self.spec.clone())
        };
        observed.with_upstream(self.upstream.clone())
    }

    /// Count one observation against an injected error; false if none
    fn tick_error(&mut self) -> bool {
        let Some(remaining) = self.error.as_ref().map(|e| e.clears_after) else {
            return false;
        };
        match remaining {
            Some(0) => self.error = None,
            Some(n) => {
                if let Some(error) = self.error.as_mut() {
                    error.clears_after = Some(n - 1);
                }
            }
            None => {}
        }
        true
    }
}

/// In-memory [`ProviderDriver`] with scripted failures
pub struct FakeDriver {
    settle_after: u32,
    latency: Duration,
    next_id: AtomicU64,
    clusters: DashMap<String, FakeCluster>,
    failures: DashMap<Operation, VecDeque<Error>>,
    pending_errors: DashMap<String, InjectedError>,
    calls: Mutex<Vec<Call>>,
}

impl Default for FakeDriver {
    fn default() -> Self {
        Self::new(2)
    }
}

impl FakeDriver {
    /// A driver whose operations stay in flight for `settle_after` fetches
    pub fn new(settle_after: u32) -> Self {
        Self {
            settle_after,
            latency: Duration::ZERO,
            next_id: AtomicU64::new(1),
            clusters: DashMap::new(),
            failures: DashMap::new(),
            pending_errors: DashMap::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Delay every call by `latency` on the tokio clock
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make the next call of `operation` fail with `error`.
    ///
    /// Queued failures are consumed in order, one per call.
    pub fn fail_next(&self, operation: Operation, error: Error) {
        self.failures.entry(operation).or_default().push_back(error);
    }

    /// Report `message` as a transitioning error on the named cluster.
    ///
    /// Applies to a cluster created later under that name too. With
    /// `clears_after = Some(n)` the error disappears after `n` fetches and
    /// the operation then settles normally.
    pub fn inject_error(&self, cluster: &str, message: impl Into<String>, clears_after: Option<u32>) {
        let error = InjectedError {
            message: message.into(),
            clears_after,
        };
        match self.clusters.get_mut(cluster) {
            Some(mut c) => c.error = Some(error),
            None => {
                self.pending_errors.insert(cluster.to_string(), error);
            }
        }
    }

    /// Stop the provider from converging: further changes are accepted and
    /// settle, but the upstream spec keeps its current value.
    pub fn freeze_upstream(&self, cluster: &str) {
        if let Some(mut c) = self.clusters.get_mut(cluster) {
            c.frozen_upstream = true;
        }
    }

    /// Every call made so far, in order
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().expect("calls lock poisoned").clone()
    }

    /// Number of calls of `operation` made so far
    pub fn count(&self, operation: Operation) -> usize {
        self.calls
            .lock()
            .expect("calls lock poisoned")
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    /// Whether the named cluster still exists
    pub fn contains(&self, cluster: &str) -> bool {
        self.clusters.contains_key(cluster)
    }

    async fn begin(&self, operation: Operation, cluster: &str) -> Result<(), Error> {
        self.calls
            .lock()
            .expect("calls lock poisoned")
            .push(Call {
                operation,
                cluster: cluster.to_string(),
            });
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let scripted = self
            .failures
            .get_mut(&operation)
            .and_then(|mut queue| queue.pop_front());
        match scripted {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn validate_create(name: &str, spec: &ClusterSpec) -> Result<(), Error> {
        let valid_name = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
        if !valid_name {
            return Err(Error::provider_permanent(
                name,
                PROVIDER,
                format!("InvalidFormat: cluster name {name:?} must match [a-z0-9-]+"),
            ));
        }
        if spec.node_groups.is_empty() {
            return Err(Error::validation(name, "cluster must have at least one node pool"));
        }
        Ok(())
    }

    /// Whether any group present in both specs changes image family
    fn switches_image_family(before: &ClusterSpec, after: &ClusterSpec) -> bool {
        after.node_groups.iter().any(|next| {
            before
                .node_group(&next.name)
                .is_some_and(|prev| prev.is_windows() != next.is_windows())
        })
    }

    fn observe(&self, handle: &ClusterHandle) -> Snapshot {
        let Some(mut cluster) = self.clusters.get_mut(&handle.name) else {
            return Snapshot::not_found(&handle.id);
        };

        let snapshot = Snapshot::found(&handle.id, cluster.observe());

        if cluster.tick_error() {
            return snapshot;
        }

        if cluster.in_flight > 0 {
            cluster.in_flight -= 1;
            return snapshot;
        }

        match cluster.phase {
            Phase::Active => snapshot,
            Phase::Deleting => {
                let name = cluster.name.clone();
                drop(cluster);
                self.clusters.remove(&name);
                Snapshot::not_found(&handle.id)
            }
            Phase::Provisioning | Phase::Updating => {
                cluster.phase = Phase::Active;
                if !cluster.frozen_upstream || cluster.upstream.is_none() {
                    cluster.upstream = Some(cluster.spec.clone());
                }
                debug!(cluster = %cluster.name, "Fake cluster settled");
                Snapshot::found(&handle.id, cluster.observe())
            }
        }
    }
}

#[async_trait]
impl ProviderDriver for FakeDriver {
    fn provider(&self) -> String {
        PROVIDER.to_string()
    }

    async fn create(&self, name: &str, spec: &ClusterSpec) -> Result<ClusterHandle, Error> {
        self.begin(Operation::Create, name).await?;
        Self::validate_create(name, spec)?;

        // A cluster still being deleted blocks the new one until it is gone.
        let mut error = None;
        if let Some(existing) = self.clusters.get(name) {
            if existing.phase != Phase::Deleting {
                return Err(Error::provider_permanent(
                    name,
                    PROVIDER,
                    format!("cluster already exists: {name}"),
                ));
            }
            error = Some(InjectedError {
                message: NAME_IN_USE_ERROR.to_string(),
                clears_after: Some(existing.in_flight),
            });
        }

        let id = format!("c-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let error = error.or_else(|| self.pending_errors.remove(name).map(|(_, e)| e));
        self.clusters.insert(
            name.to_string(),
            FakeCluster {
                name: name.to_string(),
                phase: Phase::Provisioning,
                spec: spec.clone(),
                upstream: None,
                in_flight: self.settle_after,
                error,
                frozen_upstream: false,
            },
        );
        Ok(ClusterHandle::new(id, name, spec.clone()))
    }

    async fn delete(&self, handle: &ClusterHandle) -> Result<(), Error> {
        self.begin(Operation::Delete, &handle.name).await?;
        let mut cluster = self
            .clusters
            .get_mut(&handle.name)
            .ok_or_else(|| Error::not_found(&handle.name))?;
        if cluster.phase != Phase::Deleting {
            cluster.phase = Phase::Deleting;
            cluster.in_flight = self.settle_after;
            cluster.error = None;
        }
        Ok(())
    }

    async fn mutate(
        &self,
        handle: &ClusterHandle,
        change: &ClusterChange,
    ) -> Result<ClusterHandle, Error> {
        self.begin(Operation::Mutate, &handle.name).await?;
        let mut cluster = self
            .clusters
            .get_mut(&handle.name)
            .ok_or_else(|| Error::not_found(&handle.name))?;
        if cluster.phase == Phase::Deleting {
            return Err(Error::provider_permanent(
                &handle.name,
                PROVIDER,
                "cluster is being deleted",
            ));
        }
        let next = change.apply(&handle.name, &cluster.spec)?;
        if Self::switches_image_family(&cluster.spec, &next) {
            debug!(cluster = %handle.name, "Image family switch accepted, reporting failure");
            cluster.error = Some(InjectedError {
                message: IMAGE_FAMILY_ERROR.to_string(),
                clears_after: None,
            });
        }
        cluster.spec = next.clone();
        cluster.phase = Phase::Updating;
        cluster.in_flight = self.settle_after;
        Ok(handle.with_spec(next))
    }

    async fn fetch(&self, handle: &ClusterHandle) -> Result<Snapshot, Error> {
        self.begin(Operation::Fetch, &handle.name).await?;
        Ok(self.observe(handle))
    }
}
