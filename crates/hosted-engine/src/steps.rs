//! Built-in lifecycle steps
//!
//! Every step that issues a provider call goes through
//! [`retry_with_backoff`], so throttling is absorbed while permanent errors
//! surface on the first attempt. A step whose provider call fails never polls
//! and never registers cleanup.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use hosted_common::retry::{retry_with_backoff, RetryConfig};
use hosted_common::{Error, PollConfig, PollSettings};

use crate::condition::Condition;
use crate::context::WorkflowContext;
use crate::drift::{self, FieldPath};
use crate::driver::ProviderDriver;
use crate::model::{ClusterChange, ClusterHandle, ClusterSpec};
use crate::poller::{poll, PollError};
use crate::state;
use crate::step::{await_condition, Step, StepError};

/// Which configured timeout a wait uses
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Budget {
    /// Waiting for a new cluster to become active
    Ready,
    /// Waiting for a mutation to converge
    Mutation,
    /// Waiting for a cluster to disappear
    Delete,
    /// Waiting for an expected error to show up
    Error,
    /// An explicit timeout and interval
    Custom(PollConfig),
}

impl Budget {
    fn resolve(self, settings: &PollSettings) -> PollConfig {
        match self {
            Budget::Ready => settings.ready,
            Budget::Mutation => settings.mutation,
            Budget::Delete => settings.delete,
            Budget::Error => settings.error,
            Budget::Custom(config) => config,
        }
    }
}

/// Delete a cluster and wait until the management plane no longer knows it.
///
/// A cluster that is already gone counts as deleted, so the same obligation
/// can safely follow an explicit delete step.
pub async fn delete_and_wait(
    driver: Arc<dyn ProviderDriver>,
    handle: ClusterHandle,
    retry: RetryConfig,
    config: PollConfig,
) -> Result<(), Error> {
    let deleted = retry_with_backoff(&retry, "delete cluster", || driver.delete(&handle)).await;
    match deleted {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {
            debug!(cluster = %handle.name, "Cluster already deleted");
            return Ok(());
        }
        Err(e) => return Err(e),
    }

    // Teardown runs to completion even after the workflow deadline.
    let never = CancellationToken::new();
    poll(|| driver.fetch(&handle), &state::is_deleted(), config, &never)
        .await
        .map(|_| ())
        .map_err(|e: PollError| {
            Error::provider_for(&handle.name, driver.provider(), format!("cluster not deleted: {e}"))
        })
}

/// Create the cluster under test, register its teardown, and wait for it to
/// become active
pub struct CreateCluster {
    name: String,
    spec: ClusterSpec,
    wait: bool,
    retry: bool,
}

impl CreateCluster {
    /// Create with `spec` under the context's cluster name
    pub fn new(spec: ClusterSpec) -> Self {
        Self {
            name: "create cluster".to_string(),
            spec,
            wait: true,
            retry: true,
        }
    }

    /// Import an existing provider cluster; the first error is surfaced as is
    pub fn import(spec: ClusterSpec) -> Self {
        Self {
            name: "import cluster".to_string(),
            spec,
            wait: true,
            retry: false,
        }
    }

    /// Return once the create call is accepted, without waiting for Active
    pub fn without_wait(mut self) -> Self {
        self.wait = false;
        self
    }

    /// Override the step name
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl Step for CreateCluster {
    fn name(&self) -> &str {
        &self.name
    }

    fn registers_cleanup(&self) -> bool {
        true
    }

    async fn run(&self, ctx: &mut WorkflowContext) -> Result<(), StepError> {
        let name = ctx.cluster_name().to_string();
        let driver = ctx.driver().clone();
        let retry = if self.retry {
            ctx.retry().clone()
        } else {
            RetryConfig::no_retry()
        };

        let handle =
            retry_with_backoff(&retry, &self.name, || driver.create(&name, &self.spec)).await?;
        info!(cluster = %name, id = %handle.id, provider = %driver.provider(), "Cluster create accepted");
        ctx.set_handle(handle.clone());

        let teardown = handle.clone();
        let delete = ctx.poll().delete;
        let retry = ctx.retry().clone();
        ctx.register_cleanup(format!("delete cluster {name}"), move || {
            delete_and_wait(driver, teardown, retry, delete)
        });

        if self.wait {
            let ready = ctx.poll().ready;
            await_condition(ctx, &handle, &state::is_active(), ready).await?;
            info!(cluster = %name, "Cluster is active");
        }
        Ok(())
    }
}

/// Fields a change is expected to touch, used when no explicit list is given
pub fn changed_fields(change: &ClusterChange) -> Vec<FieldPath> {
    match change {
        ClusterChange::ScaleNodeGroup { group, .. } => {
            vec![FieldPath::node_group(group, "desiredSize")]
        }
        ClusterChange::UpgradeControlPlane { .. } => vec![drift::KUBERNETES_VERSION.into()],
        ClusterChange::UpgradeNodeGroups { .. } | ClusterChange::RemoveNodeGroup { .. } => {
            vec![drift::NODE_GROUPS.into()]
        }
        ClusterChange::AddNodeGroup(group) => {
            vec![FieldPath::new(format!("{}[{}]", drift::NODE_GROUPS, group.name))]
        }
        ClusterChange::UpdateLogging { .. } => vec![drift::LOGGING_TYPES.into()],
        ClusterChange::UpdateTags { .. } => vec![drift::TAGS.into(), drift::LABELS.into()],
        ClusterChange::UpdateServices {
            logging,
            monitoring,
        } => {
            let mut fields: Vec<FieldPath> = Vec::new();
            if logging.is_some() {
                fields.push(drift::LOGGING_SERVICE.into());
            }
            if monitoring.is_some() {
                fields.push(drift::MONITORING_SERVICE.into());
            }
            fields
        }
        ClusterChange::UpdateEndpointAccess { .. } => {
            vec![drift::PUBLIC_ACCESS.into(), drift::PRIVATE_ACCESS.into()]
        }
        ClusterChange::UpdateAutoscaling { group, .. } => match group {
            Some(group) => vec![FieldPath::node_group(group, "autoscaling")],
            None => vec![drift::NODE_GROUPS.into()],
        },
        ClusterChange::UpdateImageType { group, .. } => match group {
            Some(group) => vec![FieldPath::node_group(group, "imageType")],
            None => vec![drift::NODE_GROUPS.into()],
        },
        ClusterChange::Replace(_) => vec![
            drift::KUBERNETES_VERSION.into(),
            drift::NODE_GROUPS.into(),
            drift::LOGGING_TYPES.into(),
            drift::TAGS.into(),
            drift::LABELS.into(),
            drift::PUBLIC_ACCESS.into(),
            drift::PRIVATE_ACCESS.into(),
        ],
    }
}

/// Apply a change and wait for the provider to converge on it
pub struct MutateCluster {
    name: String,
    change: ClusterChange,
    fields: Vec<FieldPath>,
    wait: bool,
    tolerated: Vec<String>,
}

impl MutateCluster {
    /// Apply `change`, verifying the fields it touches
    pub fn new(change: ClusterChange) -> Self {
        Self {
            name: format!("mutate: {change}"),
            fields: changed_fields(&change),
            change,
            wait: true,
            tolerated: Vec::new(),
        }
    }

    /// Verify these fields instead of the ones derived from the change
    pub fn verifying(mut self, fields: Vec<FieldPath>) -> Self {
        self.fields = fields;
        self
    }

    /// Issue the change without waiting for convergence
    pub fn no_wait(mut self) -> Self {
        self.wait = false;
        self
    }

    /// Keep polling through transitioning errors containing `substring`
    pub fn tolerating(mut self, substring: impl Into<String>) -> Self {
        self.tolerated.push(substring.into());
        self
    }

    /// Override the step name
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl Step for MutateCluster {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &mut WorkflowContext) -> Result<(), StepError> {
        let handle = ctx.require_handle()?;
        let driver = ctx.driver().clone();
        let retry = ctx.retry().clone();

        let updated =
            retry_with_backoff(&retry, &self.name, || driver.mutate(&handle, &self.change)).await?;
        info!(cluster = %updated.name, change = %self.change, "Mutation accepted");
        ctx.set_handle(updated.clone());

        if !self.wait {
            return Ok(());
        }

        let mut converged = state::is_active().and(state::upstream_converged(
            updated.spec.clone(),
            self.fields.clone(),
        ));
        if !self.tolerated.is_empty() {
            converged = converged.tolerating(self.tolerated.clone());
        }

        let budget = ctx.poll().mutation;
        match await_condition(ctx, &updated, &converged, budget).await {
            Ok(_) => {
                info!(cluster = %updated.name, change = %self.change, "Mutation converged");
                Ok(())
            }
            Err(err) => {
                // Settled but still different: report which field never converged
                if let StepError::Poll(PollError::Timeout {
                    last_snapshot: Some(snapshot),
                    ..
                }) = &err
                {
                    if state::is_active().evaluate(snapshot).is_satisfied() {
                        drift::check_snapshot(&updated.spec, snapshot, &self.fields)?;
                    }
                }
                Err(err)
            }
        }
    }
}

/// What a rejected operation attempts
#[derive(Clone, Debug)]
pub enum Rejected {
    /// Create a cluster; `name` defaults to the context's cluster name
    Create {
        /// Override for the cluster name
        name: Option<String>,
        /// Spec to create
        spec: ClusterSpec,
    },
    /// Mutate the cluster under test
    Mutate(ClusterChange),
}

/// An operation that must fail synchronously with a matching error
pub struct ExpectRejected {
    name: String,
    operation: Rejected,
    expected: String,
}

impl ExpectRejected {
    /// Expect `operation` to fail with an error containing `expected`
    pub fn new(operation: Rejected, expected: impl Into<String>) -> Self {
        let expected = expected.into();
        let name = match &operation {
            Rejected::Create { .. } => format!("create rejected with {expected:?}"),
            Rejected::Mutate(change) => format!("{change} rejected with {expected:?}"),
        };
        Self {
            name,
            operation,
            expected,
        }
    }
}

#[async_trait]
impl Step for ExpectRejected {
    fn name(&self) -> &str {
        &self.name
    }

    fn registers_cleanup(&self) -> bool {
        matches!(self.operation, Rejected::Create { .. })
    }

    async fn run(&self, ctx: &mut WorkflowContext) -> Result<(), StepError> {
        let driver = ctx.driver().clone();
        let retry = ctx.retry().clone();

        let outcome = match &self.operation {
            Rejected::Create { name, spec } => {
                let name = name.clone().unwrap_or_else(|| ctx.cluster_name().to_string());
                let created =
                    retry_with_backoff(&retry, &self.name, || driver.create(&name, spec)).await;
                match created {
                    Ok(handle) => {
                        // Not supposed to exist; make sure it does not outlive the run.
                        let delete = ctx.poll().delete;
                        let teardown = driver.clone();
                        ctx.register_cleanup(format!("delete unexpected cluster {name}"), move || {
                            delete_and_wait(teardown, handle, retry, delete)
                        });
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            Rejected::Mutate(change) => {
                let handle = ctx.require_handle()?;
                let mutated =
                    retry_with_backoff(&retry, &self.name, || driver.mutate(&handle, change))
                        .await;
                mutated.map(|_| ())
            }
        };

        match outcome {
            Ok(()) => Err(StepError::Assertion(format!(
                "operation succeeded, expected an error containing {:?}",
                self.expected
            ))),
            Err(e) if e.to_string().contains(self.expected.as_str()) => {
                info!(error = %e, "Operation rejected as expected");
                Ok(())
            }
            Err(e) => Err(StepError::Assertion(format!(
                "expected an error containing {:?}, got: {e}",
                self.expected
            ))),
        }
    }
}

/// Poll an arbitrary condition against the cluster under test
pub struct AwaitCondition {
    name: String,
    condition: Condition,
    budget: Budget,
}

impl AwaitCondition {
    /// Wait for `condition` within `budget`
    pub fn new(condition: Condition, budget: Budget) -> Self {
        Self {
            name: format!("await {condition}"),
            condition,
            budget,
        }
    }

    /// Override the step name
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl Step for AwaitCondition {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &mut WorkflowContext) -> Result<(), StepError> {
        let handle = ctx.require_handle()?;
        let config = self.budget.resolve(ctx.poll());
        await_condition(ctx, &handle, &self.condition, config).await?;
        Ok(())
    }
}

/// Fetch fresh state and compare the converged spec on `fields`
pub struct VerifyConverged {
    fields: Vec<FieldPath>,
}

impl VerifyConverged {
    /// Verify the listed fields
    pub fn new(fields: Vec<FieldPath>) -> Self {
        Self { fields }
    }
}

#[async_trait]
impl Step for VerifyConverged {
    fn name(&self) -> &str {
        "verify converged"
    }

    async fn run(&self, ctx: &mut WorkflowContext) -> Result<(), StepError> {
        let handle = ctx.require_handle()?;
        let snapshot = ctx.driver().fetch(&handle).await?;
        ctx.record_snapshot(snapshot.clone());
        drift::check_snapshot(&handle.spec, &snapshot, &self.fields)?;
        Ok(())
    }
}

/// Delete the cluster under test and wait until it is gone
pub struct DeleteCluster {
    wait: bool,
}

impl Default for DeleteCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl DeleteCluster {
    /// Delete and wait for the not-found sentinel
    pub fn new() -> Self {
        Self { wait: true }
    }

    /// Return once the delete is accepted; the handle stays set so later
    /// steps can watch the deletion
    pub fn without_wait(mut self) -> Self {
        self.wait = false;
        self
    }
}

#[async_trait]
impl Step for DeleteCluster {
    fn name(&self) -> &str {
        if self.wait {
            "delete cluster"
        } else {
            "start cluster delete"
        }
    }

    async fn run(&self, ctx: &mut WorkflowContext) -> Result<(), StepError> {
        let handle = ctx.require_handle()?;
        let driver = ctx.driver().clone();
        let retry = ctx.retry().clone();

        match retry_with_backoff(&retry, "delete cluster", || driver.delete(&handle)).await {
            Ok(()) => info!(cluster = %handle.name, "Cluster delete accepted"),
            Err(e) if e.is_not_found() => debug!(cluster = %handle.name, "Cluster already gone"),
            Err(e) => return Err(e.into()),
        }
        if !self.wait {
            return Ok(());
        }

        let budget = ctx.poll().delete;
        await_condition(ctx, &handle, &state::is_deleted(), budget).await?;
        ctx.clear_handle();
        info!(cluster = %handle.name, "Cluster deleted");
        Ok(())
    }
}
