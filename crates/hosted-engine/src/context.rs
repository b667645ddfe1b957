//! Per-workflow state passed to every step
//!
//! A [`WorkflowContext`] is built fresh for each scenario and owned by the
//! workflow running it. It holds the cluster identity, the driver, timing
//! settings, and the LIFO list of cleanup obligations registered by steps.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use hosted_common::names::cluster_name;
use hosted_common::retry::RetryConfig;
use hosted_common::{CleanupPolicy, E2eConfig, Error, PollSettings};

use crate::driver::ProviderDriver;
use crate::model::{ClusterHandle, Snapshot};
use crate::step::StepError;

type CleanupAction = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;

/// A deferred teardown action registered by a step
pub struct CleanupObligation {
    description: String,
    registered_by: String,
    action: CleanupAction,
}

impl CleanupObligation {
    /// What the obligation tears down
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Step that registered the obligation
    pub fn registered_by(&self) -> &str {
        &self.registered_by
    }

    /// Execute the teardown, consuming the obligation
    pub async fn run(self) -> Result<(), Error> {
        (self.action)().await
    }
}

impl fmt::Debug for CleanupObligation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupObligation")
            .field("description", &self.description)
            .field("registered_by", &self.registered_by)
            .finish()
    }
}

/// Explicit state for one workflow run
pub struct WorkflowContext {
    cluster_name: String,
    driver: Arc<dyn ProviderDriver>,
    cleanup: CleanupPolicy,
    poll: PollSettings,
    retry: RetryConfig,
    cancel: CancellationToken,
    deadline: Option<Duration>,
    handle: Option<ClusterHandle>,
    obligations: Vec<CleanupObligation>,
    artifacts: BTreeMap<String, String>,
    last_snapshot: Option<Snapshot>,
    current_step: String,
}

impl WorkflowContext {
    /// Context for the cluster `cluster_name`, using default timings
    pub fn new(cluster_name: impl Into<String>, driver: Arc<dyn ProviderDriver>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            driver,
            cleanup: CleanupPolicy::default(),
            poll: PollSettings::default(),
            retry: RetryConfig::default(),
            cancel: CancellationToken::new(),
            deadline: None,
            handle: None,
            obligations: Vec::new(),
            artifacts: BTreeMap::new(),
            last_snapshot: None,
            current_step: String::new(),
        }
    }

    /// Context with a cluster name generated for this run and the configured
    /// timings, cleanup policy, retry budget and scenario deadline
    pub fn from_config(config: &E2eConfig, driver: Arc<dyn ProviderDriver>) -> Self {
        let provider = driver.provider();
        if provider != config.provider.to_string() {
            warn!(
                configured = %config.provider,
                driver = %provider,
                "Driver does not match the configured provider"
            );
        }
        Self::new(cluster_name(&config.cluster_prefix, &config.run_id), driver)
            .with_cleanup(config.cleanup)
            .with_poll(config.poll)
            .with_retry(config.retry.clone())
            .with_deadline(config.scenario_timeout)
    }

    /// Set the cleanup policy
    pub fn with_cleanup(mut self, cleanup: CleanupPolicy) -> Self {
        self.cleanup = cleanup;
        self
    }

    /// Set poll timings
    pub fn with_poll(mut self, poll: PollSettings) -> Self {
        self.poll = poll;
        self
    }

    /// Set the retry budget for provider calls
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Use an externally owned cancellation token.
    ///
    /// Cancelling it aborts whatever workflow runs against this context. A
    /// workflow deadline never cancels it; each run works on a child token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Overall deadline for each workflow run against this context
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Locally generated cluster name
    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    /// Shared driver
    pub fn driver(&self) -> &Arc<dyn ProviderDriver> {
        &self.driver
    }

    /// Cleanup policy
    pub fn cleanup_policy(&self) -> CleanupPolicy {
        self.cleanup
    }

    /// Poll timings
    pub fn poll(&self) -> &PollSettings {
        &self.poll
    }

    /// Retry budget
    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }

    /// Token that aborts the current run when cancelled
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Swap in the token for one run, returning the previous one
    pub(crate) fn replace_cancellation(&mut self, cancel: CancellationToken) -> CancellationToken {
        std::mem::replace(&mut self.cancel, cancel)
    }

    /// Scenario deadline, if configured
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    /// Handle of the cluster under test, if one was created
    pub fn handle(&self) -> Option<&ClusterHandle> {
        self.handle.as_ref()
    }

    /// Handle of the cluster under test, or a precondition failure
    pub fn require_handle(&self) -> Result<ClusterHandle, StepError> {
        self.handle.clone().ok_or_else(|| {
            StepError::Precondition(format!("no cluster has been created for {}", self.cluster_name))
        })
    }

    /// Replace the handle (after create or mutate)
    pub fn set_handle(&mut self, handle: ClusterHandle) {
        self.handle = Some(handle);
    }

    /// Forget the handle (after the cluster is deleted)
    pub fn clear_handle(&mut self) -> Option<ClusterHandle> {
        self.handle.take()
    }

    /// Register a teardown action; obligations run last-registered first
    pub fn register_cleanup<F, Fut>(&mut self, description: impl Into<String>, action: F)
    where
        F: FnOnce() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        self.obligations.push(CleanupObligation {
            description: description.into(),
            registered_by: self.current_step.clone(),
            action: Box::new(move || action().boxed()),
        });
    }

    /// Number of obligations waiting to run
    pub fn pending_cleanups(&self) -> usize {
        self.obligations.len()
    }

    /// Pop the most recently registered obligation
    pub(crate) fn pop_cleanup(&mut self) -> Option<CleanupObligation> {
        self.obligations.pop()
    }

    /// Record a named artifact (e.g. a backup reference) for the report
    pub fn record_artifact(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.artifacts.insert(key.into(), value.into());
    }

    /// Look up a recorded artifact
    pub fn artifact(&self, key: &str) -> Option<&str> {
        self.artifacts.get(key).map(String::as_str)
    }

    /// All recorded artifacts
    pub fn artifacts(&self) -> &BTreeMap<String, String> {
        &self.artifacts
    }

    /// Remember the latest snapshot for diagnostics
    pub fn record_snapshot(&mut self, snapshot: Snapshot) {
        self.last_snapshot = Some(snapshot);
    }

    /// Latest snapshot recorded by a step
    pub fn last_snapshot(&self) -> Option<&Snapshot> {
        self.last_snapshot.as_ref()
    }

    pub(crate) fn enter_step(&mut self, step: &str) {
        self.current_step = step.to_string();
    }
}

impl fmt::Debug for WorkflowContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowContext")
            .field("cluster_name", &self.cluster_name)
            .field("provider", &self.driver.provider())
            .field("cleanup", &self.cleanup)
            .field("handle", &self.handle)
            .field("obligations", &self.obligations)
            .field("artifacts", &self.artifacts)
            .finish()
    }
}
