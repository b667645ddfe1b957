//! Units of work composed into workflows

use async_trait::async_trait;
use futures::future::BoxFuture;
use thiserror::Error;
use tracing::debug;

use hosted_common::{Error, PollConfig};

use crate::condition::Condition;
use crate::context::WorkflowContext;
use crate::drift::DriftError;
use crate::model::{ClusterHandle, Snapshot};
use crate::poller::{poll, PollError};

/// Why a step failed
#[derive(Debug, Clone, Error)]
pub enum StepError {
    /// A driver call returned an error
    #[error("provider call failed: {0}")]
    Provider(#[from] Error),

    /// Polling for convergence did not succeed
    #[error(transparent)]
    Poll(#[from] PollError),

    /// The converged spec does not match the requested one
    #[error(transparent)]
    Drift(#[from] DriftError),

    /// The workflow deadline passed before the step could run
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// An expectation about the outcome did not hold
    #[error("assertion failed: {0}")]
    Assertion(String),

    /// The context lacks something the step needs
    #[error("precondition failed: {0}")]
    Precondition(String),
}

impl StepError {
    /// Whether the failure came from cancellation rather than the cluster
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            StepError::Cancelled(_) | StepError::Poll(PollError::Cancelled { .. })
        )
    }

    /// Condition being awaited when the step failed, if it was polling
    pub fn condition(&self) -> Option<&str> {
        match self {
            StepError::Poll(e) => Some(e.condition()),
            _ => None,
        }
    }

    /// Last snapshot observed by a failing poll
    pub fn last_snapshot(&self) -> Option<&Snapshot> {
        match self {
            StepError::Poll(e) => e.last_snapshot(),
            _ => None,
        }
    }
}

/// A named unit of work run against a [`WorkflowContext`]
#[async_trait]
pub trait Step: Send + Sync {
    /// Name shown in logs and reports
    fn name(&self) -> &str;

    /// Whether the step may leave a cleanup obligation behind.
    ///
    /// The workflow counts the obligations each step registers and logs a
    /// warning when a step that returns `false` registers any.
    fn registers_cleanup(&self) -> bool {
        false
    }

    /// Perform the work
    async fn run(&self, ctx: &mut WorkflowContext) -> Result<(), StepError>;
}

type StepFn =
    dyn for<'a> Fn(&'a mut WorkflowContext) -> BoxFuture<'a, Result<(), StepError>> + Send + Sync;

/// A closure-backed step for scenario glue
///
/// ```ignore
/// FnStep::new("record marker", |ctx| {
///     async move {
///         ctx.record_artifact("marker", "ok");
///         Ok(())
///     }
///     .boxed()
/// })
/// ```
pub struct FnStep {
    name: String,
    registers_cleanup: bool,
    run: Box<StepFn>,
}

impl FnStep {
    /// Wrap `run` as a step named `name`
    pub fn new<F>(name: impl Into<String>, run: F) -> Self
    where
        F: for<'a> Fn(&'a mut WorkflowContext) -> BoxFuture<'a, Result<(), StepError>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            registers_cleanup: false,
            run: Box::new(run),
        }
    }

    /// Mark the step as registering cleanup obligations
    pub fn with_cleanup(mut self) -> Self {
        self.registers_cleanup = true;
        self
    }
}

#[async_trait]
impl Step for FnStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn registers_cleanup(&self) -> bool {
        self.registers_cleanup
    }

    async fn run(&self, ctx: &mut WorkflowContext) -> Result<(), StepError> {
        (self.run)(ctx).await
    }
}

/// Poll `condition` against fresh snapshots of `handle`.
///
/// Uses the context's driver and cancellation token, and records the last
/// snapshot seen (satisfying or not) for the workflow report.
pub async fn await_condition(
    ctx: &mut WorkflowContext,
    handle: &ClusterHandle,
    condition: &Condition,
    config: PollConfig,
) -> Result<Snapshot, StepError> {
    debug!(
        cluster = %handle.name,
        condition = %condition,
        timeout_secs = config.timeout.as_secs(),
        "Waiting for condition"
    );
    let driver = ctx.driver().clone();
    let cancel = ctx.cancellation().clone();
    let result = poll(|| driver.fetch(handle), condition, config, &cancel).await;
    match result {
        Ok(snapshot) => {
            ctx.record_snapshot(snapshot.clone());
            Ok(snapshot)
        }
        Err(e) => {
            if let Some(snapshot) = e.last_snapshot() {
                ctx.record_snapshot(snapshot.clone());
            }
            Err(e.into())
        }
    }
}
