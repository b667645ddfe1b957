//! Sequential step execution with guaranteed cleanup
//!
//! A [`Workflow`] runs its steps in declared order on the caller's task. The
//! first failing step stops forward progress; whatever happened, every
//! cleanup obligation registered so far is then unwound last-in first-out
//! before the report is produced. Cleanup failures are collected next to the
//! primary failure and never replace it.
//!
//! Execution phases: `NotStarted -> Running -> CleaningUp -> {Completed | Aborted}`.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use hosted_common::CleanupPolicy;

use crate::context::WorkflowContext;
use crate::model::Snapshot;
use crate::step::{Step, StepError};

/// Where a workflow run is in its lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkflowPhase {
    /// Not yet run
    NotStarted,
    /// Executing forward steps
    Running,
    /// Unwinding cleanup obligations
    CleaningUp,
    /// Every step succeeded
    Completed,
    /// A step failed or the deadline passed
    Aborted,
}

impl fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotStarted => "NotStarted",
            Self::Running => "Running",
            Self::CleaningUp => "CleaningUp",
            Self::Completed => "Completed",
            Self::Aborted => "Aborted",
        };
        write!(f, "{}", name)
    }
}

/// A cleanup obligation that failed during unwind
#[derive(Debug, Clone, Error)]
#[error("cleanup '{obligation}' registered by step '{registered_by}' failed: {error}")]
pub struct CleanupError {
    /// Description of the obligation
    pub obligation: String,
    /// Step that registered it
    pub registered_by: String,
    /// Underlying error
    pub error: hosted_common::Error,
}

/// Outcome of a single step
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// Finished successfully
    Succeeded,
    /// Failed; the workflow aborted here
    Failed(String),
    /// Never started because an earlier step failed
    Skipped,
}

/// One step as it appears in the report
#[derive(Debug, Clone)]
pub struct StepRecord {
    /// Step name
    pub name: String,
    /// What happened
    pub outcome: StepOutcome,
    /// Time spent in the step
    pub elapsed: Duration,
    /// Cleanup obligations the step left behind
    pub cleanups_registered: usize,
}

/// The step that aborted a workflow
#[derive(Debug, Clone)]
pub struct StepFailure {
    /// Failing step name
    pub step: String,
    /// Why it failed
    pub error: StepError,
}

/// Everything known about one workflow run
#[derive(Debug, Clone)]
pub struct WorkflowReport {
    /// Workflow name
    pub workflow: String,
    /// Cluster the workflow ran against
    pub cluster: String,
    /// Final phase, `Completed` or `Aborted`
    pub phase: WorkflowPhase,
    /// Every phase passed through, in order
    pub transitions: Vec<WorkflowPhase>,
    /// Per-step records in declared order
    pub steps: Vec<StepRecord>,
    /// Primary failure, if any
    pub failure: Option<StepFailure>,
    /// Cleanup obligations that ran, in execution order
    pub cleanups_run: Vec<String>,
    /// Cleanup obligations left in place by a `Skip` policy
    pub cleanups_skipped: Vec<String>,
    /// Cleanup failures, reported next to the primary failure
    pub cleanup_errors: Vec<CleanupError>,
    /// Artifacts recorded by steps
    pub artifacts: BTreeMap<String, String>,
    /// Last snapshot observed, for diagnosis
    pub last_snapshot: Option<Snapshot>,
    /// Total wall-clock time
    pub elapsed: Duration,
}

impl WorkflowReport {
    /// Steps and cleanups all succeeded
    pub fn is_success(&self) -> bool {
        self.failure.is_none() && self.cleanup_errors.is_empty()
    }

    /// Turn the report into a result, keeping the primary failure first
    pub fn into_result(self) -> Result<WorkflowReport, WorkflowError> {
        if let Some(failure) = &self.failure {
            return Err(WorkflowError::Step {
                workflow: self.workflow.clone(),
                step: failure.step.clone(),
                source: failure.error.clone(),
                cleanup_errors: self.cleanup_errors.clone(),
            });
        }
        if !self.cleanup_errors.is_empty() {
            return Err(WorkflowError::Cleanup {
                workflow: self.workflow.clone(),
                errors: self.cleanup_errors.clone(),
            });
        }
        Ok(self)
    }

    /// Multi-line diagnosis: failing step, condition, last snapshot, cleanup errors
    pub fn summary(&self) -> String {
        let status = if self.is_success() { "PASS" } else { "FAIL" };
        let mut out = format!(
            "[{status}] {} on {} ({}, {:.1}s)",
            self.workflow,
            self.cluster,
            self.phase,
            self.elapsed.as_secs_f64()
        );
        if let Some(failure) = &self.failure {
            out.push_str(&format!("\n  failed step: {}", failure.step));
            out.push_str(&format!("\n  cause: {}", failure.error));
            if let Some(condition) = failure.error.condition() {
                out.push_str(&format!("\n  awaiting: {condition}"));
            }
        }
        if let Some(snapshot) = &self.last_snapshot {
            out.push_str(&format!("\n  last snapshot: {snapshot}"));
        }
        for err in &self.cleanup_errors {
            out.push_str(&format!("\n  cleanup error: {err}"));
        }
        for skipped in &self.cleanups_skipped {
            out.push_str(&format!("\n  cleanup skipped: {skipped}"));
        }
        for (key, value) in &self.artifacts {
            out.push_str(&format!("\n  artifact {key}: {value}"));
        }
        out
    }
}

/// A failed workflow
#[derive(Debug, Clone, Error)]
pub enum WorkflowError {
    /// A step failed; cleanup errors, if any, are attached
    #[error("workflow '{workflow}' failed at step '{step}': {source}{}", cleanup_suffix(.cleanup_errors))]
    Step {
        /// Workflow name
        workflow: String,
        /// Failing step
        step: String,
        /// Primary cause
        source: StepError,
        /// Secondary cleanup failures
        cleanup_errors: Vec<CleanupError>,
    },

    /// Every step succeeded but cleanup did not
    #[error("workflow '{workflow}' completed but cleanup failed{}", cleanup_suffix(.errors))]
    Cleanup {
        /// Workflow name
        workflow: String,
        /// Cleanup failures
        errors: Vec<CleanupError>,
    },
}

fn cleanup_suffix(errors: &[CleanupError]) -> String {
    if errors.is_empty() {
        return String::new();
    }
    let parts: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
    format!(" (cleanup errors: {})", parts.join("; "))
}

/// An ordered composition of steps
pub struct Workflow {
    name: String,
    steps: Vec<Box<dyn Step>>,
    deadline: Option<Duration>,
}

impl Workflow {
    /// Empty workflow named `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            deadline: None,
        }
    }

    /// Append a step
    pub fn step(mut self, step: impl Step + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    /// Append a boxed step
    pub fn boxed_step(mut self, step: Box<dyn Step>) -> Self {
        self.steps.push(step);
        self
    }

    /// Cancel in-flight polls and skip remaining steps once `deadline` passes.
    ///
    /// Takes precedence over the context's deadline.
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Workflow name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Step names in declared order
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Run every step, then unwind cleanup obligations.
    ///
    /// The run works on a child of the context's cancellation token, so its
    /// deadline cancels only this run. Cancelling the context's token still
    /// reaches every step. The context's own token is restored before the
    /// report is returned.
    ///
    /// Always returns a report; use [`WorkflowReport::into_result`] to turn a
    /// failed run into an error.
    pub async fn run(&self, ctx: &mut WorkflowContext) -> WorkflowReport {
        let run_token = ctx.cancellation().child_token();
        let parent = ctx.replace_cancellation(run_token.clone());
        let report = self.run_steps(ctx, run_token).await;
        ctx.replace_cancellation(parent);
        report
    }

    async fn run_steps(
        &self,
        ctx: &mut WorkflowContext,
        run_token: CancellationToken,
    ) -> WorkflowReport {
        let started = Instant::now();
        let mut transitions = vec![WorkflowPhase::NotStarted, WorkflowPhase::Running];
        let deadline = self.deadline.or_else(|| ctx.deadline());
        info!(
            workflow = %self.name,
            cluster = %ctx.cluster_name(),
            steps = self.steps.len(),
            deadline_secs = deadline.map(|d| d.as_secs()),
            "Workflow started"
        );

        // Dropping the guard stops the deadline timer when the run ends.
        let _deadline_guard =
            deadline.map(|deadline| spawn_deadline(deadline, run_token).drop_guard());

        let mut steps = Vec::with_capacity(self.steps.len());
        let mut failure = None;

        for step in &self.steps {
            if failure.is_some() {
                steps.push(StepRecord {
                    name: step.name().to_string(),
                    outcome: StepOutcome::Skipped,
                    elapsed: Duration::ZERO,
                    cleanups_registered: 0,
                });
                continue;
            }

            let step_started = Instant::now();
            let pending_before = ctx.pending_cleanups();
            let result = if ctx.cancellation().is_cancelled() {
                Err(StepError::Cancelled(format!(
                    "workflow deadline passed before step '{}'",
                    step.name()
                )))
            } else {
                ctx.enter_step(step.name());
                info!(workflow = %self.name, step = %step.name(), "Step started");
                step.run(ctx).await
            };
            let elapsed = step_started.elapsed();
            let cleanups_registered = ctx.pending_cleanups().saturating_sub(pending_before);
            if cleanups_registered > 0 && !step.registers_cleanup() {
                warn!(
                    workflow = %self.name,
                    step = %step.name(),
                    count = cleanups_registered,
                    "Step registered cleanup without declaring it"
                );
            }

            match result {
                Ok(()) => {
                    info!(
                        workflow = %self.name,
                        step = %step.name(),
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Step succeeded"
                    );
                    steps.push(StepRecord {
                        name: step.name().to_string(),
                        outcome: StepOutcome::Succeeded,
                        elapsed,
                        cleanups_registered,
                    });
                }
                Err(e) => {
                    error!(workflow = %self.name, step = %step.name(), error = %e, "Step failed");
                    steps.push(StepRecord {
                        name: step.name().to_string(),
                        outcome: StepOutcome::Failed(e.to_string()),
                        elapsed,
                        cleanups_registered,
                    });
                    failure = Some(StepFailure {
                        step: step.name().to_string(),
                        error: e,
                    });
                }
            }
        }

        transitions.push(WorkflowPhase::CleaningUp);
        let (cleanups_run, cleanups_skipped, cleanup_errors) = unwind(&self.name, ctx).await;

        let phase = if failure.is_some() {
            WorkflowPhase::Aborted
        } else {
            WorkflowPhase::Completed
        };
        transitions.push(phase);

        let report = WorkflowReport {
            workflow: self.name.clone(),
            cluster: ctx.cluster_name().to_string(),
            phase,
            transitions,
            steps,
            failure,
            cleanups_run,
            cleanups_skipped,
            cleanup_errors,
            artifacts: ctx.artifacts().clone(),
            last_snapshot: ctx.last_snapshot().cloned(),
            elapsed: started.elapsed(),
        };
        info!(
            workflow = %self.name,
            phase = %report.phase,
            success = report.is_success(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Workflow finished"
        );
        report
    }
}

/// Start a timer that cancels `cancel` after `deadline`; the returned token
/// stops the timer early
fn spawn_deadline(deadline: Duration, cancel: CancellationToken) -> CancellationToken {
    let stop = CancellationToken::new();
    let stopped = stop.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = stopped.cancelled() => {}
            _ = tokio::time::sleep(deadline) => {
                warn!(deadline_secs = deadline.as_secs(), "Workflow deadline passed, cancelling");
                cancel.cancel();
            }
        }
    });
    stop
}

/// Run every registered obligation, newest first, exactly once
async fn unwind(
    workflow: &str,
    ctx: &mut WorkflowContext,
) -> (Vec<String>, Vec<String>, Vec<CleanupError>) {
    let mut ran = Vec::new();
    let mut skipped = Vec::new();
    let mut errors = Vec::new();
    let policy = ctx.cleanup_policy();

    while let Some(obligation) = ctx.pop_cleanup() {
        let description = obligation.description().to_string();
        if policy == CleanupPolicy::Skip {
            info!(workflow = %workflow, cleanup = %description, "Cleanup skipped by policy");
            skipped.push(description);
            continue;
        }

        info!(workflow = %workflow, cleanup = %description, "Running cleanup");
        let registered_by = obligation.registered_by().to_string();
        ran.push(description.clone());
        if let Err(e) = obligation.run().await {
            error!(workflow = %workflow, cleanup = %description, error = %e, "Cleanup failed");
            errors.push(CleanupError {
                obligation: description,
                registered_by,
                error: e,
            });
        }
    }
    (ran, skipped, errors)
}
