//! Concurrent execution of independent scenarios
//!
//! Each scenario runs as its own tokio task with its own
//! [`WorkflowContext`], so one scenario waiting on a slow provider never
//! holds up another. Isolation comes from distinct cluster names; nothing is
//! shared between tasks except the driver.

use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{error, info};

use hosted_common::Error;

use crate::context::WorkflowContext;
use crate::workflow::{Workflow, WorkflowReport};

/// Runs scenarios concurrently and collects their reports
pub struct SuiteHarness {
    name: String,
    pending: Vec<(String, JoinHandle<WorkflowReport>)>,
    reports: Vec<WorkflowReport>,
    panicked: Vec<String>,
}

impl SuiteHarness {
    /// Empty suite named `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pending: Vec::new(),
            reports: Vec::new(),
            panicked: Vec::new(),
        }
    }

    /// Start `workflow` against `ctx` on a new task
    pub fn spawn(&mut self, workflow: Workflow, mut ctx: WorkflowContext) {
        let label = format!("{} ({})", workflow.name(), ctx.cluster_name());
        info!(suite = %self.name, scenario = %label, "Scenario scheduled");
        let handle = tokio::spawn(async move { workflow.run(&mut ctx).await });
        self.pending.push((label, handle));
    }

    /// Wait for every scheduled scenario
    pub async fn join(&mut self) -> &[WorkflowReport] {
        let (labels, handles): (Vec<_>, Vec<_>) = self.pending.drain(..).unzip();
        for (label, joined) in labels.into_iter().zip(join_all(handles).await) {
            match joined {
                Ok(report) => self.reports.push(report),
                Err(e) => {
                    error!(suite = %self.name, scenario = %label, error = %e, "Scenario task failed");
                    self.panicked.push(label);
                }
            }
        }
        &self.reports
    }

    /// Reports collected so far
    pub fn reports(&self) -> &[WorkflowReport] {
        &self.reports
    }

    /// One block per scenario plus a totals line
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for report in &self.reports {
            out.push_str(&report.summary());
            out.push('\n');
        }
        for label in &self.panicked {
            out.push_str(&format!("[FAIL] {label}: task panicked\n"));
        }
        let passed = self.reports.iter().filter(|r| r.is_success()).count();
        let total = self.reports.len() + self.panicked.len();
        out.push_str(&format!("{}: {passed}/{total} passed", self.name));
        out
    }

    /// Wait for everything, then fail if any scenario failed
    pub async fn finish(mut self) -> Result<Vec<WorkflowReport>, Error> {
        self.join().await;
        info!(suite = %self.name, "\n{}", self.summary());

        let mut failed: Vec<String> = self
            .reports
            .iter()
            .filter(|r| !r.is_success())
            .map(|r| r.workflow.clone())
            .collect();
        failed.extend(self.panicked.iter().cloned());

        if failed.is_empty() {
            Ok(self.reports)
        } else {
            Err(Error::internal(
                self.name.clone(),
                format!("{} scenario(s) failed: {}", failed.len(), failed.join(", ")),
            ))
        }
    }
}
