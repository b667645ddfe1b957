//! Backup and restore of the management plane around a live cluster
//!
//! The workflow proves that a cluster imported before a backup is still
//! managed after the management runtime is torn down and restored: it must
//! come back Active and keep accepting mutations.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

#[cfg(test)]
use mockall::automock;

use hosted_common::retry::retry_with_backoff;
use hosted_common::Error;

use crate::context::WorkflowContext;
use crate::model::ClusterChange;
use crate::state;
use crate::step::{Step, StepError};
use crate::steps::{AwaitCondition, Budget, MutateCluster};
use crate::workflow::{Workflow, WorkflowReport};

/// Artifact key under which the backup file is recorded
pub const BACKUP_ARTIFACT: &str = "backup";

/// Reference to a completed backup
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BackupArtifact {
    /// Backup resource name
    pub name: String,
    /// Location of the backup file
    pub file: String,
    /// When the backup completed
    pub created_at: DateTime<Utc>,
}

/// Operations on the management runtime itself
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BackupOperator: Send + Sync {
    /// Take a backup named `name`
    async fn backup(&self, name: &str) -> Result<BackupArtifact, Error>;

    /// Remove the management runtime from the local cluster
    async fn uninstall_runtime(&self) -> Result<(), Error>;

    /// Install the management runtime again
    async fn install_runtime(&self) -> Result<(), Error>;

    /// Restore the backup `name` from `artifact`
    async fn restore(&self, name: &str, artifact: &BackupArtifact) -> Result<(), Error>;

    /// Reinstall services that depend on the runtime (e.g. provider operators)
    async fn install_dependent_services(&self) -> Result<(), Error>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Action {
    Backup,
    UninstallRuntime,
    InstallRuntime,
    Restore,
    InstallDependents,
}

impl Action {
    fn step_name(self) -> &'static str {
        match self {
            Action::Backup => "snapshot-backup",
            Action::UninstallRuntime => "uninstall-local-runtime",
            Action::InstallRuntime => "reinstall-local-runtime",
            Action::Restore => "restore-from-backup",
            Action::InstallDependents => "reinstall-dependent-services",
        }
    }
}

struct OperatorStep {
    action: Action,
    operator: Arc<dyn BackupOperator>,
    backup_name: String,
}

impl OperatorStep {
    fn new(action: Action, operator: &Arc<dyn BackupOperator>, backup_name: &str) -> Self {
        Self {
            action,
            operator: operator.clone(),
            backup_name: backup_name.to_string(),
        }
    }
}

#[async_trait]
impl Step for OperatorStep {
    fn name(&self) -> &str {
        self.action.step_name()
    }

    async fn run(&self, ctx: &mut WorkflowContext) -> Result<(), StepError> {
        let retry = ctx.retry().clone();
        let op = &self.operator;
        let name = self.action.step_name();

        match self.action {
            Action::Backup => {
                let artifact =
                    retry_with_backoff(&retry, name, || op.backup(&self.backup_name)).await?;
                info!(backup = %artifact.name, file = %artifact.file, "Backup completed");
                ctx.record_artifact(BACKUP_ARTIFACT, artifact.file.clone());
                ctx.record_artifact(format!("{BACKUP_ARTIFACT}.name"), artifact.name.clone());
                ctx.record_artifact(
                    format!("{BACKUP_ARTIFACT}.created_at"),
                    artifact.created_at.to_rfc3339(),
                );
            }
            Action::UninstallRuntime => {
                retry_with_backoff(&retry, name, || op.uninstall_runtime()).await?;
            }
            Action::InstallRuntime => {
                retry_with_backoff(&retry, name, || op.install_runtime()).await?;
            }
            Action::Restore => {
                let artifact = recorded_artifact(ctx)?;
                retry_with_backoff(&retry, name, || op.restore(&self.backup_name, &artifact))
                    .await?;
                info!(backup = %artifact.name, "Restore completed");
            }
            Action::InstallDependents => {
                retry_with_backoff(&retry, name, || op.install_dependent_services()).await?;
            }
        }
        Ok(())
    }
}

fn recorded_artifact(ctx: &WorkflowContext) -> Result<BackupArtifact, StepError> {
    let missing = || StepError::Precondition("no backup artifact was recorded".to_string());
    let file = ctx.artifact(BACKUP_ARTIFACT).ok_or_else(missing)?;
    let name = ctx
        .artifact(&format!("{BACKUP_ARTIFACT}.name"))
        .ok_or_else(missing)?;
    let created_at = ctx
        .artifact(&format!("{BACKUP_ARTIFACT}.created_at"))
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|ts| ts.with_timezone(&Utc))
        .ok_or_else(missing)?;
    Ok(BackupArtifact {
        name: name.to_string(),
        file: file.to_string(),
        created_at,
    })
}

/// The fixed backup/restore step sequence ending with `change` applied and
/// verified on the restored cluster
pub fn backup_restore_workflow(
    operator: Arc<dyn BackupOperator>,
    backup_name: &str,
    change: ClusterChange,
) -> Workflow {
    Workflow::new(format!("backup and restore {backup_name}"))
        .step(AwaitCondition::new(state::is_active(), Budget::Ready).named("verify-ready"))
        .step(OperatorStep::new(Action::Backup, &operator, backup_name))
        .step(OperatorStep::new(Action::UninstallRuntime, &operator, backup_name))
        .step(OperatorStep::new(Action::InstallRuntime, &operator, backup_name))
        .step(OperatorStep::new(Action::Restore, &operator, backup_name))
        .step(OperatorStep::new(Action::InstallDependents, &operator, backup_name))
        .step(AwaitCondition::new(state::is_active(), Budget::Ready).named("verify-ready"))
        .step(MutateCluster::new(change).named("mutate-and-verify"))
}

/// Result of a backup/restore run
#[derive(Debug, Clone)]
pub struct BackupRestoreOutcome {
    /// Full workflow report
    pub report: WorkflowReport,
    /// Backup file, present whenever the backup step succeeded
    pub artifact: Option<String>,
}

impl BackupRestoreOutcome {
    /// Whether every step and cleanup succeeded
    pub fn is_success(&self) -> bool {
        self.report.is_success()
    }
}

/// Run the backup/restore workflow against the cluster in `ctx`
pub async fn backup_and_restore(
    ctx: &mut WorkflowContext,
    operator: Arc<dyn BackupOperator>,
    backup_name: &str,
    change: ClusterChange,
) -> BackupRestoreOutcome {
    let report = backup_restore_workflow(operator, backup_name, change)
        .run(ctx)
        .await;
    let artifact = report.artifacts.get(BACKUP_ARTIFACT).cloned();
    BackupRestoreOutcome { report, artifact }
}
