//! Guarantees every workflow keeps, whatever the scenario
//!
//! What these tests verify:
//! - A failing step aborts the run and every earlier teardown runs once
//! - A teardown failure is reported next to the primary failure, never
//!   instead of it
//! - A condition that can no longer hold stops polling on the spot
//! - A provider that never converges is reported as drift
//! - The scenario deadline cancels the run but not its teardown
//! - Configuration drives naming, timings and the cleanup policy
//! - Throttled provider calls are retried

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;

use hosted_common::config::{
    ENV_CLUSTER_CLEANUP, ENV_POLL_INTERVAL, ENV_PROVIDER, ENV_READY_TIMEOUT, ENV_RUN_ID,
    ENV_SCENARIO_TIMEOUT,
};
use hosted_common::retry::RetryConfig;
use hosted_common::{E2eConfig, Error, PollConfig, PollSettings};
use hosted_engine::driver::fake::{FakeDriver, Operation};
use hosted_engine::model::ClusterChange;
use hosted_engine::scenarios;
use hosted_engine::steps::{CreateCluster, MutateCluster, VerifyConverged};
use hosted_engine::workflow::StepOutcome;
use hosted_engine::{
    drift, FnStep, PollError, StepError, Workflow, WorkflowContext, WorkflowError,
    WorkflowPhase,
};

use super::helpers::{context, sample_spec, settings};

// =============================================================================
// Test Fixtures
// =============================================================================

fn scale(group: &str, desired_size: u32) -> ClusterChange {
    ClusterChange::ScaleNodeGroup {
        group: group.into(),
        desired_size,
    }
}

/// Create, then a change the provider refuses, then a verify that never runs
fn doomed_workflow() -> Workflow {
    Workflow::new("doomed")
        .step(CreateCluster::new(sample_spec()))
        .step(MutateCluster::new(scale("ghost", 3)))
        .step(VerifyConverged::new(vec![drift::NODE_GROUPS.into()]))
}

// =============================================================================
// Cleanup Stories
// =============================================================================

/// Story: A failed mutation still tears the cluster down exactly once
///
/// The second step is refused by the provider. The third is never started,
/// and the delete registered by the create runs once before the report is
/// returned.
#[tokio::test(start_paused = true)]
async fn story_failed_step_unwinds_earlier_cleanup_once() {
    let driver = Arc::new(FakeDriver::new(1));
    let mut ctx = context("guarantee-unwind", &driver);

    let report = doomed_workflow().run(&mut ctx).await;

    assert_eq!(report.phase, WorkflowPhase::Aborted);
    assert_eq!(
        report.transitions,
        vec![
            WorkflowPhase::NotStarted,
            WorkflowPhase::Running,
            WorkflowPhase::CleaningUp,
            WorkflowPhase::Aborted
        ]
    );
    let failure = report.failure.as_ref().expect("mutation must fail");
    assert_eq!(failure.step, "mutate: scale node group ghost to 3");
    assert!(matches!(failure.error, StepError::Provider(_)));
    assert!(matches!(report.steps[2].outcome, StepOutcome::Skipped));
    assert_eq!(report.cleanups_run, vec!["delete cluster guarantee-unwind"]);
    assert_eq!(driver.count(Operation::Delete), 1);
    assert!(!driver.contains("guarantee-unwind"));
}

/// Story: A teardown failure never hides why the scenario failed
#[tokio::test(start_paused = true)]
async fn story_cleanup_error_is_reported_beside_primary_failure() {
    let driver = Arc::new(FakeDriver::new(1));
    driver.fail_next(
        Operation::Delete,
        Error::provider_permanent("guarantee-mask", "fake", "AccessDenied: iam:DeleteRole"),
    );
    let mut ctx = context("guarantee-mask", &driver);

    let report = doomed_workflow().run(&mut ctx).await;
    assert_eq!(report.cleanup_errors.len(), 1);
    assert!(driver.contains("guarantee-mask"), "failed teardown leaves the cluster");

    match report.into_result() {
        Err(WorkflowError::Step {
            step,
            cleanup_errors,
            ..
        }) => {
            assert_eq!(step, "mutate: scale node group ghost to 3");
            assert_eq!(cleanup_errors.len(), 1);
            assert!(cleanup_errors[0].to_string().contains("AccessDenied"));
        }
        other => panic!("expected the step failure first, got {other:?}"),
    }
}

/// Story: With cleanup disabled, clusters are left for inspection
///
/// Configuration comes from the same lookup the environment loader uses.
/// The generated cluster name carries the default prefix and the run ID.
#[tokio::test(start_paused = true)]
async fn story_config_skip_policy_leaves_cluster_in_place() {
    let config = E2eConfig::from_lookup(|key| match key {
        k if k == ENV_RUN_ID => Some("ci-4711".to_string()),
        k if k == ENV_PROVIDER => Some("fake".to_string()),
        k if k == ENV_CLUSTER_CLEANUP => Some("false".to_string()),
        k if k == ENV_POLL_INTERVAL => Some("1".to_string()),
        k if k == ENV_READY_TIMEOUT => Some("60".to_string()),
        _ => None,
    })
    .expect("valid configuration");
    let driver = Arc::new(FakeDriver::new(1));
    let mut ctx = WorkflowContext::from_config(&config, driver.clone());
    let name = ctx.cluster_name().to_string();
    assert!(name.starts_with("auto-hp-ci-ci-4711-"), "{name}");

    let report = scenarios::update_logging_and_tags(sample_spec())
        .run(&mut ctx)
        .await;

    assert!(report.is_success(), "{}", report.summary());
    assert!(report.cleanups_run.is_empty());
    assert_eq!(report.cleanups_skipped.len(), 1);
    assert!(driver.contains(&name));
}

// =============================================================================
// Polling Stories
// =============================================================================

/// Story: A cluster that errors during provisioning fails on the first look
///
/// No budget is spent waiting for a state the cluster can no longer reach.
#[tokio::test(start_paused = true)]
async fn story_provisioning_error_fails_without_further_fetches() {
    let driver = Arc::new(FakeDriver::new(5));
    driver.inject_error("guarantee-fail-fast", "InvalidParameterException: bad subnet", None);
    let mut ctx = context("guarantee-fail-fast", &driver);

    let report = Workflow::new("fail fast")
        .step(CreateCluster::new(sample_spec()))
        .run(&mut ctx)
        .await;

    let failure = report.failure.as_ref().expect("create must fail");
    assert!(matches!(
        failure.error,
        StepError::Poll(PollError::ConditionFailed { attempts: 1, .. })
    ));
    // One fetch for the create wait, then the teardown's own polling
    let fetches_before_teardown = driver
        .calls()
        .iter()
        .take_while(|c| c.operation != Operation::Delete)
        .filter(|c| c.operation == Operation::Fetch)
        .count();
    assert_eq!(fetches_before_teardown, 1);
    assert!(!driver.contains("guarantee-fail-fast"));
}

/// Story: A provider that accepts a change but never converges reports drift
#[tokio::test(start_paused = true)]
async fn story_stuck_convergence_is_reported_as_drift() {
    let driver = Arc::new(FakeDriver::new(1));
    let mut ctx = context("guarantee-drift", &driver).with_poll(PollSettings {
        mutation: PollConfig::new(Duration::from_secs(20), Duration::from_secs(1)),
        ..settings()
    });

    let freeze = driver.clone();
    let report = Workflow::new("stuck convergence")
        .step(CreateCluster::new(sample_spec()))
        .step(FnStep::new("freeze upstream", move |ctx: &mut WorkflowContext| {
            freeze.freeze_upstream(ctx.cluster_name());
            async { Ok(()) }.boxed()
        }))
        .step(MutateCluster::new(scale("workers", 5)))
        .run(&mut ctx)
        .await;

    let failure = report.failure.as_ref().expect("mutation must drift");
    assert!(matches!(failure.error, StepError::Drift(_)), "{}", failure.error);
    assert!(failure.error.to_string().contains("nodeGroups"));
}

// =============================================================================
// Deadline and Retry Stories
// =============================================================================

/// Story: The scenario deadline cancels a slow wait but not the teardown
#[tokio::test(start_paused = true)]
async fn story_deadline_cancels_wait_and_still_tears_down() {
    let driver = Arc::new(FakeDriver::new(100));
    let mut ctx = context("guarantee-deadline", &driver).with_poll(PollSettings {
        delete: PollConfig::new(Duration::from_secs(600), Duration::from_secs(1)),
        ..settings()
    });

    let report = scenarios::provision_and_verify(sample_spec())
        .with_deadline(Some(Duration::from_secs(30)))
        .run(&mut ctx)
        .await;

    assert_eq!(report.phase, WorkflowPhase::Aborted);
    let failure = report.failure.as_ref().expect("deadline must abort");
    assert_eq!(failure.step, "create cluster");
    assert!(failure.error.is_cancelled(), "{}", failure.error);
    assert_eq!(report.cleanups_run.len(), 1);
    assert!(report.cleanup_errors.is_empty());
    assert!(!driver.contains("guarantee-deadline"));
}

/// Story: The configured scenario timeout bounds a workflow without its own
///
/// The timeout reaches the run through the context, so a library scenario
/// needs no deadline of its own to be cut short.
#[tokio::test(start_paused = true)]
async fn story_configured_scenario_timeout_aborts_the_run() {
    let config = E2eConfig::from_lookup(|key| match key {
        k if k == ENV_PROVIDER => Some("fake".to_string()),
        k if k == ENV_SCENARIO_TIMEOUT => Some("30".to_string()),
        k if k == ENV_POLL_INTERVAL => Some("1".to_string()),
        _ => None,
    })
    .expect("valid configuration");
    let driver = Arc::new(FakeDriver::new(100));
    let mut ctx = WorkflowContext::from_config(&config, driver.clone())
        .with_retry(RetryConfig::no_retry());
    let name = ctx.cluster_name().to_string();

    let report = scenarios::provision_and_verify(sample_spec())
        .run(&mut ctx)
        .await;

    let failure = report.failure.as_ref().expect("timeout must abort");
    assert!(failure.error.is_cancelled(), "{}", failure.error);
    assert_eq!(failure.step, "create cluster");
    assert!(report.elapsed >= Duration::from_secs(30));
    assert!(!driver.contains(&name));
    assert!(!ctx.cancellation().is_cancelled());
}

/// Story: A throttled create is retried and the scenario proceeds
#[tokio::test(start_paused = true)]
async fn story_throttled_create_is_retried() {
    let driver = Arc::new(FakeDriver::new(1));
    driver.fail_next(
        Operation::Create,
        Error::rate_limited("guarantee-throttle", "fake"),
    );
    let mut ctx =
        context("guarantee-throttle", &driver).with_retry(RetryConfig::with_max_attempts(3));

    let report = scenarios::provision_and_verify(sample_spec())
        .run(&mut ctx)
        .await;

    assert!(report.is_success(), "{}", report.summary());
    assert_eq!(driver.count(Operation::Create), 2);
}

/// Story: Without retries the same throttle fails the create step
#[tokio::test(start_paused = true)]
async fn story_throttle_without_retry_fails_create() {
    let driver = Arc::new(FakeDriver::new(1));
    driver.fail_next(
        Operation::Create,
        Error::rate_limited("guarantee-no-retry", "fake"),
    );
    let mut ctx = context("guarantee-no-retry", &driver);

    let report = scenarios::provision_and_verify(sample_spec())
        .run(&mut ctx)
        .await;

    let failure = report.failure.as_ref().expect("create must fail");
    assert_eq!(failure.step, "create cluster");
    assert!(report.cleanups_run.is_empty(), "nothing was created");
}
