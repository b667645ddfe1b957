//! Stories for the scenario library
//!
//! Each story runs one library scenario from start to finish against the
//! fake provider and checks what a suite author would look for in the
//! report: every step passed, the cluster was torn down, and the provider
//! saw the calls the scenario claims to make.

use std::sync::Arc;

use futures::FutureExt;
use rstest::rstest;

use hosted_engine::driver::fake::{FakeDriver, Operation, IMAGE_FAMILY_ERROR, NAME_IN_USE_ERROR};
use hosted_engine::model::ClusterChange;
use hosted_engine::scenarios::{self, NAME_IN_USE, UPDATE_IN_PROGRESS};
use hosted_engine::steps::{CreateCluster, MutateCluster};
use hosted_engine::{FnStep, PollError, StepError, Workflow, WorkflowContext, WorkflowPhase};

use super::helpers::{context, sample_spec};

// =============================================================================
// Test Fixtures
// =============================================================================

/// Step that makes the provider report an overlapping update on the cluster
/// under test, clearing after `clears_after` further observations
fn provider_reports_overlap(driver: &Arc<FakeDriver>, clears_after: Option<u32>) -> FnStep {
    let driver = driver.clone();
    FnStep::new("provider reports overlap", move |ctx: &mut WorkflowContext| {
        driver.inject_error(
            ctx.cluster_name(),
            "update already in progress",
            clears_after,
        );
        async { Ok(()) }.boxed()
    })
}

fn scale_workers() -> ClusterChange {
    ClusterChange::ScaleNodeGroup {
        group: "workers".into(),
        desired_size: 4,
    }
}

// =============================================================================
// Happy-Path Stories
// =============================================================================
//
// A well-behaved provider accepts every change and eventually converges.
// These scenarios must pass and leave nothing behind.

/// Story: A cluster is provisioned, verified, and deleted
///
/// The explicit delete step and the registered teardown both target the same
/// cluster; the teardown finds it already gone and still succeeds.
#[tokio::test(start_paused = true)]
async fn story_provision_verify_and_delete() {
    let driver = Arc::new(FakeDriver::new(2));
    let mut ctx = context("story-provision", &driver);

    let report = scenarios::provision_and_verify(sample_spec())
        .run(&mut ctx)
        .await;

    assert!(report.is_success(), "{}", report.summary());
    assert_eq!(report.phase, WorkflowPhase::Completed);
    assert_eq!(report.cleanups_run.len(), 1);
    assert!(!driver.contains("story-provision"));
    // Explicit delete plus the teardown's idempotent retry
    assert_eq!(driver.count(Operation::Delete), 2);
}

/// Story: Node groups are scaled, added and removed
///
/// Each change waits for the provider to report Active with the requested
/// size before the next one starts, so four mutations are issued in order.
#[tokio::test(start_paused = true)]
async fn story_node_group_lifecycle_converges_each_change() {
    let driver = Arc::new(FakeDriver::new(1));
    let mut ctx = context("story-node-groups", &driver);

    let report = scenarios::node_group_lifecycle(sample_spec())
        .run(&mut ctx)
        .await;

    assert!(report.is_success(), "{}", report.summary());
    assert_eq!(driver.count(Operation::Mutate), 4);
    let upstream = report
        .last_snapshot
        .as_ref()
        .and_then(|s| s.cluster.as_ref())
        .and_then(|c| c.upstream_specification.as_ref())
        .expect("verify step records a converged snapshot");
    let sizes: Vec<(&str, u32)> = upstream
        .node_groups
        .iter()
        .map(|ng| (ng.name.as_str(), ng.desired_size))
        .collect();
    assert_eq!(sizes, vec![("workers", 2), ("system", 1)]);
}

/// Story: Control plane and node groups are upgraded to a new version
#[tokio::test(start_paused = true)]
async fn story_kubernetes_upgrade_reaches_every_node_group() {
    let driver = Arc::new(FakeDriver::new(2));
    let mut ctx = context("story-upgrade", &driver);

    let report = scenarios::upgrade_kubernetes(sample_spec(), "1.31")
        .run(&mut ctx)
        .await;

    assert!(report.is_success(), "{}", report.summary());
    let handle = ctx.handle().expect("handle survives the run");
    assert_eq!(handle.spec.kubernetes_version, "1.31");
    assert!(handle
        .spec
        .node_groups
        .iter()
        .all(|ng| ng.kubernetes_version.as_deref() == Some("1.31")));
}

/// Story: Logging, tags and GKE services are updated in place
#[tokio::test(start_paused = true)]
async fn story_metadata_updates_converge() {
    let driver = Arc::new(FakeDriver::new(1));

    let mut ctx = context("story-logging", &driver);
    let report = scenarios::update_logging_and_tags(sample_spec())
        .run(&mut ctx)
        .await;
    assert!(report.is_success(), "{}", report.summary());

    let mut ctx = context("story-services", &driver);
    let report = scenarios::update_services(
        sample_spec(),
        "logging.googleapis.com/kubernetes",
        "monitoring.googleapis.com/kubernetes",
    )
    .run(&mut ctx)
    .await;
    assert!(report.is_success(), "{}", report.summary());
    let spec = &ctx.handle().expect("handle").spec;
    assert_eq!(
        spec.monitoring_service.as_deref(),
        Some("monitoring.googleapis.com/kubernetes")
    );
}

/// Story: A cluster is deleted and recreated under the same name
///
/// Two creates register two teardowns. The later one deletes the recreated
/// cluster; the earlier one then finds nothing and succeeds.
#[tokio::test(start_paused = true)]
async fn story_delete_and_recreate_tears_down_once_per_create() {
    let driver = Arc::new(FakeDriver::new(1));
    let mut ctx = context("story-recreate", &driver);

    let report = scenarios::delete_and_recreate(sample_spec())
        .run(&mut ctx)
        .await;

    assert!(report.is_success(), "{}", report.summary());
    assert_eq!(report.cleanups_run.len(), 2);
    assert_eq!(driver.count(Operation::Create), 2);
    assert!(!driver.contains("story-recreate"));
}

/// Story: A cluster is recreated while its predecessor is still being deleted
///
/// The provider first reports the name as taken. Once the old cluster is
/// gone the new one provisions normally and is torn down at the end.
#[tokio::test(start_paused = true)]
async fn story_recreate_while_deleting_waits_out_the_name_conflict() {
    let driver = Arc::new(FakeDriver::new(2));
    let mut ctx = context("story-recreate-deleting", &driver);

    let report = scenarios::recreate_while_deleting(sample_spec())
        .run(&mut ctx)
        .await;

    assert!(report.is_success(), "{}", report.summary());
    assert!(NAME_IN_USE_ERROR.contains(NAME_IN_USE));
    assert_eq!(driver.count(Operation::Create), 2);
    // One teardown per create; the older one finds the name already gone
    assert_eq!(report.cleanups_run.len(), 2);
    assert!(!driver.contains("story-recreate-deleting"));
}

/// Story: A cluster deleted before it finishes provisioning disappears
#[tokio::test(start_paused = true)]
async fn story_delete_while_provisioning_removes_the_cluster() {
    let driver = Arc::new(FakeDriver::new(5));
    let mut ctx = context("story-delete-early", &driver);

    let report = scenarios::delete_while_provisioning(sample_spec())
        .run(&mut ctx)
        .await;

    assert!(report.is_success(), "{}", report.summary());
    let calls = driver.calls();
    let first_delete = calls
        .iter()
        .position(|c| c.operation == Operation::Delete)
        .expect("scenario deletes the cluster");
    let fetches_before_delete = calls[..first_delete]
        .iter()
        .filter(|c| c.operation == Operation::Fetch)
        .count();
    assert_eq!(fetches_before_delete, 1, "delete must be issued while provisioning");
    assert!(!driver.contains("story-delete-early"));
    assert!(ctx.handle().is_none());
}

/// Story: Autoscaling is switched on and back off for every node group
#[tokio::test(start_paused = true)]
async fn story_autoscaling_round_trip_converges() {
    let driver = Arc::new(FakeDriver::new(1));
    let mut ctx = context("story-autoscaling", &driver);

    let report = scenarios::update_autoscaling(sample_spec())
        .run(&mut ctx)
        .await;

    assert!(report.is_success(), "{}", report.summary());
    assert_eq!(driver.count(Operation::Mutate), 2);
    let spec = &ctx.handle().expect("handle").spec;
    assert!(spec.node_groups.iter().all(|g| !g.autoscaling));
}

/// Story: A Windows node group joins a cluster that keeps its Linux groups
#[tokio::test(start_paused = true)]
async fn story_windows_node_group_is_added() {
    let driver = Arc::new(FakeDriver::new(1));
    let mut ctx = context("story-windows-pool", &driver);

    let report = scenarios::add_windows_node_group(sample_spec())
        .run(&mut ctx)
        .await;

    assert!(report.is_success(), "{}", report.summary());
    let upstream = report
        .last_snapshot
        .as_ref()
        .and_then(|s| s.cluster.as_ref())
        .and_then(|c| c.upstream_specification.as_ref())
        .expect("mutation records a converged snapshot");
    let windows: Vec<&str> = upstream
        .node_groups
        .iter()
        .filter(|g| g.is_windows())
        .map(|g| g.name.as_str())
        .collect();
    assert_eq!(windows, vec!["windowspool"]);
}

// =============================================================================
// Overlapping Update Stories
// =============================================================================
//
// Providers reject a change while another is still being applied and report
// the overlap as a transitioning error that clears on its own. The second
// wait of "update while updating" tolerates that error; a plain wait fails.

/// Story: Issuing a second change while the first is in flight converges
#[tokio::test(start_paused = true)]
async fn story_update_while_updating_converges() {
    let driver = Arc::new(FakeDriver::new(3));
    let mut ctx = context("story-overlap", &driver);

    let report = scenarios::update_while_updating(sample_spec(), "1.31")
        .run(&mut ctx)
        .await;

    assert!(report.is_success(), "{}", report.summary());
    let spec = &ctx.handle().expect("handle").spec;
    assert_eq!(spec.kubernetes_version, "1.31");
    assert_eq!(spec.node_group("workers").map(|g| g.desired_size), Some(3));
}

/// Story: A self-clearing "in progress" error is waited out
#[tokio::test(start_paused = true)]
async fn story_in_progress_error_is_tolerated_until_it_clears() {
    let driver = Arc::new(FakeDriver::new(1));
    let mut ctx = context("story-tolerate", &driver);

    let report = Workflow::new("tolerate overlap")
        .step(CreateCluster::new(sample_spec()))
        .step(provider_reports_overlap(&driver, Some(2)))
        .step(MutateCluster::new(scale_workers()).tolerating(UPDATE_IN_PROGRESS))
        .run(&mut ctx)
        .await;

    assert!(report.is_success(), "{}", report.summary());
}

/// Story: The same error without tolerance fails the wait immediately
#[tokio::test(start_paused = true)]
async fn story_untolerated_in_progress_error_fails_fast() {
    let driver = Arc::new(FakeDriver::new(1));
    let mut ctx = context("story-no-tolerate", &driver);

    let report = Workflow::new("no tolerance")
        .step(CreateCluster::new(sample_spec()))
        .step(provider_reports_overlap(&driver, Some(2)))
        .step(MutateCluster::new(scale_workers()))
        .run(&mut ctx)
        .await;

    let failure = report.failure.as_ref().expect("mutation wait must fail");
    assert!(matches!(
        failure.error,
        StepError::Poll(PollError::ConditionFailed { attempts: 1, .. })
    ));
    assert!(!driver.contains("story-no-tolerate"));
}

// =============================================================================
// Rejection Stories
// =============================================================================
//
// Scenarios that pass only when the provider refuses a request or reports
// the expected error. The refusal is the success condition.

/// Story: A configuration the provider cannot provision surfaces its error
///
/// The create call is accepted, then the cluster reports a transitioning
/// error. The scenario waits for that specific message and still tears the
/// cluster down afterwards.
#[tokio::test(start_paused = true)]
async fn story_invalid_config_reports_the_expected_error() {
    let driver = Arc::new(FakeDriver::new(2));
    driver.inject_error(
        "story-quota",
        "NodeCreationFailure: nodegroup quota exceeded for account",
        None,
    );
    let mut ctx = context("story-quota", &driver);

    let report = scenarios::invalid_config_reports_error(sample_spec(), "quota exceeded")
        .run(&mut ctx)
        .await;

    assert!(report.is_success(), "{}", report.summary());
    assert!(!driver.contains("story-quota"));
}

/// Story: The wrong error is a failure, not a timeout
#[tokio::test(start_paused = true)]
async fn story_unexpected_error_message_fails_the_scenario() {
    let driver = Arc::new(FakeDriver::new(2));
    driver.inject_error("story-wrong-error", "bad config", None);
    let mut ctx = context("story-wrong-error", &driver);

    let report = scenarios::invalid_config_reports_error(sample_spec(), "quota exceeded")
        .run(&mut ctx)
        .await;

    let failure = report.failure.as_ref().expect("scenario must fail");
    assert!(matches!(
        failure.error,
        StepError::Poll(PollError::ConditionFailed { .. })
    ));
    assert_eq!(
        failure.error.condition(),
        Some("cluster reports error containing \"quota exceeded\"")
    );
}

/// Story: Create requests with a bad name or no node pools are refused
#[rstest]
#[case::uppercase_name("Bad_Name", false, "InvalidFormat")]
#[case::no_node_pools("story-no-pools", true, "at least one node pool")]
#[tokio::test(start_paused = true)]
async fn story_invalid_create_is_refused(
    #[case] name: &str,
    #[case] empty_pools: bool,
    #[case] expected: &str,
) {
    let driver = Arc::new(FakeDriver::new(1));
    let mut spec = sample_spec();
    if empty_pools {
        spec.node_groups.clear();
    }
    let mut ctx = context("story-invalid-create", &driver);

    let report = scenarios::invalid_create_rejected(spec, name, expected)
        .run(&mut ctx)
        .await;

    assert!(report.is_success(), "{}", report.summary());
    assert!(!driver.contains(name));
    assert!(report.cleanups_run.is_empty());
}

/// Story: Importing the same cluster twice fails the second time
#[tokio::test(start_paused = true)]
async fn story_reimport_is_refused() {
    let driver = Arc::new(FakeDriver::new(1));
    let mut ctx = context("story-reimport", &driver);

    let report = scenarios::reimport_fails(sample_spec()).run(&mut ctx).await;

    assert!(report.is_success(), "{}", report.summary());
    assert_eq!(driver.count(Operation::Create), 2);
    assert!(!driver.contains("story-reimport"));
}

/// Story: Moving every node group to Windows is refused up front
///
/// The provider answers the request itself with an error, so nothing is
/// polled and the cluster keeps its Linux groups.
#[tokio::test(start_paused = true)]
async fn story_all_windows_node_groups_are_refused() {
    let driver = Arc::new(FakeDriver::new(1));
    let mut ctx = context("story-all-windows", &driver);

    let report = scenarios::all_windows_rejected(sample_spec())
        .run(&mut ctx)
        .await;

    assert!(report.is_success(), "{}", report.summary());
    let spec = &ctx.handle().expect("handle").spec;
    assert!(spec.node_groups.iter().all(|g| !g.is_windows()));
}

/// Story: Switching a Linux group to a Windows image is accepted, then fails
///
/// The request goes through, and the provider reports the image family
/// mismatch as a transitioning error. Teardown still removes the cluster.
#[tokio::test(start_paused = true)]
async fn story_windows_image_switch_reports_family_error() {
    let driver = Arc::new(FakeDriver::new(1));
    let mut ctx = context("story-image-switch", &driver);

    let report = scenarios::windows_image_switch_reports_error(sample_spec())
        .run(&mut ctx)
        .await;

    assert!(report.is_success(), "{}", report.summary());
    let last = report.last_snapshot.as_ref().expect("error snapshot");
    assert_eq!(last.error_message(), Some(IMAGE_FAMILY_ERROR));
    assert!(!driver.contains("story-image-switch"));
}

/// Story: Disabling both API endpoints is refused
#[tokio::test(start_paused = true)]
async fn story_endpoint_access_cannot_be_fully_disabled() {
    let driver = Arc::new(FakeDriver::new(1));
    let mut ctx = context("story-endpoints", &driver);

    let report = scenarios::endpoint_access_rejected(sample_spec())
        .run(&mut ctx)
        .await;

    assert!(report.is_success(), "{}", report.summary());
    let spec = &ctx.handle().expect("handle").spec;
    assert!(spec.public_access, "rejected change must not be applied");
}
