//! Stories about running a whole suite through the harness
//!
//! Scenarios share one provider but each owns its cluster name and context,
//! so they run side by side and one failure leaves the rest untouched.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use hosted_engine::driver::fake::FakeDriver;
use hosted_engine::{scenarios, SuiteHarness};

use super::helpers::{context, sample_spec};

/// Story: Slow provider calls overlap instead of adding up
///
/// A single provisioning scenario is timed on its own first. Three of them
/// through the harness must finish in well under three times that.
#[tokio::test(start_paused = true)]
async fn story_scenarios_overlap_on_a_slow_provider() {
    let latency = Duration::from_secs(5);

    let solo = Arc::new(FakeDriver::new(2).with_latency(latency));
    let started = Instant::now();
    let report = scenarios::provision_and_verify(sample_spec())
        .run(&mut context("suite-solo", &solo))
        .await;
    assert!(report.is_success(), "{}", report.summary());
    let single = started.elapsed();

    let shared = Arc::new(FakeDriver::new(2).with_latency(latency));
    let mut suite = SuiteHarness::new("overlap");
    for name in ["suite-a", "suite-b", "suite-c"] {
        suite.spawn(
            scenarios::provision_and_verify(sample_spec()),
            context(name, &shared),
        );
    }
    let started = Instant::now();
    let reports = suite.finish().await.expect("every scenario passes");
    let together = started.elapsed();

    assert_eq!(reports.len(), 3);
    assert!(
        together < single * 2,
        "suite took {together:?}, one scenario alone took {single:?}"
    );
    for name in ["suite-a", "suite-b", "suite-c"] {
        assert!(!shared.contains(name));
    }
}

/// Story: One broken scenario fails the suite without touching the others
#[tokio::test(start_paused = true)]
async fn story_one_failure_is_isolated() {
    let driver = Arc::new(FakeDriver::new(1));
    driver.inject_error("suite-broken", "InsufficientCapacity", None);

    let mut suite = SuiteHarness::new("isolation");
    suite.spawn(
        scenarios::node_group_lifecycle(sample_spec()),
        context("suite-healthy", &driver),
    );
    suite.spawn(
        scenarios::upgrade_kubernetes(sample_spec(), "1.31"),
        context("suite-broken", &driver),
    );
    suite.join().await;

    let passed: Vec<&str> = suite
        .reports()
        .iter()
        .filter(|r| r.is_success())
        .map(|r| r.cluster.as_str())
        .collect();
    assert_eq!(passed, vec!["suite-healthy"]);
    assert!(suite.summary().ends_with("isolation: 1/2 passed"));
    assert!(suite.summary().contains("[FAIL] upgrade kubernetes to 1.31"));

    let err = suite.finish().await.expect_err("suite must fail");
    assert!(err.to_string().contains("1 scenario(s) failed: upgrade kubernetes to 1.31"));
    assert!(!driver.contains("suite-healthy"));
    assert!(!driver.contains("suite-broken"));
}
