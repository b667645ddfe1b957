//! Shared fixtures for the fake-provider integration tests

use std::sync::Arc;
use std::time::Duration;

use hosted_common::retry::RetryConfig;
use hosted_common::PollSettings;
use hosted_engine::driver::fake::FakeDriver;
use hosted_engine::{ClusterSpec, NodeGroup, WorkflowContext};

/// Poll budget generous enough for any fake scenario, one-second interval
pub fn settings() -> PollSettings {
    PollSettings::uniform(Duration::from_secs(120), Duration::from_secs(1))
}

/// A two-group EKS-like spec
pub fn sample_spec() -> ClusterSpec {
    let mut spec = ClusterSpec::new("1.30", "us-west-2");
    spec.node_groups = vec![NodeGroup::new("workers", 2), NodeGroup::new("system", 1)];
    spec.public_access = true;
    spec
}

/// Fresh context for `name` against `driver` with test timings.
///
/// Installs the `RUST_LOG`-driven subscriber so failing stories show the
/// engine's step and poll logs.
pub fn context(name: &str, driver: &Arc<FakeDriver>) -> WorkflowContext {
    hosted_common::telemetry::init_tracing();
    WorkflowContext::new(name, driver.clone())
        .with_poll(settings())
        .with_retry(RetryConfig::no_retry())
}
