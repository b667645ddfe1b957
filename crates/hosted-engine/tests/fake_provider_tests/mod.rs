//! Integration tests for hosted-cluster lifecycle workflows
//!
//! These tests tell the story of a lifecycle suite run end to end: clusters
//! are created, changed and torn down through the same workflows a real
//! provider run uses, with the deterministic fake standing in for the cloud.
//!
//! # Test Organization
//!
//! - `scenario_stories`: each library scenario run against a well-behaved
//!   provider, plus the scenarios that expect the provider to refuse or
//!   report an error
//!
//! - `workflow_guarantees`: the properties the engine promises regardless
//!   of scenario: cleanup always runs, failures are never masked, polling
//!   fails fast and the overall deadline is honored
//!
//! - `suite_concurrency`: many scenarios sharing one provider through the
//!   suite harness

mod helpers;
mod scenario_stories;
mod suite_concurrency;
mod workflow_guarantees;
