//! Unique names for resources created during a run
//!
//! A cluster's logical identity is assigned locally before any remote call,
//! so every scenario in a run works against its own name and parallel
//! scenarios never touch each other's clusters.

use std::sync::OnceLock;

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Default prefix for generated cluster names
pub const DEFAULT_CLUSTER_PREFIX: &str = "auto-hp-ci";

/// Length of the random suffix appended to generated names
const SUFFIX_LEN: usize = 5;

/// Characters of the run ID carried into generated names
const RUN_TAG_LEN: usize = 8;

static RUN_ID: OnceLock<String> = OnceLock::new();

/// Get the unique run ID for this process.
///
/// Checks `HOSTED_RUN_ID` first (CI sets it to the commit SHA), then falls
/// back to `{pid}-{timestamp}`.
pub fn run_id() -> &'static str {
    RUN_ID.get_or_init(|| {
        std::env::var(crate::config::ENV_RUN_ID).unwrap_or_else(|_| default_run_id())
    })
}

fn default_run_id() -> String {
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    format!("{}-{}", std::process::id(), millis % 1_000_000)
}

/// Build `{prefix}-{run}-{suffix}` from the run ID and a random lowercase
/// alphanumeric suffix.
///
/// The run ID is shortened to its first eight DNS-safe characters so a
/// commit SHA still fits provider name limits; an empty tag is omitted.
///
/// Example: `("auto-hp-ci", "3f2a9c1d7e")` → `auto-hp-ci-3f2a9c1d-x3k9q`
pub fn cluster_name(prefix: &str, run_id: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SUFFIX_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    let tag = run_tag(run_id);
    if tag.is_empty() {
        format!("{prefix}-{suffix}")
    } else {
        format!("{prefix}-{tag}-{suffix}")
    }
}

fn run_tag(run_id: &str) -> String {
    let tag: String = run_id
        .chars()
        .map(|c| c.to_ascii_lowercase())
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .take(RUN_TAG_LEN)
        .collect();
    tag.trim_matches('-').to_string()
}
