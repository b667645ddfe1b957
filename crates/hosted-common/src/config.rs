//! Environment-driven configuration for e2e runs
//!
//! All settings have defaults suitable for real cloud providers; CI overrides
//! them through `HOSTED_*` environment variables.
//!
//! ```bash
//! HOSTED_PROVIDER=eks HOSTED_CLUSTER_CLEANUP=false HOSTED_POLL_INTERVAL_SECS=5 \
//! cargo test -p hosted-engine -- --nocapture
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::names::{self, DEFAULT_CLUSTER_PREFIX};
use crate::retry::RetryConfig;
use crate::Error;

/// Run identity used in generated names
pub const ENV_RUN_ID: &str = "HOSTED_RUN_ID";
/// Generated cluster-name prefix
pub const ENV_CLUSTER_PREFIX: &str = "HOSTED_CLUSTER_PREFIX";
/// Perform (true) or skip (false) cleanup of provisioned clusters
pub const ENV_CLUSTER_CLEANUP: &str = "HOSTED_CLUSTER_CLEANUP";
/// Provider hint
pub const ENV_PROVIDER: &str = "HOSTED_PROVIDER";
/// Wait-ready poll timeout in seconds
pub const ENV_READY_TIMEOUT: &str = "HOSTED_READY_TIMEOUT_SECS";
/// Post-mutation convergence timeout in seconds
pub const ENV_MUTATION_TIMEOUT: &str = "HOSTED_MUTATION_TIMEOUT_SECS";
/// Deletion poll timeout in seconds
pub const ENV_DELETE_TIMEOUT: &str = "HOSTED_DELETE_TIMEOUT_SECS";
/// Expected-error poll timeout in seconds
pub const ENV_ERROR_TIMEOUT: &str = "HOSTED_ERROR_TIMEOUT_SECS";
/// Poll interval in seconds
pub const ENV_POLL_INTERVAL: &str = "HOSTED_POLL_INTERVAL_SECS";
/// Overall per-workflow deadline in seconds (0 = none)
pub const ENV_SCENARIO_TIMEOUT: &str = "HOSTED_SCENARIO_TIMEOUT_SECS";
/// Attempts for retryable provider calls
pub const ENV_RETRY_MAX_ATTEMPTS: &str = "HOSTED_RETRY_MAX_ATTEMPTS";

/// Hosted Kubernetes provider under test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProviderKind {
    /// Amazon EKS
    Eks,
    /// Google GKE
    Gke,
    /// Azure AKS
    Aks,
    /// In-process deterministic fake
    #[default]
    Fake,
}

impl FromStr for ProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "eks" | "aws" => Ok(Self::Eks),
            "gke" | "gcp" => Ok(Self::Gke),
            "aks" | "azure" => Ok(Self::Aks),
            "fake" | "" => Ok(Self::Fake),
            other => Err(Error::config(
                ENV_PROVIDER,
                format!("unknown provider '{other}'"),
            )),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Eks => "eks",
            Self::Gke => "gke",
            Self::Aks => "aks",
            Self::Fake => "fake",
        };
        write!(f, "{}", name)
    }
}

/// Timeout and interval for one poll invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Maximum wall-clock time to poll
    pub timeout: Duration,
    /// Minimum spacing between fetch attempts
    pub interval: Duration,
}

impl PollConfig {
    /// Create a poll config
    pub const fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    /// Same interval, different timeout
    pub const fn with_timeout(self, timeout: Duration) -> Self {
        Self {
            timeout,
            interval: self.interval,
        }
    }
}

/// Poll budgets for each kind of wait a scenario performs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Waiting for a new cluster to become Active
    pub ready: PollConfig,
    /// Waiting for a mutation to converge
    pub mutation: PollConfig,
    /// Waiting for a cluster to disappear
    pub delete: PollConfig,
    /// Waiting for an expected transitioning error
    pub error: PollConfig,
}

impl Default for PollSettings {
    fn default() -> Self {
        let interval = Duration::from_secs(10);
        Self {
            ready: PollConfig::new(Duration::from_secs(1800), interval),
            mutation: PollConfig::new(Duration::from_secs(1200), interval),
            delete: PollConfig::new(Duration::from_secs(900), interval),
            error: PollConfig::new(Duration::from_secs(300), interval),
        }
    }
}

impl PollSettings {
    /// Uniform settings, mostly useful against the in-process fake
    pub const fn uniform(timeout: Duration, interval: Duration) -> Self {
        let poll = PollConfig::new(timeout, interval);
        Self {
            ready: poll,
            mutation: poll,
            delete: poll,
            error: poll,
        }
    }
}

/// Whether provisioned clusters are torn down when a workflow ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CleanupPolicy {
    /// Run every registered cleanup obligation
    #[default]
    Perform,
    /// Leave resources in place for inspection
    Skip,
}

/// Complete configuration for an e2e run
#[derive(Debug, Clone, PartialEq)]
pub struct E2eConfig {
    /// Run identity used in generated names
    pub run_id: String,
    /// Prefix for generated cluster names
    pub cluster_prefix: String,
    /// Provider under test
    pub provider: ProviderKind,
    /// Cleanup policy for provisioned clusters
    pub cleanup: CleanupPolicy,
    /// Poll budgets
    pub poll: PollSettings,
    /// Overall deadline for one workflow
    pub scenario_timeout: Option<Duration>,
    /// Retry policy for mutation calls
    pub retry: RetryConfig,
}

impl Default for E2eConfig {
    fn default() -> Self {
        Self {
            run_id: names::run_id().to_string(),
            cluster_prefix: DEFAULT_CLUSTER_PREFIX.to_string(),
            provider: ProviderKind::default(),
            cleanup: CleanupPolicy::default(),
            poll: PollSettings::default(),
            scenario_timeout: None,
            retry: RetryConfig::default(),
        }
    }
}

impl E2eConfig {
    /// Load from `HOSTED_*` environment variables
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup, falling back to defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let interval = match parse_secs(&lookup, ENV_POLL_INTERVAL)? {
            Some(d) if d.is_zero() => {
                return Err(Error::config(ENV_POLL_INTERVAL, "must be greater than zero"))
            }
            Some(d) => d,
            None => defaults.poll.ready.interval,
        };
        let timeout_or = |key: &str, default: PollConfig| -> Result<PollConfig, Error> {
            Ok(PollConfig::new(
                parse_secs(&lookup, key)?.unwrap_or(default.timeout),
                interval,
            ))
        };
        let poll = PollSettings {
            ready: timeout_or(ENV_READY_TIMEOUT, defaults.poll.ready)?,
            mutation: timeout_or(ENV_MUTATION_TIMEOUT, defaults.poll.mutation)?,
            delete: timeout_or(ENV_DELETE_TIMEOUT, defaults.poll.delete)?,
            error: timeout_or(ENV_ERROR_TIMEOUT, defaults.poll.error)?,
        };

        let cleanup = match lookup(ENV_CLUSTER_CLEANUP) {
            Some(v) => match v.to_lowercase().as_str() {
                "true" | "1" | "yes" => CleanupPolicy::Perform,
                "false" | "0" | "no" => CleanupPolicy::Skip,
                other => {
                    return Err(Error::config(
                        ENV_CLUSTER_CLEANUP,
                        format!("expected a boolean, got '{other}'"),
                    ))
                }
            },
            None => defaults.cleanup,
        };

        let provider = match lookup(ENV_PROVIDER) {
            Some(v) => v.parse()?,
            None => defaults.provider,
        };

        let scenario_timeout = parse_secs(&lookup, ENV_SCENARIO_TIMEOUT)?.filter(|d| !d.is_zero());

        let retry = match lookup(ENV_RETRY_MAX_ATTEMPTS) {
            Some(v) => RetryConfig::with_max_attempts(parse_attempts(&v)?),
            None => defaults.retry,
        };

        Ok(Self {
            run_id: lookup(ENV_RUN_ID).unwrap_or(defaults.run_id),
            cluster_prefix: lookup(ENV_CLUSTER_PREFIX).unwrap_or(defaults.cluster_prefix),
            provider,
            cleanup,
            poll,
            scenario_timeout,
            retry,
        })
    }
}

fn parse_secs<F>(lookup: &F, key: &str) -> Result<Option<Duration>, Error>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| parse_u64(key, &v).map(Duration::from_secs))
        .transpose()
}

fn parse_attempts(value: &str) -> Result<u32, Error> {
    let attempts = u32::try_from(parse_u64(ENV_RETRY_MAX_ATTEMPTS, value)?).map_err(|_| {
        Error::config(ENV_RETRY_MAX_ATTEMPTS, format!("'{value}' is too large"))
    })?;
    if attempts == 0 {
        return Err(Error::config(ENV_RETRY_MAX_ATTEMPTS, "must be at least 1"));
    }
    Ok(attempts)
}

fn parse_u64(key: &str, value: &str) -> Result<u64, Error> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|e| Error::config(key, format!("'{value}' is not a whole number: {e}")))
}
