//! Bounded polling of a Condition against freshly fetched Snapshots
//!
//! [`poll`] is the only place the engine waits. It suspends the calling task
//! on tokio's timer between attempts, so a workflow blocked here never blocks
//! another workflow running on the same runtime.
//!
//! Termination rules:
//! - first `Satisfied` returns the satisfying snapshot
//! - first `Failed` returns [`PollError::ConditionFailed`] with no further fetch
//! - fetch errors are logged and retried until the budget runs out
//! - the budget running out returns [`PollError::Timeout`] with the last
//!   snapshot and the last fetch error attached
//! - cancellation of the supplied token returns [`PollError::Cancelled`]

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use hosted_common::{Error, PollConfig};

use crate::condition::{Condition, Evaluation};
use crate::model::Snapshot;

/// Why a poll ended without its condition being satisfied
#[derive(Debug, Clone, Error)]
pub enum PollError {
    /// The condition reported it can no longer be satisfied
    #[error("condition '{condition}' failed after {attempts} attempt(s): {reason} (last snapshot: {snapshot})")]
    ConditionFailed {
        /// Condition description
        condition: String,
        /// Reason reported by the condition
        reason: String,
        /// Fetches issued, including the failing one
        attempts: u32,
        /// Snapshot that failed the condition
        snapshot: Box<Snapshot>,
    },

    /// The budget ran out before the condition was satisfied
    #[error("timeout after {timeout:?} waiting for '{condition}' ({attempts} attempt(s), last snapshot: {}, last fetch error: {})",
        display_last(.last_snapshot), .last_fetch_error.as_deref().unwrap_or("none"))]
    Timeout {
        /// Condition description
        condition: String,
        /// Budget that ran out
        timeout: Duration,
        /// Fetches issued
        attempts: u32,
        /// Last snapshot successfully fetched, if any
        last_snapshot: Option<Box<Snapshot>>,
        /// Last fetch error, if any
        last_fetch_error: Option<String>,
    },

    /// An external deadline cancelled the poll
    #[error("cancelled while waiting for '{condition}' after {attempts} attempt(s) (last snapshot: {})",
        display_last(.last_snapshot))]
    Cancelled {
        /// Condition description
        condition: String,
        /// Fetches issued
        attempts: u32,
        /// Last snapshot successfully fetched, if any
        last_snapshot: Option<Box<Snapshot>>,
    },
}

fn display_last(snapshot: &Option<Box<Snapshot>>) -> String {
    snapshot
        .as_ref()
        .map(|s| s.to_string())
        .unwrap_or_else(|| "none".to_string())
}

impl PollError {
    /// Description of the condition being awaited
    pub fn condition(&self) -> &str {
        match self {
            PollError::ConditionFailed { condition, .. }
            | PollError::Timeout { condition, .. }
            | PollError::Cancelled { condition, .. } => condition,
        }
    }

    /// Last snapshot observed before the poll ended
    pub fn last_snapshot(&self) -> Option<&Snapshot> {
        match self {
            PollError::ConditionFailed { snapshot, .. } => Some(snapshot.as_ref()),
            PollError::Timeout { last_snapshot, .. } | PollError::Cancelled { last_snapshot, .. } => {
                last_snapshot.as_deref()
            }
        }
    }

    /// Number of fetches issued
    pub fn attempts(&self) -> u32 {
        match self {
            PollError::ConditionFailed { attempts, .. }
            | PollError::Timeout { attempts, .. }
            | PollError::Cancelled { attempts, .. } => *attempts,
        }
    }
}

/// Poll `condition` against snapshots from `fetch` until it resolves.
///
/// `config.interval` is a floor on the spacing between attempt starts: a
/// fetch slower than the interval delays the next attempt instead of
/// overlapping it. A fetch still in flight when the budget runs out is
/// abandoned, so the call returns within `timeout + interval`.
pub async fn poll<F, Fut>(
    mut fetch: F,
    condition: &Condition,
    config: PollConfig,
    cancel: &CancellationToken,
) -> Result<Snapshot, PollError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Snapshot, Error>>,
{
    let start = Instant::now();
    let deadline = start + config.timeout;
    let mut attempts = 0u32;
    let mut last_snapshot: Option<Box<Snapshot>> = None;
    let mut last_fetch_error: Option<String> = None;

    let timeout = |attempts, last_snapshot, last_fetch_error| PollError::Timeout {
        condition: condition.description().to_string(),
        timeout: config.timeout,
        attempts,
        last_snapshot,
        last_fetch_error,
    };
    let cancelled = |attempts, last_snapshot| PollError::Cancelled {
        condition: condition.description().to_string(),
        attempts,
        last_snapshot,
    };

    loop {
        let attempt_started = Instant::now();
        attempts += 1;

        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled(attempts, last_snapshot)),
            result = fetch() => result,
            _ = sleep_until(deadline) => {
                return Err(timeout(attempts, last_snapshot, last_fetch_error))
            }
        };

        match fetched {
            Ok(snapshot) => match condition.evaluate(&snapshot) {
                Evaluation::Satisfied => {
                    debug!(
                        condition = %condition,
                        attempt = attempts,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Condition satisfied"
                    );
                    return Ok(snapshot);
                }
                Evaluation::Failed(reason) => {
                    return Err(PollError::ConditionFailed {
                        condition: condition.description().to_string(),
                        reason,
                        attempts,
                        snapshot: Box::new(snapshot),
                    });
                }
                Evaluation::Pending => {
                    debug!(
                        condition = %condition,
                        attempt = attempts,
                        snapshot = %snapshot,
                        "Condition pending"
                    );
                    last_snapshot = Some(Box::new(snapshot));
                }
            },
            Err(e) => {
                warn!(
                    condition = %condition,
                    attempt = attempts,
                    error = %e,
                    "Fetch failed, retrying"
                );
                last_fetch_error = Some(e.to_string());
            }
        }

        let next = (attempt_started + config.interval).max(Instant::now());
        if next > deadline {
            // No further attempt fits in the budget; report at the deadline.
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled(attempts, last_snapshot)),
                _ = sleep_until(deadline) => {}
            }
            return Err(timeout(attempts, last_snapshot, last_fetch_error));
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled(attempts, last_snapshot)),
            _ = sleep_until(next) => {}
        }
    }
}
