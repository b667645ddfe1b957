//! Lifecycle states and the Conditions built from them
//!
//! [`ResourceState`] is never stored. Every poll derives it again from the
//! raw `state` / `transitioning` / `transitioningMessage` fields of a fresh
//! snapshot.
//!
//! All factories here share one rule: a snapshot whose transitioning marker is
//! `Error` fails the condition unless the condition is explicitly about that
//! error ([`matches_error`]) or wrapped with [`Condition::tolerating`]. An
//! unrecognized error is surfaced immediately instead of being polled until
//! the timeout.

use std::fmt;

use serde_json::Value;

use crate::condition::{Condition, Evaluation};
use crate::drift::{self, DriftError, FieldPath};
use crate::model::{ClusterSpec, Snapshot, Transitioning};

/// Lifecycle state of a managed cluster at one observation instant
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceState {
    /// Being created
    Provisioning,
    /// Settled and usable
    Active,
    /// A mutation is in flight
    Updating,
    /// Waiting on an external prerequisite (e.g. no node groups yet)
    Waiting,
    /// The current operation failed
    Error,
    /// Being torn down
    Deleting,
    /// No longer known to the management plane
    Deleted,
}

impl ResourceState {
    /// Map a raw management-plane state string
    ///
    /// Unrecognized strings are treated as in-flight work.
    pub fn from_raw(raw: &str) -> Self {
        match raw.to_lowercase().as_str() {
            "provisioning" | "pending" => Self::Provisioning,
            "active" => Self::Active,
            "updating" | "upgrading" => Self::Updating,
            "waiting" => Self::Waiting,
            "error" => Self::Error,
            "removing" | "deleting" => Self::Deleting,
            _ => Self::Updating,
        }
    }

    /// Derive the state shown by a snapshot
    pub fn of(snapshot: &Snapshot) -> Self {
        let Some(cluster) = &snapshot.cluster else {
            return Self::Deleted;
        };
        match (cluster.transitioning, Self::from_raw(&cluster.state)) {
            (Transitioning::Error, _) => Self::Error,
            (Transitioning::Yes, Self::Active) => Self::Updating,
            (_, state) => state,
        }
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Provisioning => "Provisioning",
            Self::Active => "Active",
            Self::Updating => "Updating",
            Self::Waiting => "Waiting",
            Self::Error => "Error",
            Self::Deleting => "Deleting",
            Self::Deleted => "Deleted",
        };
        write!(f, "{}", name)
    }
}

fn unexpected_error(snapshot: &Snapshot) -> Option<Evaluation> {
    snapshot
        .error_message()
        .map(|msg| Evaluation::Failed(format!("unexpected error: {msg}")))
}

/// Settled in `Active` with no operation in flight
pub fn is_active() -> Condition {
    Condition::new("cluster is active", |snap| {
        if let Some(failed) = unexpected_error(snap) {
            return failed;
        }
        match &snap.cluster {
            Some(c)
                if c.transitioning == Transitioning::No
                    && ResourceState::from_raw(&c.state) == ResourceState::Active =>
            {
                Evaluation::Satisfied
            }
            _ => Evaluation::Pending,
        }
    })
}

/// The lookup returns the not-found sentinel
pub fn is_deleted() -> Condition {
    Condition::new("cluster is deleted", |snap| {
        if snap.is_not_found() {
            return Evaluation::Satisfied;
        }
        unexpected_error(snap).unwrap_or(Evaluation::Pending)
    })
}

/// The management plane knows the identity
pub fn exists() -> Condition {
    Condition::new("cluster exists", |snap| {
        if let Some(failed) = unexpected_error(snap) {
            return failed;
        }
        if snap.is_not_found() {
            Evaluation::Pending
        } else {
            Evaluation::Satisfied
        }
    })
}

/// The derived state equals `target`
pub fn in_state(target: ResourceState) -> Condition {
    Condition::new(format!("cluster is {target}"), move |snap| {
        let state = ResourceState::of(snap);
        if state == target {
            return Evaluation::Satisfied;
        }
        unexpected_error(snap).unwrap_or(Evaluation::Pending)
    })
}

/// The current operation failed with a message containing `expected`.
///
/// Pending while there is no error; Failed if there is an error with a
/// different message.
pub fn matches_error(expected: impl Into<String>) -> Condition {
    let expected = expected.into();
    Condition::new(format!("cluster reports error containing {expected:?}"), move |snap| {
        match snap.error_message() {
            Some(msg) if msg.contains(expected.as_str()) => Evaluation::Satisfied,
            Some(msg) => Evaluation::Failed(format!(
                "error {msg:?} does not contain {expected:?}"
            )),
            None => Evaluation::Pending,
        }
    })
}

/// The converged (upstream) spec has `path` equal to `expected`
pub fn field_equals(path: impl Into<FieldPath>, expected: Value) -> Condition {
    let path = path.into();
    Condition::new(format!("upstream {path} == {expected}"), move |snap| {
        if let Some(failed) = unexpected_error(snap) {
            return failed;
        }
        match snap
            .cluster
            .as_ref()
            .and_then(|c| c.upstream_specification.as_ref())
        {
            Some(upstream) if drift::field_matches(upstream, &path, &expected) => {
                Evaluation::Satisfied
            }
            _ => Evaluation::Pending,
        }
    })
}

/// The converged spec matches `expected` on every listed field
///
/// Drift is Pending here: it is expected to clear while the provider syncs.
/// A path that resolves nowhere fails, since no amount of waiting fixes it.
pub fn upstream_converged(expected: ClusterSpec, fields: Vec<FieldPath>) -> Condition {
    let names: Vec<&str> = fields.iter().map(FieldPath::as_str).collect();
    let description = format!("upstream converged on [{}]", names.join(", "));
    Condition::new(description, move |snap| {
        if let Some(failed) = unexpected_error(snap) {
            return failed;
        }
        match drift::check_snapshot(&expected, snap, &fields) {
            Ok(()) => Evaluation::Satisfied,
            Err(DriftError::MissingField { field }) => {
                Evaluation::Failed(format!("field {field} exists in neither spec"))
            }
            Err(_) => Evaluation::Pending,
        }
    })
}
