//! Predicates over a single Snapshot
//!
//! A [`Condition`] answers one question about one snapshot: is the goal
//! reached, not yet reached, or unreachable. It never fetches and never
//! remembers earlier snapshots, so the same snapshot always yields the same
//! [`Evaluation`].

use std::fmt;
use std::sync::Arc;

use crate::model::Snapshot;

/// Result of evaluating a Condition against a Snapshot
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Evaluation {
    /// The goal is reached
    Satisfied,
    /// Not yet; poll again
    Pending,
    /// The goal can no longer be reached by waiting
    Failed(String),
}

impl Evaluation {
    /// Whether this is `Satisfied`
    pub fn is_satisfied(&self) -> bool {
        matches!(self, Evaluation::Satisfied)
    }
}

type Check = dyn Fn(&Snapshot) -> Evaluation + Send + Sync;

/// A described, pure predicate over a Snapshot
#[derive(Clone)]
pub struct Condition {
    description: String,
    check: Arc<Check>,
}

impl Condition {
    /// Build a condition from a description and a pure check
    pub fn new<F>(description: impl Into<String>, check: F) -> Self
    where
        F: Fn(&Snapshot) -> Evaluation + Send + Sync + 'static,
    {
        Self {
            description: description.into(),
            check: Arc::new(check),
        }
    }

    /// Human-readable description used in logs and failure reports
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Evaluate against one snapshot
    pub fn evaluate(&self, snapshot: &Snapshot) -> Evaluation {
        (self.check)(snapshot)
    }

    /// Conjunction: Failed if any part fails, Pending if any part is pending,
    /// otherwise Satisfied.
    pub fn all(conditions: Vec<Condition>) -> Self {
        let description = join_descriptions(&conditions, " and ");
        Self::new(description, move |snap| {
            let mut pending = false;
            for c in &conditions {
                match c.evaluate(snap) {
                    Evaluation::Failed(reason) => {
                        return Evaluation::Failed(format!("{}: {}", c.description(), reason))
                    }
                    Evaluation::Pending => pending = true,
                    Evaluation::Satisfied => {}
                }
            }
            if pending {
                Evaluation::Pending
            } else {
                Evaluation::Satisfied
            }
        })
    }

    /// Disjunction: Failed if any part fails, Satisfied if any part is
    /// satisfied, otherwise Pending.
    ///
    /// Failure still wins so an unexpected error cannot hide behind an
    /// alternative that happens to be satisfied by the same snapshot.
    pub fn any(conditions: Vec<Condition>) -> Self {
        let description = join_descriptions(&conditions, " or ");
        Self::new(description, move |snap| {
            let mut satisfied = false;
            for c in &conditions {
                match c.evaluate(snap) {
                    Evaluation::Failed(reason) => {
                        return Evaluation::Failed(format!("{}: {}", c.description(), reason))
                    }
                    Evaluation::Satisfied => satisfied = true,
                    Evaluation::Pending => {}
                }
            }
            if satisfied {
                Evaluation::Satisfied
            } else {
                Evaluation::Pending
            }
        })
    }

    /// `self AND other`
    pub fn and(self, other: Condition) -> Self {
        Self::all(vec![self, other])
    }

    /// `self OR other`
    pub fn or(self, other: Condition) -> Self {
        Self::any(vec![self, other])
    }

    /// Treat transitioning errors whose message contains one of `substrings`
    /// as Pending instead of letting `self` judge them.
    ///
    /// For operations where the provider reports an error that later clears
    /// on its own (e.g. an upgrade requested while another is in flight).
    pub fn tolerating<I, S>(self, substrings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tolerated: Vec<String> = substrings.into_iter().map(Into::into).collect();
        let description = format!(
            "{} (tolerating errors containing {:?})",
            self.description, tolerated
        );
        Self::new(description, move |snap| match snap.error_message() {
            Some(msg) if tolerated.iter().any(|t| msg.contains(t.as_str())) => {
                Evaluation::Pending
            }
            _ => self.evaluate(snap),
        })
    }
}

fn join_descriptions(conditions: &[Condition], sep: &str) -> String {
    let parts: Vec<&str> = conditions.iter().map(|c| c.description()).collect();
    format!("({})", parts.join(sep))
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condition")
            .field("description", &self.description)
            .finish()
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description)
    }
}
