//! Field-by-field comparison of expected and converged specifications
//!
//! Fields are addressed by [`FieldPath`]s into the camelCase JSON form of a
//! [`ClusterSpec`]. Collections are compared by identity, not position: a
//! list of objects carrying a `name` becomes a map keyed by that name, and a
//! list of scalars becomes a set. Providers routinely return node groups and
//! log types in their own order, and that must not count as drift.
//! Repeats are kept: two groups sharing a name, or a log type listed twice,
//! differ from the collapsed form.

use std::fmt;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::model::{ClusterSpec, Snapshot};

/// Control-plane Kubernetes version
pub const KUBERNETES_VERSION: &str = "kubernetesVersion";
/// All node groups, keyed by name
pub const NODE_GROUPS: &str = "nodeGroups";
/// Enabled log types, as a set
pub const LOGGING_TYPES: &str = "loggingTypes";
/// Provider tags
pub const TAGS: &str = "tags";
/// Node labels
pub const LABELS: &str = "labels";
/// Public endpoint access
pub const PUBLIC_ACCESS: &str = "publicAccess";
/// Private endpoint access
pub const PRIVATE_ACCESS: &str = "privateAccess";
/// GKE logging service
pub const LOGGING_SERVICE: &str = "loggingService";
/// GKE monitoring service
pub const MONITORING_SERVICE: &str = "monitoringService";

/// Key used to identify elements of object collections
const IDENTITY_KEY: &str = "name";

#[derive(Clone, Debug, PartialEq, Eq)]
enum Segment {
    Key(String),
    Keyed { key: String, name: String },
}

/// Dotted path into a spec, e.g. `nodeGroups[ng-1].desiredSize`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldPath {
    raw: String,
    segments: Vec<Segment>,
}

impl FieldPath {
    /// Parse a path. `key[name]` selects the element of collection `key`
    /// whose `name` equals `name`.
    pub fn new(path: impl Into<String>) -> Self {
        let raw = path.into();
        let segments = raw
            .split('.')
            .filter(|s| !s.is_empty())
            .map(|seg| match seg.split_once('[') {
                Some((key, rest)) if rest.ends_with(']') => Segment::Keyed {
                    key: key.to_string(),
                    name: rest[..rest.len() - 1].to_string(),
                },
                _ => Segment::Key(seg.to_string()),
            })
            .collect();
        Self { raw, segments }
    }

    /// Path of one field of one node group
    pub fn node_group(group: &str, field: &str) -> Self {
        Self::new(format!("{NODE_GROUPS}[{group}].{field}"))
    }

    /// The path as written
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Resolve against a JSON value; `None` when any segment is absent
    pub fn resolve<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        let mut current = root;
        for segment in &self.segments {
            current = match segment {
                Segment::Key(key) => current.get(key)?,
                Segment::Keyed { key, name } => current
                    .get(key)?
                    .as_array()?
                    .iter()
                    .find(|item| {
                        item.get(IDENTITY_KEY).and_then(Value::as_str) == Some(name.as_str())
                    })?,
            };
        }
        Some(current)
    }
}

impl From<&str> for FieldPath {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Expected and converged specifications disagree
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DriftError {
    /// The field resolves differently on each side
    #[error("drift on {field}: expected {expected}, observed {actual}")]
    Mismatch {
        /// First mismatching field
        field: String,
        /// Expected value (`null` when absent)
        expected: Value,
        /// Converged value (`null` when absent)
        actual: Value,
    },

    /// The field exists on neither side, so nothing was compared
    #[error("field {field} exists in neither the expected nor the observed spec")]
    MissingField {
        /// Unresolvable path
        field: String,
    },

    /// The snapshot has no converged view to compare against
    #[error("cluster {cluster} has no converged upstream spec yet")]
    Unobserved {
        /// Identity of the cluster
        cluster: String,
    },
}

/// Compare `fields` of `expected` against `actual`.
///
/// Fields are checked in the order given; the first mismatch is returned.
/// Nothing outside `fields` is compared.
pub fn check_converged(
    expected: &ClusterSpec,
    actual: &ClusterSpec,
    fields: &[FieldPath],
) -> Result<(), DriftError> {
    let expected = expected.to_value();
    let actual = actual.to_value();
    for field in fields {
        compare_field(field, &expected, &actual)?;
    }
    Ok(())
}

/// Compare `fields` of `expected` against the snapshot's upstream spec
pub fn check_snapshot(
    expected: &ClusterSpec,
    snapshot: &Snapshot,
    fields: &[FieldPath],
) -> Result<(), DriftError> {
    let upstream = snapshot
        .cluster
        .as_ref()
        .and_then(|c| c.upstream_specification.as_ref())
        .ok_or_else(|| DriftError::Unobserved {
            cluster: snapshot.id.clone(),
        })?;
    check_converged(expected, upstream, fields)
}

/// Whether `field` of `spec` equals `expected` under collection-aware equality
pub fn field_matches(spec: &ClusterSpec, field: &FieldPath, expected: &Value) -> bool {
    let value = spec.to_value();
    match field.resolve(&value) {
        Some(actual) => normalize(actual) == normalize(expected),
        None => expected.is_null(),
    }
}

fn compare_field(field: &FieldPath, expected: &Value, actual: &Value) -> Result<(), DriftError> {
    match (field.resolve(expected), field.resolve(actual)) {
        (None, None) => Err(DriftError::MissingField {
            field: field.to_string(),
        }),
        (e, a) => {
            let e = e.map(normalize).unwrap_or(Value::Null);
            let a = a.map(normalize).unwrap_or(Value::Null);
            if e == a {
                Ok(())
            } else {
                Err(DriftError::Mismatch {
                    field: field.to_string(),
                    expected: e,
                    actual: a,
                })
            }
        }
    }
}

/// Canonical form for order-independent comparison
fn normalize(value: &Value) -> Value {
    match value {
        Value::Array(items) if is_identified_collection(items) => {
            let mut keyed = Map::new();
            for item in items {
                let Some(name) = item.get(IDENTITY_KEY).and_then(Value::as_str) else {
                    continue;
                };
                let mut key = name.to_string();
                let mut occurrence = 1;
                while keyed.contains_key(&key) {
                    occurrence += 1;
                    key = format!("{name}#{occurrence}");
                }
                keyed.insert(key, normalize(item));
            }
            Value::Object(keyed)
        }
        Value::Array(items) => {
            let mut normalized: Vec<Value> = items.iter().map(normalize).collect();
            normalized.sort_by_key(|v| v.to_string());
            Value::Array(normalized)
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), normalize(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn is_identified_collection(items: &[Value]) -> bool {
    !items.is_empty()
        && items
            .iter()
            .all(|item| item.get(IDENTITY_KEY).and_then(Value::as_str).is_some())
}
