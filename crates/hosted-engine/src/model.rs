//! Cluster specification, mutation vocabulary and observed snapshots
//!
//! `ClusterSpec` is the provider-agnostic desired configuration. The engine
//! never edits one in place: new specifications come out of
//! [`ClusterChange::apply`] (called by drivers) or out of a driver's response.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use hosted_common::Error;

/// Windows Server LTSC node image
pub const WINDOWS_LTSC_IMAGE: &str = "WINDOWS_LTSC_CONTAINERD";

/// A managed node group (EKS) or node pool (GKE)
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroup {
    /// Natural identity of the group
    pub name: String,
    /// Desired number of nodes
    pub desired_size: u32,
    /// Autoscaling lower bound
    pub min_size: u32,
    /// Autoscaling upper bound
    pub max_size: u32,
    /// Node Kubernetes version; `None` follows the control plane
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_version: Option<String>,
    /// Node image family (e.g. `COS_CONTAINERD`, `WINDOWS_LTSC_CONTAINERD`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_type: Option<String>,
    /// Whether the provider autoscaler manages the group
    #[serde(default)]
    pub autoscaling: bool,
}

impl NodeGroup {
    /// A fixed-size group of `size` nodes
    pub fn new(name: impl Into<String>, size: u32) -> Self {
        Self {
            name: name.into(),
            desired_size: size,
            min_size: size.min(1),
            max_size: size.max(1),
            ..Default::default()
        }
    }

    /// Same group running `image_type`
    pub fn with_image_type(mut self, image_type: impl Into<String>) -> Self {
        self.image_type = Some(image_type.into());
        self
    }

    /// Whether the group runs a Windows image family
    pub fn is_windows(&self) -> bool {
        self.image_type
            .as_deref()
            .is_some_and(|image| image.to_ascii_uppercase().starts_with("WINDOWS"))
    }
}

/// Desired configuration of a hosted cluster
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Control-plane Kubernetes version
    pub kubernetes_version: String,
    /// Region or zone the cluster lives in
    #[serde(default)]
    pub region: String,
    /// Node groups, identified by name
    #[serde(default)]
    pub node_groups: Vec<NodeGroup>,
    /// Enabled control-plane log types
    #[serde(default)]
    pub logging_types: Vec<String>,
    /// Provider resource tags
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Kubernetes labels applied to nodes
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Public API endpoint access
    #[serde(default)]
    pub public_access: bool,
    /// Private API endpoint access
    #[serde(default)]
    pub private_access: bool,
    /// Logging service (GKE)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging_service: Option<String>,
    /// Monitoring service (GKE)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitoring_service: Option<String>,
}

impl ClusterSpec {
    /// Minimal spec with one node group
    pub fn new(kubernetes_version: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            kubernetes_version: kubernetes_version.into(),
            region: region.into(),
            node_groups: vec![NodeGroup::new("ranchernodes", 1)],
            public_access: true,
            ..Default::default()
        }
    }

    /// Look up a node group by name
    pub fn node_group(&self, name: &str) -> Option<&NodeGroup> {
        self.node_groups.iter().find(|g| g.name == name)
    }

    /// Serialize to the JSON form field paths address
    pub fn to_value(&self) -> serde_json::Value {
        // Every field is a plain string, number, bool, list or string map.
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Opaque identity of a created cluster plus the spec the driver last accepted
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ClusterHandle {
    /// Management-plane identity
    pub id: String,
    /// Locally generated cluster name
    pub name: String,
    /// Requested specification as accepted by the driver
    pub spec: ClusterSpec,
}

impl ClusterHandle {
    /// Build a handle
    pub fn new(id: impl Into<String>, name: impl Into<String>, spec: ClusterSpec) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            spec,
        }
    }

    /// Same identity, new requested spec
    pub fn with_spec(&self, spec: ClusterSpec) -> Self {
        Self {
            id: self.id.clone(),
            name: self.name.clone(),
            spec,
        }
    }
}

/// A single mutation a driver can apply to a running cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClusterChange {
    /// Change the desired size of one node group
    ScaleNodeGroup {
        /// Group to scale
        group: String,
        /// New desired size
        desired_size: u32,
    },
    /// Upgrade the control plane
    UpgradeControlPlane {
        /// Target version
        version: String,
    },
    /// Upgrade every node group
    UpgradeNodeGroups {
        /// Target version
        version: String,
    },
    /// Add a node group
    AddNodeGroup(NodeGroup),
    /// Remove a node group by name
    RemoveNodeGroup {
        /// Group to remove
        group: String,
    },
    /// Replace the enabled log types
    UpdateLogging {
        /// New log types
        types: Vec<String>,
    },
    /// Replace tags and labels
    UpdateTags {
        /// New provider tags
        tags: BTreeMap<String, String>,
        /// New node labels
        labels: BTreeMap<String, String>,
    },
    /// Change GKE logging/monitoring services
    UpdateServices {
        /// New logging service
        logging: Option<String>,
        /// New monitoring service
        monitoring: Option<String>,
    },
    /// Change API endpoint access
    UpdateEndpointAccess {
        /// Public endpoint
        public: bool,
        /// Private endpoint
        private: bool,
    },
    /// Turn the provider autoscaler on or off
    UpdateAutoscaling {
        /// Group to change; `None` changes every group
        group: Option<String>,
        /// Whether autoscaling is enabled
        enabled: bool,
    },
    /// Switch the node image
    UpdateImageType {
        /// Group to change; `None` changes every group
        group: Option<String>,
        /// New image type
        image_type: String,
    },
    /// Replace the whole spec
    Replace(ClusterSpec),
}

impl ClusterChange {
    /// Compute the spec that results from applying this change to `spec`.
    ///
    /// Returns a new value; `spec` is left untouched. Changes that reference
    /// unknown node groups, duplicate an existing group, remove the last
    /// group, or leave no Linux group are rejected as validation errors.
    pub fn apply(&self, cluster: &str, spec: &ClusterSpec) -> Result<ClusterSpec, Error> {
        let mut next = spec.clone();
        match self {
            ClusterChange::ScaleNodeGroup {
                group,
                desired_size,
            } => {
                let ng = next
                    .node_groups
                    .iter_mut()
                    .find(|g| &g.name == group)
                    .ok_or_else(|| unknown_group(cluster, group))?;
                ng.desired_size = *desired_size;
                ng.max_size = ng.max_size.max(*desired_size);
                ng.min_size = ng.min_size.min(*desired_size);
            }
            ClusterChange::UpgradeControlPlane { version } => {
                next.kubernetes_version = version.clone();
            }
            ClusterChange::UpgradeNodeGroups { version } => {
                for ng in &mut next.node_groups {
                    ng.kubernetes_version = Some(version.clone());
                }
            }
            ClusterChange::AddNodeGroup(group) => {
                if next.node_group(&group.name).is_some() {
                    return Err(Error::validation_for_field(
                        cluster,
                        format!("nodeGroups[{}]", group.name),
                        format!("node group {} already exists", group.name),
                    ));
                }
                next.node_groups.push(group.clone());
            }
            ClusterChange::RemoveNodeGroup { group } => {
                if next.node_group(group).is_none() {
                    return Err(unknown_group(cluster, group));
                }
                if next.node_groups.len() == 1 {
                    return Err(Error::validation(
                        cluster,
                        "cluster must keep at least one node group",
                    ));
                }
                next.node_groups.retain(|g| &g.name != group);
            }
            ClusterChange::UpdateLogging { types } => {
                next.logging_types = types.clone();
            }
            ClusterChange::UpdateTags { tags, labels } => {
                next.tags = tags.clone();
                next.labels = labels.clone();
            }
            ClusterChange::UpdateServices {
                logging,
                monitoring,
            } => {
                next.logging_service = logging.clone();
                next.monitoring_service = monitoring.clone();
            }
            ClusterChange::UpdateEndpointAccess { public, private } => {
                if !public && !private {
                    return Err(Error::validation(
                        cluster,
                        "public access, private access, or both must be enabled",
                    ));
                }
                next.public_access = *public;
                next.private_access = *private;
            }
            ClusterChange::UpdateAutoscaling { group, enabled } => {
                for ng in selected_groups(cluster, &mut next, group.as_deref())? {
                    ng.autoscaling = *enabled;
                }
            }
            ClusterChange::UpdateImageType { group, image_type } => {
                for ng in selected_groups(cluster, &mut next, group.as_deref())? {
                    ng.image_type = Some(image_type.clone());
                }
            }
            ClusterChange::Replace(spec) => {
                next = spec.clone();
            }
        }
        if !next.node_groups.is_empty() && next.node_groups.iter().all(NodeGroup::is_windows) {
            return Err(Error::validation_for_field(
                cluster,
                NODE_GROUPS_FIELD,
                "at least 1 Linux node pool is required",
            ));
        }
        Ok(next)
    }
}

const NODE_GROUPS_FIELD: &str = "nodeGroups";

fn selected_groups<'a>(
    cluster: &str,
    spec: &'a mut ClusterSpec,
    group: Option<&str>,
) -> Result<Vec<&'a mut NodeGroup>, Error> {
    match group {
        None => Ok(spec.node_groups.iter_mut().collect()),
        Some(name) => spec
            .node_groups
            .iter_mut()
            .find(|g| g.name == name)
            .map(|g| vec![g])
            .ok_or_else(|| unknown_group(cluster, name)),
    }
}

fn unknown_group(cluster: &str, group: &str) -> Error {
    Error::validation_for_field(
        cluster,
        format!("nodeGroups[{group}]"),
        format!("node group {group} does not exist"),
    )
}

impl fmt::Display for ClusterChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ScaleNodeGroup {
                group,
                desired_size,
            } => write!(f, "scale node group {group} to {desired_size}"),
            Self::UpgradeControlPlane { version } => {
                write!(f, "upgrade control plane to {version}")
            }
            Self::UpgradeNodeGroups { version } => write!(f, "upgrade node groups to {version}"),
            Self::AddNodeGroup(group) => write!(f, "add node group {}", group.name),
            Self::RemoveNodeGroup { group } => write!(f, "remove node group {group}"),
            Self::UpdateLogging { types } => write!(f, "update logging to [{}]", types.join(",")),
            Self::UpdateTags { .. } => write!(f, "update tags and labels"),
            Self::UpdateServices { .. } => write!(f, "update logging and monitoring services"),
            Self::UpdateEndpointAccess { public, private } => {
                write!(f, "update endpoint access public={public} private={private}")
            }
            Self::UpdateAutoscaling { group, enabled } => {
                let verb = if *enabled { "enable" } else { "disable" };
                match group {
                    Some(group) => write!(f, "{verb} autoscaling on {group}"),
                    None => write!(f, "{verb} autoscaling on every node group"),
                }
            }
            Self::UpdateImageType { group, image_type } => match group {
                Some(group) => write!(f, "switch {group} to image {image_type}"),
                None => write!(f, "switch every node group to image {image_type}"),
            },
            Self::Replace(_) => write!(f, "replace cluster spec"),
        }
    }
}

/// The management plane's transitioning marker
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum Transitioning {
    /// Settled
    #[default]
    No,
    /// An operation is in flight
    Yes,
    /// The current operation failed; see the transitioning message
    Error,
}

impl Transitioning {
    /// Parse the raw marker (`""`, `"no"`, `"yes"`, `"error"`)
    pub fn parse(raw: &str) -> Self {
        match raw.to_lowercase().as_str() {
            "yes" => Self::Yes,
            "error" => Self::Error,
            _ => Self::No,
        }
    }
}

/// Raw fields read from the management plane for an existing cluster
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ObservedCluster {
    /// Raw state string (`provisioning`, `active`, `updating`, ...)
    pub state: String,
    /// Transitioning marker
    pub transitioning: Transitioning,
    /// Message accompanying the marker, empty when settled
    pub transitioning_message: String,
    /// Last requested desired configuration
    pub specification: ClusterSpec,
    /// Provider's converged view, absent until the first sync
    pub upstream_specification: Option<ClusterSpec>,
}

impl ObservedCluster {
    /// A settled cluster in `state` whose upstream view matches `spec`
    pub fn settled(state: impl Into<String>, spec: ClusterSpec) -> Self {
        Self {
            state: state.into(),
            transitioning: Transitioning::No,
            transitioning_message: String::new(),
            upstream_specification: Some(spec.clone()),
            specification: spec,
        }
    }

    /// An in-flight cluster in `state`
    pub fn transitioning(state: impl Into<String>, spec: ClusterSpec) -> Self {
        Self {
            state: state.into(),
            transitioning: Transitioning::Yes,
            transitioning_message: String::new(),
            upstream_specification: None,
            specification: spec,
        }
    }

    /// A cluster whose current operation failed with `message`
    pub fn errored(state: impl Into<String>, message: impl Into<String>, spec: ClusterSpec) -> Self {
        Self {
            state: state.into(),
            transitioning: Transitioning::Error,
            transitioning_message: message.into(),
            upstream_specification: None,
            specification: spec,
        }
    }

    /// Replace the upstream view
    pub fn with_upstream(mut self, upstream: Option<ClusterSpec>) -> Self {
        self.upstream_specification = upstream;
        self
    }
}

/// Immutable point-in-time read of one cluster
///
/// `cluster == None` is the not-found sentinel: the lookup succeeded and the
/// management plane has no record of the identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    /// Identity that was looked up
    pub id: String,
    /// When the read completed
    pub observed_at: DateTime<Utc>,
    /// Observed fields, `None` when not found
    pub cluster: Option<ObservedCluster>,
}

impl Snapshot {
    /// A snapshot of an existing cluster
    pub fn found(id: impl Into<String>, cluster: ObservedCluster) -> Self {
        Self {
            id: id.into(),
            observed_at: Utc::now(),
            cluster: Some(cluster),
        }
    }

    /// The not-found sentinel
    pub fn not_found(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            observed_at: Utc::now(),
            cluster: None,
        }
    }

    /// Whether the lookup found nothing
    pub fn is_not_found(&self) -> bool {
        self.cluster.is_none()
    }

    /// The error message if the current operation failed
    pub fn error_message(&self) -> Option<&str> {
        self.cluster
            .as_ref()
            .filter(|c| c.transitioning == Transitioning::Error)
            .map(|c| c.transitioning_message.as_str())
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cluster {
            None => write!(f, "{} not found at {}", self.id, self.observed_at.to_rfc3339()),
            Some(c) => {
                write!(
                    f,
                    "{} state={} transitioning={:?}",
                    self.id, c.state, c.transitioning
                )?;
                if !c.transitioning_message.is_empty() {
                    write!(f, " message={:?}", c.transitioning_message)?;
                }
                write!(f, " at {}", self.observed_at.to_rfc3339())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ClusterSpec {
        let mut spec = ClusterSpec::new("1.30", "us-west-2");
        spec.node_groups.push(NodeGroup::new("ng-b", 3));
        spec
    }

    #[test]
    fn apply_returns_new_spec_and_leaves_input_untouched() {
        let before = spec();
        let after = ClusterChange::ScaleNodeGroup {
            group: "ranchernodes".into(),
            desired_size: 4,
        }
        .apply("c1", &before)
        .unwrap();

        assert_eq!(before, spec());
        assert_eq!(after.node_group("ranchernodes").unwrap().desired_size, 4);
        assert_eq!(after.node_group("ranchernodes").unwrap().max_size, 4);
    }

    #[test]
    fn scaling_an_unknown_group_is_rejected() {
        let err = ClusterChange::ScaleNodeGroup {
            group: "missing".into(),
            desired_size: 2,
        }
        .apply("c1", &spec())
        .unwrap_err();
        assert!(matches!(err, Error::Validation { field: Some(ref f), .. } if f == "nodeGroups[missing]"));
    }

    #[test]
    fn last_node_group_cannot_be_removed() {
        let single = ClusterSpec::new("1.30", "us-west-2");
        let err = ClusterChange::RemoveNodeGroup {
            group: "ranchernodes".into(),
        }
        .apply("c1", &single)
        .unwrap_err();
        assert!(err.to_string().contains("at least one node group"));
    }

    #[test]
    fn adding_a_duplicate_group_is_rejected() {
        let err = ClusterChange::AddNodeGroup(NodeGroup::new("ng-b", 1))
            .apply("c1", &spec())
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn disabling_both_endpoints_is_rejected() {
        let err = ClusterChange::UpdateEndpointAccess {
            public: false,
            private: false,
        }
        .apply("c1", &spec())
        .unwrap_err();
        assert!(err.to_string().contains("public access, private access, or both"));
    }

    #[test]
    fn node_group_upgrade_touches_every_group() {
        let after = ClusterChange::UpgradeNodeGroups {
            version: "1.31".into(),
        }
        .apply("c1", &spec())
        .unwrap();
        assert!(after
            .node_groups
            .iter()
            .all(|g| g.kubernetes_version.as_deref() == Some("1.31")));
        assert_eq!(after.kubernetes_version, "1.30");
    }

    #[test]
    fn autoscaling_toggles_one_group_or_all() {
        let one = ClusterChange::UpdateAutoscaling {
            group: Some("ng-b".into()),
            enabled: true,
        }
        .apply("c1", &spec())
        .unwrap();
        assert!(one.node_group("ng-b").unwrap().autoscaling);
        assert!(!one.node_group("ranchernodes").unwrap().autoscaling);

        let all = ClusterChange::UpdateAutoscaling {
            group: None,
            enabled: true,
        }
        .apply("c1", &spec())
        .unwrap();
        assert!(all.node_groups.iter().all(|g| g.autoscaling));
    }

    #[test]
    fn windows_group_next_to_a_linux_group_is_accepted() {
        let windows = NodeGroup::new("win", 1).with_image_type(WINDOWS_LTSC_IMAGE);
        assert!(windows.is_windows());
        let after = ClusterChange::AddNodeGroup(windows).apply("c1", &spec()).unwrap();
        assert_eq!(after.node_groups.iter().filter(|g| g.is_windows()).count(), 1);

        let one = ClusterChange::UpdateImageType {
            group: Some("ng-b".into()),
            image_type: WINDOWS_LTSC_IMAGE.into(),
        }
        .apply("c1", &spec())
        .unwrap();
        assert!(one.node_group("ng-b").unwrap().is_windows());
    }

    #[test]
    fn switching_every_group_to_windows_is_rejected() {
        let err = ClusterChange::UpdateImageType {
            group: None,
            image_type: WINDOWS_LTSC_IMAGE.into(),
        }
        .apply("c1", &spec())
        .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(err.to_string().contains("at least 1 Linux node pool is required"));
    }

    #[test]
    fn image_switch_on_an_unknown_group_is_rejected() {
        let err = ClusterChange::UpdateImageType {
            group: Some("missing".into()),
            image_type: "COS_CONTAINERD".into(),
        }
        .apply("c1", &spec())
        .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn transitioning_marker_parses_raw_values() {
        assert_eq!(Transitioning::parse(""), Transitioning::No);
        assert_eq!(Transitioning::parse("no"), Transitioning::No);
        assert_eq!(Transitioning::parse("yes"), Transitioning::Yes);
        assert_eq!(Transitioning::parse("Error"), Transitioning::Error);
    }

    #[test]
    fn spec_serializes_with_camel_case_paths() {
        let value = spec().to_value();
        assert_eq!(value["kubernetesVersion"], "1.30");
        assert_eq!(value["nodeGroups"][1]["desiredSize"], 3);
    }

    #[test]
    fn snapshot_display_includes_error_message() {
        let snap = Snapshot::found(
            "c-1",
            ObservedCluster::errored("provisioning", "bad config", spec()),
        );
        let text = snap.to_string();
        assert!(text.contains("state=provisioning"));
        assert!(text.contains("bad config"));
        assert_eq!(snap.error_message(), Some("bad config"));
        assert!(Snapshot::not_found("c-1").to_string().contains("not found"));
    }
}
