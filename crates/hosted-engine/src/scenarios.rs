//! Ready-made lifecycle scenarios
//!
//! Each constructor returns a [`Workflow`] built from the built-in steps. The
//! cluster name, timings and cleanup policy come from the
//! [`WorkflowContext`](crate::context::WorkflowContext) the workflow runs
//! against, so the same scenario runs unchanged against any provider.

use std::collections::BTreeMap;

use crate::drift::{self, FieldPath};
use crate::model::{ClusterChange, ClusterSpec, NodeGroup, WINDOWS_LTSC_IMAGE};
use crate::state;
use crate::steps::{
    AwaitCondition, Budget, CreateCluster, DeleteCluster, ExpectRejected, MutateCluster, Rejected,
    VerifyConverged,
};
use crate::workflow::Workflow;

/// Transitioning message shown while a previous update is still in flight
pub const UPDATE_IN_PROGRESS: &str = "in progress";

/// Transitioning message of a create that reuses a name still being deleted
pub const NAME_IN_USE: &str = "exists with the same name";

/// Synchronous rejection of a spec without a Linux node group
pub const LINUX_POOL_REQUIRED: &str = "at least 1 Linux node pool is required";

/// Transitioning message of a node group moved across image families
pub const IMAGE_FAMILY_SWITCH: &str =
    "Node pools cannot be upgraded between Windows and non-Windows image families";

fn primary_group(spec: &ClusterSpec) -> NodeGroup {
    spec.node_groups
        .first()
        .cloned()
        .unwrap_or_else(|| NodeGroup::new("ranchernodes", 1))
}

/// Create, verify the converged spec, delete
pub fn provision_and_verify(spec: ClusterSpec) -> Workflow {
    Workflow::new("provision and verify")
        .step(CreateCluster::new(spec))
        .step(VerifyConverged::new(vec![
            drift::KUBERNETES_VERSION.into(),
            drift::NODE_GROUPS.into(),
        ]))
        .step(DeleteCluster::new())
}

/// Scale the first node group up and back down, then add and remove a group
pub fn node_group_lifecycle(spec: ClusterSpec) -> Workflow {
    let primary = primary_group(&spec);
    let extra = NodeGroup::new(format!("{}-extra", primary.name), 1);
    Workflow::new("node group lifecycle")
        .step(CreateCluster::new(spec))
        .step(MutateCluster::new(ClusterChange::ScaleNodeGroup {
            group: primary.name.clone(),
            desired_size: primary.desired_size + 1,
        }))
        .step(MutateCluster::new(ClusterChange::ScaleNodeGroup {
            group: primary.name.clone(),
            desired_size: primary.desired_size,
        }))
        .step(MutateCluster::new(ClusterChange::AddNodeGroup(extra.clone())))
        .step(MutateCluster::new(ClusterChange::RemoveNodeGroup { group: extra.name }))
        .step(VerifyConverged::new(vec![drift::NODE_GROUPS.into()]))
}

/// Upgrade the control plane, then every node group
pub fn upgrade_kubernetes(spec: ClusterSpec, target_version: &str) -> Workflow {
    Workflow::new(format!("upgrade kubernetes to {target_version}"))
        .step(CreateCluster::new(spec))
        .step(MutateCluster::new(ClusterChange::UpgradeControlPlane {
            version: target_version.to_string(),
        }))
        .step(MutateCluster::new(ClusterChange::UpgradeNodeGroups {
            version: target_version.to_string(),
        }))
}

/// Request a second change while the first is still being applied.
///
/// The provider may report the overlap as a transitioning error; that error
/// clears on its own, so the second wait tolerates it.
pub fn update_while_updating(spec: ClusterSpec, target_version: &str) -> Workflow {
    let primary = primary_group(&spec);
    Workflow::new("update while updating")
        .step(CreateCluster::new(spec))
        .step(
            MutateCluster::new(ClusterChange::UpgradeControlPlane {
                version: target_version.to_string(),
            })
            .no_wait(),
        )
        .step(
            MutateCluster::new(ClusterChange::ScaleNodeGroup {
                group: primary.name.clone(),
                desired_size: primary.desired_size + 1,
            })
            .tolerating(UPDATE_IN_PROGRESS),
        )
        .step(VerifyConverged::new(vec![
            drift::KUBERNETES_VERSION.into(),
            FieldPath::node_group(&primary.name, "desiredSize"),
        ]))
}

/// Create with a configuration the provider accepts but cannot provision,
/// and wait for the matching transitioning error
pub fn invalid_config_reports_error(spec: ClusterSpec, expected_error: &str) -> Workflow {
    Workflow::new(format!("invalid config reports {expected_error:?}"))
        .step(CreateCluster::new(spec).without_wait())
        .step(AwaitCondition::new(
            state::matches_error(expected_error),
            Budget::Error,
        ))
}

/// Create requests the provider must refuse outright
pub fn invalid_create_rejected(spec: ClusterSpec, name: &str, expected_error: &str) -> Workflow {
    Workflow::new(format!("create {name} rejected"))
        .step(ExpectRejected::new(
            Rejected::Create {
                name: Some(name.to_string()),
                spec,
            },
            expected_error,
        ))
}

/// Importing the same cluster twice must fail
pub fn reimport_fails(spec: ClusterSpec) -> Workflow {
    Workflow::new("reimport fails")
        .step(CreateCluster::import(spec.clone()))
        .step(ExpectRejected::new(
            Rejected::Create { name: None, spec },
            "already exists",
        ))
}

/// Disabling both API endpoints must be refused
pub fn endpoint_access_rejected(spec: ClusterSpec) -> Workflow {
    Workflow::new("endpoint access rejected")
        .step(CreateCluster::new(spec))
        .step(ExpectRejected::new(
            Rejected::Mutate(ClusterChange::UpdateEndpointAccess {
                public: false,
                private: false,
            }),
            "public access, private access, or both",
        ))
}

/// Replace log types, then tags and labels
pub fn update_logging_and_tags(spec: ClusterSpec) -> Workflow {
    let tags = BTreeMap::from([
        ("owner".to_string(), "hosted-providers-e2e".to_string()),
        ("purpose".to_string(), "ci".to_string()),
    ]);
    let labels = BTreeMap::from([("team".to_string(), "qa".to_string())]);
    Workflow::new("update logging and tags")
        .step(CreateCluster::new(spec))
        .step(MutateCluster::new(ClusterChange::UpdateLogging {
            types: vec!["api".to_string(), "audit".to_string()],
        }))
        .step(MutateCluster::new(ClusterChange::UpdateTags { tags, labels }))
}

/// Change GKE logging and monitoring services together
pub fn update_services(spec: ClusterSpec, logging: &str, monitoring: &str) -> Workflow {
    Workflow::new("update logging and monitoring services")
        .step(CreateCluster::new(spec))
        .step(MutateCluster::new(ClusterChange::UpdateServices {
            logging: Some(logging.to_string()),
            monitoring: Some(monitoring.to_string()),
        }))
}

/// Delete the cluster and create it again under the same name
pub fn delete_and_recreate(spec: ClusterSpec) -> Workflow {
    Workflow::new("delete and recreate")
        .step(CreateCluster::new(spec.clone()))
        .step(DeleteCluster::new())
        .step(CreateCluster::new(spec))
        .step(VerifyConverged::new(vec![drift::NODE_GROUPS.into()]))
}

/// Create again while the previous cluster is still being deleted.
///
/// The provider first reports the name as taken, then provisions the new
/// cluster once the old one is gone.
pub fn recreate_while_deleting(spec: ClusterSpec) -> Workflow {
    Workflow::new("recreate while deleting")
        .step(CreateCluster::new(spec.clone()))
        .step(DeleteCluster::new().without_wait())
        .step(
            AwaitCondition::new(state::in_state(state::ResourceState::Deleting), Budget::Delete)
                .named("await deletion started"),
        )
        .step(CreateCluster::new(spec).without_wait().named("recreate cluster"))
        .step(
            AwaitCondition::new(state::matches_error(NAME_IN_USE), Budget::Error)
                .named("await name in use error"),
        )
        .step(
            AwaitCondition::new(state::is_active().tolerating([NAME_IN_USE]), Budget::Ready)
                .named("await recreated cluster active"),
        )
}

/// Delete a cluster that is still provisioning
pub fn delete_while_provisioning(spec: ClusterSpec) -> Workflow {
    Workflow::new("delete while provisioning")
        .step(CreateCluster::new(spec).without_wait())
        .step(AwaitCondition::new(state::exists(), Budget::Ready).named("await cluster exists"))
        .step(DeleteCluster::new())
}

/// Enable autoscaling on every node group, then disable it again
pub fn update_autoscaling(spec: ClusterSpec) -> Workflow {
    Workflow::new("update autoscaling")
        .step(CreateCluster::new(spec))
        .step(MutateCluster::new(ClusterChange::UpdateAutoscaling {
            group: None,
            enabled: true,
        }))
        .step(MutateCluster::new(ClusterChange::UpdateAutoscaling {
            group: None,
            enabled: false,
        }))
}

/// Add a Windows node group next to the existing Linux ones
pub fn add_windows_node_group(spec: ClusterSpec) -> Workflow {
    let windows = NodeGroup::new("windowspool", 1).with_image_type(WINDOWS_LTSC_IMAGE);
    Workflow::new("add windows node group")
        .step(CreateCluster::new(spec))
        .step(MutateCluster::new(ClusterChange::AddNodeGroup(windows)))
}

/// Moving every node group to Windows must be refused
pub fn all_windows_rejected(spec: ClusterSpec) -> Workflow {
    Workflow::new("all windows rejected")
        .step(CreateCluster::new(spec))
        .step(ExpectRejected::new(
            Rejected::Mutate(ClusterChange::UpdateImageType {
                group: None,
                image_type: WINDOWS_LTSC_IMAGE.to_string(),
            }),
            LINUX_POOL_REQUIRED,
        ))
}

/// Switch one Linux node group to a Windows image and wait for the
/// provider to report the failure.
///
/// A second Linux group is added when `spec` has only one, so the switch
/// is not refused for leaving no Linux group.
pub fn windows_image_switch_reports_error(mut spec: ClusterSpec) -> Workflow {
    let primary = primary_group(&spec);
    if spec.node_groups.len() < 2 {
        spec.node_groups
            .push(NodeGroup::new(format!("{}-linux", primary.name), 1));
    }
    Workflow::new("windows image switch reports error")
        .step(CreateCluster::new(spec))
        .step(
            MutateCluster::new(ClusterChange::UpdateImageType {
                group: Some(primary.name),
                image_type: WINDOWS_LTSC_IMAGE.to_string(),
            })
            .no_wait(),
        )
        .step(
            AwaitCondition::new(state::matches_error(IMAGE_FAMILY_SWITCH), Budget::Error)
                .named("await image family error"),
        )
}
