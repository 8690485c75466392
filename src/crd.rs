use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const READY_CONDITION: &str = "Ready";
pub const CONTROL_PLANE_READY_CONDITION: &str = "ControlPlaneReady";
pub const INFRASTRUCTURE_READY_CONDITION: &str = "InfrastructureReady";
pub const AVAILABLE_CONDITION: &str = "Available";

pub const SEVERITY_ERROR: &str = "Error";

/// Label set on every object that belongs to a cluster.
pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";
/// Present on machines that run the control plane.
pub const CONTROL_PLANE_MACHINE_LABEL: &str = "cluster.x-k8s.io/control-plane";

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    pub severity: Option<String>,
    pub reason: Option<String>,
    pub message: Option<String>,
    pub last_transition_time: Option<String>,
}

impl Condition {
    pub fn reason(&self) -> &str {
        self.reason.as_deref().unwrap_or_default()
    }

    pub fn message(&self) -> &str {
        self.message.as_deref().unwrap_or_default()
    }
}

/// Read access to the conditions carried in an object's status.
pub trait HasConditions {
    fn conditions(&self) -> &[Condition];

    fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions().iter().find(|c| c.type_ == type_)
    }

    fn is_condition_true(&self, type_: &str) -> bool {
        self.condition(type_).is_some_and(|c| c.status == "True")
    }

    fn is_condition_false(&self, type_: &str) -> bool {
        self.condition(type_).is_some_and(|c| c.status == "False")
    }

    /// The condition, if it is False with severity Error. Such a condition
    /// will not heal by waiting.
    fn failed_condition(&self, type_: &str) -> Option<&Condition> {
        self.condition(type_)
            .filter(|c| c.status == "False" && c.severity.as_deref() == Some(SEVERITY_ERROR))
    }

    fn condition_reason(&self, type_: &str) -> &str {
        self.condition(type_).map(Condition::reason).unwrap_or_default()
    }

    fn condition_message(&self, type_: &str) -> &str {
        self.condition(type_).map(Condition::message).unwrap_or_default()
    }

    fn last_transition_time(&self, type_: &str) -> Option<&str> {
        self.condition(type_)?.last_transition_time.as_deref()
    }
}

#[derive(CustomResource, Serialize, Deserialize, Clone, PartialEq, Debug, JsonSchema, Default)]
#[kube(group = "cluster.x-k8s.io", version = "v1beta1", kind = "Cluster", namespaced)]
#[kube(status = "ClusterStatus")]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    pub paused: Option<bool>,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    pub phase: Option<String>,
    #[serde(default)]
    pub infrastructure_ready: bool,
    #[serde(default)]
    pub control_plane_ready: bool,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl HasConditions for Cluster {
    fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map(|s| s.conditions.as_slice()).unwrap_or_default()
    }
}

#[derive(CustomResource, Serialize, Deserialize, Clone, PartialEq, Debug, JsonSchema, Default)]
#[kube(
    group = "controlplane.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "KubeadmControlPlane",
    namespaced
)]
#[kube(status = "ControlPlaneStatus")]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneSpec {
    pub replicas: Option<i32>,
    #[serde(default)]
    pub version: String,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneStatus {
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub ready_replicas: i32,
    #[serde(default)]
    pub updated_replicas: i32,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl HasConditions for KubeadmControlPlane {
    fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map(|s| s.conditions.as_slice()).unwrap_or_default()
    }
}

impl KubeadmControlPlane {
    pub fn desired_replicas(&self) -> i32 {
        self.spec.replicas.unwrap_or(1)
    }
}

#[derive(CustomResource, Serialize, Deserialize, Clone, PartialEq, Debug, JsonSchema, Default)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1beta1",
    kind = "MachineDeployment",
    namespaced
)]
#[kube(status = "MachineDeploymentStatus")]
#[serde(rename_all = "camelCase")]
pub struct MachineDeploymentSpec {
    #[serde(default)]
    pub cluster_name: String,
    pub replicas: Option<i32>,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct MachineDeploymentStatus {
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub ready_replicas: i32,
    #[serde(default)]
    pub updated_replicas: i32,
}

/// Replica counts of a worker pool, compared tick over tick.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct ReplicaCounts {
    pub desired: i32,
    pub total: i32,
    pub ready: i32,
    pub updated: i32,
}

impl MachineDeployment {
    pub fn replica_counts(&self) -> ReplicaCounts {
        let status = self.status.clone().unwrap_or_default();
        ReplicaCounts {
            desired: self.spec.replicas.unwrap_or(1),
            total: status.replicas,
            ready: status.ready_replicas,
            updated: status.updated_replicas,
        }
    }
}

#[derive(CustomResource, Serialize, Deserialize, Clone, PartialEq, Debug, JsonSchema, Default)]
#[kube(group = "cluster.x-k8s.io", version = "v1beta1", kind = "Machine", namespaced)]
#[kube(status = "MachineStatus")]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    #[serde(default)]
    pub cluster_name: String,
    pub version: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    pub phase: Option<String>,
    pub node_ref: Option<NodeReference>,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeReference {
    pub name: String,
}

impl Machine {
    pub fn is_control_plane(&self) -> bool {
        self.metadata
            .labels
            .as_ref()
            .is_some_and(|labels| labels.contains_key(CONTROL_PLANE_MACHINE_LABEL))
    }

    pub fn phase(&self) -> &str {
        self.status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or_default()
    }

    pub fn has_node(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.node_ref.is_some())
    }
}

/// Lifecycle phase reported by a supervisor-managed cluster.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub enum ManagedClusterPhase {
    Creating,
    Running,
    Updating,
    UpdateFailed,
    Deleting,
    Failed,
    #[default]
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for ManagedClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let phase = match self {
            ManagedClusterPhase::Creating => "creating",
            ManagedClusterPhase::Running => "running",
            ManagedClusterPhase::Updating => "updating",
            ManagedClusterPhase::UpdateFailed => "updateFailed",
            ManagedClusterPhase::Deleting => "deleting",
            ManagedClusterPhase::Failed => "failed",
            ManagedClusterPhase::Unknown => "unknown",
        };
        write!(f, "{}", phase)
    }
}

#[derive(CustomResource, Serialize, Deserialize, Clone, PartialEq, Debug, JsonSchema, Default)]
#[kube(
    group = "run.tanzu.vmware.com",
    version = "v1alpha2",
    kind = "TanzuKubernetesCluster",
    namespaced
)]
#[kube(status = "ManagedClusterStatus")]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterSpec {
    pub distribution: Option<Distribution>,
    #[serde(default)]
    pub settings: BTreeMap<String, serde_json::Value>,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct Distribution {
    pub version: Option<String>,
    pub full_version: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterStatus {
    #[serde(default)]
    pub phase: ManagedClusterPhase,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl HasConditions for TanzuKubernetesCluster {
    fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map(|s| s.conditions.as_slice()).unwrap_or_default()
    }
}

impl TanzuKubernetesCluster {
    pub fn phase(&self) -> ManagedClusterPhase {
        self.status.as_ref().map(|s| s.phase.clone()).unwrap_or_default()
    }
}

/// Carvel package metadata, used to resolve a bootstrap package's short name.
#[derive(CustomResource, Serialize, Deserialize, Clone, PartialEq, Debug, JsonSchema, Default)]
#[kube(
    group = "data.packaging.carvel.dev",
    version = "v1alpha1",
    kind = "Package",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct PackageSpec {
    #[serde(default)]
    pub ref_name: String,
    #[serde(default)]
    pub version: String,
}
