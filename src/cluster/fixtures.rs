use std::collections::BTreeMap;

use crate::crd::{
    Cluster, ClusterSpec, ClusterStatus, Condition, ControlPlaneSpec, ControlPlaneStatus,
    KubeadmControlPlane, Machine, MachineDeployment, MachineDeploymentSpec,
    MachineDeploymentStatus, MachineSpec, MachineStatus, NodeReference, CLUSTER_NAME_LABEL,
    CONTROL_PLANE_MACHINE_LABEL,
};
use crate::testing::FakeAccessor;

pub const NAMESPACE: &str = "default";

fn cluster_labels(cluster: &str) -> Option<BTreeMap<String, String>> {
    Some(BTreeMap::from([(CLUSTER_NAME_LABEL.to_string(), cluster.to_string())]))
}

pub fn condition(type_: &str, status: &str, severity: Option<&str>, ltt: &str) -> Condition {
    Condition {
        type_: type_.into(),
        status: status.into(),
        severity: severity.map(Into::into),
        reason: Some(format!("{type_}Reason")),
        message: Some(format!("{type_} is {status}")),
        last_transition_time: Some(ltt.into()),
    }
}

pub fn cluster(name: &str, infra: bool, control_plane: bool, conditions: Vec<Condition>) -> Cluster {
    let mut cluster = Cluster::new(name, ClusterSpec::default());
    cluster.status = Some(ClusterStatus {
        phase: Some("Provisioning".into()),
        infrastructure_ready: infra,
        control_plane_ready: control_plane,
        conditions,
    });
    cluster
}

/// Seed a cluster that is still provisioning.
pub fn seed_cluster(fake: &FakeAccessor, name: &str) {
    fake.seed(
        NAMESPACE,
        &cluster(
            name,
            false,
            false,
            vec![condition("Ready", "False", Some("Info"), "2023-01-01T00:00:00Z")],
        ),
    );
}

pub fn control_plane(cluster: &str, replicas: i32, ready: i32) -> KubeadmControlPlane {
    let mut kcp = KubeadmControlPlane::new(
        &format!("{cluster}-control-plane"),
        ControlPlaneSpec {
            replicas: Some(replicas),
            version: "v1.26.5+vmware.1".into(),
        },
    );
    kcp.metadata.labels = cluster_labels(cluster);
    kcp.status = Some(ControlPlaneStatus {
        replicas,
        ready_replicas: ready,
        updated_replicas: ready,
        conditions: vec![],
    });
    kcp
}

pub fn worker_pool(
    cluster: &str,
    name: &str,
    desired: i32,
    total: i32,
    ready: i32,
    updated: i32,
) -> MachineDeployment {
    let mut md = MachineDeployment::new(
        name,
        MachineDeploymentSpec {
            cluster_name: cluster.into(),
            replicas: Some(desired),
        },
    );
    md.metadata.labels = cluster_labels(cluster);
    md.status = Some(MachineDeploymentStatus {
        replicas: total,
        ready_replicas: ready,
        updated_replicas: updated,
    });
    md
}

/// A machine; `Running` machines carry a node reference.
pub fn machine(
    cluster: &str,
    name: &str,
    control_plane: bool,
    phase: &str,
    version: Option<&str>,
) -> Machine {
    let mut machine = Machine::new(
        name,
        MachineSpec {
            cluster_name: cluster.into(),
            version: version.map(Into::into),
        },
    );
    let mut labels = cluster_labels(cluster).unwrap_or_default();
    if control_plane {
        labels.insert(CONTROL_PLANE_MACHINE_LABEL.into(), String::new());
    }
    machine.metadata.labels = Some(labels);
    machine.status = Some(MachineStatus {
        phase: Some(phase.into()),
        node_ref: (phase == "Running").then(|| NodeReference {
            name: format!("{name}-node"),
        }),
    });
    machine
}
