use kube::ResourceExt;

use super::snapshot::ClusterSnapshot;
use super::WaitError;
use crate::crd::{
    Cluster, HasConditions, KubeadmControlPlane, Machine, MachineDeployment,
    CONTROL_PLANE_READY_CONDITION, INFRASTRUCTURE_READY_CONDITION, READY_CONDITION,
};

/// A fatal error when the cluster's Ready condition is False with severity
/// Error.
pub fn fatal_ready_condition(cluster: &Cluster, operation: &str) -> Option<WaitError> {
    cluster
        .failed_condition(READY_CONDITION)
        .map(|c| WaitError::Fatal {
            operation: operation.to_string(),
            reason: c.reason().to_string(),
            message: c.message().to_string(),
        })
}

/// Infrastructure and control plane both report ready. Workers are not
/// required.
pub fn verify_cluster_initialized(cluster: &Cluster) -> Result<(), WaitError> {
    let mut reasons = Vec::new();
    let ready_reason = cluster.condition_reason(READY_CONDITION);
    if !cluster.is_condition_true(CONTROL_PLANE_READY_CONDITION) {
        reasons.push(format!(
            "cluster control plane is still being initialized: {ready_reason}"
        ));
    }
    if !cluster.is_condition_true(INFRASTRUCTURE_READY_CONDITION) {
        reasons.push(format!(
            "cluster infrastructure is still being provisioned: {ready_reason}"
        ));
    }
    WaitError::not_ready(reasons)
}

pub fn verify_control_plane_replicas(control_planes: &[KubeadmControlPlane]) -> Result<(), WaitError> {
    let reasons = control_planes
        .iter()
        .filter_map(|kcp| {
            let desired = kcp.desired_replicas();
            let status = kcp.status.clone().unwrap_or_default();
            (status.ready_replicas != desired).then(|| {
                format!(
                    "control-plane is still creating replicas, DesiredReplicas={} Replicas={} ReadyReplicas={} UpdatedReplicas={}",
                    desired, status.replicas, status.ready_replicas, status.updated_replicas
                )
            })
        })
        .collect();
    WaitError::not_ready(reasons)
}

fn pool_settled(pool: &MachineDeployment) -> Option<String> {
    let counts = pool.replica_counts();
    let settled = counts.ready == counts.desired
        && counts.updated == counts.desired
        && counts.total == counts.desired;
    (!settled).then(|| {
        format!(
            "worker nodes are still being updated for MachineDeployment '{}', DesiredReplicas={} Replicas={} ReadyReplicas={} UpdatedReplicas={}",
            pool.name_any(),
            counts.desired,
            counts.total,
            counts.ready,
            counts.updated
        )
    })
}

/// Every pool has ready, updated and total replicas equal to its desired count.
pub fn verify_worker_pool_replicas(pools: &[MachineDeployment]) -> Result<(), WaitError> {
    WaitError::not_ready(pools.iter().filter_map(pool_settled).collect())
}

/// Every machine has a node in the workload cluster.
pub fn verify_machines_ready(machines: &[Machine]) -> Result<(), WaitError> {
    let reasons = machines
        .iter()
        .filter(|m| !m.has_node())
        .map(|m| format!("machine {} is still being provisioned", m.name_any()))
        .collect();
    WaitError::not_ready(reasons)
}

/// Whether a machine declaring `declared` runs `target`.
///
/// The leading `v` is ignored, and a declared version without build metadata
/// matches a target that adds some (`1.26.5` matches `v1.26.5+vmware.1`).
pub fn version_matches(declared: &str, target: &str) -> bool {
    let declared = declared.trim_start_matches('v');
    let target = target.trim_start_matches('v');
    declared == target || target.starts_with(&format!("{declared}+"))
}

/// Names of machines not declaring `target`, sorted.
pub fn machines_not_on_version<'a, I>(machines: I, target: &str) -> Vec<String>
where
    I: IntoIterator<Item = &'a Machine>,
{
    let mut stale: Vec<String> = machines
        .into_iter()
        .filter(|m| {
            !m.spec
                .version
                .as_deref()
                .is_some_and(|v| version_matches(v, target))
        })
        .map(|m| m.name_any())
        .collect();
    stale.sort();
    stale
}

pub fn verify_control_plane_upgrade(snapshot: &ClusterSnapshot, target: &str) -> Result<(), WaitError> {
    if let Some(err) = &snapshot.retrieval_error {
        return Err(WaitError::InProgress(err.to_string()));
    }
    let Some(cluster) = &snapshot.cluster else {
        return Err(WaitError::InProgress("cluster object not retrieved".into()));
    };
    if !cluster.is_condition_true(CONTROL_PLANE_READY_CONDITION) {
        return Err(WaitError::InProgress(format!(
            "control-plane is still being upgraded, reason:'{}', message:'{}'",
            cluster.condition_reason(CONTROL_PLANE_READY_CONDITION),
            cluster.condition_message(CONTROL_PLANE_READY_CONDITION)
        )));
    }
    match &snapshot.kubernetes_version {
        Some(current) if current != target => Err(WaitError::VersionMismatch {
            current: current.clone(),
            expected: target.to_string(),
        }),
        _ => Ok(()),
    }
}

pub fn verify_worker_upgrade(snapshot: &ClusterSnapshot, target: &str) -> Result<(), WaitError> {
    if let Some(err) = &snapshot.retrieval_error {
        return Err(WaitError::InProgress(err.to_string()));
    }
    if snapshot.is_single_node() {
        return Ok(());
    }
    if let Some(pools) = &snapshot.worker_pools {
        verify_worker_pool_replicas(pools)?;
    }
    let machines = machines_not_on_version(snapshot.worker_machines.values(), target);
    if !machines.is_empty() {
        return Err(WaitError::WorkersNotUpgraded { machines });
    }
    Ok(())
}
