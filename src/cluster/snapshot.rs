use std::collections::BTreeMap;

use futures::join;
use tracing::debug;

use crate::accessor::{AccessError, ResourceAccessor};
use crate::crd::{Cluster, KubeadmControlPlane, Machine, MachineDeployment};
use crate::error::Aggregate;

/// Everything the waiters look at for one cluster, fetched in one tick.
///
/// Fetching never stops at the first failure: every piece that could be read
/// is filled in and the failures are collected in `retrieval_error`.
#[derive(Debug, Default)]
pub struct ClusterSnapshot {
    pub cluster: Option<Cluster>,
    pub control_plane: Option<KubeadmControlPlane>,
    /// `None` when pools were not fetched, either because the read failed or
    /// the cluster is a single node.
    pub worker_pools: Option<Vec<MachineDeployment>>,
    /// Keyed by [`machine_key`].
    pub control_plane_machines: BTreeMap<String, Machine>,
    /// Keyed by [`machine_key`].
    pub worker_machines: BTreeMap<String, Machine>,
    /// Server version of the workload cluster, when one was consulted.
    pub kubernetes_version: Option<String>,
    pub retrieval_error: Option<Aggregate<AccessError>>,
}

/// Machine name and phase, so a replaced or transitioning machine shows up
/// as a different entry.
pub fn machine_key(machine: &Machine) -> String {
    format!(
        "{}-{}",
        machine.metadata.name.as_deref().unwrap_or_default(),
        machine.phase()
    )
}

impl ClusterSnapshot {
    /// One control plane machine and no workers.
    pub fn is_single_node(&self) -> bool {
        self.control_plane_machines.len() == 1 && self.worker_machines.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.retrieval_error.is_none()
    }
}

pub(crate) async fn control_plane_for<A: ResourceAccessor>(
    accessor: &A,
    cluster: &str,
    namespace: &str,
) -> Result<KubeadmControlPlane, AccessError> {
    let mut items: Vec<KubeadmControlPlane> = accessor.list_for_cluster(namespace, cluster).await?;
    if items.len() != 1 {
        return Err(AccessError::Unexpected(format!(
            "zero or multiple KCP objects found for the given cluster, {} {} {}",
            items.len(),
            cluster,
            namespace
        )));
    }
    Ok(items.remove(0))
}

async fn worker_pools_for<A: ResourceAccessor>(
    accessor: &A,
    cluster: &str,
    namespace: &str,
) -> Result<Vec<MachineDeployment>, AccessError> {
    let pools: Vec<MachineDeployment> = accessor.list_for_cluster(namespace, cluster).await?;
    if pools.is_empty() {
        return Err(AccessError::Unexpected(
            "no MachineDeployment objects found for the given cluster".into(),
        ));
    }
    Ok(pools)
}

type MachinesByRole = (BTreeMap<String, Machine>, BTreeMap<String, Machine>);

pub(crate) async fn machines_for<A: ResourceAccessor>(
    accessor: &A,
    cluster: &str,
    namespace: &str,
) -> Result<MachinesByRole, AccessError> {
    let machines: Vec<Machine> = accessor.list_for_cluster(namespace, cluster).await?;
    let mut control_plane = BTreeMap::new();
    let mut workers = BTreeMap::new();
    for machine in machines {
        let key = machine_key(&machine);
        if machine.is_control_plane() {
            control_plane.insert(key, machine);
        } else {
            workers.insert(key, machine);
        }
    }
    Ok((control_plane, workers))
}

/// Fetch a snapshot of `cluster`.
///
/// `workload` is consulted for the live server version when given.
pub async fn fetch_snapshot<A, W>(
    accessor: &A,
    cluster: &str,
    namespace: &str,
    workload: Option<&W>,
) -> ClusterSnapshot
where
    A: ResourceAccessor,
    W: ResourceAccessor,
{
    let mut errors = Vec::new();
    let mut snapshot = ClusterSnapshot::default();

    let version = async {
        match workload {
            Some(w) => Some(w.server_version().await),
            None => None,
        }
    };
    let (version, cluster_obj, control_plane, machines) = join!(
        version,
        accessor.get_typed::<Cluster>(namespace, cluster),
        control_plane_for(accessor, cluster, namespace),
        machines_for(accessor, cluster, namespace),
    );

    match version {
        Some(Ok(v)) => snapshot.kubernetes_version = Some(v),
        Some(Err(e)) => errors.push(e),
        None => {}
    }
    match cluster_obj {
        Ok(c) => snapshot.cluster = Some(c),
        Err(e) => errors.push(e),
    }
    match control_plane {
        Ok(cp) => snapshot.control_plane = Some(cp),
        Err(e) => errors.push(e),
    }
    match machines {
        Ok((cp, workers)) => {
            snapshot.control_plane_machines = cp;
            snapshot.worker_machines = workers;
        }
        Err(e) => errors.push(e),
    }

    if !snapshot.is_single_node() {
        match worker_pools_for(accessor, cluster, namespace).await {
            Ok(pools) => snapshot.worker_pools = Some(pools),
            Err(e) => errors.push(e),
        }
    }

    if !errors.is_empty() {
        debug!(cluster, namespace, failures = errors.len(), "partial cluster snapshot");
    }
    snapshot.retrieval_error = Aggregate::from_errors(errors);
    snapshot
}
