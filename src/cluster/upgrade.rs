use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument};

use super::readiness::ClusterWaiter;
use super::snapshot::machines_for;
use super::stall::{control_plane_state_changed, worker_state_changed};
use super::verify::{machines_not_on_version, verify_control_plane_upgrade, verify_worker_upgrade};
use super::WaitError;
use crate::accessor::ResourceAccessor;
use crate::crd::{HasConditions, ManagedClusterPhase, TanzuKubernetesCluster, READY_CONDITION};
use crate::poll::{poll_infinite_with_getter, Probe};

const UPGRADE_OPERATION: &str = "kubernetes version update";

impl<A: ResourceAccessor> ClusterWaiter<A> {
    async fn settle(&self) {
        let delay = self.config().upgrade_settle_delay;
        debug!(?delay, "waiting for the rollout to start before polling");
        sleep(delay).await;
    }

    /// Wait until the control plane reports ready on `target`. The live
    /// version is read from `workload` when given.
    #[instrument(skip(self, workload))]
    pub async fn wait_k8s_version_update_for_control_plane<W: ResourceAccessor>(
        &self,
        cluster: &str,
        namespace: &str,
        target: &str,
        workload: Option<&W>,
    ) -> Result<(), WaitError> {
        self.settle().await;
        self.wait_tracking_progress(
            cluster,
            namespace,
            workload,
            UPGRADE_OPERATION,
            |snapshot| verify_control_plane_upgrade(snapshot, target),
            control_plane_state_changed,
        )
        .await
    }

    /// Wait until every worker pool settled and every worker machine declares
    /// `target`.
    #[instrument(skip(self, workload))]
    pub async fn wait_k8s_version_update_for_workers<W: ResourceAccessor>(
        &self,
        cluster: &str,
        namespace: &str,
        target: &str,
        workload: Option<&W>,
    ) -> Result<(), WaitError> {
        self.settle().await;
        self.wait_tracking_progress(
            cluster,
            namespace,
            workload,
            UPGRADE_OPERATION,
            |snapshot| verify_worker_upgrade(snapshot, target),
            worker_state_changed,
        )
        .await
    }

    async fn verify_managed_workers(&self, cluster: &str, namespace: &str, target: &str) -> Result<(), WaitError> {
        let (_, workers) = machines_for(self.accessor(), cluster, namespace).await?;
        let machines = machines_not_on_version(workers.values(), target);
        if machines.is_empty() {
            Ok(())
        } else {
            Err(WaitError::WorkersNotUpgraded { machines })
        }
    }

    /// Read the managed cluster, tolerating lookup failures for the
    /// unreachable grace window.
    async fn get_managed(
        &self,
        cluster: &str,
        namespace: &str,
        interval: Duration,
        failures: &AtomicU32,
    ) -> Result<TanzuKubernetesCluster, Probe<WaitError>> {
        match self.accessor().get_typed::<TanzuKubernetesCluster>(namespace, cluster).await {
            Ok(managed) => {
                failures.store(0, Ordering::Relaxed);
                Ok(managed)
            }
            Err(err) => {
                let failed = failures.fetch_add(1, Ordering::Relaxed);
                if interval.saturating_mul(failed) > self.config().unreachable_grace {
                    return Err(Probe::Fatal(err.into()));
                }
                Err(Probe::Retry(err.into()))
            }
        }
    }

    /// Wait for a supervisor-managed cluster to finish a version update.
    ///
    /// A `running` phase is not trusted alone: it shows up between the
    /// control plane and worker stages, so worker versions are checked too.
    #[instrument(skip(self))]
    pub async fn wait_for_managed_cluster_k8s_version_update(
        &self,
        cluster: &str,
        namespace: &str,
        target: &str,
    ) -> Result<(), WaitError> {
        let interval = self.config().stall_poll_interval;
        let timeout = self.config().operation_timeout;
        let failures = &AtomicU32::new(0);
        let ticks = &AtomicU32::new(0);

        poll_infinite_with_getter(interval, || async move {
            let managed = match self.get_managed(cluster, namespace, interval, failures).await {
                Ok(managed) => managed,
                Err(probe) => return probe,
            };
            if let Some(c) = managed.failed_condition(READY_CONDITION) {
                return Probe::Fatal(WaitError::Fatal {
                    operation: "cluster kubernetes version update".into(),
                    reason: c.reason().into(),
                    message: c.message().into(),
                });
            }

            let phase = managed.phase();
            let reason = match phase {
                ManagedClusterPhase::UpdateFailed
                | ManagedClusterPhase::Deleting
                | ManagedClusterPhase::Failed => {
                    return Probe::Fatal(WaitError::Fatal {
                        operation: "cluster kubernetes version update".into(),
                        reason: format!("cluster phase is {phase}"),
                        message: managed.condition_message(READY_CONDITION).into(),
                    });
                }
                ManagedClusterPhase::Running => {
                    match self.verify_managed_workers(cluster, namespace, target).await {
                        Ok(()) => return Probe::Done,
                        Err(err) => err,
                    }
                }
                _ => WaitError::InProgress("cluster kubernetes version is still being upgraded".into()),
            };

            let ticks = ticks.fetch_add(1, Ordering::Relaxed).saturating_add(1);
            if interval.saturating_mul(ticks) > timeout {
                return Probe::Fatal(WaitError::TimedOut(
                    "timed out waiting for upgrade to complete, upgrade is still in progress".into(),
                ));
            }
            Probe::Retry(reason)
        })
        .await
    }

    /// Wait for a supervisor-managed cluster to report Ready.
    #[instrument(skip(self))]
    pub async fn wait_for_managed_cluster_ready(&self, cluster: &str, namespace: &str) -> Result<(), WaitError> {
        let interval = self.config().check_interval;
        let timeout = self.config().operation_timeout;
        let failures = &AtomicU32::new(0);
        let started = Instant::now();

        poll_infinite_with_getter(interval, || async move {
            let managed = match self.get_managed(cluster, namespace, interval, failures).await {
                Ok(managed) => managed,
                Err(probe) => return probe,
            };
            if let Some(c) = managed.failed_condition(READY_CONDITION) {
                return Probe::Fatal(WaitError::Fatal {
                    operation: "cluster provisioning".into(),
                    reason: c.reason().into(),
                    message: c.message().into(),
                });
            }
            if managed.is_condition_true(READY_CONDITION) {
                info!(cluster, "managed cluster is ready");
                return Probe::Done;
            }
            if started.elapsed() > timeout {
                return Probe::Fatal(WaitError::TimedOut(
                    "timed out waiting for the cluster to be ready".into(),
                ));
            }
            Probe::Retry(WaitError::InProgress(format!(
                "cluster is still not provisioned, reason:'{}', message:'{}'",
                managed.condition_reason(READY_CONDITION),
                managed.condition_message(READY_CONDITION)
            )))
        })
        .await
    }
}
