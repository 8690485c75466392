use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use super::operation::mark_operation_observed;
use super::snapshot::{control_plane_for, fetch_snapshot, machines_for, ClusterSnapshot};
use super::stall::{cluster_or_worker_state_changed, ChangeDetector, StallDetector, StallVerdict};
use super::verify::{
    fatal_ready_condition, verify_cluster_initialized, verify_control_plane_replicas,
    verify_machines_ready, verify_worker_pool_replicas,
};
use super::WaitError;
use crate::accessor::{ResourceAccessor, ResourceKind};
use crate::config::WaitConfig;
use crate::crd::{
    Cluster, HasConditions, KubeadmControlPlane, MachineDeployment, AVAILABLE_CONDITION,
};
use crate::poll::{poll_infinite_with_getter, poll_with_getter, Probe};

/// Waits for clusters managed through `A` to reach lifecycle milestones.
pub struct ClusterWaiter<A> {
    accessor: A,
    config: WaitConfig,
}

struct Progress {
    last: ClusterSnapshot,
    detector: StallDetector,
    last_reason: String,
}

impl<A: ResourceAccessor> ClusterWaiter<A> {
    pub fn new(accessor: A, config: WaitConfig) -> Self {
        Self { accessor, config }
    }

    pub fn accessor(&self) -> &A {
        &self.accessor
    }

    pub fn config(&self) -> &WaitConfig {
        &self.config
    }

    /// Poll snapshots until `verify` passes, failing fast on a fatal Ready
    /// condition and giving up once nothing `changed` for the operation
    /// timeout. Every observed change refreshes the last observed annotation.
    pub(crate) async fn wait_tracking_progress<W, V>(
        &self,
        cluster: &str,
        namespace: &str,
        workload: Option<&W>,
        operation: &str,
        verify: V,
        changed: ChangeDetector,
    ) -> Result<(), WaitError>
    where
        W: ResourceAccessor,
        V: Fn(&ClusterSnapshot) -> Result<(), WaitError> + Sync,
    {
        let interval = self.config.stall_poll_interval;
        let progress = Mutex::new(Progress {
            last: ClusterSnapshot::default(),
            detector: StallDetector::new(
                interval,
                self.config.operation_timeout,
                self.config.max_operation_timeout,
            ),
            last_reason: String::new(),
        });
        let progress = &progress;
        let verify = &verify;

        poll_infinite_with_getter(interval, || async move {
            let snapshot = fetch_snapshot(&self.accessor, cluster, namespace, workload).await;

            if let Some(fatal) = snapshot
                .cluster
                .as_ref()
                .and_then(|c| fatal_ready_condition(c, operation))
            {
                return Probe::Fatal(fatal);
            }
            let reason = match verify(&snapshot) {
                Ok(()) => return Probe::Done,
                Err(reason) => reason,
            };

            let moved = changed(&progress.lock().await.last, &snapshot);
            if moved {
                if let Err(err) = mark_operation_observed(&self.accessor, cluster, namespace).await {
                    warn!(error = %err, "unable to patch cluster object with operation status");
                }
            }

            let mut progress = progress.lock().await;
            let verdict = progress.detector.observe(moved);
            let rendered = reason.to_string();
            if progress.last_reason != rendered {
                info!(cluster, "{rendered}");
                progress.last_reason = rendered;
            }
            progress.last = snapshot;

            match verdict {
                StallVerdict::Progressing => Probe::Retry(reason),
                StallVerdict::Stalled | StallVerdict::Exhausted => Probe::Fatal(WaitError::Stalled {
                    operation: operation.to_string(),
                    last: reason.to_string(),
                }),
            }
        })
        .await
    }

    /// Wait until infrastructure and control plane are ready. Workers are not
    /// waited for.
    #[instrument(skip(self))]
    pub async fn wait_for_cluster_initialized(&self, cluster: &str, namespace: &str) -> Result<(), WaitError> {
        self.wait_tracking_progress::<A, _>(
            cluster,
            namespace,
            None,
            "cluster creation",
            |snapshot| match (&snapshot.retrieval_error, &snapshot.cluster) {
                (Some(err), _) => Err(WaitError::InProgress(err.to_string())),
                (None, Some(cluster)) => verify_cluster_initialized(cluster),
                (None, None) => Err(WaitError::InProgress("cluster object not retrieved".into())),
            },
            cluster_or_worker_state_changed,
        )
        .await
    }

    /// Wait until the cluster is ready and every machine has a node, and with
    /// `check_replicas` until control plane and worker pools are at their
    /// desired size.
    #[instrument(skip(self))]
    pub async fn wait_for_cluster_ready(
        &self,
        cluster: &str,
        namespace: &str,
        check_replicas: bool,
    ) -> Result<(), WaitError> {
        let interval = self.config.check_interval;
        let timeout = self.config.operation_timeout;

        poll_with_getter(interval, timeout, || async move {
            let obj: Cluster = self.accessor.get_typed(namespace, cluster).await?;
            verify_cluster_initialized(&obj)
        })
        .await?;

        if check_replicas {
            poll_with_getter(interval, timeout, || async move {
                let control_planes: Vec<KubeadmControlPlane> =
                    self.accessor.list_for_cluster(namespace, cluster).await?;
                verify_control_plane_replicas(&control_planes)
            })
            .await?;

            poll_with_getter(interval, timeout, || async move {
                let pools: Vec<MachineDeployment> =
                    self.accessor.list_for_cluster(namespace, cluster).await?;
                verify_worker_pool_replicas(&pools)
            })
            .await?;
        }

        poll_with_getter(interval, timeout, || async move {
            let (control_plane, workers) = machines_for(&self.accessor, cluster, namespace).await?;
            let machines: Vec<_> = control_plane.into_values().chain(workers.into_values()).collect();
            verify_machines_ready(&machines)
        })
        .await
    }

    /// Wait until the cluster object is gone. Lookup errors other than not
    /// found are retried until the timeout.
    #[instrument(skip(self))]
    pub async fn wait_for_cluster_deletion(&self, cluster: &str, namespace: &str) -> Result<(), WaitError> {
        poll_with_getter(
            self.config.check_interval,
            self.config.operation_timeout,
            || async move {
                match self.accessor.get(&ResourceKind::Cluster, namespace, cluster).await {
                    Ok(_) => Err(WaitError::StillPresent {
                        kind: ResourceKind::Cluster.to_string(),
                        name: cluster.to_string(),
                    }),
                    Err(err) if err.is_not_found() => Ok(()),
                    Err(err) => Err(err.into()),
                }
            },
        )
        .await
    }

    /// Wait for the control plane object to report Available.
    #[instrument(skip(self))]
    pub async fn wait_for_control_plane_available(
        &self,
        cluster: &str,
        namespace: &str,
    ) -> Result<(), WaitError> {
        poll_with_getter(
            self.config.check_interval,
            self.config.operation_timeout,
            || async move {
                let control_plane = control_plane_for(&self.accessor, cluster, namespace).await?;
                if control_plane.is_condition_true(AVAILABLE_CONDITION) {
                    Ok(())
                } else {
                    Err(WaitError::InProgress("control plane is not available yet".into()))
                }
            },
        )
        .await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use tokio::time::{sleep, Instant};

    use super::*;
    use crate::cluster::fixtures::{
        cluster, condition, control_plane, machine, worker_pool, NAMESPACE,
    };
    use crate::accessor::AccessError;
    use crate::cluster::operation::LAST_OBSERVED_ANNOTATION;
    use crate::testing::FakeAccessor;

    pub(crate) fn test_config() -> WaitConfig {
        WaitConfig {
            operation_timeout: Duration::from_secs(60),
            stall_poll_interval: Duration::from_secs(15),
            check_interval: Duration::from_secs(10),
            upgrade_settle_delay: Duration::from_secs(60),
            unreachable_grace: Duration::from_secs(30),
            max_operation_timeout: None,
        }
    }

    fn ready_conditions(ltt: &str) -> Vec<crate::crd::Condition> {
        vec![
            condition("Ready", "True", None, ltt),
            condition("ControlPlaneReady", "True", None, ltt),
            condition("InfrastructureReady", "True", None, ltt),
        ]
    }

    fn seed_provisioning(fake: &FakeAccessor) {
        fake.seed(
            NAMESPACE,
            &cluster(
                "c1",
                true,
                false,
                vec![
                    condition("Ready", "False", Some("Info"), "t0"),
                    condition("InfrastructureReady", "True", None, "t0"),
                    condition("ControlPlaneReady", "False", Some("Info"), "t0"),
                ],
            ),
        );
        fake.seed(NAMESPACE, &control_plane("c1", 1, 0));
        fake.seed(NAMESPACE, &worker_pool("c1", "md-0", 1, 0, 0, 0));
        fake.seed(NAMESPACE, &machine("c1", "cp-0", true, "Provisioning", None));
    }

    fn set_conditions(fake: &FakeAccessor, conditions: Vec<crate::crd::Condition>) {
        fake.modify(&ResourceKind::Cluster, NAMESPACE, "c1", |obj| {
            obj.data["status"]["conditions"] = json!(conditions);
        });
    }

    #[tokio::test(start_paused = true)]
    async fn initialized_fails_fast_on_error_condition() {
        let fake = FakeAccessor::new();
        fake.seed(
            NAMESPACE,
            &cluster(
                "c1",
                false,
                false,
                vec![condition("Ready", "False", Some("Error"), "t0")],
            ),
        );
        let waiter = ClusterWaiter::new(fake, test_config());
        let started = Instant::now();

        let err = waiter
            .wait_for_cluster_initialized("c1", NAMESPACE)
            .await
            .unwrap_err();

        assert!(err.is_fatal(), "{err}");
        assert!(err.to_string().contains("reason:'ReadyReason'"));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn initialized_succeeds_without_workers() {
        let fake = FakeAccessor::new();
        seed_provisioning(&fake);
        set_conditions(&fake, ready_conditions("t1"));
        let waiter = ClusterWaiter::new(fake, test_config());

        waiter.wait_for_cluster_initialized("c1", NAMESPACE).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn initialized_stalls_when_nothing_changes() {
        let fake = FakeAccessor::new();
        seed_provisioning(&fake);
        let waiter = ClusterWaiter::new(fake, test_config());
        let started = Instant::now();

        let err = waiter
            .wait_for_cluster_initialized("c1", NAMESPACE)
            .await
            .unwrap_err();

        match &err {
            WaitError::Stalled { operation, last } => {
                assert_eq!(operation, "cluster creation");
                assert!(last.contains("control plane is still being initialized"));
            }
            other => panic!("unexpected {other:?}"),
        }
        // five unchanged ticks, 15s apart
        assert_eq!(started.elapsed(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn initialized_keeps_waiting_while_the_cluster_moves() {
        let fake = FakeAccessor::new();
        seed_provisioning(&fake);
        let writer = fake.clone();
        tokio::spawn(async move {
            for step in 1..=4 {
                sleep(Duration::from_secs(25)).await;
                set_conditions(
                    &writer,
                    vec![
                        condition("Ready", "False", Some("Info"), &format!("t{step}")),
                        condition("ControlPlaneReady", "False", Some("Info"), "t0"),
                    ],
                );
            }
            sleep(Duration::from_secs(25)).await;
            set_conditions(&writer, ready_conditions("t9"));
        });
        let waiter = ClusterWaiter::new(fake.clone(), test_config());
        let started = Instant::now();

        waiter.wait_for_cluster_initialized("c1", NAMESPACE).await.unwrap();

        assert!(started.elapsed() > Duration::from_secs(120));
        let stored = fake.stored(&ResourceKind::Cluster, NAMESPACE, "c1").unwrap();
        assert!(stored
            .metadata
            .annotations
            .unwrap_or_default()
            .contains_key(LAST_OBSERVED_ANNOTATION));
    }

    /// Moves the Ready condition every `period`, starting after `offset`.
    fn keep_moving(fake: &FakeAccessor, offset: Duration, period: Duration) {
        let writer = fake.clone();
        tokio::spawn(async move {
            sleep(offset).await;
            for step in 1..=20 {
                set_conditions(
                    &writer,
                    vec![
                        condition("Ready", "False", Some("Info"), &format!("t{step}")),
                        condition("ControlPlaneReady", "False", Some("Info"), "t0"),
                    ],
                );
                sleep(period).await;
            }
        });
    }

    #[tokio::test(start_paused = true)]
    async fn initialized_keeps_waiting_when_the_observed_patch_fails() {
        let fake = FakeAccessor::new();
        seed_provisioning(&fake);
        fake.fail_patches(&ResourceKind::Cluster, "admission webhook denied the request");
        keep_moving(&fake, Duration::from_secs(5), Duration::from_secs(25));
        let writer = fake.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(110)).await;
            set_conditions(&writer, ready_conditions("t99"));
        });
        let waiter = ClusterWaiter::new(fake.clone(), test_config());
        let started = Instant::now();

        waiter.wait_for_cluster_initialized("c1", NAMESPACE).await.unwrap();

        assert!(started.elapsed() > Duration::from_secs(100));
        let stored = fake.stored(&ResourceKind::Cluster, NAMESPACE, "c1").unwrap();
        assert!(!stored
            .metadata
            .annotations
            .unwrap_or_default()
            .contains_key(LAST_OBSERVED_ANNOTATION));
    }

    #[tokio::test(start_paused = true)]
    async fn initialized_gives_up_at_the_ceiling_while_moving() {
        let fake = FakeAccessor::new();
        seed_provisioning(&fake);
        keep_moving(&fake, Duration::from_secs(5), Duration::from_secs(15));
        let config = WaitConfig {
            max_operation_timeout: Some(Duration::from_secs(45)),
            ..test_config()
        };
        let waiter = ClusterWaiter::new(fake, config);
        let started = Instant::now();

        let err = waiter
            .wait_for_cluster_initialized("c1", NAMESPACE)
            .await
            .unwrap_err();

        assert!(
            matches!(&err, WaitError::Stalled { operation, .. } if operation == "cluster creation"),
            "{err}"
        );
        // four ticks, every one after the first saw a change
        assert_eq!(started.elapsed(), Duration::from_secs(45));
    }

    #[tokio::test(start_paused = true)]
    async fn waits_run_on_spawned_tasks() {
        let fake = FakeAccessor::new();
        seed_provisioning(&fake);
        set_conditions(&fake, ready_conditions("t1"));
        let waiter = Arc::new(ClusterWaiter::new(fake, test_config()));

        let initialized = tokio::spawn({
            let waiter = waiter.clone();
            async move { waiter.wait_for_cluster_initialized("c1", NAMESPACE).await }
        });
        let deleted = tokio::spawn({
            let waiter = waiter.clone();
            async move { waiter.wait_for_cluster_deletion("gone", NAMESPACE).await }
        });

        initialized.await.unwrap().unwrap();
        deleted.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn ready_checks_replicas_and_nodes() {
        let fake = FakeAccessor::new();
        fake.seed(NAMESPACE, &cluster("c1", true, true, ready_conditions("t0")));
        fake.seed(NAMESPACE, &control_plane("c1", 3, 3));
        fake.seed(NAMESPACE, &worker_pool("c1", "md-0", 2, 2, 2, 2));
        fake.seed(NAMESPACE, &machine("c1", "cp-0", true, "Running", None));
        fake.seed(NAMESPACE, &machine("c1", "w-0", false, "Running", None));
        let waiter = ClusterWaiter::new(fake, test_config());

        waiter.wait_for_cluster_ready("c1", NAMESPACE, true).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn ready_times_out_with_last_reason() {
        let fake = FakeAccessor::new();
        fake.seed(NAMESPACE, &cluster("c1", true, true, ready_conditions("t0")));
        fake.seed(NAMESPACE, &machine("c1", "w-0", false, "Provisioning", None));
        let waiter = ClusterWaiter::new(fake, test_config());

        let err = waiter
            .wait_for_cluster_ready("c1", NAMESPACE, false)
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "machine w-0 is still being provisioned");
    }

    #[tokio::test(start_paused = true)]
    async fn deletion_completes_on_not_found() {
        let fake = FakeAccessor::new();
        seed_provisioning(&fake);
        let deleter = fake.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(25)).await;
            deleter.remove(&ResourceKind::Cluster, NAMESPACE, "c1");
        });
        let waiter = ClusterWaiter::new(fake, test_config());

        waiter.wait_for_cluster_deletion("c1", NAMESPACE).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn deletion_reports_still_present() {
        let fake = FakeAccessor::new();
        seed_provisioning(&fake);
        let waiter = ClusterWaiter::new(fake, test_config());

        let err = waiter
            .wait_for_cluster_deletion("c1", NAMESPACE)
            .await
            .unwrap_err();

        assert!(matches!(err, WaitError::StillPresent { .. }), "{err}");
    }

    #[tokio::test(start_paused = true)]
    async fn deletion_retries_lookup_errors_until_timeout() {
        let fake = FakeAccessor::new();
        seed_provisioning(&fake);
        fake.fail_kind(&ResourceKind::Cluster, "etcdserver: request timed out");
        let waiter = ClusterWaiter::new(fake, test_config());
        let started = Instant::now();

        let err = waiter
            .wait_for_cluster_deletion("c1", NAMESPACE)
            .await
            .unwrap_err();

        assert!(matches!(err, WaitError::Access(AccessError::Kube(_))), "{err}");
        assert!(err.to_string().contains("etcdserver: request timed out"));
        assert_eq!(started.elapsed(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn control_plane_available() {
        let fake = FakeAccessor::new();
        let mut kcp = control_plane("c1", 1, 1);
        kcp.status.as_mut().unwrap().conditions =
            vec![condition("Available", "True", None, "t0")];
        fake.seed(NAMESPACE, &kcp);
        let waiter = ClusterWaiter::new(fake.clone(), test_config());

        waiter
            .wait_for_control_plane_available("c1", NAMESPACE)
            .await
            .unwrap();

        fake.seed(NAMESPACE, &control_plane("c2", 1, 0));
        let err = waiter
            .wait_for_control_plane_available("c2", NAMESPACE)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "control plane is not available yet");
    }
}
