use std::collections::BTreeSet;
use std::time::Duration;

use tracing::trace;

use super::snapshot::ClusterSnapshot;
use crate::crd::{HasConditions, CONTROL_PLANE_READY_CONDITION, READY_CONDITION};

/// Compares two consecutive snapshots.
pub type ChangeDetector = fn(&ClusterSnapshot, &ClusterSnapshot) -> bool;

fn condition_transitioned(last: &ClusterSnapshot, current: &ClusterSnapshot, type_: &str) -> bool {
    if !current.is_complete() {
        return false;
    }
    match (&last.cluster, &current.cluster) {
        (Some(last), Some(current)) => {
            last.last_transition_time(type_) != current.last_transition_time(type_)
        }
        _ => false,
    }
}

/// The cluster's Ready condition moved.
pub fn cluster_state_changed(last: &ClusterSnapshot, current: &ClusterSnapshot) -> bool {
    condition_transitioned(last, current, READY_CONDITION)
}

/// The cluster's ControlPlaneReady condition moved.
pub fn control_plane_state_changed(last: &ClusterSnapshot, current: &ClusterSnapshot) -> bool {
    condition_transitioned(last, current, CONTROL_PLANE_READY_CONDITION)
}

/// Worker pool counts moved, or a worker machine appeared, went away or
/// changed phase.
pub fn worker_state_changed(last: &ClusterSnapshot, current: &ClusterSnapshot) -> bool {
    if !current.is_complete()
        || last.worker_machines.is_empty()
        || current.worker_machines.is_empty()
    {
        return false;
    }
    let (Some(last_pools), Some(current_pools)) = (&last.worker_pools, &current.worker_pools) else {
        return false;
    };

    let pool_moved = last_pools.iter().any(|before| {
        current_pools
            .iter()
            .filter(|after| after.metadata.name == before.metadata.name)
            .any(|after| {
                let (b, a) = (before.replica_counts(), after.replica_counts());
                b.total != a.total || b.ready != a.ready || b.updated != a.updated
            })
    });
    if pool_moved {
        return true;
    }

    let before: BTreeSet<&String> = last.worker_machines.keys().collect();
    let after: BTreeSet<&String> = current.worker_machines.keys().collect();
    before != after
}

/// Either the cluster or its workers moved.
pub fn cluster_or_worker_state_changed(last: &ClusterSnapshot, current: &ClusterSnapshot) -> bool {
    cluster_state_changed(last, current) || worker_state_changed(last, current)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StallVerdict {
    Progressing,
    /// No change for longer than the operation timeout.
    Stalled,
    /// The overall ceiling was hit while the cluster was still changing.
    Exhausted,
}

/// Tick counter shared by the stall-detecting waits. Local to one wait.
#[derive(Debug)]
pub struct StallDetector {
    interval: Duration,
    timeout: Duration,
    ceiling: Option<Duration>,
    unchanged: u32,
    ticks: u32,
}

impl StallDetector {
    pub fn new(interval: Duration, timeout: Duration, ceiling: Option<Duration>) -> Self {
        Self {
            interval,
            timeout,
            ceiling,
            unchanged: 0,
            ticks: 0,
        }
    }

    pub fn unchanged_ticks(&self) -> u32 {
        self.unchanged
    }

    /// Record one tick in which the tracked state did or did not change.
    pub fn observe(&mut self, changed: bool) -> StallVerdict {
        if changed {
            self.unchanged = 0;
        } else {
            self.unchanged = self.unchanged.saturating_add(1);
            trace!(unchanged = self.unchanged, "cluster state is unchanged");
        }
        self.ticks = self.ticks.saturating_add(1);

        if self.interval.saturating_mul(self.unchanged) > self.timeout {
            return StallVerdict::Stalled;
        }
        match self.ceiling {
            Some(ceiling) if self.interval.saturating_mul(self.ticks) > ceiling => StallVerdict::Exhausted,
            _ => StallVerdict::Progressing,
        }
    }
}
