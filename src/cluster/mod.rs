//! Cluster readiness and upgrade waits.
use thiserror::Error;

use crate::accessor::AccessError;
use crate::error::Aggregate;

pub mod operation;
pub mod readiness;
pub mod snapshot;
pub mod stall;
pub mod upgrade;
pub mod verify;

#[cfg(test)]
pub(crate) mod fixtures;

pub use readiness::ClusterWaiter;
pub use snapshot::{fetch_snapshot, ClusterSnapshot};

#[derive(Debug, Error)]
pub enum WaitError {
    /// The remote store reports a failure that waiting will not fix.
    #[error("{operation} failed, reason:'{reason}', message:'{message}'")]
    Fatal {
        operation: String,
        reason: String,
        message: String,
    },

    #[error("timed out waiting for {operation} to complete: {last}")]
    Stalled { operation: String, last: String },

    #[error("{0}")]
    Access(#[from] AccessError),

    #[error("{0}")]
    NotReady(Aggregate<String>),

    #[error("waiting for kubernetes version update, current kubernetes version {current} but expecting {expected}")]
    VersionMismatch { current: String, expected: String },

    #[error("worker machines {machines:?} are still not upgraded")]
    WorkersNotUpgraded { machines: Vec<String> },

    #[error("{kind} '{name}' still present")]
    StillPresent { kind: String, name: String },

    #[error("{0}")]
    InProgress(String),

    #[error("{0}")]
    TimedOut(String),
}

impl WaitError {
    pub(crate) fn not_ready(reasons: Vec<String>) -> Result<(), WaitError> {
        match Aggregate::from_errors(reasons) {
            Some(reasons) => Err(WaitError::NotReady(reasons)),
            None => Ok(()),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, WaitError::Fatal { .. })
    }
}
