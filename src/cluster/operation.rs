use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, instrument};

use crate::accessor::{AccessError, ResourceAccessor, ResourceKind};

pub const OPERATION_INFO_ANNOTATION: &str = "TKGOperationInfo";
pub const LAST_OBSERVED_ANNOTATION: &str = "TKGOperationLastObservedTimestamp";

pub const OPERATION_CREATE: &str = "Create";
pub const OPERATION_UPGRADE: &str = "Upgrade";
pub const OPERATION_DELETE: &str = "Delete";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f +0000 UTC";
const TIMESTAMP_PARSE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f +0000 UTC";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OperationRecord {
    pub operation: String,
    pub operation_start_timestamp: String,
    pub operation_timeout: u64,
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, TIMESTAMP_PARSE_FORMAT)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn annotations_patch(annotations: BTreeMap<&str, String>) -> Value {
    json!({ "metadata": { "annotations": annotations } })
}

/// Record the start of `operation` on the cluster object.
#[instrument(skip(accessor))]
pub async fn mark_operation_started<A: ResourceAccessor>(
    accessor: &A,
    cluster: &str,
    namespace: &str,
    operation: &str,
    timeout: Duration,
) -> Result<(), AccessError> {
    let now = format_timestamp(Utc::now());
    let record = OperationRecord {
        operation: operation.to_string(),
        operation_start_timestamp: now.clone(),
        operation_timeout: timeout.as_secs(),
    };
    let patch = annotations_patch(BTreeMap::from([
        (OPERATION_INFO_ANNOTATION, serde_json::to_string(&record)?),
        (LAST_OBSERVED_ANNOTATION, now),
    ]));
    debug!(%patch, "patching cluster with operation status");
    accessor
        .patch_merge(&ResourceKind::Cluster, namespace, cluster, &patch)
        .await?;
    Ok(())
}

/// Refresh the last observed timestamp.
pub async fn mark_operation_observed<A: ResourceAccessor>(
    accessor: &A,
    cluster: &str,
    namespace: &str,
) -> Result<(), AccessError> {
    let patch = annotations_patch(BTreeMap::from([(
        LAST_OBSERVED_ANNOTATION,
        format_timestamp(Utc::now()),
    )]));
    accessor
        .patch_merge(&ResourceKind::Cluster, namespace, cluster, &patch)
        .await?;
    Ok(())
}

/// Whether the annotations describe `operation` with no observed progress
/// for longer than its recorded timeout.
///
/// Missing or unparsable annotations mean "not stalled".
pub fn is_operation_stalled(
    annotations: &BTreeMap<String, String>,
    operation: &str,
    now: DateTime<Utc>,
) -> bool {
    let (Some(info), Some(observed)) = (
        annotations.get(OPERATION_INFO_ANNOTATION),
        annotations.get(LAST_OBSERVED_ANNOTATION),
    ) else {
        return false;
    };
    let Ok(record) = serde_json::from_str::<OperationRecord>(info) else {
        return false;
    };
    if record.operation != operation {
        return false;
    }
    let Some(observed) = parse_timestamp(observed) else {
        return false;
    };
    let timeout = i64::try_from(record.operation_timeout).unwrap_or(i64::MAX);
    (now - observed).num_seconds() > timeout
}
