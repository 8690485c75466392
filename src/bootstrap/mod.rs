use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::DynamicObject;
use kube::{Resource, ResourceExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::accessor::{AccessError, GroupKind, ResourceKind};
use crate::config::ReplicatorConfig;
use crate::crd::Cluster;

mod clone;
pub mod embedded;
mod owner;

pub const PACKAGE_NAME_LABEL: &str = "tkg.tanzu.vmware.com/package-name";
pub const CLUSTER_NAME_LABEL: &str = "tkg.tanzu.vmware.com/cluster-name";
/// Secret type of every secret the replicator writes, so they can be watched
/// apart from user secrets.
pub const MANAGED_SECRET_TYPE: &str = "clusterbootstrap-secret";
/// Key of the inline values payload.
pub const VALUES_FILE: &str = "values.yaml";

const MAX_LABEL_LENGTH: usize = 63;

#[derive(Debug, Error)]
pub enum ReplicateError {
    #[error("unable to fetch Package.Spec.RefName from Package {namespace}/{name}: {source}")]
    Package {
        namespace: String,
        name: String,
        #[source]
        source: AccessError,
    },

    #[error("Package {namespace}/{name} has an empty refName")]
    EmptyRefName { namespace: String, name: String },

    #[error("invalid object: {0}")]
    InvalidObject(String),

    #[error("unable to update the owner references of {kind} {namespace}/{name}: {source}")]
    OwnerUpdate {
        kind: String,
        namespace: String,
        name: String,
        #[source]
        source: AccessError,
    },

    #[error("{0}")]
    Access(#[from] AccessError),

    #[error("unable to marshal inline values: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// A dynamically typed object supplying a package's values.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_group: Option<String>,
    pub kind: String,
    pub name: String,
}

impl ProviderRef {
    pub fn resource_kind(&self) -> ResourceKind {
        ResourceKind::Dynamic(GroupKind::new(
            self.api_group.clone().unwrap_or_default(),
            self.kind.clone(),
        ))
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ValuesFrom {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_ref: Option<ProviderRef>,
}

/// The values source honoured for a package.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ValuesSource<'a> {
    Inline(&'a Map<String, Value>),
    SecretRef(&'a str),
    ProviderRef(&'a ProviderRef),
}

impl ValuesFrom {
    /// First populated source, in the order inline, secret, provider.
    pub fn source(&self) -> Option<ValuesSource<'_>> {
        if let Some(inline) = &self.inline {
            return Some(ValuesSource::Inline(inline));
        }
        if let Some(secret) = self.secret_ref.as_deref().filter(|s| !s.is_empty()) {
            return Some(ValuesSource::SecretRef(secret));
        }
        self.provider_ref.as_ref().map(ValuesSource::ProviderRef)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapPackage {
    pub ref_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values_from: Option<ValuesFrom>,
}

/// Objects written by one replication run.
#[derive(Debug, Default)]
pub struct ClonedPackages {
    pub secrets: Vec<Secret>,
    pub providers: Vec<DynamicObject>,
    /// Objects cloned because a provider referenced them.
    pub embedded: Vec<DynamicObject>,
    /// The input packages with their references pointing at the clones.
    pub packages: Vec<BootstrapPackage>,
}

/// A replication run that stopped at its first failing package.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct CloneFailure {
    /// Everything cloned before the failure.
    pub cloned: ClonedPackages,
    #[source]
    pub source: ReplicateError,
}

pub struct BootstrapReplicator<A> {
    accessor: A,
    config: ReplicatorConfig,
}

impl<A> BootstrapReplicator<A> {
    pub fn new(accessor: A, config: ReplicatorConfig) -> Self {
        Self { accessor, config }
    }

    pub fn accessor(&self) -> &A {
        &self.accessor
    }
}

/// Label-safe form of a package ref name.
///
/// `+` is not allowed in label values, so `1.2.3+vmware.1` becomes
/// `1.2.3---vmware.1`.
pub fn label_value(name: &str) -> String {
    let safe: String = name.replace('+', "---").chars().take(MAX_LABEL_LENGTH).collect();
    safe.trim_end_matches(['_', '.', '-']).to_string()
}

/// Name of the clone holding a package's values for a cluster.
pub fn package_object_name(cluster: &str, carvel_ref_name: &str) -> String {
    let short = carvel_ref_name.split('.').next().unwrap_or(carvel_ref_name);
    format!("{cluster}-{short}-package")
}

pub(crate) fn package_labels(package: &BootstrapPackage, cluster: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (PACKAGE_NAME_LABEL.to_string(), label_value(&package.ref_name)),
        (CLUSTER_NAME_LABEL.to_string(), cluster.to_string()),
    ])
}

pub(crate) fn cluster_owner(cluster: &Cluster) -> Result<OwnerReference, ReplicateError> {
    let uid = cluster
        .uid()
        .ok_or_else(|| ReplicateError::InvalidObject(format!("cluster {} has no uid", cluster.name_any())))?;
    Ok(OwnerReference {
        api_version: Cluster::api_version(&()).to_string(),
        kind: Cluster::kind(&()).to_string(),
        name: cluster.name_any(),
        uid,
        ..OwnerReference::default()
    })
}

/// Owner reference pointing at a dynamically typed object.
pub(crate) fn object_owner(obj: &DynamicObject) -> Result<OwnerReference, ReplicateError> {
    let types = obj
        .types
        .as_ref()
        .ok_or_else(|| ReplicateError::InvalidObject(format!("{} has no type information", obj.name_any())))?;
    let uid = obj
        .uid()
        .ok_or_else(|| ReplicateError::InvalidObject(format!("{} {} has no uid", types.kind, obj.name_any())))?;
    Ok(OwnerReference {
        api_version: types.api_version.clone(),
        kind: types.kind.clone(),
        name: obj.name_any(),
        uid,
        ..OwnerReference::default()
    })
}

/// Group of an `apiVersion` string; empty for the core group.
pub(crate) fn api_group(api_version: &str) -> &str {
    api_version.split_once('/').map(|(group, _)| group).unwrap_or_default()
}

/// Add `owner` to `owners` unless an entry for the same object exists, in
/// which case that entry is replaced. Returns whether anything changed.
pub fn merge_owner(owners: &mut Vec<OwnerReference>, owner: &OwnerReference) -> bool {
    let same = |o: &OwnerReference| {
        o.kind == owner.kind && o.name == owner.name && api_group(&o.api_version) == api_group(&owner.api_version)
    };
    match owners.iter_mut().find(|o| same(o)) {
        Some(existing) if existing == owner => false,
        Some(existing) => {
            *existing = owner.clone();
            true
        }
        None => {
            owners.push(owner.clone());
            true
        }
    }
}

/// Drop server-assigned identity so a copy can be created elsewhere.
pub(crate) fn strip_identity(obj: &mut DynamicObject) {
    let meta = &mut obj.metadata;
    meta.uid = None;
    meta.resource_version = None;
    meta.creation_timestamp = None;
    meta.managed_fields = None;
    meta.generation = None;
    meta.owner_references = None;
    meta.self_link = None;
    meta.deletion_timestamp = None;
    meta.deletion_grace_period_seconds = None;
}
