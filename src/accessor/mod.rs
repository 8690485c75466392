use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use http::StatusCode;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::DynamicObject;
use kube::core::{ApiResource, ErrorResponse};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::crd::{
    Cluster, KubeadmControlPlane, Machine, MachineDeployment, Package, TanzuKubernetesCluster,
};

mod kube_client;
pub use kube_client::KubeAccessor;

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("NotFound: {0}")]
    NotFound(String),

    #[error("AlreadyExists: {0}")]
    AlreadyExists(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("UnknownKind: no resource mapping for {0}")]
    UnknownKind(GroupKind),

    #[error("{0}")]
    Unexpected(String),

    #[error("Unreachable: {0}")]
    Unreachable(String),

    #[error("Kube Error: {0}")]
    Kube(#[source] kube::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl From<kube::Error> for AccessError {
    fn from(err: kube::Error) -> Self {
        if let kube::Error::Api(ErrorResponse {
            code,
            reason,
            message,
            ..
        }) = &err
        {
            if *code == StatusCode::NOT_FOUND.as_u16() {
                return AccessError::NotFound(message.clone());
            }
            if *code == StatusCode::CONFLICT.as_u16() {
                return if reason == "AlreadyExists" {
                    AccessError::AlreadyExists(message.clone())
                } else {
                    AccessError::Conflict(message.clone())
                };
            }
        }
        match err {
            kube::Error::HyperError(_) | kube::Error::Service(_) => {
                AccessError::Unreachable(err.to_string())
            }
            _ => AccessError::Kube(err),
        }
    }
}

impl AccessError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, AccessError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, AccessError::AlreadyExists(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, AccessError::Conflict(_))
    }
}

/// API group and kind, without a version.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKind {
    pub group: String,
    pub kind: String,
}

impl GroupKind {
    pub fn new(group: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            kind: kind.into(),
        }
    }

    pub fn of<K: Resource<DynamicType = ()>>() -> Self {
        Self::new(K::group(&()), K::kind(&()))
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}.{}", self.kind, self.group)
        }
    }
}

/// Every kind of object this crate reads or writes.
///
/// The fixed catalog is resolved from the [`ResourceRegistry`]; `Dynamic`
/// covers provider objects whose mapping is only known through discovery.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Cluster,
    ControlPlane,
    WorkerPool,
    Machine,
    Secret,
    ConfigMap,
    ManagedCluster,
    Package,
    Dynamic(GroupKind),
}

impl ResourceKind {
    pub fn group_kind(&self) -> GroupKind {
        match self {
            ResourceKind::Cluster => GroupKind::of::<Cluster>(),
            ResourceKind::ControlPlane => GroupKind::of::<KubeadmControlPlane>(),
            ResourceKind::WorkerPool => GroupKind::of::<MachineDeployment>(),
            ResourceKind::Machine => GroupKind::of::<Machine>(),
            ResourceKind::Secret => GroupKind::of::<Secret>(),
            ResourceKind::ConfigMap => GroupKind::of::<ConfigMap>(),
            ResourceKind::ManagedCluster => GroupKind::of::<TanzuKubernetesCluster>(),
            ResourceKind::Package => GroupKind::of::<Package>(),
            ResourceKind::Dynamic(gk) => gk.clone(),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.group_kind())
    }
}

/// Group/kind to resource mapping, built once at startup and shared by
/// reference.
#[derive(Clone, Debug, Default)]
pub struct ResourceRegistry {
    resources: HashMap<GroupKind, ApiResource>,
}

impl ResourceRegistry {
    /// Registry preloaded with the fixed catalog.
    pub fn with_catalog() -> Self {
        let mut registry = Self::default();
        registry.register(ApiResource::erase::<Cluster>(&()));
        registry.register(ApiResource::erase::<KubeadmControlPlane>(&()));
        registry.register(ApiResource::erase::<MachineDeployment>(&()));
        registry.register(ApiResource::erase::<Machine>(&()));
        registry.register(ApiResource::erase::<Secret>(&()));
        registry.register(ApiResource::erase::<ConfigMap>(&()));
        registry.register(ApiResource::erase::<TanzuKubernetesCluster>(&()));
        registry.register(ApiResource::erase::<Package>(&()));
        registry
    }

    pub fn register(&mut self, resource: ApiResource) {
        let gk = GroupKind::new(resource.group.clone(), resource.kind.clone());
        self.resources.insert(gk, resource);
    }

    pub fn lookup(&self, gk: &GroupKind) -> Option<&ApiResource> {
        self.resources.get(gk)
    }
}

/// A catalog type that can be read and written through a [`ResourceAccessor`].
pub trait Catalogued: Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: ResourceKind;
}

impl Catalogued for Cluster {
    const KIND: ResourceKind = ResourceKind::Cluster;
}

impl Catalogued for KubeadmControlPlane {
    const KIND: ResourceKind = ResourceKind::ControlPlane;
}

impl Catalogued for MachineDeployment {
    const KIND: ResourceKind = ResourceKind::WorkerPool;
}

impl Catalogued for Machine {
    const KIND: ResourceKind = ResourceKind::Machine;
}

impl Catalogued for Secret {
    const KIND: ResourceKind = ResourceKind::Secret;
}

impl Catalogued for ConfigMap {
    const KIND: ResourceKind = ResourceKind::ConfigMap;
}

impl Catalogued for TanzuKubernetesCluster {
    const KIND: ResourceKind = ResourceKind::ManagedCluster;
}

impl Catalogued for Package {
    const KIND: ResourceKind = ResourceKind::Package;
}

pub fn decode<K: DeserializeOwned>(obj: DynamicObject) -> Result<K, AccessError> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

pub fn encode<K: Serialize>(obj: &K) -> Result<DynamicObject, AccessError> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

/// Namespaced operations against the remote store.
#[async_trait]
pub trait ResourceAccessor: Send + Sync {
    /// Resource mapping for a kind, consulting discovery for dynamic kinds.
    async fn resolve(&self, kind: &ResourceKind) -> Result<ApiResource, AccessError>;

    async fn get(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<DynamicObject, AccessError>;

    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>, AccessError>;

    async fn create(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, AccessError>;

    /// Replace an object. Fails with [`AccessError::Conflict`] when the
    /// resource version on `obj` is stale.
    async fn update(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, AccessError>;

    /// Apply a JSON merge patch.
    async fn patch_merge(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<DynamicObject, AccessError>;

    async fn delete(&self, kind: &ResourceKind, namespace: &str, name: &str)
        -> Result<(), AccessError>;

    /// Git version reported by the API server, e.g. `v1.27.5+vmware.1`.
    async fn server_version(&self) -> Result<String, AccessError>;

    async fn get_typed<K: Catalogued>(&self, namespace: &str, name: &str) -> Result<K, AccessError> {
        decode(self.get(&K::KIND, namespace, name).await?)
    }

    async fn list_typed<K: Catalogued>(
        &self,
        namespace: &str,
        label_selector: Option<&str>,
    ) -> Result<Vec<K>, AccessError> {
        self.list(&K::KIND, namespace, label_selector)
            .await?
            .into_iter()
            .map(decode)
            .collect()
    }

    /// Objects of a catalog kind labelled as belonging to `cluster`.
    async fn list_for_cluster<K: Catalogued>(
        &self,
        namespace: &str,
        cluster: &str,
    ) -> Result<Vec<K>, AccessError> {
        let selector = format!("{}={}", crate::crd::CLUSTER_NAME_LABEL, cluster);
        self.list_typed(namespace, Some(&selector)).await
    }

    async fn create_typed<K: Catalogued>(&self, namespace: &str, obj: &K) -> Result<K, AccessError> {
        decode(self.create(&K::KIND, namespace, &encode(obj)?).await?)
    }
}
