use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::core::ApiResource;
use kube::{Client, ResourceExt};
use serde_json::Value;
use tracing::debug;

use super::{AccessError, ResourceAccessor, ResourceKind, ResourceRegistry};

/// [`ResourceAccessor`] backed by a live API server.
#[derive(Clone)]
pub struct KubeAccessor {
    client: Client,
    registry: Arc<ResourceRegistry>,
}

impl KubeAccessor {
    pub fn new(client: Client, registry: Arc<ResourceRegistry>) -> Self {
        Self { client, registry }
    }

    async fn api(&self, kind: &ResourceKind, namespace: &str) -> Result<Api<DynamicObject>, AccessError> {
        let ar = self.resolve(kind).await?;
        Ok(Api::namespaced_with(self.client.clone(), namespace, &ar))
    }
}

#[async_trait]
impl ResourceAccessor for KubeAccessor {
    async fn resolve(&self, kind: &ResourceKind) -> Result<ApiResource, AccessError> {
        let gk = kind.group_kind();
        if let Some(ar) = self.registry.lookup(&gk) {
            return Ok(ar.clone());
        }

        debug!(group = %gk.group, kind = %gk.kind, "discovering resource mapping");
        let group = kube::discovery::group(&self.client, &gk.group).await?;
        group
            .recommended_kind(&gk.kind)
            .map(|(ar, _caps)| ar)
            .ok_or(AccessError::UnknownKind(gk))
    }

    async fn get(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<DynamicObject, AccessError> {
        Ok(self.api(kind, namespace).await?.get(name).await?)
    }

    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>, AccessError> {
        let mut lp = ListParams::default();
        if let Some(selector) = label_selector {
            lp = lp.labels(selector);
        }
        let list = self.api(kind, namespace).await?.list(&lp).await?;
        Ok(list.items)
    }

    async fn create(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, AccessError> {
        let api = self.api(kind, namespace).await?;
        Ok(api.create(&PostParams::default(), obj).await?)
    }

    async fn update(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, AccessError> {
        let api = self.api(kind, namespace).await?;
        Ok(api
            .replace(&obj.name_any(), &PostParams::default(), obj)
            .await?)
    }

    async fn patch_merge(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<DynamicObject, AccessError> {
        let api = self.api(kind, namespace).await?;
        Ok(api
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?)
    }

    async fn delete(&self, kind: &ResourceKind, namespace: &str, name: &str) -> Result<(), AccessError> {
        let api = self.api(kind, namespace).await?;
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn server_version(&self) -> Result<String, AccessError> {
        Ok(self.client.apiserver_version().await?.git_version)
    }
}
