use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::DynamicObject;
use kube::ResourceExt;
use serde_json::json;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

use super::{api_group, merge_owner, BootstrapReplicator, ReplicateError};
use crate::accessor::{decode, AccessError, GroupKind, ResourceAccessor, ResourceKind};

fn provider_kind(provider: &DynamicObject) -> Result<ResourceKind, ReplicateError> {
    let types = provider
        .types
        .as_ref()
        .ok_or_else(|| ReplicateError::InvalidObject(format!("{} has no type information", provider.name_any())))?;
    Ok(ResourceKind::Dynamic(GroupKind::new(
        api_group(&types.api_version),
        types.kind.clone(),
    )))
}

impl<A: ResourceAccessor> BootstrapReplicator<A> {
    /// Make `owner` an owner of every given secret and provider, keeping the
    /// owners they already have.
    #[instrument(skip_all, fields(owner = %owner.name))]
    pub async fn ensure_owner_ref(
        &self,
        owner: &OwnerReference,
        secrets: &[Secret],
        providers: &[DynamicObject],
    ) -> Result<(), ReplicateError> {
        for secret in secrets {
            self.ensure_secret_owner(owner, secret).await?;
        }
        for provider in providers {
            let kind = provider_kind(provider)?;
            let namespace = provider.namespace().unwrap_or_default();
            self.ensure_provider_owner(owner, &kind, &namespace, &provider.name_any())
                .await?;
        }
        Ok(())
    }

    /// Upsert the secret with `owner` added to whatever owners are stored.
    async fn ensure_secret_owner(&self, owner: &OwnerReference, secret: &Secret) -> Result<(), ReplicateError> {
        let namespace = secret.namespace().unwrap_or_default();
        let name = secret.name_any();
        match self.accessor.get(&ResourceKind::Secret, &namespace, &name).await {
            Ok(stored) => {
                let stored: Secret = decode(stored)?;
                let mut owners = stored.owner_references().to_vec();
                if !merge_owner(&mut owners, owner) {
                    debug!(secret = %name, "owner reference already present");
                    return Ok(());
                }
                let patch = json!({ "metadata": { "ownerReferences": owners } });
                self.accessor
                    .patch_merge(&ResourceKind::Secret, &namespace, &name, &patch)
                    .await
                    .map_err(|source| {
                        error!(error = %source, "unable to patch the secret {namespace}/{name} with ownerRef");
                        ReplicateError::OwnerUpdate {
                            kind: "Secret".into(),
                            namespace: namespace.clone(),
                            name: name.clone(),
                            source,
                        }
                    })?;
            }
            Err(err) if err.is_not_found() => {
                let mut secret = secret.clone();
                secret.metadata.resource_version = None;
                secret.metadata.uid = None;
                merge_owner(secret.owner_references_mut(), owner);
                self.accessor.create_typed(&namespace, &secret).await?;
            }
            Err(err) => return Err(err.into()),
        }
        info!("ensured owner of secret {namespace}/{name}");
        Ok(())
    }

    /// Read-modify-write of the owners, re-reading the stored copy before
    /// every attempt and retrying on conflicts up to the configured cap.
    async fn ensure_provider_owner(
        &self,
        owner: &OwnerReference,
        kind: &ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), ReplicateError> {
        let attempts = self.config.conflict_retry_attempts;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut latest = self.accessor.get(kind, namespace, name).await.map_err(|source| {
                error!(error = %source, "unable to get provider {namespace}/{name}");
                ReplicateError::OwnerUpdate {
                    kind: kind.to_string(),
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                    source,
                }
            })?;
            let mut owners = latest.metadata.owner_references.take().unwrap_or_default();
            if !merge_owner(&mut owners, owner) {
                return Ok(());
            }
            latest.metadata.owner_references = Some(owners);

            match self.accessor.update(kind, namespace, &latest).await {
                Ok(_) => {
                    info!("ensured owner of {kind} {namespace}/{name}");
                    return Ok(());
                }
                Err(AccessError::Conflict(reason)) if attempt < attempts => {
                    warn!(attempt, %reason, "conflict updating provider {namespace}/{name}, retrying");
                    sleep(self.config.conflict_retry_delay).await;
                }
                Err(source) => {
                    error!(attempt, error = %source, "unable to update provider {namespace}/{name}");
                    return Err(ReplicateError::OwnerUpdate {
                        kind: kind.to_string(),
                        namespace: namespace.to_string(),
                        name: name.to_string(),
                        source,
                    });
                }
            }
        }
    }
}
