use std::collections::{BTreeMap, BTreeSet, VecDeque};

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::DynamicObject;
use kube::ResourceExt;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, instrument};

use super::embedded::find_embedded_refs;
use super::{
    cluster_owner, merge_owner, object_owner, package_labels, package_object_name, strip_identity,
    BootstrapPackage, BootstrapReplicator, CloneFailure, ClonedPackages, ProviderRef, ReplicateError,
    ValuesSource, MANAGED_SECRET_TYPE, VALUES_FILE,
};
use crate::accessor::{decode, GroupKind, ResourceAccessor, ResourceKind};
use crate::crd::{Cluster, Package};

/// What cloning one package produced.
enum Cloned {
    Nothing,
    Secret(Secret),
    Provider {
        provider: DynamicObject,
        embedded: Vec<DynamicObject>,
    },
}

/// Destination of the clones of one package.
struct Target<'a> {
    cluster_name: String,
    namespace: String,
    owner: OwnerReference,
    package: &'a BootstrapPackage,
    name: String,
}

impl Target<'_> {
    fn labels(&self) -> BTreeMap<String, String> {
        package_labels(self.package, &self.cluster_name)
    }
}

/// Merge patch of one secret payload field that leaves exactly the keys of
/// `desired` in place of whatever `stored` holds.
fn payload_patch<V: Serialize>(
    stored: Option<&BTreeMap<String, V>>,
    desired: Option<&BTreeMap<String, V>>,
    keep: &BTreeSet<&str>,
) -> Option<Value> {
    let mut fields = Map::new();
    for key in stored.into_iter().flat_map(BTreeMap::keys) {
        if !keep.contains(key.as_str()) {
            fields.insert(key.clone(), Value::Null);
        }
    }
    for (key, value) in desired.into_iter().flatten() {
        fields.insert(key.clone(), json!(value));
    }
    (!fields.is_empty()).then_some(Value::Object(fields))
}

impl<A: ResourceAccessor> BootstrapReplicator<A> {
    /// Clone the values source of every package from `source_namespace`
    /// into the cluster's namespace.
    ///
    /// Stops at the first failing package. The objects cloned until then are
    /// returned with the error; running the whole list again is safe.
    #[instrument(skip_all, fields(cluster = %cluster.name_any(), source_namespace))]
    pub async fn clone_referenced_objects_from_packages(
        &self,
        cluster: &Cluster,
        packages: &[BootstrapPackage],
        source_namespace: &str,
    ) -> Result<ClonedPackages, CloneFailure> {
        let mut cloned = ClonedPackages::default();
        for package in packages {
            match self.clone_package(cluster, package, source_namespace).await {
                Ok((rewritten, objects)) => {
                    match objects {
                        Cloned::Nothing => {}
                        Cloned::Secret(secret) => cloned.secrets.push(secret),
                        Cloned::Provider { provider, embedded } => {
                            cloned.providers.push(provider);
                            cloned.embedded.extend(embedded);
                        }
                    }
                    cloned.packages.push(rewritten);
                }
                Err(source) => {
                    error!(package = %package.ref_name, error = %source, "unable to clone package values");
                    return Err(CloneFailure { cloned, source });
                }
            }
        }
        Ok(cloned)
    }

    async fn clone_package(
        &self,
        cluster: &Cluster,
        package: &BootstrapPackage,
        source_namespace: &str,
    ) -> Result<(BootstrapPackage, Cloned), ReplicateError> {
        let Some(source) = package.values_from.as_ref().and_then(|v| v.source()) else {
            debug!(package = %package.ref_name, "nothing to clone");
            return Ok((package.clone(), Cloned::Nothing));
        };

        let namespace = cluster
            .namespace()
            .ok_or_else(|| ReplicateError::InvalidObject(format!("cluster {} has no namespace", cluster.name_any())))?;
        let carvel_ref_name = self.carvel_ref_name(&namespace, &package.ref_name).await?;
        let cluster_name = cluster.name_any();
        let target = Target {
            name: package_object_name(&cluster_name, &carvel_ref_name),
            cluster_name,
            namespace,
            owner: cluster_owner(cluster)?,
            package,
        };

        let mut rewritten = package.clone();
        let values_from = rewritten.values_from.get_or_insert_with(Default::default);
        let cloned = match source {
            ValuesSource::Inline(values) => Cloned::Secret(self.clone_inline(&target, values).await?),
            ValuesSource::SecretRef(secret) => {
                let secret = self.clone_secret(&target, secret, source_namespace).await?;
                values_from.secret_ref = Some(secret.name_any());
                Cloned::Secret(secret)
            }
            ValuesSource::ProviderRef(provider_ref) => {
                let (provider, embedded) = self
                    .clone_provider(&target, provider_ref, source_namespace)
                    .await?;
                if let Some(r) = values_from.provider_ref.as_mut() {
                    r.name = provider.name_any();
                }
                Cloned::Provider { provider, embedded }
            }
        };
        Ok((rewritten, cloned))
    }

    /// `spec.refName` of the carvel package a bootstrap package names.
    async fn carvel_ref_name(&self, namespace: &str, package: &str) -> Result<String, ReplicateError> {
        let carvel: Package = self
            .accessor
            .get_typed(namespace, package)
            .await
            .map_err(|source| ReplicateError::Package {
                namespace: namespace.to_string(),
                name: package.to_string(),
                source,
            })?;
        if carvel.spec.ref_name.is_empty() {
            return Err(ReplicateError::EmptyRefName {
                namespace: namespace.to_string(),
                name: package.to_string(),
            });
        }
        Ok(carvel.spec.ref_name)
    }

    async fn clone_inline(&self, target: &Target<'_>, values: &Map<String, Value>) -> Result<Secret, ReplicateError> {
        let payload = serde_yaml::to_string(values)?;
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(target.name.clone()),
                namespace: Some(target.namespace.clone()),
                ..ObjectMeta::default()
            },
            string_data: Some(BTreeMap::from([(VALUES_FILE.to_string(), payload)])),
            ..Secret::default()
        };
        let secret = self.create_or_patch_secret(target, secret).await?;
        info!("Secret {}/{} for inline ValuesFrom", target.namespace, target.name);
        Ok(secret)
    }

    async fn clone_secret(
        &self,
        target: &Target<'_>,
        name: &str,
        source_namespace: &str,
    ) -> Result<Secret, ReplicateError> {
        let source: Secret = self.accessor.get_typed(source_namespace, name).await.map_err(|err| {
            error!(error = %err, "unable to fetch secret {source_namespace}/{name}");
            err
        })?;
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(target.name.clone()),
                namespace: Some(target.namespace.clone()),
                ..ObjectMeta::default()
            },
            data: source.data,
            string_data: source.string_data,
            immutable: source.immutable,
            ..Secret::default()
        };
        let secret = self.create_or_patch_secret(target, secret).await?;
        info!("Secret {}/{} cloned from {source_namespace}/{name}", target.namespace, target.name);
        Ok(secret)
    }

    /// Create the secret, or patch the stored one, with the package labels,
    /// the managed type and the cluster as an owner. The payload of `secret`
    /// replaces the stored payload.
    async fn create_or_patch_secret(&self, target: &Target<'_>, mut secret: Secret) -> Result<Secret, ReplicateError> {
        let kind = ResourceKind::Secret;
        let existing = match self.accessor.get(&kind, &target.namespace, &target.name).await {
            Ok(existing) => Some(decode::<Secret>(existing)?),
            Err(err) if err.is_not_found() => None,
            Err(err) => return Err(err.into()),
        };

        let Some(existing) = existing else {
            secret.metadata.labels = Some(target.labels());
            secret.metadata.owner_references = Some(vec![target.owner.clone()]);
            secret.type_ = Some(MANAGED_SECRET_TYPE.to_string());
            return Ok(self.accessor.create_typed(&target.namespace, &secret).await?);
        };

        let mut owners = existing.owner_references().to_vec();
        merge_owner(&mut owners, &target.owner);
        let mut patch = json!({
            "metadata": {
                "labels": target.labels(),
                "ownerReferences": owners,
            },
            "type": MANAGED_SECRET_TYPE,
        });
        let keep: BTreeSet<&str> = secret
            .data
            .iter()
            .flat_map(BTreeMap::keys)
            .chain(secret.string_data.iter().flat_map(BTreeMap::keys))
            .map(String::as_str)
            .collect();
        if let Some(data) = payload_patch(existing.data.as_ref(), secret.data.as_ref(), &keep) {
            patch["data"] = data;
        }
        if let Some(string_data) = payload_patch(existing.string_data.as_ref(), secret.string_data.as_ref(), &keep) {
            patch["stringData"] = string_data;
        }
        let patched = self
            .accessor
            .patch_merge(&kind, &target.namespace, &target.name, &patch)
            .await?;
        debug!("patched existing secret {}/{}", target.namespace, target.name);
        Ok(decode(patched)?)
    }

    async fn clone_provider(
        &self,
        target: &Target<'_>,
        provider_ref: &ProviderRef,
        source_namespace: &str,
    ) -> Result<(DynamicObject, Vec<DynamicObject>), ReplicateError> {
        let kind = provider_ref.resource_kind();
        self.accessor.resolve(&kind).await.map_err(|err| {
            error!(error = %err, "failed to resolve {kind}");
            err
        })?;
        let source = self
            .accessor
            .get(&kind, source_namespace, &provider_ref.name)
            .await
            .map_err(|err| {
                error!(error = %err, "unable to fetch provider {source_namespace}/{}", provider_ref.name);
                err
            })?;

        let mut copy = source.clone();
        strip_identity(&mut copy);
        copy.labels_mut().extend(target.labels());
        copy.metadata.owner_references = Some(vec![target.owner.clone()]);
        copy.metadata.name = Some(target.name.clone());
        copy.metadata.namespace = Some(target.namespace.clone());

        info!(
            "cloning provider {source_namespace}/{} to {}/{}",
            provider_ref.name, target.namespace, target.name
        );
        let provider = match self.accessor.create(&kind, &target.namespace, &copy).await {
            Ok(created) => created,
            Err(err) if err.is_already_exists() => {
                info!(
                    "provider {}/{} already exist, patching its Labels and OwnerReferences fields",
                    target.namespace, target.name
                );
                self.patch_labels_and_owners(&kind, &target.namespace, &target.name, copy.labels().clone(), &[&target.owner])
                    .await?
            }
            Err(err) => return Err(err.into()),
        };

        let embedded = self
            .clone_embedded(target, &source, &provider, &kind)
            .await?;
        Ok((provider, embedded))
    }

    /// Merge `labels` into the stored object's labels and add `owners` to its
    /// owner references. Nothing else is touched.
    async fn patch_labels_and_owners(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        name: &str,
        labels: BTreeMap<String, String>,
        owners: &[&OwnerReference],
    ) -> Result<DynamicObject, ReplicateError> {
        let stored = self.accessor.get(kind, namespace, name).await?;
        let mut merged = stored.owner_references().to_vec();
        for owner in owners {
            merge_owner(&mut merged, owner);
        }
        let mut metadata = json!({ "ownerReferences": merged });
        if !labels.is_empty() {
            metadata["labels"] = json!(labels);
        }
        Ok(self
            .accessor
            .patch_merge(kind, namespace, name, &json!({ "metadata": metadata }))
            .await?)
    }

    /// Clone the objects a provider references, and the objects those
    /// reference in turn, next to the provider's clone. Each clone is owned
    /// by the clone that referenced it and by the cluster.
    async fn clone_embedded(
        &self,
        target: &Target<'_>,
        source: &DynamicObject,
        provider: &DynamicObject,
        provider_kind: &ResourceKind,
    ) -> Result<Vec<DynamicObject>, ReplicateError> {
        let mut visited: BTreeSet<(GroupKind, String)> =
            BTreeSet::from([(provider_kind.group_kind(), source.name_any())]);
        let mut queue = VecDeque::from([(source.clone(), provider.clone())]);
        let mut cloned = Vec::new();

        while let Some((source, parent)) = queue.pop_front() {
            let refs = find_embedded_refs(&source.data);
            if refs.is_empty() {
                continue;
            }
            let source_namespace = source.namespace().unwrap_or_default();
            let parent_owner = object_owner(&parent)?;
            info!(
                "cloning the embedded local object references within {} from {source_namespace} to {}",
                source.name_any(),
                target.namespace
            );

            for (gk, names) in refs {
                let kind = ResourceKind::Dynamic(gk.clone());
                self.accessor.resolve(&kind).await?;
                for name in names {
                    if !visited.insert((gk.clone(), name.clone())) {
                        continue;
                    }
                    let fetched = self.accessor.get(&kind, &source_namespace, &name).await.map_err(|err| {
                        error!(error = %err, "unable to get {kind} {source_namespace}/{name}");
                        err
                    })?;

                    let mut copy = fetched.clone();
                    strip_identity(&mut copy);
                    copy.metadata.namespace = Some(target.namespace.clone());
                    let owners = copy.owner_references_mut();
                    merge_owner(owners, &parent_owner);
                    merge_owner(owners, &target.owner);

                    let clone = match self.accessor.create(&kind, &target.namespace, &copy).await {
                        Ok(created) => created,
                        Err(err) if err.is_already_exists() => {
                            self.patch_labels_and_owners(
                                &kind,
                                &target.namespace,
                                &name,
                                BTreeMap::new(),
                                &[&parent_owner, &target.owner],
                            )
                            .await?
                        }
                        Err(err) => return Err(err.into()),
                    };
                    debug!("cloned {kind} {name} into {}", target.namespace);
                    queue.push_back((fetched, clone.clone()));
                    cloned.push(clone);
                }
            }
        }
        Ok(cloned)
    }
}
