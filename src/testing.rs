use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::core::{ApiResource, ErrorResponse, GroupVersionKind};
use kube::ResourceExt;
use serde_json::Value;

use crate::accessor::{
    encode, AccessError, Catalogued, GroupKind, ResourceAccessor, ResourceKind, ResourceRegistry,
};

type Key = (GroupKind, String, String);
type Hook = Box<dyn FnOnce(&mut DynamicObject) + Send>;

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, DynamicObject>,
    registry: ResourceRegistry,
    revision: u64,
    server_version: String,
    unreachable: bool,
    failing: HashMap<GroupKind, String>,
    failing_patches: HashMap<GroupKind, String>,
    pre_update: HashMap<Key, Vec<Hook>>,
    creates: usize,
    patches: usize,
    updates: usize,
}

impl State {
    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }

    fn check(&self, gk: &GroupKind) -> Result<(), AccessError> {
        if self.unreachable {
            return Err(AccessError::Unreachable("connection refused".into()));
        }
        match self.failing.get(gk) {
            Some(message) => Err(server_error(message)),
            None => Ok(()),
        }
    }
}

fn server_error(message: &str) -> AccessError {
    kube::Error::Api(ErrorResponse {
        status: "Failure".into(),
        message: message.into(),
        reason: "InternalError".into(),
        code: 500,
    })
    .into()
}

/// Cloning shares the underlying store.
#[derive(Clone)]
pub struct FakeAccessor {
    state: Arc<Mutex<State>>,
}

impl Default for FakeAccessor {
    fn default() -> Self {
        Self::new()
    }
}

fn key(kind: &ResourceKind, namespace: &str, name: &str) -> Key {
    (kind.group_kind(), namespace.to_string(), name.to_string())
}

fn matches_selector(obj: &DynamicObject, selector: Option<&str>) -> bool {
    let Some(selector) = selector else {
        return true;
    };
    let labels = obj.labels();
    selector.split(',').filter(|s| !s.is_empty()).all(|term| {
        match term.split_once('=') {
            Some((k, v)) => labels.get(k.trim()).map(String::as_str) == Some(v.trim()),
            None => labels.contains_key(term.trim()),
        }
    })
}

impl FakeAccessor {
    pub fn new() -> Self {
        let state = State {
            registry: ResourceRegistry::with_catalog(),
            server_version: "v1.26.5+vmware.1".into(),
            ..State::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Make a dynamic kind resolvable.
    pub fn register_kind(&self, group: &str, version: &str, kind: &str) {
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk(group, version, kind));
        self.lock().registry.register(ar);
    }

    pub fn set_server_version(&self, version: &str) {
        self.lock().server_version = version.into();
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Every operation on `kind` fails with a server error.
    pub fn fail_kind(&self, kind: &ResourceKind, message: &str) {
        self.lock().failing.insert(kind.group_kind(), message.into());
    }

    /// Merge patches of `kind` fail with a server error, reads still work.
    pub fn fail_patches(&self, kind: &ResourceKind, message: &str) {
        self.lock().failing_patches.insert(kind.group_kind(), message.into());
    }

    /// Run `hook` against the stored object right before the next update of
    /// it, as if another writer got there first.
    pub fn before_next_update<F>(&self, kind: &ResourceKind, namespace: &str, name: &str, hook: F)
    where
        F: FnOnce(&mut DynamicObject) + Send + 'static,
    {
        self.lock()
            .pre_update
            .entry(key(kind, namespace, name))
            .or_default()
            .push(Box::new(hook));
    }

    /// Store an object directly, bypassing create semantics.
    pub fn seed_dynamic(&self, kind: &ResourceKind, namespace: &str, mut obj: DynamicObject) {
        let mut state = self.lock();
        let name = obj.name_any();
        obj.metadata.namespace = Some(namespace.to_string());
        if obj.metadata.uid.is_none() {
            obj.metadata.uid = Some(format!("uid-{}-{}", name, state.revision + 1));
        }
        obj.metadata.resource_version = Some(state.next_revision());
        state.objects.insert(key(kind, namespace, &name), obj);
    }

    pub fn seed<K: Catalogued>(&self, namespace: &str, obj: &K) {
        let obj = encode(obj).unwrap();
        self.seed_dynamic(&K::KIND, namespace, obj);
    }

    /// Store a value given as JSON.
    pub fn seed_json(&self, kind: &ResourceKind, namespace: &str, value: Value) {
        let obj: DynamicObject = serde_json::from_value(value).unwrap();
        self.seed_dynamic(kind, namespace, obj);
    }

    /// Replace the stored object with a mutated copy, bumping its revision.
    pub fn modify<F>(&self, kind: &ResourceKind, namespace: &str, name: &str, f: F)
    where
        F: FnOnce(&mut DynamicObject),
    {
        let mut state = self.lock();
        let revision = state.next_revision();
        let obj = state
            .objects
            .get_mut(&key(kind, namespace, name))
            .unwrap_or_else(|| panic!("{kind} {namespace}/{name} not seeded"));
        f(obj);
        obj.metadata.resource_version = Some(revision);
    }

    pub fn remove(&self, kind: &ResourceKind, namespace: &str, name: &str) {
        self.lock().objects.remove(&key(kind, namespace, name));
    }

    pub fn stored(&self, kind: &ResourceKind, namespace: &str, name: &str) -> Option<DynamicObject> {
        self.lock().objects.get(&key(kind, namespace, name)).cloned()
    }

    pub fn stored_json(&self, kind: &ResourceKind, namespace: &str, name: &str) -> Option<Value> {
        self.stored(kind, namespace, name)
            .map(|obj| serde_json::to_value(obj).unwrap())
    }

    /// Number of stored objects of `kind` in `namespace`.
    pub fn count(&self, kind: &ResourceKind, namespace: &str) -> usize {
        let gk = kind.group_kind();
        self.lock()
            .objects
            .keys()
            .filter(|(g, ns, _)| *g == gk && ns == namespace)
            .count()
    }

    pub fn creates(&self) -> usize {
        self.lock().creates
    }

    pub fn patches(&self) -> usize {
        self.lock().patches
    }

    pub fn updates(&self) -> usize {
        self.lock().updates
    }
}

#[async_trait]
impl ResourceAccessor for FakeAccessor {
    async fn resolve(&self, kind: &ResourceKind) -> Result<ApiResource, AccessError> {
        let state = self.lock();
        let gk = kind.group_kind();
        state.check(&gk)?;
        state
            .registry
            .lookup(&gk)
            .cloned()
            .ok_or(AccessError::UnknownKind(gk))
    }

    async fn get(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<DynamicObject, AccessError> {
        let state = self.lock();
        state.check(&kind.group_kind())?;
        state
            .objects
            .get(&key(kind, namespace, name))
            .cloned()
            .ok_or_else(|| AccessError::NotFound(format!("{kind} \"{name}\" not found")))
    }

    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>, AccessError> {
        let state = self.lock();
        let gk = kind.group_kind();
        state.check(&gk)?;
        Ok(state
            .objects
            .iter()
            .filter(|((g, ns, _), _)| *g == gk && ns == namespace)
            .map(|(_, obj)| obj)
            .filter(|obj| matches_selector(obj, label_selector))
            .cloned()
            .collect())
    }

    async fn create(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, AccessError> {
        let mut state = self.lock();
        let gk = kind.group_kind();
        state.check(&gk)?;
        if state.registry.lookup(&gk).is_none() {
            return Err(AccessError::UnknownKind(gk));
        }
        let name = obj.name_any();
        let k = key(kind, namespace, &name);
        if state.objects.contains_key(&k) {
            return Err(AccessError::AlreadyExists(format!(
                "{kind} \"{name}\" already exists"
            )));
        }
        state.creates += 1;
        let mut created = obj.clone();
        created.metadata.namespace = Some(namespace.to_string());
        created.metadata.uid = Some(format!("uid-{}-{}", name, state.revision + 1));
        created.metadata.resource_version = Some(state.next_revision());
        state.objects.insert(k, created.clone());
        Ok(created)
    }

    async fn update(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, AccessError> {
        let mut state = self.lock();
        state.check(&kind.group_kind())?;
        let name = obj.name_any();
        let k = key(kind, namespace, &name);

        let hooks = state.pre_update.remove(&k).unwrap_or_default();
        for hook in hooks {
            let revision = state.next_revision();
            if let Some(stored) = state.objects.get_mut(&k) {
                hook(stored);
                stored.metadata.resource_version = Some(revision);
            }
        }

        let Some(stored) = state.objects.get(&k) else {
            return Err(AccessError::NotFound(format!("{kind} \"{name}\" not found")));
        };
        if obj.metadata.resource_version.is_some()
            && obj.metadata.resource_version != stored.metadata.resource_version
        {
            return Err(AccessError::Conflict(format!(
                "Operation cannot be fulfilled on {kind} \"{name}\": the object has been modified"
            )));
        }
        let uid = stored.metadata.uid.clone();
        state.updates += 1;
        let mut updated = obj.clone();
        updated.metadata.namespace = Some(namespace.to_string());
        updated.metadata.uid = uid;
        updated.metadata.resource_version = Some(state.next_revision());
        state.objects.insert(k, updated.clone());
        Ok(updated)
    }

    async fn patch_merge(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<DynamicObject, AccessError> {
        let mut state = self.lock();
        let gk = kind.group_kind();
        state.check(&gk)?;
        if let Some(message) = state.failing_patches.get(&gk) {
            return Err(server_error(message));
        }
        let k = key(kind, namespace, name);
        let Some(stored) = state.objects.get(&k) else {
            return Err(AccessError::NotFound(format!("{kind} \"{name}\" not found")));
        };
        let mut value = serde_json::to_value(stored)?;
        json_patch::merge(&mut value, patch);
        let mut patched: DynamicObject = serde_json::from_value(value)?;
        state.patches += 1;
        patched.metadata.resource_version = Some(state.next_revision());
        state.objects.insert(k, patched.clone());
        Ok(patched)
    }

    async fn delete(&self, kind: &ResourceKind, namespace: &str, name: &str) -> Result<(), AccessError> {
        let mut state = self.lock();
        state.check(&kind.group_kind())?;
        state
            .objects
            .remove(&key(kind, namespace, name))
            .map(|_| ())
            .ok_or_else(|| AccessError::NotFound(format!("{kind} \"{name}\" not found")))
    }

    async fn server_version(&self) -> Result<String, AccessError> {
        let state = self.lock();
        if state.unreachable {
            return Err(AccessError::Unreachable("connection refused".into()));
        }
        Ok(state.server_version.clone())
    }
}
