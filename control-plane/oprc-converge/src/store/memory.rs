use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::{DynamicObject, TypeMeta};
use kube::discovery::ApiResource;
use tokio::sync::RwLock;

use super::{
    DeleteOutcome, ObjectStore, Selector, StoreError, StoreResult,
    WriteOutcome,
};

type ObjectKey = (String, Option<String>, String);

#[derive(Default)]
struct MemoryState {
    objects: BTreeMap<ObjectKey, DynamicObject>,
    revision: u64,
    uid_seq: u64,
    unavailable: bool,
    reject_deletes: bool,
}

impl MemoryState {
    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }

    fn next_uid(&mut self) -> String {
        self.uid_seq += 1;
        format!("00000000-0000-0000-0000-{:012}", self.uid_seq)
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable {
            return Err(StoreError::Unavailable(
                "memory store switched offline".into(),
            ));
        }
        Ok(())
    }
}

fn type_key(resource: &ApiResource) -> String {
    format!("{}/{}", resource.api_version, resource.kind)
}

fn key_of(
    resource: &ApiResource,
    namespace: Option<&str>,
    name: &str,
) -> ObjectKey {
    (
        type_key(resource),
        namespace.map(str::to_string),
        name.to_string(),
    )
}

fn object_key(
    resource: &ApiResource,
    obj: &DynamicObject,
) -> StoreResult<ObjectKey> {
    let name = obj.metadata.name.as_deref().ok_or_else(|| {
        StoreError::InvalidObject(format!("{} without a name", resource.kind))
    })?;
    Ok(key_of(resource, obj.metadata.namespace.as_deref(), name))
}

fn with_types(resource: &ApiResource, mut obj: DynamicObject) -> DynamicObject {
    if obj.types.is_none() {
        obj.types = Some(TypeMeta {
            api_version: resource.api_version.clone(),
            kind: resource.kind.clone(),
        });
    }
    obj
}

fn strip_status(data: &mut serde_json::Value) -> Option<serde_json::Value> {
    data.as_object_mut().and_then(|m| m.remove("status"))
}

/// In-process [`ObjectStore`] with resourceVersion checks, generation
/// bumps on spec change and finalizer-aware deletion.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object as-is (status included). Missing uid, version and
    /// creation time are filled in.
    pub async fn insert(
        &self,
        resource: &ApiResource,
        obj: DynamicObject,
    ) -> DynamicObject {
        let mut state = self.state.write().await;
        let mut obj = with_types(resource, obj);
        if obj.metadata.uid.is_none() {
            obj.metadata.uid = Some(state.next_uid());
        }
        if obj.metadata.creation_timestamp.is_none() {
            obj.metadata.creation_timestamp = Some(Time(Utc::now()));
        }
        obj.metadata.resource_version = Some(state.next_revision());
        let name = obj.metadata.name.clone().unwrap_or_default();
        let key = key_of(resource, obj.metadata.namespace.as_deref(), &name);
        state.objects.insert(key, obj.clone());
        obj
    }

    pub async fn fetch(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Option<DynamicObject> {
        let state = self.state.read().await;
        state.objects.get(&key_of(resource, namespace, name)).cloned()
    }

    /// Every object of a type, optionally limited to one namespace.
    pub async fn objects(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
    ) -> Vec<DynamicObject> {
        let tk = type_key(resource);
        let state = self.state.read().await;
        state
            .objects
            .iter()
            .filter(|((t, ns, _), _)| {
                *t == tk
                    && (namespace.is_none() || ns.as_deref() == namespace)
            })
            .map(|(_, o)| o.clone())
            .collect()
    }

    /// Overwrite the status of an object, bumping its version as a
    /// concurrent writer would.
    pub async fn set_status(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        status: serde_json::Value,
    ) -> bool {
        let mut state = self.state.write().await;
        let rv = state.next_revision();
        match state.objects.get_mut(&key_of(resource, namespace, name)) {
            Some(obj) => {
                if let Some(m) = obj.data.as_object_mut() {
                    m.insert("status".into(), status);
                }
                obj.metadata.resource_version = Some(rv);
                true
            }
            None => false,
        }
    }

    /// Bump the version of an object without changing it.
    pub async fn touch(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> bool {
        let mut state = self.state.write().await;
        let rv = state.next_revision();
        match state.objects.get_mut(&key_of(resource, namespace, name)) {
            Some(obj) => {
                obj.metadata.resource_version = Some(rv);
                true
            }
            None => false,
        }
    }

    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.write().await.unavailable = unavailable;
    }

    pub async fn reject_deletes(&self, reject: bool) {
        self.state.write().await.reject_deletes = reject;
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> StoreResult<Option<DynamicObject>> {
        let state = self.state.read().await;
        state.check_available()?;
        Ok(state.objects.get(&key_of(resource, namespace, name)).cloned())
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> StoreResult<Vec<DynamicObject>> {
        let tk = type_key(resource);
        let state = self.state.read().await;
        state.check_available()?;
        Ok(state
            .objects
            .iter()
            .filter(|((t, ns, _), o)| {
                *t == tk
                    && (namespace.is_none() || ns.as_deref() == namespace)
                    && selector.matches(o.metadata.labels.as_ref())
            })
            .map(|(_, o)| o.clone())
            .collect())
    }

    async fn create(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
    ) -> StoreResult<WriteOutcome> {
        let mut state = self.state.write().await;
        state.check_available()?;
        let key = object_key(resource, obj)?;
        if state.objects.contains_key(&key) {
            return Ok(WriteOutcome::Conflict);
        }
        let mut created = with_types(resource, obj.clone());
        strip_status(&mut created.data);
        created.metadata.uid = Some(state.next_uid());
        created.metadata.resource_version = Some(state.next_revision());
        created.metadata.creation_timestamp = Some(Time(Utc::now()));
        created.metadata.deletion_timestamp = None;
        created.metadata.generation = Some(1);
        state.objects.insert(key, created.clone());
        Ok(WriteOutcome::Applied(created))
    }

    async fn patch(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
    ) -> StoreResult<WriteOutcome> {
        let mut state = self.state.write().await;
        state.check_available()?;
        let key = object_key(resource, obj)?;
        let Some(current) = state.objects.get(&key).cloned() else {
            return Err(StoreError::Rejected {
                code: 404,
                message: format!("{} {} not found", resource.kind, key.2),
            });
        };
        if obj.metadata.resource_version != current.metadata.resource_version
        {
            return Ok(WriteOutcome::Conflict);
        }

        let mut updated = with_types(resource, obj.clone());
        strip_status(&mut updated.data);
        let mut old_data = current.data.clone();
        if let Some(status) = strip_status(&mut old_data) {
            if let Some(m) = updated.data.as_object_mut() {
                m.insert("status".into(), status);
            }
        }
        // Server-owned metadata.
        updated.metadata.uid = current.metadata.uid.clone();
        updated.metadata.creation_timestamp =
            current.metadata.creation_timestamp.clone();
        updated.metadata.deletion_timestamp =
            current.metadata.deletion_timestamp.clone();
        updated.metadata.generation = current.metadata.generation;
        if current.data.get("spec") != updated.data.get("spec") {
            updated.metadata.generation =
                Some(current.metadata.generation.unwrap_or(0) + 1);
        }
        updated.metadata.resource_version = Some(state.next_revision());

        let released = updated.metadata.deletion_timestamp.is_some()
            && updated
                .metadata
                .finalizers
                .as_ref()
                .map(|f| f.is_empty())
                .unwrap_or(true);
        if released {
            state.objects.remove(&key);
        } else {
            state.objects.insert(key, updated.clone());
        }
        Ok(WriteOutcome::Applied(updated))
    }

    async fn patch_status(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        expected_version: &str,
        status: &serde_json::Value,
    ) -> StoreResult<WriteOutcome> {
        let mut state = self.state.write().await;
        state.check_available()?;
        let key = key_of(resource, namespace, name);
        let current_rv = match state.objects.get(&key) {
            Some(o) => o.metadata.resource_version.clone(),
            None => {
                return Err(StoreError::Rejected {
                    code: 404,
                    message: format!("{} {name} not found", resource.kind),
                });
            }
        };
        if current_rv.as_deref() != Some(expected_version) {
            return Ok(WriteOutcome::Conflict);
        }
        let rv = state.next_revision();
        let Some(obj) = state.objects.get_mut(&key) else {
            return Ok(WriteOutcome::Conflict);
        };
        if let Some(m) = obj.data.as_object_mut() {
            m.insert("status".into(), status.clone());
        }
        obj.metadata.resource_version = Some(rv);
        Ok(WriteOutcome::Applied(obj.clone()))
    }

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        expected_version: Option<&str>,
    ) -> StoreResult<DeleteOutcome> {
        let mut state = self.state.write().await;
        state.check_available()?;
        if state.reject_deletes {
            return Err(StoreError::Rejected {
                code: 500,
                message: "deletes are being rejected".into(),
            });
        }
        let key = key_of(resource, namespace, name);
        let Some(current) = state.objects.get(&key).cloned() else {
            return Ok(DeleteOutcome::NotFound);
        };
        if let Some(rv) = expected_version {
            if current.metadata.resource_version.as_deref() != Some(rv) {
                return Ok(DeleteOutcome::Conflict);
            }
        }
        let has_finalizers = current
            .metadata
            .finalizers
            .as_ref()
            .map(|f| !f.is_empty())
            .unwrap_or(false);
        if has_finalizers {
            let rv = state.next_revision();
            if let Some(obj) = state.objects.get_mut(&key) {
                if obj.metadata.deletion_timestamp.is_none() {
                    obj.metadata.deletion_timestamp = Some(Time(Utc::now()));
                }
                obj.metadata.resource_version = Some(rv);
            }
        } else {
            state.objects.remove(&key);
        }
        Ok(DeleteOutcome::Deleted)
    }
}
