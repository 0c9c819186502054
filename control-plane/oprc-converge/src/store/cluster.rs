use async_trait::async_trait;
use kube::api::{
    Api, DeleteParams, ListParams, Patch, PatchParams, PostParams,
    Preconditions,
};
use kube::core::DynamicObject;
use kube::discovery::ApiResource;
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{debug, trace};

use super::{
    DeleteOutcome, ObjectStore, Selector, StoreError, StoreResult,
    WriteOutcome,
};

/// [`ObjectStore`] backed by a live API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
    ) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => {
                Api::namespaced_with(self.client.clone(), ns, resource)
            }
            None => Api::all_with(self.client.clone(), resource),
        }
    }
}

fn is_code(e: &kube::Error, code: u16) -> bool {
    matches!(e, kube::Error::Api(resp) if resp.code == code)
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> StoreResult<Option<DynamicObject>> {
        trace!(kind = %resource.kind, ?namespace, %name, "store: get");
        Ok(self.api(resource, namespace).get_opt(name).await?)
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> StoreResult<Vec<DynamicObject>> {
        let lp = ListParams::default().labels(&selector.to_string());
        trace!(kind = %resource.kind, ?namespace, %selector, "store: list");
        let list = self.api(resource, namespace).list(&lp).await?;
        Ok(list.items)
    }

    async fn create(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
    ) -> StoreResult<WriteOutcome> {
        let namespace = obj.namespace();
        let api = self.api(resource, namespace.as_deref());
        match api.create(&PostParams::default(), obj).await {
            Ok(created) => Ok(WriteOutcome::Applied(created)),
            Err(e) if is_code(&e, 409) => {
                debug!(
                    kind = %resource.kind,
                    name = %obj.name_any(),
                    "store: create raced an existing object"
                );
                Ok(WriteOutcome::Conflict)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn patch(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
    ) -> StoreResult<WriteOutcome> {
        let name = obj.metadata.name.clone().ok_or_else(|| {
            StoreError::InvalidObject("patch target has no name".into())
        })?;
        if obj.metadata.resource_version.is_none() {
            return Err(StoreError::InvalidObject(format!(
                "{} {name} has no resourceVersion to guard the write",
                resource.kind
            )));
        }
        let namespace = obj.namespace();
        let api = self.api(resource, namespace.as_deref());
        // PUT with resourceVersion is rejected with 409 when stale.
        match api.replace(&name, &PostParams::default(), obj).await {
            Ok(updated) => Ok(WriteOutcome::Applied(updated)),
            Err(e) if is_code(&e, 409) => Ok(WriteOutcome::Conflict),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_status(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        expected_version: &str,
        status: &serde_json::Value,
    ) -> StoreResult<WriteOutcome> {
        let patch = json!({
            "metadata": { "resourceVersion": expected_version },
            "status": status,
        });
        let api = self.api(resource, namespace);
        match api
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(updated) => Ok(WriteOutcome::Applied(updated)),
            Err(e) if is_code(&e, 409) => Ok(WriteOutcome::Conflict),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        expected_version: Option<&str>,
    ) -> StoreResult<DeleteOutcome> {
        let dp = DeleteParams {
            preconditions: expected_version.map(|rv| Preconditions {
                resource_version: Some(rv.to_string()),
                uid: None,
            }),
            ..Default::default()
        };
        match self.api(resource, namespace).delete(name, &dp).await {
            Ok(_) => Ok(DeleteOutcome::Deleted),
            Err(e) if is_code(&e, 404) => Ok(DeleteOutcome::NotFound),
            Err(e) if is_code(&e, 409) => Ok(DeleteOutcome::Conflict),
            Err(e) => Err(e.into()),
        }
    }
}
