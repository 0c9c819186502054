use async_trait::async_trait;
use kube::core::DynamicObject;
use kube::discovery::ApiResource;
use tracing::debug;

use crate::error::ConvergeError;
use crate::labels::{WAIT_FOR_OWNER_FINALIZER, has_finalizer};
use crate::store::{ObjectStore, StoreError, WriteOutcome};

/// Runs before the engine deletes a child. Returns the object to delete
/// (with its new version), or `None` when it is already gone.
#[async_trait]
pub trait PreDeleteHook: Send + Sync {
    async fn before_delete(
        &self,
        store: &dyn ObjectStore,
        resource: &ApiResource,
        child: DynamicObject,
    ) -> Result<Option<DynamicObject>, ConvergeError>;
}

pub struct NoopHook;

#[async_trait]
impl PreDeleteHook for NoopHook {
    async fn before_delete(
        &self,
        _store: &dyn ObjectStore,
        _resource: &ApiResource,
        child: DynamicObject,
    ) -> Result<Option<DynamicObject>, ConvergeError> {
        Ok(Some(child))
    }
}

/// Strips the wait-for-owner finalizer so the delete is not held.
pub struct ReleaseFinalizer;

#[async_trait]
impl PreDeleteHook for ReleaseFinalizer {
    async fn before_delete(
        &self,
        store: &dyn ObjectStore,
        resource: &ApiResource,
        child: DynamicObject,
    ) -> Result<Option<DynamicObject>, ConvergeError> {
        release_finalizer(store, resource, child).await
    }
}

pub async fn release_finalizer(
    store: &dyn ObjectStore,
    resource: &ApiResource,
    child: DynamicObject,
) -> Result<Option<DynamicObject>, ConvergeError> {
    if !has_finalizer(&child.metadata, WAIT_FOR_OWNER_FINALIZER) {
        return Ok(Some(child));
    }
    let name = child.metadata.name.clone().unwrap_or_default();
    let mut patched = child;
    if let Some(f) = patched.metadata.finalizers.as_mut() {
        f.retain(|x| x != WAIT_FOR_OWNER_FINALIZER);
    }
    match store.patch(resource, &patched).await {
        Ok(WriteOutcome::Applied(obj)) => {
            debug!(kind = %resource.kind, %name, "released finalizer");
            let released = obj.metadata.deletion_timestamp.is_some()
                && obj
                    .metadata
                    .finalizers
                    .as_ref()
                    .map(|f| f.is_empty())
                    .unwrap_or(true);
            Ok((!released).then_some(obj))
        }
        Ok(WriteOutcome::Conflict) => {
            Err(ConvergeError::conflict(resource.kind.clone(), name))
        }
        Err(StoreError::Rejected { code: 404, .. }) => Ok(None),
        Err(e) => Err(e.into()),
    }
}
