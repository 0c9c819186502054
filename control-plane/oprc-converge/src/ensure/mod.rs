//! Convergence applier ("ensure").
//!
//! `ensure` drives one (owner, role) child towards its desired object with
//! at most one mutation: reduce duplicates, or create the missing child,
//! or patch the single survivor. Callers stop their pass on any result
//! other than [`EnsureResult::Noop`].

pub mod kinds;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;
use kube::core::{DynamicObject, TypeMeta};
use kube::discovery::ApiResource;
use tracing::{debug, info};

use crate::controller::ConvergeContext;
use crate::error::ConvergeError;
use crate::generator::Desired;
use crate::labels::LEGACY_OWNER;
use crate::lister::list_children;
use crate::owner::OwnerIdentity;
use crate::reduce;
use crate::store::WriteOutcome;

pub use kinds::ManagedKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnsureResult {
    Created,
    Updated,
    Deleted,
    Noop,
}

impl EnsureResult {
    /// Whether the pass must stop here.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, EnsureResult::Noop)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EnsureResult::Created => "created",
            EnsureResult::Updated => "updated",
            EnsureResult::Deleted => "deleted",
            EnsureResult::Noop => "noop",
        }
    }
}

pub fn to_dynamic<K: ManagedKind>(
    resource: &ApiResource,
    obj: &K,
) -> Result<DynamicObject, ConvergeError> {
    let mut dynamic: DynamicObject =
        serde_json::from_value(serde_json::to_value(obj)?)?;
    if dynamic.types.is_none() {
        dynamic.types = Some(TypeMeta {
            api_version: resource.api_version.clone(),
            kind: resource.kind.clone(),
        });
    }
    Ok(dynamic)
}

/// List items may come back without type information.
pub fn from_dynamic<K: ManagedKind>(
    resource: &ApiResource,
    mut obj: DynamicObject,
) -> Result<K, ConvergeError> {
    obj.types = Some(TypeMeta {
        api_version: resource.api_version.clone(),
        kind: resource.kind.clone(),
    });
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

/// Desired labels and finalizers present, desired owner references
/// present, no legacy label left.
pub fn metadata_differs(live: &ObjectMeta, desired: &ObjectMeta) -> bool {
    let live_labels = live.labels.clone().unwrap_or_default();
    let labels_missing = desired
        .labels
        .iter()
        .flatten()
        .any(|(k, v)| live_labels.get(k) != Some(v));
    let legacy = live_labels.contains_key(LEGACY_OWNER);
    let refs_missing = desired.owner_references.iter().flatten().any(|d| {
        !live
            .owner_references
            .iter()
            .flatten()
            .any(|l| l.uid == d.uid && l.controller == d.controller)
    });
    let finalizers_missing = desired
        .finalizers
        .iter()
        .flatten()
        .any(|f| !live.finalizers.iter().flatten().any(|x| x == f));
    labels_missing || legacy || refs_missing || finalizers_missing
}

pub fn merge_metadata(live: &mut ObjectMeta, desired: &ObjectMeta) {
    let labels = live.labels.get_or_insert_with(Default::default);
    labels.remove(LEGACY_OWNER);
    for (k, v) in desired.labels.iter().flatten() {
        labels.insert(k.clone(), v.clone());
    }
    for d in desired.owner_references.iter().flatten() {
        let refs = live.owner_references.get_or_insert_with(Vec::new);
        refs.retain(|r| r.uid != d.uid);
        refs.push(d.clone());
    }
    for f in desired.finalizers.iter().flatten() {
        let fins = live.finalizers.get_or_insert_with(Vec::new);
        if !fins.contains(f) {
            fins.push(f.clone());
        }
    }
}

async fn create<K: ManagedKind>(
    ctx: &ConvergeContext,
    resource: &ApiResource,
    desired: &K,
) -> Result<(EnsureResult, Option<K>), ConvergeError> {
    let obj = to_dynamic(resource, desired)?;
    let name = obj.metadata.name.clone().unwrap_or_default();
    match ctx.store.create(resource, &obj).await? {
        WriteOutcome::Applied(created) => {
            info!(kind = %resource.kind, %name, "created child");
            Ok((EnsureResult::Created, Some(from_dynamic(resource, created)?)))
        }
        WriteOutcome::Conflict => {
            Err(ConvergeError::conflict(resource.kind.clone(), name))
        }
    }
}

/// Converge one (owner, role) child. Returns the surviving object when no
/// delete happened.
pub async fn ensure<K: ManagedKind>(
    ctx: &ConvergeContext,
    owner: &OwnerIdentity,
    desired: &Desired<K>,
) -> Result<(EnsureResult, Option<K>), ConvergeError> {
    let ty = ctx.registry.of::<K>()?;
    let resource = &ty.resource;
    let mut children = list_children(ctx, owner, ty, desired.role).await?;

    let mut failures = vec![];
    let survivor = match children.len() {
        0 => return create(ctx, resource, &desired.object).await,
        1 => children.remove(0),
        n => {
            debug!(
                kind = %resource.kind,
                role = desired.role,
                count = n,
                "reducing duplicates"
            );
            let Some(res) = reduce::resolve(ctx, K::FITNESS, children).await?
            else {
                return create(ctx, resource, &desired.object).await;
            };
            let reduced = reduce::apply(ctx, resource, res.losers).await?;
            if reduced.deleted > 0 {
                return Ok((EnsureResult::Deleted, None));
            }
            failures = reduced.failures;
            res.survivor
        }
    };

    let live: K = from_dynamic(resource, survivor.object)?;
    let needs_write = metadata_differs(live.meta(), desired.object.meta())
        || K::spec_differs(&live, &desired.object);
    if !needs_write {
        // Survivor is converged; a stuck duplicate still needs a retry.
        if let Some(e) = failures.into_iter().next() {
            return Err(e);
        }
        return Ok((EnsureResult::Noop, Some(live)));
    }

    let mut merged = live.clone();
    merge_metadata(merged.meta_mut(), desired.object.meta());
    K::apply_desired(&mut merged, &desired.object);
    let obj = to_dynamic(resource, &merged)?;
    let name = obj.metadata.name.clone().unwrap_or_default();
    match ctx.store.patch(resource, &obj).await? {
        WriteOutcome::Applied(updated) => {
            info!(
                kind = %resource.kind,
                %name,
                legacy = survivor.legacy,
                "updated child"
            );
            Ok((EnsureResult::Updated, Some(from_dynamic(resource, updated)?)))
        }
        WriteOutcome::Conflict => {
            Err(ConvergeError::conflict(resource.kind.clone(), name))
        }
    }
}

/// Remove every child of (owner, role), e.g. an autoscaler after
/// autoscaling was switched off.
pub async fn ensure_absent<K: ManagedKind>(
    ctx: &ConvergeContext,
    owner: &OwnerIdentity,
    role: &str,
) -> Result<EnsureResult, ConvergeError> {
    let ty = ctx.registry.of::<K>()?;
    let children = list_children(ctx, owner, ty, role).await?;
    if children.is_empty() {
        return Ok(EnsureResult::Noop);
    }
    for child in children {
        let name = child.name().to_string();
        reduce::delete_child(ctx, &ty.resource, child.object).await?;
        info!(kind = %ty.resource.kind, %name, "removed stale child");
    }
    Ok(EnsureResult::Deleted)
}
