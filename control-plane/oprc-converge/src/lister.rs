use std::collections::BTreeSet;

use kube::core::DynamicObject;
use tracing::debug;

use crate::controller::ConvergeContext;
use crate::error::ConvergeError;
use crate::labels::{
    current_selector, is_legacy, legacy_owner_selector, legacy_selector,
    owned_by, owner_selector,
};
use crate::owner::OwnerIdentity;
use crate::registry::RegisteredType;
use crate::store::Selector;

/// A live child together with the label scheme it was found under.
#[derive(Clone, Debug)]
pub struct Child {
    pub object: DynamicObject,
    pub legacy: bool,
}

impl Child {
    pub fn name(&self) -> &str {
        self.object.metadata.name.as_deref().unwrap_or_default()
    }
}

/// Children of `owner` in `role`, under the current labels and (when
/// enabled) the legacy ones. Terminating objects are skipped.
pub async fn list_children(
    ctx: &ConvergeContext,
    owner: &OwnerIdentity,
    ty: &RegisteredType,
    role: &str,
) -> Result<Vec<Child>, ConvergeError> {
    let mut selectors = vec![current_selector(owner, role)];
    if ctx.cfg.legacy_labels() {
        selectors.push(legacy_selector(owner, role));
    }
    let children = collect(ctx, owner, ty, &selectors).await?;
    Ok(children
        .into_iter()
        .filter(|c| c.object.metadata.deletion_timestamp.is_none())
        .collect())
}

/// Every child of `owner` of this type, any role, terminating included.
pub async fn list_all_children(
    ctx: &ConvergeContext,
    owner: &OwnerIdentity,
    ty: &RegisteredType,
) -> Result<Vec<Child>, ConvergeError> {
    let mut selectors = vec![owner_selector(owner)];
    if ctx.cfg.legacy_labels() {
        selectors.push(legacy_owner_selector(owner));
    }
    collect(ctx, owner, ty, &selectors).await
}

async fn collect(
    ctx: &ConvergeContext,
    owner: &OwnerIdentity,
    ty: &RegisteredType,
    selectors: &[Selector],
) -> Result<Vec<Child>, ConvergeError> {
    let namespace = ty.namespaced.then_some(owner.namespace.as_str());
    let mut seen = BTreeSet::new();
    let mut out = vec![];
    for selector in selectors {
        let items = ctx.store.list(&ty.resource, namespace, selector).await?;
        for obj in items {
            let id = obj
                .metadata
                .uid
                .clone()
                .or_else(|| obj.metadata.name.clone())
                .unwrap_or_default();
            if !seen.insert(id) {
                continue;
            }
            if !owned_by(&obj.metadata, &owner.uid) {
                debug!(
                    kind = %ty.resource.kind,
                    name = ?obj.metadata.name,
                    %selector,
                    "skipping child with foreign owner"
                );
                continue;
            }
            out.push(Child {
                legacy: is_legacy(&obj.metadata),
                object: obj,
            });
        }
    }
    Ok(out)
}
