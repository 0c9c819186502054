//! Duplicate resolution ("reduce").
//!
//! When more than one live child answers for the same (owner, role), one
//! survivor is picked deterministically and the rest are deleted:
//!
//! 1. children under the legacy label scheme lose to any current child;
//!    an all-legacy set keeps one,
//! 2. per-kind fitness (see [`fitness`]), higher wins,
//! 3. older creation time,
//! 4. name, then UID.
//!
//! The result does not depend on the order the store listed children in.

pub mod fitness;
pub mod hooks;

use kube::core::DynamicObject;
use kube::discovery::ApiResource;
use tracing::{info, warn};

use crate::controller::ConvergeContext;
use crate::error::ConvergeError;
use crate::lister::Child;
use crate::store::DeleteOutcome;

pub use fitness::{Fitness, FitnessClass};
pub use hooks::{NoopHook, PreDeleteHook, ReleaseFinalizer};

#[derive(Clone, Debug)]
pub struct Resolution {
    pub survivor: Child,
    pub losers: Vec<Child>,
}

/// Pure selection over measured children.
pub fn select(mut scored: Vec<(Child, Fitness)>) -> Option<Resolution> {
    let mut losers = vec![];
    if scored.iter().any(|(c, _)| !c.legacy) {
        let (legacy, current): (Vec<_>, Vec<_>) =
            scored.into_iter().partition(|(c, _)| c.legacy);
        losers.extend(legacy.into_iter().map(|(c, _)| c));
        scored = current;
    }
    scored.sort_by(|(_, a), (_, b)| fitness::compare(a, b));
    let mut iter = scored.into_iter().map(|(c, _)| c);
    let survivor = iter.next()?;
    losers.extend(iter);
    losers.sort_by(|a, b| a.name().cmp(b.name()));
    Some(Resolution { survivor, losers })
}

pub async fn resolve(
    ctx: &ConvergeContext,
    class: FitnessClass,
    children: Vec<Child>,
) -> Result<Option<Resolution>, ConvergeError> {
    let mut scored = Vec::with_capacity(children.len());
    for child in children {
        let fit = fitness::measure(ctx, class, &child.object).await?;
        scored.push((child, fit));
    }
    Ok(select(scored))
}

/// Outcome of deleting losers; failures other than conflicts are kept
/// so the survivor can still be converged.
#[derive(Debug, Default)]
pub struct Reduced {
    pub deleted: usize,
    pub failures: Vec<ConvergeError>,
}

/// Run the pre-delete hook then delete `obj` at its observed version.
/// An object that is already gone counts as deleted. Hook and delete
/// failures both surface as [`ConvergeError::DeleteFailed`]; conflicts
/// pass through.
pub async fn delete_child(
    ctx: &ConvergeContext,
    resource: &ApiResource,
    obj: DynamicObject,
) -> Result<(), ConvergeError> {
    let name = obj.metadata.name.clone().unwrap_or_default();
    let obj = match ctx
        .hook
        .before_delete(ctx.store.as_ref(), resource, obj)
        .await
    {
        Ok(Some(obj)) => obj,
        Ok(None) => return Ok(()),
        Err(
            e @ (ConvergeError::Conflict { .. } | ConvergeError::Cancelled),
        ) => return Err(e),
        Err(e) => {
            return Err(ConvergeError::DeleteFailed {
                kind: resource.kind.clone(),
                name,
                reason: format!("pre-delete hook: {e}"),
            });
        }
    };
    let outcome = ctx
        .store
        .delete(
            resource,
            obj.metadata.namespace.as_deref(),
            &name,
            obj.metadata.resource_version.as_deref(),
        )
        .await
        .map_err(|e| ConvergeError::DeleteFailed {
            kind: resource.kind.clone(),
            name: name.clone(),
            reason: e.to_string(),
        })?;
    match outcome {
        DeleteOutcome::Deleted | DeleteOutcome::NotFound => Ok(()),
        DeleteOutcome::Conflict => {
            Err(ConvergeError::conflict(resource.kind.clone(), name))
        }
    }
}

pub async fn apply(
    ctx: &ConvergeContext,
    resource: &ApiResource,
    losers: Vec<Child>,
) -> Result<Reduced, ConvergeError> {
    let mut out = Reduced::default();
    for loser in losers {
        let name = loser.name().to_string();
        match delete_child(ctx, resource, loser.object).await {
            Ok(()) => {
                info!(
                    kind = %resource.kind,
                    %name,
                    legacy = loser.legacy,
                    "removed duplicate child"
                );
                out.deleted += 1;
            }
            Err(e @ ConvergeError::DeleteFailed { .. }) => {
                warn!(
                    kind = %resource.kind,
                    %name,
                    error = %e,
                    "duplicate not removed"
                );
                out.failures.push(e);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn child(name: &str, uid: &str, secs: i64, legacy: bool) -> Child {
        let ar = ApiResource::erase::<Deployment>(&());
        let mut obj = DynamicObject::new(name, &ar).within("ns");
        obj.metadata.uid = Some(uid.into());
        obj.metadata.creation_timestamp =
            Some(Time(Utc.timestamp_opt(secs, 0).unwrap()));
        Child {
            object: obj,
            legacy,
        }
    }

    fn scored(children: Vec<Child>) -> Vec<(Child, Fitness)> {
        children
            .into_iter()
            .map(|c| {
                let f = Fitness::new(
                    &c.object,
                    fitness::workload_metrics(&c.object),
                );
                (c, f)
            })
            .collect()
    }

    #[test]
    fn single_child_survives() {
        let r = select(scored(vec![child("a", "1", 10, true)])).unwrap();
        assert_eq!(r.survivor.name(), "a");
        assert!(r.losers.is_empty());
        assert!(select(vec![]).is_none());
    }

    #[test]
    fn legacy_loses_to_current_even_when_older() {
        let r = select(scored(vec![
            child("old", "1", 10, true),
            child("new", "2", 50, false),
            child("older", "3", 5, true),
        ]))
        .unwrap();
        assert_eq!(r.survivor.name(), "new");
        let losers: Vec<_> = r.losers.iter().map(|c| c.name()).collect();
        assert_eq!(losers, ["old", "older"]);
    }

    #[test]
    fn all_legacy_keeps_oldest() {
        let r = select(scored(vec![
            child("b", "1", 20, true),
            child("a", "2", 10, true),
        ]))
        .unwrap();
        assert_eq!(r.survivor.name(), "a");
        assert_eq!(r.losers.len(), 1);
    }

    #[test]
    fn order_independent() {
        let base = vec![
            child("c", "3", 10, false),
            child("a", "1", 10, false),
            child("b", "2", 10, false),
            child("a", "0", 10, false),
        ];
        let mut picks = vec![];
        for rot in 0..base.len() {
            let mut v = base.clone();
            v.rotate_left(rot);
            v.swap(0, rot % 2);
            let r = select(scored(v)).unwrap();
            picks.push(r.survivor.object.metadata.uid.clone());
        }
        assert!(picks.iter().all(|p| p.as_deref() == Some("0")));
    }
}
