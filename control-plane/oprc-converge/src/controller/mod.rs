//! Per-owner reconcile sequencing.
//!
//! Each owner kind runs its child steps in dependency order. A step that
//! mutates anything ends the pass; the next delivery picks up from the
//! start and finds that step converged.

pub mod controlplane;
pub mod dataplane;
pub mod gateway;

use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use tracing::debug;

use crate::conditions::{new_condition, remove_condition, set_condition};
use crate::config::EngineConfig;
use crate::crd::Condition;
use crate::ensure::EnsureResult;
use crate::error::ConvergeError;
use crate::labels::{WAIT_FOR_OWNER_FINALIZER, has_finalizer};
use crate::lister::list_all_children;
use crate::owner::OwnerIdentity;
use crate::reduce::PreDeleteHook;
use crate::reduce::hooks::release_finalizer;
use crate::registry::TypeRegistry;
use crate::store::ObjectStore;

#[derive(Clone)]
pub struct ConvergeContext {
    pub store: Arc<dyn ObjectStore>,
    pub registry: Arc<TypeRegistry>,
    pub cfg: EngineConfig,
    pub hook: Arc<dyn PreDeleteHook>,
}

/// How far one owner pass got.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PassResult {
    /// A child was mutated and the pass stopped there.
    Mutated {
        kind: String,
        role: &'static str,
        result: EnsureResult,
    },
    /// Every step was a no-op.
    Converged,
}

/// Conditions being rewritten by a pass, stamped with its generation.
pub(crate) struct Tracker<'a> {
    list: &'a mut Vec<Condition>,
    generation: i64,
}

impl<'a> Tracker<'a> {
    pub(crate) fn new(list: &'a mut Vec<Condition>, generation: i64) -> Self {
        Self { list, generation }
    }

    pub(crate) fn set(
        &mut self,
        type_: &str,
        ok: bool,
        reason: &str,
        message: &str,
    ) {
        set_condition(
            self.list,
            new_condition(type_, ok, reason, message, self.generation),
        );
    }

    pub(crate) fn clear(&mut self, type_: &str) {
        remove_condition(self.list, type_);
    }

    /// Record a mutating step under `type_` and end the pass.
    pub(crate) fn progressing(
        &mut self,
        type_: &str,
        kind: &str,
        role: &'static str,
        result: EnsureResult,
    ) -> PassResult {
        let message = format!("{kind} {role} {}", result.as_str());
        self.set(type_, false, "Progressing", &message);
        mutated(kind, role, result)
    }
}

/// End the pass after a step that has no condition of its own.
pub(crate) fn mutated(
    kind: &str,
    role: &'static str,
    result: EnsureResult,
) -> PassResult {
    PassResult::Mutated {
        kind: kind.to_string(),
        role,
        result,
    }
}

/// Whether a converged deployment has `wanted` replicas available, with
/// a short message for the condition.
pub(crate) fn workload_available(
    deployment: &Deployment,
    wanted: i32,
) -> (bool, String) {
    let available = deployment
        .status
        .as_ref()
        .and_then(|s| s.available_replicas)
        .unwrap_or(0);
    (available >= wanted, format!("{available}/{wanted} available"))
}

pub(crate) fn ready_replicas(deployment: &Deployment) -> Option<i32> {
    deployment.status.as_ref().and_then(|s| s.ready_replicas)
}

/// Strip the wait-for-owner finalizer from every child of a deleting
/// owner. Returns how many children were released.
pub async fn release_children(
    ctx: &ConvergeContext,
    owner: &OwnerIdentity,
) -> Result<usize, ConvergeError> {
    let mut released = 0;
    for ty in ctx.registry.types() {
        for child in list_all_children(ctx, owner, ty).await? {
            if !has_finalizer(&child.object.metadata, WAIT_FOR_OWNER_FINALIZER)
            {
                continue;
            }
            let name = child.name().to_string();
            release_finalizer(ctx.store.as_ref(), &ty.resource, child.object)
                .await?;
            debug!(kind = %ty.resource.kind, %name, "released child");
            released += 1;
        }
    }
    Ok(released)
}
