use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;
use tracing::{debug, instrument};

use super::{ConvergeContext, PassResult, Tracker};
use crate::conditions::{
    CONTROL_PLANE_READY, DATA_PLANE_READY, READY, find, is_true,
};
use crate::crd::{Condition, GatewaySpec, GatewayStatus};
use crate::ensure::ensure;
use crate::error::ConvergeError;
use crate::generator::{ROLE_CONTROLPLANE, ROLE_DATAPLANE, gateway as render};
use crate::owner::OwnerIdentity;

/// A child owner counts as ready once it reports `Ready` for the
/// generation it is at.
fn child_ready(
    meta: &ObjectMeta,
    conditions: &[Condition],
    observed_generation: Option<i64>,
) -> (bool, String) {
    if observed_generation.is_none() || observed_generation != meta.generation
    {
        return (false, "not yet observed".into());
    }
    if is_true(conditions, READY) {
        return (true, String::new());
    }
    match find(conditions, READY) {
        Some(c) => (false, c.message.clone().unwrap_or_default()),
        None => (false, "no Ready condition".into()),
    }
}

/// Data plane first, then the control plane that points at it.
#[instrument(level = "debug", skip_all, fields(ns = %owner.namespace, name = %owner.name))]
pub async fn converge(
    ctx: &ConvergeContext,
    owner: &OwnerIdentity,
    spec: &GatewaySpec,
    status: &mut GatewayStatus,
) -> Result<PassResult, ConvergeError> {
    render::validate(spec)?;
    let registry = ctx.registry.as_ref();
    let mut conds = Tracker::new(&mut status.conditions, owner.generation);

    let (res, dp) =
        ensure(ctx, owner, &render::data_plane(owner, spec, registry)?).await?;
    if res.is_mutation() {
        return Ok(conds.progressing(
            DATA_PLANE_READY,
            "DataPlane",
            ROLE_DATAPLANE,
            res,
        ));
    }
    if let Some(dp) = dp {
        let st = dp.status.clone().unwrap_or_default();
        let (ok, message) =
            child_ready(dp.meta(), &st.conditions, st.observed_generation);
        let reason = if ok { "Ready" } else { "NotReady" };
        conds.set(DATA_PLANE_READY, ok, reason, &message);
        status.data_plane = dp.meta().name.clone();
        status.addresses = st.addresses;
    }

    let (res, cp) =
        ensure(ctx, owner, &render::control_plane(owner, spec, registry)?)
            .await?;
    if res.is_mutation() {
        return Ok(conds.progressing(
            CONTROL_PLANE_READY,
            "ControlPlane",
            ROLE_CONTROLPLANE,
            res,
        ));
    }
    if let Some(cp) = cp {
        let st = cp.status.clone().unwrap_or_default();
        let (ok, message) =
            child_ready(cp.meta(), &st.conditions, st.observed_generation);
        let reason = if ok { "Ready" } else { "NotReady" };
        conds.set(CONTROL_PLANE_READY, ok, reason, &message);
        status.control_plane = cp.meta().name.clone();
    }

    debug!("gateway converged");
    Ok(PassResult::Converged)
}
