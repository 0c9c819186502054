use k8s_openapi::api::admissionregistration::v1::ValidatingWebhookConfiguration;
use k8s_openapi::api::core::v1::{Secret, Service};
use tracing::{debug, instrument};

use super::{
    ConvergeContext, PassResult, Tracker, mutated, workload_available,
};
use crate::certificate::{ensure_certificate, load_ca};
use crate::conditions::{
    CERTIFICATE_PROVISIONED, DATA_PLANE_RESOLVED, RBAC_PROVISIONED,
    SERVICE_READY, WEBHOOK_CONFIGURED, WORKLOAD_AVAILABLE,
};
use crate::crd::{ControlPlaneSpec, ControlPlaneStatus, DataPlane};
use crate::ensure::{EnsureResult, ensure, ensure_absent};
use crate::error::ConvergeError;
use crate::generator::{ROLE_CONTROLLER, ROLE_WEBHOOK, controlplane as render};
use crate::owner::OwnerIdentity;

async fn rbac(
    ctx: &ConvergeContext,
    owner: &OwnerIdentity,
) -> Result<Option<(&'static str, EnsureResult)>, ConvergeError> {
    let registry = ctx.registry.as_ref();
    let (res, _) =
        ensure(ctx, owner, &render::service_account(owner, registry)?).await?;
    if res.is_mutation() {
        return Ok(Some(("ServiceAccount", res)));
    }
    let (res, _) = ensure(ctx, owner, &render::role(owner, registry)?).await?;
    if res.is_mutation() {
        return Ok(Some(("Role", res)));
    }
    let (res, _) =
        ensure(ctx, owner, &render::role_binding(owner, registry)?).await?;
    if res.is_mutation() {
        return Ok(Some(("RoleBinding", res)));
    }
    Ok(None)
}

/// Look up the referenced data plane. Its absence is reported, not fatal.
async fn resolve_data_plane(
    ctx: &ConvergeContext,
    owner: &OwnerIdentity,
    name: &str,
) -> Result<bool, ConvergeError> {
    let ty = ctx.registry.of::<DataPlane>()?;
    Ok(ctx
        .store
        .get(&ty.resource, Some(&owner.namespace), name)
        .await?
        .is_some())
}

/// RBAC, webhook certificate and service, deployment, webhook
/// configuration
#[instrument(level = "debug", skip_all, fields(ns = %owner.namespace, name = %owner.name))]
pub async fn converge(
    ctx: &ConvergeContext,
    owner: &OwnerIdentity,
    spec: &ControlPlaneSpec,
    status: &mut ControlPlaneStatus,
) -> Result<PassResult, ConvergeError> {
    render::validate(spec)?;
    let registry = ctx.registry.as_ref();
    let webhook = render::webhook_enabled(spec);
    let mut conds = Tracker::new(&mut status.conditions, owner.generation);

    if let Some((kind, res)) = rbac(ctx, owner).await? {
        return Ok(conds.progressing(
            RBAC_PROVISIONED,
            kind,
            ROLE_CONTROLLER,
            res,
        ));
    }
    conds.set(RBAC_PROVISIONED, true, "Provisioned", "");

    match &spec.data_plane {
        Some(name) => {
            if resolve_data_plane(ctx, owner, name).await? {
                conds.set(DATA_PLANE_RESOLVED, true, "Found", name);
            } else {
                conds.set(
                    DATA_PLANE_RESOLVED,
                    false,
                    "NotFound",
                    &format!("DataPlane {name} not found"),
                );
            }
            status.data_plane = Some(name.clone());
        }
        None => {
            conds.clear(DATA_PLANE_RESOLVED);
            status.data_plane = None;
        }
    }

    if webhook {
        let subject = render::certificate_subject(owner)?;
        let (res, _) =
            ensure_certificate(ctx, owner, &subject, ROLE_WEBHOOK).await?;
        if res.is_mutation() {
            return Ok(conds.progressing(
                CERTIFICATE_PROVISIONED,
                "Secret",
                ROLE_WEBHOOK,
                res,
            ));
        }
        conds.set(CERTIFICATE_PROVISIONED, true, "Issued", &subject);

        let desired = render::webhook_service(owner, spec, registry)?;
        let (res, _) = ensure(ctx, owner, &desired).await?;
        if res.is_mutation() {
            return Ok(conds.progressing(
                SERVICE_READY,
                "Service",
                ROLE_WEBHOOK,
                res,
            ));
        }
        conds.set(SERVICE_READY, true, "Available", "");
    } else {
        conds.clear(CERTIFICATE_PROVISIONED);
        conds.clear(SERVICE_READY);
        conds.clear(WEBHOOK_CONFIGURED);
        let res = ensure_absent::<ValidatingWebhookConfiguration>(
            ctx,
            owner,
            ROLE_WEBHOOK,
        )
        .await?;
        if res.is_mutation() {
            return Ok(mutated(
                "ValidatingWebhookConfiguration",
                ROLE_WEBHOOK,
                res,
            ));
        }
        let res = ensure_absent::<Service>(ctx, owner, ROLE_WEBHOOK).await?;
        if res.is_mutation() {
            return Ok(mutated("Service", ROLE_WEBHOOK, res));
        }
        let res = ensure_absent::<Secret>(ctx, owner, ROLE_WEBHOOK).await?;
        if res.is_mutation() {
            return Ok(mutated("Secret", ROLE_WEBHOOK, res));
        }
    }

    let (res, deployment) =
        ensure(ctx, owner, &render::deployment(owner, spec, registry)?).await?;
    if res.is_mutation() {
        return Ok(conds.progressing(
            WORKLOAD_AVAILABLE,
            "Deployment",
            ROLE_CONTROLLER,
            res,
        ));
    }
    if let Some(d) = deployment {
        let (ok, message) =
            workload_available(&d, spec.replicas.unwrap_or(1));
        let reason = if ok {
            "MinimumReplicasAvailable"
        } else {
            "ReplicasUnavailable"
        };
        conds.set(WORKLOAD_AVAILABLE, ok, reason, &message);
    }

    if webhook {
        let ca = load_ca(ctx).await?;
        let desired =
            render::webhook_configuration(owner, spec, registry, ca.cert_pem())?;
        let (res, _) = ensure(ctx, owner, &desired).await?;
        if res.is_mutation() {
            return Ok(conds.progressing(
                WEBHOOK_CONFIGURED,
                "ValidatingWebhookConfiguration",
                ROLE_WEBHOOK,
                res,
            ));
        }
        conds.set(WEBHOOK_CONFIGURED, true, "Configured", "");
    }

    debug!("control plane converged");
    Ok(PassResult::Converged)
}
