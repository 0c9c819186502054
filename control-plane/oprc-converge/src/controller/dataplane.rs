use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use tracing::{debug, instrument};

use super::{
    ConvergeContext, PassResult, Tracker, mutated, ready_replicas,
    workload_available,
};
use crate::certificate::ensure_certificate;
use crate::conditions::{
    CERTIFICATE_PROVISIONED, SERVICE_READY, WORKLOAD_AVAILABLE,
};
use crate::crd::{DataPlaneSpec, DataPlaneStatus};
use crate::ensure::{ensure, ensure_absent};
use crate::error::ConvergeError;
use crate::generator::{ROLE_PROXY, ROLE_TLS, dataplane as render};
use crate::owner::OwnerIdentity;

fn load_balancer_addresses(svc: &Service) -> Vec<String> {
    svc.status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .into_iter()
        .flatten()
        .filter_map(|i| i.ip.clone().or_else(|| i.hostname.clone()))
        .collect()
}

fn is_load_balancer(svc: &Service) -> bool {
    svc.spec.as_ref().and_then(|s| s.type_.as_deref()) == Some("LoadBalancer")
}

/// Addresses clients reach the proxy on: load-balancer ingress when the
/// service has any, the in-cluster DNS name otherwise.
pub fn service_addresses(svc: &Service, cluster_domain: &str) -> Vec<String> {
    let lb = load_balancer_addresses(svc);
    if !lb.is_empty() {
        return lb;
    }
    match (&svc.metadata.name, &svc.metadata.namespace) {
        (Some(name), Some(ns)) => {
            vec![format!("{name}.{ns}.svc.{cluster_domain}")]
        }
        _ => vec![],
    }
}

fn wanted_replicas(spec: &DataPlaneSpec) -> i32 {
    match &spec.autoscaling {
        Some(a) => a.min_replicas.unwrap_or(1),
        None => spec.replicas.unwrap_or(1),
    }
}

/// certificate, service, deployment, autoscaler, disruption budget
#[instrument(level = "debug", skip_all, fields(ns = %owner.namespace, name = %owner.name))]
pub async fn converge(
    ctx: &ConvergeContext,
    owner: &OwnerIdentity,
    spec: &DataPlaneSpec,
    status: &mut DataPlaneStatus,
) -> Result<PassResult, ConvergeError> {
    render::validate(spec)?;
    let registry = ctx.registry.as_ref();
    let mut conds = Tracker::new(&mut status.conditions, owner.generation);

    if spec.tls {
        let subject = render::certificate_subject(owner)?;
        let (res, _) =
            ensure_certificate(ctx, owner, &subject, ROLE_TLS).await?;
        if res.is_mutation() {
            return Ok(conds.progressing(
                CERTIFICATE_PROVISIONED,
                "Secret",
                ROLE_TLS,
                res,
            ));
        }
        conds.set(CERTIFICATE_PROVISIONED, true, "Issued", &subject);
    } else {
        let res = ensure_absent::<Secret>(ctx, owner, ROLE_TLS).await?;
        conds.clear(CERTIFICATE_PROVISIONED);
        if res.is_mutation() {
            return Ok(mutated("Secret", ROLE_TLS, res));
        }
    }

    let (res, svc) = ensure(ctx, owner, &render::service(owner, spec, registry)?)
        .await?;
    if res.is_mutation() {
        return Ok(conds.progressing(SERVICE_READY, "Service", ROLE_PROXY, res));
    }
    if let Some(svc) = svc {
        let addresses = service_addresses(&svc, &ctx.cfg.cluster_domain);
        if is_load_balancer(&svc) && load_balancer_addresses(&svc).is_empty() {
            conds.set(
                SERVICE_READY,
                false,
                "PendingLoadBalancer",
                "waiting for load-balancer ingress",
            );
        } else {
            conds.set(SERVICE_READY, true, "Available", &addresses.join(","));
        }
        status.service = svc.metadata.name.clone();
        status.addresses = addresses;
    }

    let (res, deployment) =
        ensure(ctx, owner, &render::deployment(owner, spec, registry)?).await?;
    if res.is_mutation() {
        return Ok(conds.progressing(
            WORKLOAD_AVAILABLE,
            "Deployment",
            ROLE_PROXY,
            res,
        ));
    }
    if let Some(d) = deployment {
        let (ok, message) = workload_available(&d, wanted_replicas(spec));
        let reason = if ok {
            "MinimumReplicasAvailable"
        } else {
            "ReplicasUnavailable"
        };
        conds.set(WORKLOAD_AVAILABLE, ok, reason, &message);
        status.ready_replicas = ready_replicas(&d);
    }

    let res = match render::autoscaler(owner, spec, registry)? {
        Some(desired) => ensure(ctx, owner, &desired).await?.0,
        None => {
            ensure_absent::<HorizontalPodAutoscaler>(ctx, owner, ROLE_PROXY)
                .await?
        }
    };
    if res.is_mutation() {
        return Ok(mutated("HorizontalPodAutoscaler", ROLE_PROXY, res));
    }

    let res = match render::disruption_budget(owner, spec, registry)? {
        Some(desired) => ensure(ctx, owner, &desired).await?.0,
        None => {
            ensure_absent::<PodDisruptionBudget>(ctx, owner, ROLE_PROXY).await?
        }
    };
    if res.is_mutation() {
        return Ok(mutated("PodDisruptionBudget", ROLE_PROXY, res));
    }

    debug!("data plane converged");
    Ok(PassResult::Converged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{AutoscalingSpec, PortSpec};
    use k8s_openapi::api::core::v1::{
        LoadBalancerIngress, LoadBalancerStatus, ServiceSpec, ServiceStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn svc(lb: Option<&str>) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("edge-proxy".into()),
                namespace: Some("apps".into()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("LoadBalancer".into()),
                ..Default::default()
            }),
            status: lb.map(|ip| ServiceStatus {
                load_balancer: Some(LoadBalancerStatus {
                    ingress: Some(vec![LoadBalancerIngress {
                        ip: Some(ip.into()),
                        ..Default::default()
                    }]),
                }),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn addresses_prefer_ingress() {
        assert_eq!(
            service_addresses(&svc(Some("10.0.0.9")), "cluster.local"),
            vec!["10.0.0.9".to_string()]
        );
        assert_eq!(
            service_addresses(&svc(None), "cluster.local"),
            vec!["edge-proxy.apps.svc.cluster.local".to_string()]
        );
    }

    #[test]
    fn autoscaled_minimum_is_wanted() {
        let mut spec = DataPlaneSpec {
            image: "img".into(),
            replicas: Some(4),
            ports: vec![PortSpec {
                name: "http".into(),
                port: 80,
                target_port: None,
            }],
            ..Default::default()
        };
        assert_eq!(wanted_replicas(&spec), 4);
        spec.autoscaling = Some(AutoscalingSpec {
            min_replicas: Some(2),
            max_replicas: 6,
            target_cpu_utilization: None,
        });
        assert_eq!(wanted_replicas(&spec), 2);
    }
}
