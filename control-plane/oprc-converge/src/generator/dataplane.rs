use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::autoscaling::v2::{
    CrossVersionObjectReference, HorizontalPodAutoscaler,
    HorizontalPodAutoscalerSpec, MetricSpec, MetricTarget,
    ResourceMetricSource,
};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PodSpec, PodTemplateSpec,
    SecretVolumeSource, Service, ServicePort, ServiceSpec, Volume,
    VolumeMount,
};
use k8s_openapi::api::policy::v1::{
    PodDisruptionBudget, PodDisruptionBudgetSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    LabelSelector, ObjectMeta,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use super::{
    Desired, EXTENSIONS_ANNOTATION, ROLE_PROXY, ROLE_TLS, TLS_MOUNT_PATH,
    child_meta, child_name, selector_labels, validate_dns_subject,
    validate_image, validate_port,
};
use crate::crd::{DataPlaneSpec, ExtensionRef};
use crate::error::{ConvergeError, invalid_spec};
use crate::labels::COMPONENT;
use crate::owner::OwnerIdentity;
use crate::registry::TypeRegistry;

const SERVICE_TYPES: [&str; 3] = ["ClusterIP", "NodePort", "LoadBalancer"];
const DEFAULT_CPU_TARGET: i32 = 80;

pub fn validate(spec: &DataPlaneSpec) -> Result<(), ConvergeError> {
    validate_image(&spec.image)?;
    if spec.ports.is_empty() {
        return Err(invalid_spec("at least one port is required"));
    }
    let mut names = std::collections::BTreeSet::new();
    for p in &spec.ports {
        if p.name.is_empty() {
            return Err(invalid_spec("port name is required"));
        }
        if !names.insert(p.name.as_str()) {
            return Err(invalid_spec(format!("duplicate port {}", p.name)));
        }
        validate_port("port", p.port)?;
        if let Some(t) = p.target_port {
            validate_port("targetPort", t)?;
        }
    }
    if let Some(t) = &spec.service_type {
        if !SERVICE_TYPES.contains(&t.as_str()) {
            return Err(invalid_spec(format!("unsupported service type {t}")));
        }
    }
    if spec.replicas.is_some_and(|r| r < 0) {
        return Err(invalid_spec("replicas must not be negative"));
    }
    if let Some(a) = &spec.autoscaling {
        if a.max_replicas < 1 {
            return Err(invalid_spec("autoscaling maxReplicas must be >= 1"));
        }
        let min = a.min_replicas.unwrap_or(1);
        if min < 1 || min > a.max_replicas {
            return Err(invalid_spec(format!(
                "autoscaling minReplicas {min} exceeds maxReplicas {}",
                a.max_replicas
            )));
        }
        if a.target_cpu_utilization.is_some_and(|t| !(1..=100).contains(&t)) {
            return Err(invalid_spec("targetCpuUtilization must be 1-100"));
        }
    }
    if let Some(b) = &spec.disruption_budget {
        if b.min_available.is_some() == b.max_unavailable.is_some() {
            return Err(invalid_spec(
                "disruptionBudget needs exactly one of minAvailable or \
                 maxUnavailable",
            ));
        }
    }
    Ok(())
}

/// DNS name the proxy certificate is issued for.
pub fn certificate_subject(
    owner: &OwnerIdentity,
) -> Result<String, ConvergeError> {
    let subject = format!("{}.{}.svc", owner.name, owner.namespace);
    validate_dns_subject(&subject)?;
    Ok(subject)
}

pub fn tls_secret_name(owner: &OwnerIdentity) -> String {
    child_name(owner, ROLE_TLS, true)
}

pub fn service(
    owner: &OwnerIdentity,
    spec: &DataPlaneSpec,
    registry: &TypeRegistry,
) -> Result<Desired<Service>, ConvergeError> {
    let metadata = child_meta(owner, registry, ROLE_PROXY, true)?;
    let workload = child_name(owner, ROLE_PROXY, true);
    let ports = spec
        .ports
        .iter()
        .map(|p| ServicePort {
            name: Some(p.name.clone()),
            port: p.port,
            target_port: Some(IntOrString::Int(p.target_port.unwrap_or(p.port))),
            protocol: Some("TCP".into()),
            ..Default::default()
        })
        .collect();
    Ok(Desired::new(
        ROLE_PROXY,
        Service {
            metadata,
            spec: Some(ServiceSpec {
                type_: Some(
                    spec.service_type
                        .clone()
                        .unwrap_or_else(|| "ClusterIP".into()),
                ),
                selector: Some(selector_labels(&workload)),
                ports: Some(ports),
                ..Default::default()
            }),
            ..Default::default()
        },
    ))
}

fn extensions_annotation(exts: &[ExtensionRef]) -> Option<String> {
    if exts.is_empty() {
        return None;
    }
    let mut keys: Vec<String> = exts.iter().map(ExtensionRef::key).collect();
    keys.sort();
    keys.dedup();
    Some(keys.join(","))
}

fn pod_labels(name: &str, role: &str) -> BTreeMap<String, String> {
    let mut labels = selector_labels(name);
    labels.insert(COMPONENT.to_string(), role.to_string());
    labels
}

pub fn deployment(
    owner: &OwnerIdentity,
    spec: &DataPlaneSpec,
    registry: &TypeRegistry,
) -> Result<Desired<Deployment>, ConvergeError> {
    let metadata = child_meta(owner, registry, ROLE_PROXY, true)?;
    let name = child_name(owner, ROLE_PROXY, true);

    let mut env: Vec<EnvVar> = spec
        .env
        .iter()
        .map(|(k, v)| EnvVar {
            name: k.clone(),
            value: Some(v.clone()),
            ..Default::default()
        })
        .collect();
    let mut volumes = vec![];
    let mut mounts = vec![];
    if spec.tls {
        let secret = tls_secret_name(owner);
        env.push(EnvVar {
            name: "OAAS_TLS_DIR".into(),
            value: Some(TLS_MOUNT_PATH.into()),
            ..Default::default()
        });
        volumes.push(Volume {
            name: "tls".into(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: "tls".into(),
            mount_path: TLS_MOUNT_PATH.into(),
            read_only: Some(true),
            ..Default::default()
        });
    }
    env.sort_by(|a, b| a.name.cmp(&b.name));

    let container = Container {
        name: "proxy".into(),
        image: Some(spec.image.clone()),
        ports: Some(
            spec.ports
                .iter()
                .map(|p| ContainerPort {
                    name: Some(p.name.clone()),
                    container_port: p.target_port.unwrap_or(p.port),
                    protocol: Some("TCP".into()),
                    ..Default::default()
                })
                .collect(),
        ),
        env: (!env.is_empty()).then_some(env),
        volume_mounts: (!mounts.is_empty()).then_some(mounts),
        ..Default::default()
    };

    let annotations = extensions_annotation(&spec.extensions)
        .map(|v| BTreeMap::from([(EXTENSIONS_ANNOTATION.to_string(), v)]));

    // The autoscaler owns the replica count when present.
    let replicas = match spec.autoscaling {
        Some(_) => None,
        None => Some(spec.replicas.unwrap_or(1)),
    };

    Ok(Desired::new(
        ROLE_PROXY,
        Deployment {
            metadata,
            spec: Some(DeploymentSpec {
                replicas,
                selector: LabelSelector {
                    match_labels: Some(selector_labels(&name)),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(pod_labels(&name, ROLE_PROXY)),
                        annotations,
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        volumes: (!volumes.is_empty()).then_some(volumes),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        },
    ))
}

pub fn autoscaler(
    owner: &OwnerIdentity,
    spec: &DataPlaneSpec,
    registry: &TypeRegistry,
) -> Result<Option<Desired<HorizontalPodAutoscaler>>, ConvergeError> {
    let Some(a) = &spec.autoscaling else {
        return Ok(None);
    };
    let metadata = child_meta(owner, registry, ROLE_PROXY, true)?;
    let target = a.target_cpu_utilization.unwrap_or(DEFAULT_CPU_TARGET);
    Ok(Some(Desired::new(
        ROLE_PROXY,
        HorizontalPodAutoscaler {
            metadata,
            spec: Some(HorizontalPodAutoscalerSpec {
                scale_target_ref: CrossVersionObjectReference {
                    api_version: Some("apps/v1".into()),
                    kind: "Deployment".into(),
                    name: child_name(owner, ROLE_PROXY, true),
                },
                min_replicas: Some(a.min_replicas.unwrap_or(1)),
                max_replicas: a.max_replicas,
                metrics: Some(vec![MetricSpec {
                    type_: "Resource".into(),
                    resource: Some(ResourceMetricSource {
                        name: "cpu".into(),
                        target: MetricTarget {
                            type_: "Utilization".into(),
                            average_utilization: Some(target),
                            ..Default::default()
                        },
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        },
    )))
}

pub fn disruption_budget(
    owner: &OwnerIdentity,
    spec: &DataPlaneSpec,
    registry: &TypeRegistry,
) -> Result<Option<Desired<PodDisruptionBudget>>, ConvergeError> {
    let Some(b) = &spec.disruption_budget else {
        return Ok(None);
    };
    let metadata = child_meta(owner, registry, ROLE_PROXY, true)?;
    Ok(Some(Desired::new(
        ROLE_PROXY,
        PodDisruptionBudget {
            metadata,
            spec: Some(PodDisruptionBudgetSpec {
                min_available: b.min_available.map(IntOrString::Int),
                max_unavailable: b.max_unavailable.map(IntOrString::Int),
                selector: Some(LabelSelector {
                    match_labels: Some(selector_labels(&child_name(
                        owner, ROLE_PROXY, true,
                    ))),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
    )))
}
