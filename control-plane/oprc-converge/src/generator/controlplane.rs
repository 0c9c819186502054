use k8s_openapi::ByteString;
use k8s_openapi::api::admissionregistration::v1::{
    RuleWithOperations, ServiceReference, ValidatingWebhook,
    ValidatingWebhookConfiguration, WebhookClientConfig,
};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PodSpec, PodTemplateSpec,
    SecretVolumeSource, Service, ServiceAccount, ServicePort, ServiceSpec,
    Volume, VolumeMount,
};
use k8s_openapi::api::rbac::v1::{
    PolicyRule, Role, RoleBinding, RoleRef, Subject,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    LabelSelector, ObjectMeta,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use super::{
    Desired, ROLE_CONTROLLER, ROLE_WEBHOOK, TLS_MOUNT_PATH, child_meta,
    child_name, selector_labels, validate_dns_subject, validate_image,
    validate_port,
};
use crate::crd::ControlPlaneSpec;
use crate::error::{ConvergeError, invalid_spec};
use crate::labels::COMPONENT;
use crate::owner::OwnerIdentity;
use crate::registry::TypeRegistry;

pub const DEFAULT_WEBHOOK_PORT: i32 = 8443;
const FAILURE_POLICIES: [&str; 2] = ["Fail", "Ignore"];

pub fn validate(spec: &ControlPlaneSpec) -> Result<(), ConvergeError> {
    validate_image(&spec.image)?;
    if spec.replicas.is_some_and(|r| r < 0) {
        return Err(invalid_spec("replicas must not be negative"));
    }
    if spec.data_plane.as_deref() == Some("") {
        return Err(invalid_spec("dataPlane must not be empty when set"));
    }
    if let Some(w) = &spec.webhook {
        if let Some(p) = w.port {
            validate_port("webhook port", p)?;
        }
        if let Some(fp) = &w.failure_policy {
            if !FAILURE_POLICIES.contains(&fp.as_str()) {
                return Err(invalid_spec(format!(
                    "unsupported failurePolicy {fp}"
                )));
            }
        }
    }
    Ok(())
}

pub fn webhook_enabled(spec: &ControlPlaneSpec) -> bool {
    spec.webhook.is_some()
}

pub fn certificate_subject(
    owner: &OwnerIdentity,
) -> Result<String, ConvergeError> {
    let subject = format!(
        "{}.{}.svc",
        child_name(owner, ROLE_WEBHOOK, true),
        owner.namespace
    );
    validate_dns_subject(&subject)?;
    Ok(subject)
}

pub fn service_account(
    owner: &OwnerIdentity,
    registry: &TypeRegistry,
) -> Result<Desired<ServiceAccount>, ConvergeError> {
    Ok(Desired::new(
        ROLE_CONTROLLER,
        ServiceAccount {
            metadata: child_meta(owner, registry, ROLE_CONTROLLER, true)?,
            ..Default::default()
        },
    ))
}

fn rule(group: &str, resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![group.to_string()]),
        resources: Some(resources.iter().map(|s| s.to_string()).collect()),
        verbs: verbs.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

pub fn role(
    owner: &OwnerIdentity,
    registry: &TypeRegistry,
) -> Result<Desired<Role>, ConvergeError> {
    let read = ["get", "list", "watch"];
    Ok(Desired::new(
        ROLE_CONTROLLER,
        Role {
            metadata: child_meta(owner, registry, ROLE_CONTROLLER, true)?,
            rules: Some(vec![
                rule("", &["configmaps", "secrets", "services"], &read),
                rule("discovery.k8s.io", &["endpointslices"], &read),
                rule("oaas.io", &["dataplanes"], &read),
                rule("oaas.io", &["dataplanes/status"], &["get", "patch"]),
            ]),
        },
    ))
}

pub fn role_binding(
    owner: &OwnerIdentity,
    registry: &TypeRegistry,
) -> Result<Desired<RoleBinding>, ConvergeError> {
    let name = child_name(owner, ROLE_CONTROLLER, true);
    Ok(Desired::new(
        ROLE_CONTROLLER,
        RoleBinding {
            metadata: child_meta(owner, registry, ROLE_CONTROLLER, true)?,
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".into(),
                kind: "Role".into(),
                name: name.clone(),
            },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".into(),
                name,
                namespace: Some(owner.namespace.clone()),
                ..Default::default()
            }]),
        },
    ))
}

pub fn webhook_service(
    owner: &OwnerIdentity,
    spec: &ControlPlaneSpec,
    registry: &TypeRegistry,
) -> Result<Desired<Service>, ConvergeError> {
    let port = spec
        .webhook
        .as_ref()
        .and_then(|w| w.port)
        .unwrap_or(DEFAULT_WEBHOOK_PORT);
    Ok(Desired::new(
        ROLE_WEBHOOK,
        Service {
            metadata: child_meta(owner, registry, ROLE_WEBHOOK, true)?,
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".into()),
                selector: Some(selector_labels(&child_name(
                    owner,
                    ROLE_CONTROLLER,
                    true,
                ))),
                ports: Some(vec![ServicePort {
                    name: Some("https".into()),
                    port: 443,
                    target_port: Some(IntOrString::Int(port)),
                    protocol: Some("TCP".into()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        },
    ))
}

pub fn deployment(
    owner: &OwnerIdentity,
    spec: &ControlPlaneSpec,
    registry: &TypeRegistry,
) -> Result<Desired<Deployment>, ConvergeError> {
    let metadata = child_meta(owner, registry, ROLE_CONTROLLER, true)?;
    let name = child_name(owner, ROLE_CONTROLLER, true);

    let mut env: Vec<EnvVar> = spec
        .env
        .iter()
        .map(|(k, v)| EnvVar {
            name: k.clone(),
            value: Some(v.clone()),
            ..Default::default()
        })
        .collect();
    let mut push_env = |k: &str, v: String| {
        env.push(EnvVar {
            name: k.into(),
            value: Some(v),
            ..Default::default()
        })
    };
    push_env("OAAS_NAMESPACE", owner.namespace.clone());
    if let Some(dp) = &spec.data_plane {
        push_env("OAAS_DATA_PLANE", dp.clone());
    }

    let mut ports = vec![];
    let mut volumes = vec![];
    let mut mounts = vec![];
    if let Some(w) = &spec.webhook {
        let port = w.port.unwrap_or(DEFAULT_WEBHOOK_PORT);
        push_env("OAAS_WEBHOOK_PORT", port.to_string());
        push_env("OAAS_TLS_DIR", TLS_MOUNT_PATH.into());
        ports.push(ContainerPort {
            name: Some("webhook".into()),
            container_port: port,
            protocol: Some("TCP".into()),
            ..Default::default()
        });
        volumes.push(Volume {
            name: "webhook-tls".into(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(child_name(owner, ROLE_WEBHOOK, true)),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: "webhook-tls".into(),
            mount_path: TLS_MOUNT_PATH.into(),
            read_only: Some(true),
            ..Default::default()
        });
    }
    env.sort_by(|a, b| a.name.cmp(&b.name));

    let mut pod_labels = selector_labels(&name);
    pod_labels.insert(COMPONENT.to_string(), ROLE_CONTROLLER.to_string());

    Ok(Desired::new(
        ROLE_CONTROLLER,
        Deployment {
            metadata,
            spec: Some(DeploymentSpec {
                replicas: Some(spec.replicas.unwrap_or(1)),
                selector: LabelSelector {
                    match_labels: Some(selector_labels(&name)),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(pod_labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        service_account_name: Some(name.clone()),
                        containers: vec![Container {
                            name: "controller".into(),
                            image: Some(spec.image.clone()),
                            env: Some(env),
                            ports: (!ports.is_empty()).then_some(ports),
                            volume_mounts: (!mounts.is_empty())
                                .then_some(mounts),
                            ..Default::default()
                        }],
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

/// Cluster-scoped admission config; trusts the engine CA.
pub fn webhook_configuration(
    owner: &OwnerIdentity,
    spec: &ControlPlaneSpec,
    registry: &TypeRegistry,
    ca_bundle_pem: &str,
) -> Result<Desired<ValidatingWebhookConfiguration>, ConvergeError> {
    let failure_policy = spec
        .webhook
        .as_ref()
        .and_then(|w| w.failure_policy.clone())
        .unwrap_or_else(|| "Fail".into());
    let webhook = ValidatingWebhook {
        name: format!("{}.{}.validate.oaas.io", owner.name, owner.namespace),
        client_config: WebhookClientConfig {
            ca_bundle: Some(ByteString(ca_bundle_pem.as_bytes().to_vec())),
            service: Some(ServiceReference {
                name: child_name(owner, ROLE_WEBHOOK, true),
                namespace: owner.namespace.clone(),
                path: Some("/validate".into()),
                port: Some(443),
            }),
            url: None,
        },
        rules: Some(vec![RuleWithOperations {
            api_groups: Some(vec!["oaas.io".into()]),
            api_versions: Some(vec!["v1alpha1".into()]),
            operations: Some(vec!["CREATE".into(), "UPDATE".into()]),
            resources: Some(vec!["dataplanes".into()]),
            scope: Some("Namespaced".into()),
        }]),
        failure_policy: Some(failure_policy),
        side_effects: "None".into(),
        admission_review_versions: vec!["v1".into()],
        namespace_selector: Some(LabelSelector {
            match_labels: Some(
                [(
                    "kubernetes.io/metadata.name".to_string(),
                    owner.namespace.clone(),
                )]
                .into(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    };
    Ok(Desired::new(
        ROLE_WEBHOOK,
        ValidatingWebhookConfiguration {
            metadata: child_meta(owner, registry, ROLE_WEBHOOK, false)?,
            webhooks: Some(vec![webhook]),
        },
    ))
}
