//! Per-kind "does the live object need a write" predicates.
//!
//! Each kind compares only the fields the generator sets, so values the
//! API server fills in (cluster IPs, allocated node ports, defaulted pod
//! fields, HPA behaviour) never trigger a patch.

use k8s_openapi::api::admissionregistration::v1::ValidatingWebhookConfiguration;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{
    PodSpec, PodTemplateSpec, Secret, Service, ServiceAccount,
};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::Resource;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::crd::{ControlPlane, DataPlane};
use crate::generator::EXTENSIONS_ANNOTATION;
use crate::reduce::FitnessClass;

pub trait ManagedKind:
    Resource<DynamicType = ()>
    + Clone
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    const FITNESS: FitnessClass = FitnessClass::Age;

    /// Whether generator-owned fields of `live` differ from `desired`.
    fn spec_differs(live: &Self, desired: &Self) -> bool;

    /// Copy generator-owned fields onto `live`, keeping server-assigned
    /// ones.
    fn apply_desired(live: &mut Self, desired: &Self);
}

fn to_json<T: Serialize>(v: &T) -> Value {
    serde_json::to_value(v).unwrap_or(Value::Null)
}

fn pod_projection(template: &PodTemplateSpec) -> Value {
    let labels = template
        .metadata
        .as_ref()
        .and_then(|m| m.labels.clone())
        .unwrap_or_default();
    let extensions = template
        .metadata
        .as_ref()
        .and_then(|m| m.annotations.as_ref())
        .and_then(|a| a.get(EXTENSIONS_ANNOTATION).cloned());
    let spec = template.spec.clone().unwrap_or_default();
    json!({
        "labels": labels,
        "extensions": extensions,
        "pod": pod_spec_projection(&spec),
    })
}

fn pod_spec_projection(spec: &PodSpec) -> Value {
    let containers: Vec<Value> = spec
        .containers
        .iter()
        .map(|c| {
            let ports: Vec<Value> = c
                .ports
                .iter()
                .flatten()
                .map(|p| json!([p.name, p.container_port]))
                .collect();
            let env: Vec<Value> = c
                .env
                .iter()
                .flatten()
                .map(|e| json!([e.name, e.value]))
                .collect();
            let mounts: Vec<Value> = c
                .volume_mounts
                .iter()
                .flatten()
                .map(|m| json!([m.name, m.mount_path]))
                .collect();
            json!({
                "name": c.name,
                "image": c.image,
                "ports": ports,
                "env": env,
                "mounts": mounts,
            })
        })
        .collect();
    let volumes: Vec<Value> = spec
        .volumes
        .iter()
        .flatten()
        .map(|v| {
            let secret =
                v.secret.as_ref().and_then(|s| s.secret_name.clone());
            json!([v.name, secret])
        })
        .collect();
    json!({
        "serviceAccountName": spec.service_account_name,
        "containers": containers,
        "volumes": volumes,
    })
}

impl ManagedKind for Deployment {
    const FITNESS: FitnessClass = FitnessClass::Workload;

    fn spec_differs(live: &Self, desired: &Self) -> bool {
        let (Some(l), Some(d)) = (&live.spec, &desired.spec) else {
            return live.spec.is_none() != desired.spec.is_none();
        };
        // Unset desired replicas means an autoscaler owns the count.
        (d.replicas.is_some() && l.replicas != d.replicas)
            || l.selector.match_labels != d.selector.match_labels
            || pod_projection(&l.template) != pod_projection(&d.template)
    }

    fn apply_desired(live: &mut Self, desired: &Self) {
        let live_replicas = live.spec.as_ref().and_then(|s| s.replicas);
        live.spec = desired.spec.clone();
        if let Some(spec) = live.spec.as_mut() {
            if spec.replicas.is_none() {
                spec.replicas = live_replicas;
            }
        }
    }
}

fn service_projection(svc: &Service) -> Value {
    let spec = svc.spec.clone().unwrap_or_default();
    let ports: Vec<Value> = spec
        .ports
        .iter()
        .flatten()
        .map(|p| {
            json!([
                p.name,
                p.port,
                p.target_port,
                p.protocol.clone().unwrap_or_else(|| "TCP".into())
            ])
        })
        .collect();
    json!({
        "type": spec.type_.unwrap_or_else(|| "ClusterIP".into()),
        "selector": spec.selector.unwrap_or_default(),
        "ports": ports,
    })
}

impl ManagedKind for Service {
    const FITNESS: FitnessClass = FitnessClass::Network;

    fn spec_differs(live: &Self, desired: &Self) -> bool {
        service_projection(live) != service_projection(desired)
    }

    fn apply_desired(live: &mut Self, desired: &Self) {
        let old = live.spec.take().unwrap_or_default();
        let mut spec = desired.spec.clone().unwrap_or_default();
        spec.cluster_ip = old.cluster_ip;
        spec.cluster_ips = old.cluster_ips;
        spec.ip_families = old.ip_families;
        spec.ip_family_policy = old.ip_family_policy;
        spec.internal_traffic_policy = old.internal_traffic_policy;
        spec.session_affinity = old.session_affinity;
        if spec.type_.as_deref() != Some("ClusterIP") {
            spec.health_check_node_port = old.health_check_node_port;
            let old_ports = old.ports.unwrap_or_default();
            for p in spec.ports.iter_mut().flatten() {
                p.node_port = old_ports
                    .iter()
                    .find(|o| o.name == p.name)
                    .and_then(|o| o.node_port);
            }
        }
        live.spec = Some(spec);
    }
}

/// Certificate material is never patched in place.
impl ManagedKind for Secret {
    fn spec_differs(_live: &Self, _desired: &Self) -> bool {
        false
    }

    fn apply_desired(_live: &mut Self, _desired: &Self) {}
}

impl ManagedKind for ServiceAccount {
    fn spec_differs(_live: &Self, _desired: &Self) -> bool {
        false
    }

    fn apply_desired(_live: &mut Self, _desired: &Self) {}
}

impl ManagedKind for Role {
    fn spec_differs(live: &Self, desired: &Self) -> bool {
        live.rules.clone().unwrap_or_default()
            != desired.rules.clone().unwrap_or_default()
    }

    fn apply_desired(live: &mut Self, desired: &Self) {
        live.rules = desired.rules.clone();
    }
}

impl ManagedKind for RoleBinding {
    fn spec_differs(live: &Self, desired: &Self) -> bool {
        live.role_ref != desired.role_ref
            || live.subjects.clone().unwrap_or_default()
                != desired.subjects.clone().unwrap_or_default()
    }

    fn apply_desired(live: &mut Self, desired: &Self) {
        live.role_ref = desired.role_ref.clone();
        live.subjects = desired.subjects.clone();
    }
}

fn hpa_projection(hpa: &HorizontalPodAutoscaler) -> Value {
    let spec = hpa.spec.clone().unwrap_or_default();
    json!({
        "target": to_json(&spec.scale_target_ref),
        "min": spec.min_replicas.unwrap_or(1),
        "max": spec.max_replicas,
        "metrics": to_json(&spec.metrics.unwrap_or_default()),
    })
}

impl ManagedKind for HorizontalPodAutoscaler {
    fn spec_differs(live: &Self, desired: &Self) -> bool {
        hpa_projection(live) != hpa_projection(desired)
    }

    fn apply_desired(live: &mut Self, desired: &Self) {
        let behavior = live.spec.as_ref().and_then(|s| s.behavior.clone());
        live.spec = desired.spec.clone();
        if let Some(spec) = live.spec.as_mut() {
            spec.behavior = behavior;
        }
    }
}

fn pdb_projection(pdb: &PodDisruptionBudget) -> Value {
    let spec = pdb.spec.clone().unwrap_or_default();
    json!({
        "minAvailable": to_json(&spec.min_available),
        "maxUnavailable": to_json(&spec.max_unavailable),
        "selector": to_json(&spec.selector),
    })
}

impl ManagedKind for PodDisruptionBudget {
    fn spec_differs(live: &Self, desired: &Self) -> bool {
        pdb_projection(live) != pdb_projection(desired)
    }

    fn apply_desired(live: &mut Self, desired: &Self) {
        live.spec = desired.spec.clone();
    }
}

fn webhooks_projection(vwc: &ValidatingWebhookConfiguration) -> Value {
    let hooks: Vec<Value> = vwc
        .webhooks
        .iter()
        .flatten()
        .map(|w| {
            json!({
                "name": w.name,
                "clientConfig": to_json(&w.client_config),
                "rules": to_json(&w.rules),
                "failurePolicy": w.failure_policy,
                "sideEffects": w.side_effects,
                "admissionReviewVersions": w.admission_review_versions,
                "namespaceSelector": to_json(&w.namespace_selector),
            })
        })
        .collect();
    Value::Array(hooks)
}

impl ManagedKind for ValidatingWebhookConfiguration {
    fn spec_differs(live: &Self, desired: &Self) -> bool {
        webhooks_projection(live) != webhooks_projection(desired)
    }

    fn apply_desired(live: &mut Self, desired: &Self) {
        live.webhooks = desired.webhooks.clone();
    }
}

impl ManagedKind for DataPlane {
    const FITNESS: FitnessClass = FitnessClass::Age;

    fn spec_differs(live: &Self, desired: &Self) -> bool {
        to_json(&live.spec) != to_json(&desired.spec)
    }

    fn apply_desired(live: &mut Self, desired: &Self) {
        live.spec = desired.spec.clone();
    }
}

impl ManagedKind for ControlPlane {
    fn spec_differs(live: &Self, desired: &Self) -> bool {
        to_json(&live.spec) != to_json(&desired.spec)
    }

    fn apply_desired(live: &mut Self, desired: &Self) {
        live.spec = desired.spec.clone();
    }
}
