use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::core::DynamicObject;
use serde_json::Value;

use crate::controller::ConvergeContext;
use crate::error::ConvergeError;
use crate::store::Selector;

const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

/// Which health signals rank duplicates of a kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FitnessClass {
    /// available, then ready replicas
    Workload,
    /// load-balancer ingress, endpoint slices, ready endpoints
    Network,
    /// age only
    Age,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fitness {
    /// Compared lexicographically, higher wins.
    pub metrics: Vec<i64>,
    pub created: Option<DateTime<Utc>>,
    pub name: String,
    pub uid: String,
}

impl Fitness {
    pub fn new(obj: &DynamicObject, metrics: Vec<i64>) -> Self {
        Self {
            metrics,
            created: obj.metadata.creation_timestamp.as_ref().map(|t| t.0),
            name: obj.metadata.name.clone().unwrap_or_default(),
            uid: obj.metadata.uid.clone().unwrap_or_default(),
        }
    }
}

/// `Less` means `a` is the better survivor. Total over distinct objects.
pub fn compare(a: &Fitness, b: &Fitness) -> Ordering {
    b.metrics
        .cmp(&a.metrics)
        .then_with(|| match (a.created, b.created) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.name.cmp(&b.name))
        .then_with(|| a.uid.cmp(&b.uid))
}

fn int_at(data: &Value, pointer: &str) -> i64 {
    data.pointer(pointer).and_then(Value::as_i64).unwrap_or(0)
}

pub fn workload_metrics(obj: &DynamicObject) -> Vec<i64> {
    vec![
        int_at(&obj.data, "/status/availableReplicas"),
        int_at(&obj.data, "/status/readyReplicas"),
    ]
}

fn ingress_count(obj: &DynamicObject) -> i64 {
    obj.data
        .pointer("/status/loadBalancer/ingress")
        .and_then(Value::as_array)
        .map(|a| a.len() as i64)
        .unwrap_or(0)
}

async fn network_metrics(
    ctx: &ConvergeContext,
    obj: &DynamicObject,
) -> Result<Vec<i64>, ConvergeError> {
    let ty = ctx.registry.of::<EndpointSlice>()?;
    let name = obj.metadata.name.clone().unwrap_or_default();
    let selector = Selector::new().with(SERVICE_NAME_LABEL, name);
    let slices = ctx
        .store
        .list(&ty.resource, obj.metadata.namespace.as_deref(), &selector)
        .await?;
    let ready: i64 = slices
        .iter()
        .map(|s| {
            s.data
                .get("endpoints")
                .and_then(Value::as_array)
                .map(|eps| {
                    eps.iter()
                        .filter(|ep| {
                            ep.pointer("/conditions/ready")
                                .and_then(Value::as_bool)
                                .unwrap_or(true)
                        })
                        .count() as i64
                })
                .unwrap_or(0)
        })
        .sum();
    Ok(vec![ingress_count(obj), slices.len() as i64, ready])
}

pub async fn measure(
    ctx: &ConvergeContext,
    class: FitnessClass,
    obj: &DynamicObject,
) -> Result<Fitness, ConvergeError> {
    let metrics = match class {
        FitnessClass::Workload => workload_metrics(obj),
        FitnessClass::Network => network_metrics(ctx, obj).await?,
        FitnessClass::Age => vec![],
    };
    Ok(Fitness::new(obj, metrics))
}
