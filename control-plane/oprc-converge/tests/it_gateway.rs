use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::Resource;
use kube::discovery::ApiResource;
use oprc_converge::conditions::{
    CONTROL_PLANE_READY, DATA_PLANE_READY, PROGRAMMED, SERVICE_READY, find,
    is_true,
};
use oprc_converge::crd::{ControlPlane, DataPlane};
use oprc_converge::ensure::EnsureResult;
use oprc_converge::labels::current_labels;
use oprc_converge::owner::{Owner, OwnerKind, OwnerObject};
use oprc_converge::ReconcileOutcome;
use serde_json::json;

mod common;
use common::{Harness, NS, gateway, key};

async fn mark_available(h: &Harness, deployment: &str) {
    let ar = ApiResource::erase::<Deployment>(&());
    assert!(
        h.store
            .set_status(
                &ar,
                Some(NS),
                deployment,
                json!({"replicas": 1, "readyReplicas": 1, "availableReplicas": 1}),
            )
            .await
    );
}

#[test_log::test(tokio::test)]
async fn gateway_renders_both_planes() {
    let h = Harness::new();
    h.seed(&gateway("gw")).await;
    let k = key(OwnerKind::Gateway, "gw");

    let (steps, last) = h.settle(&k).await;
    assert_eq!(
        steps,
        vec![
            ReconcileOutcome::Mutated {
                kind: "DataPlane".into(),
                role: "dataplane",
                result: EnsureResult::Created,
            },
            ReconcileOutcome::Mutated {
                kind: "ControlPlane".into(),
                role: "controlplane",
                result: EnsureResult::Created,
            },
        ]
    );
    assert!(matches!(
        last,
        ReconcileOutcome::Converged { ready: false, .. }
    ));

    let owner = h.identity(&k).await;
    let dps: Vec<DataPlane> = h.all().await;
    assert_eq!(dps.len(), 1);
    let dp = &dps[0];
    assert_eq!(dp.meta().name.as_deref(), Some("gw-dataplane"));
    assert_eq!(
        dp.meta().labels.clone().unwrap(),
        current_labels(&owner, "dataplane")
    );
    assert!(dp.spec.tls);
    assert_eq!(dp.spec.service_type.as_deref(), Some("LoadBalancer"));
    let ports: Vec<i32> = dp.spec.ports.iter().map(|p| p.port).collect();
    assert_eq!(ports, vec![80, 443]);

    let cps: Vec<ControlPlane> = h.all().await;
    assert_eq!(cps.len(), 1);
    assert_eq!(cps[0].spec.data_plane.as_deref(), Some("gw-dataplane"));
    assert_eq!(
        cps[0].spec.env.get("OAAS_GATEWAY_CLASS").map(String::as_str),
        Some("oaas")
    );

    let status = h.owner(&k).await;
    let programmed = find(status.conditions(), PROGRAMMED).unwrap();
    assert!(!is_true(status.conditions(), PROGRAMMED));
    let message = programmed.message.clone().unwrap_or_default();
    assert!(message.contains(DATA_PLANE_READY));
    assert!(message.contains(CONTROL_PLANE_READY));
}

#[test_log::test(tokio::test)]
async fn gateway_is_programmed_once_children_are_ready() {
    let h = Harness::new();
    h.seed_ca().await;
    h.seed(&gateway("gw")).await;
    let gw = key(OwnerKind::Gateway, "gw");
    let dp = key(OwnerKind::DataPlane, "gw-dataplane");
    let cp = key(OwnerKind::ControlPlane, "gw-controlplane");
    h.settle(&gw).await;

    // A load balancer without ingress keeps the proxy unready.
    h.settle(&dp).await;
    let dp_owner = h.owner(&dp).await;
    let svc = find(dp_owner.conditions(), SERVICE_READY).unwrap();
    assert_eq!(svc.reason.as_deref(), Some("PendingLoadBalancer"));

    let svc_ar = ApiResource::erase::<Service>(&());
    h.store
        .set_status(
            &svc_ar,
            Some(NS),
            "gw-dataplane-proxy",
            json!({"loadBalancer": {"ingress": [{"ip": "203.0.113.7"}]}}),
        )
        .await;
    mark_available(&h, "gw-dataplane-proxy").await;
    let out = h.reconcile(&dp).await.unwrap();
    assert!(matches!(out, ReconcileOutcome::Converged { ready: true, .. }));

    h.settle(&cp).await;
    mark_available(&h, "gw-controlplane-controller").await;
    let out = h.reconcile(&cp).await.unwrap();
    assert!(matches!(out, ReconcileOutcome::Converged { ready: true, .. }));

    let out = h.reconcile(&gw).await.unwrap();
    assert_eq!(
        out,
        ReconcileOutcome::Converged {
            ready: true,
            status_written: true
        }
    );
    let Owner::Gateway(g) = h.owner(&gw).await else {
        panic!("expected a gateway");
    };
    let status = g.status.unwrap();
    assert!(is_true(&status.conditions, PROGRAMMED));
    assert_eq!(status.data_plane.as_deref(), Some("gw-dataplane"));
    assert_eq!(status.control_plane.as_deref(), Some("gw-controlplane"));
    assert_eq!(status.addresses, vec!["203.0.113.7".to_string()]);
}
