// Integration tests that expect a running k8s cluster.
// Enable via: cargo test -p oprc-converge --test it_k8s -- --ignored

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::Client;
use kube::api::ObjectMeta;
use kube::discovery::ApiResource;
use oprc_converge::store::{
    DeleteOutcome, KubeStore, ObjectStore, Selector, WriteOutcome,
};

mod common;
use common::to_dynamic;

fn uniq(prefix: &str) -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or_default();
    format!("{prefix}-{nanos:x}")
}

#[test_log::test(tokio::test)]
#[ignore]
async fn cluster_store_guards_writes_by_version() {
    // Pre-conditions:
    // - KUBECONFIG points to a working cluster
    // - Namespace "default" exists
    let client = Client::try_default().await.expect("kube client");
    let store = KubeStore::new(client);
    let ar = ApiResource::erase::<ConfigMap>(&());
    let ns = "default";
    let name = uniq("oprc-converge-it");

    let cm = ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(ns.into()),
            labels: Some(BTreeMap::from([(
                "oaas.io/managed-by-name".to_string(),
                name.clone(),
            )])),
            ..Default::default()
        },
        data: Some(BTreeMap::from([("k".to_string(), "v".to_string())])),
        ..Default::default()
    };
    let obj = to_dynamic(&cm);

    let WriteOutcome::Applied(created) =
        store.create(&ar, &obj).await.expect("create")
    else {
        panic!("first create conflicted");
    };
    assert!(matches!(
        store.create(&ar, &obj).await.expect("second create"),
        WriteOutcome::Conflict
    ));

    let sel = Selector::new().with("oaas.io/managed-by-name", name.as_str());
    let listed = store.list(&ar, Some(ns), &sel).await.expect("list");
    assert_eq!(listed.len(), 1);

    let mut edited = created.clone();
    edited.data["data"]["k"] = "w".into();
    assert!(matches!(
        store.patch(&ar, &edited).await.expect("patch"),
        WriteOutcome::Applied(_)
    ));
    // `created` now carries a stale version.
    assert!(matches!(
        store.patch(&ar, &created).await.expect("stale patch"),
        WriteOutcome::Conflict
    ));
    assert!(matches!(
        store
            .delete(&ar, Some(ns), &name, created.metadata.resource_version.as_deref())
            .await
            .expect("stale delete"),
        DeleteOutcome::Conflict
    ));

    assert!(matches!(
        store.delete(&ar, Some(ns), &name, None).await.expect("delete"),
        DeleteOutcome::Deleted
    ));
    assert!(matches!(
        store.delete(&ar, Some(ns), &name, None).await.expect("re-delete"),
        DeleteOutcome::NotFound
    ));
}
