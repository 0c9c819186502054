use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
use k8s_openapi::api::core::v1::{Secret, Service};
use kube::Resource;
use kube::core::DynamicObject;
use kube::discovery::ApiResource;
use oprc_converge::conditions::{READY, find};
use oprc_converge::config::EngineConfig;
use oprc_converge::crd::{DataPlane, DataPlaneSpec};
use oprc_converge::ensure::EnsureResult;
use oprc_converge::generator::dataplane as render;
use oprc_converge::labels::WAIT_FOR_OWNER_FINALIZER;
use oprc_converge::owner::{OwnerKind, OwnerObject};
use oprc_converge::lister::Child;
use oprc_converge::reduce::{self, PreDeleteHook};
use oprc_converge::store::{
    DeleteOutcome, MemoryStore, ObjectStore, Selector, StoreError,
    StoreResult, WriteOutcome,
};
use oprc_converge::{
    ConvergeError, Engine, ErrorTier, ReconcileOutcome, TypeRegistry,
};
use tokio_util::sync::CancellationToken;

mod common;
use common::{Harness, NS, data_plane, key, proxy_spec, to_dynamic};

enum Fault {
    ConflictOnCreate,
    SlowGet,
    /// Bump the owner's version right after the engine reads it, once.
    RaceOwnerRead(AtomicBool),
}

struct FaultyStore {
    inner: MemoryStore,
    fault: Fault,
}

#[async_trait]
impl ObjectStore for FaultyStore {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> StoreResult<Option<DynamicObject>> {
        if matches!(self.fault, Fault::SlowGet) {
            tokio::time::sleep(Duration::from_secs(600)).await;
        }
        let obj = self.inner.get(resource, namespace, name).await?;
        if let Fault::RaceOwnerRead(armed) = &self.fault {
            if resource.kind == "DataPlane" && armed.swap(false, Ordering::SeqCst)
            {
                self.inner.touch(resource, namespace, name).await;
            }
        }
        Ok(obj)
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> StoreResult<Vec<DynamicObject>> {
        self.inner.list(resource, namespace, selector).await
    }

    async fn create(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
    ) -> StoreResult<WriteOutcome> {
        if matches!(self.fault, Fault::ConflictOnCreate) {
            return Ok(WriteOutcome::Conflict);
        }
        self.inner.create(resource, obj).await
    }

    async fn patch(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
    ) -> StoreResult<WriteOutcome> {
        self.inner.patch(resource, obj).await
    }

    async fn patch_status(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        expected_version: &str,
        status: &serde_json::Value,
    ) -> StoreResult<WriteOutcome> {
        self.inner
            .patch_status(resource, namespace, name, expected_version, status)
            .await
    }

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        expected_version: Option<&str>,
    ) -> StoreResult<DeleteOutcome> {
        self.inner
            .delete(resource, namespace, name, expected_version)
            .await
    }
}

fn faulty_engine(
    inner: &MemoryStore,
    fault: Fault,
    cfg: EngineConfig,
) -> Engine {
    let store = FaultyStore {
        inner: inner.clone(),
        fault,
    };
    Engine::new(Arc::new(store), Arc::new(TypeRegistry::builtin()), cfg)
}

async fn seed_owner(store: &MemoryStore, spec: DataPlaneSpec) {
    let ar = ApiResource::erase::<DataPlane>(&());
    store.insert(&ar, to_dynamic(&data_plane("edge", spec))).await;
}

#[test_log::test(tokio::test)]
async fn missing_owner_is_gone() {
    let h = Harness::new();
    let out = h.reconcile(&key(OwnerKind::DataPlane, "nope")).await.unwrap();
    assert_eq!(out, ReconcileOutcome::OwnerGone);
}

#[test_log::test(tokio::test)]
async fn deleting_owner_releases_held_children() {
    let h = Harness::new();
    h.seed_ca().await;
    let mut dp = data_plane("edge", DataPlaneSpec {
        tls: true,
        ..proxy_spec()
    });
    dp.metadata.finalizers = Some(vec!["test.oaas.io/hold".into()]);
    h.seed(&dp).await;
    let k = key(OwnerKind::DataPlane, "edge");
    h.settle(&k).await;

    let held = |s: &Secret| {
        s.meta()
            .finalizers
            .iter()
            .flatten()
            .any(|f| f == WAIT_FOR_OWNER_FINALIZER)
    };
    let leaf = |all: Vec<Secret>| {
        all.into_iter()
            .find(|s| s.meta().namespace.as_deref() == Some(NS))
            .unwrap()
    };
    assert!(held(&leaf(h.all().await)));

    let ar = ApiResource::erase::<DataPlane>(&());
    h.store.delete(&ar, Some(NS), "edge", None).await.unwrap();
    assert_eq!(
        h.reconcile(&k).await.unwrap(),
        ReconcileOutcome::Released { children: 1 }
    );
    assert!(!held(&leaf(h.all().await)));
    assert_eq!(
        h.reconcile(&k).await.unwrap(),
        ReconcileOutcome::Released { children: 0 }
    );
}

#[test_log::test(tokio::test)]
async fn create_conflict_is_retried_without_status() {
    let store = MemoryStore::new();
    seed_owner(&store, proxy_spec()).await;
    let engine =
        faulty_engine(&store, Fault::ConflictOnCreate, EngineConfig::default());
    let k = key(OwnerKind::DataPlane, "edge");

    let err = engine
        .reconcile(&k, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ConvergeError::Conflict { ref kind, .. } if kind == "Service"
    ));
    assert_eq!(err.tier(), ErrorTier::Transient);

    let ar = ApiResource::erase::<DataPlane>(&());
    let owner = store.fetch(&ar, Some(NS), "edge").await.unwrap();
    assert!(owner.data.get("status").is_none_or(|s| s.is_null()));
}

#[test_log::test(tokio::test)]
async fn stale_status_write_conflicts() {
    let store = MemoryStore::new();
    seed_owner(&store, proxy_spec()).await;
    let engine = faulty_engine(
        &store,
        Fault::RaceOwnerRead(AtomicBool::new(true)),
        EngineConfig::default(),
    );
    let k = key(OwnerKind::DataPlane, "edge");
    let cancel = CancellationToken::new();

    let err = engine.reconcile(&k, &cancel).await.unwrap_err();
    assert!(matches!(
        err,
        ConvergeError::Conflict { ref kind, .. } if kind == "DataPlane"
    ));

    // The service from the conflicted pass stays; the retry moves on.
    let out = engine.reconcile(&k, &cancel).await.unwrap();
    assert_eq!(
        out,
        ReconcileOutcome::Mutated {
            kind: "Deployment".into(),
            role: "proxy",
            result: EnsureResult::Created,
        }
    );
}

#[test_log::test(tokio::test)]
async fn offline_store_is_transient() {
    let h = Harness::new();
    h.seed(&data_plane("edge", proxy_spec())).await;
    h.store.set_unavailable(true).await;

    let err = h
        .reconcile(&key(OwnerKind::DataPlane, "edge"))
        .await
        .unwrap_err();
    assert!(matches!(err, ConvergeError::Store(_)));
    assert_eq!(err.tier(), ErrorTier::Transient);
}

#[test_log::test(tokio::test)]
async fn cancelled_pass_returns_cancelled() {
    let h = Harness::new();
    h.seed(&data_plane("edge", proxy_spec())).await;
    h.cancel.cancel();

    let err = h
        .reconcile(&key(OwnerKind::DataPlane, "edge"))
        .await
        .unwrap_err();
    assert!(matches!(err, ConvergeError::Cancelled));
    assert!(h.all::<Service>().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn slow_pass_hits_the_deadline() {
    let store = MemoryStore::new();
    seed_owner(&store, proxy_spec()).await;
    let cfg = EngineConfig {
        pass_timeout_secs: Some(2),
        ..EngineConfig::default()
    };
    let engine = faulty_engine(&store, Fault::SlowGet, cfg);

    let err = engine
        .reconcile(&key(OwnerKind::DataPlane, "edge"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ConvergeError::DeadlineExceeded(d) if d == Duration::from_secs(2)
    ));
}

#[test_log::test(tokio::test)]
async fn blocked_owner_is_not_rewritten() {
    let h = Harness::new();
    h.seed(&data_plane("edge", DataPlaneSpec {
        image: "bad image".into(),
        ..proxy_spec()
    }))
    .await;
    let k = key(OwnerKind::DataPlane, "edge");

    let out = h.reconcile(&k).await.unwrap();
    assert!(matches!(
        &out,
        ReconcileOutcome::Blocked { reason, .. } if reason == "InvalidSpec"
    ));
    let version = h.owner(&k).await.resource_version().map(String::from);

    h.reconcile(&k).await.unwrap();
    let owner = h.owner(&k).await;
    assert_eq!(owner.resource_version().map(String::from), version);
    assert_eq!(owner.conditions().len(), 1);
    assert!(h.all::<Service>().await.is_empty());
}

#[derive(Default)]
struct RecordingHook {
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl PreDeleteHook for RecordingHook {
    async fn before_delete(
        &self,
        _store: &dyn ObjectStore,
        _resource: &ApiResource,
        child: DynamicObject,
    ) -> Result<Option<DynamicObject>, ConvergeError> {
        let name = child.metadata.name.clone().unwrap_or_default();
        self.seen.lock().unwrap().push(name);
        Ok(Some(child))
    }
}

#[test_log::test(tokio::test)]
async fn pre_delete_hook_sees_every_loser() {
    let h = Harness::new();
    let hook = Arc::new(RecordingHook::default());
    let engine = h.engine.clone().with_hook(hook.clone());
    h.seed(&data_plane("edge", proxy_spec())).await;
    let k = key(OwnerKind::DataPlane, "edge");
    let owner = h.identity(&k).await;

    let registry = engine.context().registry.clone();
    let desired = render::service(&owner, &proxy_spec(), &registry).unwrap();
    for name in ["edge-proxy-b", "edge-proxy-a", "edge-proxy-c"] {
        let mut svc = desired.object.clone();
        svc.metadata.name = Some(name.into());
        h.seed(&svc).await;
    }

    let out = engine.reconcile(&k, &h.cancel).await.unwrap();
    assert_eq!(
        out,
        ReconcileOutcome::Mutated {
            kind: "Service".into(),
            role: "proxy",
            result: EnsureResult::Deleted,
        }
    );
    let seen = hook.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 2);
    assert_eq!(h.all::<Service>().await.len(), 1);
}

/// Refuses every child it is asked to prepare.
struct ForbiddenHook;

#[async_trait]
impl PreDeleteHook for ForbiddenHook {
    async fn before_delete(
        &self,
        _store: &dyn ObjectStore,
        _resource: &ApiResource,
        _child: DynamicObject,
    ) -> Result<Option<DynamicObject>, ConvergeError> {
        Err(ConvergeError::Store(StoreError::Rejected {
            code: 403,
            message: "finalizer patch forbidden".into(),
        }))
    }
}

fn image_of(d: &Deployment) -> Option<String> {
    d.spec.as_ref()?.template.spec.as_ref()?.containers[0]
        .image
        .clone()
}

#[test_log::test(tokio::test)]
async fn failing_pre_delete_hook_does_not_block_the_survivor() {
    let h = Harness::new();
    let engine = h.engine.clone().with_hook(Arc::new(ForbiddenHook));
    h.seed(&data_plane("edge", proxy_spec())).await;
    let k = key(OwnerKind::DataPlane, "edge");
    let owner = h.identity(&k).await;

    let registry = engine.context().registry.clone();
    let desired =
        render::deployment(&owner, &proxy_spec(), &registry).unwrap();
    for (name, image, available) in [
        ("edge-proxy-a", "ghcr.io/oaas/proxy:1.3", 3),
        ("edge-proxy-b", "ghcr.io/oaas/proxy:1.4", 0),
    ] {
        let mut d = desired.object.clone();
        d.metadata.name = Some(name.into());
        let pod = d.spec.as_mut().unwrap().template.spec.as_mut().unwrap();
        pod.containers[0].image = Some(image.into());
        d.status = Some(DeploymentStatus {
            available_replicas: Some(available),
            ready_replicas: Some(available),
            replicas: Some(available),
            ..Default::default()
        });
        h.seed(&d).await;
    }

    let ar = ApiResource::erase::<Deployment>(&());
    let loser = h.store.fetch(&ar, Some(NS), "edge-proxy-b").await.unwrap();
    let reduced = reduce::apply(
        engine.context(),
        &ar,
        vec![Child {
            object: loser,
            legacy: false,
        }],
    )
    .await
    .unwrap();
    assert_eq!(reduced.deleted, 0);
    assert_eq!(reduced.failures.len(), 1);
    assert!(matches!(
        &reduced.failures[0],
        ConvergeError::DeleteFailed { name, .. } if name == "edge-proxy-b"
    ));
    assert_eq!(reduced.failures[0].tier(), ErrorTier::Transient);

    let mut outcomes = vec![];
    for _ in 0..4 {
        outcomes.push(engine.reconcile(&k, &h.cancel).await);
    }
    assert!(
        outcomes
            .iter()
            .all(|o| !matches!(o, Ok(ReconcileOutcome::Blocked { .. })))
    );
    assert!(outcomes.iter().any(|o| matches!(
        o,
        Ok(ReconcileOutcome::Mutated {
            role: "proxy",
            result: EnsureResult::Updated,
            ..
        })
    )));
    let Some(Err(last)) = outcomes.last() else {
        panic!("stuck duplicate should keep the pass failing");
    };
    assert!(matches!(last, ConvergeError::DeleteFailed { .. }));
    assert_eq!(last.tier(), ErrorTier::Transient);

    let deployments: Vec<Deployment> = h.all().await;
    assert_eq!(deployments.len(), 2);
    let survivor = deployments
        .iter()
        .find(|d| d.meta().name.as_deref() == Some("edge-proxy-a"))
        .unwrap();
    assert_eq!(
        image_of(survivor).as_deref(),
        Some("ghcr.io/oaas/proxy:1.4")
    );
    let status = h.owner(&k).await;
    let reason =
        find(status.conditions(), READY).and_then(|c| c.reason.clone());
    assert_ne!(reason.as_deref(), Some("StoreError"));
    assert_ne!(reason.as_deref(), Some("DeleteFailed"));
}

#[test_log::test(tokio::test)]
async fn batch_reconciles_each_owner_once() {
    let h = Harness::new();
    h.seed(&data_plane("edge", proxy_spec())).await;
    h.seed(&data_plane("core", proxy_spec())).await;
    let keys = vec![
        key(OwnerKind::DataPlane, "edge"),
        key(OwnerKind::DataPlane, "core"),
        key(OwnerKind::DataPlane, "edge"),
        key(OwnerKind::DataPlane, "gone"),
    ];

    let mut results = h.engine.reconcile_many(keys, 2, &h.cancel).await;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(results.len(), 3);
    let outcomes: Vec<_> = results
        .into_iter()
        .map(|(k, r)| (k.name, r.unwrap()))
        .collect();
    assert_eq!(outcomes[0].0, "core");
    assert!(matches!(outcomes[0].1, ReconcileOutcome::Mutated { .. }));
    assert_eq!(outcomes[2], ("gone".into(), ReconcileOutcome::OwnerGone));
    assert_eq!(h.all::<Service>().await.len(), 2);
}
