#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;
use kube::core::DynamicObject;
use kube::discovery::ApiResource;
use oprc_converge::config::EngineConfig;
use oprc_converge::crd::{
    ControlPlane, ControlPlaneSpec, DataPlane, DataPlaneSpec, Gateway,
    GatewaySpec, ListenerSpec, PortSpec,
};
use oprc_converge::owner::{Owner, OwnerIdentity, OwnerKey, OwnerKind};
use oprc_converge::pki::CertificateAuthority;
use oprc_converge::store::MemoryStore;
use oprc_converge::{ConvergeError, Engine, ReconcileOutcome, TypeRegistry};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

pub const NS: &str = "apps";

pub struct Harness {
    pub store: MemoryStore,
    pub engine: Engine,
    pub cancel: CancellationToken,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(cfg: EngineConfig) -> Self {
        let store = MemoryStore::new();
        let engine = Engine::new(
            Arc::new(store.clone()),
            Arc::new(TypeRegistry::builtin()),
            cfg,
        );
        Self {
            store,
            engine,
            cancel: CancellationToken::new(),
        }
    }

    /// Store the engine CA where the default config looks for it.
    pub async fn seed_ca(&self) -> CertificateAuthority {
        let ca = CertificateAuthority::new("oaas-test-ca", 3650)
            .expect("generate CA");
        let cfg = &self.engine.context().cfg.certificates;
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(cfg.ca_secret_name.clone()),
                namespace: Some(cfg.ca_secret_namespace.clone()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([
                (
                    "tls.crt".to_string(),
                    ByteString(ca.cert_pem().as_bytes().to_vec()),
                ),
                (
                    "tls.key".to_string(),
                    ByteString(ca.key_pem().as_bytes().to_vec()),
                ),
            ])),
            ..Default::default()
        };
        self.seed(&secret).await;
        ca
    }

    pub async fn seed<K>(&self, obj: &K) -> DynamicObject
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        let ar = ApiResource::erase::<K>(&());
        self.store.insert(&ar, to_dynamic(obj)).await
    }

    pub async fn reconcile(
        &self,
        key: &OwnerKey,
    ) -> Result<ReconcileOutcome, ConvergeError> {
        self.engine.reconcile(key, &self.cancel).await
    }

    /// Run passes until one does not mutate. Returns the mutating
    /// outcomes and the final one.
    pub async fn settle(
        &self,
        key: &OwnerKey,
    ) -> (Vec<ReconcileOutcome>, ReconcileOutcome) {
        let mut steps = vec![];
        for _ in 0..32 {
            let out = self.reconcile(key).await.expect("pass failed");
            if matches!(out, ReconcileOutcome::Mutated { .. }) {
                steps.push(out);
            } else {
                return (steps, out);
            }
        }
        panic!("{key} did not settle: {steps:?}");
    }

    pub async fn owner(&self, key: &OwnerKey) -> Owner {
        let ar = self
            .engine
            .context()
            .registry
            .resource(key.kind.as_str())
            .expect("registered")
            .clone();
        let obj = self
            .store
            .fetch(&ar, Some(&key.namespace), &key.name)
            .await
            .expect("owner exists");
        Owner::from_dynamic(key.kind, obj).expect("owner parses")
    }

    pub async fn identity(&self, key: &OwnerKey) -> OwnerIdentity {
        self.owner(key).await.identity().expect("owner identity")
    }

    /// Every stored object of `K`, across namespaces.
    pub async fn all<K>(&self) -> Vec<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let ar = ApiResource::erase::<K>(&());
        self.store
            .objects(&ar, None)
            .await
            .into_iter()
            .map(from_dynamic)
            .collect()
    }
}

pub fn to_dynamic<K: Serialize>(obj: &K) -> DynamicObject {
    serde_json::from_value(serde_json::to_value(obj).expect("serialize"))
        .expect("dynamic object")
}

pub fn from_dynamic<K: DeserializeOwned>(obj: DynamicObject) -> K {
    serde_json::from_value(serde_json::to_value(obj).expect("serialize"))
        .expect("typed object")
}

fn owned_meta(obj: &mut ObjectMeta) {
    obj.namespace = Some(NS.into());
    obj.generation = Some(1);
}

pub fn proxy_spec() -> DataPlaneSpec {
    DataPlaneSpec {
        image: "ghcr.io/oaas/proxy:1.4".into(),
        ports: vec![PortSpec {
            name: "http".into(),
            port: 8080,
            target_port: None,
        }],
        ..Default::default()
    }
}

pub fn data_plane(name: &str, spec: DataPlaneSpec) -> DataPlane {
    let mut dp = DataPlane::new(name, spec);
    owned_meta(&mut dp.metadata);
    dp
}

pub fn controller_spec() -> ControlPlaneSpec {
    ControlPlaneSpec {
        image: "ghcr.io/oaas/controller:1.4".into(),
        ..Default::default()
    }
}

pub fn control_plane(name: &str, spec: ControlPlaneSpec) -> ControlPlane {
    let mut cp = ControlPlane::new(name, spec);
    owned_meta(&mut cp.metadata);
    cp
}

pub fn gateway(name: &str) -> Gateway {
    let mut gw = Gateway::new(
        name,
        GatewaySpec {
            gateway_class_name: "oaas".into(),
            listeners: vec![
                ListenerSpec {
                    name: "http".into(),
                    port: 80,
                    protocol: Some("HTTP".into()),
                },
                ListenerSpec {
                    name: "https".into(),
                    port: 443,
                    protocol: Some("HTTPS".into()),
                },
            ],
            data_plane_image: "ghcr.io/oaas/proxy:1.4".into(),
            control_plane_image: "ghcr.io/oaas/controller:1.4".into(),
            ..Default::default()
        },
    );
    owned_meta(&mut gw.metadata);
    gw
}

pub fn key(kind: OwnerKind, name: &str) -> OwnerKey {
    OwnerKey::new(kind, NS, name)
}
