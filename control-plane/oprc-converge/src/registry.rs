//! Kinds the engine is allowed to touch.
//!
//! The registry is built once at startup and shared by `Arc`; every child
//! and owner write goes through an [`ApiResource`] looked up here, so an
//! unregistered kind fails fast with a permanent error instead of a
//! surprising API-server 404.

use std::collections::BTreeMap;

use k8s_openapi::api::admissionregistration::v1::ValidatingWebhookConfiguration;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{Secret, Service, ServiceAccount};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::Resource;
use kube::discovery::ApiResource;

use crate::crd::{ControlPlane, DataPlane, Gateway};
use crate::error::ConvergeError;
use crate::owner::OwnerIdentity;

/// Compile-time scope of a typed resource.
pub trait ScopeKind {
    const NAMESPACED: bool;
}

impl ScopeKind for NamespaceResourceScope {
    const NAMESPACED: bool = true;
}

impl ScopeKind for ClusterResourceScope {
    const NAMESPACED: bool = false;
}

#[derive(Clone, Debug)]
pub struct RegisteredType {
    pub resource: ApiResource,
    pub namespaced: bool,
}

#[derive(Clone, Debug, Default)]
pub struct TypeRegistry {
    by_kind: BTreeMap<String, RegisteredType>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<K>(&mut self) -> &mut Self
    where
        K: Resource<DynamicType = ()>,
        K::Scope: ScopeKind,
    {
        let resource = ApiResource::erase::<K>(&());
        self.by_kind.insert(
            resource.kind.clone(),
            RegisteredType {
                resource,
                namespaced: <K::Scope as ScopeKind>::NAMESPACED,
            },
        );
        self
    }

    /// Every child and owner kind the controllers manage.
    pub fn builtin() -> Self {
        let mut reg = Self::new();
        reg.register::<Deployment>()
            .register::<Service>()
            .register::<Secret>()
            .register::<ServiceAccount>()
            .register::<Role>()
            .register::<RoleBinding>()
            .register::<HorizontalPodAutoscaler>()
            .register::<PodDisruptionBudget>()
            .register::<ValidatingWebhookConfiguration>()
            .register::<EndpointSlice>()
            .register::<DataPlane>()
            .register::<ControlPlane>()
            .register::<Gateway>();
        reg
    }

    pub fn lookup(&self, kind: &str) -> Result<&RegisteredType, ConvergeError> {
        self.by_kind
            .get(kind)
            .ok_or_else(|| ConvergeError::UnknownKind(kind.to_string()))
    }

    pub fn resource(&self, kind: &str) -> Result<&ApiResource, ConvergeError> {
        self.lookup(kind).map(|t| &t.resource)
    }

    pub fn of<K>(&self) -> Result<&RegisteredType, ConvergeError>
    where
        K: Resource<DynamicType = ()>,
    {
        self.lookup(&K::kind(&()))
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.by_kind.contains_key(kind)
    }

    pub fn types(&self) -> impl Iterator<Item = &RegisteredType> {
        self.by_kind.values()
    }

    /// Controller reference pointing at `owner`.
    pub fn owner_reference(
        &self,
        owner: &OwnerIdentity,
    ) -> Result<OwnerReference, ConvergeError> {
        let ar = self.resource(owner.kind.as_str())?;
        Ok(OwnerReference {
            api_version: ar.api_version.clone(),
            kind: ar.kind.clone(),
            name: owner.name.clone(),
            uid: owner.uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        })
    }
}
