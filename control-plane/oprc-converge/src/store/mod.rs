//! The object store seam.
//!
//! The engine talks to the API server only through [`ObjectStore`]. Every
//! write carries the version observed at read time, and optimistic
//! concurrency failures come back as explicit `Conflict` outcomes rather
//! than errors so callers can abandon the pass without string matching.

pub mod cluster;
pub mod error;
#[cfg(feature = "memory")]
pub mod memory;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use kube::core::DynamicObject;
use kube::discovery::ApiResource;

pub use cluster::KubeStore;
pub use error::StoreError;
#[cfg(feature = "memory")]
pub use memory::MemoryStore;

pub type StoreResult<T> = Result<T, StoreError>;

/// Result of a create, patch or status write.
#[derive(Debug, Clone)]
pub enum WriteOutcome {
    Applied(DynamicObject),
    /// The object changed since it was read (or already exists on create).
    Conflict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
    Conflict,
}

/// Equality-based label selector.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selector(BTreeMap<String, String>);

impl Selector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        self.0.iter().all(|(k, v)| {
            labels.and_then(|l| l.get(k)).map(|x| x == v).unwrap_or(false)
        })
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> =
            self.0.iter().map(|(k, v)| format!("{k}={v}")).collect();
        write!(f, "{}", parts.join(","))
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> StoreResult<Option<DynamicObject>>;

    /// `namespace = None` lists cluster-scoped objects (or all namespaces).
    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> StoreResult<Vec<DynamicObject>>;

    async fn create(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
    ) -> StoreResult<WriteOutcome>;

    /// Replace the object; `obj.metadata.resource_version` is the expected
    /// version.
    async fn patch(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
    ) -> StoreResult<WriteOutcome>;

    /// Write the status sub-resource only.
    async fn patch_status(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        expected_version: &str,
        status: &serde_json::Value,
    ) -> StoreResult<WriteOutcome>;

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        expected_version: Option<&str>,
    ) -> StoreResult<DeleteOutcome>;
}
