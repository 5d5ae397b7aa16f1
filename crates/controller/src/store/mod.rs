//! Object store abstraction
//!
//! The reconciler only talks to the cluster through [`ObjectStore`]. The
//! production implementation is [`KubeStore`], backed by the API server; the
//! [`MemoryStore`] keeps the same compare-and-swap and resource-version
//! semantics in process.

pub mod cluster;
pub mod memory;
pub mod registry;

use async_trait::async_trait;
use kube::api::Preconditions;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Debug;
use thiserror::Error;

pub use cluster::KubeStore;
pub use memory::{InjectedFailure, MemoryStore, StoreCall, Verb};
pub use registry::{KindRegistry, KindScope, RegisteredKind};

/// Object store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: String, name: String },

    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: String, name: String },

    #[error("Conflict writing {kind} '{name}': {message}")]
    Conflict {
        kind: String,
        name: String,
        message: String,
    },

    #[error("Kind {0} is not registered with the object store")]
    UnregisteredKind(String),

    #[error("Object store unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Result type for object store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Any typed Kubernetes object the store can read and write.
pub trait StoredObject:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> StoredObject for T where
    T: Resource<DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Equality-based label selector
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchLabels(BTreeMap<String, String>);

impl MatchLabels {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Whether every required label is present with the required value.
    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        self.0.iter().all(|(key, value)| {
            labels
                .and_then(|labels| labels.get(key))
                .is_some_and(|actual| actual == value)
        })
    }

    /// Render as a Kubernetes label selector query (`a=b,c=d`).
    pub fn to_query(&self) -> String {
        self.0
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Storage contract consumed by the reconciler.
///
/// `namespace` is `None` for cluster-scoped kinds, and for cross-namespace
/// listing of namespaced kinds. Updates are compare-and-swap on the
/// `resourceVersion` carried by the object.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get<K: StoredObject>(&self, namespace: Option<&str>, name: &str)
        -> StoreResult<Option<K>>;

    async fn list<K: StoredObject>(
        &self,
        namespace: Option<&str>,
        selector: &MatchLabels,
    ) -> StoreResult<Vec<K>>;

    async fn create<K: StoredObject>(&self, object: &K) -> StoreResult<K>;

    async fn update<K: StoredObject>(&self, object: &K) -> StoreResult<K>;

    /// JSON merge patch against the status subresource.
    async fn patch_status<K: StoredObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &serde_json::Value,
    ) -> StoreResult<()>;

    async fn delete<K: StoredObject>(&self, namespace: Option<&str>, name: &str)
        -> StoreResult<()>;

    /// Delete exactly the given revision of `object`. The uid and
    /// resourceVersion it carries are sent as preconditions, so a changed or
    /// recreated object yields [`StoreError::Conflict`] instead.
    async fn delete_exact<K: StoredObject>(&self, object: &K) -> StoreResult<()>;
}

/// Preconditions pinning a delete to the revision that was read.
pub fn revision_of<K: StoredObject>(object: &K) -> Preconditions {
    Preconditions {
        resource_version: object.resource_version(),
        uid: object.uid(),
    }
}
