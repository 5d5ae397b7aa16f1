//! Registry of the object kinds the controller reads and writes
//!
//! Built once at startup and handed to each store through its constructor.

use super::{StoreError, StoreResult};
use crate::crds::NamespaceClass;
use k8s_openapi::api::core::v1::{Namespace, ServiceAccount};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use kube::core::ApiResource;
use kube::Resource;
use std::collections::BTreeMap;

/// Whether objects of a kind live inside a namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindScope {
    Cluster,
    Namespaced,
}

#[derive(Debug, Clone)]
pub struct RegisteredKind {
    pub resource: ApiResource,
    pub scope: KindScope,
}

impl RegisteredKind {
    pub fn is_namespaced(&self) -> bool {
        self.scope == KindScope::Namespaced
    }
}

#[derive(Debug, Clone, Default)]
pub struct KindRegistry {
    kinds: BTreeMap<String, RegisteredKind>,
}

impl KindRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The four kinds the controller works with.
    pub fn with_defaults() -> Self {
        Self::new()
            .register::<NamespaceClass>(KindScope::Cluster)
            .register::<Namespace>(KindScope::Cluster)
            .register::<NetworkPolicy>(KindScope::Namespaced)
            .register::<ServiceAccount>(KindScope::Namespaced)
    }

    #[must_use]
    pub fn register<K: Resource<DynamicType = ()>>(mut self, scope: KindScope) -> Self {
        let resource = ApiResource::erase::<K>(&());
        self.kinds
            .insert(Self::key_of::<K>(), RegisteredKind { resource, scope });
        self
    }

    pub fn lookup<K: Resource<DynamicType = ()>>(&self) -> StoreResult<&RegisteredKind> {
        let key = Self::key_of::<K>();
        self.kinds
            .get(&key)
            .ok_or(StoreError::UnregisteredKind(key))
    }

    pub fn kinds(&self) -> impl Iterator<Item = &RegisteredKind> {
        self.kinds.values()
    }

    pub fn key_of<K: Resource<DynamicType = ()>>() -> String {
        format!("{}/{}", K::api_version(&()), K::kind(&()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;

    #[test]
    fn defaults_cover_the_controller_kinds() {
        let registry = KindRegistry::with_defaults();
        assert_eq!(registry.kinds().count(), 4);

        let class = registry.lookup::<NamespaceClass>().unwrap();
        assert_eq!(class.scope, KindScope::Cluster);
        assert_eq!(class.resource.plural, "namespaceclasses");
        assert_eq!(class.resource.group, "core.resource-wrapper.io");

        let policy = registry.lookup::<NetworkPolicy>().unwrap();
        assert!(policy.is_namespaced());
        assert_eq!(policy.resource.api_version, "networking.k8s.io/v1");
    }

    #[test]
    fn unknown_kinds_are_rejected() {
        let registry = KindRegistry::with_defaults();
        let err = registry.lookup::<ConfigMap>().unwrap_err();
        assert!(matches!(err, StoreError::UnregisteredKind(key) if key == "v1/ConfigMap"));
    }
}
