//! Class membership lookups
//!
//! Membership and ownership are both expressed as a single label today
//! (`namespaceclass.akuity.io/name=<class>`). Everything that needs to know
//! which namespaces belong to a class, or which class owns an object, goes
//! through [`MembershipIndex`] so the encoding can change without touching the
//! reconciler.

use crate::store::{MatchLabels, ObjectStore, StoreResult};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Arc;

#[async_trait]
pub trait MembershipIndex: Send + Sync {
    /// Namespaces that currently belong to `class_name`.
    async fn list_members(&self, class_name: &str) -> StoreResult<Vec<Namespace>>;

    /// The class an object declares itself a member or child of.
    fn owner_of(&self, meta: &ObjectMeta) -> Option<String>;

    /// Labels stamped on child objects generated for `class_name`.
    fn owner_labels(&self, class_name: &str) -> BTreeMap<String, String>;

    /// Selector matching every child object generated for `class_name`.
    fn owned_selector(&self, class_name: &str) -> MatchLabels;
}

/// [`MembershipIndex`] backed by label equality
pub struct LabelMembership<S> {
    store: Arc<S>,
    label: String,
}

impl<S: ObjectStore> LabelMembership<S> {
    pub fn new(store: Arc<S>, label: impl Into<String>) -> Self {
        Self {
            store,
            label: label.into(),
        }
    }
}

#[async_trait]
impl<S: ObjectStore + 'static> MembershipIndex for LabelMembership<S> {
    async fn list_members(&self, class_name: &str) -> StoreResult<Vec<Namespace>> {
        self.store
            .list::<Namespace>(None, &self.owned_selector(class_name))
            .await
    }

    fn owner_of(&self, meta: &ObjectMeta) -> Option<String> {
        meta.labels
            .as_ref()?
            .get(&self.label)
            .filter(|class_name| !class_name.is_empty())
            .cloned()
    }

    fn owner_labels(&self, class_name: &str) -> BTreeMap<String, String> {
        BTreeMap::from([(self.label.clone(), class_name.to_string())])
    }

    fn owned_selector(&self, class_name: &str) -> MatchLabels {
        MatchLabels::new().label(self.label.clone(), class_name)
    }
}
