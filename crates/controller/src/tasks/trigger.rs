//! Change-to-class mapping
//!
//! A class triggers itself, but only when its spec generation moves or it
//! starts terminating, so status writes never wake the controller again. A
//! namespace or generated child triggers the class named in its membership
//! label. [`LabelTracker`] remembers the owner seen last for every labeled
//! object, so a change that removes or moves the label also reaches the class
//! that lost the object.

use crate::crds::NamespaceClass;
use crate::membership::MembershipIndex;
use kube::api::ObjectMeta;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Event;
use kube::runtime::{predicates, Predicate};
use kube::{Resource, ResourceExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace};

fn terminating(class: &NamespaceClass) -> Option<u64> {
    Some(u64::from(class.metadata.deletion_timestamp.is_some()))
}

/// Class changes worth a pass: a new spec generation or the start of deletion.
pub fn class_changes() -> impl Predicate<NamespaceClass> + Send + Sync + 'static {
    predicates::generation::<NamespaceClass>.combine(terminating)
}

/// Maps labeled objects to the class that owns them
#[derive(Clone)]
pub struct TriggerMapper {
    membership: Arc<dyn MembershipIndex>,
}

impl TriggerMapper {
    pub fn new(membership: Arc<dyn MembershipIndex>) -> Self {
        Self { membership }
    }

    /// Class named by the object's membership label, if any.
    pub fn class_for<K>(&self, object: &K) -> Option<ObjectRef<NamespaceClass>>
    where
        K: Resource,
        K::DynamicType: Default,
    {
        let class_name = self.membership.owner_of(object.meta())?;
        trace!(
            kind = %K::kind(&K::DynamicType::default()),
            name = %object.name_any(),
            class = %class_name,
            "Mapped change to class"
        );
        Some(ObjectRef::new(&class_name))
    }

    /// Mapper function in the shape the controller's `watches` family expects.
    pub fn router<K>(&self) -> impl Fn(K) -> Option<ObjectRef<NamespaceClass>> + Send + Sync + 'static
    where
        K: Resource,
        K::DynamicType: Default,
    {
        let mapper = self.clone();
        move |object: K| mapper.class_for(&object)
    }
}

/// Last owner seen for every labeled object of one kind.
///
/// Fed with raw watcher events. Each event is expanded into the snapshots to
/// route: the object itself, preceded by a label-only snapshot of its former
/// owner whenever that owner differs from the current one. A relist forgets
/// objects that did not come back and routes their last owner one more time.
pub struct LabelTracker<K: Resource<DynamicType = ()>> {
    membership: Arc<dyn MembershipIndex>,
    owners: HashMap<ObjectRef<K>, String>,
    relisted: Option<HashSet<ObjectRef<K>>>,
}

impl<K> LabelTracker<K>
where
    K: Resource<DynamicType = ()> + Clone + Default,
{
    pub fn new(membership: Arc<dyn MembershipIndex>) -> Self {
        Self {
            membership,
            owners: HashMap::new(),
            relisted: None,
        }
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    /// Snapshots to route for one watcher event.
    pub fn observe(&mut self, event: Event<K>) -> Vec<K> {
        match event {
            Event::Init => {
                self.relisted = Some(HashSet::new());
                Vec::new()
            }
            Event::InitApply(object) => {
                if let Some(relisted) = self.relisted.as_mut() {
                    relisted.insert(ObjectRef::from_obj(&object));
                }
                self.applied(object)
            }
            Event::InitDone => self.forget_unlisted(),
            Event::Apply(object) => self.applied(object),
            Event::Delete(object) => self.deleted(object),
        }
    }

    fn applied(&mut self, object: K) -> Vec<K> {
        let key = ObjectRef::from_obj(&object);
        let current = self.membership.owner_of(object.meta());
        let previous = match &current {
            Some(owner) => self.owners.insert(key.clone(), owner.clone()),
            None => self.owners.remove(&key),
        };

        let mut snapshots = Vec::with_capacity(2);
        if let Some(previous) = previous.filter(|previous| current.as_ref() != Some(previous)) {
            debug!(object = %key, from = %previous, to = ?current, "Membership label changed");
            snapshots.push(self.owned_by(&key, &previous));
        }
        snapshots.push(object);
        snapshots
    }

    fn deleted(&mut self, object: K) -> Vec<K> {
        let key = ObjectRef::from_obj(&object);
        let current = self.membership.owner_of(object.meta());
        let mut snapshots = Vec::with_capacity(2);
        if let Some(previous) = self
            .owners
            .remove(&key)
            .filter(|previous| current.as_ref() != Some(previous))
        {
            snapshots.push(self.owned_by(&key, &previous));
        }
        snapshots.push(object);
        snapshots
    }

    fn forget_unlisted(&mut self) -> Vec<K> {
        let Some(relisted) = self.relisted.take() else {
            return Vec::new();
        };
        let gone: Vec<ObjectRef<K>> = self
            .owners
            .keys()
            .filter(|key| !relisted.contains(*key))
            .cloned()
            .collect();

        gone.into_iter()
            .filter_map(|key| {
                let owner = self.owners.remove(&key)?;
                debug!(object = %key, class = %owner, "Object vanished while disconnected");
                Some(self.owned_by(&key, &owner))
            })
            .collect()
    }

    /// Label-only stand-in for `key` as it looked while `owner` held it.
    fn owned_by(&self, key: &ObjectRef<K>, owner: &str) -> K {
        let mut snapshot = K::default();
        *snapshot.meta_mut() = ObjectMeta {
            name: Some(key.name.clone()),
            namespace: key.namespace.clone(),
            labels: Some(self.membership.owner_labels(owner)),
            ..ObjectMeta::default()
        };
        snapshot
    }
}
