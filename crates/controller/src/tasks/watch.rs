//! Watch streams feeding the controller
//!
//! Classes are reflected into the controller's cache and only passed on when
//! their generation moves or they start terminating. Namespaces and children
//! are watched through a label-existence selector, so an object that loses
//! the membership label leaves the watch as a delete, which the
//! [`LabelTracker`] routes to the class that held it.

use crate::crds::NamespaceClass;
use crate::tasks::trigger::{class_changes, LabelTracker};
use futures::{stream, Stream, TryStreamExt};
use kube::runtime::reflector::{self, Store};
use kube::runtime::watcher::{self, watcher, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Resource};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use tracing::warn;

/// Trigger stream and cache for the classes themselves.
pub fn class_triggers(
    api: Api<NamespaceClass>,
) -> (
    impl Stream<Item = Result<NamespaceClass, watcher::Error>> + Send + 'static,
    Store<NamespaceClass>,
) {
    let (reader, writer) = reflector::store();
    let triggers = watcher(api, watcher::Config::default())
        .default_backoff()
        .reflect(writer)
        .applied_objects()
        .predicate_filter(class_changes());
    (triggers, reader)
}

/// Expand raw watcher events into the snapshots that need routing.
pub fn track_labels<S, K>(
    events: S,
    mut tracker: LabelTracker<K>,
) -> impl Stream<Item = Result<K, watcher::Error>> + Send + 'static
where
    S: Stream<Item = Result<Event<K>, watcher::Error>> + Send + 'static,
    K: Resource<DynamicType = ()> + Clone + Default + Send + Sync + 'static,
{
    events
        .inspect_err(|e| warn!("Watch error, backing off: {}", e))
        .map_ok(move |event| {
            let snapshots = tracker.observe(event);
            stream::iter(snapshots.into_iter().map(Ok::<K, watcher::Error>))
        })
        .try_flatten()
}

/// Trigger stream for one labeled kind.
pub fn labeled_triggers<K>(
    api: Api<K>,
    membership_label: &str,
    tracker: LabelTracker<K>,
) -> impl Stream<Item = Result<K, watcher::Error>> + Send + 'static
where
    K: Resource<DynamicType = ()> + Clone + Default + Debug + DeserializeOwned + Send + Sync + 'static,
{
    let config = watcher::Config::default().labels(membership_label);
    track_labels(watcher(api, config).default_backoff(), tracker)
}
