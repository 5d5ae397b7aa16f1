//! In-process [`ObjectStore`]
//!
//! Objects are kept as JSON documents keyed by kind, namespace and name. The
//! store follows the API server where the controller depends on it:
//! - every write that changes an object bumps `metadata.resourceVersion`, while
//!   an update that changes nothing is a no-op and keeps the version
//! - updates carrying a stale `resourceVersion` fail with a conflict
//! - spec changes bump `metadata.generation`; status is only written through
//!   `patch_status`
//! - deleting an object with finalizers only sets `deletionTimestamp`
//! - namespaced objects cannot be created in a namespace that does not exist
//!
//! Every call is recorded so callers can assert on the writes that happened.

use super::{
    revision_of, KindRegistry, MatchLabels, ObjectStore, StoreError, StoreResult, StoredObject,
};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use k8s_openapi::api::core::v1::Namespace;
use kube::api::Preconditions;
use kube::{Resource, ResourceExt};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    List,
    Create,
    Update,
    PatchStatus,
    Delete,
}

/// A single recorded store call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreCall {
    pub verb: Verb,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

/// Failure returned by the next matching call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    Conflict,
    NotFound,
    Unavailable,
}

impl InjectedFailure {
    fn into_error(self, kind: &str, name: &str) -> StoreError {
        match self {
            InjectedFailure::Conflict => StoreError::Conflict {
                kind: kind.to_string(),
                name: name.to_string(),
                message: "the object has been modified; please apply your changes to the latest version and try again".to_string(),
            },
            InjectedFailure::NotFound => StoreError::NotFound {
                kind: kind.to_string(),
                name: name.to_string(),
            },
            InjectedFailure::Unavailable => {
                StoreError::Unavailable("injected store outage".to_string())
            }
        }
    }
}

/// (api version/kind, namespace or empty, name)
type ObjectKey = (String, String, String);

#[derive(Default)]
struct MemoryState {
    objects: BTreeMap<ObjectKey, Value>,
    last_version: u64,
    calls: Vec<StoreCall>,
    failures: Vec<(Verb, String, InjectedFailure)>,
}

impl MemoryState {
    fn next_version(&mut self) -> String {
        self.last_version += 1;
        self.last_version.to_string()
    }
}

pub struct MemoryStore {
    registry: KindRegistry,
    state: Mutex<MemoryState>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(KindRegistry::with_defaults())
    }
}

impl MemoryStore {
    pub fn new(registry: KindRegistry) -> Self {
        Self {
            registry,
            state: Mutex::new(MemoryState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn key_for<K: StoredObject>(&self, namespace: Option<&str>, name: &str) -> StoreResult<ObjectKey> {
        let registered = self.registry.lookup::<K>()?;
        let namespace = if registered.is_namespaced() {
            namespace.unwrap_or_default().to_string()
        } else {
            String::new()
        };
        Ok((KindRegistry::key_of::<K>(), namespace, name.to_string()))
    }

    /// Record the call and surface an injected failure for it, if any.
    fn begin<K: StoredObject>(
        state: &mut MemoryState,
        verb: Verb,
        namespace: Option<&str>,
        name: &str,
    ) -> StoreResult<()> {
        let kind = K::kind(&()).to_string();
        trace!(?verb, %kind, ?namespace, %name, "memory store call");
        state.calls.push(StoreCall {
            verb,
            kind: kind.clone(),
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        });

        if let Some(position) = state
            .failures
            .iter()
            .position(|(v, k, _)| *v == verb && *k == kind)
        {
            let (_, _, failure) = state.failures.remove(position);
            return Err(failure.into_error(&kind, name));
        }
        Ok(())
    }

    /// Insert or overwrite an object without recording a call.
    pub fn seed<K: StoredObject>(&self, object: K) -> StoreResult<K> {
        let key = self.key_for::<K>(object.namespace().as_deref(), &object.name_any())?;
        let mut value = serde_json::to_value(&object)?;
        let mut state = self.lock();
        let version = state.next_version();
        let existing = state.objects.get(&key);
        let generation = existing
            .and_then(|existing| existing["metadata"]["generation"].as_i64())
            .map_or(1, |generation| generation + 1);
        let uid = existing
            .and_then(|existing| existing["metadata"]["uid"].as_str())
            .map_or_else(|| format!("uid-{version}"), str::to_string);
        value["metadata"]["resourceVersion"] = json!(version);
        value["metadata"]["generation"] = json!(generation);
        value["metadata"]["uid"] = json!(uid);
        let stored = decode(&value)?;
        state.objects.insert(key, value);
        Ok(stored)
    }

    /// Read an object without recording a call.
    pub fn fetch<K: StoredObject>(&self, namespace: Option<&str>, name: &str) -> Option<K> {
        let key = self.key_for::<K>(namespace, name).ok()?;
        self.lock().objects.get(&key).and_then(|value| decode(value).ok())
    }

    /// Apply an out-of-band edit, as another client would, without recording a call.
    pub fn mutate<K: StoredObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
        edit: impl FnOnce(&mut K),
    ) -> StoreResult<K> {
        let mut object: K = self
            .fetch(namespace, name)
            .ok_or_else(|| StoreError::NotFound {
                kind: K::kind(&()).to_string(),
                name: name.to_string(),
            })?;
        edit(&mut object);
        self.seed(object)
    }

    /// Make the next `verb` call on `kind` fail.
    pub fn fail_next(&self, verb: Verb, kind: &str, failure: InjectedFailure) {
        self.lock().failures.push((verb, kind.to_string(), failure));
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.lock().calls.clone()
    }

    pub fn count(&self, verb: Verb, kind: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.verb == verb && call.kind == kind)
            .count()
    }

    /// Number of write calls (create, update, status patch, delete) of any kind.
    pub fn write_count(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| !matches!(call.verb, Verb::Get | Verb::List))
            .count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    fn not_found<K: StoredObject>(name: &str) -> StoreError {
        StoreError::NotFound {
            kind: K::kind(&()).to_string(),
            name: name.to_string(),
        }
    }
}

fn decode<K: StoredObject>(value: &Value) -> StoreResult<K> {
    Ok(serde_json::from_value(value.clone())?)
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Object without the fields the server maintains on every write.
fn without_bookkeeping(value: &Value) -> Value {
    let mut value = value.clone();
    if let Some(metadata) = value.get_mut("metadata").and_then(Value::as_object_mut) {
        for field in ["resourceVersion", "generation", "managedFields"] {
            metadata.remove(field);
        }
    }
    value
}

/// Everything that counts towards `metadata.generation`.
fn desired_content(value: &Value) -> Value {
    let mut value = value.clone();
    if let Some(object) = value.as_object_mut() {
        object.remove("metadata");
        object.remove("status");
    }
    value
}

fn finalizers_pending(value: &Value) -> bool {
    value["metadata"]["finalizers"]
        .as_array()
        .is_some_and(|finalizers| !finalizers.is_empty())
}

/// RFC 7386 JSON merge patch.
fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_fields) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target_fields) = target {
        for (key, value) in patch_fields {
            if value.is_null() {
                target_fields.remove(key);
            } else {
                merge_patch(
                    target_fields.entry(key.clone()).or_insert(Value::Null),
                    value,
                );
            }
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get<K: StoredObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> StoreResult<Option<K>> {
        let key = self.key_for::<K>(namespace, name)?;
        let mut state = self.lock();
        Self::begin::<K>(&mut state, Verb::Get, namespace, name)?;
        state.objects.get(&key).map(decode).transpose()
    }

    async fn list<K: StoredObject>(
        &self,
        namespace: Option<&str>,
        selector: &MatchLabels,
    ) -> StoreResult<Vec<K>> {
        let kind_key = KindRegistry::key_of::<K>();
        let namespaced = self.registry.lookup::<K>()?.is_namespaced();
        let mut state = self.lock();
        Self::begin::<K>(&mut state, Verb::List, namespace, "")?;

        let mut items = Vec::new();
        for ((kind, object_namespace, _), value) in &state.objects {
            if *kind != kind_key {
                continue;
            }
            if let (true, Some(namespace)) = (namespaced, namespace) {
                if object_namespace != namespace {
                    continue;
                }
            }
            let object: K = decode(value)?;
            if selector.matches(object.meta().labels.as_ref()) {
                items.push(object);
            }
        }
        Ok(items)
    }

    async fn create<K: StoredObject>(&self, object: &K) -> StoreResult<K> {
        let namespace = object.namespace();
        let name = object.name_any();
        let key = self.key_for::<K>(namespace.as_deref(), &name)?;
        let namespace_key = (
            KindRegistry::key_of::<Namespace>(),
            String::new(),
            key.1.clone(),
        );

        let mut state = self.lock();
        Self::begin::<K>(&mut state, Verb::Create, namespace.as_deref(), &name)?;

        if state.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: K::kind(&()).to_string(),
                name,
            });
        }
        if !key.1.is_empty() && !state.objects.contains_key(&namespace_key) {
            return Err(StoreError::NotFound {
                kind: "Namespace".to_string(),
                name: key.1,
            });
        }

        let mut value = serde_json::to_value(object)?;
        let version = state.next_version();
        if let Some(metadata) = value.get_mut("metadata").and_then(Value::as_object_mut) {
            metadata.remove("deletionTimestamp");
        }
        value["metadata"]["resourceVersion"] = json!(version);
        value["metadata"]["generation"] = json!(1);
        value["metadata"]["uid"] = json!(format!("uid-{version}"));
        value["metadata"]["creationTimestamp"] = json!(now());

        let created = decode(&value)?;
        state.objects.insert(key, value);
        Ok(created)
    }

    async fn update<K: StoredObject>(&self, object: &K) -> StoreResult<K> {
        let namespace = object.namespace();
        let name = object.name_any();
        let key = self.key_for::<K>(namespace.as_deref(), &name)?;

        let mut state = self.lock();
        Self::begin::<K>(&mut state, Verb::Update, namespace.as_deref(), &name)?;

        let existing = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Self::not_found::<K>(&name))?;
        let existing_version = existing["metadata"]["resourceVersion"].clone();
        if let Some(expected) = object.resource_version() {
            if existing_version.as_str() != Some(expected.as_str()) {
                return Err(StoreError::Conflict {
                    kind: K::kind(&()).to_string(),
                    name,
                    message: format!(
                        "resourceVersion {expected} is stale, current is {existing_version}"
                    ),
                });
            }
        }

        let mut value = serde_json::to_value(object)?;
        // Server-owned fields survive a full replace
        value["status"] = existing["status"].clone();
        if value["status"].is_null() {
            if let Some(fields) = value.as_object_mut() {
                fields.remove("status");
            }
        }
        for field in ["uid", "creationTimestamp", "deletionTimestamp"] {
            let preserved = existing["metadata"][field].clone();
            if let Some(metadata) = value["metadata"].as_object_mut() {
                if preserved.is_null() {
                    metadata.remove(field);
                } else {
                    metadata.insert(field.to_string(), preserved);
                }
            }
        }

        if without_bookkeeping(&value) == without_bookkeeping(&existing) {
            return decode(&existing);
        }

        let generation = existing["metadata"]["generation"].as_i64().unwrap_or(1);
        let generation = if desired_content(&value) == desired_content(&existing) {
            generation
        } else {
            generation + 1
        };
        value["metadata"]["generation"] = json!(generation);
        value["metadata"]["resourceVersion"] = json!(state.next_version());

        let updated = decode(&value)?;
        if !value["metadata"]["deletionTimestamp"].is_null() && !finalizers_pending(&value) {
            state.objects.remove(&key);
        } else {
            state.objects.insert(key, value);
        }
        Ok(updated)
    }

    async fn patch_status<K: StoredObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> StoreResult<()> {
        let key = self.key_for::<K>(namespace, name)?;
        let mut state = self.lock();
        Self::begin::<K>(&mut state, Verb::PatchStatus, namespace, name)?;

        let mut value = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Self::not_found::<K>(name))?;
        let before = value.clone();
        if let Some(status_patch) = patch.get("status") {
            merge_patch(&mut value["status"], status_patch);
        }
        if value != before {
            value["metadata"]["resourceVersion"] = json!(state.next_version());
            state.objects.insert(key, value);
        }
        Ok(())
    }

    async fn delete<K: StoredObject>(&self, namespace: Option<&str>, name: &str) -> StoreResult<()> {
        self.remove::<K>(namespace, name, &Preconditions::default())
    }

    async fn delete_exact<K: StoredObject>(&self, object: &K) -> StoreResult<()> {
        self.remove::<K>(
            object.namespace().as_deref(),
            &object.name_any(),
            &revision_of(object),
        )
    }
}

impl MemoryStore {
    fn remove<K: StoredObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
        preconditions: &Preconditions,
    ) -> StoreResult<()> {
        let key = self.key_for::<K>(namespace, name)?;
        let mut state = self.lock();
        Self::begin::<K>(&mut state, Verb::Delete, namespace, name)?;

        let mut value = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Self::not_found::<K>(name))?;
        let pinned = [
            ("uid", preconditions.uid.as_deref()),
            ("resourceVersion", preconditions.resource_version.as_deref()),
        ];
        for (field, expected) in pinned {
            let Some(expected) = expected else { continue };
            let actual = &value["metadata"][field];
            if actual.as_str() != Some(expected) {
                return Err(StoreError::Conflict {
                    kind: K::kind(&()).to_string(),
                    name: name.to_string(),
                    message: format!("precondition failed: {field} is {actual}, expected {expected}"),
                });
            }
        }
        if finalizers_pending(&value) {
            if value["metadata"]["deletionTimestamp"].is_null() {
                value["metadata"]["deletionTimestamp"] = json!(now());
                value["metadata"]["resourceVersion"] = json!(state.next_version());
                state.objects.insert(key, value);
            }
        } else {
            state.objects.remove(&key);
        }
        Ok(())
    }
}
