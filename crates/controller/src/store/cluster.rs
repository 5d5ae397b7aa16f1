//! [`ObjectStore`] backed by the Kubernetes API server

use super::{
    revision_of, KindRegistry, MatchLabels, ObjectStore, StoreError, StoreResult, StoredObject,
};
use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, TypeMeta};
use kube::{Client, ResourceExt};
use tracing::debug;

#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    registry: KindRegistry,
}

impl KubeStore {
    pub fn new(client: Client, registry: KindRegistry) -> Self {
        Self { client, registry }
    }

    fn api<K: StoredObject>(
        &self,
        namespace: Option<&str>,
    ) -> StoreResult<(Api<DynamicObject>, ApiResource)> {
        let registered = self.registry.lookup::<K>()?;
        let resource = registered.resource.clone();
        let api = match namespace {
            Some(ns) if registered.is_namespaced() => {
                Api::namespaced_with(self.client.clone(), ns, &resource)
            }
            _ => Api::all_with(self.client.clone(), &resource),
        };
        Ok((api, resource))
    }
}

fn to_dynamic<K: StoredObject>(object: &K) -> StoreResult<DynamicObject> {
    Ok(serde_json::from_value(serde_json::to_value(object)?)?)
}

fn from_dynamic<K: StoredObject>(
    mut object: DynamicObject,
    resource: &ApiResource,
) -> StoreResult<K> {
    // List items come back without apiVersion/kind
    object.types.get_or_insert_with(|| TypeMeta {
        api_version: resource.api_version.clone(),
        kind: resource.kind.clone(),
    });
    Ok(serde_json::from_value(serde_json::to_value(object)?)?)
}

/// Map API server status codes onto the store's error taxonomy.
fn classify(err: kube::Error, resource: &ApiResource, name: &str) -> StoreError {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound {
            kind: resource.kind.clone(),
            name: name.to_string(),
        },
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            StoreError::AlreadyExists {
                kind: resource.kind.clone(),
                name: name.to_string(),
            }
        }
        kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict {
            kind: resource.kind.clone(),
            name: name.to_string(),
            message: ae.message,
        },
        other => StoreError::Kube(other),
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get<K: StoredObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> StoreResult<Option<K>> {
        let (api, resource) = self.api::<K>(namespace)?;
        match api.get_opt(name).await {
            Ok(Some(object)) => Ok(Some(from_dynamic(object, &resource)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(classify(e, &resource, name)),
        }
    }

    async fn list<K: StoredObject>(
        &self,
        namespace: Option<&str>,
        selector: &MatchLabels,
    ) -> StoreResult<Vec<K>> {
        let (api, resource) = self.api::<K>(namespace)?;
        let params = ListParams::default().labels(&selector.to_query());
        let list = api
            .list(&params)
            .await
            .map_err(|e| classify(e, &resource, ""))?;
        debug!(
            kind = %resource.kind,
            selector = %selector.to_query(),
            count = list.items.len(),
            "Listed objects"
        );
        list.items
            .into_iter()
            .map(|object| from_dynamic(object, &resource))
            .collect()
    }

    async fn create<K: StoredObject>(&self, object: &K) -> StoreResult<K> {
        let (api, resource) = self.api::<K>(object.namespace().as_deref())?;
        let name = object.name_any();
        let created = api
            .create(&PostParams::default(), &to_dynamic(object)?)
            .await
            .map_err(|e| classify(e, &resource, &name))?;
        from_dynamic(created, &resource)
    }

    async fn update<K: StoredObject>(&self, object: &K) -> StoreResult<K> {
        let (api, resource) = self.api::<K>(object.namespace().as_deref())?;
        let name = object.name_any();
        // replace() carries metadata.resourceVersion, so a stale read yields 409
        let replaced = api
            .replace(&name, &PostParams::default(), &to_dynamic(object)?)
            .await
            .map_err(|e| classify(e, &resource, &name))?;
        from_dynamic(replaced, &resource)
    }

    async fn patch_status<K: StoredObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &serde_json::Value,
    ) -> StoreResult<()> {
        let (api, resource) = self.api::<K>(namespace)?;
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| classify(e, &resource, name))?;
        Ok(())
    }

    async fn delete<K: StoredObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> StoreResult<()> {
        let (api, resource) = self.api::<K>(namespace)?;
        api.delete(name, &DeleteParams::default())
            .await
            .map_err(|e| classify(e, &resource, name))?;
        Ok(())
    }

    async fn delete_exact<K: StoredObject>(&self, object: &K) -> StoreResult<()> {
        let (api, resource) = self.api::<K>(object.namespace().as_deref())?;
        let name = object.name_any();
        let params = DeleteParams {
            preconditions: Some(revision_of(object)),
            ..DeleteParams::default()
        };
        // A failed precondition comes back as 409
        api.delete(&name, &params)
            .await
            .map_err(|e| classify(e, &resource, &name))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{reason} from server"),
            reason: reason.to_string(),
            code,
        })
    }

    fn policy_resource() -> ApiResource {
        ApiResource::erase::<k8s_openapi::api::networking::v1::NetworkPolicy>(&())
    }

    #[test]
    fn classifies_api_status_codes() {
        let resource = policy_resource();

        assert!(classify(api_error(404, "NotFound"), &resource, "p").is_not_found());
        assert!(matches!(
            classify(api_error(409, "AlreadyExists"), &resource, "p"),
            StoreError::AlreadyExists { .. }
        ));
        assert!(classify(api_error(409, "Conflict"), &resource, "p").is_conflict());
        assert!(matches!(
            classify(api_error(500, "InternalError"), &resource, "p"),
            StoreError::Kube(_)
        ));
    }

    #[test]
    fn list_items_regain_type_meta() {
        let resource = policy_resource();
        let object: DynamicObject = serde_json::from_value(serde_json::json!({
            "metadata": { "name": "admin-network-policy", "namespace": "team-a" },
            "spec": { "podSelector": {} }
        }))
        .unwrap();

        let policy: k8s_openapi::api::networking::v1::NetworkPolicy =
            from_dynamic(object, &resource).unwrap();
        assert_eq!(policy.metadata.namespace.as_deref(), Some("team-a"));
        assert!(policy.spec.is_some());
    }
}
