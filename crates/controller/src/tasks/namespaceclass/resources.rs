//! Desired child objects for a class and a member namespace
//!
//! Everything here is pure: the same class, namespace and names always give
//! the same objects, and the results never share data with the class.

use crate::crds::NamespaceClass;
use crate::store::StoredObject;
use crate::tasks::config::ChildrenConfig;
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::networking::v1::NetworkPolicy;
use kube::api::ObjectMeta;
use std::collections::BTreeMap;

/// A generated object whose class-owned fields can be copied onto the live copy
pub trait ChildResource: StoredObject {
    /// Overwrite the fields the class controls on `existing`.
    fn copy_desired_into(&self, existing: &mut Self);
}

impl ChildResource for NetworkPolicy {
    fn copy_desired_into(&self, existing: &mut Self) {
        existing.spec.clone_from(&self.spec);
    }
}

impl ChildResource for ServiceAccount {
    fn copy_desired_into(&self, existing: &mut Self) {
        existing.automount_service_account_token = self.automount_service_account_token;
    }
}

/// Children a member namespace should carry. `None` means the class has no
/// template for that kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DesiredChildren {
    pub network_policy: Option<NetworkPolicy>,
    pub service_account: Option<ServiceAccount>,
}

impl DesiredChildren {
    pub fn is_empty(&self) -> bool {
        self.network_policy.is_none() && self.service_account.is_none()
    }
}

fn child_meta(name: &str, namespace: &str, labels: &BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(labels.clone()),
        ..ObjectMeta::default()
    }
}

pub fn desired_network_policy(
    class: &NamespaceClass,
    namespace: &str,
    name: &str,
    labels: &BTreeMap<String, String>,
) -> Option<NetworkPolicy> {
    let template = class.spec.network_policy_template.as_ref()?;
    Some(NetworkPolicy {
        metadata: child_meta(name, namespace, labels),
        spec: Some(template.clone()),
        ..NetworkPolicy::default()
    })
}

pub fn desired_service_account(
    class: &NamespaceClass,
    namespace: &str,
    name: &str,
    labels: &BTreeMap<String, String>,
) -> Option<ServiceAccount> {
    let template = class.spec.service_account_template.as_ref()?;
    Some(ServiceAccount {
        metadata: child_meta(name, namespace, labels),
        automount_service_account_token: template.automount_service_account_token,
        ..ServiceAccount::default()
    })
}

/// Desired children of `class` in `namespace`, each carrying `labels`.
pub fn synthesize(
    class: &NamespaceClass,
    namespace: &str,
    names: &ChildrenConfig,
    labels: &BTreeMap<String, String>,
) -> DesiredChildren {
    DesiredChildren {
        network_policy: desired_network_policy(
            class,
            namespace,
            &names.network_policy_name,
            labels,
        ),
        service_account: desired_service_account(
            class,
            namespace,
            &names.service_account_name,
            labels,
        ),
    }
}
