//! `NamespaceClass` Custom Resource Definition

use k8s_openapi::api::networking::v1::NetworkPolicySpec;
use kube::CustomResource;
use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// `NamespaceClass` CRD describing the objects every member namespace must carry
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "core.resource-wrapper.io",
    version = "v1alpha1",
    kind = "NamespaceClass"
)]
#[kube(status = "NamespaceClassStatus")]
#[kube(printcolumn = r#"{"name":"Observed","type":"integer","jsonPath":".status.observedGeneration"}"#)]
#[kube(printcolumn = r#"{"name":"Applied","type":"date","jsonPath":".status.lastAppliedTime"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
pub struct NamespaceClassSpec {
    /// NetworkPolicy spec stamped into every member namespace
    #[serde(
        default,
        rename = "networkPolicyTemplate",
        skip_serializing_if = "Option::is_none"
    )]
    #[schemars(schema_with = "preserve_unknown_object")]
    pub network_policy_template: Option<NetworkPolicySpec>,

    /// ServiceAccount settings stamped into every member namespace
    #[serde(
        default,
        rename = "serviceAccountTemplate",
        skip_serializing_if = "Option::is_none"
    )]
    pub service_account_template: Option<ServiceAccountTemplate>,
}

/// Configuration applied to the generated `ServiceAccount`
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct ServiceAccountTemplate {
    /// Whether a service account token should be automatically mounted
    #[serde(
        default,
        rename = "automountServiceAccountToken",
        skip_serializing_if = "Option::is_none"
    )]
    pub automount_service_account_token: Option<bool>,
}

/// Status of the `NamespaceClass`
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct NamespaceClassStatus {
    /// Generation of the class most recently applied to every member namespace
    #[serde(default, rename = "observedGeneration")]
    pub observed_generation: i64,

    /// Timestamp of the last successful full pass (RFC3339)
    #[serde(
        default,
        rename = "lastAppliedTime",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_applied_time: Option<String>,
}

impl NamespaceClass {
    /// True when at least one template would produce a child object.
    pub fn has_templates(&self) -> bool {
        self.spec.network_policy_template.is_some() || self.spec.service_account_template.is_some()
    }

    pub fn observed_generation(&self) -> i64 {
        self.status
            .as_ref()
            .map_or(0, |status| status.observed_generation)
    }
}

/// The embedded NetworkPolicy schema is owned by the API server, so the CRD
/// only declares an object that keeps its fields.
fn preserve_unknown_object(_: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..SchemaObject::default()
    };
    schema
        .extensions
        .insert("x-kubernetes-preserve-unknown-fields".to_string(), json!(true));
    schema
        .extensions
        .insert("nullable".to_string(), json!(true));
    Schema::Object(schema)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::CustomResourceExt;
    use kube::Resource;

    #[test]
    fn test_spec_deserialization() {
        let yaml = r"
networkPolicyTemplate:
  podSelector: {}
  policyTypes: [Ingress]
serviceAccountTemplate:
  automountServiceAccountToken: false
";
        let spec: NamespaceClassSpec = serde_yaml::from_str(yaml).unwrap();

        let policy = spec.network_policy_template.unwrap();
        assert_eq!(policy.policy_types, Some(vec!["Ingress".to_string()]));
        assert_eq!(
            spec.service_account_template,
            Some(ServiceAccountTemplate {
                automount_service_account_token: Some(false)
            })
        );
    }

    #[test]
    fn test_empty_spec_has_no_templates() {
        let class = NamespaceClass::new("empty", NamespaceClassSpec::default());
        assert!(!class.has_templates());
        assert_eq!(class.observed_generation(), 0);

        let json = serde_json::to_value(&class.spec).unwrap();
        assert_eq!(json, json!({}));
    }

    #[test]
    fn test_crd_is_cluster_scoped_with_status() {
        let crd = NamespaceClass::crd();
        assert_eq!(crd.spec.scope, "Cluster");
        assert_eq!(NamespaceClass::kind(&()), "NamespaceClass");
        assert_eq!(
            NamespaceClass::api_version(&()),
            "core.resource-wrapper.io/v1alpha1"
        );

        let version = &crd.spec.versions[0];
        assert!(version
            .subresources
            .as_ref()
            .and_then(|s| s.status.as_ref())
            .is_some());
    }
}
