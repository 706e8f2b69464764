//! AppIngress custom resource and conversions to and from the core model.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use duplicator_core::{
    Condition, ConditionStatus, DerivedResource, ResourceKind, SourceResource, StoreError, StringMap, Template,
};
use k8s_openapi::api::networking::v1::{Ingress, IngressSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition as KubeCondition, ObjectMeta, Time};
use kube::{CustomResource, CustomResourceExt, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Identity metadata copied onto the produced Ingress.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct TemplateMeta {
    #[schemars(length(min = 1))]
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct IngressTemplate {
    pub metadata: TemplateMeta,
    #[serde(default)]
    pub spec: IngressSpec,
}

/// Request to keep an Ingress named `template.metadata.name` in `targetNamespace`.
#[derive(CustomResource, Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "ingress.example.com",
    version = "v1alpha1",
    kind = "AppIngress",
    namespaced,
    status = "AppIngressStatus",
    shortname = "aing",
    printcolumn = r#"{"name":"Target Namespace","type":"string","jsonPath":".spec.targetNamespace"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AppIngressSpec {
    pub template: IngressTemplate,
    #[schemars(length(min = 1))]
    pub target_namespace: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct AppIngressStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<KubeCondition>,
}

pub fn crd_yaml() -> Result<String> {
    serde_yaml::to_string(&AppIngress::crd()).context("serializing AppIngress CRD")
}

fn non_empty(m: &StringMap) -> Option<BTreeMap<String, String>> {
    if m.is_empty() { None } else { Some(m.clone()) }
}

pub fn to_kube_condition(c: &Condition) -> KubeCondition {
    KubeCondition {
        type_: c.type_.clone(),
        status: c.status.as_str().to_string(),
        reason: c.reason.clone(),
        message: c.message.clone(),
        last_transition_time: Time(c.last_transition_time),
        observed_generation: c.observed_generation,
    }
}

pub fn from_kube_condition(c: &KubeCondition) -> Condition {
    Condition {
        type_: c.type_.clone(),
        status: ConditionStatus::parse(&c.status),
        reason: c.reason.clone(),
        message: c.message.clone(),
        last_transition_time: c.last_transition_time.0,
        observed_generation: c.observed_generation,
    }
}

pub fn to_source(obj: &AppIngress) -> Result<SourceResource, StoreError> {
    let name = obj.name_any();
    let namespace = obj
        .namespace()
        .ok_or_else(|| StoreError::invalid(ResourceKind::Source, &name, "object has no namespace"))?;
    let spec = serde_json::to_value(&obj.spec.template.spec)
        .map_err(|e| StoreError::invalid(ResourceKind::Source, format!("{}/{}", namespace, name), e.to_string()))?;
    let t = &obj.spec.template.metadata;
    Ok(SourceResource {
        namespace,
        name,
        resource_version: obj.metadata.resource_version.clone(),
        generation: obj.metadata.generation,
        template: Template {
            name: t.name.clone(),
            labels: t.labels.clone(),
            annotations: t.annotations.clone(),
            spec,
        },
        target_namespace: obj.spec.target_namespace.clone(),
        deletion_requested: obj.metadata.deletion_timestamp.is_some(),
        finalizers: obj.finalizers().to_vec(),
        conditions: obj
            .status
            .as_ref()
            .map(|s| s.conditions.iter().map(from_kube_condition).collect())
            .unwrap_or_default(),
    })
}

pub fn from_source(src: &SourceResource) -> Result<AppIngress, StoreError> {
    let spec: IngressSpec = serde_json::from_value(src.template.spec.clone())
        .map_err(|e| StoreError::invalid(ResourceKind::Source, src.key(), format!("template spec: {}", e)))?;
    let mut obj = AppIngress::new(
        &src.name,
        AppIngressSpec {
            template: IngressTemplate {
                metadata: TemplateMeta {
                    name: src.template.name.clone(),
                    labels: src.template.labels.clone(),
                    annotations: src.template.annotations.clone(),
                },
                spec,
            },
            target_namespace: src.target_namespace.clone(),
        },
    );
    obj.metadata.namespace = Some(src.namespace.clone());
    obj.metadata.resource_version = src.resource_version.clone();
    if !src.finalizers.is_empty() {
        obj.metadata.finalizers = Some(src.finalizers.clone());
    }
    if !src.conditions.is_empty() {
        obj.status = Some(AppIngressStatus { conditions: src.conditions.iter().map(to_kube_condition).collect() });
    }
    Ok(obj)
}

/// Parse the opaque payload into an IngressSpec at the store boundary.
pub fn ingress_spec(d: &DerivedResource) -> Result<IngressSpec, StoreError> {
    serde_json::from_value(d.spec.clone())
        .map_err(|e| StoreError::invalid(ResourceKind::Derived, d.key(), format!("spec is not an IngressSpec: {}", e)))
}

pub fn to_ingress(d: &DerivedResource) -> Result<Ingress, StoreError> {
    Ok(Ingress {
        metadata: ObjectMeta {
            name: Some(d.name.clone()),
            namespace: Some(d.namespace.clone()),
            labels: non_empty(&d.labels),
            annotations: non_empty(&d.annotations),
            resource_version: d.resource_version.clone(),
            ..Default::default()
        },
        spec: Some(ingress_spec(d)?),
        status: None,
    })
}

pub fn from_ingress(ing: &Ingress) -> Result<DerivedResource, StoreError> {
    let name = ing.name_any();
    let namespace = ing.namespace().unwrap_or_default();
    let spec = serde_json::to_value(ing.spec.clone().unwrap_or_default())
        .map_err(|e| StoreError::invalid(ResourceKind::Derived, format!("{}/{}", namespace, name), e.to_string()))?;
    Ok(DerivedResource {
        namespace,
        name,
        resource_version: ing.metadata.resource_version.clone(),
        labels: ing.labels().clone(),
        annotations: ing.annotations().clone(),
        spec,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use k8s_openapi::api::networking::v1::IngressRule;

    fn sample() -> AppIngress {
        let mut obj = AppIngress::new(
            "s1",
            AppIngressSpec {
                template: IngressTemplate {
                    metadata: TemplateMeta {
                        name: "ing1".into(),
                        labels: [("app".to_string(), "web".to_string())].into_iter().collect(),
                        annotations: BTreeMap::new(),
                    },
                    spec: IngressSpec {
                        rules: Some(vec![IngressRule { host: Some("example.com".into()), http: None }]),
                        ..Default::default()
                    },
                },
                target_namespace: "ns1".into(),
            },
        );
        obj.metadata.namespace = Some("default".into());
        obj.metadata.resource_version = Some("42".into());
        obj.metadata.generation = Some(3);
        obj
    }

    #[test]
    fn source_carries_identity_token_and_payload() {
        let src = to_source(&sample()).unwrap();
        assert_eq!(src.key().to_string(), "default/s1");
        assert_eq!(src.derived_key().to_string(), "ns1/ing1");
        assert_eq!(src.resource_version.as_deref(), Some("42"));
        assert_eq!(src.generation, Some(3));
        assert!(!src.deletion_requested);
        assert_eq!(src.template.spec["rules"][0]["host"], "example.com");
    }

    #[test]
    fn source_without_namespace_is_invalid() {
        let mut obj = sample();
        obj.metadata.namespace = None;
        assert!(matches!(to_source(&obj), Err(StoreError::Invalid { .. })));
    }

    #[test]
    fn derived_ingress_matches_template_after_store_round() {
        let src = to_source(&sample()).unwrap();
        let ing = to_ingress(&src.desired_derived()).unwrap();
        assert_eq!(ing.metadata.namespace.as_deref(), Some("ns1"));
        assert_eq!(ing.spec.as_ref().and_then(|s| s.rules.as_ref()).map(|r| r.len()), Some(1));
        // What comes back from the server must compare equal, or every pass would rewrite it.
        assert!(from_ingress(&ing).unwrap().matches_template(&src.template));
    }

    #[test]
    fn malformed_payload_is_rejected_at_the_boundary() {
        let mut d = to_source(&sample()).unwrap().desired_derived();
        d.spec = serde_json::json!({ "rules": "not-a-list" });
        assert!(matches!(to_ingress(&d), Err(StoreError::Invalid { kind: ResourceKind::Derived, .. })));
    }

    #[test]
    fn conditions_keep_their_fields() {
        let c = Condition {
            type_: "NamespaceValid".into(),
            status: ConditionStatus::False,
            reason: "NotFound".into(),
            message: "Target namespace does not exist".into(),
            last_transition_time: Utc.timestamp_opt(1_700_000_000, 0).single().unwrap(),
            observed_generation: Some(2),
        };
        let k = to_kube_condition(&c);
        assert_eq!(k.status, "False");
        assert_eq!(from_kube_condition(&k), c);
    }

    #[test]
    fn crd_has_printer_columns_and_status() {
        let yaml = crd_yaml().unwrap();
        assert!(yaml.contains("ingress.example.com"));
        assert!(yaml.contains("Target Namespace"));
        assert!(yaml.contains("appingresses"));
        assert!(yaml.contains("status"));

        let crd = serde_json::to_value(AppIngress::crd()).unwrap();
        let props = &crd["spec"]["versions"][0]["schema"]["openAPIV3Schema"]["properties"]["spec"]["properties"];
        assert_eq!(props["targetNamespace"]["minLength"], 1);
        assert_eq!(props["template"]["properties"]["metadata"]["properties"]["name"]["minLength"], 1);
    }
}
