//! Ingress duplicator core types: the source/derived data model, status
//! conditions, finalizer helpers and the store contract the engine consumes.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub mod conditions;
pub mod error;
pub mod finalizers;
pub mod store;

pub use conditions::{find_condition, set_condition, Condition, ConditionStatus, ConditionUpdate};
pub use error::{ResourceKind, StoreError};
pub use finalizers::{add_finalizer, has_finalizer, remove_finalizer, Finalizable};
pub use store::{Clock, StoreClient, SystemClock};

/// Marker placed on every source resource the engine has started managing.
pub const FINALIZER: &str = "ingress.example.com/cleanup";

pub const CONDITION_NAMESPACE_VALID: &str = "NamespaceValid";
pub const CONDITION_INGRESS_CREATED: &str = "IngressCreated";

pub mod reasons {
    pub const VALID: &str = "Valid";
    pub const NOT_FOUND: &str = "NotFound";
    pub const CREATED: &str = "Created";
    pub const ERROR: &str = "Error";
}

/// Label/annotation map. Ordered so equality and serialization are stable.
pub type StringMap = BTreeMap<String, String>;

/// Namespaced identity of an object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Identity metadata plus the opaque payload the derived resource is built from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    #[serde(default)]
    pub labels: StringMap,
    #[serde(default)]
    pub annotations: StringMap,
    /// Never interpreted here, only copied.
    #[serde(default)]
    pub spec: serde_json::Value,
}

/// The duplication request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceResource {
    pub namespace: String,
    pub name: String,
    /// Optimistic-concurrency token assigned by the store.
    #[serde(default)]
    pub resource_version: Option<String>,
    #[serde(default)]
    pub generation: Option<i64>,
    pub template: Template,
    pub target_namespace: String,
    #[serde(default)]
    pub deletion_requested: bool,
    #[serde(default)]
    pub finalizers: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl SourceResource {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }

    /// Where the derived resource lives: template name inside the target namespace.
    pub fn derived_key(&self) -> ObjectKey {
        ObjectKey::new(&self.target_namespace, &self.template.name)
    }

    /// Fresh derived resource (no resourceVersion) projected from the template.
    pub fn desired_derived(&self) -> DerivedResource {
        let mut d = DerivedResource {
            namespace: self.target_namespace.clone(),
            name: self.template.name.clone(),
            ..Default::default()
        };
        d.overwrite_from(&self.template);
        d
    }
}

/// The produced artifact. No back-reference to its source is recorded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedResource {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub resource_version: Option<String>,
    #[serde(default)]
    pub labels: StringMap,
    #[serde(default)]
    pub annotations: StringMap,
    #[serde(default)]
    pub spec: serde_json::Value,
}

impl DerivedResource {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }

    pub fn matches_template(&self, t: &Template) -> bool {
        self.labels == t.labels && self.annotations == t.annotations && self.spec == t.spec
    }

    /// Full overwrite of labels, annotations and spec. Identity and token are kept.
    pub fn overwrite_from(&mut self, t: &Template) {
        self.labels = t.labels.clone();
        self.annotations = t.annotations.clone();
        self.spec = t.spec.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> SourceResource {
        SourceResource {
            namespace: "default".into(),
            name: "s1".into(),
            template: Template {
                name: "ing1".into(),
                labels: [("app".to_string(), "web".to_string())].into_iter().collect(),
                annotations: StringMap::new(),
                spec: serde_json::json!({"host": "example.com"}),
            },
            target_namespace: "ns1".into(),
            ..Default::default()
        }
    }

    #[test]
    fn derived_identity_comes_from_template_and_target() {
        let s = source();
        assert_eq!(s.derived_key(), ObjectKey::new("ns1", "ing1"));
        let d = s.desired_derived();
        assert_eq!(d.key(), s.derived_key());
        assert!(d.resource_version.is_none());
        assert!(d.matches_template(&s.template));
    }

    #[test]
    fn overwrite_drops_stale_labels() {
        let s = source();
        let mut d = s.desired_derived();
        d.labels.insert("stale".into(), "yes".into());
        d.resource_version = Some("7".into());
        assert!(!d.matches_template(&s.template));
        d.overwrite_from(&s.template);
        assert!(d.matches_template(&s.template));
        assert_eq!(d.resource_version.as_deref(), Some("7"));
    }

    #[test]
    fn key_display() {
        assert_eq!(ObjectKey::new("a", "b").to_string(), "a/b");
    }
}
