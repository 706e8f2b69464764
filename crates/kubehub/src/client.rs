//! Store client backed by the Kubernetes API server.

use duplicator_core::{
    DerivedResource, ObjectKey, ResourceKind, SourceResource, StoreClient, StoreError,
};
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use tracing::debug;

use crate::crd::{from_ingress, from_source, ingress_spec, to_ingress, to_kube_condition, to_source, AppIngress};

/// Map kube errors onto the store taxonomy. Anything that is not an API status
/// (transport, timeout, stream) has an unknown outcome and is treated as transient.
pub fn map_kube_err(kind: ResourceKind, key: &ObjectKey, err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(resp) => match resp.code {
            404 => StoreError::not_found(kind, key),
            409 if resp.reason == "AlreadyExists" => StoreError::already_exists(kind, key),
            409 => StoreError::conflict(kind, key, resp.message),
            400 | 422 => StoreError::invalid(kind, key, resp.message),
            429 | 500..=599 => StoreError::Transient(format!("{} ({}): {}", resp.reason, resp.code, resp.message)),
            code => StoreError::Api { code, message: resp.message },
        },
        other => StoreError::Transient(other.to_string()),
    }
}

/// An empty name turns a single-object request into a collection request
/// (`DELETE .../ingresses/` is deletecollection), so refuse it client-side.
fn require_name(kind: ResourceKind, key: &ObjectKey) -> Result<(), StoreError> {
    if key.name.is_empty() || key.namespace.is_empty() {
        return Err(StoreError::invalid(kind, key, "name and namespace must not be empty"));
    }
    Ok(())
}

#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn sources(&self, ns: &str) -> Api<AppIngress> {
        Api::namespaced(self.client.clone(), ns)
    }

    fn ingresses(&self, ns: &str) -> Api<Ingress> {
        Api::namespaced(self.client.clone(), ns)
    }
}

/// Merge-patch body carrying `resourceVersion` as a precondition when known.
fn with_precondition(mut body: serde_json::Value, rv: &Option<String>) -> serde_json::Value {
    if let Some(rv) = rv {
        body["metadata"]["resourceVersion"] = json!(rv);
    }
    body
}

#[async_trait::async_trait]
impl StoreClient for KubeStore {
    async fn get_source(&self, key: &ObjectKey) -> Result<SourceResource, StoreError> {
        require_name(ResourceKind::Source, key)?;
        let obj = self
            .sources(&key.namespace)
            .get(&key.name)
            .await
            .map_err(|e| map_kube_err(ResourceKind::Source, key, e))?;
        to_source(&obj)
    }

    async fn create_source(&self, obj: &SourceResource) -> Result<SourceResource, StoreError> {
        let key = obj.key();
        let mut body = from_source(obj)?;
        body.metadata.resource_version = None;
        let created = self
            .sources(&key.namespace)
            .create(&PostParams::default(), &body)
            .await
            .map_err(|e| map_kube_err(ResourceKind::Source, &key, e))?;
        to_source(&created)
    }

    async fn update_source(&self, obj: &SourceResource) -> Result<SourceResource, StoreError> {
        let key = obj.key();
        let patch = with_precondition(json!({ "metadata": { "finalizers": obj.finalizers } }), &obj.resource_version);
        debug!(key = %key, finalizers = ?obj.finalizers, "patching AppIngress finalizers");
        let updated = self
            .sources(&key.namespace)
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_kube_err(ResourceKind::Source, &key, e))?;
        to_source(&updated)
    }

    async fn update_source_status(&self, obj: &SourceResource) -> Result<SourceResource, StoreError> {
        let key = obj.key();
        let conditions: Vec<_> = obj.conditions.iter().map(to_kube_condition).collect();
        let patch = with_precondition(json!({ "status": { "conditions": conditions } }), &obj.resource_version);
        debug!(key = %key, count = conditions.len(), "patching AppIngress status");
        let updated = self
            .sources(&key.namespace)
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_kube_err(ResourceKind::Source, &key, e))?;
        to_source(&updated)
    }

    async fn delete_source(&self, key: &ObjectKey) -> Result<(), StoreError> {
        require_name(ResourceKind::Source, key)?;
        self.sources(&key.namespace)
            .delete(&key.name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| map_kube_err(ResourceKind::Source, key, e))
    }

    async fn get_derived(&self, key: &ObjectKey) -> Result<DerivedResource, StoreError> {
        require_name(ResourceKind::Derived, key)?;
        let ing = self
            .ingresses(&key.namespace)
            .get(&key.name)
            .await
            .map_err(|e| map_kube_err(ResourceKind::Derived, key, e))?;
        from_ingress(&ing)
    }

    async fn create_derived(&self, obj: &DerivedResource) -> Result<DerivedResource, StoreError> {
        let key = obj.key();
        let mut body = to_ingress(obj)?;
        body.metadata.resource_version = None;
        debug!(key = %key, "creating Ingress");
        let created = self
            .ingresses(&key.namespace)
            .create(&PostParams::default(), &body)
            .await
            .map_err(|e| map_kube_err(ResourceKind::Derived, &key, e))?;
        from_ingress(&created)
    }

    async fn update_derived(&self, obj: &DerivedResource) -> Result<DerivedResource, StoreError> {
        let key = obj.key();
        require_name(ResourceKind::Derived, &key)?;
        let api = self.ingresses(&key.namespace);
        let mut live = api.get(&key.name).await.map_err(|e| map_kube_err(ResourceKind::Derived, &key, e))?;
        if obj.resource_version.is_some() && live.metadata.resource_version != obj.resource_version {
            return Err(StoreError::conflict(
                ResourceKind::Derived,
                &key,
                "Ingress changed since it was read",
            ));
        }
        // Overwrite only what the template owns; other metadata on the live object survives.
        live.metadata.labels = Some(obj.labels.clone());
        live.metadata.annotations = Some(obj.annotations.clone());
        live.spec = Some(ingress_spec(obj)?);
        debug!(key = %key, "replacing Ingress");
        let updated = api
            .replace(&key.name, &PostParams::default(), &live)
            .await
            .map_err(|e| map_kube_err(ResourceKind::Derived, &key, e))?;
        from_ingress(&updated)
    }

    async fn delete_derived(&self, key: &ObjectKey) -> Result<(), StoreError> {
        require_name(ResourceKind::Derived, key)?;
        debug!(key = %key, "deleting Ingress");
        self.ingresses(&key.namespace)
            .delete(&key.name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| map_kube_err(ResourceKind::Derived, key, e))
    }

    async fn namespace_exists(&self, name: &str) -> Result<bool, StoreError> {
        if name.is_empty() {
            return Ok(false);
        }
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.get_opt(name)
            .await
            .map(|ns| ns.is_some())
            .map_err(|e| map_kube_err(ResourceKind::Namespace, &ObjectKey::new("", name), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_err(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: format!("{} happened", reason),
            reason: reason.into(),
            code,
        })
    }

    fn key() -> ObjectKey {
        ObjectKey::new("ns1", "ing1")
    }

    #[test]
    fn status_codes_map_onto_taxonomy() {
        let k = key();
        assert!(map_kube_err(ResourceKind::Derived, &k, api_err(404, "NotFound")).is_not_found());
        assert!(map_kube_err(ResourceKind::Source, &k, api_err(409, "Conflict")).is_conflict());
        assert!(matches!(
            map_kube_err(ResourceKind::Derived, &k, api_err(409, "AlreadyExists")),
            StoreError::AlreadyExists { .. }
        ));
        assert!(matches!(
            map_kube_err(ResourceKind::Derived, &k, api_err(422, "Invalid")),
            StoreError::Invalid { .. }
        ));
        assert!(matches!(map_kube_err(ResourceKind::Derived, &k, api_err(503, "ServiceUnavailable")), StoreError::Transient(_)));
        assert_eq!(
            map_kube_err(ResourceKind::Derived, &k, api_err(403, "Forbidden")),
            StoreError::Api { code: 403, message: "Forbidden happened".into() }
        );
    }

    #[test]
    fn empty_identity_is_refused() {
        assert!(require_name(ResourceKind::Derived, &key()).is_ok());
        assert!(matches!(
            require_name(ResourceKind::Derived, &ObjectKey::new("ns1", "")),
            Err(StoreError::Invalid { .. })
        ));
        assert!(require_name(ResourceKind::Source, &ObjectKey::new("", "s1")).is_err());
    }

    #[tokio::test]
    async fn empty_ingress_name_never_reaches_the_apiserver() {
        // Nothing listens here; a request that got through would fail as Transient.
        let cfg = kube::Config::new("http://127.0.0.1:9".parse().unwrap());
        let store = KubeStore::new(Client::try_from(cfg).unwrap());
        let empty = ObjectKey::new("ns1", "");
        assert!(matches!(store.delete_derived(&empty).await, Err(StoreError::Invalid { .. })));
        assert!(matches!(store.get_derived(&empty).await, Err(StoreError::Invalid { .. })));
    }

    #[test]
    fn precondition_is_added_only_when_known() {
        let with = with_precondition(json!({ "metadata": { "finalizers": [] } }), &Some("7".into()));
        assert_eq!(with["metadata"]["resourceVersion"], "7");
        assert_eq!(with["metadata"]["finalizers"], json!([]));

        let without = with_precondition(json!({ "status": {} }), &None);
        assert!(without.get("metadata").is_none());
    }
}
