#![forbid(unsafe_code)]

use duplicator_core::{ObjectKey, SourceResource, StoreClient, Template, FINALIZER};
use duplicator_store::MemStore;

fn src(name: &str, host: &str) -> SourceResource {
    SourceResource {
        namespace: "default".into(),
        name: name.into(),
        template: Template { name: format!("{}-ing", name), spec: serde_json::json!({ "host": host }), ..Default::default() },
        target_namespace: "ns1".into(),
        ..Default::default()
    }
}

#[tokio::test]
async fn replay_basic_lifecycle() {
    let store = MemStore::with_namespaces(["ns1"]);
    let a = ObjectKey::new("default", "a");
    let b = ObjectKey::new("default", "b");

    // create a, b; finalize a; edit a twice; delete both
    let created = store.create_source(&src("a", "one")).await.unwrap();
    store.create_source(&src("b", "one")).await.unwrap();
    assert_eq!(created.resource_version.as_deref(), Some("1"));

    let mut a1 = created;
    a1.finalizers.push(FINALIZER.into());
    let a1 = store.update_source(&a1).await.unwrap();

    let mut a2 = a1.clone();
    a2.template.spec = serde_json::json!({ "host": "two" });
    let a2 = store.update_source(&a2).await.unwrap();
    let mut a3 = a2.clone();
    a3.template.spec = serde_json::json!({ "host": "three" });
    let a3 = store.update_source(&a3).await.unwrap();
    assert_eq!(a3.generation, Some(3));

    // Replaying an older write is rejected, the newer one stands.
    assert!(store.update_source(&a1).await.unwrap_err().is_conflict());
    assert_eq!(store.source(&a).unwrap().template.spec["host"], "three");

    store.delete_source(&b).await.unwrap();
    assert!(store.source(&b).is_none());

    store.delete_source(&a).await.unwrap();
    // Deleting again while pending is accepted and changes nothing.
    let rv = store.source(&a).unwrap().resource_version;
    store.delete_source(&a).await.unwrap();
    assert_eq!(store.source(&a).unwrap().resource_version, rv);

    let mut last = store.get_source(&a).await.unwrap();
    last.finalizers.clear();
    store.update_source(&last).await.unwrap();
    assert!(store.source(&a).is_none());
}
