//! In-RAM store client.
//!
//! Behaves like the API server where the engine can observe it: every write bumps
//! a resourceVersion, stale tokens are rejected, and deleting a source that still
//! carries finalizers only marks it until the last finalizer is removed.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use duplicator_core::{
    DerivedResource, ObjectKey, ResourceKind, SourceResource, StoreClient, StoreError,
};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

/// Store operations, used to target injected faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    GetSource,
    CreateSource,
    UpdateSource,
    UpdateSourceStatus,
    DeleteSource,
    GetDerived,
    CreateDerived,
    UpdateDerived,
    DeleteDerived,
    NamespaceExists,
}

#[derive(Default)]
struct Inner {
    sources: FxHashMap<ObjectKey, SourceResource>,
    derived: FxHashMap<ObjectKey, DerivedResource>,
    namespaces: FxHashSet<String>,
    revision: u64,
    writes: u64,
    faults: FxHashMap<Op, VecDeque<StoreError>>,
}

impl Inner {
    fn next_rv(&mut self) -> String {
        self.revision += 1;
        self.writes += 1;
        self.revision.to_string()
    }

    fn take_fault(&mut self, op: Op) -> Result<(), StoreError> {
        match self.faults.get_mut(&op).and_then(|q| q.pop_front()) {
            Some(e) => {
                debug!(?op, error = %e, "injected fault");
                Err(e)
            }
            None => Ok(()),
        }
    }
}

fn check_rv(kind: ResourceKind, key: &ObjectKey, stored: &Option<String>, given: &Option<String>) -> Result<(), StoreError> {
    match given {
        // No precondition: last write wins, like a merge patch without resourceVersion.
        None => Ok(()),
        Some(rv) if Some(rv) == stored.as_ref() => Ok(()),
        Some(rv) => {
            metrics::counter!("store_conflicts_total", 1u64);
            Err(StoreError::conflict(
                kind,
                key,
                format!("resourceVersion {} is stale (current {})", rv, stored.as_deref().unwrap_or("-")),
            ))
        }
    }
}

#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_namespaces<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let store = Self::new();
        for n in names {
            store.add_namespace(n);
        }
        store
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_namespace(&self, name: impl Into<String>) {
        self.lock().namespaces.insert(name.into());
    }

    pub fn remove_namespace(&self, name: &str) {
        self.lock().namespaces.remove(name);
    }

    /// Make the next call of `op` fail with `err`. Faults queue up per operation.
    pub fn fail_next(&self, op: Op, err: StoreError) {
        self.lock().faults.entry(op).or_default().push_back(err);
    }

    /// Peek without going through the client contract (no faults, no errors).
    pub fn source(&self, key: &ObjectKey) -> Option<SourceResource> {
        self.lock().sources.get(key).cloned()
    }

    pub fn derived(&self, key: &ObjectKey) -> Option<DerivedResource> {
        self.lock().derived.get(key).cloned()
    }

    pub fn derived_len(&self) -> usize {
        self.lock().derived.len()
    }

    /// Number of successful mutating calls so far.
    pub fn writes(&self) -> u64 {
        self.lock().writes
    }
}

#[async_trait::async_trait]
impl StoreClient for MemStore {
    async fn get_source(&self, key: &ObjectKey) -> Result<SourceResource, StoreError> {
        let mut g = self.lock();
        g.take_fault(Op::GetSource)?;
        g.sources.get(key).cloned().ok_or_else(|| StoreError::not_found(ResourceKind::Source, key))
    }

    async fn create_source(&self, obj: &SourceResource) -> Result<SourceResource, StoreError> {
        let mut g = self.lock();
        g.take_fault(Op::CreateSource)?;
        let key = obj.key();
        if g.sources.contains_key(&key) {
            return Err(StoreError::already_exists(ResourceKind::Source, &key));
        }
        let mut stored = obj.clone();
        stored.resource_version = Some(g.next_rv());
        stored.generation = Some(1);
        stored.deletion_requested = false;
        // Status is not writable on create.
        stored.conditions.clear();
        g.sources.insert(key, stored.clone());
        Ok(stored)
    }

    async fn update_source(&self, obj: &SourceResource) -> Result<SourceResource, StoreError> {
        let mut g = self.lock();
        g.take_fault(Op::UpdateSource)?;
        let key = obj.key();
        let current = g.sources.get(&key).cloned().ok_or_else(|| StoreError::not_found(ResourceKind::Source, &key))?;
        check_rv(ResourceKind::Source, &key, &current.resource_version, &obj.resource_version)?;
        if current.deletion_requested && obj.finalizers.iter().any(|f| !current.finalizers.contains(f)) {
            return Err(StoreError::invalid(
                ResourceKind::Source,
                &key,
                "no new finalizers can be added if the object is being deleted",
            ));
        }
        let mut next = current.clone();
        next.finalizers = obj.finalizers.clone();
        if next.template != obj.template || next.target_namespace != obj.target_namespace {
            next.template = obj.template.clone();
            next.target_namespace = obj.target_namespace.clone();
            next.generation = Some(current.generation.unwrap_or(0) + 1);
        }
        next.resource_version = Some(g.next_rv());
        if next.deletion_requested && next.finalizers.is_empty() {
            debug!(key = %key, "last finalizer removed; deleting source");
            g.sources.remove(&key);
        } else {
            g.sources.insert(key, next.clone());
        }
        Ok(next)
    }

    async fn update_source_status(&self, obj: &SourceResource) -> Result<SourceResource, StoreError> {
        let mut g = self.lock();
        g.take_fault(Op::UpdateSourceStatus)?;
        let key = obj.key();
        let current = g.sources.get(&key).cloned().ok_or_else(|| StoreError::not_found(ResourceKind::Source, &key))?;
        check_rv(ResourceKind::Source, &key, &current.resource_version, &obj.resource_version)?;
        let mut next = current;
        next.conditions = obj.conditions.clone();
        next.resource_version = Some(g.next_rv());
        g.sources.insert(key, next.clone());
        Ok(next)
    }

    async fn delete_source(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let mut g = self.lock();
        g.take_fault(Op::DeleteSource)?;
        let current = g.sources.get(key).cloned().ok_or_else(|| StoreError::not_found(ResourceKind::Source, key))?;
        if current.finalizers.is_empty() {
            g.sources.remove(key);
            g.writes += 1;
        } else if !current.deletion_requested {
            let mut next = current;
            next.deletion_requested = true;
            next.resource_version = Some(g.next_rv());
            g.sources.insert(key.clone(), next);
        }
        Ok(())
    }

    async fn get_derived(&self, key: &ObjectKey) -> Result<DerivedResource, StoreError> {
        let mut g = self.lock();
        g.take_fault(Op::GetDerived)?;
        g.derived.get(key).cloned().ok_or_else(|| StoreError::not_found(ResourceKind::Derived, key))
    }

    async fn create_derived(&self, obj: &DerivedResource) -> Result<DerivedResource, StoreError> {
        let mut g = self.lock();
        g.take_fault(Op::CreateDerived)?;
        let key = obj.key();
        if !g.namespaces.contains(&key.namespace) {
            return Err(StoreError::not_found(ResourceKind::Namespace, &key.namespace));
        }
        if g.derived.contains_key(&key) {
            return Err(StoreError::already_exists(ResourceKind::Derived, &key));
        }
        let mut stored = obj.clone();
        stored.resource_version = Some(g.next_rv());
        g.derived.insert(key, stored.clone());
        Ok(stored)
    }

    async fn update_derived(&self, obj: &DerivedResource) -> Result<DerivedResource, StoreError> {
        let mut g = self.lock();
        g.take_fault(Op::UpdateDerived)?;
        let key = obj.key();
        let current = g.derived.get(&key).cloned().ok_or_else(|| StoreError::not_found(ResourceKind::Derived, &key))?;
        check_rv(ResourceKind::Derived, &key, &current.resource_version, &obj.resource_version)?;
        let mut next = obj.clone();
        next.resource_version = Some(g.next_rv());
        g.derived.insert(key, next.clone());
        Ok(next)
    }

    async fn delete_derived(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let mut g = self.lock();
        g.take_fault(Op::DeleteDerived)?;
        match g.derived.remove(key) {
            Some(_) => {
                g.writes += 1;
                Ok(())
            }
            None => Err(StoreError::not_found(ResourceKind::Derived, key)),
        }
    }

    async fn namespace_exists(&self, name: &str) -> Result<bool, StoreError> {
        let mut g = self.lock();
        g.take_fault(Op::NamespaceExists)?;
        Ok(g.namespaces.contains(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duplicator_core::{Template, FINALIZER};

    fn source(finalizers: &[&str]) -> SourceResource {
        SourceResource {
            namespace: "default".into(),
            name: "s1".into(),
            template: Template { name: "ing1".into(), spec: serde_json::json!({"host": "a"}), ..Default::default() },
            target_namespace: "ns1".into(),
            finalizers: finalizers.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn stale_token_is_a_conflict() {
        let store = MemStore::new();
        let created = store.create_source(&source(&[])).await.unwrap();
        let mut a = created.clone();
        a.finalizers.push(FINALIZER.into());
        store.update_source(&a).await.unwrap();

        let mut b = created;
        b.finalizers.push("x/y".into());
        let err = store.update_source(&b).await.unwrap_err();
        assert!(err.is_conflict(), "{err}");
    }

    #[tokio::test]
    async fn delete_waits_for_finalizers() {
        let store = MemStore::new();
        store.create_source(&source(&[FINALIZER])).await.unwrap();
        let key = ObjectKey::new("default", "s1");

        store.delete_source(&key).await.unwrap();
        let mut pending = store.get_source(&key).await.unwrap();
        assert!(pending.deletion_requested);

        // Re-adding a marker while deleting is refused.
        let mut sneaky = pending.clone();
        sneaky.finalizers.push("x/y".into());
        assert!(matches!(store.update_source(&sneaky).await, Err(StoreError::Invalid { .. })));

        pending.finalizers.clear();
        store.update_source(&pending).await.unwrap();
        assert!(store.get_source(&key).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn delete_without_finalizers_is_immediate() {
        let store = MemStore::new();
        store.create_source(&source(&[])).await.unwrap();
        let key = ObjectKey::new("default", "s1");
        store.delete_source(&key).await.unwrap();
        assert!(store.source(&key).is_none());
        assert!(store.delete_source(&key).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn spec_change_bumps_generation_but_status_does_not() {
        let store = MemStore::new();
        let created = store.create_source(&source(&[])).await.unwrap();
        assert_eq!(created.generation, Some(1));

        let status = store.update_source_status(&created).await.unwrap();
        assert_eq!(status.generation, Some(1));

        let mut edited = status;
        edited.template.spec = serde_json::json!({"host": "b"});
        let edited = store.update_source(&edited).await.unwrap();
        assert_eq!(edited.generation, Some(2));
    }

    #[tokio::test]
    async fn derived_create_needs_namespace_and_unique_key() {
        let store = MemStore::with_namespaces(["ns1"]);
        let d = source(&[]).desired_derived();
        store.create_derived(&d).await.unwrap();
        assert!(matches!(store.create_derived(&d).await, Err(StoreError::AlreadyExists { .. })));

        let mut elsewhere = d.clone();
        elsewhere.namespace = "nope".into();
        assert!(store.create_derived(&elsewhere).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn injected_faults_fire_once() {
        let store = MemStore::with_namespaces(["ns1"]);
        store.fail_next(Op::NamespaceExists, StoreError::Transient("timeout".into()));
        assert!(store.namespace_exists("ns1").await.is_err());
        assert!(store.namespace_exists("ns1").await.unwrap());
    }
}
