//! Store client contract consumed by the reconcile engine.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::{DerivedResource, ObjectKey, SourceResource, StoreError};

/// Typed per-identity access to both resource kinds. The engine never lists or watches.
///
/// `update_*` must fail with [`StoreError::Conflict`] when the object's
/// `resource_version` is stale; `delete_*` must fail with
/// [`StoreError::NotFound`] when the object is already gone.
#[async_trait::async_trait]
pub trait StoreClient: Send + Sync {
    async fn get_source(&self, key: &ObjectKey) -> Result<SourceResource, StoreError>;
    async fn create_source(&self, obj: &SourceResource) -> Result<SourceResource, StoreError>;
    /// Persist metadata owned by the engine (finalizers).
    async fn update_source(&self, obj: &SourceResource) -> Result<SourceResource, StoreError>;
    /// Persist `conditions` through the status path.
    async fn update_source_status(&self, obj: &SourceResource) -> Result<SourceResource, StoreError>;
    async fn delete_source(&self, key: &ObjectKey) -> Result<(), StoreError>;

    async fn get_derived(&self, key: &ObjectKey) -> Result<DerivedResource, StoreError>;
    async fn create_derived(&self, obj: &DerivedResource) -> Result<DerivedResource, StoreError>;
    async fn update_derived(&self, obj: &DerivedResource) -> Result<DerivedResource, StoreError>;
    async fn delete_derived(&self, key: &ObjectKey) -> Result<(), StoreError>;

    async fn namespace_exists(&self, name: &str) -> Result<bool, StoreError>;
}

#[async_trait::async_trait]
impl<T: StoreClient + ?Sized> StoreClient for Arc<T> {
    async fn get_source(&self, key: &ObjectKey) -> Result<SourceResource, StoreError> {
        (**self).get_source(key).await
    }
    async fn create_source(&self, obj: &SourceResource) -> Result<SourceResource, StoreError> {
        (**self).create_source(obj).await
    }
    async fn update_source(&self, obj: &SourceResource) -> Result<SourceResource, StoreError> {
        (**self).update_source(obj).await
    }
    async fn update_source_status(&self, obj: &SourceResource) -> Result<SourceResource, StoreError> {
        (**self).update_source_status(obj).await
    }
    async fn delete_source(&self, key: &ObjectKey) -> Result<(), StoreError> {
        (**self).delete_source(key).await
    }
    async fn get_derived(&self, key: &ObjectKey) -> Result<DerivedResource, StoreError> {
        (**self).get_derived(key).await
    }
    async fn create_derived(&self, obj: &DerivedResource) -> Result<DerivedResource, StoreError> {
        (**self).create_derived(obj).await
    }
    async fn update_derived(&self, obj: &DerivedResource) -> Result<DerivedResource, StoreError> {
        (**self).update_derived(obj).await
    }
    async fn delete_derived(&self, key: &ObjectKey) -> Result<(), StoreError> {
        (**self).delete_derived(key).await
    }
    async fn namespace_exists(&self, name: &str) -> Result<bool, StoreError> {
        (**self).namespace_exists(name).await
    }
}

/// Time source for condition transitions.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

impl<T: Clock + ?Sized> Clock for Arc<T> {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}
