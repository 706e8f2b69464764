//! Reconcile engine.
//!
//! One call converges one source identity: fetch, finalize or ensure the cleanup
//! marker, validate the target namespace, create-or-update the derived ingress,
//! and report the outcome through status conditions. Nothing is carried between
//! calls; every decision is taken from freshly fetched objects, so any step may
//! be replayed after a crash or a conflict.

#![forbid(unsafe_code)]

use std::time::{Duration, Instant};

use duplicator_core::{
    add_finalizer, has_finalizer, reasons, remove_finalizer, set_condition, Clock, Condition,
    ConditionStatus, ConditionUpdate, ObjectKey, ResourceKind, SourceResource, StoreClient,
    StoreError, SystemClock, CONDITION_INGRESS_CREATED, CONDITION_NAMESPACE_VALID, FINALIZER,
};
use metrics::{counter, histogram};
use tracing::{debug, error, info, info_span, warn, Instrument};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Cleanup marker owned by this engine.
    pub finalizer: String,
    /// Hint returned when the target namespace is missing. `None` disables it.
    pub namespace_recheck: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { finalizer: FINALIZER.to_string(), namespace_recheck: Some(Duration::from_secs(30)) }
    }
}

impl EngineConfig {
    /// Reads `DUPLICATOR_NAMESPACE_RECHECK_SECS` (0 disables the hint).
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(raw) = std::env::var("DUPLICATOR_NAMESPACE_RECHECK_SECS") {
            match raw.parse::<u64>() {
                Ok(secs) => cfg.namespace_recheck = recheck_from_secs(secs),
                Err(_) => warn!(value = %raw, "invalid DUPLICATOR_NAMESPACE_RECHECK_SECS; expected whole seconds, keeping default"),
            }
        }
        cfg
    }
}

pub fn recheck_from_secs(secs: u64) -> Option<Duration> {
    if secs == 0 { None } else { Some(Duration::from_secs(secs)) }
}

/// Successful result of a reconcile. The engine never schedules anything itself;
/// `requeue_after` is only a hint for whoever drives it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Outcome {
    pub requeue_after: Option<Duration>,
}

impl Outcome {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn recheck_after(d: Duration) -> Self {
        Self { requeue_after: Some(d) }
    }
}

/// What create-or-update did to the derived resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Converge {
    Created,
    Updated,
    Unchanged,
}

pub struct Reconciler<S, C = SystemClock> {
    store: S,
    clock: C,
    cfg: EngineConfig,
}

impl<S: StoreClient> Reconciler<S, SystemClock> {
    pub fn new(store: S, cfg: EngineConfig) -> Self {
        Self::with_clock(store, SystemClock, cfg)
    }
}

impl<S: StoreClient, C: Clock> Reconciler<S, C> {
    pub fn with_clock(store: S, clock: C, cfg: EngineConfig) -> Self {
        Self { store, clock, cfg }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    /// Converge one source identity. Store errors are returned unmodified; the
    /// caller is expected to retry the whole call.
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Outcome, StoreError> {
        let t0 = Instant::now();
        counter!("reconcile_total", 1u64);
        let span = info_span!("reconcile", ns = %key.namespace, name = %key.name);
        let res = self.reconcile_once(key).instrument(span).await;
        histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        if let Err(e) = &res {
            counter!("reconcile_errors_total", 1u64);
            if e.is_conflict() {
                counter!("reconcile_conflicts_total", 1u64);
            }
        }
        res
    }

    async fn reconcile_once(&self, key: &ObjectKey) -> Result<Outcome, StoreError> {
        info!("reconciling AppIngress");
        let mut src = match self.store.get_source(key).await {
            Ok(s) => s,
            Err(e) if e.is_not_found() => {
                debug!("source no longer exists");
                return Ok(Outcome::done());
            }
            Err(e) => return Err(e),
        };

        if src.deletion_requested {
            return self.finalize(src).await;
        }

        if add_finalizer(&mut src, &self.cfg.finalizer) {
            debug!(finalizer = %self.cfg.finalizer, "adding finalizer");
            src = self.store.update_source(&src).await?;
        }

        let fetched = src.conditions.clone();
        let generation = src.generation;

        if !self.store.namespace_exists(&src.target_namespace).await? {
            warn!(target_ns = %src.target_namespace, "target namespace not found");
            set_condition(
                &mut src.conditions,
                ConditionUpdate::new(CONDITION_NAMESPACE_VALID, ConditionStatus::False, reasons::NOT_FOUND)
                    .message("Target namespace does not exist")
                    .observed_generation(generation),
                self.clock.now(),
            );
            self.persist_status(&src, &fetched).await?;
            return Ok(self.cfg.namespace_recheck.map(Outcome::recheck_after).unwrap_or_default());
        }

        set_condition(
            &mut src.conditions,
            ConditionUpdate::new(CONDITION_NAMESPACE_VALID, ConditionStatus::True, reasons::VALID)
                .message("Target namespace exists")
                .observed_generation(generation),
            self.clock.now(),
        );

        match self.converge(&src).await {
            Ok(result) => {
                set_condition(
                    &mut src.conditions,
                    ConditionUpdate::new(CONDITION_INGRESS_CREATED, ConditionStatus::True, reasons::CREATED)
                        .message("Ingress created/updated successfully")
                        .observed_generation(generation),
                    self.clock.now(),
                );
                self.persist_status(&src, &fetched).await?;
                info!(?result, target = %src.derived_key(), "reconcile completed");
                Ok(Outcome::done())
            }
            Err(e) => {
                error!(error = %e, target = %src.derived_key(), "failed to create/update Ingress");
                set_condition(
                    &mut src.conditions,
                    ConditionUpdate::new(CONDITION_INGRESS_CREATED, ConditionStatus::False, reasons::ERROR)
                        .message(format!("Failed to create/update Ingress: {}", e))
                        .observed_generation(generation),
                    self.clock.now(),
                );
                self.persist_status(&src, &fetched).await?;
                Err(e)
            }
        }
    }

    /// Deletion branch: remove the derived ingress, then release the source.
    async fn finalize(&self, mut src: SourceResource) -> Result<Outcome, StoreError> {
        if !has_finalizer(&src, &self.cfg.finalizer) {
            debug!("deletion pending without our finalizer");
            return Ok(Outcome::done());
        }
        let target = src.derived_key();
        // Nothing can have been created under an empty identity, and an empty
        // name must never reach a delete call.
        if target.name.is_empty() || target.namespace.is_empty() {
            info!(target = %target, "no Ingress identity to clean up");
        } else {
            self.delete_target(&target).await?;
        }
        remove_finalizer(&mut src, &self.cfg.finalizer);
        self.store.update_source(&src).await?;
        info!("cleanup completed");
        Ok(Outcome::done())
    }

    async fn delete_target(&self, target: &ObjectKey) -> Result<(), StoreError> {
        info!(target = %target, "cleaning up associated Ingress");
        match self.store.delete_derived(target).await {
            Ok(()) => {
                counter!("derived_deleted_total", 1u64);
            }
            Err(e) if e.is_not_found() => info!(target = %target, "Ingress already deleted or not found"),
            Err(e) => {
                error!(error = %e, target = %target, "failed to delete Ingress during cleanup");
                return Err(e);
            }
        }
        Ok(())
    }

    /// Create-or-update with full overwrite of labels, annotations and spec.
    pub async fn converge(&self, src: &SourceResource) -> Result<Converge, StoreError> {
        let key = src.derived_key();
        if key.name.is_empty() {
            return Err(StoreError::invalid(ResourceKind::Derived, &key, "template name is empty"));
        }
        match self.store.get_derived(&key).await {
            Ok(mut live) => {
                if live.matches_template(&src.template) {
                    return Ok(Converge::Unchanged);
                }
                live.overwrite_from(&src.template);
                self.store.update_derived(&live).await?;
                counter!("derived_updated_total", 1u64);
                Ok(Converge::Updated)
            }
            Err(e) if e.is_not_found() => {
                self.store.create_derived(&src.desired_derived()).await?;
                counter!("derived_created_total", 1u64);
                Ok(Converge::Created)
            }
            Err(e) => Err(e),
        }
    }

    async fn persist_status(&self, src: &SourceResource, fetched: &[Condition]) -> Result<(), StoreError> {
        if src.conditions.as_slice() == fetched {
            debug!("status unchanged; skipping write");
            return Ok(());
        }
        if let Err(e) = self.store.update_source_status(src).await {
            error!(error = %e, "failed to update AppIngress status");
            return Err(e);
        }
        Ok(())
    }
}
