//! Controller loop: watches AppIngress (and Namespaces) and drives the engine.
//!
//! `kube::runtime::Controller` guarantees at most one reconcile in flight per
//! object and coalesces bursts of events for the same object.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use duplicator_core::{ObjectKey, StoreError};
use duplicator_reconcile::{EngineConfig, Reconciler};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, ListParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use metrics::counter;
use tracing::{debug, info, warn};

use crate::client::KubeStore;
use crate::crd::AppIngress;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Restrict the AppIngress watch to one namespace; `None` watches all.
    pub watch_namespace: Option<String>,
    /// Periodic resync after a successful reconcile.
    pub resync: Duration,
    /// Delay before retrying a failed reconcile.
    pub error_backoff: Duration,
    pub engine: EngineConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            watch_namespace: None,
            resync: Duration::from_secs(300),
            error_backoff: Duration::from_secs(15),
            engine: EngineConfig::default(),
        }
    }
}

/// Conflicts are retried almost immediately against a fresh read.
const CONFLICT_RETRY: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("AppIngress {0} has no namespace")]
    MissingNamespace(String),
}

struct Context {
    engine: Reconciler<KubeStore>,
    cfg: ControllerConfig,
}

async fn reconcile(obj: Arc<AppIngress>, ctx: Arc<Context>) -> Result<Action, Error> {
    // The cached object only names what to reconcile; the engine re-reads it.
    let ns = obj.namespace().ok_or_else(|| Error::MissingNamespace(obj.name_any()))?;
    let key = ObjectKey::new(ns, obj.name_any());
    let outcome = ctx.engine.reconcile(&key).await?;
    Ok(next_action(outcome.requeue_after, &ctx.cfg))
}

fn next_action(hint: Option<Duration>, cfg: &ControllerConfig) -> Action {
    match hint {
        Some(d) => Action::requeue(d),
        None => Action::requeue(cfg.resync),
    }
}

fn retry_delay(err: &Error, cfg: &ControllerConfig) -> Duration {
    match err {
        Error::Store(e) if e.is_conflict() => CONFLICT_RETRY,
        _ => cfg.error_backoff,
    }
}

fn error_policy(obj: Arc<AppIngress>, err: &Error, ctx: Arc<Context>) -> Action {
    let delay = retry_delay(err, &ctx.cfg);
    warn!(name = %obj.name_any(), ns = ?obj.namespace(), error = %err, retry_in = ?delay, "reconcile failed; requeueing");
    counter!("reconcile_requeues_total", 1u64);
    Action::requeue(delay)
}

/// Sources whose target is `ns`, so a namespace appearing re-triggers them.
fn sources_targeting<'a>(sources: impl IntoIterator<Item = &'a AppIngress>, ns: &str) -> Vec<ObjectRef<AppIngress>> {
    sources
        .into_iter()
        .filter(|ai| ai.spec.target_namespace == ns)
        .map(ObjectRef::from_obj)
        .collect()
}

/// Run until SIGINT/SIGTERM.
pub async fn run_controller(client: Client, cfg: ControllerConfig) -> Result<()> {
    let sources: Api<AppIngress> = match cfg.watch_namespace.as_deref() {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };
    sources
        .list(&ListParams::default().limit(1))
        .await
        .context("listing AppIngress; is the CRD installed? (`duplicatorctl crd | kubectl apply -f -`)")?;
    let namespaces: Api<Namespace> = Api::all(client.clone());

    let controller = Controller::new(sources, watcher::Config::default());
    let cache = controller.store();
    let ctx = Arc::new(Context { engine: Reconciler::new(KubeStore::new(client), cfg.engine.clone()), cfg: cfg.clone() });

    info!(watch_ns = ?cfg.watch_namespace, resync = ?cfg.resync, backoff = ?cfg.error_backoff, "controller starting");
    controller
        .watches(namespaces, watcher::Config::default(), move |ns: Namespace| {
            let state = cache.state();
            sources_targeting(state.iter().map(|a| a.as_ref()), &ns.name_any())
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!(obj = %obj, "reconciled"),
                Err(e) => debug!(error = %e, "controller event"),
            }
        })
        .await;
    info!("controller stopped");
    Ok(())
}
