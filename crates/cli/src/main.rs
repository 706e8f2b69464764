use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use duplicator_core::{Condition, ObjectKey, StoreClient};
use duplicator_kubehub::crd::{crd_yaml, to_ingress, to_kube_condition, to_source};
use duplicator_kubehub::{AppIngress, ControllerConfig, KubeStore};
use duplicator_reconcile::{recheck_from_secs, EngineConfig, Reconciler};
use duplicator_store::MemStore;
use k8s_openapi::api::networking::v1::Ingress;
use serde::Serialize;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "duplicatorctl", version, about = "Copies AppIngress templates into Ingresses in other namespaces")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller against the current kube context
    Run {
        /// Only watch AppIngress objects in this namespace
        #[arg(long, env = "DUPLICATOR_WATCH_NAMESPACE")]
        watch_namespace: Option<String>,
        /// Periodic resync after success
        #[arg(long, env = "DUPLICATOR_RESYNC_SECS", default_value_t = 300)]
        resync_secs: u64,
        /// Retry delay after a failed reconcile
        #[arg(long, env = "DUPLICATOR_ERROR_BACKOFF_SECS", default_value_t = 15)]
        error_backoff_secs: u64,
        /// Re-check a missing target namespace after this long (0 disables)
        #[arg(long, env = "DUPLICATOR_NAMESPACE_RECHECK_SECS", default_value_t = 30)]
        namespace_recheck_secs: u64,
    },
    /// Run a single reconcile pass for one AppIngress and print its conditions
    Reconcile {
        name: String,
        #[arg(long = "ns", default_value = "default")]
        namespace: String,
    },
    /// Offline: show the Ingress an AppIngress manifest would produce
    Preview {
        /// AppIngress YAML manifest
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
        /// Namespaces that exist in the simulated cluster
        #[arg(long = "namespace")]
        namespaces: Vec<String>,
    },
    /// Print the AppIngress CustomResourceDefinition
    Crd,
}

fn init_tracing() {
    let env = std::env::var("DUPLICATOR_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("DUPLICATOR_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid DUPLICATOR_METRICS_ADDR; expected host:port");
        }
    }
}

#[derive(Debug, Serialize)]
struct Report {
    #[serde(skip_serializing_if = "Option::is_none")]
    ingress: Option<Ingress>,
    conditions: Vec<k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl Report {
    fn new(ingress: Option<Ingress>, conditions: &[Condition], error: Option<String>) -> Self {
        Self { ingress, conditions: conditions.iter().map(to_kube_condition).collect(), error }
    }
}

fn print_report(report: &Report, output: Output) -> Result<()> {
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(report)?),
        Output::Human => {
            if let Some(ing) = &report.ingress {
                print!("{}", serde_yaml::to_string(ing)?);
                println!("---");
            }
            println!("{:<16} {:<8} {:<10} MESSAGE", "TYPE", "STATUS", "REASON");
            for c in &report.conditions {
                println!("{:<16} {:<8} {:<10} {}", c.type_, c.status, c.reason, c.message);
            }
            if let Some(e) = &report.error {
                println!("error: {}", e);
            }
        }
    }
    Ok(())
}

/// Reconcile a manifest against an in-memory cluster holding only `namespaces`.
async fn preview(yaml: &str, namespaces: &[String]) -> Result<Report> {
    let mut obj: AppIngress = serde_yaml::from_str(yaml).context("parsing AppIngress YAML")?;
    if obj.metadata.namespace.is_none() {
        obj.metadata.namespace = Some("default".to_string());
    }
    let src = to_source(&obj)?;
    let store = Arc::new(MemStore::with_namespaces(namespaces.iter().cloned()));
    store.create_source(&src).await?;

    let engine = Reconciler::new(store.clone(), EngineConfig::from_env());
    let result = engine.reconcile(&src.key()).await;
    let conditions = store.source(&src.key()).map(|s| s.conditions).unwrap_or_default();
    let ingress = store.derived(&src.derived_key()).map(|d| to_ingress(&d)).transpose()?;
    Ok(Report::new(ingress, &conditions, result.err().map(|e| e.to_string())))
}

fn read_manifest(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { watch_namespace, resync_secs, error_backoff_secs, namespace_recheck_secs } => {
            let cfg = ControllerConfig {
                watch_namespace,
                resync: Duration::from_secs(resync_secs.max(1)),
                error_backoff: Duration::from_secs(error_backoff_secs.max(1)),
                engine: EngineConfig { namespace_recheck: recheck_from_secs(namespace_recheck_secs), ..EngineConfig::default() },
            };
            let client = duplicator_kubehub::get_kube_client().await?;
            duplicator_kubehub::run_controller(client, cfg).await?;
        }
        Commands::Reconcile { name, namespace } => {
            let key = ObjectKey::new(namespace, name);
            info!(key = %key, "reconcile invoked");
            let client = duplicator_kubehub::get_kube_client().await?;
            let engine = Reconciler::new(KubeStore::new(client), EngineConfig::from_env());
            let result = engine.reconcile(&key).await;
            if let Err(e) = &result {
                error!(error = %e, "reconcile failed");
            }
            match engine.store().get_source(&key).await {
                Ok(src) => {
                    let ingress = match engine.store().get_derived(&src.derived_key()).await {
                        Ok(d) => Some(to_ingress(&d)?),
                        Err(e) if e.is_not_found() => None,
                        Err(e) => return Err(e.into()),
                    };
                    print_report(&Report::new(ingress, &src.conditions, result.err().map(|e| e.to_string())), cli.output)?;
                }
                Err(e) if e.is_not_found() => {
                    warn!(key = %key, "AppIngress not found (deleted or never created)");
                    result?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Preview { file, namespaces } => {
            let yaml = read_manifest(&file)?;
            let report = preview(&yaml, &namespaces).await?;
            print_report(&report, cli.output)?;
        }
        Commands::Crd => {
            print!("{}", crd_yaml()?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
apiVersion: ingress.example.com/v1alpha1
kind: AppIngress
metadata:
  name: s1
spec:
  targetNamespace: ns1
  template:
    metadata:
      name: ing1
      labels:
        app: web
    spec:
      rules:
        - host: example.com
"#;

    #[tokio::test]
    async fn preview_renders_ingress_when_namespace_exists() {
        let report = preview(MANIFEST, &["ns1".to_string()]).await.unwrap();
        let ing = report.ingress.expect("ingress");
        assert_eq!(ing.metadata.namespace.as_deref(), Some("ns1"));
        assert_eq!(ing.metadata.name.as_deref(), Some("ing1"));
        let host = ing.spec.and_then(|s| s.rules).and_then(|r| r[0].host.clone());
        assert_eq!(host.as_deref(), Some("example.com"));
        let types: Vec<_> = report.conditions.iter().map(|c| c.type_.as_str()).collect();
        assert_eq!(types, vec!["NamespaceValid", "IngressCreated"]);
        assert!(report.error.is_none());
    }

    #[tokio::test]
    async fn preview_reports_missing_namespace() {
        let report = preview(MANIFEST, &[]).await.unwrap();
        assert!(report.ingress.is_none());
        assert_eq!(report.conditions.len(), 1);
        assert_eq!(report.conditions[0].status, "False");
        assert_eq!(report.conditions[0].reason, "NotFound");
    }

    #[test]
    fn cli_parses_run_flags() {
        let cli = Cli::try_parse_from(["duplicatorctl", "run", "--resync-secs", "60", "--namespace-recheck-secs", "0"]).unwrap();
        match cli.command {
            Commands::Run { resync_secs, namespace_recheck_secs, .. } => {
                assert_eq!(resync_secs, 60);
                assert_eq!(namespace_recheck_secs, 0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
