//! Duplicator kubehub: the AppIngress resource, a kube-backed store client and
//! the controller loop that decides when the engine runs.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use kube::Client;

pub mod client;
pub mod controller;
pub mod crd;

pub use client::KubeStore;
pub use controller::{run_controller, ControllerConfig};
pub use crd::{AppIngress, AppIngressSpec, AppIngressStatus, IngressTemplate, TemplateMeta};

/// Client for the current kube context (in-cluster config or kubeconfig).
pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client from current context")
}
