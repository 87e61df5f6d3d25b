/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* Archive: k8s/operators/rbac_operator/src/main.rs
*
* This file is the main entry point for the rbac-operator. It wires the
* engines of `rbac_manager` and `policy_engine` into kube-rs controllers and
* serves the authorizer webhook and the metrics endpoint.
*
* Architecture:
* 1.  **Configuration**: flags and environment variables are parsed into an
*     `OperatorConfig`. `--print-crds` prints the CustomResourceDefinitions
*     and exits before anything else happens.
* 2.  **Initialization**: structured logging, the metrics registry and the
*     Kubernetes client. Failing to build the client is fatal.
* 3.  **Discovery**: a first API discovery refresh is attempted up front so
*     RoleTemplates can be reconciled immediately; afterwards a background
*     task refreshes the snapshot on a fixed interval.
* 4.  **Controllers**: one controller per kind (`RoleTemplate`,
*     `BindingTemplate`, `AccessPolicy`) sharing a `Context`.
* 5.  **Authorizer**: answers SubjectAccessReviews from the AccessPolicy
*     controller's store and a Namespace reflector. It starts serving once
*     both stores have completed their initial listing.
*
* The servers and background tasks run alongside the controllers; the
* process exits once the controllers stop on a termination signal.
*
* SPDX-License-Identifier: Apache-2.0 */

use anyhow::Context as _;
use clap::Parser;
use kube::{Client, CustomResourceExt};
use policy_engine::{AccessPolicy, PolicySource, StoreIndex};
use rbac_manager::crds::{BindingTemplate, RoleTemplate};
use rbac_manager::{ClusterState, DiscoveryCache, DiscoverySource, KubeClusterState, KubeDiscovery};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_layer::init_tracing;

mod config;
mod metrics;
mod webhook;
mod controllers {
    pub mod access_policy_controller;
    pub mod binding_template_controller;
    pub mod role_template_controller;
    pub mod utils;
}

use config::OperatorConfig;
use controllers::utils::BackoffTracker;
use controllers::{access_policy_controller, binding_template_controller, role_template_controller};

// The shared context passed to every controller.
pub struct Context {
    pub client: Client,
    pub cluster: Arc<dyn ClusterState>,
    pub discovery: Arc<DiscoveryCache>,
    pub backoff: BackoffTracker,
    /// Requeue interval after a successful pass.
    pub resync: Duration,
    pub concurrency: u16,
}

/// Prints every CustomResourceDefinition as a multi-document YAML stream.
fn print_crds() -> anyhow::Result<()> {
    let crds = [RoleTemplate::crd(), BindingTemplate::crd(), AccessPolicy::crd()];
    let docs = crds
        .iter()
        .map(serde_yaml::to_string)
        .collect::<Result<Vec<_>, _>>()
        .context("failed to render CRDs")?;
    print!("{}", docs.join("---\n"));
    Ok(())
}

/// The main entry point of the operator.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Configuration
    let config = OperatorConfig::parse();
    if config.print_crds {
        return print_crds();
    }
    config.validate().context("invalid configuration")?;

    // 2. Logging, metrics and the Kubernetes client
    init_tracing(config.log_format).context("failed to initialise logging")?;
    let registry = Arc::new(metrics::create_and_register_metrics().context("failed to register metrics")?);
    let client = Client::try_default()
        .await
        .context("failed to build the Kubernetes client")?;

    // 3. Initial discovery
    let discovery = Arc::new(DiscoveryCache::new());
    let source: Arc<dyn DiscoverySource> = Arc::new(KubeDiscovery::new(client.clone()));
    let initial = discovery.refresh(source.as_ref()).await;
    if let Err(e) = &initial {
        warn!(error = %e, "Initial API discovery failed, RoleTemplates wait for the next refresh");
    }
    metrics::record_discovery(&initial, discovery.snapshot().map(|s| s.resources().len()));

    // 4. Shared context
    let context = Arc::new(Context {
        client: client.clone(),
        cluster: Arc::new(KubeClusterState::new(client.clone())),
        discovery: discovery.clone(),
        backoff: BackoffTracker::new(config.backoff()),
        resync: config.resync_interval(),
        concurrency: config.controller_concurrency,
    });

    // 5. Authorizer state
    let policy_controller = access_policy_controller::controller(&context);
    let policies = policy_controller.store();
    let (namespaces, namespace_watch) = access_policy_controller::namespace_reflector(client);
    let index: Arc<dyn PolicySource> = Arc::new(StoreIndex::new(policies.clone(), namespaces.clone()));

    let authorizer = async {
        if policies.wait_until_ready().await.is_err() || namespaces.wait_until_ready().await.is_err() {
            warn!("Policy caches were dropped before becoming ready, authorizer not started");
            return;
        }
        webhook::run_authorizer(config.authorizer_addr, config.tls(), index).await
    };

    let discovery_loop = discovery.run(source, config.discovery_interval(), {
        let discovery = discovery.clone();
        move |outcome| metrics::record_discovery(outcome, discovery.snapshot().map(|s| s.resources().len()))
    });

    info!("rbac-operator starting...");

    tokio::select! {
        _ = async {
            tokio::join!(
                webhook::run_metrics_server(config.metrics_addr, registry),
                authorizer,
                discovery_loop,
                namespace_watch,
            )
        } => {}
        _ = async {
            tokio::join!(
                role_template_controller::run(context.clone()),
                binding_template_controller::run(context.clone()),
                access_policy_controller::run(policy_controller, context.clone()),
            )
        } => {}
    }

    info!("rbac-operator shutting down.");
    Ok(())
}
