/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: k8s/operators/rbac_operator/src/controllers/role_template_controller.rs
*
* This file implements the controller for the `RoleTemplate` Custom Resource.
*
* Architecture:
* - The controller watches `RoleTemplate` resources together with the
*   ClusterRoles and Roles generated from them, so a hand-edited or deleted
*   role is put back on the next pass.
* - Every published change of the API surface re-triggers all templates
*   (`reconcile_all_on` over the discovery cache's change stream).
* - The rules themselves are computed by `rbac_manager::role_engine`; this
*   file maps its outcome to status, metrics and a requeue decision.
* - A finalizer removes the generated role before the template disappears.
*
* SPDX-License-Identifier: Apache-2.0
*/

use super::utils::{backoff_key, log_result, patch_status, terminal_action};
use crate::{metrics, Context};
use futures::StreamExt;
use k8s_openapi::api::rbac::v1::{ClusterRole, Role};
use kube::{
    api::Api,
    runtime::{
        controller::{self, Action, Controller},
        finalizer::{finalizer, Event},
        reflector::ObjectRef,
        watcher,
    },
    ResourceExt,
};
use rbac_manager::crds::RoleTemplate;
use rbac_manager::{role_engine, MANAGED_BY_LABEL, MANAGER_NAME, ROLE_FINALIZER, ROLE_TEMPLATE_LABEL};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};

const KIND: &str = "RoleTemplate";

// --- Error Handling ---

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error(transparent)]
    Engine(#[from] rbac_manager::Error),

    #[error("Finalizer error: {0}")]
    FinalizerError(#[source] Box<dyn std::error::Error + Send + Sync>),
}

// --- Controller Entrypoint ---

/// Template owning a generated role, read from the role's labels.
fn template_for_role(labels: &BTreeMap<String, String>) -> Option<ObjectRef<RoleTemplate>> {
    labels.get(ROLE_TEMPLATE_LABEL).map(|name| ObjectRef::new(name))
}

pub fn controller(ctx: &Context) -> Controller<RoleTemplate> {
    let client = ctx.client.clone();
    let managed = watcher::Config::default().labels(&format!("{}={}", MANAGED_BY_LABEL, MANAGER_NAME));

    Controller::new(Api::<RoleTemplate>::all(client.clone()), watcher::Config::default())
        .owns(Api::<ClusterRole>::all(client.clone()), managed.clone())
        // Owner references on namespaced children resolve into the child's
        // namespace, so generated Roles are mapped back by label.
        .watches(Api::<Role>::all(client), managed, |role: Role| template_for_role(role.labels()))
        .reconcile_all_on(ctx.discovery.changes())
        .with_config(controller::Config::default().concurrency(ctx.concurrency))
}

pub async fn run(ctx: Arc<Context>) {
    info!("Starting RoleTemplate controller");
    controller(&ctx)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move { log_result(KIND, res) })
        .await;
}

// --- Reconciliation Logic ---

async fn reconcile(template: Arc<RoleTemplate>, ctx: Arc<Context>) -> Result<Action, Error> {
    let api = Api::<RoleTemplate>::all(ctx.client.clone());

    finalizer(&api, ROLE_FINALIZER, template, |event| async {
        match event {
            Event::Apply(template) => apply(&template, ctx.clone()).await,
            Event::Cleanup(template) => cleanup(&template, ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::FinalizerError(Box::new(e)))
}

#[instrument(skip_all, fields(template = %template.name_any()))]
async fn apply(template: &RoleTemplate, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = template.name_any();
    let api = Api::<RoleTemplate>::all(ctx.client.clone());

    match role_engine::reconcile(template, &ctx.discovery, ctx.cluster.as_ref()).await {
        Ok(generated) => {
            patch_status(&api, &name, &role_engine::applied_status(template, &generated)).await?;
            ctx.backoff.reset(&backoff_key(template));
            metrics::record_reconcile(KIND, "success");
            Ok(Action::requeue(ctx.resync))
        }
        Err(e) if e.is_terminal() => {
            warn!(error = %e, "RoleTemplate cannot be applied, waiting for a change");
            patch_status(&api, &name, &role_engine::failed_status(template, &e)).await?;
            metrics::record_reconcile(KIND, "invalid");
            Ok(terminal_action(&e, ctx.resync))
        }
        Err(e) => {
            if let Err(status_err) = patch_status(&api, &name, &role_engine::failed_status(template, &e)).await {
                warn!(error = %status_err, "Failed to publish failure status");
            }
            Err(Error::Engine(e))
        }
    }
}

#[instrument(skip_all, fields(template = %template.name_any()))]
async fn cleanup(template: &RoleTemplate, ctx: Arc<Context>) -> Result<Action, Error> {
    role_engine::cleanup(template, ctx.cluster.as_ref()).await?;
    ctx.backoff.reset(&backoff_key(template));
    Ok(Action::await_change())
}

fn error_policy(template: Arc<RoleTemplate>, error: &Error, ctx: Arc<Context>) -> Action {
    let delay = ctx.backoff.next_delay(&backoff_key(&*template));
    warn!(
        template = %template.name_any(),
        error = %error,
        retry_in = ?delay,
        "RoleTemplate reconciliation failed"
    );
    metrics::record_reconcile(KIND, "error");
    Action::requeue(delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_role_maps_back_to_its_template() {
        let labels = rbac_manager::managed_labels(ROLE_TEMPLATE_LABEL, "viewers");
        assert_eq!(template_for_role(&labels), Some(ObjectRef::new("viewers")));
    }

    #[test]
    fn test_unlabelled_role_maps_to_nothing() {
        let mut labels = BTreeMap::new();
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGER_NAME.to_string());
        assert_eq!(template_for_role(&labels), None);
    }

    #[test]
    fn test_errors_report_the_engine_cause() {
        let err = Error::from(rbac_manager::Error::EmptyDiscovery);
        assert_eq!(err.to_string(), "API discovery snapshot contains no resources");
    }
}
