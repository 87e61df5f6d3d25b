/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: k8s/operators/rbac_operator/src/controllers/binding_template_controller.rs
*
* This file implements the controller for the `BindingTemplate` Custom Resource.
*
* Architecture:
* - Besides its own objects, the controller reacts to:
*   - the ClusterRoleBindings and RoleBindings it generated (drift repair),
*   - ClusterRoles and Roles, mapped to the templates referencing them, so
*     the `RoleRefsValid` condition heals once a missing role appears,
*   - Namespaces, mapped to every template with namespace bindings,
*   - managed ServiceAccounts, mapped through their reference annotation.
* - `rbac_manager::binding_engine` does the work. A partially applied pass
*   publishes its status and is then retried with backoff.
* - A finalizer deletes the bindings and releases ServiceAccount references
*   before the template disappears.
*
* SPDX-License-Identifier: Apache-2.0
*/

use super::utils::{backoff_key, log_result, patch_status, terminal_action};
use crate::{metrics, Context};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Namespace, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
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
use rbac_manager::crds::{BindingTemplate, RoleKind};
use rbac_manager::{binding_engine, BINDING_FINALIZER, BINDING_TEMPLATE_LABEL, MANAGED_BY_LABEL, MANAGER_NAME};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

const KIND: &str = "BindingTemplate";

// --- Error Handling ---

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error(transparent)]
    Engine(#[from] rbac_manager::Error),

    #[error("Finalizer error: {0}")]
    FinalizerError(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("{0} step(s) could not be applied")]
    PartialFailure(usize),
}

// --- Trigger Mapping ---

fn template_for_binding(labels: &BTreeMap<String, String>) -> Option<ObjectRef<BindingTemplate>> {
    labels.get(BINDING_TEMPLATE_LABEL).map(|name| ObjectRef::new(name))
}

fn templates_referencing(
    templates: &[Arc<BindingTemplate>],
    kind: RoleKind,
    name: &str,
    namespace: Option<&str>,
) -> Vec<ObjectRef<BindingTemplate>> {
    templates
        .iter()
        .filter(|t| binding_engine::references_role(t, kind, name, namespace))
        .map(|t| ObjectRef::from_obj(&**t))
        .collect()
}

fn templates_with_namespace_bindings(templates: &[Arc<BindingTemplate>]) -> Vec<ObjectRef<BindingTemplate>> {
    templates
        .iter()
        .filter(|t| !t.spec.namespace_bindings.is_empty())
        .map(|t| ObjectRef::from_obj(&**t))
        .collect()
}

/// Templates recorded in a managed ServiceAccount's reference annotation.
fn templates_holding(account: &ServiceAccount) -> Vec<ObjectRef<BindingTemplate>> {
    match binding_engine::referenced_by(account) {
        Ok(names) => names.iter().map(|name| ObjectRef::new(name)).collect(),
        Err(e) => {
            debug!(service_account = %account.name_any(), error = %e, "Unreadable reference annotation");
            Vec::new()
        }
    }
}

// --- Controller Entrypoint ---

pub fn controller(ctx: &Context) -> Controller<BindingTemplate> {
    let client = ctx.client.clone();
    let managed = watcher::Config::default().labels(&format!("{}={}", MANAGED_BY_LABEL, MANAGER_NAME));

    let controller = Controller::new(Api::<BindingTemplate>::all(client.clone()), watcher::Config::default());
    let templates = controller.store();
    let for_cluster_roles = templates.clone();
    let for_roles = templates.clone();
    let for_namespaces = templates;

    controller
        .owns(Api::<ClusterRoleBinding>::all(client.clone()), managed.clone())
        .watches(Api::<RoleBinding>::all(client.clone()), managed.clone(), |binding: RoleBinding| {
            template_for_binding(binding.labels())
        })
        .watches(
            Api::<ClusterRole>::all(client.clone()),
            watcher::Config::default(),
            move |role: ClusterRole| {
                templates_referencing(&for_cluster_roles.state(), RoleKind::ClusterRole, &role.name_any(), None)
            },
        )
        .watches(Api::<Role>::all(client.clone()), watcher::Config::default(), move |role: Role| {
            let namespace = role.namespace();
            templates_referencing(&for_roles.state(), RoleKind::Role, &role.name_any(), namespace.as_deref())
        })
        .watches(
            Api::<Namespace>::all(client.clone()),
            watcher::Config::default(),
            move |_: Namespace| templates_with_namespace_bindings(&for_namespaces.state()),
        )
        .watches(Api::<ServiceAccount>::all(client), managed, |account: ServiceAccount| {
            templates_holding(&account)
        })
        .with_config(controller::Config::default().concurrency(ctx.concurrency))
}

pub async fn run(ctx: Arc<Context>) {
    info!("Starting BindingTemplate controller");
    controller(&ctx)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move { log_result(KIND, res) })
        .await;
}

// --- Reconciliation Logic ---

async fn reconcile(template: Arc<BindingTemplate>, ctx: Arc<Context>) -> Result<Action, Error> {
    let api = Api::<BindingTemplate>::all(ctx.client.clone());

    finalizer(&api, BINDING_FINALIZER, template, |event| async {
        match event {
            Event::Apply(template) => apply(&template, ctx.clone()).await,
            Event::Cleanup(template) => cleanup(&template, ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::FinalizerError(Box::new(e)))
}

#[instrument(skip_all, fields(template = %template.name_any()))]
async fn apply(template: &BindingTemplate, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = template.name_any();
    let api = Api::<BindingTemplate>::all(ctx.client.clone());

    match binding_engine::reconcile(template, ctx.cluster.as_ref()).await {
        Ok(outcome) => {
            patch_status(&api, &name, &outcome.status).await?;
            if !outcome.is_complete() {
                return Err(Error::PartialFailure(outcome.failures.len()));
            }
            ctx.backoff.reset(&backoff_key(template));
            metrics::record_reconcile(KIND, "success");
            Ok(Action::requeue(ctx.resync))
        }
        Err(e) if e.is_terminal() => {
            warn!(error = %e, "BindingTemplate cannot be applied, waiting for a change");
            patch_status(&api, &name, &binding_engine::failed_status(template, &e)).await?;
            metrics::record_reconcile(KIND, "invalid");
            Ok(terminal_action(&e, ctx.resync))
        }
        Err(e) => {
            if let Err(status_err) = patch_status(&api, &name, &binding_engine::failed_status(template, &e)).await {
                warn!(error = %status_err, "Failed to publish failure status");
            }
            Err(Error::Engine(e))
        }
    }
}

#[instrument(skip_all, fields(template = %template.name_any()))]
async fn cleanup(template: &BindingTemplate, ctx: Arc<Context>) -> Result<Action, Error> {
    binding_engine::cleanup(template, ctx.cluster.as_ref()).await?;
    ctx.backoff.reset(&backoff_key(template));
    Ok(Action::await_change())
}

fn error_policy(template: Arc<BindingTemplate>, error: &Error, ctx: Arc<Context>) -> Action {
    let delay = ctx.backoff.next_delay(&backoff_key(&*template));
    warn!(
        template = %template.name_any(),
        error = %error,
        retry_in = ?delay,
        "BindingTemplate reconciliation failed"
    );
    let result = match error {
        Error::PartialFailure(_) => "partial",
        _ => "error",
    };
    metrics::record_reconcile(KIND, result);
    Action::requeue(delay)
}
