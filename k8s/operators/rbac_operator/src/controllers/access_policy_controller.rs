/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: k8s/operators/rbac_operator/src/controllers/access_policy_controller.rs
*
* This file implements the controller for the `AccessPolicy` Custom Resource
* and the Namespace reflector used by the authorizer.
*
* Architecture:
* - AccessPolicies are evaluated directly by the authorizer webhook; nothing
*   is generated from them. The controller only validates each policy and
*   publishes a `Valid` condition.
* - The controller's own reflector store is the policy cache the authorizer
*   reads, which is why `main` builds the controller, takes its store and
*   only then starts it.
* - Namespace labels needed by policy namespace selectors come from a
*   separate reflector.
*
* SPDX-License-Identifier: Apache-2.0
*/

use super::utils::{backoff_key, log_result, patch_status};
use crate::{metrics, Context};
use futures::{Future, StreamExt};
use k8s_openapi::api::core::v1::Namespace;
use kube::{
    api::Api,
    runtime::{
        controller::{self, Action, Controller},
        reflector::{self, Store},
        watcher, WatchStreamExt,
    },
    Client, Resource, ResourceExt,
};
use policy_engine::matching::validate_policy;
use policy_engine::{AccessPolicy, AccessPolicyStatus};
use rbac_manager::conditions::{self, condition};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};

const KIND: &str = "AccessPolicy";

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),
}

pub fn controller(ctx: &Context) -> Controller<AccessPolicy> {
    Controller::new(Api::<AccessPolicy>::all(ctx.client.clone()), watcher::Config::default())
        .with_config(controller::Config::default().concurrency(ctx.concurrency))
}

pub async fn run(controller: Controller<AccessPolicy>, ctx: Arc<Context>) {
    info!("Starting AccessPolicy controller");
    controller
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move { log_result(KIND, res) })
        .await;
}

/// Keeps a store of all Namespaces up to date while the returned future runs.
pub fn namespace_reflector(client: Client) -> (Store<Namespace>, impl Future<Output = ()>) {
    let (reader, writer) = reflector::store();
    let stream = watcher(Api::<Namespace>::all(client), watcher::Config::default())
        .default_backoff()
        .reflect(writer)
        .applied_objects()
        .for_each(|res| async move {
            if let Err(e) = res {
                warn!(error = %e, "Namespace watch failed");
            }
        });
    (reader, stream)
}

// --- Reconciliation Logic ---

fn policy_status(policy: &AccessPolicy) -> AccessPolicyStatus {
    let previous = policy.status.clone().unwrap_or_default();
    let valid = match validate_policy(&policy.spec) {
        Ok(()) => condition(conditions::VALID, true, "Validated", "Policy is valid"),
        Err(message) => condition(conditions::VALID, false, "InvalidSpec", message),
    };
    AccessPolicyStatus {
        conditions: conditions::merge_conditions(&previous.conditions, vec![valid]),
        observed_generation: policy.meta().generation,
    }
}

#[instrument(skip_all, fields(policy = %policy.name_any()))]
async fn reconcile(policy: Arc<AccessPolicy>, ctx: Arc<Context>) -> Result<Action, Error> {
    let api = Api::<AccessPolicy>::all(ctx.client.clone());
    let status = policy_status(&policy);
    let valid = conditions::is_true(&status.conditions, conditions::VALID);

    patch_status(&api, &policy.name_any(), &status).await?;
    ctx.backoff.reset(&backoff_key(&*policy));
    if valid {
        metrics::record_reconcile(KIND, "success");
    } else {
        warn!(reason = ?status.conditions.first().map(|c| &c.message), "AccessPolicy is invalid");
        metrics::record_reconcile(KIND, "invalid");
    }
    Ok(Action::await_change())
}

fn error_policy(policy: Arc<AccessPolicy>, error: &Error, ctx: Arc<Context>) -> Action {
    let delay = ctx.backoff.next_delay(&backoff_key(&*policy));
    warn!(policy = %policy.name_any(), error = %error, retry_in = ?delay, "AccessPolicy reconciliation failed");
    metrics::record_reconcile(KIND, "error");
    Action::requeue(delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use policy_engine::crds::ResourceRule;
    use policy_engine::AccessPolicySpec;

    fn policy(verbs: &[&str], allow: &[&str]) -> AccessPolicy {
        let mut p = AccessPolicy::new(
            "deployers",
            AccessPolicySpec {
                resource_rules: vec![ResourceRule {
                    api_groups: vec!["apps".to_string()],
                    resources: vec!["deployments".to_string()],
                    verbs: verbs.iter().map(|v| v.to_string()).collect(),
                }],
                non_resource_rules: vec![],
                allow: allow.iter().map(|a| a.to_string()).collect(),
                deny: vec![],
                namespace_selector: None,
            },
        );
        p.metadata.generation = Some(3);
        p
    }

    #[test]
    fn test_valid_policy_reports_valid_condition() {
        let status = policy_status(&policy(&["get"], &["ci"]));
        assert!(conditions::is_true(&status.conditions, conditions::VALID));
        assert_eq!(status.observed_generation, Some(3));
    }

    #[test]
    fn test_invalid_policy_reports_reason() {
        let status = policy_status(&policy(&[], &["ci"]));
        let valid = conditions::find_condition(&status.conditions, conditions::VALID).unwrap();
        assert_eq!(valid.status, "False");
        assert_eq!(valid.reason, "InvalidSpec");
    }

    #[test]
    fn test_unchanged_validity_keeps_transition_time() {
        let mut p = policy(&["get"], &["ci"]);
        let first = policy_status(&p);
        let stamped = conditions::find_condition(&first.conditions, conditions::VALID)
            .unwrap()
            .last_transition_time
            .clone();
        p.status = Some(first);

        let second = policy_status(&p);
        let again = conditions::find_condition(&second.conditions, conditions::VALID).unwrap();
        assert_eq!(again.last_transition_time, stamped);
    }
}
