/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/modules/policy_engine/src/decision.rs
*
* This file implements the authorization decision engine.
*
* Architecture:
* - The engine is a pure function over a `PolicySource` and a request. It keeps
*   no state between calls, so any number of requests can be evaluated
*   concurrently against the same source.
* - Policies are visited in name order. The first applicable policy that
*   denies one of the request's principals ends the evaluation with Deny.
*   Otherwise the first applicable policy that allows one of them yields
*   Allow, and a request no policy speaks about yields Abstain.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::crds::AccessPolicy;
use crate::matching::{namespace_admits, non_resource_rule_matches, resource_rule_matches};
use crate::request::{AccessRequest, RequestAttributes, Verdict};
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Read access to the state the engine evaluates against.
pub trait PolicySource: Send + Sync {
    /// Every known policy, in any order.
    fn policies(&self) -> Vec<Arc<AccessPolicy>>;
    /// Labels of a namespace, `None` when it is not known.
    fn namespace_labels(&self, namespace: &str) -> Option<BTreeMap<String, String>>;
}

/// Whether `policy` speaks about `request` at all.
pub fn applies(policy: &AccessPolicy, request: &AccessRequest, source: &dyn PolicySource) -> bool {
    match &request.attributes {
        RequestAttributes::Resource(res) => {
            let namespace = res.namespace.as_deref();
            let labels = namespace.and_then(|ns| source.namespace_labels(ns));
            namespace_admits(&policy.spec, namespace, labels.as_ref())
                && policy.spec.resource_rules.iter().any(|r| resource_rule_matches(r, res))
        }
        RequestAttributes::NonResource(nr) => policy
            .spec
            .non_resource_rules
            .iter()
            .any(|r| non_resource_rule_matches(r, nr)),
    }
}

pub fn decide(source: &dyn PolicySource, request: &AccessRequest) -> Verdict {
    let mut policies = source.policies();
    policies.sort_by_key(|p| p.name_any());

    let mut allowed_by: Option<String> = None;
    let mut applicable = 0usize;
    for policy in &policies {
        if !applies(policy, request, source) {
            continue;
        }
        applicable += 1;
        if request.has_principal_in(&policy.spec.deny) {
            debug!(policy = %policy.name_any(), user = %request.user, "Request denied");
            return Verdict::deny(format!("denied by AccessPolicy {}", policy.name_any()));
        }
        if allowed_by.is_none() && request.has_principal_in(&policy.spec.allow) {
            allowed_by = Some(policy.name_any());
        }
    }

    match allowed_by {
        Some(name) => Verdict::allow(format!("allowed by AccessPolicy {}", name)),
        None if applicable == 0 => Verdict::abstain("no AccessPolicy applies to this request"),
        None => Verdict::abstain(format!(
            "{} AccessPolicy(s) apply but none names the requester",
            applicable
        )),
    }
}

/// Fixed policies and namespaces.
#[derive(Clone, Default)]
pub struct StaticPolicies {
    policies: Vec<Arc<AccessPolicy>>,
    namespaces: BTreeMap<String, BTreeMap<String, String>>,
}

impl StaticPolicies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(mut self, policy: AccessPolicy) -> Self {
        self.policies.push(Arc::new(policy));
        self
    }

    pub fn with_namespace(mut self, name: &str, labels: &[(&str, &str)]) -> Self {
        self.namespaces.insert(
            name.to_string(),
            labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        );
        self
    }
}

impl PolicySource for StaticPolicies {
    fn policies(&self) -> Vec<Arc<AccessPolicy>> {
        self.policies.clone()
    }

    fn namespace_labels(&self, namespace: &str) -> Option<BTreeMap<String, String>> {
        self.namespaces.get(namespace).cloned()
    }
}
