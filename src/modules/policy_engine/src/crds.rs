/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/modules/policy_engine/src/crds.rs
*
* The AccessPolicy custom resource. A policy lists the requests it applies to
* (resource and non-resource rules, optionally restricted to the namespaces a
* selector matches) and the principals it allows or denies.
*
* SPDX-License-Identifier: Apache-2.0
*/

use kube::CustomResource;
use rbac_manager::crds::{NamespaceSelector, StatusCondition};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// # AccessPolicy
/// Declarative allow/deny policy evaluated by the authorizer webhook.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "rbac.ph.io",
    version = "v1alpha1",
    kind = "AccessPolicy",
    status = "AccessPolicyStatus",
    printcolumn = r#"{"name":"Valid", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Valid\")].status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#,
    shortname = "apol"
)]
#[serde(rename_all = "camelCase")]
pub struct AccessPolicySpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_rules: Vec<ResourceRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub non_resource_rules: Vec<NonResourceRule>,
    /// User or group names granted access by this policy.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow: Vec<String>,
    /// User or group names refused access. Deny wins over any allow.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deny: Vec<String>,
    /// Restricts resource rules to matching namespaces. Cluster-scoped
    /// requests never match a policy that sets it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<NamespaceSelector>,
}

/// `*` matches every value of a field. Resources use `resource/subresource`
/// and `resource/*` for every subresource of `resource`.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRule {
    pub api_groups: Vec<String>,
    pub resources: Vec<String>,
    pub verbs: Vec<String>,
}

/// Paths match exactly, `*` matches every path and a trailing `*` matches any
/// suffix.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NonResourceRule {
    pub verbs: Vec<String>,
    pub paths: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct AccessPolicyStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<StatusCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
