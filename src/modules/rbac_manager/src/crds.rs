/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/modules/rbac_manager/src/crds.rs
*
* This file defines the Rust data structures that correspond to the
* RoleTemplate and BindingTemplate Custom Resource Definitions. By using the
* `kube::CustomResource` derive macro we get strongly-typed representations of
* both APIs, which the engines and the operator's controllers share.
*
* Architecture:
* - Both kinds are cluster-scoped. A RoleTemplate produces exactly one
*   ClusterRole or Role; a BindingTemplate produces any number of
*   ClusterRoleBindings and RoleBindings plus, optionally, ServiceAccounts.
* - The user's desired state (`spec`) is kept separate from the operator's
*   observed state (`status`), which carries the condition set recomputed on
*   every reconciliation.
* - `NamespaceSelector` and `LabelSelector` are shared with the AccessPolicy
*   kind defined by the policy engine.
* - `serde` attributes map between Rust `snake_case` and Kubernetes
*   `camelCase`; `schemars` generates the OpenAPI v3 schema embedded into
*   the CRD manifests.
*
* SPDX-License-Identifier: Apache-2.0
*/

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// API group served by every custom resource of the operator.
pub const API_GROUP: &str = "rbac.ph.io";
pub const API_VERSION: &str = "rbac.ph.io/v1alpha1";

// --- Shared Types ---

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatusCondition {
    #[serde(rename = "type")]
    pub type_: String,
    /// One of `True`, `False` or `Unknown`.
    pub status: String,
    pub reason: String,
    pub message: String,
    pub last_transition_time: String,
}

/// Kind of RBAC role an object generates or refers to.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Default, Hash, PartialOrd, Ord)]
pub enum RoleKind {
    #[default]
    ClusterRole,
    Role,
}

impl RoleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoleKind::ClusterRole => "ClusterRole",
            RoleKind::Role => "Role",
        }
    }
}

/// Selects namespaces by explicit name, by label, or both. An entry matches
/// the union of its explicit names and its label matches.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceSelector {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,
    /// An empty selector (`{}`) matches every namespace; an absent one matches
    /// no namespace by labels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<LabelSelector>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelectorRequirement {
    pub key: String,
    /// `In`, `NotIn`, `Exists` or `DoesNotExist`.
    pub operator: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

// --- RoleTemplate Custom Resource Definition ---

/// # RoleTemplate
/// Declares a role whose rules are generated from the API surface the cluster
/// currently serves, minus the excluded groups, resources and verbs.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "rbac.ph.io",
    version = "v1alpha1",
    kind = "RoleTemplate",
    status = "RoleTemplateStatus",
    printcolumn = r#"{"name":"Kind", "type":"string", "jsonPath":".spec.targetKind"}"#,
    printcolumn = r#"{"name":"Target", "type":"string", "jsonPath":".spec.targetName"}"#,
    printcolumn = r#"{"name":"Rules", "type":"integer", "jsonPath":".status.ruleCount"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#,
    shortname = "rtpl"
)]
#[serde(rename_all = "camelCase")]
pub struct RoleTemplateSpec {
    #[serde(default)]
    pub target_kind: RoleKind,
    pub target_name: String,
    /// Required for `Role`, must be absent for `ClusterRole`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_namespace: Option<String>,
    #[serde(default)]
    pub scope: RoleScope,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_groups: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_resources: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_verbs: Vec<String>,
}

/// Which resources the generated role enumerates.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Default)]
pub enum RoleScope {
    /// Every resource the cluster serves.
    #[default]
    Cluster,
    /// Only namespace-scoped resources.
    Namespaced,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct RoleTemplateStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<StatusCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_role: Option<GeneratedRoleRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedRoleRef {
    pub kind: RoleKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl std::fmt::Display for GeneratedRoleRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind.as_str(), ns, self.name),
            None => write!(f, "{}/{}", self.kind.as_str(), self.name),
        }
    }
}

// --- BindingTemplate Custom Resource Definition ---

/// # BindingTemplate
/// Binds a list of subjects to roles, cluster-wide and/or in every namespace
/// matched by a set of namespace selectors. ServiceAccount subjects may ask to
/// be created; such accounts are shared between templates and removed once no
/// template names them any more.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "rbac.ph.io",
    version = "v1alpha1",
    kind = "BindingTemplate",
    status = "BindingTemplateStatus",
    printcolumn = r#"{"name":"Bindings", "type":"integer", "jsonPath":".status.bindingCount"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#,
    shortname = "btpl"
)]
#[serde(rename_all = "camelCase")]
pub struct BindingTemplateSpec {
    /// Prefix of every generated binding name. Defaults to the template name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_name: Option<String>,
    pub subjects: Vec<SubjectSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cluster_bindings: Vec<ClusterBindingGroup>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespace_bindings: Vec<NamespaceBindingGroup>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubjectSpec {
    pub kind: SubjectKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Only valid for ServiceAccount subjects.
    #[serde(default)]
    pub create: bool,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum SubjectKind {
    User,
    Group,
    ServiceAccount,
}

impl SubjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectKind::User => "User",
            SubjectKind::Group => "Group",
            SubjectKind::ServiceAccount => "ServiceAccount",
        }
    }
}

/// One ClusterRoleBinding is generated per listed ClusterRole.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterBindingGroup {
    pub roles: Vec<String>,
}

/// One RoleBinding is generated per (matched namespace, role).
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceBindingGroup {
    pub roles: Vec<String>,
    #[serde(default)]
    pub role_kind: RoleKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespace_selectors: Vec<NamespaceSelector>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct BindingTemplateStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<StatusCondition>,
    #[serde(default)]
    pub generated_service_accounts: Vec<ServiceAccountRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binding_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccountRef {
    pub name: String,
    pub namespace: String,
}

impl std::fmt::Display for ServiceAccountRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl BindingTemplate {
    /// Name prefix for generated bindings.
    pub fn target_name(&self) -> String {
        use kube::ResourceExt;
        self.spec
            .target_name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| self.name_any())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_template_deserializes_with_defaults() {
        let spec: BindingTemplateSpec = serde_json::from_value(serde_json::json!({
            "subjects": [
                {"kind": "User", "name": "alice"},
                {"kind": "ServiceAccount", "name": "ci", "namespace": "build", "create": true}
            ],
            "namespaceBindings": [
                {"roles": ["edit"], "namespaceSelectors": [{"labelSelector": {"matchLabels": {"team": "a"}}}]}
            ]
        }))
        .unwrap();

        assert_eq!(spec.subjects.len(), 2);
        assert!(!spec.subjects[0].create);
        assert!(spec.subjects[1].create);
        assert!(spec.cluster_bindings.is_empty());
        assert_eq!(spec.namespace_bindings[0].role_kind, RoleKind::ClusterRole);
        let selector = spec.namespace_bindings[0].namespace_selectors[0]
            .label_selector
            .as_ref()
            .unwrap();
        assert_eq!(selector.match_labels.get("team").map(String::as_str), Some("a"));
    }

    #[test]
    fn test_target_name_falls_back_to_object_name() {
        let tmpl = BindingTemplate::new(
            "devs",
            BindingTemplateSpec {
                target_name: None,
                subjects: vec![],
                cluster_bindings: vec![],
                namespace_bindings: vec![],
            },
        );
        assert_eq!(tmpl.target_name(), "devs");

        let mut named = tmpl.clone();
        named.spec.target_name = Some("platform".to_string());
        assert_eq!(named.target_name(), "platform");
    }

    #[test]
    fn test_role_template_defaults() {
        let spec: RoleTemplateSpec =
            serde_json::from_value(serde_json::json!({"targetName": "readers"})).unwrap();
        assert_eq!(spec.target_kind, RoleKind::ClusterRole);
        assert_eq!(spec.scope, RoleScope::Cluster);
        assert!(spec.exclude_verbs.is_empty());
    }
}
