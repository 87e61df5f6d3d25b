/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/modules/rbac_manager/src/lib.rs
*
* This crate holds the RBAC generation side of the authorization control
* plane. It turns RoleTemplate and BindingTemplate resources into concrete
* Kubernetes RBAC objects and keeps them in sync with the API surface the
* cluster serves.
*
* Architecture:
* - `discovery`: cached, change-notifying snapshot of the cluster's API surface.
* - `role_engine`: RoleTemplate -> ClusterRole/Role, pure rule computation plus
*   the apply/prune/cleanup steps.
* - `binding_engine`: BindingTemplate -> ClusterRoleBindings, RoleBindings and
*   reference-counted ServiceAccounts.
* - `cluster`: the `ClusterState` seam both engines write through, with a
*   kube-backed and an in-memory implementation.
* - `selector`, `conditions`: helpers shared with the policy engine and the
*   operator's controllers.
*
* SPDX-License-Identifier: Apache-2.0
*/

pub mod binding_engine;
pub mod cluster;
pub mod conditions;
pub mod crds;
pub mod discovery;
pub mod error;
pub mod role_engine;
pub mod selector;

use kube::api::ObjectMeta;
use std::collections::BTreeMap;

pub use cluster::{ClusterState, KubeClusterState, MemoryClusterState};
pub use discovery::{DiscoveryCache, DiscoverySnapshot, DiscoverySource, KubeDiscovery};
pub use error::{Error, Result};

// --- Object Markers ---

/// Standard label set on every object the operator generates.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGER_NAME: &str = "rbac-operator";
/// Field manager used for server-side apply.
pub const FIELD_MANAGER: &str = "rbac-operator";

/// Names the RoleTemplate a generated role belongs to.
pub const ROLE_TEMPLATE_LABEL: &str = "rbac.ph.io/role-template";
/// Names the BindingTemplate a generated binding belongs to.
pub const BINDING_TEMPLATE_LABEL: &str = "rbac.ph.io/binding-template";

/// JSON object whose keys are the BindingTemplates referencing a managed
/// ServiceAccount.
pub const REFERENCED_BY_ANNOTATION: &str = "rbac.ph.io/referenced-by";
/// Origin marker: set only on ServiceAccounts the operator created.
pub const CREATED_BY_ANNOTATION: &str = "rbac.ph.io/created-by";

pub const ROLE_FINALIZER: &str = "rbac.ph.io/role-cleanup";
pub const BINDING_FINALIZER: &str = "rbac.ph.io/binding-cleanup";

/// Labels for an object generated on behalf of a template.
pub fn managed_labels(template_label: &str, template_name: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGER_NAME.to_string());
    labels.insert(template_label.to_string(), template_name.to_string());
    labels
}

/// Whether an existing object belongs to the named template: it carries the
/// managed-by label and the template's label, and no controller owner
/// reference points at anything else. Objects failing this check are never
/// written or deleted.
pub fn owned_by_template(meta: &ObjectMeta, template_label: &str, template_kind: &str, template_name: &str) -> bool {
    let labels = meta.labels.as_ref();
    let label_is = |key: &str, value: &str| labels.and_then(|l| l.get(key)).is_some_and(|v| v == value);
    let foreign_controller = meta
        .owner_references
        .iter()
        .flatten()
        .filter(|o| o.controller == Some(true))
        .any(|o| o.kind != template_kind || o.name != template_name);
    label_is(MANAGED_BY_LABEL, MANAGER_NAME) && label_is(template_label, template_name) && !foreign_controller
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    fn meta(labels: BTreeMap<String, String>, controller: Option<(&str, &str)>) -> ObjectMeta {
        ObjectMeta {
            name: Some("viewer".to_string()),
            labels: Some(labels),
            owner_references: controller.map(|(kind, name)| {
                vec![OwnerReference {
                    api_version: "rbac.ph.io/v1alpha1".to_string(),
                    kind: kind.to_string(),
                    name: name.to_string(),
                    uid: "uid".to_string(),
                    controller: Some(true),
                    ..Default::default()
                }]
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_ownership_requires_both_labels() {
        let labels = managed_labels(ROLE_TEMPLATE_LABEL, "viewers");
        assert!(owned_by_template(&meta(labels, None), ROLE_TEMPLATE_LABEL, "RoleTemplate", "viewers"));
        assert!(!owned_by_template(&meta(BTreeMap::new(), None), ROLE_TEMPLATE_LABEL, "RoleTemplate", "viewers"));

        let other = managed_labels(ROLE_TEMPLATE_LABEL, "editors");
        assert!(!owned_by_template(&meta(other, None), ROLE_TEMPLATE_LABEL, "RoleTemplate", "viewers"));
    }

    #[test]
    fn test_foreign_controller_reference_is_not_owned() {
        let labels = managed_labels(ROLE_TEMPLATE_LABEL, "viewers");
        let ours = meta(labels.clone(), Some(("RoleTemplate", "viewers")));
        assert!(owned_by_template(&ours, ROLE_TEMPLATE_LABEL, "RoleTemplate", "viewers"));

        let theirs = meta(labels, Some(("Deployment", "viewers")));
        assert!(!owned_by_template(&theirs, ROLE_TEMPLATE_LABEL, "RoleTemplate", "viewers"));
    }
}
