/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/modules/rbac_manager/src/role_engine.rs
*
* This file implements the role engine, which expands a `RoleTemplate` into
* the rules of one ClusterRole or Role.
*
* Architecture:
* - `compute_rules` is a pure function of (spec, discovery snapshot). It walks
*   the verb table of the snapshot, drops excluded groups, resources and
*   verbs, and collapses resources of the same group that share a verb set
*   into a single rule. Its output is sorted, so two passes over the same
*   snapshot produce identical roles and server-side apply becomes a no-op.
* - `reconcile` applies the role and prunes any role this template generated
*   earlier under a different name, kind or namespace. A target that already
*   exists without this template's markers is refused with
*   `Error::TargetNotManaged`; built-in or hand-written roles are never
*   overwritten.
* - `cleanup` runs behind the `rbac.ph.io/role-cleanup` finalizer and removes
*   the roles owned by the template.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::cluster::{ClusterState, LabelMatch};
use crate::conditions::{self, condition};
use crate::crds::{GeneratedRoleRef, RoleKind, RoleScope, RoleTemplate, RoleTemplateSpec, RoleTemplateStatus};
use crate::discovery::{DiscoveryCache, DiscoverySnapshot};
use crate::error::{Error, Result};
use crate::{managed_labels, owned_by_template, MANAGED_BY_LABEL, MANAGER_NAME, ROLE_TEMPLATE_LABEL};
use k8s_openapi::api::rbac::v1::{ClusterRole, PolicyRule, Role};
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, instrument};

/// The role a template produced on its last successful pass.
#[derive(Clone, Debug, PartialEq)]
pub struct GeneratedRole {
    pub reference: GeneratedRoleRef,
    pub rules: Vec<PolicyRule>,
}

/// Rejects templates that can never produce a valid role.
pub fn validate(spec: &RoleTemplateSpec) -> Result<()> {
    if spec.target_name.trim().is_empty() {
        return Err(Error::InvalidSpec("targetName must not be empty".to_string()));
    }
    let has_namespace = spec.target_namespace.as_deref().is_some_and(|ns| !ns.is_empty());
    match spec.target_kind {
        RoleKind::Role if !has_namespace => Err(Error::InvalidSpec(
            "targetNamespace is required when targetKind is Role".to_string(),
        )),
        RoleKind::Role if spec.scope == RoleScope::Cluster => Err(Error::InvalidSpec(
            "a Role cannot grant cluster-scoped resources, use scope Namespaced".to_string(),
        )),
        RoleKind::ClusterRole if has_namespace => Err(Error::InvalidSpec(
            "targetNamespace must not be set when targetKind is ClusterRole".to_string(),
        )),
        _ => Ok(()),
    }
}

fn resource_excluded(resource: &str, excluded: &[String]) -> bool {
    excluded.iter().any(|ex| {
        resource == ex
            || resource
                .strip_prefix(ex.as_str())
                .is_some_and(|rest| rest.starts_with('/'))
    })
}

/// Computes the canonical rule set for a template against a snapshot.
pub fn compute_rules(spec: &RoleTemplateSpec, snapshot: &DiscoverySnapshot) -> Result<Vec<PolicyRule>> {
    if snapshot.is_empty() {
        return Err(Error::EmptyDiscovery);
    }

    let table = snapshot.verb_table(spec.scope == RoleScope::Namespaced);

    // (group, verbs) -> resources
    let mut collapsed: BTreeMap<(String, Vec<String>), BTreeSet<String>> = BTreeMap::new();
    for ((group, resource), verbs) in table {
        if spec.exclude_groups.contains(&group) || resource_excluded(&resource, &spec.exclude_resources) {
            continue;
        }
        let verbs: Vec<String> = verbs
            .into_iter()
            .filter(|v| !spec.exclude_verbs.contains(v))
            .collect();
        if verbs.is_empty() {
            continue;
        }
        collapsed.entry((group, verbs)).or_default().insert(resource);
    }

    Ok(collapsed
        .into_iter()
        .map(|((group, verbs), resources)| PolicyRule {
            api_groups: Some(vec![group]),
            resources: Some(resources.into_iter().collect()),
            verbs,
            ..Default::default()
        })
        .collect())
}

/// Where the template's role lives.
pub fn target_ref(spec: &RoleTemplateSpec) -> GeneratedRoleRef {
    GeneratedRoleRef {
        kind: spec.target_kind,
        name: spec.target_name.clone(),
        namespace: match spec.target_kind {
            RoleKind::Role => spec.target_namespace.clone(),
            RoleKind::ClusterRole => None,
        },
    }
}

fn object_meta(template: &RoleTemplate, target: &GeneratedRoleRef) -> ObjectMeta {
    ObjectMeta {
        name: Some(target.name.clone()),
        namespace: target.namespace.clone(),
        labels: Some(managed_labels(ROLE_TEMPLATE_LABEL, &template.name_any())),
        owner_references: template.controller_owner_ref(&()).map(|o| vec![o]),
        ..Default::default()
    }
}

fn owns(template_name: &str, meta: &ObjectMeta) -> bool {
    owned_by_template(meta, ROLE_TEMPLATE_LABEL, &RoleTemplate::kind(&()), template_name)
}

/// Fails when the target exists and belongs to someone else.
async fn ensure_claimable(template_name: &str, target: &GeneratedRoleRef, cluster: &dyn ClusterState) -> Result<()> {
    let existing = match (target.kind, target.namespace.as_deref()) {
        (RoleKind::ClusterRole, _) => cluster.get_cluster_role(&target.name).await?.map(|r| r.metadata),
        (RoleKind::Role, Some(ns)) => cluster.get_role(ns, &target.name).await?.map(|r| r.metadata),
        (RoleKind::Role, None) => None,
    };
    match existing {
        Some(meta) if !owns(template_name, &meta) => Err(Error::TargetNotManaged(target.to_string())),
        _ => Ok(()),
    }
}

fn template_selector(template_name: &str) -> LabelMatch {
    let mut labels = LabelMatch::new();
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGER_NAME.to_string());
    labels.insert(ROLE_TEMPLATE_LABEL.to_string(), template_name.to_string());
    labels
}

/// Applies the role for `template` and prunes roles it generated before under
/// another identity. Nothing is written when discovery has no usable snapshot.
#[instrument(skip(template, discovery, cluster), fields(template = %template.name_any()))]
pub async fn reconcile(
    template: &RoleTemplate,
    discovery: &DiscoveryCache,
    cluster: &dyn ClusterState,
) -> Result<GeneratedRole> {
    validate(&template.spec)?;
    let snapshot = discovery.current()?;
    let rules = compute_rules(&template.spec, &snapshot)?;
    let target = target_ref(&template.spec);
    ensure_claimable(&template.name_any(), &target, cluster).await?;
    let meta = object_meta(template, &target);

    match target.kind {
        RoleKind::ClusterRole => {
            cluster
                .apply_cluster_role(ClusterRole {
                    metadata: meta,
                    rules: Some(rules.clone()),
                    ..Default::default()
                })
                .await?
        }
        RoleKind::Role => {
            cluster
                .apply_role(Role {
                    metadata: meta,
                    rules: Some(rules.clone()),
                })
                .await?
        }
    }
    info!(kind = target.kind.as_str(), role = %target.name, rules = rules.len(), "Applied generated role");

    prune(template, &target, cluster).await?;

    Ok(GeneratedRole { reference: target, rules })
}

async fn prune(template: &RoleTemplate, keep: &GeneratedRoleRef, cluster: &dyn ClusterState) -> Result<()> {
    let template_name = template.name_any();
    let labels = template_selector(&template_name);

    for role in cluster.list_cluster_roles(&labels).await? {
        let name = role.name_any();
        if !owns(&template_name, &role.metadata) || (keep.kind == RoleKind::ClusterRole && keep.name == name) {
            continue;
        }
        debug!(role = %name, "Pruning stale generated ClusterRole");
        cluster.delete_cluster_role(&name).await?;
    }

    for role in cluster.list_roles(&labels).await? {
        let name = role.name_any();
        let ns = role.namespace().unwrap_or_default();
        if !owns(&template_name, &role.metadata) {
            continue;
        }
        if keep.kind == RoleKind::Role && keep.name == name && keep.namespace.as_deref() == Some(ns.as_str()) {
            continue;
        }
        debug!(role = %name, namespace = %ns, "Pruning stale generated Role");
        cluster.delete_role(&ns, &name).await?;
    }
    Ok(())
}

/// Deletes every role owned by the template.
#[instrument(skip(template, cluster), fields(template = %template.name_any()))]
pub async fn cleanup(template: &RoleTemplate, cluster: &dyn ClusterState) -> Result<()> {
    let template_name = template.name_any();
    let labels = template_selector(&template_name);
    for role in cluster.list_cluster_roles(&labels).await? {
        if owns(&template_name, &role.metadata) {
            cluster.delete_cluster_role(&role.name_any()).await?;
        }
    }
    for role in cluster.list_roles(&labels).await? {
        if !owns(&template_name, &role.metadata) {
            continue;
        }
        cluster
            .delete_role(&role.namespace().unwrap_or_default(), &role.name_any())
            .await?;
    }
    info!("Removed generated roles");
    Ok(())
}

/// Status after a successful pass.
pub fn applied_status(template: &RoleTemplate, generated: &GeneratedRole) -> RoleTemplateStatus {
    let previous = template.status.clone().unwrap_or_default();
    let created = condition(
        conditions::CREATED,
        true,
        "Reconciled",
        format!(
            "{} {} generated with {} rule(s)",
            generated.reference.kind.as_str(),
            generated.reference.name,
            generated.rules.len()
        ),
    );
    RoleTemplateStatus {
        conditions: conditions::merge_conditions(&previous.conditions, vec![created]),
        generated_role: Some(generated.reference.clone()),
        rule_count: Some(generated.rules.len() as u32),
        observed_generation: template.meta().generation,
    }
}

/// Status after a failed pass. The last generated role stays recorded since a
/// failed pass never deletes it.
pub fn failed_status(template: &RoleTemplate, error: &Error) -> RoleTemplateStatus {
    let previous = template.status.clone().unwrap_or_default();
    let created = condition(conditions::CREATED, false, error.reason(), error.to_string());
    RoleTemplateStatus {
        conditions: conditions::merge_conditions(&previous.conditions, vec![created]),
        observed_generation: if error.is_terminal() {
            template.meta().generation
        } else {
            previous.observed_generation
        },
        ..previous
    }
}
