/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/modules/rbac_manager/src/binding_engine.rs
*
* This file implements the binding engine, which expands a `BindingTemplate`
* into ClusterRoleBindings, RoleBindings and auto-managed ServiceAccounts.
*
* Architecture:
* - `plan` is pure: it resolves namespace selectors against the live namespace
*   set and returns every binding the template wants, keyed by the
*   deterministic name `binding_name(target, role)`.
* - ServiceAccounts requested with `create: true` are shared between
*   templates. Each managed account carries the `rbac.ph.io/referenced-by`
*   annotation, a JSON object whose keys are the templates referencing it.
*   Acquiring and releasing a reference is a read-modify-write guarded by the
*   object's `resourceVersion`; a conflict re-reads and tries again. An
*   account is deleted only when its reference set becomes empty and it
*   carries the `rbac.ph.io/created-by` origin marker, so accounts that existed
*   before the operator are never modified or removed.
* - Before anything is written, every planned binding name is checked
*   against the live objects. A name held by another template, or by an
*   object the operator never created, fails the pass with
*   `Error::TargetNotManaged` instead of being taken over.
* - The accounts a template holds are found by listing managed accounts
*   whose reference annotation names it, so a reference survives a lost
*   status update and is still released later.
* - `reconcile` keeps going after a failed write. Successes are kept, failures
*   are returned in the outcome together with the status to publish, and the
*   controller retries the remainder.
* - `cleanup` runs behind the `rbac.ph.io/binding-cleanup` finalizer.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::cluster::{ClusterState, LabelMatch};
use crate::conditions::{self, condition};
use crate::crds::{
    BindingTemplate, BindingTemplateSpec, BindingTemplateStatus, RoleKind, ServiceAccountRef, SubjectKind,
};
use crate::error::{Error, Result};
use crate::selector;
use crate::{
    managed_labels, owned_by_template, BINDING_TEMPLATE_LABEL, CREATED_BY_ANNOTATION, MANAGED_BY_LABEL, MANAGER_NAME,
    REFERENCED_BY_ANNOTATION,
};
use k8s_openapi::api::core::v1::{Namespace, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, instrument, warn};

const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";
const MAX_CONFLICT_RETRIES: usize = 5;

/// Name of the binding generated for `role` under `target`.
pub fn binding_name(target: &str, role: &str) -> String {
    format!("{}-{}", target, role)
}

// --- Validation ---

pub fn validate(template: &BindingTemplate) -> Result<()> {
    let spec = &template.spec;
    if template.target_name().trim().is_empty() {
        return Err(Error::InvalidSpec("target name must not be empty".to_string()));
    }
    for subject in &spec.subjects {
        if subject.name.trim().is_empty() {
            return Err(Error::InvalidSpec(format!(
                "{} subject with an empty name",
                subject.kind.as_str()
            )));
        }
        match subject.kind {
            SubjectKind::ServiceAccount => {
                if subject.namespace.as_deref().map_or(true, str::is_empty) {
                    return Err(Error::InvalidSpec(format!(
                        "ServiceAccount subject '{}' requires a namespace",
                        subject.name
                    )));
                }
            }
            _ if subject.create => {
                return Err(Error::InvalidSpec(format!(
                    "create is only supported for ServiceAccount subjects, not {} '{}'",
                    subject.kind.as_str(),
                    subject.name
                )));
            }
            _ => {}
        }
    }
    for (i, group) in spec.cluster_bindings.iter().enumerate() {
        if group.roles.is_empty() {
            return Err(Error::InvalidSpec(format!("clusterBindings[{}] lists no roles", i)));
        }
    }
    for (i, group) in spec.namespace_bindings.iter().enumerate() {
        if group.roles.is_empty() {
            return Err(Error::InvalidSpec(format!("namespaceBindings[{}] lists no roles", i)));
        }
        if group.namespaces.is_empty() && group.namespace_selectors.is_empty() {
            return Err(Error::InvalidSpec(format!(
                "namespaceBindings[{}] has neither namespaces nor namespaceSelectors",
                i
            )));
        }
        for sel in &group.namespace_selectors {
            selector::validate_namespace_selector(sel)?;
        }
    }
    Ok(())
}

// --- Planning ---

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlannedClusterBinding {
    pub name: String,
    pub role: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlannedRoleBinding {
    pub namespace: String,
    pub name: String,
    pub role_kind: RoleKind,
    pub role: String,
}

/// Every binding a template wants, keyed by name (and namespace).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BindingPlan {
    pub cluster_bindings: BTreeMap<String, PlannedClusterBinding>,
    pub role_bindings: BTreeMap<(String, String), PlannedRoleBinding>,
}

impl BindingPlan {
    pub fn len(&self) -> usize {
        self.cluster_bindings.len() + self.role_bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn namespace_labels(ns: &Namespace) -> BTreeMap<String, String> {
    ns.metadata.labels.clone().unwrap_or_default()
}

/// Resolves the template against the live namespace set.
pub fn plan(template: &BindingTemplate, namespaces: &[Namespace]) -> BindingPlan {
    let target = template.target_name();
    let mut plan = BindingPlan::default();

    for group in &template.spec.cluster_bindings {
        for role in &group.roles {
            let name = binding_name(&target, role);
            plan.cluster_bindings
                .entry(name.clone())
                .or_insert_with(|| PlannedClusterBinding { name, role: role.clone() });
        }
    }

    let live: Vec<(String, BTreeMap<String, String>)> = namespaces
        .iter()
        .map(|ns| (ns.name_any(), namespace_labels(ns)))
        .collect();

    for group in &template.spec.namespace_bindings {
        let resolved = selector::resolve_namespaces(
            &group.namespaces,
            &group.namespace_selectors,
            live.iter().map(|(n, l)| (n.as_str(), l)),
        );
        for ns in resolved {
            for role in &group.roles {
                let name = binding_name(&target, role);
                let key = (ns.clone(), name.clone());
                if plan.role_bindings.contains_key(&key) {
                    debug!(namespace = %ns, binding = %name, "Binding already planned by an earlier group");
                    continue;
                }
                plan.role_bindings.insert(
                    key,
                    PlannedRoleBinding {
                        namespace: ns.clone(),
                        name,
                        role_kind: group.role_kind,
                        role: role.clone(),
                    },
                );
            }
        }
    }
    plan
}

/// Subjects rendered for the generated bindings.
pub fn subjects(spec: &BindingTemplateSpec) -> Vec<Subject> {
    spec.subjects
        .iter()
        .map(|s| match s.kind {
            SubjectKind::ServiceAccount => Subject {
                kind: s.kind.as_str().to_string(),
                name: s.name.clone(),
                namespace: s.namespace.clone(),
                api_group: Some(String::new()),
            },
            SubjectKind::User | SubjectKind::Group => Subject {
                kind: s.kind.as_str().to_string(),
                name: s.name.clone(),
                namespace: None,
                api_group: Some(RBAC_API_GROUP.to_string()),
            },
        })
        .collect()
}

/// ServiceAccounts the template asks the operator to manage.
pub fn managed_subjects(spec: &BindingTemplateSpec) -> BTreeSet<ServiceAccountRef> {
    spec.subjects
        .iter()
        .filter(|s| s.kind == SubjectKind::ServiceAccount && s.create)
        .filter_map(|s| {
            s.namespace.as_ref().map(|ns| ServiceAccountRef {
                name: s.name.clone(),
                namespace: ns.clone(),
            })
        })
        .collect()
}

/// Whether the template binds `name` of `kind` (in `namespace` for Roles).
/// Used by the controller to map role events to templates.
pub fn references_role(template: &BindingTemplate, kind: RoleKind, name: &str, namespace: Option<&str>) -> bool {
    let spec = &template.spec;
    match kind {
        RoleKind::ClusterRole => {
            spec.cluster_bindings.iter().any(|g| g.roles.iter().any(|r| r == name))
                || spec
                    .namespace_bindings
                    .iter()
                    .any(|g| g.role_kind == RoleKind::ClusterRole && g.roles.iter().any(|r| r == name))
        }
        RoleKind::Role => spec.namespace_bindings.iter().any(|g| {
            g.role_kind == RoleKind::Role
                && g.roles.iter().any(|r| r == name)
                // Namespace labels are not known here, so any label selector counts.
                && namespace.map_or(true, |ns| {
                    g.namespaces.iter().any(|n| n == ns)
                        || g.namespace_selectors
                            .iter()
                            .any(|s| s.label_selector.is_some() || selector::namespace_matches(s, ns, None))
                })
        }),
    }
}

// --- ServiceAccount Reference Counting ---

/// Whether the operator created this account.
pub fn is_managed(account: &ServiceAccount) -> bool {
    let meta = &account.metadata;
    let labelled = meta
        .labels
        .as_ref()
        .and_then(|l| l.get(MANAGED_BY_LABEL))
        .is_some_and(|v| v == MANAGER_NAME);
    let marked = meta
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(CREATED_BY_ANNOTATION));
    labelled && marked
}

/// Templates currently referencing a managed account.
pub fn referenced_by(account: &ServiceAccount) -> Result<BTreeSet<String>> {
    let raw = account
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(REFERENCED_BY_ANNOTATION));
    match raw {
        None => Ok(BTreeSet::new()),
        Some(raw) => {
            let map: Map<String, Value> = serde_json::from_str(raw)?;
            Ok(map.into_iter().map(|(k, _)| k).collect())
        }
    }
}

fn encode_references(refs: &BTreeSet<String>) -> Result<String> {
    let map: Map<String, Value> = refs
        .iter()
        .map(|r| (r.clone(), Value::Object(Map::new())))
        .collect();
    Ok(serde_json::to_string(&map)?)
}

fn set_references(account: &mut ServiceAccount, refs: &BTreeSet<String>) -> Result<()> {
    let encoded = encode_references(refs)?;
    account
        .metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(REFERENCED_BY_ANNOTATION.to_string(), encoded);
    Ok(())
}

/// Managed accounts whose reference annotation names the template.
pub async fn held_accounts(cluster: &dyn ClusterState, template_name: &str) -> Result<BTreeSet<ServiceAccountRef>> {
    let mut labels = LabelMatch::new();
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGER_NAME.to_string());
    let mut held = BTreeSet::new();
    for account in cluster.list_service_accounts(&labels).await? {
        if !is_managed(&account) {
            continue;
        }
        match referenced_by(&account) {
            Ok(refs) if refs.contains(template_name) => {
                held.insert(ServiceAccountRef {
                    name: account.name_any(),
                    namespace: account.namespace().unwrap_or_default(),
                });
            }
            Ok(_) => {}
            Err(e) => debug!(service_account = %account.name_any(), error = %e, "Skipping unreadable reference annotation"),
        }
    }
    Ok(held)
}

fn is_owner(owner: &OwnerReference, template_name: &str) -> bool {
    owner.kind == BindingTemplate::kind(&()) && owner.name == template_name
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acquired {
    Created,
    Referenced,
    /// A pre-existing account the operator does not manage; left untouched.
    Unmanaged,
}

/// Adds `template` to the reference set of the account, creating it if needed.
pub async fn acquire(
    cluster: &dyn ClusterState,
    template: &BindingTemplate,
    account: &ServiceAccountRef,
) -> Result<Acquired> {
    let template_name = template.name_any();
    let owner = template.owner_ref(&());

    for _ in 0..MAX_CONFLICT_RETRIES {
        match cluster.get_service_account(&account.namespace, &account.name).await? {
            None => {
                let mut refs = BTreeSet::new();
                refs.insert(template_name.clone());
                let mut annotations = BTreeMap::new();
                annotations.insert(CREATED_BY_ANNOTATION.to_string(), template_name.clone());
                annotations.insert(REFERENCED_BY_ANNOTATION.to_string(), encode_references(&refs)?);
                let mut labels = BTreeMap::new();
                labels.insert(MANAGED_BY_LABEL.to_string(), MANAGER_NAME.to_string());
                let new_account = ServiceAccount {
                    metadata: ObjectMeta {
                        name: Some(account.name.clone()),
                        namespace: Some(account.namespace.clone()),
                        labels: Some(labels),
                        annotations: Some(annotations),
                        owner_references: owner.clone().map(|o| vec![o]),
                        ..Default::default()
                    },
                    ..Default::default()
                };
                match cluster.create_service_account(new_account).await {
                    Ok(_) => {
                        info!(service_account = %account, "Created managed ServiceAccount");
                        return Ok(Acquired::Created);
                    }
                    // Someone created it concurrently; re-read and join.
                    Err(Error::Conflict(_)) => continue,
                    Err(e) => return Err(e),
                }
            }
            Some(existing) if !is_managed(&existing) => {
                debug!(service_account = %account, "ServiceAccount exists and is not managed, leaving it untouched");
                return Ok(Acquired::Unmanaged);
            }
            Some(mut existing) => {
                let mut refs = referenced_by(&existing)?;
                if refs.contains(&template_name) {
                    return Ok(Acquired::Referenced);
                }
                refs.insert(template_name.clone());
                set_references(&mut existing, &refs)?;
                if let Some(owner) = &owner {
                    let owners = existing.metadata.owner_references.get_or_insert_with(Vec::new);
                    if !owners.iter().any(|o| o.uid == owner.uid) {
                        owners.push(owner.clone());
                    }
                }
                match cluster.replace_service_account(existing).await {
                    Ok(_) => {
                        debug!(service_account = %account, references = refs.len(), "Added reference");
                        return Ok(Acquired::Referenced);
                    }
                    Err(Error::Conflict(_)) => continue,
                    Err(e) => return Err(e),
                }
            }
        }
    }
    Err(Error::Conflict(account.to_string()))
}

/// Removes `template_name` from the reference set of the account and deletes
/// the account once nothing references it. Returns whether it was deleted.
pub async fn release(cluster: &dyn ClusterState, template_name: &str, account: &ServiceAccountRef) -> Result<bool> {
    for _ in 0..MAX_CONFLICT_RETRIES {
        let Some(mut existing) = cluster.get_service_account(&account.namespace, &account.name).await? else {
            return Ok(false);
        };
        if !is_managed(&existing) {
            return Ok(false);
        }
        let mut refs = referenced_by(&existing)?;
        let removed = refs.remove(template_name);

        if refs.is_empty() {
            let rv = existing.metadata.resource_version.clone();
            match cluster
                .delete_service_account(&account.namespace, &account.name, rv)
                .await
            {
                Ok(()) => {
                    info!(service_account = %account, "Deleted unreferenced managed ServiceAccount");
                    return Ok(true);
                }
                Err(Error::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        if !removed {
            return Ok(false);
        }

        set_references(&mut existing, &refs)?;
        if let Some(owners) = existing.metadata.owner_references.as_mut() {
            owners.retain(|o| !is_owner(o, template_name));
        }
        match cluster.replace_service_account(existing).await {
            Ok(_) => {
                debug!(service_account = %account, remaining = refs.len(), "Released reference");
                return Ok(false);
            }
            Err(Error::Conflict(_)) => continue,
            Err(e) => return Err(e),
        }
    }
    Err(Error::Conflict(account.to_string()))
}

// --- Reconciliation ---

/// Result of a pass: the status to publish and what could not be applied.
#[derive(Clone, Debug)]
pub struct BindingOutcome {
    pub status: BindingTemplateStatus,
    pub failures: Vec<String>,
}

impl BindingOutcome {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

fn template_selector(template_name: &str) -> LabelMatch {
    let mut labels = LabelMatch::new();
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGER_NAME.to_string());
    labels.insert(BINDING_TEMPLATE_LABEL.to_string(), template_name.to_string());
    labels
}

fn owns(template_name: &str, meta: &ObjectMeta) -> bool {
    owned_by_template(meta, BINDING_TEMPLATE_LABEL, &BindingTemplate::kind(&()), template_name)
}

/// Fails when a planned binding name is already taken by an object this
/// template does not own.
async fn ensure_claimable(template_name: &str, plan: &BindingPlan, cluster: &dyn ClusterState) -> Result<()> {
    let mut taken = Vec::new();
    for name in plan.cluster_bindings.keys() {
        if let Some(existing) = cluster.get_cluster_role_binding(name).await? {
            if !owns(template_name, &existing.metadata) {
                taken.push(format!("ClusterRoleBinding/{}", name));
            }
        }
    }
    for (ns, name) in plan.role_bindings.keys() {
        if let Some(existing) = cluster.get_role_binding(ns, name).await? {
            if !owns(template_name, &existing.metadata) {
                taken.push(format!("RoleBinding/{}/{}", ns, name));
            }
        }
    }
    if taken.is_empty() {
        Ok(())
    } else {
        Err(Error::TargetNotManaged(taken.join(", ")))
    }
}

fn binding_meta(template: &BindingTemplate, name: &str, namespace: Option<&str>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        labels: Some(managed_labels(BINDING_TEMPLATE_LABEL, &template.name_any())),
        owner_references: template.controller_owner_ref(&()).map(|o| vec![o]),
        ..Default::default()
    }
}

fn role_ref(kind: RoleKind, name: &str) -> RoleRef {
    RoleRef {
        api_group: RBAC_API_GROUP.to_string(),
        kind: kind.as_str().to_string(),
        name: name.to_string(),
    }
}

#[instrument(skip(template, cluster), fields(template = %template.name_any()))]
pub async fn reconcile(template: &BindingTemplate, cluster: &dyn ClusterState) -> Result<BindingOutcome> {
    validate(template)?;
    let template_name = template.name_any();
    let previous = template.status.clone().unwrap_or_default();
    let mut failures = Vec::new();

    let namespaces = if template.spec.namespace_bindings.is_empty() {
        Vec::new()
    } else {
        cluster.list_namespaces().await?
    };
    let plan = plan(template, &namespaces);
    ensure_claimable(&template_name, &plan, cluster).await?;

    // 1. ServiceAccount references.
    let wanted = managed_subjects(&template.spec);
    let mut held = BTreeSet::new();
    for account in &wanted {
        match acquire(cluster, template, account).await {
            Ok(Acquired::Unmanaged) => {}
            Ok(_) => {
                held.insert(account.clone());
            }
            Err(e) => {
                warn!(service_account = %account, error = %e, "Failed to acquire ServiceAccount reference");
                failures.push(format!("ServiceAccount {}: {}", account, e));
                // Keep it listed so a later pass or cleanup releases it.
                held.insert(account.clone());
            }
        }
    }
    let mut previously_held: BTreeSet<ServiceAccountRef> =
        previous.generated_service_accounts.iter().cloned().collect();
    match held_accounts(cluster, &template_name).await {
        Ok(listed) => previously_held.extend(listed),
        Err(e) => {
            warn!(error = %e, "Failed to list held ServiceAccounts");
            failures.push(format!("ServiceAccount listing: {}", e));
        }
    }
    for stale in previously_held.iter().filter(|a| !wanted.contains(*a)) {
        if let Err(e) = release(cluster, &template_name, stale).await {
            warn!(service_account = %stale, error = %e, "Failed to release ServiceAccount reference");
            failures.push(format!("ServiceAccount {}: {}", stale, e));
            held.insert(stale.clone());
        }
    }

    // 2. Bindings.
    let subjects = subjects(&template.spec);
    let mut applied = 0u32;
    for planned in plan.cluster_bindings.values() {
        let binding = ClusterRoleBinding {
            metadata: binding_meta(template, &planned.name, None),
            role_ref: role_ref(RoleKind::ClusterRole, &planned.role),
            subjects: Some(subjects.clone()),
        };
        match cluster.apply_cluster_role_binding(binding).await {
            Ok(()) => applied += 1,
            Err(e) => {
                warn!(binding = %planned.name, error = %e, "Failed to apply ClusterRoleBinding");
                failures.push(format!("ClusterRoleBinding {}: {}", planned.name, e));
            }
        }
    }
    for planned in plan.role_bindings.values() {
        let binding = RoleBinding {
            metadata: binding_meta(template, &planned.name, Some(&planned.namespace)),
            role_ref: role_ref(planned.role_kind, &planned.role),
            subjects: Some(subjects.clone()),
        };
        match cluster.apply_role_binding(binding).await {
            Ok(()) => applied += 1,
            Err(e) => {
                warn!(binding = %planned.name, namespace = %planned.namespace, error = %e, "Failed to apply RoleBinding");
                failures.push(format!("RoleBinding {}/{}: {}", planned.namespace, planned.name, e));
            }
        }
    }

    // 3. Stale bindings.
    if let Err(e) = prune(&template_name, &plan, cluster).await {
        warn!(error = %e, "Failed to prune stale bindings");
        failures.push(format!("prune: {}", e));
    }

    // 4. Role references.
    let missing = match missing_roles(&plan, cluster).await {
        Ok(missing) => Some(missing),
        Err(e) => {
            failures.push(format!("role lookup: {}", e));
            None
        }
    };

    let mut computed = Vec::new();
    match missing {
        Some(missing) if missing.is_empty() => {
            computed.push(condition(conditions::ROLE_REFS_VALID, true, "AllRolesFound", "All referenced roles exist"));
        }
        Some(missing) => {
            computed.push(condition(
                conditions::ROLE_REFS_VALID,
                false,
                "RoleNotFound",
                format!("Referenced roles not found: {}", missing.into_iter().collect::<Vec<_>>().join(", ")),
            ));
        }
        None => computed.push(condition(
            conditions::ROLE_REFS_VALID,
            conditions::ConditionStatus::Unknown,
            "LookupFailed",
            "Role existence could not be checked",
        )),
    }
    computed.push(if failures.is_empty() {
        condition(
            conditions::CREATED,
            true,
            "Reconciled",
            format!("{} binding(s) applied", applied),
        )
    } else {
        condition(
            conditions::CREATED,
            false,
            "PartialFailure",
            format!("{} of {} step(s) failed: {}", failures.len(), plan.len() + wanted.len(), failures.join("; ")),
        )
    });

    info!(bindings = applied, failures = failures.len(), "BindingTemplate reconciled");

    let status = BindingTemplateStatus {
        conditions: conditions::merge_conditions(&previous.conditions, computed),
        generated_service_accounts: held.into_iter().collect(),
        binding_count: Some(applied),
        observed_generation: template.meta().generation,
    };
    Ok(BindingOutcome { status, failures })
}

async fn prune(template_name: &str, plan: &BindingPlan, cluster: &dyn ClusterState) -> Result<()> {
    let labels = template_selector(template_name);
    for binding in cluster.list_cluster_role_bindings(&labels).await? {
        let name = binding.name_any();
        if owns(template_name, &binding.metadata) && !plan.cluster_bindings.contains_key(&name) {
            debug!(binding = %name, "Pruning stale ClusterRoleBinding");
            cluster.delete_cluster_role_binding(&name).await?;
        }
    }
    for binding in cluster.list_role_bindings(&labels).await? {
        let key = (binding.namespace().unwrap_or_default(), binding.name_any());
        if owns(template_name, &binding.metadata) && !plan.role_bindings.contains_key(&key) {
            debug!(binding = %key.1, namespace = %key.0, "Pruning stale RoleBinding");
            cluster.delete_role_binding(&key.0, &key.1).await?;
        }
    }
    Ok(())
}

async fn missing_roles(plan: &BindingPlan, cluster: &dyn ClusterState) -> Result<BTreeSet<String>> {
    let mut missing = BTreeSet::new();
    let mut cluster_roles: BTreeSet<&str> = plan.cluster_bindings.values().map(|b| b.role.as_str()).collect();
    let mut roles = BTreeSet::new();
    for b in plan.role_bindings.values() {
        match b.role_kind {
            RoleKind::ClusterRole => {
                cluster_roles.insert(b.role.as_str());
            }
            RoleKind::Role => {
                roles.insert((b.namespace.as_str(), b.role.as_str()));
            }
        }
    }
    for name in cluster_roles {
        if !cluster.cluster_role_exists(name).await? {
            missing.insert(format!("ClusterRole/{}", name));
        }
    }
    for (ns, name) in roles {
        if !cluster.role_exists(ns, name).await? {
            missing.insert(format!("Role/{}/{}", ns, name));
        }
    }
    Ok(missing)
}

/// Deletes every binding owned by the template and releases all of its
/// ServiceAccount references.
#[instrument(skip(template, cluster), fields(template = %template.name_any()))]
pub async fn cleanup(template: &BindingTemplate, cluster: &dyn ClusterState) -> Result<()> {
    let template_name = template.name_any();
    prune(&template_name, &BindingPlan::default(), cluster).await?;

    let mut accounts: BTreeSet<ServiceAccountRef> = template
        .status
        .as_ref()
        .map(|s| s.generated_service_accounts.iter().cloned().collect())
        .unwrap_or_default();
    accounts.extend(managed_subjects(&template.spec));
    accounts.extend(held_accounts(cluster, &template_name).await?);
    for account in &accounts {
        release(cluster, &template_name, account).await?;
    }
    info!(service_accounts = accounts.len(), "Removed generated bindings and released references");
    Ok(())
}

/// Status after a pass that failed before anything was attempted.
pub fn failed_status(template: &BindingTemplate, error: &Error) -> BindingTemplateStatus {
    let previous = template.status.clone().unwrap_or_default();
    let created = condition(conditions::CREATED, false, error.reason(), error.to_string());
    BindingTemplateStatus {
        conditions: conditions::merge_conditions(&previous.conditions, vec![created]),
        observed_generation: if error.is_terminal() {
            template.meta().generation
        } else {
            previous.observed_generation
        },
        ..previous
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MemoryClusterState;
    use crate::crds::{ClusterBindingGroup, LabelSelector, NamespaceBindingGroup, NamespaceSelector, SubjectSpec};

    fn sa_subject(ns: &str, name: &str, create: bool) -> SubjectSpec {
        SubjectSpec {
            kind: SubjectKind::ServiceAccount,
            name: name.to_string(),
            namespace: Some(ns.to_string()),
            create,
        }
    }

    fn user(name: &str) -> SubjectSpec {
        SubjectSpec {
            kind: SubjectKind::User,
            name: name.to_string(),
            namespace: None,
            create: false,
        }
    }

    fn template(name: &str, subjects: Vec<SubjectSpec>, cluster_roles: &[&str]) -> BindingTemplate {
        BindingTemplate::new(
            name,
            BindingTemplateSpec {
                target_name: None,
                subjects,
                cluster_bindings: vec![ClusterBindingGroup {
                    roles: cluster_roles.iter().map(|r| r.to_string()).collect(),
                }],
                namespace_bindings: vec![],
            },
        )
    }

    /// Feeds the published status back as the controller would.
    async fn pass(t: &mut BindingTemplate, cluster: &MemoryClusterState) -> BindingOutcome {
        let outcome = reconcile(t, cluster).await.unwrap();
        t.status = Some(outcome.status.clone());
        outcome
    }

    fn sa_ref(ns: &str, name: &str) -> ServiceAccountRef {
        ServiceAccountRef {
            name: name.to_string(),
            namespace: ns.to_string(),
        }
    }

    #[test]
    fn test_binding_names_are_deterministic() {
        assert_eq!(binding_name("devs", "view"), "devs-view");
        let t = template("devs", vec![user("alice")], &["view", "edit", "view"]);
        let p = plan(&t, &[]);
        assert_eq!(p.cluster_bindings.keys().cloned().collect::<Vec<_>>(), vec!["devs-edit", "devs-view"]);
    }

    #[test]
    fn test_validation_rejects_bad_templates() {
        let mut t = template("t", vec![user("")], &["view"]);
        assert!(validate(&t).unwrap_err().is_terminal());

        t.spec.subjects = vec![SubjectSpec {
            namespace: None,
            ..sa_subject("x", "ci", false)
        }];
        assert!(validate(&t).is_err());

        t.spec.subjects = vec![SubjectSpec { create: true, ..user("bob") }];
        assert!(validate(&t).is_err());

        t.spec.subjects = vec![user("bob")];
        t.spec.cluster_bindings = vec![ClusterBindingGroup { roles: vec![] }];
        assert!(validate(&t).is_err());

        t.spec.cluster_bindings = vec![];
        t.spec.namespace_bindings = vec![NamespaceBindingGroup {
            roles: vec!["edit".to_string()],
            ..Default::default()
        }];
        assert!(validate(&t).is_err());

        t.spec.namespace_bindings[0].namespace_selectors = vec![NamespaceSelector {
            names: vec![],
            label_selector: Some(LabelSelector {
                match_expressions: vec![crate::crds::LabelSelectorRequirement {
                    key: "team".to_string(),
                    operator: "Matches".to_string(),
                    values: vec![],
                }],
                ..Default::default()
            }),
        }];
        assert!(matches!(validate(&t), Err(Error::InvalidSelector(_))));
    }

    #[tokio::test]
    async fn test_namespace_bindings_cover_union_of_selectors() {
        let cluster = MemoryClusterState::new();
        cluster.add_namespace("team-a", &[("team", "a")]);
        cluster.add_namespace("team-b", &[("team", "b")]);
        cluster.add_namespace("shared", &[]);
        cluster.add_cluster_role("edit");

        let mut t = template("devs", vec![user("alice")], &[]);
        t.spec.cluster_bindings.clear();
        t.spec.namespace_bindings = vec![NamespaceBindingGroup {
            roles: vec!["edit".to_string()],
            role_kind: RoleKind::ClusterRole,
            namespaces: vec!["shared".to_string(), "missing".to_string()],
            namespace_selectors: vec![
                NamespaceSelector {
                    names: vec![],
                    label_selector: Some(LabelSelector {
                        match_labels: [("team".to_string(), "a".to_string())].into_iter().collect(),
                        ..Default::default()
                    }),
                },
                NamespaceSelector {
                    names: vec!["team-b".to_string()],
                    label_selector: None,
                },
            ],
        }];

        let outcome = pass(&mut t, &cluster).await;
        assert!(outcome.is_complete());
        assert_eq!(
            cluster.role_binding_keys(),
            vec!["shared/devs-edit", "team-a/devs-edit", "team-b/devs-edit"]
        );
        assert_eq!(outcome.status.binding_count, Some(3));
    }

    #[tokio::test]
    async fn test_stale_bindings_are_pruned() {
        let cluster = MemoryClusterState::new();
        let mut t = template("devs", vec![user("alice")], &["view", "edit"]);
        pass(&mut t, &cluster).await;
        assert_eq!(cluster.cluster_role_binding_names().len(), 2);

        t.spec.cluster_bindings[0].roles = vec!["view".to_string()];
        pass(&mut t, &cluster).await;
        assert_eq!(cluster.cluster_role_binding_names(), vec!["devs-view"]);
    }

    #[tokio::test]
    async fn test_ambiguous_binding_names_are_refused() {
        let cluster = MemoryClusterState::new();
        let mut a = template("a", vec![user("alice")], &["b-c"]);
        let ab = template("a-b", vec![user("bob")], &["c"]);
        pass(&mut a, &cluster).await;

        let err = reconcile(&ab, &cluster).await.unwrap_err();
        assert!(matches!(err, Error::TargetNotManaged(_)));
        assert!(err.is_terminal());

        cleanup(&ab, &cluster).await.unwrap();
        let binding = cluster.cluster_role_binding("a-b-c").unwrap();
        assert_eq!(binding.role_ref.name, "b-c");
        assert_eq!(binding.subjects.unwrap()[0].name, "alice");
        assert!(pass(&mut a, &cluster).await.is_complete());
    }

    #[tokio::test]
    async fn test_shared_target_name_does_not_take_over_bindings() {
        let cluster = MemoryClusterState::new();
        let mut first = template("first", vec![user("alice")], &["view"]);
        let mut second = template("second", vec![user("bob")], &["view"]);
        first.spec.target_name = Some("team".to_string());
        second.spec.target_name = Some("team".to_string());
        pass(&mut first, &cluster).await;

        assert!(matches!(
            reconcile(&second, &cluster).await,
            Err(Error::TargetNotManaged(_))
        ));
        let binding = cluster.cluster_role_binding("team-view").unwrap();
        assert_eq!(
            binding.metadata.labels.unwrap().get(BINDING_TEMPLATE_LABEL),
            Some(&"first".to_string())
        );
    }

    #[tokio::test]
    async fn test_unmanaged_binding_is_never_modified() {
        let cluster = MemoryClusterState::new();
        let foreign = ClusterRoleBinding {
            metadata: ObjectMeta {
                name: Some("t-view".to_string()),
                ..Default::default()
            },
            role_ref: role_ref(RoleKind::ClusterRole, "view"),
            subjects: Some(vec![]),
        };
        cluster.insert_cluster_role_binding(foreign.clone());

        let t = template("t", vec![user("alice")], &["view"]);
        assert!(matches!(reconcile(&t, &cluster).await, Err(Error::TargetNotManaged(_))));
        cleanup(&t, &cluster).await.unwrap();
        assert_eq!(cluster.cluster_role_binding("t-view").unwrap(), foreign);
    }

    #[tokio::test]
    async fn test_reference_released_after_lost_status() {
        let cluster = MemoryClusterState::new();
        let mut t = template("t", vec![sa_subject("build", "ci", true)], &["view"]);
        // The account is acquired but the status carrying it never lands.
        reconcile(&t, &cluster).await.unwrap();
        assert!(t.status.is_none());
        assert!(cluster.service_account("build", "ci").is_some());

        t.spec.subjects = vec![user("alice")];
        let outcome = pass(&mut t, &cluster).await;
        assert!(outcome.is_complete());
        assert!(outcome.status.generated_service_accounts.is_empty());
        assert!(cluster.service_account("build", "ci").is_none());
    }

    #[tokio::test]
    async fn test_cleanup_releases_references_missing_from_status() {
        let cluster = MemoryClusterState::new();
        let mut t = template("t", vec![sa_subject("build", "ci", true)], &["view"]);
        let mut other = template("other", vec![sa_subject("build", "ci", true)], &["edit"]);
        reconcile(&t, &cluster).await.unwrap();
        pass(&mut other, &cluster).await;

        t.spec.subjects = vec![user("alice")];
        cleanup(&t, &cluster).await.unwrap();
        let account = cluster.service_account("build", "ci").unwrap();
        assert_eq!(
            referenced_by(&account).unwrap().into_iter().collect::<Vec<_>>(),
            vec!["other".to_string()]
        );

        cleanup(&other, &cluster).await.unwrap();
        assert!(cluster.service_account("build", "ci").is_none());
    }

    #[tokio::test]
    async fn test_shared_service_account_survives_until_last_reference() {
        for delete_a_first in [true, false] {
            let cluster = MemoryClusterState::new();
            let mut a = template("a", vec![sa_subject("build", "ci", true)], &["view"]);
            let mut b = template("b", vec![sa_subject("build", "ci", true)], &["edit"]);
            pass(&mut a, &cluster).await;
            pass(&mut b, &cluster).await;

            let account = cluster.service_account("build", "ci").unwrap();
            assert!(is_managed(&account));
            assert_eq!(referenced_by(&account).unwrap().len(), 2);

            let (first, second) = if delete_a_first { (&a, &b) } else { (&b, &a) };
            cleanup(first, &cluster).await.unwrap();
            let account = cluster.service_account("build", "ci").unwrap();
            assert_eq!(
                referenced_by(&account).unwrap().into_iter().collect::<Vec<_>>(),
                vec![second.name_any()]
            );

            cleanup(second, &cluster).await.unwrap();
            assert!(cluster.service_account("build", "ci").is_none());
            assert!(cluster.cluster_role_binding_names().is_empty());
        }
    }

    #[tokio::test]
    async fn test_pre_existing_service_account_is_never_touched() {
        let cluster = MemoryClusterState::new();
        cluster.insert_service_account(ServiceAccount {
            metadata: ObjectMeta {
                name: Some("deployer".to_string()),
                namespace: Some("build".to_string()),
                ..Default::default()
            },
            ..Default::default()
        });
        let before = cluster.service_account("build", "deployer").unwrap();

        let mut t = template("t", vec![sa_subject("build", "deployer", true)], &["view"]);
        let outcome = pass(&mut t, &cluster).await;
        assert!(outcome.status.generated_service_accounts.is_empty());
        assert_eq!(cluster.service_account("build", "deployer").unwrap(), before);

        cleanup(&t, &cluster).await.unwrap();
        assert_eq!(cluster.service_account("build", "deployer").unwrap(), before);
    }

    #[tokio::test]
    async fn test_dropped_subject_releases_reference() {
        let cluster = MemoryClusterState::new();
        let mut t = template("t", vec![sa_subject("build", "ci", true)], &["view"]);
        pass(&mut t, &cluster).await;
        assert_eq!(t.status.as_ref().unwrap().generated_service_accounts, vec![sa_ref("build", "ci")]);

        t.spec.subjects = vec![user("alice")];
        let outcome = pass(&mut t, &cluster).await;
        assert!(outcome.status.generated_service_accounts.is_empty());
        assert!(cluster.service_account("build", "ci").is_none());
    }

    #[tokio::test]
    async fn test_role_refs_condition_heals_when_role_appears() {
        let cluster = MemoryClusterState::new();
        let mut t = template("t", vec![user("alice")], &["auditor"]);

        let outcome = pass(&mut t, &cluster).await;
        let refs = conditions::find_condition(&outcome.status.conditions, conditions::ROLE_REFS_VALID).unwrap();
        assert_eq!(refs.status, "False");
        assert_eq!(refs.reason, "RoleNotFound");
        // Bindings are created even though the role is missing.
        assert!(cluster.cluster_role_binding("t-auditor").is_some());

        cluster.add_cluster_role("auditor");
        let outcome = pass(&mut t, &cluster).await;
        assert!(conditions::is_true(&outcome.status.conditions, conditions::ROLE_REFS_VALID));

        cluster.delete_cluster_role("auditor").await.unwrap();
        let outcome = pass(&mut t, &cluster).await;
        assert!(!conditions::is_true(&outcome.status.conditions, conditions::ROLE_REFS_VALID));
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_successes() {
        let cluster = MemoryClusterState::new();
        cluster.fail_binding("t-edit");
        let mut t = template("t", vec![user("alice")], &["view", "edit", "admin"]);

        let outcome = pass(&mut t, &cluster).await;
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.status.binding_count, Some(2));
        assert!(!conditions::is_true(&outcome.status.conditions, conditions::CREATED));
        assert_eq!(cluster.cluster_role_binding_names(), vec!["t-admin", "t-view"]);

        cluster.heal_binding("t-edit");
        let outcome = pass(&mut t, &cluster).await;
        assert!(outcome.is_complete());
        assert!(conditions::is_true(&outcome.status.conditions, conditions::CREATED));
        assert_eq!(cluster.cluster_role_binding_names().len(), 3);
    }

    #[tokio::test]
    async fn test_namespace_listing_failure_aborts_pass() {
        let cluster = MemoryClusterState::new();
        cluster.fail_namespace_listing(true);
        let mut t = template("t", vec![user("alice")], &[]);
        t.spec.namespace_bindings = vec![NamespaceBindingGroup {
            roles: vec!["edit".to_string()],
            namespaces: vec!["a".to_string()],
            ..Default::default()
        }];
        let err = reconcile(&t, &cluster).await.unwrap_err();
        assert!(!err.is_terminal());
    }

    #[test]
    fn test_references_role_matches_kinds() {
        let mut t = template("t", vec![user("alice")], &["view"]);
        t.spec.namespace_bindings = vec![NamespaceBindingGroup {
            roles: vec!["deployer".to_string()],
            role_kind: RoleKind::Role,
            namespaces: vec!["ci".to_string()],
            namespace_selectors: vec![],
        }];
        assert!(references_role(&t, RoleKind::ClusterRole, "view", None));
        assert!(!references_role(&t, RoleKind::ClusterRole, "deployer", None));
        assert!(references_role(&t, RoleKind::Role, "deployer", Some("ci")));
        assert!(!references_role(&t, RoleKind::Role, "deployer", Some("other")));
    }
}
