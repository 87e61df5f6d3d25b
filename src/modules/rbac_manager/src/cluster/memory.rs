/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/modules/rbac_manager/src/cluster/memory.rs
*
* In-memory `ClusterState` used to exercise the engines without an API
* server. It emulates the API server behaviours the engines depend on:
* resource versions with conflict detection on replace and conditional
* delete, 409 on create of an existing ServiceAccount, and label-filtered
* listing. Individual binding names can be made to fail to simulate partial
* application.
*
* SPDX-License-Identifier: Apache-2.0
*/

use super::{ClusterState, LabelMatch};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use kube::api::ObjectMeta;
use kube::Resource;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

type NsName = (String, String);

#[derive(Default)]
struct Inner {
    resource_version: u64,
    namespaces: BTreeMap<String, Namespace>,
    cluster_roles: BTreeMap<String, ClusterRole>,
    roles: BTreeMap<NsName, Role>,
    cluster_role_bindings: BTreeMap<String, ClusterRoleBinding>,
    role_bindings: BTreeMap<NsName, RoleBinding>,
    service_accounts: BTreeMap<NsName, ServiceAccount>,
    failing_bindings: BTreeSet<String>,
    fail_namespace_listing: bool,
}

impl Inner {
    fn next_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }
}

#[derive(Default)]
pub struct MemoryClusterState {
    inner: Mutex<Inner>,
}

fn labels_match<K: Resource>(obj: &K, labels: &LabelMatch) -> bool {
    let have = obj.meta().labels.as_ref();
    labels
        .iter()
        .all(|(k, v)| have.and_then(|l| l.get(k)) == Some(v))
}

fn key_of<K: Resource>(obj: &K) -> Result<NsName> {
    let meta = obj.meta();
    Ok((
        meta.namespace.clone().ok_or(Error::MissingObjectKey("metadata.namespace"))?,
        meta.name.clone().ok_or(Error::MissingObjectKey("metadata.name"))?,
    ))
}

fn name_of<K: Resource>(obj: &K) -> Result<String> {
    obj.meta().name.clone().ok_or(Error::MissingObjectKey("metadata.name"))
}

impl MemoryClusterState {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only happens after a panicking test; keep going.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    // --- Fixture helpers ---

    pub fn add_namespace(&self, name: &str, labels: &[(&str, &str)]) {
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
                ..Default::default()
            },
            ..Default::default()
        };
        self.lock().namespaces.insert(name.to_string(), ns);
    }

    pub fn add_cluster_role(&self, name: &str) {
        let role = ClusterRole {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        self.lock().cluster_roles.insert(name.to_string(), role);
    }

    pub fn add_role(&self, namespace: &str, name: &str) {
        let role = Role {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        self.lock()
            .roles
            .insert((namespace.to_string(), name.to_string()), role);
    }

    /// Stores an account as if an external actor had created it.
    pub fn insert_service_account(&self, mut account: ServiceAccount) {
        let mut inner = self.lock();
        account.metadata.resource_version = Some(inner.next_version());
        if let Ok(key) = key_of(&account) {
            inner.service_accounts.insert(key, account);
        }
    }

    /// Stores a binding as if an external actor had created it.
    pub fn insert_cluster_role_binding(&self, binding: ClusterRoleBinding) {
        if let Ok(name) = name_of(&binding) {
            self.lock().cluster_role_bindings.insert(name, binding);
        }
    }

    /// Makes every apply of a binding with this name fail.
    pub fn fail_binding(&self, name: &str) {
        self.lock().failing_bindings.insert(name.to_string());
    }

    pub fn heal_binding(&self, name: &str) {
        self.lock().failing_bindings.remove(name);
    }

    pub fn fail_namespace_listing(&self, fail: bool) {
        self.lock().fail_namespace_listing = fail;
    }

    // --- Inspection helpers ---

    pub fn cluster_role(&self, name: &str) -> Option<ClusterRole> {
        self.lock().cluster_roles.get(name).cloned()
    }

    pub fn role(&self, namespace: &str, name: &str) -> Option<Role> {
        self.lock()
            .roles
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn cluster_role_binding(&self, name: &str) -> Option<ClusterRoleBinding> {
        self.lock().cluster_role_bindings.get(name).cloned()
    }

    pub fn role_binding(&self, namespace: &str, name: &str) -> Option<RoleBinding> {
        self.lock()
            .role_bindings
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn cluster_role_binding_names(&self) -> Vec<String> {
        self.lock().cluster_role_bindings.keys().cloned().collect()
    }

    /// `namespace/name` of every RoleBinding.
    pub fn role_binding_keys(&self) -> Vec<String> {
        self.lock()
            .role_bindings
            .keys()
            .map(|(ns, n)| format!("{}/{}", ns, n))
            .collect()
    }

    pub fn service_account(&self, namespace: &str, name: &str) -> Option<ServiceAccount> {
        self.lock()
            .service_accounts
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }
}

#[async_trait]
impl ClusterState for MemoryClusterState {
    async fn apply_cluster_role(&self, role: ClusterRole) -> Result<()> {
        let name = name_of(&role)?;
        self.lock().cluster_roles.insert(name, role);
        Ok(())
    }

    async fn apply_role(&self, role: Role) -> Result<()> {
        let key = key_of(&role)?;
        self.lock().roles.insert(key, role);
        Ok(())
    }

    async fn get_cluster_role(&self, name: &str) -> Result<Option<ClusterRole>> {
        Ok(self.cluster_role(name))
    }

    async fn get_role(&self, namespace: &str, name: &str) -> Result<Option<Role>> {
        Ok(self.role(namespace, name))
    }

    async fn list_cluster_roles(&self, labels: &LabelMatch) -> Result<Vec<ClusterRole>> {
        Ok(self
            .lock()
            .cluster_roles
            .values()
            .filter(|r| labels_match(*r, labels))
            .cloned()
            .collect())
    }

    async fn list_roles(&self, labels: &LabelMatch) -> Result<Vec<Role>> {
        Ok(self
            .lock()
            .roles
            .values()
            .filter(|r| labels_match(*r, labels))
            .cloned()
            .collect())
    }

    async fn delete_cluster_role(&self, name: &str) -> Result<()> {
        self.lock().cluster_roles.remove(name);
        Ok(())
    }

    async fn delete_role(&self, namespace: &str, name: &str) -> Result<()> {
        self.lock()
            .roles
            .remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }

    async fn apply_cluster_role_binding(&self, binding: ClusterRoleBinding) -> Result<()> {
        let name = name_of(&binding)?;
        let mut inner = self.lock();
        if inner.failing_bindings.contains(&name) {
            return Err(Error::Transient(format!("injected failure applying {}", name)));
        }
        inner.cluster_role_bindings.insert(name, binding);
        Ok(())
    }

    async fn apply_role_binding(&self, binding: RoleBinding) -> Result<()> {
        let key = key_of(&binding)?;
        let mut inner = self.lock();
        if inner.failing_bindings.contains(&key.1) {
            return Err(Error::Transient(format!("injected failure applying {}/{}", key.0, key.1)));
        }
        if !inner.namespaces.contains_key(&key.0) {
            return Err(Error::Transient(format!("namespace {} not found", key.0)));
        }
        inner.role_bindings.insert(key, binding);
        Ok(())
    }

    async fn get_cluster_role_binding(&self, name: &str) -> Result<Option<ClusterRoleBinding>> {
        Ok(self.cluster_role_binding(name))
    }

    async fn get_role_binding(&self, namespace: &str, name: &str) -> Result<Option<RoleBinding>> {
        Ok(self.role_binding(namespace, name))
    }

    async fn list_cluster_role_bindings(&self, labels: &LabelMatch) -> Result<Vec<ClusterRoleBinding>> {
        Ok(self
            .lock()
            .cluster_role_bindings
            .values()
            .filter(|b| labels_match(*b, labels))
            .cloned()
            .collect())
    }

    async fn list_role_bindings(&self, labels: &LabelMatch) -> Result<Vec<RoleBinding>> {
        Ok(self
            .lock()
            .role_bindings
            .values()
            .filter(|b| labels_match(*b, labels))
            .cloned()
            .collect())
    }

    async fn delete_cluster_role_binding(&self, name: &str) -> Result<()> {
        self.lock().cluster_role_bindings.remove(name);
        Ok(())
    }

    async fn delete_role_binding(&self, namespace: &str, name: &str) -> Result<()> {
        self.lock()
            .role_bindings
            .remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }

    async fn list_namespaces(&self) -> Result<Vec<Namespace>> {
        let inner = self.lock();
        if inner.fail_namespace_listing {
            return Err(Error::Transient("namespace listing unavailable".to_string()));
        }
        Ok(inner.namespaces.values().cloned().collect())
    }

    async fn get_service_account(&self, namespace: &str, name: &str) -> Result<Option<ServiceAccount>> {
        Ok(self.service_account(namespace, name))
    }

    async fn list_service_accounts(&self, labels: &LabelMatch) -> Result<Vec<ServiceAccount>> {
        Ok(self
            .lock()
            .service_accounts
            .values()
            .filter(|a| labels_match(*a, labels))
            .cloned()
            .collect())
    }

    async fn create_service_account(&self, mut account: ServiceAccount) -> Result<ServiceAccount> {
        let key = key_of(&account)?;
        let mut inner = self.lock();
        if inner.service_accounts.contains_key(&key) {
            return Err(Error::Conflict(format!("{}/{}", key.0, key.1)));
        }
        account.metadata.resource_version = Some(inner.next_version());
        inner.service_accounts.insert(key, account.clone());
        Ok(account)
    }

    async fn replace_service_account(&self, mut account: ServiceAccount) -> Result<ServiceAccount> {
        let key = key_of(&account)?;
        let mut inner = self.lock();
        let current = inner
            .service_accounts
            .get(&key)
            .ok_or_else(|| Error::Conflict(format!("{}/{} no longer exists", key.0, key.1)))?;
        if account.metadata.resource_version.is_some()
            && account.metadata.resource_version != current.metadata.resource_version
        {
            return Err(Error::Conflict(format!("{}/{}", key.0, key.1)));
        }
        account.metadata.resource_version = Some(inner.next_version());
        inner.service_accounts.insert(key, account.clone());
        Ok(account)
    }

    async fn delete_service_account(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
    ) -> Result<()> {
        let key = (namespace.to_string(), name.to_string());
        let mut inner = self.lock();
        if let (Some(rv), Some(current)) = (resource_version, inner.service_accounts.get(&key)) {
            if current.metadata.resource_version.as_deref() != Some(rv.as_str()) {
                return Err(Error::Conflict(format!("{}/{}", namespace, name)));
            }
        }
        inner.service_accounts.remove(&key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(ns: &str, name: &str) -> ServiceAccount {
        ServiceAccount {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(ns.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_replace_with_stale_version_conflicts() {
        let state = MemoryClusterState::new();
        let created = state.create_service_account(account("ns", "sa")).await.unwrap();
        let fresh = state.replace_service_account(created.clone()).await.unwrap();
        assert_ne!(fresh.metadata.resource_version, created.metadata.resource_version);

        let err = state.replace_service_account(created).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_conditional_delete_and_duplicate_create() {
        let state = MemoryClusterState::new();
        let created = state.create_service_account(account("ns", "sa")).await.unwrap();
        assert!(matches!(
            state.create_service_account(account("ns", "sa")).await,
            Err(Error::Conflict(_))
        ));
        assert!(state
            .delete_service_account("ns", "sa", Some("stale".to_string()))
            .await
            .is_err());
        state
            .delete_service_account("ns", "sa", created.metadata.resource_version)
            .await
            .unwrap();
        assert!(state.service_account("ns", "sa").is_none());
        // Deleting something already gone is fine.
        state.delete_service_account("ns", "sa", None).await.unwrap();
    }
}
