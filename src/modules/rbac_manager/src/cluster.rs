/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/modules/rbac_manager/src/cluster.rs
*
* The `ClusterState` trait is the seam between the engines and the Kubernetes
* API. The engines only ever read and write RBAC objects, namespaces and
* ServiceAccounts through it, which keeps their reconciliation logic testable
* against the in-memory implementation in `cluster/memory.rs`.
*
* Architecture:
* - `KubeClusterState` is the production implementation on top of `kube::Api`.
*   Generated RBAC objects are written with server-side apply, so re-applying
*   the same object is a no-op. ServiceAccounts are written with create and
*   replace because their reference-count annotation relies on optimistic
*   concurrency (`resourceVersion`).
* - Deleting an object that is already gone is a success. A 409 from the API
*   server maps to `Error::Conflict`, which the controllers retry.
*
* SPDX-License-Identifier: Apache-2.0
*/

pub mod memory;

use crate::error::{is_status, Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, Preconditions},
    Client, Resource,
};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt::Debug;

pub use memory::MemoryClusterState;

/// Label equality selector, e.g. `{"app.kubernetes.io/managed-by": "rbac-operator"}`.
pub type LabelMatch = BTreeMap<String, String>;

#[async_trait]
pub trait ClusterState: Send + Sync {
    async fn apply_cluster_role(&self, role: ClusterRole) -> Result<()>;
    async fn apply_role(&self, role: Role) -> Result<()>;
    async fn get_cluster_role(&self, name: &str) -> Result<Option<ClusterRole>>;
    async fn get_role(&self, namespace: &str, name: &str) -> Result<Option<Role>>;
    async fn cluster_role_exists(&self, name: &str) -> Result<bool> {
        Ok(self.get_cluster_role(name).await?.is_some())
    }
    async fn role_exists(&self, namespace: &str, name: &str) -> Result<bool> {
        Ok(self.get_role(namespace, name).await?.is_some())
    }
    async fn list_cluster_roles(&self, labels: &LabelMatch) -> Result<Vec<ClusterRole>>;
    async fn list_roles(&self, labels: &LabelMatch) -> Result<Vec<Role>>;
    async fn delete_cluster_role(&self, name: &str) -> Result<()>;
    async fn delete_role(&self, namespace: &str, name: &str) -> Result<()>;

    async fn apply_cluster_role_binding(&self, binding: ClusterRoleBinding) -> Result<()>;
    async fn apply_role_binding(&self, binding: RoleBinding) -> Result<()>;
    async fn get_cluster_role_binding(&self, name: &str) -> Result<Option<ClusterRoleBinding>>;
    async fn get_role_binding(&self, namespace: &str, name: &str) -> Result<Option<RoleBinding>>;
    async fn list_cluster_role_bindings(&self, labels: &LabelMatch) -> Result<Vec<ClusterRoleBinding>>;
    async fn list_role_bindings(&self, labels: &LabelMatch) -> Result<Vec<RoleBinding>>;
    async fn delete_cluster_role_binding(&self, name: &str) -> Result<()>;
    async fn delete_role_binding(&self, namespace: &str, name: &str) -> Result<()>;

    async fn list_namespaces(&self) -> Result<Vec<Namespace>>;

    async fn get_service_account(&self, namespace: &str, name: &str) -> Result<Option<ServiceAccount>>;
    async fn list_service_accounts(&self, labels: &LabelMatch) -> Result<Vec<ServiceAccount>>;
    /// Fails with `Error::Conflict` when the account already exists.
    async fn create_service_account(&self, account: ServiceAccount) -> Result<ServiceAccount>;
    /// Fails with `Error::Conflict` when `metadata.resourceVersion` is stale.
    async fn replace_service_account(&self, account: ServiceAccount) -> Result<ServiceAccount>;
    /// With a resource version, the delete only succeeds if the account was not
    /// modified since it was read.
    async fn delete_service_account(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
    ) -> Result<()>;
}

/// Formats a label equality selector for `ListParams::labels`.
pub fn selector_string(labels: &LabelMatch) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

fn object_name<K: Resource>(obj: &K) -> Result<String> {
    obj.meta()
        .name
        .clone()
        .ok_or(Error::MissingObjectKey("metadata.name"))
}

fn object_namespace<K: Resource>(obj: &K) -> Result<String> {
    obj.meta()
        .namespace
        .clone()
        .ok_or(Error::MissingObjectKey("metadata.namespace"))
}

// --- Kubernetes implementation ---

#[derive(Clone)]
pub struct KubeClusterState {
    client: Client,
    field_manager: String,
}

impl KubeClusterState {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            field_manager: crate::FIELD_MANAGER.to_string(),
        }
    }

    fn apply_params(&self) -> PatchParams {
        PatchParams::apply(&self.field_manager).force()
    }

    async fn delete_ignoring_missing<K>(api: Api<K>, name: &str, dp: &DeleteParams) -> Result<()>
    where
        K: Resource + Clone + DeserializeOwned + Debug,
    {
        match api.delete(name, dp).await {
            Ok(_) => Ok(()),
            Err(e) if is_status(&e, 404) => Ok(()),
            Err(e) if is_status(&e, 409) => Err(Error::Conflict(name.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_labelled<K>(api: Api<K>, labels: &LabelMatch) -> Result<Vec<K>>
    where
        K: Resource + Clone + DeserializeOwned + Debug,
    {
        let lp = ListParams::default().labels(&selector_string(labels));
        Ok(api.list(&lp).await?.items)
    }
}

#[async_trait]
impl ClusterState for KubeClusterState {
    async fn apply_cluster_role(&self, role: ClusterRole) -> Result<()> {
        let name = object_name(&role)?;
        let api: Api<ClusterRole> = Api::all(self.client.clone());
        api.patch(&name, &self.apply_params(), &Patch::Apply(&role)).await?;
        Ok(())
    }

    async fn apply_role(&self, role: Role) -> Result<()> {
        let name = object_name(&role)?;
        let ns = object_namespace(&role)?;
        let api: Api<Role> = Api::namespaced(self.client.clone(), &ns);
        api.patch(&name, &self.apply_params(), &Patch::Apply(&role)).await?;
        Ok(())
    }

    async fn get_cluster_role(&self, name: &str) -> Result<Option<ClusterRole>> {
        Ok(Api::<ClusterRole>::all(self.client.clone()).get_opt(name).await?)
    }

    async fn get_role(&self, namespace: &str, name: &str) -> Result<Option<Role>> {
        Ok(Api::<Role>::namespaced(self.client.clone(), namespace).get_opt(name).await?)
    }

    async fn list_cluster_roles(&self, labels: &LabelMatch) -> Result<Vec<ClusterRole>> {
        Self::list_labelled(Api::all(self.client.clone()), labels).await
    }

    async fn list_roles(&self, labels: &LabelMatch) -> Result<Vec<Role>> {
        Self::list_labelled(Api::all(self.client.clone()), labels).await
    }

    async fn delete_cluster_role(&self, name: &str) -> Result<()> {
        Self::delete_ignoring_missing(Api::<ClusterRole>::all(self.client.clone()), name, &DeleteParams::default()).await
    }

    async fn delete_role(&self, namespace: &str, name: &str) -> Result<()> {
        Self::delete_ignoring_missing(
            Api::<Role>::namespaced(self.client.clone(), namespace),
            name,
            &DeleteParams::default(),
        )
        .await
    }

    async fn apply_cluster_role_binding(&self, binding: ClusterRoleBinding) -> Result<()> {
        let name = object_name(&binding)?;
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        api.patch(&name, &self.apply_params(), &Patch::Apply(&binding)).await?;
        Ok(())
    }

    async fn apply_role_binding(&self, binding: RoleBinding) -> Result<()> {
        let name = object_name(&binding)?;
        let ns = object_namespace(&binding)?;
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), &ns);
        api.patch(&name, &self.apply_params(), &Patch::Apply(&binding)).await?;
        Ok(())
    }

    async fn get_cluster_role_binding(&self, name: &str) -> Result<Option<ClusterRoleBinding>> {
        Ok(Api::<ClusterRoleBinding>::all(self.client.clone()).get_opt(name).await?)
    }

    async fn get_role_binding(&self, namespace: &str, name: &str) -> Result<Option<RoleBinding>> {
        Ok(Api::<RoleBinding>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await?)
    }

    async fn list_cluster_role_bindings(&self, labels: &LabelMatch) -> Result<Vec<ClusterRoleBinding>> {
        Self::list_labelled(Api::all(self.client.clone()), labels).await
    }

    async fn list_role_bindings(&self, labels: &LabelMatch) -> Result<Vec<RoleBinding>> {
        Self::list_labelled(Api::all(self.client.clone()), labels).await
    }

    async fn delete_cluster_role_binding(&self, name: &str) -> Result<()> {
        Self::delete_ignoring_missing(
            Api::<ClusterRoleBinding>::all(self.client.clone()),
            name,
            &DeleteParams::default(),
        )
        .await
    }

    async fn delete_role_binding(&self, namespace: &str, name: &str) -> Result<()> {
        Self::delete_ignoring_missing(
            Api::<RoleBinding>::namespaced(self.client.clone(), namespace),
            name,
            &DeleteParams::default(),
        )
        .await
    }

    async fn list_namespaces(&self) -> Result<Vec<Namespace>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_service_account(&self, namespace: &str, name: &str) -> Result<Option<ServiceAccount>> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_service_accounts(&self, labels: &LabelMatch) -> Result<Vec<ServiceAccount>> {
        Self::list_labelled(Api::all(self.client.clone()), labels).await
    }

    async fn create_service_account(&self, account: ServiceAccount) -> Result<ServiceAccount> {
        let ns = object_namespace(&account)?;
        let name = object_name(&account)?;
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), &ns);
        match api.create(&PostParams::default(), &account).await {
            Ok(created) => Ok(created),
            Err(e) if is_status(&e, 409) => Err(Error::Conflict(format!("{}/{}", ns, name))),
            Err(e) => Err(e.into()),
        }
    }

    async fn replace_service_account(&self, account: ServiceAccount) -> Result<ServiceAccount> {
        let ns = object_namespace(&account)?;
        let name = object_name(&account)?;
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), &ns);
        match api.replace(&name, &PostParams::default(), &account).await {
            Ok(replaced) => Ok(replaced),
            Err(e) if is_status(&e, 409) => Err(Error::Conflict(format!("{}/{}", ns, name))),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_service_account(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
    ) -> Result<()> {
        let dp = DeleteParams {
            preconditions: resource_version.map(|rv| Preconditions {
                resource_version: Some(rv),
                uid: None,
            }),
            ..Default::default()
        };
        Self::delete_ignoring_missing(Api::<ServiceAccount>::namespaced(self.client.clone(), namespace), name, &dp)
            .await
    }
}
