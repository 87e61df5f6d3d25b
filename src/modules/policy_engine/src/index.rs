/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/modules/policy_engine/src/index.rs
*
* `PolicySource` backed by kube-rs reflector stores. The AccessPolicy store is
* shared with the AccessPolicy controller (it is the controller's own cache)
* and the Namespace store is fed by a dedicated reflector, so the decision
* path never calls the API server.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::crds::AccessPolicy;
use crate::decision::PolicySource;
use k8s_openapi::api::core::v1::Namespace;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct StoreIndex {
    policies: Store<AccessPolicy>,
    namespaces: Store<Namespace>,
}

impl StoreIndex {
    pub fn new(policies: Store<AccessPolicy>, namespaces: Store<Namespace>) -> Self {
        Self { policies, namespaces }
    }
}

impl PolicySource for StoreIndex {
    fn policies(&self) -> Vec<Arc<AccessPolicy>> {
        self.policies.state()
    }

    fn namespace_labels(&self, namespace: &str) -> Option<BTreeMap<String, String>> {
        self.namespaces
            .get(&ObjectRef::new(namespace))
            .map(|ns| ns.labels().clone())
    }
}
