/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/modules/policy_engine/src/matching.rs
*
* Rule matching for AccessPolicy objects.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::crds::{AccessPolicySpec, NonResourceRule, ResourceRule};
use crate::request::{NonResourceRequest, ResourceRequest};
use rbac_manager::selector;
use std::collections::BTreeMap;

const WILDCARD: &str = "*";

fn field_matches(values: &[String], value: &str) -> bool {
    values.iter().any(|v| v == WILDCARD || v == value)
}

fn resource_matches(patterns: &[String], resource: &str, subresource: Option<&str>) -> bool {
    patterns.iter().any(|p| {
        if p == WILDCARD {
            return true;
        }
        match subresource {
            None => p == resource,
            Some(sub) => match p.split_once('/') {
                Some((res, psub)) => (res == resource || res == WILDCARD) && (psub == sub || psub == WILDCARD),
                None => false,
            },
        }
    })
}

pub fn resource_rule_matches(rule: &ResourceRule, request: &ResourceRequest) -> bool {
    field_matches(&rule.api_groups, &request.group)
        && field_matches(&rule.verbs, &request.verb)
        && resource_matches(&rule.resources, &request.resource, request.subresource.as_deref())
}

fn path_matches(patterns: &[String], path: &str) -> bool {
    patterns.iter().any(|p| {
        if p == WILDCARD {
            return true;
        }
        match p.strip_suffix('*') {
            Some(prefix) => path.starts_with(prefix),
            None => p == path,
        }
    })
}

pub fn non_resource_rule_matches(rule: &NonResourceRule, request: &NonResourceRequest) -> bool {
    field_matches(&rule.verbs, &request.verb) && path_matches(&rule.paths, &request.path)
}

/// Whether the namespace restriction of a policy admits the request.
/// `labels` is `None` when the namespace is not known.
pub fn namespace_admits(
    spec: &AccessPolicySpec,
    namespace: Option<&str>,
    labels: Option<&BTreeMap<String, String>>,
) -> bool {
    let Some(sel) = &spec.namespace_selector else {
        return true;
    };
    if selector::validate_namespace_selector(sel).is_err() {
        return false;
    }
    match namespace.filter(|ns| !ns.is_empty()) {
        Some(ns) => selector::namespace_matches(sel, ns, labels),
        None => false,
    }
}

/// Checks a policy for problems that make it inapplicable. Returns a
/// human-readable description of the first problem found.
pub fn validate_policy(spec: &AccessPolicySpec) -> Result<(), String> {
    if let Some(sel) = &spec.namespace_selector {
        selector::validate_namespace_selector(sel).map_err(|e| e.to_string())?;
    }
    for (i, rule) in spec.resource_rules.iter().enumerate() {
        if rule.api_groups.is_empty() || rule.resources.is_empty() || rule.verbs.is_empty() {
            return Err(format!(
                "resourceRules[{}] needs at least one apiGroup, resource and verb",
                i
            ));
        }
    }
    for (i, rule) in spec.non_resource_rules.iter().enumerate() {
        if rule.verbs.is_empty() || rule.paths.is_empty() {
            return Err(format!("nonResourceRules[{}] needs at least one verb and path", i));
        }
        if let Some(bad) = rule.paths.iter().find(|p| p.as_str() != WILDCARD && !p.starts_with('/')) {
            return Err(format!("nonResourceRules[{}] path '{}' must start with '/'", i, bad));
        }
    }
    if spec.allow.is_empty() && spec.deny.is_empty() {
        return Err("policy names no principals in allow or deny".to_string());
    }
    Ok(())
}
