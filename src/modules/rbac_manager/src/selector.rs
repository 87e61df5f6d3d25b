/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/modules/rbac_manager/src/selector.rs
*
* Namespace selection shared by the binding engine and the policy engine.
* Selectors are validated once (malformed selectors are a terminal spec error)
* and then evaluated against namespace labels held in memory.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::crds::{LabelSelector, LabelSelectorRequirement, NamespaceSelector};
use crate::error::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};

/// Checks that every expression uses a known operator with a consistent value list.
pub fn validate_label_selector(selector: &LabelSelector) -> Result<()> {
    for req in &selector.match_expressions {
        if req.key.is_empty() {
            return Err(Error::InvalidSelector("expression with an empty key".to_string()));
        }
        match req.operator.as_str() {
            "In" | "NotIn" => {
                if req.values.is_empty() {
                    return Err(Error::InvalidSelector(format!(
                        "operator '{}' on key '{}' requires at least one value",
                        req.operator, req.key
                    )));
                }
            }
            "Exists" | "DoesNotExist" => {
                if !req.values.is_empty() {
                    return Err(Error::InvalidSelector(format!(
                        "operator '{}' on key '{}' must not have values",
                        req.operator, req.key
                    )));
                }
            }
            other => {
                return Err(Error::InvalidSelector(format!(
                    "unknown operator '{}' on key '{}'",
                    other, req.key
                )))
            }
        }
    }
    Ok(())
}

pub fn validate_namespace_selector(selector: &NamespaceSelector) -> Result<()> {
    match &selector.label_selector {
        Some(ls) => validate_label_selector(ls),
        None => Ok(()),
    }
}

/// Evaluates a validated label selector. Unknown operators never match.
pub fn label_selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    let labels_ok = selector
        .match_labels
        .iter()
        .all(|(k, v)| labels.get(k) == Some(v));
    labels_ok && selector.match_expressions.iter().all(|req| requirement_matches(req, labels))
}

fn requirement_matches(req: &LabelSelectorRequirement, labels: &BTreeMap<String, String>) -> bool {
    let value = labels.get(&req.key);
    match req.operator.as_str() {
        "In" => value.is_some_and(|v| req.values.contains(v)),
        "NotIn" => value.map_or(true, |v| !req.values.contains(v)),
        "Exists" => value.is_some(),
        "DoesNotExist" => value.is_none(),
        _ => false,
    }
}

/// Whether a single namespace satisfies a selector entry. `labels` is `None`
/// when the namespace is unknown, in which case only explicit names match.
pub fn namespace_matches(
    selector: &NamespaceSelector,
    namespace: &str,
    labels: Option<&BTreeMap<String, String>>,
) -> bool {
    if selector.names.iter().any(|n| n == namespace) {
        return true;
    }
    match (&selector.label_selector, labels) {
        (Some(ls), Some(labels)) => label_selector_matches(ls, labels),
        _ => false,
    }
}

/// Resolves selector entries against the live namespace set. The result is
/// the union over all entries; explicit names that do not exist are skipped.
pub fn resolve_namespaces<'a>(
    explicit: &[String],
    selectors: &[NamespaceSelector],
    live: impl IntoIterator<Item = (&'a str, &'a BTreeMap<String, String>)>,
) -> BTreeSet<String> {
    live.into_iter()
        .filter(|(name, labels)| {
            explicit.iter().any(|n| n == name)
                || selectors.iter().any(|s| namespace_matches(s, name, Some(labels)))
        })
        .map(|(name, _)| name.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn expr(key: &str, op: &str, values: &[&str]) -> LabelSelectorRequirement {
        LabelSelectorRequirement {
            key: key.to_string(),
            operator: op.to_string(),
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    #[test]
    fn test_validate_rejects_malformed_expressions() {
        let bad_op = LabelSelector {
            match_expressions: vec![expr("team", "Like", &["a"])],
            ..Default::default()
        };
        assert!(matches!(validate_label_selector(&bad_op), Err(Error::InvalidSelector(_))));

        let in_without_values = LabelSelector {
            match_expressions: vec![expr("team", "In", &[])],
            ..Default::default()
        };
        assert!(validate_label_selector(&in_without_values).is_err());

        let exists_with_values = LabelSelector {
            match_expressions: vec![expr("team", "Exists", &["a"])],
            ..Default::default()
        };
        assert!(validate_label_selector(&exists_with_values).is_err());

        let ok = LabelSelector {
            match_expressions: vec![expr("team", "NotIn", &["a"]), expr("env", "Exists", &[])],
            ..Default::default()
        };
        assert!(validate_label_selector(&ok).is_ok());
    }

    #[test]
    fn test_label_selector_semantics() {
        let ns = labels(&[("team", "a"), ("env", "prod")]);
        let empty = LabelSelector::default();
        assert!(label_selector_matches(&empty, &ns));

        let sel = LabelSelector {
            match_labels: labels(&[("team", "a")]),
            match_expressions: vec![expr("env", "In", &["prod", "stage"]), expr("legacy", "DoesNotExist", &[])],
        };
        assert!(label_selector_matches(&sel, &ns));
        assert!(!label_selector_matches(&sel, &labels(&[("team", "a"), ("env", "dev")])));

        let not_in = LabelSelector {
            match_expressions: vec![expr("env", "NotIn", &["prod"])],
            ..Default::default()
        };
        assert!(!label_selector_matches(&not_in, &ns));
        assert!(label_selector_matches(&not_in, &labels(&[])));
    }

    #[test]
    fn test_resolve_namespaces_is_union_across_entries() {
        let a = labels(&[("team", "a")]);
        let b = labels(&[("team", "b")]);
        let c = labels(&[("team", "c")]);
        let live = vec![("ns-a", &a), ("ns-b", &b), ("ns-c", &c)];

        let selectors = vec![
            NamespaceSelector {
                names: vec![],
                label_selector: Some(LabelSelector {
                    match_labels: labels(&[("team", "a")]),
                    ..Default::default()
                }),
            },
            NamespaceSelector {
                names: vec!["ns-b".to_string(), "does-not-exist".to_string()],
                label_selector: None,
            },
        ];

        let resolved = resolve_namespaces(&[], &selectors, live.clone());
        assert_eq!(
            resolved.into_iter().collect::<Vec<_>>(),
            vec!["ns-a".to_string(), "ns-b".to_string()]
        );

        let with_explicit = resolve_namespaces(&["ns-c".to_string()], &selectors, live);
        assert_eq!(with_explicit.len(), 3);
    }

    #[test]
    fn test_unknown_namespace_only_matches_by_name() {
        let sel = NamespaceSelector {
            names: vec!["kube-system".to_string()],
            label_selector: Some(LabelSelector::default()),
        };
        assert!(namespace_matches(&sel, "kube-system", None));
        assert!(!namespace_matches(&sel, "other", None));
        assert!(namespace_matches(&sel, "other", Some(&labels(&[]))));
    }
}
