/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/modules/policy_engine/src/review.rs
*
* Conversion between `authorization.k8s.io/v1` SubjectAccessReview objects,
* as posted by the API server to an authorization webhook, and the decision
* engine's request and verdict types.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::decision::{decide, PolicySource};
use crate::request::{AccessRequest, Decision, NonResourceRequest, RequestAttributes, ResourceRequest, Verdict};
use k8s_openapi::api::authorization::v1::{SubjectAccessReview, SubjectAccessReviewStatus};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ReviewError {
    #[error("SubjectAccessReview carries neither resourceAttributes nor nonResourceAttributes")]
    NoAttributes,

    #[error("SubjectAccessReview carries both resourceAttributes and nonResourceAttributes")]
    BothAttributes,
}

pub fn request_from_review(review: &SubjectAccessReview) -> Result<AccessRequest, ReviewError> {
    let spec = &review.spec;
    let attributes = match (&spec.resource_attributes, &spec.non_resource_attributes) {
        (Some(_), Some(_)) => return Err(ReviewError::BothAttributes),
        (None, None) => return Err(ReviewError::NoAttributes),
        (Some(ra), None) => RequestAttributes::Resource(ResourceRequest {
            namespace: ra.namespace.clone().filter(|ns| !ns.is_empty()),
            verb: ra.verb.clone().unwrap_or_default(),
            group: ra.group.clone().unwrap_or_default(),
            resource: ra.resource.clone().unwrap_or_default(),
            subresource: ra.subresource.clone().filter(|s| !s.is_empty()),
            name: ra.name.clone().filter(|n| !n.is_empty()),
        }),
        (None, Some(nra)) => RequestAttributes::NonResource(NonResourceRequest {
            verb: nra.verb.clone().unwrap_or_default(),
            path: nra.path.clone().unwrap_or_default(),
        }),
    };
    Ok(AccessRequest {
        user: spec.user.clone().unwrap_or_default(),
        groups: spec.groups.clone().unwrap_or_default(),
        attributes,
    })
}

/// The review echoed back with a status reflecting the verdict. Abstain is
/// reported as not allowed without `denied`, so other authorizers still run.
pub fn review_response(review: &SubjectAccessReview, verdict: &Verdict) -> SubjectAccessReview {
    let status = SubjectAccessReviewStatus {
        allowed: verdict.decision == Decision::Allow,
        denied: (verdict.decision == Decision::Deny).then_some(true),
        reason: Some(verdict.reason.clone()),
        evaluation_error: None,
    };
    SubjectAccessReview {
        metadata: review.metadata.clone(),
        spec: review.spec.clone(),
        status: Some(status),
    }
}

pub fn error_response(review: &SubjectAccessReview, error: &ReviewError) -> SubjectAccessReview {
    SubjectAccessReview {
        metadata: review.metadata.clone(),
        spec: review.spec.clone(),
        status: Some(SubjectAccessReviewStatus {
            allowed: false,
            denied: None,
            reason: None,
            evaluation_error: Some(error.to_string()),
        }),
    }
}

/// Evaluates a review end to end. Malformed reviews abstain with an
/// evaluation error.
pub fn evaluate_review(source: &dyn PolicySource, review: &SubjectAccessReview) -> (SubjectAccessReview, Verdict) {
    match request_from_review(review) {
        Ok(request) => {
            let verdict = decide(source, &request);
            (review_response(review, &verdict), verdict)
        }
        Err(e) => (error_response(review, &e), Verdict::abstain(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{AccessPolicy, AccessPolicySpec, ResourceRule};
    use crate::decision::StaticPolicies;

    fn review(body: serde_json::Value) -> SubjectAccessReview {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "authorization.k8s.io/v1",
            "kind": "SubjectAccessReview",
            "spec": body
        }))
        .unwrap()
    }

    fn source() -> StaticPolicies {
        StaticPolicies::new().with_policy(AccessPolicy::new(
            "secrets",
            AccessPolicySpec {
                resource_rules: vec![ResourceRule {
                    api_groups: vec!["".to_string()],
                    resources: vec!["secrets".to_string()],
                    verbs: vec!["get".to_string()],
                }],
                non_resource_rules: vec![],
                allow: vec!["ops".to_string()],
                deny: vec!["interns".to_string()],
                namespace_selector: None,
            },
        ))
    }

    #[test]
    fn test_review_with_subresource_parses() {
        let r = review(serde_json::json!({
            "user": "alice",
            "groups": ["ops"],
            "resourceAttributes": {"namespace": "", "verb": "get", "resource": "pods", "subresource": "log"}
        }));
        let req = request_from_review(&r).unwrap();
        match req.attributes {
            RequestAttributes::Resource(res) => {
                assert_eq!(res.namespace, None);
                assert_eq!(res.subresource.as_deref(), Some("log"));
                assert_eq!(res.group, "");
            }
            other => panic!("unexpected attributes {:?}", other),
        }
    }

    #[test]
    fn test_malformed_reviews_report_evaluation_error() {
        let neither = review(serde_json::json!({"user": "alice"}));
        assert_eq!(request_from_review(&neither), Err(ReviewError::NoAttributes));

        let both = review(serde_json::json!({
            "user": "alice",
            "resourceAttributes": {"verb": "get", "resource": "pods"},
            "nonResourceAttributes": {"verb": "get", "path": "/healthz"}
        }));
        let (response, verdict) = evaluate_review(&source(), &both);
        assert_eq!(verdict.decision, Decision::Abstain);
        let status = response.status.unwrap();
        assert!(!status.allowed);
        assert_eq!(status.denied, None);
        assert!(status.evaluation_error.is_some());
    }

    #[test]
    fn test_verdicts_map_to_review_status() {
        let attrs = serde_json::json!({"namespace": "prod", "verb": "get", "resource": "secrets"});

        let (allowed, _) = evaluate_review(
            &source(),
            &review(serde_json::json!({"user": "alice", "groups": ["ops"], "resourceAttributes": attrs})),
        );
        let status = allowed.status.unwrap();
        assert!(status.allowed);
        assert_eq!(status.denied, None);

        let (denied, _) = evaluate_review(
            &source(),
            &review(serde_json::json!({"user": "bob", "groups": ["ops", "interns"], "resourceAttributes": attrs})),
        );
        let status = denied.status.unwrap();
        assert!(!status.allowed);
        assert_eq!(status.denied, Some(true));

        let (abstained, _) = evaluate_review(
            &source(),
            &review(serde_json::json!({"user": "carol", "resourceAttributes": attrs})),
        );
        let status = abstained.status.unwrap();
        assert!(!status.allowed);
        assert_eq!(status.denied, None);
        assert!(status.reason.is_some());
    }
}
