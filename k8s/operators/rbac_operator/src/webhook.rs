/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: k8s/operators/rbac_operator/src/webhook.rs
*
* HTTP surfaces of the operator, both served with `warp`:
* - the authorizer webhook (`POST /authorize`), which receives
*   `authorization.k8s.io/v1` SubjectAccessReviews from the API server and
*   answers with the decision engine's verdict. It is served over TLS when a
*   certificate and key are configured.
* - the metrics server (`GET /metrics` in the Prometheus text format and
*   `GET /healthz`).
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::metrics;
use k8s_openapi::api::authorization::v1::SubjectAccessReview;
use policy_engine::{evaluate_review, PolicySource};
use prometheus::{Encoder, Registry, TextEncoder};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, instrument};
use warp::{http::StatusCode, Filter};

/// SubjectAccessReviews are small; anything larger is rejected.
const MAX_REVIEW_BYTES: u64 = 64 * 1024;

// --- Authorizer ---

/// A helper function to inject the policy source into warp filters.
fn with_source(
    source: Arc<dyn PolicySource>,
) -> impl Filter<Extract = (Arc<dyn PolicySource>,), Error = Infallible> + Clone {
    warp::any().map(move || source.clone())
}

pub fn authorizer_routes(
    source: Arc<dyn PolicySource>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    warp::post()
        .and(warp::path("authorize"))
        .and(warp::path::end())
        .and(warp::body::content_length_limit(MAX_REVIEW_BYTES))
        .and(warp::body::json())
        .and(with_source(source))
        .and_then(handle_authorize)
}

#[instrument(skip_all)]
async fn handle_authorize(
    review: SubjectAccessReview,
    source: Arc<dyn PolicySource>,
) -> Result<impl warp::Reply, Infallible> {
    let timer = metrics::AUTHORIZATION_LATENCY_SECONDS.start_timer();
    let (response, verdict) = evaluate_review(source.as_ref(), &review);
    timer.observe_duration();

    metrics::AUTHORIZATION_DECISIONS_TOTAL
        .with_label_values(&[verdict.decision.as_str()])
        .inc();
    debug!(
        user = review.spec.user.as_deref().unwrap_or_default(),
        decision = %verdict.decision,
        reason = %verdict.reason,
        "Evaluated SubjectAccessReview"
    );
    Ok(warp::reply::json(&response))
}

/// Serves the authorizer until the process exits.
pub async fn run_authorizer(addr: SocketAddr, tls: Option<(PathBuf, PathBuf)>, source: Arc<dyn PolicySource>) {
    let routes = authorizer_routes(source);
    match tls {
        Some((cert, key)) => {
            info!("Starting authorizer webhook on https://{}", addr);
            warp::serve(routes).tls().cert_path(cert).key_path(key).run(addr).await;
        }
        None => {
            info!("Starting authorizer webhook on http://{} (TLS disabled)", addr);
            warp::serve(routes).run(addr).await;
        }
    }
}

// --- Metrics ---

/// Renders the metrics into the Prometheus text format.
async fn metrics_handler(registry: Arc<Registry>) -> Result<impl warp::Reply, Infallible> {
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    let (body, status) = match encoder.encode(&registry.gather(), &mut buffer) {
        Ok(()) => (String::from_utf8_lossy(&buffer).into_owned(), StatusCode::OK),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (String::new(), StatusCode::INTERNAL_SERVER_ERROR)
        }
    };
    Ok(warp::reply::with_status(
        warp::reply::with_header(body, "Content-Type", encoder.format_type()),
        status,
    ))
}

pub fn metrics_routes(
    registry: Arc<Registry>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let metrics_route = warp::path("metrics")
        .and(warp::get())
        .and(warp::any().map(move || Arc::clone(&registry)))
        .and_then(metrics_handler);
    let health_route = warp::path("healthz").and(warp::get()).map(|| "ok");
    metrics_route.or(health_route)
}

/// Runs the HTTP server to expose the /metrics endpoint.
pub async fn run_metrics_server(addr: SocketAddr, registry: Arc<Registry>) {
    info!("Starting metrics server on {}", addr);
    warp::serve(metrics_routes(registry)).run(addr).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use policy_engine::crds::ResourceRule;
    use policy_engine::{AccessPolicy, AccessPolicySpec, StaticPolicies};
    use serde_json::{json, Value};

    fn source() -> Arc<dyn PolicySource> {
        Arc::new(StaticPolicies::new().with_policy(AccessPolicy::new(
            "deployers",
            AccessPolicySpec {
                resource_rules: vec![ResourceRule {
                    api_groups: vec!["apps".to_string()],
                    resources: vec!["deployments".to_string()],
                    verbs: vec!["*".to_string()],
                }],
                non_resource_rules: vec![],
                allow: vec!["ci".to_string()],
                deny: vec!["suspended".to_string()],
                namespace_selector: None,
            },
        )))
    }

    fn review(user: &str, groups: &[&str]) -> Value {
        json!({
            "apiVersion": "authorization.k8s.io/v1",
            "kind": "SubjectAccessReview",
            "spec": {
                "user": user,
                "groups": groups,
                "resourceAttributes": {
                    "namespace": "prod",
                    "verb": "update",
                    "group": "apps",
                    "resource": "deployments"
                }
            }
        })
    }

    async fn post(body: &Value) -> (StatusCode, Value) {
        let res = warp::test::request()
            .method("POST")
            .path("/authorize")
            .json(body)
            .reply(&authorizer_routes(source()))
            .await;
        let status = res.status();
        (status, serde_json::from_slice(res.body()).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_authorize_allows_denies_and_abstains() {
        let (code, body) = post(&review("robot", &["ci"])).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["kind"], "SubjectAccessReview");
        assert_eq!(body["status"]["allowed"], true);

        let (_, body) = post(&review("robot", &["ci", "suspended"])).await;
        assert_eq!(body["status"]["allowed"], false);
        assert_eq!(body["status"]["denied"], true);

        let (_, body) = post(&review("visitor", &[])).await;
        assert_eq!(body["status"]["allowed"], false);
        assert!(body["status"].get("denied").is_none());
    }

    #[tokio::test]
    async fn test_authorize_reports_malformed_review() {
        let (code, body) = post(&json!({
            "apiVersion": "authorization.k8s.io/v1",
            "kind": "SubjectAccessReview",
            "spec": {"user": "robot"}
        }))
        .await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["status"]["allowed"], false);
        assert!(body["status"]["evaluationError"].is_string());
    }

    #[tokio::test]
    async fn test_authorize_only_accepts_post() {
        let res = warp::test::request()
            .method("GET")
            .path("/authorize")
            .reply(&authorizer_routes(source()))
            .await;
        assert_eq!(res.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_metrics_and_health_endpoints() {
        let registry = Arc::new(metrics::create_and_register_metrics().unwrap());
        metrics::record_reconcile("BindingTemplate", "success");

        let res = warp::test::request()
            .path("/metrics")
            .reply(&metrics_routes(registry.clone()))
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        let text = String::from_utf8_lossy(res.body());
        assert!(text.contains("rbac_reconciliations_total"));

        let res = warp::test::request().path("/healthz").reply(&metrics_routes(registry)).await;
        assert_eq!(res.body().as_ref(), b"ok");
    }
}
