/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: k8s/operators/rbac_operator/src/metrics.rs
*
* This module defines and registers the custom Prometheus metrics that the
* rbac-operator exposes: reconciliation outcomes per kind, discovery refresh
* health and authorization decisions.
*
* Using `lazy_static`, the metrics are created only once and are available
* globally across all concurrent reconciliation loops and web server threads.
*
* SPDX-License-Identifier: Apache-2.0
*/

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter_vec, register_int_gauge, Histogram, IntCounterVec, IntGauge,
    Registry,
};

// --- Metric Definitions ---

lazy_static! {
    /// Reconciliations per kind, labeled `success`, `invalid`, `partial` or `error`.
    pub static ref RECONCILIATIONS_TOTAL: IntCounterVec =
        register_int_counter_vec!(
            "rbac_reconciliations_total",
            "Total number of reconciliations by kind and result.",
            &["kind", "result"]
        ).unwrap();

    pub static ref DISCOVERY_REFRESH_TOTAL: IntCounterVec =
        register_int_counter_vec!(
            "rbac_discovery_refresh_total",
            "Total number of API discovery refreshes by result.",
            &["result"]
        ).unwrap();

    /// Resources in the current discovery snapshot.
    pub static ref DISCOVERY_RESOURCES: IntGauge =
        register_int_gauge!(
            "rbac_discovery_resources",
            "Number of resources in the current API discovery snapshot."
        ).unwrap();

    pub static ref AUTHORIZATION_DECISIONS_TOTAL: IntCounterVec =
        register_int_counter_vec!(
            "rbac_authorization_decisions_total",
            "Total number of authorization decisions by outcome.",
            &["decision"]
        ).unwrap();

    /// Buckets in seconds: 0.5ms up to 100ms.
    pub static ref AUTHORIZATION_LATENCY_SECONDS: Histogram =
        register_histogram!(
            "rbac_authorization_latency_seconds",
            "Latency of SubjectAccessReview evaluation.",
            vec![0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1]
        ).unwrap();
}

/// Creates a new Prometheus registry and registers all custom metrics.
///
/// This function is intended to be called once at operator startup.
pub fn create_and_register_metrics() -> Result<Registry, prometheus::Error> {
    let r = Registry::new();
    r.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    r.register(Box::new(DISCOVERY_REFRESH_TOTAL.clone()))?;
    r.register(Box::new(DISCOVERY_RESOURCES.clone()))?;
    r.register(Box::new(AUTHORIZATION_DECISIONS_TOTAL.clone()))?;
    r.register(Box::new(AUTHORIZATION_LATENCY_SECONDS.clone()))?;
    Ok(r)
}

pub fn record_reconcile(kind: &str, result: &str) {
    RECONCILIATIONS_TOTAL.with_label_values(&[kind, result]).inc();
}

/// Records the outcome of one discovery refresh.
pub fn record_discovery<E>(outcome: &Result<bool, E>, resources: Option<usize>) {
    let result = match outcome {
        Ok(true) => "changed",
        Ok(false) => "unchanged",
        Err(_) => "error",
    };
    DISCOVERY_REFRESH_TOTAL.with_label_values(&[result]).inc();
    if let Some(n) = resources {
        DISCOVERY_RESOURCES.set(n as i64);
    }
}
