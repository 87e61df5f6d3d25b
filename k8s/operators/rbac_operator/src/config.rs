/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: k8s/operators/rbac_operator/src/config.rs
*
* Runtime configuration of the operator. Every setting is a command-line flag
* that can also be supplied through the environment variable named next to
* it, which is how the Deployment manifest configures the operator.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::controllers::utils::BackoffSettings;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing_layer::LogFormat;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("TLS_CERT_PATH and TLS_KEY_PATH must be set together")]
    IncompleteTls,

    #[error("TLS file '{0}' does not exist")]
    MissingTlsFile(PathBuf),

    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),

    #[error("BACKOFF_BASE_MILLIS ({base_ms}ms) must not exceed BACKOFF_MAX_SECS ({max_s}s)")]
    BackoffOrder { base_ms: u64, max_s: u64 },
}

/// Kubernetes operator generating RBAC from templates and serving an
/// authorization webhook.
#[derive(Parser, Debug, Clone)]
#[command(name = "rbac_operator", author, version, about, long_about = None)]
pub struct OperatorConfig {
    /// Listen address of the SubjectAccessReview webhook.
    #[arg(long, env = "AUTHORIZER_ADDR", default_value = "0.0.0.0:8443")]
    pub authorizer_addr: SocketAddr,

    /// Listen address of the /metrics and /healthz endpoints.
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:9090")]
    pub metrics_addr: SocketAddr,

    /// PEM certificate for the webhook. Plain HTTP when unset.
    #[arg(long, env = "TLS_CERT_PATH")]
    pub tls_cert_path: Option<PathBuf>,

    #[arg(long, env = "TLS_KEY_PATH")]
    pub tls_key_path: Option<PathBuf>,

    /// Seconds between two API discovery refreshes.
    #[arg(long, env = "DISCOVERY_INTERVAL_SECS", default_value_t = 30)]
    pub discovery_interval_secs: u64,

    /// Maximum number of objects each controller reconciles at once.
    #[arg(long, env = "CONTROLLER_CONCURRENCY", default_value_t = 4)]
    pub controller_concurrency: u16,

    /// Periodic requeue of successfully reconciled objects.
    #[arg(long, env = "RESYNC_INTERVAL_SECS", default_value_t = 3600)]
    pub resync_interval_secs: u64,

    #[arg(long, env = "BACKOFF_BASE_MILLIS", default_value_t = 500)]
    pub backoff_base_millis: u64,

    #[arg(long, env = "BACKOFF_MAX_SECS", default_value_t = 300)]
    pub backoff_max_secs: u64,

    /// `json` or `text`.
    #[arg(long, env = "LOG_FORMAT", default_value = "json")]
    pub log_format: LogFormat,

    /// Print the CustomResourceDefinitions as YAML and exit.
    #[arg(long)]
    pub print_crds: bool,
}

impl OperatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match (&self.tls_cert_path, &self.tls_key_path) {
            (Some(cert), Some(key)) => {
                for path in [cert, key] {
                    if !path.exists() {
                        return Err(ConfigError::MissingTlsFile(path.clone()));
                    }
                }
            }
            (None, None) => {}
            _ => return Err(ConfigError::IncompleteTls),
        }
        if self.discovery_interval_secs == 0 {
            return Err(ConfigError::ZeroInterval("DISCOVERY_INTERVAL_SECS"));
        }
        if self.resync_interval_secs == 0 {
            return Err(ConfigError::ZeroInterval("RESYNC_INTERVAL_SECS"));
        }
        if self.backoff_base_millis == 0 {
            return Err(ConfigError::ZeroInterval("BACKOFF_BASE_MILLIS"));
        }
        if Duration::from_millis(self.backoff_base_millis) > Duration::from_secs(self.backoff_max_secs) {
            return Err(ConfigError::BackoffOrder {
                base_ms: self.backoff_base_millis,
                max_s: self.backoff_max_secs,
            });
        }
        Ok(())
    }

    /// Certificate and key paths when TLS is configured.
    pub fn tls(&self) -> Option<(PathBuf, PathBuf)> {
        match (&self.tls_cert_path, &self.tls_key_path) {
            (Some(cert), Some(key)) => Some((cert.clone(), key.clone())),
            _ => None,
        }
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    pub fn backoff(&self) -> BackoffSettings {
        BackoffSettings {
            base: Duration::from_millis(self.backoff_base_millis),
            max: Duration::from_secs(self.backoff_max_secs),
        }
    }
}
