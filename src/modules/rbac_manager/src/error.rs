/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/modules/rbac_manager/src/error.rs
*
* Error type shared by the discovery cache, the role engine and the binding
* engine. Variants are split into two families: terminal errors caused by an
* invalid template (surfaced as a status condition and never retried) and
* transient errors (API failures, conflicts, missing discovery data) that the
* controllers retry with backoff.
*
* SPDX-License-Identifier: Apache-2.0
*/

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Conflicting update on {0}, the object changed since it was read")]
    Conflict(String),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("No API discovery snapshot has been completed yet")]
    DiscoveryUnavailable,

    #[error("API discovery snapshot contains no resources")]
    EmptyDiscovery,

    #[error("Invalid spec: {0}")]
    InvalidSpec(String),

    #[error("Invalid label selector: {0}")]
    InvalidSelector(String),

    #[error("{0} already exists and is not managed by this template")]
    TargetNotManaged(String),

    #[error("JSON serialization/deserialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Missing object key '{0}' in resource")]
    MissingObjectKey(&'static str),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Errors that require the user to correct the template. Retrying them
    /// cannot succeed until the object changes.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::InvalidSpec(_) | Error::InvalidSelector(_) | Error::TargetNotManaged(_)
        )
    }

    /// Short machine-readable reason used in status conditions.
    pub fn reason(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "ApiError",
            Error::Conflict(_) => "Conflict",
            Error::Transient(_) => "TransientError",
            Error::DiscoveryUnavailable | Error::EmptyDiscovery => "DiscoveryUnavailable",
            Error::InvalidSpec(_) | Error::InvalidSelector(_) => "InvalidSpec",
            Error::TargetNotManaged(_) => "TargetNotManaged",
            Error::SerializationError(_) => "SerializationError",
            Error::MissingObjectKey(_) => "MissingObjectKey",
        }
    }
}

/// Returns true when the API server answered with the given HTTP status.
pub(crate) fn is_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == code)
}
