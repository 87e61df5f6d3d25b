/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/modules/policy_engine/src/request.rs
*
* Input and output types of the decision engine.
*
* SPDX-License-Identifier: Apache-2.0
*/

use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessRequest {
    pub user: String,
    pub groups: Vec<String>,
    pub attributes: RequestAttributes,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestAttributes {
    Resource(ResourceRequest),
    NonResource(NonResourceRequest),
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ResourceRequest {
    /// `None` (or empty) for cluster-scoped requests.
    pub namespace: Option<String>,
    pub verb: String,
    /// API group, empty for the core group.
    pub group: String,
    pub resource: String,
    pub subresource: Option<String>,
    pub name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct NonResourceRequest {
    pub verb: String,
    pub path: String,
}

impl AccessRequest {
    /// Whether the request's user or any of its groups is listed.
    pub fn has_principal_in(&self, principals: &[String]) -> bool {
        principals
            .iter()
            .any(|p| *p == self.user || self.groups.iter().any(|g| g == p))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
    /// No applicable policy names the principal; other authorizers decide.
    Abstain,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::Deny => "deny",
            Decision::Abstain => "abstain",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Verdict {
    pub decision: Decision,
    pub reason: String,
}

impl Verdict {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Allow,
            reason: reason.into(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Deny,
            reason: reason.into(),
        }
    }

    pub fn abstain(reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Abstain,
            reason: reason.into(),
        }
    }
}
