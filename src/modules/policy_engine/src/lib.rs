/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/modules/policy_engine/src/lib.rs
*
* This file is the entry point for the 'policy_engine' Rust library, the
* authorization decision side of the control plane. It answers "is this
* request allowed?" against the AccessPolicy objects in the cluster.
*
* The main pieces are:
* 1. `crds`: the AccessPolicy custom resource.
* 2. `matching`: how resource and non-resource rules, and namespace
*    selectors, match a request.
* 3. `decision`: the stateless Allow / Deny / Abstain evaluation over a
*    `PolicySource`.
* 4. `review`: translation to and from the SubjectAccessReview objects the
*    API server posts to an authorization webhook.
* 5. `index`: the `PolicySource` backed by reflector stores.
*
* SPDX-License-Identifier: Apache-2.0 */

pub mod crds;
pub mod decision;
pub mod index;
pub mod matching;
pub mod request;
pub mod review;

pub use crds::{AccessPolicy, AccessPolicySpec, AccessPolicyStatus};
pub use decision::{decide, PolicySource, StaticPolicies};
pub use index::StoreIndex;
pub use request::{AccessRequest, Decision, Verdict};
pub use review::{evaluate_review, ReviewError};
