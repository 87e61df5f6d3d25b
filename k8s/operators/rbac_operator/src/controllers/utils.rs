/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: k8s/operators/rbac_operator/src/controllers/utils.rs
*
* This file contains common utility functions shared across the controllers.
* Consolidating reusable logic here keeps the individual controller files
* focused on mapping engine outcomes to status and requeue decisions.
*
* Functions:
* - `BackoffTracker`: per-object exponential retry delays.
* - `terminal_action`: requeue decision for errors retrying cannot fix.
* - `patch_status`: merge-patches the status subresource of an object.
* - `log_result`: logs the outcome of a reconciliation stream item.
*
* SPDX-License-Identifier: Apache-2.0
*/

use kube::{
    api::{Api, Patch, PatchParams},
    runtime::{controller::Action, reflector::ObjectRef},
    Resource,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffSettings {
    pub base: Duration,
    pub max: Duration,
}

/// Exponential backoff per object: `base * 2^failures`, capped at `max`.
/// A success or a finalizer cleanup resets the object's counter. Entries not
/// touched for `STALE_AFTER_MAX_DELAYS * max` belong to objects that are gone
/// and are dropped.
pub struct BackoffTracker {
    settings: BackoffSettings,
    failures: Mutex<HashMap<String, (u32, Instant)>>,
}

const STALE_AFTER_MAX_DELAYS: u32 = 4;

impl BackoffTracker {
    pub fn new(settings: BackoffSettings) -> Self {
        Self {
            settings,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Records a failure and returns how long to wait before retrying.
    pub fn next_delay(&self, key: &str) -> Duration {
        let now = Instant::now();
        let stale_after = self.settings.max.saturating_mul(STALE_AFTER_MAX_DELAYS);
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        failures.retain(|k, (_, last)| k == key || now.duration_since(*last) <= stale_after);

        let (count, last) = failures.entry(key.to_string()).or_insert((0, now));
        let delay = self
            .settings
            .base
            .checked_mul(2u32.saturating_pow(*count))
            .unwrap_or(self.settings.max)
            .min(self.settings.max);
        *count = count.saturating_add(1);
        *last = now;
        delay
    }

    pub fn reset(&self, key: &str) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.failures.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Key identifying an object across controllers, e.g. `RoleTemplate/viewers`.
pub fn backoff_key<K>(obj: &K) -> String
where
    K: Resource<DynamicType = ()>,
{
    ObjectRef::from_obj(obj).to_string()
}

/// Requeue decision for an engine error that retrying cannot fix. A target
/// held by someone else can be released without the template changing, so it
/// is rechecked on the resync interval.
pub fn terminal_action(error: &rbac_manager::Error, resync: Duration) -> Action {
    match error {
        rbac_manager::Error::TargetNotManaged(_) => Action::requeue(resync),
        _ => Action::await_change(),
    }
}

/// Merge-patches `status` into the status subresource.
pub async fn patch_status<K, S>(api: &Api<K>, name: &str, status: &S) -> Result<(), kube::Error>
where
    K: Resource + Clone + DeserializeOwned + Debug,
    S: Serialize,
{
    let patch = json!({ "status": status });
    api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Logs a reconciliation stream item.
pub fn log_result<O: Display, E: Display>(kind: &str, res: Result<(O, Action), E>) {
    match res {
        Ok((obj, action)) => debug!(kind, object = %obj, ?action, "Reconciled"),
        Err(e) => warn!(kind, error = %e, "Reconciliation failed"),
    }
}
