/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/modules/rbac_manager/src/discovery.rs
*
* This file implements the API discovery cache consumed by the role engine.
*
* Architecture:
* - `DiscoverySource` is the seam to the API server. `KubeDiscovery` walks the
*   legacy core API (`/api/{version}`) and every served version of every API
*   group (`/apis/{group}/{version}`), returning one entry per resource and
*   subresource together with its verbs and namespace-scope flag.
* - `DiscoverySnapshot` is an immutable, sorted view of that surface. Two
*   snapshots of the same surface compare equal, which is what lets the cache
*   publish change events only when something really changed.
* - `DiscoveryCache` keeps the latest completed snapshot behind a
*   `tokio::sync::watch` channel. Readers clone an `Arc` and never wait for a
*   refresh in flight; a single background task refreshes on a fixed interval.
* - A group that fails to answer (typically an unavailable aggregated API) does
*   not make its resources vanish: the previous snapshot's entries for that
*   group are carried over until the group answers again.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use kube::Client;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, warn};

/// A resource (or `parent/subresource`) served by one group version.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DiscoveredResource {
    pub group: String,
    pub version: String,
    pub resource: String,
    pub namespaced: bool,
    pub verbs: Vec<String>,
}

impl DiscoveredResource {
    pub fn new(group: &str, version: &str, resource: &str, namespaced: bool, verbs: &[&str]) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            resource: resource.to_string(),
            namespaced,
            verbs: verbs.iter().map(|v| v.to_string()).collect(),
        }
    }
}

/// Verb sets keyed by (API group, resource), merged across versions.
pub type VerbTable = BTreeMap<(String, String), BTreeSet<String>>;

#[derive(Clone, Debug)]
pub struct DiscoverySnapshot {
    resources: Vec<DiscoveredResource>,
    incomplete_groups: BTreeSet<String>,
    fetched_at: DateTime<Utc>,
}

impl DiscoverySnapshot {
    pub fn new(resources: Vec<DiscoveredResource>) -> Self {
        Self::with_incomplete_groups(resources, BTreeSet::new())
    }

    pub fn with_incomplete_groups(
        mut resources: Vec<DiscoveredResource>,
        incomplete_groups: BTreeSet<String>,
    ) -> Self {
        for r in &mut resources {
            r.verbs.sort();
            r.verbs.dedup();
        }
        resources.sort();
        resources.dedup();
        Self {
            resources,
            incomplete_groups,
            fetched_at: Utc::now(),
        }
    }

    pub fn resources(&self) -> &[DiscoveredResource] {
        &self.resources
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    /// Groups whose discovery request failed while building this snapshot.
    pub fn incomplete_groups(&self) -> &BTreeSet<String> {
        &self.incomplete_groups
    }

    /// Whether both snapshots describe the same API surface.
    pub fn same_surface(&self, other: &DiscoverySnapshot) -> bool {
        self.resources == other.resources
    }

    /// Union of verbs per (group, resource). With `namespaced_only`, cluster-scoped
    /// resources are left out.
    pub fn verb_table(&self, namespaced_only: bool) -> VerbTable {
        let mut table = VerbTable::new();
        for r in self.resources.iter().filter(|r| !namespaced_only || r.namespaced) {
            table
                .entry((r.group.clone(), r.resource.clone()))
                .or_default()
                .extend(r.verbs.iter().cloned());
        }
        table
    }

    /// Fills in resources of groups that failed to answer from a previous snapshot.
    fn carry_over(mut self, previous: &DiscoverySnapshot) -> Self {
        if self.incomplete_groups.is_empty() {
            return self;
        }
        let carried: Vec<DiscoveredResource> = previous
            .resources
            .iter()
            .filter(|r| self.incomplete_groups.contains(&r.group))
            .cloned()
            .collect();
        if !carried.is_empty() {
            debug!(count = carried.len(), "Carrying over resources of unavailable API groups");
            self.resources.extend(carried);
            self.resources.sort();
            self.resources.dedup();
        }
        self
    }
}

// --- Discovery Source ---

#[async_trait]
pub trait DiscoverySource: Send + Sync {
    async fn fetch(&self) -> Result<DiscoverySnapshot>;
}

/// Reads the API surface from the Kubernetes API server.
#[derive(Clone)]
pub struct KubeDiscovery {
    client: Client,
}

impl KubeDiscovery {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn push_resources(
    out: &mut Vec<DiscoveredResource>,
    group: &str,
    version: &str,
    list: k8s_openapi::apimachinery::pkg::apis::meta::v1::APIResourceList,
) {
    for r in list.resources {
        if r.verbs.is_empty() {
            continue;
        }
        out.push(DiscoveredResource {
            group: group.to_string(),
            version: version.to_string(),
            resource: r.name,
            namespaced: r.namespaced,
            verbs: r.verbs,
        });
    }
}

#[async_trait]
impl DiscoverySource for KubeDiscovery {
    async fn fetch(&self) -> Result<DiscoverySnapshot> {
        let mut resources = Vec::new();
        let mut incomplete = BTreeSet::new();

        // The core group must answer; without it the snapshot is useless.
        let core = self.client.list_core_api_versions().await?;
        for version in &core.versions {
            let list = self.client.list_core_api_resources(version).await?;
            push_resources(&mut resources, "", version, list);
        }

        let groups = self.client.list_api_groups().await?;
        for group in groups.groups {
            for gv in &group.versions {
                match self.client.list_api_group_resources(&gv.group_version).await {
                    Ok(list) => push_resources(&mut resources, &group.name, &gv.version, list),
                    Err(e) => {
                        warn!(group_version = %gv.group_version, error = %e, "API group discovery failed");
                        incomplete.insert(group.name.clone());
                    }
                }
            }
        }

        Ok(DiscoverySnapshot::with_incomplete_groups(resources, incomplete))
    }
}

// --- Discovery Cache ---

pub struct DiscoveryCache {
    tx: watch::Sender<Option<Arc<DiscoverySnapshot>>>,
}

impl Default for DiscoveryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DiscoveryCache {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    pub fn with_snapshot(snapshot: DiscoverySnapshot) -> Self {
        let (tx, _rx) = watch::channel(Some(Arc::new(snapshot)));
        Self { tx }
    }

    /// The most recent completed snapshot, if any.
    pub fn snapshot(&self) -> Option<Arc<DiscoverySnapshot>> {
        self.tx.borrow().clone()
    }

    /// The most recent snapshot, or the transient error the role engine reports
    /// instead of applying a degenerate rule set.
    pub fn current(&self) -> Result<Arc<DiscoverySnapshot>> {
        match self.snapshot() {
            None => Err(Error::DiscoveryUnavailable),
            Some(s) if s.is_empty() => Err(Error::EmptyDiscovery),
            Some(s) => Ok(s),
        }
    }

    /// One item per published change of the API surface.
    pub fn changes(&self) -> impl Stream<Item = ()> + Send + Sync + 'static {
        WatchStream::from_changes(self.tx.subscribe()).map(|_| ())
    }

    /// Fetches a new snapshot and publishes it when the surface changed.
    /// Returns whether subscribers were notified. On error the previous
    /// snapshot stays in place.
    pub async fn refresh(&self, source: &dyn DiscoverySource) -> Result<bool> {
        let fetched = source.fetch().await?;
        let previous = self.snapshot();
        let fetched = match &previous {
            Some(prev) => fetched.carry_over(prev),
            None => fetched,
        };

        let changed = previous.as_ref().map_or(true, |prev| !prev.same_surface(&fetched));
        if changed {
            info!(
                resources = fetched.resources().len(),
                incomplete_groups = fetched.incomplete_groups().len(),
                "API surface changed, publishing new discovery snapshot"
            );
            self.tx.send_replace(Some(Arc::new(fetched)));
        } else {
            debug!("API surface unchanged");
        }
        Ok(changed)
    }

    /// Refreshes on a fixed interval until the task is dropped. `observe` sees
    /// the outcome of every attempt.
    pub async fn run<F>(&self, source: Arc<dyn DiscoverySource>, interval: Duration, mut observe: F)
    where
        F: FnMut(&Result<bool>) + Send,
    {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let outcome = self.refresh(source.as_ref()).await;
            if let Err(e) = &outcome {
                warn!(error = %e, "Discovery refresh failed, keeping last snapshot");
            }
            observe(&outcome);
        }
    }
}
