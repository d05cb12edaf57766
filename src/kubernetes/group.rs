// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Label-scoped groups of watched resource types
//!
//! A [`ResourceGroup`] is the unit that gets started and waited on: every type
//! registered in it shares the same mandatory label requirements and resync period.
//! Groups never share state with each other.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use kube::Api;
use kube::Resource;
use kube::runtime::reflector::Store;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ApiFilters;
use super::selector::{LabelRequirement, compose};
use super::source::{CacheSource, SyncState, WatchSource, sync_channel, wait_synced};
use crate::error::{Error, Result};

/// Readiness per resource type after one barrier wait
///
/// Iteration order is unspecified.
pub type CacheSyncResult = HashMap<String, bool>;

/// Which of the client's cache groups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupKind {
    Namespace,
    Resource,
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Namespace => f.write_str("namespace"),
            Self::Resource => f.write_str("resource"),
        }
    }
}

/// Readiness signal of a started resource type
struct StartedSource {
    type_name: String,
    ready: watch::Receiver<SyncState>,
}

pub struct ResourceGroup {
    kind: GroupKind,
    mandatory: Arc<[LabelRequirement]>,
    resync_period: Duration,
    pending: Vec<Box<dyn CacheSource>>,
    started: Vec<StartedSource>,
    tasks: JoinSet<()>,
    synced: bool,
}

impl ResourceGroup {
    pub fn new(kind: GroupKind, mandatory: Vec<LabelRequirement>, resync_period: Duration) -> Self {
        Self {
            kind,
            mandatory: mandatory.into(),
            resync_period,
            pending: Vec::new(),
            started: Vec::new(),
            tasks: JoinSet::new(),
            synced: false,
        }
    }

    pub fn kind(&self) -> GroupKind {
        self.kind
    }

    pub fn mandatory_requirements(&self) -> &[LabelRequirement] {
        &self.mandatory
    }

    pub fn resync_period(&self) -> Duration {
        self.resync_period
    }

    /// Selector this group would send for a request carrying `existing`
    pub fn compose_selector(&self, existing: &str) -> String {
        compose(existing, &self.mandatory)
    }

    /// Names of all registered types, started or not
    pub fn type_names(&self) -> Vec<String> {
        self.started
            .iter()
            .map(|s| s.type_name.clone())
            .chain(self.pending.iter().map(|s| s.type_name()))
            .collect()
    }

    /// True once this group's barrier has completed with every type ready
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Add a cache source; it runs on the next [`ResourceGroup::start`]
    pub fn register(&mut self, source: Box<dyn CacheSource>) {
        debug!(group = %self.kind, resource = %source.type_name(), "Registered cache source");
        self.pending.push(source);
    }

    /// Register a watch-backed cache for `K` and return its read handle
    pub fn watch<K>(&mut self, api: Api<K>, filters: ApiFilters) -> Store<K>
    where
        K: Resource + Clone + DeserializeOwned + std::fmt::Debug + Send + Sync + 'static,
        K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
    {
        let (source, store) =
            WatchSource::new(api, filters, self.mandatory.clone(), self.resync_period);
        self.register(Box::new(source));
        store
    }

    /// Spawn background population for every registered source not yet running
    ///
    /// Does not block. Sources run until `cancel` fires.
    pub fn start(&mut self, cancel: &CancellationToken) {
        for source in self.pending.drain(..) {
            let type_name = source.type_name();
            let (reporter, ready) = sync_channel();
            debug!(group = %self.kind, resource = %type_name, "Starting cache population");
            self.tasks.spawn(source.run(reporter, cancel.clone()));
            self.started.push(StartedSource { type_name, ready });
        }
    }

    /// Block until every started type has reported its first snapshot
    ///
    /// Returns [`Error::Cancelled`] if `cancel` fires first, including when it had
    /// already fired before the call.
    pub fn wait_for_cache_sync(
        &self,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<CacheSyncResult>> + Send + 'static {
        let group = self.kind;
        let cancel = cancel.clone();
        let waits: Vec<_> = self
            .started
            .iter()
            .map(|s| {
                let ready = s.ready.clone();
                let type_name = s.type_name.clone();
                async move { (type_name, wait_synced(ready).await) }
            })
            .collect();

        async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Error::Cancelled { group }),
                results = futures::future::join_all(waits) => Ok(merge_results(results)),
            }
        }
    }

    /// Start population and wait for the group's barrier
    pub async fn synchronize(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.start(cancel);
        let results = self.wait_for_cache_sync(cancel).await?;
        check_cache_sync(self.kind, &results)?;

        self.synced = true;
        info!(group = %self.kind, types = results.len(), "Group caches synced");
        Ok(())
    }

    /// Wait for all background tasks to finish
    ///
    /// Only returns once the cancellation token has fired (or every source
    /// gave up on its own).
    pub async fn join(&mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                warn!(group = %self.kind, error = %e, "Cache population task failed");
            }
        }
    }
}

/// A type registered more than once is ready only if every registration is
fn merge_results(results: Vec<(String, bool)>) -> CacheSyncResult {
    let mut merged = CacheSyncResult::with_capacity(results.len());
    for (type_name, ready) in results {
        merged
            .entry(type_name)
            .and_modify(|synced| *synced &= ready)
            .or_insert(ready);
    }
    merged
}

/// Fold a group's readiness map into a single outcome
///
/// Stops at the first type that is not ready. Which failing type gets reported
/// when several fail is unspecified.
pub fn check_cache_sync(group: GroupKind, results: &CacheSyncResult) -> Result<()> {
    results.iter().try_fold((), |(), (resource_type, &synced)| {
        if synced {
            Ok(())
        } else {
            Err(Error::CacheSync {
                group,
                resource_type: resource_type.clone(),
            })
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kubernetes::testing::FakeSource;

    fn group() -> ResourceGroup {
        ResourceGroup::new(
            GroupKind::Resource,
            vec![LabelRequirement::equals("team", "platform").unwrap()],
            Duration::from_secs(300),
        )
    }

    #[test]
    fn test_group_kind_display() {
        assert_eq!(GroupKind::Namespace.to_string(), "namespace");
        assert_eq!(GroupKind::Resource.to_string(), "resource");
    }

    #[test]
    fn test_check_cache_sync_all_ready() {
        let results: CacheSyncResult = [("A".to_string(), true), ("B".to_string(), true)].into();
        assert!(check_cache_sync(GroupKind::Resource, &results).is_ok());
        assert!(check_cache_sync(GroupKind::Resource, &CacheSyncResult::new()).is_ok());
    }

    #[test]
    fn test_check_cache_sync_reports_failure() {
        let results: CacheSyncResult = [("A".to_string(), true), ("B".to_string(), false)].into();
        match check_cache_sync(GroupKind::Resource, &results) {
            Err(Error::CacheSync {
                group,
                resource_type,
            }) => {
                assert_eq!(group, GroupKind::Resource);
                assert_eq!(resource_type, "B");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_check_cache_sync_multiple_failures() {
        let results: CacheSyncResult = [
            ("A".to_string(), false),
            ("B".to_string(), true),
            ("C".to_string(), false),
        ]
        .into();
        match check_cache_sync(GroupKind::Namespace, &results) {
            Err(Error::CacheSync { resource_type, .. }) => {
                assert!(resource_type == "A" || resource_type == "C");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_compose_selector_uses_group_requirements() {
        let group = group();
        assert_eq!(group.compose_selector("env=prod"), "env=prod,team=platform");
        assert_eq!(group.compose_selector(""), "team=platform");
        assert_eq!(group.resync_period(), Duration::from_secs(300));
        assert_eq!(group.mandatory_requirements().len(), 1);
    }

    #[tokio::test]
    async fn test_synchronize_all_ready() {
        let mut group = group();
        group.register(Box::new(FakeSource::synced("A")));
        group.register(Box::new(FakeSource::synced("B").delayed(Duration::from_millis(20))));

        let cancel = CancellationToken::new();
        group.synchronize(&cancel).await.unwrap();

        assert!(group.is_synced());
        let mut names = group.type_names();
        names.sort();
        assert_eq!(names, vec!["A", "B"]);
        cancel.cancel();
        group.join().await;
    }

    #[tokio::test]
    async fn test_wait_for_cache_sync_collects_results() {
        let mut group = group();
        group.register(Box::new(FakeSource::synced("A")));
        group.register(Box::new(FakeSource::failing("B")));

        let cancel = CancellationToken::new();
        group.start(&cancel);
        let results = group.wait_for_cache_sync(&cancel).await.unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results.get("A"), Some(&true));
        assert_eq!(results.get("B"), Some(&false));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_synchronize_reports_failing_type() {
        let mut group = group();
        group.register(Box::new(FakeSource::synced("A")));
        group.register(Box::new(FakeSource::failing("B")));

        let cancel = CancellationToken::new();
        let err = group.synchronize(&cancel).await.unwrap_err();

        assert!(!err.is_cancelled());
        assert!(err.to_string().contains("B"));
        assert!(!group.is_synced());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_source_exiting_without_report_fails() {
        let mut group = group();
        group.register(Box::new(FakeSource::abandoning("A")));

        let cancel = CancellationToken::new();
        let err = group.synchronize(&cancel).await.unwrap_err();
        assert!(matches!(err, Error::CacheSync { ref resource_type, .. } if resource_type == "A"));
    }

    #[tokio::test]
    async fn test_wait_cancelled_while_pending() {
        let mut group = group();
        group.register(Box::new(FakeSource::never_synced("A")));

        let cancel = CancellationToken::new();
        group.start(&cancel);

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = group.wait_for_cache_sync(&cancel).await.unwrap_err();
        assert!(err.is_cancelled());

        // Background tasks observe the same token and stop
        tokio::time::timeout(Duration::from_secs(1), group.join())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_with_cancelled_token_returns_cancelled() {
        let mut group = group();
        group.register(Box::new(FakeSource::synced("A")));

        let cancel = CancellationToken::new();
        cancel.cancel();
        group.start(&cancel);

        let err = group.wait_for_cache_sync(&cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled { group: GroupKind::Resource }));
    }

    #[test]
    fn test_merge_results_keeps_failure_of_duplicate_type() {
        let merged = merge_results(vec![
            ("v1/ConfigMap".to_string(), false),
            ("v1/Secret".to_string(), true),
            ("v1/ConfigMap".to_string(), true),
        ]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged.get("v1/ConfigMap"), Some(&false));
        assert_eq!(merged.get("v1/Secret"), Some(&true));
    }

    #[tokio::test]
    async fn test_duplicate_type_failure_is_not_masked() {
        let mut group = group();
        group.register(Box::new(FakeSource::failing("v1/ConfigMap")));
        group.register(Box::new(
            FakeSource::synced("v1/ConfigMap").delayed(Duration::from_millis(10)),
        ));

        let cancel = CancellationToken::new();
        let err = group.synchronize(&cancel).await.unwrap_err();

        assert!(matches!(
            err,
            Error::CacheSync { ref resource_type, .. } if resource_type == "v1/ConfigMap"
        ));
        assert!(!group.is_synced());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_start_is_incremental() {
        let mut group = group();
        let cancel = CancellationToken::new();

        group.register(Box::new(FakeSource::synced("A")));
        group.start(&cancel);
        group.register(Box::new(FakeSource::synced("B")));
        group.start(&cancel);

        let results = group.wait_for_cache_sync(&cancel).await.unwrap();
        assert_eq!(results.len(), 2);
        cancel.cancel();
    }
}
