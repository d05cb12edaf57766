// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Background population of a single resource type's cache
//!
//! A [`CacheSource`] owns the write side of one local cache. It runs until the
//! cancellation token fires and reports the outcome of its first full snapshot
//! exactly once through a [`SyncReporter`].
//!
//! [`WatchSource`] is the Kubernetes implementation: a `kube` watcher feeding a
//! reflector store, restarted one resync period after each completed list so
//! the store is periodically rebuilt from a fresh one.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use kube::Api;
use kube::Resource;
use kube::runtime::reflector::{self, Store, store::Writer};
use kube::runtime::{WatchStreamExt, watcher};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::ApiFilters;
use super::selector::{LabelRequirement, compose};

/// Consecutive watch errors tolerated before the first snapshot is declared failed
const MAX_INITIAL_SYNC_FAILURES: u32 = 3;

/// First-snapshot state of one resource type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Pending,
    Synced,
    Failed,
}

/// Write side of a resource type's readiness signal
///
/// Only the first report is kept. Dropping the reporter without reporting is
/// observed by the waiter as a failure.
#[derive(Debug)]
pub struct SyncReporter {
    tx: watch::Sender<SyncState>,
}

impl SyncReporter {
    pub fn synced(&self) {
        self.report(SyncState::Synced);
    }

    pub fn failed(&self) {
        self.report(SyncState::Failed);
    }

    pub fn is_reported(&self) -> bool {
        *self.tx.borrow() != SyncState::Pending
    }

    fn report(&self, state: SyncState) {
        self.tx.send_if_modified(|current| {
            if *current == SyncState::Pending {
                *current = state;
                true
            } else {
                false
            }
        });
    }
}

/// Create a readiness signal for one resource type
pub fn sync_channel() -> (SyncReporter, watch::Receiver<SyncState>) {
    let (tx, rx) = watch::channel(SyncState::Pending);
    (SyncReporter { tx }, rx)
}

/// Wait for the first report on a readiness signal
///
/// Returns true only for [`SyncState::Synced`]; a reporter dropped while still
/// pending counts as not synced.
pub async fn wait_synced(mut rx: watch::Receiver<SyncState>) -> bool {
    rx.wait_for(|state| *state != SyncState::Pending)
        .await
        .map(|state| *state == SyncState::Synced)
        .unwrap_or(false)
}

/// Something that populates one local cache in the background
#[async_trait]
pub trait CacheSource: Send + 'static {
    /// Identifier of the cached resource type, used in sync results and errors
    fn type_name(&self) -> String;

    /// Populate the cache until `cancel` fires
    ///
    /// Implementations must report through `reporter` once the first snapshot
    /// has completed or has definitively failed.
    async fn run(self: Box<Self>, reporter: SyncReporter, cancel: CancellationToken);
}

/// Watch-backed cache for a Kubernetes resource type
pub struct WatchSource<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    api: Api<K>,
    type_name: String,
    filters: ApiFilters,
    mandatory: Arc<[LabelRequirement]>,
    resync_period: Duration,
    writer: Writer<K>,
}

impl<K> WatchSource<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
{
    /// Create the source and the read handle of the store it populates
    pub fn new(
        api: Api<K>,
        filters: ApiFilters,
        mandatory: Arc<[LabelRequirement]>,
        resync_period: Duration,
    ) -> (Self, Store<K>) {
        let (store, writer) = reflector::store();
        let source = Self {
            api,
            type_name: type_name::<K>(),
            filters,
            mandatory,
            resync_period,
            writer,
        };
        (source, store)
    }

    /// Watch parameters for the next list/watch cycle
    ///
    /// The label selector is recomposed with the mandatory requirements every
    /// time a watch (and therefore its initial list) is issued.
    fn watcher_config(&self) -> watcher::Config {
        let base = self.filters.label_selector.as_deref().unwrap_or_default();
        let labels = compose(base, &self.mandatory);

        let mut config = watcher::Config::default();
        if !labels.is_empty() {
            config = config.labels(&labels);
        }
        if let Some(ref fields) = self.filters.field_selector {
            config = config.fields(fields);
        }
        config
    }
}

#[async_trait]
impl<K> CacheSource for WatchSource<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
{
    fn type_name(&self) -> String {
        self.type_name.clone()
    }

    async fn run(self: Box<Self>, reporter: SyncReporter, cancel: CancellationToken) {
        let mut source = *self;
        let mut failures = 0u32;

        loop {
            let config = source.watcher_config();
            debug!(
                resource = %source.type_name,
                label_selector = ?config.label_selector,
                field_selector = ?config.field_selector,
                "Starting watch"
            );

            let stream = watcher(source.api.clone(), config).default_backoff();
            tokio::pin!(stream);
            // Armed once this cycle's list has completed
            let resync = tokio::time::sleep(source.resync_period);
            tokio::pin!(resync);
            let mut listed = false;

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!(resource = %source.type_name, "Watch cancelled");
                        return;
                    }
                    _ = &mut resync, if listed => {
                        debug!(resource = %source.type_name, "Resync period elapsed, relisting");
                        break;
                    }
                    event = stream.next() => match event {
                        Some(Ok(event)) => {
                            failures = 0;
                            let init_done = matches!(event, watcher::Event::InitDone);
                            source.writer.apply_watcher_event(&event);
                            if init_done {
                                if !listed {
                                    listed = true;
                                    resync.as_mut().reset(Instant::now() + source.resync_period);
                                }
                                if !reporter.is_reported() {
                                    info!(resource = %source.type_name, "Cache synced");
                                    reporter.synced();
                                }
                            }
                        }
                        Some(Err(e)) if reporter.is_reported() => {
                            warn!(
                                resource = %source.type_name,
                                error = %e,
                                "Watch error, backing off"
                            );
                        }
                        Some(Err(e)) => {
                            failures += 1;
                            if failures > MAX_INITIAL_SYNC_FAILURES {
                                error!(
                                    resource = %source.type_name,
                                    attempts = failures,
                                    error = %e,
                                    "Initial list failed, giving up"
                                );
                                reporter.failed();
                                return;
                            }
                            warn!(
                                resource = %source.type_name,
                                attempt = failures,
                                max_attempts = MAX_INITIAL_SYNC_FAILURES,
                                error = %e,
                                "Initial list failed, backing off"
                            );
                        }
                        None => {
                            warn!(resource = %source.type_name, "Watch stream ended, restarting");
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// Type identifier in `group/version/Kind` form, e.g. `v1/Namespace` or `apps/v1/Deployment`
pub fn type_name<K>() -> String
where
    K: Resource,
    K::DynamicType: Default,
{
    let dt = K::DynamicType::default();
    format!("{}/{}", K::api_version(&dt), K::kind(&dt))
}
