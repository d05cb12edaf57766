mod client;
mod group;
pub mod resources;
pub mod selector;
mod source;
#[cfg(test)]
mod testing;

pub use client::{Client, ClientState, DEFAULT_RESYNC_PERIOD, connect};
pub use group::{CacheSyncResult, GroupKind, ResourceGroup, check_cache_sync};
pub use selector::{LabelRequirement, LabelSelector, Operator, SelectorError, compose};
pub use source::{CacheSource, SyncReporter, SyncState, WatchSource};

/// Caller-supplied filters for a watched resource type
///
/// The owning group's mandatory label requirements are merged into
/// `label_selector` before every list and watch.
#[derive(Debug, Clone, Default)]
pub struct ApiFilters {
    /// Label selector string (e.g., "app=nginx,version=v1")
    pub label_selector: Option<String>,
    /// Field selector string (e.g., "metadata.name=settings"), passed through unchanged
    pub field_selector: Option<String>,
}
