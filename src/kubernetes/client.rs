use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

use anyhow::Context;
use k8s_openapi::api::core::v1::Namespace;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::reflector::Store;
use kube::{Api, Config, Resource};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::ApiFilters;
use super::group::{GroupKind, ResourceGroup};
use super::selector::{LabelRequirement, parse_requirements};
use super::source::CacheSource;
use crate::error::{Error, Result};

/// Full re-list interval for every watched type
pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(300); // 5 minutes

/// Timeout for connecting to K8s API
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle of a [`Client`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Constructed,
    Starting(GroupKind),
    Ready,
    Failed,
}

/// Label-scoped namespace and resource caches over one Kubernetes connection
///
/// Construction only wires configuration. [`Client::start`] populates the
/// namespace group, then the resource group, and returns once both hold a
/// complete initial snapshot.
pub struct Client {
    transport: kube::Client,
    namespace_group: ResourceGroup,
    resource_group: ResourceGroup,
    state: watch::Sender<ClientState>,
}

impl Client {
    /// Create a client with the default resync period (no I/O)
    pub fn new(
        transport: kube::Client,
        resource_requirements: Vec<LabelRequirement>,
        namespace_requirements: Vec<LabelRequirement>,
    ) -> Self {
        Self::with_resync_period(
            transport,
            resource_requirements,
            namespace_requirements,
            DEFAULT_RESYNC_PERIOD,
        )
    }

    pub fn with_resync_period(
        transport: kube::Client,
        resource_requirements: Vec<LabelRequirement>,
        namespace_requirements: Vec<LabelRequirement>,
        resync_period: Duration,
    ) -> Self {
        debug!(
            resource_requirements = resource_requirements.len(),
            namespace_requirements = namespace_requirements.len(),
            resync_secs = resync_period.as_secs(),
            "Creating cache client"
        );

        let (state, _) = watch::channel(ClientState::Constructed);
        Self {
            transport,
            namespace_group: ResourceGroup::new(
                GroupKind::Namespace,
                namespace_requirements,
                resync_period,
            ),
            resource_group: ResourceGroup::new(
                GroupKind::Resource,
                resource_requirements,
                resync_period,
            ),
            state,
        }
    }

    /// Create a client from textual selectors, e.g. `"replicate=true"`
    ///
    /// Unlike selectors carried by outgoing requests, these are configuration:
    /// a malformed one is an error.
    pub fn from_selectors(
        transport: kube::Client,
        resource_selector: &str,
        namespace_selector: &str,
        resync_period: Duration,
    ) -> Result<Self> {
        let resource_requirements = parse_requirements(resource_selector)?;
        let namespace_requirements = parse_requirements(namespace_selector)?;
        Ok(Self::with_resync_period(
            transport,
            resource_requirements,
            namespace_requirements,
            resync_period,
        ))
    }

    pub fn transport(&self) -> &kube::Client {
        &self.transport
    }

    pub fn group(&self, kind: GroupKind) -> &ResourceGroup {
        match kind {
            GroupKind::Namespace => &self.namespace_group,
            GroupKind::Resource => &self.resource_group,
        }
    }

    fn group_mut(&mut self, kind: GroupKind) -> &mut ResourceGroup {
        match kind {
            GroupKind::Namespace => &mut self.namespace_group,
            GroupKind::Resource => &mut self.resource_group,
        }
    }

    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    /// Follow state changes, e.g. to report startup progress
    pub fn subscribe(&self) -> watch::Receiver<ClientState> {
        self.state.subscribe()
    }

    fn ensure_not_started(&self) -> Result<()> {
        if self.state() == ClientState::Constructed {
            Ok(())
        } else {
            Err(Error::AlreadyStarted)
        }
    }

    /// Register a custom cache source in one of the groups
    pub fn register(&mut self, kind: GroupKind, source: Box<dyn CacheSource>) -> Result<()> {
        self.ensure_not_started()?;
        self.group_mut(kind).register(source);
        Ok(())
    }

    /// Cache all namespaces matching the namespace group's requirements
    pub fn watch_namespaces(&mut self) -> Result<Store<Namespace>> {
        self.ensure_not_started()?;
        let api: Api<Namespace> = Api::all(self.transport.clone());
        Ok(self.namespace_group.watch(api, ApiFilters::default()))
    }

    /// Cache a resource type across all namespaces in the resource group
    ///
    /// `filters` are the caller's own selectors; the resource group's mandatory
    /// requirements are added to every list and watch on top of them.
    pub fn watch_resource<K>(&mut self, filters: ApiFilters) -> Result<Store<K>>
    where
        K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
        K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
    {
        self.ensure_not_started()?;
        let api: Api<K> = Api::all(self.transport.clone());
        Ok(self.resource_group.watch(api, filters))
    }

    /// Populate both groups and block until both are synchronized
    ///
    /// The namespace group is synchronized first; the resource group is only
    /// started once it succeeded. Returns [`Error::CacheSync`] naming a type
    /// whose first snapshot failed, or [`Error::Cancelled`] if `cancel` fired
    /// before readiness. Background population keeps running until `cancel`
    /// fires. May only be called once.
    pub async fn start(&mut self, cancel: CancellationToken) -> Result<()> {
        self.ensure_not_started()?;

        for kind in [GroupKind::Namespace, GroupKind::Resource] {
            self.state.send_replace(ClientState::Starting(kind));
            info!(
                group = %kind,
                types = ?self.group(kind).type_names(),
                "Starting cache group"
            );

            if let Err(e) = self.group_mut(kind).synchronize(&cancel).await {
                self.state.send_replace(ClientState::Failed);
                if e.is_cancelled() {
                    info!(group = %kind, "Cache synchronization cancelled");
                } else {
                    error!(group = %kind, error = %e, "Cache synchronization failed");
                }
                return Err(e);
            }
        }

        self.state.send_replace(ClientState::Ready);
        info!("All caches synced");
        Ok(())
    }

    /// Wait for every background population task to stop
    ///
    /// Tasks stop when the token passed to [`Client::start`] is cancelled.
    pub async fn wait_stopped(&mut self) {
        self.namespace_group.join().await;
        self.resource_group.join().await;
    }
}

/// Connect to the cluster
///
/// With a context name the kubeconfig entry is used; otherwise the configuration
/// is inferred (in-cluster service account first, then the current kubeconfig context).
pub async fn connect(context: Option<&str>) -> anyhow::Result<kube::Client> {
    let mut config = match context {
        Some(context) => {
            let kubeconfig = Kubeconfig::read().context("Failed to read kubeconfig")?;
            if !kubeconfig.contexts.iter().any(|c| c.name == context) {
                return Err(anyhow::anyhow!(
                    "Context '{}' not found in kubeconfig",
                    context
                ));
            }
            Config::from_custom_kubeconfig(
                kubeconfig,
                &KubeConfigOptions {
                    context: Some(context.to_string()),
                    ..Default::default()
                },
            )
            .await
            .with_context(|| format!("Failed to load kubeconfig for context '{}'", context))?
        }
        None => Config::infer()
            .await
            .context("Failed to infer Kubernetes configuration")?,
    };

    config.connect_timeout = Some(CONNECT_TIMEOUT);

    debug!(cluster_url = %config.cluster_url, "Connecting to cluster");
    kube::Client::try_from(config).context("Failed to create Kubernetes client")
}
