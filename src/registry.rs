//! Central registry mapping documents to worker bundles.
//!
//! The registry resolves each document uri to an interpreter identity
//! through an ordered resolver chain, creates the identity's
//! [`WorkerBundle`] lazily on first use, and fans config and workspace
//! changes out to every bundle that already exists. Identities nobody asks
//! about never spawn a process.
//!
//! All bundle-map mutation happens behind one async mutex, so creation is
//! race-free without a dedicated coordination thread.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::{ConfigSnapshot, DocumentStore, WorkspaceSnapshot};
use crate::error::{WorkerError, WorkerResult};
use crate::protocol::RequestKind;
use crate::resolver::{InterpreterIdentity, InterpreterResolver};
use crate::rpc::{LogNotifications, NotificationSink, RpcChannel};
use crate::worker::{LaunchParams, WorkerBundle, WorkerRole};

const LOG_TARGET: &str = "karakuri::registry";

/// Builder for [`OrchestratorRegistry`]. Only the default launch params are
/// mandatory; resolvers, snapshots, and the notification sink are optional.
pub struct OrchestratorRegistryBuilder {
    default_launch: LaunchParams,
    resolvers: Vec<Box<dyn InterpreterResolver>>,
    notifications: Arc<dyn NotificationSink>,
    config: ConfigSnapshot,
    workspace: WorkspaceSnapshot,
}

impl OrchestratorRegistryBuilder {
    pub fn new(default_launch: LaunchParams) -> Self {
        Self {
            default_launch,
            resolvers: Vec::new(),
            notifications: Arc::new(LogNotifications),
            config: ConfigSnapshot::default(),
            workspace: WorkspaceSnapshot::default(),
        }
    }

    /// Append a resolver; resolution order is registration order.
    pub fn resolver(mut self, resolver: impl InterpreterResolver + 'static) -> Self {
        self.resolvers.push(Box::new(resolver));
        self
    }

    pub fn notifications(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.notifications = sink;
        self
    }

    pub fn config(mut self, config: ConfigSnapshot) -> Self {
        self.config = config;
        self
    }

    pub fn workspace(mut self, workspace: WorkspaceSnapshot) -> Self {
        self.workspace = workspace;
        self
    }

    pub fn build(self) -> Arc<OrchestratorRegistry> {
        Arc::new(OrchestratorRegistry {
            bundles: tokio::sync::Mutex::new(HashMap::new()),
            config: ArcSwap::new(Arc::new(self.config)),
            workspace: ArcSwap::new(Arc::new(self.workspace)),
            documents: Arc::new(DocumentStore::new()),
            resolvers: self.resolvers,
            default_launch: self.default_launch,
            notifications: self.notifications,
        })
    }
}

/// Owns every worker bundle and the state they are seeded from.
pub struct OrchestratorRegistry {
    bundles: tokio::sync::Mutex<HashMap<InterpreterIdentity, Arc<WorkerBundle>>>,
    config: ArcSwap<ConfigSnapshot>,
    workspace: ArcSwap<WorkspaceSnapshot>,
    documents: Arc<DocumentStore>,
    resolvers: Vec<Box<dyn InterpreterResolver>>,
    default_launch: LaunchParams,
    notifications: Arc<dyn NotificationSink>,
}

impl OrchestratorRegistry {
    pub fn builder(default_launch: LaunchParams) -> OrchestratorRegistryBuilder {
        OrchestratorRegistryBuilder::new(default_launch)
    }

    /// Open-document table mirrored from the editor; spawn-time replay reads
    /// it.
    pub fn documents(&self) -> &DocumentStore {
        &self.documents
    }

    /// First resolver to claim the uri wins; unclaimed documents share the
    /// default identity.
    fn resolve(&self, uri: &Url) -> (InterpreterIdentity, LaunchParams) {
        for resolver in &self.resolvers {
            if let Some(spec) = resolver.resolve(uri) {
                return (spec.identity, spec.launch);
            }
        }
        (
            InterpreterIdentity::default_identity(),
            self.default_launch.clone(),
        )
    }

    /// Bundle for the document's identity, created lazily. Re-resolution on
    /// every call keeps launch params current, so an environment switch is
    /// picked up as drift on next use.
    pub async fn bundle_for(&self, uri: &Url) -> Arc<WorkerBundle> {
        let (identity, launch) = self.resolve(uri);
        let mut bundles = self.bundles.lock().await;
        if let Some(bundle) = bundles.get(&identity) {
            bundle.set_interpreter_info(launch);
            return Arc::clone(bundle);
        }

        log::info!(target: LOG_TARGET, "creating worker bundle for {}", identity);
        let bundle = Arc::new(WorkerBundle::new(
            identity.clone(),
            launch,
            self.config.load_full(),
            self.workspace.load_full(),
            Arc::clone(&self.documents),
            Arc::clone(&self.notifications),
        ));
        bundles.insert(identity, Arc::clone(&bundle));
        bundle
    }

    /// Live channel for the document's worker of the given role, spawning it
    /// if needed.
    pub async fn get_client(&self, role: WorkerRole, uri: &Url) -> WorkerResult<Arc<RpcChannel>> {
        self.bundle_for(uri).await.ensure_started(role).await
    }

    /// Full request round-trip on the role the kind maps to.
    pub async fn request(
        &self,
        kind: RequestKind,
        uri: &Url,
        params: Value,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> WorkerResult<Value> {
        let bundle = self.bundle_for(uri).await;
        let (channel, pending) = bundle
            .start_request(kind.role(), kind.method(), params)
            .await?;
        channel.wait(pending, timeout, cancel).await
    }

    /// Like [`request`](Self::request), but interactive kinds degrade
    /// transport failures to `Ok(Null)` so the editor sees an empty answer
    /// instead of an error. Worker-reported errors still pass through.
    pub async fn request_or_null(
        &self,
        kind: RequestKind,
        uri: &Url,
        params: Value,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> WorkerResult<Value> {
        match self.request(kind, uri, params, timeout, cancel).await {
            Err(e)
                if kind.degrades_to_null()
                    && !matches!(e, WorkerError::ErrorResponse { .. }) =>
            {
                if !e.is_cancellation() {
                    log::debug!(
                        target: LOG_TARGET,
                        "{} degraded to null: {}",
                        kind.method(),
                        e
                    );
                }
                Ok(Value::Null)
            }
            other => other,
        }
    }

    /// Store a new config snapshot, broadcast to every existing bundle.
    /// Bundles created afterwards are seeded with the new snapshot.
    pub async fn set_config(&self, config: ConfigSnapshot) {
        let config = Arc::new(config);
        self.config.store(Arc::clone(&config));
        for bundle in self.existing_bundles().await {
            bundle.set_config(Arc::clone(&config)).await;
        }
    }

    /// Store a new workspace snapshot, broadcast to every existing bundle.
    pub async fn set_workspace(&self, workspace: WorkspaceSnapshot) {
        let workspace = Arc::new(workspace);
        self.workspace.store(Arc::clone(&workspace));
        for bundle in self.existing_bundles().await {
            bundle.set_workspace(Arc::clone(&workspace)).await;
        }
    }

    /// Fan a notification out to the given roles of every bundle that is
    /// already running. Spawns nothing.
    pub async fn forward(&self, roles: &[WorkerRole], method: &str, params: Value) {
        for bundle in self.existing_bundles().await {
            bundle
                .notify_roles_if_started(roles, method, params.clone())
                .await;
        }
    }

    pub async fn find_bundle(&self, identity: &InterpreterIdentity) -> Option<Arc<WorkerBundle>> {
        self.bundles.lock().await.get(identity).cloned()
    }

    pub async fn bundle_count(&self) -> usize {
        self.bundles.lock().await.len()
    }

    async fn existing_bundles(&self) -> Vec<Arc<WorkerBundle>> {
        self.bundles.lock().await.values().cloned().collect()
    }

    /// Shut every bundle down and forget it. The registry stays usable;
    /// later calls start from scratch.
    pub async fn shutdown(&self) {
        let bundles: Vec<_> = self.bundles.lock().await.drain().collect();
        for (identity, bundle) in bundles {
            log::debug!(target: LOG_TARGET, "shutting down bundle {}", identity);
            bundle.shutdown().await;
        }
    }
}
