//! One interpreter identity's trio of worker processes.
//!
//! A bundle groups the three role handles that share launch parameters,
//! config, workspace view, and open documents. Roles stay independent
//! processes so a busy lint run never blocks completion; the bundle only
//! carries the state they have in common.

use std::sync::Arc;

use arc_swap::ArcSwap;
use serde_json::Value;

use super::handle::{ReplayState, WorkerProcessHandle};
use super::{Invocation, LaunchParams, WorkerRole};
use crate::config::{ConfigSnapshot, DocumentStore, WorkspaceSnapshot};
use crate::error::WorkerResult;
use crate::protocol::{
    did_change_configuration_params, did_change_workspace_folders_params, methods,
};
use crate::resolver::InterpreterIdentity;
use crate::rpc::{NotificationSink, PendingRequest, RpcChannel};

/// Worker processes for one interpreter identity, one per role, started
/// lazily and restarted independently.
pub struct WorkerBundle {
    identity: InterpreterIdentity,
    /// Updated when the resolver chain re-resolves the identity to different
    /// launch params; the drift check picks the change up on next use.
    launch: std::sync::Mutex<LaunchParams>,
    config: ArcSwap<ConfigSnapshot>,
    workspace: ArcSwap<WorkspaceSnapshot>,
    documents: Arc<DocumentStore>,
    handles: [WorkerProcessHandle; 3],
}

impl WorkerBundle {
    pub(crate) fn new(
        identity: InterpreterIdentity,
        launch: LaunchParams,
        config: Arc<ConfigSnapshot>,
        workspace: Arc<WorkspaceSnapshot>,
        documents: Arc<DocumentStore>,
        notifications: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            identity,
            launch: std::sync::Mutex::new(launch),
            config: ArcSwap::new(config),
            workspace: ArcSwap::new(workspace),
            documents,
            handles: [
                WorkerProcessHandle::new(WorkerRole::Regular, Arc::clone(&notifications)),
                WorkerProcessHandle::new(WorkerRole::Lint, Arc::clone(&notifications)),
                WorkerProcessHandle::new(WorkerRole::Others, notifications),
            ],
        }
    }

    pub fn identity(&self) -> &InterpreterIdentity {
        &self.identity
    }

    fn handle(&self, role: WorkerRole) -> &WorkerProcessHandle {
        &self.handles[role.index()]
    }

    fn invocation(&self, role: WorkerRole) -> Invocation {
        let launch = self.launch.lock().unwrap_or_else(|e| e.into_inner());
        launch.invocation(role, &self.config.load().launch)
    }

    fn replay_state(&self) -> ReplayState {
        let config = self.config.load();
        let workspace = self.workspace.load();
        ReplayState {
            settings: config.settings.clone(),
            root_uri: workspace.root_uri.clone(),
            folders: workspace.folders.clone(),
            open_documents: self.documents.snapshot(),
        }
    }

    /// Live channel for one role, spawning or respawning as needed.
    pub async fn ensure_started(&self, role: WorkerRole) -> WorkerResult<Arc<RpcChannel>> {
        self.handle(role)
            .ensure_started(&self.invocation(role), &self.replay_state())
            .await
    }

    /// Notification to one role, spawning the worker if needed.
    pub async fn notify(&self, role: WorkerRole, method: &str, params: Value) -> WorkerResult<()> {
        self.handle(role)
            .forward(&self.invocation(role), &self.replay_state(), method, params)
            .await
    }

    /// Notification to every role that is already running; spawns nothing.
    pub async fn notify_if_started(&self, method: &str, params: Value) {
        self.notify_roles_if_started(&WorkerRole::ALL, method, params)
            .await;
    }

    /// Same, restricted to a subset of roles.
    pub async fn notify_roles_if_started(
        &self,
        roles: &[WorkerRole],
        method: &str,
        params: Value,
    ) {
        for &role in roles {
            self.handle(role)
                .notify_if_started(method, params.clone())
                .await;
        }
    }

    /// Issue a request to one role without waiting for the response.
    pub async fn start_request(
        &self,
        role: WorkerRole,
        method: &str,
        params: Value,
    ) -> WorkerResult<(Arc<RpcChannel>, PendingRequest)> {
        self.handle(role)
            .forward_async(&self.invocation(role), &self.replay_state(), method, params)
            .await
    }

    /// Adopt launch params from a fresh resolver answer. Takes effect via
    /// the drift check the next time each role is used.
    pub(crate) fn set_interpreter_info(&self, launch: LaunchParams) {
        let mut current = self.launch.lock().unwrap_or_else(|e| e.into_inner());
        if *current != launch {
            log::info!(
                target: "karakuri::worker",
                "interpreter {} launch params updated",
                self.identity
            );
            *current = launch;
        }
    }

    /// Store a new config snapshot and broadcast it to running workers.
    /// Workers not yet started receive it via spawn-time replay instead.
    pub async fn set_config(&self, config: Arc<ConfigSnapshot>) {
        let params = did_change_configuration_params(&config.settings);
        self.config.store(config);
        self.notify_if_started(methods::DID_CHANGE_CONFIGURATION, params)
            .await;
    }

    /// Store a new workspace snapshot and broadcast it to running workers.
    pub async fn set_workspace(&self, workspace: Arc<WorkspaceSnapshot>) {
        let params = did_change_workspace_folders_params(&workspace.folders);
        self.workspace.store(workspace);
        self.notify_if_started(methods::DID_CHANGE_WORKSPACE_FOLDERS, params)
            .await;
    }

    pub async fn request_cancel(&self, role: WorkerRole, id: i64) {
        self.handle(role).request_cancel(id).await;
    }

    pub async fn is_started(&self, role: WorkerRole) -> bool {
        self.handle(role).channel_if_started().await.is_some()
    }

    pub async fn process_id(&self, role: WorkerRole) -> Option<u32> {
        self.handle(role).process_id().await
    }

    pub async fn shutdown(&self) {
        for role in WorkerRole::ALL {
            self.handle(role).shutdown().await;
        }
    }
}
