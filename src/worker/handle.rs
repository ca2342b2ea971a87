//! Lifecycle of one worker subprocess.
//!
//! A handle owns at most one live process implementing one role for one
//! interpreter identity. The process spawns lazily on first use and is
//! retired whenever its launch parameters drift from the current config,
//! the OS reports it dead, or the orchestrator shuts down. A retired handle
//! respawns lazily on the next call.
//!
//! Spawning performs the initialize handshake and then replays catch-up
//! state (config broadcast plus a didOpen for every document the editor has
//! open); a fresh worker otherwise has no memory of prior editor state.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{Invocation, WorkerRole};
use crate::config::{OpenDocument, WorkspaceFolder};
use crate::error::{WorkerError, WorkerResult};
use crate::protocol::{
    did_change_configuration_params, did_open_params, initialize_params, methods,
};
use crate::rpc::{NotificationSink, PendingRequest, RpcChannel};

const LOG_TARGET: &str = "karakuri::worker";

/// Ceiling for the initialize handshake.
const INIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Ceiling for the graceful shutdown request before the process is killed.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

/// Grace period between SIGTERM and SIGKILL on unix.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Editor state replayed into a freshly spawned worker.
pub(crate) struct ReplayState {
    pub(crate) settings: Value,
    pub(crate) root_uri: Option<Url>,
    pub(crate) folders: Vec<WorkspaceFolder>,
    pub(crate) open_documents: Vec<OpenDocument>,
}

/// A live subprocess: the OS handle, its channel, and the invocation it was
/// spawned with (the drift baseline).
struct RunningWorker {
    child: Child,
    channel: Arc<RpcChannel>,
    invocation: Invocation,
}

/// Owns the full lifecycle of one external worker process.
pub struct WorkerProcessHandle {
    role: WorkerRole,
    notifications: Arc<dyn NotificationSink>,
    state: tokio::sync::Mutex<Option<RunningWorker>>,
}

impl WorkerProcessHandle {
    pub(crate) fn new(role: WorkerRole, notifications: Arc<dyn NotificationSink>) -> Self {
        Self {
            role,
            notifications,
            state: tokio::sync::Mutex::new(None),
        }
    }

    pub fn role(&self) -> WorkerRole {
        self.role
    }

    /// Return the live channel, spawning or respawning first if needed.
    ///
    /// Respawn triggers: no process yet, the configured invocation differs
    /// from the one the process was spawned with, or the OS process is gone.
    /// A handle whose parameters drifted is never reused; it is retired
    /// before any new request goes through it.
    pub(crate) async fn ensure_started(
        &self,
        invocation: &Invocation,
        replay: &ReplayState,
    ) -> WorkerResult<Arc<RpcChannel>> {
        let mut state = self.state.lock().await;

        if let Some(running) = state.as_mut() {
            let drifted = running.invocation != *invocation;
            let alive = process_alive(&mut running.child);
            if !drifted && alive {
                return Ok(Arc::clone(&running.channel));
            }
            if drifted {
                log::info!(
                    target: LOG_TARGET,
                    "{} worker launch parameters drifted, retiring pid {:?}",
                    self.role,
                    running.child.id()
                );
            } else {
                log::warn!(
                    target: LOG_TARGET,
                    "{} worker process died, retiring for respawn",
                    self.role
                );
            }
            if let Some(mut retired) = state.take() {
                retired.channel.close();
                if alive {
                    force_kill(&mut retired.child).await;
                }
            }
        }

        // Launch failures are logged once and leave the handle unstarted;
        // the very next call retries. No retry loop here.
        match self.spawn(invocation, replay).await {
            Ok(running) => {
                let channel = Arc::clone(&running.channel);
                *state = Some(running);
                Ok(channel)
            }
            Err(message) => {
                log::warn!(
                    target: LOG_TARGET,
                    "{} worker launch failed: {}",
                    self.role,
                    message
                );
                Err(WorkerError::LaunchFailure { message })
            }
        }
    }

    /// Fire-and-forget notification, spawning the worker if needed.
    pub(crate) async fn forward(
        &self,
        invocation: &Invocation,
        replay: &ReplayState,
        method: &str,
        params: Value,
    ) -> WorkerResult<()> {
        let channel = self.ensure_started(invocation, replay).await?;
        channel.send_notification(method, params).await
    }

    /// Async request, spawning the worker if needed. The caller waits on the
    /// returned channel/pending pair in its own task.
    pub(crate) async fn forward_async(
        &self,
        invocation: &Invocation,
        replay: &ReplayState,
        method: &str,
        params: Value,
    ) -> WorkerResult<(Arc<RpcChannel>, PendingRequest)> {
        let channel = self.ensure_started(invocation, replay).await?;
        let pending = channel.send_request(method, params).await?;
        Ok((channel, pending))
    }

    /// Notification to an already-running worker; never spawns.
    pub(crate) async fn notify_if_started(&self, method: &str, params: Value) {
        if let Some(channel) = self.channel_if_started().await
            && let Err(e) = channel.send_notification(method, params).await
        {
            log::debug!(
                target: LOG_TARGET,
                "{} broadcast {} not delivered: {}",
                self.role,
                method,
                e
            );
        }
    }

    pub(crate) async fn channel_if_started(&self) -> Option<Arc<RpcChannel>> {
        let state = self.state.lock().await;
        state.as_ref().map(|running| Arc::clone(&running.channel))
    }

    /// Best-effort `$/cancelRequest` for an id issued on this worker.
    pub async fn request_cancel(&self, id: i64) {
        if let Some(channel) = self.channel_if_started().await {
            channel.request_cancel(id).await;
        }
    }

    /// OS-level liveness: the process was spawned and has not exited.
    pub async fn is_alive(&self) -> bool {
        let mut state = self.state.lock().await;
        match state.as_mut() {
            Some(running) => process_alive(&mut running.child),
            None => false,
        }
    }

    pub async fn process_id(&self) -> Option<u32> {
        let state = self.state.lock().await;
        state.as_ref().and_then(|running| running.child.id())
    }

    /// Graceful protocol exit, then terminate: shutdown request (bounded),
    /// exit notification, SIGTERM with a grace period, SIGKILL.
    pub async fn shutdown(&self) {
        let Some(mut running) = self.state.lock().await.take() else {
            return;
        };

        if let Ok(pending) = running
            .channel
            .send_request(methods::SHUTDOWN, Value::Null)
            .await
        {
            let _ = running
                .channel
                .wait(pending, SHUTDOWN_TIMEOUT, &CancellationToken::new())
                .await;
        }
        let _ = running
            .channel
            .send_notification(methods::EXIT, json!({}))
            .await;

        running.channel.close();
        force_kill(&mut running.child).await;
        log::debug!(target: LOG_TARGET, "{} worker shut down", self.role);
    }

    async fn spawn(
        &self,
        invocation: &Invocation,
        replay: &ReplayState,
    ) -> Result<RunningWorker, String> {
        let (mut child, stdin, stdout) = spawn_process(invocation)?;
        let channel = RpcChannel::new(stdin, stdout, Arc::clone(&self.notifications));

        if let Err(message) = handshake_and_replay(&channel, replay).await {
            channel.close();
            let _ = child.start_kill();
            return Err(message);
        }

        log::info!(
            target: LOG_TARGET,
            "{} worker started (pid {:?})",
            self.role,
            child.id()
        );
        Ok(RunningWorker {
            child,
            channel,
            invocation: invocation.clone(),
        })
    }
}

fn spawn_process(invocation: &Invocation) -> Result<(Child, ChildStdin, ChildStdout), String> {
    let mut child = Command::new(&invocation.program)
        .args(&invocation.args)
        .envs(&invocation.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("spawn of {} failed: {}", invocation.program.display(), e))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| "worker stdin unavailable".to_string())?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "worker stdout unavailable".to_string())?;
    Ok((child, stdin, stdout))
}

/// Initialize handshake followed by mandatory catch-up replay.
async fn handshake_and_replay(channel: &RpcChannel, replay: &ReplayState) -> Result<(), String> {
    let pending = channel
        .send_request(
            methods::INITIALIZE,
            initialize_params(replay.root_uri.as_ref(), &replay.folders),
        )
        .await
        .map_err(|e| format!("initialize request not sent: {e}"))?;

    let result = channel
        .wait(pending, INIT_TIMEOUT, &CancellationToken::new())
        .await
        .map_err(|e| format!("initialize handshake failed: {e}"))?;
    if result.is_null() {
        return Err("initialize response missing result".to_string());
    }

    channel
        .send_notification(methods::INITIALIZED, json!({}))
        .await
        .map_err(|e| format!("initialized notification failed: {e}"))?;

    // Catch-up replay: current config, then a didOpen for every document the
    // editor has open.
    channel
        .send_notification(
            methods::DID_CHANGE_CONFIGURATION,
            did_change_configuration_params(&replay.settings),
        )
        .await
        .map_err(|e| format!("config replay failed: {e}"))?;
    for doc in &replay.open_documents {
        channel
            .send_notification(methods::DID_OPEN, did_open_params(doc))
            .await
            .map_err(|e| format!("didOpen replay for {} failed: {e}", doc.uri))?;
    }
    Ok(())
}

fn process_alive(child: &mut Child) -> bool {
    matches!(child.try_wait(), Ok(None))
}

/// Kill with platform-appropriate escalation: SIGTERM, a short grace period,
/// then SIGKILL. Windows has no SIGTERM equivalent, so it terminates
/// directly.
async fn force_kill(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            let deadline = tokio::time::Instant::now() + KILL_GRACE;
            while tokio::time::Instant::now() < deadline {
                if !process_alive(child) {
                    // Reap and return.
                    let _ = child.wait().await;
                    return;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }

    let _ = child.start_kill();
    let _ = child.wait().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::LogNotifications;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    /// Shell worker that answers the initialize request (id 1) with a canned
    /// response, then consumes everything else.
    const RESPONDER: &str = r#"body='{"jsonrpc":"2.0","id":1,"result":{"capabilities":{}}}'; printf 'Content-Length: %d\r\n\r\n%s' "${#body}" "$body"; exec cat >/dev/null"#;

    /// Shell worker that rejects the initialize request.
    const REJECTER: &str = r#"body='{"jsonrpc":"2.0","id":1,"error":{"code":-32002,"message":"not ready"}}'; printf 'Content-Length: %d\r\n\r\n%s' "${#body}" "$body"; exec cat >/dev/null"#;

    fn shell_invocation(script: &str) -> Invocation {
        Invocation {
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), script.to_string()],
            env: BTreeMap::new(),
        }
    }

    fn empty_replay() -> ReplayState {
        ReplayState {
            settings: Value::Null,
            root_uri: None,
            folders: Vec::new(),
            open_documents: Vec::new(),
        }
    }

    fn handle(role: WorkerRole) -> WorkerProcessHandle {
        WorkerProcessHandle::new(role, Arc::new(LogNotifications))
    }

    #[tokio::test]
    async fn ensure_started_spawns_and_completes_handshake() {
        let handle = handle(WorkerRole::Regular);
        let invocation = shell_invocation(RESPONDER);

        let channel = handle
            .ensure_started(&invocation, &empty_replay())
            .await
            .expect("responder should pass handshake");
        assert!(handle.is_alive().await);
        assert_eq!(channel.pending_count(), 0);

        handle.shutdown().await;
        assert!(!handle.is_alive().await);
    }

    #[tokio::test]
    async fn same_invocation_reuses_the_channel() {
        let handle = handle(WorkerRole::Regular);
        let invocation = shell_invocation(RESPONDER);

        let c1 = handle
            .ensure_started(&invocation, &empty_replay())
            .await
            .unwrap();
        let c2 = handle
            .ensure_started(&invocation, &empty_replay())
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&c1, &c2), "unchanged invocation must reuse");

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn drifted_invocation_is_never_reused() {
        let handle = handle(WorkerRole::Lint);
        let invocation = shell_invocation(RESPONDER);

        let c1 = handle
            .ensure_started(&invocation, &empty_replay())
            .await
            .unwrap();
        let pid1 = handle.process_id().await;

        let mut drifted = invocation.clone();
        drifted
            .env
            .insert("CONDA_PREFIX".to_string(), "/opt/envB".to_string());
        let c2 = handle
            .ensure_started(&drifted, &empty_replay())
            .await
            .unwrap();
        let pid2 = handle.process_id().await;

        assert!(!Arc::ptr_eq(&c1, &c2), "drifted worker must be respawned");
        assert_ne!(pid1, pid2);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn dead_process_is_respawned_transparently() {
        let handle = handle(WorkerRole::Regular);
        let invocation = shell_invocation(RESPONDER);

        let c1 = handle
            .ensure_started(&invocation, &empty_replay())
            .await
            .unwrap();
        let pid = handle.process_id().await.expect("pid");

        // Kill out-of-band, then give the OS a moment to report the exit.
        let _ = std::process::Command::new("kill")
            .arg("-9")
            .arg(pid.to_string())
            .status();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!handle.is_alive().await);

        let c2 = handle
            .ensure_started(&invocation, &empty_replay())
            .await
            .expect("respawn should succeed");
        assert!(!Arc::ptr_eq(&c1, &c2));
        assert!(handle.is_alive().await);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn launch_failure_leaves_handle_unstarted_and_retries_next_call() {
        let handle = handle(WorkerRole::Others);
        let invocation = Invocation {
            program: PathBuf::from("nonexistent-worker-binary-xyz"),
            args: Vec::new(),
            env: BTreeMap::new(),
        };

        let err = handle
            .ensure_started(&invocation, &empty_replay())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::LaunchFailure { .. }));
        assert!(!handle.is_alive().await);

        // Next call retries (and fails the same way, without panicking).
        let err = handle
            .ensure_started(&invocation, &empty_replay())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::LaunchFailure { .. }));
    }

    #[tokio::test]
    async fn rejected_handshake_is_a_launch_failure() {
        let handle = handle(WorkerRole::Regular);
        let invocation = shell_invocation(REJECTER);

        let err = handle
            .ensure_started(&invocation, &empty_replay())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::LaunchFailure { .. }));
        assert!(!handle.is_alive().await);
    }

    #[tokio::test]
    async fn replay_sends_config_and_open_documents() {
        // Responder that also copies everything it receives into a file.
        let capture = tempfile::NamedTempFile::new().expect("temp file");
        let capture_path = capture.path().to_string_lossy().into_owned();
        let script = format!(
            r#"body='{{"jsonrpc":"2.0","id":1,"result":{{"capabilities":{{}}}}}}'; printf 'Content-Length: %d\r\n\r\n%s' "${{#body}}" "$body"; exec tee -a {capture_path} >/dev/null"#
        );

        let handle = handle(WorkerRole::Regular);
        let replay = ReplayState {
            settings: json!({ "robot": { "lint": { "enabled": true } } }),
            root_uri: Some(Url::parse("file:///workspace").unwrap()),
            folders: Vec::new(),
            open_documents: vec![OpenDocument {
                uri: Url::parse("file:///workspace/a.robot").unwrap(),
                language_id: "robotframework".to_string(),
                version: 3,
                text: "*** Test Cases ***".to_string(),
            }],
        };

        handle
            .ensure_started(&shell_invocation(&script), &replay)
            .await
            .expect("handshake");

        // The tee is asynchronous; poll until the replay shows up.
        let mut contents = String::new();
        for _ in 0..50 {
            contents = std::fs::read_to_string(capture.path()).unwrap_or_default();
            if contents.contains("textDocument/didOpen") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert!(contents.contains(r#""method":"initialize"#));
        assert!(contents.contains(r#""method":"initialized"#));
        assert!(contents.contains("workspace/didChangeConfiguration"));
        assert!(contents.contains("textDocument/didOpen"));
        assert!(contents.contains("file:///workspace/a.robot"));

        handle.shutdown().await;
    }
}
