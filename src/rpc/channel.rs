//! Duplex JSON-RPC channel to one worker process.
//!
//! Request flow:
//! 1. Register the request id with the [`MessageMatcher`] to get a oneshot
//!    receiver.
//! 2. Lock the writer, send the frame, release the lock.
//! 3. Await the receiver with a timeout and a cancellation token; no lock is
//!    held while waiting, so callers never block each other.
//!
//! The reader task owns the worker's stdout. On end-of-stream or a framing
//! error it abandons every pending request, which their waiters observe as
//! `SubprocessDied`.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::BufReader;
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{MessageMatcher, NotificationSink, framing};
use crate::error::{WorkerError, WorkerResult, result_from_response};
use crate::protocol::{cancel_request_params, methods};

const LOG_TARGET: &str = "karakuri::rpc";

/// An in-flight request: its id plus the slot its response will arrive in.
pub struct PendingRequest {
    id: i64,
    rx: oneshot::Receiver<Value>,
}

impl PendingRequest {
    pub fn id(&self) -> i64 {
        self.id
    }
}

/// Handle to the background reader task. Cancelling the token stops the
/// loop; the token is also cancelled when the channel is closed.
struct ReaderTaskHandle {
    _join: JoinHandle<()>,
    cancel: CancellationToken,
}

/// One duplex byte stream to a worker process.
pub struct RpcChannel {
    /// Writer lock serializes frames; submission order is preserved because
    /// writes complete under the lock.
    writer: tokio::sync::Mutex<ChildStdin>,
    matcher: Arc<MessageMatcher>,
    /// Monotonically increasing, unique to this channel.
    next_request_id: AtomicI64,
    reader: ReaderTaskHandle,
}

impl std::fmt::Debug for RpcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcChannel").finish_non_exhaustive()
    }
}

impl RpcChannel {
    /// Wrap a worker's stdio and spawn the reader task.
    pub(crate) fn new(
        stdin: ChildStdin,
        stdout: ChildStdout,
        notifications: Arc<dyn NotificationSink>,
    ) -> Arc<Self> {
        let matcher = Arc::new(MessageMatcher::new());
        let cancel = CancellationToken::new();

        let join = tokio::spawn(reader_loop(
            BufReader::new(stdout),
            Arc::clone(&matcher),
            notifications,
            cancel.clone(),
        ));

        Arc::new(Self {
            writer: tokio::sync::Mutex::new(stdin),
            matcher,
            next_request_id: AtomicI64::new(1),
            reader: ReaderTaskHandle {
                _join: join,
                cancel,
            },
        })
    }

    /// Assign an id, write a framed request, and return the pending slot.
    ///
    /// Registration happens before the bytes hit the pipe so the response
    /// cannot race past the matcher.
    pub async fn send_request(&self, method: &str, params: Value) -> WorkerResult<PendingRequest> {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let Some(rx) = self.matcher.register(id) else {
            // Ids are monotonic, so a duplicate means the channel is broken.
            return Err(WorkerError::SubprocessDied);
        };

        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        if let Err(e) = self.write(&request).await {
            self.matcher.remove(id);
            log::debug!(target: LOG_TARGET, "write failed for {} (id={}): {}", method, id, e);
            return Err(WorkerError::SubprocessDied);
        }

        log::trace!(target: LOG_TARGET, "sent request id={} method={}", id, method);
        Ok(PendingRequest { id, rx })
    }

    /// Write a framed message with no id. Never answered.
    pub async fn send_notification(&self, method: &str, params: Value) -> WorkerResult<()> {
        let notification = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });

        self.write(&notification).await.map_err(|e| {
            log::debug!(target: LOG_TARGET, "notification write failed for {}: {}", method, e);
            WorkerError::SubprocessDied
        })?;

        log::trace!(target: LOG_TARGET, "sent notification method={}", method);
        Ok(())
    }

    /// Wait for the response to `pending`, up to `timeout`, abandoning the
    /// wait when `cancel` fires.
    ///
    /// Cancellation sends a best-effort `$/cancelRequest` and releases this
    /// caller immediately; the worker may keep computing. A timeout fails
    /// only this call; the process stays alive.
    pub async fn wait(
        &self,
        mut pending: PendingRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> WorkerResult<Value> {
        tokio::select! {
            response = &mut pending.rx => match response {
                Ok(value) => result_from_response(value),
                // Matcher dropped the sender: stream closed underneath us.
                Err(_) => Err(WorkerError::SubprocessDied),
            },
            _ = tokio::time::sleep(timeout) => {
                self.matcher.remove(pending.id);
                Err(WorkerError::RequestTimeout { timeout })
            }
            _ = cancel.cancelled() => {
                self.request_cancel(pending.id).await;
                self.matcher.remove(pending.id);
                Err(WorkerError::RequestCancelled)
            }
        }
    }

    /// `send_request` + `wait` in one call.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> WorkerResult<Value> {
        let pending = self.send_request(method, params).await?;
        self.wait(pending, timeout, cancel).await
    }

    /// Best-effort `$/cancelRequest` for an id this channel issued.
    pub async fn request_cancel(&self, id: i64) {
        if let Err(e) = self
            .send_notification(methods::CANCEL_REQUEST, cancel_request_params(id))
            .await
        {
            log::trace!(target: LOG_TARGET, "cancel notification for id={} not sent: {}", id, e);
        }
    }

    /// Stop the reader task and abandon every pending request.
    pub(crate) fn close(&self) {
        self.reader.cancel.cancel();
        self.matcher.fail_all();
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.matcher.pending_count()
    }

    async fn write(&self, message: &Value) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        framing::write_message(&mut *writer, message).await
    }

    /// Write an arbitrary message, bypassing envelope construction. Tests
    /// use this with echo workers to inject response-shaped frames.
    #[cfg(test)]
    pub(crate) async fn write_raw(&self, message: &Value) -> std::io::Result<()> {
        self.write(message).await
    }
}

impl Drop for RpcChannel {
    fn drop(&mut self) {
        self.reader.cancel.cancel();
    }
}

/// Reader loop: frames off the worker's stdout, dispatched by shape.
///
/// - id + method: a request from the worker. The core serves none, so it is
///   logged and dropped.
/// - method only: notification, handed to the sink.
/// - id only: response, routed to its pending request.
async fn reader_loop(
    mut reader: BufReader<ChildStdout>,
    matcher: Arc<MessageMatcher>,
    notifications: Arc<dyn NotificationSink>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                log::debug!(target: LOG_TARGET, "reader task cancelled");
                break;
            }
            result = framing::read_message(&mut reader) => {
                match result {
                    Ok(Some(message)) => dispatch(message, &matcher, &notifications),
                    Ok(None) => {
                        log::debug!(target: LOG_TARGET, "worker stream closed, failing pending requests");
                        matcher.fail_all();
                        break;
                    }
                    Err(e) => {
                        log::warn!(target: LOG_TARGET, "reader error: {}, failing pending requests", e);
                        matcher.fail_all();
                        break;
                    }
                }
            }
        }
    }
}

fn dispatch(message: Value, matcher: &MessageMatcher, notifications: &Arc<dyn NotificationSink>) {
    let has_id = message.get("id").is_some();
    match message.get("method").and_then(Value::as_str) {
        Some(method) if has_id => {
            log::debug!(target: LOG_TARGET, "unsupported worker request {}, dropping", method);
        }
        Some(method) => {
            let method = method.to_string();
            let params = message
                .get("params")
                .cloned()
                .unwrap_or(Value::Null);
            notifications.on_notification(&method, params);
        }
        None if has_id => {
            if !matcher.route(message) {
                log::debug!(target: LOG_TARGET, "response for unknown request id, dropping");
            }
        }
        None => {
            log::debug!(target: LOG_TARGET, "frame with neither id nor method, dropping");
        }
    }
}
