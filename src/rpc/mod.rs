//! Asynchronous JSON-RPC plumbing between the orchestrator and one worker.
//!
//! One [`RpcChannel`] owns one duplex byte stream to a worker process. Writes
//! are serialized behind a single writer lock; a dedicated reader task
//! dispatches incoming frames to the matching pending request, or to the
//! notification sink when the frame carries no id.

mod channel;
mod framing;
mod matcher;

pub use channel::{PendingRequest, RpcChannel};
pub(crate) use matcher::MessageMatcher;

use serde_json::Value;

/// Receiver for notifications a worker pushes on its own initiative
/// (e.g. `textDocument/publishDiagnostics` from background analysis).
pub trait NotificationSink: Send + Sync {
    fn on_notification(&self, method: &str, params: Value);
}

/// Default sink: log at debug level and drop.
pub struct LogNotifications;

impl NotificationSink for LogNotifications {
    fn on_notification(&self, method: &str, _params: Value) {
        log::debug!(
            target: "karakuri::rpc",
            "unhandled worker notification: {}",
            method
        );
    }
}
