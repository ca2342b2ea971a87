//! Per-request correlation between outgoing ids and incoming responses.
//!
//! Before a request is written, the caller registers its id here and gets a
//! oneshot receiver; the channel's reader task routes the matching response
//! to that receiver. Exactly one response is ever delivered per id.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::oneshot;

/// Pending-request table for one channel.
///
/// All state sits behind a single `std::sync::Mutex`; every operation is a
/// short map access, so the lock is never held across an await point.
pub(crate) struct MessageMatcher {
    pending: std::sync::Mutex<HashMap<i64, oneshot::Sender<Value>>>,
}

impl MessageMatcher {
    pub(crate) fn new() -> Self {
        Self {
            pending: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Register a pending request. Must happen before the request bytes are
    /// written, or the response could race past the table.
    ///
    /// Returns `None` on a duplicate id.
    pub(crate) fn register(&self, id: i64) -> Option<oneshot::Receiver<Value>> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if pending.contains_key(&id) {
            return None;
        }
        pending.insert(id, tx);
        Some(rx)
    }

    /// Deliver a response to its waiter. Returns `false` when no request
    /// with that id is pending (late or unknown response, dropped).
    pub(crate) fn route(&self, response: Value) -> bool {
        let Some(id) = response.get("id").and_then(Value::as_i64) else {
            return false;
        };
        let tx = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.remove(&id)
        };
        match tx {
            Some(sender) => sender.send(response).is_ok(),
            None => false,
        }
    }

    /// Drop a pending entry without delivering anything. Used for timeout
    /// and cancellation cleanup.
    pub(crate) fn remove(&self, id: i64) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.remove(&id).is_some()
    }

    /// Abandon every pending request. Each waiter observes a closed channel,
    /// which the caller maps to `SubprocessDied`.
    pub(crate) fn fail_all(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.clear();
    }

    pub(crate) fn pending_count(&self) -> usize {
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.len()
    }
}
