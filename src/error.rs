//! Error handling types for the orchestrator core.
//!
//! Transport failures are recovered at the `WorkerProcessHandle` boundary and
//! never escape as panics; logical errors returned by a worker are passed
//! through untouched as [`WorkerError::ErrorResponse`].

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

/// Failure kinds for worker-process communication.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Spawn or initialize handshake failed. Logged once; the handle is left
    /// unstarted so the very next call retries. No automatic retry loop.
    #[error("failed to launch worker: {message}")]
    LaunchFailure { message: String },

    /// The worker process exited or its stream closed. Every request pending
    /// on that channel fails with this kind and the handle is retired for
    /// lazy respawn.
    #[error("worker process died")]
    SubprocessDied,

    /// A single call exceeded its bound. Surfaced to that caller only; the
    /// process stays alive.
    #[error("request timed out after {timeout:?}")]
    RequestTimeout { timeout: Duration },

    /// Explicit cancel, or superseded by a newer lint. Not logged as an
    /// error.
    #[error("request cancelled")]
    RequestCancelled,

    /// The worker answered with a JSON-RPC error payload. Code, message and
    /// data are forwarded untouched.
    #[error("worker returned error {code}: {message}")]
    ErrorResponse {
        code: i64,
        message: String,
        data: Option<Value>,
    },
}

impl WorkerError {
    /// Whether this failure is part of normal operation rather than
    /// something worth a log line.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, WorkerError::RequestCancelled)
    }
}

/// Result type for worker-process operations.
pub type WorkerResult<T> = Result<T, WorkerError>;

/// Split a raw JSON-RPC response into `Ok(result)` or a structured error.
///
/// A response carrying an `error` member becomes [`WorkerError::ErrorResponse`]
/// with the worker's code/message/data forwarded untouched. A response with
/// neither `result` nor `error` yields `Value::Null`.
pub(crate) fn result_from_response(mut response: Value) -> WorkerResult<Value> {
    if let Some(error) = response.get_mut("error") {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(-32603);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown worker error")
            .to_string();
        let data = error.get_mut("data").map(Value::take);
        return Err(WorkerError::ErrorResponse {
            code,
            message,
            data,
        });
    }
    Ok(response
        .get_mut("result")
        .map(Value::take)
        .unwrap_or(Value::Null))
}
