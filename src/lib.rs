//! Worker-process orchestration core for an IDE language server.
//!
//! The orchestrator fronts a set of external worker processes, one trio per
//! interpreter environment: a `regular` worker for fast interactive requests,
//! a `lint` worker for slow full-document analysis, and an `others` worker
//! for the medium-cost rest. It owns process lifecycle (lazy spawn, drift
//! detection, liveness, respawn with catch-up replay), the JSON-RPC plumbing
//! to each process, and debounced single-flight lint scheduling.

pub mod config;
pub mod error;
pub mod lint;
pub mod logging;
pub mod progress;
pub mod protocol;
pub mod registry;
pub mod resolver;
pub mod rpc;
pub mod worker;

pub use config::{
    ConfigSnapshot, DocumentStore, OpenDocument, WorkspaceFolder, WorkspaceSnapshot,
};
pub use error::{WorkerError, WorkerResult};
pub use lint::{DiagnosticsSink, LintScheduler, debounce_for};
pub use progress::{ProgressReporter, ProgressSource};
pub use protocol::RequestKind;
pub use registry::{OrchestratorRegistry, OrchestratorRegistryBuilder};
pub use resolver::{EnvironmentSpec, InterpreterIdentity, InterpreterResolver};
pub use rpc::{NotificationSink, RpcChannel};
pub use worker::{LaunchParams, WorkerBundle, WorkerLaunchOptions, WorkerRole};
