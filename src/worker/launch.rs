//! Worker launch parameters and command-line synthesis.
//!
//! Drift detection compares the full effective invocation (program, argument
//! vector, environment), so any change that would alter worker behavior
//! forces a respawn on next use.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::WorkerRole;

/// How to launch workers for one interpreter identity: the interpreter
/// executable, identity-specific arguments, and environment variables.
///
/// Produced by the resolver chain; compared by value for drift detection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchParams {
    pub executable: PathBuf,
    pub args: Vec<String>,
    /// BTreeMap so equality is order-independent.
    pub env: BTreeMap<String, String>,
}

impl LaunchParams {
    pub fn new(executable: PathBuf) -> Self {
        Self {
            executable,
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Combine identity launch params with config-level options into the
    /// effective command line for one role.
    pub(crate) fn invocation(&self, role: WorkerRole, options: &WorkerLaunchOptions) -> Invocation {
        let mut args = self.args.clone();
        args.extend(options.role_args(role));
        Invocation {
            program: self.executable.clone(),
            args,
            env: self.env.clone(),
        }
    }
}

/// Config-level worker flags, shared by every identity.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerLaunchOptions {
    /// 0 = quiet, 1 = `-v`, 2+ = `-vv`.
    pub verbosity: u8,
    /// Base log file; the role suffix is inserted before the extension so
    /// the three processes never interleave writes into one file.
    pub log_file: Option<PathBuf>,
    pub pre_generate_libraries: bool,
    pub index_workspace: bool,
    pub collect_tests: bool,
    /// Endpoint of the shared filesystem observer, letting workers subscribe
    /// to file-change events without running a native watcher each.
    pub fs_observer_endpoint: Option<String>,
}

impl WorkerLaunchOptions {
    fn role_args(&self, role: WorkerRole) -> Vec<String> {
        let mut args = Vec::new();
        match self.verbosity {
            0 => {}
            1 => args.push("-v".to_string()),
            _ => args.push("-vv".to_string()),
        }
        if let Some(log_file) = &self.log_file {
            args.push("--log-file".to_string());
            args.push(role_log_file(log_file, role).to_string_lossy().into_owned());
        }
        if self.pre_generate_libraries {
            args.push("--pre-generate-libraries".to_string());
        }
        if self.index_workspace {
            args.push("--index-workspace".to_string());
        }
        if self.collect_tests {
            args.push("--collect-tests".to_string());
        }
        if let Some(endpoint) = &self.fs_observer_endpoint {
            args.push("--fs-observer".to_string());
            args.push(endpoint.clone());
        }
        args
    }
}

/// Insert the role suffix before the file extension:
/// `worker.log` -> `worker.lint.log`.
fn role_log_file(base: &Path, role: WorkerRole) -> PathBuf {
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "worker".to_string());
    let name = match base.extension() {
        Some(ext) => format!("{}.{}.{}", stem, role.suffix(), ext.to_string_lossy()),
        None => format!("{}.{}", stem, role.suffix()),
    };
    base.with_file_name(name)
}

/// The fully resolved command line and environment a worker was (or would
/// be) spawned with. Equality is the drift check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Invocation {
    pub(crate) program: PathBuf,
    pub(crate) args: Vec<String>,
    pub(crate) env: BTreeMap<String, String>,
}
