//! Worker-process lifecycle: one subprocess per (interpreter identity, role).

mod bundle;
mod handle;
mod launch;

pub use bundle::WorkerBundle;
pub use handle::WorkerProcessHandle;
pub(crate) use handle::ReplayState;
pub use launch::{LaunchParams, WorkerLaunchOptions};
pub(crate) use launch::Invocation;

/// The three independent worker concerns, each its own process.
///
/// Regular answers fast interactive requests (completion, hover); Lint runs
/// the slow full-document analysis; Others absorbs medium-cost misc work so
/// it cannot starve the interactive process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkerRole {
    Regular,
    Lint,
    Others,
}

impl WorkerRole {
    pub const ALL: [WorkerRole; 3] = [WorkerRole::Regular, WorkerRole::Lint, WorkerRole::Others];

    pub(crate) fn index(self) -> usize {
        match self {
            WorkerRole::Regular => 0,
            WorkerRole::Lint => 1,
            WorkerRole::Others => 2,
        }
    }

    /// Suffix appended to per-role log file names.
    pub fn suffix(self) -> &'static str {
        match self {
            WorkerRole::Regular => "regular",
            WorkerRole::Lint => "lint",
            WorkerRole::Others => "others",
        }
    }
}

impl std::fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.suffix())
    }
}
