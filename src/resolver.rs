//! Interpreter identity resolution.
//!
//! Each document maps to an interpreter identity through an ordered chain of
//! resolver plugins. The first resolver returning a spec wins; documents no
//! resolver claims share a fixed default identity.

use std::fmt;

use url::Url;

use crate::worker::LaunchParams;

/// Identity of the default environment shared by all unmatched documents.
const DEFAULT_IDENTITY: &str = "<default>";

/// Opaque stable key identifying a target interpreter/environment.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct InterpreterIdentity(String);

impl InterpreterIdentity {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The fixed identity used when no resolver matches a document.
    pub fn default_identity() -> Self {
        Self(DEFAULT_IDENTITY.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InterpreterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolution result: which environment a document belongs to and how to
/// launch workers for it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvironmentSpec {
    pub identity: InterpreterIdentity,
    pub launch: LaunchParams,
}

/// One plugin in the resolver chain.
///
/// Returning `None` passes the document to the next resolver in order.
pub trait InterpreterResolver: Send + Sync {
    fn resolve(&self, uri: &Url) -> Option<EnvironmentSpec>;
}

impl<F> InterpreterResolver for F
where
    F: Fn(&Url) -> Option<EnvironmentSpec> + Send + Sync,
{
    fn resolve(&self, uri: &Url) -> Option<EnvironmentSpec> {
        self(uri)
    }
}
