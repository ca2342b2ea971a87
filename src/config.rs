//! Configuration and workspace snapshots shared with worker processes.
//!
//! These are the explicit context pieces that replace process-wide state:
//! the full settings snapshot broadcast on `workspace/didChangeConfiguration`,
//! the workspace-folder snapshot, and the open-document table used for
//! catch-up replay when a worker is (re)spawned.

use dashmap::DashMap;
use serde_json::Value;
use url::Url;

use crate::worker::WorkerLaunchOptions;

/// Full configuration snapshot as seen by workers.
///
/// `settings` is the complete settings object forwarded verbatim in
/// `workspace/didChangeConfiguration`; `launch` feeds the worker command
/// line, so changing it makes existing workers drift and respawn on next use.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConfigSnapshot {
    pub settings: Value,
    pub launch: WorkerLaunchOptions,
}

impl ConfigSnapshot {
    pub fn new(settings: Value, launch: WorkerLaunchOptions) -> Self {
        Self { settings, launch }
    }
}

/// One workspace folder as sent in the initialize handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkspaceFolder {
    pub uri: Url,
    pub name: String,
}

/// Workspace snapshot copied into each worker at spawn time and on every
/// `workspace/didChangeWorkspaceFolders` broadcast.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkspaceSnapshot {
    pub root_uri: Option<Url>,
    pub folders: Vec<WorkspaceFolder>,
}

impl WorkspaceSnapshot {
    pub fn new(root_uri: Option<Url>, folders: Vec<WorkspaceFolder>) -> Self {
        Self { root_uri, folders }
    }
}

/// A document the editor currently has open.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenDocument {
    pub uri: Url,
    pub language_id: String,
    pub version: i32,
    pub text: String,
}

/// Table of open documents, keyed by uri.
///
/// The embedding server mirrors didOpen/didChange/didClose into this table;
/// a freshly spawned worker replays a didOpen for every entry so it matches
/// the editor's current view.
#[derive(Default)]
pub struct DocumentStore {
    docs: DashMap<Url, OpenDocument>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, doc: OpenDocument) {
        self.docs.insert(doc.uri.clone(), doc);
    }

    /// Replace the text of an open document, bumping its version.
    ///
    /// Unknown uris are ignored; the editor owns the authoritative state.
    pub fn update(&self, uri: &Url, version: i32, text: String) {
        if let Some(mut doc) = self.docs.get_mut(uri) {
            doc.version = version;
            doc.text = text;
        }
    }

    pub fn close(&self, uri: &Url) {
        self.docs.remove(uri);
    }

    pub fn is_open(&self, uri: &Url) -> bool {
        self.docs.contains_key(uri)
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Copy of every open document, for catch-up replay.
    pub fn snapshot(&self) -> Vec<OpenDocument> {
        self.docs.iter().map(|entry| entry.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(uri: &str, text: &str) -> OpenDocument {
        OpenDocument {
            uri: Url::parse(uri).unwrap(),
            language_id: "robotframework".to_string(),
            version: 1,
            text: text.to_string(),
        }
    }

    #[test]
    fn open_update_close_roundtrip() {
        let store = DocumentStore::new();
        let uri = Url::parse("file:///suite/a.robot").unwrap();

        store.open(doc("file:///suite/a.robot", "*** Settings ***"));
        assert!(store.is_open(&uri));
        assert_eq!(store.len(), 1);

        store.update(&uri, 2, "*** Test Cases ***".to_string());
        let snapshot = store.snapshot();
        assert_eq!(snapshot[0].version, 2);
        assert_eq!(snapshot[0].text, "*** Test Cases ***");

        store.close(&uri);
        assert!(!store.is_open(&uri));
        assert!(store.is_empty());
    }

    #[test]
    fn update_of_unknown_uri_is_ignored() {
        let store = DocumentStore::new();
        let uri = Url::parse("file:///never-opened.robot").unwrap();

        store.update(&uri, 5, "text".to_string());
        assert!(store.is_empty());
    }

    #[test]
    fn snapshot_contains_every_open_document() {
        let store = DocumentStore::new();
        store.open(doc("file:///a.robot", "a"));
        store.open(doc("file:///b.robot", "b"));

        let mut uris: Vec<String> = store
            .snapshot()
            .into_iter()
            .map(|d| d.uri.to_string())
            .collect();
        uris.sort();
        assert_eq!(uris, vec!["file:///a.robot", "file:///b.robot"]);
    }
}
