//! JSON-RPC method names and message builders for worker communication.
//!
//! The request surface the orchestrator fronts is a closed set: every kind a
//! worker can be asked for is listed in [`RequestKind`], so routing stays
//! statically checkable instead of dispatching on caller-supplied method
//! strings.

use serde_json::{Value, json};

use crate::config::{OpenDocument, WorkspaceFolder};
use crate::worker::WorkerRole;

/// Well-known method names.
pub(crate) mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "initialized";
    pub const SHUTDOWN: &str = "shutdown";
    pub const EXIT: &str = "exit";
    pub const CANCEL_REQUEST: &str = "$/cancelRequest";
    pub const DID_OPEN: &str = "textDocument/didOpen";
    pub const DID_CHANGE_CONFIGURATION: &str = "workspace/didChangeConfiguration";
    pub const DID_CHANGE_WORKSPACE_FOLDERS: &str = "workspace/didChangeWorkspaceFolders";
}

/// Every request kind the orchestrator can issue to a worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Completion,
    Hover,
    Definition,
    References,
    SignatureHelp,
    DocumentSymbol,
    FoldingRange,
    CodeLens,
    WorkspaceSymbol,
    Lint,
}

impl RequestKind {
    /// The JSON-RPC method name for this kind.
    pub fn method(self) -> &'static str {
        match self {
            RequestKind::Completion => "textDocument/completion",
            RequestKind::Hover => "textDocument/hover",
            RequestKind::Definition => "textDocument/definition",
            RequestKind::References => "textDocument/references",
            RequestKind::SignatureHelp => "textDocument/signatureHelp",
            RequestKind::DocumentSymbol => "textDocument/documentSymbol",
            RequestKind::FoldingRange => "textDocument/foldingRange",
            RequestKind::CodeLens => "textDocument/codeLens",
            RequestKind::WorkspaceSymbol => "workspace/symbol",
            RequestKind::Lint => "textDocument/lint",
        }
    }

    /// Which worker process serves this kind. Fast interactive requests go
    /// to Regular, full-document analysis to Lint, and the medium-cost rest
    /// to Others so it cannot starve the interactive process.
    pub fn role(self) -> WorkerRole {
        match self {
            RequestKind::Lint => WorkerRole::Lint,
            RequestKind::DocumentSymbol
            | RequestKind::FoldingRange
            | RequestKind::CodeLens
            | RequestKind::WorkspaceSymbol => WorkerRole::Others,
            _ => WorkerRole::Regular,
        }
    }

    /// Interactive kinds degrade to a null result on transport failure
    /// instead of surfacing an error to the editor. Lint failures retry
    /// silently on the next edit, so they are not in this set.
    pub fn degrades_to_null(self) -> bool {
        !matches!(self, RequestKind::Lint)
    }
}

/// Initialize handshake params: process id, root uri, workspace folders.
pub(crate) fn initialize_params(
    root_uri: Option<&url::Url>,
    folders: &[WorkspaceFolder],
) -> Value {
    let folders: Vec<Value> = folders
        .iter()
        .map(|f| json!({ "uri": f.uri.as_str(), "name": f.name }))
        .collect();
    json!({
        "processId": std::process::id(),
        "rootUri": root_uri.map(|u| u.as_str()),
        "workspaceFolders": folders,
        "clientInfo": {
            "name": "karakuri",
            "version": env!("CARGO_PKG_VERSION")
        },
        "capabilities": {}
    })
}

pub(crate) fn did_open_params(doc: &OpenDocument) -> Value {
    json!({
        "textDocument": {
            "uri": doc.uri.as_str(),
            "languageId": doc.language_id,
            "version": doc.version,
            "text": doc.text,
        }
    })
}

pub(crate) fn did_change_configuration_params(settings: &Value) -> Value {
    json!({ "settings": settings })
}

pub(crate) fn did_change_workspace_folders_params(folders: &[WorkspaceFolder]) -> Value {
    let added: Vec<Value> = folders
        .iter()
        .map(|f| json!({ "uri": f.uri.as_str(), "name": f.name }))
        .collect();
    // Full-snapshot semantics: the worker replaces its folder list.
    json!({ "event": { "added": added, "removed": [] } })
}

pub(crate) fn cancel_request_params(id: i64) -> Value {
    json!({ "id": id })
}

pub(crate) fn lint_params(uri: &url::Url, is_saved: bool) -> Value {
    json!({
        "textDocument": { "uri": uri.as_str() },
        "isSaved": is_saved,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    #[test]
    fn every_request_kind_has_a_distinct_method() {
        let kinds = [
            RequestKind::Completion,
            RequestKind::Hover,
            RequestKind::Definition,
            RequestKind::References,
            RequestKind::SignatureHelp,
            RequestKind::DocumentSymbol,
            RequestKind::FoldingRange,
            RequestKind::CodeLens,
            RequestKind::WorkspaceSymbol,
            RequestKind::Lint,
        ];
        let mut methods: Vec<&str> = kinds.iter().map(|k| k.method()).collect();
        methods.sort_unstable();
        methods.dedup();
        assert_eq!(methods.len(), kinds.len());
    }

    #[test]
    fn request_kinds_route_to_the_expected_role() {
        assert_eq!(RequestKind::Completion.role(), WorkerRole::Regular);
        assert_eq!(RequestKind::Hover.role(), WorkerRole::Regular);
        assert_eq!(RequestKind::DocumentSymbol.role(), WorkerRole::Others);
        assert_eq!(RequestKind::WorkspaceSymbol.role(), WorkerRole::Others);
        assert_eq!(RequestKind::Lint.role(), WorkerRole::Lint);
    }

    #[test]
    fn interactive_kinds_degrade_to_null_but_lint_does_not() {
        assert!(RequestKind::Hover.degrades_to_null());
        assert!(RequestKind::Completion.degrades_to_null());
        assert!(!RequestKind::Lint.degrades_to_null());
    }

    #[test]
    fn initialize_params_include_process_and_workspace() {
        let root = Url::parse("file:///workspace").unwrap();
        let folders = vec![WorkspaceFolder {
            uri: root.clone(),
            name: "workspace".to_string(),
        }];

        let params = initialize_params(Some(&root), &folders);
        assert_eq!(params["processId"], std::process::id());
        assert_eq!(params["rootUri"], "file:///workspace");
        assert_eq!(params["workspaceFolders"][0]["name"], "workspace");
    }

    #[test]
    fn lint_params_carry_uri_and_saved_flag() {
        let uri = Url::parse("file:///suite/a.robot").unwrap();
        let params = lint_params(&uri, true);
        assert_eq!(params["textDocument"]["uri"], "file:///suite/a.robot");
        assert_eq!(params["isSaved"], true);
    }
}
