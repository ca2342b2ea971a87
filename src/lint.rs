//! Debounced, single-flight lint scheduling.
//!
//! Every edit schedules a lint for its document after a debounce window;
//! scheduling again before the window elapses supersedes the previous
//! session, so at most one lint per document is pending or running at any
//! time. Results publish through a [`DiagnosticsSink`]; a failed or
//! superseded session publishes nothing, leaving the previous diagnostics in
//! place until a newer run succeeds.
//!
//! Manual batch lints (lint a file set or directory tree on request) go
//! through the same per-document sessions, chained one at a time so the lint
//! worker is never asked to do two documents at once.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::progress::{LogProgress, ProgressReporter, ProgressSource};
use crate::protocol::{RequestKind, lint_params};
use crate::registry::OrchestratorRegistry;

const LOG_TARGET: &str = "karakuri::lint";

/// Debounce after a save or a structural edit.
pub const SHORT_DEBOUNCE: Duration = Duration::from_millis(200);
/// Debounce while the user is typing inside a line.
pub const LONG_DEBOUNCE: Duration = Duration::from_millis(800);

const DEFAULT_LINT_TIMEOUT: Duration = Duration::from_secs(60);

/// Debounce window for one change event. Saves and edits that insert a
/// newline usually mean a statement boundary, so they re-lint quickly;
/// mid-line typing waits longer to avoid linting half-typed tokens.
pub fn debounce_for(is_saved: bool, inserted_newline: bool) -> Duration {
    if is_saved || inserted_newline {
        SHORT_DEBOUNCE
    } else {
        LONG_DEBOUNCE
    }
}

/// Where finished lint results go. The embedding server maps this onto
/// `textDocument/publishDiagnostics` towards the editor.
pub trait DiagnosticsSink: Send + Sync {
    fn publish(&self, uri: &Url, diagnostics: Vec<Value>);
}

/// Default sink: log the count and drop.
pub struct LogDiagnostics;

impl DiagnosticsSink for LogDiagnostics {
    fn publish(&self, uri: &Url, diagnostics: Vec<Value>) {
        log::debug!(
            target: LOG_TARGET,
            "{} diagnostics for {} (no sink wired)",
            diagnostics.len(),
            uri
        );
    }
}

/// One pending or running lint for one document. The id guards against a
/// finished task tearing down a session that already superseded it.
struct LintSession {
    id: u64,
    cancel: CancellationToken,
}

/// Manual batch state: documents waiting their turn plus the one currently
/// linting, with a progress indicator spanning the whole batch.
struct QueueState {
    pending: VecDeque<Url>,
    current: Option<Url>,
    progress: Option<Box<dyn ProgressReporter>>,
    total: usize,
    done: usize,
}

impl QueueState {
    fn contains(&self, uri: &Url) -> bool {
        self.current.as_ref() == Some(uri) || self.pending.contains(uri)
    }
}

pub struct LintScheduler {
    registry: Arc<OrchestratorRegistry>,
    sink: Arc<dyn DiagnosticsSink>,
    progress: Arc<dyn ProgressSource>,
    lint_timeout: Duration,
    sessions: DashMap<Url, LintSession>,
    next_session_id: AtomicU64,
    queue: std::sync::Mutex<QueueState>,
}

impl LintScheduler {
    pub fn new(registry: Arc<OrchestratorRegistry>, sink: Arc<dyn DiagnosticsSink>) -> Arc<Self> {
        Self::with_options(registry, sink, Arc::new(LogProgress), DEFAULT_LINT_TIMEOUT)
    }

    pub fn with_options(
        registry: Arc<OrchestratorRegistry>,
        sink: Arc<dyn DiagnosticsSink>,
        progress: Arc<dyn ProgressSource>,
        lint_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            sink,
            progress,
            lint_timeout,
            sessions: DashMap::new(),
            next_session_id: AtomicU64::new(1),
            queue: std::sync::Mutex::new(QueueState {
                pending: VecDeque::new(),
                current: None,
                progress: None,
                total: 0,
                done: 0,
            }),
        })
    }

    /// Schedule using the standard debounce for this change event.
    pub fn schedule_on_change(self: &Arc<Self>, uri: Url, is_saved: bool, inserted_newline: bool) {
        let delay = debounce_for(is_saved, inserted_newline);
        self.schedule_lint(uri, is_saved, delay);
    }

    /// Schedule a lint for `uri` after `delay`, superseding any session
    /// already pending or running for the same document.
    pub fn schedule_lint(self: &Arc<Self>, uri: Url, is_saved: bool, delay: Duration) {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();

        if let Some(previous) = self.sessions.insert(
            uri.clone(),
            LintSession {
                id,
                cancel: cancel.clone(),
            },
        ) {
            log::trace!(target: LOG_TARGET, "superseding lint session for {}", uri);
            previous.cancel.cancel();
        }

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let superseded = tokio::select! {
                _ = cancel.cancelled() => true,
                _ = tokio::time::sleep(delay) => false,
            };
            if !superseded {
                scheduler.run_lint(&uri, is_saved, &cancel).await;
            }

            // Only the task that still owns the session tears it down and
            // advances the batch; a superseded task must not.
            let owned = scheduler
                .sessions
                .remove_if(&uri, |_, session| session.id == id)
                .is_some();
            if owned {
                scheduler.on_batch_item_finished(&uri);
            }
        });
    }

    /// Cancel the pending or running lint for `uri`. No-op when none exists.
    pub fn cancel_lint(self: &Arc<Self>, uri: &Url) {
        if let Some((_, session)) = self.sessions.remove(uri) {
            session.cancel.cancel();
            self.on_batch_item_finished(uri);
        }
    }

    /// Lint a set of files and directories on explicit request. Directories
    /// expand recursively to `.robot` and `.resource` files; duplicates and
    /// documents already queued are skipped. Items lint one at a time, with
    /// one progress indicator spanning the batch.
    pub fn schedule_manual_lint(self: &Arc<Self>, paths: &[PathBuf]) {
        let mut files = Vec::new();
        for path in paths {
            collect_lintable(path, &mut files);
        }

        let mut seen = HashSet::new();
        let uris: Vec<Url> = files
            .into_iter()
            .filter_map(|p| Url::from_file_path(&p).ok())
            .filter(|uri| seen.insert(uri.clone()))
            .collect();
        if uris.is_empty() {
            return;
        }

        let first = {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            let fresh: Vec<Url> = uris
                .into_iter()
                .filter(|uri| !queue.contains(uri))
                .collect();
            if fresh.is_empty() {
                return;
            }
            queue.total += fresh.len();
            queue.pending.extend(fresh);

            if queue.current.is_some() {
                // A batch is already draining; the new items joined its tail.
                None
            } else {
                queue.progress = Some(self.progress.begin("Linting", queue.total));
                let first = queue.pending.pop_front();
                queue.current = first.clone();
                first
            }
        };

        if let Some(uri) = first {
            self.schedule_lint(uri, true, Duration::ZERO);
        }
    }

    /// Whether a lint is currently pending or running for `uri`.
    pub fn is_scheduled(&self, uri: &Url) -> bool {
        self.sessions.contains_key(uri)
    }

    async fn run_lint(&self, uri: &Url, is_saved: bool, cancel: &CancellationToken) {
        let result = self
            .registry
            .request(
                RequestKind::Lint,
                uri,
                lint_params(uri, is_saved),
                self.lint_timeout,
                cancel,
            )
            .await;

        match result {
            Ok(mut result) => {
                let diagnostics = match result.get_mut("diagnostics").map(Value::take) {
                    Some(Value::Array(items)) => items,
                    _ => Vec::new(),
                };
                log::debug!(
                    target: LOG_TARGET,
                    "{} diagnostics for {}",
                    diagnostics.len(),
                    uri
                );
                self.sink.publish(uri, diagnostics);
            }
            Err(e) if e.is_cancellation() => {
                log::trace!(target: LOG_TARGET, "lint for {} cancelled", uri);
            }
            Err(e) => {
                // Previous diagnostics stay in place; the next edit retries.
                log::debug!(target: LOG_TARGET, "lint for {} failed: {}", uri, e);
            }
        }
    }

    /// Advance the manual batch after `uri` finished or was cancelled.
    /// Outside a batch this does nothing.
    fn on_batch_item_finished(self: &Arc<Self>, uri: &Url) {
        let next = {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            if queue.current.as_ref() != Some(uri) {
                return;
            }
            queue.done += 1;

            match queue.pending.pop_front() {
                Some(next) => {
                    queue.current = Some(next.clone());
                    let done = queue.done;
                    let total = queue.total;
                    if let Some(progress) = queue.progress.as_mut() {
                        progress.update(&format!("{done}/{total}"));
                    }
                    Some(next)
                }
                None => {
                    queue.current = None;
                    queue.done = 0;
                    queue.total = 0;
                    if let Some(mut progress) = queue.progress.take() {
                        progress.end();
                    }
                    None
                }
            }
        };

        if let Some(uri) = next {
            self.schedule_lint(uri, true, Duration::ZERO);
        }
    }
}

/// Recursively collect lintable files under `path`.
///
/// Symlinked directories are not descended into; a link back up the tree
/// would otherwise recurse forever. Symlinks to plain files still count.
fn collect_lintable(path: &Path, out: &mut Vec<PathBuf>) {
    let Ok(meta) = std::fs::symlink_metadata(path) else {
        return;
    };
    if meta.file_type().is_symlink() {
        if path.is_file() && has_lintable_extension(path) {
            out.push(path.to_path_buf());
        }
        return;
    }
    if meta.is_dir() {
        if let Ok(entries) = std::fs::read_dir(path) {
            for entry in entries.flatten() {
                collect_lintable(&entry.path(), out);
            }
        }
        return;
    }
    if has_lintable_extension(path) {
        out.push(path.to_path_buf());
    }
}

fn has_lintable_extension(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("robot" | "resource")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::LaunchParams;
    use std::fs;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn saves_and_newlines_use_the_short_debounce() {
        assert_eq!(debounce_for(true, false), SHORT_DEBOUNCE);
        assert_eq!(debounce_for(false, true), SHORT_DEBOUNCE);
        assert_eq!(debounce_for(false, false), LONG_DEBOUNCE);
    }

    #[test]
    fn collect_lintable_walks_directories_and_filters_extensions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sub = dir.path().join("nested");
        fs::create_dir(&sub).unwrap();
        fs::write(dir.path().join("suite.robot"), "").unwrap();
        fs::write(sub.join("keywords.resource"), "").unwrap();
        fs::write(sub.join("notes.txt"), "").unwrap();

        let mut files = Vec::new();
        collect_lintable(dir.path(), &mut files);

        let mut names: Vec<String> = files
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        names.sort();
        assert_eq!(names, vec!["keywords.resource", "suite.robot"]);
    }

    #[cfg(unix)]
    #[test]
    fn collect_lintable_terminates_on_directory_symlink_cycles() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sub = dir.path().join("nested");
        fs::create_dir(&sub).unwrap();
        fs::write(sub.join("suite.robot"), "").unwrap();
        // A link back to the root would recurse forever if followed; a link
        // to a plain file still counts.
        std::os::unix::fs::symlink(dir.path(), sub.join("loop")).unwrap();
        std::os::unix::fs::symlink(sub.join("suite.robot"), dir.path().join("alias.robot"))
            .unwrap();

        let mut files = Vec::new();
        collect_lintable(dir.path(), &mut files);

        let mut names: Vec<String> = files
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        names.sort();
        assert_eq!(names, vec!["alias.robot", "suite.robot"]);
    }

    struct CollectSink(tokio::sync::mpsc::UnboundedSender<(Url, usize)>);

    impl DiagnosticsSink for CollectSink {
        fn publish(&self, uri: &Url, diagnostics: Vec<Value>) {
            let _ = self.0.send((uri.clone(), diagnostics.len()));
        }
    }

    struct CountingProgress {
        begun: Arc<AtomicUsize>,
        ended: Arc<AtomicUsize>,
    }

    struct CountingReporter {
        ended: Arc<AtomicUsize>,
    }

    impl ProgressSource for CountingProgress {
        fn begin(&self, _title: &str, _total: usize) -> Box<dyn ProgressReporter> {
            self.begun.fetch_add(1, Ordering::SeqCst);
            Box::new(CountingReporter {
                ended: Arc::clone(&self.ended),
            })
        }
    }

    impl ProgressReporter for CountingReporter {
        fn update(&mut self, _message: &str) {}
        fn end(&mut self) {
            self.ended.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Lint worker mock: answers the handshake, then answers the given
    /// request ids with one diagnostic each, pausing between frames.
    fn lint_worker_launch(answer_ids: &[i64]) -> LaunchParams {
        let mut script = String::from(
            r#"b='{"jsonrpc":"2.0","id":1,"result":{"capabilities":{}}}'; printf 'Content-Length: %d\r\n\r\n%s' "${#b}" "$b"; "#,
        );
        for id in answer_ids {
            script.push_str(&format!(
                r#"sleep 0.3; b='{{"jsonrpc":"2.0","id":{id},"result":{{"diagnostics":[{{"message":"bad keyword"}}]}}}}'; printf 'Content-Length: %d\r\n\r\n%s' "${{#b}}" "$b"; "#
            ));
        }
        script.push_str("exec cat >/dev/null");
        LaunchParams::new(PathBuf::from("sh"))
            .with_args(vec!["-c".to_string(), script])
    }

    fn scheduler_with(
        launch: LaunchParams,
        sink: Arc<dyn DiagnosticsSink>,
        progress: Arc<dyn ProgressSource>,
    ) -> Arc<LintScheduler> {
        let registry = OrchestratorRegistry::builder(launch).build();
        LintScheduler::with_options(registry, sink, progress, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn scheduled_lint_publishes_diagnostics() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let scheduler = scheduler_with(
            lint_worker_launch(&[2]),
            Arc::new(CollectSink(tx)),
            Arc::new(LogProgress),
        );
        let uri = Url::parse("file:///suite/a.robot").unwrap();

        scheduler.schedule_lint(uri.clone(), true, Duration::ZERO);

        let (published, count) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("diagnostics within 5s")
            .expect("sink open");
        assert_eq!(published, uri);
        assert_eq!(count, 1);

        // Session teardown happens just after the publish.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!scheduler.is_scheduled(&uri));
    }

    #[tokio::test]
    async fn rescheduling_supersedes_the_pending_session() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let scheduler = scheduler_with(
            lint_worker_launch(&[2]),
            Arc::new(CollectSink(tx)),
            Arc::new(LogProgress),
        );
        let uri = Url::parse("file:///suite/a.robot").unwrap();

        // The first session is still in its debounce window when the second
        // arrives, so only one request ever reaches the worker.
        scheduler.schedule_lint(uri.clone(), false, LONG_DEBOUNCE);
        scheduler.schedule_lint(uri.clone(), true, Duration::ZERO);

        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("one publish")
            .expect("sink open");
        tokio::time::sleep(LONG_DEBOUNCE + Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err(), "superseded session must not publish");
    }

    #[tokio::test]
    async fn cancel_during_debounce_publishes_nothing() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let scheduler = scheduler_with(
            lint_worker_launch(&[2]),
            Arc::new(CollectSink(tx)),
            Arc::new(LogProgress),
        );
        let uri = Url::parse("file:///suite/a.robot").unwrap();

        scheduler.schedule_lint(uri.clone(), false, LONG_DEBOUNCE);
        scheduler.cancel_lint(&uri);
        assert!(!scheduler.is_scheduled(&uri));

        tokio::time::sleep(LONG_DEBOUNCE + Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());

        // Cancelling again is a no-op.
        scheduler.cancel_lint(&uri);
    }

    #[tokio::test]
    async fn manual_batch_lints_every_file_once_with_one_progress_span() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("a.robot"), "").unwrap();
        fs::write(dir.path().join("b.robot"), "").unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let begun = Arc::new(AtomicUsize::new(0));
        let ended = Arc::new(AtomicUsize::new(0));
        let scheduler = scheduler_with(
            lint_worker_launch(&[2, 3]),
            Arc::new(CollectSink(tx)),
            Arc::new(CountingProgress {
                begun: Arc::clone(&begun),
                ended: Arc::clone(&ended),
            }),
        );

        // The directory plus one file it already contains: the duplicate is
        // dropped before queueing.
        scheduler.schedule_manual_lint(&[dir.path().to_path_buf(), dir.path().join("a.robot")]);

        let mut published = Vec::new();
        for _ in 0..2 {
            let (uri, _) = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("batch item within 10s")
                .expect("sink open");
            published.push(uri.to_string());
        }
        published.sort();
        assert_eq!(published.len(), 2);
        assert!(published[0].ends_with("a.robot"));
        assert!(published[1].ends_with("b.robot"));

        // Give the final teardown a moment, then check the progress span.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(begun.load(Ordering::SeqCst), 1);
        assert_eq!(ended.load(Ordering::SeqCst), 1);
        assert!(rx.try_recv().is_err(), "no third publish");
    }

    #[tokio::test]
    async fn cancelling_the_current_batch_item_advances_to_the_next() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = dir.path().join("a.robot");
        let second = dir.path().join("b.robot");
        fs::write(&first, "").unwrap();
        fs::write(&second, "").unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let begun = Arc::new(AtomicUsize::new(0));
        let ended = Arc::new(AtomicUsize::new(0));
        // Answer whichever id the surviving item ends up with: id 2 when the
        // cancelled item never sent its request, id 3 when it did.
        let scheduler = scheduler_with(
            lint_worker_launch(&[2, 3]),
            Arc::new(CollectSink(tx)),
            Arc::new(CountingProgress {
                begun: Arc::clone(&begun),
                ended: Arc::clone(&ended),
            }),
        );

        // Explicit file order: the first path becomes the current item.
        scheduler.schedule_manual_lint(&[first.clone(), second]);
        let first_uri = Url::from_file_path(&first).unwrap();
        scheduler.cancel_lint(&first_uri);

        let (uri, _) = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("next batch item within 10s")
            .expect("sink open");
        assert!(uri.as_str().ends_with("b.robot"));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(begun.load(Ordering::SeqCst), 1);
        assert_eq!(ended.load(Ordering::SeqCst), 1);
        assert!(rx.try_recv().is_err(), "cancelled item must not publish");
    }
}
