//! Progress reporting collaborator interface.
//!
//! Manual lint batches report begin/update/end through these traits; the
//! embedding server maps them onto editor progress notifications.

/// An active progress indicator. `end` is called exactly once when the
/// operation it tracks drains.
pub trait ProgressReporter: Send {
    fn update(&mut self, message: &str);
    fn end(&mut self);
}

/// Factory for progress indicators.
pub trait ProgressSource: Send + Sync {
    fn begin(&self, title: &str, total: usize) -> Box<dyn ProgressReporter>;
}

/// Progress source that only logs. Used when the embedder does not wire a
/// real reporter.
pub struct LogProgress;

impl ProgressSource for LogProgress {
    fn begin(&self, title: &str, total: usize) -> Box<dyn ProgressReporter> {
        log::debug!(
            target: "karakuri::progress",
            "begin: {} ({} items)",
            title,
            total
        );
        Box::new(LogProgressReporter {
            title: title.to_string(),
        })
    }
}

struct LogProgressReporter {
    title: String,
}

impl ProgressReporter for LogProgressReporter {
    fn update(&mut self, message: &str) {
        log::debug!(target: "karakuri::progress", "{}: {}", self.title, message);
    }

    fn end(&mut self) {
        log::debug!(target: "karakuri::progress", "end: {}", self.title);
    }
}
