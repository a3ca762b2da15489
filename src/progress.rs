//! Download progress reporting.
//!
//! A [`ProcessHandler`] observes one download's lifecycle: `init` announces
//! the total, `progress` carries per-chunk byte deltas (never cumulative
//! totals), and `set_status` both mutates the status and notifies in one
//! step; there is no separate "mutate" operation that could drift from the
//! notification.
//!
//! Handlers are shared across the fetch tasks of one downloader, so the
//! trait takes `&self` and implementations use interior mutability via
//! [`ProgressTracker`].

use std::io::Write;
use std::sync::Mutex;

use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;

/// Lifecycle status of a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Waiting,
    Preparing,
    Downloading,
    Finishing,
    Finished,
    Terminating,
    Terminated,
}

impl DownloadStatus {
    /// Terminal states: no further transitions.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Terminated)
    }
}

impl std::fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Waiting => "waiting",
            Self::Preparing => "preparing",
            Self::Downloading => "downloading",
            Self::Finishing => "finishing",
            Self::Finished => "finished",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Snapshot of a download's progress.
///
/// An unknown total is `None`, never zero; `done_size` only grows between
/// `init` calls and is clamped to the total once one is known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressState {
    pub status: DownloadStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_size: Option<u64>,
    #[serde(default)]
    pub done_size: u64,
}

impl Default for ProgressState {
    fn default() -> Self {
        Self {
            status: DownloadStatus::Waiting,
            total_size: None,
            done_size: 0,
        }
    }
}

/// Observer attached to one download.
pub trait ProcessHandler: Send + Sync {
    /// Starts (or restarts) progress accounting with a new total.
    fn init(&self, total_size: Option<u64>, status: DownloadStatus);

    /// Reports `delta` newly downloaded bytes (per chunk, not cumulative).
    fn progress(&self, delta: u64);

    /// Grows the known total by `delta` bytes. Used by the merged-stream
    /// downloader, whose total is accumulated as segments complete.
    fn grow_total(&self, delta: u64);

    /// Sets the status and notifies observers as one atomic step.
    fn set_status(&self, status: DownloadStatus);

    /// Marks the download finished; `done_size` snaps to the total.
    fn finish(&self);

    /// Reports a download error with its protocol code. Handlers that
    /// have no error channel may ignore it, so the default is a no-op.
    fn error(&self, _code: u8, _message: &str) {}

    /// Current progress snapshot.
    fn snapshot(&self) -> ProgressState;
}

/// Shared bookkeeping embedded by every handler implementation.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    state: Mutex<ProgressState>,
}

impl ProgressTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `init` and returns the new state.
    pub fn init(&self, total_size: Option<u64>, status: DownloadStatus) -> ProgressState {
        let mut state = self.lock();
        *state = ProgressState {
            status,
            total_size,
            done_size: 0,
        };
        state.clone()
    }

    /// Applies a progress delta and returns the new state.
    pub fn progress(&self, delta: u64) -> ProgressState {
        let mut state = self.lock();
        state.done_size = state.done_size.saturating_add(delta);
        if let Some(total) = state.total_size {
            state.done_size = state.done_size.min(total);
        }
        state.clone()
    }

    /// Grows the total and returns the new state.
    pub fn grow_total(&self, delta: u64) -> ProgressState {
        let mut state = self.lock();
        state.total_size = Some(state.total_size.unwrap_or(0).saturating_add(delta));
        state.clone()
    }

    /// Applies a status change and returns the new state.
    pub fn set_status(&self, status: DownloadStatus) -> ProgressState {
        let mut state = self.lock();
        state.status = status;
        state.clone()
    }

    /// Applies `finish` and returns the new state.
    pub fn finish(&self) -> ProgressState {
        let mut state = self.lock();
        state.status = DownloadStatus::Finished;
        if let Some(total) = state.total_size {
            state.done_size = total;
        }
        state.clone()
    }

    #[must_use]
    pub fn snapshot(&self) -> ProgressState {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ProgressState> {
        // Progress state is plain data; a poisoned lock only means a
        // panicking reporter, whose partial update is still usable.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Console handler rendering an indicatif byte-progress bar.
pub struct ConsoleHandler {
    tracker: ProgressTracker,
    bar: ProgressBar,
}

impl ConsoleHandler {
    #[must_use]
    pub fn new() -> Self {
        let bar = ProgressBar::hidden();
        bar.set_style(
            ProgressStyle::with_template("{msg} [{bar:30}] {bytes}/{total_bytes}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        Self {
            tracker: ProgressTracker::new(),
            bar,
        }
    }
}

impl Default for ConsoleHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessHandler for ConsoleHandler {
    fn init(&self, total_size: Option<u64>, status: DownloadStatus) {
        let state = self.tracker.init(total_size, status);
        self.bar.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        self.bar.set_length(state.total_size.unwrap_or(0));
        self.bar.set_position(0);
        self.bar.set_message(status.to_string());
    }

    fn progress(&self, delta: u64) {
        self.tracker.progress(delta);
        self.bar.inc(delta);
    }

    fn grow_total(&self, delta: u64) {
        let state = self.tracker.grow_total(delta);
        self.bar.set_length(state.total_size.unwrap_or(0));
    }

    fn set_status(&self, status: DownloadStatus) {
        self.tracker.set_status(status);
        self.bar.set_message(status.to_string());
    }

    fn finish(&self) {
        let state = self.tracker.finish();
        self.bar.set_position(state.done_size);
        self.bar.finish_and_clear();
        // The bar clears itself; leave a plain final line.
        let _ = writeln!(std::io::stderr(), "done ({} bytes)", state.done_size);
    }

    fn snapshot(&self) -> ProgressState {
        self.tracker.snapshot()
    }
}

/// Event pushed by a [`ChannelHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Init {
        total_size: Option<u64>,
        status: DownloadStatus,
    },
    Progress {
        delta: u64,
    },
    GrowTotal {
        delta: u64,
    },
    SetStatus {
        status: DownloadStatus,
    },
    Finished,
    Error {
        code: u8,
        message: String,
    },
}

/// In-process relay: forwards every call as a [`ProgressEvent`] on an
/// unbounded channel, for a UI running in the same process.
pub struct ChannelHandler {
    tracker: ProgressTracker,
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelHandler {
    /// Creates the handler and the receiving end of its event stream.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tracker: ProgressTracker::new(),
                tx,
            },
            rx,
        )
    }

    fn send(&self, event: ProgressEvent) {
        // A dropped receiver means the UI went away; progress continues.
        if self.tx.send(event).is_err() {
            trace!("progress receiver dropped");
        }
    }
}

impl ProcessHandler for ChannelHandler {
    fn init(&self, total_size: Option<u64>, status: DownloadStatus) {
        self.tracker.init(total_size, status);
        self.send(ProgressEvent::Init { total_size, status });
    }

    fn progress(&self, delta: u64) {
        self.tracker.progress(delta);
        self.send(ProgressEvent::Progress { delta });
    }

    fn grow_total(&self, delta: u64) {
        self.tracker.grow_total(delta);
        self.send(ProgressEvent::GrowTotal { delta });
    }

    fn set_status(&self, status: DownloadStatus) {
        self.tracker.set_status(status);
        self.send(ProgressEvent::SetStatus { status });
    }

    fn finish(&self) {
        self.tracker.finish();
        self.send(ProgressEvent::Finished);
    }

    fn error(&self, code: u8, message: &str) {
        self.send(ProgressEvent::Error {
            code,
            message: message.to_string(),
        });
    }

    fn snapshot(&self) -> ProgressState {
        self.tracker.snapshot()
    }
}
