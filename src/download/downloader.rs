//! Download lifecycle: strategy selection, status transitions, termination.
//!
//! A [`BookDownloader`] drives one book through
//! created → preparing → downloading → finishing → finished, or into
//! terminated from any non-terminal state. The actual fetching is delegated
//! to a [`Downloader`] strategy chosen from the closed [`StrategyTable`] by
//! inspecting the book's source locators.
//!
//! Termination is cooperative: [`DownloadControl::terminate`] raises the
//! cancel flag, drains the scheduler, and then waits for the driver to
//! finish cleanup, so when it returns no task still holds the book's files.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use super::DownloadError;
use super::transfer::{CancelFlag, HttpFetcher};
use crate::book::{Book, ChapterFile};
use crate::config::EngineConfig;
use crate::progress::{DownloadStatus, ProcessHandler};
use crate::scheduler::TaskScheduler;

use super::merged::MergedStreamDownloader;
use super::simple::SimpleSegmentedDownloader;

/// Everything a strategy needs, owned per download.
pub struct DownloadContext {
    pub book: Book,
    pub config: EngineConfig,
    pub fetcher: HttpFetcher,
    pub scheduler: TaskScheduler,
    pub cancel: CancelFlag,
    pub handler: Arc<dyn ProcessHandler>,
}

/// One download strategy, driven by [`BookDownloader`].
#[async_trait]
pub trait Downloader: Send {
    /// Resolves sources into transfer units.
    ///
    /// Returns the total byte size when it can be known up front; merged
    /// streams return `None` and grow the total as segments complete.
    async fn prepare(&mut self) -> Result<Option<u64>, DownloadError>;

    /// Fetches all units through the scheduler.
    async fn download(&mut self) -> Result<(), DownloadError>;

    /// Completes assembly and returns the chapter files in playback order.
    async fn finish(&mut self) -> Result<Vec<ChapterFile>, DownloadError>;

    /// Strategy-specific teardown on termination. File and directory
    /// removal is the driver's job; this hook is for extra state (open
    /// handles, background tasks).
    async fn terminate(&mut self) {}
}

/// Final state of a driven download.
#[derive(Debug)]
pub enum Outcome {
    /// All chapters produced.
    Finished(Vec<ChapterFile>),
    /// Terminated on request; partial output has been removed.
    Terminated,
    /// A fatal error stopped the download; partial output has been removed.
    Failed(DownloadError),
}

/// Cloneable handle for terminating a running download.
#[derive(Clone)]
pub struct DownloadControl {
    cancel: CancelFlag,
    scheduler: TaskScheduler,
    done: watch::Receiver<bool>,
}

impl DownloadControl {
    /// Raises the cancel flag without waiting.
    pub fn request_terminate(&self) {
        self.cancel.set();
    }

    /// Whether termination has been requested.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.cancel.is_set()
    }

    /// Terminates the download and waits until the driver has cleaned up.
    ///
    /// Safe to call while the download is completing naturally; it returns
    /// once the driver reports done either way.
    pub async fn terminate(&self) {
        self.cancel.set();
        self.scheduler.terminate().await;
        self.wait_done().await;
    }

    /// Waits for the driver to reach a terminal state.
    pub async fn wait_done(&self) {
        let mut done = self.done.clone();
        while !*done.borrow() {
            if done.changed().await.is_err() {
                break;
            }
        }
    }
}

/// Drives one book download end to end.
pub struct BookDownloader {
    book: Book,
    handler: Arc<dyn ProcessHandler>,
    strategy: Box<dyn Downloader>,
    cancel: CancelFlag,
    scheduler: TaskScheduler,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl BookDownloader {
    /// Builds a downloader for `book`, selecting the strategy from the
    /// built-in table.
    ///
    /// # Errors
    ///
    /// Fails when the HTTP client cannot be built or no strategy matches
    /// the book's sources.
    pub fn new(
        book: Book,
        handler: Arc<dyn ProcessHandler>,
        config: EngineConfig,
    ) -> Result<Self, DownloadError> {
        let fetcher = HttpFetcher::new(&config)?;
        let scheduler = TaskScheduler::new(config.concurrency.max(1))?;
        let cancel = CancelFlag::new();
        let ctx = DownloadContext {
            book: book.clone(),
            config,
            fetcher,
            scheduler: scheduler.clone(),
            cancel: cancel.clone(),
            handler: Arc::clone(&handler),
        };
        let strategy = StrategyTable::builtin().select(ctx)?;
        Ok(Self::assemble(book, handler, strategy, cancel, scheduler))
    }

    /// Builds a downloader around an explicit strategy. Test seam.
    #[cfg(test)]
    pub(crate) fn with_strategy(
        book: Book,
        handler: Arc<dyn ProcessHandler>,
        strategy: Box<dyn Downloader>,
        cancel: CancelFlag,
        scheduler: TaskScheduler,
    ) -> Self {
        Self::assemble(book, handler, strategy, cancel, scheduler)
    }

    fn assemble(
        book: Book,
        handler: Arc<dyn ProcessHandler>,
        strategy: Box<dyn Downloader>,
        cancel: CancelFlag,
        scheduler: TaskScheduler,
    ) -> Self {
        let (done_tx, done_rx) = watch::channel(false);
        Self {
            book,
            handler,
            strategy,
            cancel,
            scheduler,
            done_tx,
            done_rx,
        }
    }

    #[must_use]
    pub fn book(&self) -> &Book {
        &self.book
    }

    #[must_use]
    pub fn handler(&self) -> Arc<dyn ProcessHandler> {
        Arc::clone(&self.handler)
    }

    /// Returns a handle that can terminate this download.
    #[must_use]
    pub fn control(&self) -> DownloadControl {
        DownloadControl {
            cancel: self.cancel.clone(),
            scheduler: self.scheduler.clone(),
            done: self.done_rx.clone(),
        }
    }

    /// Runs the full lifecycle to a terminal state.
    ///
    /// Never leaves partial output behind: on termination or failure the
    /// book directory is removed so no half-written file can be mistaken
    /// for a finished chapter.
    #[instrument(skip(self), fields(book_id = self.book.id, title = %self.book.title))]
    pub async fn run(mut self) -> Outcome {
        let result = self.run_phases().await;

        let outcome = match result {
            Ok(files) => {
                self.handler.finish();
                info!(chapters = files.len(), "download finished");
                Outcome::Finished(files)
            }
            Err(e) if e.is_terminated() => {
                info!("download terminated");
                self.tear_down().await;
                Outcome::Terminated
            }
            Err(e) => {
                error!(error = %e, "download failed");
                self.tear_down().await;
                Outcome::Failed(e)
            }
        };

        // Observers of the control handle unblock here.
        let _ = self.done_tx.send(true);
        outcome
    }

    async fn run_phases(&mut self) -> Result<Vec<ChapterFile>, DownloadError> {
        // The preparation pass counts files, not bytes.
        self.handler.init(
            Some(self.book.chapters.len() as u64),
            DownloadStatus::Preparing,
        );

        tokio::fs::create_dir_all(&self.book.dir_path)
            .await
            .map_err(|e| DownloadError::io(&self.book.dir_path, e))?;

        let total = self.strategy.prepare().await?;
        self.checkpoint()?;

        self.handler.init(total, DownloadStatus::Downloading);
        self.strategy.download().await?;
        self.checkpoint()?;

        self.handler.set_status(DownloadStatus::Finishing);
        let files = self.strategy.finish().await?;
        self.checkpoint()?;
        Ok(files)
    }

    fn checkpoint(&self) -> Result<(), DownloadError> {
        if self.cancel.is_set() {
            Err(DownloadError::Terminated)
        } else {
            Ok(())
        }
    }

    async fn tear_down(&mut self) {
        self.handler.set_status(DownloadStatus::Terminating);
        self.cancel.set();
        self.scheduler.terminate().await;
        self.strategy.terminate().await;
        if let Err(e) = tokio::fs::remove_dir_all(&self.book.dir_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.book.dir_path.display(), error = %e, "failed to remove book directory");
            }
        }
        self.handler.set_status(DownloadStatus::Terminated);
    }
}

/// Closed set of download strategies, matched in registration order.
pub struct StrategyTable {
    entries: Vec<StrategyEntry>,
}

struct StrategyEntry {
    name: &'static str,
    matches: fn(&Book) -> bool,
    build: fn(DownloadContext) -> Box<dyn Downloader>,
}

impl StrategyTable {
    /// The built-in strategies. There is no runtime registration; adding a
    /// strategy means adding it here.
    #[must_use]
    pub fn builtin() -> Self {
        Self {
            entries: vec![
                StrategyEntry {
                    name: "merged-stream",
                    matches: is_merged_stream,
                    build: |ctx| Box::new(MergedStreamDownloader::new(ctx)),
                },
                StrategyEntry {
                    name: "simple-segmented",
                    matches: is_simple_segmented,
                    build: |ctx| Box::new(SimpleSegmentedDownloader::new(ctx)),
                },
            ],
        }
    }

    /// Selects and constructs the strategy for a book.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::UnsupportedSource`] when nothing matches.
    pub fn select(&self, ctx: DownloadContext) -> Result<Box<dyn Downloader>, DownloadError> {
        for entry in &self.entries {
            if (entry.matches)(&ctx.book) {
                info!(strategy = entry.name, book_id = ctx.book.id, "strategy selected");
                return Ok((entry.build)(ctx));
            }
        }
        Err(DownloadError::unsupported_source(&ctx.book.url))
    }

    /// Name of the strategy a book would get, for diagnostics.
    #[must_use]
    pub fn match_name(&self, book: &Book) -> Option<&'static str> {
        self.entries
            .iter()
            .find(|entry| (entry.matches)(book))
            .map(|entry| entry.name)
    }
}

/// All chapters share one HLS playlist: the stream is a single continuous
/// feed that must be cut into chapters by duration.
fn is_merged_stream(book: &Book) -> bool {
    match book.chapters.split_first() {
        Some((first, rest)) => {
            is_m3u8_url(&first.file_url) && rest.iter().all(|c| c.file_url == first.file_url)
        }
        None => false,
    }
}

/// Each chapter has its own source, either a direct media URL or a
/// chapter-level playlist.
fn is_simple_segmented(book: &Book) -> bool {
    !book.chapters.is_empty() && book.chapters.iter().all(|c| !c.file_url.is_empty())
}

/// Whether a URL path points at an HLS playlist, ignoring the query.
#[must_use]
pub fn is_m3u8_url(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.ends_with(".m3u8")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::book::Chapter;
    use crate::progress::{ChannelHandler, ProgressEvent};

    fn book(chapter_urls: &[&str]) -> Book {
        Book {
            id: 1,
            title: "Test Book".into(),
            author: "Author".into(),
            url: "https://example.com/book/1".into(),
            dir_path: std::env::temp_dir().join("abdl-test-book"),
            preview: None,
            chapters: chapter_urls
                .iter()
                .enumerate()
                .map(|(i, url)| Chapter {
                    title: format!("Chapter {}", i + 1),
                    duration: 10.0,
                    file_url: (*url).to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_is_m3u8_url() {
        assert!(is_m3u8_url("https://x/stream.m3u8"));
        assert!(is_m3u8_url("https://x/stream.m3u8?token=abc"));
        assert!(!is_m3u8_url("https://x/ch1.mp3"));
    }

    #[test]
    fn test_strategy_table_picks_merged_for_shared_playlist() {
        let table = StrategyTable::builtin();
        let b = book(&["https://x/s.m3u8", "https://x/s.m3u8", "https://x/s.m3u8"]);
        assert_eq!(table.match_name(&b), Some("merged-stream"));
    }

    #[test]
    fn test_strategy_table_picks_simple_for_distinct_sources() {
        let table = StrategyTable::builtin();
        assert_eq!(
            table.match_name(&book(&["https://x/1.mp3", "https://x/2.mp3"])),
            Some("simple-segmented")
        );
        // Per-chapter playlists are still one-source-per-chapter.
        assert_eq!(
            table.match_name(&book(&["https://x/1.m3u8", "https://x/2.m3u8"])),
            Some("simple-segmented")
        );
    }

    #[test]
    fn test_strategy_table_rejects_empty_books() {
        let table = StrategyTable::builtin();
        assert_eq!(table.match_name(&book(&[])), None);
    }

    struct NoopStrategy;

    #[async_trait]
    impl Downloader for NoopStrategy {
        async fn prepare(&mut self) -> Result<Option<u64>, DownloadError> {
            Ok(Some(100))
        }
        async fn download(&mut self) -> Result<(), DownloadError> {
            Ok(())
        }
        async fn finish(&mut self) -> Result<Vec<ChapterFile>, DownloadError> {
            Ok(Vec::new())
        }
    }

    struct FailingStrategy;

    #[async_trait]
    impl Downloader for FailingStrategy {
        async fn prepare(&mut self) -> Result<Option<u64>, DownloadError> {
            Err(DownloadError::unsupported_source("nope"))
        }
        async fn download(&mut self) -> Result<(), DownloadError> {
            unreachable!()
        }
        async fn finish(&mut self) -> Result<Vec<ChapterFile>, DownloadError> {
            unreachable!()
        }
    }

    fn driver(strategy: Box<dyn Downloader>) -> (BookDownloader, tokio::sync::mpsc::UnboundedReceiver<ProgressEvent>) {
        let (handler, rx) = ChannelHandler::new();
        let downloader = BookDownloader::with_strategy(
            book(&["https://x/1.mp3"]),
            Arc::new(handler),
            strategy,
            CancelFlag::new(),
            TaskScheduler::new(2).unwrap(),
        );
        (downloader, rx)
    }

    #[tokio::test]
    async fn test_lifecycle_status_order_on_success() {
        let (downloader, mut rx) = driver(Box::new(NoopStrategy));
        let outcome = downloader.run().await;
        assert!(matches!(outcome, Outcome::Finished(_)));

        let mut statuses = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                ProgressEvent::Init { status, .. } | ProgressEvent::SetStatus { status } => {
                    statuses.push(status);
                }
                ProgressEvent::Finished => statuses.push(DownloadStatus::Finished),
                _ => {}
            }
        }
        assert_eq!(
            statuses,
            vec![
                DownloadStatus::Preparing,
                DownloadStatus::Downloading,
                DownloadStatus::Finishing,
                DownloadStatus::Finished,
            ]
        );
    }

    #[tokio::test]
    async fn test_lifecycle_failure_cleans_up_and_terminates() {
        let (downloader, mut rx) = driver(Box::new(FailingStrategy));
        let dir = downloader.book().dir_path.clone();
        let outcome = downloader.run().await;
        assert!(matches!(outcome, Outcome::Failed(_)));
        assert!(!dir.exists());

        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            if let ProgressEvent::SetStatus { status } = event {
                last = Some(status);
            }
        }
        assert_eq!(last, Some(DownloadStatus::Terminated));
    }

    #[tokio::test]
    async fn test_terminate_before_download_yields_terminated() {
        let (downloader, _rx) = driver(Box::new(NoopStrategy));
        let control = downloader.control();
        control.request_terminate();
        let outcome = downloader.run().await;
        assert!(matches!(outcome, Outcome::Terminated));
        assert!(control.is_canceled());
    }

    #[tokio::test]
    async fn test_control_terminate_waits_for_done() {
        let (downloader, _rx) = driver(Box::new(NoopStrategy));
        let control = downloader.control();
        let handle = tokio::spawn(downloader.run());
        control.terminate().await;
        let outcome = handle.await.unwrap();
        // Either the noop finished first or termination won the race; both
        // are terminal and the control handle must have returned.
        assert!(matches!(outcome, Outcome::Finished(_) | Outcome::Terminated));
    }
}
