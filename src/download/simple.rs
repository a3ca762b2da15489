//! One-source-per-chapter download strategy.
//!
//! Covers books whose chapters are plain media URLs, and sources that wrap
//! each chapter in its own small playlist. A chapter playlist whose
//! segments are byte ranges of one remote file collapses into a single
//! ranged [`TransferUnit`]; a multi-URI playlist becomes a sequence of
//! units appended into the same chapter file.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, instrument};
use url::Url;

use super::downloader::{DownloadContext, Downloader, is_m3u8_url};
use super::playlist::parse_media_playlist;
use super::transfer::{FetchOutcome, TransferUnit, discard_partial};
use super::{DownloadError, PlaylistError, TransferError};
use crate::book::{ChapterFile, file_sha256};

/// One chapter's fetch plan.
struct ChapterJob {
    units: Vec<TransferUnit>,
    path: PathBuf,
}

pub struct SimpleSegmentedDownloader {
    ctx: DownloadContext,
    jobs: Vec<ChapterJob>,
    paths: Vec<PathBuf>,
    errors: Arc<Mutex<Vec<DownloadError>>>,
}

impl SimpleSegmentedDownloader {
    #[must_use]
    pub fn new(ctx: DownloadContext) -> Self {
        Self {
            ctx,
            jobs: Vec::new(),
            paths: Vec::new(),
            errors: Arc::new(Mutex::new(Vec::new())),
        }
    }

    async fn resolve_chapter(&self, index: usize) -> Result<ChapterJob, DownloadError> {
        let chapter = &self.ctx.book.chapters[index];
        let name = self.ctx.book.chapter_file_name(index, ".mp3");
        let path = self.ctx.book.dir_path.join(&name);

        if !is_m3u8_url(&chapter.file_url) {
            let unit = TransferUnit::new(index, name, &chapter.file_url)
                .with_duration(chapter.duration);
            return Ok(ChapterJob {
                units: vec![unit],
                path,
            });
        }

        let playlist_url = Url::parse(&chapter.file_url)
            .map_err(|_| TransferError::invalid_url(&chapter.file_url))
            .map_err(DownloadError::from)?;
        let body = self.ctx.fetcher.get_body(playlist_url.as_str()).await?;
        let info = parse_media_playlist(&playlist_url, &body)?;

        if info.segments.iter().any(|s| s.key.is_some()) {
            // Per-chapter playlists from supported sources are cleartext;
            // encrypted ones belong to the merged-stream path.
            return Err(PlaylistError::UnsupportedMethod {
                url: playlist_url.to_string(),
                method: "AES-128".to_string(),
            }
            .into());
        }

        let units = if info.is_single_file() {
            let ranges = info
                .segments
                .iter()
                .filter_map(|s| s.byte_range)
                .collect::<Vec<_>>();
            let unit = TransferUnit::new(index, name, info.segments[0].url.as_str())
                .with_duration(chapter.duration)
                .with_ranges(ranges);
            vec![unit]
        } else {
            info.segments
                .iter()
                .map(|segment| {
                    let mut unit =
                        TransferUnit::new(index, name.clone(), segment.url.as_str())
                            .with_duration(segment.duration);
                    if let Some(range) = segment.byte_range {
                        unit = unit.with_ranges(vec![range]);
                    }
                    unit
                })
                .collect()
        };

        debug!(chapter = index, units = units.len(), "chapter plan resolved");
        Ok(ChapterJob { units, path })
    }

    fn first_error(&self) -> Option<DownloadError> {
        let mut errors = match self.errors.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if errors.is_empty() {
            None
        } else {
            Some(errors.remove(0))
        }
    }
}

#[async_trait]
impl Downloader for SimpleSegmentedDownloader {
    #[instrument(skip(self), fields(book_id = self.ctx.book.id))]
    async fn prepare(&mut self) -> Result<Option<u64>, DownloadError> {
        let chapter_count = self.ctx.book.chapters.len();
        let mut jobs = Vec::with_capacity(chapter_count);
        for index in 0..chapter_count {
            if self.ctx.cancel.is_set() {
                return Err(DownloadError::Terminated);
            }
            jobs.push(self.resolve_chapter(index).await?);
            // Preparation progress counts resolved chapters.
            self.ctx.handler.progress(1);
        }

        // Total bytes are reported only when every unit's size is known;
        // a partial sum would make the progress bar lie.
        let mut total: u64 = 0;
        let mut complete = true;
        for job in &jobs {
            for unit in &job.units {
                match self.ctx.fetcher.resolve_size(unit).await {
                    Some(size) => total += size,
                    None => complete = false,
                }
            }
        }

        self.paths = jobs.iter().map(|j| j.path.clone()).collect();
        self.jobs = jobs;
        Ok(complete.then_some(total))
    }

    async fn download(&mut self) -> Result<(), DownloadError> {
        let jobs = std::mem::take(&mut self.jobs);
        let fetcher = self.ctx.fetcher.clone();
        let cancel = self.ctx.cancel.clone();
        let handler = Arc::clone(&self.ctx.handler);
        let errors = Arc::clone(&self.errors);

        let tasks = jobs.into_iter().map(move |mut job| {
            let fetcher = fetcher.clone();
            let cancel = cancel.clone();
            let handler = Arc::clone(&handler);
            let errors = Arc::clone(&errors);
            async move {
                let mut file = match tokio::fs::File::create(&job.path).await {
                    Ok(file) => file,
                    Err(e) => {
                        push_error(&errors, DownloadError::io(&job.path, e));
                        return;
                    }
                };

                for unit in &mut job.units {
                    if cancel.is_set() {
                        discard_partial(&job.path).await;
                        return;
                    }
                    let progress = |delta: u64| handler.progress(delta);
                    match fetcher.fetch(unit, &mut file, &cancel, progress).await {
                        Ok(FetchOutcome::Completed { .. }) => {}
                        Ok(FetchOutcome::Canceled) => {
                            discard_partial(&job.path).await;
                            return;
                        }
                        Err(e) => {
                            discard_partial(&job.path).await;
                            push_error(&errors, e.into());
                            return;
                        }
                    }
                }
            }
        });

        self.ctx.scheduler.run(tasks).await;

        if self.ctx.cancel.is_set() {
            return Err(DownloadError::Terminated);
        }
        match self.first_error() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn finish(&mut self) -> Result<Vec<ChapterFile>, DownloadError> {
        let mut files = Vec::with_capacity(self.paths.len());
        for path in &self.paths {
            let sha256 = file_sha256(path)
                .await
                .map_err(|e| DownloadError::io(path, e))?;
            files.push(ChapterFile {
                path: path.clone(),
                sha256,
            });
        }
        Ok(files)
    }
}

fn push_error(errors: &Arc<Mutex<Vec<DownloadError>>>, error: DownloadError) {
    let mut guard = match errors.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    guard.push(error);
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::book::{Book, Chapter};
    use crate::config::EngineConfig;
    use crate::download::transfer::{CancelFlag, HttpFetcher};
    use crate::progress::{ChannelHandler, DownloadStatus, ProcessHandler};
    use crate::scheduler::TaskScheduler;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn context(book: Book) -> (DownloadContext, Arc<ChannelHandler>) {
        let (handler, _rx) = ChannelHandler::new();
        let handler = Arc::new(handler);
        let config = EngineConfig::default();
        (
            DownloadContext {
                book,
                fetcher: HttpFetcher::new(&config).unwrap(),
                config,
                scheduler: TaskScheduler::new(2).unwrap(),
                cancel: CancelFlag::new(),
                handler: Arc::clone(&handler) as Arc<dyn ProcessHandler>,
            },
            handler,
        )
    }

    fn direct_book(server_uri: &str, dir: &std::path::Path, titles: &[&str]) -> Book {
        Book {
            id: 9,
            title: "Direct".into(),
            author: "A".into(),
            url: format!("{server_uri}/book"),
            dir_path: dir.to_path_buf(),
            preview: None,
            chapters: titles
                .iter()
                .enumerate()
                .map(|(i, t)| Chapter {
                    title: (*t).to_string(),
                    duration: 10.0,
                    file_url: format!("{server_uri}/ch{i}.mp3"),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_direct_chapters_download_and_hash() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ch0.mp3"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 300]))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/ch1.mp3"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![2u8; 500]))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(405))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let book = direct_book(&server.uri(), dir.path(), &["One", "Two"]);
        let (ctx, handler) = context(book);
        let mut strategy = SimpleSegmentedDownloader::new(ctx);

        // HEAD is rejected, so the total stays unknown.
        assert_eq!(strategy.prepare().await.unwrap(), None);
        strategy.download().await.unwrap();
        let files = strategy.finish().await.unwrap();

        assert_eq!(files.len(), 2);
        assert!(files[0].path.ends_with("01. One.mp3"));
        assert!(files[1].path.ends_with("02. Two.mp3"));
        assert_eq!(
            tokio::fs::read(&files[0].path).await.unwrap(),
            vec![1u8; 300]
        );
        assert_eq!(files[0].sha256.len(), 64);
        // Lifecycle status is the driver's job; the strategy only reports
        // progress.
        assert_eq!(handler.snapshot().status, DownloadStatus::Waiting);
    }

    #[tokio::test]
    async fn test_chapter_playlist_collapses_to_ranged_unit() {
        let server = MockServer::start().await;
        let playlist = format!(
            "#EXTM3U\n#EXT-X-VERSION:4\n#EXT-X-TARGETDURATION:6\n\
             #EXTINF:5.0,\n#EXT-X-BYTERANGE:100@0\n{0}/all.bin\n\
             #EXTINF:5.0,\n#EXT-X-BYTERANGE:150\n{0}/all.bin\n\
             #EXT-X-ENDLIST\n",
            server.uri()
        );
        Mock::given(method("GET"))
            .and(path("/ch.m3u8"))
            .respond_with(ResponseTemplate::new(200).set_body_string(playlist))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut book = direct_book(&server.uri(), dir.path(), &["One"]);
        book.chapters[0].file_url = format!("{}/ch.m3u8", server.uri());
        let (ctx, _handler) = context(book);
        let mut strategy = SimpleSegmentedDownloader::new(ctx);

        // Range sizes are summed, so the total is known without HEAD.
        assert_eq!(strategy.prepare().await.unwrap(), Some(250));
        assert_eq!(strategy.jobs.len(), 1);
        assert_eq!(strategy.jobs[0].units.len(), 1);
        assert_eq!(strategy.jobs[0].units[0].state.ranges.len(), 2);
    }

    #[tokio::test]
    async fn test_encrypted_chapter_playlist_rejected() {
        let server = MockServer::start().await;
        let playlist = "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:6\n\
             #EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\"\n\
             #EXTINF:5.0,\nseg0.ts\n#EXT-X-ENDLIST\n";
        Mock::given(method("GET"))
            .and(path("/ch.m3u8"))
            .respond_with(ResponseTemplate::new(200).set_body_string(playlist))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut book = direct_book(&server.uri(), dir.path(), &["One"]);
        book.chapters[0].file_url = format!("{}/ch.m3u8", server.uri());
        let (ctx, _handler) = context(book);
        let mut strategy = SimpleSegmentedDownloader::new(ctx);

        let err = strategy.prepare().await.unwrap_err();
        assert!(matches!(
            err,
            DownloadError::Playlist(PlaylistError::UnsupportedMethod { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_chapter_surfaces_error_and_removes_partial() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ch0.mp3"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(405))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let book = direct_book(&server.uri(), dir.path(), &["One"]);
        let (ctx, _handler) = context(book);
        let mut strategy = SimpleSegmentedDownloader::new(ctx);
        strategy.prepare().await.unwrap();
        let err = strategy.download().await.unwrap_err();
        assert!(matches!(
            err,
            DownloadError::Transfer(TransferError::HttpStatus { status: 404, .. })
        ));
        assert!(!dir.path().join("01. One.mp3").exists());
    }
}
