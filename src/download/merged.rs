//! Merged-stream download strategy.
//!
//! The whole book is one continuous HLS stream; chapters exist only as
//! target durations in the descriptor. Segments are fetched concurrently
//! through the scheduler, decrypted whole when the playlist carries an
//! AES-128 key, and handed to a single merge loop over a completion
//! channel. The loop releases segments strictly in playlist order: an
//! out-of-order completion is parked in a buffer until the next expected
//! index arrives, so chapter assembly sees the stream exactly as a player
//! would.
//!
//! Chapter alignment: per-chapter accumulated duration is compared against
//! the descriptor target. Once the remaining gap drops below the tolerance
//! the chapter closes; on overshoot the final segment is split at the
//! rounded split second's proportional byte offset, the head closing the
//! chapter and the tail seeding the next one with its residual duration.
//! The last chapter absorbs whatever the stream still holds and never
//! overshoots end-of-stream.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};
use url::Url;

use super::crypto::DecryptionContext;
use super::downloader::{DownloadContext, Downloader};
use super::playlist::{PlaylistInfo, parse_media_playlist};
use super::transfer::TransferUnit;
use super::TransferError;
use super::{DownloadError, PlaylistError};
use crate::book::{ChapterFile, file_sha256};
use crate::media::{TrackMeta, convert_ts_to_mp3, merge_ts_parts, probe_duration, split_ts};

/// One in-order segment delivered to the merge loop.
struct CompletedSegment {
    data: Vec<u8>,
    duration: f64,
}

/// A chapter closed by the assembler, ready for background conversion.
struct ClosedChapter {
    index: usize,
    title: String,
    parts: Vec<Vec<u8>>,
}

/// Pure chapter-boundary bookkeeping, separated from IO for testability.
struct ChapterAssembler {
    /// Target duration per chapter, in playback order.
    targets: Vec<(String, f64)>,
    tolerance: f64,
    chapter: usize,
    accumulated: f64,
    parts: Vec<Vec<u8>>,
}

impl ChapterAssembler {
    fn new(targets: Vec<(String, f64)>, tolerance: f64) -> Self {
        Self {
            targets,
            tolerance,
            chapter: 0,
            accumulated: 0.0,
            parts: Vec::new(),
        }
    }

    fn is_last_chapter(&self) -> bool {
        self.chapter + 1 >= self.targets.len()
    }

    /// Feeds the next in-order segment; returns any chapters it closed.
    ///
    /// A single long segment can close several chapters, so the split
    /// repeats on the residual until the remainder fits.
    fn push(&mut self, mut data: Vec<u8>, mut duration: f64) -> Vec<ClosedChapter> {
        let mut closed = Vec::new();

        loop {
            // The last chapter takes everything up to end-of-stream.
            if self.is_last_chapter() {
                self.accumulated += duration;
                self.parts.push(data);
                return closed;
            }

            let target = self.targets[self.chapter].1;
            let reached = self.accumulated + duration;
            if reached + self.tolerance < target {
                self.accumulated = reached;
                self.parts.push(data);
                return closed;
            }

            // Chapter boundary falls inside (or at the edge of) this
            // segment. Split at the rounded remaining-gap second. A
            // sub-second tail is not worth a physical split; the chapter
            // keeps the whole segment instead.
            let split_secs = (target - self.accumulated).round();
            if split_secs >= duration || duration - split_secs < 1.0 {
                self.parts.push(data);
                closed.push(self.close_chapter());
                return closed;
            }

            let (head, tail) = split_ts(&data, duration, split_secs);
            if !head.is_empty() {
                self.parts.push(head);
            }
            closed.push(self.close_chapter());

            // The tail seeds the next chapter with its residual duration.
            data = tail;
            duration -= split_secs;
            if data.is_empty() {
                return closed;
            }
        }
    }

    fn close_chapter(&mut self) -> ClosedChapter {
        let (title, _) = self.targets[self.chapter].clone();
        let chapter = ClosedChapter {
            index: self.chapter,
            title,
            parts: std::mem::take(&mut self.parts),
        };
        self.chapter += 1;
        self.accumulated = 0.0;
        chapter
    }

    /// Closes the trailing chapter once the stream has ended.
    fn finalize(&mut self) -> Option<ClosedChapter> {
        if self.parts.is_empty() || self.chapter >= self.targets.len() {
            return None;
        }
        Some(self.close_chapter())
    }
}

/// Writes closed chapters to disk and converts them off the async path.
#[derive(Clone)]
struct ChapterSink {
    dir: PathBuf,
    artist: String,
    album: String,
    transcode: bool,
}

impl ChapterSink {
    fn spawn(
        &self,
        chapter: ClosedChapter,
        file_name: String,
    ) -> JoinHandle<Result<ChapterFile, DownloadError>> {
        let sink = self.clone();
        tokio::spawn(async move {
            let ts_path = sink.dir.join(format!(".{:02}.part.ts", chapter.index + 1));
            let final_path = sink.dir.join(&file_name);

            merge_ts_parts(&chapter.parts, &ts_path).await?;

            if sink.transcode {
                let meta = TrackMeta {
                    title: chapter.title,
                    artist: sink.artist,
                    album: sink.album,
                    track: chapter.index as u32 + 1,
                };
                convert_ts_to_mp3(&ts_path, &final_path, &meta).await?;
                if let Err(e) = tokio::fs::remove_file(&ts_path).await {
                    warn!(path = %ts_path.display(), error = %e, "failed to remove intermediate file");
                }
            } else {
                tokio::fs::rename(&ts_path, &final_path)
                    .await
                    .map_err(|e| DownloadError::io(&final_path, e))?;
            }

            let sha256 = file_sha256(&final_path)
                .await
                .map_err(|e| DownloadError::io(&final_path, e))?;
            debug!(path = %final_path.display(), "chapter written");
            Ok(ChapterFile {
                path: final_path,
                sha256,
            })
        })
    }
}

pub struct MergedStreamDownloader {
    ctx: DownloadContext,
    playlist: Option<PlaylistInfo>,
    decryption: Option<Arc<DecryptionContext>>,
    assembler: Option<ChapterAssembler>,
    conversions: Vec<JoinHandle<Result<ChapterFile, DownloadError>>>,
    errors: Arc<Mutex<Vec<DownloadError>>>,
}

impl MergedStreamDownloader {
    #[must_use]
    pub fn new(ctx: DownloadContext) -> Self {
        Self {
            ctx,
            playlist: None,
            decryption: None,
            assembler: None,
            conversions: Vec::new(),
            errors: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn sink(&self) -> ChapterSink {
        ChapterSink {
            dir: self.ctx.book.dir_path.clone(),
            artist: self.ctx.book.author.clone(),
            album: self.ctx.book.title.clone(),
            transcode: self.ctx.config.transcode,
        }
    }

    /// Advertised duration 0 means the playlist author didn't bother;
    /// measure the real thing so alignment doesn't drift.
    async fn effective_duration(&self, index: usize, data: &[u8], advertised: f64) -> f64 {
        if advertised > 0.0 {
            return advertised;
        }
        let probe_path = self.ctx.book.dir_path.join(format!(".probe{index}.ts"));
        let measured = async {
            tokio::fs::write(&probe_path, data).await.ok()?;
            let duration = probe_duration(&probe_path).await.ok();
            let _ = tokio::fs::remove_file(&probe_path).await;
            duration
        }
        .await;
        match measured {
            Some(duration) => duration,
            None => {
                warn!(segment = index, "segment advertises no duration and probing failed");
                0.0
            }
        }
    }

    fn take_first_error(&self) -> Option<DownloadError> {
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
impl Downloader for MergedStreamDownloader {
    #[instrument(skip(self), fields(book_id = self.ctx.book.id))]
    async fn prepare(&mut self) -> Result<Option<u64>, DownloadError> {
        let source = &self.ctx.book.chapters[0].file_url;
        let playlist_url = Url::parse(source)
            .map_err(|_| TransferError::invalid_url(source))
            .map_err(DownloadError::from)?;
        let body = self.ctx.fetcher.get_body(playlist_url.as_str()).await?;
        let info = parse_media_playlist(&playlist_url, &body)?;

        if let Some(key) = info.segments.iter().find_map(|s| s.key.as_ref()) {
            self.decryption = Some(Arc::new(DecryptionContext::new(
                key.url.clone(),
                info.media_sequence,
            )));
        }

        let stream_duration = info.total_duration();
        let targets: Vec<(String, f64)> = self
            .ctx
            .book
            .chapters
            .iter()
            .map(|c| (c.title.clone(), c.duration))
            .collect();
        let target_sum: f64 = targets.iter().map(|t| t.1).sum();
        if (stream_duration - target_sum).abs() > stream_duration.max(1.0) * 0.05 {
            warn!(
                stream_duration,
                target_sum, "stream and chapter durations disagree noticeably"
            );
        }

        self.assembler = Some(ChapterAssembler::new(
            targets,
            self.ctx.config.split_tolerance_secs,
        ));
        debug!(segments = info.segments.len(), "playlist resolved");
        self.playlist = Some(info);

        // Preparation progress counts chapters, like every strategy.
        self.ctx
            .handler
            .progress(self.ctx.book.chapters.len() as u64);

        // Byte total is unknown for a merged stream; it grows as segments
        // complete.
        Ok(None)
    }

    async fn download(&mut self) -> Result<(), DownloadError> {
        let playlist = self
            .playlist
            .take()
            .ok_or(DownloadError::Terminated)?;
        let mut assembler = self
            .assembler
            .take()
            .ok_or(DownloadError::Terminated)?;
        let sink = self.sink();

        let (tx, mut rx) = mpsc::unbounded_channel::<(usize, CompletedSegment)>();

        let fetcher = self.ctx.fetcher.clone();
        let cancel = self.ctx.cancel.clone();
        let handler = Arc::clone(&self.ctx.handler);
        let errors = Arc::clone(&self.errors);
        let decryption = self.decryption.clone();

        let jobs = playlist.segments.into_iter().map(move |segment| {
            let fetcher = fetcher.clone();
            let cancel = cancel.clone();
            let handler = Arc::clone(&handler);
            let errors = Arc::clone(&errors);
            let decryption = decryption.clone();
            let tx = tx.clone();
            async move {
                let mut unit = TransferUnit::new(
                    segment.index,
                    format!("segment {}", segment.index),
                    segment.url.as_str(),
                )
                .with_duration(segment.duration);
                if let Some(range) = segment.byte_range {
                    unit = unit.with_ranges(vec![range]);
                }

                let fetched = match (&segment.key, &decryption) {
                    (Some(key), Some(ctx)) => {
                        ctx.fetch_segment(&fetcher, &mut unit, key.iv, &cancel).await
                    }
                    (Some(_), None) => Err(PlaylistError::parse(
                        segment.url.as_str(),
                        "encrypted segment without playlist key context",
                    )
                    .into()),
                    (None, _) => fetcher
                        .fetch_bytes(&mut unit, &cancel)
                        .await
                        .map_err(DownloadError::from),
                };

                match fetched {
                    Ok(Some(data)) => {
                        handler.grow_total(data.len() as u64);
                        handler.progress(data.len() as u64);
                        let completed = CompletedSegment {
                            data,
                            duration: segment.duration,
                        };
                        // A closed channel means the merge loop bailed on a
                        // conversion error; fetching more is pointless but
                        // harmless, so just drop the segment.
                        let _ = tx.send((segment.index, completed));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        let mut guard = match errors.lock() {
                            Ok(guard) => guard,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                        guard.push(e);
                    }
                }
            }
        });

        // The merge loop is the only consumer, serializing chapter
        // assembly while fetches stay parallel.
        let mut conversions = Vec::new();
        let merge_loop = async {
            let mut pending: BTreeMap<usize, CompletedSegment> = BTreeMap::new();
            let mut next_index = 0usize;
            while let Some((index, segment)) = rx.recv().await {
                pending.insert(index, segment);
                while let Some(segment) = pending.remove(&next_index) {
                    let duration = self
                        .effective_duration(next_index, &segment.data, segment.duration)
                        .await;
                    for chapter in assembler.push(segment.data, duration) {
                        let name = self.ctx.book.chapter_file_name(chapter.index, ".mp3");
                        conversions.push(sink.spawn(chapter, name));
                    }
                    next_index += 1;
                }
            }
        };

        // `jobs` owns the last tx clone; when the scheduler finishes the
        // iterator drops and the channel closes, ending the merge loop.
        tokio::join!(self.ctx.scheduler.run(jobs), merge_loop);

        self.assembler = Some(assembler);
        self.conversions.append(&mut conversions);

        if self.ctx.cancel.is_set() {
            return Err(DownloadError::Terminated);
        }
        match self.take_first_error() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn finish(&mut self) -> Result<Vec<ChapterFile>, DownloadError> {
        if let Some(assembler) = self.assembler.as_mut() {
            if let Some(chapter) = assembler.finalize() {
                let name = self.ctx.book.chapter_file_name(chapter.index, ".mp3");
                let handle = self.sink().spawn(chapter, name);
                self.conversions.push(handle);
            }
        }

        let mut files = Vec::with_capacity(self.conversions.len());
        for handle in self.conversions.drain(..) {
            match handle.await {
                Ok(result) => files.push(result?),
                Err(e) => {
                    return Err(DownloadError::io(
                        &self.ctx.book.dir_path,
                        std::io::Error::other(e),
                    ));
                }
            }
        }
        // Conversions were spawned in chapter order and awaited in order,
        // so `files` already matches the stream. A lexicographic sort
        // would misplace chapter 100 before 99.
        Ok(files)
    }

    async fn terminate(&mut self) {
        for handle in self.conversions.drain(..) {
            handle.abort();
            let _ = handle.await;
        }
    }
}
