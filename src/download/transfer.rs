//! Transfer units and the chunked HTTP fetcher.
//!
//! A [`TransferUnit`] is one downloadable piece of a book (a chapter file or
//! a stream segment), owned by exactly one downloader. [`HttpFetcher`] wraps
//! the shared `reqwest` client with the timeouts, retry policy, and chunked
//! streaming every strategy uses. Progress callbacks receive per-chunk byte
//! deltas, never cumulative totals.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::RANGE;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tracing::{debug, instrument, warn};

use super::retry::RetryPolicy;
use super::{DownloadError, TransferError};
use crate::config::EngineConfig;

/// Stream buffer granularity (64 KiB).
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Cooperative cancellation flag shared between a downloader and its tasks.
///
/// Setting the flag never interrupts a write in progress; fetch loops check
/// it between chunks, so a canceled fetch stops at a chunk boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A half-open byte range `[start, end)` within a remote file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    #[must_use]
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Length of the range in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// HTTP Range header value (inclusive end, per RFC 9110).
    #[must_use]
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end.saturating_sub(1))
    }
}

/// Mutable transfer bookkeeping: byte ranges, the range cursor, and any
/// extra request headers the source requires.
#[derive(Debug, Clone, Default)]
pub struct TransferState {
    /// Byte ranges to fetch in order; empty means the whole resource.
    pub ranges: Vec<ByteRange>,
    /// Index of the next range to fetch.
    pub cursor: usize,
    /// Extra request headers (name, value).
    pub headers: Vec<(String, String)>,
}

/// One downloadable piece of a book.
#[derive(Debug, Clone)]
pub struct TransferUnit {
    /// Position of this unit within the book (segment or chapter index).
    pub index: usize,
    /// Output name, derived from the chapter title for chapter units.
    pub name: String,
    /// Source URL.
    pub url: String,
    /// Advertised duration in seconds, when the source declares one.
    pub duration: Option<f64>,
    /// Advertised size in bytes, when known up front.
    pub size: Option<u64>,
    /// Range/cursor/header state.
    pub state: TransferState,
}

impl TransferUnit {
    #[must_use]
    pub fn new(index: usize, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            url: url.into(),
            duration: None,
            size: None,
            state: TransferState::default(),
        }
    }

    #[must_use]
    pub fn with_duration(mut self, duration: f64) -> Self {
        self.duration = Some(duration);
        self
    }

    #[must_use]
    pub fn with_ranges(mut self, ranges: Vec<ByteRange>) -> Self {
        self.size = Some(ranges.iter().map(ByteRange::len).sum());
        self.state.ranges = ranges;
        self
    }
}

/// Result of a fetch that may have been canceled mid-flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The transfer ran to completion.
    Completed {
        /// Total bytes written to the sink.
        bytes: u64,
    },
    /// The cancel flag was observed; the sink holds a partial prefix.
    Canceled,
}

/// Shared HTTP fetcher: one per downloader, cloned into fetch tasks.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    fetch_timeout: Duration,
    retry: RetryPolicy,
}

impl HttpFetcher {
    /// Builds the fetcher from engine configuration.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Client`] if the underlying client cannot be
    /// constructed.
    pub fn new(config: &EngineConfig) -> Result<Self, TransferError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.read_timeout_secs))
            .build()
            .map_err(|source| TransferError::Client { source })?;
        Ok(Self {
            client,
            fetch_timeout: Duration::from_secs(config.read_timeout_secs),
            retry: RetryPolicy::default(),
        })
    }

    /// Replaces the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Fetches a unit into `sink`, streaming chunk by chunk.
    ///
    /// When the unit has byte ranges, each range is requested with a Range
    /// header and the cursor advances as ranges complete, so a unit that
    /// spans multiple ranges needs exactly one `fetch` call. `on_chunk`
    /// receives each chunk's length. Transient request failures are retried
    /// with backoff as long as the current range has not produced output
    /// yet; a failure mid-body is not retried because the sink already holds
    /// a prefix.
    ///
    /// On error or cancellation the partial output is left in the sink for
    /// the caller to discard.
    ///
    /// # Errors
    ///
    /// Returns a [`TransferError`] describing the failed request or write.
    #[instrument(level = "debug", skip(self, unit, sink, cancel, on_chunk), fields(url = %unit.url, index = unit.index))]
    pub async fn fetch<W, F>(
        &self,
        unit: &mut TransferUnit,
        sink: &mut W,
        cancel: &CancelFlag,
        mut on_chunk: F,
    ) -> Result<FetchOutcome, TransferError>
    where
        W: AsyncWrite + Unpin + Send,
        F: FnMut(u64) + Send,
    {
        let mut writer = BufWriter::with_capacity(CHUNK_SIZE, sink);
        let mut total: u64 = 0;

        loop {
            let range = if unit.state.ranges.is_empty() {
                if unit.state.cursor > 0 {
                    break;
                }
                None
            } else {
                match unit.state.ranges.get(unit.state.cursor) {
                    Some(range) => Some(*range),
                    None => break,
                }
            };

            match self
                .stream_range(unit, range, &mut writer, cancel, &mut on_chunk)
                .await?
            {
                RangeOutcome::Canceled => {
                    flush_sink(&mut writer, &unit.name).await?;
                    return Ok(FetchOutcome::Canceled);
                }
                RangeOutcome::Done(bytes) => {
                    total += bytes;
                    unit.state.cursor += 1;
                }
            }

            if unit.state.ranges.is_empty() {
                break;
            }
        }

        flush_sink(&mut writer, &unit.name).await?;
        debug!(bytes = total, "transfer complete");
        Ok(FetchOutcome::Completed { bytes: total })
    }

    /// Fetches a unit fully into memory. Used for playlists, keys, and
    /// stream segments that must be decrypted as a whole.
    ///
    /// # Errors
    ///
    /// Returns a [`TransferError`] when the fetch fails after retries.
    pub async fn fetch_bytes(
        &self,
        unit: &mut TransferUnit,
        cancel: &CancelFlag,
    ) -> Result<Option<Vec<u8>>, TransferError> {
        let mut buf = Vec::new();
        match self.fetch(unit, &mut buf, cancel, |_| {}).await? {
            FetchOutcome::Completed { .. } => Ok(Some(buf)),
            FetchOutcome::Canceled => Ok(None),
        }
    }

    /// Convenience wrapper: fetch a URL's whole body into memory.
    ///
    /// # Errors
    ///
    /// Returns a [`TransferError`] when the fetch fails after retries.
    pub async fn get_body(&self, url: &str) -> Result<Vec<u8>, TransferError> {
        let mut unit = TransferUnit::new(0, url.to_string(), url);
        match self.fetch_bytes(&mut unit, &CancelFlag::new()).await? {
            Some(body) => Ok(body),
            // The flag above is never set.
            None => Err(TransferError::truncated(url, 0, 0)),
        }
    }

    /// Resolves a unit's total size without downloading it.
    ///
    /// Units with byte ranges already know their size; everything else is
    /// probed with a HEAD request. A source that refuses HEAD yields `None`
    /// and the caller reports an unknown total.
    pub async fn resolve_size(&self, unit: &TransferUnit) -> Option<u64> {
        if let Some(size) = unit.size {
            return Some(size);
        }
        let response = match self.client.head(&unit.url).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                debug!(url = %unit.url, status = response.status().as_u16(), "HEAD rejected");
                return None;
            }
            Err(e) => {
                debug!(url = %unit.url, error = %e, "HEAD failed");
                return None;
            }
        };
        response.content_length()
    }

    async fn stream_range<W, F>(
        &self,
        unit: &TransferUnit,
        range: Option<ByteRange>,
        writer: &mut BufWriter<&mut W>,
        cancel: &CancelFlag,
        on_chunk: &mut F,
    ) -> Result<RangeOutcome, TransferError>
    where
        W: AsyncWrite + Unpin + Send,
        F: FnMut(u64) + Send,
    {
        let mut attempt: u32 = 1;
        loop {
            if cancel.is_set() {
                return Ok(RangeOutcome::Canceled);
            }

            match self.stream_once(unit, range, writer, cancel, on_chunk).await {
                Ok(outcome) => return Ok(outcome),
                Err((error, bytes_written)) => {
                    // A partial prefix is already in the sink; restarting the
                    // request would duplicate bytes.
                    if bytes_written > 0 {
                        return Err(error);
                    }
                    match self.retry.backoff(&error, attempt) {
                        Some(delay) => {
                            warn!(url = %unit.url, attempt, error = %error, "transfer failed, retrying");
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                        }
                        None => {
                            debug!(url = %unit.url, "giving up");
                            return Err(error);
                        }
                    }
                }
            }
        }
    }

    async fn stream_once<W, F>(
        &self,
        unit: &TransferUnit,
        range: Option<ByteRange>,
        writer: &mut BufWriter<&mut W>,
        cancel: &CancelFlag,
        on_chunk: &mut F,
    ) -> Result<RangeOutcome, (TransferError, u64)>
    where
        W: AsyncWrite + Unpin + Send,
        F: FnMut(u64) + Send,
    {
        let url = &unit.url;
        let mut request = self.client.get(url);
        for (name, value) in &unit.state.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(range) = range {
            request = request.header(RANGE, range.header_value());
        }

        let response = request.send().await.map_err(|e| {
            let error = if e.is_timeout() {
                TransferError::timeout(url)
            } else {
                TransferError::network(url, e)
            };
            (error, 0)
        })?;

        if !response.status().is_success() {
            return Err((
                TransferError::http_status(url, response.status().as_u16()),
                0,
            ));
        }

        let expected = match range {
            Some(range) => Some(range.len()),
            None => response.content_length(),
        };

        // Written count lives outside the timed future so the timeout arm
        // can tell a clean restart from a poisoned partial prefix.
        let written = std::sync::atomic::AtomicU64::new(0);
        let stream_body = async {
            let mut stream = response.bytes_stream();
            let mut bytes_written: u64 = 0;

            while let Some(chunk_result) = stream.next().await {
                let chunk = chunk_result.map_err(|e| {
                    let error = if e.is_timeout() {
                        TransferError::timeout(url)
                    } else {
                        TransferError::network(url, e)
                    };
                    (error, bytes_written)
                })?;

                writer
                    .write_all(&chunk)
                    .await
                    .map_err(|e| (TransferError::io(Path::new(&unit.name), e), bytes_written))?;

                bytes_written += chunk.len() as u64;
                written.store(bytes_written, Ordering::Relaxed);
                on_chunk(chunk.len() as u64);

                if cancel.is_set() {
                    return Ok(RangeOutcome::Canceled);
                }
            }

            if let Some(expected) = expected {
                if bytes_written < expected {
                    return Err((
                        TransferError::truncated(url, expected, bytes_written),
                        bytes_written,
                    ));
                }
            }

            Ok(RangeOutcome::Done(bytes_written))
        };

        // The per-fetch timeout covers the whole body, not just connect.
        match tokio::time::timeout(self.fetch_timeout, stream_body).await {
            Ok(result) => result,
            Err(_) => Err((TransferError::timeout(url), written.load(Ordering::Relaxed))),
        }
    }
}

enum RangeOutcome {
    Done(u64),
    Canceled,
}

async fn flush_sink<W>(
    writer: &mut BufWriter<&mut W>,
    name: &str,
) -> Result<(), TransferError>
where
    W: AsyncWrite + Unpin + Send,
{
    writer
        .flush()
        .await
        .map_err(|e| TransferError::io(Path::new(name), e))
}

/// Removes a partially written file, logging instead of failing.
pub async fn discard_partial(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove partial file");
        }
    }
}

/// Maps a termination-aware fetch outcome into the download error space.
///
/// # Errors
///
/// Returns [`DownloadError::Terminated`] for a canceled fetch.
pub fn require_completed(outcome: FetchOutcome) -> Result<u64, DownloadError> {
    match outcome {
        FetchOutcome::Completed { bytes } => Ok(bytes),
        FetchOutcome::Canceled => Err(DownloadError::Terminated),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_byte_range_len_and_header() {
        let range = ByteRange::new(100, 300);
        assert_eq!(range.len(), 200);
        assert_eq!(range.header_value(), "bytes=100-299");
        assert!(!range.is_empty());
        assert!(ByteRange::new(5, 5).is_empty());
    }

    #[test]
    fn test_transfer_unit_with_ranges_sums_size() {
        let unit = TransferUnit::new(0, "ch", "http://x/file.mp3")
            .with_ranges(vec![ByteRange::new(0, 100), ByteRange::new(100, 250)]);
        assert_eq!(unit.size, Some(250));
        assert_eq!(unit.state.cursor, 0);
    }

    #[test]
    fn test_cancel_flag_is_sticky() {
        let flag = CancelFlag::new();
        assert!(!flag.is_set());
        flag.set();
        assert!(flag.is_set());
        let clone = flag.clone();
        assert!(clone.is_set());
    }

    #[tokio::test]
    async fn test_fetch_whole_body_reports_chunk_deltas() {
        let server = MockServer::start().await;
        let body = vec![7u8; 1000];
        Mock::given(method("GET"))
            .and(path("/seg0.ts"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(&EngineConfig::default()).unwrap();
        let mut unit = TransferUnit::new(0, "seg0", format!("{}/seg0.ts", server.uri()));
        let mut out = Vec::new();
        let mut delta_sum = 0u64;
        let outcome = fetcher
            .fetch(&mut unit, &mut out, &CancelFlag::new(), |d| delta_sum += d)
            .await
            .unwrap();

        assert_eq!(outcome, FetchOutcome::Completed { bytes: 1000 });
        assert_eq!(out, body);
        assert_eq!(delta_sum, 1000);
    }

    #[tokio::test]
    async fn test_fetch_advances_range_cursor_automatically() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file.bin"))
            .and(header("Range", "bytes=0-3"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(b"aaaa".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/file.bin"))
            .and(header("Range", "bytes=4-9"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(b"bbbbbb".to_vec()))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(&EngineConfig::default()).unwrap();
        let mut unit = TransferUnit::new(0, "part", format!("{}/file.bin", server.uri()))
            .with_ranges(vec![ByteRange::new(0, 4), ByteRange::new(4, 10)]);
        let mut out = Vec::new();
        let outcome = fetcher
            .fetch(&mut unit, &mut out, &CancelFlag::new(), |_| {})
            .await
            .unwrap();

        assert_eq!(outcome, FetchOutcome::Completed { bytes: 10 });
        assert_eq!(out, b"aaaabbbbbb");
        assert_eq!(unit.state.cursor, 2);
    }

    #[tokio::test]
    async fn test_fetch_http_error_after_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gone.mp3"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(&EngineConfig::default())
            .unwrap()
            .with_retry(RetryPolicy::with_max_attempts(1));
        let mut unit = TransferUnit::new(0, "gone", format!("{}/gone.mp3", server.uri()));
        let mut out = Vec::new();
        let err = fetcher
            .fetch(&mut unit, &mut out, &CancelFlag::new(), |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::HttpStatus { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_fetch_truncated_body_detected() {
        let server = MockServer::start().await;
        // Advertise more than is sent.
        Mock::given(method("GET"))
            .and(path("/file.bin"))
            .and(header("Range", "bytes=0-99"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(vec![1u8; 40]))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(&EngineConfig::default())
            .unwrap()
            .with_retry(RetryPolicy::with_max_attempts(1));
        let mut unit = TransferUnit::new(0, "file", format!("{}/file.bin", server.uri()))
            .with_ranges(vec![ByteRange::new(0, 100)]);
        let mut out = Vec::new();
        let err = fetcher
            .fetch(&mut unit, &mut out, &CancelFlag::new(), |_| {})
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            TransferError::Truncated {
                expected_bytes: 100,
                actual_bytes: 40,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_fetch_canceled_before_start() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 10]))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(&EngineConfig::default()).unwrap();
        let mut unit = TransferUnit::new(0, "canceled", format!("{}/x", server.uri()))
            .with_ranges(vec![ByteRange::new(0, 10)]);
        let cancel = CancelFlag::new();
        cancel.set();
        let mut out = Vec::new();
        let outcome = fetcher
            .fetch(&mut unit, &mut out, &cancel, |_| {})
            .await
            .unwrap();
        assert_eq!(outcome, FetchOutcome::Canceled);
    }

    #[tokio::test]
    async fn test_resolve_size_from_ranges() {
        let fetcher = HttpFetcher::new(&EngineConfig::default()).unwrap();
        let unit = TransferUnit::new(0, "u", "http://127.0.0.1:1/never")
            .with_ranges(vec![ByteRange::new(0, 7)]);
        assert_eq!(fetcher.resolve_size(&unit).await, Some(7));
    }

    #[tokio::test]
    async fn test_resolve_size_via_head() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/book.mp3"))
            .respond_with(ResponseTemplate::new(200).insert_header("Content-Length", "4096"))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(&EngineConfig::default()).unwrap();
        let unit = TransferUnit::new(0, "book", format!("{}/book.mp3", server.uri()));
        assert_eq!(fetcher.resolve_size(&unit).await, Some(4096));
    }
}
