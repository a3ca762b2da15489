//! Error types for the download module.
//!
//! Transfer-level failures ([`TransferError`]) carry the URL or path they
//! occurred on; playlist and crypto failures are fatal for the whole book.
//! Cancellation is modeled as [`DownloadError::Terminated`] so callers can
//! tell a requested stop apart from a real failure.

use std::path::PathBuf;

use thiserror::Error;

/// Errors from a single HTTP transfer.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Network-level error (DNS resolution, connection refused, TLS errors).
    #[error("network error fetching {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before the body finished streaming.
    #[error("timeout fetching {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// HTTP error response (4xx client errors, 5xx server errors).
    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// The body ended short of the advertised length.
    #[error("truncated body from {url}: expected {expected_bytes} bytes, got {actual_bytes}")]
    Truncated {
        /// The URL whose body was cut short.
        url: String,
        /// Bytes advertised by the server.
        expected_bytes: u64,
        /// Bytes actually received.
        actual_bytes: u64,
    },

    /// File system error while writing the fetched bytes.
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The provided URL is malformed or invalid.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// The shared HTTP client could not be constructed.
    #[error("failed to build HTTP client: {source}")]
    Client {
        /// The underlying builder error.
        #[source]
        source: reqwest::Error,
    },
}

impl TransferError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    /// Creates a truncated-body error.
    pub fn truncated(url: impl Into<String>, expected_bytes: u64, actual_bytes: u64) -> Self {
        Self::Truncated {
            url: url.into(),
            expected_bytes,
            actual_bytes,
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }
}

/// Errors from playlist handling. Both variants are fatal for the book.
#[derive(Debug, Error)]
pub enum PlaylistError {
    /// The playlist body could not be parsed.
    #[error("unparseable playlist at {url}: {detail}")]
    Parse {
        /// The playlist URL.
        url: String,
        /// Parser diagnostic.
        detail: String,
    },

    /// The decryption key could not be fetched.
    #[error("decryption key unavailable from {url}: {source}")]
    KeyUnavailable {
        /// The key URL.
        url: String,
        /// The transfer failure that prevented the fetch.
        #[source]
        source: TransferError,
    },

    /// The playlist declares an encryption method this engine cannot apply.
    #[error("unsupported encryption method {method:?} in playlist at {url}")]
    UnsupportedMethod {
        /// The playlist URL.
        url: String,
        /// The declared method.
        method: String,
    },
}

impl PlaylistError {
    /// Creates a parse error.
    pub fn parse(url: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Parse {
            url: url.into(),
            detail: detail.into(),
        }
    }

    /// Creates a key-unavailable error.
    pub fn key_unavailable(url: impl Into<String>, source: TransferError) -> Self {
        Self::KeyUnavailable {
            url: url.into(),
            source,
        }
    }
}

/// Errors from segment decryption.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The fetched key is not 16 bytes.
    #[error("AES-128 key must be 16 bytes, got {len}")]
    InvalidKey {
        /// Length of the fetched key material.
        len: usize,
    },

    /// The ciphertext length is not a multiple of the block size.
    #[error("ciphertext of {len} bytes is not block aligned")]
    BlockAlignment {
        /// Ciphertext length in bytes.
        len: usize,
    },
}

/// Top-level error for a book download.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// A transfer failed after retries were exhausted.
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// Playlist parsing or key fetching failed.
    #[error(transparent)]
    Playlist(#[from] PlaylistError),

    /// Segment decryption failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Merging, splitting, or converting chapter media failed.
    #[error(transparent)]
    Media(#[from] crate::media::MediaError),

    /// File system error outside of a transfer (directories, renames).
    #[error("IO error at {path}: {source}")]
    Io {
        /// The path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The task scheduler rejected its configuration.
    #[error(transparent)]
    Scheduler(#[from] crate::scheduler::SchedulerError),

    /// No registered strategy matches the book's source locator.
    #[error("no download strategy for source: {url}")]
    UnsupportedSource {
        /// The book URL that matched no strategy.
        url: String,
    },

    /// The download was terminated on request. Not a failure.
    #[error("download terminated")]
    Terminated,
}

impl DownloadError {
    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an unsupported-source error.
    pub fn unsupported_source(url: impl Into<String>) -> Self {
        Self::UnsupportedSource { url: url.into() }
    }

    /// Whether this is a requested termination rather than a failure.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated)
    }
}

// No `From<reqwest::Error>` or `From<std::io::Error>` impls: the variants
// need URL/path context the source errors cannot supply, so callers go
// through the helper constructors.
