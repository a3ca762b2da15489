//! The download engine: transfer plumbing, strategies, and the lifecycle
//! driver.
//!
//! Entry point is [`BookDownloader`], which selects a strategy from the
//! [`StrategyTable`] and drives it through the download lifecycle. The
//! submodules are the pieces it is built from: chunked transfers with
//! retry, HLS playlist parsing, AES-128 segment decryption, and the two
//! built-in strategies.

pub mod crypto;
pub mod downloader;
pub mod error;
pub mod merged;
pub mod playlist;
pub mod retry;
pub mod simple;
pub mod transfer;

pub use downloader::{
    BookDownloader, DownloadContext, DownloadControl, Downloader, Outcome, StrategyTable,
};
pub use error::{CryptoError, DownloadError, PlaylistError, TransferError};
pub use retry::{FailureType, RetryPolicy};
pub use transfer::{ByteRange, CancelFlag, FetchOutcome, HttpFetcher, TransferState, TransferUnit};
