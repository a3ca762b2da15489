//! Audiobook Download Engine
//!
//! This library turns streaming audiobook sources into chapter files in a
//! local library. It reconstructs merged HLS streams (one continuous
//! transport stream covering the whole book) into duration-aligned
//! chapters, decrypting AES-128-CBC segments on the way, and also handles
//! the simpler per-chapter file layout.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`scheduler`] - Bounded-concurrency async task scheduler
//! - [`download`] - Download strategies, chunked transfer, HLS handling
//! - [`progress`] - Progress tracking and the process handler observers
//! - [`server`] - Loopback TCP coordinator and its wire protocol
//! - [`jobfile`] - Job status file coordination for subprocess downloads
//! - [`media`] - Transport stream splitting and ffmpeg transcoding
//! - [`book`] - Book descriptor and output model
//! - [`config`] - Engine configuration

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod book;
pub mod config;
pub mod download;
pub mod jobfile;
pub mod media;
pub mod progress;
pub mod scheduler;
pub mod server;

// Re-export commonly used types
pub use book::{Book, BookError, Chapter, ChapterFile};
pub use config::EngineConfig;
pub use download::{
    BookDownloader, DownloadControl, DownloadError, Downloader, FailureType, Outcome, RetryPolicy,
    TransferError,
};
pub use jobfile::{JobError, JobFile, JobFileHandler, JobUpdate, Supervisor, watch_job_file};
pub use progress::{
    ChannelHandler, ConsoleHandler, DownloadStatus, ProcessHandler, ProgressState,
};
pub use scheduler::{SchedulerError, TaskScheduler};
pub use server::{
    BookProvider, CoordinatorClient, InMemoryBooks, Server, ServerError, SocketHandler,
};
