//! Book descriptors exchanged with the cataloging layer.
//!
//! The engine does not scrape sites or keep a catalog; it receives a
//! [`Book`] (usually deserialized from a JSON descriptor) and produces a
//! list of [`ChapterFile`]s. The chapter list is ordered by playback
//! position and each chapter's `duration` is authoritative when aligning a
//! merged stream to chapter boundaries.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

/// A book to download, as supplied by the external cataloging layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Book {
    /// Stable identifier assigned by the catalog.
    pub id: u64,
    pub title: String,
    pub author: String,
    /// Source page URL. Also keys the job status file for subprocess runs.
    pub url: String,
    /// Directory the chapter files are written into.
    pub dir_path: PathBuf,
    /// Cover image URL, saved alongside the chapters when present.
    #[serde(default)]
    pub preview: Option<String>,
    /// Ordered chapters with target durations in seconds.
    pub chapters: Vec<Chapter>,
}

/// One chapter of a [`Book`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chapter {
    pub title: String,
    /// Target duration in seconds. Authoritative for merged-stream alignment
    /// even when advertised segment durations are approximate.
    pub duration: f64,
    /// Source locator: a direct media URL or an HLS playlist URL.
    pub file_url: String,
}

/// A produced chapter file plus its content hash, for integrity
/// verification by the catalog layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterFile {
    pub path: PathBuf,
    /// Lowercase hex SHA-256 of the file contents.
    pub sha256: String,
}

impl Book {
    /// Loads a book descriptor from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a valid
    /// descriptor.
    pub async fn load(path: &Path) -> Result<Self, BookError> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| BookError::io(path, e))?;
        serde_json::from_slice(&data).map_err(|e| BookError::Descriptor {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Returns the output filename for a chapter: `NN. Title<ext>`.
    ///
    /// The index is 1-based and zero-padded to two digits; the title is
    /// filtered down to filesystem-safe characters. A leading series number
    /// in the title (`"03 Chapter"`) is dropped since the index already
    /// encodes ordering. Titles that already carry an audio extension keep
    /// it instead of `ext`.
    #[must_use]
    pub fn chapter_file_name(&self, index: usize, ext: &str) -> String {
        let title = self
            .chapters
            .get(index)
            .map_or("chapter", |c| c.title.as_str());
        let title = strip_series_number(title);
        let title = safe_name(title);
        let ext = if title.ends_with(".wav") || title.ends_with(".mp3") {
            ""
        } else {
            ext
        };
        format!("{:02}. {title}{ext}", index + 1)
    }
}

/// Errors loading a book descriptor.
#[derive(Debug, thiserror::Error)]
pub enum BookError {
    /// Failed to read the descriptor file.
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not a valid book descriptor.
    #[error("invalid book descriptor {path}: {source}")]
    Descriptor {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl BookError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Removes or replaces characters not allowed in filenames.
#[must_use]
pub fn safe_name(text: &str) -> String {
    let cleaned: String = text
        .chars()
        .filter(|c| !matches!(c, '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '+'))
        .collect();
    cleaned.trim_end_matches(['.', ' ']).to_string()
}

fn strip_series_number(title: &str) -> &str {
    let trimmed = title.trim_start();
    let digits = trimmed.chars().take_while(char::is_ascii_digit).count();
    if digits > 0 {
        if let Some(rest) = trimmed[digits..].strip_prefix(' ') {
            if !rest.is_empty() {
                return rest;
            }
        }
    }
    title
}

/// Computes the lowercase hex SHA-256 of a file, streaming in 64 KiB reads.
///
/// # Errors
///
/// Returns the underlying IO error if the file cannot be read.
pub async fn file_sha256(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
