//! Chapter media assembly: merging, splitting, and converting MPEG-TS.
//!
//! Splitting works on raw bytes: audio TS streams have near-constant
//! bitrate, so a time split maps to a proportional byte offset, aligned
//! down to the 188-byte TS packet boundary so both halves stay parseable.
//! Conversion and duration probing shell out to `ffmpeg`/`ffprobe`.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::Deserialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument};

/// MPEG-TS packet size in bytes.
pub const TS_PACKET: u64 = 188;

/// Errors from media assembly.
#[derive(Debug, Error)]
pub enum MediaError {
    /// File system error during merge or rename.
    #[error("IO error at {path}: {source}")]
    Io {
        /// The path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// An external tool failed or could not be spawned.
    #[error("{tool} failed: {detail}")]
    Tool {
        /// Tool name (`ffmpeg` or `ffprobe`).
        tool: &'static str,
        /// Exit status or spawn diagnostic.
        detail: String,
    },

    /// `ffprobe` output could not be interpreted.
    #[error("unreadable probe output for {path}: {detail}")]
    Probe {
        /// The probed file.
        path: PathBuf,
        /// Parser diagnostic.
        detail: String,
    },
}

impl MediaError {
    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Tags written into a produced chapter file.
#[derive(Debug, Clone, Default)]
pub struct TrackMeta {
    pub title: String,
    pub artist: String,
    pub album: String,
    /// 1-based track number.
    pub track: u32,
}

/// Splits TS `data` at the byte offset proportional to `split_secs` of
/// `duration`, aligned down to a packet boundary.
///
/// The first half covers roughly `split_secs` seconds and the second the
/// rest. A split at or past the whole duration returns everything in the
/// first half; at or below zero, everything in the second.
#[must_use]
pub fn split_ts(data: &[u8], duration: f64, split_secs: f64) -> (Vec<u8>, Vec<u8>) {
    let offset = split_offset(data.len() as u64, duration, split_secs) as usize;
    (data[..offset].to_vec(), data[offset..].to_vec())
}

/// Byte offset for a proportional time split, packet aligned.
#[must_use]
pub fn split_offset(len: u64, duration: f64, split_secs: f64) -> u64 {
    if duration <= 0.0 || split_secs >= duration {
        return len;
    }
    if split_secs <= 0.0 {
        return 0;
    }
    let proportional = (len as f64 * (split_secs / duration)) as u64;
    let aligned = proportional - proportional % TS_PACKET;
    aligned.min(len)
}

/// Concatenates in-memory TS parts into `dst`.
///
/// # Errors
///
/// Returns [`MediaError::Io`] when the file cannot be written.
#[instrument(level = "debug", skip(parts), fields(dst = %dst.display()))]
pub async fn merge_ts_parts(parts: &[Vec<u8>], dst: &Path) -> Result<(), MediaError> {
    let mut file = tokio::fs::File::create(dst)
        .await
        .map_err(|e| MediaError::io(dst, e))?;
    let mut total = 0usize;
    for part in parts {
        file.write_all(part)
            .await
            .map_err(|e| MediaError::io(dst, e))?;
        total += part.len();
    }
    file.flush().await.map_err(|e| MediaError::io(dst, e))?;
    debug!(parts = parts.len(), bytes = total, "merged chapter parts");
    Ok(())
}

/// Converts a TS chapter to mp3 with track metadata.
///
/// # Errors
///
/// Returns [`MediaError::Tool`] when `ffmpeg` cannot be spawned or exits
/// nonzero.
#[instrument(level = "debug", skip(meta), fields(src = %src.display(), dst = %dst.display()))]
pub async fn convert_ts_to_mp3(src: &Path, dst: &Path, meta: &TrackMeta) -> Result<(), MediaError> {
    let output = Command::new("ffmpeg")
        .arg("-y")
        .arg("-i")
        .arg(src.as_os_str())
        .arg("-vn")
        .arg("-codec:a")
        .arg("libmp3lame")
        .arg("-q:a")
        .arg("2")
        .arg("-metadata")
        .arg(format!("title={}", meta.title))
        .arg("-metadata")
        .arg(format!("artist={}", meta.artist))
        .arg("-metadata")
        .arg(format!("album={}", meta.album))
        .arg("-metadata")
        .arg(format!("track={}", meta.track))
        .arg(dst.as_os_str())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| MediaError::Tool {
            tool: "ffmpeg",
            detail: format!("failed to spawn: {e}"),
        })?;

    if !output.status.success() {
        return Err(MediaError::Tool {
            tool: "ffmpeg",
            detail: format!(
                "exit {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(())
}

#[derive(Deserialize)]
struct ProbeOutput {
    format: ProbeFormat,
}

#[derive(Deserialize)]
struct ProbeFormat {
    duration: String,
}

/// Measures a media file's duration in seconds via `ffprobe`.
///
/// # Errors
///
/// Returns [`MediaError::Tool`] when `ffprobe` fails and
/// [`MediaError::Probe`] when its output is unreadable.
#[instrument(level = "debug", fields(path = %path.display()))]
pub async fn probe_duration(path: &Path) -> Result<f64, MediaError> {
    let output = Command::new("ffprobe")
        .arg("-v")
        .arg("quiet")
        .arg("-print_format")
        .arg("json")
        .arg("-show_entries")
        .arg("format=duration")
        .arg(path.as_os_str())
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| MediaError::Tool {
            tool: "ffprobe",
            detail: format!("failed to spawn: {e}"),
        })?;

    if !output.status.success() {
        return Err(MediaError::Tool {
            tool: "ffprobe",
            detail: format!("exit {}", output.status),
        });
    }

    let parsed: ProbeOutput = serde_json::from_slice(&output.stdout).map_err(|e| {
        MediaError::Probe {
            path: path.to_path_buf(),
            detail: e.to_string(),
        }
    })?;
    parsed
        .format
        .duration
        .parse::<f64>()
        .map_err(|e| MediaError::Probe {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_split_offset_is_packet_aligned() {
        // 9400 bytes = 50 packets over 5 seconds; 2s -> 20 packets.
        let offset = split_offset(9400, 5.0, 2.0);
        assert_eq!(offset, 3760);
        assert_eq!(offset % TS_PACKET, 0);
    }

    #[test]
    fn test_split_offset_rounds_down_to_packet() {
        // 1000 bytes over 3s at 1s -> 333 bytes -> 1 packet.
        assert_eq!(split_offset(1000, 3.0, 1.0), 188);
    }

    #[test]
    fn test_split_offset_clamps_to_bounds() {
        assert_eq!(split_offset(940, 5.0, 5.0), 940);
        assert_eq!(split_offset(940, 5.0, 7.0), 940);
        assert_eq!(split_offset(940, 5.0, 0.0), 0);
        assert_eq!(split_offset(940, 0.0, 1.0), 940);
    }

    #[test]
    fn test_split_ts_halves_rejoin() {
        let data: Vec<u8> = (0..9400u32).map(|i| (i % 251) as u8).collect();
        let (head, tail) = split_ts(&data, 5.0, 2.0);
        assert_eq!(head.len(), 3760);
        let rejoined: Vec<u8> = head.iter().chain(tail.iter()).copied().collect();
        assert_eq!(rejoined, data);
    }

    #[tokio::test]
    async fn test_merge_ts_parts_concatenates_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("ch.ts");
        let parts = vec![vec![1u8; 188], vec![2u8; 376], vec![3u8; 188]];
        merge_ts_parts(&parts, &dst).await.unwrap();
        let merged = tokio::fs::read(&dst).await.unwrap();
        assert_eq!(merged.len(), 752);
        assert_eq!(&merged[..188], &[1u8; 188][..]);
        assert_eq!(&merged[188..564], &[2u8; 376][..]);
    }

    #[tokio::test]
    async fn test_merge_ts_parts_empty_produces_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("empty.ts");
        merge_ts_parts(&[], &dst).await.unwrap();
        assert_eq!(tokio::fs::metadata(&dst).await.unwrap().len(), 0);
    }
}
