//! HLS media playlist parsing.
//!
//! Thin layer over `m3u8_rs` that resolves segment URIs against the
//! playlist URL, carries EXT-X-KEY state forward across segments, and
//! surfaces only the fields downstream code needs.

use url::Url;

use super::PlaylistError;
use super::transfer::ByteRange;

/// Encryption metadata attached to a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    /// Resolved key URL.
    pub url: Url,
    /// Explicit IV from the playlist, when present.
    pub iv: Option<[u8; 16]>,
}

/// One media segment, with its URI resolved to an absolute URL.
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    /// Zero-based position within the playlist.
    pub index: usize,
    /// Absolute segment URL.
    pub url: Url,
    /// Advertised duration in seconds (EXTINF).
    pub duration: f64,
    /// AES-128 key metadata, if the segment is encrypted.
    pub key: Option<KeyInfo>,
    /// EXT-X-BYTERANGE, resolved to absolute offsets.
    pub byte_range: Option<ByteRange>,
}

/// A parsed media playlist.
#[derive(Debug, Clone)]
pub struct PlaylistInfo {
    /// EXT-X-MEDIA-SEQUENCE; offsets derived IVs for encrypted segments.
    pub media_sequence: u64,
    /// Segments in playlist order.
    pub segments: Vec<SegmentInfo>,
}

impl PlaylistInfo {
    /// Sum of advertised segment durations.
    #[must_use]
    pub fn total_duration(&self) -> f64 {
        self.segments.iter().map(|s| s.duration).sum()
    }

    /// Whether all segments point at the same URL via byte ranges.
    ///
    /// Sources that pack a whole book into one remote file advertise it
    /// this way; such playlists can be fetched as one ranged transfer.
    #[must_use]
    pub fn is_single_file(&self) -> bool {
        match self.segments.split_first() {
            Some((first, rest)) => {
                first.byte_range.is_some() && rest.iter().all(|s| s.url == first.url)
            }
            None => false,
        }
    }
}

/// Parses a media playlist body fetched from `playlist_url`.
///
/// Master playlists are rejected: the engine expects the caller to hand it
/// the media-level playlist directly. Key state carries forward: an
/// EXT-X-KEY applies to every following segment until replaced or cleared.
///
/// # Errors
///
/// Returns [`PlaylistError::Parse`] for unparseable bodies, empty
/// playlists, or unresolvable URIs, and [`PlaylistError::UnsupportedMethod`]
/// for encryption methods other than AES-128.
pub fn parse_media_playlist(playlist_url: &Url, body: &[u8]) -> Result<PlaylistInfo, PlaylistError> {
    let playlist = m3u8_rs::parse_playlist_res(body)
        .map_err(|e| PlaylistError::parse(playlist_url.as_str(), e.to_string()))?;

    let media = match playlist {
        m3u8_rs::Playlist::MediaPlaylist(media) => media,
        m3u8_rs::Playlist::MasterPlaylist(_) => {
            return Err(PlaylistError::parse(
                playlist_url.as_str(),
                "expected a media playlist, got a master playlist",
            ));
        }
    };

    if media.segments.is_empty() {
        return Err(PlaylistError::parse(playlist_url.as_str(), "no segments"));
    }

    let mut segments = Vec::with_capacity(media.segments.len());
    let mut current_key: Option<KeyInfo> = None;
    // EXT-X-BYTERANGE without an offset continues from the previous range.
    let mut range_cursor: u64 = 0;

    for (index, segment) in media.segments.iter().enumerate() {
        if let Some(key) = &segment.key {
            current_key = resolve_key(playlist_url, key)?;
        }

        let url = playlist_url
            .join(&segment.uri)
            .map_err(|e| PlaylistError::parse(playlist_url.as_str(), e.to_string()))?;

        let byte_range = segment.byte_range.as_ref().map(|range| {
            let start = range.offset.unwrap_or(range_cursor);
            let resolved = ByteRange::new(start, start + range.length);
            range_cursor = resolved.end;
            resolved
        });

        segments.push(SegmentInfo {
            index,
            url,
            duration: f64::from(segment.duration),
            key: current_key.clone(),
            byte_range,
        });
    }

    Ok(PlaylistInfo {
        media_sequence: media.media_sequence,
        segments,
    })
}

fn resolve_key(playlist_url: &Url, key: &m3u8_rs::Key) -> Result<Option<KeyInfo>, PlaylistError> {
    match &key.method {
        m3u8_rs::KeyMethod::None => Ok(None),
        m3u8_rs::KeyMethod::AES128 => {
            let uri = key.uri.as_deref().ok_or_else(|| {
                PlaylistError::parse(playlist_url.as_str(), "AES-128 key without URI")
            })?;
            let url = playlist_url
                .join(uri)
                .map_err(|e| PlaylistError::parse(playlist_url.as_str(), e.to_string()))?;
            let iv = match key.iv.as_deref() {
                Some(iv) => Some(parse_iv(playlist_url, iv)?),
                None => None,
            };
            Ok(Some(KeyInfo { url, iv }))
        }
        other => Err(PlaylistError::UnsupportedMethod {
            url: playlist_url.to_string(),
            method: format!("{other:?}"),
        }),
    }
}

fn parse_iv(playlist_url: &Url, iv: &str) -> Result<[u8; 16], PlaylistError> {
    let trimmed = iv.trim_start_matches("0x").trim_start_matches("0X");
    let bytes = hex::decode(trimmed)
        .map_err(|e| PlaylistError::parse(playlist_url.as_str(), format!("bad IV: {e}")))?;
    bytes.try_into().map_err(|_| {
        PlaylistError::parse(playlist_url.as_str(), "IV must be 16 bytes")
    })
}
