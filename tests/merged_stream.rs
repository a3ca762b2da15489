//! End-to-end download of an encrypted merged HLS stream.
//!
//! Serves a 7-segment AES-128 playlist from a mock server and checks that
//! the engine reassembles it into three duration-aligned chapter files
//! whose concatenation is exactly the original transport stream.

use std::sync::Arc;

use audiobook_core::download::crypto::encrypt_aes128_cbc;
use audiobook_core::progress::ProgressEvent;
use audiobook_core::{
    Book, BookDownloader, ChannelHandler, Chapter, DownloadStatus, EngineConfig, Outcome,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// 48 transport stream packets; a multiple of both the 188-byte packet
/// size and the 16-byte AES block size.
const SEGMENT_SIZE: usize = 9024;
const SEGMENTS: usize = 7;
const SEGMENT_SECS: f64 = 5.0;
const MEDIA_SEQUENCE: u64 = 3;
const KEY: [u8; 16] = *b"0123456789abcdef";

/// Deterministic stand-in for the book's transport stream.
fn plaintext_stream() -> Vec<u8> {
    (0..SEGMENT_SIZE * SEGMENTS)
        .map(|i| u8::try_from(i % 251).unwrap())
        .collect()
}

fn derived_iv(segment_index: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[8..].copy_from_slice(&(MEDIA_SEQUENCE + segment_index).to_be_bytes());
    iv
}

fn playlist_body() -> String {
    let mut body = String::from(
        "#EXTM3U\n\
         #EXT-X-VERSION:3\n\
         #EXT-X-TARGETDURATION:5\n\
         #EXT-X-MEDIA-SEQUENCE:3\n\
         #EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\"\n",
    );
    for i in 0..SEGMENTS {
        body.push_str(&format!("#EXTINF:{SEGMENT_SECS:.1},\nseg{i}.ts\n"));
    }
    body.push_str("#EXT-X-ENDLIST\n");
    body
}

async fn mount_playlist_and_segments(mock: &MockServer, stream: &[u8]) {
    Mock::given(method("GET"))
        .and(path("/stream/playlist.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string(playlist_body()))
        .mount(mock)
        .await;
    for (i, segment) in stream.chunks(SEGMENT_SIZE).enumerate() {
        let cipher =
            encrypt_aes128_cbc(&KEY, &derived_iv(i as u64), segment).unwrap();
        Mock::given(method("GET"))
            .and(path(format!("/stream/seg{i}.ts")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(cipher))
            .mount(mock)
            .await;
    }
}

fn merged_book(base_url: &str, dir: &std::path::Path) -> Book {
    let playlist = format!("{base_url}/stream/playlist.m3u8");
    let chapter = |title: &str, duration: f64| Chapter {
        title: title.to_string(),
        duration,
        file_url: playlist.clone(),
    };
    Book {
        id: 77,
        title: "Merged".to_string(),
        author: "Author".to_string(),
        url: format!("{base_url}/book/77"),
        dir_path: dir.join("merged"),
        preview: None,
        chapters: vec![
            chapter("Opening", 12.0),
            chapter("Middle", 12.0),
            chapter("Closing", 11.0),
        ],
    }
}

#[tokio::test]
async fn test_encrypted_merged_stream_splits_into_aligned_chapters() {
    let mock = MockServer::start().await;
    let stream = plaintext_stream();
    mount_playlist_and_segments(&mock, &stream).await;
    Mock::given(method("GET"))
        .and(path("/stream/key.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(KEY.to_vec()))
        .expect(1)
        .mount(&mock)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let book = merged_book(&mock.uri(), dir.path());
    let config = EngineConfig {
        transcode: false,
        ..EngineConfig::default()
    };

    let (handler, mut events) = ChannelHandler::new();
    let downloader = BookDownloader::new(book, Arc::new(handler), config).unwrap();
    let outcome = downloader.run().await;

    let Outcome::Finished(files) = outcome else {
        panic!("unexpected outcome: {outcome:?}");
    };
    assert_eq!(files.len(), 3);

    // Chapter boundaries land on whole transport stream packets:
    // segment 2 splits after 19 packets, segment 4 after 38.
    let expected = [
        ("01. Opening.mp3", 2 * SEGMENT_SIZE + 19 * 188),
        ("02. Middle.mp3", (SEGMENT_SIZE - 19 * 188) + SEGMENT_SIZE + 38 * 188),
        ("03. Closing.mp3", (SEGMENT_SIZE - 38 * 188) + 2 * SEGMENT_SIZE),
    ];

    let mut rebuilt = Vec::new();
    for (file, (name, size)) in files.iter().zip(expected) {
        assert_eq!(file.path.file_name().unwrap().to_str().unwrap(), name);
        assert_eq!(file.sha256.len(), 64);
        let data = tokio::fs::read(&file.path).await.unwrap();
        assert_eq!(data.len(), size, "{name}");
        rebuilt.extend_from_slice(&data);
    }
    // Nothing lost, nothing reordered, nothing left encrypted.
    assert_eq!(rebuilt, stream);

    // Byte accounting reaches the full stream size and only ever grows.
    let mut done = 0u64;
    let mut total = 0u64;
    let mut statuses = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            ProgressEvent::Init { status, .. } => statuses.push(status),
            ProgressEvent::Progress { delta } => done += delta,
            ProgressEvent::GrowTotal { delta } => total += delta,
            ProgressEvent::SetStatus { status } => statuses.push(status),
            ProgressEvent::Finished => statuses.push(DownloadStatus::Finished),
            ProgressEvent::Error { message, .. } => panic!("download failed: {message}"),
        }
    }
    assert_eq!(total, stream.len() as u64);
    assert!(done >= total);
    assert_eq!(*statuses.last().unwrap(), DownloadStatus::Finished);
}

#[tokio::test]
async fn test_merged_stream_with_unreachable_key_fails_and_cleans_up() {
    let mock = MockServer::start().await;
    let stream = plaintext_stream();
    mount_playlist_and_segments(&mock, &stream).await;
    Mock::given(method("GET"))
        .and(path("/stream/key.bin"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&mock)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let book = merged_book(&mock.uri(), dir.path());
    let config = EngineConfig {
        transcode: false,
        ..EngineConfig::default()
    };

    let (handler, _events) = ChannelHandler::new();
    let downloader = BookDownloader::new(book, Arc::new(handler), config).unwrap();
    match downloader.run().await {
        Outcome::Failed(_) => {}
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(!dir.path().join("merged").exists());
}
