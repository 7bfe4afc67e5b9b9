//! Test helpers for pipeline integration tests
//!
//! This module builds encrypted book fixtures, serves them from a local
//! HTTP server, and provides a stand-in audio encoder.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures_util::StreamExt;
use liberation_core::audio::chapters::{Chapter, ChapterInfo};
use liberation_core::audio::container::{ChapterMark, Container, Sample, SampleEntry, CHPL_UNITS_PER_SECOND};
use liberation_core::audio::encoder::{AudioEncoder, EncoderSettings};
use liberation_core::audio::metadata::keys;
use liberation_core::crypto::{DecryptionKey, EnvelopeEncrypter};
use liberation_core::download::DownloadOptions;
use liberation_core::error::Result;
use liberation_core::{Pipeline, PipelineConfig};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Bytes per audio sample in fixtures
pub const SAMPLE_SIZE: usize = 1024;

/// AAC frame duration at 44.1 kHz
pub const SAMPLE_TICKS: u32 = 1024;

pub const SAMPLE_RATE: u32 = 44100;

// ============================================================================
// BOOK FIXTURES
// ============================================================================

pub struct BookFixture {
    pub key: DecryptionKey,
    /// Decrypted container as written by the crate
    pub plaintext: Vec<u8>,
    pub encrypted: Vec<u8>,
    /// Concatenated sample bytes, in order
    pub sample_data: Vec<u8>,
    pub sample_count: usize,
}

pub fn test_key() -> DecryptionKey {
    DecryptionKey::from_hex(
        "000102030405060708090a0b0c0d0e0f",
        "f0e0d0c0b0a090807060504030201000",
    )
    .unwrap()
}

/// Milliseconds covered by `samples` fixture samples
pub fn samples_to_ms(samples: usize) -> u64 {
    samples as u64 * SAMPLE_TICKS as u64 * 1000 / SAMPLE_RATE as u64
}

/// Build an encrypted book of roughly `total_bytes` of audio with the given
/// embedded chapter titles spread evenly over it
pub async fn build_book(total_bytes: usize, chapter_titles: &[&str]) -> BookFixture {
    let scratch = TempDir::new().unwrap();
    let sample_count = (total_bytes / SAMPLE_SIZE).max(1);

    let sample_data: Vec<u8> = (0..sample_count * SAMPLE_SIZE)
        .map(|i| ((i / SAMPLE_SIZE) * 31 + i % SAMPLE_SIZE) as u8)
        .collect();
    let raw_path = scratch.path().join("samples.raw");
    tokio::fs::write(&raw_path, &sample_data).await.unwrap();

    let samples = (0..sample_count)
        .map(|i| Sample {
            offset: (i * SAMPLE_SIZE) as u64,
            size: SAMPLE_SIZE as u32,
            duration: SAMPLE_TICKS,
        })
        .collect();
    let mut container = Container::new(SampleEntry::aac(2, SAMPLE_RATE, 64_000), samples);
    container.tags.set_text(keys::TITLE, "Dune (Unabridged)");
    container.tags.set_text(keys::ARTIST, "Frank Herbert");

    let per_chapter = sample_count / chapter_titles.len().max(1);
    container.chapters = chapter_titles
        .iter()
        .enumerate()
        .map(|(i, title)| ChapterMark {
            start: samples_to_ms(i * per_chapter) * (CHPL_UNITS_PER_SECOND / 1000),
            title: title.to_string(),
        })
        .collect();

    let plain_path = scratch.path().join("plain.m4b");
    container
        .write(&raw_path, &plain_path, &CancellationToken::new())
        .await
        .unwrap();
    let plaintext = tokio::fs::read(&plain_path).await.unwrap();

    let key = test_key();
    let mut encrypted = Vec::new();
    EnvelopeEncrypter::new(&key)
        .encrypt(&mut plaintext.as_slice(), &mut encrypted)
        .await
        .unwrap();

    BookFixture {
        key,
        plaintext,
        encrypted,
        sample_data,
        sample_count,
    }
}

/// Catalog chapters splitting `sample_count` samples into equal parts
pub fn even_chapters(sample_count: usize, titles: &[&str]) -> ChapterInfo {
    let per_chapter = sample_count / titles.len();
    let chapters = titles
        .iter()
        .enumerate()
        .map(|(i, title)| {
            let start = samples_to_ms(i * per_chapter);
            let end = if i + 1 == titles.len() {
                samples_to_ms(sample_count)
            } else {
                samples_to_ms((i + 1) * per_chapter)
            };
            Chapter::new(*title, start, end - start)
        })
        .collect();
    ChapterInfo::new(chapters)
}

// ============================================================================
// HTTP SERVER
// ============================================================================

#[derive(Clone)]
struct ServerState {
    body: Bytes,
    requests: Arc<AtomicUsize>,
    ranges: Arc<Mutex<Vec<String>>>,
}

pub struct TestServer {
    pub base_url: String,
    requests: Arc<AtomicUsize>,
    ranges: Arc<Mutex<Vec<String>>>,
}

impl TestServer {
    /// `/book.aaxc` serves the body with range support, `/stall` sends one
    /// chunk and then hangs, `/missing` answers 404
    pub async fn start(body: Vec<u8>) -> Self {
        let state = ServerState {
            body: Bytes::from(body),
            requests: Arc::new(AtomicUsize::new(0)),
            ranges: Arc::new(Mutex::new(Vec::new())),
        };
        let requests = state.requests.clone();
        let ranges = state.ranges.clone();

        let app = Router::new()
            .route("/book.aaxc", get(serve_book))
            .route("/stall", get(serve_stall))
            .route("/missing", get(|| async { StatusCode::NOT_FOUND }))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{}", addr),
            requests,
            ranges,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Range headers received, in order
    pub fn ranges(&self) -> Vec<String> {
        self.ranges.lock().unwrap().clone()
    }
}

async fn serve_book(State(state): State<ServerState>, headers: HeaderMap) -> Response {
    state.requests.fetch_add(1, Ordering::SeqCst);
    let total = state.body.len();

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    if let Some(range) = range {
        state.ranges.lock().unwrap().push(range.clone());
        let start: usize = range
            .trim_start_matches("bytes=")
            .trim_end_matches('-')
            .parse()
            .unwrap_or(0);
        if start >= total {
            return (
                StatusCode::RANGE_NOT_SATISFIABLE,
                [(header::CONTENT_RANGE, format!("bytes */{}", total))],
            )
                .into_response();
        }
        return (
            StatusCode::PARTIAL_CONTENT,
            [(
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", start, total - 1, total),
            )],
            state.body.slice(start..),
        )
            .into_response();
    }

    (StatusCode::OK, state.body.clone()).into_response()
}

async fn serve_stall(State(state): State<ServerState>) -> Response {
    state.requests.fetch_add(1, Ordering::SeqCst);
    let first = state.body.slice(..state.body.len().min(4096));
    let stream = futures_util::stream::once(async move { Ok::<_, std::io::Error>(first) })
        .chain(futures_util::stream::pending());
    Response::builder()
        .header(header::CONTENT_LENGTH, state.body.len())
        .body(Body::from_stream(stream))
        .unwrap()
}

// ============================================================================
// PIPELINE
// ============================================================================

/// Encoder stand-in that copies its input and records every call
#[derive(Default)]
pub struct CopyEncoder {
    pub calls: Mutex<Vec<EncoderSettings>>,
}

#[async_trait]
impl AudioEncoder for CopyEncoder {
    async fn encode(
        &self,
        input: &Path,
        output: &Path,
        settings: &EncoderSettings,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        self.calls.lock().unwrap().push(*settings);
        tokio::fs::copy(input, output).await?;
        Ok(())
    }
}

pub fn test_config() -> PipelineConfig {
    PipelineConfig {
        read_timeout_secs: 10,
        connect_timeout_secs: 5,
        ..PipelineConfig::default()
    }
}

pub fn test_pipeline() -> (Pipeline, Arc<CopyEncoder>) {
    let encoder = Arc::new(CopyEncoder::default());
    let pipeline = Pipeline::new(test_config(), encoder.clone()).unwrap();
    (pipeline, encoder)
}

pub fn test_options(url: String, fixture: &BookFixture) -> DownloadOptions {
    let mut options = DownloadOptions::new(url, fixture.key.clone());
    options.asin = "B002V1OF70".to_string();
    options.title = "Dune".to_string();
    options
}

/// File names in `dir`, sorted
pub fn list_dir(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
