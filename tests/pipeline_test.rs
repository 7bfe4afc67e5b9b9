//! End-to-end pipeline tests against a local HTTP server
//!
//! Run with: cargo test --test pipeline_test

mod helpers;

use helpers::*;
use liberation_core::audio::container::Container;
use liberation_core::audio::encoder::OutputFormat;
use liberation_core::audio::metadata::keys;
use liberation_core::download::progress::{DownloadEvent, FreezeReport};
use liberation_core::download::OutputLayout;
use liberation_core::sidecar::records::{AudibleRecord, RecordsSource};
use liberation_core::{LibationError, OutputTarget, SidecarKind};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const TEN_MB: usize = 10 * 1024 * 1024;

#[tokio::test]
async fn test_single_file_without_cue_sheet() {
    let fixture = build_book(TEN_MB, &["Opening", "Middle", "End"]).await;
    let server = TestServer::start(fixture.encrypted.clone()).await;
    let out = TempDir::new().unwrap();
    let (pipeline, encoder) = test_pipeline();

    let options = test_options(server.url("/book.aaxc"), &fixture);
    let outcome = pipeline
        .run(&options, &OutputTarget::new(out.path(), "Dune"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(list_dir(out.path()), vec!["Dune.m4b"]);
    assert_eq!(outcome.files.len(), 1);
    assert!(outcome.cue_sheet.is_none());
    assert!(outcome.records.is_none());
    assert!(outcome.warnings.is_empty());
    assert!(encoder.calls.lock().unwrap().is_empty());

    let written = std::fs::read(&outcome.files[0].path).unwrap();
    assert_eq!(outcome.files[0].bytes, written.len() as u64);
    assert!(written.ends_with(&fixture.sample_data));

    let container = Container::read(&outcome.files[0].path).await.unwrap();
    assert_eq!(container.track.samples.len(), fixture.sample_count);
    assert_eq!(container.chapters.len(), 3);
}

#[tokio::test]
async fn test_three_chapters_multi_part() {
    let fixture = build_book(600 * 1024, &[]).await;
    let server = TestServer::start(fixture.encrypted.clone()).await;
    let out = TempDir::new().unwrap();
    let (pipeline, _) = test_pipeline();

    let mut options = test_options(server.url("/book.aaxc"), &fixture);
    options.output_layout = OutputLayout::MultiPart;
    options.chapter_info = even_chapters(fixture.sample_count, &["Prologue", "Arrakis", "Epilogue"]);

    let outcome = pipeline
        .run(&options, &OutputTarget::new(out.path(), "Dune"), &CancellationToken::new())
        .await
        .unwrap();

    let names = list_dir(out.path());
    assert_eq!(
        names,
        vec![
            "Dune - 01 - Prologue.m4b",
            "Dune - 02 - Arrakis.m4b",
            "Dune - 03 - Epilogue.m4b"
        ]
    );
    let titles: Vec<_> = outcome.files.iter().map(|f| f.title.as_str()).collect();
    assert_eq!(titles, vec!["Prologue", "Arrakis", "Epilogue"]);

    let mut total_samples = 0;
    for file in &outcome.files {
        let part = Container::read(&file.path).await.unwrap();
        assert_eq!(part.tags.text(&keys::TITLE).as_deref(), Some(file.title.as_str()));
        total_samples += part.track.samples.len();
    }
    assert_eq!(total_samples, fixture.sample_count);
}

#[tokio::test]
async fn test_corrupt_ciphertext_is_fatal_and_leaves_nothing() {
    let mut fixture = build_book(256 * 1024, &["One"]).await;
    fixture.encrypted[100] ^= 0xff;
    let server = TestServer::start(fixture.encrypted.clone()).await;
    let out = TempDir::new().unwrap();
    let (pipeline, _) = test_pipeline();

    let options = test_options(server.url("/book.aaxc"), &fixture);
    let err = pipeline
        .run(&options, &OutputTarget::new(out.path(), "Dune"), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, LibationError::Decryption(_)), "got {:?}", err);
    assert!(err.is_fatal());
    assert!(list_dir(out.path()).is_empty());
}

#[tokio::test]
async fn test_cancel_during_transfer_leaves_nothing() {
    let fixture = build_book(256 * 1024, &["One"]).await;
    let server = TestServer::start(fixture.encrypted.clone()).await;
    let out = TempDir::new().unwrap();
    let (pipeline, _) = test_pipeline();

    let options = test_options(server.url("/stall"), &fixture);
    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        canceller.cancel();
    });

    let err = pipeline
        .run(&options, &OutputTarget::new(out.path(), "Dune"), &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, LibationError::Cancelled), "got {:?}", err);
    assert!(list_dir(out.path()).is_empty());
}

#[tokio::test]
async fn test_cancel_after_transfer_leaves_nothing() {
    let fixture = build_book(256 * 1024, &["One"]).await;
    let server = TestServer::start(fixture.encrypted.clone()).await;
    let out = TempDir::new().unwrap();

    let cancel = CancellationToken::new();
    let on_complete = cancel.clone();
    let (pipeline, _) = test_pipeline();
    let pipeline = pipeline.with_events(Arc::new(move |event: &DownloadEvent| {
        if let DownloadEvent::StreamingProgressChanged(progress) = event {
            if progress.is_complete() {
                on_complete.cancel();
            }
        }
    }));

    let options = test_options(server.url("/book.aaxc"), &fixture);
    let err = pipeline
        .run(&options, &OutputTarget::new(out.path(), "Dune"), &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, LibationError::Cancelled), "got {:?}", err);
    assert!(list_dir(out.path()).is_empty());
}

#[tokio::test]
async fn test_rerun_is_byte_identical() {
    let fixture = build_book(512 * 1024, &["One", "Two"]).await;
    let server = TestServer::start(fixture.encrypted.clone()).await;
    let (pipeline, _) = test_pipeline();

    let mut options = test_options(server.url("/book.aaxc"), &fixture);
    options.fixup_file = true;
    options.strip_unabridged = true;

    let mut outputs = Vec::new();
    for _ in 0..2 {
        let out = TempDir::new().unwrap();
        let outcome = pipeline
            .run(&options, &OutputTarget::new(out.path(), "Dune"), &CancellationToken::new())
            .await
            .unwrap();
        outputs.push(std::fs::read(&outcome.files[0].path).unwrap());
    }
    assert_eq!(outputs[0], outputs[1]);
}

#[tokio::test]
async fn test_progress_events_are_ordered_and_bounded() {
    let fixture = build_book(1024 * 1024, &["One"]).await;
    let server = TestServer::start(fixture.encrypted.clone()).await;
    let out = TempDir::new().unwrap();

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let (pipeline, _) = test_pipeline();
    let pipeline = pipeline.with_events(Arc::new(move |event: &DownloadEvent| {
        sink.lock().unwrap().push(event.clone());
    }));

    let options = test_options(server.url("/book.aaxc"), &fixture);
    pipeline
        .run(&options, &OutputTarget::new(out.path(), "Dune"), &CancellationToken::new())
        .await
        .unwrap();

    let events = events.lock().unwrap();
    assert!(matches!(
        &events[0],
        DownloadEvent::StreamingBegin { label } if label == "B002V1OF70"
    ));

    let total = fixture.encrypted.len() as u64;
    let mut last: Option<u64> = None;
    for event in &events[1..] {
        let DownloadEvent::StreamingProgressChanged(progress) = event else {
            panic!("unexpected event {:?}", event);
        };
        assert_eq!(progress.total_bytes_to_receive, Some(total));
        if let Some(previous) = last {
            assert!(progress.bytes_received > previous);
        }
        assert!(progress.bytes_received <= total);
        last = Some(progress.bytes_received);
    }
    assert_eq!(last, Some(total));
}

#[tokio::test]
async fn test_cue_sheet_and_retained_encrypted_file() {
    let fixture = build_book(300 * 1024, &[]).await;
    let server = TestServer::start(fixture.encrypted.clone()).await;
    let out = TempDir::new().unwrap();
    let (pipeline, _) = test_pipeline();

    let mut options = test_options(server.url("/book.aaxc"), &fixture);
    options.create_cue_sheet = true;
    options.retain_encrypted_file = true;
    options.chapter_info = even_chapters(fixture.sample_count, &["A", "B", "C"]);

    let outcome = pipeline
        .run(&options, &OutputTarget::new(out.path(), "Dune"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(list_dir(out.path()), vec!["Dune.aaxc", "Dune.cue", "Dune.m4b"]);

    let cue = std::fs::read_to_string(outcome.cue_sheet.unwrap()).unwrap();
    assert!(cue.starts_with("FILE \"Dune.m4b\" MP4\n"));
    assert!(cue.contains("TRACK 03 AUDIO"));
    assert!(cue.contains("TITLE \"C\""));

    let retained = std::fs::read(outcome.retained_encrypted.unwrap()).unwrap();
    assert_eq!(retained, fixture.encrypted);
}

#[tokio::test]
async fn test_mp3_output_goes_through_encoder() {
    let fixture = build_book(128 * 1024, &[]).await;
    let server = TestServer::start(fixture.encrypted.clone()).await;
    let out = TempDir::new().unwrap();
    let (pipeline, encoder) = test_pipeline();

    let mut options = test_options(server.url("/book.aaxc"), &fixture);
    options.output_format = OutputFormat::Mp3;
    options.match_source_bitrate = true;

    pipeline
        .run(&options, &OutputTarget::new(out.path(), "Dune"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(list_dir(out.path()), vec!["Dune.mp3"]);
    let calls = encoder.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].format, OutputFormat::Mp3);
    assert_eq!(calls[0].bitrate_kbps, 64);
}

struct UnavailableRecords;

#[async_trait::async_trait]
impl RecordsSource for UnavailableRecords {
    async fn fetch_records(&self, _asin: &str) -> liberation_core::Result<Vec<AudibleRecord>> {
        Err(LibationError::transport("sidecar endpoint unavailable"))
    }
}

#[tokio::test]
async fn test_records_failure_is_only_a_warning() {
    let fixture = build_book(128 * 1024, &[]).await;
    let server = TestServer::start(fixture.encrypted.clone()).await;
    let out = TempDir::new().unwrap();
    let (pipeline, _) = test_pipeline();
    let pipeline = pipeline.with_records_source(Arc::new(UnavailableRecords));

    let mut options = test_options(server.url("/book.aaxc"), &fixture);
    options.download_clips_bookmarks = true;

    let outcome = pipeline
        .run(&options, &OutputTarget::new(out.path(), "Dune"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(list_dir(out.path()), vec!["Dune.m4b"]);
    assert!(outcome.records.is_none());
    assert_eq!(outcome.warnings.len(), 1);
    assert_eq!(outcome.warnings[0].sidecar, SidecarKind::ClipsAndBookmarks);
}

#[tokio::test]
async fn test_http_error_is_transport_error() {
    let fixture = build_book(64 * 1024, &[]).await;
    let server = TestServer::start(fixture.encrypted.clone()).await;
    let out = TempDir::new().unwrap();
    let (pipeline, _) = test_pipeline();

    let options = test_options(server.url("/missing"), &fixture);
    let err = pipeline
        .run(&options, &OutputTarget::new(out.path(), "Dune"), &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        LibationError::Transport { status, retryable, .. } => {
            assert_eq!(status, Some(404));
            assert!(!retryable);
        }
        other => panic!("expected transport error, got {:?}", other),
    }
    assert!(list_dir(out.path()).is_empty());
}

#[tokio::test]
async fn test_stalled_transfer_is_reported_frozen() {
    let fixture = build_book(256 * 1024, &["One"]).await;
    let server = TestServer::start(fixture.encrypted.clone()).await;
    let out = TempDir::new().unwrap();

    let mut config = test_config();
    config.freeze_after_secs = 1;
    config.read_timeout_secs = 3;
    let reports = Arc::new(Mutex::new(Vec::new()));
    let sink = reports.clone();
    let pipeline = liberation_core::Pipeline::new(config, Arc::new(CopyEncoder::default()))
        .unwrap()
        .with_freeze_handler(Arc::new(move |report: &FreezeReport| {
            sink.lock().unwrap().push(report.elapsed);
        }));

    let options = test_options(server.url("/stall"), &fixture);
    let err = pipeline
        .run(&options, &OutputTarget::new(out.path(), "Dune"), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(err.is_retryable(), "got {:?}", err);
    let reports = reports.lock().unwrap();
    assert!(!reports.is_empty());
    assert!(reports.iter().all(|elapsed| *elapsed >= Duration::from_secs(1)));
    assert!(list_dir(out.path()).is_empty());
}

#[tokio::test]
async fn test_download_speed_cap_slows_transfer() {
    let fixture = build_book(300 * 1024, &["One"]).await;
    let server = TestServer::start(fixture.encrypted.clone()).await;
    let out = TempDir::new().unwrap();
    let (pipeline, _) = test_pipeline();

    let cap = 150_000u64;
    let mut options = test_options(server.url("/book.aaxc"), &fixture);
    options.download_speed_bps = cap;

    let start = Instant::now();
    let outcome = pipeline
        .run(&options, &OutputTarget::new(out.path(), "Dune"), &CancellationToken::new())
        .await
        .unwrap();
    let elapsed = start.elapsed();

    let minimum = Duration::from_secs_f64(fixture.encrypted.len() as f64 / cap as f64 * 0.9);
    assert!(elapsed >= minimum, "took {:?}, expected at least {:?}", elapsed, minimum);
    let written = std::fs::read(&outcome.files[0].path).unwrap();
    assert!(written.ends_with(&fixture.sample_data));
}
