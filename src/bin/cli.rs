//! Desktop CLI for the liberation pipeline
//!
//! ```bash
//! RUST_LOG=debug liberation-cli --url https://cdn.example.com/b.aaxc \
//!     --key 000102... --iv 0f0e0d... --output ~/Books --name "Dune" --cue
//! ```

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use liberation_core::audio::chapters::ChapterInfo;
use liberation_core::audio::encoder::{FfmpegEncoder, OutputFormat};
use liberation_core::crypto::DecryptionKey;
use liberation_core::download::progress::{reporter_callback, ProgressReporter};
use liberation_core::download::{DownloadEvent, DownloadOptions, OutputLayout, OutputTarget};
use liberation_core::{Pipeline, PipelineConfig};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "liberation-cli")]
#[command(about = "Download and decrypt an audiobook")]
struct Cli {
    /// Signed content URL
    #[arg(long)]
    url: String,

    /// Key, hex or base64
    #[arg(long)]
    key: String,

    /// IV, hex or base64
    #[arg(long)]
    iv: String,

    /// Output directory
    #[arg(long, short)]
    output: PathBuf,

    /// Output file name without extension
    #[arg(long, default_value = "book")]
    name: String,

    /// Book title for tags and part names
    #[arg(long, default_value = "")]
    title: String,

    /// Write MP3 instead of M4B
    #[arg(long, default_value_t = false)]
    mp3: bool,

    /// One file per chapter
    #[arg(long, default_value_t = false)]
    split: bool,

    #[arg(long, default_value_t = false)]
    cue: bool,

    /// Trim audio to the first and last chapter
    #[arg(long, default_value_t = false)]
    trim: bool,

    #[arg(long, default_value_t = false)]
    fixup: bool,

    #[arg(long, default_value_t = false)]
    strip_unabridged: bool,

    #[arg(long, default_value_t = false)]
    retain_encrypted: bool,

    /// Download speed cap in bytes per second
    #[arg(long, default_value_t = 0)]
    speed_cap: u64,

    /// Chapter info JSON from the content metadata endpoint
    #[arg(long)]
    chapters: Option<PathBuf>,

    /// Pipeline configuration JSON
    #[arg(long)]
    config: Option<PathBuf>,
}

fn init_tracing() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| anyhow!("Failed to create env filter: {e}"))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(env_filter)
        .try_init()
        .map_err(|e| anyhow!("Failed to initialize tracing: {e}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => PipelineConfig::from_json_file(path)
            .await
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => PipelineConfig::default(),
    };

    let key = DecryptionKey::from_voucher(&cli.key, &cli.iv).context("Invalid key or IV")?;
    let mut options = DownloadOptions::new(cli.url.clone(), key);
    options.title = cli.title.clone();
    options.output_format = if cli.mp3 { OutputFormat::Mp3 } else { OutputFormat::M4b };
    options.output_layout = if cli.split { OutputLayout::MultiPart } else { OutputLayout::SingleFile };
    options.create_cue_sheet = cli.cue;
    options.trim_output_to_chapter_length = cli.trim;
    options.fixup_file = cli.fixup;
    options.strip_unabridged = cli.strip_unabridged;
    options.retain_encrypted_file = cli.retain_encrypted;
    options.download_speed_bps = cli.speed_cap;
    if let Some(path) = &cli.chapters {
        let json = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        options.chapter_info = serde_json::from_str::<ChapterInfo>(&json)
            .with_context(|| format!("Invalid chapter info in {}", path.display()))?;
    }

    let reporter = Arc::new(Mutex::new(ProgressReporter::with_threshold(config.freeze_threshold())));
    let feed = reporter_callback(reporter.clone());
    let printer = reporter.clone();
    let events = Arc::new(move |event: &DownloadEvent| {
        feed(event);
        if let DownloadEvent::StreamingProgressChanged(_) = event {
            let snapshot = printer.lock().unwrap_or_else(|e| e.into_inner()).snapshot();
            match snapshot.percent {
                Some(percent) => eprint!(
                    "\r{:>3}%  {:>8} KiB/s",
                    percent,
                    snapshot.bytes_per_second / 1024
                ),
                None => eprint!("\r{} bytes", snapshot.bytes_received),
            }
        }
    });

    let pipeline = Pipeline::new(config, Arc::new(FfmpegEncoder::new()))?
        .with_events(events)
        .with_progress_reporter(reporter);

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let target = OutputTarget::new(cli.output.clone(), cli.name.clone());
    let outcome = pipeline.run(&options, &target, &cancel).await?;
    eprintln!();

    for file in &outcome.files {
        println!("{}", file.path.display());
    }
    for path in [&outcome.cue_sheet, &outcome.records, &outcome.retained_encrypted]
        .into_iter()
        .flatten()
    {
        println!("{}", path.display());
    }
    for warning in &outcome.warnings {
        eprintln!("warning: {}", warning);
    }
    Ok(())
}
