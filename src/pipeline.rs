// LibriSync - Audible Library Sync for Mobile
// Copyright (C) 2025 Henning Berge
//
// This program is a Rust port of Libation (https://github.com/rmcrackan/Libation)
// Original work Copyright (C) Libation contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Download, decrypt and post-process one book
//!
//! # Stages
//! ```text
//! fetch ──► decrypt ──► post-process ──► write / split ──► sidecars ──► commit
//! ```
//! Stages run strictly in this order. Every intermediate file lives in a
//! per-run [`WorkDir`] that is removed on every exit path. Final files are
//! moved into the output directory only after all fatal stages succeeded,
//! so a failed or cancelled run leaves nothing at the final paths.
//!
//! Sidecar failures (cue sheet, clips and bookmarks, part-name clashes) are
//! collected as [`SidecarWarning`]s on the outcome instead of failing the run.

use crate::audio::encoder::{AudioEncoder, EncoderSettings};
use crate::audio::postprocess::{PostProcessor, ProcessedAudio};
use crate::audio::split::{split, PartNaming};
use crate::audio::container::Container;
use crate::config::PipelineConfig;
use crate::crypto::EnvelopeDecrypter;
use crate::download::manager::AggregateStats;
use crate::download::options::{DownloadOptions, OutputLayout, OutputTarget};
use crate::download::progress::{
    reporter_callback, watch_for_freeze, DownloadEvent, EventCallback, FreezeReport,
    ProgressReporter,
};
use crate::download::stream::{FetchRequest, Fetcher};
use crate::download::throttle::Throttle;
use crate::error::{LibationError, Result, SidecarKind, SidecarWarning};
use crate::file::manager::{FileManager, WorkDir};
use crate::sidecar::cue::extract_cue_sheet;
use crate::sidecar::records::{records_path, save_clips_and_bookmarks, RecordsSource};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{BufReader, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// How often a subscribed progress reporter is checked for a stall
const FREEZE_CHECK_PERIOD: Duration = Duration::from_secs(1);

/// Extension of a retained encrypted download
const ENCRYPTED_EXTENSION: &str = "aaxc";

// ============================================================================
// OUTCOME
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputFile {
    pub path: PathBuf,
    pub title: String,
    pub bytes: u64,
}

/// Everything a successful run produced
#[derive(Debug, Clone, Default, Serialize)]
pub struct LiberationOutcome {
    /// Audio files in part order
    pub files: Vec<OutputFile>,
    pub cue_sheet: Option<PathBuf>,
    pub records: Option<PathBuf>,
    pub retained_encrypted: Option<PathBuf>,
    pub warnings: Vec<SidecarWarning>,
    /// Chapter drift and dropped-chapter notes
    pub notes: Vec<String>,
}

/// Called on every freeze-watch tick while a transfer is stalled
pub type FreezeCallback = Arc<dyn Fn(&FreezeReport) + Send + Sync>;

/// An audio file written in the work directory, waiting for commit
struct StagedAudio {
    staged: PathBuf,
    file_name: String,
    title: String,
    bytes: u64,
}

// ============================================================================
// PIPELINE
// ============================================================================

pub struct Pipeline {
    config: PipelineConfig,
    fetcher: Fetcher,
    files: FileManager,
    encoder: Arc<dyn AudioEncoder>,
    events: Option<EventCallback>,
    reporter: Option<Arc<Mutex<ProgressReporter>>>,
    on_freeze: Option<FreezeCallback>,
    records: Option<Arc<dyn RecordsSource>>,
}

impl Pipeline {
    /// # Errors
    /// - `InvalidInput` - `config` fails validation
    /// - `Transport` - the HTTP client could not be built
    pub fn new(config: PipelineConfig, encoder: Arc<dyn AudioEncoder>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            fetcher: Fetcher::new(&config)?,
            files: FileManager::new(config.temp_dir.clone()),
            config,
            encoder,
            events: None,
            reporter: None,
            on_freeze: None,
            records: None,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Subscribe to `StreamingBegin` / `StreamingProgressChanged`
    pub fn with_events(mut self, events: EventCallback) -> Self {
        self.events = Some(events);
        self
    }

    /// Check `reporter` for stalls instead of a per-run reporter
    ///
    /// Events are not routed to a supplied reporter automatically; combine
    /// it with [`reporter_callback`]. Its own threshold applies. Without
    /// one, each run gets a reporter using
    /// [`PipelineConfig::freeze_threshold`].
    pub fn with_progress_reporter(mut self, reporter: Arc<Mutex<ProgressReporter>>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Notify `on_freeze` while a transfer is stalled
    pub fn with_freeze_handler(mut self, on_freeze: FreezeCallback) -> Self {
        self.on_freeze = Some(on_freeze);
        self
    }

    pub fn with_records_source(mut self, source: Arc<dyn RecordsSource>) -> Self {
        self.records = Some(source);
        self
    }

    pub fn with_stats(mut self, stats: Arc<AggregateStats>) -> Self {
        self.fetcher = self.fetcher.with_stats(stats);
        self
    }

    pub fn with_shared_throttle(mut self, throttle: Arc<Throttle>) -> Self {
        self.fetcher = self.fetcher.with_shared_throttle(throttle);
        self
    }

    /// Liberate one book into `target`
    ///
    /// # Arguments
    /// * `options` - Per-book options, read only
    /// * `target` - Output directory and base file name
    /// * `cancel` - Observed at every suspension point
    ///
    /// # Errors
    /// - `InvalidInput` - options fail validation
    /// - `Transport` - download failed (caller may retry)
    /// - `Decryption` / `Format` / `Encoder` - fatal for this book
    /// - `Cancelled`
    #[instrument(skip_all, fields(label = options.label(), dir = %target.directory.display()))]
    pub async fn run(
        &self,
        options: &DownloadOptions,
        target: &OutputTarget,
        cancel: &CancellationToken,
    ) -> Result<LiberationOutcome> {
        options.validate()?;
        let stem = options.replacement_characters.sanitize(&target.file_stem);
        if stem.is_empty() {
            return Err(LibationError::InvalidInput(format!(
                "Output name '{}' is empty after sanitizing",
                target.file_stem
            )));
        }

        let work = self.files.create_work_dir(&target.directory).await?;
        let encrypted = self.encrypted_path(&work, target, &stem);

        let result = self
            .run_stages(options, target, &stem, &work, &encrypted, cancel)
            .await;

        let keep_partial = self.config.resume_partial_downloads
            && matches!(
                result,
                Err(LibationError::Transport { .. } | LibationError::Cancelled)
            );
        if !keep_partial {
            let _ = tokio::fs::remove_file(&encrypted).await;
        }
        if let Err(e) = work.remove().await {
            warn!(error = %e, "Failed to remove work directory");
        }

        match &result {
            Ok(outcome) => info!(files = outcome.files.len(), warnings = outcome.warnings.len(), "Book liberated"),
            Err(e) => warn!(error = %e, "Liberation failed"),
        }
        result
    }

    /// Encrypted download path; outside the work directory when resuming so
    /// a partial file survives the run
    fn encrypted_path(&self, work: &WorkDir, target: &OutputTarget, stem: &str) -> PathBuf {
        let name = format!("{}.{}.part", stem, ENCRYPTED_EXTENSION);
        if self.config.resume_partial_downloads {
            let root = self.config.temp_dir.as_deref().unwrap_or(&target.directory);
            root.join(name)
        } else {
            work.join(name)
        }
    }

    async fn run_stages(
        &self,
        options: &DownloadOptions,
        target: &OutputTarget,
        stem: &str,
        work: &WorkDir,
        encrypted: &Path,
        cancel: &CancellationToken,
    ) -> Result<LiberationOutcome> {
        // Fetch
        self.fetch(options, encrypted, cancel).await?;

        // Decrypt
        let plaintext = work.join("decrypted.m4b");
        decrypt_file(options, encrypted, &plaintext, cancel).await?;

        // Post-process
        let processed = PostProcessor::new(options).process(&plaintext).await?;
        if cancel.is_cancelled() {
            return Err(LibationError::Cancelled);
        }

        // Write or split
        let mut warnings = Vec::new();
        let audio = match options.output_layout {
            OutputLayout::SingleFile => {
                let file_name = format!("{}.{}", stem, options.output_format.extension());
                let title = options.title.clone();
                vec![
                    self.write_audio(&processed.container, &processed, work, "single", file_name, title, cancel)
                        .await?,
                ]
            }
            OutputLayout::MultiPart => {
                let book_title = if options.title.is_empty() {
                    target.file_stem.as_str()
                } else {
                    options.title.as_str()
                };
                let naming = PartNaming {
                    book_title,
                    replacement: options.replacement_characters,
                    extension: options.output_format.extension(),
                };
                let output = split(&processed.container, &processed.alignment, &naming)?;
                warnings.extend(output.warnings);

                let mut staged = Vec::with_capacity(output.parts.len());
                for part in output.parts {
                    let label = format!("part-{:04}", part.index);
                    staged.push(
                        self.write_audio(&part.container, &processed, work, &label, part.file_name, part.title, cancel)
                            .await?,
                    );
                }
                staged
            }
        };

        // Sidecars
        let book_file_name = format!("{}.{}", stem, options.output_format.extension());
        let (cue, records) = tokio::join!(
            self.write_cue_sheet(options, &processed, work, stem, &book_file_name),
            self.write_records(options, work, &book_file_name),
        );
        let cue = sidecar_result(cue, SidecarKind::CueSheet, &mut warnings);
        let records = sidecar_result(records, SidecarKind::ClipsAndBookmarks, &mut warnings);

        if cancel.is_cancelled() {
            return Err(LibationError::Cancelled);
        }

        // Commit audio as a unit
        let staged: Vec<(PathBuf, PathBuf)> = audio
            .iter()
            .map(|a| (a.staged.clone(), target.directory.join(&a.file_name)))
            .collect();
        let placed = self.files.commit(&staged).await?;
        let files = audio
            .into_iter()
            .zip(placed)
            .map(|(a, path)| OutputFile {
                path,
                title: a.title,
                bytes: a.bytes,
            })
            .collect();

        // Sidecars are committed one by one; a failure only costs that sidecar
        let cue_sheet = self.commit_sidecar(cue, target, SidecarKind::CueSheet, &mut warnings).await;
        let records = self
            .commit_sidecar(records, target, SidecarKind::ClipsAndBookmarks, &mut warnings)
            .await;

        let retained_encrypted = if options.retain_encrypted_file {
            let dest = target.directory.join(format!("{}.{}", stem, ENCRYPTED_EXTENSION));
            match self.files.commit(&[(encrypted.to_path_buf(), dest)]).await {
                Ok(mut placed) => placed.pop(),
                Err(e) => {
                    warn!(error = %e, "Failed to retain encrypted file");
                    None
                }
            }
        } else {
            None
        };

        Ok(LiberationOutcome {
            files,
            cue_sheet,
            records,
            retained_encrypted,
            warnings,
            notes: processed.notes,
        })
    }

    async fn fetch(&self, options: &DownloadOptions, encrypted: &Path, cancel: &CancellationToken) -> Result<u64> {
        let mut request = FetchRequest::new(options.download_url.clone());
        request.user_agent = options.user_agent.clone();
        request.speed_cap_bps = options.download_speed_bps;
        if !options.label().is_empty() {
            request.label = options.label().to_string();
        }

        let (reporter, events) = match &self.reporter {
            Some(reporter) => (reporter.clone(), self.events.clone()),
            None => {
                let reporter = Arc::new(Mutex::new(ProgressReporter::with_threshold(
                    self.config.freeze_threshold(),
                )));
                let feed = reporter_callback(reporter.clone());
                let subscriber = self.events.clone();
                let events: EventCallback = Arc::new(move |event: &DownloadEvent| {
                    feed(event);
                    if let Some(subscriber) = &subscriber {
                        subscriber(event);
                    }
                });
                (reporter, Some(events))
            }
        };

        let watcher_cancel = cancel.child_token();
        let on_freeze = self.on_freeze.clone();
        let watcher = tokio::spawn(watch_for_freeze(
            reporter,
            FREEZE_CHECK_PERIOD,
            watcher_cancel.clone(),
            move |report| {
                if let Some(on_freeze) = &on_freeze {
                    on_freeze(&report);
                }
            },
        ));

        let result = self
            .fetcher
            .download_to_file(
                &request,
                encrypted,
                self.config.resume_partial_downloads,
                events.as_ref(),
                cancel,
            )
            .await;

        watcher_cancel.cancel();
        let _ = watcher.await;
        result
    }

    /// Write `container` into the work directory, re-encoding if needed
    #[allow(clippy::too_many_arguments)]
    async fn write_audio(
        &self,
        container: &Container,
        processed: &ProcessedAudio,
        work: &WorkDir,
        label: &str,
        file_name: String,
        title: String,
        cancel: &CancellationToken,
    ) -> Result<StagedAudio> {
        let settings: &EncoderSettings = &processed.settings;
        let copied = work.join(format!("{}.m4b", label));
        let mut bytes = container.write(&processed.source_path, &copied, cancel).await?;

        let staged = if settings.needs_reencode() {
            let encoded = work.join(format!("{}.encoded.{}", label, settings.format.extension()));
            self.encoder.encode(&copied, &encoded, settings, cancel).await?;
            bytes = tokio::fs::metadata(&encoded).await?.len();
            let _ = tokio::fs::remove_file(&copied).await;
            encoded
        } else {
            copied
        };

        debug!(file = %file_name, bytes, "Audio staged");
        Ok(StagedAudio {
            staged,
            file_name,
            title,
            bytes,
        })
    }

    async fn write_cue_sheet(
        &self,
        options: &DownloadOptions,
        processed: &ProcessedAudio,
        work: &WorkDir,
        stem: &str,
        audio_file_name: &str,
    ) -> Result<Option<(PathBuf, String)>> {
        if !options.create_cue_sheet {
            return Ok(None);
        }
        if options.output_layout == OutputLayout::MultiPart {
            info!("Cue sheets are only written for single-file output");
            return Ok(None);
        }

        let text = extract_cue_sheet(audio_file_name, options.output_format, &processed.chapters);
        let name = format!("{}.cue", stem);
        let staged = work.join(&name);
        tokio::fs::write(&staged, text).await?;
        Ok(Some((staged, name)))
    }

    async fn write_records(
        &self,
        options: &DownloadOptions,
        work: &WorkDir,
        audio_file_name: &str,
    ) -> Result<Option<(PathBuf, String)>> {
        if !options.download_clips_bookmarks {
            return Ok(None);
        }
        let source = self.records.as_deref().ok_or_else(|| {
            LibationError::InvalidState("No clips and bookmarks source configured".to_string())
        })?;

        let audio = work.join(audio_file_name);
        let saved = save_clips_and_bookmarks(source, &options.asin, &audio, options.records_format, true).await?;
        Ok(saved.map(|staged| {
            let name = records_path(Path::new(audio_file_name), options.records_format)
                .to_string_lossy()
                .into_owned();
            (staged, name)
        }))
    }

    async fn commit_sidecar(
        &self,
        staged: Option<(PathBuf, String)>,
        target: &OutputTarget,
        kind: SidecarKind,
        warnings: &mut Vec<SidecarWarning>,
    ) -> Option<PathBuf> {
        let (source, name) = staged?;
        match self.files.commit(&[(source, target.directory.join(name))]).await {
            Ok(mut placed) => placed.pop(),
            Err(e) => {
                warn!(?kind, error = %e, "Failed to place sidecar");
                warnings.push(SidecarWarning::new(kind, e.to_string()));
                None
            }
        }
    }
}

/// Decrypt `encrypted` into `plaintext`
///
/// The partial plaintext file is removed on failure.
async fn decrypt_file(
    options: &DownloadOptions,
    encrypted: &Path,
    plaintext: &Path,
    cancel: &CancellationToken,
) -> Result<u64> {
    let decrypter = EnvelopeDecrypter::new(&options.decryption_key);
    let mut reader = BufReader::new(File::open(encrypted).await?);
    let mut writer = BufWriter::new(File::create(plaintext).await?);

    let result = decrypter.decrypt(&mut reader, &mut writer, cancel).await;
    drop(writer);
    if result.is_err() {
        let _ = tokio::fs::remove_file(plaintext).await;
    }
    result
}

/// Turn a sidecar stage result into a value, recording failures as warnings
fn sidecar_result<T>(
    result: Result<Option<T>>,
    kind: SidecarKind,
    warnings: &mut Vec<SidecarWarning>,
) -> Option<T> {
    match result {
        Ok(value) => value,
        Err(e) => {
            warn!(?kind, error = %e, "Sidecar failed");
            warnings.push(SidecarWarning::new(kind, e.to_string()));
            None
        }
    }
}
