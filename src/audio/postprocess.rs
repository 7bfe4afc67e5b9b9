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


//! Post-processing of the decrypted container
//!
//! # Steps
//! 1. Parse the container (`Format` error if corrupt)
//! 2. Choose chapters: catalog chapters when supplied, else the embedded
//!    `chpl` list
//! 3. Align chapters to sample boundaries, trimming when requested
//! 4. Strip "(Unabridged)" from title and album
//! 5. Best-effort fixup of durations, chapter list and media type
//! 6. Resolve encoder settings from the source format
//!
//! Nothing here touches audio bytes. The result is a model whose sample
//! offsets still point into the decrypted file.

use super::chapters::{align_chapters, ChapterAlignment, ChapterInfo};
use super::container::{Container, SourceFormat};
use super::encoder::EncoderSettings;
use super::metadata::{strip_unabridged_tags, MEDIA_TYPE_AUDIOBOOK};
use crate::download::DownloadOptions;
use crate::error::Result;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

/// Decrypted book ready to be written or split
#[derive(Debug, Clone)]
pub struct ProcessedAudio {
    /// Output model; sample offsets refer to `source_path`
    pub container: Container,
    pub source_path: PathBuf,
    /// Chapters in output sample indices
    pub alignment: ChapterAlignment,
    /// Chapters of the output, in milliseconds
    pub chapters: ChapterInfo,
    pub source_format: SourceFormat,
    pub settings: EncoderSettings,
    /// Drift and dropped-chapter notes from alignment
    pub notes: Vec<String>,
}

pub struct PostProcessor<'a> {
    options: &'a DownloadOptions,
}

impl<'a> PostProcessor<'a> {
    pub fn new(options: &'a DownloadOptions) -> Self {
        Self { options }
    }

    /// Build the output model for the decrypted file at `plaintext`
    ///
    /// Deterministic for identical input bytes and options.
    ///
    /// # Errors
    /// - `Format` - unrecognized or corrupt container structure
    #[instrument(skip_all, fields(path = %plaintext.display()))]
    pub async fn process(&self, plaintext: &Path) -> Result<ProcessedAudio> {
        let container = Container::read(plaintext).await?;
        self.process_container(container, plaintext.to_path_buf())
    }

    pub(crate) fn process_container(
        &self,
        mut container: Container,
        source_path: PathBuf,
    ) -> Result<ProcessedAudio> {
        let options = self.options;
        let source_format = container.source_format()?;
        debug!(?source_format, "Source format");

        let info = if options.chapter_info.is_empty() {
            let total_ms = container.duration()?.as_millis() as u64;
            debug!(embedded = container.chapters.len(), "Using embedded chapters");
            ChapterInfo::from_marks(&container.chapters, total_ms)
        } else {
            options.chapter_info.clone()
        };

        let trim = options.trim_output_to_chapter_length;
        let alignment = align_chapters(&info, &container, trim)?;
        let sample_count = container.track.samples.len();

        let rewrite_chapters = trim || options.fixup_file;
        if alignment.kept != (0..sample_count) {
            info!(
                kept = ?alignment.kept,
                of = sample_count,
                "Trimming audio to chapter bounds"
            );
            container = container.slice(alignment.kept.clone())?;
        }
        let alignment = alignment.rebased();

        if rewrite_chapters && !alignment.chapters.is_empty() {
            container.chapters = alignment.marks();
        }

        if options.strip_unabridged && strip_unabridged_tags(&mut container.tags) {
            debug!("Stripped unabridged marker");
        }

        if options.fixup_file {
            container = fixup_or_keep(container);
        }

        let chapters = if alignment.chapters.is_empty() {
            info
        } else {
            alignment.to_chapter_info()
        };

        Ok(ProcessedAudio {
            settings: EncoderSettings::resolve(&source_format, options),
            notes: alignment.notes.clone(),
            container,
            source_path,
            alignment,
            chapters,
            source_format,
        })
    }
}

/// Metadata repair; the container is usable either way
fn fixup(container: &mut Container) -> Result<()> {
    if container.has_inconsistent_durations() {
        debug!(
            header = container.track.media_duration,
            samples = container.total_media_ticks(),
            "Header durations disagree with sample table"
        );
    }
    container.recompute_durations()?;
    container.tags.set_media_type(MEDIA_TYPE_AUDIOBOOK);
    Ok(())
}

/// Apply [`fixup`] to a copy, returning the original when it fails
fn fixup_or_keep(container: Container) -> Container {
    let mut fixed = container.clone();
    match fixup(&mut fixed) {
        Ok(()) => fixed,
        Err(e) => {
            warn!(error = %e, "Metadata fixup failed, keeping file as decrypted");
            container
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::chapters::Chapter;
    use crate::audio::container::{ChapterMark, Sample, SampleEntry};
    use crate::audio::metadata::keys;

    /// 100 one-second samples at 1000 Hz
    fn container() -> Container {
        let samples = (0..100)
            .map(|i| Sample {
                offset: 100 + i * 10,
                size: 10,
                duration: 1000,
            })
            .collect();
        let mut entry = SampleEntry::aac(2, 44100, 64_000);
        entry.sample_rate = 1000;
        let mut container = Container::new(entry, samples);
        container.tags.set_text(keys::TITLE, "Dune (Unabridged)");
        container.chapters = vec![
            ChapterMark {
                start: 0,
                title: "Embedded 1".to_string(),
            },
            ChapterMark {
                start: 50 * 10_000_000,
                title: "Embedded 2".to_string(),
            },
        ];
        container
    }

    fn process(options: &DownloadOptions, container: Container) -> ProcessedAudio {
        PostProcessor::new(options)
            .process_container(container, PathBuf::from("plain.m4b"))
            .unwrap()
    }

    #[test]
    fn test_defaults_leave_container_alone() {
        let options = DownloadOptions::for_test();
        let original = container();
        let processed = process(&options, original.clone());

        assert_eq!(processed.container.track.samples, original.track.samples);
        assert_eq!(processed.container.chapters, original.chapters);
        assert_eq!(processed.container.tags, original.tags);
        assert_eq!(processed.chapters.chapters.len(), 2);
        assert_eq!(processed.chapters.chapters[1].title, "Embedded 2");
    }

    #[test]
    fn test_trim_uses_catalog_chapters() {
        let mut options = DownloadOptions::for_test();
        options.trim_output_to_chapter_length = true;
        options.chapter_info = ChapterInfo::new(vec![
            Chapter::new("One", 5_000, 40_000),
            Chapter::new("Two", 45_000, 45_000),
        ]);

        let processed = process(&options, container());
        assert_eq!(processed.container.track.samples.len(), 85);
        assert_eq!(processed.container.track.samples[0].offset, 150);
        assert_eq!(processed.alignment.kept, 0..85);
        assert_eq!(processed.container.chapters.len(), 2);
        assert_eq!(processed.container.chapters[1].start_ms(), 40_000);
        assert_eq!(processed.chapters.chapters[1].start_offset_ms, 40_000);
        assert_eq!(processed.container.track.media_duration, 85_000);
    }

    #[test]
    fn test_strip_unabridged_toggle() {
        let mut options = DownloadOptions::for_test();
        let kept = process(&options, container());
        assert_eq!(
            kept.container.tags.text(&keys::TITLE).as_deref(),
            Some("Dune (Unabridged)")
        );

        options.strip_unabridged = true;
        let stripped = process(&options, container());
        assert_eq!(stripped.container.tags.text(&keys::TITLE).as_deref(), Some("Dune"));
    }

    #[test]
    fn test_fixup_repairs_durations() {
        let mut options = DownloadOptions::for_test();
        options.fixup_file = true;

        let mut broken = container();
        broken.track.media_duration = 1;
        broken.movie.duration = 1;
        let processed = process(&options, broken);

        assert_eq!(processed.container.track.media_duration, 100_000);
        assert!(!processed.container.has_inconsistent_durations());
        assert!(processed.container.tags.items().iter().any(|i| i.key == keys::MEDIA_TYPE));
    }

    #[test]
    fn test_failed_fixup_keeps_original() {
        let mut unusable = container();
        unusable.track.media_timescale = 0;
        unusable.track.entry.sample_rate = 0;

        let kept = fixup_or_keep(unusable.clone());
        assert_eq!(kept.track, unusable.track);
        assert_eq!(kept.tags, unusable.tags);
    }

    #[test]
    fn test_encoder_settings_resolved() {
        let mut options = DownloadOptions::for_test();
        options.downsample = true;
        let processed = process(&options, container());
        assert_eq!(processed.source_format.sample_rate, 1000);
        // Already below every downsample target
        assert_eq!(processed.settings.sample_rate, 1000);
        assert!(!processed.settings.needs_reencode());
    }
}
