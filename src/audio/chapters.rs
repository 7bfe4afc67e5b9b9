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


//! Chapter metadata and alignment to audio samples
//!
//! Catalog chapter offsets are in milliseconds and rarely land exactly on a
//! frame boundary; the encoded audio also tends to run a little longer or
//! shorter than the declared runtime. [`align_chapters`] snaps every chapter
//! start to the nearest sample and lets the last chapter absorb the drift,
//! so the aligned chapters always tile the output audio exactly.

use super::container::{ChapterMark, Container, CHPL_UNITS_PER_SECOND};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use tracing::{debug, warn};

/// Declared runtime and actual audio length may differ by this much silently
const DRIFT_WARN_MS: u64 = 1000;

// ============================================================================
// CATALOG CHAPTERS
// ============================================================================

/// Chapter information as returned by the content metadata endpoint
///
/// # Example JSON
/// ```json
/// {
///   "brandIntroDurationMs": 2043,
///   "brandOutroDurationMs": 5061,
///   "is_accurate": true,
///   "runtime_length_ms": 39843000,
///   "chapters": [
///     { "title": "Opening Credits", "start_offset_ms": 0, "length_ms": 15000 }
///   ]
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterInfo {
    #[serde(rename = "brandIntroDurationMs", default)]
    pub brand_intro_duration_ms: u64,
    #[serde(rename = "brandOutroDurationMs", default)]
    pub brand_outro_duration_ms: u64,
    #[serde(default)]
    pub is_accurate: bool,
    #[serde(default)]
    pub runtime_length_ms: u64,
    #[serde(default)]
    pub chapters: Vec<Chapter>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    pub title: String,
    pub start_offset_ms: u64,
    pub length_ms: u64,
    /// Sub-chapters ("Tree" chapter titles)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chapters: Vec<Chapter>,
}

impl Chapter {
    pub fn new(title: impl Into<String>, start_offset_ms: u64, length_ms: u64) -> Self {
        Self {
            title: title.into(),
            start_offset_ms,
            length_ms,
            chapters: Vec::new(),
        }
    }

    /// Saturates for catalog lengths that run past `u64::MAX`
    pub fn end_offset_ms(&self) -> u64 {
        self.start_offset_ms.saturating_add(self.length_ms)
    }
}

impl ChapterInfo {
    pub fn new(chapters: Vec<Chapter>) -> Self {
        let runtime_length_ms = chapters.last().map(Chapter::end_offset_ms).unwrap_or(0);
        Self {
            chapters,
            runtime_length_ms,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chapters.is_empty()
    }

    /// Depth-first list of leaf-level chapters
    ///
    /// A parent keeps the span before its first sub-chapter, when it has one.
    pub fn flatten(&self) -> Vec<Chapter> {
        fn walk(chapters: &[Chapter], out: &mut Vec<Chapter>) {
            for chapter in chapters {
                match chapter.chapters.first() {
                    None => out.push(Chapter::new(
                        chapter.title.clone(),
                        chapter.start_offset_ms,
                        chapter.length_ms,
                    )),
                    Some(first) => {
                        let lead = first.start_offset_ms.saturating_sub(chapter.start_offset_ms);
                        if lead > 0 {
                            out.push(Chapter::new(chapter.title.clone(), chapter.start_offset_ms, lead));
                        }
                        walk(&chapter.chapters, out);
                    }
                }
            }
        }

        let mut flat = Vec::new();
        walk(&self.chapters, &mut flat);
        flat
    }

    /// Rebuild chapter info from embedded `chpl` markers
    pub fn from_marks(marks: &[ChapterMark], total_ms: u64) -> Self {
        let chapters = marks
            .iter()
            .enumerate()
            .map(|(i, mark)| {
                let start = mark.start_ms();
                let end = marks.get(i + 1).map(ChapterMark::start_ms).unwrap_or(total_ms);
                Chapter::new(mark.title.clone(), start, end.saturating_sub(start))
            })
            .collect();
        Self {
            runtime_length_ms: total_ms,
            ..Self::new(chapters)
        }
    }
}

// ============================================================================
// ALIGNMENT
// ============================================================================

/// A chapter snapped to sample boundaries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlignedChapter {
    pub title: String,
    /// Sample indices in the aligned container
    pub samples: Range<usize>,
    /// Offset from the start of the output, in media ticks
    pub start_ticks: u64,
    pub end_ticks: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterAlignment {
    pub chapters: Vec<AlignedChapter>,
    /// Source samples that make up the output
    pub kept: Range<usize>,
    pub timescale: u32,
    /// Human-readable notes about dropped chapters and drift
    pub notes: Vec<String>,
}

impl ChapterAlignment {
    /// `chpl` markers for the aligned output
    pub fn marks(&self) -> Vec<ChapterMark> {
        self.chapters
            .iter()
            .map(|c| ChapterMark {
                start: ticks_to(c.start_ticks, self.timescale, CHPL_UNITS_PER_SECOND),
                title: c.title.clone(),
            })
            .collect()
    }

    /// Chapter info describing the output file, used for sidecars
    pub fn to_chapter_info(&self) -> ChapterInfo {
        let chapters = self
            .chapters
            .iter()
            .map(|c| {
                let start = ticks_to(c.start_ticks, self.timescale, 1000);
                let end = ticks_to(c.end_ticks, self.timescale, 1000);
                Chapter::new(c.title.clone(), start, end - start)
            })
            .collect();
        ChapterInfo {
            is_accurate: true,
            ..ChapterInfo::new(chapters)
        }
    }

    /// Shift sample ranges so `kept.start` becomes sample zero
    pub fn rebased(mut self) -> Self {
        let offset = self.kept.start;
        for chapter in &mut self.chapters {
            chapter.samples = chapter.samples.start - offset..chapter.samples.end - offset;
        }
        self.kept = 0..self.kept.end - offset;
        self
    }
}

fn ms_to_ticks(ms: u64, timescale: u32) -> u64 {
    u64::try_from(ms as u128 * timescale as u128 / 1000).unwrap_or(u64::MAX)
}

fn ticks_to(ticks: u64, timescale: u32, units_per_second: u64) -> u64 {
    u64::try_from(ticks as u128 * units_per_second as u128 / timescale as u128).unwrap_or(u64::MAX)
}

/// Index of the sample boundary closest to `tick`
///
/// `starts` holds every sample start plus the end tick, so the result is in
/// `0..=sample_count`.
fn nearest_boundary(starts: &[u64], tick: u64) -> usize {
    let after = starts.partition_point(|&s| s < tick);
    if after == 0 {
        return 0;
    }
    if after >= starts.len() {
        return starts.len() - 1;
    }
    let before = after - 1;
    if tick - starts[before] <= starts[after] - tick {
        before
    } else {
        after
    }
}

/// Snap catalog chapters onto the container's samples
///
/// # Arguments
/// * `info` - Catalog chapters; nested chapters are flattened
/// * `container` - Decrypted container whose sample table is the ground truth
/// * `trim` - Drop audio before the first chapter and after the last one
///
/// # Returns
/// Chapters covering `kept` without gaps, in catalog order. Chapters that
/// start past the end of the audio, or collapse onto the previous chapter's
/// start, are dropped and noted.
///
/// # Errors
/// - `Format` - the container has no usable timescale
pub fn align_chapters(info: &ChapterInfo, container: &Container, trim: bool) -> Result<ChapterAlignment> {
    let timescale = container.media_timescale()?;
    let starts = container.sample_start_ticks();
    let sample_count = starts.len() - 1;
    let total_ticks = starts[sample_count];
    let mut notes = Vec::new();

    let actual_ms = ticks_to(total_ticks, timescale, 1000);
    if info.runtime_length_ms > 0 && info.runtime_length_ms.abs_diff(actual_ms) > DRIFT_WARN_MS {
        let note = format!(
            "Declared runtime {} ms differs from audio length {} ms",
            info.runtime_length_ms, actual_ms
        );
        debug!("{}", note);
        notes.push(note);
    }

    let flat = info.flatten();
    let mut boundaries: Vec<(usize, &Chapter)> = Vec::with_capacity(flat.len());
    for chapter in &flat {
        let index = nearest_boundary(&starts, ms_to_ticks(chapter.start_offset_ms, timescale));
        if index >= sample_count {
            let note = format!(
                "Chapter '{}' starts at {} ms, beyond the end of the audio",
                chapter.title, chapter.start_offset_ms
            );
            warn!("{}", note);
            notes.push(note);
            continue;
        }
        if let Some(&(previous, _)) = boundaries.last() {
            if index <= previous {
                let note = format!(
                    "Chapter '{}' collapses onto the previous chapter and was merged",
                    chapter.title
                );
                warn!("{}", note);
                notes.push(note);
                continue;
            }
        }
        boundaries.push((index, chapter));
    }

    if boundaries.is_empty() {
        return Ok(ChapterAlignment {
            chapters: Vec::new(),
            kept: 0..sample_count,
            timescale,
            notes,
        });
    }

    let (kept_start, kept_end) = if trim {
        let (last_index, last) = boundaries[boundaries.len() - 1];
        let end = nearest_boundary(&starts, ms_to_ticks(last.end_offset_ms(), timescale))
            .max(last_index + 1);
        (boundaries[0].0, end)
    } else {
        boundaries[0].0 = 0;
        (0, sample_count)
    };

    let base = starts[kept_start];
    let chapters = boundaries
        .iter()
        .enumerate()
        .map(|(i, &(start, chapter))| {
            let end = boundaries.get(i + 1).map(|&(next, _)| next).unwrap_or(kept_end);
            AlignedChapter {
                title: chapter.title.clone(),
                samples: start..end,
                start_ticks: starts[start] - base,
                end_ticks: starts[end] - base,
            }
        })
        .collect();

    Ok(ChapterAlignment {
        chapters,
        kept: kept_start..kept_end,
        timescale,
        notes,
    })
}
