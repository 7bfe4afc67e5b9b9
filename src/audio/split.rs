//! Multi-part splitting
//!
//! One part per aligned chapter, each a lossless slice of the processed
//! container with its own title, track number and single chapter mark.

use super::chapters::ChapterAlignment;
use super::container::{ChapterMark, Container};
use super::metadata::keys;
use crate::error::{Result, SidecarKind, SidecarWarning};
use crate::file::naming::{
    multipart_file_name, multipart_title_name, MultipartFileProperties, ReplacementCharacters,
};
use std::collections::HashSet;
use tracing::{debug, warn};

/// Naming inputs shared by every part of a book
#[derive(Debug, Clone)]
pub struct PartNaming<'a> {
    pub book_title: &'a str,
    pub replacement: ReplacementCharacters,
    /// Extension without the dot
    pub extension: &'a str,
}

#[derive(Debug, Clone)]
pub struct AudioPart {
    /// 1-based
    pub index: usize,
    /// File name including extension
    pub file_name: String,
    pub title: String,
    /// Sample offsets still refer to the decrypted file
    pub container: Container,
}

#[derive(Debug, Clone, Default)]
pub struct SplitOutput {
    /// In chapter order
    pub parts: Vec<AudioPart>,
    pub warnings: Vec<SidecarWarning>,
}

/// Split `container` at the aligned chapter boundaries
///
/// With no chapters the whole book becomes a single part. Part names are
/// unique within the book even on case-insensitive file systems; a clash is
/// resolved with a numeric suffix and reported as a warning.
///
/// # Errors
/// - `InvalidInput` - a chapter's sample range lies outside the container
pub fn split(
    container: &Container,
    alignment: &ChapterAlignment,
    naming: &PartNaming<'_>,
) -> Result<SplitOutput> {
    let sample_count = container.track.samples.len();
    let sections: Vec<(String, std::ops::Range<usize>)> = if alignment.chapters.is_empty() {
        vec![(String::new(), 0..sample_count)]
    } else {
        alignment
            .chapters
            .iter()
            .map(|c| (c.title.clone(), c.samples.clone()))
            .collect()
    };

    let part_count = sections.len();
    let total = u16::try_from(part_count).unwrap_or(u16::MAX);
    let mut output = SplitOutput::default();
    let mut used = HashSet::with_capacity(part_count);

    for (i, (chapter_title, samples)) in sections.into_iter().enumerate() {
        let props = MultipartFileProperties {
            part_index: i + 1,
            part_count,
            chapter_title,
            book_title: naming.book_title.to_string(),
        };

        let stem = multipart_file_name(&props, naming.replacement);
        let mut file_name = format!("{}.{}", stem, naming.extension);
        let mut suffix = 2;
        while !used.insert(file_name.to_lowercase()) {
            let renamed = format!("{} ({}).{}", stem, suffix, naming.extension);
            let message = format!("Part name '{}' already used, writing '{}'", file_name, renamed);
            warn!("{}", message);
            output
                .warnings
                .push(SidecarWarning::new(SidecarKind::PartName, message));
            file_name = renamed;
            suffix += 1;
        }

        let title = multipart_title_name(&props);
        let mut part = container.slice(samples)?;
        part.chapters = vec![ChapterMark {
            start: 0,
            title: title.clone(),
        }];
        part.tags.set_text(keys::TITLE, &title);
        if !naming.book_title.is_empty() {
            part.tags.set_text(keys::ALBUM, naming.book_title);
        }
        part.tags
            .set_track_number(u16::try_from(i + 1).unwrap_or(u16::MAX), total);

        debug!(part = i + 1, file = %file_name, samples = part.track.samples.len(), "Prepared part");
        output.parts.push(AudioPart {
            index: i + 1,
            file_name,
            title,
            container: part,
        });
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::chapters::{align_chapters, Chapter, ChapterInfo};
    use crate::audio::container::{Sample, SampleEntry};

    fn container() -> Container {
        let samples = (0..90)
            .map(|i| Sample {
                offset: i * 10,
                size: 10,
                duration: 1000,
            })
            .collect();
        let mut entry = SampleEntry::aac(2, 44100, 64_000);
        entry.sample_rate = 1000;
        Container::new(entry, samples)
    }

    fn naming() -> PartNaming<'static> {
        PartNaming {
            book_title: "Dune",
            replacement: ReplacementCharacters::Default,
            extension: "m4b",
        }
    }

    #[test]
    fn test_split_three_chapters() {
        let container = container();
        let info = ChapterInfo::new(vec![
            Chapter::new("Opening", 0, 30_000),
            Chapter::new("Middle", 30_000, 30_000),
            Chapter::new("Closing", 60_000, 30_000),
        ]);
        let alignment = align_chapters(&info, &container, false).unwrap();
        let output = split(&container, &alignment, &naming()).unwrap();

        assert!(output.warnings.is_empty());
        let names: Vec<_> = output.parts.iter().map(|p| p.file_name.as_str()).collect();
        assert_eq!(
            names,
            vec!["Dune - 01 - Opening.m4b", "Dune - 02 - Middle.m4b", "Dune - 03 - Closing.m4b"]
        );
        let titles: Vec<_> = output.parts.iter().map(|p| p.title.as_str()).collect();
        assert_eq!(titles, vec!["Opening", "Middle", "Closing"]);

        let second = &output.parts[1].container;
        assert_eq!(second.track.samples.len(), 30);
        assert_eq!(second.track.samples[0].offset, 300);
        assert_eq!(second.tags.text(&keys::TITLE).as_deref(), Some("Middle"));
        assert_eq!(second.chapters.len(), 1);
    }

    #[test]
    fn test_zero_chapters_is_single_part() {
        let container = container();
        let alignment = align_chapters(&ChapterInfo::default(), &container, false).unwrap();
        let output = split(&container, &alignment, &naming()).unwrap();

        assert_eq!(output.parts.len(), 1);
        assert_eq!(output.parts[0].file_name, "Dune - 01.m4b");
        assert_eq!(output.parts[0].title, "Dune - Part 1");
        assert_eq!(output.parts[0].container.track.samples.len(), 90);
    }

    #[test]
    fn test_parts_tile_the_book() {
        let container = container();
        let info = ChapterInfo::new(vec![
            Chapter::new("A", 0, 10_000),
            Chapter::new("B", 10_000, 70_000),
            Chapter::new("C", 80_000, 10_000),
        ]);
        let alignment = align_chapters(&info, &container, false).unwrap();
        let output = split(&container, &alignment, &naming()).unwrap();

        let total: usize = output.parts.iter().map(|p| p.container.track.samples.len()).sum();
        assert_eq!(total, 90);
    }
}
