//! Cue sheet generation
//!
//! ```text
//! FILE "Dune.m4b" MP4
//!   TRACK 01 AUDIO
//!     TITLE "Opening Credits"
//!     INDEX 01 00:00:00
//!   TRACK 02 AUDIO
//!     TITLE "Book One"
//!     INDEX 01 00:15:00
//! ```

use crate::audio::chapters::ChapterInfo;
use crate::audio::encoder::OutputFormat;
use std::fmt::Write;

/// Cue sheet frames per second
pub const CUE_FRAMES_PER_SECOND: u64 = 75;

/// Format a millisecond offset as `MM:SS:FF`
///
/// Minutes are not wrapped into hours, so a ten hour book reaches `600:00:00`.
pub fn format_cue_time(offset_ms: u64) -> String {
    let total_seconds = offset_ms / 1000;
    let frames = (offset_ms % 1000) * CUE_FRAMES_PER_SECOND / 1000;
    format!(
        "{:02}:{:02}:{:02}",
        total_seconds / 60,
        total_seconds % 60,
        frames
    )
}

/// Build the cue sheet text for one audio file
///
/// # Arguments
/// * `file_name` - Audio file name as it appears beside the cue sheet
/// * `format` - Selects the `FILE` type
/// * `chapters` - One track per leaf chapter, in order
pub fn extract_cue_sheet(file_name: &str, format: OutputFormat, chapters: &ChapterInfo) -> String {
    let mut cue = String::new();
    // Writing to a String cannot fail
    let _ = writeln!(
        cue,
        "FILE \"{}\" {}",
        quote(file_name),
        format.cue_file_type()
    );

    for (i, chapter) in chapters.flatten().iter().enumerate() {
        let _ = writeln!(cue, "  TRACK {:02} AUDIO", i + 1);
        let _ = writeln!(cue, "    TITLE \"{}\"", quote(&chapter.title));
        let _ = writeln!(cue, "    INDEX 01 {}", format_cue_time(chapter.start_offset_ms));
    }

    cue
}

fn quote(text: &str) -> String {
    text.replace('"', "'")
}
