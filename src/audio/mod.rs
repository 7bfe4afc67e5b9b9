//! Container handling for decrypted audio
//!
//! This module parses and rewrites M4B containers, aligns chapters, applies
//! post-processing, splits books into parts, and re-encodes when the output
//! format or sample layout requires it.

pub mod boxes;
pub mod chapters;
pub mod container;
pub mod encoder;
pub mod metadata;
pub mod postprocess;
pub mod split;

// Re-export commonly used types
pub use chapters::{align_chapters, Chapter, ChapterAlignment, ChapterInfo};
pub use container::{ChapterMark, Container, SourceFormat};
pub use encoder::{
    AudioEncoder, ChannelMode, EncoderConfig, EncoderSettings, FfmpegEncoder, OutputFormat,
    QualityPreset,
};
pub use postprocess::{PostProcessor, ProcessedAudio};
pub use split::{split, AudioPart, PartNaming, SplitOutput};
