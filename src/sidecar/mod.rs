//! Sidecar files written beside the audio
//!
//! Cue sheets are built from the final chapter list. Clip and bookmark
//! records are fetched through a caller-supplied [`RecordsSource`]. Failures
//! in either never fail the download; the pipeline reports them as
//! [`SidecarWarning`](crate::error::SidecarWarning)s.

pub mod cue;
pub mod records;

pub use cue::{extract_cue_sheet, format_cue_time};
pub use records::{
    records_path, save_clips_and_bookmarks, AudibleRecord, RecordKind, RecordsFormat,
    RecordsSource,
};
