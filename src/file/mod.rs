//! File management and naming
//!
//! This module handles work directories, committing finished files, and
//! naming for sanitized and multi-part output.

pub mod manager;
pub mod naming;

// Re-export commonly used types
pub use manager::{FileManager, WorkDir};
pub use naming::{
    multipart_file_name, multipart_title_name, MultipartFileProperties, ReplacementCharacters,
};
